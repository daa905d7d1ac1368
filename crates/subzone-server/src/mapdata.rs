// mapdata.rs — map store
//
// Level data is loaded once per (path, checksum) identity and shared by
// every arena that resolves to it; the registry's per-entry arena set is
// the reference count. Loading runs on the loader thread so arena creation
// never blocks the main loop; the arena keeps a lifecycle hold until its
// binding lands. Each arena also carries a mutable overlay for temporary
// tiles (bricks and dropped flags) on top of the immutable level.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use subzone_common::crc::Crc32Digest;
use subzone_common::lvl::{LvlData, MAP_TILES, TILE_BRICK, TILE_FLAG};
use subzone_common::lvl::Region;

use crate::arena::{ArenaAction, ArenaHold};
use crate::sv_main::{ServerContext, WorkItem};

pub type MapKey = (PathBuf, u32);

const READ_CHUNK: usize = 0x10000;

/// Default search patterns when the zone config does not set
/// General:LvlSearchPaths. %b is the arena base name, %m the map name.
const DEFAULT_SEARCH_PATHS: &str = "maps/%m, %m, maps/%b.lvl, %b.lvl";

// ============================================================
// Shared registry
// ============================================================

struct MapEntry {
    data: Arc<LvlData>,
    arenas: HashSet<usize>,
}

#[derive(Default)]
pub struct MapRegistry {
    entries: HashMap<MapKey, MapEntry>,
}

impl MapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join an existing entry, adding the arena to its set.
    fn join(&mut self, key: &MapKey, arena_id: usize) -> Option<Arc<LvlData>> {
        self.entries.get_mut(key).map(|entry| {
            entry.arenas.insert(arena_id);
            Arc::clone(&entry.data)
        })
    }

    fn insert(&mut self, key: MapKey, data: Arc<LvlData>, arena_id: usize) {
        let mut arenas = HashSet::new();
        arenas.insert(arena_id);
        self.entries.insert(key, MapEntry { data, arenas });
    }

    /// Drop an arena's reference; the entry dies with its last arena.
    pub fn release(&mut self, key: &MapKey, arena_id: usize) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.arenas.remove(&arena_id);
            if entry.arenas.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================
// Per-arena map data
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileKind {
    Brick,
    Flag,
}

struct OverlayCell {
    tile: u8,
    owner: (u16, TileKind),
}

pub enum MapBinding {
    Unloaded,
    Bound {
        /// None when bound to the emergency map.
        key: Option<MapKey>,
        data: Arc<LvlData>,
    },
}

pub struct MapData {
    pub binding: MapBinding,
    overlay: HashMap<(u16, u16), OverlayCell>,
    spans: HashMap<(u16, TileKind), Vec<(u16, u16)>>,
}

impl MapData {
    pub fn new() -> Self {
        Self {
            binding: MapBinding::Unloaded,
            overlay: HashMap::new(),
            spans: HashMap::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.binding, MapBinding::Bound { .. })
    }

    pub fn lvl(&self) -> Option<&Arc<LvlData>> {
        match &self.binding {
            MapBinding::Bound { data, .. } => Some(data),
            MapBinding::Unloaded => None,
        }
    }

    pub fn bind(&mut self, key: Option<MapKey>, data: Arc<LvlData>) {
        self.binding = MapBinding::Bound { key, data };
    }

    /// Tile at (x, y); with `include_temp` the overlay shadows the level.
    pub fn get_tile(&self, x: u16, y: u16, include_temp: bool) -> u8 {
        if include_temp {
            if let Some(cell) = self.overlay.get(&(x, y)) {
                return cell.tile;
            }
        }
        self.lvl().map(|l| l.get_tile(x, y)).unwrap_or(0)
    }

    /// Stamp a temporary tile line (or point) into the overlay. A brick
    /// supersedes an existing brick, a flag supersedes a brick, and a brick
    /// never overwrites a flag.
    pub fn insert_temp(&mut self, id: u16, kind: TileKind, x1: u16, y1: u16, x2: u16, y2: u16) {
        let tile = match kind {
            TileKind::Brick => TILE_BRICK,
            TileKind::Flag => TILE_FLAG,
        };
        let mut cells = Vec::new();
        for (x, y) in line_coords(x1, y1, x2, y2) {
            if x as usize >= MAP_TILES || y as usize >= MAP_TILES {
                continue;
            }
            if let Some(existing) = self.overlay.get(&(x, y)) {
                if existing.owner.1 == TileKind::Flag && kind == TileKind::Brick {
                    continue;
                }
            }
            self.overlay.insert(
                (x, y),
                OverlayCell {
                    tile,
                    owner: (id, kind),
                },
            );
            cells.push((x, y));
        }
        self.spans.insert((id, kind), cells);
    }

    /// Remove a temporary tile placement. Cells since superseded by
    /// another placement are left to their new owner.
    pub fn remove_temp(&mut self, id: u16, kind: TileKind) {
        if let Some(cells) = self.spans.remove(&(id, kind)) {
            for pos in cells {
                if let Some(cell) = self.overlay.get(&pos) {
                    if cell.owner == (id, kind) {
                        self.overlay.remove(&pos);
                    }
                }
            }
        }
    }

    pub fn checksum(&self, key: u32) -> u32 {
        self.lvl().map(|l| l.map_checksum(key)).unwrap_or(key)
    }

    pub fn regions_at(&self, x: u16, y: u16) -> Vec<&Region> {
        self.lvl()
            .map(|l| l.regions_at(x, y).collect())
            .unwrap_or_default()
    }

    pub fn find_region(&self, name: &str) -> Option<&Region> {
        self.lvl().and_then(|l| l.find_region(name))
    }

    /// Spiral outward looking for an empty tile (overlay included). Starts
    /// one tile right of the origin; direction order is Left, Down, Right,
    /// Up, with the leg growing every second turn. Gives up once a leg
    /// would exceed 35 tiles.
    pub fn try_find_empty_tile_near(&self, x: u16, y: u16) -> Option<(u16, u16)> {
        const DIRS: [(i32, i32); 4] = [(-1, 0), (0, 1), (1, 0), (0, -1)];
        let mut cx = x as i32 + 1;
        let mut cy = y as i32;
        let mut leg = 1i32;
        let mut turns = 0u32;
        loop {
            for (dx, dy) in DIRS {
                for _ in 0..leg {
                    if (0..MAP_TILES as i32).contains(&cx)
                        && (0..MAP_TILES as i32).contains(&cy)
                        && self.get_tile(cx as u16, cy as u16, true) == 0
                    {
                        return Some((cx as u16, cy as u16));
                    }
                    cx += dx;
                    cy += dy;
                }
                turns += 1;
                if turns % 2 == 0 {
                    leg += 1;
                }
                if leg > 35 {
                    return None;
                }
            }
        }
    }
}

impl Default for MapData {
    fn default() -> Self {
        Self::new()
    }
}

fn line_coords(x1: u16, y1: u16, x2: u16, y2: u16) -> Vec<(u16, u16)> {
    let mut out = Vec::new();
    if x1 == x2 {
        let (lo, hi) = (y1.min(y2), y1.max(y2));
        for y in lo..=hi {
            out.push((x1, y));
        }
    } else if y1 == y2 {
        let (lo, hi) = (x1.min(x2), x1.max(x2));
        for x in lo..=hi {
            out.push((x, y1));
        }
    } else {
        // not a line; treat as the two endpoints
        out.push((x1, y1));
        out.push((x2, y2));
    }
    out
}

// ============================================================
// Async loading
// ============================================================

pub struct LoadRequest {
    pub arena_id: usize,
    pub base_name: String,
    pub map_name: Option<String>,
    pub search_paths: String,
    pub data_dir: PathBuf,
    pub hold: ArenaHold,
}

pub struct MapStore {
    pub registry: Arc<Mutex<MapRegistry>>,
    pub emergency: Arc<LvlData>,
    loader_tx: Sender<LoadRequest>,
}

impl MapStore {
    /// Create the store and spawn its loader thread. Completed loads come
    /// back through the main work queue.
    pub fn new(work_tx: Sender<WorkItem>) -> Self {
        let registry = Arc::new(Mutex::new(MapRegistry::new()));
        let emergency = Arc::new(LvlData::emergency());
        let (loader_tx, loader_rx) = crossbeam_channel::unbounded();
        {
            let registry = Arc::clone(&registry);
            let emergency = Arc::clone(&emergency);
            thread::Builder::new()
                .name("map-loader".to_string())
                .spawn(move || run_loader(loader_rx, registry, emergency, work_tx))
                .expect("spawn map loader");
        }
        Self {
            registry,
            emergency,
            loader_tx,
        }
    }

    pub fn request_load(&self, req: LoadRequest) {
        // a dead loader drops the request, and with it the arena hold
        let _ = self.loader_tx.send(req);
    }
}

fn run_loader(
    rx: Receiver<LoadRequest>,
    registry: Arc<Mutex<MapRegistry>>,
    emergency: Arc<LvlData>,
    work_tx: Sender<WorkItem>,
) {
    while let Ok(req) = rx.recv() {
        let arena_id = req.arena_id;
        let hold = req.hold;
        let (data, key) = load_for_arena(&registry, &emergency, &req.data_dir, arena_id,
            &req.search_paths, &req.base_name, req.map_name.as_deref());

        let registry_for_undo = Arc::clone(&registry);
        let done: WorkItem = Box::new(move |ctx: &mut ServerContext| {
            match ctx.arenas.get_mut(arena_id) {
                Some(arena) => arena.map.bind(key, data),
                None => {
                    // arena died while we were loading; give back our ref
                    if let Some(key) = key {
                        registry_for_undo.lock().release(&key, arena_id);
                    }
                }
            }
            drop(hold);
        });
        if work_tx.send(done).is_err() {
            return;
        }
    }
}

/// Resolve, read, and parse a level for an arena, falling back to the
/// emergency map on any failure.
pub fn load_for_arena(
    registry: &Mutex<MapRegistry>,
    emergency: &Arc<LvlData>,
    data_dir: &Path,
    arena_id: usize,
    search_paths: &str,
    base_name: &str,
    map_name: Option<&str>,
) -> (Arc<LvlData>, Option<MapKey>) {
    let Some(path) = resolve_lvl_path(data_dir, search_paths, base_name, map_name) else {
        tracing::warn!(base = %base_name, "no level file found, using emergency map");
        return (Arc::clone(emergency), None);
    };
    match load_level(registry, arena_id, &path) {
        Ok((data, key)) => (data, Some(key)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "level load failed, using emergency map");
            (Arc::clone(emergency), None)
        }
    }
}

/// Search the configured patterns for an existing level file.
pub fn resolve_lvl_path(
    data_dir: &Path,
    search_paths: &str,
    base_name: &str,
    map_name: Option<&str>,
) -> Option<PathBuf> {
    for pattern in search_paths.split([',', ';']) {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }
        if pattern.contains("%m") && map_name.is_none() {
            continue;
        }
        let mut candidate = pattern.replace("%b", base_name);
        if let Some(m) = map_name {
            candidate = candidate.replace("%m", m);
        }
        let full = data_dir.join(candidate);
        if full.is_file() {
            return Some(full);
        }
    }
    None
}

fn load_level(
    registry: &Mutex<MapRegistry>,
    arena_id: usize,
    path: &Path,
) -> Result<(Arc<LvlData>, MapKey), String> {
    // stream the file through the CRC while pulling it into memory
    let mut file = File::open(path).map_err(|e| e.to_string())?;
    let mut digest = Crc32Digest::new();
    let mut bytes = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut chunk).map_err(|e| e.to_string())?;
        if n == 0 {
            break;
        }
        digest.update(&chunk[..n]);
        bytes.extend_from_slice(&chunk[..n]);
    }
    let checksum = digest.finalize();
    let key: MapKey = (path.to_path_buf(), checksum);

    if let Some(data) = registry.lock().join(&key, arena_id) {
        return Ok((data, key));
    }

    // parse outside the lock; re-check in case another load won the race
    let parsed = Arc::new(
        LvlData::parse(path.to_path_buf(), checksum, &bytes).map_err(|e| e.to_string())?,
    );
    let mut reg = registry.lock();
    if let Some(data) = reg.join(&key, arena_id) {
        return Ok((data, key));
    }
    reg.insert(key.clone(), Arc::clone(&parsed), arena_id);
    Ok((parsed, key))
}

// ============================================================
// Flag overlay
// ============================================================

/// Stamp a dropped flag into the arena overlay. Flag modules call this
/// when a carried flag hits the ground; the tile shadows bricks but a
/// later brick never shadows it.
pub fn drop_flag(ctx: &mut ServerContext, arena_id: usize, flag_id: u16, x: u16, y: u16) {
    if let Some(arena) = ctx.arenas.get_mut(arena_id) {
        arena.map.insert_temp(flag_id, TileKind::Flag, x, y, x, y);
    }
}

/// Remove a dropped flag from the overlay (picked up or neutralized).
pub fn clear_flag(ctx: &mut ServerContext, arena_id: usize, flag_id: u16) {
    if let Some(arena) = ctx.arenas.get_mut(arena_id) {
        arena.map.remove_temp(flag_id, TileKind::Flag);
    }
}

// ============================================================
// Level file lists
// ============================================================

/// Files named by General:LevelFiles / LevelFiles1..15, split on commas,
/// colons, and spaces. A '+' prefix marks an optional LVZ download.
pub fn level_file_list(cfg: &subzone_common::conf::ConfDocument) -> Vec<(String, bool)> {
    let mut out = Vec::new();
    let mut collect = |value: Option<&str>| {
        let Some(value) = value else {
            return;
        };
        for name in value.split([',', ':', ' ']) {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            match name.strip_prefix('+') {
                Some(rest) => out.push((rest.to_string(), true)),
                None => out.push((name.to_string(), false)),
            }
        }
    };
    collect(cfg.get_str("General", "LevelFiles"));
    for n in 1..=15 {
        collect(cfg.get_str("General", &format!("LevelFiles{}", n)));
    }
    out
}

// ============================================================
// Lifecycle listener
// ============================================================

pub fn on_arena_action(ctx: &mut ServerContext, id: usize, action: ArenaAction) {
    match action {
        ArenaAction::PreCreate => {
            let Some(arena) = ctx.arenas.get(id) else {
                return;
            };
            let req = LoadRequest {
                arena_id: id,
                base_name: arena.base_name.clone(),
                map_name: arena
                    .cfg
                    .get_str("General", "Map")
                    .map(str::to_string),
                search_paths: ctx
                    .global_cfg
                    .get_str("General", "LvlSearchPaths")
                    .unwrap_or(DEFAULT_SEARCH_PATHS)
                    .to_string(),
                data_dir: ctx.data_dir.clone(),
                hold: arena.add_hold(),
            };
            ctx.maps.request_load(req);
        }
        ArenaAction::Destroy => {
            let Some(arena) = ctx.arenas.get(id) else {
                return;
            };
            if let MapBinding::Bound { key: Some(key), .. } = &arena.map.binding {
                ctx.maps.registry.lock().release(&key.clone(), id);
            }
        }
        ArenaAction::Create | ArenaAction::ConfChanged => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subzone_common::lvl::TILE_SAFE;

    fn bound_map(tiles: &[(u16, u16, u8)]) -> MapData {
        let mut bytes = Vec::new();
        for &(x, y, t) in tiles {
            let v = (x as u32) | (y as u32) << 12 | (t as u32) << 24;
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let lvl = LvlData::parse(PathBuf::from("test.lvl"), 1, &bytes).unwrap();
        let mut map = MapData::new();
        map.bind(None, Arc::new(lvl));
        map
    }

    #[test]
    fn test_overlay_shadowing() {
        let mut map = bound_map(&[(10, 10, TILE_SAFE)]);
        map.insert_temp(1, TileKind::Brick, 5, 5, 9, 5);
        assert_eq!(map.get_tile(5, 5, true), TILE_BRICK);
        assert_eq!(map.get_tile(5, 5, false), 0);
        assert_eq!(map.get_tile(10, 10, true), TILE_SAFE);
        map.remove_temp(1, TileKind::Brick);
        assert_eq!(map.get_tile(5, 5, true), 0);
    }

    #[test]
    fn test_brick_supersedes_brick_flag_wins() {
        let mut map = bound_map(&[]);
        map.insert_temp(1, TileKind::Brick, 5, 5, 7, 5);
        map.insert_temp(2, TileKind::Brick, 7, 5, 9, 5);
        // cell (7,5) now belongs to brick 2; removing brick 1 leaves it
        map.remove_temp(1, TileKind::Brick);
        assert_eq!(map.get_tile(7, 5, true), TILE_BRICK);
        assert_eq!(map.get_tile(5, 5, true), 0);

        map.insert_temp(3, TileKind::Flag, 8, 5, 8, 5);
        assert_eq!(map.get_tile(8, 5, true), TILE_FLAG);
        // a later brick does not take the flag's cell
        map.insert_temp(4, TileKind::Brick, 8, 5, 8, 5);
        assert_eq!(map.get_tile(8, 5, true), TILE_FLAG);
        map.remove_temp(3, TileKind::Flag);
        assert_eq!(map.get_tile(8, 5, true), 0);
    }

    #[test]
    fn test_spiral_returns_start_when_empty() {
        let map = bound_map(&[]);
        assert_eq!(map.try_find_empty_tile_near(100, 100), Some((101, 100)));
    }

    #[test]
    fn test_spiral_steps_around_blockage() {
        let mut map = bound_map(&[(101, 100, 7)]);
        // start tile blocked, first step moves Left onto the origin
        assert_eq!(map.try_find_empty_tile_near(100, 100), Some((100, 100)));
        map.insert_temp(1, TileKind::Brick, 100, 100, 100, 100);
        // origin blocked too; next visit is one tile down
        assert_eq!(map.try_find_empty_tile_near(100, 100), Some((100, 101)));
    }

    #[test]
    fn test_spiral_gives_up_in_solid_field() {
        // wall off a square wider than the 35-tile spiral limit
        let mut map = bound_map(&[]);
        for (id, y) in (60..141u16).enumerate() {
            map.insert_temp(id as u16, TileKind::Brick, 60, y, 140, y);
        }
        assert_eq!(map.try_find_empty_tile_near(100, 100), None);
    }

    #[test]
    fn test_registry_sharing_and_release() {
        let dir = std::env::temp_dir().join(format!("subzone-maps-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("shared.lvl");
        let v: u32 = 3 | 4 << 12 | 9 << 24;
        std::fs::write(&path, v.to_le_bytes()).unwrap();

        let registry = Mutex::new(MapRegistry::new());
        let (a, key_a) = load_level(&registry, 1, &path).unwrap();
        let (b, key_b) = load_level(&registry, 2, &path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(key_a, key_b);
        assert_eq!(registry.lock().entry_count(), 1);

        registry.lock().release(&key_a, 1);
        assert_eq!(registry.lock().entry_count(), 1);
        assert_eq!(b.get_tile(3, 4), 9);
        registry.lock().release(&key_b, 2);
        assert_eq!(registry.lock().entry_count(), 0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_level_file_list_optional_markers() {
        let cfg = subzone_common::conf::ConfDocument::parse(
            "[General]\nLevelFiles = base.lvz, +extra.lvz\nLevelFiles1 = sounds.lvz\n",
        );
        assert_eq!(
            level_file_list(&cfg),
            vec![
                ("base.lvz".to_string(), false),
                ("extra.lvz".to_string(), true),
                ("sounds.lvz".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_flag_overlay_ops() {
        let mut ctx = crate::sv_main::test_context();
        let id = crate::arena::find_or_create_arena(&mut ctx, "duel");
        ctx.arenas.get_mut(id).unwrap().map = bound_map(&[]);
        drop_flag(&mut ctx, id, 3, 40, 41);
        assert_eq!(
            ctx.arenas.get(id).unwrap().map.get_tile(40, 41, true),
            TILE_FLAG
        );
        clear_flag(&mut ctx, id, 3);
        assert_eq!(ctx.arenas.get(id).unwrap().map.get_tile(40, 41, true), 0);
    }

    #[test]
    fn test_resolve_path_substitution() {
        let dir = std::env::temp_dir().join(format!("subzone-paths-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("maps")).unwrap();
        let target = dir.join("maps/duel.lvl");
        std::fs::write(&target, b"").unwrap();

        let found = resolve_lvl_path(&dir, DEFAULT_SEARCH_PATHS, "duel", Some("duel.lvl"));
        assert_eq!(found, Some(target.clone()));
        // %m patterns are skipped without a map name; %b.lvl still hits
        let found = resolve_lvl_path(&dir, DEFAULT_SEARCH_PATHS, "duel", None);
        assert_eq!(found, Some(target));
        let found = resolve_lvl_path(&dir, DEFAULT_SEARCH_PATHS, "other", None);
        assert_eq!(found, None);

        std::fs::remove_file(dir.join("maps/duel.lvl")).ok();
    }
}
