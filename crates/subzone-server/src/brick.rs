// brick.rs — team walls
//
// Bricks are time-limited wall segments dropped by players or synthesized
// by server modules. Each arena keeps a FIFO queue capped at 256 active
// bricks; a batch that would blow the cap is refused whole so clients and
// server never disagree about which bricks exist. Start ticks are strictly
// monotonic per arena even when the clock stalls.

use std::collections::VecDeque;

use subzone_common::conf::ConfDocument;
use subzone_common::sizebuf::SizeBuf;
use subzone_common::tick::Tick;
use thiserror::Error;

use crate::arena::ArenaAction;
use crate::mapdata::{MapData, TileKind};
use crate::net::{MAX_PACKET, RELIABLE_HEADER};
use crate::server::{PlayerPosition, PlayerState, ShipType, MAX_BRICKS, S2C_BRICK};
use crate::sv_main::ServerContext;

/// Bytes of one brick on the wire: four i16 coordinates, freq, brick id,
/// and the u32 start tick.
const BRICK_WIRE_LEN: usize = 16;

/// Bricks per S2C packet: type byte plus whole entries under the packet
/// and reliable-header budget.
const BRICKS_PER_PACKET: usize = (MAX_PACKET - RELIABLE_HEADER - 1) / BRICK_WIRE_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrickMode {
    Vie,
    Ahead,
    Lateral,
    Cage,
}

impl BrickMode {
    pub fn from_conf(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("vie") => BrickMode::Vie,
            Some("ahead") => BrickMode::Ahead,
            Some("cage") => BrickMode::Cage,
            _ => BrickMode::Lateral,
        }
    }
}

#[derive(Debug, Error)]
pub enum BrickError {
    #[error("brick mode {0:?} is not implemented")]
    NotImplemented(BrickMode),
}

#[derive(Debug, Clone, Copy)]
pub struct BrickData {
    pub x1: u16,
    pub y1: u16,
    pub x2: u16,
    pub y2: u16,
    pub freq: u16,
    pub brick_id: u16,
    pub start_tick: Tick,
}

#[derive(Debug, Clone, Copy)]
pub struct BrickConfig {
    pub span: u16,
    pub ttl_ticks: u32,
    pub mode: BrickMode,
    pub count_as_walls: bool,
    pub wall_resend: u8,
}

impl Default for BrickConfig {
    fn default() -> Self {
        Self {
            span: 10,
            ttl_ticks: 6000,
            mode: BrickMode::Lateral,
            count_as_walls: true,
            wall_resend: 0,
        }
    }
}

impl BrickConfig {
    pub fn from_conf(cfg: &ConfDocument) -> Self {
        let d = Self::default();
        Self {
            span: cfg.get_int("Brick", "BrickSpan", d.span as i32).clamp(1, 1024) as u16,
            ttl_ticks: cfg.get_int("Brick", "BrickTime", d.ttl_ticks as i32).max(1) as u32,
            mode: BrickMode::from_conf(cfg.get_str("Brick", "BrickMode")),
            count_as_walls: cfg.get_bool("Brick", "CountBricksAsWalls", d.count_as_walls),
            wall_resend: cfg.get_int("Routing", "WallResendCount", d.wall_resend as i32).clamp(0, 3)
                as u8,
        }
    }
}

pub struct BrickState {
    pub cfg: BrickConfig,
    queue: VecDeque<BrickData>,
    next_id: u16,
    last_start: Option<Tick>,
}

impl BrickState {
    pub fn new() -> Self {
        Self {
            cfg: BrickConfig::default(),
            queue: VecDeque::new(),
            next_id: 0,
            last_start: None,
        }
    }

    pub fn active_count(&self) -> usize {
        self.queue.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BrickData> {
        self.queue.iter()
    }
}

impl Default for BrickState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn on_arena_action(ctx: &mut ServerContext, id: usize, action: ArenaAction) {
    if action == ArenaAction::PreCreate || action == ArenaAction::ConfChanged {
        if let Some(arena) = ctx.arenas.get_mut(id) {
            let cfg = std::sync::Arc::clone(&arena.cfg);
            arena.bricks.cfg = BrickConfig::from_conf(&cfg);
        }
    }
}

// ============================================================
// Placement
// ============================================================

/// Pick the brick axis from the player's 40-unit heading and extend from
/// the requested tile one cell per side, alternating sides, until the span
/// is filled or both sides hit something.
pub fn lateral_line(
    map: &MapData,
    pos: PlayerPosition,
    span: u16,
    x: u16,
    y: u16,
) -> Option<(u16, u16, u16, u16)> {
    if map.get_tile(x, y, true) != 0 {
        return None;
    }

    let rot = pos.rotation % 40;
    let horizontal = match rot {
        5 | 25 => !pos.last_rotation_cw,
        15 | 35 => pos.last_rotation_cw,
        r if r < 5 || r > 35 => true,
        r if r > 15 && r < 25 => true,
        _ => false,
    };

    let center = if horizontal { x } else { y };
    let probe = |c: u16| -> u8 {
        if horizontal {
            map.get_tile(c, y, true)
        } else {
            map.get_tile(x, c, true)
        }
    };

    let mut lo = center;
    let mut hi = center;
    let mut len: u16 = 1;
    let mut lo_open = true;
    let mut hi_open = true;
    while len < span && (lo_open || hi_open) {
        if hi_open {
            if hi < 1023 && probe(hi + 1) == 0 {
                hi += 1;
                len += 1;
            } else {
                hi_open = false;
            }
        }
        if len < span && lo_open {
            if lo > 0 && probe(lo - 1) == 0 {
                lo -= 1;
                len += 1;
            } else {
                lo_open = false;
            }
        }
    }

    Some(if horizontal {
        (lo, y, hi, y)
    } else {
        (x, lo, x, hi)
    })
}

/// Place a batch of bricks in an arena (server synthesis entry point; the
/// client handler funnels in here too). Refuses the whole batch when it
/// would exceed the active cap.
pub fn drop_bricks(ctx: &mut ServerContext, arena_id: usize, batch: &[(u16, u16, u16, u16, u16)]) {
    if batch.is_empty() {
        return;
    }
    let now = ctx.now;
    expire_arena_bricks(ctx, arena_id);

    let new_bricks = {
        let Some(arena) = ctx.arenas.get_mut(arena_id) else {
            return;
        };
        if arena.bricks.active_count() + batch.len() > MAX_BRICKS {
            tracing::warn!(
                arena = %arena.name,
                active = arena.bricks.active_count(),
                batch = batch.len(),
                "brick batch refused, cap exceeded"
            );
            return;
        }

        let mut out = Vec::with_capacity(batch.len());
        for &(freq, x1, y1, x2, y2) in batch {
            let start_tick = match arena.bricks.last_start {
                Some(last) if !now.is_at_or_after(last.wrapping_add(1)) => last.wrapping_add(1),
                _ => now,
            };
            arena.bricks.last_start = Some(start_tick);
            let brick_id = arena.bricks.next_id;
            arena.bricks.next_id = arena.bricks.next_id.wrapping_add(1);

            let brick = BrickData {
                x1,
                y1,
                x2,
                y2,
                freq,
                brick_id,
                start_tick,
            };
            arena.bricks.queue.push_back(brick);
            if arena.bricks.cfg.count_as_walls {
                arena.map.insert_temp(brick_id, TileKind::Brick, x1, y1, x2, y2);
            }
            out.push(brick);
        }
        out
    };

    broadcast_bricks(ctx, arena_id, &new_bricks);
}

fn build_brick_packets(bricks: &[BrickData]) -> Vec<Vec<u8>> {
    bricks
        .chunks(BRICKS_PER_PACKET)
        .map(|chunk| {
            let mut sb = SizeBuf::new(1 + chunk.len() * BRICK_WIRE_LEN);
            sb.write_u8(S2C_BRICK);
            for b in chunk {
                sb.write_i16(b.x1 as i16);
                sb.write_i16(b.y1 as i16);
                sb.write_i16(b.x2 as i16);
                sb.write_i16(b.y2 as i16);
                sb.write_i16(b.freq as i16);
                sb.write_i16(b.brick_id as i16);
                sb.write_u32(b.start_tick.0);
            }
            sb.bytes().to_vec()
        })
        .collect()
}

fn broadcast_bricks(ctx: &mut ServerContext, arena_id: usize, bricks: &[BrickData]) {
    if bricks.is_empty() {
        return;
    }
    let resend = ctx
        .arenas
        .get(arena_id)
        .map(|a| a.bricks.cfg.wall_resend)
        .unwrap_or(0);
    let net = ctx.net.clone();
    let packets = build_brick_packets(bricks);
    for player in ctx.players.iter() {
        if player.arena != Some(arena_id) || !player.is_playing() {
            continue;
        }
        for pkt in &packets {
            net.send_reliable(player.pid, pkt);
            for _ in 0..resend {
                net.send_unreliable(player.pid, pkt);
            }
        }
    }
}

/// Push the full brick queue at one player (arena entry).
pub fn send_all_bricks(ctx: &mut ServerContext, pid: usize) {
    let Some(arena_id) = ctx.players.get(pid).and_then(|p| p.arena) else {
        return;
    };
    let bricks: Vec<BrickData> = match ctx.arenas.get(arena_id) {
        Some(arena) => arena.bricks.iter().copied().collect(),
        None => return,
    };
    if bricks.is_empty() {
        return;
    }
    let net = ctx.net.clone();
    for pkt in build_brick_packets(&bricks) {
        net.send_reliable(pid, &pkt);
    }
}

// ============================================================
// Expiry
// ============================================================

pub fn expire_arena_bricks(ctx: &mut ServerContext, arena_id: usize) {
    let now = ctx.now;
    let Some(arena) = ctx.arenas.get_mut(arena_id) else {
        return;
    };
    let ttl = arena.bricks.cfg.ttl_ticks;
    while let Some(head) = arena.bricks.queue.front().copied() {
        if !now.is_at_or_after(head.start_tick.wrapping_add(ttl)) {
            break;
        }
        arena.bricks.queue.pop_front();
        arena.map.remove_temp(head.brick_id, TileKind::Brick);
    }
}

pub fn expire_bricks(ctx: &mut ServerContext) {
    for id in ctx.arenas.live_ids() {
        expire_arena_bricks(ctx, id);
    }
}

// ============================================================
// Client handler
// ============================================================

/// C2S 0x1C: {u8 type, i16 x, i16 y}, exactly 5 bytes.
pub fn handle_brick_request(ctx: &mut ServerContext, pid: usize, buf: &mut SizeBuf) {
    if buf.cursize != 5 {
        tracing::warn!(pid, len = buf.cursize, malicious = true, "bad brick request length");
        return;
    }
    let x = buf.read_i16().unwrap_or(-1);
    let y = buf.read_i16().unwrap_or(-1);
    if !(0..1024).contains(&x) || !(0..1024).contains(&y) {
        tracing::warn!(pid, x, y, malicious = true, "brick request off the map");
        return;
    }

    let (arena_id, freq, pos) = {
        let Some(player) = ctx.players.get(pid) else {
            return;
        };
        if player.state != PlayerState::Playing || player.ship == ShipType::Spec {
            tracing::warn!(pid, state = ?player.state, "brick request outside play");
            return;
        }
        let Some(arena_id) = player.arena else {
            return;
        };
        (arena_id, player.freq, player.pos)
    };

    let line = {
        let Some(arena) = ctx.arenas.get(arena_id) else {
            return;
        };
        if !arena.map.is_ready() {
            return;
        }
        let cfg = arena.bricks.cfg;
        match cfg.mode {
            BrickMode::Lateral => lateral_line(&arena.map, pos, cfg.span, x as u16, y as u16),
            mode => {
                tracing::warn!(pid, ?mode, "{}", BrickError::NotImplemented(mode));
                return;
            }
        }
    };

    if let Some((x1, y1, x2, y2)) = line {
        drop_bricks(ctx, arena_id, &[(freq, x1, y1, x2, y2)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sv_main::test_context;
    use std::path::PathBuf;
    use std::sync::Arc;
    use subzone_common::lvl::LvlData;

    fn empty_map() -> MapData {
        let lvl = LvlData::parse(PathBuf::from("t.lvl"), 0, &[]).unwrap();
        let mut map = MapData::new();
        map.bind(None, Arc::new(lvl));
        map
    }

    fn pos(rotation: u8, cw: bool) -> PlayerPosition {
        PlayerPosition {
            x: 0,
            y: 0,
            rotation,
            last_rotation_cw: cw,
        }
    }

    #[test]
    fn test_lateral_vertical_centered() {
        let map = empty_map();
        let line = lateral_line(&map, pos(10, false), 10, 512, 512);
        assert_eq!(line, Some((512, 508, 512, 517)));
    }

    #[test]
    fn test_lateral_blocked_side_extends_other() {
        let mut map = empty_map();
        map.insert_temp(99, TileKind::Brick, 512, 509, 512, 509);
        let line = lateral_line(&map, pos(10, false), 10, 512, 512);
        assert_eq!(line, Some((512, 510, 512, 519)));
    }

    #[test]
    fn test_lateral_occupied_target_drops() {
        let mut map = empty_map();
        map.insert_temp(99, TileKind::Brick, 512, 512, 512, 512);
        assert_eq!(lateral_line(&map, pos(10, false), 10, 512, 512), None);
    }

    #[test]
    fn test_axis_selection() {
        let map = empty_map();
        // rotation 0 faces up: horizontal wall
        let line = lateral_line(&map, pos(0, false), 4, 100, 100).unwrap();
        assert_eq!(line.1, line.3);
        // rotation 20 faces down: horizontal
        let line = lateral_line(&map, pos(20, false), 4, 100, 100).unwrap();
        assert_eq!(line.1, line.3);
        // rotation 30: vertical
        let line = lateral_line(&map, pos(30, false), 4, 100, 100).unwrap();
        assert_eq!(line.0, line.2);
        // rotation 38: horizontal
        let line = lateral_line(&map, pos(38, false), 4, 100, 100).unwrap();
        assert_eq!(line.1, line.3);
    }

    #[test]
    fn test_axis_tie_breaks() {
        let map = empty_map();
        // exact 5: clockwise means vertical
        let line = lateral_line(&map, pos(5, true), 4, 100, 100).unwrap();
        assert_eq!(line.0, line.2);
        let line = lateral_line(&map, pos(5, false), 4, 100, 100).unwrap();
        assert_eq!(line.1, line.3);
        // exact 15: clockwise means horizontal
        let line = lateral_line(&map, pos(15, true), 4, 100, 100).unwrap();
        assert_eq!(line.1, line.3);
        let line = lateral_line(&map, pos(35, false), 4, 100, 100).unwrap();
        assert_eq!(line.0, line.2);
    }

    #[test]
    fn test_edge_clamps_extension() {
        let map = empty_map();
        // against the left edge, the whole span goes right
        let line = lateral_line(&map, pos(0, false), 5, 0, 200).unwrap();
        assert_eq!(line, (0, 200, 4, 200));
    }

    fn ctx_with_arena() -> (crate::sv_main::ServerContext, usize) {
        let mut ctx = test_context();
        let id = crate::arena::find_or_create_arena(&mut ctx, "duel");
        let arena = ctx.arenas.get_mut(id).unwrap();
        arena.map = empty_map();
        (ctx, id)
    }

    #[test]
    fn test_drop_assigns_monotonic_ids_and_ticks() {
        let (mut ctx, id) = ctx_with_arena();
        ctx.now = Tick(1000);
        drop_bricks(&mut ctx, id, &[(1, 10, 10, 14, 10), (1, 20, 10, 24, 10)]);
        drop_bricks(&mut ctx, id, &[(1, 30, 10, 34, 10)]);
        let arena = ctx.arenas.get(id).unwrap();
        let bricks: Vec<_> = arena.bricks.iter().copied().collect();
        assert_eq!(bricks.len(), 3);
        assert_eq!(bricks[0].brick_id, 0);
        assert_eq!(bricks[1].brick_id, 1);
        assert_eq!(bricks[2].brick_id, 2);
        // same wall-clock tick still yields strictly increasing start ticks
        assert_eq!(bricks[0].start_tick, Tick(1000));
        assert_eq!(bricks[1].start_tick, Tick(1001));
        assert_eq!(bricks[2].start_tick, Tick(1002));
        // walls stamped into the overlay
        assert_eq!(arena.map.get_tile(12, 10, true), subzone_common::lvl::TILE_BRICK);
    }

    #[test]
    fn test_cap_refuses_whole_batch() {
        let (mut ctx, id) = ctx_with_arena();
        ctx.now = Tick(1);
        let mut big: Vec<(u16, u16, u16, u16, u16)> = Vec::new();
        for i in 0..254u16 {
            big.push((0, i, 1, i, 1));
        }
        drop_bricks(&mut ctx, id, &big);
        assert_eq!(ctx.arenas.get(id).unwrap().bricks.active_count(), 254);

        let over: Vec<(u16, u16, u16, u16, u16)> =
            (0..3u16).map(|i| (0, i, 2, i, 2)).collect();
        drop_bricks(&mut ctx, id, &over);
        let arena = ctx.arenas.get(id).unwrap();
        // refused whole: count unchanged, no overlay cells from the batch
        assert_eq!(arena.bricks.active_count(), 254);
        assert_eq!(arena.map.get_tile(0, 2, true), 0);

        let fits: Vec<(u16, u16, u16, u16, u16)> =
            (0..2u16).map(|i| (0, i, 3, i, 3)).collect();
        drop_bricks(&mut ctx, id, &fits);
        assert_eq!(ctx.arenas.get(id).unwrap().bricks.active_count(), 256);
    }

    #[test]
    fn test_expiry_pops_head_and_overlay() {
        let (mut ctx, id) = ctx_with_arena();
        ctx.now = Tick(100);
        drop_bricks(&mut ctx, id, &[(0, 50, 50, 54, 50)]);
        ctx.now = Tick(200);
        drop_bricks(&mut ctx, id, &[(0, 60, 50, 64, 50)]);

        let ttl = ctx.arenas.get(id).unwrap().bricks.cfg.ttl_ticks;
        ctx.now = Tick(100 + ttl);
        expire_bricks(&mut ctx);
        let arena = ctx.arenas.get(id).unwrap();
        assert_eq!(arena.bricks.active_count(), 1);
        assert_eq!(arena.map.get_tile(50, 50, true), 0);
        assert_ne!(arena.map.get_tile(60, 50, true), 0);
    }

    #[test]
    fn test_packet_layout_and_batching() {
        let bricks: Vec<BrickData> = (0..40u16)
            .map(|i| BrickData {
                x1: i,
                y1: 1,
                x2: i,
                y2: 5,
                freq: 2,
                brick_id: i,
                start_tick: Tick(7),
            })
            .collect();
        let packets = build_brick_packets(&bricks);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 1 + BRICKS_PER_PACKET * BRICK_WIRE_LEN);
        assert_eq!(packets[0][0], S2C_BRICK);
        assert_eq!(packets[1].len(), 1 + (40 - BRICKS_PER_PACKET) * BRICK_WIRE_LEN);

        // first entry round-trips
        let mut rd = SizeBuf::from_bytes(&packets[0]);
        assert_eq!(rd.read_u8(), Some(S2C_BRICK));
        assert_eq!(rd.read_i16(), Some(0)); // x1
        assert_eq!(rd.read_i16(), Some(1)); // y1
        assert_eq!(rd.read_i16(), Some(0)); // x2
        assert_eq!(rd.read_i16(), Some(5)); // y2
        assert_eq!(rd.read_i16(), Some(2)); // freq
        assert_eq!(rd.read_i16(), Some(0)); // id
        assert_eq!(rd.read_u32(), Some(7)); // start tick
    }
}
