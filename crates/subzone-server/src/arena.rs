// arena.rs — arena registry and lifecycle
//
// Arenas move through PreCreate -> Create -> Running -> Destroy. Lifecycle
// actions are fired to registered listeners in order, one at a time per
// arena; an action does not complete while any listener still holds the
// arena (async prep keeps a hold until it finishes). The driver polls the
// hold counter from the main loop tick.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use subzone_common::conf::ConfDocument;
use subzone_common::tick::Tick;

use crate::brick::BrickState;
use crate::ext::ExtData;
use crate::lvz::LvzState;
use crate::mapdata::MapData;
use crate::server::HOLD_TIMEOUT_TICKS;
use crate::sv_main::ServerContext;

/// Base name used for public arenas ("0", "1", ... strip to nothing).
pub const PUBLIC_BASE: &str = "(public)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaAction {
    PreCreate,
    Create,
    ConfChanged,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaState {
    /// Created, lifecycle actions still pending.
    Init,
    Running,
    Destroyed,
}

/// RAII hold on an arena's lifecycle. The current action cannot complete
/// until every guard is dropped; dropping on an error path releases
/// automatically.
pub struct ArenaHold {
    counter: Arc<AtomicI32>,
}

impl Drop for ArenaHold {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

struct InFlight {
    action: ArenaAction,
    since: Tick,
}

pub struct Arena {
    pub id: usize,
    pub name: String,
    pub base_name: String,
    pub cfg: Arc<ConfDocument>,
    pub state: ArenaState,
    holds: Arc<AtomicI32>,
    pending: VecDeque<ArenaAction>,
    in_flight: Option<InFlight>,
    pub map: MapData,
    pub bricks: BrickState,
    pub lvz: LvzState,
    pub ext: ExtData,
}

impl Arena {
    fn new(id: usize, name: String, cfg: Arc<ConfDocument>) -> Self {
        let base_name = base_name_of(&name);
        Self {
            id,
            name,
            base_name,
            cfg,
            state: ArenaState::Init,
            holds: Arc::new(AtomicI32::new(0)),
            pending: VecDeque::new(),
            in_flight: None,
            map: MapData::new(),
            bricks: BrickState::new(),
            lvz: LvzState::new(),
            ext: ExtData::default(),
        }
    }

    pub fn add_hold(&self) -> ArenaHold {
        self.holds.fetch_add(1, Ordering::AcqRel);
        ArenaHold {
            counter: Arc::clone(&self.holds),
        }
    }

    pub fn hold_count(&self) -> i32 {
        self.holds.load(Ordering::Acquire)
    }
}

/// Trailing digits stripped; all-digit (public) names collapse to the
/// shared public base.
pub fn base_name_of(name: &str) -> String {
    let stripped = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if stripped.is_empty() {
        PUBLIC_BASE.to_string()
    } else {
        stripped.to_string()
    }
}

pub type ArenaListener = fn(&mut ServerContext, usize, ArenaAction);

pub struct ArenaRegistry {
    arenas: Vec<Option<Arena>>,
    /// lower-case name -> slot
    name_index: HashMap<String, usize>,
    listeners: Vec<ArenaListener>,
}

impl ArenaRegistry {
    pub fn new() -> Self {
        Self {
            arenas: Vec::new(),
            name_index: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    /// Listeners fire in registration (dependency) order. A listener must
    /// not create or destroy arenas from inside the callback.
    pub fn register_listener(&mut self, listener: ArenaListener) {
        self.listeners.push(listener);
    }

    pub fn get(&self, id: usize) -> Option<&Arena> {
        self.arenas.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Arena> {
        self.arenas.get_mut(id).and_then(Option::as_mut)
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.name_index.get(&name.to_lowercase()).copied()
    }

    pub fn live_ids(&self) -> Vec<usize> {
        self.arenas
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.as_ref().map(|_| i))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arena> {
        self.arenas.iter().filter_map(Option::as_ref)
    }

    fn insert(&mut self, name: String, cfg: Arc<ConfDocument>) -> usize {
        let slot = match self.arenas.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                self.arenas.push(None);
                self.arenas.len() - 1
            }
        };
        self.name_index.insert(name.to_lowercase(), slot);
        let mut arena = Arena::new(slot, name, cfg);
        arena.pending.push_back(ArenaAction::PreCreate);
        arena.pending.push_back(ArenaAction::Create);
        self.arenas[slot] = Some(arena);
        slot
    }

    fn remove(&mut self, id: usize) {
        if let Some(arena) = self.arenas.get_mut(id).and_then(Option::take) {
            self.name_index.remove(&arena.name.to_lowercase());
        }
    }
}

impl Default for ArenaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// Name resolution for enter requests
// ============================================================

/// An empty or all-digit request lands in a public arena named by the
/// digits; anything else is preserved verbatim (stored case-sensitively,
/// looked up case-insensitively).
pub fn resolve_requested_name(requested: &str) -> String {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        return "0".to_string();
    }
    trimmed.to_string()
}

// ============================================================
// Registry operations (free functions over the context)
// ============================================================

pub fn find_or_create_arena(ctx: &mut ServerContext, requested: &str) -> usize {
    let name = resolve_requested_name(requested);
    if let Some(id) = ctx.arenas.find_by_name(&name) {
        return id;
    }
    let cfg = Arc::new(ctx.load_arena_cfg(&base_name_of(&name)));
    let id = ctx.arenas.insert(name.clone(), cfg);
    tracing::debug!(arena = %name, id, "creating arena");
    id
}

pub fn destroy_arena(ctx: &mut ServerContext, id: usize) {
    if let Some(arena) = ctx.arenas.get_mut(id) {
        if arena.state != ArenaState::Destroyed {
            arena.pending.push_back(ArenaAction::Destroy);
        }
    }
}

/// Re-fire configuration for a running arena after its conf reloads.
pub fn reload_arena_conf(ctx: &mut ServerContext, id: usize) {
    if let Some(arena) = ctx.arenas.get_mut(id) {
        if arena.state == ArenaState::Running {
            arena.pending.push_back(ArenaAction::ConfChanged);
        }
    }
}

fn fire_listeners(ctx: &mut ServerContext, id: usize, action: ArenaAction) {
    let listeners = ctx.arenas.listeners.clone();
    for listener in listeners {
        listener(ctx, id, action);
    }
}

/// Advance every arena's lifecycle: start the next pending action, and
/// complete the in-flight one once its holds drain. Called once per main
/// loop tick.
pub fn drive_arenas(ctx: &mut ServerContext) {
    let now = ctx.now;
    for id in ctx.arenas.live_ids() {
        loop {
            enum Step {
                Idle,
                Fire(ArenaAction),
                Complete(ArenaAction),
                Timeout(ArenaAction),
            }

            let step = {
                let Some(arena) = ctx.arenas.get_mut(id) else {
                    break;
                };
                match &arena.in_flight {
                    None => match arena.pending.pop_front() {
                        Some(action) => {
                            arena.in_flight = Some(InFlight { action, since: now });
                            Step::Fire(action)
                        }
                        None => Step::Idle,
                    },
                    Some(fl) => {
                        if arena.hold_count() == 0 {
                            let action = fl.action;
                            arena.in_flight = None;
                            Step::Complete(action)
                        } else if now.diff(fl.since) > HOLD_TIMEOUT_TICKS as i32 {
                            let action = fl.action;
                            arena.in_flight = None;
                            Step::Timeout(action)
                        } else {
                            Step::Idle
                        }
                    }
                }
            };

            match step {
                Step::Idle => break,
                Step::Fire(action) => {
                    fire_listeners(ctx, id, action);
                    // fall through: holds may already be zero
                }
                Step::Complete(action) => {
                    complete_action(ctx, id, action);
                    if action == ArenaAction::Destroy {
                        break;
                    }
                }
                Step::Timeout(action) => {
                    let name = ctx
                        .arenas
                        .get(id)
                        .map(|a| a.name.clone())
                        .unwrap_or_default();
                    tracing::warn!(arena = %name, ?action, "lifecycle hold never released");
                    if action == ArenaAction::Destroy {
                        // force the teardown through
                        complete_action(ctx, id, ArenaAction::Destroy);
                        break;
                    }
                    if let Some(arena) = ctx.arenas.get_mut(id) {
                        arena.pending.clear();
                        arena.pending.push_back(ArenaAction::Destroy);
                    }
                }
            }
        }
    }
}

fn complete_action(ctx: &mut ServerContext, id: usize, action: ArenaAction) {
    match action {
        ArenaAction::PreCreate | ArenaAction::ConfChanged => {}
        ArenaAction::Create => {
            if let Some(arena) = ctx.arenas.get_mut(id) {
                arena.state = ArenaState::Running;
                tracing::debug!(arena = %arena.name, "arena running");
            }
        }
        ArenaAction::Destroy => {
            if let Some(arena) = ctx.arenas.get_mut(id) {
                arena.state = ArenaState::Destroyed;
            }
            ctx.arenas.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name_of() {
        assert_eq!(base_name_of("duel"), "duel");
        assert_eq!(base_name_of("duel3"), "duel");
        assert_eq!(base_name_of("0"), PUBLIC_BASE);
        assert_eq!(base_name_of("17"), PUBLIC_BASE);
        assert_eq!(base_name_of("base2k5"), "base2k");
    }

    #[test]
    fn test_resolve_requested_name() {
        assert_eq!(resolve_requested_name(""), "0");
        assert_eq!(resolve_requested_name("  "), "0");
        assert_eq!(resolve_requested_name("1"), "1");
        assert_eq!(resolve_requested_name("Duel"), "Duel");
    }

    #[test]
    fn test_hold_guard_releases_on_drop() {
        let arena = Arena::new(0, "duel".to_string(), Arc::new(ConfDocument::new()));
        assert_eq!(arena.hold_count(), 0);
        let h1 = arena.add_hold();
        let h2 = arena.add_hold();
        assert_eq!(arena.hold_count(), 2);
        drop(h1);
        assert_eq!(arena.hold_count(), 1);
        drop(h2);
        assert_eq!(arena.hold_count(), 0);
    }

    #[test]
    fn test_registry_case_insensitive_lookup() {
        let mut reg = ArenaRegistry::new();
        let id = reg.insert("Duel".to_string(), Arc::new(ConfDocument::new()));
        assert_eq!(reg.find_by_name("duel"), Some(id));
        assert_eq!(reg.find_by_name("DUEL"), Some(id));
        assert_eq!(reg.get(id).unwrap().name, "Duel");
        reg.remove(id);
        assert_eq!(reg.find_by_name("duel"), None);
    }
}
