// lvz.rs — server-authoritative LVZ object state
//
// Each arena tracks the graphical objects the server may toggle or edit,
// with per-object defaults and the counts of objects currently differing
// from default (toggles and edits tracked separately). Late joiners get
// the full diff replayed; everyone else gets incremental packets.

use std::collections::BTreeMap;

use subzone_common::sizebuf::SizeBuf;

use crate::net::MAX_LVZ_PACKET;
use crate::server::{LvzPermission, S2C_CHANGE_LVZ, S2C_TOGGLE_LVZ};
use crate::sv_main::ServerContext;

/// Map-space positions are pixels in [0, 1024*16 - 1].
pub const MAX_MAP_PIXEL: i16 = 16383;

/// Toggle entries per packet under the client's 2048-byte limit.
const TOGGLES_PER_PACKET: usize = (MAX_LVZ_PACKET - 1) / 2;

// change mask bits
pub const CHANGE_POSITION: u8 = 0x01;
pub const CHANGE_IMAGE: u8 = 0x02;
pub const CHANGE_LAYER: u8 = 0x04;
pub const CHANGE_TIME: u8 = 0x08;
pub const CHANGE_MODE: u8 = 0x10;

/// Screen-space anchor for screen objects; 4 bits per axis on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ScreenOffset {
    #[default]
    TopLeft = 0,
    Center = 1,
    BottomRight = 2,
    StatsBox = 3,
    TopRightSpecials = 4,
    BottomRightSpecials = 5,
    BelowEnergy = 6,
    TopRight = 7,
    Right = 8,
    BelowRadar = 9,
    BelowWeapons = 10,
    AboveChat = 11,
    Reserved12 = 12,
    Reserved13 = 13,
    Reserved14 = 14,
    Reserved15 = 15,
}

impl ScreenOffset {
    pub fn from_bits(bits: u8) -> Self {
        use ScreenOffset::*;
        match bits & 0x0F {
            0 => TopLeft,
            1 => Center,
            2 => BottomRight,
            3 => StatsBox,
            4 => TopRightSpecials,
            5 => BottomRightSpecials,
            6 => BelowEnergy,
            7 => TopRight,
            8 => Right,
            9 => BelowRadar,
            10 => BelowWeapons,
            11 => AboveChat,
            12 => Reserved12,
            13 => Reserved13,
            14 => Reserved14,
            _ => Reserved15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectState {
    pub map_object: bool,
    pub x: i16,
    pub y: i16,
    pub x_offset: ScreenOffset,
    pub y_offset: ScreenOffset,
    pub image: u8,
    pub layer: u8,
    /// 12 bits on the wire.
    pub timer: u16,
    /// 4 bits on the wire.
    pub mode: u8,
}

impl ObjectState {
    /// Pack id + state into the 10-byte wire form.
    pub fn write(&self, id: u16, sb: &mut SizeBuf) {
        sb.write_u16((id & 0x7FFF) << 1 | self.map_object as u16);
        if self.map_object {
            sb.write_i16(self.x.clamp(0, MAX_MAP_PIXEL));
            sb.write_i16(self.y.clamp(0, MAX_MAP_PIXEL));
        } else {
            sb.write_i16((self.x << 4) | self.x_offset as i16);
            sb.write_i16((self.y << 4) | self.y_offset as i16);
        }
        sb.write_u8(self.image);
        sb.write_u8(self.layer);
        sb.write_u16((self.timer & 0x0FFF) | (self.mode as u16) << 12);
    }

    pub fn read(sb: &mut SizeBuf) -> Option<(u16, ObjectState)> {
        let word = sb.read_u16()?;
        let map_object = word & 1 != 0;
        let id = word >> 1;
        let xw = sb.read_i16()?;
        let yw = sb.read_i16()?;
        let image = sb.read_u8()?;
        let layer = sb.read_u8()?;
        let tw = sb.read_u16()?;
        let state = if map_object {
            ObjectState {
                map_object,
                x: xw,
                y: yw,
                x_offset: ScreenOffset::TopLeft,
                y_offset: ScreenOffset::TopLeft,
                image,
                layer,
                timer: tw & 0x0FFF,
                mode: (tw >> 12) as u8,
            }
        } else {
            ObjectState {
                map_object,
                x: xw >> 4,
                y: yw >> 4,
                x_offset: ScreenOffset::from_bits((xw & 0x0F) as u8),
                y_offset: ScreenOffset::from_bits((yw & 0x0F) as u8),
                image,
                layer,
                timer: tw & 0x0FFF,
                mode: (tw >> 12) as u8,
            }
        };
        Some((id, state))
    }

    /// Field-by-field change mask against another state.
    pub fn diff_mask(&self, other: &ObjectState) -> u8 {
        let mut mask = 0;
        if self.map_object != other.map_object
            || self.x != other.x
            || self.y != other.y
            || self.x_offset != other.x_offset
            || self.y_offset != other.y_offset
        {
            mask |= CHANGE_POSITION;
        }
        if self.image != other.image {
            mask |= CHANGE_IMAGE;
        }
        if self.layer != other.layer {
            mask |= CHANGE_LAYER;
        }
        if self.timer != other.timer {
            mask |= CHANGE_TIME;
        }
        if self.mode != other.mode {
            mask |= CHANGE_MODE;
        }
        mask
    }
}

pub struct LvzObject {
    pub id: u16,
    pub default_enabled: bool,
    pub enabled: bool,
    pub default_state: ObjectState,
    pub current: ObjectState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LvzTarget {
    Player(usize),
    Arena(usize),
}

pub struct LvzState {
    objects: BTreeMap<u16, LvzObject>,
    pub toggle_differences: u32,
    pub extra_differences: u32,
}

impl LvzState {
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            toggle_differences: 0,
            extra_differences: 0,
        }
    }

    /// Register an object with its defaults (from the arena's LVZ set).
    pub fn define_object(&mut self, id: u16, default_state: ObjectState, default_enabled: bool) {
        self.objects.insert(
            id,
            LvzObject {
                id,
                default_enabled,
                enabled: default_enabled,
                default_state,
                current: default_state,
            },
        );
    }

    pub fn get(&self, id: u16) -> Option<&LvzObject> {
        self.objects.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LvzObject> {
        self.objects.values()
    }

    /// Apply a toggle to arena state. Returns false when gated off by a
    /// running timer or an unknown id.
    fn apply_toggle(&mut self, id: u16, enabled: bool) -> bool {
        let Some(obj) = self.objects.get_mut(&id) else {
            return false;
        };
        if obj.current.timer != 0 {
            return false;
        }
        if obj.enabled != enabled {
            let was_diff = obj.enabled != obj.default_enabled;
            obj.enabled = enabled;
            let now_diff = obj.enabled != obj.default_enabled;
            match (was_diff, now_diff) {
                (false, true) => self.toggle_differences += 1,
                (true, false) => self.toggle_differences -= 1,
                _ => {}
            }
        }
        true
    }

    fn apply_state(&mut self, id: u16, new_state: ObjectState) -> Option<u8> {
        let obj = self.objects.get_mut(&id)?;
        let mask = new_state.diff_mask(&obj.current);
        let was_diff = obj.current != obj.default_state;
        obj.current = new_state;
        let now_diff = obj.current != obj.default_state;
        match (was_diff, now_diff) {
            (false, true) => self.extra_differences += 1,
            (true, false) => self.extra_differences -= 1,
            _ => {}
        }
        Some(mask)
    }
}

impl Default for LvzState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// Packet building
// ============================================================

fn build_toggle_packets(entries: &[(u16, bool)]) -> Vec<Vec<u8>> {
    entries
        .chunks(TOGGLES_PER_PACKET)
        .map(|chunk| {
            let mut sb = SizeBuf::new(1 + chunk.len() * 2);
            sb.write_u8(S2C_TOGGLE_LVZ);
            for &(id, enabled) in chunk {
                // bit 15 set means disabled
                sb.write_u16((id & 0x7FFF) | (!enabled as u16) << 15);
            }
            sb.bytes().to_vec()
        })
        .collect()
}

fn build_change_packet(mask: u8, id: u16, state: &ObjectState) -> Vec<u8> {
    let mut sb = SizeBuf::new(1 + 11);
    sb.write_u8(S2C_CHANGE_LVZ);
    sb.write_u8(mask);
    state.write(id, &mut sb);
    sb.bytes().to_vec()
}

fn send_to_target(ctx: &ServerContext, target: LvzTarget, data: &[u8]) {
    let net = ctx.net.clone();
    match target {
        LvzTarget::Player(pid) => net.send_reliable(pid, data),
        LvzTarget::Arena(arena_id) => {
            for player in ctx.players.iter() {
                if player.arena == Some(arena_id) && player.is_playing() {
                    net.send_reliable(player.pid, data);
                }
            }
        }
    }
}

// ============================================================
// Operations
// ============================================================

/// Toggle objects on or off. Arena targets update authoritative state
/// (objects with a running timer are skipped); player targets only send.
pub fn toggle(ctx: &mut ServerContext, target: LvzTarget, toggles: &[(u16, bool)]) {
    let entries: Vec<(u16, bool)> = match target {
        LvzTarget::Arena(arena_id) => {
            let Some(arena) = ctx.arenas.get_mut(arena_id) else {
                return;
            };
            toggles
                .iter()
                .copied()
                .filter(|&(id, enabled)| arena.lvz.apply_toggle(id, enabled))
                .collect()
        }
        LvzTarget::Player(_) => toggles.to_vec(),
    };
    if entries.is_empty() {
        return;
    }
    for pkt in build_toggle_packets(&entries) {
        send_to_target(ctx, target, &pkt);
    }
}

/// Edit an object's state. Arena targets reconcile the extra-difference
/// count against the default; player targets send without touching state.
pub fn change(
    ctx: &mut ServerContext,
    target: LvzTarget,
    id: u16,
    edit: impl FnOnce(&mut ObjectState),
) {
    match target {
        LvzTarget::Arena(arena_id) => {
            let Some(arena) = ctx.arenas.get_mut(arena_id) else {
                return;
            };
            let Some(obj) = arena.lvz.get(id) else {
                return;
            };
            let mut next = obj.current;
            edit(&mut next);
            clamp_map_position(&mut next);
            let Some(mask) = arena.lvz.apply_state(id, next) else {
                return;
            };
            if mask == 0 {
                return;
            }
            let pkt = build_change_packet(mask, id, &next);
            send_to_target(ctx, target, &pkt);
        }
        LvzTarget::Player(_) => {
            // player-scoped view: edit applies to a scratch copy only
            let mut scratch = ObjectState::default();
            edit(&mut scratch);
            clamp_map_position(&mut scratch);
            let pkt = build_change_packet(
                CHANGE_POSITION | CHANGE_IMAGE | CHANGE_LAYER | CHANGE_TIME | CHANGE_MODE,
                id,
                &scratch,
            );
            send_to_target(ctx, target, &pkt);
        }
    }
}

fn clamp_map_position(state: &mut ObjectState) {
    if state.map_object {
        state.x = state.x.clamp(0, MAX_MAP_PIXEL);
        state.y = state.y.clamp(0, MAX_MAP_PIXEL);
    }
}

/// Restore an object's state to its default and toggle it off. The off
/// state is unconditional; a default-enabled object still lands disabled.
pub fn reset(ctx: &mut ServerContext, arena_id: usize, id: u16) {
    let changed = {
        let Some(arena) = ctx.arenas.get_mut(arena_id) else {
            return;
        };
        let Some(obj) = arena.lvz.objects.get_mut(&id) else {
            return;
        };
        let was_state_diff = obj.current != obj.default_state;
        let was_toggle_diff = obj.enabled != obj.default_enabled;
        let was_enabled = obj.enabled;
        obj.current = obj.default_state;
        obj.enabled = false;
        let now_toggle_diff = obj.enabled != obj.default_enabled;
        if was_state_diff {
            arena.lvz.extra_differences -= 1;
        }
        match (was_toggle_diff, now_toggle_diff) {
            (true, false) => arena.lvz.toggle_differences -= 1,
            (false, true) => arena.lvz.toggle_differences += 1,
            _ => {}
        }
        was_state_diff || was_enabled
    };
    if changed {
        for pkt in build_toggle_packets(&[(id, false)]) {
            send_to_target(ctx, LvzTarget::Arena(arena_id), &pkt);
        }
    }
}

/// Replay the arena's full diff at one player: toggles first, then state
/// changes, mask derived field-by-field.
pub fn send_state(ctx: &mut ServerContext, pid: usize) {
    let Some(arena_id) = ctx.players.get(pid).and_then(|p| p.arena) else {
        return;
    };
    let Some(arena) = ctx.arenas.get(arena_id) else {
        return;
    };

    let toggles: Vec<(u16, bool)> = arena
        .lvz
        .iter()
        .filter(|o| o.enabled != o.default_enabled)
        .map(|o| (o.id, o.enabled))
        .collect();
    let changes: Vec<Vec<u8>> = arena
        .lvz
        .iter()
        .filter(|o| o.current != o.default_state)
        .map(|o| build_change_packet(o.current.diff_mask(&o.default_state), o.id, &o.current))
        .collect();

    let net = ctx.net.clone();
    for pkt in build_toggle_packets(&toggles) {
        net.send_reliable(pid, &pkt);
    }
    for pkt in changes {
        net.send_reliable(pid, &pkt);
    }
}

// ============================================================
// Client rebroadcast
// ============================================================

/// C2S 0x0A: {u8 type, i16 target_pid (-1 = arena), inner packet}. Only
/// trusted clients may drive it: Bot permission covers toggle/change
/// packets, Any covers everything.
pub fn handle_rebroadcast(ctx: &mut ServerContext, pid: usize, buf: &mut SizeBuf) {
    let Some(target_pid) = buf.read_i16() else {
        tracing::warn!(pid, malicious = true, "short rebroadcast packet");
        return;
    };
    let Some(inner_type) = buf.read_u8() else {
        tracing::warn!(pid, malicious = true, "rebroadcast with no payload");
        return;
    };

    let (permission, arena_id) = match ctx.players.get(pid) {
        Some(p) => (p.lvz_permission, p.arena),
        None => return,
    };
    let allowed = match permission {
        LvzPermission::Any => true,
        LvzPermission::Bot => {
            inner_type == S2C_TOGGLE_LVZ || inner_type == S2C_CHANGE_LVZ
        }
        LvzPermission::None => false,
    };
    if !allowed {
        tracing::warn!(pid, inner_type, malicious = true, "unauthorized rebroadcast");
        return;
    }

    let target = if target_pid < 0 {
        match arena_id {
            Some(id) => LvzTarget::Arena(id),
            None => return,
        }
    } else {
        LvzTarget::Player(target_pid as usize)
    };

    match (inner_type, target) {
        (t, LvzTarget::Arena(arena_id)) if t == S2C_TOGGLE_LVZ => {
            let mut toggles = Vec::new();
            while let Some(word) = buf.read_u16() {
                toggles.push((word & 0x7FFF, word & 0x8000 == 0));
            }
            toggle(ctx, LvzTarget::Arena(arena_id), &toggles);
        }
        (t, LvzTarget::Arena(arena_id)) if t == S2C_CHANGE_LVZ => {
            let Some(_mask) = buf.read_u8() else {
                return;
            };
            let Some((id, state)) = ObjectState::read(buf) else {
                tracing::warn!(pid, malicious = true, "short object change");
                return;
            };
            change(ctx, LvzTarget::Arena(arena_id), id, |s| *s = state);
        }
        (_, target) => {
            // pass-through for player-scoped or non-LVZ payloads
            let start = buf.readcount - 1;
            let data = buf.data[start..buf.cursize].to_vec();
            send_to_target(ctx, target, &data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SentTarget;
    use crate::server::PlayerState;
    use crate::sv_main::test_context;

    fn ctx_with_objects() -> (crate::sv_main::ServerContext, usize) {
        let mut ctx = test_context();
        let id = crate::arena::find_or_create_arena(&mut ctx, "duel");
        let arena = ctx.arenas.get_mut(id).unwrap();
        for oid in 0..4u16 {
            arena.lvz.define_object(oid, ObjectState::default(), false);
        }
        // one object that defaults to visible
        arena.lvz.define_object(4, ObjectState::default(), true);
        (ctx, id)
    }

    fn diff_counts(ctx: &crate::sv_main::ServerContext, id: usize) -> (u32, u32) {
        let lvz = &ctx.arenas.get(id).unwrap().lvz;
        (lvz.toggle_differences, lvz.extra_differences)
    }

    #[test]
    fn test_toggle_accounting() {
        let (mut ctx, id) = ctx_with_objects();
        toggle(&mut ctx, LvzTarget::Arena(id), &[(0, true), (1, true)]);
        assert_eq!(diff_counts(&ctx, id), (2, 0));
        // toggling back to default drops the count
        toggle(&mut ctx, LvzTarget::Arena(id), &[(0, false)]);
        assert_eq!(diff_counts(&ctx, id), (1, 0));
        // repeat toggles are idempotent
        toggle(&mut ctx, LvzTarget::Arena(id), &[(1, true)]);
        assert_eq!(diff_counts(&ctx, id), (1, 0));
    }

    #[test]
    fn test_timer_gates_toggle() {
        let (mut ctx, id) = ctx_with_objects();
        change(&mut ctx, LvzTarget::Arena(id), 2, |s| s.timer = 100);
        assert_eq!(diff_counts(&ctx, id), (0, 1));
        toggle(&mut ctx, LvzTarget::Arena(id), &[(2, true)]);
        // timer running: toggle is ignored
        assert_eq!(diff_counts(&ctx, id), (0, 1));
        assert!(!ctx.arenas.get(id).unwrap().lvz.get(2).unwrap().enabled);
    }

    #[test]
    fn test_change_and_reset_accounting() {
        let (mut ctx, id) = ctx_with_objects();
        change(&mut ctx, LvzTarget::Arena(id), 0, |s| s.image = 3);
        change(&mut ctx, LvzTarget::Arena(id), 1, |s| s.layer = 2);
        toggle(&mut ctx, LvzTarget::Arena(id), &[(1, true)]);
        assert_eq!(diff_counts(&ctx, id), (1, 2));

        // editing back to default reconciles
        change(&mut ctx, LvzTarget::Arena(id), 0, |s| s.image = 0);
        assert_eq!(diff_counts(&ctx, id), (1, 1));

        reset(&mut ctx, id, 1);
        assert_eq!(diff_counts(&ctx, id), (0, 0));
    }

    #[test]
    fn test_reset_always_lands_disabled() {
        let (mut ctx, id) = ctx_with_objects();
        // object 4 starts enabled (its default); reset must switch it off,
        // not restore the enabled default
        reset(&mut ctx, id, 4);
        {
            let obj = ctx.arenas.get(id).unwrap().lvz.get(4).unwrap();
            assert!(obj.default_enabled);
            assert!(!obj.enabled);
        }
        // off now differs from the enabled default
        assert_eq!(diff_counts(&ctx, id), (1, 0));

        // resetting an already-reset object changes nothing
        reset(&mut ctx, id, 4);
        assert!(!ctx.arenas.get(id).unwrap().lvz.get(4).unwrap().enabled);
        assert_eq!(diff_counts(&ctx, id), (1, 0));

        // a late joiner gets the same off state replayed by send_state
        let pid = {
            let pid = crate::session::new_player(&mut ctx, None);
            let p = ctx.players.get_mut(pid).unwrap();
            p.arena = Some(id);
            p.state = PlayerState::Playing;
            pid
        };
        let sink = ctx.loopback.clone().unwrap();
        sink.take();
        send_state(&mut ctx, pid);
        let sent = sink.sent_to_player(pid);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data[0], S2C_TOGGLE_LVZ);
        let word = u16::from_le_bytes([sent[0].data[1], sent[0].data[2]]);
        // object 4 with the disabled bit set
        assert_eq!(word, 4 | 0x8000);
    }

    #[test]
    fn test_map_coordinate_clamping() {
        let (mut ctx, id) = ctx_with_objects();
        change(&mut ctx, LvzTarget::Arena(id), 0, |s| {
            s.map_object = true;
            s.x = 20000;
            s.y = -5;
        });
        let obj = ctx.arenas.get(id).unwrap().lvz.get(0).unwrap();
        assert_eq!(obj.current.x, MAX_MAP_PIXEL);
        assert_eq!(obj.current.y, 0);
    }

    #[test]
    fn test_object_state_wire_round_trip() {
        let state = ObjectState {
            map_object: false,
            x: -100,
            y: 300,
            x_offset: ScreenOffset::Center,
            y_offset: ScreenOffset::BelowRadar,
            image: 9,
            layer: 2,
            timer: 0x123,
            mode: 5,
        };
        let mut sb = SizeBuf::new(10);
        state.write(0x1AB, &mut sb);
        assert_eq!(sb.cursize, 10);
        let mut rd = SizeBuf::from_bytes(sb.bytes());
        let (id, back) = ObjectState::read(&mut rd).unwrap();
        assert_eq!(id, 0x1AB);
        assert_eq!(back, state);
    }

    #[test]
    fn test_toggle_packet_layout_and_batching() {
        let entries: Vec<(u16, bool)> = (0..1500u16).map(|i| (i, i % 2 == 0)).collect();
        let packets = build_toggle_packets(&entries);
        assert_eq!(packets.len(), 2);
        assert!(packets[0].len() <= MAX_LVZ_PACKET);
        assert_eq!(packets[0][0], S2C_TOGGLE_LVZ);
        // entry 1 (disabled): bit 15 set
        let word = u16::from_le_bytes([packets[0][3], packets[0][4]]);
        assert_eq!(word, 1 | 0x8000);
    }

    #[test]
    fn test_send_state_replays_diff() {
        let (mut ctx, id) = ctx_with_objects();
        toggle(&mut ctx, LvzTarget::Arena(id), &[(0, true)]);
        change(&mut ctx, LvzTarget::Arena(id), 1, |s| s.image = 7);

        let pid = {
            let pid = crate::session::new_player(&mut ctx, None);
            let p = ctx.players.get_mut(pid).unwrap();
            p.arena = Some(id);
            p.state = PlayerState::Playing;
            pid
        };
        let sink = ctx.loopback.clone().unwrap();
        sink.take();
        send_state(&mut ctx, pid);
        let sent = sink.take();
        let to_pid: Vec<_> = sent
            .iter()
            .filter(|p| p.target == SentTarget::Player(pid))
            .collect();
        assert_eq!(to_pid.len(), 2);
        assert_eq!(to_pid[0].data[0], S2C_TOGGLE_LVZ);
        assert_eq!(to_pid[1].data[0], S2C_CHANGE_LVZ);
        assert_eq!(to_pid[1].data[1], CHANGE_IMAGE);
    }
}
