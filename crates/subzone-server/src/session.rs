// session.rs — player session state machine
//
// Every connection walks Connected -> NeedAuth -> Loggedin -> the arena
// sync states -> Playing, and back out through LeavingArena / LeavingZone
// to TimeWait, where the slot lingers briefly before reuse. Transitions
// are driven by packets and by the per-tick sweep; gameplay packets are
// rejected until Playing, and the ship is pinned to Spec outside Playing.

use std::net::SocketAddr;

use rand::RngCore;

use subzone_common::sizebuf::SizeBuf;
use subzone_common::tick::Tick;

use crate::arena;
use crate::auth::{AuthCode, AuthRequest, AuthResult};
use crate::brick;
use crate::capman::{CAP_REBROADCAST_ANY, CAP_REBROADCAST_LVZ};
use crate::lvz;
use crate::server::{
    LvzPermission, Player, PlayerState, ShipType, TIMEWAIT_TICKS,
};
use crate::sv_main::ServerContext;

/// Login metadata kept in the session's extension slot.
pub struct LoginInfo {
    pub client_version: u16,
    pub login_tick: Tick,
}

/// S2C login response type and its result codes.
pub const S2C_LOGIN_RESPONSE: u8 = 0x0A;
pub const LOGIN_OK: u8 = 0;
pub const LOGIN_BAD_PASSWORD: u8 = 2;
pub const LOGIN_BAD_NAME: u8 = 4;
pub const LOGIN_NO_PERMISSION: u8 = 12;
pub const LOGIN_SERVER_ERROR: u8 = 14;

// ============================================================
// Slot management
// ============================================================

pub fn new_player(ctx: &mut ServerContext, addr: Option<SocketAddr>) -> usize {
    let pid = match ctx.players.iter().position(|p| p.state.is_free()) {
        Some(pid) => pid,
        None => {
            let pid = ctx.players.len();
            let ext = ctx.player_ext.make_data();
            ctx.players.push(Player::new(pid, ext));
            pid
        }
    };
    let now = ctx.now;
    let mut session_id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut session_id);
    {
        let player = &mut ctx.players[pid];
        player.session_id = session_id;
        player.state = PlayerState::Connected;
        player.addr = addr;
        player.connect_tick = now;
        player.last_recv_tick = now;
    }
    if let Some(addr) = addr {
        ctx.addr_index.insert(addr, pid);
        ctx.net.set_route(pid, addr);
    }
    tracing::debug!(pid, ?addr, "player slot opened");
    pid
}

/// Create the player side of an authenticated chat-protocol connection.
/// Chat clients skip the arena states entirely.
pub fn new_chat_player(ctx: &mut ServerContext, conn_id: usize, result: &AuthResult) -> usize {
    let pid = new_player(ctx, None);
    let (group, source) = ctx
        .caps
        .resolve_group(&result.send_name, result.authenticated, None, None);
    let player = &mut ctx.players[pid];
    player.chat_conn = Some(conn_id);
    player.name = result.send_name.clone();
    player.authenticated = result.authenticated;
    player.group = group;
    player.group_source = source;
    player.state = PlayerState::Loggedin;
    pid
}

fn free_slot(ctx: &mut ServerContext, pid: usize) {
    let addr = ctx.players[pid].addr;
    if let Some(addr) = addr {
        ctx.addr_index.remove(&addr);
        ctx.net.clear_route(pid);
    }
    ctx.players[pid].recycle();
    tracing::debug!(pid, "player slot reclaimed");
}

// ============================================================
// Login
// ============================================================

/// C2S 0x09: {u8 type, u8[32] name, u8[32] password, u16 client version}.
pub fn handle_login(ctx: &mut ServerContext, pid: usize, buf: &mut SizeBuf) {
    {
        let player = &ctx.players[pid];
        if player.state != PlayerState::Connected && player.state != PlayerState::NeedAuth {
            tracing::warn!(pid, state = ?player.state, "login in bad state");
            return;
        }
    }
    let Some(name_bytes) = buf.read_bytes(32).map(<[u8]>::to_vec) else {
        tracing::warn!(pid, len = buf.cursize, malicious = true, "short login packet");
        return;
    };
    let Some(password_bytes) = buf.read_bytes(32).map(<[u8]>::to_vec) else {
        tracing::warn!(pid, len = buf.cursize, malicious = true, "short login packet");
        return;
    };
    let Some(version) = buf.read_u16() else {
        tracing::warn!(pid, len = buf.cursize, malicious = true, "short login packet");
        return;
    };

    ctx.players[pid].state = PlayerState::NeedAuth;
    let req = AuthRequest {
        name_bytes,
        password_bytes,
        client_version: version,
    };
    let result = ctx.auth.authenticate(&req);
    complete_auth(ctx, pid, result, version);
}

fn complete_auth(ctx: &mut ServerContext, pid: usize, result: AuthResult, client_version: u16) {
    let code = match result.code {
        AuthCode::Ok => LOGIN_OK,
        AuthCode::BadName => LOGIN_BAD_NAME,
        AuthCode::BadPassword => LOGIN_BAD_PASSWORD,
        AuthCode::NoPermission => LOGIN_NO_PERMISSION,
        AuthCode::CustomText => LOGIN_SERVER_ERROR,
    };
    let mut reply = SizeBuf::new(2);
    reply.write_u8(S2C_LOGIN_RESPONSE);
    reply.write_u8(code);
    ctx.net.send_reliable(pid, reply.bytes());

    if result.code != AuthCode::Ok {
        tracing::debug!(pid, code = ?result.code, "login denied");
        ctx.players[pid].state = PlayerState::Connected;
        return;
    }

    let (group, source) = ctx
        .caps
        .resolve_group(&result.send_name, result.authenticated, None, None);
    let now = ctx.now;
    let login_info_key = ctx.login_info_key;
    let player = &mut ctx.players[pid];
    player.name = result.send_name;
    player.authenticated = result.authenticated;
    player.group = group;
    player.group_source = source;
    player.state = PlayerState::Loggedin;
    player.ext.set(
        login_info_key,
        LoginInfo {
            client_version,
            login_tick: now,
        },
    );
    tracing::info!(pid, name = %player.name, authenticated = player.authenticated, "login ok");
}

// ============================================================
// Arena entry / exit
// ============================================================

/// C2S 0x01: {u8 type, u8 ship, cstr arena name}.
pub fn handle_go_arena(ctx: &mut ServerContext, pid: usize, buf: &mut SizeBuf) {
    {
        let player = &ctx.players[pid];
        if player.state != PlayerState::Loggedin {
            tracing::warn!(pid, state = ?player.state, "go-arena in bad state");
            return;
        }
    }
    let Some(_ship) = buf.read_u8() else {
        tracing::warn!(pid, malicious = true, "short go-arena packet");
        return;
    };
    let requested = buf.read_cstr().unwrap_or_default();
    let arena_id = arena::find_or_create_arena(ctx, &requested);

    let player = &mut ctx.players[pid];
    player.arena = Some(arena_id);
    player.requested_arena = Some(requested);
    player.ship = ShipType::Spec;
    player.state = PlayerState::DoFreqAndArenaSync;
}

/// C2S 0x02: leave the arena, stay in the zone.
pub fn handle_leave_arena(ctx: &mut ServerContext, pid: usize, _buf: &mut SizeBuf) {
    let player = &mut ctx.players[pid];
    if player.state != PlayerState::Playing {
        tracing::warn!(pid, state = ?player.state, "leave-arena in bad state");
        return;
    }
    player.state = PlayerState::LeavingArena;
    player.ship = ShipType::Spec;
}

/// Begin a full zone exit from any live state; used by kicks, socket
/// errors, and chat-connection teardown.
pub fn begin_leave_zone(ctx: &mut ServerContext, pid: usize) {
    let player = &mut ctx.players[pid];
    if player.state.is_free() || player.state >= PlayerState::LeavingZone {
        return;
    }
    player.leaving_zone = true;
    player.ship = ShipType::Spec;
    if player.arena.is_some() && player.state >= PlayerState::DoFreqAndArenaSync {
        player.state = PlayerState::LeavingArena;
    } else {
        player.state = PlayerState::LeavingZone;
    }
}

pub fn kick(ctx: &mut ServerContext, pid: usize, reason: &str) {
    tracing::info!(pid, reason, "kicking player");
    crate::chat::send_to_player(ctx, pid, crate::chat::ChatKind::Warning, reason);
    begin_leave_zone(ctx, pid);
}

// ============================================================
// Position intake
// ============================================================

/// C2S 0x03: {u8 type, u8 rotation, i16 x, i16 y, ...}; trailing weapon
/// and status fields are not the core's business.
pub fn handle_position(ctx: &mut ServerContext, pid: usize, buf: &mut SizeBuf) {
    let (Some(rotation), Some(x), Some(y)) = (buf.read_u8(), buf.read_i16(), buf.read_i16())
    else {
        tracing::warn!(pid, malicious = true, "short position packet");
        return;
    };
    let player = &mut ctx.players[pid];
    if player.state != PlayerState::Playing {
        tracing::warn!(pid, state = ?player.state, "position outside play");
        return;
    }
    let rotation = rotation % 40;
    let old = player.pos.rotation;
    if rotation != old {
        player.pos.last_rotation_cw = (rotation + 40 - old) % 40 < 20;
    }
    player.pos.rotation = rotation;
    player.pos.x = x;
    player.pos.y = y;
    player.last_recv_tick = ctx.now;
}

// ============================================================
// Per-tick progression
// ============================================================

fn balance_freq(ctx: &ServerContext, arena_id: usize) -> u16 {
    let (mut freq0, mut freq1) = (0usize, 0usize);
    for p in ctx.players.iter() {
        if p.arena == Some(arena_id) && p.is_playing() {
            match p.freq {
                0 => freq0 += 1,
                1 => freq1 += 1,
                _ => {}
            }
        }
    }
    if freq1 < freq0 {
        1
    } else {
        0
    }
}

/// Advance sessions whose next step is server-driven: arena sync once the
/// arena is up, teardown states, and TimeWait reclamation.
pub fn process_sessions(ctx: &mut ServerContext) {
    let now = ctx.now;
    for pid in 0..ctx.players.len() {
        let state = ctx.players[pid].state;
        match state {
            PlayerState::DoFreqAndArenaSync => {
                let Some(arena_id) = ctx.players[pid].arena else {
                    ctx.players[pid].state = PlayerState::Loggedin;
                    continue;
                };
                let ready = ctx
                    .arenas
                    .get(arena_id)
                    .map(|a| a.state == crate::arena::ArenaState::Running && a.map.is_ready())
                    .unwrap_or(false);
                if ready {
                    let freq = balance_freq(ctx, arena_id);
                    let player = &mut ctx.players[pid];
                    player.freq = freq;
                    player.state = PlayerState::WaitArenaSync1;
                }
            }
            PlayerState::WaitArenaSync1 => {
                // the map/settings sync ack is handled by the transport
                // layer; nothing to wait on here
                ctx.players[pid].state = PlayerState::ArenaRespAndCBS;
            }
            PlayerState::ArenaRespAndCBS => {
                enter_arena_complete(ctx, pid);
            }
            PlayerState::LeavingArena => {
                leave_arena_complete(ctx, pid);
            }
            PlayerState::LeavingZone => {
                let player = &mut ctx.players[pid];
                player.state = PlayerState::TimeWait;
                player.leave_tick = Some(now);
            }
            PlayerState::TimeWait => {
                let expired = ctx.players[pid]
                    .leave_tick
                    .map(|t| now.is_at_or_after(t.wrapping_add(TIMEWAIT_TICKS)))
                    .unwrap_or(true);
                if expired {
                    free_slot(ctx, pid);
                }
            }
            _ => {}
        }
    }
}

fn enter_arena_complete(ctx: &mut ServerContext, pid: usize) {
    let Some(arena_id) = ctx.players[pid].arena else {
        ctx.players[pid].state = PlayerState::Loggedin;
        return;
    };

    // arena-scoped group and cached LVZ permission
    let (name, authenticated) = {
        let p = &ctx.players[pid];
        (p.name.clone(), p.authenticated)
    };
    let (group, source) = match ctx.arenas.get(arena_id) {
        Some(arena) => ctx.caps.resolve_group(
            &name,
            authenticated,
            Some(arena.base_name.as_str()),
            Some(arena.cfg.as_ref()),
        ),
        None => ctx.caps.resolve_group(&name, authenticated, None, None),
    };
    let permission = if ctx.caps.has_capability(&group, CAP_REBROADCAST_ANY) {
        LvzPermission::Any
    } else if ctx.caps.has_capability(&group, CAP_REBROADCAST_LVZ) {
        LvzPermission::Bot
    } else {
        LvzPermission::None
    };
    {
        let player = &mut ctx.players[pid];
        player.group = group;
        player.group_source = source;
        player.lvz_permission = permission;
        player.state = PlayerState::Playing;
    }
    tracing::debug!(pid, arena = arena_id, "entered arena");

    // replay arena state at the newcomer
    brick::send_all_bricks(ctx, pid);
    lvz::send_state(ctx, pid);
}

fn leave_arena_complete(ctx: &mut ServerContext, pid: usize) {
    let arena_id = ctx.players[pid].arena.take();
    let leaving_zone = ctx.players[pid].leaving_zone;
    {
        let player = &mut ctx.players[pid];
        player.ship = ShipType::Spec;
        player.state = if leaving_zone {
            PlayerState::LeavingZone
        } else {
            PlayerState::Loggedin
        };
    }

    // tear down an arena its last player just left
    if let Some(arena_id) = arena_id {
        let occupied = ctx
            .players
            .iter()
            .any(|p| p.arena == Some(arena_id) && !p.state.is_free());
        if !occupied {
            tracing::debug!(arena = arena_id, "last player left, destroying arena");
            arena::destroy_arena(ctx, arena_id);
        }
    }
}
