// sv_main.rs — server context, packet router, and the main loop frame

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use rayon::prelude::*;

use subzone_common::conf::ConfDocument;
use subzone_common::sizebuf::SizeBuf;
use subzone_common::tick::{Tick, TickClock};

use crate::arena::{self, ArenaRegistry};
use crate::auth::AuthPipeline;
use crate::brick;
use crate::capman::CapabilityStore;
use crate::chat::{self, ChatRelay};
use crate::ext::{ExtRegistry, SlotKey};
use crate::lvz;
use crate::mapdata::{self, MapStore};
use crate::net::PacketSink;
use crate::peer::{self, PeerContext};
use crate::server::{
    Player, PlayerState, C2S_BRICK, C2S_CHAT, C2S_GO_ARENA, C2S_LEAVE_ARENA, C2S_LOGIN,
    C2S_POSITION, C2S_REBROADCAST,
};
use crate::session;

/// Work posted at the main loop by worker threads; drained every frame.
pub type WorkItem = Box<dyn FnOnce(&mut ServerContext) + Send>;

pub type GameHandler = fn(&mut ServerContext, usize, &mut SizeBuf);

/// Flush a dirty staff document this often (one minute).
const STAFF_SAVE_INTERVAL_TICKS: u32 = 6000;

pub struct ServerOpts {
    pub global_cfg: ConfDocument,
    pub passwd_cfg: ConfDocument,
    pub staff_cfg: ConfDocument,
    pub groupdef_cfg: ConfDocument,
    pub data_dir: PathBuf,
    pub net: Arc<dyn PacketSink>,
}

pub struct ServerContext {
    pub clock: TickClock,
    /// Refreshed at the top of every frame; handlers read this, never the
    /// clock directly, so one frame sees one time.
    pub now: Tick,
    pub global_cfg: ConfDocument,
    pub data_dir: PathBuf,
    pub players: Vec<Player>,
    pub addr_index: HashMap<SocketAddr, usize>,
    pub arenas: ArenaRegistry,
    pub maps: MapStore,
    pub auth: AuthPipeline,
    pub caps: CapabilityStore,
    pub peer: PeerContext,
    pub chat: ChatRelay,
    pub net: Arc<dyn PacketSink>,
    pub player_ext: ExtRegistry,
    pub login_info_key: SlotKey<session::LoginInfo>,
    pub work_tx: Sender<WorkItem>,
    work_rx: Receiver<WorkItem>,
    game_handlers: [Option<GameHandler>; 256],
    connection_timeout_ticks: u32,
    last_staff_save: Tick,
    #[cfg(test)]
    pub loopback: Option<Arc<crate::net::LoopbackSink>>,
}

impl ServerContext {
    pub fn new(opts: ServerOpts) -> Self {
        let (work_tx, work_rx) = crossbeam_channel::unbounded();
        let maps = MapStore::new(work_tx.clone());
        let auth = AuthPipeline::new(opts.passwd_cfg, None);
        let caps = CapabilityStore::new(opts.staff_cfg, opts.groupdef_cfg);
        let peer = PeerContext::new(peer::load_zones(&opts.global_cfg));
        let chat_delay = opts.global_cfg.get_int("Chat", "ChatMessageDelay", 200).max(0) as u64;
        let timeout = opts.global_cfg.get_int("Net", "ConnectionTimeout", 3000).max(100) as u32;

        let mut arenas = ArenaRegistry::new();
        arenas.register_listener(mapdata::on_arena_action);
        arenas.register_listener(brick::on_arena_action);

        let mut player_ext = ExtRegistry::new();
        let login_info_key = player_ext.register();

        let mut ctx = Self {
            clock: TickClock::new(),
            now: Tick::ZERO,
            global_cfg: opts.global_cfg,
            data_dir: opts.data_dir,
            players: Vec::new(),
            addr_index: HashMap::new(),
            arenas,
            maps,
            auth,
            caps,
            peer,
            chat: ChatRelay::new(chat_delay),
            net: opts.net,
            player_ext,
            login_info_key,
            work_tx,
            work_rx,
            game_handlers: [None; 256],
            connection_timeout_ticks: timeout,
            last_staff_save: Tick::ZERO,
            #[cfg(test)]
            loopback: None,
        };
        ctx.register_default_handlers();
        ctx.now = ctx.clock.now();
        ctx
    }

    pub fn register_game_handler(&mut self, ptype: u8, handler: GameHandler) {
        self.game_handlers[ptype as usize] = Some(handler);
    }

    fn register_default_handlers(&mut self) {
        self.register_game_handler(C2S_GO_ARENA, session::handle_go_arena);
        self.register_game_handler(C2S_LEAVE_ARENA, session::handle_leave_arena);
        self.register_game_handler(C2S_POSITION, session::handle_position);
        self.register_game_handler(C2S_CHAT, chat::handle_chat_packet);
        self.register_game_handler(C2S_LOGIN, session::handle_login);
        self.register_game_handler(C2S_REBROADCAST, lvz::handle_rebroadcast);
        self.register_game_handler(C2S_BRICK, brick::handle_brick_request);
    }

    /// Arena config: arenas/<base>.conf, falling back to the zone-wide
    /// arena.conf, falling back to an empty document.
    pub fn load_arena_cfg(&self, base: &str) -> ConfDocument {
        let specific = self.data_dir.join("arenas").join(format!("{}.conf", base));
        if specific.is_file() {
            match ConfDocument::load(&specific) {
                Ok(doc) => return doc,
                Err(e) => tracing::warn!(error = %e, "arena conf unreadable"),
            }
        }
        let shared = self.data_dir.join("arena.conf");
        if shared.is_file() {
            match ConfDocument::load(&shared) {
                Ok(doc) => return doc,
                Err(e) => tracing::warn!(error = %e, "arena conf unreadable"),
            }
        }
        ConfDocument::new()
    }

    /// Drain everything workers posted since the last frame.
    pub fn drain_work(&mut self) {
        while let Ok(item) = self.work_rx.try_recv() {
            item(self);
        }
    }

    /// One main-loop frame: worker results, lifecycle, sessions, timers.
    pub fn run_frame(&mut self) {
        self.now = self.clock.now();
        self.drain_work();
        arena::drive_arenas(self);
        session::process_sessions(self);
        brick::expire_bricks(self);
        peer::run_timers(self);
        check_timeouts(self);

        if self.caps.staff.is_dirty()
            && self.now.diff(self.last_staff_save) >= STAFF_SAVE_INTERVAL_TICKS as i32
        {
            self.last_staff_save = self.now;
            if let Err(e) = self.caps.staff.save() {
                tracing::warn!(error = %e, "staff conf save failed");
            }
        }
    }

    // ============================================================
    // Packet router
    // ============================================================

    /// Single entry point for every received datagram: peer traffic is
    /// sniffed out by its magic bytes, everything else goes through the
    /// per-type game handler table.
    pub fn handle_packet(&mut self, from: SocketAddr, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if peer::is_peer_packet(bytes) {
            peer::handle_peer_packet(self, from, bytes);
            return;
        }

        let pid = match self.addr_index.get(&from) {
            Some(&pid) => pid,
            None => session::new_player(self, Some(from)),
        };
        self.players[pid].last_recv_tick = self.now;

        let ptype = bytes[0];
        match self.game_handlers[ptype as usize] {
            Some(handler) => {
                let mut buf = SizeBuf::from_bytes(bytes);
                buf.readcount = 1;
                handler(self, pid, &mut buf);
            }
            None => {
                tracing::trace!(%from, ptype, "dropping unknown packet type");
            }
        }
    }
}

// ============================================================
// Timeout sweep
// ============================================================

enum TimeoutAction {
    None,
    Drop(usize, String),
}

/// Drop game-protocol players that stopped talking to us.
/// Phase 1 (parallel): evaluate timeout conditions.
/// Phase 2 (sequential): apply the drops.
fn check_timeouts(ctx: &mut ServerContext) {
    let now = ctx.now;
    let timeout = ctx.connection_timeout_ticks as i32;

    let snapshot: Vec<(usize, PlayerState, bool, Tick, String)> = ctx
        .players
        .iter()
        .map(|p| {
            (
                p.pid,
                p.state,
                p.addr.is_some(),
                p.last_recv_tick,
                p.name.clone(),
            )
        })
        .collect();

    let actions: Vec<TimeoutAction> = snapshot
        .par_iter()
        .map(|(pid, state, has_addr, last_recv, name)| {
            if !has_addr
                || *state < PlayerState::Connected
                || *state >= PlayerState::LeavingZone
            {
                return TimeoutAction::None;
            }
            if now.diff(*last_recv) > timeout {
                TimeoutAction::Drop(*pid, name.clone())
            } else {
                TimeoutAction::None
            }
        })
        .collect();

    for action in actions {
        if let TimeoutAction::Drop(pid, name) = action {
            tracing::info!(pid, name = %name, "connection timed out");
            session::begin_leave_zone(ctx, pid);
        }
    }
}

// ============================================================
// Test support
// ============================================================

#[cfg(test)]
pub fn test_context_with_global(global: &str) -> ServerContext {
    let sink = Arc::new(crate::net::LoopbackSink::new());
    let opts = ServerOpts {
        global_cfg: ConfDocument::parse(global),
        passwd_cfg: ConfDocument::new(),
        staff_cfg: ConfDocument::new(),
        groupdef_cfg: ConfDocument::new(),
        data_dir: std::env::temp_dir().join(format!("subzone-test-{}", std::process::id())),
        net: sink.clone(),
    };
    let mut ctx = ServerContext::new(opts);
    ctx.loopback = Some(sink);
    ctx.now = ctx.clock.now();
    ctx
}

#[cfg(test)]
pub fn test_context() -> ServerContext {
    test_context_with_global("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SentTarget;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_router_creates_player_on_first_contact() {
        let mut ctx = test_context();
        let from = addr("1.2.3.4:7777");
        // unknown packet type still opens the slot, then drops
        ctx.handle_packet(from, &[0xEE, 1, 2, 3]);
        assert_eq!(ctx.players.len(), 1);
        assert_eq!(ctx.addr_index.get(&from), Some(&0));
        // second packet reuses the slot
        ctx.handle_packet(from, &[0xEE]);
        assert_eq!(ctx.players.len(), 1);
    }

    #[test]
    fn test_router_prefers_peer_magic() {
        const PEER_CONF: &str = "\
[Peer0]
Address = 1.2.3.4
Port = 7777
Password = s
";
        let mut ctx = test_context_with_global(PEER_CONF);
        let from = addr("1.2.3.4:7777");
        let mut pkt = vec![0x00, 0x01];
        pkt.extend_from_slice(&subzone_common::crc::peer_password_hash("s").to_le_bytes());
        pkt.push(0xFF);
        pkt.push(4); // PlayerCount
        pkt.extend_from_slice(&9u32.to_le_bytes()); // timestamp
        pkt.extend_from_slice(&3u16.to_le_bytes());
        ctx.handle_packet(from, &pkt);
        // consumed by the peer layer: no player slot was created
        assert!(ctx.players.is_empty());
        assert_eq!(ctx.peer.state.read().zones[0].player_count, 3);
    }

    #[test]
    fn test_login_response_goes_out() {
        let mut ctx = test_context();
        let from = addr("5.6.7.8:1025");
        let mut pkt = vec![C2S_LOGIN];
        let mut name = [0u8; 32];
        name[..3].copy_from_slice(b"bob");
        pkt.extend_from_slice(&name);
        pkt.extend_from_slice(&[0u8; 32]);
        pkt.extend_from_slice(&40u16.to_le_bytes());
        ctx.handle_packet(from, &pkt);

        let pid = *ctx.addr_index.get(&from).unwrap();
        assert_eq!(ctx.players[pid].state, PlayerState::Loggedin);
        let sink = ctx.loopback.clone().unwrap();
        let sent = sink.sent_to_player(pid);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, vec![session::S2C_LOGIN_RESPONSE, session::LOGIN_OK]);
    }

    #[test]
    fn test_timeout_sweep_drops_idle_game_clients() {
        let mut ctx = test_context();
        let from = addr("1.1.1.1:1");
        ctx.now = Tick(0);
        let pid = session::new_player(&mut ctx, Some(from));
        ctx.now = Tick(ctx.connection_timeout_ticks + 1);
        check_timeouts(&mut ctx);
        assert_eq!(ctx.players[pid].state, PlayerState::LeavingZone);

        // chat-protocol players have no socket address and never time out here
        let cpid = session::new_player(&mut ctx, None);
        ctx.players[cpid].last_recv_tick = Tick(0);
        ctx.now = Tick(ctx.connection_timeout_ticks * 3);
        check_timeouts(&mut ctx);
        assert_eq!(ctx.players[cpid].state, PlayerState::Connected);
    }

    #[test]
    fn test_unknown_type_is_dropped_quietly() {
        let mut ctx = test_context();
        let from = addr("4.4.4.4:4");
        ctx.handle_packet(from, &[0x7F, 0xAA]);
        let sink = ctx.loopback.clone().unwrap();
        assert!(sink
            .take()
            .iter()
            .all(|p| !matches!(p.target, SentTarget::Player(_))));
    }

    #[test]
    fn test_frame_is_reentrant() {
        let mut ctx = test_context();
        ctx.run_frame();
        ctx.run_frame();
    }
}
