// server.rs — core server types and constants

use std::net::SocketAddr;

use subzone_common::tick::Tick;

use crate::ext::ExtData;

// ============================================================
// Constants
// ============================================================

/// Player names carry at most 23 characters on the wire.
pub const MAX_NAME_LEN: usize = 23;
pub const MAX_SQUAD_LEN: usize = 23;

/// Active bricks allowed per arena.
pub const MAX_BRICKS: usize = 256;

/// Ticks a session lingers in TimeWait before the slot is reclaimed.
pub const TIMEWAIT_TICKS: u32 = 200;

/// Ticks an arena may sit on unreleased holds before it is torn down.
pub const HOLD_TIMEOUT_TICKS: u32 = 1500;

// Game packet types handled by the core.
pub const C2S_GO_ARENA: u8 = 0x01;
pub const C2S_LEAVE_ARENA: u8 = 0x02;
pub const C2S_POSITION: u8 = 0x03;
pub const C2S_CHAT: u8 = 0x06;
pub const C2S_LOGIN: u8 = 0x09;
pub const C2S_REBROADCAST: u8 = 0x0A;
pub const C2S_BRICK: u8 = 0x1C;

pub const S2C_CHAT: u8 = 0x07;
pub const S2C_BRICK: u8 = 0x21;
pub const S2C_TOGGLE_LVZ: u8 = 0x35;
pub const S2C_CHANGE_LVZ: u8 = 0x36;

// ============================================================
// Session state
// ============================================================

/// Connection state of a player slot. Which operations are valid is gated
/// on this; gameplay traffic only flows at `Playing`, reliable chat is
/// allowed from `Connected` on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PlayerState {
    #[default]
    Uninitialized,
    Connected,
    NeedAuth,
    Loggedin,
    DoFreqAndArenaSync,
    WaitArenaSync1,
    ArenaRespAndCBS,
    Playing,
    LeavingArena,
    LeavingZone,
    TimeWait,
}

impl PlayerState {
    #[inline]
    pub fn is_free(self) -> bool {
        self == PlayerState::Uninitialized
    }

    /// Reliable chat delivery is allowed from Connected on, but never to a
    /// slot already on its way out.
    #[inline]
    pub fn accepts_chat(self) -> bool {
        self >= PlayerState::Connected && self < PlayerState::LeavingZone
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShipType {
    Warbird = 0,
    Javelin = 1,
    Spider = 2,
    Leviathan = 3,
    Terrier = 4,
    Weasel = 5,
    Lancaster = 6,
    Shark = 7,
    #[default]
    Spec = 8,
}

/// Last position snapshot from a 0x03 packet. Rotation is in 40ths of a
/// circle; `last_rotation_cw` remembers which way the ship last turned,
/// which breaks ties in the brick axis decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayerPosition {
    pub x: i16,
    pub y: i16,
    pub rotation: u8,
    pub last_rotation_cw: bool,
}

/// Cached LVZ rebroadcast permission, resolved from the player's group when
/// they enter an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LvzPermission {
    #[default]
    None,
    /// toggle/change packet types only
    Bot,
    /// any packet type
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupSource {
    #[default]
    Default,
    Arena,
    ArenaList,
    Global,
    Temporary,
}

// ============================================================
// Player
// ============================================================

pub struct Player {
    pub pid: usize,
    /// Opaque 16-byte identity assigned at accept.
    pub session_id: [u8; 16],
    pub state: PlayerState,
    /// Name as the client sent it (what we echo back); empty until login.
    pub name: String,
    pub squad: String,
    pub authenticated: bool,
    pub group: String,
    pub group_source: GroupSource,
    pub lvz_permission: LvzPermission,
    pub arena: Option<usize>,
    /// Arena requested in a go-arena packet, pending assignment.
    pub requested_arena: Option<String>,
    pub ship: ShipType,
    pub freq: u16,
    pub pos: PlayerPosition,
    /// Game-protocol remote address; chat-protocol clients have none.
    pub addr: Option<SocketAddr>,
    /// Chat-protocol connection id for chat-only clients.
    pub chat_conn: Option<usize>,
    pub connect_tick: Tick,
    pub last_recv_tick: Tick,
    /// Set when the slot enters TimeWait.
    pub leave_tick: Option<Tick>,
    /// A zone-leave is pending once the arena detach finishes.
    pub leaving_zone: bool,
    pub ext: ExtData,
}

impl Player {
    pub fn new(pid: usize, ext: ExtData) -> Self {
        Self {
            pid,
            session_id: [0; 16],
            state: PlayerState::Uninitialized,
            name: String::new(),
            squad: String::new(),
            authenticated: false,
            group: "default".to_string(),
            group_source: GroupSource::Default,
            lvz_permission: LvzPermission::None,
            arena: None,
            requested_arena: None,
            ship: ShipType::Spec,
            freq: 0,
            pos: PlayerPosition::default(),
            addr: None,
            chat_conn: None,
            connect_tick: Tick::ZERO,
            last_recv_tick: Tick::ZERO,
            leave_tick: None,
            leaving_zone: false,
            ext,
        }
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.state == PlayerState::Playing
    }

    /// Reset a slot for reuse, keeping the pid and the (cleared) slot table.
    pub fn recycle(&mut self) {
        self.session_id = [0; 16];
        self.state = PlayerState::Uninitialized;
        self.name.clear();
        self.squad.clear();
        self.authenticated = false;
        self.group = "default".to_string();
        self.group_source = GroupSource::Default;
        self.lvz_permission = LvzPermission::None;
        self.arena = None;
        self.requested_arena = None;
        self.ship = ShipType::Spec;
        self.freq = 0;
        self.pos = PlayerPosition::default();
        self.addr = None;
        self.chat_conn = None;
        self.leave_tick = None;
        self.leaving_zone = false;
        self.ext.clear();
    }
}
