// peer.rs — zone-to-zone federation
//
// Peer zones are independent server instances sharing one UDP socket with
// the game protocol; their packets are picked out by the 0x00/0x01/0xFF
// magic bytes before game dispatch. Zones exchange arena rosters, player
// counts, and chat. Everything here runs on the main loop; the state sits
// behind an upgradable lock so enumeration (find-player, population) never
// blocks on itself.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;

use subzone_common::conf::ConfDocument;
use subzone_common::crc::peer_password_hash;
use subzone_common::sizebuf::SizeBuf;
use subzone_common::tick::Tick;

use crate::chat;
use crate::sv_main::ServerContext;

pub const PEER_HEADER_LEN: usize = 12;

/// Send rosters/counts every second.
const SEND_INTERVAL_TICKS: u32 = 100;
/// Sweep for stale arenas every ten seconds.
const EVICT_INTERVAL_TICKS: u32 = 1000;
/// Evict arenas not refreshed within thirty seconds.
const ARENA_STALE_TICKS: u32 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPacketType {
    PlayerList = 1,
    Chat = 2,
    Op = 3,
    PlayerCount = 4,
}

impl PeerPacketType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PeerPacketType::PlayerList),
            2 => Some(PeerPacketType::Chat),
            3 => Some(PeerPacketType::Op),
            4 => Some(PeerPacketType::PlayerCount),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PeerPolicy: u8 {
        const SEND_ONLY = 0x01;
        const SEND_PLAYER_LIST = 0x02;
        const SEND_ZERO_PLAYER_COUNT = 0x04;
        const SEND_MESSAGES = 0x08;
        const RECEIVE_MESSAGES = 0x10;
        const INCLUDE_IN_POPULATION = 0x20;
        const PROVIDES_DEFAULT_ARENAS = 0x40;
    }
}

#[derive(Debug, Clone)]
pub struct RenameEntry {
    pub local: String,
    pub remote: String,
    /// Local and remote spellings differ only in case.
    pub is_case_change: bool,
}

#[derive(Debug, Clone)]
pub struct PeerArena {
    pub id: u32,
    pub name: String,
    pub players: Vec<String>,
    pub last_update: Tick,
}

pub struct PeerZone {
    pub addr: SocketAddr,
    pub password_hash: u32,
    pub policy: PeerPolicy,
    /// Local arenas advertised to this zone.
    pub cfg_arenas: Vec<String>,
    /// Arenas whose roster is replaced by a single ":name" dummy entry.
    pub dummy_arenas: HashSet<String>,
    /// Arena names of other zones this zone receives relayed.
    pub relay_arenas: HashSet<String>,
    pub renames: Vec<RenameEntry>,
    pub arenas: Vec<PeerArena>,
    pub player_count: u16,
    timestamps: [u32; 256],
}

impl PeerZone {
    /// Replay check against the 256-slot timestamp ring; returns true for
    /// a packet we have not seen. A fresh timestamp that collides with a
    /// stored one mod 256 evicts it, so this conflates replay detection
    /// with slot collisions. TODO: review the collision behavior.
    fn note_timestamp(&mut self, ts: u32) -> bool {
        let slot = (ts & 0xFF) as usize;
        if self.timestamps[slot] == ts {
            return false;
        }
        self.timestamps[slot] = ts;
        true
    }

    /// Map a remote arena name through the rename table. None means the
    /// arena is skipped entirely (a true rename target exists); a pure
    /// case change adopts the local spelling.
    fn resolve_remote_name(&self, remote: &str) -> Option<String> {
        for entry in &self.renames {
            if entry.remote.eq_ignore_ascii_case(remote) || entry.local.eq_ignore_ascii_case(remote)
            {
                if entry.is_case_change {
                    return Some(entry.local.clone());
                }
                return None;
            }
        }
        Some(remote.to_string())
    }
}

#[derive(Default)]
pub struct PeerState {
    pub zones: Vec<PeerZone>,
}

impl PeerState {
    fn zone_index(&self, addr: &SocketAddr) -> Option<usize> {
        self.zones
            .iter()
            .position(|z| z.addr.ip() == addr.ip() && z.addr.port() == addr.port())
    }
}

pub struct PeerContext {
    pub state: Arc<RwLock<PeerState>>,
    last_send: Tick,
    last_evict: Tick,
}

impl PeerContext {
    pub fn new(zones: Vec<PeerZone>) -> Self {
        Self {
            state: Arc::new(RwLock::new(PeerState { zones })),
            last_send: Tick::ZERO,
            last_evict: Tick::ZERO,
        }
    }
}

// ============================================================
// Configuration scan
// ============================================================

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split([',', ':', ' '])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Scan [Peer0] .. [Peer254]; the first section with an empty Address ends
/// the scan.
pub fn load_zones(cfg: &ConfDocument) -> Vec<PeerZone> {
    let mut zones = Vec::new();
    for n in 0..=254u32 {
        let section = format!("Peer{}", n);
        let Some(address) = cfg.get_str(&section, "Address") else {
            break;
        };
        if address.is_empty() {
            break;
        }
        let port = cfg.get_int(&section, "Port", 0);
        let Ok(ip) = address.parse::<std::net::IpAddr>() else {
            tracing::warn!(section = %section, address = %address, "unparseable peer address");
            continue;
        };
        let addr = SocketAddr::new(ip, port as u16);

        let mut policy = PeerPolicy::empty();
        let mut set = |flag, key, default| {
            if cfg.get_bool(&section, key, default) {
                policy |= flag;
            }
        };
        set(PeerPolicy::SEND_ONLY, "SendOnly", false);
        set(PeerPolicy::SEND_PLAYER_LIST, "SendPlayerList", false);
        set(PeerPolicy::SEND_ZERO_PLAYER_COUNT, "SendZeroPlayerCount", false);
        set(PeerPolicy::SEND_MESSAGES, "SendMessages", false);
        set(PeerPolicy::RECEIVE_MESSAGES, "ReceiveMessages", false);
        set(PeerPolicy::INCLUDE_IN_POPULATION, "IncludeInPopulation", false);
        set(PeerPolicy::PROVIDES_DEFAULT_ARENAS, "ProvidesDefaultArenas", false);

        let renames = split_list(cfg.get_str(&section, "RenameArenas"))
            .into_iter()
            .filter_map(|pair| {
                let (local, remote) = pair.split_once('=')?;
                let (local, remote) = (local.trim().to_string(), remote.trim().to_string());
                let is_case_change = local.eq_ignore_ascii_case(&remote);
                Some(RenameEntry {
                    local,
                    remote,
                    is_case_change,
                })
            })
            .collect();

        zones.push(PeerZone {
            addr,
            password_hash: peer_password_hash(cfg.get_str(&section, "Password").unwrap_or("")),
            policy,
            cfg_arenas: split_list(cfg.get_str(&section, "Arenas")),
            dummy_arenas: split_list(cfg.get_str(&section, "SendDummyArenas"))
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            relay_arenas: split_list(cfg.get_str(&section, "RelayArenas"))
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            renames,
            arenas: Vec::new(),
            player_count: 0,
            timestamps: [0; 256],
        });
    }
    zones
}

// ============================================================
// Wire
// ============================================================

pub fn is_peer_packet(bytes: &[u8]) -> bool {
    bytes.len() >= PEER_HEADER_LEN && bytes[0] == 0x00 && bytes[1] == 0x01 && bytes[6] == 0xFF
}

fn build_packet(password_hash: u32, ptype: PeerPacketType, ts: Tick, payload: &[u8]) -> Vec<u8> {
    let mut sb = SizeBuf::new(PEER_HEADER_LEN + payload.len());
    sb.write_u8(0x00);
    sb.write_u8(0x01);
    sb.write_u32(password_hash);
    sb.write_u8(0xFF);
    sb.write_u8(ptype as u8);
    sb.write_u32(ts.0);
    sb.write_bytes(payload);
    sb.bytes().to_vec()
}

// ============================================================
// Receive path
// ============================================================

enum InboundMessage {
    Zone(String),
    Op(String),
}

pub fn handle_peer_packet(ctx: &mut ServerContext, from: SocketAddr, bytes: &[u8]) {
    let now = ctx.now;
    let mut sb = SizeBuf::from_bytes(bytes);
    let _ = sb.read_u8();
    let _ = sb.read_u8();
    let hash = sb.read_u32().unwrap_or(0);
    let _ = sb.read_u8();
    let Some(ptype) = sb.read_u8().and_then(PeerPacketType::from_u8) else {
        tracing::trace!(%from, "peer packet with unknown type");
        return;
    };
    let ts = sb.read_u32().unwrap_or(0);

    let state = Arc::clone(&ctx.peer.state);
    let message = {
        let guard = state.upgradable_read();
        let Some(idx) = guard.zone_index(&from) else {
            tracing::trace!(%from, "packet from unconfigured peer");
            return;
        };
        if guard.zones[idx].password_hash != hash {
            tracing::warn!(%from, malicious = true, "peer password mismatch");
            return;
        }
        if guard.zones[idx].policy.contains(PeerPolicy::SEND_ONLY) {
            tracing::trace!(%from, "dropping packet from send-only peer");
            return;
        }

        let mut guard = parking_lot::RwLockUpgradableReadGuard::upgrade(guard);
        let zone = &mut guard.zones[idx];
        if !zone.note_timestamp(ts) {
            return;
        }

        match ptype {
            PeerPacketType::PlayerList => {
                parse_player_list(zone, &mut sb, now);
                None
            }
            PeerPacketType::PlayerCount => {
                if let Some(count) = sb.read_u16() {
                    zone.player_count = count;
                    zone.arenas.clear();
                }
                None
            }
            PeerPacketType::Chat | PeerPacketType::Op => {
                if !zone.policy.contains(PeerPolicy::RECEIVE_MESSAGES) {
                    return;
                }
                let _msg_type = sb.read_u8();
                let Some(text) = sb.read_cstr() else {
                    tracing::warn!(%from, malicious = true, "unterminated peer message");
                    return;
                };
                if ptype == PeerPacketType::Chat {
                    Some(InboundMessage::Zone(text))
                } else {
                    Some(InboundMessage::Op(text))
                }
            }
        }
    };

    match message {
        Some(InboundMessage::Zone(text)) => {
            chat::send_zone_message(ctx, &text);
        }
        Some(InboundMessage::Op(text)) => {
            // the composed alert is informational only; recipients get the
            // message exactly as the peer sent it
            let alert = format!("peer op from {}: {}", from, text);
            tracing::debug!(%alert, "peer moderator alert");
            chat::send_mod_alert(ctx, &text);
        }
        None => {}
    }
}

fn parse_player_list(zone: &mut PeerZone, sb: &mut SizeBuf, now: Tick) {
    while sb.remaining() > 0 {
        let Some(arena_id) = sb.read_u32() else {
            return;
        };
        let Some(raw_name) = sb.read_cstr() else {
            return;
        };
        let remote_name = raw_name.to_lowercase();

        let mut players = Vec::new();
        loop {
            let Some(player) = sb.read_cstr() else {
                return;
            };
            if player.is_empty() {
                break;
            }
            players.push(player);
        }

        let Some(name) = zone.resolve_remote_name(&remote_name) else {
            continue;
        };

        match zone
            .arenas
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(&name))
        {
            Some(arena) => {
                arena.id = arena_id;
                arena.players = players;
                arena.last_update = now;
            }
            None => zone.arenas.push(PeerArena {
                id: arena_id,
                name,
                players,
                last_update: now,
            }),
        }
    }
}

// ============================================================
// Send path and timers
// ============================================================

pub fn run_timers(ctx: &mut ServerContext) {
    let now = ctx.now;
    if now.diff(ctx.peer.last_send) >= SEND_INTERVAL_TICKS as i32 {
        ctx.peer.last_send = now;
        send_updates(ctx);
    }
    if now.diff(ctx.peer.last_evict) >= EVICT_INTERVAL_TICKS as i32 {
        ctx.peer.last_evict = now;
        evict_stale_arenas(ctx);
    }
}

fn evict_stale_arenas(ctx: &mut ServerContext) {
    let now = ctx.now;
    let mut state = ctx.peer.state.write();
    for zone in &mut state.zones {
        zone.arenas
            .retain(|a| now.diff(a.last_update) <= ARENA_STALE_TICKS as i32);
    }
}

/// Local arena rosters, as (registry id, name, playing players).
fn local_rosters(ctx: &ServerContext) -> Vec<(u32, String, Vec<String>)> {
    let mut out: Vec<(u32, String, Vec<String>)> = ctx
        .arenas
        .iter()
        .map(|a| (a.id as u32, a.name.clone(), Vec::new()))
        .collect();
    for player in ctx.players.iter() {
        if !player.is_playing() {
            continue;
        }
        if let Some(arena_id) = player.arena {
            if let Some(entry) = out.iter_mut().find(|(id, _, _)| *id == arena_id as u32) {
                entry.2.push(player.name.clone());
            }
        }
    }
    out
}

pub fn send_updates(ctx: &mut ServerContext) {
    let now = ctx.now;
    let rosters = local_rosters(ctx);
    let total_players: usize = rosters.iter().map(|(_, _, p)| p.len()).sum();
    let net = ctx.net.clone();

    let state = ctx.peer.state.read();
    for zone in &state.zones {
        let pkt = if zone.policy.contains(PeerPolicy::SEND_PLAYER_LIST) {
            let mut payload = SizeBuf::new(16 * 1024);
            for (id, name, players) in &rosters {
                if !zone
                    .cfg_arenas
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(name))
                {
                    continue;
                }
                write_roster_group(&mut payload, *id, name, players, &zone.dummy_arenas);
            }
            // arenas of other zones this zone relays
            for other in &state.zones {
                if std::ptr::eq(other, zone) {
                    continue;
                }
                for arena in &other.arenas {
                    if zone.relay_arenas.contains(&arena.name.to_lowercase()) {
                        write_roster_group(
                            &mut payload,
                            arena.id,
                            &arena.name,
                            &arena.players,
                            &zone.dummy_arenas,
                        );
                    }
                }
            }
            build_packet(
                zone.password_hash,
                PeerPacketType::PlayerList,
                now,
                payload.bytes(),
            )
        } else {
            let count = if zone.policy.contains(PeerPolicy::SEND_ZERO_PLAYER_COUNT) {
                0u16
            } else {
                total_players.min(u16::MAX as usize) as u16
            };
            build_packet(
                zone.password_hash,
                PeerPacketType::PlayerCount,
                now,
                &count.to_le_bytes(),
            )
        };
        net.send_raw(zone.addr, &pkt);
    }
}

fn write_roster_group(
    sb: &mut SizeBuf,
    id: u32,
    name: &str,
    players: &[String],
    dummy: &HashSet<String>,
) {
    sb.write_u32(id);
    sb.write_cstr(name);
    if dummy.contains(&name.to_lowercase()) {
        // the ':' prefix is never a valid real name
        sb.write_cstr(&format!(":{}", name));
    } else {
        for player in players {
            sb.write_cstr(player);
        }
    }
    sb.write_u8(0);
}

/// Send a zone or moderator message to every peer configured to take them.
pub fn send_message_to_peers(ctx: &mut ServerContext, op: bool, text: &str) {
    let now = ctx.now;
    let net = ctx.net.clone();
    let ptype = if op {
        PeerPacketType::Op
    } else {
        PeerPacketType::Chat
    };
    let state = ctx.peer.state.read();
    for zone in &state.zones {
        if !zone.policy.contains(PeerPolicy::SEND_MESSAGES) {
            continue;
        }
        let mut payload = SizeBuf::new(2 + text.len());
        payload.write_u8(0);
        payload.write_cstr(text);
        let pkt = build_packet(zone.password_hash, ptype, now, payload.bytes());
        net.send_raw(zone.addr, &pkt);
    }
}

// ============================================================
// Queries
// ============================================================

/// Best substring match across every peer roster. Exact (case-insensitive)
/// matches score -1 and win immediately; otherwise the lowest substring
/// position wins.
pub fn find_player(ctx: &ServerContext, target: &str) -> Option<(String, String, i32)> {
    let needle = target.to_lowercase();
    if needle.is_empty() {
        return None;
    }
    let state = ctx.peer.state.read();
    let mut best: Option<(String, String, i32)> = None;
    for zone in &state.zones {
        for arena in &zone.arenas {
            for player in &arena.players {
                if player.eq_ignore_ascii_case(target) {
                    return Some((player.clone(), arena.name.clone(), -1));
                }
                if let Some(pos) = player.to_lowercase().find(&needle) {
                    let score = pos as i32;
                    if best.as_ref().map(|(_, _, s)| score < *s).unwrap_or(true) {
                        best = Some((player.clone(), arena.name.clone(), score));
                    }
                }
            }
        }
    }
    best
}

/// Player count contributed by peers configured into the zone population.
pub fn peer_population(ctx: &ServerContext) -> u32 {
    let state = ctx.peer.state.read();
    state
        .zones
        .iter()
        .filter(|z| z.policy.contains(PeerPolicy::INCLUDE_IN_POPULATION))
        .map(|z| z.player_count as u32)
        .sum()
}

pub fn find_zone(ctx: &ServerContext, addr: &SocketAddr) -> bool {
    ctx.peer.state.read().zone_index(addr).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SentTarget;
    use crate::sv_main::test_context_with_global;

    const PEER_CONF: &str = "\
[Peer0]
Address = 10.0.0.1
Port = 5000
Password = secret
SendPlayerList = 1
ReceiveMessages = 1
Arenas = duel, elim
SendDummyArenas = elim
RelayArenas = turf
[Peer1]
Address = 10.0.0.2
Port = 5001
Password = other
SendOnly = 1
[Peer2]
Address =
Port = 9999
[Peer3]
Address = 10.0.0.9
Port = 1
";

    fn peer_addr() -> SocketAddr {
        "10.0.0.1:5000".parse().unwrap()
    }

    fn ctx() -> crate::sv_main::ServerContext {
        test_context_with_global(PEER_CONF)
    }

    fn player_list_packet(hash: u32, ts: u32, arenas: &[(u32, &str, &[&str])]) -> Vec<u8> {
        let mut payload = SizeBuf::new(4096);
        for &(id, name, players) in arenas {
            payload.write_u32(id);
            payload.write_cstr(name);
            for p in players {
                payload.write_cstr(p);
            }
            payload.write_u8(0);
        }
        build_packet(hash, PeerPacketType::PlayerList, Tick(ts), payload.bytes())
    }

    #[test]
    fn test_config_scan_stops_at_empty_address() {
        let doc = ConfDocument::parse(PEER_CONF);
        let zones = load_zones(&doc);
        // Peer2 has an empty Address: the scan stops before Peer3
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].addr, peer_addr());
        assert!(zones[0].policy.contains(PeerPolicy::SEND_PLAYER_LIST));
        assert!(zones[1].policy.contains(PeerPolicy::SEND_ONLY));
        assert_eq!(zones[0].password_hash, peer_password_hash("secret"));
        assert!(zones[0].dummy_arenas.contains("elim"));
    }

    #[test]
    fn test_magic_detection() {
        let pkt = build_packet(1, PeerPacketType::PlayerCount, Tick(5), &[0, 0]);
        assert!(is_peer_packet(&pkt));
        assert!(!is_peer_packet(&[0x00, 0x01, 0, 0, 0, 0, 0xFE, 1, 0, 0, 0, 0]));
        assert!(!is_peer_packet(&[0x00, 0x01, 0xFF]));
    }

    #[test]
    fn test_player_list_round_trip_and_find() {
        let mut c = ctx();
        c.now = Tick(100);
        let hash = peer_password_hash("secret");
        let pkt = player_list_packet(hash, 42, &[(7, "duel", &["alice", "bob"])]);
        handle_peer_packet(&mut c, peer_addr(), &pkt);

        {
            let state = c.peer.state.read();
            let zone = &state.zones[0];
            assert_eq!(zone.arenas.len(), 1);
            assert_eq!(zone.arenas[0].name, "duel");
            assert_eq!(zone.arenas[0].players, vec!["alice", "bob"]);
        }

        let (player, arena, score) = find_player(&c, "ali").unwrap();
        assert_eq!((player.as_str(), arena.as_str(), score), ("alice", "duel", 0));
        let (player, _, score) = find_player(&c, "ALICE").unwrap();
        assert_eq!((player.as_str(), score), ("alice", -1));
        assert!(find_player(&c, "zelda").is_none());
    }

    #[test]
    fn test_duplicate_timestamp_is_idempotent() {
        let mut c = ctx();
        c.now = Tick(100);
        let hash = peer_password_hash("secret");
        let pkt = player_list_packet(hash, 42, &[(7, "duel", &["alice"])]);
        handle_peer_packet(&mut c, peer_addr(), &pkt);
        // second copy replays the same timestamp: dropped
        let pkt2 = player_list_packet(hash, 42, &[(7, "duel", &["alice", "mallory"])]);
        handle_peer_packet(&mut c, peer_addr(), &pkt2);
        let state = c.peer.state.read();
        assert_eq!(state.zones[0].arenas[0].players, vec!["alice"]);
    }

    #[test]
    fn test_bad_hash_and_unknown_sender_rejected() {
        let mut c = ctx();
        let pkt = player_list_packet(0xBAD, 42, &[(7, "duel", &["alice"])]);
        handle_peer_packet(&mut c, peer_addr(), &pkt);
        assert!(c.peer.state.read().zones[0].arenas.is_empty());

        let good = player_list_packet(peer_password_hash("secret"), 43, &[(7, "duel", &["alice"])]);
        handle_peer_packet(&mut c, "9.9.9.9:1".parse().unwrap(), &good);
        assert!(c.peer.state.read().zones[0].arenas.is_empty());
    }

    #[test]
    fn test_send_only_zone_ignored() {
        let mut c = ctx();
        let pkt = player_list_packet(peer_password_hash("other"), 42, &[(7, "duel", &["alice"])]);
        handle_peer_packet(&mut c, "10.0.0.2:5001".parse().unwrap(), &pkt);
        assert!(c.peer.state.read().zones[1].arenas.is_empty());
    }

    #[test]
    fn test_player_count_clears_arenas() {
        let mut c = ctx();
        c.now = Tick(100);
        let hash = peer_password_hash("secret");
        handle_peer_packet(
            &mut c,
            peer_addr(),
            &player_list_packet(hash, 42, &[(7, "duel", &["alice"])]),
        );
        let count_pkt = build_packet(hash, PeerPacketType::PlayerCount, Tick(43), &55u16.to_le_bytes());
        handle_peer_packet(&mut c, peer_addr(), &count_pkt);
        let state = c.peer.state.read();
        assert_eq!(state.zones[0].player_count, 55);
        assert!(state.zones[0].arenas.is_empty());
    }

    #[test]
    fn test_rename_case_change_and_skip() {
        let conf = "\
[Peer0]
Address = 10.0.0.1
Port = 5000
Password = secret
RenameArenas = Duel=duel, mirror=reflect
";
        let mut c = test_context_with_global(conf);
        c.now = Tick(10);
        let hash = peer_password_hash("secret");
        let pkt = player_list_packet(hash, 1, &[(1, "DUEL", &["a"]), (2, "reflect", &["b"])]);
        handle_peer_packet(&mut c, peer_addr(), &pkt);
        let state = c.peer.state.read();
        let names: Vec<&str> = state.zones[0].arenas.iter().map(|a| a.name.as_str()).collect();
        // case change adopts the local spelling; the true rename is skipped
        assert_eq!(names, vec!["Duel"]);
    }

    #[test]
    fn test_stale_arena_eviction() {
        let mut c = ctx();
        c.now = Tick(100);
        let hash = peer_password_hash("secret");
        handle_peer_packet(
            &mut c,
            peer_addr(),
            &player_list_packet(hash, 1, &[(1, "duel", &["a"])]),
        );
        c.now = Tick(100 + ARENA_STALE_TICKS + EVICT_INTERVAL_TICKS + 1);
        run_timers(&mut c);
        assert!(c.peer.state.read().zones[0].arenas.is_empty());
    }

    #[test]
    fn test_send_updates_dummy_and_count() {
        let mut c = ctx();
        c.now = Tick(500);
        // a local arena this zone advertises
        let aid = crate::arena::find_or_create_arena(&mut c, "elim");
        let pid = crate::session::new_player(&mut c, None);
        {
            let p = c.players.get_mut(pid).unwrap();
            p.arena = Some(aid);
            p.state = crate::server::PlayerState::Playing;
            p.name = "carol".to_string();
        }
        let sink = c.loopback.clone().unwrap();
        sink.take();
        send_updates(&mut c);
        let sent = sink.take();
        // one packet per zone
        assert_eq!(sent.len(), 2);
        let to_zone0 = sent
            .iter()
            .find(|p| p.target == SentTarget::Addr(peer_addr()))
            .unwrap();
        assert!(is_peer_packet(&to_zone0.data));
        assert_eq!(to_zone0.data[7], PeerPacketType::PlayerList as u8);
        // elim is a dummy arena: the roster is the single ":elim" entry
        let mut sb = SizeBuf::from_bytes(&to_zone0.data[PEER_HEADER_LEN..]);
        assert_eq!(sb.read_u32(), Some(aid as u32));
        assert_eq!(sb.read_cstr().as_deref(), Some("elim"));
        assert_eq!(sb.read_cstr().as_deref(), Some(":elim"));
        // zone 1 gets a count packet
        let to_zone1 = sent
            .iter()
            .find(|p| p.target == SentTarget::Addr("10.0.0.2:5001".parse().unwrap()))
            .unwrap();
        assert_eq!(to_zone1.data[7], PeerPacketType::PlayerCount as u8);
    }
}
