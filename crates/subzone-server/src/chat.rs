// chat.rs — message relay and the chat-protocol TCP listener
//
// All chat flows through one filtered-delivery primitive; the scoped send
// surfaces (player, team, arena, zone, staff) are thin adapters over it.
// Game clients get S2C chat packets; chat-protocol clients get text lines
// through a per-connection outbound queue drained by the reactor thread.
//
// The reactor is a single mio poll loop on a 100 ms tick. Line handlers
// themselves run on the main loop (posted through the work queue) so they
// can touch server state like any packet handler.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Write as _};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;

use subzone_common::sizebuf::SizeBuf;

use crate::auth::{AuthCode, AuthRequest};
use crate::capman::CAP_SEE_MOD_CHAT;
use crate::server::{Player, S2C_CHAT};
use crate::session;
use crate::sv_main::{ServerContext, WorkItem};

pub const CHAT_MAX_TEXT: usize = 250;

/// Incoming buffer cap; a full buffer with no line terminator is a
/// protocol violation and drops the connection.
const IN_BUF_CAP: usize = 1024;

/// Reactor poll tick.
const POLL_TICK: Duration = Duration::from_millis(100);

/// Idle span after which a NOOP keep-alive goes out.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Arena = 0x00,
    PublicMacro = 0x01,
    Public = 0x02,
    Team = 0x03,
    OppTeam = 0x04,
    Private = 0x05,
    Warning = 0x06,
    RemotePrivate = 0x07,
    SysopWarning = 0x08,
    Channel = 0x09,
}

impl ChatKind {
    fn label(self) -> &'static str {
        match self {
            ChatKind::Arena => "ARENA",
            ChatKind::PublicMacro => "MACRO",
            ChatKind::Public => "PUB",
            ChatKind::Team => "TEAM",
            ChatKind::OppTeam => "OPP",
            ChatKind::Private => "PRIV",
            ChatKind::Warning => "WARN",
            ChatKind::RemotePrivate => "RPRIV",
            ChatKind::SysopWarning => "SYSOP",
            ChatKind::Channel => "CHAT",
        }
    }
}

// ============================================================
// Bounded scratch formatting
// ============================================================

/// Fixed scratch buffer for composing chat lines without heap churn.
/// Overlong output is truncated, never reallocated.
pub struct ChatBuf {
    buf: [u8; 256],
    len: usize,
}

impl ChatBuf {
    pub fn new() -> Self {
        Self {
            buf: [0; 256],
            len: 0,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl Default for ChatBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for ChatBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let space = self.buf.len() - self.len;
        let mut take = s.len().min(space);
        // keep the cut on a char boundary
        while take > 0 && !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

// ============================================================
// Delivery core
// ============================================================

fn build_chat_packet(kind: ChatKind, sound: u8, from_pid: i16, text: &str) -> Vec<u8> {
    let text = truncate_text(text);
    let mut sb = SizeBuf::new(6 + text.len());
    sb.write_u8(S2C_CHAT);
    sb.write_u8(kind as u8);
    sb.write_u8(sound);
    sb.write_i16(from_pid);
    sb.write_cstr(text);
    sb.bytes().to_vec()
}

fn truncate_text(text: &str) -> &str {
    let mut end = text.len().min(CHAT_MAX_TEXT);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Deliver one message to every player passing the predicate. The single
/// delivery path both protocols share; every scoped surface calls this.
pub fn send_filtered(
    ctx: &ServerContext,
    kind: ChatKind,
    sound: u8,
    from_pid: i16,
    from_name: &str,
    text: &str,
    pred: impl Fn(&Player) -> bool,
) {
    let pkt = build_chat_packet(kind, sound, from_pid, text);
    let net = ctx.net.clone();
    let mut line: Option<String> = None;
    for player in ctx.players.iter() {
        if !player.state.accepts_chat() || !pred(player) {
            continue;
        }
        match player.chat_conn {
            Some(conn) => {
                let line = line.get_or_insert_with(|| {
                    let mut buf = ChatBuf::new();
                    let _ = write!(buf, "MSG:{}:{}:{}", kind.label(), from_name, truncate_text(text));
                    buf.as_str().to_string()
                });
                ctx.chat.shared.enqueue(conn, line.clone());
            }
            None => net.send_reliable(player.pid, &pkt),
        }
    }
}

pub fn send_to_player(ctx: &ServerContext, pid: usize, kind: ChatKind, text: &str) {
    send_filtered(ctx, kind, 0, -1, "", text, |p| p.pid == pid);
}

pub fn send_arena_message(ctx: &ServerContext, arena_id: usize, text: &str) {
    send_filtered(ctx, ChatKind::Arena, 0, -1, "", text, |p| {
        p.arena == Some(arena_id)
    });
}

pub fn send_arena_fmt(ctx: &ServerContext, arena_id: usize, args: fmt::Arguments) {
    let mut buf = ChatBuf::new();
    let _ = buf.write_fmt(args);
    send_arena_message(ctx, arena_id, buf.as_str());
}

pub fn send_team_message(
    ctx: &ServerContext,
    arena_id: usize,
    freq: u16,
    from_pid: i16,
    from_name: &str,
    text: &str,
) {
    send_filtered(ctx, ChatKind::Team, 0, from_pid, from_name, text, |p| {
        p.arena == Some(arena_id) && p.freq == freq
    });
}

/// Green zone-wide message (also what peer Chat packets turn into).
pub fn send_zone_message(ctx: &ServerContext, text: &str) {
    send_filtered(ctx, ChatKind::Arena, 0, -1, "", text, |_| true);
}

/// Staff alert: players whose group can see moderator chat.
pub fn send_mod_alert(ctx: &ServerContext, text: &str) {
    send_filtered(ctx, ChatKind::SysopWarning, 0, -1, "", text, |p| {
        ctx.caps.has_capability(&p.group, CAP_SEE_MOD_CHAT)
    });
}

/// Public chat from a player to their arena, relayed on receive.
pub fn handle_chat_packet(ctx: &mut ServerContext, pid: usize, buf: &mut SizeBuf) {
    let (Some(kind_byte), Some(sound), Some(_target)) =
        (buf.read_u8(), buf.read_u8(), buf.read_i16())
    else {
        tracing::warn!(pid, malicious = true, "short chat packet");
        return;
    };
    let Some(text) = buf.read_cstr() else {
        tracing::warn!(pid, malicious = true, "unterminated chat text");
        return;
    };
    let (arena_id, freq, name) = {
        let Some(player) = ctx.players.get(pid) else {
            return;
        };
        if !player.state.accepts_chat() {
            tracing::warn!(pid, state = ?player.state, "chat from bad state");
            return;
        }
        (player.arena, player.freq, player.name.clone())
    };
    let Some(arena_id) = arena_id else {
        return;
    };
    match kind_byte {
        k if k == ChatKind::Team as u8 => {
            send_team_message(ctx, arena_id, freq, pid as i16, &name, &text);
        }
        _ => {
            send_filtered(ctx, ChatKind::Public, sound, pid as i16, &name, &text, |p| {
                p.arena == Some(arena_id)
            });
        }
    }
}

// ============================================================
// Chat-protocol connections (shared side)
// ============================================================

pub struct ChatShared {
    /// Per-connection outbound line queues, drained by the reactor.
    out: Mutex<HashMap<usize, VecDeque<String>>>,
    pub shutdown: AtomicBool,
}

impl ChatShared {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, conn_id: usize, line: String) {
        let mut out = self.out.lock();
        if let Some(queue) = out.get_mut(&conn_id) {
            queue.push_back(line);
        }
    }

    fn open(&self, conn_id: usize) {
        self.out.lock().insert(conn_id, VecDeque::new());
    }

    fn close(&self, conn_id: usize) {
        self.out.lock().remove(&conn_id);
    }

    fn pop(&self, conn_id: usize) -> Option<String> {
        self.out.lock().get_mut(&conn_id)?.pop_front()
    }

    fn push_front(&self, conn_id: usize, line: String) {
        let mut out = self.out.lock();
        if let Some(queue) = out.get_mut(&conn_id) {
            queue.push_front(line);
        }
    }
}

impl Default for ChatShared {
    fn default() -> Self {
        Self::new()
    }
}

pub type ChatLineHandler = fn(&mut ServerContext, usize, &str);

pub struct ChatRelay {
    pub shared: Arc<ChatShared>,
    handlers: HashMap<String, ChatLineHandler>,
    /// conn id -> pid for logged-in chat clients
    conn_players: HashMap<usize, usize>,
    /// Milliseconds between outbound processing attempts per connection.
    pub message_delay_ms: u64,
}

impl ChatRelay {
    pub fn new(message_delay_ms: u64) -> Self {
        let mut relay = Self {
            shared: Arc::new(ChatShared::new()),
            handlers: HashMap::new(),
            conn_players: HashMap::new(),
            message_delay_ms,
        };
        relay.register("LOGIN", handle_login_line);
        relay.register("SEND", handle_send_line);
        relay.register("NOOP", handle_noop_line);
        relay.register("LEAVE", handle_leave_line);
        relay
    }

    pub fn register(&mut self, kind: &str, handler: ChatLineHandler) {
        self.handlers.insert(kind.to_string(), handler);
    }

    pub fn player_for_conn(&self, conn_id: usize) -> Option<usize> {
        self.conn_players.get(&conn_id).copied()
    }

    pub fn bind_conn(&mut self, conn_id: usize, pid: usize) {
        self.conn_players.insert(conn_id, pid);
    }
}

/// Split `type:rest` and run the registered handler on the main loop.
pub fn dispatch_line(ctx: &mut ServerContext, conn_id: usize, line: &str) {
    let (kind, rest) = match line.split_once(':') {
        Some((k, r)) => (k, r),
        None => (line, ""),
    };
    let handler = ctx.chat.handlers.get(&kind.to_uppercase()).copied();
    match handler {
        Some(handler) => handler(ctx, conn_id, rest),
        None => tracing::trace!(conn_id, kind, "unknown chat line type"),
    }
}

/// A connection died (reactor side); the owning player leaves the zone.
pub fn conn_closed(ctx: &mut ServerContext, conn_id: usize) {
    ctx.chat.shared.close(conn_id);
    if let Some(pid) = ctx.chat.conn_players.remove(&conn_id) {
        session::begin_leave_zone(ctx, pid);
    }
}

// ------------------------------------------------------------
// Line handlers
// ------------------------------------------------------------

/// LOGIN:version:name:password
fn handle_login_line(ctx: &mut ServerContext, conn_id: usize, rest: &str) {
    if ctx.chat.player_for_conn(conn_id).is_some() {
        ctx.chat.shared.enqueue(conn_id, "LOGINBAD:already logged in".to_string());
        return;
    }
    let mut parts = rest.splitn(3, ':');
    let _version = parts.next().unwrap_or("");
    let name = parts.next().unwrap_or("");
    let password = parts.next().unwrap_or("");

    let req = AuthRequest {
        name_bytes: name.as_bytes().to_vec(),
        password_bytes: password.as_bytes().to_vec(),
        client_version: 0,
    };
    let result = ctx.auth.authenticate(&req);
    if result.code != AuthCode::Ok {
        tracing::debug!(conn_id, name, code = ?result.code, "chat login rejected");
        ctx.chat.shared.enqueue(conn_id, "LOGINBAD:login denied".to_string());
        return;
    }

    let pid = session::new_chat_player(ctx, conn_id, &result);
    ctx.chat.bind_conn(conn_id, pid);
    let mut buf = ChatBuf::new();
    let _ = write!(buf, "LOGINOK:{}", result.send_name);
    ctx.chat.shared.enqueue(conn_id, buf.as_str().to_string());
}

/// SEND:text — zone channel chat from a chat-protocol client.
fn handle_send_line(ctx: &mut ServerContext, conn_id: usize, rest: &str) {
    let Some(pid) = ctx.chat.player_for_conn(conn_id) else {
        ctx.chat.shared.enqueue(conn_id, "BAD:not logged in".to_string());
        return;
    };
    let name = ctx
        .players
        .get(pid)
        .map(|p| p.name.clone())
        .unwrap_or_default();
    send_filtered(ctx, ChatKind::Channel, 0, pid as i16, &name, rest, |_| true);
}

fn handle_noop_line(_ctx: &mut ServerContext, _conn_id: usize, _rest: &str) {}

fn handle_leave_line(ctx: &mut ServerContext, conn_id: usize, _rest: &str) {
    conn_closed(ctx, conn_id);
}

// ============================================================
// Reactor thread
// ============================================================

struct Conn {
    socket: TcpStream,
    in_buf: Vec<u8>,
    last_send: Instant,
    last_recv: Instant,
    last_processed: Instant,
}

/// Run the chat TCP reactor until shutdown. Accepts connections, frames
/// lines, posts them to the main loop, and drains outbound queues under
/// the per-connection message delay.
pub fn spawn_chat_reactor(
    listener: std::net::TcpListener,
    shared: Arc<ChatShared>,
    work_tx: Sender<WorkItem>,
    message_delay_ms: u64,
) -> std::io::Result<thread::JoinHandle<()>> {
    listener.set_nonblocking(true)?;
    let mut listener = TcpListener::from_std(listener);
    thread::Builder::new().name("chat-reactor".to_string()).spawn(move || {
        const LISTENER: Token = Token(0);
        let mut poll = match Poll::new() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "chat reactor poll create failed");
                return;
            }
        };
        if let Err(e) = poll
            .registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
        {
            tracing::error!(error = %e, "chat reactor register failed");
            return;
        }

        let mut events = Events::with_capacity(64);
        let mut conns: HashMap<usize, Conn> = HashMap::new();
        let mut next_token = 1usize;
        let delay = Duration::from_millis(message_delay_ms);

        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = poll.poll(&mut events, Some(POLL_TICK)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "chat reactor poll failed");
                break;
            }

            let mut dead: Vec<usize> = Vec::new();
            for event in events.iter() {
                match event.token() {
                    LISTENER => loop {
                        match listener.accept() {
                            Ok((mut socket, addr)) => {
                                let id = next_token;
                                next_token += 1;
                                if poll
                                    .registry()
                                    .register(
                                        &mut socket,
                                        Token(id),
                                        Interest::READABLE | Interest::WRITABLE,
                                    )
                                    .is_err()
                                {
                                    continue;
                                }
                                tracing::debug!(conn_id = id, %addr, "chat client connected");
                                shared.open(id);
                                let now = Instant::now();
                                conns.insert(
                                    id,
                                    Conn {
                                        socket,
                                        in_buf: Vec::new(),
                                        last_send: now,
                                        last_recv: now,
                                        last_processed: now,
                                    },
                                );
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                            Err(_) => break,
                        }
                    },
                    Token(id) => {
                        if event.is_readable() {
                            if let Some(conn) = conns.get_mut(&id) {
                                if read_conn(id, conn, &work_tx) {
                                    dead.push(id);
                                }
                            }
                        }
                    }
                }
            }

            // outbound flush and keep-alive on the tick
            let now = Instant::now();
            for (&id, conn) in conns.iter_mut() {
                if now.duration_since(conn.last_processed) >= delay {
                    if let Some(line) = shared.pop(id) {
                        conn.last_processed = now;
                        match write_line(conn, &line) {
                            Ok(()) => {}
                            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                                shared.push_front(id, line);
                            }
                            Err(_) => {
                                dead.push(id);
                                continue;
                            }
                        }
                    }
                }
                if now.duration_since(conn.last_send) > KEEPALIVE_IDLE
                    && now.duration_since(conn.last_processed) > KEEPALIVE_IDLE
                {
                    if let Err(e) = write_line(conn, "NOOP") {
                        if e.kind() != ErrorKind::WouldBlock {
                            dead.push(id);
                        }
                    }
                }
            }

            dead.sort_unstable();
            dead.dedup();
            for id in dead {
                if let Some(mut conn) = conns.remove(&id) {
                    let _ = poll.registry().deregister(&mut conn.socket);
                }
                shared.close(id);
                let closed: WorkItem = Box::new(move |ctx: &mut ServerContext| {
                    conn_closed(ctx, id);
                });
                if work_tx.send(closed).is_err() {
                    return;
                }
            }
        }
    })
}

/// Drain readable bytes; returns true when the connection should close.
fn read_conn(id: usize, conn: &mut Conn, work_tx: &Sender<WorkItem>) -> bool {
    let mut chunk = [0u8; 512];
    loop {
        match conn.socket.read(&mut chunk) {
            Ok(0) => return true,
            Ok(n) => {
                conn.last_recv = Instant::now();
                conn.in_buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return true,
        }
    }
    for line in extract_lines(&mut conn.in_buf) {
        let item: WorkItem = Box::new(move |ctx: &mut ServerContext| {
            dispatch_line(ctx, id, &line);
        });
        if work_tx.send(item).is_err() {
            return true;
        }
    }
    // a full buffer holding no complete line is hostile or broken
    conn.in_buf.len() >= IN_BUF_CAP
}

fn write_line(conn: &mut Conn, line: &str) -> std::io::Result<()> {
    conn.socket.write_all(line.as_bytes())?;
    conn.socket.write_all(b"\n")?;
    conn.last_send = Instant::now();
    Ok(())
}

/// Pull complete CR/LF-terminated lines out of the buffer, leaving any
/// partial trailing line in place.
pub fn extract_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    let mut start = 0;
    for i in 0..buf.len() {
        if buf[i] == b'\r' || buf[i] == b'\n' {
            if i > start {
                lines.push(String::from_utf8_lossy(&buf[start..i]).into_owned());
            }
            start = i + 1;
        }
    }
    buf.drain(..start);
    lines
}
