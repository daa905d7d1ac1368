// net.rs — transport seam
//
// The reliable-UDP layer lives outside the core. The core only needs a way
// to push bytes at a player (reliably or not) or at a raw address (the peer
// wire has no game framing). The sink implementation is registered at
// startup; tests use the loopback sink, which records everything it is
// handed.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};

use parking_lot::Mutex;

/// Largest game packet a client accepts.
pub const MAX_PACKET: usize = 512;
/// Bytes of reliable-transport framing prepended outside the core.
pub const RELIABLE_HEADER: usize = 6;
/// Per-client cap on LVZ toggle/change packets.
pub const MAX_LVZ_PACKET: usize = 2048;

pub trait PacketSink: Send + Sync {
    /// Queue `data` for reliable delivery to a player.
    fn send_reliable(&self, pid: usize, data: &[u8]);
    /// Send `data` best-effort to a player.
    fn send_unreliable(&self, pid: usize, data: &[u8]);
    /// Send a raw datagram with no game framing (peer wire).
    fn send_raw(&self, addr: SocketAddr, data: &[u8]);
    /// Bind a player id to its remote address for the send side.
    fn set_route(&self, _pid: usize, _addr: SocketAddr) {}
    fn clear_route(&self, _pid: usize) {}
}

// ============================================================
// UDP sink — the real send side
// ============================================================

/// Sends through the server socket. Reliable framing/retransmit is applied
/// by the transport layer beyond this seam; the core never sees it.
pub struct UdpSink {
    socket: UdpSocket,
    routes: Mutex<HashMap<usize, SocketAddr>>,
}

impl UdpSink {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            routes: Mutex::new(HashMap::new()),
        }
    }

    fn send_to_pid(&self, pid: usize, data: &[u8]) {
        let addr = self.routes.lock().get(&pid).copied();
        if let Some(addr) = addr {
            if let Err(e) = self.socket.send_to(data, addr) {
                tracing::warn!(pid, %addr, error = %e, "socket send failed");
            }
        }
    }
}

impl PacketSink for UdpSink {
    fn send_reliable(&self, pid: usize, data: &[u8]) {
        self.send_to_pid(pid, data);
    }

    fn send_unreliable(&self, pid: usize, data: &[u8]) {
        self.send_to_pid(pid, data);
    }

    fn send_raw(&self, addr: SocketAddr, data: &[u8]) {
        if let Err(e) = self.socket.send_to(data, addr) {
            tracing::warn!(%addr, error = %e, "socket send failed");
        }
    }

    fn set_route(&self, pid: usize, addr: SocketAddr) {
        self.routes.lock().insert(pid, addr);
    }

    fn clear_route(&self, pid: usize) {
        self.routes.lock().remove(&pid);
    }
}

// ============================================================
// Loopback sink — test capture
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentTarget {
    Player(usize),
    Addr(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct SentPacket {
    pub target: SentTarget,
    pub reliable: bool,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct LoopbackSink {
    pub sent: Mutex<Vec<SentPacket>>,
}

impl LoopbackSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<SentPacket> {
        std::mem::take(&mut self.sent.lock())
    }

    pub fn sent_to_player(&self, pid: usize) -> Vec<SentPacket> {
        self.sent
            .lock()
            .iter()
            .filter(|p| p.target == SentTarget::Player(pid))
            .cloned()
            .collect()
    }
}

impl PacketSink for LoopbackSink {
    fn send_reliable(&self, pid: usize, data: &[u8]) {
        self.sent.lock().push(SentPacket {
            target: SentTarget::Player(pid),
            reliable: true,
            data: data.to_vec(),
        });
    }

    fn send_unreliable(&self, pid: usize, data: &[u8]) {
        self.sent.lock().push(SentPacket {
            target: SentTarget::Player(pid),
            reliable: false,
            data: data.to_vec(),
        });
    }

    fn send_raw(&self, addr: SocketAddr, data: &[u8]) {
        self.sent.lock().push(SentPacket {
            target: SentTarget::Addr(addr),
            reliable: false,
            data: data.to_vec(),
        });
    }
}
