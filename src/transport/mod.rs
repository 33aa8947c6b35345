//! Transports carrying a session's packets.
//!
//! A session always owns exactly one active transport, plus a probe
//! transport while an upgrade is in flight. Transports talk back to the
//! owning session only through a [`TransportHook`] holding a weak
//! reference, so the session side of the cycle stays the single owner.

pub mod polling;
pub mod websocket;

pub use polling::PollingTransport;
pub use websocket::WsTransport;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::error::CloseReason;
use crate::packet::Packet;
use crate::socket::Socket;

/// The two transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Polling,
    Websocket,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::Websocket => "websocket",
        }
    }

    /// Parse the `transport` query parameter.
    pub fn from_query(value: &str) -> Option<Self> {
        match value {
            "polling" => Some(Self::Polling),
            "websocket" => Some(Self::Websocket),
            _ => None,
        }
    }

    /// Whether packets ride individual frames instead of batched bodies.
    pub fn supports_framing(self) -> bool {
        matches!(self, Self::Websocket)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Shared transport state
// ---------------------------------------------------------------------------

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// State common to both transport variants.
pub(crate) struct TransportCore {
    id: u64,
    supports_binary: bool,
    discarded: AtomicBool,
    closed: AtomicBool,
    hook: OnceLock<TransportHook>,
}

impl TransportCore {
    pub(crate) fn new(supports_binary: bool) -> Self {
        Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            supports_binary,
            discarded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            hook: OnceLock::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn supports_binary(&self) -> bool {
        self.supports_binary
    }

    pub(crate) fn discarded(&self) -> bool {
        self.discarded.load(Ordering::Relaxed)
    }

    pub(crate) fn discard(&self) {
        self.discarded.store(true, Ordering::Relaxed);
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Returns true on the first call only.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::Relaxed)
    }

    pub(crate) fn bind(&self, hook: TransportHook) {
        let _ = self.hook.set(hook);
    }

    pub(crate) fn hook(&self) -> Option<&TransportHook> {
        self.hook.get()
    }
}

/// Weak back-reference from a transport to its owning session.
pub(crate) struct TransportHook {
    socket: Weak<Socket>,
    transport_id: u64,
}

impl TransportHook {
    pub(crate) fn new(socket: Weak<Socket>, transport_id: u64) -> Self {
        Self {
            socket,
            transport_id,
        }
    }

    pub(crate) fn packet(&self, packet: Packet) {
        if let Some(socket) = self.socket.upgrade() {
            socket.on_transport_packet(self.transport_id, packet);
        }
    }

    pub(crate) fn drain(&self) {
        if let Some(socket) = self.socket.upgrade() {
            socket.on_transport_drain(self.transport_id);
        }
    }

    pub(crate) fn error(&self, reason: CloseReason, detail: &str) {
        if let Some(socket) = self.socket.upgrade() {
            socket.on_transport_error(self.transport_id, reason, detail);
        }
    }

    pub(crate) fn closed(&self) {
        if let Some(socket) = self.socket.upgrade() {
            socket.on_transport_close(self.transport_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A session's physical carrier.
#[derive(Clone)]
pub enum Transport {
    Polling(Arc<PollingTransport>),
    Websocket(Arc<WsTransport>),
}

impl Transport {
    pub(crate) fn id(&self) -> u64 {
        match self {
            Self::Polling(t) => t.core().id(),
            Self::Websocket(t) => t.core().id(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Polling(_) => TransportKind::Polling,
            Self::Websocket(_) => TransportKind::Websocket,
        }
    }

    pub fn supports_binary(&self) -> bool {
        match self {
            Self::Polling(t) => t.core().supports_binary(),
            Self::Websocket(t) => t.core().supports_binary(),
        }
    }

    pub fn supports_framing(&self) -> bool {
        self.kind().supports_framing()
    }

    /// Whether a send right now would reach the client.
    pub(crate) fn writable(&self) -> bool {
        match self {
            Self::Polling(t) => t.writable(),
            Self::Websocket(t) => !t.core().closed(),
        }
    }

    pub(crate) fn send(&self, packets: Vec<Packet>) {
        match self {
            Self::Polling(t) => t.send(packets),
            Self::Websocket(t) => t.send(packets),
        }
    }

    pub(crate) fn close(&self) {
        match self {
            Self::Polling(t) => t.close(),
            Self::Websocket(t) => t.close(),
        }
    }

    pub(crate) fn discard(&self) {
        match self {
            Self::Polling(t) => t.core().discard(),
            Self::Websocket(t) => t.core().discard(),
        }
    }

    pub(crate) fn bind(&self, hook: TransportHook) {
        match self {
            Self::Polling(t) => t.core().bind(hook),
            Self::Websocket(t) => {
                t.core().bind(hook);
                t.release_reader();
            }
        }
    }

    pub(crate) fn as_polling(&self) -> Option<&Arc<PollingTransport>> {
        match self {
            Self::Polling(t) => Some(t),
            Self::Websocket(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_query_values() {
        assert_eq!(TransportKind::from_query("polling"), Some(TransportKind::Polling));
        assert_eq!(TransportKind::from_query("websocket"), Some(TransportKind::Websocket));
        assert_eq!(TransportKind::from_query("carrier-pigeon"), None);
    }

    #[test]
    fn framing_is_websocket_only() {
        assert!(!TransportKind::Polling.supports_framing());
        assert!(TransportKind::Websocket.supports_framing());
    }

    #[test]
    fn core_close_reports_once() {
        let core = TransportCore::new(true);
        assert!(core.mark_closed());
        assert!(!core.mark_closed());
        assert!(core.closed());
    }
}
