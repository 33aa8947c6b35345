//! Per-session state machine.
//!
//! A `Socket` is the long-lived logical connection identified by its sid,
//! independent of the transport currently carrying it. All state mutations
//! go through the session's mutex; outbound batches are additionally
//! serialized by a flush lock so they can never interleave on a transport.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::config::ServerOptions;
use crate::error::CloseReason;
use crate::packet::{OpenPayload, Packet, PacketData, PacketType};
use crate::transport::{Transport, TransportHook, TransportKind};

/// How often a writable old transport is nudged with a NOOP while an
/// upgrade probe is in flight, so buffered polls complete immediately.
const UPGRADE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Opening,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// What a session reports to its consumer.
#[derive(Debug)]
pub enum SocketEvent {
    /// A message packet arrived from the client.
    Message(PacketData),
    /// The session ended.
    Close(CloseReason),
}

struct SocketState {
    ready: ReadyState,
    transport: Transport,
    probe: Option<Transport>,
    upgrading: bool,
    upgraded: bool,
    write_buffer: VecDeque<(Packet, Option<oneshot::Sender<()>>)>,
    pending_close_reason: Option<CloseReason>,
    ping_task: Option<JoinHandle<()>>,
    upgrade_timer: Option<JoinHandle<()>>,
    check_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("id", &self.id).finish()
    }
}

pub struct Socket {
    id: String,
    remote_addr: Option<SocketAddr>,
    opts: Arc<ServerOptions>,
    registry: Weak<DashMap<String, Arc<Socket>>>,
    weak: Weak<Socket>,
    events: mpsc::UnboundedSender<SocketEvent>,
    heartbeat: Notify,
    flush_lock: Mutex<()>,
    state: Mutex<SocketState>,
}

impl Socket {
    pub(crate) fn new(
        id: String,
        transport: Transport,
        remote_addr: Option<SocketAddr>,
        opts: Arc<ServerOptions>,
        registry: Weak<DashMap<String, Arc<Socket>>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SocketEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let socket = Arc::new_cyclic(|weak| Self {
            id,
            remote_addr,
            opts,
            registry,
            weak: weak.clone(),
            events,
            heartbeat: Notify::new(),
            flush_lock: Mutex::new(()),
            state: Mutex::new(SocketState {
                ready: ReadyState::Opening,
                transport: transport.clone(),
                probe: None,
                upgrading: false,
                upgraded: false,
                write_buffer: VecDeque::new(),
                pending_close_reason: None,
                ping_task: None,
                upgrade_timer: None,
                check_task: None,
            }),
        });
        transport.bind(TransportHook::new(socket.weak.clone(), transport.id()));
        (socket, events_rx)
    }

    // -- public surface -----------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state.lock().ready
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.state.lock().transport.kind()
    }

    pub fn upgrading(&self) -> bool {
        self.state.lock().upgrading
    }

    pub fn upgraded(&self) -> bool {
        self.state.lock().upgraded
    }

    pub(crate) fn current_transport(&self) -> Transport {
        self.state.lock().transport.clone()
    }

    /// Queue a message packet for the client.
    pub fn send(&self, data: impl Into<PacketData>) {
        self.send_packet(Packet::message(data), None);
    }

    /// Queue a message packet and learn when it was handed to a transport.
    pub fn send_with_ack(&self, data: impl Into<PacketData>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.send_packet(Packet::message(data), Some(tx));
        rx
    }

    /// Close the session cooperatively. The close packet is flushed before
    /// the transition when the transport is writable.
    pub fn close(&self) {
        let transport = {
            let mut state = self.state.lock();
            if matches!(state.ready, ReadyState::Closing | ReadyState::Closed) {
                return;
            }
            state.ready = ReadyState::Closing;
            state.pending_close_reason = Some(CloseReason::ForcedClose);
            if let Some(task) = state.ping_task.take() {
                task.abort();
            }
            state.transport.clone()
        };
        tracing::debug!(sid = %self.id, "closing session");
        transport.close();
    }

    /// Drop the session at once. The transport is discarded rather than
    /// drained, so a parked poll is released with a NOOP instead of a
    /// negotiated close packet.
    pub fn disconnect(&self) {
        let transport = {
            let state = self.state.lock();
            if matches!(state.ready, ReadyState::Closed) {
                return;
            }
            state.transport.clone()
        };
        tracing::debug!(sid = %self.id, "disconnecting session");
        transport.discard();
        self.close_now(CloseReason::ForcedDisconnect);
    }

    // -- lifecycle ----------------------------------------------------------

    /// Deliver the handshake and transition to open.
    pub(crate) fn open(&self) {
        let kind = {
            let mut state = self.state.lock();
            state.ready = ReadyState::Open;
            state.transport.kind()
        };

        #[allow(clippy::expect_used)]
        let handshake = serde_json::to_string(&OpenPayload {
            sid: self.id.clone(),
            upgrades: self.opts.upgrades_for(kind),
            ping_interval: self.opts.ping_interval.as_millis(),
            ping_timeout: self.opts.ping_timeout.as_millis(),
            max_payload: self.opts.max_http_buffer_size,
        })
        .expect("open payload serializes");

        tracing::debug!(sid = %self.id, transport = %kind, "session opened");
        self.send_packet(Packet::open(handshake), None);

        if let Some(data) = self.opts.initial_packet.clone() {
            self.send_packet(Packet::message(data), None);
        }

        let heartbeat = self.start_heartbeat();
        self.state.lock().ping_task = Some(heartbeat);
    }

    fn send_packet(&self, packet: Packet, ack: Option<oneshot::Sender<()>>) {
        {
            let mut state = self.state.lock();
            if !matches!(state.ready, ReadyState::Opening | ReadyState::Open) {
                return;
            }
            state.write_buffer.push_back((packet, ack));
        }
        self.flush();
    }

    /// Move the whole write buffer into one transport send.
    fn flush(&self) {
        let _serialized = self.flush_lock.lock();

        let (transport, packets, acks) = {
            let mut state = self.state.lock();
            if matches!(state.ready, ReadyState::Closed) || state.write_buffer.is_empty() {
                return;
            }
            let transport = state.transport.clone();
            if !transport.writable() {
                return;
            }
            let mut packets = Vec::with_capacity(state.write_buffer.len());
            let mut acks = Vec::new();
            for (packet, ack) in state.write_buffer.drain(..) {
                packets.push(packet);
                if let Some(ack) = ack {
                    acks.push(ack);
                }
            }
            (transport, packets, acks)
        };

        tracing::trace!(sid = %self.id, count = packets.len(), "flushing write buffer");
        transport.send(packets);
        for ack in acks {
            let _ = ack.send(());
        }
    }

    fn start_heartbeat(&self) -> JoinHandle<()> {
        let weak = self.weak.clone();
        let interval = self.opts.ping_interval;
        let timeout = self.opts.ping_timeout;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(socket) = weak.upgrade() else { break };

                // Consume a stale liveness permit before arming the deadline.
                socket.heartbeat.notified().now_or_never();
                socket.send_packet(Packet::ping(), None);

                let missed = {
                    let lively = socket.heartbeat.notified();
                    tokio::select! {
                        _ = lively => false,
                        _ = tokio::time::sleep(timeout) => true,
                    }
                };
                if missed {
                    tracing::debug!(sid = %socket.id, "heartbeat deadline missed");
                    socket.close_now(CloseReason::PingTimeout);
                    break;
                }
            }
        })
    }

    /// Immediate close used by error, timeout, and shutdown paths: the
    /// transport winds down in the background while the session finalizes.
    pub(crate) fn close_now(&self, reason: CloseReason) {
        let transport = {
            let mut state = self.state.lock();
            if matches!(state.ready, ReadyState::Closed) {
                return;
            }
            state.ready = ReadyState::Closing;
            // The transport may report closed synchronously below; make sure
            // that path finalizes with the right reason too.
            state.pending_close_reason = Some(reason);
            if let Some(task) = state.ping_task.take() {
                task.abort();
            }
            state.transport.clone()
        };
        transport.close();
        self.finalize_close(reason);
    }

    fn finalize_close(&self, reason: CloseReason) {
        let probe = {
            let mut state = self.state.lock();
            if matches!(state.ready, ReadyState::Closed) {
                return;
            }
            state.ready = ReadyState::Closed;
            state.pending_close_reason = None;
            state.upgrading = false;
            state.write_buffer.clear();
            for task in [
                state.ping_task.take(),
                state.upgrade_timer.take(),
                state.check_task.take(),
            ]
            .into_iter()
            .flatten()
            {
                task.abort();
            }
            state.probe.take()
        };

        if let Some(probe) = probe {
            probe.discard();
            probe.close();
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        let _ = self.events.send(SocketEvent::Close(reason));
        tracing::info!(sid = %self.id, reason = %reason, "session closed");
    }

    // -- upgrade choreography -----------------------------------------------

    /// Attach a candidate transport and start the probe.
    pub(crate) fn maybe_upgrade(&self, probe: Transport) {
        {
            let mut state = self.state.lock();
            if state.upgrading || state.upgraded || !matches!(state.ready, ReadyState::Open) {
                drop(state);
                tracing::debug!(sid = %self.id, "cannot attach probe in current state");
                probe.close();
                return;
            }
            tracing::debug!(sid = %self.id, "probing transport upgrade");
            state.upgrading = true;
            state.probe = Some(probe.clone());
            state.upgrade_timer = Some(self.start_upgrade_timer(probe.id()));
        }
        // Register before binding: the bind is what lets the probe start
        // reading, and its first packet must route as probe traffic.
        probe.bind(TransportHook::new(self.weak.clone(), probe.id()));
    }

    fn start_upgrade_timer(&self, probe_id: u64) -> JoinHandle<()> {
        let weak = self.weak.clone();
        let timeout = self.opts.upgrade_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(socket) = weak.upgrade() else { return };
            let still_probing = {
                let state = socket.state.lock();
                state.upgrading && state.probe.as_ref().is_some_and(|p| p.id() == probe_id)
            };
            if still_probing {
                tracing::debug!(sid = %socket.id, "upgrade probe timed out");
                socket.abort_probe();
            }
        })
    }

    fn start_upgrade_check(&self) -> JoinHandle<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(UPGRADE_CHECK_INTERVAL).await;
                let Some(socket) = weak.upgrade() else { break };
                let transport = {
                    let state = socket.state.lock();
                    if !state.upgrading {
                        break;
                    }
                    state.transport.clone()
                };
                if let Some(polling) = transport.as_polling() {
                    if polling.writable() {
                        tracing::trace!(sid = %socket.id, "nudging writable polling transport");
                        polling.send(vec![Packet::noop()]);
                    }
                }
            }
        })
    }

    /// Drop the probe and stay on the current transport.
    fn abort_probe(&self) {
        let probe = {
            let mut state = self.state.lock();
            state.upgrading = false;
            for task in [state.upgrade_timer.take(), state.check_task.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
            state.probe.take()
        };
        if let Some(probe) = probe {
            probe.discard();
            probe.close();
        }
    }

    fn complete_upgrade(&self, probe_id: u64) {
        let old = {
            let mut state = self.state.lock();
            if !state.upgrading || matches!(state.ready, ReadyState::Closed) {
                return;
            }
            let Some(probe) = state.probe.take() else { return };
            if probe.id() != probe_id {
                state.probe = Some(probe);
                return;
            }
            state.upgrading = false;
            state.upgraded = true;
            for task in [state.upgrade_timer.take(), state.check_task.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
            std::mem::replace(&mut state.transport, probe)
        };

        tracing::info!(sid = %self.id, "transport upgraded");
        old.discard();
        old.close();
        self.flush();
    }

    // -- transport events ---------------------------------------------------

    pub(crate) fn on_transport_packet(&self, transport_id: u64, packet: Packet) {
        match self.route(transport_id) {
            Route::Current => self.on_packet(packet),
            Route::Probe(probe) => self.on_probe_packet(probe, packet),
            Route::Stale => {
                tracing::trace!(sid = %self.id, "packet from stale transport dropped");
            }
        }
    }

    pub(crate) fn on_transport_drain(&self, transport_id: u64) {
        if matches!(self.route(transport_id), Route::Current) {
            self.flush();
        }
    }

    pub(crate) fn on_transport_error(&self, transport_id: u64, reason: CloseReason, detail: &str) {
        match self.route(transport_id) {
            Route::Current => {
                tracing::warn!(sid = %self.id, detail, "transport error");
                self.close_now(reason);
            }
            Route::Probe(_) => {
                tracing::debug!(sid = %self.id, detail, "probe transport error");
                self.abort_probe();
            }
            Route::Stale => {}
        }
    }

    pub(crate) fn on_transport_close(&self, transport_id: u64) {
        match self.route(transport_id) {
            Route::Current => {
                let reason = self
                    .state
                    .lock()
                    .pending_close_reason
                    .take()
                    .unwrap_or(CloseReason::TransportClose);
                self.finalize_close(reason);
            }
            Route::Probe(_) => {
                tracing::debug!(sid = %self.id, "probe transport closed");
                self.abort_probe();
            }
            Route::Stale => {}
        }
    }

    fn route(&self, transport_id: u64) -> Route {
        let state = self.state.lock();
        if let Some(probe) = &state.probe {
            if probe.id() == transport_id {
                return Route::Probe(probe.clone());
            }
        }
        if state.transport.id() == transport_id {
            Route::Current
        } else {
            Route::Stale
        }
    }

    fn on_packet(&self, packet: Packet) {
        self.heartbeat.notify_one();
        match packet.kind {
            PacketType::Message => {
                let _ = self.events.send(SocketEvent::Message(packet.data));
            }
            PacketType::Pong => {
                tracing::trace!(sid = %self.id, "pong received");
            }
            PacketType::Ping => {
                // Heartbeats are server-initiated on this protocol version.
                tracing::debug!(sid = %self.id, "unexpected ping from client");
            }
            PacketType::Upgrade => {
                tracing::debug!(sid = %self.id, "upgrade packet outside probe ignored");
            }
            PacketType::Open | PacketType::Close | PacketType::Noop => {}
        }
    }

    fn on_probe_packet(&self, probe: Transport, packet: Packet) {
        match packet.kind {
            PacketType::Ping if packet.data == PacketData::Text("probe".to_string()) => {
                tracing::debug!(sid = %self.id, "probe ping received");
                probe.send(vec![Packet::pong("probe")]);
                let mut state = self.state.lock();
                if state.upgrading && state.check_task.is_none() {
                    state.check_task = Some(self.start_upgrade_check());
                }
            }
            PacketType::Upgrade => {
                self.complete_upgrade(probe.id());
            }
            _ => {
                tracing::debug!(sid = %self.id, "invalid probe traffic, aborting upgrade");
                self.abort_probe();
            }
        }
    }
}

enum Route {
    Current,
    Probe(Transport),
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::polling::{DataOutcome, PollOutcome, PollingTransport};

    fn make_socket(
        opts: ServerOptions,
    ) -> (
        Arc<Socket>,
        mpsc::UnboundedReceiver<SocketEvent>,
        Arc<PollingTransport>,
        Arc<DashMap<String, Arc<Socket>>>,
    ) {
        let registry = Arc::new(DashMap::new());
        let polling = PollingTransport::new(true, 1_000_000, None);
        let (socket, events) = Socket::new(
            "test-sid".to_string(),
            Transport::Polling(polling.clone()),
            None,
            Arc::new(opts),
            Arc::downgrade(&registry),
        );
        registry.insert(socket.id().to_string(), socket.clone());
        (socket, events, polling, registry)
    }

    #[tokio::test]
    async fn open_packet_rides_the_first_poll() {
        let (socket, _events, polling, _registry) = make_socket(ServerOptions::default());
        socket.open();
        assert_eq!(socket.ready_state(), ReadyState::Open);

        let PollOutcome::Parked { rx, guard: _guard } = polling.on_poll_request(String::new(), false)
        else {
            panic!("expected park");
        };
        let response = rx.await.unwrap();
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.starts_with('0'), "open packet first: {body}");
        assert!(body.contains("test-sid"));
        assert!(body.contains("\"pingInterval\":25000"));
    }

    #[tokio::test]
    async fn queued_packets_drain_in_order() {
        let (socket, _events, polling, _registry) = make_socket(ServerOptions::default());
        socket.open();
        socket.send("one");
        socket.send("two");

        let PollOutcome::Parked { rx, guard: _guard } = polling.on_poll_request(String::new(), false)
        else {
            panic!("expected park");
        };
        let body = String::from_utf8(rx.await.unwrap().body).unwrap();
        let parts: Vec<&str> = body.split('\x1e').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].starts_with('0'));
        assert_eq!(parts[1], "4one");
        assert_eq!(parts[2], "4two");
    }

    #[tokio::test]
    async fn ack_fires_once_committed() {
        let (socket, _events, polling, _registry) = make_socket(ServerOptions::default());
        socket.open();

        let mut ack = socket.send_with_ack("payload");
        assert!(ack.try_recv().is_err(), "nothing drained yet");

        let PollOutcome::Parked { rx: _rx, guard: _guard } =
            polling.on_poll_request(String::new(), false)
        else {
            panic!("expected park");
        };
        ack.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_message_reaches_the_consumer() {
        let (socket, mut events, polling, _registry) = make_socket(ServerOptions::default());
        socket.open();

        assert!(matches!(polling.on_data_request(b"4hello"), DataOutcome::Ok));
        let event = events.recv().await.unwrap();
        assert!(matches!(event, SocketEvent::Message(PacketData::Text(t)) if t == "hello"));
    }

    #[tokio::test]
    async fn missed_heartbeat_closes_and_deregisters() {
        let opts = ServerOptions {
            ping_interval: Duration::from_millis(20),
            ping_timeout: Duration::from_millis(40),
            ..Default::default()
        };
        let (socket, mut events, _polling, registry) = make_socket(opts);
        socket.open();

        let reason = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await.unwrap() {
                    SocketEvent::Close(reason) => break reason,
                    SocketEvent::Message(_) => {}
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(reason, CloseReason::PingTimeout);
        assert_eq!(socket.ready_state(), ReadyState::Closed);
        assert!(registry.is_empty(), "closed session must deregister");
    }

    #[tokio::test]
    async fn close_packet_from_client_closes_the_session() {
        let (socket, mut events, polling, registry) = make_socket(ServerOptions::default());
        socket.open();

        polling.on_data_request(b"1");
        let SocketEvent::Close(reason) = events.recv().await.unwrap() else {
            panic!("expected close event");
        };
        assert_eq!(reason, CloseReason::TransportClose);
        assert_eq!(socket.ready_state(), ReadyState::Closed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn app_close_delivers_close_packet_to_parked_poll() {
        let (socket, mut events, polling, _registry) = make_socket(ServerOptions::default());
        socket.open();

        let PollOutcome::Parked { rx, guard: _guard } = polling.on_poll_request(String::new(), false)
        else {
            panic!("expected park");
        };
        // Drain the open packet first.
        let _ = rx.await.unwrap();

        let PollOutcome::Parked { rx, guard: _guard2 } =
            polling.on_poll_request(String::new(), false)
        else {
            panic!("expected park");
        };

        socket.close();
        let body = String::from_utf8(rx.await.unwrap().body).unwrap();
        assert!(body.contains('1'), "close packet expected: {body}");

        let SocketEvent::Close(reason) = events.recv().await.unwrap() else {
            panic!("expected close event");
        };
        assert_eq!(reason, CloseReason::ForcedClose);
    }

    #[tokio::test]
    async fn disconnect_releases_parked_poll_without_a_close_packet() {
        let (socket, mut events, polling, registry) = make_socket(ServerOptions::default());
        socket.open();

        let PollOutcome::Parked { rx, guard: _guard } = polling.on_poll_request(String::new(), false)
        else {
            panic!("expected park");
        };
        // Drain the open packet first.
        let _ = rx.await.unwrap();

        let PollOutcome::Parked { rx, guard: _guard2 } =
            polling.on_poll_request(String::new(), false)
        else {
            panic!("expected park");
        };

        socket.disconnect();
        let body = String::from_utf8(rx.await.unwrap().body).unwrap();
        assert_eq!(body, "6", "noop release expected: {body}");

        let SocketEvent::Close(reason) = events.recv().await.unwrap() else {
            panic!("expected close event");
        };
        assert_eq!(reason, CloseReason::ForcedDisconnect);
        assert_eq!(socket.ready_state(), ReadyState::Closed);
        assert!(registry.is_empty());
    }
}
