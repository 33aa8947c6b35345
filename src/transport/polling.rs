//! HTTP long-polling transport.
//!
//! A parked GET is the transport's writable state: the handler's oneshot
//! receiver stays pending until the session drains packets into it, the
//! transport closes, or the client disconnects. POST requests carry
//! client→server payloads and are answered with a bare `ok`.

use std::io::Write as _;
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::http::StatusCode;
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::HttpCompression;
use crate::error::CloseReason;
use crate::packet::{decode_payload, encode_payload, Packet, PacketType};
use crate::transport::TransportCore;

/// Grace period between a buffered close and a forced one.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(30_000);

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

/// A drained poll response, handed to the parked handler.
#[derive(Debug)]
pub(crate) struct PollResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub content_encoding: Option<&'static str>,
    pub xss_protection: bool,
    pub body: Vec<u8>,
}

/// What became of an incoming GET.
pub(crate) enum PollOutcome {
    /// The request is parked; await the receiver while holding the guard.
    Parked {
        rx: oneshot::Receiver<PollResponse>,
        guard: PollGuard,
    },
    /// Another GET is already parked.
    Overlap,
    /// The transport is already closed; nothing will ever drain.
    Closed,
}

/// What became of an incoming POST body.
pub(crate) enum DataOutcome {
    Ok,
    Overlap,
    TooLarge,
    Malformed,
}

struct ParkedPoll {
    tx: oneshot::Sender<PollResponse>,
    token: u64,
    accept_encoding: String,
    legacy_ua: bool,
}

#[derive(Default)]
struct PollingState {
    parked: Option<ParkedPoll>,
    park_seq: u64,
    data_in_flight: bool,
    should_close: bool,
    close_timer: Option<JoinHandle<()>>,
}

pub struct PollingTransport {
    core: TransportCore,
    max_http_buffer_size: usize,
    http_compression: Option<HttpCompression>,
    writable: std::sync::atomic::AtomicBool,
    weak: Weak<Self>,
    state: Mutex<PollingState>,
}

impl PollingTransport {
    pub(crate) fn new(
        supports_binary: bool,
        max_http_buffer_size: usize,
        http_compression: Option<HttpCompression>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: TransportCore::new(supports_binary),
            max_http_buffer_size,
            http_compression,
            writable: std::sync::atomic::AtomicBool::new(false),
            weak: weak.clone(),
            state: Mutex::new(PollingState::default()),
        })
    }

    pub(crate) fn core(&self) -> &TransportCore {
        &self.core
    }

    pub(crate) fn writable(&self) -> bool {
        self.writable.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn set_writable(&self, writable: bool) {
        self.writable
            .store(writable, std::sync::atomic::Ordering::Relaxed);
    }

    /// The client sent a GET and awaits data.
    pub(crate) fn on_poll_request(&self, accept_encoding: String, legacy_ua: bool) -> PollOutcome {
        if self.core.closed() {
            return PollOutcome::Closed;
        }
        let (rx, token) = {
            let mut state = self.state.lock();
            if state.parked.is_some() {
                drop(state);
                tracing::debug!("poll request overlap");
                if let Some(hook) = self.core.hook() {
                    hook.error(CloseReason::TransportError, "overlap from client");
                }
                return PollOutcome::Overlap;
            }
            state.park_seq += 1;
            let token = state.park_seq;
            let (tx, rx) = oneshot::channel();
            state.parked = Some(ParkedPoll {
                tx,
                token,
                accept_encoding,
                legacy_ua,
            });
            (rx, token)
        };

        self.set_writable(true);
        if let Some(hook) = self.core.hook() {
            hook.drain();
        }

        // A close buffered while unwritable needs an immediate drain so the
        // close packet rides out with it.
        let pending_close = self.state.lock().should_close;
        if pending_close && self.writable() {
            tracing::debug!("triggering empty send to append close packet");
            self.send(vec![Packet::noop()]);
        }

        PollOutcome::Parked {
            rx,
            guard: PollGuard {
                transport: self.weak.clone(),
                token,
            },
        }
    }

    /// The client sent a POST carrying a payload.
    pub(crate) fn on_data_request(&self, body: &[u8]) -> DataOutcome {
        {
            let mut state = self.state.lock();
            if state.data_in_flight {
                drop(state);
                if let Some(hook) = self.core.hook() {
                    hook.error(CloseReason::TransportError, "data request overlap from client");
                }
                return DataOutcome::Overlap;
            }
            state.data_in_flight = true;
        }

        let outcome = self.handle_data(body);
        self.state.lock().data_in_flight = false;
        outcome
    }

    fn handle_data(&self, body: &[u8]) -> DataOutcome {
        if body.len() > self.max_http_buffer_size {
            return DataOutcome::TooLarge;
        }

        let packets = match decode_payload(body) {
            Ok(packets) => packets,
            Err(err) => {
                if let Some(hook) = self.core.hook() {
                    hook.error(CloseReason::ParseError, &err.to_string());
                }
                return DataOutcome::Malformed;
            }
        };

        for packet in packets {
            if packet.kind == PacketType::Close {
                tracing::debug!("got close packet over polling");
                self.on_close();
                break;
            }
            if let Some(hook) = self.core.hook() {
                hook.packet(packet);
            }
        }
        DataOutcome::Ok
    }

    /// Drain a batch into the parked request, if any.
    pub(crate) fn send(&self, mut packets: Vec<Packet>) {
        let (parked, closing) = {
            let mut state = self.state.lock();
            let Some(parked) = state.parked.take() else {
                return;
            };
            self.set_writable(false);
            let mut closing = false;
            if state.should_close {
                tracing::debug!("appending close packet to payload");
                state.should_close = false;
                if let Some(timer) = state.close_timer.take() {
                    timer.abort();
                }
                packets.push(Packet::close());
                closing = true;
            }
            (parked, closing)
        };

        let compress = packets.iter().any(|p| p.options.compress);
        let mut response = PollResponse {
            status: StatusCode::OK,
            content_type: TEXT_CONTENT_TYPE,
            content_encoding: None,
            xss_protection: parked.legacy_ua,
            body: encode_payload(&packets).into_bytes(),
        };

        if compress {
            self.maybe_compress(&mut response, &parked.accept_encoding);
        }

        // A failed send means the poller vanished between drain and write;
        // its drop guard has already raised the transport error.
        let _ = parked.tx.send(response);

        if closing {
            self.on_close();
        }
    }

    fn maybe_compress(&self, response: &mut PollResponse, accept_encoding: &str) {
        let Some(config) = &self.http_compression else {
            return;
        };
        if response.body.len() < config.threshold {
            return;
        }
        let Some(encoding) = negotiate_encoding(accept_encoding) else {
            return;
        };
        match compress_body(&response.body, encoding) {
            Ok(buf) => {
                response.content_encoding = Some(encoding);
                response.body = buf;
            }
            Err(err) => {
                tracing::debug!(%err, "response compression failed, sending identity");
            }
        }
    }

    /// Cooperative close initiated by the session.
    pub(crate) fn close(&self) {
        if self.core.closed() {
            return;
        }
        // A discarded transport never announces the close on the wire; any
        // parked poll is released with the NOOP path instead.
        if self.core.discarded() {
            tracing::debug!("transport discarded, closing right away");
            self.on_close();
        } else if self.writable() {
            tracing::debug!("transport writable, closing right away");
            self.send(vec![Packet::close()]);
            self.on_close();
        } else {
            tracing::debug!("transport not writable, buffering orderly close");
            let weak = self.weak.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(CLOSE_TIMEOUT).await;
                if let Some(transport) = weak.upgrade() {
                    tracing::debug!("close timed out, forcing");
                    transport.on_close();
                }
            });
            let mut state = self.state.lock();
            state.should_close = true;
            state.close_timer = Some(timer);
        }
    }

    /// Final transition. Idempotent; releases any parked request first.
    pub(crate) fn on_close(&self) {
        if !self.core.mark_closed() {
            return;
        }
        if let Some(timer) = self.state.lock().close_timer.take() {
            timer.abort();
        }
        if self.writable() {
            // Let the pending poll complete instead of stranding it.
            self.send(vec![Packet::noop()]);
        }
        if let Some(hook) = self.core.hook() {
            hook.closed();
        }
    }
}

/// Detects a vanished poller: if the handler future is dropped while its
/// request is still parked, the park is cleared and the session is told.
pub(crate) struct PollGuard {
    transport: Weak<PollingTransport>,
    token: u64,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        let cleared = {
            let mut state = transport.state.lock();
            match &state.parked {
                Some(parked) if parked.token == self.token => {
                    state.parked = None;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            transport.set_writable(false);
            if let Some(hook) = transport.core.hook() {
                hook.error(CloseReason::TransportError, "poll connection closed prematurely");
            }
        }
    }
}

/// Picks the response encoding from an `Accept-Encoding` header value.
fn negotiate_encoding(accept_encoding: &str) -> Option<&'static str> {
    if accept_encoding.contains("gzip") {
        Some("gzip")
    } else if accept_encoding.contains("deflate") {
        Some("deflate")
    } else {
        None
    }
}

fn compress_body(body: &[u8], encoding: &str) -> std::io::Result<Vec<u8>> {
    match encoding {
        "gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(1));
            encoder.write_all(body)?;
            encoder.finish()
        }
        _ => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(1));
            encoder.write_all(body)?;
            encoder.finish()
        }
    }
}

/// Legacy IE user agents get `X-XSS-Protection: 0` on polling responses.
pub(crate) fn is_legacy_user_agent(user_agent: &str) -> bool {
    user_agent.contains(";MSIE") || user_agent.contains("Trident/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Arc<PollingTransport> {
        PollingTransport::new(true, 1_000_000, Some(HttpCompression { threshold: 1024 }))
    }

    #[tokio::test]
    async fn parked_poll_drains_on_send() {
        let t = transport();
        let PollOutcome::Parked { rx, guard } = t.on_poll_request(String::new(), false) else {
            panic!("expected park");
        };
        assert!(t.writable());

        t.send(vec![Packet::message("hi")]);
        assert!(!t.writable());

        let response = rx.await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, b"4hi");
        assert_eq!(response.content_type, TEXT_CONTENT_TYPE);
        drop(guard);
    }

    #[tokio::test]
    async fn second_poll_overlaps() {
        let t = transport();
        let PollOutcome::Parked { rx: _rx, guard: _guard } =
            t.on_poll_request(String::new(), false)
        else {
            panic!("expected park");
        };
        assert!(matches!(
            t.on_poll_request(String::new(), false),
            PollOutcome::Overlap
        ));
    }

    #[tokio::test]
    async fn oversize_post_is_rejected() {
        let t = PollingTransport::new(true, 4, None);
        assert!(matches!(t.on_data_request(b"4hello"), DataOutcome::TooLarge));
    }

    #[tokio::test]
    async fn malformed_post_is_rejected() {
        let t = transport();
        assert!(matches!(t.on_data_request(b"9nope"), DataOutcome::Malformed));
    }

    #[tokio::test]
    async fn close_packet_closes_transport() {
        let t = transport();
        assert!(matches!(t.on_data_request(b"1"), DataOutcome::Ok));
        assert!(t.core().closed());
    }

    #[tokio::test]
    async fn buffered_close_rides_next_poll() {
        let t = transport();
        t.close();
        assert!(!t.core().closed());

        let PollOutcome::Parked { rx, guard: _guard } = t.on_poll_request(String::new(), false)
        else {
            panic!("expected park");
        };
        let response = rx.await.unwrap();
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.contains('1'), "close packet should ride along: {body}");
        assert!(t.core().closed());
    }

    #[tokio::test]
    async fn large_compressible_response_is_gzipped() {
        let t = transport();
        let PollOutcome::Parked { rx, guard: _guard } =
            t.on_poll_request("gzip, deflate".to_string(), false)
        else {
            panic!("expected park");
        };

        let big = "a".repeat(2048);
        t.send(vec![Packet::message(big).with_compress(true)]);

        let response = rx.await.unwrap();
        assert_eq!(response.content_encoding, Some("gzip"));
        assert!(response.body.len() < 2048);
    }

    #[test]
    fn legacy_user_agents_are_detected() {
        assert!(is_legacy_user_agent("Mozilla/4.0 (compatible;MSIE 7.0)"));
        assert!(is_legacy_user_agent("Mozilla/5.0 (Windows NT 10.0; Trident/7.0)"));
        assert!(!is_legacy_user_agent("Mozilla/5.0 (X11; Linux x86_64)"));
    }
}
