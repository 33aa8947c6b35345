//! WebSocket transport.
//!
//! One task owns both halves of the upgraded connection: outbound packets
//! arrive over a channel and are written frame-per-packet (single-writer
//! discipline), inbound frames are decoded and handed to the session. The
//! task holds off reading until the transport is bound to a session, so no
//! early frame can race the binding.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::error::CloseReason;
use crate::packet::{Packet, PacketType};
use crate::transport::TransportCore;

enum WsCommand {
    Packets(Vec<Packet>),
    Close,
}

pub struct WsTransport {
    core: TransportCore,
    tx: mpsc::UnboundedSender<WsCommand>,
    reader_gate: Arc<Notify>,
}

impl WsTransport {
    /// Take ownership of an upgraded connection and start its I/O task.
    pub(crate) fn spawn(ws: WebSocket, supports_binary: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_gate = Arc::new(Notify::new());
        let transport = Arc::new(Self {
            core: TransportCore::new(supports_binary),
            tx,
            reader_gate,
        });
        tokio::spawn(run(ws, rx, transport.clone()));
        transport
    }

    pub(crate) fn core(&self) -> &TransportCore {
        &self.core
    }

    /// Unblocks the reader once the transport is bound to a session.
    pub(crate) fn release_reader(&self) {
        self.reader_gate.notify_one();
    }

    pub(crate) fn send(&self, packets: Vec<Packet>) {
        let _ = self.tx.send(WsCommand::Packets(packets));
    }

    pub(crate) fn close(&self) {
        // Also lifts the gate so an unbound transport can still wind down.
        self.reader_gate.notify_one();
        let _ = self.tx.send(WsCommand::Close);
    }
}

async fn run(
    ws: WebSocket,
    mut rx: mpsc::UnboundedReceiver<WsCommand>,
    transport: Arc<WsTransport>,
) {
    transport.reader_gate.notified().await;

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(WsCommand::Packets(packets)) => {
                    for packet in packets {
                        let frame = encode_frame(packet, transport.core.supports_binary());
                        if let Err(err) = sink.send(frame).await {
                            tracing::debug!(%err, "websocket write failed");
                            report_error(&transport, CloseReason::TransportError, "write failed");
                            report_close(&transport);
                            return;
                        }
                    }
                }
                Some(WsCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    report_close(&transport);
                    return;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match Packet::decode_text(text.as_str()) {
                    Ok(packet) if packet.kind == PacketType::Close => {
                        tracing::debug!("got close packet over websocket");
                        report_close(&transport);
                        return;
                    }
                    Ok(packet) => {
                        if let Some(hook) = transport.core.hook() {
                            hook.packet(packet);
                        }
                    }
                    Err(err) => {
                        // The session reacts by commanding a close, which the
                        // next loop turn serves.
                        report_error(&transport, CloseReason::ParseError, &err.to_string());
                    }
                },
                Some(Ok(Message::Binary(bytes))) => {
                    if let Some(hook) = transport.core.hook() {
                        hook.packet(Packet::message(bytes.to_vec()));
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    report_close(&transport);
                    return;
                }
                Some(Err(err)) => {
                    tracing::debug!(%err, "websocket read failed");
                    report_error(&transport, CloseReason::TransportError, "read failed");
                    report_close(&transport);
                    return;
                }
            },
        }
    }
}

fn report_error(transport: &Arc<WsTransport>, reason: CloseReason, detail: &str) {
    if let Some(hook) = transport.core.hook() {
        hook.error(reason, detail);
    }
}

fn report_close(transport: &Arc<WsTransport>) {
    if transport.core.mark_closed() {
        if let Some(hook) = transport.core.hook() {
            hook.closed();
        }
    }
}

fn encode_frame(packet: Packet, supports_binary: bool) -> Message {
    if let Some(pre_encoded) = packet.options.ws_pre_encoded.clone() {
        return Message::Text(pre_encoded.into());
    }
    match &packet.data {
        crate::packet::PacketData::Binary(bytes) if supports_binary => {
            Message::Binary(bytes.clone().into())
        }
        _ => Message::Text(packet.encode_text().into()),
    }
}
