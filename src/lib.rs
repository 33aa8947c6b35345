//! Persistent logical sockets over HTTP.
//!
//! A client handshakes over long-polling, gets a session id, and exchanges
//! ordered packet batches via parked GETs and POSTed payloads. When both
//! sides support it, the session upgrades in place to a WebSocket without
//! losing its identity or any queued packets.
//!
//! ```no_run
//! use causeway::{Server, ServerEvent, ServerOptions, SocketEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (server, mut events) = Server::new(ServerOptions::default());
//!     let app = server.router();
//!
//!     tokio::spawn(async move {
//!         while let Some(ServerEvent::Connection(mut conn)) = events.recv().await {
//!             tokio::spawn(async move {
//!                 while let Some(SocketEvent::Message(data)) = conn.events.recv().await {
//!                     conn.socket.send(data);
//!                 }
//!             });
//!         }
//!     });
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod config;
pub mod error;
pub mod packet;
pub mod server;
pub mod socket;
pub mod transport;

pub use config::{CookieOptions, HttpCompression, PerMessageDeflate, ServerOptions};
pub use error::{CloseReason, EngineError};
pub use packet::{Packet, PacketData, PacketType, PROTOCOL};
pub use server::{Connection, ConnectionError, Server, ServerEvent};
pub use socket::{ReadyState, Socket, SocketEvent};
pub use transport::TransportKind;
