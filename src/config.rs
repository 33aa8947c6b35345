//! Server configuration.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use tower_http::cors::CorsLayer;

use crate::packet::PacketData;
use crate::transport::TransportKind;

/// External admission hook. Runs after the built-in checks; a rejection is
/// answered with the `Forbidden` error carrying the returned message.
pub type AllowRequest =
    Arc<dyn Fn(&HeaderMap, &std::collections::HashMap<String, String>) -> Result<(), String> + Send + Sync>;

/// Session id generator override. The default draws 20 random bytes and
/// encodes them base64url without padding.
pub type GenerateId = Arc<dyn Fn() -> String + Send + Sync>;

/// Compression of polling response bodies.
#[derive(Debug, Clone)]
pub struct HttpCompression {
    /// Bodies below this size are sent uncompressed.
    pub threshold: usize,
}

impl Default for HttpCompression {
    fn default() -> Self {
        Self { threshold: 1024 }
    }
}

/// Per-message deflate hint for websocket transports.
///
/// Kept as a recognized knob for capability negotiation; the websocket
/// layer in use does not apply frame-level compression.
#[derive(Debug, Clone, Default)]
pub struct PerMessageDeflate {
    pub threshold: usize,
}

/// Session cookie emitted with the handshake response.
#[derive(Debug, Clone)]
pub struct CookieOptions {
    pub name: String,
    pub path: String,
    pub http_only: bool,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            name: "io".to_string(),
            path: "/".to_string(),
            http_only: true,
        }
    }
}

/// All recognized server options.
#[derive(Clone)]
pub struct ServerOptions {
    /// Heartbeat deadline: how long after a ping a sign of life must arrive.
    pub ping_timeout: Duration,
    /// Heartbeat period between server pings.
    pub ping_interval: Duration,
    /// Deadline for an upgrade probe to complete.
    pub upgrade_timeout: Duration,
    /// Per-POST body cap in bytes, echoed to clients as `maxPayload`.
    pub max_http_buffer_size: usize,
    /// Enabled transports.
    pub transports: HashSet<TransportKind>,
    /// Whether sessions may upgrade in place.
    pub allow_upgrades: bool,
    /// Websocket deflate hint, or `None` to disable.
    pub per_message_deflate: Option<PerMessageDeflate>,
    /// Polling response compression, or `None` to disable.
    pub http_compression: Option<HttpCompression>,
    /// Session cookie emission, or `None` for no cookie.
    pub cookie: Option<CookieOptions>,
    /// CORS middleware applied around the mount.
    pub cors: Option<CorsLayer>,
    /// External admission hook.
    pub allow_request: Option<AllowRequest>,
    /// URL mount prefix.
    pub path: String,
    /// Kill websocket upgrades addressed outside the mount.
    pub destroy_upgrade: bool,
    /// Grace period before a stray upgrade is dropped.
    pub destroy_upgrade_timeout: Duration,
    /// Extra packet delivered right after the open packet.
    pub initial_packet: Option<PacketData>,
    /// Session id generator override.
    pub generate_id: Option<GenerateId>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_millis(20_000),
            ping_interval: Duration::from_millis(25_000),
            upgrade_timeout: Duration::from_millis(10_000),
            max_http_buffer_size: 1_000_000,
            transports: HashSet::from([TransportKind::Polling, TransportKind::Websocket]),
            allow_upgrades: true,
            per_message_deflate: None,
            http_compression: Some(HttpCompression::default()),
            cookie: None,
            cors: None,
            allow_request: None,
            path: "/engine.io".to_string(),
            destroy_upgrade: true,
            destroy_upgrade_timeout: Duration::from_millis(1_000),
            initial_packet: None,
            generate_id: None,
        }
    }
}

impl ServerOptions {
    /// The mount path without a trailing slash.
    pub(crate) fn normalized_path(&self) -> String {
        self.path.trim_end_matches('/').to_string()
    }

    /// Transports a session on `kind` may upgrade to.
    pub(crate) fn upgrades_for(&self, kind: TransportKind) -> Vec<&'static str> {
        match kind {
            TransportKind::Polling
                if self.allow_upgrades && self.transports.contains(&TransportKind::Websocket) =>
            {
                vec![TransportKind::Websocket.as_str()]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_advertised_contract() {
        let opts = ServerOptions::default();
        assert_eq!(opts.ping_interval, Duration::from_millis(25_000));
        assert_eq!(opts.ping_timeout, Duration::from_millis(20_000));
        assert_eq!(opts.max_http_buffer_size, 1_000_000);
        assert_eq!(opts.path, "/engine.io");
        assert!(opts.allow_upgrades);
        assert!(opts.transports.contains(&TransportKind::Websocket));
    }

    #[test]
    fn upgrades_table_per_transport() {
        let opts = ServerOptions::default();
        assert_eq!(opts.upgrades_for(TransportKind::Polling), vec!["websocket"]);
        assert!(opts.upgrades_for(TransportKind::Websocket).is_empty());

        let no_upgrades = ServerOptions {
            allow_upgrades: false,
            ..Default::default()
        };
        assert!(no_upgrades.upgrades_for(TransportKind::Polling).is_empty());
    }
}
