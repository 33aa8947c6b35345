use std::net::SocketAddr;

use causeway::{Server, ServerEvent, ServerOptions};
use tokio::sync::mpsc;

/// Start a real server on an ephemeral port. The listener runs in the
/// background for the remainder of the test.
pub async fn start_server(
    options: ServerOptions,
) -> (SocketAddr, Server, mpsc::UnboundedReceiver<ServerEvent>) {
    let (server, events) = Server::new(options);
    let app = server.router();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (addr, server, events)
}

pub fn poll_url(addr: SocketAddr, sid: Option<&str>) -> String {
    match sid {
        Some(sid) => format!("http://{addr}/engine.io/?EIO=4&transport=polling&sid={sid}"),
        None => format!("http://{addr}/engine.io/?EIO=4&transport=polling"),
    }
}

pub fn ws_url(addr: SocketAddr, sid: Option<&str>) -> String {
    match sid {
        Some(sid) => format!("ws://{addr}/engine.io/?EIO=4&transport=websocket&sid={sid}"),
        None => format!("ws://{addr}/engine.io/?EIO=4&transport=websocket"),
    }
}

/// Handshake over polling. Returns the sid and the open packet JSON.
pub async fn handshake(client: &reqwest::Client, addr: SocketAddr) -> (String, serde_json::Value) {
    let body = client
        .get(poll_url(addr, None))
        .send()
        .await
        .expect("handshake request")
        .text()
        .await
        .expect("handshake body");

    let first = body.split('\x1e').next().unwrap();
    assert!(first.starts_with('0'), "open packet expected: {body}");

    let open: serde_json::Value = serde_json::from_str(&first[1..]).expect("open payload");
    let sid = open["sid"].as_str().expect("sid").to_string();
    (sid, open)
}

/// Wait for the next new-session event, skipping admission errors.
pub async fn next_connection(
    events: &mut mpsc::UnboundedReceiver<ServerEvent>,
) -> causeway::Connection {
    loop {
        match events.recv().await.expect("server event") {
            ServerEvent::Connection(conn) => return conn,
            ServerEvent::ConnectionError(_) => {}
        }
    }
}
