use std::net::SocketAddr;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use causeway::{Server, ServerEvent, ServerOptions, SocketEvent};

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let options = ServerOptions {
        cors: Some(cors),
        ..Default::default()
    };
    let (server, mut events) = Server::new(options);

    // Echo every message back on its own session.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::Connection(mut conn) => {
                    tokio::spawn(async move {
                        tracing::info!(sid = %conn.socket.id(), "client connected");
                        while let Some(event) = conn.events.recv().await {
                            match event {
                                SocketEvent::Message(data) => conn.socket.send(data),
                                SocketEvent::Close(reason) => {
                                    tracing::info!(
                                        sid = %conn.socket.id(),
                                        %reason,
                                        "client disconnected"
                                    );
                                    break;
                                }
                            }
                        }
                    });
                }
                ServerEvent::ConnectionError(rejected) => {
                    tracing::warn!(code = rejected.error.code(), "connection rejected");
                }
            }
        }
    });

    let app = axum::Router::new()
        .merge(server.router())
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .expect("server error");
}
