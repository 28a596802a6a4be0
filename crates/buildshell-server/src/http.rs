//! HTTP surface.
//!
//! ## Endpoints
//!
//! - `GET /ws?spec=<url>[&cols=<n>&rows=<n>]` - WebSocket session
//! - `GET /health` - Health check with live session count
//! - `GET /sessions` - Live sessions and their stages
//! - `GET /` - Server info

use crate::server::BuildShellServer;
use crate::ws::ws_handler;
use axum::{
    extract::State,
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the HTTP router.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(server: BuildShellServer) -> Router {
    tracing::debug!("Building HTTP router");

    let router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/sessions", get(sessions_handler))
        .route("/", get(root_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(server);

    tracing::debug!("HTTP router built with routes: /, /health, /sessions, /ws");
    router
}

/// Health check endpoint.
async fn health_handler(State(server): State<BuildShellServer>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "buildshell-server",
        "active_sessions": server.orchestrator().registry().len(),
    }))
}

/// Live sessions.
async fn sessions_handler(State(server): State<BuildShellServer>) -> impl IntoResponse {
    Json(server.sessions())
}

/// Root endpoint with server info.
async fn root_handler() -> impl IntoResponse {
    tracing::trace!("Root page request");
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>buildshell</title>
    <style>
        body { font-family: system-ui; max-width: 800px; margin: 50px auto; padding: 20px; }
        code { background: #f4f4f4; padding: 2px 6px; border-radius: 3px; }
        pre { background: #f4f4f4; padding: 16px; border-radius: 6px; overflow-x: auto; }
    </style>
</head>
<body>
    <h1>buildshell</h1>
    <p>Builds a container image from a recipe and opens a shell inside it.</p>

    <h2>Endpoints</h2>
    <ul>
        <li><code>GET /ws?spec=&lt;url&gt;</code> - WebSocket session (optional <code>cols</code>, <code>rows</code>)</li>
        <li><code>GET /health</code> - Health check</li>
        <li><code>GET /sessions</code> - Live sessions</li>
    </ul>

    <h2>Protocol</h2>
    <p>Text messages carry build logs and diagnostics. Once the shell is
    attached the server switches to binary messages carrying raw terminal
    output; anything the client sends is written to the terminal. Sending a
    single <code>0x03</code> byte before the shell is attached cancels the build.</p>

    <h2>Example</h2>
    <pre>websocat "ws://localhost:8080/ws?spec=https://example.com/recipe.yaml"</pre>
</body>
</html>"#,
    )
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    server: BuildShellServer,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(server);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerConfig;

    #[test]
    fn test_build_router() {
        let server = BuildShellServer::new(&ServerConfig::default()).unwrap();
        let _router = build_router(server);
        // Router builds without panic
    }
}
