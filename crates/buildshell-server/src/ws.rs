//! WebSocket transport for sessions.
//!
//! The socket is split into a reader and a writer, each pumped by its own
//! task into the session's bounded queues:
//!
//! ```text
//!   socket ──reader──▶ inbound queue ──▶ Orchestrator
//!   socket ◀──writer── outbound queue ◀── Orchestrator
//! ```

use crate::server::BuildShellServer;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use buildshell_core::{ClientChannel, Frame, SessionRequest, TerminalSize, TransportEnd};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

/// Query parameters of `GET /ws`.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Locator of the recipe to build.
    pub spec: Option<String>,
    /// Initial terminal width.
    pub cols: Option<u16>,
    /// Initial terminal height.
    pub rows: Option<u16>,
}

impl WsParams {
    fn into_request(self) -> SessionRequest {
        let terminal_size = match (self.cols, self.rows) {
            (Some(cols), Some(rows)) if cols > 0 && rows > 0 => Some(TerminalSize { cols, rows }),
            _ => None,
        };
        SessionRequest {
            spec_url: self.spec,
            terminal_size,
        }
    }
}

/// Upgrade handler for `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(server): State<BuildShellServer>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, server, params.into_request()))
}

async fn handle_socket(socket: WebSocket, server: BuildShellServer, request: SessionRequest) {
    let capacity = server.orchestrator().config().queue_capacity;
    let (channel, TransportEnd { inbound, outbound }) = ClientChannel::pair(capacity);
    let (sender, receiver) = socket.split();

    let reader = tokio::spawn(read_socket(receiver, inbound));
    let writer = tokio::spawn(write_socket(sender, outbound));

    let report = server.orchestrator().run_session(request, channel).await;
    tracing::debug!(session_id = %report.id, "Session finished, flushing socket");

    // The writer ends once every queued frame is sent.
    let _ = writer.await;
    reader.abort();
}

/// Socket → inbound queue. Dropping the sender tells the session the client
/// is gone.
async fn read_socket(mut receiver: SplitStream<WebSocket>, inbound: mpsc::Sender<Bytes>) {
    while let Some(message) = receiver.next().await {
        let bytes = match message {
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket read error");
                break;
            }
        };
        if inbound.send(bytes).await.is_err() {
            break;
        }
    }
    tracing::trace!("WebSocket reader finished");
}

/// Outbound queue → socket, then a close frame.
async fn write_socket(mut sender: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Frame>) {
    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        if let Err(e) = sender.send(message).await {
            tracing::debug!(error = %e, "WebSocket write error");
            return;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
    tracing::trace!("WebSocket writer finished");
}
