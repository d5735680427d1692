use crate::{auth::AuthenticatedUser, state::AppState};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Extension, Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vm_orchestrator::{ClientCommand, Connection, ServerMessage};

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/subscriptions/ws", get(subscribe))
}

async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state, user))
}

/// Parses one text frame and applies it.
pub async fn handle_frame(state: &AppState, connection: &Connection, text: &str) -> ServerMessage {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => state.subscriptions.handle(connection, command).await,
        Err(e) => ServerMessage::reject(format!("malformed command: {}", e)),
    }
}

async fn serve_socket(socket: WebSocket, state: AppState, user: AuthenticatedUser) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.subscriber_buffer);
    let connection = Connection::new(user.account, tx);
    let connection_id = connection.id();
    info!(connection = %connection_id, account = %connection.account(), "Subscriber connected");

    // Replies and broadcasts share the connection's queue.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Cannot encode message");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let reply = handle_frame(&state, &connection, text.as_str()).await;
                if !connection.push(reply) {
                    debug!(connection = %connection_id, "Reply dropped, closing");
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = %connection_id, error = %e, "Socket error");
                break;
            }
        }
    }

    state.subscriptions.disconnect(connection_id);
    writer.abort();
    info!(connection = %connection_id, "Subscriber disconnected");
}
