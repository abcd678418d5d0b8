//! WebSocket bridge between one client connection and one session.
//!
//! The socket forwards inbound `input`/`resize`/`signal` messages to the
//! session and the session's outbound frames to the client, in order.
//! Losing the socket detaches the subscriber but never closes the session;
//! idle timeout or an explicit close decides that.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, CloseReason, FrameKind, ServerMessage};
use uuid::Uuid;

use super::GatewayState;
use crate::session::{Session, SessionError, SessionManager};

type Sender = SplitSink<WebSocket, Message>;

/// WebSocket upgrade handler.
///
/// GET /ws/terminal/{session_id}
pub(super) async fn ws_handler<M: SessionManager + 'static>(
    State(state): State<Arc<GatewayState<M>>>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket<M: SessionManager>(
    socket: WebSocket,
    state: Arc<GatewayState<M>>,
    session_id: String,
) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    let session = match state.registry.acquire_or_create(&session_id).await {
        Ok(session) => session,
        Err(e) => {
            let reason = match e {
                SessionError::LimitReached(_) => CloseReason::SessionLimit,
                _ => CloseReason::SpawnFailed,
            };
            tracing::warn!(
                conn_id = %conn_id,
                session_id = %session_id,
                error = %e,
                "Rejecting connection"
            );
            send_closed(&mut sender, reason).await;
            return;
        }
    };

    let mut output = session.subscribe();
    tracing::info!(
        conn_id = %conn_id,
        session_id = %session_id,
        generation = session.generation(),
        "Client attached"
    );

    loop {
        tokio::select! {
            frame = output.recv() => {
                let Some(frame) = frame else {
                    // Queue closed without a closed frame reaching us.
                    let reason = session.close_reason().unwrap_or(CloseReason::IoError);
                    send_closed(&mut sender, reason).await;
                    break;
                };

                let message = match ServerMessage::from_frame(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(conn_id = %conn_id, kind = %frame.kind(), error = %e, "Skipping unsendable frame");
                        continue;
                    }
                };
                if send_message(&mut sender, &message).await.is_err() {
                    tracing::debug!(conn_id = %conn_id, "Client went away while sending");
                    break;
                }
                if frame.kind() == FrameKind::Closed {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }

            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    apply_client_message(&session, conn_id, text.as_str());
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::debug!(conn_id = %conn_id, "Ignoring binary message");
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!(conn_id = %conn_id, "Client closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    tracing::info!(
        conn_id = %conn_id,
        session_id = %session_id,
        state = %session.state(),
        "Client detached"
    );
}

/// Turns one inbound text message into a session call.
fn apply_client_message(session: &Session, conn_id: Uuid, text: &str) {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(conn_id = %conn_id, error = %e, "Ignoring malformed client message");
            return;
        }
    };

    let result = match message {
        ClientMessage::Input { text } => session.write(text.as_bytes()),
        ClientMessage::Resize { cols, rows } => session.resize(cols, rows),
        ClientMessage::Signal { name } => session.signal(&name),
    };

    match result {
        Ok(()) => {}
        // Expected while the session drains; the client learns from the closed frame.
        Err(e @ SessionError::NotRunning { .. }) => {
            tracing::debug!(conn_id = %conn_id, error = %e, "Dropped client message");
        }
        Err(e) => {
            tracing::warn!(conn_id = %conn_id, session_id = %session.id(), error = %e, "Client message rejected");
        }
    }
}

async fn send_message(sender: &mut Sender, message: &ServerMessage) -> Result<(), axum::Error> {
    let json = message.to_json().map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}

async fn send_closed(sender: &mut Sender, reason: CloseReason) {
    if send_message(sender, &ServerMessage::Closed { reason }).await.is_ok() {
        let _ = sender.send(Message::Close(None)).await;
    }
}
