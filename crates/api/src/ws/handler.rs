use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use hireflow_worker::queue::validate_correlation_id;
use tokio::sync::mpsc;

use crate::error::AppResult;
use crate::state::AppState;
use crate::ws::broadcaster::Broadcaster;

/// GET /api/v1/ws/{correlation_id}
///
/// Upgrades to a WebSocket streaming every event for `correlation_id`. The
/// server closes the socket after the terminal event.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(correlation_id): Path<String>,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    validate_correlation_id(&correlation_id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, correlation_id, state.broadcaster)))
}

/// Manage a single WebSocket connection after upgrade.
///
/// The broadcaster's forwarder pushes frames into a channel; a sender task
/// drains it into the sink while this task watches the inbound stream.
/// Whichever side ends first detaches the connection.
async fn handle_socket(socket: WebSocket, correlation_id: String, broadcaster: Arc<Broadcaster>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn_id = broadcaster.attach(&correlation_id, tx).await;

    let (mut sink, mut stream) = socket.split();

    let sender_conn_id = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let recv_conn_id = conn_id.clone();
    let receive = async move {
        while let Some(result) = stream.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Ok(Message::Pong(_)) => {
                    tracing::trace!(conn_id = %recv_conn_id, "Pong received");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(conn_id = %recv_conn_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = &mut send_task => {}
        () = receive => {}
    }

    broadcaster.detach(&conn_id).await;
    send_task.abort();
    tracing::info!(conn_id = %conn_id, correlation_id = %correlation_id, "WebSocket disconnected");
}
