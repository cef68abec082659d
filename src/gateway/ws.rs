//! Live trace stream
//!
//! WebSocket endpoint scoped to a session. On attach the accumulated trace
//! history is replayed, then every new trace event and fusion update streams
//! as it occurs.

use super::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;

use crate::trace::TraceManager;

pub async fn trace_ws(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let traces = state.traces.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, traces))
}

async fn handle_socket(socket: WebSocket, session_id: String, traces: Arc<TraceManager>) {
    let (mut sender, mut receiver) = socket.split();
    let (subscriber_id, mut rx) = traces.connect(&session_id);

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&message) else {
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    traces.disconnect(&session_id, subscriber_id);
    tracing::info!(%session_id, subscriber_id, "trace stream closed");
}
