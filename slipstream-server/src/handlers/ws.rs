//! `GET /ws`: the chat WebSocket.

use std::sync::Arc;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use metrics::gauge;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    app_state::AppState,
    resolver::{Connection, RawFrame},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub user_id: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user_id = params.user_id.trim().to_string();
    if user_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "userId is required").into_response();
    }
    ws.on_upgrade(move |socket| serve_socket(socket, user_id, state))
}

/// Pumps one socket until the client goes away.
///
/// A writer task drains the direct queue and the global channel into the
/// socket; the read loop hands every frame to the resolver without waiting on
/// it, so a slow stream never blocks later frames.
async fn serve_socket(socket: WebSocket, user_id: String, state: Arc<AppState>) {
    let resolver = Arc::clone(&state.resolver);
    let (mut outgoing, mut incoming) = socket.split();
    let (connection, mut direct) = Connection::channel(&user_id, state.connection_capacity);
    let mut global = resolver.fanout().subscribe(&resolver.settings().global());

    gauge!("slipstream_ws_connections").increment(1.0);
    info!(user_id = %user_id, "websocket connected");

    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(frame) = direct.recv() => frame,
                Some(frame) = global.next() => frame,
                else => break,
            };
            if outgoing
                .send(Message::Text(frame.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(message) = incoming.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => RawFrame::Text(text.as_str().to_owned()),
            Ok(Message::Binary(bytes)) => RawFrame::Binary(bytes.to_vec()),
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "websocket read failed");
                break;
            }
        };
        resolver.dispatch(frame, &connection);
    }

    // Streams already running keep their clones of the connection; once the
    // writer is gone their direct sends fail and only fanout continues.
    drop(connection);
    writer.abort();
    gauge!("slipstream_ws_connections").decrement(1.0);
    debug!(user_id = %user_id, "websocket closed");
}
