//! `GET /api/stream`: follow a fanout channel as Server-Sent Events.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::StreamExt;
use futures_util::Stream;
use serde::Deserialize;
use shared::models::{Channel, resolve_channel};
use tracing::info;

use crate::app_state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowParams {
    pub user_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl FollowParams {
    /// The conversation channel for a real id, otherwise the user channel.
    fn channel(&self) -> Channel {
        match self.conversation_id.as_deref() {
            Some(conversation_id) if !conversation_id.is_empty() => {
                resolve_channel(conversation_id, &self.user_id)
            }
            _ => Channel::User(self.user_id.clone()),
        }
    }
}

#[derive(Deserialize)]
struct TypeProbe<'a> {
    #[serde(rename = "type", borrow)]
    kind: Option<&'a str>,
}

/// SSE event name for a payload: its `type` tag when present.
fn event_name(payload: &str) -> Option<String> {
    serde_json::from_str::<TypeProbe<'_>>(payload)
        .ok()
        .and_then(|probe| probe.kind.map(str::to_string))
}

pub async fn sse_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FollowParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    if params.user_id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let channel = params.channel();
    info!(user_id = %params.user_id, channel = %channel, "following stream over SSE");

    let stream = state.resolver.fanout().subscribe(&channel).map(|payload| {
        let mut event = Event::default();
        if let Some(name) = event_name(&payload) {
            event = event.event(name);
        }
        Ok::<_, Infallible>(event.data(&*payload))
    });

    let keepalive = KeepAlive::new()
        .interval(KEEP_ALIVE_INTERVAL)
        .text("keep-alive");

    Ok(Sse::new(stream).keep_alive(keepalive))
}
