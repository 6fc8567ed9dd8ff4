use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use lumen_llm::StreamChunk;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::orchestrator::SendMessage;
use crate::state::AppState;

/// Marker sent as the data of the closing `end` event.
pub const END_MARKER: &str = "[DONE]";

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub response_id: Option<String>,
}

/// Send a message and stream the response using Server-Sent Events
///
/// One `chunk` event per [`StreamChunk`], then a single `end` event.
/// Precondition and downstream failures are returned as JSON errors before
/// the stream opens.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path((bot_id, thread_id)): Path<(String, String)>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".to_string()));
    }

    let message = SendMessage {
        id: req.id,
        parent_id: req.parent_id,
        response_id: req.response_id,
        ..SendMessage::new(bot_id, thread_id, req.content)
    };

    let chunks = state
        .orchestrator
        .send(message, &state.bot_profile())
        .await?;

    let events = chunks
        .map(|chunk| Ok::<Event, Infallible>(chunk_event(&chunk)))
        .chain(stream::once(async {
            Ok::<Event, Infallible>(Event::default().event("end").data(END_MARKER))
        }));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn chunk_event(chunk: &StreamChunk) -> Event {
    Event::default()
        .event("chunk")
        .json_data(chunk)
        .unwrap_or_else(|e| {
            tracing::error!("Failed to encode chunk: {}", e);
            Event::default()
                .event("error")
                .data("failed to encode chunk")
        })
}
