use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Extension, Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tandem_common::protocol::{
    events::{EventPayload, EventType, StreamEvent},
    stream_id,
};

use super::{json_body, AppState};
use crate::{auth::middleware::WorkspaceRole, error::CollabError, membership::Actor};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/streams/events", post(append_event))
        .route("/streams/events/{stream_id}", get(read_events))
}

#[derive(Debug, Default, Deserialize)]
struct ReadQuery {
    since: Option<i64>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventsEnvelope {
    stream_id: String,
    events: Vec<StreamEvent>,
}

/// Producer append. The stream id is taken as given, or derived from the message and job ids.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendRequest {
    stream_id: Option<String>,
    message_id: Option<String>,
    job_id: Option<String>,
    event: EventPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AppendedEnvelope {
    stream_id: String,
    sequence: i64,
}

/// Catch-up read: events after `since`, ascending.
async fn read_events(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(stream_id): Path<String>,
    query: Result<Query<ReadQuery>, QueryRejection>,
) -> Result<Json<EventsEnvelope>, CollabError> {
    actor.require(WorkspaceRole::Viewer)?;
    let Query(ReadQuery { since, limit }) =
        query.map_err(|rejection| CollabError::InvalidRequest(rejection.body_text()))?;

    let events = state.log.read(actor.workspace_id, &stream_id, since, limit).await?;
    Ok(Json(EventsEnvelope { stream_id, events }))
}

async fn append_event(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: Result<Json<AppendRequest>, JsonRejection>,
) -> Result<impl IntoResponse, CollabError> {
    actor.require(WorkspaceRole::Editor)?;
    let request = json_body(payload)?;

    let stream_id = match request.stream_id.filter(|stream_id| !stream_id.trim().is_empty()) {
        Some(stream_id) => stream_id,
        None => stream_id::derive(request.message_id.as_deref(), request.job_id.as_deref()),
    };
    check_producer_event(&stream_id, &request.event)?;
    let written = state.log.append(actor.workspace_id, &stream_id, request.event, request.message_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(AppendedEnvelope { stream_id: written.stream_id, sequence: written.sequence }),
    ))
}

/// Lock and presence notifications and keep-alives are emitted by the server itself.
fn check_producer_event(stream_id: &str, event: &EventPayload) -> Result<(), CollabError> {
    let event_type = event.event_type();
    if matches!(event_type, EventType::LockUpdate | EventType::PresenceUpdate | EventType::Ping) {
        return Err(CollabError::InvalidRequest(format!(
            "{event_type} events are emitted by the server and cannot be appended"
        )));
    }
    if stream_id::is_object_stream(stream_id) {
        return Err(CollabError::InvalidRequest(format!(
            "stream `{stream_id}` is reserved for lock and presence notifications"
        )));
    }
    Ok(())
}
