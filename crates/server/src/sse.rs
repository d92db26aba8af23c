// Live push session.
//
// One `text/event-stream` per connection. The endpoint never replays history; clients catch up
// through `GET /streams/events/{stream_id}?since=N` after (re)connecting.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Extension, State},
    http::Uri,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::Stream;
use tandem_common::protocol::events::{EventType, StreamEvent};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{info, warn};

use crate::{
    api::{requested_workspace, AppState},
    auth::middleware::{AuthenticatedUser, WorkspaceRole},
    broadcast::hub::WorkspaceScope,
    error::CollabError,
    membership::Actor,
};

/// Platform admins that do not name a workspace receive every workspace's events; everyone
/// else is pinned to the resolved workspace.
pub async fn session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Extension(actor): Extension<Actor>,
    uri: Uri,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, CollabError> {
    actor.require(WorkspaceRole::Viewer)?;

    let scope = if user.app_admin && requested_workspace(uri.query())?.is_none() {
        WorkspaceScope::All
    } else {
        WorkspaceScope::Only(actor.workspace_id)
    };
    let (connection, receiver) = state.hub.register(actor.user_id, scope.clone());
    info!(
        connection_id = %connection.id(),
        user_id = %actor.user_id,
        scope = ?scope,
        "sse session opened"
    );

    let events = ReceiverStream::new(receiver).filter_map(move |event| {
        // Owning the handle keeps the connection registered until the response stream drops.
        let _registered = &connection;
        to_sse_event(&event).map(Ok)
    });

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(state.sse_keepalive)
            .event(Event::default().event(EventType::Ping.as_str()).data("{}")),
    ))
}

/// Named event (`event: <type>`), `id: <streamId>:<sequence>`, JSON frame as data.
pub fn to_sse_event(event: &Arc<StreamEvent>) -> Option<Event> {
    let (event_type, frame) = match event.to_frame() {
        Ok(frame) => frame,
        Err(error) => {
            warn!(error = %error, stream_id = %event.stream_id, "skipping unencodable stream event");
            return None;
        }
    };

    match Event::default()
        .event(event_type.as_str())
        .id(format!("{}:{}", event.stream_id, event.sequence))
        .json_data(&frame)
    {
        Ok(sse_event) => Some(sse_event),
        Err(error) => {
            warn!(error = %error, stream_id = %event.stream_id, "skipping unencodable stream event");
            None
        }
    }
}
