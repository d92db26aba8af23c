use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Extension, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tandem_common::types::{Lock, ObjectRef, PresenceEntry};

use super::{json_body, AppState};
use crate::{error::CollabError, membership::Actor};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/locks", post(acquire_lock).get(get_lock).delete(release_lock))
        .route("/locks/request-unlock", post(request_unlock))
        .route("/locks/accept-unlock", post(accept_unlock))
        .route("/locks/force-unlock", post(force_unlock))
        .route("/locks/presence", post(record_presence).get(list_presence))
        .route("/locks/presence/leave", post(leave_presence))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectQuery {
    object_type: String,
    object_id: String,
}

impl From<ObjectQuery> for ObjectRef {
    fn from(query: ObjectQuery) -> Self {
        ObjectRef::new(query.object_type, query.object_id)
    }
}

#[derive(Debug, Serialize)]
struct LockEnvelope {
    lock: Option<Lock>,
}

#[derive(Debug, Serialize)]
struct ReleasedEnvelope {
    released: bool,
}

#[derive(Debug, Serialize)]
struct PresenceEnvelope {
    users: Vec<PresenceEntry>,
}

#[derive(Debug, Serialize)]
struct LeftEnvelope {
    left: bool,
}

fn object_query(query: Result<Query<ObjectQuery>, QueryRejection>) -> Result<ObjectRef, CollabError> {
    query
        .map(|Query(query)| query.into())
        .map_err(|rejection| CollabError::InvalidRequest(rejection.body_text()))
}

async fn acquire_lock(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: Result<Json<ObjectRef>, JsonRejection>,
) -> Result<impl IntoResponse, CollabError> {
    let object = json_body(payload)?;
    let lock = state.locks.acquire(&actor, &object).await?;
    Ok((StatusCode::CREATED, Json(LockEnvelope { lock: Some(lock) })))
}

async fn release_lock(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    query: Result<Query<ObjectQuery>, QueryRejection>,
) -> Result<Json<ReleasedEnvelope>, CollabError> {
    let released = state.locks.release(&actor, &object_query(query)?).await?;
    Ok(Json(ReleasedEnvelope { released }))
}

async fn request_unlock(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: Result<Json<ObjectRef>, JsonRejection>,
) -> Result<Json<LockEnvelope>, CollabError> {
    let lock = state.locks.request_unlock(&actor, &json_body(payload)?).await?;
    Ok(Json(LockEnvelope { lock: Some(lock) }))
}

async fn accept_unlock(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: Result<Json<ObjectRef>, JsonRejection>,
) -> Result<Json<LockEnvelope>, CollabError> {
    let lock = state.locks.accept_unlock(&actor, &json_body(payload)?).await?;
    Ok(Json(LockEnvelope { lock: Some(lock) }))
}

async fn force_unlock(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: Result<Json<ObjectRef>, JsonRejection>,
) -> Result<Json<ReleasedEnvelope>, CollabError> {
    let released = state.locks.force_unlock(&actor, &json_body(payload)?).await?;
    Ok(Json(ReleasedEnvelope { released }))
}

async fn get_lock(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    query: Result<Query<ObjectQuery>, QueryRejection>,
) -> Result<Json<LockEnvelope>, CollabError> {
    let lock = state.locks.get_active_lock(&actor, &object_query(query)?).await?;
    Ok(Json(LockEnvelope { lock }))
}

async fn record_presence(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: Result<Json<ObjectRef>, JsonRejection>,
) -> Result<Json<PresenceEnvelope>, CollabError> {
    let users = state.presence.record(&actor, &json_body(payload)?).await?;
    Ok(Json(PresenceEnvelope { users }))
}

async fn list_presence(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    query: Result<Query<ObjectQuery>, QueryRejection>,
) -> Result<Json<PresenceEnvelope>, CollabError> {
    let users = state.presence.list(&actor, &object_query(query)?).await?;
    Ok(Json(PresenceEnvelope { users }))
}

async fn leave_presence(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    payload: Result<Json<ObjectRef>, JsonRejection>,
) -> Result<Json<LeftEnvelope>, CollabError> {
    let left = state.presence.leave(&actor, &json_body(payload)?).await?;
    Ok(Json(LeftEnvelope { left }))
}
