pub mod locks;
pub mod streams;

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{rejection::JsonRejection, Extension, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use crate::{
    auth::{
        jwt::JwtAccessTokenService,
        middleware::{require_bearer_auth, AuthenticatedUser},
    },
    broadcast::hub::ConnectionHub,
    error::CollabError,
    locks::LockManager,
    membership::MembershipStore,
    presence::PresenceTracker,
    sse,
    streams::StreamEventLog,
};

const WORKSPACE_QUERY_PARAM: &str = "workspace_id";

#[derive(Clone)]
pub struct AppState {
    pub jwt: Arc<JwtAccessTokenService>,
    pub memberships: MembershipStore,
    pub locks: LockManager,
    pub presence: PresenceTracker,
    pub log: StreamEventLog,
    pub hub: ConnectionHub,
    pub sse_keepalive: Duration,
}

/// The authenticated routes: locks, presence, stream reads/appends and the SSE session.
pub fn router(state: AppState) -> Router {
    let jwt = Arc::clone(&state.jwt);

    Router::new()
        .merge(locks::routes())
        .merge(streams::routes())
        .route("/streams/sse", get(sse::session))
        .route_layer(middleware::from_fn_with_state(state.clone(), resolve_actor))
        .route_layer(middleware::from_fn_with_state(jwt, require_bearer_auth))
        .with_state(state)
}

/// Resolves the caller against the `workspace_id` query parameter (default: the token's
/// workspace) and stores the resulting [`crate::membership::Actor`] on the request.
async fn resolve_actor(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    mut request: Request,
    next: Next,
) -> Response {
    let workspace_id = match requested_workspace(request.uri().query()) {
        Ok(workspace_id) => workspace_id.unwrap_or(user.workspace_id),
        Err(error) => return error.into_response(),
    };

    let actor = match state.memberships.resolve_actor(&user, workspace_id).await {
        Ok(actor) => actor,
        Err(error) => return CollabError::Storage(error).into_response(),
    };

    request.extensions_mut().insert(actor);
    next.run(request).await
}

pub(crate) fn requested_workspace(query: Option<&str>) -> Result<Option<Uuid>, CollabError> {
    let Some(query) = query else {
        return Ok(None);
    };

    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == WORKSPACE_QUERY_PARAM)
        .map(|(_, value)| {
            Uuid::parse_str(value.trim())
                .map_err(|_| CollabError::InvalidRequest(format!("workspace_id '{value}' is not a UUID")))
        })
        .transpose()
}

/// Unwraps a JSON body, reporting malformed input as a validation failure.
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, CollabError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| CollabError::InvalidRequest(rejection.body_text()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Method, Request},
        response::Response,
        Router,
    };
    use chrono::Utc;
    use serde_json::Value;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::{router, AppState};
    use crate::{
        auth::{jwt::JwtAccessTokenService, middleware::WorkspaceRole},
        broadcast::{hub::ConnectionHub, memory::MemoryBus, EventBroadcaster},
        clock::Clock,
        locks::{LockManager, LockStore},
        membership::MembershipStore,
        presence::{PresenceStore, PresenceTracker},
        streams::{EventStore, StreamEventLog},
    };

    pub const TEST_SECRET: &str = "tandem_test_secret_that_is_definitely_long_enough";

    pub struct TestApp {
        pub router: Router,
        pub state: AppState,
        pub clock: Clock,
        pub workspace_id: Uuid,
    }

    impl TestApp {
        pub fn new() -> Self {
            let jwt = Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize"));
            let clock = Clock::manual(Utc::now());
            let log = StreamEventLog::new(
                EventStore::in_memory(),
                EventBroadcaster::new(Arc::new(MemoryBus::default())),
            );
            let state = AppState {
                jwt,
                memberships: MembershipStore::in_memory(),
                locks: LockManager::new(LockStore::in_memory(), log.clone(), clock.clone(), Duration::from_secs(300)),
                presence: PresenceTracker::new(
                    PresenceStore::in_memory(),
                    log.clone(),
                    clock.clone(),
                    Duration::from_secs(60),
                ),
                log,
                hub: ConnectionHub::default(),
                sse_keepalive: Duration::from_secs(15),
            };

            Self { router: router(state.clone()), state, clock, workspace_id: Uuid::new_v4() }
        }

        /// A member of the test workspace holding `role`, with a bearer token for it.
        pub async fn member(&self, role: WorkspaceRole) -> (Uuid, String) {
            let user_id = Uuid::new_v4();
            self.state.memberships.grant(self.workspace_id, user_id, role).await.expect("grant should succeed");
            let token = self
                .state
                .jwt
                .issue_workspace_token(user_id, self.workspace_id)
                .expect("token should be issued");
            (user_id, token)
        }

        pub async fn send(&self, method: Method, uri: &str, token: &str, body: Option<Value>) -> Response {
            let mut builder = Request::builder()
                .method(method)
                .uri(uri)
                .header(AUTHORIZATION, format!("Bearer {token}"));
            let body = match body {
                Some(json) => {
                    builder = builder.header("content-type", "application/json");
                    Body::from(json.to_string())
                }
                None => Body::empty(),
            };

            self.router
                .clone()
                .oneshot(builder.body(body).expect("request should build"))
                .await
                .expect("request should return a response")
        }
    }

    pub async fn read_json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body should read");
        serde_json::from_slice(&body).expect("response body should be valid json")
    }
}
