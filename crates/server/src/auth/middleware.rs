use crate::{
    auth::jwt::{AccessGrant, JwtAccessTokenService},
    error::{ErrorCode, ServerError},
};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Query parameter accepted in place of the `Authorization` header. Browser `EventSource`
/// cannot set headers.
const ACCESS_TOKEN_QUERY_PARAM: &str = "access_token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
    pub workspace_id: uuid::Uuid,
    pub app_admin: bool,
}

/// Workspace roles, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkspaceRole {
    Viewer,
    Editor,
    Admin,
}

impl WorkspaceRole {
    pub fn allows(self, required: WorkspaceRole) -> bool {
        self >= required
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "viewer" => Some(Self::Viewer),
            "editor" => Some(Self::Editor),
            "admin" | "owner" => Some(Self::Admin),
            _ => None,
        }
    }

    pub const fn as_db_value(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Editor => "editor",
            Self::Admin => "admin",
        }
    }
}

pub async fn require_bearer_auth(
    State(jwt_service): State<Arc<JwtAccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(ToOwned::to_owned)
        .or_else(|| request.uri().query().and_then(extract_query_token));

    let Some(token) = token else {
        return unauthorized_response("missing bearer token");
    };

    let AccessGrant { user_id, workspace_id, app_admin, .. } =
        match jwt_service.validate_token(&token) {
            Ok(grant) => grant,
            Err(_) => return unauthorized_response("invalid bearer token"),
        };

    request.extensions_mut().insert(AuthenticatedUser { user_id, workspace_id, app_admin });

    next.run(request).await
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn extract_query_token(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == ACCESS_TOKEN_QUERY_PARAM)
        .map(|(_, value)| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(message: &'static str) -> Response {
    ServerError::new(ErrorCode::AuthInvalidToken, message).into_response()
}
