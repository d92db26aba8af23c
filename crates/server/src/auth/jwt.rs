// Workspace-scoped access tokens.
//
// Tokens are minted by the surrounding application; this service verifies them and can mint
// tokens for tests and local tooling with the same shared secret.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TOKEN_ISSUER: &str = "tandem";
pub const TOKEN_AUDIENCE: &str = "tandem-api";
pub const MIN_SECRET_LEN: usize = 32;

pub fn default_token_ttl() -> Duration {
    Duration::minutes(15)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessClaims {
    sub: Uuid,
    workspace_id: Uuid,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    app_admin: bool,
    iss: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Identity carried by a verified access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub user_id: Uuid,
    /// The workspace the session was opened in.
    pub workspace_id: Uuid,
    /// Platform administrators act as workspace admins everywhere.
    pub app_admin: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("jwt secret must be at least {MIN_SECRET_LEN} characters long")]
    WeakSecret,
    #[error("access token expired")]
    Expired,
    #[error("access token rejected: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
    #[error("failed to sign access token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

#[derive(Clone)]
pub struct JwtAccessTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl JwtAccessTokenService {
    pub fn new(secret: &str) -> Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::WeakSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.set_audience(&[TOKEN_AUDIENCE]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl: default_token_ttl(),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn issue_workspace_token(&self, user_id: Uuid, workspace_id: Uuid) -> Result<String, TokenError> {
        self.issue_at(user_id, workspace_id, false, Utc::now())
    }

    pub fn issue_admin_token(&self, user_id: Uuid, workspace_id: Uuid) -> Result<String, TokenError> {
        self.issue_at(user_id, workspace_id, true, Utc::now())
    }

    fn issue_at(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        app_admin: bool,
        issued_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims = AccessClaims {
            sub: user_id,
            workspace_id,
            app_admin,
            iss: TOKEN_ISSUER.to_owned(),
            aud: TOKEN_AUDIENCE.to_owned(),
            iat: issued_at.timestamp(),
            exp: (issued_at + self.ttl).timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(TokenError::Signing)
    }

    pub fn validate_token(&self, token: &str) -> Result<AccessGrant, TokenError> {
        let claims = decode::<AccessClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|error| match error.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(error),
            })?
            .claims;

        Ok(AccessGrant {
            user_id: claims.sub,
            workspace_id: claims.workspace_id,
            app_admin: claims.app_admin,
            expires_at: DateTime::from_timestamp(claims.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC),
        })
    }
}
