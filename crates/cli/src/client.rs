// HTTP client for the Tandem server.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Connection;

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// An error envelope returned by the server: `{"error": {"code", "message"}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl ApiError {
    /// Decodes a non-success response body, falling back to the HTTP status when the body is
    /// not an error envelope.
    pub fn from_body(status: StatusCode, body: &str) -> Self {
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => Self {
                status: status.as_u16(),
                code: envelope.error.code,
                message: envelope.error.message,
            },
            Err(_) => Self {
                status: status.as_u16(),
                code: fallback_code(status).to_string(),
                message: if body.trim().is_empty() {
                    status.canonical_reason().unwrap_or("request failed").to_string()
                } else {
                    body.trim().to_string()
                },
            },
        }
    }
}

fn fallback_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "VALIDATION_FAILED",
        StatusCode::UNAUTHORIZED => "AUTH_INVALID_TOKEN",
        StatusCode::FORBIDDEN => "AUTH_FORBIDDEN",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        StatusCode::CONFLICT => "CONFLICT",
        _ => "INTERNAL_ERROR",
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    connection: Connection,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(connection: Connection) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(concat!("tandem-cli/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, connection, timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS) })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Builds `{server}{path}` with the workspace selector and any extra query pairs.
    pub fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self
            .connection
            .server_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("invalid request path `{path}`"))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            if let Some(workspace_id) = self.connection.workspace_id {
                pairs.append_pair("workspace_id", &workspace_id.to_string());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.connection.token)
    }

    pub async fn get<R>(&self, path: &str, query: &[(&str, String)]) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let url = self.url(path, query)?;
        self.send(self.request(Method::GET, url).timeout(self.timeout)).await
    }

    pub async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(path, &[])?;
        self.send(self.request(Method::POST, url).json(body).timeout(self.timeout)).await
    }

    pub async fn delete<R>(&self, path: &str, query: &[(&str, String)]) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let url = self.url(path, query)?;
        self.send(self.request(Method::DELETE, url).timeout(self.timeout)).await
    }

    /// Opens the live push stream. No request timeout: the body stays open until either side
    /// closes it.
    pub async fn open_event_stream(&self) -> Result<Response> {
        let url = self.url("/streams/sse", &[])?;
        let response = self
            .request(Method::GET, url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        ensure_success(response).await
    }

    async fn send<R>(&self, builder: RequestBuilder) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let response = builder.send().await.context("request to tandem server failed")?;
        let response = ensure_success(response).await?;
        response.json::<R>().await.context("failed to decode server response")
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_body(status, &body).into())
}
