use std::time::Instant;

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::{
    api::{self, AppState},
    error::{
        attach_request_id_header, current_request_id, request_id_from_headers_or_generate, with_request_id_scope,
        ErrorCode, ServerError,
    },
};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

pub fn build_router(state: AppState, cors: CorsLayer) -> Router {
    apply_middleware(Router::new().route("/healthz", get(healthz)).merge(api::router(state))).layer(cors)
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(panic_handler))
        .layer(middleware::from_fn(request_context_middleware))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    // Task-locals do not cross `spawn`; carry the request id into the handler task.
    let request_id = current_request_id().unwrap_or_default();
    let handled = tokio::spawn(with_request_id_scope(request_id, async move { next.run(request).await }));

    match handled.await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            ServerError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, MAX_REQUEST_BODY_BYTES};
    use crate::{
        api::test_support::{read_json, TestApp},
        cors::cors_layer,
    };

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let app = TestApp::new();
        let response = build_router(app.state.clone(), cors_layer(None))
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).expect("request should build"))
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn incoming_request_id_is_echoed_in_errors() {
        let app = TestApp::new();
        let response = build_router(app.state.clone(), cors_layer(None))
            .oneshot(
                Request::builder()
                    .uri("/locks?objectType=folder&objectId=f1")
                    .header("x-request-id", "req-abc")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get("x-request-id").map(|value| value.as_bytes()), Some(&b"req-abc"[..]));
        assert_eq!(read_json(response).await["error"]["request_id"], "req-abc");
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let response = apply_middleware(Router::new().route("/panic", get(panic_route)))
            .oneshot(Request::builder().uri("/panic").body(Body::empty()).expect("request should build"))
            .await
            .expect("panic request should return a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(read_json(response).await["error"]["code"], "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn request_body_limit_is_enforced() {
        async fn echo(body: String) -> String {
            body
        }

        let response = apply_middleware(Router::new().route("/echo", post(echo)))
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .header("content-type", "text/plain")
                    .body(Body::from("a".repeat(MAX_REQUEST_BODY_BYTES + 1)))
                    .expect("request should build"),
            )
            .await
            .expect("echo request should return a response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
