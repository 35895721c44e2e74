use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::pipeline::{Pipeline, PipelineReply, RequestMeta};
use crate::types::ChatCompletionRequest;
use crate::GatewayError;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/internal/health", get(health).post(health))
        .with_state(pipeline)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn chat_completions(
    State(pipeline): State<Arc<Pipeline>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            return error_response(&GatewayError::InvalidRequest(format!(
                "failed to parse request body: {err}"
            )));
        }
    };

    let meta = request_meta(&headers);
    let request_id = meta.request_id.clone();

    match pipeline.chat_completions(meta, req).await {
        Ok(PipelineReply::Unary { body, cached }) => {
            let mut response = Response::new(Body::from(body));
            let headers = response.headers_mut();
            headers.insert("content-type", static_header("application/json"));
            if let Ok(value) = request_id.parse() {
                headers.insert("x-request-id", value);
            }
            if cached {
                headers.insert("x-cache", static_header("hit"));
            }
            response
        }
        Ok(PipelineReply::Stream { events }) => {
            let mut response = Response::new(Body::from_stream(events));
            let headers = response.headers_mut();
            headers.insert("content-type", static_header("text/event-stream"));
            headers.insert("cache-control", static_header("no-cache"));
            if let Ok(value) = request_id.parse() {
                headers.insert("x-request-id", value);
            }
            response
        }
        Err(err) => {
            tracing::info!(request_id = %request_id, error = %err, "request rejected");
            error_response(&err)
        }
    }
}

async fn list_models(State(pipeline): State<Arc<Pipeline>>, headers: HeaderMap) -> Response {
    let meta = request_meta(&headers);
    match pipeline.list_models(&meta).await {
        Ok(listing) => Json(listing).into_response(),
        Err(err) => error_response(&err),
    }
}

fn request_meta(headers: &HeaderMap) -> RequestMeta {
    let authorization = header_value(headers, "authorization");
    let route_id =
        header_value(headers, "x-route-id").or_else(|| header_value(headers, "x-feature"));
    let request_id = header_value(headers, "x-request-id").unwrap_or_else(generate_request_id);
    RequestMeta {
        authorization,
        route_id,
        request_id,
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

fn generate_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req-{millis:x}-{seq:x}")
}

fn static_header(value: &'static str) -> axum::http::HeaderValue {
    axum::http::HeaderValue::from_static(value)
}

fn error_response(err: &GatewayError) -> Response {
    let status = err.status();
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: err.to_string(),
                kind: err.error_type(),
                code: err.code(),
            },
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_header_prefers_x_route_id_over_x_feature() {
        let mut headers = HeaderMap::new();
        headers.insert("x-feature", "legacy".parse().expect("header"));
        let meta = request_meta(&headers);
        assert_eq!(meta.route_id.as_deref(), Some("legacy"));

        headers.insert("x-route-id", "primary".parse().expect("header"));
        let meta = request_meta(&headers);
        assert_eq!(meta.route_id.as_deref(), Some("primary"));
    }

    #[test]
    fn request_ids_are_taken_from_the_header_or_generated() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "req-abc".parse().expect("header"));
        assert_eq!(request_meta(&headers).request_id, "req-abc");

        let headers = HeaderMap::new();
        let a = request_meta(&headers).request_id;
        let b = request_meta(&headers).request_id;
        assert!(a.starts_with("req-"));
        assert_ne!(a, b);
    }
}
