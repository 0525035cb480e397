//! HTTP request handlers: the catch-all proxy route and the `_status`
//! introspection endpoint.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use gateway_core::pipeline::{PipelineOutcome, PipelineRequest, UpstreamBody};
use gateway_core::registry::mask_key;
use gateway_core::trace::confidence;
use tracing::warn;

use crate::state::AppState;

fn presented_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = auth.to_str() {
            if let Some(rest) = s.strip_prefix("Bearer ").or_else(|| s.strip_prefix("bearer ")) {
                return Some(rest.to_string());
            }
        }
    }
    headers
        .get("x-kmi-proxy-token")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// The single catch-all route: forwards everything under the base path to
/// the Request Pipeline.
pub(crate) async fn catch_all(State(core): AppState, path: Option<axum::extract::Path<String>>, req: Request) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();
    let presented = presented_token(&headers);
    let upstream_path = path.map(|p| p.0).unwrap_or_default();

    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(b) => b.to_vec(),
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": "invalid_body"}))).into_response();
        }
    };

    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    let reqwest_headers = convert_headers(&headers);

    let pipeline_request = PipelineRequest {
        method: reqwest_method,
        path: upstream_path,
        query: uri.query().map(|q| q.to_string()),
        headers: reqwest_headers,
        body,
        presented_token: presented,
    };

    match core.handle(pipeline_request).await {
        PipelineOutcome::Json { status, body } => {
            (StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), Json(body)).into_response()
        }
        PipelineOutcome::Upstream { status, headers, body } => {
            let mut builder = Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
            for (name, value) in headers.iter() {
                if let (Ok(n), Ok(v)) = (
                    axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
                    axum::http::HeaderValue::from_bytes(value.as_bytes()),
                ) {
                    builder = builder.header(n, v);
                }
            }
            let axum_body = match body {
                UpstreamBody::Buffered(bytes) => Body::from(bytes),
                UpstreamBody::Stream(response) => Body::from_stream(response.bytes_stream()),
            };
            builder.body(axum_body).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

fn convert_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(n, v);
        }
    }
    out
}

/// Observability-only introspection endpoint: masked key list, health
/// cache snapshot, trace fairness confidence. Consumes no upstream
/// credentials and never affects rotation.
pub(crate) async fn status_handler(State(core): AppState) -> Response {
    let keys: Vec<serde_json::Value> = core
        .registry
        .iter()
        .map(|cred| {
            let health = core.health.get(&cred.label);
            serde_json::json!({
                "label": cred.label,
                "masked_secret": mask_key(cred.secret()),
                "disabled": cred.disabled,
                "status": health.as_ref().map(|h| format!("{:?}", h.status)),
                "remaining_percent": health.as_ref().and_then(|h| h.remaining_percent),
            })
        })
        .collect();

    let state_snapshot = core.state.snapshot();
    let recent = core.trace.read_recent(200);
    let trace_confidence = confidence(&recent, 200);

    Json(serde_json::json!({
        "keys": keys,
        "active_index": state_snapshot.active_index,
        "rotation_index": state_snapshot.rotation_index,
        "auto_rotate": state_snapshot.auto_rotate,
        "last_health_refresh_at": state_snapshot.last_health_refresh_at,
        "trace_confidence": trace_confidence,
    }))
    .into_response()
}
