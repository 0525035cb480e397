//! Request Pipeline (component L): the framework-agnostic state machine
//! that composes components A-K per request. The `gateway` binary's axum
//! handler only adapts HTTP framework types to and from this.

use std::sync::Arc;
use std::time::Instant;

use reqwest::header::HeaderMap as ReqHeaderMap;
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::classifier::{self, ClassifierConfig};
use crate::clock::{generate_request_id, Clock};
use crate::config::GatewayConfig;
use crate::dispatcher::{self, DispatchError, DispatchRequest, RetryPolicy};
use crate::health::HealthCache;
use crate::limiter::SlidingWindowLimiter;
use crate::registry::Registry;
use crate::rotation::{self, RotationError};
use crate::state::{BlockReason, StateStore};
use crate::trace::{TraceEntry, TraceSink, TRACE_SCHEMA_VERSION};

pub struct PipelineRequest {
    pub method: reqwest::Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: ReqHeaderMap,
    pub body: Vec<u8>,
    pub presented_token: Option<String>,
}

pub enum UpstreamBody {
    /// 2xx responses are relayed without buffering.
    Stream(reqwest::Response),
    /// Non-2xx responses are buffered once so the classifier can inspect
    /// the body; the same bytes are then relayed to the client.
    Buffered(bytes::Bytes),
}

pub enum PipelineOutcome {
    Json {
        status: u16,
        body: Value,
    },
    Upstream {
        status: u16,
        headers: ReqHeaderMap,
        body: UpstreamBody,
    },
}

/// Owns every component and exposes the single `handle` entry point. This
/// is the "context record threaded through the Pipeline" the Design Notes
/// ask for, rather than a free-floating health-cache variable.
pub struct GatewayCore {
    pub config: GatewayConfig,
    pub registry: Arc<Registry>,
    pub state: Arc<StateStore>,
    pub health: Arc<HealthCache>,
    pub trace: Arc<TraceSink>,
    pub global_limiter: Arc<SlidingWindowLimiter>,
    pub per_key_limiter: Arc<SlidingWindowLimiter>,
    pub http_client: reqwest::Client,
    pub clock: Arc<dyn Clock>,
}

fn json_error(status: u16, error: &str, hint: Option<&str>) -> PipelineOutcome {
    let mut body = serde_json::json!({ "error": error });
    if let Some(h) = hint {
        body["hint"] = Value::String(h.to_string());
    }
    PipelineOutcome::Json { status, body }
}

impl GatewayCore {
    pub async fn handle(&self, request: PipelineRequest) -> PipelineOutcome {
        let request_id = generate_request_id();
        let started = Instant::now();
        info!(request_id = %request_id, method = %request.method, path = %request.path, "request received");

        // RECEIVED -> AUTHORIZED
        if !self.config.proxy_token.is_empty() {
            let presented = request.presented_token.as_deref().unwrap_or("");
            let ok = presented.len() == self.config.proxy_token.len()
                && presented.as_bytes().ct_eq(self.config.proxy_token.as_bytes()).into();
            if !ok {
                return json_error(401, "unauthorized", Some("provide a valid proxy token"));
            }
        }

        // AUTHORIZED -> ADMITTED
        let now = self.clock.now_epoch();
        if !self.global_limiter.allow("global", now) {
            return json_error(429, "rate_limited", Some("global rate limit exceeded"));
        }

        // ADMITTED -> KEY_SELECTED
        let (snapshot_active, snapshot_rotation) = self.state.with_state(|s| (s.active_index, s.rotation_index));
        let health_lookup = |label: &str| self.health.status_of(label);
        let auto = self.config.auto_rotate_allowed
            && self.state.with_state(|s| s.auto_rotate);
        // Strict mode only bites once the cache actually holds data, or a
        // required fail_open_on_empty_cache=false config says it must.
        let strict = self.config.require_usage_before_request
            && (!self.config.fail_open_on_empty_cache || !self.health.is_empty());

        let selection_label = self.state.with_state(|s| {
            if auto {
                rotation::select_round_robin(&self.registry, s, &health_lookup, now, strict).map(|c| c.label.clone())
            } else {
                select_active_or_next_eligible(&self.registry, s, &health_lookup, now, strict)
            }
        });

        let Some(label) = selection_label else {
            return json_error(503, "no_eligible_keys", Some("all keys are blocked, exhausted, or disabled"));
        };
        let Some(cred) = self.registry.lookup(&label).cloned() else {
            warn!(request_id = %request_id, label = %label, "selected label missing from registry");
            return json_error(503, "no_eligible_keys", None);
        };

        // KEY_SELECTED -> KEY_ADMITTED
        if !self.per_key_limiter.allow(&label, now) {
            self.state.with_state(|s| {
                s.active_index = snapshot_active;
                s.rotation_index = snapshot_rotation;
            });
            self.state.mark_dirty();
            return json_error(429, "rate_limited", Some("per-key rate limit exceeded"));
        }

        let rotation_index_at_selection = self.state.with_state(|s| s.rotation_index);

        // KEY_ADMITTED -> DONE (dry run)
        if self.config.dry_run {
            self.state.record_request(&label, 200);
            let upstream_url = format!(
                "{}/{}{}",
                cred.base_url_override.as_deref().unwrap_or(&self.config.upstream_base_url),
                request.path,
                request.query.as_deref().map(|q| format!("?{q}")).unwrap_or_default()
            );
            let (hint, first_word) = extract_prompt_hint(&request.body, request.headers.get("content-type").and_then(|v| v.to_str().ok()));
            self.emit_trace(&request_id, &request.method, &request.path, 200, started, Some(&label), Some(&cred.secret_hash), Some(rotation_index_at_selection), hint, first_word, None);
            return PipelineOutcome::Json {
                status: 200,
                body: serde_json::json!({
                    "dry_run": true,
                    "upstream_url": upstream_url,
                    "method": request.method.as_str(),
                    "path": request.path,
                    "key_label": label,
                }),
            };
        }

        // KEY_ADMITTED -> DISPATCHED
        let base_url = cred.base_url_override.clone().unwrap_or_else(|| self.config.upstream_base_url.clone());
        let url = format!(
            "{}/{}{}",
            base_url.trim_end_matches('/'),
            request.path,
            request.query.as_deref().map(|q| format!("?{q}")).unwrap_or_default()
        );
        let sanitized = dispatcher::sanitize_headers(request.headers.clone(), cred.secret());
        let (hint, first_word) = extract_prompt_hint(&request.body, request.headers.get("content-type").and_then(|v| v.to_str().ok()));

        let dispatch_request = DispatchRequest {
            method: request.method.clone(),
            url,
            headers: sanitized,
            body: request.body,
            secret: cred.secret().to_string(),
        };
        let retry_policy = RetryPolicy {
            retry_max: self.config.retry_max,
            retry_base_ms: self.config.retry_base_ms,
        };

        // DISPATCHED -> CLASSIFIED
        let response = match dispatcher::dispatch(&self.http_client, dispatch_request, &retry_policy).await {
            Ok(r) => r,
            Err(DispatchError::UpstreamTransport(_)) | Err(DispatchError::InvalidUrl(_)) => {
                self.state.record_request(&label, 503);
                self.emit_trace(&request_id, &request.method, &request.path, 502, started, Some(&label), Some(&cred.secret_hash), Some(rotation_index_at_selection), hint, first_word, Some("upstream_error"));
                return json_error(502, "upstream_error", Some("upstream connection failed after retries"));
            }
        };

        let status = response.status().as_u16();
        self.state.record_request(&label, status);

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| classifier::parse_retry_after(v, chrono::Utc::now()));

        let classifier_config = ClassifierConfig {
            rotation_cooldown_seconds: self.config.rotation_cooldown_seconds,
            payment_block_seconds: self.config.payment_block_seconds,
            extra_payment_tokens: self.config.extra_payment_tokens.clone(),
        };
        let response_headers = dispatcher::filter_response_headers(response.headers());

        // Classifying the error body requires buffering it once; 2xx
        // responses skip that and stream straight through.
        let (error_code, body) = if (200..400).contains(&status) {
            (None, UpstreamBody::Stream(response))
        } else {
            let bytes = response.bytes().await.unwrap_or_default();
            let body_text = String::from_utf8_lossy(&bytes).to_string();
            let outcome = classifier::classify(status, &body_text, retry_after, &classifier_config);
            self.apply_outcome(&label, &outcome, now);
            let code = match &outcome {
                classifier::Outcome::Block { reason: BlockReason::PaymentRequired, .. } => "payment_required".to_string(),
                _ if status == 429 => "rate_limited".to_string(),
                _ => status.to_string(),
            };
            (Some(code), UpstreamBody::Buffered(bytes))
        };

        self.emit_trace(&request_id, &request.method, &request.path, status, started, Some(&label), Some(&cred.secret_hash), Some(rotation_index_at_selection), hint, first_word, error_code.as_deref());
        info!(request_id = %request_id, key = %label, status, latency_ms = started.elapsed().as_millis() as u64, "request relayed");

        PipelineOutcome::Upstream {
            status,
            headers: response_headers,
            body,
        }
    }

    fn apply_outcome(&self, label: &str, outcome: &classifier::Outcome, now: i64) {
        match outcome {
            classifier::Outcome::Ok => {}
            classifier::Outcome::Exhaust { seconds } => self.state.mark_exhausted(label, *seconds, now),
            classifier::Outcome::Block { reason, seconds } => self.state.mark_blocked(label, *reason, *seconds, now),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_trace(
        &self,
        request_id: &str,
        method: &reqwest::Method,
        path: &str,
        status: u16,
        started: Instant,
        label: Option<&str>,
        key_hash: Option<&str>,
        rotation_index: Option<usize>,
        hint: Option<String>,
        first_word: Option<String>,
        error_code: Option<&str>,
    ) {
        let timestamp = chrono::Utc::now().to_rfc3339();
        self.trace.emit(TraceEntry {
            schema_version: TRACE_SCHEMA_VERSION,
            timestamp,
            request_id: request_id.to_string(),
            method: method.as_str().to_string(),
            path: path.to_string(),
            status,
            latency_ms: started.elapsed().as_millis() as u64,
            key_label: label.map(|s| s.to_string()),
            key_hash: key_hash.map(|s| s.to_string()),
            rotation_index,
            prompt_hint: hint,
            prompt_first_word: first_word,
            error_code: error_code.map(|s| s.to_string()),
        });
    }
}

fn select_active_or_next_eligible(
    registry: &Registry,
    state: &mut crate::state::State,
    health_lookup: &dyn Fn(&str) -> Option<crate::health::HealthStatus>,
    now: i64,
    strict: bool,
) -> Option<String> {
    let active = registry.get(state.active_index);
    if let Some(cred) = active {
        if rotation::is_eligible(cred, state, health_lookup(&cred.label), now, strict) {
            let label = cred.label.clone();
            state.keys.entry(label.clone()).or_default().last_used_at = Some(now);
            return Some(label);
        }
    }
    for (idx, cred) in registry.iter().enumerate() {
        if rotation::is_eligible(cred, state, health_lookup(&cred.label), now, strict) {
            state.active_index = idx;
            state.keys.entry(cred.label.clone()).or_default().last_used_at = Some(now);
            return Some(cred.label.clone());
        }
    }
    None
}

/// Best-effort prompt hint extraction (component L's "Prompt hint
/// extraction"). Never fails: non-JSON or unrecognized shapes yield `None`.
pub fn extract_prompt_hint(body: &[u8], content_type: Option<&str>) -> (Option<String>, Option<String>) {
    let is_json = content_type.map(|ct| ct.contains("json")).unwrap_or(false);
    if !is_json {
        return (None, None);
    }
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return (None, None);
    };
    let Some(obj) = value.as_object() else {
        return (None, None);
    };

    let text = last_message_text(obj).or_else(|| {
        ["prompt", "input", "query", "text"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(|v| v.as_str()).map(|s| s.to_string()))
    });

    let Some(text) = text else {
        return (None, None);
    };
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let words: Vec<&str> = collapsed.split(' ').filter(|w| !w.is_empty()).collect();
    let first_word = words.first().map(|w| w.to_string());

    let mut truncated: Vec<&str> = words.into_iter().take(6).collect();
    let mut hint = truncated.join(" ");
    if hint.chars().count() > 60 {
        hint = hint.chars().take(57).collect::<String>() + "...";
    } else if collapsed.split(' ').count() > truncated.len() {
        truncated.push("...");
        hint = truncated.join(" ");
    }
    (Some(hint), first_word)
}

fn last_message_text(obj: &serde_json::Map<String, Value>) -> Option<String> {
    let messages = obj.get("messages")?.as_array()?;
    for msg in messages.iter().rev() {
        if let Some(content) = msg.get("content") {
            if let Some(s) = content.as_str() {
                return Some(s.to_string());
            }
            if let Some(list) = content.as_array() {
                for item in list.iter().rev() {
                    if let Some(s) = item.as_str() {
                        return Some(s.to_string());
                    }
                    if let Some(s) = item.get("text").and_then(|v| v.as_str()) {
                        return Some(s.to_string());
                    }
                }
            }
            if let Some(s) = content.get("text").and_then(|v| v.as_str()) {
                return Some(s.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_prompt_hint_from_last_message() {
        let body = br#"{"messages":[{"role":"user","content":"hello there"},{"role":"user","content":"what is the weather today please"}]}"#;
        let (hint, first) = extract_prompt_hint(body, Some("application/json"));
        assert_eq!(first, Some("what".to_string()));
        assert!(hint.unwrap().starts_with("what is the weather"));
    }

    #[test]
    fn extract_prompt_hint_non_json_is_none() {
        let (hint, first) = extract_prompt_hint(b"not json", Some("application/json"));
        assert_eq!(hint, None);
        assert_eq!(first, None);
    }

    #[test]
    fn extract_prompt_hint_falls_back_to_prompt_field() {
        let body = br#"{"prompt":"summarize this document for me please right now"}"#;
        let (hint, _) = extract_prompt_hint(body, Some("application/json"));
        assert!(hint.is_some());
    }
}
