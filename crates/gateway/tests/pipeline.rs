//! End-to-end Request Pipeline scenarios, exercised through
//! `GatewayCore::handle` against a `wiremock` stand-in upstream rather than
//! a real provider. Covers the literal scenarios from the specification's
//! testable-properties section.

use std::sync::Arc;

use gateway_core::config::GatewayConfig;
use gateway_core::health::HealthCache;
use gateway_core::limiter::SlidingWindowLimiter;
use gateway_core::pipeline::{GatewayCore, PipelineOutcome, PipelineRequest, UpstreamBody};
use gateway_core::registry::{Credential, Registry};
use gateway_core::state::{self, StateStore};
use gateway_core::trace::TraceSink;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(path: &str) -> PipelineRequest {
    PipelineRequest {
        method: reqwest::Method::GET,
        path: path.to_string(),
        query: None,
        headers: reqwest::header::HeaderMap::new(),
        body: Vec::new(),
        presented_token: None,
    }
}

async fn build_core(upstream_base_url: &str, labels: &[&str], config_overrides: impl FnOnce(&mut GatewayConfig)) -> (tempfile::TempDir, Arc<GatewayCore>) {
    let dir = tempfile::tempdir().unwrap();
    let credentials = labels
        .iter()
        .map(|l| Credential::new(*l, format!("sk-{l}0000000000000"), None, 0, false))
        .collect();
    let registry = Arc::new(Registry::new(credentials).unwrap());

    let initial_state = state::load(dir.path(), &registry, &gateway_core::clock::SystemClock).unwrap();
    let state_store = Arc::new(StateStore::new(dir.path().to_path_buf(), initial_state));

    let trace_sink = Arc::new(TraceSink::new(dir.path().join("trace"), 10 * 1024 * 1024, 3));

    let mut config = GatewayConfig {
        upstream_base_url: upstream_base_url.to_string(),
        ..GatewayConfig::default()
    };
    config_overrides(&mut config);

    let core = Arc::new(GatewayCore {
        config,
        registry,
        state: state_store,
        health: Arc::new(HealthCache::new()),
        trace: trace_sink,
        global_limiter: Arc::new(SlidingWindowLimiter::new(0, 0)),
        per_key_limiter: Arc::new(SlidingWindowLimiter::new(0, 0)),
        http_client: reqwest::Client::new(),
        clock: Arc::new(gateway_core::clock::SystemClock),
    });
    (dir, core)
}

#[tokio::test]
async fn round_robin_distribution_across_three_keys() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (_dir, core) = build_core(&server.uri(), &["a", "b", "c"], |_| {}).await;

    let mut selections = Vec::new();
    for _ in 0..9 {
        match core.handle(request("models")).await {
            PipelineOutcome::Upstream { status, .. } => assert_eq!(status, 200),
            PipelineOutcome::Json { status, body } => panic!("unexpected json outcome {status}: {body}"),
        }
        let snapshot = core.state.snapshot();
        selections.push(snapshot.rotation_index);
    }
    // rotation_index after each request cycles 1,2,0,1,2,0,1,2,0 for 3 keys.
    assert_eq!(selections, vec![1, 2, 0, 1, 2, 0, 1, 2, 0]);
}

#[tokio::test]
async fn upstream_429_with_retry_after_excludes_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    let (_dir, core) = build_core(&server.uri(), &["a"], |_| {}).await;

    let outcome = core.handle(request("models")).await;
    match outcome {
        PipelineOutcome::Upstream { status, .. } => assert_eq!(status, 429),
        PipelineOutcome::Json { status, body } => panic!("expected upstream outcome, got json {status}: {body}"),
    }

    let now = gateway_core::clock::SystemClock.now_epoch();
    assert!(core.state.is_exhausted("a", now + 3));
    assert!(!core.state.is_exhausted("a", now + 8));
}

#[tokio::test]
async fn payment_required_body_blocks_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(402).set_body_string(r#"{"error":"insufficient_quota"}"#))
        .mount(&server)
        .await;

    let (_dir, core) = build_core(&server.uri(), &["a"], |c| c.payment_block_seconds = 3600).await;

    match core.handle(request("models")).await {
        PipelineOutcome::Upstream { status, .. } => assert_eq!(status, 402),
        _ => panic!("expected upstream outcome"),
    }

    let now = gateway_core::clock::SystemClock.now_epoch();
    assert!(core.state.is_blocked("a", now));
    assert!(core.state.is_blocked("a", now + 3599));
}

#[tokio::test]
async fn dry_run_end_to_end_reports_upstream_url_without_contacting_it() {
    // No mock registered: a live call would fail/timeout, proving dry-run
    // never reaches the network.
    let (_dir, core) = build_core("https://example.invalid", &["a"], |c| c.dry_run = true).await;

    let outcome = core.handle(request("models")).await;
    match outcome {
        PipelineOutcome::Json { status, body } => {
            assert_eq!(status, 200);
            assert_eq!(body["dry_run"], true);
            assert_eq!(body["method"], "GET");
            assert_eq!(body["path"], "models");
            assert_eq!(body["key_label"], "a");
            assert_eq!(body["upstream_url"], "https://example.invalid/models");
        }
        PipelineOutcome::Upstream { .. } => panic!("dry_run must not dispatch upstream"),
    }

    let recent = core.trace.read_recent(10);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].status, 200);
}
