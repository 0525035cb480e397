mod auth;
mod background;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::any;
use axum::Router;
use clap::Parser;
use gateway_core::config::GatewayConfig;
use gateway_core::health::{HealthCache, RefresherConfig};
use gateway_core::limiter::SlidingWindowLimiter;
use gateway_core::pipeline::GatewayCore;
use gateway_core::registry::{Credential, Registry};
use gateway_core::state::{self, StateStore};
use gateway_core::trace::TraceSink;
use gateway_core::clock::SystemClock;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::auth::AccessLogLayer;

/// A local HTTP reverse proxy that rotates across a pool of upstream API
/// keys, tracks per-key health, and persists rotation state across
/// restarts.
#[derive(Parser)]
#[command(name = "kmi-gatewayd", about = "multi-key API gateway", version)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8787", env = "KMI_GATEWAY_LISTEN")]
    listen: String,

    /// Directory for state.json and the trace log.
    #[arg(long, default_value = "./kmi-gateway-data", env = "KMI_GATEWAY_STATE_DIR")]
    state_dir: PathBuf,

    /// Base path the catch-all route is mounted under.
    #[arg(long, default_value = "/kmi-rotor/v1", env = "KMI_GATEWAY_BASE_PATH")]
    base_path: String,

    /// Credentials as `label:secret[:base_url[:priority]]`, comma-separated.
    /// Parsing richer credential file formats is outside this crate's scope.
    #[arg(long, env = "KMI_GATEWAY_KEYS")]
    keys: String,

    /// Default upstream base URL, used when a credential has no override.
    #[arg(long, env = "KMI_GATEWAY_UPSTREAM_BASE_URL")]
    upstream_base_url: String,

    #[arg(long, env = "KMI_GATEWAY_AUTO_ROTATE_ALLOWED", default_value_t = true)]
    auto_rotate_allowed: bool,

    #[arg(long, env = "KMI_GATEWAY_ROTATION_COOLDOWN_SECONDS", default_value_t = 300)]
    rotation_cooldown_seconds: i64,

    #[arg(long, env = "KMI_GATEWAY_RETRY_MAX", default_value_t = 2)]
    retry_max: u32,

    #[arg(long, env = "KMI_GATEWAY_RETRY_BASE_MS", default_value_t = 500)]
    retry_base_ms: u64,

    #[arg(long, env = "KMI_GATEWAY_MAX_RPS", default_value_t = 0)]
    max_rps: i64,

    #[arg(long, env = "KMI_GATEWAY_MAX_RPM", default_value_t = 0)]
    max_rpm: i64,

    #[arg(long, env = "KMI_GATEWAY_MAX_RPS_PER_KEY", default_value_t = 0)]
    max_rps_per_key: i64,

    #[arg(long, env = "KMI_GATEWAY_MAX_RPM_PER_KEY", default_value_t = 0)]
    max_rpm_per_key: i64,

    #[arg(long, env = "KMI_GATEWAY_DRY_RUN", default_value_t = false)]
    dry_run: bool,

    /// When set, requires `Authorization: Bearer <token>` or
    /// `X-KMI-Proxy-Token: <token>` on every request.
    #[arg(long, env = "KMI_GATEWAY_PROXY_TOKEN", default_value = "")]
    proxy_token: String,

    #[arg(long, env = "KMI_GATEWAY_REQUIRE_USAGE_BEFORE_REQUEST", default_value_t = false)]
    require_usage_before_request: bool,

    #[arg(long, env = "KMI_GATEWAY_FAIL_OPEN_ON_EMPTY_CACHE", default_value_t = true)]
    fail_open_on_empty_cache: bool,

    #[arg(long, env = "KMI_GATEWAY_USAGE_CACHE_SECONDS", default_value_t = 300)]
    usage_cache_seconds: i64,

    #[arg(long, env = "KMI_GATEWAY_PAYMENT_BLOCK_SECONDS", default_value_t = 3600)]
    payment_block_seconds: i64,

    #[arg(long, env = "KMI_GATEWAY_BLOCKLIST_RECHECK_SECONDS", default_value_t = 600)]
    blocklist_recheck_seconds: i64,

    #[arg(long, env = "KMI_GATEWAY_BLOCKLIST_RECHECK_MAX", default_value_t = 3)]
    blocklist_recheck_max: usize,

    #[arg(long, env = "KMI_GATEWAY_TRACE_MAX_BYTES", default_value_t = 10 * 1024 * 1024)]
    trace_max_bytes: u64,

    #[arg(long, env = "KMI_GATEWAY_TRACE_MAX_BACKUPS", default_value_t = 5)]
    trace_max_backups: u32,

    #[arg(long, env = "KMI_GATEWAY_TIME_ZONE", default_value = "UTC")]
    time_zone: String,

    #[arg(long, env = "KMI_GATEWAY_EXTRA_PAYMENT_TOKENS", value_delimiter = ',')]
    extra_payment_tokens: Vec<String>,

    #[arg(long, env = "KMI_GATEWAY_PREFER_NEXT_ON_TIE", default_value_t = false)]
    prefer_next_on_tie: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, default_value_t = false)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    let filter = EnvFilter::from_default_env().add_directive(format!("gateway={level}").parse().unwrap()).add_directive(format!("gateway_core={level}").parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_credentials(raw: &str) -> Vec<Credential> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.trim().split(':').collect();
            let label = parts.first().copied().unwrap_or_default().to_string();
            let secret = parts.get(1).copied().unwrap_or_default().to_string();
            let base_url = parts.get(2).filter(|s| !s.is_empty()).map(|s| s.to_string());
            let priority = parts.get(3).and_then(|s| s.parse::<i32>().ok()).unwrap_or(0);
            Credential::new(label, secret, base_url, priority, false)
        })
        .collect()
}

fn build_config(args: &Args) -> GatewayConfig {
    GatewayConfig {
        upstream_base_url: args.upstream_base_url.clone(),
        auto_rotate_allowed: args.auto_rotate_allowed,
        rotation_cooldown_seconds: args.rotation_cooldown_seconds,
        retry_max: args.retry_max,
        retry_base_ms: args.retry_base_ms,
        max_rps: args.max_rps,
        max_rpm: args.max_rpm,
        max_rps_per_key: args.max_rps_per_key,
        max_rpm_per_key: args.max_rpm_per_key,
        dry_run: args.dry_run,
        proxy_token: args.proxy_token.clone(),
        require_usage_before_request: args.require_usage_before_request,
        fail_open_on_empty_cache: args.fail_open_on_empty_cache,
        usage_cache_seconds: args.usage_cache_seconds,
        payment_block_seconds: args.payment_block_seconds,
        blocklist_recheck_seconds: args.blocklist_recheck_seconds,
        blocklist_recheck_max: args.blocklist_recheck_max,
        trace_max_bytes: args.trace_max_bytes,
        trace_max_backups: args.trace_max_backups,
        time_zone: args.time_zone.clone(),
        extra_payment_tokens: args.extra_payment_tokens.clone(),
        prefer_next_on_tie: args.prefer_next_on_tie,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);
    info!(version = env!("CARGO_PKG_VERSION"), git_sha = gateway_core::GIT_SHA, "kmi-gatewayd starting");

    let credentials = parse_credentials(&args.keys);
    let registry = match Registry::new(credentials) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!("invalid credential registry: {e}");
            std::process::exit(1);
        }
    };
    if registry.is_empty() {
        warn!("starting with an empty key registry; every request will receive 503");
    }

    let config = build_config(&args);

    // Lifespan: State, Trace, Refresher, HTTP client, in that order.
    let initial_state = state::load(&args.state_dir, &registry, &SystemClock).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load state, starting from zero");
        gateway_core::state::State::default()
    });
    let state_store = Arc::new(StateStore::new(args.state_dir.clone(), initial_state));
    state_store.start();

    let trace_sink = Arc::new(TraceSink::new(args.state_dir.join("trace"), args.trace_max_bytes, args.trace_max_backups));
    trace_sink.start();

    let health_cache = Arc::new(HealthCache::new());
    let refresher_handle = background::spawn_refresher(
        Arc::clone(&registry),
        Arc::clone(&state_store),
        Arc::clone(&health_cache),
        RefresherConfig {
            upstream_base_url: args.upstream_base_url.clone(),
            usage_cache_seconds: args.usage_cache_seconds,
            blocklist_recheck_seconds: args.blocklist_recheck_seconds,
            blocklist_recheck_max: args.blocklist_recheck_max,
        },
    );
    let memory_purger_handle = background::spawn_memory_purger(Duration::from_secs(300));

    let http_client = reqwest::Client::builder()
        .build()
        .expect("failed to build upstream HTTP client");

    let core = Arc::new(GatewayCore {
        config,
        registry: Arc::clone(&registry),
        state: Arc::clone(&state_store),
        health: Arc::clone(&health_cache),
        trace: Arc::clone(&trace_sink),
        global_limiter: Arc::new(SlidingWindowLimiter::new(args.max_rps, args.max_rpm)),
        per_key_limiter: Arc::new(SlidingWindowLimiter::new(args.max_rps_per_key, args.max_rpm_per_key)),
        http_client,
        clock: Arc::new(SystemClock),
    });

    let wildcard = format!("{}/{{*rest}}", args.base_path.trim_end_matches('/'));
    let status_path = format!("{}/_status", args.base_path.trim_end_matches('/'));

    let app = Router::new()
        .route(&args.base_path, any(handlers::catch_all))
        .route(&wildcard, any(handlers::catch_all))
        .route(&status_path, axum::routing::get(handlers::status_handler))
        .with_state(core)
        .layer(AccessLogLayer)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new());

    let addr: SocketAddr = args.listen.parse().expect("invalid listen address");
    info!(%addr, base_path = %args.base_path, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind");
    let shutdown = shutdown_signal();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .expect("server error");

    info!("shutting down");
    refresher_handle.abort();
    memory_purger_handle.abort();
    trace_sink.stop().await;
    state_store.stop().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
