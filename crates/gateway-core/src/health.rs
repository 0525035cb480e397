//! Health Cache & Refresher (component H): periodic usage fan-out and
//! bounded blocklist re-probing, owned by one background task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::registry::Registry;
use crate::state::StateStore;
use crate::usage::{parse_usage, score_health, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warn,
    Blocked,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct HealthInfo {
    pub status: HealthStatus,
    pub remaining_percent: Option<f64>,
    pub used: Option<i64>,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub reset_hint: Option<String>,
    pub error_rate: f64,
}

/// Fetches `GET <base_url>/usages` with `Authorization: Bearer <secret>`.
pub trait UsageFetcher: Send + Sync {
    fn fetch(&self, base_url: &str, secret: &str) -> Result<serde_json::Value, String>;
}

/// `reqwest`-backed fetcher with a 10-second timeout, as required for
/// health polling (distinct from the 30-second upstream dispatch timeout).
pub struct ReqwestUsageFetcher {
    client: reqwest::blocking::Client,
}

impl Default for ReqwestUsageFetcher {
    fn default() -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build usage-fetch HTTP client");
        ReqwestUsageFetcher { client }
    }
}

impl UsageFetcher for ReqwestUsageFetcher {
    fn fetch(&self, base_url: &str, secret: &str) -> Result<serde_json::Value, String> {
        let url = format!("{}/usages", base_url.trim_end_matches('/'));
        self.client
            .get(&url)
            .bearer_auth(secret)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| e.to_string())?
            .json::<serde_json::Value>()
            .map_err(|e| e.to_string())
    }
}

/// Process-wide health state, owned exclusively by the refresher; the
/// Pipeline only ever reads a snapshot.
pub struct HealthCache {
    inner: Mutex<HashMap<String, HealthInfo>>,
    cache_ts: Mutex<i64>,
    blocklist_recheck_ts: Mutex<i64>,
}

impl HealthCache {
    pub fn new() -> Self {
        HealthCache {
            inner: Mutex::new(HashMap::new()),
            cache_ts: Mutex::new(0),
            blocklist_recheck_ts: Mutex::new(0),
        }
    }

    pub fn status_of(&self, label: &str) -> Option<HealthStatus> {
        self.inner.lock().expect("health cache poisoned").get(label).map(|h| h.status)
    }

    pub fn remaining_percent_of(&self, label: &str) -> Option<f64> {
        self.inner
            .lock()
            .expect("health cache poisoned")
            .get(label)
            .and_then(|h| h.remaining_percent)
    }

    pub fn get(&self, label: &str) -> Option<HealthInfo> {
        self.inner.lock().expect("health cache poisoned").get(label).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, HealthInfo> {
        self.inner.lock().expect("health cache poisoned").clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("health cache poisoned").is_empty()
    }

    fn set(&self, label: &str, info: HealthInfo) {
        self.inner.lock().expect("health cache poisoned").insert(label.to_string(), info);
    }
}

impl Default for HealthCache {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RefresherConfig {
    pub upstream_base_url: String,
    pub usage_cache_seconds: i64,
    pub blocklist_recheck_seconds: i64,
    pub blocklist_recheck_max: usize,
}

/// Runs the single background refresher task until the process shuts down.
/// Wakes at most once a second; fetches are offloaded to a blocking thread
/// so they never stall the async executor.
pub async fn run_refresh_loop(
    registry: Arc<Registry>,
    state: Arc<StateStore>,
    cache: Arc<HealthCache>,
    fetcher: Arc<dyn UsageFetcher>,
    clock: Arc<dyn Clock>,
    config: RefresherConfig,
) {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let now = clock.now_epoch();

        let cache_due = { now - *cache.cache_ts.lock().expect("health cache poisoned") >= config.usage_cache_seconds };
        if cache_due {
            refresh_all(&registry, &state, &cache, &fetcher, &config.upstream_base_url, now).await;
            *cache.cache_ts.lock().expect("health cache poisoned") = now;
            state.with_state(|s| s.last_health_refresh_at = Some(now));
            state.mark_dirty();
        }

        let recheck_due = {
            now - *cache.blocklist_recheck_ts.lock().expect("health cache poisoned") >= config.blocklist_recheck_seconds
        };
        if recheck_due {
            recheck_blocklist(&registry, &state, &cache, &fetcher, &config.upstream_base_url, now, config.blocklist_recheck_max).await;
            *cache.blocklist_recheck_ts.lock().expect("health cache poisoned") = now;
        }
    }
}

async fn refresh_all(
    registry: &Registry,
    state: &StateStore,
    cache: &HealthCache,
    fetcher: &Arc<dyn UsageFetcher>,
    upstream_base_url: &str,
    now: i64,
) {
    for cred in registry.iter() {
        let label = cred.label.clone();
        let base_url = cred.base_url_override.clone().unwrap_or_else(|| upstream_base_url.to_string());
        let secret = cred.secret().to_string();
        let fetcher = Arc::clone(fetcher);
        let result = tokio::task::spawn_blocking(move || fetcher.fetch(&base_url, &secret)).await;

        match result {
            Ok(Ok(raw)) => {
                let usage = parse_usage(&raw);
                update_cache_from_usage(state, cache, &label, Some(usage), now);
                debug!(key = %label, "usage refreshed");
            }
            Ok(Err(e)) => {
                warn!(key = %label, error = %e, "usage fetch failed, keeping prior entry");
            }
            Err(e) => {
                warn!(key = %label, error = %e, "usage fetch task panicked, keeping prior entry");
            }
        }
    }
}

fn update_cache_from_usage(state: &StateStore, cache: &HealthCache, label: &str, usage: Option<Usage>, now: i64) {
    let exhausted = state.is_exhausted(label, now);
    let blocked = state.is_blocked(label, now);
    let key_state = state.with_state(|s| s.keys.entry(label.to_string()).or_default().clone());
    let status = score_health(usage.as_ref(), &key_state, exhausted, blocked);
    let error_rate = key_state.error_rate_for_operators();
    let info = HealthInfo {
        status,
        remaining_percent: usage.as_ref().and_then(|u| u.remaining_percent),
        used: usage.as_ref().and_then(|u| u.used),
        limit: usage.as_ref().and_then(|u| u.limit),
        remaining: usage.as_ref().and_then(|u| u.remaining),
        reset_hint: usage.as_ref().and_then(|u| u.reset_hint.clone()),
        error_rate,
    };
    cache.set(label, info);
}

async fn recheck_blocklist(
    registry: &Registry,
    state: &StateStore,
    cache: &HealthCache,
    fetcher: &Arc<dyn UsageFetcher>,
    upstream_base_url: &str,
    now: i64,
    max: usize,
) {
    let mut blocked: Vec<(String, i64)> = Vec::new();
    state.with_state(|s| {
        for (label, ks) in s.keys.iter() {
            if ks.is_blocked(now) {
                blocked.push((label.clone(), ks.blocked_until.unwrap_or(0)));
            }
        }
    });
    blocked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    blocked.truncate(max);

    for (label, _) in blocked {
        let Some(cred) = registry.lookup(&label) else { continue };
        let base_url = cred.base_url_override.clone().unwrap_or_else(|| upstream_base_url.to_string());
        let secret = cred.secret().to_string();
        let fetcher = Arc::clone(fetcher);
        let result = tokio::task::spawn_blocking(move || fetcher.fetch(&base_url, &secret)).await;
        if let Ok(Ok(raw)) = result {
            let usage = parse_usage(&raw);
            state.clear_block(&label);
            update_cache_from_usage(state, cache, &label, Some(usage), now);
            debug!(key = %label, "blocklist re-probe succeeded, block cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::registry::Credential;
    use crate::state::load;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubFetcher {
        calls: AtomicUsize,
    }

    impl UsageFetcher for StubFetcher {
        fn fetch(&self, _base_url: &str, _secret: &str) -> Result<serde_json::Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"used": 10, "limit": 100}))
        }
    }

    #[tokio::test]
    async fn refresh_all_populates_cache_for_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(vec![
            Credential::new("a", "sk-aaaaaaaaaaaaaaaa", Some("https://x".into()), 0, false),
            Credential::new("b", "sk-bbbbbbbbbbbbbbbb", Some("https://x".into()), 0, false),
        ])
        .unwrap();
        let state = load(dir.path(), &registry, &SystemClock).unwrap();
        let store = Arc::new(StateStore::new(dir.path().to_path_buf(), state));
        let cache = HealthCache::new();
        let fetcher: Arc<dyn UsageFetcher> = Arc::new(StubFetcher { calls: AtomicUsize::new(0) });

        refresh_all(&registry, &store, &cache, &fetcher, "https://default.example", 1000).await;

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_some());
        assert_eq!(cache.get("a").unwrap().status, HealthStatus::Healthy);
    }
}
