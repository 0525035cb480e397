//! Usage Parser & Scorer (component G): turns heterogeneous upstream usage
//! payloads into a normalized [`Usage`] snapshot and scores key health.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::health::HealthStatus;
use crate::state::KeyState;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WindowLimit {
    pub window_seconds: Option<i64>,
    pub used: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub remaining_percent: Option<f64>,
    pub used: Option<i64>,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub reset_hint: Option<String>,
    pub limits: Vec<WindowLimit>,
    pub email: Option<String>,
    pub raw: Value,
}

/// Parses a raw `/usages` JSON payload. Best-effort: unrecognized shapes
/// yield an all-`None` usage rather than an error.
pub fn parse_usage(raw: &Value) -> Usage {
    let explicit_pct = find_f64(raw, &["remaining_percent", "remainingPercent", "percent_remaining"]);

    // Top-level only: a genuine top-level used/limit pair must not be
    // satisfied by descending into the windowed `limits` list, or the
    // widest-window preference below is never reached.
    let used = find_i64_top_level(raw, &["used", "tokens_used", "usage"]);
    let limit = find_i64_top_level(raw, &["limit", "quota", "total"]);
    let derived = match (used, limit) {
        (Some(u), Some(l)) if l > 0 => {
            let remaining = (l - u).max(0);
            Some((remaining, remaining as f64 / l as f64 * 100.0))
        }
        _ => None,
    };

    let limits = find_limits_list(raw);
    let widest = limits
        .iter()
        .max_by_key(|w| w.window_seconds.unwrap_or(0))
        .and_then(|w| match (w.used, w.limit) {
            (Some(u), Some(l)) if l > 0 => Some((l - u).max(0) as f64 / l as f64 * 100.0),
            _ => None,
        });

    let remaining_percent = match (explicit_pct, derived.map(|(_, p)| p)) {
        (Some(p), Some(d)) if (p - d).abs() > 1.0 => Some(d),
        (Some(p), _) => Some(p),
        (None, Some(d)) => Some(d),
        (None, None) => widest,
    };

    let (used, limit, remaining) = match derived {
        Some((remaining, _)) => (used, limit, Some(remaining)),
        None => (used, limit, None),
    };

    let reset_hint = find_str(raw, &["reset_hint", "resetHint", "reset_at", "reset"]);
    let email = find_str(raw, &["email", "user_email", "account_email"]);

    Usage {
        remaining_percent,
        used,
        limit,
        remaining,
        reset_hint,
        limits,
        email,
        raw: raw.clone(),
    }
}

fn find_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    for k in keys {
        if let Some(found) = search(v, k) {
            if let Some(n) = found.as_f64() {
                return Some(n);
            }
        }
    }
    None
}

fn find_i64(v: &Value, keys: &[&str]) -> Option<i64> {
    for k in keys {
        if let Some(found) = search(v, k) {
            if let Some(n) = found.as_i64() {
                return Some(n);
            }
        }
    }
    None
}

/// Like [`find_i64`] but only looks at `v`'s immediate fields, never
/// descending into nested objects or arrays (e.g. the `limits` list).
fn find_i64_top_level(v: &Value, keys: &[&str]) -> Option<i64> {
    let obj = v.as_object()?;
    for k in keys {
        if let Some(n) = obj.get(*k).and_then(|found| found.as_i64()) {
            return Some(n);
        }
    }
    None
}

fn find_str(v: &Value, keys: &[&str]) -> Option<String> {
    for k in keys {
        if let Some(found) = search(v, k) {
            if let Some(s) = found.as_str() {
                return Some(s.to_string());
            }
        }
    }
    None
}

fn find_limits_list(v: &Value) -> Vec<WindowLimit> {
    let Some(found) = search(v, "limits") else {
        return Vec::new();
    };
    let Some(arr) = found.as_array() else {
        return Vec::new();
    };
    arr.iter()
        .map(|item| WindowLimit {
            window_seconds: find_i64(item, &["window_seconds", "window"]),
            used: find_i64(item, &["used"]),
            limit: find_i64(item, &["limit"]),
        })
        .collect()
}

/// Depth-first search for `key` anywhere in the JSON tree.
fn search<'a>(v: &'a Value, key: &str) -> Option<&'a Value> {
    match v {
        Value::Object(map) => {
            if let Some(found) = map.get(key) {
                return Some(found);
            }
            for value in map.values() {
                if let Some(found) = search(value, key) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(|item| search(item, key)),
        _ => None,
    }
}

/// Scores a key's health from its usage snapshot, error counters, and
/// current exhausted/blocked state.
pub fn score_health(usage: Option<&Usage>, key_state: &KeyState, exhausted: bool, blocked: bool) -> HealthStatus {
    if blocked {
        return HealthStatus::Blocked;
    }
    if exhausted {
        return HealthStatus::Exhausted;
    }
    if key_state.err_401 > 0 {
        return HealthStatus::Blocked;
    }
    if let Some(u) = usage {
        if let Some(pct) = u.remaining_percent {
            if pct <= 0.0 {
                return HealthStatus::Blocked;
            }
        }
    }
    if key_state.err_403 > 0 {
        return HealthStatus::Warn;
    }
    let Some(u) = usage else {
        return HealthStatus::Warn;
    };
    if let Some(pct) = u.remaining_percent {
        if pct < 20.0 {
            return HealthStatus::Warn;
        }
    }
    if key_state.err_429 > 0 || key_state.err_5xx > 0 || key_state.error_rate_for_scoring() >= 0.05 {
        return HealthStatus::Warn;
    }
    HealthStatus::Healthy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_used_limit_pair() {
        let raw = serde_json::json!({"used": 40, "limit": 100});
        let usage = parse_usage(&raw);
        assert_eq!(usage.remaining, Some(60));
        assert_eq!(usage.remaining_percent, Some(60.0));
    }

    #[test]
    fn prefers_derived_value_on_disagreement() {
        let raw = serde_json::json!({"used": 90, "limit": 100, "remaining_percent": 50.0});
        let usage = parse_usage(&raw);
        assert_eq!(usage.remaining_percent, Some(10.0));
    }

    #[test]
    fn explicit_percent_used_when_close_to_derived() {
        let raw = serde_json::json!({"used": 40, "limit": 100, "remaining_percent": 60.5});
        let usage = parse_usage(&raw);
        assert_eq!(usage.remaining_percent, Some(60.5));
    }

    #[test]
    fn picks_widest_window_from_limits_list() {
        let raw = serde_json::json!({
            "limits": [
                {"window_seconds": 60, "used": 90, "limit": 100},
                {"window_seconds": 86400, "used": 10, "limit": 100}
            ]
        });
        let usage = parse_usage(&raw);
        assert_eq!(usage.remaining_percent, Some(90.0));
    }

    #[test]
    fn score_401_is_blocked_even_without_explicit_block() {
        let mut ks = KeyState::default();
        ks.err_401 = 1;
        assert_eq!(score_health(None, &ks, false, false), HealthStatus::Blocked);
    }

    #[test]
    fn score_missing_usage_is_warn() {
        let ks = KeyState::default();
        assert_eq!(score_health(None, &ks, false, false), HealthStatus::Warn);
    }

    #[test]
    fn score_plenty_of_quota_is_healthy() {
        let ks = KeyState::default();
        let usage = Usage {
            remaining_percent: Some(80.0),
            ..Default::default()
        };
        assert_eq!(score_health(Some(&usage), &ks, false, false), HealthStatus::Healthy);
    }
}
