//! Rotation Engine (component F): eligibility, round-robin selection, and
//! resource-scored manual rotation with deterministic tie-break reasons.

use std::fmt;

use crate::health::HealthStatus;
use crate::registry::{Credential, Registry};
use crate::state::State;

#[derive(Debug)]
pub enum RotationError {
    NoEligibleKeys,
}

impl fmt::Display for RotationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationError::NoEligibleKeys => write!(f, "no eligible keys"),
        }
    }
}

impl std::error::Error for RotationError {}

/// `health` is `None` when the cache has no entry for the key yet. `strict`
/// is the caller's already-resolved `require_usage_before_request &&
/// !fail_open_on_empty_cache`-or-cache-nonempty decision (see spec.md
/// §4.H); when set, a missing health entry makes the key ineligible rather
/// than passing it through.
pub fn is_eligible(
    key: &Credential,
    state: &State,
    health: Option<HealthStatus>,
    now: i64,
    strict: bool,
) -> bool {
    if key.disabled {
        return false;
    }
    let Some(ks) = state.keys.get(&key.label) else {
        return !strict || health.is_some();
    };
    if ks.err_401 > 0 {
        return false;
    }
    if ks.is_exhausted(now) {
        return false;
    }
    if ks.is_blocked(now) {
        return false;
    }
    match health {
        Some(status) => !matches!(status, HealthStatus::Blocked | HealthStatus::Exhausted),
        None => !strict,
    }
}

/// Round-robin selection: a healthy-first pass, then an eligible-any pass.
/// On selection, advances `state.rotation_index` and stamps `last_used_at`.
pub fn select_round_robin<'a>(
    registry: &'a Registry,
    state: &mut State,
    health: &dyn Fn(&str) -> Option<HealthStatus>,
    now: i64,
    strict: bool,
) -> Option<&'a Credential> {
    let len = registry.len();
    if len == 0 {
        return None;
    }
    let start = state.rotation_index % len;

    let mut healthy_pick = None;
    for offset in 0..len {
        let idx = (start + offset) % len;
        let key = registry.get(idx).expect("index within bounds");
        let status = health(&key.label);
        if is_eligible(key, state, status, now, strict) && status == Some(HealthStatus::Healthy) {
            healthy_pick = Some(idx);
            break;
        }
    }

    let selected_idx = if let Some(idx) = healthy_pick {
        Some(idx)
    } else {
        let mut fallback = None;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let key = registry.get(idx).expect("index within bounds");
            let status = health(&key.label);
            if is_eligible(key, state, status, now, strict) {
                fallback = Some(idx);
                break;
            }
        }
        fallback
    };

    let idx = selected_idx?;
    state.rotation_index = (idx + 1) % len;
    let label = registry.get(idx).expect("index within bounds").label.clone();
    state.keys.entry(label).or_default().last_used_at = Some(now);
    registry.get(idx)
}

pub struct ManualRotationOutcome<'a> {
    pub key: &'a Credential,
    pub rotated: bool,
    pub reason: Option<String>,
}

fn status_rank(status: Option<HealthStatus>) -> u8 {
    match status {
        Some(HealthStatus::Healthy) => 0,
        Some(HealthStatus::Warn) => 1,
        _ => 2,
    }
}

fn score(state: &State, label: &str, status: Option<HealthStatus>, remaining_percent: Option<f64>) -> (u8, i64, i64) {
    let rank = status_rank(status);
    let neg_remaining = -remaining_percent.unwrap_or(1.0);
    let error_rate = state.keys.get(label).map(|k| k.error_rate_for_scoring()).unwrap_or(0.0);
    // Scale floats into comparable fixed-point integers for a total order.
    ((rank), (neg_remaining * 10_000.0) as i64, (error_rate * 10_000.0) as i64)
}

/// Resource-scored manual rotation. `usage_lookup` returns `remaining_percent`
/// for a label, if known; `health_lookup` returns the health status.
pub fn rotate_manual<'a>(
    registry: &'a Registry,
    state: &mut State,
    health_lookup: &dyn Fn(&str) -> Option<HealthStatus>,
    remaining_lookup: &dyn Fn(&str) -> Option<f64>,
    prefer_next_on_tie: bool,
    now: i64,
    strict: bool,
) -> Result<ManualRotationOutcome<'a>, RotationError> {
    let mut candidates: Vec<usize> = (0..registry.len())
        .filter(|&i| {
            let key = registry.get(i).expect("index within bounds");
            is_eligible(key, state, health_lookup(&key.label), now, strict)
        })
        .collect();
    if candidates.is_empty() {
        return Err(RotationError::NoEligibleKeys);
    }
    candidates.sort_by_key(|&i| {
        let label = &registry.get(i).expect("index within bounds").label;
        score(state, label, health_lookup(label), remaining_lookup(label))
    });

    let best_score = score_for(registry, state, health_lookup, remaining_lookup, candidates[0]);
    let best: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&i| score_for(registry, state, health_lookup, remaining_lookup, i) == best_score)
        .collect();

    let current = state.active_index;
    if best.contains(&current) {
        if prefer_next_on_tie && best.len() > 1 {
            let pos = best.iter().position(|&i| i == current).unwrap();
            let next = best[(pos + 1) % best.len()];
            state.active_index = next;
            let key = registry.get(next).expect("index within bounds");
            state.keys.entry(key.label.clone()).or_default().last_used_at = Some(now);
            return Ok(ManualRotationOutcome {
                key,
                rotated: true,
                reason: Some("Tie for best; rotating to next.".to_string()),
            });
        }
        let key = registry.get(current).expect("index within bounds");
        let reason = stay_reason(registry, state, health_lookup, remaining_lookup, current, &best);
        return Ok(ManualRotationOutcome {
            key,
            rotated: false,
            reason: Some(reason),
        });
    }

    let winner = best[0];
    state.active_index = winner;
    let key = registry.get(winner).expect("index within bounds");
    state.keys.entry(key.label.clone()).or_default().last_used_at = Some(now);
    Ok(ManualRotationOutcome {
        key,
        rotated: true,
        reason: None,
    })
}

fn score_for(
    registry: &Registry,
    state: &State,
    health_lookup: &dyn Fn(&str) -> Option<HealthStatus>,
    remaining_lookup: &dyn Fn(&str) -> Option<f64>,
    idx: usize,
) -> (u8, i64, i64) {
    let label = &registry.get(idx).expect("index within bounds").label;
    score(state, label, health_lookup(label), remaining_lookup(label))
}

fn stay_reason(
    registry: &Registry,
    state: &State,
    health_lookup: &dyn Fn(&str) -> Option<HealthStatus>,
    remaining_lookup: &dyn Fn(&str) -> Option<f64>,
    current: usize,
    best: &[usize],
) -> String {
    let current_label = registry.get(current).expect("index within bounds").label.clone();
    let runner = best.iter().copied().find(|&i| i != current);

    let Some(runner_idx) = runner else {
        let status = health_lookup(&current_label);
        return format!("Current key already ranks best (status={}).", status_name(status));
    };
    let runner_label = registry.get(runner_idx).expect("index within bounds").label.clone();

    let cur_score = score_for(registry, state, health_lookup, remaining_lookup, current);
    let runner_score = score_for(registry, state, health_lookup, remaining_lookup, runner_idx);

    if cur_score == runner_score {
        if let Some(pct) = remaining_lookup(&current_label) {
            return format!(
                "Current key ties for best remaining quota ({:.0}%). Keeping current over {}.",
                pct, runner_label
            );
        }
        return format!("Current key ties for best score. Keeping current over {}.", runner_label);
    }

    if let (Some(cur_pct), Some(runner_pct)) = (remaining_lookup(&current_label), remaining_lookup(&runner_label)) {
        return format!(
            "Current key has higher remaining quota ({:.0}%), next best {} has {:.0}%.",
            cur_pct, runner_label, runner_pct
        );
    }

    let cur_err = state.keys.get(&current_label).map(|k| k.error_rate_for_scoring()).unwrap_or(0.0);
    let runner_err = state.keys.get(&runner_label).map(|k| k.error_rate_for_scoring()).unwrap_or(0.0);
    if (cur_err - runner_err).abs() > f64::EPSILON {
        return format!(
            "Current key has lower error rate ({:.0}%), next best {} has {:.0}%.",
            cur_err * 100.0,
            runner_label,
            runner_err * 100.0
        );
    }

    let cur_status = health_lookup(&current_label);
    let runner_status = health_lookup(&runner_label);
    if cur_status != runner_status {
        return format!(
            "Current key has better status ({}), next best {} has ({}).",
            status_name(cur_status),
            runner_label,
            status_name(runner_status)
        );
    }

    format!("Current key already ranks best (status={}).", status_name(cur_status))
}

fn status_name(status: Option<HealthStatus>) -> &'static str {
    match status {
        Some(HealthStatus::Healthy) => "healthy",
        Some(HealthStatus::Warn) => "warn",
        Some(HealthStatus::Blocked) => "blocked",
        Some(HealthStatus::Exhausted) => "exhausted",
        None => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Credential;

    fn registry(labels: &[&str]) -> Registry {
        let creds = labels
            .iter()
            .map(|l| Credential::new(*l, format!("sk-{l}00000000000"), None, 0, false))
            .collect();
        Registry::new(creds).unwrap()
    }

    #[test]
    fn round_robin_cycles_abc() {
        let reg = registry(&["a", "b", "c"]);
        let mut state = State::default();
        let health = |_: &str| Some(HealthStatus::Healthy);
        let mut order = Vec::new();
        for _ in 0..9 {
            let k = select_round_robin(&reg, &mut state, &health, 1000, false).unwrap();
            order.push(k.label.clone());
        }
        assert_eq!(order, vec!["a", "b", "c", "a", "b", "c", "a", "b", "c"]);
        assert_eq!(state.rotation_index, 0);
    }

    #[test]
    fn exhausted_key_excluded_until_timeout() {
        let reg = registry(&["a", "b"]);
        let mut state = State::default();
        state.keys.entry("a".into()).or_default().exhausted_until = Some(2000);
        let health = |_: &str| Some(HealthStatus::Healthy);
        let k = select_round_robin(&reg, &mut state, &health, 1000, false).unwrap();
        assert_eq!(k.label, "b");
    }

    #[test]
    fn tie_break_stay_when_prefer_next_false() {
        let reg = registry(&["a", "b"]);
        let mut state = State::default();
        let health = |_: &str| Some(HealthStatus::Healthy);
        let remaining = |_: &str| Some(100.0);
        let out = rotate_manual(&reg, &mut state, &health, &remaining, false, 1000, false).unwrap();
        assert_eq!(out.key.label, "a");
        assert!(!out.rotated);
        assert!(out.reason.unwrap().to_lowercase().contains("tie"));
    }

    #[test]
    fn tie_break_rotates_when_prefer_next_true() {
        let reg = registry(&["a", "b"]);
        let mut state = State::default();
        let health = |_: &str| Some(HealthStatus::Healthy);
        let remaining = |_: &str| Some(100.0);
        let out = rotate_manual(&reg, &mut state, &health, &remaining, true, 1000, false).unwrap();
        assert_eq!(out.key.label, "b");
        assert!(out.rotated);
    }

    #[test]
    fn no_eligible_keys_fails() {
        let reg = registry(&["a"]);
        let mut state = State::default();
        state.keys.entry("a".into()).or_default().err_401 = 1;
        let health = |_: &str| Some(HealthStatus::Healthy);
        let remaining = |_: &str| Some(100.0);
        let err = rotate_manual(&reg, &mut state, &health, &remaining, false, 1000, false);
        assert!(err.is_err());
    }

    #[test]
    fn strict_mode_excludes_key_with_no_health_entry() {
        let reg = registry(&["a", "b"]);
        let mut state = State::default();
        let health = |label: &str| if label == "a" { None } else { Some(HealthStatus::Healthy) };
        let k = select_round_robin(&reg, &mut state, &health, 1000, true).unwrap();
        assert_eq!(k.label, "b");
    }

    #[test]
    fn non_strict_mode_allows_key_with_no_health_entry() {
        let reg = registry(&["a"]);
        let mut state = State::default();
        let health = |_: &str| None;
        let k = select_round_robin(&reg, &mut state, &health, 1000, false).unwrap();
        assert_eq!(k.label, "a");
    }
}
