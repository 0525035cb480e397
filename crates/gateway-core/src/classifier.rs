//! Error Classifier (component K): maps an upstream `(status, body)` pair
//! to a taxonomy of outcomes and derives cooldown durations, as data
//! rather than scattered `if` statements (per the Design Notes).

use chrono::{DateTime, Utc};

use crate::state::BlockReason;

/// English and Chinese tokens recognized as billing-related. Extensible at
/// runtime via [`ClassifierConfig::extra_payment_tokens`].
pub const DEFAULT_PAYMENT_TOKENS: &[&str] = &[
    "payment",
    "billing",
    "insufficient quota",
    "balance",
    "余额不足",
];

pub struct ClassifierConfig {
    pub rotation_cooldown_seconds: i64,
    pub payment_block_seconds: i64,
    pub extra_payment_tokens: Vec<String>,
}

/// Outcome of classifying one upstream response, as a closed sum type so
/// tests can enumerate it directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok,
    Exhaust { seconds: i64 },
    Block { reason: BlockReason, seconds: i64 },
}

/// Classifies a response. `retry_after` is the parsed `Retry-After` header
/// value in seconds, if present.
pub fn classify(status: u16, body: &str, retry_after: Option<i64>, config: &ClassifierConfig) -> Outcome {
    if status == 402 || (status >= 400 && body_matches_payment_token(body, config)) {
        return Outcome::Block {
            reason: BlockReason::PaymentRequired,
            seconds: config.payment_block_seconds,
        };
    }
    match status {
        200..=399 => Outcome::Ok,
        401 => Outcome::Ok, // record_request's own counter increment does the invalidation
        403 => Outcome::Exhaust {
            seconds: config.rotation_cooldown_seconds,
        },
        429 => Outcome::Exhaust {
            seconds: retry_after.unwrap_or(config.rotation_cooldown_seconds),
        },
        500..=599 => Outcome::Exhaust {
            seconds: config.rotation_cooldown_seconds.min(60),
        },
        _ => Outcome::Ok,
    }
}

fn body_matches_payment_token(body: &str, config: &ClassifierConfig) -> bool {
    let lower = body.to_lowercase();
    DEFAULT_PAYMENT_TOKENS
        .iter()
        .any(|t| lower.contains(&t.to_lowercase()))
        || config.extra_payment_tokens.iter().any(|t| lower.contains(&t.to_lowercase()))
}

/// Parses a `Retry-After` header value: either an integer number of
/// seconds, or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<i64> {
    if let Ok(secs) = value.trim().parse::<i64>() {
        return Some(secs.max(0));
    }
    let parsed = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta = parsed.with_timezone(&Utc) - now;
    Some(delta.num_seconds().max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClassifierConfig {
        ClassifierConfig {
            rotation_cooldown_seconds: 300,
            payment_block_seconds: 3600,
            extra_payment_tokens: Vec::new(),
        }
    }

    #[test]
    fn success_status_is_ok() {
        assert_eq!(classify(200, "", None, &config()), Outcome::Ok);
    }

    #[test]
    fn status_402_blocks_for_payment() {
        let outcome = classify(402, r#"{"error":"insufficient_quota"}"#, None, &config());
        assert_eq!(
            outcome,
            Outcome::Block {
                reason: BlockReason::PaymentRequired,
                seconds: 3600
            }
        );
    }

    #[test]
    fn body_token_blocks_even_on_generic_4xx() {
        let outcome = classify(400, "account balance too low", None, &config());
        assert!(matches!(outcome, Outcome::Block { reason: BlockReason::PaymentRequired, .. }));
    }

    #[test]
    fn chinese_payment_token_is_recognized() {
        let outcome = classify(400, "余额不足，请充值", None, &config());
        assert!(matches!(outcome, Outcome::Block { .. }));
    }

    #[test]
    fn payment_token_in_2xx_body_does_not_block() {
        let outcome = classify(200, "your account balance is healthy", None, &config());
        assert_eq!(outcome, Outcome::Ok);
    }

    #[test]
    fn status_403_exhausts_for_rotation_cooldown() {
        assert_eq!(classify(403, "", None, &config()), Outcome::Exhaust { seconds: 300 });
    }

    #[test]
    fn status_429_uses_retry_after_when_present() {
        assert_eq!(classify(429, "", Some(7), &config()), Outcome::Exhaust { seconds: 7 });
    }

    #[test]
    fn status_429_falls_back_to_rotation_cooldown() {
        assert_eq!(classify(429, "", None, &config()), Outcome::Exhaust { seconds: 300 });
    }

    #[test]
    fn status_5xx_is_capped_at_60_seconds() {
        assert_eq!(classify(500, "", None, &config()), Outcome::Exhaust { seconds: 60 });
    }

    #[test]
    fn retry_after_integer_seconds_parses() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("7", now), Some(7));
    }
}
