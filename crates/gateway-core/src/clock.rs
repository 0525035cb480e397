//! Clock & request-id generation (component A).
//!
//! Wall-clock time is read through a trait so tests can inject a fixed or
//! stepped clock without sleeping; production code uses [`SystemClock`].

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

/// Source of wall-clock time, abstracted for deterministic tests.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now_epoch(&self) -> i64;
}

/// Real wall-clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }
}

/// Generates a 16-byte request id, rendered as 32 lowercase hex characters.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_32_hex_chars() {
        let id = generate_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn request_ids_are_not_trivially_repeated() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
    }

    #[test]
    fn system_clock_returns_plausible_epoch() {
        let now = SystemClock.now_epoch();
        // Some time after 2020-01-01 and before a distant future sanity bound.
        assert!(now > 1_577_836_800);
        assert!(now < 4_102_444_800);
    }
}
