// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use rand::Rng;

/// Shared retry schedule for every reconnecting component: the model client
/// on invalid envelopes, the SSE transport on connect failures, and the
/// stdio transport on relaunch.
///
/// Delays grow exponentially from `base` and are capped at `ceiling`; each
/// delay carries up to ±25% jitter so that concurrent retries do not
/// synchronise against the same endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base: Duration::from_millis(200),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    /// Un-jittered delay for a 0-based attempt index.
    ///
    /// The default policy yields the 0.2 / 0.5 / 1.0 / 2.0 s connect ladder
    /// (geometric ×2.5 then ×2, capped).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let ms = match attempt {
            0 => base_ms,
            1 => base_ms * 5 / 2,
            n => base_ms * 5 / 2 * (1u64 << (n - 1).min(16)),
        };
        Duration::from_millis(ms).min(self.ceiling)
    }

    /// Delay for an attempt with jitter applied (±25%).
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let d = self.delay(attempt).as_millis() as u64;
        if d == 0 {
            return Duration::ZERO;
        }
        let spread = d / 4;
        let lo = d.saturating_sub(spread);
        let hi = d + spread;
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ladder_matches_connect_schedule() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(0), Duration::from_millis(200));
        assert_eq!(p.delay(1), Duration::from_millis(500));
        assert_eq!(p.delay(2), Duration::from_millis(1000));
        assert_eq!(p.delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn delay_is_capped_at_ceiling() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(20), Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = RetryPolicy::default();
        for _ in 0..50 {
            let d = p.jittered_delay(2).as_millis() as u64;
            assert!((750..=1250).contains(&d), "jittered delay out of range: {d}");
        }
    }

    #[test]
    fn attempts_constructor_keeps_schedule() {
        let p = RetryPolicy::new(6);
        assert_eq!(p.attempts, 6);
        assert_eq!(p.delay(0), Duration::from_millis(200));
    }
}
