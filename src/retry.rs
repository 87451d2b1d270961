//! Exponential backoff with jitter for reconnect and flush-retry loops.

use std::time::Duration;

use rand::Rng;

/// Initial reconnect delay.
const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum reconnect delay (cap for exponential backoff).
const MAX_BACKOFF_MS: u64 = 30_000;

/// Jitter applied around each delay (±20%).
const JITTER_FRACTION: f64 = 0.2;

/// Doubling backoff from 1 s to 30 s with ±20% jitter.
///
/// Call [`Backoff::next_delay`] before each retry and [`Backoff::reset`]
/// after a success.
#[derive(Debug)]
pub struct Backoff {
    current_ms: u64,
    max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    /// Backoff with the standard 1 s → 30 s envelope.
    pub fn new() -> Self {
        Self {
            current_ms: INITIAL_BACKOFF_MS,
            max_ms: MAX_BACKOFF_MS,
        }
    }

    /// Backoff with a custom envelope (tests, fast sink retries).
    pub fn with_range(initial: Duration, max: Duration) -> Self {
        Self {
            current_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
    }

    /// Return the jittered delay to sleep for, then double the base.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_ms;
        self.current_ms = (self.current_ms * 2).min(self.max_ms);

        let jitter_span = (base as f64 * JITTER_FRACTION).round() as i64;
        let jitter = if jitter_span > 0 {
            rand::rng().random_range(-jitter_span..=jitter_span)
        } else {
            0
        };
        Duration::from_millis((base as i64 + jitter).max(0) as u64)
    }

    /// Reset to the initial delay after a successful attempt.
    pub fn reset(&mut self) {
        self.current_ms = INITIAL_BACKOFF_MS.min(self.max_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        let mut bases = Vec::new();
        for _ in 0..8 {
            bases.push(backoff.current_ms);
            let _ = backoff.next_delay();
        }
        assert_eq!(bases[0], 1_000);
        assert_eq!(bases[1], 2_000);
        assert_eq!(bases[2], 4_000);
        assert_eq!(*bases.last().unwrap(), 30_000);
    }

    #[test]
    fn test_jitter_within_twenty_percent() {
        let mut backoff = Backoff::new();
        for _ in 0..100 {
            backoff.reset();
            let delay = backoff.next_delay().as_millis() as i64;
            assert!((800..=1_200).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            let _ = backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.current_ms, 1_000);
    }

    #[test]
    fn test_custom_range() {
        let mut backoff =
            Backoff::with_range(Duration::from_millis(10), Duration::from_millis(40));
        assert!(backoff.next_delay() <= Duration::from_millis(12));
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        assert_eq!(backoff.current_ms, 40);
    }
}
