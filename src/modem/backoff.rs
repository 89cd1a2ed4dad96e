//! Reconnect delay policy for the connection supervisor.
use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectConfig;

/// Exponential backoff with monotonic jitter.
///
/// Between two calls to [`Backoff::reset`] the returned delays never decrease
/// and never exceed `max_delay`. With jitter enabled each delay is drawn from
/// `[previous delay, current base]`, so retries spread out without ever
/// getting shorter than the last one.
#[derive(Debug, Clone)]
pub struct Backoff {
    min_delay: Duration,
    max_delay: Duration,
    factor: f64,
    jitter: bool,
    current: Duration,
    previous: Duration,
}

impl Backoff {
    pub fn new(min_delay: Duration, max_delay: Duration, factor: f64, jitter: bool) -> Self {
        let max_delay = max_delay.max(min_delay);
        let factor = if factor.is_finite() && factor >= 1.0 { factor } else { 1.0 };
        Self {
            min_delay,
            max_delay,
            factor,
            jitter,
            current: min_delay,
            previous: min_delay,
        }
    }

    pub fn from_config(cfg: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.min_delay_secs),
            Duration::from_secs(cfg.max_delay_secs),
            cfg.factor,
            cfg.jitter,
        )
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay to wait before the next attempt; advances the base for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let delay = if self.jitter && base > self.previous {
            let lo = self.previous.as_millis() as u64;
            let hi = base.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
        } else {
            base
        };
        let delay = delay.max(self.previous).min(self.max_delay);

        self.previous = delay;
        self.current = base.mul_f64(self.factor).min(self.max_delay);
        delay
    }

    /// Back to `min_delay`; called after every successful connection.
    pub fn reset(&mut self) {
        self.current = self.min_delay;
        self.previous = self.min_delay;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn doubles_without_jitter_and_caps() {
        let mut b = Backoff::new(secs(5), secs(60), 2.0, false);
        let seq: Vec<u64> = (0..6).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(seq, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn jittered_sequence_is_monotonic_and_bounded() {
        for _ in 0..50 {
            let mut b = Backoff::new(secs(5), secs(60), 2.0, true);
            let mut last = Duration::ZERO;
            for _ in 0..12 {
                let d = b.next_delay();
                assert!(d >= last, "{d:?} < {last:?}");
                assert!(d >= secs(5));
                assert!(d <= secs(60));
                last = d;
            }
        }
    }

    #[test]
    fn reset_returns_to_min() {
        let mut b = Backoff::new(secs(5), secs(60), 2.0, true);
        for _ in 0..5 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.next_delay(), secs(5));
    }

    #[test]
    fn sanitizes_bad_parameters() {
        let mut b = Backoff::new(secs(10), secs(1), 0.5, false);
        assert_eq!(b.max_delay(), secs(10));
        assert_eq!(b.next_delay(), secs(10));
        assert_eq!(b.next_delay(), secs(10));
    }
}
