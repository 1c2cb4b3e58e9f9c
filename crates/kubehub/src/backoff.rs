//! Exponential backoff with jitter for list/watch retries.

#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
    /// Fraction of each delay added or removed at random, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial: Duration::from_millis(800), max: Duration::from_secs(30), factor: 2, jitter: 0.2 }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    cfg: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { current: cfg.initial, cfg }
    }

    /// Next delay; the undecorated delay grows by `factor` up to `max`.
    pub fn next(&mut self) -> Duration {
        let base = self.current.min(self.cfg.max);
        self.current = base.saturating_mul(self.cfg.factor.max(1)).min(self.cfg.max);
        self.jittered(base)
    }

    /// The capped delay, used for errors that will not clear up quickly.
    pub fn max(&self) -> Duration {
        self.jittered(self.cfg.max)
    }

    pub fn reset(&mut self) {
        self.current = self.cfg.initial;
    }

    /// How long a watch must stay up before the backoff is reset.
    pub fn healthy_after(&self) -> Duration {
        self.cfg.initial * 2
    }

    fn jittered(&self, d: Duration) -> Duration {
        if self.cfg.jitter <= 0.0 {
            return d;
        }
        let spread = d.as_secs_f64() * self.cfg.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((d.as_secs_f64() + offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(initial_ms: u64, max_ms: u64) -> Backoff {
        Backoff::new(BackoffConfig {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms),
            factor: 2,
            jitter: 0.0,
        })
    }

    #[test]
    fn doubles_until_capped() {
        let mut b = plain(100, 500);
        let seq: Vec<_> = (0..5).map(|_| b.next().as_millis()).collect();
        assert_eq!(seq, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn reset_starts_over() {
        let mut b = plain(10, 1000);
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_millis(10));
        assert_eq!(b.healthy_after(), Duration::from_millis(20));
    }

    #[test]
    fn max_below_initial_caps_first_delay() {
        let mut b = plain(50, 20);
        assert_eq!(b.next(), Duration::from_millis(20));
        assert_eq!(b.max(), Duration::from_millis(20));
    }

    #[test]
    fn jitter_stays_in_band() {
        let mut b = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(10),
            factor: 2,
            jitter: 0.2,
        });
        for _ in 0..50 {
            b.reset();
            let d = b.next();
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200), "{:?}", d);
        }
    }
}
