use std::time::Duration;

use crate::config::RetryCfg;

/// Bounded exponential backoff shared by catch-up window retries and
/// WebSocket resubscription. `max_attempts: None` retries until success,
/// with the delay clamped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn from_cfg(cfg: Option<&RetryCfg>) -> Self {
        let defaults = Self::default();
        let Some(cfg) = cfg else { return defaults };

        Self {
            initial_delay: cfg
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: cfg
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            multiplier: cfg.multiplier.unwrap_or(defaults.multiplier),
            max_attempts: cfg.max_attempts,
        }
    }

    /// Fresh delay sequence; one is created per retried operation so the
    /// backoff resets after each success.
    pub fn delays(&self) -> Delays {
        Delays {
            next_ms: self.initial_delay.as_millis() as f64,
            max_ms: self.max_delay.as_millis() as f64,
            multiplier: self.multiplier,
            remaining: self.max_attempts,
        }
    }
}

pub struct Delays {
    next_ms: f64,
    max_ms: f64,
    multiplier: f64,
    remaining: Option<u32>,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }

        let current = self.next_ms;
        self.next_ms = (self.next_ms * self.multiplier).min(self.max_ms);
        Some(Duration::from_millis(current as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial: u64, max: u64, multiplier: f64, attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(initial),
            max_delay: Duration::from_millis(max),
            multiplier,
            max_attempts: attempts,
        }
    }

    #[test]
    fn delays_grow_and_clamp() {
        let delays: Vec<u64> = policy(100, 400, 2.0, Some(5))
            .delays()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 400, 400]);
    }

    #[test]
    fn unbounded_policy_keeps_yielding() {
        let mut delays = policy(50, 1000, 2.0, None).delays();
        for _ in 0..100 {
            assert!(delays.next().is_some());
        }
    }

    #[test]
    fn attempt_cap_exhausts() {
        let mut delays = policy(100, 400, 2.0, Some(2)).delays();
        assert!(delays.next().is_some());
        assert!(delays.next().is_some());
        assert!(delays.next().is_none());
    }

    #[test]
    fn from_cfg_defaults() {
        let p = RetryPolicy::from_cfg(None);
        assert_eq!(p.initial_delay, Duration::from_millis(1000));
        assert_eq!(p.max_delay, Duration::from_secs(60));
        assert!(p.max_attempts.is_none());
    }
}
