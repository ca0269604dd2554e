use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::jobs::model::{Job, JobStatus};

pub const DEFAULT_ZOMBIE_THRESHOLD: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry_count` (1-based), without jitter.
    pub fn base_delay(&self, retry_count: i32) -> Duration {
        if retry_count <= 0 {
            return self.initial_delay;
        }

        // multiplier^(retry_count-1); large exponents go to infinity and the cap handles it
        let factor = self.multiplier.powi(retry_count - 1);
        let secs = self.initial_delay.as_secs_f64() * factor;
        let max = self.max_delay.as_secs_f64();

        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    pub fn compute_backoff(&self, retry_count: i32, rng: &mut impl Rng) -> Duration {
        if retry_count <= 0 {
            return self.initial_delay;
        }

        let delay = self.base_delay(retry_count).as_secs_f64();

        // jitter in range [-jitter_ratio, +jitter_ratio] of the delay
        let jitter_range = delay * self.jitter_ratio.max(0.0);
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_secs_f64((delay + jitter).max(0.0))
    }

    pub fn next_retry_at(&self, now: DateTime<Utc>, retry_count: i32, rng: &mut impl Rng) -> DateTime<Utc> {
        let delay = self.compute_backoff(retry_count, rng);
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0))
    }
}

/// How long a running job may go before it counts as a zombie.
pub fn zombie_threshold(timeout_seconds: Option<i64>, default_threshold: Duration) -> Duration {
    match timeout_seconds {
        Some(t) if t > 0 => default_threshold.max(Duration::from_secs(t as u64).saturating_mul(2)),
        _ => default_threshold,
    }
}

pub fn is_zombie(job: &Job, now: DateTime<Utc>, default_threshold: Duration) -> bool {
    if job.status != JobStatus::Running {
        return false;
    }
    let Some(elapsed) = job.elapsed(now).and_then(|d| d.to_std().ok()) else {
        return false;
    };
    elapsed > zombie_threshold(job.timeout_seconds, default_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter_ratio: 0.0,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let cfg = no_jitter();
        let mut rng = StdRng::seed_from_u64(7);
        let secs: Vec<u64> = (1..=10)
            .map(|r| cfg.compute_backoff(r, &mut rng).as_secs())
            .collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300]);
    }

    #[test]
    fn non_positive_retry_count_returns_initial_delay() {
        let cfg = RetryConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(cfg.compute_backoff(0, &mut rng), cfg.initial_delay);
        assert_eq!(cfg.compute_backoff(-4, &mut rng), cfg.initial_delay);
    }

    #[test]
    fn huge_retry_counts_stay_capped() {
        let cfg = no_jitter();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(cfg.compute_backoff(i32::MAX, &mut rng), cfg.max_delay);
    }

    #[test]
    fn zombie_threshold_uses_twice_the_timeout_when_larger() {
        let default = Duration::from_secs(3600);
        assert_eq!(zombie_threshold(None, default), default);
        assert_eq!(zombie_threshold(Some(60), default), default);
        assert_eq!(zombie_threshold(Some(7200), default), Duration::from_secs(14_400));
        assert_eq!(
            zombie_threshold(Some(1), Duration::from_secs(1)),
            Duration::from_secs(2)
        );
    }

    proptest! {
        #[test]
        fn backoff_is_never_negative_and_within_jitter(r in -5i32..64, seed in any::<u64>()) {
            let cfg = RetryConfig::default();
            let mut rng = StdRng::seed_from_u64(seed);
            let got = cfg.compute_backoff(r, &mut rng).as_secs_f64();
            let base = cfg.base_delay(r).as_secs_f64();
            prop_assert!(got >= 0.0);
            prop_assert!(got <= base * (1.0 + cfg.jitter_ratio) + 1e-9);
            prop_assert!(got >= base * (1.0 - cfg.jitter_ratio) - 1e-9);
        }

        #[test]
        fn base_delay_is_monotonic(r in 0i32..200) {
            let cfg = RetryConfig::default();
            prop_assert!(cfg.base_delay(r) <= cfg.base_delay(r + 1));
            prop_assert!(cfg.base_delay(r + 1) <= cfg.max_delay);
        }
    }
}
