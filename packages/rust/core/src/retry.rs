//! Backoff policy for transient model failures and storage retries.

use std::sync::Arc;
use std::time::Duration;

use matflow_shared::{JitterMode, RetryConfig};
use rand::Rng;

/// How a computed delay is randomized.
#[derive(Clone)]
pub enum Jitter {
    None,
    /// Half the delay fixed, the other half uniform.
    Equal,
    /// Uniform between zero and the delay.
    Full,
    /// Caller-supplied transform (tests use this for determinism).
    Custom(Arc<dyn Fn(Duration) -> Duration + Send + Sync>),
}

impl std::fmt::Debug for Jitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Equal => f.write_str("Equal"),
            Self::Full => f.write_str("Full"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Jitter {
    fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        match self {
            Self::None => delay,
            Self::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rand::rng().random_range(0..=ms - half))
            }
            Self::Full => Duration::from_millis(rand::rng().random_range(0..=ms)),
            Self::Custom(f) => f(delay),
        }
    }
}

/// Bounded retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total transient-failed model calls before an item fails permanently.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Jitter,
    /// Re-prompts after schema-invalid output.
    pub corrective_attempts: u32,
    /// Persist attempts for a validated result.
    pub storage_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: match config.jitter {
                JitterMode::None => Jitter::None,
                JitterMode::Equal => Jitter::Equal,
                JitterMode::Full => Jitter::Full,
            },
            corrective_attempts: config.corrective_attempts,
            storage_attempts: config.storage_attempts.max(1),
        }
    }

    /// Zero delays, for tests and dry runs.
    pub fn immediate(max_attempts: u32, corrective_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Jitter::None,
            corrective_attempts,
            storage_attempts: 3,
        }
    }

    /// Delay after the `failures`-th consecutive failure (1-based):
    /// `base * 2^(failures-1)`, capped, jittered, and never shorter than a
    /// provider hint.
    pub fn delay_for(&self, failures: u32, hint: Option<Duration>) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let raw = self
            .base_delay
            .checked_mul(2u32.pow(exponent))
            .unwrap_or(self.max_delay);
        let capped = raw.min(self.max_delay);
        let jittered = self.jitter.apply(capped);
        match hint {
            Some(h) => jittered.max(h),
            None => jittered,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: Jitter) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter,
            corrective_attempts: 2,
            storage_attempts: 3,
        }
    }

    #[test]
    fn exponential_and_capped() {
        let p = policy(Jitter::None);
        assert_eq!(p.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(p.delay_for(4, None), Duration::from_millis(800));
        assert_eq!(p.delay_for(5, None), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(40, None), Duration::from_millis(1_000));
    }

    #[test]
    fn rate_limit_hint_is_a_floor() {
        let p = policy(Jitter::None);
        assert_eq!(
            p.delay_for(1, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            p.delay_for(3, Some(Duration::from_millis(10))),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let equal = policy(Jitter::Equal);
        let full = policy(Jitter::Full);
        for _ in 0..200 {
            let d = equal.delay_for(3, None);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(400));
            assert!(full.delay_for(3, None) <= Duration::from_millis(400));
        }
    }

    #[test]
    fn custom_jitter_is_injectable() {
        let p = policy(Jitter::Custom(Arc::new(|d| d / 4)));
        assert_eq!(p.delay_for(2, None), Duration::from_millis(50));
    }

    #[test]
    fn from_config_maps_fields() {
        let p = RetryPolicy::from_config(&RetryConfig::default());
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.base_delay, Duration::from_millis(500));
        assert!(matches!(p.jitter, Jitter::Equal));
    }
}
