// Retry backoff policies

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How retry delays grow between failed attempts of the same occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `min(cap, base * 2^(attempt-1)) * U(0.5, 1.0)`
    #[default]
    ExponentialJitter,
    /// `base * attempt`
    Linear,
    /// `base`
    Fixed,
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackoffStrategy::ExponentialJitter => "exponential_jitter",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Fixed => "fixed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exponential_jitter" => Ok(BackoffStrategy::ExponentialJitter),
            "linear" => Ok(BackoffStrategy::Linear),
            "fixed" => Ok(BackoffStrategy::Fixed),
            other => Err(format!("unknown backoff strategy: {}", other)),
        }
    }
}

/// Backoff calculator with configurable base and cap.
///
/// The defaults (base 1s, cap 300s) are the production values; tests shrink
/// the base to keep retry scenarios fast.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(with = "duration_millis")]
    pub base: Duration,
    #[serde(with = "duration_millis")]
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before re-arming after failed attempt number `attempt` (1-based).
    pub fn delay(&self, strategy: BackoffStrategy, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match strategy {
            BackoffStrategy::ExponentialJitter => {
                let exp = self.base.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
                let capped = exp.min(self.cap.as_secs_f64());
                let factor = rand::thread_rng().gen_range(0.5..=1.0);
                Duration::from_secs_f64(capped * factor)
            }
            BackoffStrategy::Linear => {
                let linear = self.base.as_secs_f64() * attempt as f64;
                Duration::from_secs_f64(linear.min(self.cap.as_secs_f64()))
            }
            BackoffStrategy::Fixed => self.base,
        }
    }

    /// Bounds of the delay distribution for a given attempt, used by tests
    /// to assert observed delays without fixing the jitter seed.
    pub fn delay_bounds(&self, strategy: BackoffStrategy, attempt: u32) -> (Duration, Duration) {
        let attempt = attempt.max(1);
        match strategy {
            BackoffStrategy::ExponentialJitter => {
                let exp = self.base.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
                let capped = exp.min(self.cap.as_secs_f64());
                (
                    Duration::from_secs_f64(capped * 0.5),
                    Duration::from_secs_f64(capped),
                )
            }
            BackoffStrategy::Linear | BackoffStrategy::Fixed => {
                let d = self.delay(strategy, attempt);
                (d, d)
            }
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
