//! Retry strategies and backoff policies for provisioning actions and
//! outbound gateway calls.
//!
//! Two layers live here:
//!
//! - [`RetrySpec`] is the per-action retry schema stored on template action
//!   sequences (`max_attempts`, `retry_delay_seconds`,
//!   `exponential_backoff`). The action executor drives it directly so the
//!   sleep sequence is exactly what the template author configured.
//! - [`BackoffStrategy`] / [`calculate_delay`] is the general policy used by
//!   HTTP clients (payment gateway, rate feed) where jitter and a delay cap
//!   matter more than exact reproducibility.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-action retry configuration as stored in template JSON.
///
/// ```
/// use berth_retry::RetrySpec;
///
/// let spec: RetrySpec = serde_json::from_str(
///     r#"{"max_attempts": 3, "retry_delay_seconds": 1, "exponential_backoff": true}"#,
/// ).unwrap();
/// assert_eq!(spec.delay_before_attempt(2), std::time::Duration::from_secs(1));
/// assert_eq!(spec.delay_before_attempt(3), std::time::Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySpec {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts, in whole seconds (template schema unit).
    #[serde(default, rename = "retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default)]
    pub exponential_backoff: bool,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_delay_seconds: 0,
            exponential_backoff: false,
        }
    }
}

impl RetrySpec {
    /// Delay to sleep before the given attempt (2-based: no sleep precedes
    /// attempt 1). With `exponential_backoff`, attempt n sleeps
    /// `retry_delay * 2^(n-2)` — so a 3-attempt run with a 1s base sleeps 1s
    /// then 2s.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let base = Duration::from_secs(self.retry_delay_seconds);
        if self.exponential_backoff {
            let pow = attempt.saturating_sub(2).min(16);
            base.saturating_mul(2_u32.saturating_pow(pow))
        } else {
            base
        }
    }
}

/// Shape of the delay curve for [`calculate_delay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay between retries.
    Immediate,
    /// Delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Same delay every attempt.
    Constant,
}

/// Configuration for a general backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_policy_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// 0.0 = no jitter; 0.5 = delay scaled by a factor in 0.5..1.5.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_policy_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.3
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts: default_policy_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Delay before the next retry, given the 1-based attempt that just failed.
pub fn calculate_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let raw = match config.strategy {
        BackoffStrategy::Immediate => Duration::ZERO,
        BackoffStrategy::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        BackoffStrategy::Linear => config.base_delay.saturating_mul(attempt),
        BackoffStrategy::Constant => config.base_delay,
    };

    let capped = raw.min(config.max_delay);
    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Jitter factor of j scales the delay by a uniform factor in (1-j)..(1+j).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let random: f64 = rng.r#gen();
    let factor = 1.0 - jitter + random * 2.0 * jitter;
    let millis = (delay.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis)
}

/// Runs a fallible closure under a [`BackoffConfig`], sleeping between
/// attempts. The closure receives the 1-based attempt number.
pub fn run_with_backoff<T, E, F>(config: &BackoffConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts {
                    return Err(err);
                }
                std::thread::sleep(calculate_delay(config, attempt));
                attempt += 1;
            }
        }
    }
}
