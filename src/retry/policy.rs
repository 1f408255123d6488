use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    ExponentialBackoff,
    LinearBackoff,
    FixedInterval,
    Immediate,
    NoRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// 重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub severity: ErrorSeverity,
    pub strategy: RetryStrategy,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor for exponential backoff.
    pub multiplier: f64,
    /// Cumulative failures for one key at which an escalation is signalled.
    pub escalation_threshold: u32,
}

impl RetryPolicy {
    pub const fn new(
        severity: ErrorSeverity,
        strategy: RetryStrategy,
        max_retries: u32,
        base_delay_ms: u64,
        max_delay_ms: u64,
        escalation_threshold: u32,
    ) -> Self {
        Self {
            severity,
            strategy,
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            multiplier: 2.0,
            escalation_threshold,
        }
    }

    pub fn retries(&self) -> bool {
        self.strategy != RetryStrategy::NoRetry
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay`, without jitter.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            RetryStrategy::ExponentialBackoff => {
                let factor = self.multiplier.powi(attempt.saturating_sub(1).min(64) as i32);
                Duration::from_secs_f64((self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64()))
            }
            RetryStrategy::LinearBackoff => self.base_delay.saturating_mul(attempt),
            RetryStrategy::FixedInterval => self.base_delay,
            RetryStrategy::Immediate | RetryStrategy::NoRetry => Duration::ZERO,
        };
        delay.min(self.max_delay)
    }

    /// Same as [`compute_delay`](Self::compute_delay), spread by up to ±10 %.
    pub fn compute_delay_with_jitter(&self, attempt: u32) -> Duration {
        apply_jitter(self.compute_delay(attempt))
    }
}

/// Spreads a delay uniformly within ±10 %.
pub fn apply_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = 0.9 + fastrand::f64() * 0.2;
    delay.mul_f64(factor)
}

