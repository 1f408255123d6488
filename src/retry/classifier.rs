//! Error classification and per-key retry bookkeeping.
//!
//! A failure is first inspected by type (an explicit [`ClassifiedError`],
//! [`EngineError`], `std::io::Error`, tokio's `Elapsed`), then by message
//! patterns. Each class maps to a [`RetryPolicy`]; the classifier keeps a
//! cumulative failure counter per {instance, node, task} key and turns it into
//! a retry / escalate decision.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::EngineError;
use crate::retry::policy::{ErrorSeverity, RetryPolicy, RetryStrategy, apply_jitter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    Network,
    Timeout,
    Validation,
    Resource,
    Dependency,
    Business,
    System,
    Unknown,
}

impl ErrorType {
    pub const ALL: [ErrorType; 8] = [
        ErrorType::Network,
        ErrorType::Timeout,
        ErrorType::Validation,
        ErrorType::Resource,
        ErrorType::Dependency,
        ErrorType::Business,
        ErrorType::System,
        ErrorType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Network => "NETWORK",
            ErrorType::Timeout => "TIMEOUT",
            ErrorType::Validation => "VALIDATION",
            ErrorType::Resource => "RESOURCE",
            ErrorType::Dependency => "DEPENDENCY",
            ErrorType::Business => "BUSINESS",
            ErrorType::System => "SYSTEM",
            ErrorType::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Built-in policy for this class.
    pub fn default_policy(&self) -> RetryPolicy {
        use ErrorSeverity::*;
        use RetryStrategy::*;
        match self {
            ErrorType::Network => RetryPolicy::new(Medium, ExponentialBackoff, 3, 1_000, 30_000, 5),
            ErrorType::Timeout => RetryPolicy::new(Medium, LinearBackoff, 3, 2_000, 30_000, 5),
            ErrorType::Validation => RetryPolicy::new(Low, NoRetry, 0, 0, 0, 10),
            ErrorType::Resource => RetryPolicy::new(High, ExponentialBackoff, 5, 5_000, 60_000, 3),
            ErrorType::Dependency => RetryPolicy::new(Medium, ExponentialBackoff, 3, 2_000, 60_000, 5),
            ErrorType::Business => RetryPolicy::new(Low, NoRetry, 0, 0, 0, 10),
            ErrorType::System => RetryPolicy::new(Critical, FixedInterval, 2, 5_000, 5_000, 2),
            ErrorType::Unknown => RetryPolicy::new(Medium, ExponentialBackoff, 2, 1_000, 10_000, 3),
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error that carries its own class, bypassing pattern matching.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ClassifiedError {
    pub error_type: ErrorType,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

/// Identity a failure counter is kept under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorKey {
    pub instance_id: String,
    pub node_id: Option<String>,
    pub task_id: Option<String>,
}

impl ErrorKey {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            node_id: None,
            task_id: None,
        }
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

impl fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.instance_id,
            self.node_id.as_deref().unwrap_or("-"),
            self.task_id.as_deref().unwrap_or("-")
        )
    }
}

/// 错误处理决策
#[derive(Debug, Clone, Serialize)]
pub struct ErrorHandlingDecision {
    pub error_type: ErrorType,
    pub severity: ErrorSeverity,
    pub should_retry: bool,
    pub retry_delay: Option<Duration>,
    pub escalate: bool,
    /// Cumulative failures recorded for the key, this one included.
    pub attempt: u32,
    pub max_retries: u32,
    pub message: String,
}

pub struct ErrorClassifier {
    policies: HashMap<ErrorType, RetryPolicy>,
    jitter: bool,
    failures: DashMap<ErrorKey, u32>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl ErrorClassifier {
    pub fn new(config: &RetryConfig) -> Self {
        let policies = ErrorType::ALL
            .into_iter()
            .map(|t| {
                let mut policy = t.default_policy();
                if let Some(max) = config.max_retries.get(&t) {
                    policy.max_retries = *max;
                }
                (t, policy)
            })
            .collect();
        Self {
            policies,
            jitter: config.jitter,
            failures: DashMap::new(),
        }
    }

    /// Whether retry delays are spread by ±10 %.
    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn policy(&self, error_type: ErrorType) -> RetryPolicy {
        self.policies
            .get(&error_type)
            .cloned()
            .unwrap_or_else(|| error_type.default_policy())
    }

    pub fn classify(&self, error: &anyhow::Error) -> ErrorType {
        for cause in error.chain() {
            if let Some(t) = classify_typed(cause) {
                return t;
            }
        }
        classify_message(&format!("{:#}", error))
    }

    /// Records one failure for `key` and decides whether to retry and whether to escalate.
    pub fn handle_error(&self, error: &anyhow::Error, key: &ErrorKey) -> ErrorHandlingDecision {
        let error_type = self.classify(error);
        let policy = self.policy(error_type);

        let attempt = {
            let mut count = self.failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let should_retry = policy.retries() && attempt <= policy.max_retries;
        let escalate = attempt >= policy.escalation_threshold;
        let retry_delay = should_retry.then(|| {
            let delay = policy.compute_delay(attempt);
            if self.jitter { apply_jitter(delay) } else { delay }
        });

        if escalate {
            warn!(%key, %error_type, attempt, threshold = policy.escalation_threshold, "Error escalation threshold reached");
        } else {
            debug!(%key, %error_type, attempt, should_retry, "Error classified");
        }

        ErrorHandlingDecision {
            error_type,
            severity: policy.severity,
            should_retry,
            retry_delay,
            escalate,
            attempt,
            max_retries: policy.max_retries,
            message: format!("{:#}", error),
        }
    }

    pub fn failure_count(&self, key: &ErrorKey) -> u32 {
        self.failures.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Clears the counter for `key`, typically after a success.
    pub fn reset(&self, key: &ErrorKey) {
        self.failures.remove(key);
    }
}

fn classify_typed(cause: &(dyn std::error::Error + 'static)) -> Option<ErrorType> {
    if let Some(e) = cause.downcast_ref::<ClassifiedError>() {
        return Some(e.error_type);
    }
    if let Some(e) = cause.downcast_ref::<EngineError>() {
        return Some(match e {
            EngineError::TaskTimedOut(..) => ErrorType::Timeout,
            EngineError::SlotQueueFull(_) | EngineError::AdmissionWithdrawn(_) => ErrorType::Resource,
            EngineError::ExecutorNotFound(_) => ErrorType::Dependency,
            EngineError::ShuttingDown(_) => ErrorType::System,
            _ => ErrorType::Validation,
        });
    }
    if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return Some(ErrorType::Timeout);
    }
    if let Some(e) = cause.downcast_ref::<io::Error>() {
        return match e.kind() {
            io::ErrorKind::TimedOut => Some(ErrorType::Timeout),
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::BrokenPipe => Some(ErrorType::Network),
            io::ErrorKind::OutOfMemory => Some(ErrorType::Resource),
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Some(ErrorType::Validation),
            io::ErrorKind::PermissionDenied => Some(ErrorType::System),
            _ => None,
        };
    }
    None
}

// Order matters: timeouts are often reported by network layers.
const PATTERNS: &[(ErrorType, &[&str])] = &[
    (ErrorType::Timeout, &["timeout", "timed out", "deadline exceeded", "etimedout"]),
    (
        ErrorType::Network,
        &[
            "econnrefused",
            "econnreset",
            "enotfound",
            "connection refused",
            "connection reset",
            "network",
            "socket",
            "dns",
            "unreachable",
        ],
    ),
    (
        ErrorType::Validation,
        &["validation", "invalid", "required field", "malformed", "parse error", "bad request"],
    ),
    (
        ErrorType::Resource,
        &["out of memory", "resource", "quota", "rate limit", "too many requests", "capacity", "429"],
    ),
    (
        ErrorType::Dependency,
        &["dependency", "service unavailable", "bad gateway", "upstream", "502", "503"],
    ),
    (
        ErrorType::Business,
        &["business", "not allowed", "forbidden", "conflict", "insufficient", "403", "409"],
    ),
    (
        ErrorType::System,
        &["internal", "panic", "system", "enospc", "permission denied"],
    ),
];

pub fn classify_message(message: &str) -> ErrorType {
    let message = message.to_lowercase();
    PATTERNS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| message.contains(n)))
        .map(|(t, _)| *t)
        .unwrap_or(ErrorType::Unknown)
}
