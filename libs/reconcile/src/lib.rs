//! Convergence primitives for the Flintlock provider.
//!
//! This library holds the pieces of a reconciliation loop that do not touch
//! the network:
//!
//! - **Spec hash**: a deterministic fingerprint of a desired specification,
//!   used to decide whether the remote needs an update.
//! - **Retry policy**: how many times a transient failure is retried and how
//!   long to wait between attempts.
//! - **Convergence status**: how far a resource is from its desired state.
//!
//! # Invariants
//!
//! - Hashes depend only on content, never on key order
//! - Backoff delays are monotonic in the attempt number up to the cap

use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Retry policy that could never run an operation.
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),
}

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Resource has converged (current matches desired).
    Converged,

    /// Resource is converging (the remote is still provisioning).
    Converging,

    /// Resource has diverged (requires intervention).
    Diverged,

    /// Status is unknown (the last pass did not reach the remote).
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the resource is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// A spec hash for deterministic comparison.
///
/// Used to detect when a declared VM specification has changed since it was
/// last applied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Wrap a previously computed hash string (e.g. read back from persisted state).
    pub fn from_string(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Exponential backoff between retries.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Backoff without jitter, handy for tests and for predictable schedules.
    pub fn fixed_ratio(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Calculate the delay after the given failed attempt (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            delay * self.jitter.min(1.0) * rand::random::<f64>()
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter) as u64)
    }
}

/// Bound on retries of transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    max_attempts: u32,

    /// Delay schedule between attempts.
    backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy. At least one attempt is required.
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Result<Self, ReconcileError> {
        if max_attempts == 0 {
            return Err(ReconcileError::InvalidPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return Err(ReconcileError::InvalidPolicy(format!(
                "jitter must be within 0.0..=1.0, got {}",
                backoff.jitter
            )));
        }
        Ok(Self {
            max_attempts,
            backoff,
        })
    }

    /// Total attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff schedule.
    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Delay to wait after `attempt` (1-based) failed, or `None` when the
    /// attempts are exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        Some(self.backoff.delay(attempt.saturating_sub(1)))
    }
}

/// Default number of attempts for a transient failure.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": 1});
        let json2 = serde_json::json!({"a": 1, "b": 2});

        let hash1 = SpecHash::from_json(&json1);
        let hash2 = SpecHash::from_json(&json2);

        assert_eq!(hash1, hash2);
        assert!(hash1.as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_spec_hash_sensitive_to_content() {
        let a = SpecHash::from_json(&serde_json::json!({"vcpu": 1}));
        let b = SpecHash::from_json(&serde_json::json!({"vcpu": 2}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_canonical_json_nested() {
        let json = serde_json::json!({"z": {"b": [1, "x\n"], "a": null}, "a": true});
        assert_eq!(
            canonical_json(&json),
            r#"{"a":true,"z":{"a":null,"b":[1,"x\n"]}}"#
        );
    }

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy::fixed_ratio(Duration::from_millis(100), Duration::from_secs(30));

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy::fixed_ratio(Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.5,
        };

        for _ in 0..50 {
            let delay = policy.delay(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_retry_policy_exhaustion() {
        let policy = RetryPolicy::new(
            3,
            BackoffPolicy::fixed_ratio(Duration::from_millis(10), Duration::from_secs(1)),
        )
        .unwrap();

        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(10))); // after 1st
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(20))); // after 2nd
        assert_eq!(policy.next_delay(3), None); // 3rd was the last
    }

    #[test]
    fn test_retry_policy_rejects_zero_attempts() {
        let err = RetryPolicy::new(0, BackoffPolicy::default()).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidPolicy(_)));
    }

    #[test]
    fn test_retry_policy_rejects_bad_jitter() {
        let backoff = BackoffPolicy {
            jitter: 1.5,
            ..BackoffPolicy::default()
        };
        assert!(RetryPolicy::new(3, backoff).is_err());
    }

    #[test]
    fn test_convergence_status() {
        assert!(ConvergenceStatus::Converged.is_converged());
        assert!(ConvergenceStatus::Converging.is_converging());
        assert!(!ConvergenceStatus::Diverged.is_converged());
    }
}
