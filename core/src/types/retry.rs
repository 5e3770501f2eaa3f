//! Retry configuration and transient-error classification for store access.

use serde::{Deserialize, Serialize};

use crate::errors::MemForgeError;

/// Error-message fragments that mark a failure as transient.
///
/// Connection-class fragments additionally force a pool rebuild and reset
/// the vector-index verification guard.
const CONNECTION_FRAGMENTS: &[&str] = &[
    "connection closed by server",
    "service unavailable",
    "econnrefused",
    "econnreset",
];

/// Transient but not connection-class: MVCC conflicts and full-text index
/// writer panics resolve on their own.
const TRANSIENT_FRAGMENTS: &[&str] = &[
    "cannot resolve conflicting transactions",
    "tantivy error",
    "index writer was killed",
];

/// Retry configuration for gateway submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (first try included).
    pub max_attempts: u32,
    /// Initial delay between attempts in milliseconds.
    pub initial_delay_ms: u64,
    /// Backoff multiplier applied per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 300,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), following the
    /// exponential ladder 300 ms, 600 ms, 1200 ms.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let factor = self.backoff_multiplier.powi(attempt as i32 - 1);
        (self.initial_delay_ms as f64 * factor) as u64
    }

    /// Whether another attempt is allowed after `attempt` failures.
    #[inline]
    pub fn should_retry(&self, error: &MemForgeError, attempt: u32) -> bool {
        attempt < self.max_attempts && is_transient(error)
    }
}

/// Classify an error as transient (worth retrying).
pub fn is_transient(error: &MemForgeError) -> bool {
    let message = error.to_string().to_lowercase();
    CONNECTION_FRAGMENTS
        .iter()
        .chain(TRANSIENT_FRAGMENTS)
        .any(|fragment| message.contains(fragment))
}

/// Classify an error as connection-class: the pool must be invalidated and
/// the vector-index guard reset before the next attempt.
pub fn is_connection_error(error: &MemForgeError) -> bool {
    let message = error.to_string().to_lowercase();
    CONNECTION_FRAGMENTS
        .iter()
        .any(|fragment| message.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_ladder() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_ms(1), 300);
        assert_eq!(policy.delay_ms(2), 600);
        assert_eq!(policy.delay_ms(3), 1200);
    }

    #[test]
    fn test_transient_classification() {
        let err = MemForgeError::store("Connection closed by server");
        assert!(is_transient(&err));
        assert!(is_connection_error(&err));

        let err = MemForgeError::store("Cannot resolve conflicting transactions");
        assert!(is_transient(&err));
        assert!(!is_connection_error(&err));

        let err = MemForgeError::store("Tantivy error: index writer was killed");
        assert!(is_transient(&err));

        let err = MemForgeError::store("Syntax error at line 1");
        assert!(!is_transient(&err));

        let err = MemForgeError::store("connect ECONNREFUSED 127.0.0.1:7687");
        assert!(is_transient(&err));
        assert!(is_connection_error(&err));
    }

    #[test]
    fn test_should_retry_budget() {
        let policy = RetryPolicy::default();
        let transient = MemForgeError::store("service unavailable");
        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 2));
        assert!(!policy.should_retry(&transient, 3));

        let fatal = MemForgeError::store("constraint violation");
        assert!(!policy.should_retry(&fatal, 1));
    }
}
