//! Retry decisions and exponential backoff for stage attempts.
//!
//! Stateless: all logic lives in associated functions that take the stage
//! declaration and backoff bounds as parameters.

use std::time::Duration;

use waypoint_types::workflow::StageDefinition;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler for stage failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Determine whether another attempt should be made.
    ///
    /// `attempt` is 1-based (first execution is attempt 1). Non-retryable
    /// stages never retry, whatever `max_retries` says.
    pub fn should_retry(stage: &StageDefinition, attempt: u32) -> bool {
        attempt < stage.max_attempts()
    }

    /// Delay before the attempt following `attempt`.
    ///
    /// `base * 2^(attempt - 1)`, capped at `ceiling`.
    pub fn backoff_delay(attempt: u32, base: Duration, ceiling: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        base.checked_mul(1u32 << exponent)
            .unwrap_or(ceiling)
            .min(ceiling)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(retryable: bool, max_retries: u32) -> StageDefinition {
        StageDefinition {
            id: "build".to_string(),
            handler: "noop".to_string(),
            depends_on: vec![],
            retryable,
            max_retries,
            optional: false,
            timeout_secs: None,
            allow_skipped_deps: false,
            params: None,
        }
    }

    #[test]
    fn test_should_retry_within_limit() {
        let s = stage(true, 2);
        assert!(RetryHandler::should_retry(&s, 1));
        assert!(RetryHandler::should_retry(&s, 2));
        assert!(!RetryHandler::should_retry(&s, 3));
    }

    #[test]
    fn test_non_retryable_never_retries() {
        let s = stage(false, 5);
        assert!(!RetryHandler::should_retry(&s, 1));
    }

    #[test]
    fn test_zero_retries_single_attempt() {
        assert!(!RetryHandler::should_retry(&stage(true, 0), 1));
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let base = Duration::from_millis(100);
        let ceiling = Duration::from_millis(1000);
        assert_eq!(RetryHandler::backoff_delay(1, base, ceiling), Duration::from_millis(100));
        assert_eq!(RetryHandler::backoff_delay(2, base, ceiling), Duration::from_millis(200));
        assert_eq!(RetryHandler::backoff_delay(3, base, ceiling), Duration::from_millis(400));
        assert_eq!(RetryHandler::backoff_delay(5, base, ceiling), ceiling);
        assert_eq!(RetryHandler::backoff_delay(60, base, ceiling), ceiling);
    }
}
