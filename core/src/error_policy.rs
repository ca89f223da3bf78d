//! Error policies: the state machine deciding what happens when an inbound
//! envelope fails processing.
//!
//! Policies observe every failure surfaced to the consumer commit gate,
//! including serializer and decryption failures. They are evaluated against
//! the number of failures observed so far for the message, so a chain like
//! `retry(2).then_skip()` runs the pipeline exactly three times before
//! committing past the message.
//!
//! # Example
//!
//! ```
//! use ferrobus_core::error_policy::{ErrorPolicy, ErrorDecision};
//! use ferrobus_core::error::PipelineError;
//!
//! let policy = ErrorPolicy::retry(2).then_skip();
//! let err = PipelineError::Processing("subscriber failed".into());
//!
//! assert!(matches!(policy.evaluate(1, &err), ErrorDecision::Retry { .. }));
//! assert!(matches!(policy.evaluate(2, &err), ErrorDecision::Retry { .. }));
//! assert!(matches!(policy.evaluate(3, &err), ErrorDecision::Skip));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::error::PipelineError;
use crate::headers::Headers;

/// Exponential backoff between retry attempts.
///
/// `delay = initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap applied to the computed delay.
    pub max_delay: Duration,
    /// Multiplier applied per additional attempt.
    pub multiplier: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryBackoff {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }

        #[allow(clippy::cast_possible_wrap)]
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32 - 1);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }
}

/// Transformation applied to an envelope before it is moved to another
/// endpoint by [`ErrorPolicy::Move`].
pub trait MoveTransform: Send + Sync {
    /// Rewrite the body and headers of the envelope being moved.
    fn transform(&self, body: &mut Vec<u8>, headers: &mut Headers, error: &PipelineError);
}

/// A policy deciding retry, skip, move or stop on processing failure.
#[derive(Clone)]
pub enum ErrorPolicy {
    /// Fail the consumer; do not commit.
    Stop,
    /// Log and commit past the message.
    Skip,
    /// Re-run the pipeline up to `max_retries` additional times, with
    /// optional backoff, before deferring to the rest of the chain.
    Retry {
        /// Number of re-runs granted beyond the first attempt.
        max_retries: u32,
        /// Optional delay schedule between attempts.
        backoff: Option<RetryBackoff>,
    },
    /// Re-produce the envelope to another endpoint (optionally transformed)
    /// and commit.
    Move {
        /// Target endpoint for the failed envelope.
        endpoint: Endpoint,
        /// Optional body/header rewrite applied before producing.
        transform: Option<Arc<dyn MoveTransform>>,
    },
    /// Apply policies in order; each is consulted after the previous one is
    /// exhausted.
    Chain(Vec<ErrorPolicy>),
}

/// Outcome of evaluating a policy against a failure.
#[derive(Clone)]
pub enum ErrorDecision {
    /// Fail the consumer without committing.
    Stop,
    /// Commit past the message.
    Skip,
    /// Re-run the pipeline, optionally after a delay.
    Retry {
        /// Delay to apply before the next attempt.
        delay: Option<Duration>,
    },
    /// Re-produce to the given endpoint and commit.
    Move {
        /// Target endpoint.
        endpoint: Endpoint,
        /// Optional rewrite applied before producing.
        transform: Option<Arc<dyn MoveTransform>>,
    },
}

impl ErrorPolicy {
    /// A retry policy without backoff.
    #[must_use]
    pub const fn retry(max_retries: u32) -> Self {
        Self::Retry {
            max_retries,
            backoff: None,
        }
    }

    /// A retry policy with exponential backoff.
    #[must_use]
    pub const fn retry_with_backoff(max_retries: u32, backoff: RetryBackoff) -> Self {
        Self::Retry {
            max_retries,
            backoff: Some(backoff),
        }
    }

    /// A move policy without transformation.
    #[must_use]
    pub const fn move_to(endpoint: Endpoint) -> Self {
        Self::Move {
            endpoint,
            transform: None,
        }
    }

    /// Chain `next` after this policy is exhausted.
    #[must_use]
    pub fn then(self, next: Self) -> Self {
        match self {
            Self::Chain(mut policies) => {
                policies.push(next);
                Self::Chain(policies)
            }
            first => Self::Chain(vec![first, next]),
        }
    }

    /// Chain a skip after this policy is exhausted.
    #[must_use]
    pub fn then_skip(self) -> Self {
        self.then(Self::Skip)
    }

    /// Chain a stop after this policy is exhausted.
    #[must_use]
    pub fn then_stop(self) -> Self {
        self.then(Self::Stop)
    }

    /// Chain a move after this policy is exhausted.
    #[must_use]
    pub fn then_move(self, endpoint: Endpoint) -> Self {
        self.then(Self::move_to(endpoint))
    }

    /// How many failures this policy absorbs before deferring to the next
    /// link of a chain. Terminal policies absorb all remaining failures.
    const fn capacity(&self) -> Option<u32> {
        match self {
            Self::Retry { max_retries, .. } => Some(*max_retries),
            Self::Stop | Self::Skip | Self::Move { .. } => None,
            // A chain inside a chain is flattened at evaluation; its
            // capacity is irrelevant here because `evaluate` recurses.
            Self::Chain(_) => None,
        }
    }

    /// Decide what to do after the `failed_attempts`-th failure (1-based,
    /// counting the failure being handled).
    #[must_use]
    pub fn evaluate(&self, failed_attempts: u32, error: &PipelineError) -> ErrorDecision {
        match self {
            Self::Stop => ErrorDecision::Stop,
            Self::Skip => ErrorDecision::Skip,
            Self::Move {
                endpoint,
                transform,
            } => ErrorDecision::Move {
                endpoint: endpoint.clone(),
                transform: transform.clone(),
            },
            Self::Retry {
                max_retries,
                backoff,
            } => {
                if failed_attempts <= *max_retries {
                    ErrorDecision::Retry {
                        delay: backoff
                            .as_ref()
                            .map(|b| b.delay_for_attempt(failed_attempts)),
                    }
                } else {
                    // Exhausted with no chained fallback.
                    ErrorDecision::Stop
                }
            }
            Self::Chain(policies) => {
                let mut remaining = failed_attempts;
                for policy in policies {
                    match policy.capacity() {
                        Some(capacity) if remaining > capacity => remaining -= capacity,
                        _ => return policy.evaluate(remaining, error),
                    }
                }
                // Every link exhausted; the chain behaves like a stop.
                ErrorDecision::Stop
            }
        }
    }
}

impl Default for ErrorPolicy {
    /// Stopping the consumer is the default: it never silently loses
    /// messages.
    fn default() -> Self {
        Self::Stop
    }
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "Stop"),
            Self::Skip => write!(f, "Skip"),
            Self::Retry {
                max_retries,
                backoff,
            } => f
                .debug_struct("Retry")
                .field("max_retries", max_retries)
                .field("backoff", backoff)
                .finish(),
            Self::Move {
                endpoint,
                transform,
            } => f
                .debug_struct("Move")
                .field("endpoint", endpoint)
                .field("transform", &transform.is_some())
                .finish(),
            Self::Chain(policies) => f.debug_list().entries(policies.iter()).finish(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    fn processing_error() -> PipelineError {
        PipelineError::Processing("boom".into())
    }

    #[test]
    fn retry_absorbs_exactly_max_retries_failures() {
        let policy = ErrorPolicy::retry(2).then_skip();
        let err = processing_error();

        assert!(matches!(
            policy.evaluate(1, &err),
            ErrorDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.evaluate(2, &err),
            ErrorDecision::Retry { .. }
        ));
        assert!(matches!(policy.evaluate(3, &err), ErrorDecision::Skip));
    }

    #[test]
    fn retry_without_chain_stops_on_exhaustion() {
        let policy = ErrorPolicy::retry(1);
        let err = processing_error();

        assert!(matches!(
            policy.evaluate(1, &err),
            ErrorDecision::Retry { .. }
        ));
        assert!(matches!(policy.evaluate(2, &err), ErrorDecision::Stop));
    }

    #[test]
    fn chain_applies_links_in_order() {
        let policy = ErrorPolicy::retry(1)
            .then(ErrorPolicy::retry(2))
            .then_skip();
        let err = processing_error();

        // Attempts 1: first retry link. 2-3: second retry link. 4: skip.
        assert!(matches!(
            policy.evaluate(1, &err),
            ErrorDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.evaluate(2, &err),
            ErrorDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.evaluate(3, &err),
            ErrorDecision::Retry { .. }
        ));
        assert!(matches!(policy.evaluate(4, &err), ErrorDecision::Skip));
    }

    #[test]
    fn move_policy_carries_target_endpoint() {
        let policy = ErrorPolicy::move_to(Endpoint::new("dead-letters"));
        match policy.evaluate(1, &processing_error()) {
            ErrorDecision::Move { endpoint, .. } => assert_eq!(endpoint.name, "dead-letters"),
            _ => panic!("expected a move decision"),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = RetryBackoff {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            multiplier: 2.0,
        };

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_millis(300));
    }

    #[test]
    fn retry_with_backoff_surfaces_delay() {
        let policy = ErrorPolicy::retry_with_backoff(3, RetryBackoff::default());
        match policy.evaluate(1, &processing_error()) {
            ErrorDecision::Retry { delay } => {
                assert_eq!(delay, Some(Duration::from_millis(100)));
            }
            _ => panic!("expected a retry decision"),
        }
    }
}
