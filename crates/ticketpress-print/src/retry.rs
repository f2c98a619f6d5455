// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Retry policy for failed print attempts.
//
// Classifies attempt errors into Transient (auto-retry), UserAction (park
// until someone fixes the printer) and Permanent (give up). Only transient
// errors are retried, with exponential backoff and no jitter so a job's
// schedule is predictable.

use std::time::Duration;

use tracing::{debug, info, warn};

use ticketpress_core::config::RetryPolicy;
use ticketpress_core::types::{ErrorCategory, JobError};

/// How an attempt error should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    UserAction,
    Permanent,
}

/// Result of evaluating whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after this delay.
    RetryAfter(Duration),
    /// Do not retry; the error is permanent or needs a person.
    GiveUp(ErrorClass),
    /// Attempts used up.
    Exhausted,
}

pub fn classify_error(err: &JobError) -> ErrorClass {
    match err.category {
        // Same bytes, same capabilities, same failure.
        ErrorCategory::Encoding => ErrorClass::Permanent,
        // Bad target or queue state; retrying cannot fix it.
        ErrorCategory::Queue => ErrorClass::Permanent,
        ErrorCategory::PrinterFault if err.requires_intervention => ErrorClass::UserAction,
        ErrorCategory::PrinterFault | ErrorCategory::Connection | ErrorCategory::Transmission => {
            ErrorClass::Transient
        }
    }
}

/// Decide what happens after the `attempts`-th attempt failed with `err`.
pub fn should_retry(err: &JobError, attempts: u32, policy: &RetryPolicy) -> RetryDecision {
    match classify_error(err) {
        ErrorClass::Permanent => {
            info!(category = ?err.category, "permanent error, not retrying");
            RetryDecision::GiveUp(ErrorClass::Permanent)
        }
        ErrorClass::UserAction => {
            info!(fault = ?err.fault, "printer needs attention, not auto-retrying");
            RetryDecision::GiveUp(ErrorClass::UserAction)
        }
        ErrorClass::Transient => {
            if attempts >= policy.max_attempts {
                warn!(attempts, max = policy.max_attempts, "retry limit exhausted");
                RetryDecision::Exhausted
            } else {
                let delay = compute_delay(attempts, policy);
                debug!(attempts, delay_ms = delay.as_millis(), "scheduling retry");
                RetryDecision::RetryAfter(delay)
            }
        }
    }
}

/// Backoff after `attempts` failed attempts (1-based):
/// `min(base * 2^(attempts - 1), max_delay)`.
pub fn compute_delay(attempts: u32, policy: &RetryPolicy) -> Duration {
    let exponent = attempts.saturating_sub(1).min(32);
    let ms = policy
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(policy.max_delay_ms);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticketpress_core::types::FaultKind;

    fn err(category: ErrorCategory) -> JobError {
        JobError {
            category,
            message: "boom".into(),
            fault: None,
            requires_intervention: false,
        }
    }

    fn fault(kind: FaultKind) -> JobError {
        JobError {
            category: ErrorCategory::PrinterFault,
            message: kind.to_string(),
            fault: Some(kind),
            requires_intervention: kind.requires_intervention(),
        }
    }

    #[test]
    fn transmission_is_transient() {
        assert_eq!(classify_error(&err(ErrorCategory::Transmission)), ErrorClass::Transient);
        assert_eq!(classify_error(&err(ErrorCategory::Connection)), ErrorClass::Transient);
    }

    #[test]
    fn paper_out_is_user_action() {
        assert_eq!(classify_error(&fault(FaultKind::OutOfPaper)), ErrorClass::UserAction);
        assert_eq!(classify_error(&fault(FaultKind::PaperJam)), ErrorClass::UserAction);
        assert_eq!(classify_error(&fault(FaultKind::Offline)), ErrorClass::Transient);
    }

    #[test]
    fn encoding_error_never_retries() {
        assert_eq!(
            should_retry(&err(ErrorCategory::Encoding), 1, &RetryPolicy::default()),
            RetryDecision::GiveUp(ErrorClass::Permanent)
        );
    }

    #[test]
    fn retry_respects_max_attempts() {
        let policy = RetryPolicy::default();
        let e = err(ErrorCategory::Transmission);
        assert_eq!(
            should_retry(&e, 1, &policy),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            should_retry(&e, 2, &policy),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(should_retry(&e, 3, &policy), RetryDecision::Exhausted);
    }

    #[test]
    fn delays_double_and_never_decrease() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (1..=6).map(|a| compute_delay(a, &policy)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        for pair in delays.windows(2) {
            assert_eq!(pair[1], pair[0] * 2);
        }
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            max_delay_ms: 10_000,
            ..Default::default()
        };
        assert_eq!(compute_delay(40, &policy), Duration::from_secs(10));
    }
}
