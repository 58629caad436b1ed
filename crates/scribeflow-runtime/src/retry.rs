//! Retry controller: failure classification and backoff.
//!
//! - [`classify`]: map a [`ProviderError`] onto a [`FailureClass`]
//! - [`RetryController::decide`]: retry after a delay, or give up
//! - [`backoff_delay_with_random`]: `min(cap, base * 2^attempt) * (0.5 + random)`

use std::time::Duration;

use scribeflow_core::{FailureClass, ProviderError, RetryConfig};

/// HTTP statuses that mean "the remote is overloaded, back off".
const CAPACITY_STATUSES: &[u16] = &[429, 500, 502, 503, 504];
/// HTTP statuses that mean "a dependency is not ready yet".
const STATE_STATUSES: &[u16] = &[409, 425];
/// HTTP statuses that mean "this request will never succeed".
const INPUT_STATUSES: &[u16] = &[400, 404, 413, 415, 422];

/// Classify a provider failure.
pub fn classify(error: &ProviderError) -> FailureClass {
    match error {
        ProviderError::RateLimited { .. } => FailureClass::TransientCapacity,
        ProviderError::NotReady(_) => FailureClass::TransientState,
        ProviderError::InvalidInput(_) => FailureClass::FatalInput,
        ProviderError::Http { status, .. } => classify_status(*status),
        ProviderError::Timeout(_) | ProviderError::Other(_) => FailureClass::FatalOther,
    }
}

fn classify_status(status: u16) -> FailureClass {
    if CAPACITY_STATUSES.contains(&status) {
        FailureClass::TransientCapacity
    } else if STATE_STATUSES.contains(&status) {
        FailureClass::TransientState
    } else if INPUT_STATUSES.contains(&status) {
        FailureClass::FatalInput
    } else {
        FailureClass::FatalOther
    }
}

/// Exponential backoff with multiplicative jitter.
///
/// `attempt` is zero-based (0 for the first retry). `random` should be in
/// `[0.0, 1.0)`; it maps onto a jitter factor in `[0.5, 1.5)`. The result never
/// exceeds `max_delay_ms`.
#[must_use]
pub fn backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    random: f64,
) -> Duration {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);
    let jitter = 0.5 + random.clamp(0.0, 1.0);
    let ms = ((capped as f64) * jitter).round().clamp(0.0, max_delay_ms as f64);
    Duration::from_millis(ms as u64)
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Decides retries from per-class failure counts.
#[derive(Debug, Clone)]
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Jittered exponential delay for the zero-based `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay_with_random(
            attempt,
            self.config.base_delay_ms,
            self.config.max_delay_ms,
            rand::random::<f64>(),
        )
    }

    /// Decide after the `failures`-th failure of `class` for one chunk
    /// (counting the one just observed, so `failures >= 1`).
    ///
    /// `max_attempts` bounds provider calls, not retries: with the default of
    /// 6, the 6th consecutive capacity failure gives up, so an exhausted chunk
    /// is called exactly 6 times and never a 7th. A `retry_after` hint raises
    /// the delay but never past the cap.
    pub fn decide(
        &self,
        class: FailureClass,
        failures: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        let failures = failures.max(1);
        match class {
            FailureClass::FatalInput => RetryDecision::GiveUp,
            FailureClass::TransientCapacity => {
                if failures >= self.config.max_attempts {
                    return RetryDecision::GiveUp;
                }
                let cap = Duration::from_millis(self.config.max_delay_ms);
                let mut delay = self.backoff_delay(failures - 1);
                if let Some(hint) = retry_after {
                    delay = delay.max(hint.min(cap));
                }
                RetryDecision::Retry { delay }
            }
            FailureClass::TransientState => {
                if failures >= self.config.max_state_polls {
                    return RetryDecision::GiveUp;
                }
                RetryDecision::Retry {
                    delay: Duration::from_millis(self.config.state_poll_interval_ms),
                }
            }
            FailureClass::FatalOther => {
                if failures > self.config.fatal_other_retries {
                    return RetryDecision::GiveUp;
                }
                RetryDecision::Retry {
                    delay: self.backoff_delay(failures - 1),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> ProviderError {
        ProviderError::Http {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_classify() {
        let limited = ProviderError::RateLimited {
            message: "quota".into(),
            retry_after: None,
        };
        assert_eq!(classify(&limited), FailureClass::TransientCapacity);
        assert_eq!(
            classify(&ProviderError::NotReady("PROCESSING".into())),
            FailureClass::TransientState
        );
        assert_eq!(
            classify(&ProviderError::InvalidInput("too large".into())),
            FailureClass::FatalInput
        );
        assert_eq!(
            classify(&ProviderError::Timeout(Duration::from_secs(600))),
            FailureClass::FatalOther
        );
        assert_eq!(classify(&http(429)), FailureClass::TransientCapacity);
        assert_eq!(classify(&http(503)), FailureClass::TransientCapacity);
        assert_eq!(classify(&http(409)), FailureClass::TransientState);
        assert_eq!(classify(&http(413)), FailureClass::FatalInput);
        assert_eq!(classify(&http(418)), FailureClass::FatalOther);
    }

    #[test]
    fn test_backoff_bounds() {
        // attempt 0 at 1s base: [0.5s, 1.5s).
        assert_eq!(
            backoff_delay_with_random(0, 1000, 60_000, 0.0),
            Duration::from_millis(500)
        );
        assert_eq!(
            backoff_delay_with_random(0, 1000, 60_000, 0.5),
            Duration::from_millis(1000)
        );
        assert_eq!(
            backoff_delay_with_random(3, 1000, 60_000, 0.5),
            Duration::from_millis(8000)
        );
        // Capped even with maximal jitter.
        assert_eq!(
            backoff_delay_with_random(10, 1000, 60_000, 0.999),
            Duration::from_millis(60_000)
        );
        assert_eq!(
            backoff_delay_with_random(u32::MAX, u64::MAX, 60_000, 0.999),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn test_backoff_non_decreasing_in_expectation() {
        let mut previous = Duration::ZERO;
        for attempt in 0..12 {
            let mid = backoff_delay_with_random(attempt, 1000, 60_000, 0.5);
            assert!(mid >= previous);
            previous = mid;
        }
    }

    #[test]
    fn test_random_backoff_never_exceeds_cap() {
        let controller = RetryController::new(RetryConfig::default());
        for attempt in 0..40 {
            assert!(controller.backoff_delay(attempt) <= Duration::from_secs(60));
        }
    }

    #[test]
    fn test_capacity_ceiling() {
        let controller = RetryController::new(RetryConfig::default());
        for failures in 1..6 {
            assert!(controller
                .decide(FailureClass::TransientCapacity, failures, None)
                .is_retry());
        }
        assert_eq!(
            controller.decide(FailureClass::TransientCapacity, 6, None),
            RetryDecision::GiveUp
        );
        assert_eq!(
            controller.decide(FailureClass::TransientCapacity, 7, None),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_retry_after_hint_is_capped() {
        let controller = RetryController::new(RetryConfig::default());
        match controller.decide(
            FailureClass::TransientCapacity,
            1,
            Some(Duration::from_secs(30)),
        ) {
            RetryDecision::Retry { delay } => assert_eq!(delay, Duration::from_secs(30)),
            RetryDecision::GiveUp => panic!("expected retry"),
        }
        match controller.decide(
            FailureClass::TransientCapacity,
            1,
            Some(Duration::from_secs(3600)),
        ) {
            RetryDecision::Retry { delay } => assert_eq!(delay, Duration::from_secs(60)),
            RetryDecision::GiveUp => panic!("expected retry"),
        }
    }

    #[test]
    fn test_state_polls_fixed_interval() {
        let controller = RetryController::new(RetryConfig::default());
        for failures in [1, 5, 9] {
            assert_eq!(
                controller.decide(FailureClass::TransientState, failures, None),
                RetryDecision::Retry {
                    delay: Duration::from_secs(3)
                }
            );
        }
        assert_eq!(
            controller.decide(FailureClass::TransientState, 10, None),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_fatal_classes() {
        let controller = RetryController::new(RetryConfig::default());
        assert_eq!(
            controller.decide(FailureClass::FatalInput, 1, None),
            RetryDecision::GiveUp
        );
        assert!(controller.decide(FailureClass::FatalOther, 1, None).is_retry());
        assert_eq!(
            controller.decide(FailureClass::FatalOther, 2, None),
            RetryDecision::GiveUp
        );
    }
}
