//! Retry policy (spec §4.1, §7): exponential backoff with jitter,
//! classified per error. `RateLimited` honors a server `Retry-After` when
//! present and does not count against the retry budget in that case;
//! `ExchangeError`/`ParseError` are terminal.

use crate::config::RetryConfig;
use crate::error::CollectorError;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Abort,
}

/// Decides what to do after a failed call. `attempt` is the number of
/// attempts already made (1-indexed); budget-consuming attempts only
/// advance `attempt` when the error counts against the retry budget.
pub fn classify(config: &RetryConfig, error: &CollectorError, attempt: u32) -> RetryDecision {
    match error {
        CollectorError::RateLimited { retry_after_ms, .. } => {
            let delay = match retry_after_ms {
                Some(ms) => Duration::from_millis(*ms),
                None => backoff_delay(config, attempt, config.multiplier * 2.0),
            };
            RetryDecision::Retry { delay }
        }
        CollectorError::Network { .. } | CollectorError::Timeout { .. } => {
            if attempt >= config.attempts {
                RetryDecision::Abort
            } else {
                RetryDecision::Retry {
                    delay: backoff_delay(config, attempt, config.multiplier),
                }
            }
        }
        CollectorError::ServerError { .. } => {
            if attempt >= config.attempts {
                RetryDecision::Abort
            } else {
                RetryDecision::Retry {
                    delay: backoff_delay(config, attempt, config.multiplier),
                }
            }
        }
        CollectorError::ExchangeError { .. } | CollectorError::ParseError { .. } => {
            RetryDecision::Abort
        }
    }
}

/// Whether `error` (when it leads to `Retry`) should increment the caller's
/// retry-budget counter. `RateLimited` with an explicit `Retry-After` is
/// exempt, per spec §4.1.
pub fn counts_against_budget(error: &CollectorError) -> bool {
    !matches!(
        error,
        CollectorError::RateLimited {
            retry_after_ms: Some(_),
            ..
        }
    )
}

fn backoff_delay(config: &RetryConfig, attempt: u32, multiplier: f64) -> Duration {
    let exp = multiplier.max(2.0).powi(attempt.saturating_sub(1) as i32);
    let raw_ms = (config.base_ms as f64 * exp).min(config.max_ms as f64);
    let jitter_ms = rand::thread_rng().gen_range(0.0..=raw_ms * 0.25);
    Duration::from_millis((raw_ms + jitter_ms) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RetryConfig {
        RetryConfig {
            attempts: 3,
            base_ms: 100,
            max_ms: 10_000,
            multiplier: 2.0,
        }
    }

    #[test]
    fn exchange_error_aborts_immediately() {
        let err = CollectorError::ExchangeError {
            exchange: "binance".into(),
            endpoint: "klines".into(),
            status: 400,
            message: "bad symbol".into(),
        };
        assert_eq!(classify(&cfg(), &err, 1), RetryDecision::Abort);
    }

    #[test]
    fn parse_error_aborts() {
        let err = CollectorError::ParseError {
            endpoint: "klines".into(),
            message: "bad json".into(),
        };
        assert_eq!(classify(&cfg(), &err, 1), RetryDecision::Abort);
    }

    #[test]
    fn network_error_retries_until_budget_exhausted() {
        let err = CollectorError::Network {
            endpoint: "klines".into(),
            source: make_reqwest_error(),
        };
        assert!(matches!(
            classify(&cfg(), &err, 1),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(classify(&cfg(), &err, 3), RetryDecision::Abort);
    }

    #[test]
    fn explicit_retry_after_is_honored_and_exempt_from_budget() {
        let err = CollectorError::RateLimited {
            endpoint: "klines".into(),
            retry_after_ms: Some(2_000),
        };
        match classify(&cfg(), &err, 10) {
            RetryDecision::Retry { delay } => assert_eq!(delay, Duration::from_millis(2_000)),
            RetryDecision::Abort => panic!("rate limited must never abort"),
        }
        assert!(!counts_against_budget(&err));
    }

    #[test]
    fn implicit_rate_limit_counts_against_budget() {
        let err = CollectorError::RateLimited {
            endpoint: "klines".into(),
            retry_after_ms: None,
        };
        assert!(counts_against_budget(&err));
    }

    fn make_reqwest_error() -> reqwest::Error {
        // reqwest::Error has no public constructor; build one via a client
        // call that is guaranteed to fail synchronously (bad scheme).
        reqwest::Client::new()
            .get("not-a-url")
            .build()
            .unwrap_err()
    }
}
