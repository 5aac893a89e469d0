//! Bounded retry with a fixed back-off.
//!
//! Used by the record store to ride out transient lock contention. The
//! policy is a value so callers (and tests) can shorten the delay without
//! touching the loop.

use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_DELAY_MS: u64 = 1_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Sleep between consecutive attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_DELAY_MS),
        }
    }
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error.
    Exhausted { attempts: u32, last: E },
    /// A non-transient error stopped the loop early.
    Aborted(E),
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub fn run<T, E, F, P>(
        &self,
        operation: &str,
        is_transient: P,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if !is_transient(&err) => return Err(RetryError::Aborted(err)),
                Err(err) if attempt >= max_attempts => {
                    log::error!("{} failed after {} attempts: {}", operation, attempt, err);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(err) => {
                    log::warn!(
                        "{} attempt {}/{} failed, retrying in {:?}: {}",
                        operation,
                        attempt,
                        max_attempts,
                        self.delay,
                        err
                    );
                    std::thread::sleep(self.delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO)
    }

    #[test]
    fn default_policy_is_three_attempts_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_secs(1));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result: Result<u32, RetryError<String>> = fast(3).run(
            "op",
            |_| true,
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("busy".to_string())
                } else {
                    Ok(7)
                }
            },
        );
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let calls = Cell::new(0);
        let result: Result<(), RetryError<String>> = fast(3).run(
            "op",
            |_| true,
            || {
                calls.set(calls.get() + 1);
                Err("busy".to_string())
            },
        );
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "busy");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn non_transient_error_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), RetryError<String>> = fast(3).run(
            "op",
            |e: &String| e == "busy",
            || {
                calls.set(calls.get() + 1);
                Err("constraint".to_string())
            },
        );
        assert!(matches!(result, Err(RetryError::Aborted(_))));
        assert_eq!(calls.get(), 1);
    }
}
