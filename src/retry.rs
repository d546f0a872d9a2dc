// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Bounded retry with exponential backoff.
//!
//! Both the issuance pipeline (waiting on the CA) and the device agent
//! (waiting on the object store) block on a collaborator that answers
//! "not yet" for a while. A poll closure returns `Ok(Some(_))` when done,
//! `Ok(None)` when the collaborator is still working, and `Err(_)` otherwise.
//! Errors for which [`Error::is_transient`] holds are retried like `Ok(None)`,
//! anything else aborts the loop at once.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::{Error, Result};

/// Retry budget and delay policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Maximum number of poll attempts, at least one.
    pub max_attempts: u32,
    /// Delay after the first unsuccessful attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor applied to the delay after each attempt. 1 keeps it fixed.
    pub multiplier: u32,
    /// Wall-clock limit for the whole loop.
    pub deadline: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            multiplier: 2,
            deadline: Some(Duration::from_secs(60)),
        }
    }
}

impl Backoff {
    /// A policy that never sleeps, for in-process collaborators and tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Backoff {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1,
            deadline: None,
        }
    }

    /// Delay to wait after attempt number `attempt` (1-based) failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Polls `op` until it yields a value, fails permanently, or the budget
    /// runs out. On exhaustion the error built by `exhausted` from the number
    /// of attempts made is returned.
    pub fn poll<T, F, E>(&self, what: &str, mut op: F, exhausted: E) -> Result<T>
    where
        F: FnMut() -> Result<Option<T>>,
        E: FnOnce(u32) -> Error,
    {
        let start = Instant::now();
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        while attempt < max_attempts {
            attempt += 1;
            match op() {
                Ok(Some(value)) => {
                    debug!(what, attempt, "poll complete");
                    return Ok(value);
                }
                Ok(None) => trace!(what, attempt, "not ready"),
                Err(e) if e.is_transient() => trace!(what, attempt, error = %e, "transient failure"),
                Err(e) => return Err(e),
            }

            if attempt == max_attempts {
                break;
            }

            let delay = self.delay_after(attempt);
            if let Some(deadline) = self.deadline {
                if start.elapsed() + delay >= deadline {
                    debug!(what, attempt, "poll deadline reached");
                    break;
                }
            }
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }

        Err(exhausted(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout(attempts: u32) -> Error {
        Error::IssuanceTimeout {
            device_id: "dev".into(),
            attempts,
        }
    }

    #[test]
    fn ready_on_first_attempt() {
        let mut calls = 0;
        let value = Backoff::immediate(3)
            .poll(
                "test",
                || {
                    calls += 1;
                    Ok(Some(42))
                },
                timeout,
            )
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn pending_and_transient_are_retried() {
        let mut calls = 0;
        let value = Backoff::immediate(5)
            .poll(
                "test",
                || {
                    calls += 1;
                    match calls {
                        1 => Ok(None),
                        2 => Err(Error::Pending),
                        3 => Err(Error::Unavailable("flaky".into())),
                        _ => Ok(Some("done")),
                    }
                },
                timeout,
            )
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls, 4);
    }

    #[test]
    fn exhausted_budget_reports_attempts() {
        let mut calls = 0;
        let err = Backoff::immediate(4)
            .poll::<(), _, _>(
                "test",
                || {
                    calls += 1;
                    Err(Error::Pending)
                },
                timeout,
            )
            .unwrap_err();

        assert!(matches!(err, Error::IssuanceTimeout { attempts: 4, .. }));
        assert_eq!(calls, 4);
    }

    #[test]
    fn permanent_failure_aborts_at_once() {
        let mut calls = 0;
        let err = Backoff::immediate(10)
            .poll::<(), _, _>(
                "test",
                || {
                    calls += 1;
                    Err(Error::Rejected("bad request".into()))
                },
                timeout,
            )
            .unwrap_err();

        assert!(matches!(err, Error::Rejected(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn deadline_cuts_the_loop_short() {
        let backoff = Backoff {
            max_attempts: 100,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(20),
            multiplier: 1,
            deadline: Some(Duration::from_millis(50)),
        };
        let err = backoff
            .poll::<(), _, _>("test", || Ok(None), timeout)
            .unwrap_err();

        match err {
            Error::IssuanceTimeout { attempts, .. } => assert!(attempts < 100),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn delays_grow_and_saturate() {
        let backoff = Backoff {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2,
            deadline: None,
        };

        assert_eq!(backoff.delay_after(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_after(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_after(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_after(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_after(40), Duration::from_millis(500));
    }
}
