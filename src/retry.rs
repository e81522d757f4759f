//! Central retry policy shared by sync-open's stale-redirect retry and
//! Restore's attempt loop.

use std::thread;
use std::time::Duration;

use crate::error::Errno;

/// Backoff and attempt-count policy for a blocking retry loop.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
    retry_if: fn(&Errno) -> bool,
}

fn is_stale_redirect(errno: &Errno) -> bool {
    *errno == Errno::STALE_REDIRECT
}

fn always_retry(_errno: &Errno) -> bool {
    true
}

/// Every failure retries except `RESTORE_ABORT`, Restore's signal that a
/// peek failure aborted the attempt loop outright rather than just the
/// current attempt.
fn restore_retry(errno: &Errno) -> bool {
    *errno != Errno::RESTORE_ABORT
}

impl RetryPolicy {
    /// Policy for the synchronous data-server open loop: retries only on
    /// the stale-redirect errno, up to `max_retries` times, sleeping 10ms
    /// between attempts.
    pub fn sync_open(max_retries: u64) -> Self {
        RetryPolicy {
            max_attempts: max_retries.min(u32::MAX as u64) as u32,
            backoff: Duration::from_millis(10),
            retry_if: is_stale_redirect,
        }
    }

    /// Policy for the Restore open/close attempt loop: 3 attempts, 5s
    /// backoff. The outer loop here is driven by open/close failing;
    /// `retry_if` only declines to retry `RESTORE_ABORT`, the sentinel a
    /// peek failure uses to abort the whole loop immediately.
    pub fn restore() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
            retry_if: restore_retry,
        }
    }

    /// Maximum number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `attempt` up to `max_attempts` times (1-indexed attempt number
    /// passed in), sleeping `backoff` between failures, stopping early if
    /// `retry_if` returns false for the last error.
    pub fn run_blocking<T>(
        &self,
        mut attempt: impl FnMut(u32) -> Result<T, Errno>,
    ) -> Result<T, Errno> {
        let mut last_err = Errno::EIO;
        for n in 1..=self.max_attempts.max(1) {
            match attempt(n) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_err = err;
                    if !(self.retry_if)(&last_err) || n == self.max_attempts {
                        break;
                    }
                    thread::sleep(self.backoff);
                }
            }
        }
        Err(last_err)
    }
}
