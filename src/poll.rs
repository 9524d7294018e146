//! Poll-until-condition engine
//!
//! [`poll_until`] is the single waiting primitive of the crate. Every
//! higher-level "wait for X" operation (catalog presence, deployment
//! readiness, job completion) is a call to it with a specific check.
//!
//! Cadence is sleep-then-check: the first check runs one interval after the
//! call, and each following check starts at least one interval after the
//! previous one finished. Checks never overlap. No check is started once
//! the deadline has passed, but a check already in flight is awaited and a
//! matching result is honored.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default interval between checks
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Default overall timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Stand-in deadline for timeouts that do not fit in an [`Instant`]
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `start + timeout`, clamped to roughly 30 years out
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Interval, timeout and expected value of one poll loop.
///
/// Invariant: `interval > 0` and `timeout >= interval`. The constructor
/// rejects anything else with [`Error::InvalidPollSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSpec<T = bool> {
    interval: Duration,
    timeout: Duration,
    expected: T,
}

impl<T> PollSpec<T> {
    pub fn new(interval: Duration, timeout: Duration, expected: T) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::InvalidPollSpec(
                "interval must be greater than zero".to_string(),
            ));
        }
        if timeout < interval {
            return Err(Error::InvalidPollSpec(format!(
                "timeout {:?} is shorter than interval {:?}",
                timeout, interval
            )));
        }
        Ok(Self {
            interval,
            timeout,
            expected,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn expected(&self) -> &T {
        &self.expected
    }

    /// Same cadence and deadline, different expectation
    pub fn expecting<U>(&self, expected: U) -> PollSpec<U> {
        PollSpec {
            interval: self.interval,
            timeout: self.timeout,
            expected,
        }
    }

    /// Extend the timeout, e.g. to cover a cron schedule's first tick
    pub fn with_extra_timeout(self, extra: Duration) -> Self {
        Self {
            timeout: self.timeout.saturating_add(extra),
            ..self
        }
    }
}

impl Default for PollSpec<bool> {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            expected: true,
        }
    }
}

/// Invoke `check` until it returns the expected value or the deadline passes.
///
/// - `Ok(())` as soon as `check` yields `Ok(spec.expected())`.
/// - The check's own error, unchanged, the first time it returns `Err`;
///   no further checks are made. Transport and fetch errors are never
///   treated as "not yet".
/// - [`Error::DeadlineExceeded`] naming `condition`, the elapsed time and
///   the last observed value when the timeout elapses first.
pub async fn poll_until<T, F, Fut>(condition: &str, spec: &PollSpec<T>, mut check: F) -> Result<()>
where
    T: PartialEq + Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let deadline = deadline_after(start, spec.timeout);
    let mut attempts: u32 = 0;
    let mut last_observed: Option<T> = None;

    loop {
        if deadline.saturating_duration_since(Instant::now()) < spec.interval {
            tokio::time::sleep_until(deadline).await;
            break;
        }
        tokio::time::sleep(spec.interval).await;

        attempts += 1;
        let observed = check().await?;

        if observed == spec.expected {
            info!(
                condition = condition,
                attempts = attempts,
                elapsed = ?start.elapsed(),
                "Condition met"
            );
            return Ok(());
        }

        debug!(
            condition = condition,
            attempt = attempts,
            observed = ?observed,
            expected = ?spec.expected,
            "Condition not met yet"
        );
        last_observed = Some(observed);
    }

    Err(Error::DeadlineExceeded {
        condition: condition.to_string(),
        elapsed: start.elapsed(),
        expected: format!("{:?}", spec.expected),
        last_observed: last_observed.map(|v| format!("{:?}", v)),
    })
}
