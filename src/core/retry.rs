use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use http::StatusCode;

use crate::error::{Error, ErrorKind};
use crate::events::LogEvent;

/// What to do when attempts run out (or the failure is not retryable).
///
/// `Break` propagates the error; `Pass` hands the last response to the
/// parser as if it had succeeded, when a response exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryBehavior {
    #[default]
    Break,
    Pass,
}

/// The failure filter: which statuses and error kinds warrant a retry.
/// A policy without a filter retries any failure.
#[derive(Clone, Debug, Default)]
pub struct RetryOn {
    statuses: BTreeSet<u16>,
    kinds: BTreeSet<ErrorKind>,
}

impl RetryOn {
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.statuses.extend(statuses);
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    fn matches(&self, error: &Error) -> bool {
        if let Some(status) = error.status()
            && self.statuses.contains(&status)
        {
            return true;
        }
        self.kinds.contains(&error.kind())
    }
}

/// Per-status adjustment applied when the last outcome matched the key.
#[derive(Clone, Debug, Default)]
pub struct RetryOverride {
    delay: Option<Duration>,
    retry_on: Option<RetryOn>,
}

impl RetryOverride {
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = Some(retry_on);
        self
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_attempts: usize,
    delay_modifier: f64,
    retry_on: Option<RetryOn>,
    behavior: RetryBehavior,
    overrides: HashMap<u16, RetryOverride>,
    log_before: Option<LogEvent>,
    log_after: Option<LogEvent>,
    log_exhausted: Option<LogEvent>,
}

impl RetryPolicy {
    /// `max_attempts` counts the first attempt; it is clamped to at least 1.
    pub fn new(max_attempts: usize) -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: max_attempts.max(1),
            delay_modifier: 1.0,
            retry_on: None,
            behavior: RetryBehavior::Break,
            overrides: HashMap::new(),
            log_before: None,
            log_after: None,
            log_exhausted: None,
        }
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn delay_modifier(mut self, delay_modifier: f64) -> Self {
        self.delay_modifier = if delay_modifier.is_finite() && delay_modifier > 0.0 {
            delay_modifier
        } else {
            1.0
        };
        self
    }

    pub fn retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = Some(retry_on);
        self
    }

    pub fn behavior(mut self, behavior: RetryBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn override_status(mut self, status: StatusCode, adjustment: RetryOverride) -> Self {
        self.overrides.insert(status.as_u16(), adjustment);
        self
    }

    pub fn log_before(mut self, event: LogEvent) -> Self {
        self.log_before = Some(event);
        self
    }

    pub fn log_after(mut self, event: LogEvent) -> Self {
        self.log_after = Some(event);
        self
    }

    pub fn log_exhausted(mut self, event: LogEvent) -> Self {
        self.log_exhausted = Some(event);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn behavior_value(&self) -> RetryBehavior {
        self.behavior
    }

    pub(crate) fn log_before_event(&self) -> Option<&LogEvent> {
        self.log_before.as_ref()
    }

    pub(crate) fn log_after_event(&self) -> Option<&LogEvent> {
        self.log_after.as_ref()
    }

    pub(crate) fn log_exhausted_event(&self) -> Option<&LogEvent> {
        self.log_exhausted.as_ref()
    }

    /// Whether the failure is one this policy retries. Attempt budgeting is
    /// the pipeline's business, not the filter's.
    pub(crate) fn should_retry(&self, error: &Error) -> bool {
        let effective = error
            .status()
            .and_then(|status| self.overrides.get(&status))
            .and_then(|adjustment| adjustment.retry_on.as_ref())
            .or(self.retry_on.as_ref());

        match effective {
            None => true,
            Some(filter) => filter.matches(error),
        }
    }

    /// Delay to sleep before `next_attempt` (2-based). Schedule:
    /// `base_delay × delay_modifier^(next_attempt − 2)`, unless the last
    /// status carries a delay override.
    pub(crate) fn delay_before(&self, next_attempt: usize, last_status: Option<u16>) -> Duration {
        if let Some(status) = last_status
            && let Some(adjustment) = self.overrides.get(&status)
            && let Some(delay) = adjustment.delay
        {
            return delay;
        }

        let exponent = next_attempt.saturating_sub(2).min(63) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.delay_modifier.powi(exponent);
        Duration::from_secs_f64(scaled.clamp(0.0, Duration::MAX.as_secs_f64()))
    }
}

/// Read-only view of the retry loop handed to hooks and log formatting.
#[derive(Clone, Debug)]
pub struct RetrySnapshot {
    pub attempt: usize,
    pub max_attempts: usize,
    pub delay: Duration,
    pub cause: String,
}
