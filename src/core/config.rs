use std::collections::BTreeSet;
use std::sync::Arc;

use http::StatusCode;

use crate::concurrency::ConcurrencyLimit;
use crate::events::{LogEvent, LogLevel};
use crate::parse::ResponseParser;
use crate::retry::RetryPolicy;
use crate::throttle::Throttle;
use crate::validate::ResponseValidator;

/// A config field that distinguishes "never set" from "explicitly disabled".
///
/// `Unset` inherits from the parent config during a merge; `Disabled` clears
/// an inherited value and reads as absent afterwards.
#[derive(Clone, Debug)]
pub enum Setting<T> {
    Unset,
    Disabled,
    Value(T),
}

impl<T> Default for Setting<T> {
    fn default() -> Self {
        Self::Unset
    }
}

impl<T> Setting<T> {
    pub fn effective(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Unset | Self::Disabled => None,
        }
    }

    pub const fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    fn merged_with(&self, parent: &Self) -> Self
    where
        T: Clone,
    {
        match self {
            Self::Unset => parent.clone(),
            other => other.clone(),
        }
    }
}

impl<T> From<T> for Setting<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}

/// One or many status codes, used by the strict/allowed settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusSet(BTreeSet<u16>);

impl StatusSet {
    pub fn contains(&self, status: StatusCode) -> bool {
        self.0.contains(&status.as_u16())
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<StatusCode> for StatusSet {
    fn from(status: StatusCode) -> Self {
        Self(BTreeSet::from([status.as_u16()]))
    }
}

impl From<u16> for StatusSet {
    fn from(status: u16) -> Self {
        Self(BTreeSet::from([status]))
    }
}

impl<const N: usize> From<[u16; N]> for StatusSet {
    fn from(statuses: [u16; N]) -> Self {
        Self(statuses.into_iter().collect())
    }
}

impl FromIterator<u16> for StatusSet {
    fn from_iter<I: IntoIterator<Item = u16>>(statuses: I) -> Self {
        Self(statuses.into_iter().collect())
    }
}

/// The behavior bundle attached to a client, and overridable per call.
///
/// Every field is a [`Setting`]; merging is field-by-field with the child
/// winning whenever it is not `Unset`.
#[derive(Clone, Default)]
pub struct ClientConfig {
    pub strict_status_code: Setting<StatusSet>,
    pub allowed_status_code: Setting<StatusSet>,
    pub validators: Setting<Vec<Arc<dyn ResponseValidator>>>,
    pub parser: Setting<ResponseParser>,
    pub retry: Setting<RetryPolicy>,
    pub throttling: Setting<Throttle>,
    pub concurrency: Setting<Vec<ConcurrencyLimit>>,
    pub log_request: Setting<LogEvent>,
    pub log_response: Setting<LogEvent>,
    pub log_errors: Setting<LogEvent>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientConfig")
            .field("strict_status_code", &self.strict_status_code)
            .field("allowed_status_code", &self.allowed_status_code)
            .field("validators", &self.validators.effective().map(Vec::len))
            .field("parser", &self.parser)
            .field("retry", &self.retry)
            .field("throttling", &self.throttling)
            .field("concurrency", &self.concurrency)
            .field("log_request", &self.log_request)
            .field("log_response", &self.log_response)
            .field("log_errors", &self.log_errors)
            .finish()
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The baseline every client starts from: bad statuses logged at ERROR,
    /// everything else unset.
    pub fn standard() -> Self {
        Self {
            log_errors: Setting::Value(LogEvent::new(LogLevel::Error)),
            ..Self::default()
        }
    }

    pub fn strict_status(mut self, statuses: impl Into<StatusSet>) -> Self {
        self.strict_status_code = Setting::Value(statuses.into());
        self
    }

    pub fn allowed_status(mut self, statuses: impl Into<StatusSet>) -> Self {
        self.allowed_status_code = Setting::Value(statuses.into());
        self
    }

    pub fn validator(mut self, validator: Arc<dyn ResponseValidator>) -> Self {
        match &mut self.validators {
            Setting::Value(validators) => validators.push(validator),
            slot => *slot = Setting::Value(vec![validator]),
        }
        self
    }

    pub fn parser(mut self, parser: ResponseParser) -> Self {
        self.parser = Setting::Value(parser);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Setting::Value(retry);
        self
    }

    /// Clears any inherited retry policy for calls using this config.
    pub fn no_retry(mut self) -> Self {
        self.retry = Setting::Disabled;
        self
    }

    pub fn throttling(mut self, throttle: Throttle) -> Self {
        self.throttling = Setting::Value(throttle);
        self
    }

    pub fn no_throttling(mut self) -> Self {
        self.throttling = Setting::Disabled;
        self
    }

    pub fn concurrency(mut self, limits: impl IntoIterator<Item = ConcurrencyLimit>) -> Self {
        self.concurrency = Setting::Value(limits.into_iter().collect());
        self
    }

    pub fn log_request(mut self, event: LogEvent) -> Self {
        self.log_request = Setting::Value(event);
        self
    }

    pub fn log_response(mut self, event: LogEvent) -> Self {
        self.log_response = Setting::Value(event);
        self
    }

    pub fn log_errors(mut self, event: LogEvent) -> Self {
        self.log_errors = Setting::Value(event);
        self
    }

    pub fn no_error_logs(mut self) -> Self {
        self.log_errors = Setting::Disabled;
        self
    }

    /// Child fields override parent fields; `Unset` children inherit.
    pub fn merge(parent: &Self, child: &Self) -> Self {
        Self {
            strict_status_code: child.strict_status_code.merged_with(&parent.strict_status_code),
            allowed_status_code: child
                .allowed_status_code
                .merged_with(&parent.allowed_status_code),
            validators: child.validators.merged_with(&parent.validators),
            parser: child.parser.merged_with(&parent.parser),
            retry: child.retry.merged_with(&parent.retry),
            throttling: child.throttling.merged_with(&parent.throttling),
            concurrency: child.concurrency.merged_with(&parent.concurrency),
            log_request: child.log_request.merged_with(&parent.log_request),
            log_response: child.log_response.merged_with(&parent.log_response),
            log_errors: child.log_errors.merged_with(&parent.log_errors),
        }
    }

    /// Whether `status` belongs to the effective success set: the strict set
    /// when one is configured, otherwise 2xx plus the allowed set.
    pub fn is_success(&self, status: StatusCode) -> bool {
        if let Some(strict) = self.strict_status_code.effective() {
            return strict.contains(status);
        }
        if status.is_success() {
            return true;
        }
        self.allowed_status_code
            .effective()
            .is_some_and(|allowed| allowed.contains(status))
    }

    /// First concurrency rule whose pattern matches the unformatted URL.
    pub(crate) fn concurrency_rule_for(&self, unformatted_url: &str) -> Option<&ConcurrencyLimit> {
        self.concurrency
            .effective()?
            .iter()
            .find(|rule| rule.matches(unformatted_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_child_values() {
        let parent = ClientConfig::new().strict_status(200);
        let child = ClientConfig::new().strict_status(201);
        let merged = ClientConfig::merge(&parent, &child);
        assert!(merged.is_success(StatusCode::CREATED));
        assert!(!merged.is_success(StatusCode::OK));
    }

    #[test]
    fn merge_inherits_unset_fields() {
        let parent = ClientConfig::new().allowed_status(404);
        let child = ClientConfig::new();
        let merged = ClientConfig::merge(&parent, &child);
        assert!(merged.is_success(StatusCode::NOT_FOUND));
    }

    #[test]
    fn disabled_child_clears_inherited_value() {
        let parent = ClientConfig::new().retry(RetryPolicy::new(3));
        let child = ClientConfig::new().no_retry();
        let merged = ClientConfig::merge(&parent, &child);
        assert!(merged.retry.effective().is_none());
    }

    #[test]
    fn success_set_defaults_to_2xx() {
        let config = ClientConfig::new();
        assert!(config.is_success(StatusCode::OK));
        assert!(config.is_success(StatusCode::NO_CONTENT));
        assert!(!config.is_success(StatusCode::NOT_FOUND));
    }

    #[test]
    fn strict_dominates_allowed() {
        let config = ClientConfig::new().strict_status(201).allowed_status(404);
        assert!(config.is_success(StatusCode::CREATED));
        assert!(!config.is_success(StatusCode::OK));
        assert!(!config.is_success(StatusCode::NOT_FOUND));
    }
}
