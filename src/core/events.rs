//! Configurable log events.
//!
//! Every lifecycle log the pipeline emits is described by a [`LogEvent`]:
//! a level plus an optional custom template. Templates use `{PLACEHOLDER}`
//! slots (`{URL}`, `{STATUS}`, `{RETRY_DELAY}`, ...); unknown placeholders
//! are left literal so a typo in a user template never breaks a request.

use std::time::Duration;

use crate::context::RequestContext;
use crate::retry::RetrySnapshot;
use crate::throttle::ThrottleRule;
use crate::transport::Response;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug)]
pub struct LogEvent {
    level: LogLevel,
    custom_message: Option<String>,
}

impl LogEvent {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            custom_message: None,
        }
    }

    pub fn with_message(level: LogLevel, template: impl Into<String>) -> Self {
        Self {
            level,
            custom_message: Some(template.into()),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub(crate) fn emit(&self, default_template: &str, args: &[(&str, String)]) {
        let template = self.custom_message.as_deref().unwrap_or(default_template);
        let message = format_template(template, args);
        match self.level {
            LogLevel::Trace => tracing::trace!(target: "gracile", "{message}"),
            LogLevel::Debug => tracing::debug!(target: "gracile", "{message}"),
            LogLevel::Info => tracing::info!(target: "gracile", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "gracile", "{message}"),
            LogLevel::Error => tracing::error!(target: "gracile", "{message}"),
        }
    }
}

pub(crate) const MSG_BEFORE: &str = "Request on {URL} is ongoing";
pub(crate) const MSG_AFTER: &str = "{REPLAY}[{METHOD}] {URL} returned {STATUS}";
pub(crate) const MSG_ERRORS: &str = "[{METHOD}] {URL} returned a bad status ({STATUS})";
pub(crate) const MSG_THROTTLE_HIT: &str = "{URL} hit {THROTTLE_LIMIT} reqs/{THROTTLE_TIME_RANGE}";
pub(crate) const MSG_THROTTLE_DONE: &str = "Done waiting {THROTTLE_TIME}s to hit {URL}";
pub(crate) const MSG_RETRY_BEFORE: &str = "Retry: {URL} will wait {RETRY_DELAY}s before the next \
                                           attempt due to {RETRY_CAUSE} ({CUR_ATTEMPT} out of {MAX_ATTEMPT})";
pub(crate) const MSG_RETRY_AFTER: &str =
    "Retry: {URL} replied {STATUS} ({CUR_ATTEMPT} out of {MAX_ATTEMPT})";
pub(crate) const MSG_RETRY_EXHAUSTED: &str =
    "Retry: {URL} exhausted the maximum attempts of {MAX_ATTEMPT} due to {RETRY_CAUSE}";
pub(crate) const MSG_REPLAY_RECORDED: &str = "Replay: recorded {RECORDED_COUNT} requests";
pub(crate) const MSG_REPLAY_REPLAYED: &str = "Replay: replayed {REPLAYED_COUNT} requests";
pub(crate) const MSG_CONCURRENCY_HIT: &str =
    "{UURL} hit {CONCURRENT_REQUESTS} ongoing concurrent requests";
pub(crate) const MSG_CONCURRENCY_FREED: &str =
    "{UURL} concurrency has been freed at {CONCURRENCY_CAP}";

/// Replaces every known `{KEY}` with its value and leaves unknown
/// placeholders (and stray braces) untouched.
pub(crate) fn format_template(template: &str, args: &[(&str, String)]) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let key = &after_open[..close];
                match args.iter().find(|(name, _)| *name == key) {
                    Some((_, value)) => output.push_str(value),
                    None => {
                        output.push('{');
                        output.push_str(key);
                        output.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                output.push_str(&rest[open..]);
                return output;
            }
        }
    }

    output.push_str(rest);
    output
}

pub(crate) fn context_args(ctx: &RequestContext) -> Vec<(&'static str, String)> {
    vec![
        ("URL", ctx.url().to_owned()),
        ("UURL", ctx.unformatted_url().to_owned()),
        ("ENDPOINT", ctx.endpoint().to_owned()),
        ("UENDPOINT", ctx.unformatted_endpoint().to_owned()),
        ("METHOD", ctx.method().to_string()),
    ]
}

pub(crate) fn response_args(response: Option<&Response>) -> Vec<(&'static str, String)> {
    let (status, elapsed) = match response {
        Some(response) => (
            response.status().as_u16().to_string(),
            format!("{:?}", response.elapsed()),
        ),
        None => ("ABORTED".to_owned(), "UNKNOWN".to_owned()),
    };
    let replayed = response.is_some_and(Response::is_replay);
    let is_replay = if replayed { "TRUE" } else { "FALSE" };
    let replay_prefix = if replayed { "REPLAYED " } else { "" };

    vec![
        ("STATUS", status),
        ("ELAPSED", elapsed),
        ("IS_REPLAY", is_replay.to_owned()),
        ("REPLAY", replay_prefix.to_owned()),
    ]
}

pub(crate) fn retry_args(snapshot: &RetrySnapshot) -> Vec<(&'static str, String)> {
    vec![
        ("RETRY_DELAY", format_seconds(snapshot.delay)),
        ("RETRY_CAUSE", snapshot.cause.clone()),
        ("CUR_ATTEMPT", snapshot.attempt.to_string()),
        ("MAX_ATTEMPT", snapshot.max_attempts.to_string()),
    ]
}

pub(crate) fn throttle_args(rule: &ThrottleRule, wait: Duration) -> Vec<(&'static str, String)> {
    vec![
        ("THROTTLE_LIMIT", rule.max_requests().to_string()),
        ("THROTTLE_TIME", format_seconds(wait)),
        ("THROTTLE_TIME_RANGE", rule.readable_time_range()),
    ]
}

pub(crate) fn format_seconds(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if (seconds - seconds.round()).abs() < 1e-9 {
        format!("{}", seconds.round() as u64)
    } else {
        format!("{seconds:.2}")
    }
}
