use http::Method;
use thiserror::Error;

use crate::transport::Response;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where a transport failure originated. Useful for retry filters that only
/// want to retry connection-level trouble.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Reset,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Reset => "reset",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Stable, matchable identity of an [`Error`] variant.
///
/// Retry filters (`RetryPolicy::on_kinds`) and metrics match on this rather
/// than on the carried payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    Transport,
    BadStatus,
    ValidatorFailed,
    ParserFailed,
    UserDefined,
    RetryExhausted,
    NoReplay,
    Timeout,
    Cancelled,
    InvalidBaseUrl,
    Template,
    SerializeJson,
    SerializeQuery,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::BadStatus => "bad_status",
            Self::ValidatorFailed => "validator_failed",
            Self::ParserFailed => "parser_failed",
            Self::UserDefined => "user_defined",
            Self::RetryExhausted => "retry_exhausted",
            Self::NoReplay => "no_replay",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidBaseUrl => "invalid_base_url",
            Self::Template => "template",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("transport error ({kind}) for {method} {url}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("{method} {url} returned a bad status ({status})")]
    BadStatus {
        status: u16,
        method: Method,
        url: String,
        response: Box<Response>,
    },
    #[error("validator rejected response from {method} {url} ({status}): {reason}")]
    ValidatorFailed {
        reason: String,
        status: u16,
        method: Method,
        url: String,
        response: Box<Response>,
    },
    #[error("failed to parse response from {method} {url} ({status}): {source}")]
    ParserFailed {
        status: u16,
        method: Method,
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("{message}")]
    UserDefined {
        message: String,
        status: u16,
        url: String,
    },
    #[error("{url} exhausted the maximum attempts of {max_attempts}: {source}")]
    RetryExhausted {
        max_attempts: usize,
        url: String,
        #[source]
        source: Box<Error>,
    },
    #[error("no recorded exchange matches {method} {url}; was it ever recorded?")]
    NoReplay { method: Method, url: String },
    #[error("request timed out after {timeout_ms}ms for {method} {url}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        url: String,
    },
    #[error("request was cancelled for {method} {url}")]
    Cancelled { method: Method, url: String },
    #[error("invalid base url: {url}")]
    InvalidBaseUrl { url: String },
    #[error("endpoint template {endpoint} is missing a value for {{{placeholder}}}")]
    Template {
        endpoint: String,
        placeholder: String,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
}

impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::BadStatus { .. } => ErrorKind::BadStatus,
            Self::ValidatorFailed { .. } => ErrorKind::ValidatorFailed,
            Self::ParserFailed { .. } => ErrorKind::ParserFailed,
            Self::UserDefined { .. } => ErrorKind::UserDefined,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::NoReplay { .. } => ErrorKind::NoReplay,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::InvalidBaseUrl { .. } => ErrorKind::InvalidBaseUrl,
            Self::Template { .. } => ErrorKind::Template,
            Self::SerializeJson { .. } => ErrorKind::SerializeJson,
            Self::SerializeQuery { .. } => ErrorKind::SerializeQuery,
        }
    }

    /// Status code of the response that produced this error, if one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::BadStatus { status, .. }
            | Self::ValidatorFailed { status, .. }
            | Self::ParserFailed { status, .. }
            | Self::UserDefined { status, .. } => Some(*status),
            Self::RetryExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// The response carried by this error, when the failure happened after a
    /// response was received.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::BadStatus { response, .. } | Self::ValidatorFailed { response, .. } => {
                Some(response)
            }
            Self::RetryExhausted { source, .. } => source.response(),
            _ => None,
        }
    }

    /// Short cause description used by the `{RETRY_CAUSE}` log placeholder.
    pub(crate) fn retry_cause(&self) -> String {
        match self {
            Self::BadStatus { status, .. } => format!("[Bad Status Code: {status}]"),
            Self::ValidatorFailed { reason, .. } => format!("[Validator: {reason}]"),
            Self::UserDefined { status, .. } => format!("[User Error: {status}]"),
            Self::Transport { kind, .. } => format!("[Request Error: {kind}]"),
            Self::Timeout { .. } => "[Timeout]".to_owned(),
            Self::NoReplay { .. } => "[No Replay]".to_owned(),
            other => format!("[{}]", other.kind()),
        }
    }
}
