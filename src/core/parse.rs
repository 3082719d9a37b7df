use std::collections::HashMap;
use std::sync::Arc;

use http::StatusCode;
use serde_json::Value;

use crate::context::RequestContext;
use crate::error::Error;
use crate::events::{self, format_template};
use crate::transport::Response;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Transformation applied to a response body. Failures surface as
/// `ErrorKind::ParserFailed`.
pub type TransformFn = Arc<dyn Fn(&Response) -> Result<Value, BoxError> + Send + Sync>;

/// What to do with a delivered response of a given status.
#[derive(Clone)]
pub enum ParserEntry {
    /// Apply a transformation and return its value.
    Transform(TransformFn),
    /// Return an empty reply. Useful for allowed 404s and 204s.
    Null,
    /// Raise a user-defined error built from a message template.
    Raise(ErrorDescriptor),
}

impl ParserEntry {
    /// The common case: decode the body as JSON.
    pub fn json() -> Self {
        Self::Transform(Arc::new(|response| {
            serde_json::from_slice(response.body()).map_err(Into::into)
        }))
    }

    pub fn transform<F>(transform: F) -> Self
    where
        F: Fn(&Response) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self::Transform(Arc::new(transform))
    }
}

impl std::fmt::Debug for ParserEntry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transform(_) => formatter.write_str("Transform(..)"),
            Self::Null => formatter.write_str("Null"),
            Self::Raise(descriptor) => formatter.debug_tuple("Raise").field(descriptor).finish(),
        }
    }
}

/// Template for a typed user error raised at parse time. The template has
/// the full log placeholder vocabulary available (`{URL}`, `{STATUS}`, ...).
#[derive(Clone, Debug)]
pub struct ErrorDescriptor {
    template: String,
}

impl ErrorDescriptor {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub(crate) fn build(&self, ctx: &RequestContext, response: &Response) -> Error {
        let mut args = events::context_args(ctx);
        args.extend(events::response_args(Some(response)));
        Error::UserDefined {
            message: format_template(&self.template, &args),
            status: response.status().as_u16(),
            url: ctx.url().to_owned(),
        }
    }
}

/// Status-keyed response handling: exact status match wins, then the
/// default entry, then the raw response untouched.
#[derive(Clone, Default)]
pub struct ResponseParser {
    default: Option<ParserEntry>,
    by_status: HashMap<u16, ParserEntry>,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, status: StatusCode, entry: ParserEntry) -> Self {
        self.by_status.insert(status.as_u16(), entry);
        self
    }

    pub fn default_to(mut self, entry: ParserEntry) -> Self {
        self.default = Some(entry);
        self
    }

    pub(crate) fn entry_for(&self, status: StatusCode) -> Option<&ParserEntry> {
        self.by_status
            .get(&status.as_u16())
            .or(self.default.as_ref())
    }
}

impl std::fmt::Debug for ResponseParser {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut statuses: Vec<u16> = self.by_status.keys().copied().collect();
        statuses.sort_unstable();
        formatter
            .debug_struct("ResponseParser")
            .field("default", &self.default)
            .field("statuses", &statuses)
            .finish()
    }
}

/// What `execute` hands back: the raw response, a transformed value, or
/// nothing (the null parser entry).
#[derive(Clone, Debug)]
pub enum Reply {
    Raw(Response),
    Value(Value),
    Empty,
}

impl Reply {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Raw(response) => Some(response),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// Runs the parser lookup for a delivered response.
pub(crate) fn apply(
    ctx: &RequestContext,
    parser: Option<&ResponseParser>,
    response: Response,
) -> crate::Result<Reply> {
    let Some(parser) = parser else {
        return Ok(Reply::Raw(response));
    };

    match parser.entry_for(response.status()) {
        None => Ok(Reply::Raw(response)),
        Some(ParserEntry::Null) => Ok(Reply::Empty),
        Some(ParserEntry::Raise(descriptor)) => Err(descriptor.build(ctx, &response)),
        Some(ParserEntry::Transform(transform)) => match transform(&response) {
            Ok(value) => Ok(Reply::Value(value)),
            Err(source) => Err(Error::ParserFailed {
                status: response.status().as_u16(),
                method: ctx.method().clone(),
                url: ctx.url().to_owned(),
                source,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{HeaderMap, Method};

    use super::*;
    use crate::config::ClientConfig;

    fn ctx() -> RequestContext {
        RequestContext::new(
            Method::GET,
            "https://api.test",
            "/pokemon/{NAME}".to_owned(),
            "/pokemon/pikachu".to_owned(),
            BTreeMap::new(),
            Arc::new(ClientConfig::new()),
        )
    }

    fn response(status: StatusCode, body: &'static [u8]) -> Response {
        Response::new(
            status,
            HeaderMap::new(),
            Bytes::from_static(body),
            Method::GET,
            "https://api.test/pokemon/pikachu",
        )
    }

    #[test]
    fn exact_status_beats_default() {
        let parser = ResponseParser::new()
            .default_to(ParserEntry::json())
            .on(StatusCode::NOT_FOUND, ParserEntry::Null);

        let reply = apply(
            &ctx(),
            Some(&parser),
            response(StatusCode::NOT_FOUND, b"{}"),
        )
        .expect("null entry yields a reply");
        assert!(reply.is_empty());
    }

    #[test]
    fn default_applies_to_unmapped_status() {
        let parser = ResponseParser::new().default_to(ParserEntry::json());
        let reply = apply(
            &ctx(),
            Some(&parser),
            response(StatusCode::OK, br#"{"name":"pikachu"}"#),
        )
        .expect("json entry decodes");
        assert_eq!(reply.as_value().unwrap()["name"], "pikachu");
    }

    #[test]
    fn unmapped_status_returns_raw_response() {
        let parser = ResponseParser::new().on(StatusCode::NOT_FOUND, ParserEntry::Null);
        let reply = apply(&ctx(), Some(&parser), response(StatusCode::OK, b"plain"))
            .expect("raw passthrough");
        assert_eq!(reply.response().unwrap().body().as_ref(), b"plain");
    }

    #[test]
    fn transform_error_becomes_parser_failed() {
        let parser = ResponseParser::new().default_to(ParserEntry::json());
        let error = apply(&ctx(), Some(&parser), response(StatusCode::OK, b"not-json"))
            .expect_err("invalid json fails");
        assert_eq!(error.kind(), crate::ErrorKind::ParserFailed);
    }

    #[test]
    fn raise_entry_builds_templated_user_error() {
        let parser = ResponseParser::new().on(
            StatusCode::INTERNAL_SERVER_ERROR,
            ParserEntry::Raise(ErrorDescriptor::new("{URL} blew up with {STATUS}")),
        );
        let error = apply(
            &ctx(),
            Some(&parser),
            response(StatusCode::INTERNAL_SERVER_ERROR, b""),
        )
        .expect_err("raise entry fails");
        assert_eq!(error.kind(), crate::ErrorKind::UserDefined);
        assert_eq!(
            error.to_string(),
            "https://api.test/pokemon/pikachu blew up with 500"
        );
    }
}
