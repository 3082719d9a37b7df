//! `gracile` is a graceful HTTP client framework: a declarative wrapper
//! around a pluggable transport that composes status validation, response
//! parsing, retries, throttling, concurrency capping, hooks, and
//! record/replay into a single request lifecycle.
//!
//! # Quick Start
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//! use gracile::prelude::*;
//!
//! let client = Client::builder("https://pokeapi.co/api/v2")
//!     .request_timeout(Duration::from_secs(3))
//!     .config(
//!         ClientConfig::new()
//!             .allowed_status(404)
//!             .parser(
//!                 ResponseParser::new()
//!                     .default_to(ParserEntry::json())
//!                     .on(http::StatusCode::NOT_FOUND, ParserEntry::Null),
//!             )
//!             .retry(
//!                 RetryPolicy::new(3)
//!                     .base_delay(Duration::from_millis(200))
//!                     .delay_modifier(2.0),
//!             ),
//!     )
//!     .build()?;
//!
//! let reply = client
//!     .get("/pokemon/{NAME}")
//!     .arg("NAME", "pikachu")
//!     .send()
//!     .await?;
//!
//! if let Some(pokemon) = reply.as_value() {
//!     println!("found {}", pokemon["name"]);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # What a call goes through
//!
//! Concurrency permit, before hooks, throttle admission, dispatch (live
//! transport or replay storage), status and validator checks, the retry
//! loop, the status-keyed parser, after hooks, and the per-endpoint metrics
//! collector. Every stage is driven by a [`ClientConfig`] merged from the
//! client's settings and the per-call override.

mod client;
mod core;
mod replay;
mod request;
mod transport;
mod util;

pub(crate) use crate::core::concurrency;
pub(crate) use crate::core::config;
pub(crate) use crate::core::context;
pub(crate) use crate::core::error;
pub(crate) use crate::core::events;
pub(crate) use crate::core::hooks;
pub(crate) use crate::core::metrics;
pub(crate) use crate::core::parse;
pub(crate) use crate::core::pipeline;
pub(crate) use crate::core::retry;
pub(crate) use crate::core::throttle;
pub(crate) use crate::core::validate;

pub use crate::client::{Client, ClientBuilder};
pub use crate::concurrency::ConcurrencyLimit;
pub use crate::config::{ClientConfig, Setting, StatusSet};
pub use crate::context::RequestContext;
pub use crate::error::{Error, ErrorKind, TransportErrorKind};
pub use crate::events::{LogEvent, LogLevel};
pub use crate::hooks::{FixedBackoffHook, Hook, HookOutcome, PauseGate, RetryAfterBackoffHook};
pub use crate::metrics::{AggregateReport, EndpointReport, MetricsSnapshot, OutcomeClass};
pub use crate::parse::{ErrorDescriptor, ParserEntry, Reply, ResponseParser, TransformFn};
pub use crate::replay::{
    Exchange, Fingerprint, MemoryReplayStorage, Replay, ReplayLogEvent, ReplayMode, ReplayStorage,
};
pub use crate::request::RequestBuilder;
pub use crate::retry::{RetryBehavior, RetryOn, RetryOverride, RetryPolicy, RetrySnapshot};
pub use crate::throttle::{Throttle, ThrottleRule};
pub use crate::transport::{HyperTransport, Response, Transport, TransportRequest};
pub use crate::validate::{
    AllowedStatusValidator, DefaultValidator, ResponseValidator, StrictStatusValidator,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Client, ClientConfig, ConcurrencyLimit, Error, ErrorKind, LogEvent, LogLevel,
        MemoryReplayStorage, ParserEntry, Reply, Replay, ResponseParser, Result, RetryBehavior,
        RetryOn, RetryPolicy, StatusSet, Throttle, ThrottleRule,
    };
}
