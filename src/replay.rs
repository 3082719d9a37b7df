//! Record and replay of HTTP exchanges.
//!
//! In `Record` mode every completed exchange is handed to the storage; in
//! `Replay` mode the pipeline never touches the transport and serves stored
//! exchanges instead, keyed by a canonical request fingerprint. `SmartReplay`
//! replays when a recording exists and records fresh traffic otherwise.
//! Throttling, retries, parsing, logs, and metrics all run as if the
//! response were live.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::ClientConfig;
use crate::events::{LogEvent, MSG_REPLAY_RECORDED, MSG_REPLAY_REPLAYED};
use crate::transport::{Response, TransportRequest};
use crate::util::lock_unpoisoned;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayMode {
    /// Dispatch normally and store every completed exchange.
    Record,
    /// Serve stored exchanges only; a miss is a terminal `no_replay` error.
    Replay,
    /// Serve stored exchanges when present, record fresh traffic otherwise.
    SmartReplay,
}

/// Canonical identity of a request: method, URL path, sorted query pairs,
/// SHA-256 of the body, and the content type. Stable across record and
/// replay runs by construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn for_request(request: &TransportRequest) -> Self {
        let (location, query) = match Url::parse(&request.url) {
            Ok(parsed) => {
                let mut pairs: Vec<(String, String)> = parsed
                    .query_pairs()
                    .map(|(name, value)| (name.into_owned(), value.into_owned()))
                    .collect();
                pairs.sort();
                let location = format!(
                    "{}://{}{}",
                    parsed.scheme(),
                    parsed.authority(),
                    parsed.path()
                );
                let query = pairs
                    .into_iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join("&");
                (location, query)
            }
            Err(_) => (request.url.clone(), String::new()),
        };

        let body_digest = {
            let mut hasher = Sha256::new();
            if let Some(body) = &request.body {
                hasher.update(body);
            }
            hex_digest(hasher)
        };
        let content_type = request
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(request.method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(location.as_bytes());
        hasher.update(b"\n");
        hasher.update(query.as_bytes());
        hasher.update(b"\n");
        hasher.update(body_digest.as_bytes());
        hasher.update(b"\n");
        hasher.update(content_type.as_bytes());
        Self(hex_digest(hasher))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut text = String::with_capacity(digest.len() * 2);
    for byte in digest {
        text.push_str(&format!("{byte:02x}"));
    }
    text
}

/// One captured request/response pair, byte-exact on both bodies and the
/// response headers. This is the normative storage payload.
#[derive(Clone, Debug)]
pub struct Exchange {
    pub fingerprint: Fingerprint,
    pub method: String,
    pub url: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: Option<Bytes>,
    pub status: u16,
    pub response_headers: Vec<(String, Vec<u8>)>,
    pub response_body: Bytes,
    pub recorded_at: SystemTime,
}

impl Exchange {
    pub fn capture(request: &TransportRequest, response: &Response) -> Self {
        Self {
            fingerprint: Fingerprint::for_request(request),
            method: request.method.to_string(),
            url: request.url.clone(),
            request_headers: filter_request_headers(&request.headers),
            request_body: request.body.clone(),
            status: response.status().as_u16(),
            response_headers: response
                .headers()
                .iter()
                .map(|(name, value)| (name.to_string(), value.as_bytes().to_vec()))
                .collect(),
            response_body: response.body().clone(),
            recorded_at: SystemTime::now(),
        }
    }

    pub(crate) fn to_response(&self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = HeaderMap::new();
        for (name, value) in &self.response_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                headers.append(name, value);
            }
        }
        let method = self.method.parse().unwrap_or(http::Method::GET);
        Response::new(
            status,
            headers,
            self.response_body.clone(),
            method,
            self.url.clone(),
        )
        .mark_replayed()
    }
}

/// Credentials never land in storage.
fn filter_request_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            **name != AUTHORIZATION && **name != COOKIE && **name != PROXY_AUTHORIZATION
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_owned()))
        })
        .collect()
}

/// Where exchanges live. Implementations own their concurrency; the
/// in-crate [`MemoryReplayStorage`] is the reference implementation and the
/// test backend.
#[async_trait]
pub trait ReplayStorage: Send + Sync {
    /// Executed once when the client is built.
    async fn prepare(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn record(&self, exchange: &Exchange) -> Result<(), BoxError>;

    async fn load(&self, fingerprint: &Fingerprint) -> Result<Option<Exchange>, BoxError>;

    /// Executed when the client flushes, once all requests were made.
    async fn flush(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryReplayStorage {
    exchanges: Mutex<HashMap<Fingerprint, Exchange>>,
}

impl MemoryReplayStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.exchanges).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReplayStorage for MemoryReplayStorage {
    async fn record(&self, exchange: &Exchange) -> Result<(), BoxError> {
        lock_unpoisoned(&self.exchanges).insert(exchange.fingerprint.clone(), exchange.clone());
        Ok(())
    }

    async fn load(&self, fingerprint: &Fingerprint) -> Result<Option<Exchange>, BoxError> {
        Ok(lock_unpoisoned(&self.exchanges).get(fingerprint).cloned())
    }
}

/// A [`LogEvent`] that only fires every `frequency` records/replays, so
/// bulk recording sessions do not flood the log.
#[derive(Clone, Debug)]
pub struct ReplayLogEvent {
    event: LogEvent,
    frequency: u64,
}

impl ReplayLogEvent {
    pub fn new(event: LogEvent) -> Self {
        Self {
            event,
            frequency: 1_000,
        }
    }

    pub fn every(mut self, frequency: u64) -> Self {
        self.frequency = frequency.max(1);
        self
    }
}

/// Replay settings attached to a client.
pub struct Replay {
    mode: ReplayMode,
    storage: std::sync::Arc<dyn ReplayStorage>,
    discard_older_than: Option<SystemTime>,
    discard_bad_responses: bool,
    disable_throttling: bool,
    log_record: Option<ReplayLogEvent>,
    log_replay: Option<ReplayLogEvent>,
    records_made: AtomicU64,
    replays_made: AtomicU64,
}

impl Replay {
    pub fn record(storage: std::sync::Arc<dyn ReplayStorage>) -> Self {
        Self::with_mode(ReplayMode::Record, storage)
    }

    pub fn replay(storage: std::sync::Arc<dyn ReplayStorage>) -> Self {
        Self::with_mode(ReplayMode::Replay, storage)
    }

    pub fn smart(storage: std::sync::Arc<dyn ReplayStorage>) -> Self {
        Self::with_mode(ReplayMode::SmartReplay, storage)
    }

    fn with_mode(mode: ReplayMode, storage: std::sync::Arc<dyn ReplayStorage>) -> Self {
        Self {
            mode,
            storage,
            discard_older_than: None,
            discard_bad_responses: false,
            disable_throttling: false,
            log_record: None,
            log_replay: None,
            records_made: AtomicU64::new(0),
            replays_made: AtomicU64::new(0),
        }
    }

    /// Treat recordings older than `cutoff` as not found.
    pub fn discard_older_than(mut self, cutoff: SystemTime) -> Self {
        self.discard_older_than = Some(cutoff);
        self
    }

    /// Treat recordings outside the request's success set as not found.
    pub fn discard_bad_responses(mut self) -> Self {
        self.discard_bad_responses = true;
        self
    }

    /// Skip throttle admission when a replay will serve the request.
    pub fn disable_throttling(mut self) -> Self {
        self.disable_throttling = true;
        self
    }

    pub fn log_record(mut self, event: ReplayLogEvent) -> Self {
        self.log_record = Some(event);
        self
    }

    pub fn log_replay(mut self, event: ReplayLogEvent) -> Self {
        self.log_replay = Some(event);
        self
    }

    /// Gives the storage a chance to set itself up (open files, create
    /// schemas). Call once before the first request for backends that need
    /// it; the in-memory storage does not.
    pub async fn prepare(&self) -> Result<(), BoxError> {
        self.storage.prepare().await
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    pub fn records_made(&self) -> u64 {
        self.records_made.load(Ordering::Relaxed)
    }

    pub fn replays_made(&self) -> u64 {
        self.replays_made.load(Ordering::Relaxed)
    }

    pub(crate) fn storage(&self) -> &std::sync::Arc<dyn ReplayStorage> {
        &self.storage
    }

    pub(crate) fn skips_throttling(&self) -> bool {
        self.disable_throttling && self.mode != ReplayMode::Record
    }

    /// Loads a usable exchange for the request, applying the discard rules.
    pub(crate) async fn load_for(
        &self,
        request: &TransportRequest,
        config: &ClientConfig,
    ) -> Option<Exchange> {
        let fingerprint = Fingerprint::for_request(request);
        let exchange = match self.storage.load(&fingerprint).await {
            Ok(found) => found?,
            Err(error) => {
                tracing::warn!(target: "gracile", "replay storage load failed: {error}");
                return None;
            }
        };

        if let Some(cutoff) = self.discard_older_than
            && exchange.recorded_at < cutoff
        {
            return None;
        }
        if self.discard_bad_responses {
            let status = StatusCode::from_u16(exchange.status).ok()?;
            if !config.is_success(status) {
                return None;
            }
        }

        Some(exchange)
    }

    pub(crate) async fn store(&self, request: &TransportRequest, response: &Response) {
        let exchange = Exchange::capture(request, response);
        if let Err(error) = self.storage.record(&exchange).await {
            tracing::warn!(target: "gracile", "replay storage record failed: {error}");
            return;
        }

        let made = self.records_made.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(log_event) = &self.log_record
            && made % log_event.frequency == 0
        {
            log_event
                .event
                .emit(MSG_REPLAY_RECORDED, &[("RECORDED_COUNT", made.to_string())]);
        }
    }

    pub(crate) fn note_replay(&self) {
        let made = self.replays_made.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(log_event) = &self.log_replay
            && made % log_event.frequency == 0
        {
            log_event
                .event
                .emit(MSG_REPLAY_REPLAYED, &[("REPLAYED_COUNT", made.to_string())]);
        }
    }
}

impl std::fmt::Debug for Replay {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Replay")
            .field("mode", &self.mode)
            .field("discard_older_than", &self.discard_older_than)
            .field("discard_bad_responses", &self.discard_bad_responses)
            .field("disable_throttling", &self.disable_throttling)
            .field("records_made", &self.records_made)
            .field("replays_made", &self.replays_made)
            .finish()
    }
}
