use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::config::ClientConfig;
use crate::context::RequestContext;
use crate::error::Error;
use crate::hooks::{Hook, HookDispatcher, RetryAfterBackoffHook};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::parse::Reply;
use crate::pipeline::Pipeline;
use crate::replay::Replay;
use crate::request::RequestBuilder;
use crate::transport::{HyperTransport, Transport, TransportRequest};
use crate::util::{format_endpoint, merge_headers};

struct ClientInner {
    base_url: String,
    config: ClientConfig,
    default_headers: HeaderMap,
    request_timeout: Option<Duration>,
    pipeline: Pipeline,
    metrics: Arc<MetricsCollector>,
}

/// The client root: one shared transport, one metrics collector, one
/// throttle/concurrency state, and the base configuration every call
/// inherits. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url.into())
    }

    pub fn get(&self, endpoint: impl Display) -> RequestBuilder {
        self.request(Method::GET, endpoint)
    }

    pub fn post(&self, endpoint: impl Display) -> RequestBuilder {
        self.request(Method::POST, endpoint)
    }

    pub fn put(&self, endpoint: impl Display) -> RequestBuilder {
        self.request(Method::PUT, endpoint)
    }

    pub fn patch(&self, endpoint: impl Display) -> RequestBuilder {
        self.request(Method::PATCH, endpoint)
    }

    pub fn delete(&self, endpoint: impl Display) -> RequestBuilder {
        self.request(Method::DELETE, endpoint)
    }

    pub fn head(&self, endpoint: impl Display) -> RequestBuilder {
        self.request(Method::HEAD, endpoint)
    }

    pub fn options(&self, endpoint: impl Display) -> RequestBuilder {
        self.request(Method::OPTIONS, endpoint)
    }

    /// Starts a request against an endpoint template. Endpoints are plain
    /// strings or any `Display` value, which keeps enum endpoint registries
    /// ergonomic.
    pub fn request(&self, method: Method, endpoint: impl Display) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, endpoint.to_string())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn replay(&self) -> Option<&Replay> {
        self.inner.pipeline.replay().map(|replay| &**replay)
    }

    /// Flushes the replay storage, preferably once all requests were made.
    pub async fn flush_replay(&self) {
        if let Some(replay) = self.inner.pipeline.replay()
            && let Err(error) = replay.storage().flush().await
        {
            tracing::warn!(target: "gracile", "replay storage flush failed: {error}");
        }
    }

    pub(crate) async fn execute_call(
        &self,
        method: Method,
        endpoint: String,
        args: BTreeMap<String, String>,
        query: Option<String>,
        headers: HeaderMap,
        body: Option<Bytes>,
        config_override: Option<ClientConfig>,
    ) -> crate::Result<Reply> {
        let config = match config_override {
            Some(over) => ClientConfig::merge(&self.inner.config, &over),
            None => self.inner.config.clone(),
        };

        let formatted = format_endpoint(&endpoint, &args)?;
        let ctx = RequestContext::new(
            method.clone(),
            &self.inner.base_url,
            endpoint,
            formatted,
            args,
            Arc::new(config),
        );

        let mut url = ctx.url().to_owned();
        if let Some(query) = query.filter(|query| !query.is_empty()) {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query);
        }

        let request = TransportRequest {
            method,
            url,
            headers: merge_headers(&self.inner.default_headers, &headers),
            body,
            timeout: self.inner.request_timeout,
        };

        self.inner.pipeline.execute(ctx, request).await
    }
}

pub struct ClientBuilder {
    base_url: String,
    config: ClientConfig,
    default_headers: HeaderMap,
    request_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    transport: Option<Arc<dyn Transport>>,
    hooks: Vec<Arc<dyn Hook>>,
    replay: Option<Replay>,
    retry_after_backoff: bool,
}

impl ClientBuilder {
    fn new(base_url: String) -> Self {
        Self {
            base_url,
            config: ClientConfig::standard(),
            default_headers: HeaderMap::new(),
            request_timeout: None,
            total_timeout: None,
            transport: None,
            hooks: Vec::new(),
            replay: None,
            retry_after_backoff: false,
        }
    }

    /// Client-level settings, merged on top of the standard baseline.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = ClientConfig::merge(&ClientConfig::standard(), &config);
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    /// Bounds each transport dispatch.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    /// Bounds one whole `execute`, retries and waits included.
    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Installs a [`RetryAfterBackoffHook`] wired to this client's metrics,
    /// so its pauses show up in the throttled counters.
    pub fn retry_after_backoff(mut self) -> Self {
        self.retry_after_backoff = true;
        self
    }

    pub fn replay(mut self, replay: Replay) -> Self {
        self.replay = Some(replay);
        self
    }

    pub fn build(self) -> crate::Result<Client> {
        let parsed = Url::parse(&self.base_url).map_err(|_| Error::InvalidBaseUrl {
            url: self.base_url.clone(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidBaseUrl {
                url: self.base_url.clone(),
            });
        }

        let metrics = Arc::new(MetricsCollector::new());
        let mut hooks = self.hooks;
        if self.retry_after_backoff {
            hooks.push(Arc::new(
                RetryAfterBackoffHook::new().with_metrics(Arc::clone(&metrics)),
            ));
        }

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HyperTransport::new()));
        let pipeline = Pipeline::new(
            transport,
            HookDispatcher::new(hooks),
            Arc::clone(&metrics),
            self.replay.map(Arc::new),
            self.total_timeout,
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url: self.base_url.trim_end_matches('/').to_owned(),
                config: self.config,
                default_headers: self.default_headers,
                request_timeout: self.request_timeout,
                pipeline,
                metrics,
            }),
        })
    }
}
