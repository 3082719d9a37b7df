use std::collections::BTreeMap;
use std::sync::Arc;

use http::Method;

use crate::config::ClientConfig;

/// Immutable descriptor of one pipeline execution.
///
/// Built when a call enters the pipeline and shared by reference with hooks,
/// validators, and log formatting. Never mutated.
#[derive(Clone, Debug)]
pub struct RequestContext {
    method: Method,
    unformatted_endpoint: String,
    endpoint: String,
    url: String,
    unformatted_url: String,
    endpoint_args: BTreeMap<String, String>,
    config: Arc<ClientConfig>,
}

impl RequestContext {
    pub(crate) fn new(
        method: Method,
        base_url: &str,
        unformatted_endpoint: String,
        endpoint: String,
        endpoint_args: BTreeMap<String, String>,
        config: Arc<ClientConfig>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        let url = format!("{base}{endpoint}");
        let unformatted_url = format!("{base}{unformatted_endpoint}");

        Self {
            method,
            unformatted_endpoint,
            endpoint,
            url,
            unformatted_url,
            endpoint_args,
            config,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The endpoint template, placeholders intact (`/pokemon/{NAME}`).
    pub fn unformatted_endpoint(&self) -> &str {
        &self.unformatted_endpoint
    }

    /// The endpoint after substitution (`/pokemon/pikachu`).
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Base URL plus formatted endpoint; what the transport dispatches and
    /// what throttle rules match against.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Base URL plus the raw template; the metrics and concurrency scope key.
    pub fn unformatted_url(&self) -> &str {
        &self.unformatted_url
    }

    pub fn endpoint_args(&self) -> &BTreeMap<String, String> {
        &self.endpoint_args
    }

    /// The merged configuration in effect for this call.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
