use std::collections::BTreeMap;
use std::fmt::Display;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::parse::Reply;

/// One call in the making: endpoint substitutions, query, body, headers,
/// and an optional per-call config override merged on top of the client's.
pub struct RequestBuilder {
    client: Client,
    method: Method,
    endpoint: String,
    args: BTreeMap<String, String>,
    query: Option<String>,
    headers: HeaderMap,
    body: Option<Bytes>,
    config_override: Option<ClientConfig>,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, method: Method, endpoint: String) -> Self {
        Self {
            client,
            method,
            endpoint,
            args: BTreeMap::new(),
            query: None,
            headers: HeaderMap::new(),
            body: None,
            config_override: None,
        }
    }

    /// Fills one `{NAME}` placeholder in the endpoint template.
    pub fn arg(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.args.insert(name.into(), value.to_string());
        self
    }

    pub fn query<T: Serialize>(mut self, query: &T) -> crate::Result<Self> {
        let encoded = serde_urlencoded::to_string(query)
            .map_err(|source| Error::SerializeQuery { source })?;
        self.query = Some(encoded);
        Ok(self)
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> crate::Result<Self> {
        let encoded =
            serde_json::to_vec(body).map_err(|source| Error::SerializeJson { source })?;
        self.body = Some(Bytes::from(encoded));
        self.headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Per-call config, merged on top of the client's configuration for
    /// this request only.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config_override = Some(config);
        self
    }

    pub async fn send(self) -> crate::Result<Reply> {
        let Self {
            client,
            method,
            endpoint,
            args,
            query,
            headers,
            body,
            config_override,
        } = self;
        client
            .execute_call(method, endpoint, args, query, headers, body, config_override)
            .await
    }
}
