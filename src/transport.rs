//! The HTTP transport seam.
//!
//! The pipeline never talks to the network directly: it hands a
//! [`TransportRequest`] to whatever [`Transport`] the client was built with.
//! Production clients use [`HyperTransport`]; tests and replay inject their
//! own implementations.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use tokio::time::timeout;

use crate::error::{Error, TransportErrorKind};

/// A fully-resolved outbound request: everything a transport needs, nothing
/// about the pipeline that produced it.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

/// A buffered response. Bodies are byte-exact `Bytes`; decoding to text or
/// JSON happens lazily on demand.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    method: Method,
    url: String,
    elapsed: Duration,
    replayed: bool,
}

impl Response {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        method: Method,
        url: impl Into<String>,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            method,
            url: url.into(),
            elapsed: Duration::ZERO,
            replayed: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Whether this response was served from a replay storage rather than
    /// the live transport.
    pub fn is_replay(&self) -> bool {
        self.replayed
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::ParserFailed {
            status: self.status.as_u16(),
            method: self.method.clone(),
            url: self.url.clone(),
            source: Box::new(source),
        })
    }

    pub(crate) fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub(crate) fn mark_replayed(mut self) -> Self {
        self.replayed = true;
        self
    }
}

/// The async send seam consumed by the pipeline. One shared instance per
/// client, created at build time.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &TransportRequest) -> crate::Result<Response>;
}

/// Default transport: pooled hyper client over rustls with webpki roots,
/// HTTP/1.1 and HTTP/2.
pub struct HyperTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HyperTransport {
    pub fn new() -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Self {
            client: HyperClient::builder(TokioExecutor::new()).build(connector),
        }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, request: &TransportRequest) -> crate::Result<Response> {
        let uri: Uri = request
            .url
            .parse()
            .map_err(|_| Error::InvalidBaseUrl {
                url: request.url.clone(),
            })?;

        let mut http_request = http::Request::builder()
            .method(request.method.clone())
            .uri(uri);
        if let Some(headers) = http_request.headers_mut() {
            headers.extend(request.headers.clone());
        }
        let http_request = http_request
            .body(Full::new(request.body.clone().unwrap_or_default()))
            .map_err(|source| Error::Transport {
                kind: TransportErrorKind::Other,
                method: request.method.clone(),
                url: request.url.clone(),
                source: Box::new(source),
            })?;

        let started = Instant::now();
        let dispatch = self.client.request(http_request);
        let response = match request.timeout {
            Some(limit) => timeout(limit, dispatch)
                .await
                .map_err(|_| Error::Timeout {
                    timeout_ms: limit.as_millis(),
                    method: request.method.clone(),
                    url: request.url.clone(),
                })?,
            None => dispatch.await,
        }
        .map_err(|source| Error::Transport {
            kind: classify_transport_error(&source),
            method: request.method.clone(),
            url: request.url.clone(),
            source: Box::new(source),
        })?;

        let (parts, incoming) = response.into_parts();
        let body = incoming
            .collect()
            .await
            .map_err(|source| Error::Transport {
                kind: TransportErrorKind::Read,
                method: request.method.clone(),
                url: request.url.clone(),
                source: Box::new(source),
            })?
            .to_bytes();

        Ok(Response::new(
            parts.status,
            parts.headers,
            body,
            request.method.clone(),
            request.url.clone(),
        )
        .with_elapsed(started.elapsed()))
    }
}

fn classify_transport_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    let mut text = error.to_string().to_ascii_lowercase();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        text.push(' ');
        text.push_str(&cause.to_string().to_ascii_lowercase());
        source = cause.source();
    }

    const DNS_MARKERS: &[&str] = &[
        "name or service not known",
        "failed to lookup address",
        "no such host",
        "temporary failure in name resolution",
        "dns lookup failed",
    ];
    const TLS_MARKERS: &[&str] = &[
        "tls handshake",
        "certificate verify",
        "invalid certificate",
        "self signed certificate",
        "pkix",
        "peer certificate",
    ];
    const CONNECT_MARKERS: &[&str] = &[
        "connection refused",
        "connection aborted",
        "network unreachable",
        "host unreachable",
        "connect error",
        "connect timeout",
    ];
    const RESET_MARKERS: &[&str] = &["connection reset", "broken pipe"];
    const READ_MARKERS: &[&str] = &[
        "unexpected eof",
        "incomplete message",
        "connection closed before message completed",
    ];

    let contains = |markers: &[&str]| markers.iter().any(|marker| text.contains(marker));

    if contains(DNS_MARKERS) {
        TransportErrorKind::Dns
    } else if contains(TLS_MARKERS) {
        TransportErrorKind::Tls
    } else if error.is_connect() || contains(CONNECT_MARKERS) {
        TransportErrorKind::Connect
    } else if contains(RESET_MARKERS) {
        TransportErrorKind::Reset
    } else if contains(READ_MARKERS) {
        TransportErrorKind::Read
    } else {
        TransportErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_json_decodes_body() {
        let response = Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(br#"{"name":"pikachu"}"#),
            Method::GET,
            "https://api.test/pokemon/pikachu",
        );
        let value: serde_json::Value = response.json().expect("valid json should decode");
        assert_eq!(value["name"], "pikachu");
    }

    #[test]
    fn response_json_error_is_parser_failed() {
        let response = Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"not-json"),
            Method::GET,
            "https://api.test/pokemon/pikachu",
        );
        let error = response
            .json::<serde_json::Value>()
            .expect_err("invalid json should fail");
        assert_eq!(error.kind(), crate::ErrorKind::ParserFailed);
    }
}
