use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use gracile::prelude::{
    Client, ClientConfig, ErrorKind, MemoryReplayStorage, ParserEntry, Replay, ResponseParser,
    RetryPolicy,
};
use gracile::{Response, Transport, TransportErrorKind, TransportRequest};
use http::{HeaderMap, HeaderValue, StatusCode};

struct FixedTransport {
    status: u16,
    headers: Vec<(&'static str, &'static str)>,
    body: &'static [u8],
    calls: AtomicUsize,
}

impl FixedTransport {
    fn new(status: u16, headers: Vec<(&'static str, &'static str)>, body: &'static [u8]) -> Arc<Self> {
        Arc::new(Self {
            status,
            headers,
            body,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FixedTransport {
    async fn send(&self, request: &TransportRequest) -> gracile::Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut header_map = HeaderMap::new();
        for (name, value) in &self.headers {
            header_map.insert(
                name.parse::<http::HeaderName>().expect("header name"),
                HeaderValue::from_static(value),
            );
        }
        Ok(Response::new(
            StatusCode::from_u16(self.status).expect("status"),
            header_map,
            Bytes::from_static(self.body),
            request.method.clone(),
            request.url.clone(),
        ))
    }
}

/// A transport that must never be reached.
struct ColdTransport {
    calls: AtomicUsize,
}

impl ColdTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transport for ColdTransport {
    async fn send(&self, request: &TransportRequest) -> gracile::Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(gracile::Error::Transport {
            kind: TransportErrorKind::Connect,
            method: request.method.clone(),
            url: request.url.clone(),
            source: "cold transport should never be dialed".into(),
        })
    }
}

#[tokio::test]
async fn record_then_replay_short_circuits_the_transport() {
    let storage = Arc::new(MemoryReplayStorage::new());

    let recording_transport = FixedTransport::new(
        200,
        vec![("x-trace", "abc"), ("content-type", "application/json")],
        br#"{"name":"pikachu"}"#,
    );
    let recorder = Client::builder("https://api.test")
        .transport(recording_transport.clone())
        .replay(Replay::record(storage.clone()))
        .config(ClientConfig::new().parser(ResponseParser::new().default_to(ParserEntry::json())))
        .build()
        .expect("recorder builds");

    let recorded = recorder
        .get("/pokemon/{NAME}")
        .arg("NAME", "pikachu")
        .send()
        .await
        .expect("live request succeeds");
    assert_eq!(recorded.as_value().expect("json value")["name"], "pikachu");
    assert_eq!(recording_transport.calls(), 1);
    assert_eq!(storage.len(), 1);
    assert_eq!(recorder.replay().expect("replay settings").records_made(), 1);

    let cold = ColdTransport::new();
    let replayer = Client::builder("https://api.test")
        .transport(cold.clone())
        .replay(Replay::replay(storage))
        .build()
        .expect("replayer builds");

    let replayed = replayer
        .get("/pokemon/{NAME}")
        .arg("NAME", "pikachu")
        .send()
        .await
        .expect("replay serves the stored exchange");

    let response = replayed.response().expect("raw response");
    assert!(response.is_replay());
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), br#"{"name":"pikachu"}"#);
    assert_eq!(
        response.headers().get("x-trace").and_then(|v| v.to_str().ok()),
        Some("abc")
    );
    assert_eq!(cold.calls.load(Ordering::SeqCst), 0);

    let snapshot = replayer.metrics();
    let row = snapshot
        .row(&http::Method::GET, "https://api.test/pokemon/{NAME}")
        .expect("metrics row");
    assert_eq!(row.total, 1);
    assert_eq!(row.resp_2xx, 1);
    assert_eq!(row.replayed, 1);
    assert_eq!(replayer.replay().expect("replay settings").replays_made(), 1);
}

#[tokio::test]
async fn replay_miss_is_a_terminal_no_replay_error() {
    let cold = ColdTransport::new();
    let client = Client::builder("https://api.test")
        .transport(cold.clone())
        .replay(Replay::replay(Arc::new(MemoryReplayStorage::new())))
        .config(
            // Even a catch-all retry policy must not re-attempt a missing
            // replay.
            ClientConfig::new()
                .retry(RetryPolicy::new(3).base_delay(std::time::Duration::from_millis(1))),
        )
        .build()
        .expect("client builds");

    let error = client
        .get("/pokemon/{NAME}")
        .arg("NAME", "missingno")
        .send()
        .await
        .expect_err("nothing recorded");
    assert_eq!(error.kind(), ErrorKind::NoReplay);
    assert_eq!(cold.calls.load(Ordering::SeqCst), 0);

    let snapshot = client.metrics();
    let row = snapshot
        .row(&http::Method::GET, "https://api.test/pokemon/{NAME}")
        .expect("metrics row");
    assert_eq!(row.total, 1);
    assert_eq!(row.aborted, 1);
}

#[tokio::test]
async fn smart_replay_records_once_then_replays() {
    let storage = Arc::new(MemoryReplayStorage::new());
    let transport = FixedTransport::new(200, vec![], br#"{"cached":true}"#);
    let client = Client::builder("https://api.test")
        .transport(transport.clone())
        .replay(Replay::smart(storage.clone()))
        .build()
        .expect("client builds");

    client.get("/cacheable").send().await.expect("first call dispatches");
    assert_eq!(transport.calls(), 1);
    assert_eq!(storage.len(), 1);

    let second = client
        .get("/cacheable")
        .send()
        .await
        .expect("second call replays");
    assert!(second.response().expect("raw response").is_replay());
    assert_eq!(transport.calls(), 1);

    let replay = client.replay().expect("replay settings");
    assert_eq!(replay.records_made(), 1);
    assert_eq!(replay.replays_made(), 1);
}

#[tokio::test]
async fn discard_bad_responses_refuses_stored_failures() {
    let storage = Arc::new(MemoryReplayStorage::new());

    let failing_transport = FixedTransport::new(500, vec![], b"boom");
    let recorder = Client::builder("https://api.test")
        .transport(failing_transport)
        .replay(Replay::record(storage.clone()))
        .build()
        .expect("recorder builds");
    // The 500 fails validation but the exchange is still recorded.
    recorder
        .get("/shaky")
        .send()
        .await
        .expect_err("500 is a bad status");
    assert_eq!(storage.len(), 1);

    let replayer = Client::builder("https://api.test")
        .transport(ColdTransport::new())
        .replay(Replay::replay(storage).discard_bad_responses())
        .build()
        .expect("replayer builds");

    let error = replayer
        .get("/shaky")
        .send()
        .await
        .expect_err("stored failure is treated as missing");
    assert_eq!(error.kind(), ErrorKind::NoReplay);
}

#[tokio::test]
async fn replayed_exchanges_still_flow_through_validation_and_parsing() {
    let storage = Arc::new(MemoryReplayStorage::new());
    let transport = FixedTransport::new(404, vec![], b"gone");
    let recorder = Client::builder("https://api.test")
        .transport(transport)
        .replay(Replay::record(storage.clone()))
        .config(ClientConfig::new().allowed_status(404))
        .build()
        .expect("recorder builds");
    recorder
        .get("/pokemon/{NAME}")
        .arg("NAME", "missingno")
        .send()
        .await
        .expect("allowed 404 delivers");

    // Replaying with a strict config turns the same recording into an error.
    let strict_replayer = Client::builder("https://api.test")
        .transport(ColdTransport::new())
        .replay(Replay::replay(storage.clone()))
        .config(ClientConfig::new().strict_status(200))
        .build()
        .expect("replayer builds");
    let error = strict_replayer
        .get("/pokemon/{NAME}")
        .arg("NAME", "missingno")
        .send()
        .await
        .expect_err("strict config rejects the replayed 404");
    assert_eq!(error.kind(), ErrorKind::BadStatus);

    // And a permissive parser turns it into a null reply.
    let lenient_replayer = Client::builder("https://api.test")
        .transport(ColdTransport::new())
        .replay(Replay::replay(storage))
        .config(
            ClientConfig::new()
                .allowed_status(404)
                .parser(ResponseParser::new().on(StatusCode::NOT_FOUND, ParserEntry::Null)),
        )
        .build()
        .expect("replayer builds");
    let reply = lenient_replayer
        .get("/pokemon/{NAME}")
        .arg("NAME", "missingno")
        .send()
        .await
        .expect("allowed replayed 404 delivers");
    assert!(reply.is_empty());
}
