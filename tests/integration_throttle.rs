use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use gracile::prelude::{
    Client, ClientConfig, ConcurrencyLimit, LogEvent, LogLevel, Throttle, ThrottleRule,
};
use gracile::{Response, Transport, TransportRequest};
use http::{HeaderMap, StatusCode};
use regex::Regex;

/// Always replies 200 after an optional delay, recording call timestamps
/// and the in-flight peak.
struct GaugeTransport {
    delay: Duration,
    call_times: Mutex<Vec<Instant>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl GaugeTransport {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            call_times: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().expect("call times lock").clone()
    }
}

#[async_trait]
impl Transport for GaugeTransport {
    async fn send(&self, request: &TransportRequest) -> gracile::Result<Response> {
        self.call_times
            .lock()
            .expect("call times lock")
            .push(Instant::now());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"{}"),
            request.method.clone(),
            request.url.clone(),
        ))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn throttle_admits_up_to_the_window_then_delays() {
    let transport = GaugeTransport::new(Duration::ZERO);
    let window = Duration::from_millis(300);
    let client = Client::builder("https://api.test")
        .transport(transport.clone())
        .config(
            ClientConfig::new().throttling(Throttle::new([ThrottleRule::per_duration(
                Regex::new(".*").expect("pattern compiles"),
                2,
                window,
            )])
            .log_limit_reached(LogEvent::new(LogLevel::Warn))
            .log_wait_over(LogEvent::new(LogLevel::Info))),
        )
        .build()
        .expect("client builds");

    let started = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.get("/limited").send().await.expect("request succeeds");
        }));
    }
    for task in tasks {
        task.await.expect("task completes");
    }

    let times = transport.call_times();
    assert_eq!(times.len(), 3);
    let mut offsets: Vec<Duration> = times
        .iter()
        .map(|time| time.duration_since(started))
        .collect();
    offsets.sort();

    // First two admitted immediately, third only after the window slides.
    assert!(offsets[0] < Duration::from_millis(100), "first {offsets:?}");
    assert!(offsets[1] < Duration::from_millis(100), "second {offsets:?}");
    assert!(
        offsets[2] >= Duration::from_millis(250),
        "third {offsets:?}"
    );

    let snapshot = client.metrics();
    let row = snapshot
        .row(&http::Method::GET, "https://api.test/limited")
        .expect("metrics row");
    assert_eq!(row.total, 3);
    assert_eq!(row.throttled, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn throttle_only_applies_to_matching_urls() {
    let transport = GaugeTransport::new(Duration::ZERO);
    let client = Client::builder("https://api.test")
        .transport(transport.clone())
        .config(
            ClientConfig::new().throttling(Throttle::new([ThrottleRule::per_duration(
                Regex::new("/limited").expect("pattern compiles"),
                1,
                Duration::from_secs(5),
            )])),
        )
        .build()
        .expect("client builds");

    let started = Instant::now();
    for _ in 0..3 {
        client.get("/open").send().await.expect("request succeeds");
    }
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(transport.call_times().len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrency_limit_caps_in_flight_requests() {
    let transport = GaugeTransport::new(Duration::from_millis(30));
    let client = Client::builder("https://api.test")
        .transport(transport.clone())
        .config(ClientConfig::new().concurrency([ConcurrencyLimit::new(1)]))
        .build()
        .expect("client builds");

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.get("/serial").send().await.expect("request succeeds");
        }));
    }
    for task in tasks {
        task.await.expect("task completes");
    }

    assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn per_endpoint_scopes_do_not_block_each_other() {
    let transport = GaugeTransport::new(Duration::from_millis(40));
    let client = Client::builder("https://api.test")
        .transport(transport.clone())
        .config(ClientConfig::new().concurrency([ConcurrencyLimit::new(1)]))
        .build()
        .expect("client builds");

    let started = Instant::now();
    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/alpha/{ID}").arg("ID", 1).send().await })
    };
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/beta/{ID}").arg("ID", 1).send().await })
    };
    first
        .await
        .expect("task completes")
        .expect("request succeeds");
    second
        .await
        .expect("task completes")
        .expect("request succeeds");

    // Different templates get different scopes, so the two overlap.
    assert!(started.elapsed() < Duration::from_millis(75));
    assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn global_scope_groups_every_endpoint() {
    let transport = GaugeTransport::new(Duration::from_millis(30));
    let client = Client::builder("https://api.test")
        .transport(transport.clone())
        .config(ClientConfig::new().concurrency([ConcurrencyLimit::new(1).global()]))
        .build()
        .expect("client builds");

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/alpha").send().await })
    };
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/beta").send().await })
    };
    first
        .await
        .expect("task completes")
        .expect("request succeeds");
    second
        .await
        .expect("task completes")
        .expect("request succeeds");

    assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
}
