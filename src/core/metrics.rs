use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use http::Method;

use crate::context::RequestContext;
use crate::transport::Response;
use crate::util::lock_unpoisoned;

const TIMELINE_CAPACITY: usize = 256;

/// How a terminal outcome is classified in the timeline and buckets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeClass {
    Status(u16),
    /// The request never produced a response.
    Aborted,
}

/// Flags describing which optional paths fired during one `execute` call.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RequestStamp {
    pub(crate) retried: bool,
    pub(crate) throttled: bool,
    pub(crate) replayed: bool,
}

#[derive(Debug, Default)]
struct EndpointStats {
    total: u64,
    resp_2xx: u64,
    resp_3xx: u64,
    resp_4xx: u64,
    resp_5xx: u64,
    resp_other: u64,
    aborted: u64,
    retried: u64,
    throttled: u64,
    replayed: u64,
    successes: u64,
    elapsed_total: Duration,
    elapsed_max: Duration,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
    timeline: VecDeque<(SystemTime, OutcomeClass)>,
}

impl EndpointStats {
    fn push_timeline(&mut self, outcome: OutcomeClass) {
        if self.timeline.len() == TIMELINE_CAPACITY {
            self.timeline.pop_front();
        }
        self.timeline.push_back((SystemTime::now(), outcome));
    }
}

/// Per-(method, unformatted URL) counters. Exactly one terminal outcome is
/// recorded per `execute` call, on every exit path.
#[derive(Debug, Default)]
pub(crate) struct MetricsCollector {
    endpoints: Mutex<HashMap<(Method, String), EndpointStats>>,
}

impl MetricsCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(
        &self,
        ctx: &RequestContext,
        response: Option<&Response>,
        elapsed: Duration,
        stamp: RequestStamp,
    ) {
        let mut endpoints = lock_unpoisoned(&self.endpoints);
        let stats = endpoints
            .entry((ctx.method().clone(), ctx.unformatted_url().to_owned()))
            .or_default();

        let now = Instant::now();
        stats.first_at.get_or_insert(now);
        stats.last_at = Some(now);

        stats.total += 1;
        let outcome = match response {
            Some(response) => {
                let status = response.status();
                match status.as_u16() {
                    200..=299 => stats.resp_2xx += 1,
                    300..=399 => stats.resp_3xx += 1,
                    400..=499 => stats.resp_4xx += 1,
                    500..=599 => stats.resp_5xx += 1,
                    _ => stats.resp_other += 1,
                }
                if ctx.config().is_success(status) {
                    stats.successes += 1;
                }
                OutcomeClass::Status(status.as_u16())
            }
            None => {
                stats.aborted += 1;
                OutcomeClass::Aborted
            }
        };
        stats.push_timeline(outcome);

        let latency = response
            .map(Response::elapsed)
            .filter(|latency| !latency.is_zero())
            .unwrap_or(elapsed);
        stats.elapsed_total += latency;
        stats.elapsed_max = stats.elapsed_max.max(latency);

        if stamp.retried {
            stats.retried += 1;
        }
        if stamp.throttled {
            stats.throttled += 1;
        }
        if stamp.replayed {
            stats.replayed += 1;
        }
    }

    /// Out-of-band throttle accounting, used by back-off hooks that pause
    /// callers without going through admission.
    pub(crate) fn note_throttled(&self, ctx: &RequestContext) {
        let mut endpoints = lock_unpoisoned(&self.endpoints);
        endpoints
            .entry((ctx.method().clone(), ctx.unformatted_url().to_owned()))
            .or_default()
            .throttled += 1;
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let endpoints = lock_unpoisoned(&self.endpoints);
        let mut rows: Vec<EndpointReport> = endpoints
            .iter()
            .map(|((method, unformatted_url), stats)| {
                let span = match (stats.first_at, stats.last_at) {
                    (Some(first), Some(last)) => last.duration_since(first),
                    _ => Duration::ZERO,
                };
                let requests_per_second = if span.is_zero() {
                    stats.total as f64
                } else {
                    (stats.total as f64 / span.as_secs_f64()).min(stats.total as f64)
                };

                EndpointReport {
                    method: method.to_string(),
                    unformatted_url: unformatted_url.clone(),
                    total: stats.total,
                    resp_2xx: stats.resp_2xx,
                    resp_3xx: stats.resp_3xx,
                    resp_4xx: stats.resp_4xx,
                    resp_5xx: stats.resp_5xx,
                    resp_other: stats.resp_other,
                    aborted: stats.aborted,
                    retried: stats.retried,
                    throttled: stats.throttled,
                    replayed: stats.replayed,
                    success_rate: if stats.total == 0 {
                        0.0
                    } else {
                        stats.successes as f64 / stats.total as f64 * 100.0
                    },
                    avg_latency: if stats.total == 0 {
                        Duration::ZERO
                    } else {
                        stats.elapsed_total / stats.total as u32
                    },
                    max_latency: stats.elapsed_max,
                    requests_per_second,
                    timeline: stats.timeline.iter().copied().collect(),
                }
            })
            .collect();
        rows.sort_by(|left, right| right.total.cmp(&left.total));

        let totals = AggregateReport::from_rows(&rows);
        MetricsSnapshot { rows, totals }
    }
}

/// One endpoint's aggregated outcomes.
#[derive(Clone, Debug)]
pub struct EndpointReport {
    pub method: String,
    pub unformatted_url: String,
    pub total: u64,
    pub resp_2xx: u64,
    pub resp_3xx: u64,
    pub resp_4xx: u64,
    pub resp_5xx: u64,
    pub resp_other: u64,
    pub aborted: u64,
    pub retried: u64,
    pub throttled: u64,
    pub replayed: u64,
    /// Percentage of outcomes inside the effective success set.
    pub success_rate: f64,
    pub avg_latency: Duration,
    pub max_latency: Duration,
    pub requests_per_second: f64,
    pub timeline: Vec<(SystemTime, OutcomeClass)>,
}

#[derive(Clone, Debug, Default)]
pub struct AggregateReport {
    pub total: u64,
    pub resp_2xx: u64,
    pub resp_3xx: u64,
    pub resp_4xx: u64,
    pub resp_5xx: u64,
    pub resp_other: u64,
    pub aborted: u64,
    pub retried: u64,
    pub throttled: u64,
    pub replayed: u64,
    pub success_rate: f64,
    pub avg_latency: Duration,
    pub requests_per_second: f64,
}

impl AggregateReport {
    fn from_rows(rows: &[EndpointReport]) -> Self {
        let mut totals = Self::default();
        let mut weighted_successes = 0.0;
        let mut latency_sum = Duration::ZERO;
        let mut rate_sum = 0.0;
        let mut rated_rows = 0u32;

        for row in rows {
            totals.total += row.total;
            totals.resp_2xx += row.resp_2xx;
            totals.resp_3xx += row.resp_3xx;
            totals.resp_4xx += row.resp_4xx;
            totals.resp_5xx += row.resp_5xx;
            totals.resp_other += row.resp_other;
            totals.aborted += row.aborted;
            totals.retried += row.retried;
            totals.throttled += row.throttled;
            totals.replayed += row.replayed;
            weighted_successes += row.success_rate / 100.0 * row.total as f64;
            latency_sum += row.avg_latency;
            if row.requests_per_second > 0.0 {
                rate_sum += row.requests_per_second;
                rated_rows += 1;
            }
        }

        if totals.total > 0 {
            totals.success_rate = weighted_successes / totals.total as f64 * 100.0;
        }
        if !rows.is_empty() {
            totals.avg_latency = latency_sum / rows.len() as u32;
        }
        if rated_rows > 0 {
            totals.requests_per_second = rate_sum / f64::from(rated_rows);
        }
        totals
    }
}

/// Everything the collector knows, frozen at one instant. Rows are sorted
/// by request volume, busiest first.
#[derive(Clone, Debug)]
pub struct MetricsSnapshot {
    pub rows: Vec<EndpointReport>,
    pub totals: AggregateReport,
}

impl MetricsSnapshot {
    pub fn row(&self, method: &Method, unformatted_url: &str) -> Option<&EndpointReport> {
        self.rows.iter().find(|row| {
            row.method == method.as_str() && row.unformatted_url == unformatted_url
        })
    }
}
