use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::context::RequestContext;
use crate::events::{self, LogEvent, MSG_THROTTLE_DONE, MSG_THROTTLE_HIT};

/// Caps requests whose formatted URL matches `url_pattern` to
/// `max_requests` per sliding `per_time` window.
#[derive(Clone, Debug)]
pub struct ThrottleRule {
    url_pattern: Regex,
    max_requests: usize,
    per_time: Duration,
}

impl ThrottleRule {
    pub fn new(url_pattern: Regex, max_requests: usize) -> Self {
        Self::per_duration(url_pattern, max_requests, Duration::from_secs(1))
    }

    pub fn per_duration(url_pattern: Regex, max_requests: usize, per_time: Duration) -> Self {
        Self {
            url_pattern,
            max_requests: max_requests.max(1),
            per_time: per_time.max(Duration::from_millis(1)),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn per_time(&self) -> Duration {
        self.per_time
    }

    pub(crate) fn matches(&self, url: &str) -> bool {
        self.url_pattern.is_match(url)
    }

    fn key(&self) -> RuleKey {
        (
            self.url_pattern.as_str().to_owned(),
            self.max_requests,
            self.per_time,
        )
    }

    /// Human form of the window for `{THROTTLE_TIME_RANGE}`: "second",
    /// "30 seconds", "1 minute and 30 seconds".
    pub fn readable_time_range(&self) -> String {
        let mut seconds = self.per_time.as_secs();
        if seconds == 0 {
            return format!("{:?}", self.per_time);
        }

        let mut parts = Vec::new();
        for (name, unit) in [("hour", 3600), ("minute", 60), ("second", 1)] {
            if seconds >= unit {
                let count = seconds / unit;
                seconds %= unit;
                if count == 1 {
                    parts.push(name.to_owned());
                } else {
                    parts.push(format!("{count} {name}s"));
                }
            }
        }

        match parts.len() {
            1 => parts.remove(0),
            _ => {
                let last = parts.pop().unwrap_or_default();
                format!("{} and {last}", parts.join(", "))
            }
        }
    }
}

impl std::fmt::Display for ThrottleRule {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{} requests per {} for URLs matching {}",
            self.max_requests,
            self.readable_time_range(),
            self.url_pattern.as_str()
        )
    }
}

/// A set of throttle rules plus the two saturation log events.
#[derive(Clone, Debug, Default)]
pub struct Throttle {
    rules: Vec<ThrottleRule>,
    log_limit_reached: Option<LogEvent>,
    log_wait_over: Option<LogEvent>,
}

impl Throttle {
    pub fn new(rules: impl IntoIterator<Item = ThrottleRule>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
            log_limit_reached: None,
            log_wait_over: None,
        }
    }

    pub fn log_limit_reached(mut self, event: LogEvent) -> Self {
        self.log_limit_reached = Some(event);
        self
    }

    pub fn log_wait_over(mut self, event: LogEvent) -> Self {
        self.log_wait_over = Some(event);
        self
    }

    pub fn rules(&self) -> &[ThrottleRule] {
        &self.rules
    }
}

type RuleKey = (String, usize, Duration);

#[derive(Debug, Default)]
struct RuleState {
    hits: VecDeque<Instant>,
    saturation_logged: bool,
    last_wait: Duration,
}

impl RuleState {
    /// Prunes timestamps that slid out of the window, then reports how long
    /// a new request has to wait to fit. Zero means the window has room.
    fn wait_for(&mut self, rule: &ThrottleRule, now: Instant) -> Duration {
        let oldest_allowed = now.checked_sub(rule.per_time());
        while let (Some(front), Some(cutoff)) = (self.hits.front(), oldest_allowed) {
            if *front <= cutoff {
                self.hits.pop_front();
            } else {
                break;
            }
        }

        if self.hits.len() < rule.max_requests() {
            return Duration::ZERO;
        }
        match self.hits.front() {
            Some(oldest) => (*oldest + rule.per_time()).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

/// Owns one sliding-window state per rule and serializes admission
/// decisions behind a fair async lock, so admission order is the lock
/// acquisition order and a one-slot rule holds across concurrent callers.
#[derive(Debug, Default)]
pub(crate) struct ThrottleController {
    admission: Mutex<HashMap<RuleKey, RuleState>>,
}

impl ThrottleController {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Suspends until every matching rule has window room, then records the
    /// admission timestamp before releasing the lock. Returns whether the
    /// caller had to wait.
    pub(crate) async fn admit(&self, throttle: &Throttle, ctx: &RequestContext) -> bool {
        let url = ctx.url();
        let matching: Vec<(&ThrottleRule, RuleKey)> = throttle
            .rules()
            .iter()
            .filter(|rule| rule.matches(url))
            .map(|rule| (rule, rule.key()))
            .collect();
        if matching.is_empty() {
            return false;
        }

        let mut waited = false;
        loop {
            let admission_wait = {
                let mut states = self.admission.lock().await;
                let now = Instant::now();

                let mut rule_waits = Vec::with_capacity(matching.len());
                let mut admission_wait = Duration::ZERO;
                for (rule, key) in &matching {
                    let state = states.entry(key.clone()).or_default();
                    let wait = state.wait_for(rule, now);
                    admission_wait = admission_wait.max(wait);
                    rule_waits.push(wait);
                }

                if admission_wait.is_zero() {
                    for (rule, key) in &matching {
                        let state = states.entry(key.clone()).or_default();
                        state.hits.push_back(now);
                        if state.saturation_logged {
                            state.saturation_logged = false;
                            if let Some(event) = &throttle.log_wait_over {
                                let mut args = events::context_args(ctx);
                                args.extend(events::throttle_args(rule, state.last_wait));
                                event.emit(MSG_THROTTLE_DONE, &args);
                            }
                        }
                    }
                    return waited;
                }

                for (index, (rule, key)) in matching.iter().enumerate() {
                    let wait = rule_waits[index];
                    if wait.is_zero() {
                        continue;
                    }
                    let state = states.entry(key.clone()).or_default();
                    state.last_wait = wait;
                    if !state.saturation_logged {
                        state.saturation_logged = true;
                        if let Some(event) = &throttle.log_limit_reached {
                            let mut args = events::context_args(ctx);
                            args.extend(events::throttle_args(rule, wait));
                            event.emit(MSG_THROTTLE_HIT, &args);
                        }
                    }
                }

                admission_wait
            };

            waited = true;
            sleep(admission_wait).await;
        }
    }
}
