//! Observational hooks around the request lifecycle.
//!
//! Hooks fire before dispatch and after a terminal outcome, plus once per
//! retry attempt with the retry snapshot attached. They are isolated: a
//! failing hook is logged and dropped, never altering the wrapped request.
//! A task-local guard stops nested client calls made from inside a hook
//! from recursing into hook dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use http::StatusCode;

use crate::context::RequestContext;
use crate::error::Error;
use crate::events::{self, LogEvent};
use crate::metrics::MetricsCollector;
use crate::retry::RetrySnapshot;
use crate::transport::Response;
use crate::util::{lock_unpoisoned, parse_retry_after};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The outcome handed to `after`: the delivered response or the terminal
/// error.
pub type HookOutcome<'a> = Result<&'a Response, &'a Error>;

#[async_trait]
pub trait Hook: Send + Sync {
    async fn before(&self, _ctx: &RequestContext) -> Result<(), BoxError> {
        Ok(())
    }

    async fn after(
        &self,
        _ctx: &RequestContext,
        _outcome: HookOutcome<'_>,
        _retry: Option<&RetrySnapshot>,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

tokio::task_local! {
    static IN_HOOK: ();
}

fn inside_hook() -> bool {
    IN_HOOK.try_with(|_| ()).is_ok()
}

#[derive(Clone, Default)]
pub(crate) struct HookDispatcher {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookDispatcher {
    pub(crate) fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        Self { hooks }
    }

    pub(crate) async fn before(&self, ctx: &RequestContext) {
        if self.hooks.is_empty() || inside_hook() {
            return;
        }
        IN_HOOK
            .scope((), async {
                for hook in &self.hooks {
                    if let Err(error) = hook.before(ctx).await {
                        tracing::warn!(target: "gracile", "before hook failed: {error}");
                    }
                }
            })
            .await;
    }

    pub(crate) async fn after(
        &self,
        ctx: &RequestContext,
        outcome: HookOutcome<'_>,
        retry: Option<&RetrySnapshot>,
    ) {
        if self.hooks.is_empty() || inside_hook() {
            return;
        }
        IN_HOOK
            .scope((), async {
                for hook in &self.hooks {
                    if let Err(error) = hook.after(ctx, outcome, retry).await {
                        tracing::warn!(target: "gracile", "after hook failed: {error}");
                    }
                }
            })
            .await;
    }
}

/// Cross-request pause primitive: once a scope is paused, everyone who
/// awaits readiness on that scope waits out the pause. The hook dispatch
/// guard keeps it from being re-entered by nested client calls.
#[derive(Debug, Default)]
pub struct PauseGate {
    scopes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope_lock(&self, scope: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut scopes = lock_unpoisoned(&self.scopes);
        Arc::clone(scopes.entry(scope.to_owned()).or_default())
    }

    /// Holds the scope closed for `duration`.
    pub async fn pause_for(&self, scope: &str, duration: Duration) {
        let lock = self.scope_lock(scope);
        let _guard = lock.lock().await;
        tokio::time::sleep(duration).await;
    }

    /// Resolves once the scope is not paused.
    pub async fn wait_ready(&self, scope: &str) {
        let lock = self.scope_lock(scope);
        drop(lock.lock().await);
    }
}

const CLIENT_SCOPE: &str = "CLIENT";
const MSG_RETRY_AFTER_WAIT: &str = "[{METHOD}] {URL} requested to wait for {RETRY_AFTER}s";

fn backoff_scope(per_endpoint: bool, ctx: &RequestContext) -> String {
    if per_endpoint {
        ctx.unformatted_url().to_owned()
    } else {
        CLIENT_SCOPE.to_owned()
    }
}

/// Honors `Retry-After` on 429 responses by pausing the whole client (or
/// just the endpoint) for the advertised duration. Pair it with a retry
/// policy so the 429 itself gets another attempt.
pub struct RetryAfterBackoffHook {
    gate: PauseGate,
    per_endpoint: bool,
    log_event: Option<LogEvent>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RetryAfterBackoffHook {
    pub fn new() -> Self {
        Self {
            gate: PauseGate::new(),
            per_endpoint: false,
            log_event: None,
            metrics: None,
        }
    }

    /// Pause only the endpoint that was throttled instead of every caller.
    pub fn per_endpoint(mut self) -> Self {
        self.per_endpoint = true;
        self
    }

    pub fn log_event(mut self, event: LogEvent) -> Self {
        self.log_event = Some(event);
        self
    }

    pub(crate) fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl Default for RetryAfterBackoffHook {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hook for RetryAfterBackoffHook {
    async fn before(&self, ctx: &RequestContext) -> Result<(), BoxError> {
        self.gate
            .wait_ready(&backoff_scope(self.per_endpoint, ctx))
            .await;
        Ok(())
    }

    async fn after(
        &self,
        ctx: &RequestContext,
        outcome: HookOutcome<'_>,
        _retry: Option<&RetrySnapshot>,
    ) -> Result<(), BoxError> {
        let response = match outcome {
            Ok(response) => Some(response),
            Err(error) => error.response(),
        };
        let Some(response) = response else {
            return Ok(());
        };
        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return Ok(());
        }
        let Some(wait) = parse_retry_after(response.headers(), SystemTime::now()) else {
            return Ok(());
        };
        if wait.is_zero() {
            return Ok(());
        }

        if let Some(metrics) = &self.metrics {
            metrics.note_throttled(ctx);
        }
        if let Some(event) = &self.log_event {
            let mut args = events::context_args(ctx);
            args.extend(events::response_args(Some(response)));
            args.push(("RETRY_AFTER", events::format_seconds(wait)));
            event.emit(MSG_RETRY_AFTER_WAIT, &args);
        }
        self.gate
            .pause_for(&backoff_scope(self.per_endpoint, ctx), wait)
            .await;
        Ok(())
    }
}

/// Fixed-duration back-off on 429 responses, for servers that throttle
/// without advertising `Retry-After`.
pub struct FixedBackoffHook {
    gate: PauseGate,
    per_endpoint: bool,
    duration: Duration,
}

impl FixedBackoffHook {
    pub fn new(duration: Duration) -> Self {
        Self {
            gate: PauseGate::new(),
            per_endpoint: false,
            duration,
        }
    }

    pub fn per_endpoint(mut self) -> Self {
        self.per_endpoint = true;
        self
    }
}

#[async_trait]
impl Hook for FixedBackoffHook {
    async fn before(&self, ctx: &RequestContext) -> Result<(), BoxError> {
        self.gate
            .wait_ready(&backoff_scope(self.per_endpoint, ctx))
            .await;
        Ok(())
    }

    async fn after(
        &self,
        ctx: &RequestContext,
        outcome: HookOutcome<'_>,
        _retry: Option<&RetrySnapshot>,
    ) -> Result<(), BoxError> {
        let status = match outcome {
            Ok(response) => Some(response.status()),
            Err(error) => error.status().and_then(|code| StatusCode::from_u16(code).ok()),
        };
        if status == Some(StatusCode::TOO_MANY_REQUESTS) {
            self.gate
                .pause_for(&backoff_scope(self.per_endpoint, ctx), self.duration)
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::config::ClientConfig;

    fn ctx() -> RequestContext {
        RequestContext::new(
            http::Method::GET,
            "https://api.test",
            "/x".to_owned(),
            "/x".to_owned(),
            BTreeMap::new(),
            Arc::new(ClientConfig::new()),
        )
    }

    struct FailingHook;

    #[async_trait]
    impl Hook for FailingHook {
        async fn before(&self, _ctx: &RequestContext) -> Result<(), BoxError> {
            Err("hook exploded".into())
        }
    }

    struct CountingHook {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Hook for CountingHook {
        async fn before(&self, _ctx: &RequestContext) -> Result<(), BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn hook_errors_are_swallowed() {
        let dispatcher = HookDispatcher::new(vec![Arc::new(FailingHook)]);
        dispatcher.before(&ctx()).await;
    }

    #[tokio::test]
    async fn nested_dispatch_is_suppressed() {
        struct NestingHook {
            inner: HookDispatcher,
        }

        #[async_trait]
        impl Hook for NestingHook {
            async fn before(&self, ctx: &RequestContext) -> Result<(), BoxError> {
                // A nested client call from inside a hook dispatches through
                // the same guard and must not re-enter hooks.
                self.inner.before(ctx).await;
                Ok(())
            }
        }

        let inner_counter = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
        });
        let nesting = NestingHook {
            inner: HookDispatcher::new(vec![Arc::clone(&inner_counter) as Arc<dyn Hook>]),
        };
        let dispatcher = HookDispatcher::new(vec![Arc::new(nesting)]);

        dispatcher.before(&ctx()).await;
        assert_eq!(inner_counter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pause_gate_blocks_waiters_for_the_duration() {
        let gate = Arc::new(PauseGate::new());
        let pausing = Arc::clone(&gate);
        let pause = tokio::spawn(async move {
            pausing.pause_for("CLIENT", Duration::from_millis(50)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        gate.wait_ready("CLIENT").await;
        assert!(started.elapsed() >= Duration::from_millis(30));
        pause.await.expect("pause task completes");
    }
}
