use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regex::Regex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::context::RequestContext;
use crate::events::{self, LogEvent, MSG_CONCURRENCY_FREED, MSG_CONCURRENCY_HIT};
use crate::util::lock_unpoisoned;

const GLOBAL_SCOPE: &str = "*";

/// Caps how many requests can be in flight at once for a scope.
///
/// The scope is the unformatted URL when `per_endpoint` (the default), so
/// `/pokemon/{NAME}` calls share one cap regardless of substitutions; a
/// global limit groups every matching endpoint together.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimit {
    limit: usize,
    template_pattern: Option<Regex>,
    per_endpoint: bool,
    log_limit_reached: Option<LogEvent>,
    log_limit_freed: Option<LogEvent>,
}

impl ConcurrencyLimit {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            template_pattern: None,
            per_endpoint: true,
            log_limit_reached: None,
            log_limit_freed: None,
        }
    }

    /// Restricts the rule to unformatted URLs matching `pattern`. Without
    /// one, the rule applies to every endpoint.
    pub fn for_pattern(mut self, pattern: Regex) -> Self {
        self.template_pattern = Some(pattern);
        self
    }

    /// One shared cap for every matching endpoint instead of one per
    /// endpoint template.
    pub fn global(mut self) -> Self {
        self.per_endpoint = false;
        self
    }

    pub fn log_limit_reached(mut self, event: LogEvent) -> Self {
        self.log_limit_reached = Some(event);
        self
    }

    pub fn log_limit_freed(mut self, event: LogEvent) -> Self {
        self.log_limit_freed = Some(event);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn matches(&self, unformatted_url: &str) -> bool {
        self.template_pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(unformatted_url))
    }
}

/// Scope-keyed semaphores. Permits are owned guards: dropping one (normal
/// exit, error, or cancellation) always frees the slot.
#[derive(Debug, Default)]
pub(crate) struct ConcurrencyGate {
    scopes: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConcurrencyGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn acquire(&self, ctx: &RequestContext) -> Option<ConcurrencyPermit> {
        let rule = ctx.config().concurrency_rule_for(ctx.unformatted_url())?;
        let scope = if rule.per_endpoint {
            ctx.unformatted_url().to_owned()
        } else {
            GLOBAL_SCOPE.to_owned()
        };

        let semaphore = {
            let mut scopes = lock_unpoisoned(&self.scopes);
            Arc::clone(
                scopes
                    .entry(scope)
                    .or_insert_with(|| Arc::new(Semaphore::new(rule.limit))),
            )
        };

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return None,
        };

        if semaphore.available_permits() == 0
            && let Some(event) = &rule.log_limit_reached
        {
            let mut args = events::context_args(ctx);
            args.push(("CONCURRENT_REQUESTS", rule.limit.to_string()));
            event.emit(MSG_CONCURRENCY_HIT, &args);
        }

        Some(ConcurrencyPermit {
            _permit: permit,
            semaphore,
            limit: rule.limit,
            log_limit_freed: rule.log_limit_freed.clone(),
            context_args: events::context_args(ctx),
        })
    }
}

pub(crate) struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
    semaphore: Arc<Semaphore>,
    limit: usize,
    log_limit_freed: Option<LogEvent>,
    context_args: Vec<(&'static str, String)>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        // Runs before the owned permit releases, so zero available permits
        // means this drop is the limit -> limit-1 transition.
        if self.semaphore.available_permits() == 0
            && let Some(event) = &self.log_limit_freed
        {
            let freed_capacity = 100.0 / self.limit as f64;
            let mut args = self.context_args.clone();
            args.push(("CONCURRENCY_CAP", format!("{freed_capacity:.2}%")));
            event.emit(MSG_CONCURRENCY_FREED, &args);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::ClientConfig;

    fn ctx_with_limit(limit: usize) -> RequestContext {
        let config = ClientConfig::new().concurrency([ConcurrencyLimit::new(limit)]);
        RequestContext::new(
            http::Method::GET,
            "https://api.test",
            "/slow/{ID}".to_owned(),
            "/slow/1".to_owned(),
            BTreeMap::new(),
            Arc::new(config),
        )
    }

    #[tokio::test]
    async fn in_flight_count_never_exceeds_limit() {
        let gate = Arc::new(ConcurrencyGate::new());
        let ctx = ctx_with_limit(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let gate = Arc::clone(&gate);
            let ctx = ctx.clone();
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let permit = gate.acquire(&ctx).await;
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for task in tasks {
            task.await.expect("task completes");
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn no_rule_means_no_permit() {
        let gate = ConcurrencyGate::new();
        let ctx = RequestContext::new(
            http::Method::GET,
            "https://api.test",
            "/x".to_owned(),
            "/x".to_owned(),
            BTreeMap::new(),
            Arc::new(ClientConfig::new()),
        );
        assert!(gate.acquire(&ctx).await.is_none());
    }

    #[tokio::test]
    async fn dropping_permit_frees_the_slot() {
        let gate = ConcurrencyGate::new();
        let ctx = ctx_with_limit(1);

        let first = gate.acquire(&ctx).await.expect("first permit");
        drop(first);
        let second = gate.acquire(&ctx).await.expect("second permit");
        drop(second);
    }
}
