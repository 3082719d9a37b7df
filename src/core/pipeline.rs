//! The per-request execution pipeline.
//!
//! One `execute` call walks: concurrency permit -> before hook -> attempt
//! loop (throttle admission -> dispatch or replay -> validate -> retry
//! decision) -> parse -> after hook -> metrics. Exactly one terminal
//! outcome is recorded on every exit path, and the permit is guard-owned so
//! cancellation can never leak a slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};

use crate::concurrency::ConcurrencyGate;
use crate::config::ClientConfig;
use crate::context::RequestContext;
use crate::error::{Error, ErrorKind};
use crate::events;
use crate::hooks::HookDispatcher;
use crate::metrics::{MetricsCollector, RequestStamp};
use crate::parse::{self, Reply};
use crate::replay::{Exchange, Replay, ReplayMode};
use crate::retry::{RetryBehavior, RetryPolicy, RetrySnapshot};
use crate::throttle::ThrottleController;
use crate::transport::{Response, Transport, TransportRequest};

#[derive(Default)]
struct AttemptOutcome {
    last_response: Option<Response>,
    final_retry: Option<RetrySnapshot>,
}

pub(crate) struct Pipeline {
    transport: Arc<dyn Transport>,
    throttle: ThrottleController,
    gate: ConcurrencyGate,
    hooks: HookDispatcher,
    metrics: Arc<MetricsCollector>,
    replay: Option<Arc<Replay>>,
    total_timeout: Option<Duration>,
}

impl Pipeline {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        hooks: HookDispatcher,
        metrics: Arc<MetricsCollector>,
        replay: Option<Arc<Replay>>,
        total_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            throttle: ThrottleController::new(),
            gate: ConcurrencyGate::new(),
            hooks,
            metrics,
            replay,
            total_timeout,
        }
    }

    pub(crate) fn replay(&self) -> Option<&Arc<Replay>> {
        self.replay.as_ref()
    }

    pub(crate) async fn execute(
        &self,
        ctx: RequestContext,
        request: TransportRequest,
    ) -> crate::Result<Reply> {
        let started = Instant::now();
        let permit = self.gate.acquire(&ctx).await;
        self.hooks.before(&ctx).await;

        let mut stamp = RequestStamp::default();
        let mut outcome = AttemptOutcome::default();

        let delivered = match self.total_timeout {
            Some(limit) => {
                match timeout(
                    limit,
                    self.run_attempts(&ctx, &request, &mut stamp, &mut outcome),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        timeout_ms: limit.as_millis(),
                        method: ctx.method().clone(),
                        url: ctx.url().to_owned(),
                    }),
                }
            }
            None => {
                self.run_attempts(&ctx, &request, &mut stamp, &mut outcome)
                    .await
            }
        };

        let result = match delivered {
            Ok(response) => {
                let delivered_response = response.clone();
                let parsed =
                    parse::apply(&ctx, ctx.config().parser.effective(), response);
                match parsed {
                    Ok(reply) => {
                        self.hooks.after(&ctx, Ok(&delivered_response), None).await;
                        Ok(reply)
                    }
                    Err(error) => {
                        self.hooks
                            .after(&ctx, Err(&error), outcome.final_retry.as_ref())
                            .await;
                        Err(error)
                    }
                }
            }
            Err(error) => {
                self.hooks
                    .after(&ctx, Err(&error), outcome.final_retry.as_ref())
                    .await;
                Err(error)
            }
        };

        self.metrics
            .record(&ctx, outcome.last_response.as_ref(), started.elapsed(), stamp);
        drop(permit);
        result
    }

    /// The attempt loop. Returns the response to deliver to the parser, or
    /// the terminal error.
    async fn run_attempts(
        &self,
        ctx: &RequestContext,
        request: &TransportRequest,
        stamp: &mut RequestStamp,
        outcome: &mut AttemptOutcome,
    ) -> crate::Result<Response> {
        let config = ctx.config();
        let retry_policy = config.retry.effective();
        let max_attempts = retry_policy.map_or(1, RetryPolicy::max_attempts);
        let mut attempt = 1usize;
        let mut retrying: Option<RetrySnapshot> = None;

        if let Some(event) = config.log_request.effective() {
            event.emit(events::MSG_BEFORE, &events::context_args(ctx));
        }

        loop {
            if retrying.is_some() {
                self.hooks.before(ctx).await;
            }

            // A hit that will replay can skip admission when configured to.
            let mut preloaded: Option<Exchange> = None;
            let mut skip_throttle = false;
            if let Some(replay) = &self.replay
                && replay.skips_throttling()
            {
                preloaded = replay.load_for(request, config).await;
                skip_throttle = preloaded.is_some();
            }
            if !skip_throttle
                && let Some(throttle) = config.throttling.effective()
                && self.throttle.admit(throttle, ctx).await
            {
                stamp.throttled = true;
            }

            let dispatched = self.dispatch(ctx, request, preloaded, stamp).await;

            if let Ok(response) = &dispatched {
                outcome.last_response = Some(response.clone());
                if let Some(event) = config.log_response.effective() {
                    let mut args = events::context_args(ctx);
                    args.extend(events::response_args(Some(response)));
                    event.emit(events::MSG_AFTER, &args);
                }
            }

            // The after-retry log and hook describe the attempt that just
            // executed, so they fire once its outcome is known.
            if let Some(snapshot) = retrying.take() {
                if let Some(policy) = retry_policy
                    && let Some(event) = policy.log_after_event()
                {
                    let mut args = events::context_args(ctx);
                    args.extend(events::response_args(dispatched.as_ref().ok()));
                    args.extend(events::retry_args(&snapshot));
                    event.emit(events::MSG_RETRY_AFTER, &args);
                }
                self.hooks
                    .after(ctx, dispatched.as_ref(), Some(&snapshot))
                    .await;
            }

            let failure = match dispatched {
                Ok(response) => match validate(ctx, config, &response) {
                    None => return Ok(response),
                    Some(error) => error,
                },
                Err(error) => error,
            };

            // A missing replay is terminal: retrying cannot make a
            // recording appear.
            if failure.kind() == ErrorKind::NoReplay {
                return self.fail_terminal(ctx, config, None, failure, false);
            }
            let Some(policy) = retry_policy else {
                return self.fail_terminal(ctx, config, None, failure, false);
            };
            if !policy.should_retry(&failure) {
                return self.fail_terminal(ctx, config, Some(policy), failure, false);
            }
            if attempt >= max_attempts {
                return self.fail_terminal(ctx, config, Some(policy), failure, true);
            }

            stamp.retried = true;
            let next_attempt = attempt + 1;
            let delay = policy.delay_before(next_attempt, failure.status());
            let snapshot = RetrySnapshot {
                attempt: next_attempt,
                max_attempts,
                delay,
                cause: failure.retry_cause(),
            };
            if let Some(event) = policy.log_before_event() {
                let mut args = events::context_args(ctx);
                args.extend(events::retry_args(&snapshot));
                event.emit(events::MSG_RETRY_BEFORE, &args);
            }
            outcome.final_retry = Some(snapshot.clone());
            retrying = Some(snapshot);
            sleep(delay).await;
            attempt = next_attempt;
        }
    }

    fn fail_terminal(
        &self,
        ctx: &RequestContext,
        config: &ClientConfig,
        policy: Option<&RetryPolicy>,
        failure: Error,
        exhausted: bool,
    ) -> crate::Result<Response> {
        if let Some(event) = config.log_errors.effective() {
            let mut args = events::context_args(ctx);
            args.extend(events::response_args(failure.response()));
            event.emit(events::MSG_ERRORS, &args);
        }

        let mut failure = failure;
        if exhausted && let Some(policy) = policy {
            if let Some(event) = policy.log_exhausted_event() {
                let snapshot = RetrySnapshot {
                    attempt: policy.max_attempts(),
                    max_attempts: policy.max_attempts(),
                    delay: Duration::ZERO,
                    cause: failure.retry_cause(),
                };
                let mut args = events::context_args(ctx);
                args.extend(events::retry_args(&snapshot));
                event.emit(events::MSG_RETRY_EXHAUSTED, &args);
            }
            failure = Error::RetryExhausted {
                max_attempts: policy.max_attempts(),
                url: ctx.url().to_owned(),
                source: Box::new(failure),
            };
        }

        // Pass delivers the last response to the parser instead of raising,
        // when the final outcome produced one.
        let behavior = policy.map_or(RetryBehavior::Break, RetryPolicy::behavior_value);
        if behavior == RetryBehavior::Pass
            && let Some(response) = failure.response()
        {
            return Ok(response.clone());
        }

        Err(failure)
    }

    async fn dispatch(
        &self,
        ctx: &RequestContext,
        request: &TransportRequest,
        preloaded: Option<Exchange>,
        stamp: &mut RequestStamp,
    ) -> crate::Result<Response> {
        if let Some(exchange) = preloaded {
            stamp.replayed = true;
            if let Some(replay) = &self.replay {
                replay.note_replay();
            }
            return Ok(exchange.to_response());
        }

        match &self.replay {
            None => self.send(request).await,
            Some(replay) => match replay.mode() {
                ReplayMode::Record => {
                    let response = self.send(request).await?;
                    replay.store(request, &response).await;
                    Ok(response)
                }
                ReplayMode::Replay => match replay.load_for(request, ctx.config()).await {
                    Some(exchange) => {
                        stamp.replayed = true;
                        replay.note_replay();
                        Ok(exchange.to_response())
                    }
                    None => Err(Error::NoReplay {
                        method: ctx.method().clone(),
                        url: ctx.url().to_owned(),
                    }),
                },
                ReplayMode::SmartReplay => match replay.load_for(request, ctx.config()).await {
                    Some(exchange) => {
                        stamp.replayed = true;
                        replay.note_replay();
                        Ok(exchange.to_response())
                    }
                    None => {
                        let response = self.send(request).await?;
                        replay.store(request, &response).await;
                        Ok(response)
                    }
                },
            },
        }
    }

    async fn send(&self, request: &TransportRequest) -> crate::Result<Response> {
        let started = Instant::now();
        let response = self.transport.send(request).await?;
        Ok(if response.elapsed().is_zero() {
            response.with_elapsed(started.elapsed())
        } else {
            response
        })
    }
}

/// Strict/allowed status check, then user validators in declaration order.
fn validate(ctx: &RequestContext, config: &ClientConfig, response: &Response) -> Option<Error> {
    let status = response.status();
    if !config.is_success(status) {
        return Some(Error::BadStatus {
            status: status.as_u16(),
            method: ctx.method().clone(),
            url: ctx.url().to_owned(),
            response: Box::new(response.clone()),
        });
    }

    if let Some(validators) = config.validators.effective() {
        for validator in validators {
            if let Err(source) = validator.check(response) {
                return Some(Error::ValidatorFailed {
                    reason: source.to_string(),
                    status: status.as_u16(),
                    method: ctx.method().clone(),
                    url: ctx.url().to_owned(),
                    response: Box::new(response.clone()),
                });
            }
        }
    }

    None
}
