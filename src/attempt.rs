use http::request::Parts;
use http::{Method, Request, Response};
use tracing::{Instrument, debug, info_span, warn};

use crate::Result;
use crate::body::{ReplayableBody, ReqBody, ResponseBody};
use crate::context::{CallContext, Interrupt, call_interrupt_error};
use crate::error::Error;
use crate::metrics::ClientMetrics;
use crate::retry::{RetryPolicy, StrategyVerdict};
use crate::timeout::{AttemptInfo, AttemptScope};
use crate::trace::{SpanContext, TracingScope};
use crate::transport::Transport;
use crate::util::classify_transport_error;

/// Drives the attempts of one call until a response arrives, a strategy
/// stops the call, or the caller's context ends it.
pub(crate) struct AttemptLoop<'a> {
    pub(crate) client_name: &'a str,
    pub(crate) transport: &'a dyn Transport,
    pub(crate) policy: &'a RetryPolicy,
    pub(crate) metrics: &'a ClientMetrics,
    pub(crate) method: &'a Method,
    pub(crate) redacted_uri: &'a str,
}

pub(crate) struct LoopOutcome {
    pub(crate) result: Result<Response<ResponseBody>>,
    pub(crate) attempts: u32,
}

enum AttemptResult {
    Response(Response<ResponseBody>),
    Failed(Error),
    Interrupted(Interrupt),
}

enum Evaluation {
    Retry,
    Stop,
    Interrupted(Interrupt),
}

impl AttemptLoop<'_> {
    pub(crate) async fn run(
        &self,
        ctx: &CallContext,
        parts: &Parts,
        body: &ReplayableBody,
        tracing: &mut TracingScope,
    ) -> LoopOutcome {
        let span_context = tracing.span_context();
        let mut attempts = 0_u32;
        loop {
            if let Some(interrupt) = ctx.interrupt_now() {
                return self.interrupted(interrupt, attempts);
            }

            attempts = attempts.saturating_add(1);
            tracing.record_attempt(attempts);
            self.metrics.record_attempt();

            let outcome = self.attempt(ctx, parts, body, span_context.as_ref(), attempts);
            let error = match outcome.await {
                AttemptResult::Response(response) => {
                    return LoopOutcome {
                        result: Ok(response),
                        attempts,
                    };
                }
                AttemptResult::Interrupted(interrupt) => {
                    return self.interrupted(interrupt, attempts);
                }
                AttemptResult::Failed(error) => error,
            };
            self.metrics.record_attempt_failure(&error);

            match self.evaluate(ctx, attempts, &error).await {
                Evaluation::Retry => self.metrics.record_retry(),
                Evaluation::Stop => {
                    return LoopOutcome {
                        result: Err(error),
                        attempts,
                    };
                }
                Evaluation::Interrupted(interrupt) => {
                    return self.interrupted(interrupt, attempts);
                }
            }
        }
    }

    fn interrupted(&self, interrupt: Interrupt, attempts: u32) -> LoopOutcome {
        LoopOutcome {
            result: Err(call_interrupt_error(interrupt, self.method, self.redacted_uri)),
            attempts,
        }
    }

    async fn attempt(
        &self,
        ctx: &CallContext,
        parts: &Parts,
        body: &ReplayableBody,
        span_context: Option<&SpanContext>,
        attempt: u32,
    ) -> AttemptResult {
        match ctx.run(body.rewind()).await {
            Err(interrupt) => return AttemptResult::Interrupted(interrupt),
            Ok(Err(source)) => return AttemptResult::Failed(Error::BodyRewind { attempt, source }),
            Ok(Ok(())) => {}
        }

        let timeout = self.policy.request_timeout();
        let (attempt_ctx, release) = AttemptScope::begin(ctx, timeout, attempt);
        let request = attempt_request(
            parts,
            body.attempt_body(),
            attempt_ctx.info(),
            span_context,
        );

        let span = info_span!(
            "egress.attempt",
            client = %self.client_name,
            method = %self.method,
            uri = %self.redacted_uri,
            attempt = attempt,
            max_attempts = self.policy.max_attempts()
        );
        let sent = async {
            debug!("sending request");
            attempt_ctx.run(self.transport.send(request)).await
        }
        .instrument(span)
        .await;

        match sent {
            Ok(Ok(response)) => {
                debug!(
                    status = response.status().as_u16(),
                    attempt, "attempt returned a response"
                );
                let method = self.method.clone();
                let uri = self.redacted_uri.to_owned();
                AttemptResult::Response(
                    response.map(|inner| ResponseBody::new(inner, attempt_ctx, release, method, uri)),
                )
            }
            Ok(Err(source)) => {
                release.release();
                AttemptResult::Failed(Error::Transport {
                    kind: classify_transport_error(&source),
                    method: self.method.clone(),
                    uri: self.redacted_uri.to_owned(),
                    source,
                })
            }
            Err(Interrupt::AttemptTimeout) => {
                release.release();
                AttemptResult::Failed(Error::Timeout {
                    timeout_ms: timeout.as_millis(),
                    attempt,
                    method: self.method.clone(),
                    uri: self.redacted_uri.to_owned(),
                })
            }
            Err(interrupt) => {
                release.release();
                AttemptResult::Interrupted(interrupt)
            }
        }
    }

    /// Runs the strategies in order, sleeping any delay they ask for.
    async fn evaluate(&self, ctx: &CallContext, attempts: u32, error: &Error) -> Evaluation {
        if let Some(interrupt) = ctx.interrupt_now() {
            return Evaluation::Interrupted(interrupt);
        }

        let mut slept = std::time::Duration::ZERO;
        for strategy in self.policy.strategies() {
            match strategy.evaluate(attempts, error) {
                StrategyVerdict::Continue => {}
                StrategyVerdict::ContinueAfter(delay) => {
                    if delay.is_zero() {
                        continue;
                    }
                    if let Err(interrupt) = ctx.run(tokio::time::sleep(delay)).await {
                        return Evaluation::Interrupted(interrupt);
                    }
                    slept = slept.saturating_add(delay);
                }
                StrategyVerdict::Stop => {
                    debug!(attempts, error = %error, "retry strategies stopped the call");
                    return Evaluation::Stop;
                }
            }
        }

        warn!(
            attempt = attempts,
            delay_ms = slept.as_millis() as u64,
            error = %error,
            "retrying request after failed attempt"
        );
        Evaluation::Retry
    }
}

fn attempt_request(
    parts: &Parts,
    body: ReqBody,
    info: AttemptInfo,
    span_context: Option<&SpanContext>,
) -> Request<ReqBody> {
    let mut request = Request::new(body);
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    *request.extensions_mut() = parts.extensions.clone();
    request.extensions_mut().insert(info);
    if let Some(span_context) = span_context {
        request.extensions_mut().insert(span_context.clone());
    }
    request
}
