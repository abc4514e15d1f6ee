use std::sync::Arc;
use std::time::Duration;

use crate::retry::{JitterSource, RetryPolicy, RetryStrategy};
use crate::trace::{SpanOptions, TracingOptions};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_CLIENT_NAME: &str = "egress";

/// Effective configuration of a call.
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub(crate) operation_name: Option<String>,
    pub(crate) tracing: TracingOptions,
    pub(crate) retry_policy: Option<RetryPolicy>,
}

impl Options {
    pub fn operation_name(&self) -> Option<&str> {
        self.operation_name.as_deref()
    }

    pub fn tracing(&self) -> &TracingOptions {
        &self.tracing
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub(crate) fn apply(&mut self, options: &[ClientOption], jitter: &JitterSource) {
        for option in options {
            option.apply(self, jitter);
        }
    }

    /// Fills in the standard retry policy when none was configured.
    pub(crate) fn with_default_policy(mut self, jitter: &JitterSource) -> Self {
        if self.retry_policy.is_none() {
            self.retry_policy = Some(RetryPolicy::standard(
                DEFAULT_REQUEST_TIMEOUT,
                DEFAULT_MAX_ATTEMPTS,
                jitter,
            ));
        }
        self
    }
}

type ApplyFn = dyn Fn(&mut Options, &JitterSource) + Send + Sync;

/// A configuration transformer, applied to a client at construction or to a
/// single call. Options apply in order and the last one wins.
#[derive(Clone)]
pub struct ClientOption(Arc<ApplyFn>);

impl std::fmt::Debug for ClientOption {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("ClientOption(..)")
    }
}

impl ClientOption {
    pub fn new<F>(apply: F) -> Self
    where
        F: Fn(&mut Options, &JitterSource) + Send + Sync + 'static,
    {
        Self(Arc::new(apply))
    }

    pub(crate) fn apply(&self, options: &mut Options, jitter: &JitterSource) {
        (self.0)(options, jitter);
    }
}

/// Replaces the retry policy. A [`Limit`](crate::Limit) of `max_attempts`
/// runs before `strategies`.
pub fn with_retry_policy<I>(request_timeout: Duration, max_attempts: u32, strategies: I) -> ClientOption
where
    I: IntoIterator<Item = Arc<dyn RetryStrategy>>,
{
    let strategies = strategies.into_iter().collect::<Vec<_>>();
    ClientOption::new(move |options, _jitter| {
        options.retry_policy = Some(RetryPolicy::new(
            request_timeout,
            max_attempts,
            strategies.iter().cloned(),
        ));
    })
}

/// Replaces the retry policy with attempt limiting plus 1 ms binary
/// exponential backoff with jitter (deviation 0.25) drawn from the client's
/// jitter source.
pub fn with_standard_retry_policy(request_timeout: Duration, max_attempts: u32) -> ClientOption {
    ClientOption::new(move |options, jitter| {
        options.retry_policy = Some(RetryPolicy::standard(request_timeout, max_attempts, jitter));
    })
}

/// Sets tracing enablement, operation name and span options. The carrier
/// injection toggle is left as it is.
pub fn with_tracing(
    enabled: bool,
    operation_name: impl Into<String>,
    span_options: SpanOptions,
) -> ClientOption {
    let operation_name = operation_name.into();
    ClientOption::new(move |options, _jitter| {
        options.operation_name = if operation_name.is_empty() {
            None
        } else {
            Some(operation_name.clone())
        };
        options.tracing.enabled = enabled;
        options.tracing.span_options = span_options.clone();
    })
}

/// Injects the span context into the outgoing request headers.
pub fn with_span_carrier_injected() -> ClientOption {
    ClientOption::new(|options, _jitter| {
        options.tracing.inject_carrier = true;
    })
}
