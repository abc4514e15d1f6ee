//! `egress` is a resilient outbound HTTP executor: per-attempt timeouts,
//! pluggable retry strategies with jittered backoff, request-body replay and
//! egress tracing around any [`Transport`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use egress::prelude::{CallContext, Client, SpanOptions};
//! use egress::{with_span_carrier_injected, with_standard_retry_policy, with_tracing};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new([
//!         with_standard_retry_policy(Duration::from_millis(500), 3),
//!         with_tracing(true, "items", SpanOptions::new().tag("team", "catalog")),
//!         with_span_carrier_injected(),
//!     ])?;
//!
//!     let ctx = CallContext::new().timeout(Duration::from_secs(5));
//!     let response = client
//!         .post(
//!             &ctx,
//!             "https://api.example.com/v1/items",
//!             "application/json",
//!             r#"{"name":"demo"}"#,
//!             &[],
//!         )
//!         .await?;
//!     let item: Item = response.into_body().json().await?;
//!
//!     println!("created id={}", item.id);
//!     Ok(())
//! }
//! ```
//!
//! # Behavior
//!
//! - Every attempt gets its own timeout; the caller's [`CallContext`]
//!   (cancellation token and deadline) bounds the whole call and wins over
//!   any attempt error.
//! - Byte and reader bodies are replayed from memory; seekable bodies are
//!   rewound in place before every attempt.
//! - A successful response body keeps its attempt alive until it is dropped
//!   or closed.

mod attempt;
mod body;
mod client;
mod context;
mod error;
mod metrics;
mod options;
#[cfg(feature = "otel")]
mod otel;
mod retry;
mod timeout;
mod trace;
mod transport;
mod util;

pub use crate::body::{ReplaySource, ReqBody, RequestBody, ResBody, ResponseBody};
pub use crate::client::{Client, ClientBuilder};
pub use crate::context::CallContext;
pub use crate::error::{BoxError, Error, ErrorCode, TransportErrorKind};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::options::{
    ClientOption, DEFAULT_CLIENT_NAME, DEFAULT_MAX_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT, Options,
    with_retry_policy, with_span_carrier_injected, with_standard_retry_policy, with_tracing,
};
#[cfg(feature = "otel")]
pub use crate::otel::OtelTracer;
pub use crate::retry::{
    BackoffWithJitter, JitterSource, Limit, RetryPolicy, RetryStrategy, StrategyVerdict,
    binary_exponential, normal_jitter,
};
pub use crate::timeout::AttemptInfo;
pub use crate::trace::{
    CarrierError, EgressSpan, EgressTracer, NoopTracer, SpanContext, SpanOptions,
    TAG_ERROR, TAG_HTTP_ATTEMPT_COUNT, TAG_HTTP_METHOD, TAG_HTTP_STATUS_CODE, TAG_HTTP_URL,
    TraceValue, TracingOptions,
};
pub use crate::transport::{HyperTransport, Transport, TransportFuture, TransportSettings};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        CallContext, Client, ClientBuilder, ClientOption, Error, ErrorCode, RequestBody,
        ResponseBody, Result, RetryPolicy, SpanOptions, StrategyVerdict,
    };
}
