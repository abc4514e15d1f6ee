use std::sync::Arc;
use std::time::Instant;

use http::header::CONTENT_TYPE;
use http::{Method, Request, Response, Uri};
use tracing::debug;

use crate::Result;
use crate::attempt::AttemptLoop;
use crate::body::{ReplayableBody, RequestBody, ResponseBody};
use crate::context::{CallContext, call_interrupt_error};
use crate::error::Error;
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::options::{
    ClientOption, DEFAULT_CLIENT_NAME, DEFAULT_MAX_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT, Options,
};
use crate::retry::{JitterSource, RetryPolicy};
use crate::trace::{EgressTracer, TracingScope};
use crate::transport::{HyperTransport, Transport};
use crate::util::redact_uri_for_logs;

pub struct ClientBuilder {
    options: Vec<ClientOption>,
    transport: Option<Arc<dyn Transport>>,
    tracer: Option<Arc<dyn EgressTracer>>,
    jitter: Option<JitterSource>,
    client_name: String,
    metrics_enabled: bool,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientBuilder")
            .field("options", &self.options.len())
            .field("custom_transport", &self.transport.is_some())
            .field("custom_tracer", &self.tracer.is_some())
            .field("client_name", &self.client_name)
            .field("metrics_enabled", &self.metrics_enabled)
            .finish_non_exhaustive()
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            options: Vec::new(),
            transport: None,
            tracer: None,
            jitter: None,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            metrics_enabled: false,
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn option(mut self, option: ClientOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn options<I>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = ClientOption>,
    {
        self.options.extend(options);
        self
    }

    pub fn transport<T>(mut self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn tracer<T>(mut self, tracer: T) -> Self
    where
        T: EgressTracer + 'static,
    {
        self.tracer = Some(Arc::new(tracer));
        self
    }

    /// Seeds the client's jitter generator, making retry delays reproducible.
    pub fn jitter_seed(mut self, seed: u64) -> Self {
        self.jitter = Some(JitterSource::seeded(seed));
        self
    }

    pub fn jitter_source(mut self, jitter: JitterSource) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn try_build(self) -> Result<Client> {
        let jitter = self.jitter.unwrap_or_default();
        let mut options = Options::default();
        options.apply(&self.options, &jitter);
        let options = options.with_default_policy(&jitter);

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new()?),
        };
        let tracer = self.tracer.unwrap_or_else(default_tracer);
        let metrics = if self.metrics_enabled {
            ClientMetrics::enabled()
        } else {
            ClientMetrics::disabled()
        };

        Ok(Client {
            options: Arc::new(options),
            jitter,
            transport,
            tracer,
            client_name: Arc::from(self.client_name),
            metrics,
        })
    }

    pub fn build(self) -> Client {
        match self.try_build() {
            Ok(client) => client,
            Err(error) => panic!(
                "failed to build egress client: {error}; use try_build() to handle configuration errors"
            ),
        }
    }
}

#[cfg(feature = "otel")]
fn default_tracer() -> Arc<dyn EgressTracer> {
    Arc::new(crate::otel::OtelTracer::global())
}

#[cfg(not(feature = "otel"))]
fn default_tracer() -> Arc<dyn EgressTracer> {
    Arc::new(crate::trace::NoopTracer)
}

/// Resilient HTTP executor.
///
/// Cloning is cheap; clones share the transport, tracer, jitter source and
/// metrics.
#[derive(Clone)]
pub struct Client {
    options: Arc<Options>,
    jitter: JitterSource,
    transport: Arc<dyn Transport>,
    tracer: Arc<dyn EgressTracer>,
    client_name: Arc<str>,
    metrics: ClientMetrics,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("client_name", &self.client_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Client over the default hyper transport with `options` applied in
    /// order on top of the defaults.
    pub fn new<I>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = ClientOption>,
    {
        ClientBuilder::new().options(options).try_build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Sends `request`, retrying per the effective retry policy.
    ///
    /// `options` apply to this call only, on top of the client's options. On
    /// success the caller owns the response body and must drop or
    /// [`close`](ResponseBody::close) it; doing so ends the attempt that
    /// produced it.
    pub async fn execute(
        &self,
        ctx: &CallContext,
        request: Request<RequestBody>,
        options: &[ClientOption],
    ) -> Result<Response<ResponseBody>> {
        let started = Instant::now();
        let _in_flight = self.metrics.enter_call();
        let result = self.execute_call(ctx, request, options).await;
        match &result {
            Ok(response) => self
                .metrics
                .record_call_succeeded(response.status(), started.elapsed()),
            Err(error) => self.metrics.record_call_failed(error, started.elapsed()),
        }
        result
    }

    pub async fn get(
        &self,
        ctx: &CallContext,
        uri: &str,
        options: &[ClientOption],
    ) -> Result<Response<ResponseBody>> {
        let request = build_request(Method::GET, uri, None, RequestBody::Empty)?;
        self.execute(ctx, request, options).await
    }

    pub async fn head(
        &self,
        ctx: &CallContext,
        uri: &str,
        options: &[ClientOption],
    ) -> Result<Response<ResponseBody>> {
        let request = build_request(Method::HEAD, uri, None, RequestBody::Empty)?;
        self.execute(ctx, request, options).await
    }

    pub async fn post(
        &self,
        ctx: &CallContext,
        uri: &str,
        content_type: &str,
        body: impl Into<RequestBody>,
        options: &[ClientOption],
    ) -> Result<Response<ResponseBody>> {
        let request = build_request(Method::POST, uri, Some(content_type), body.into())?;
        self.execute(ctx, request, options).await
    }

    fn call_options(&self, options: &[ClientOption]) -> Options {
        if options.is_empty() {
            return self.options.as_ref().clone();
        }
        let mut merged = self.options.as_ref().clone();
        merged.apply(options, &self.jitter);
        merged
    }

    async fn execute_call(
        &self,
        ctx: &CallContext,
        request: Request<RequestBody>,
        options: &[ClientOption],
    ) -> Result<Response<ResponseBody>> {
        let options = self.call_options(options);
        let policy = match options.retry_policy() {
            Some(policy) => policy.clone(),
            None => RetryPolicy::standard(DEFAULT_REQUEST_TIMEOUT, DEFAULT_MAX_ATTEMPTS, &self.jitter),
        };

        let (mut parts, body) = request.into_parts();
        let redacted_uri = redact_uri_for_logs(&parts.uri);
        let body = match ctx.run(ReplayableBody::capture(body)).await {
            Ok(Ok(body)) => body,
            Ok(Err(source)) => return Err(Error::BodyPrepare { source }),
            Err(interrupt) => {
                return Err(call_interrupt_error(interrupt, &parts.method, &redacted_uri));
            }
        };

        let mut tracing = TracingScope::start(
            self.tracer.as_ref(),
            options.tracing(),
            options.operation_name(),
            &parts.method,
            &redacted_uri,
            &mut parts.headers,
        )?;

        let method = parts.method.clone();
        let attempt_loop = AttemptLoop {
            client_name: &self.client_name,
            transport: self.transport.as_ref(),
            policy: &policy,
            metrics: &self.metrics,
            method: &method,
            redacted_uri: &redacted_uri,
        };
        let outcome = attempt_loop.run(ctx, &parts, &body, &mut tracing).await;

        match &outcome.result {
            Ok(response) => {
                debug!(
                    method = %method,
                    uri = %redacted_uri,
                    status = response.status().as_u16(),
                    attempts = outcome.attempts,
                    "request completed"
                );
                tracing.finish_success(outcome.attempts, response.status());
            }
            Err(error) => {
                debug!(
                    method = %method,
                    uri = %redacted_uri,
                    attempts = outcome.attempts,
                    error_code = error.code().as_str(),
                    "request failed"
                );
                tracing.finish_error(outcome.attempts, error);
            }
        }
        drop(body);
        outcome.result
    }
}

fn build_request(
    method: Method,
    uri: &str,
    content_type: Option<&str>,
    body: RequestBody,
) -> Result<Request<RequestBody>> {
    let parsed = uri.parse::<Uri>().map_err(|_| Error::InvalidUri {
        uri: uri.to_owned(),
    })?;
    if parsed.scheme().is_none() || parsed.authority().is_none() {
        return Err(Error::InvalidUri {
            uri: uri.to_owned(),
        });
    }

    let mut builder = Request::builder().method(method).uri(parsed);
    if let Some(content_type) = content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder
        .body(body)
        .map_err(|source| Error::RequestBuild { source })
}
