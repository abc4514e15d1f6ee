use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

use crate::Result;
use crate::error::Error;

pub(crate) const SPAN_NAME: &str = "HTTP Egress";

pub const TAG_HTTP_METHOD: &str = "http.method";
pub const TAG_HTTP_URL: &str = "http.url";
pub const TAG_HTTP_STATUS_CODE: &str = "http.status_code";
pub const TAG_HTTP_ATTEMPT_COUNT: &str = "http.attempt_count";
pub const TAG_ERROR: &str = "error";

/// Value of a span tag or log field.
#[derive(Clone, Debug, PartialEq)]
pub enum TraceValue {
    Str(String),
    Bool(bool),
    I64(i64),
    U64(u64),
}

impl std::fmt::Display for TraceValue {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Str(value) => formatter.write_str(value),
            Self::Bool(value) => write!(formatter, "{value}"),
            Self::I64(value) => write!(formatter, "{value}"),
            Self::U64(value) => write!(formatter, "{value}"),
        }
    }
}

impl From<&str> for TraceValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for TraceValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for TraceValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for TraceValue {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<u64> for TraceValue {
    fn from(value: u64) -> Self {
        Self::U64(value)
    }
}

impl From<u32> for TraceValue {
    fn from(value: u32) -> Self {
        Self::U64(u64::from(value))
    }
}

impl From<u16> for TraceValue {
    fn from(value: u16) -> Self {
        Self::U64(u64::from(value))
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CarrierError {
    #[error("no span context found in carrier")]
    NotFound,
    #[error("invalid carrier header `{name}`: {message}")]
    InvalidHeader { name: String, message: String },
    #[error("tracer does not support carrier propagation")]
    Unsupported,
}

/// Identifiers of a span.
///
/// The receiving side recovers one from a carrier with
/// [`EgressTracer::extract`]. On the sending side every attempt request of a
/// traced call carries the call span's context as a request extension, so a
/// [`Transport`](crate::Transport) can parent its own spans on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanContext {
    trace_id: String,
    span_id: String,
}

impl SpanContext {
    pub fn new(trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }
}

/// Tracing backend used by the executor.
///
/// Only the narrow surface the executor needs: start a span, and read a
/// propagated context back out of request headers (the receiving side uses
/// this; the executor never calls it).
pub trait EgressTracer: Send + Sync {
    fn start_span(&self, name: &str, options: &SpanOptions) -> Box<dyn EgressSpan>;

    fn extract(&self, headers: &HeaderMap) -> std::result::Result<SpanContext, CarrierError>;
}

pub trait EgressSpan: Send {
    fn log_fields(&mut self, fields: &[(&str, TraceValue)]);

    fn set_tag(&mut self, key: &str, value: TraceValue);

    /// Writes this span's propagation headers into `headers`.
    fn inject(&self, headers: &mut HeaderMap) -> std::result::Result<(), CarrierError>;

    /// Context handed to the transport with each attempt. `None` when the
    /// backend has nothing to propagate.
    fn context(&self) -> Option<SpanContext>;

    fn finish(self: Box<Self>);
}

/// Tracer that records nothing. Injection writes no headers, so extraction on
/// the receiving side finds nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracer;

struct NoopSpan;

impl EgressTracer for NoopTracer {
    fn start_span(&self, _name: &str, _options: &SpanOptions) -> Box<dyn EgressSpan> {
        Box::new(NoopSpan)
    }

    fn extract(&self, _headers: &HeaderMap) -> std::result::Result<SpanContext, CarrierError> {
        Err(CarrierError::NotFound)
    }
}

impl EgressSpan for NoopSpan {
    fn log_fields(&mut self, _fields: &[(&str, TraceValue)]) {}

    fn set_tag(&mut self, _key: &str, _value: TraceValue) {}

    fn inject(&self, _headers: &mut HeaderMap) -> std::result::Result<(), CarrierError> {
        Ok(())
    }

    fn context(&self) -> Option<SpanContext> {
        None
    }

    fn finish(self: Box<Self>) {}
}

/// Extra tags attached to every span a call starts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpanOptions {
    tags: Vec<(String, TraceValue)>,
}

impl SpanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TraceValue>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn tags(&self) -> &[(String, TraceValue)] {
        &self.tags
    }

    pub(crate) fn with_request_tags(&self, method: &Method, url: &str) -> Self {
        let mut merged = self.clone();
        merged.tags.push((TAG_HTTP_METHOD.to_owned(), method.as_str().into()));
        merged.tags.push((TAG_HTTP_URL.to_owned(), url.into()));
        merged
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TracingOptions {
    pub(crate) enabled: bool,
    pub(crate) inject_carrier: bool,
    pub(crate) span_options: SpanOptions,
}

impl TracingOptions {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn inject_carrier(&self) -> bool {
        self.inject_carrier
    }

    pub fn span_options(&self) -> &SpanOptions {
        &self.span_options
    }
}

pub(crate) fn span_name(operation_name: Option<&str>) -> String {
    match operation_name {
        Some(operation) if !operation.is_empty() => format!("{SPAN_NAME} - {operation}"),
        _ => SPAN_NAME.to_owned(),
    }
}

/// The call's span, if tracing is enabled.
pub(crate) struct TracingScope {
    span: Option<Box<dyn EgressSpan>>,
}

impl TracingScope {
    pub(crate) fn disabled() -> Self {
        Self { span: None }
    }

    pub(crate) fn start(
        tracer: &dyn EgressTracer,
        options: &TracingOptions,
        operation_name: Option<&str>,
        method: &Method,
        redacted_url: &str,
        headers: &mut HeaderMap,
    ) -> Result<Self> {
        if !options.enabled {
            return Ok(Self::disabled());
        }

        let span_options = options.span_options.with_request_tags(method, redacted_url);
        let mut span = tracer.start_span(&span_name(operation_name), &span_options);
        if options.inject_carrier
            && let Err(source) = span.inject(headers)
        {
            span.set_tag(TAG_ERROR, true.into());
            span.finish();
            return Err(Error::TraceSetup { source });
        }
        Ok(Self { span: Some(span) })
    }

    #[cfg(test)]
    pub(crate) fn is_recording(&self) -> bool {
        self.span.is_some()
    }

    pub(crate) fn span_context(&self) -> Option<SpanContext> {
        self.span.as_ref().and_then(|span| span.context())
    }

    pub(crate) fn record_attempt(&mut self, attempt: u32) {
        if let Some(span) = self.span.as_mut() {
            span.log_fields(&[("attempt", attempt.into())]);
        }
    }

    pub(crate) fn finish_success(self, attempts: u32, status: StatusCode) {
        let Some(mut span) = self.span else {
            return;
        };
        span.set_tag(TAG_HTTP_ATTEMPT_COUNT, attempts.into());
        span.set_tag(TAG_HTTP_STATUS_CODE, status.as_u16().into());
        span.finish();
    }

    pub(crate) fn finish_error(self, attempts: u32, error: &Error) {
        let Some(mut span) = self.span else {
            return;
        };
        span.set_tag(TAG_HTTP_ATTEMPT_COUNT, attempts.into());
        span.log_fields(&[
            ("event", "error".into()),
            ("error.object", error.to_string().into()),
        ]);
        span.set_tag(TAG_ERROR, true.into());
        span.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use http::{HeaderMap, HeaderValue, Method, StatusCode};

    use super::{
        CarrierError, EgressSpan, EgressTracer, SpanContext, SpanOptions, TraceValue,
        TracingOptions, TracingScope, span_name,
    };
    use crate::error::Error;

    #[derive(Debug, PartialEq)]
    enum Recorded {
        Started(String, Vec<(String, TraceValue)>),
        Log(Vec<(String, TraceValue)>),
        Tag(String, TraceValue),
        Finished,
    }

    #[derive(Clone, Default)]
    struct RecordingTracer {
        events: Arc<Mutex<Vec<Recorded>>>,
        fail_inject: bool,
    }

    struct RecordingSpan {
        events: Arc<Mutex<Vec<Recorded>>>,
        fail_inject: bool,
    }

    impl EgressTracer for RecordingTracer {
        fn start_span(&self, name: &str, options: &SpanOptions) -> Box<dyn EgressSpan> {
            self.events
                .lock()
                .expect("lock events")
                .push(Recorded::Started(name.to_owned(), options.tags().to_vec()));
            Box::new(RecordingSpan {
                events: Arc::clone(&self.events),
                fail_inject: self.fail_inject,
            })
        }

        fn extract(&self, _headers: &HeaderMap) -> Result<SpanContext, CarrierError> {
            Err(CarrierError::NotFound)
        }
    }

    impl EgressSpan for RecordingSpan {
        fn log_fields(&mut self, fields: &[(&str, TraceValue)]) {
            let fields = fields
                .iter()
                .map(|(key, value)| ((*key).to_owned(), value.clone()))
                .collect();
            self.events
                .lock()
                .expect("lock events")
                .push(Recorded::Log(fields));
        }

        fn set_tag(&mut self, key: &str, value: TraceValue) {
            self.events
                .lock()
                .expect("lock events")
                .push(Recorded::Tag(key.to_owned(), value));
        }

        fn inject(&self, headers: &mut HeaderMap) -> Result<(), CarrierError> {
            if self.fail_inject {
                return Err(CarrierError::Unsupported);
            }
            headers.insert("x-trace", HeaderValue::from_static("abc"));
            Ok(())
        }

        fn context(&self) -> Option<SpanContext> {
            Some(SpanContext::new("abc", "1"))
        }

        fn finish(self: Box<Self>) {
            self.events
                .lock()
                .expect("lock events")
                .push(Recorded::Finished);
        }
    }

    fn enabled(inject_carrier: bool) -> TracingOptions {
        TracingOptions {
            enabled: true,
            inject_carrier,
            span_options: SpanOptions::new().tag("component", "billing"),
        }
    }

    #[test]
    fn span_name_includes_operation_when_present() {
        assert_eq!(span_name(None), "HTTP Egress");
        assert_eq!(span_name(Some("")), "HTTP Egress");
        assert_eq!(span_name(Some("charge")), "HTTP Egress - charge");
    }

    #[test]
    fn disabled_tracing_starts_nothing() {
        let tracer = RecordingTracer::default();
        let mut headers = HeaderMap::new();
        let scope = TracingScope::start(
            &tracer,
            &TracingOptions::default(),
            Some("op"),
            &Method::GET,
            "http://example.com/",
            &mut headers,
        )
        .expect("disabled scope");
        assert!(!scope.is_recording());
        assert_eq!(scope.span_context(), None);
        assert!(tracer.events.lock().expect("lock").is_empty());
        assert!(headers.is_empty());
    }

    #[test]
    fn successful_call_tags_span_and_injects_headers() {
        let tracer = RecordingTracer::default();
        let mut headers = HeaderMap::new();
        let mut scope = TracingScope::start(
            &tracer,
            &enabled(true),
            Some("charge"),
            &Method::POST,
            "http://example.com/pay",
            &mut headers,
        )
        .expect("scope");
        assert_eq!(scope.span_context(), Some(SpanContext::new("abc", "1")));
        scope.record_attempt(1);
        scope.record_attempt(2);
        scope.finish_success(2, StatusCode::CREATED);

        assert_eq!(headers.get("x-trace"), Some(&HeaderValue::from_static("abc")));
        let events = tracer.events.lock().expect("lock");
        assert_eq!(
            events[0],
            Recorded::Started(
                "HTTP Egress - charge".to_owned(),
                vec![
                    ("component".to_owned(), TraceValue::from("billing")),
                    ("http.method".to_owned(), TraceValue::from("POST")),
                    ("http.url".to_owned(), TraceValue::from("http://example.com/pay")),
                ]
            )
        );
        assert_eq!(
            events[1],
            Recorded::Log(vec![("attempt".to_owned(), TraceValue::U64(1))])
        );
        assert_eq!(
            events[3],
            Recorded::Tag("http.attempt_count".to_owned(), TraceValue::U64(2))
        );
        assert_eq!(
            events[4],
            Recorded::Tag("http.status_code".to_owned(), TraceValue::U64(201))
        );
        assert_eq!(events[5], Recorded::Finished);
    }

    #[test]
    fn failed_call_marks_span_as_error() {
        let tracer = RecordingTracer::default();
        let mut headers = HeaderMap::new();
        let scope = TracingScope::start(
            &tracer,
            &enabled(false),
            None,
            &Method::GET,
            "http://example.com/",
            &mut headers,
        )
        .expect("scope");
        let error = Error::Cancelled {
            method: Method::GET,
            uri: "http://example.com/".to_owned(),
        };
        scope.finish_error(3, &error);

        assert!(headers.is_empty());
        let events = tracer.events.lock().expect("lock");
        assert!(events.contains(&Recorded::Tag("error".to_owned(), TraceValue::Bool(true))));
        assert!(events.contains(&Recorded::Log(vec![
            ("event".to_owned(), TraceValue::from("error")),
            ("error.object".to_owned(), TraceValue::from(error.to_string())),
        ])));
        assert_eq!(events.last(), Some(&Recorded::Finished));
    }

    #[test]
    fn injection_failure_is_a_trace_setup_error() {
        let tracer = RecordingTracer {
            fail_inject: true,
            ..RecordingTracer::default()
        };
        let mut headers = HeaderMap::new();
        let result = TracingScope::start(
            &tracer,
            &enabled(true),
            None,
            &Method::GET,
            "http://example.com/",
            &mut headers,
        );
        let Err(error) = result else {
            panic!("injection failure must fail the call");
        };
        assert_eq!(error.code().as_str(), "trace_setup");
        assert_eq!(
            tracer.events.lock().expect("lock").last(),
            Some(&Recorded::Finished)
        );
    }
}
