use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use egress::prelude::{CallContext, Client, ErrorCode};
use egress::{
    BoxError, CarrierError, EgressSpan, EgressTracer, NoopTracer, ReqBody, SpanContext,
    SpanOptions, TraceValue, Transport, TransportFuture, with_retry_policy, with_tracing,
};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};

type EventLog = Arc<Mutex<Vec<String>>>;

fn events(log: &EventLog) -> Vec<String> {
    log.lock().expect("lock events").clone()
}

#[derive(Clone)]
struct LoggingTracer {
    log: EventLog,
    next_id: Arc<AtomicUsize>,
}

struct LoggingSpan {
    log: EventLog,
    context: SpanContext,
}

impl LoggingTracer {
    fn new(log: &EventLog) -> Self {
        Self {
            log: Arc::clone(log),
            next_id: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl EgressTracer for LoggingTracer {
    fn start_span(&self, name: &str, _options: &SpanOptions) -> Box<dyn EgressSpan> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.log
            .lock()
            .expect("lock events")
            .push(format!("start {name}"));
        Box::new(LoggingSpan {
            log: Arc::clone(&self.log),
            context: SpanContext::new(format!("trace-{id}"), format!("span-{id}")),
        })
    }

    fn extract(&self, _headers: &HeaderMap) -> Result<SpanContext, CarrierError> {
        Err(CarrierError::NotFound)
    }
}

impl EgressSpan for LoggingSpan {
    fn log_fields(&mut self, fields: &[(&str, TraceValue)]) {
        let fields = fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        self.log
            .lock()
            .expect("lock events")
            .push(format!("log {fields}"));
    }

    fn set_tag(&mut self, key: &str, value: TraceValue) {
        self.log
            .lock()
            .expect("lock events")
            .push(format!("tag {key}={value}"));
    }

    fn inject(&self, _headers: &mut HeaderMap) -> Result<(), CarrierError> {
        Ok(())
    }

    fn context(&self) -> Option<SpanContext> {
        Some(self.context.clone())
    }

    fn finish(self: Box<Self>) {
        self.log.lock().expect("lock events").push("finish".to_owned());
    }
}

/// Fails the first `failures` sends, then answers 200. Every send is logged
/// together with the span context it received.
#[derive(Clone)]
struct LoggingTransport {
    log: EventLog,
    failures: u32,
    sends: Arc<AtomicU32>,
}

impl LoggingTransport {
    fn new(log: &EventLog, failures: u32) -> Self {
        Self {
            log: Arc::clone(log),
            failures,
            sends: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl Transport for LoggingTransport {
    fn send(&self, request: Request<ReqBody>) -> TransportFuture {
        let send = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        let span = match request.extensions().get::<SpanContext>() {
            Some(context) => format!("{}/{}", context.trace_id(), context.span_id()),
            None => "none".to_owned(),
        };
        self.log
            .lock()
            .expect("lock events")
            .push(format!("send {send} span={span}"));
        let fail = send <= self.failures;
        Box::pin(async move {
            if fail {
                return Err(Box::new(std::io::Error::from(
                    std::io::ErrorKind::ConnectionReset,
                )) as BoxError);
            }
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(
                    Full::new(Bytes::from_static(b"ok"))
                        .map_err(|never| -> BoxError { match never {} })
                        .boxed_unsync(),
                )
                .expect("response should build"))
        })
    }
}

fn traced_client<T>(transport: LoggingTransport, tracer: T, max_attempts: u32) -> Client
where
    T: EgressTracer + 'static,
{
    Client::builder()
        .transport(transport)
        .tracer(tracer)
        .option(with_retry_policy(Duration::from_secs(1), max_attempts, []))
        .option(with_tracing(true, "checkout", SpanOptions::new()))
        .try_build()
        .expect("client should build")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn span_records_each_attempt_before_its_send_and_tags_success() {
    let log = EventLog::default();
    let client = traced_client(LoggingTransport::new(&log, 1), LoggingTracer::new(&log), 3);

    let response = client
        .get(&CallContext::new(), "http://127.0.0.1:9/checkout", &[])
        .await
        .expect("second attempt should succeed");
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(
        events(&log),
        vec![
            "start HTTP Egress - checkout",
            "log attempt=1",
            "send 1 span=trace-1/span-1",
            "log attempt=2",
            "send 2 span=trace-1/span-1",
            "tag http.attempt_count=2",
            "tag http.status_code=200",
            "finish",
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_call_marks_span_as_error() {
    let log = EventLog::default();
    let client = traced_client(LoggingTransport::new(&log, 5), LoggingTracer::new(&log), 2);

    let error = client
        .get(&CallContext::new(), "http://127.0.0.1:9/checkout", &[])
        .await
        .expect_err("every attempt fails");
    assert_eq!(error.code(), ErrorCode::Transport);

    let recorded = events(&log);
    assert_eq!(recorded.len(), 9, "unexpected events: {recorded:?}");
    assert_eq!(
        recorded[..6],
        [
            "start HTTP Egress - checkout",
            "log attempt=1",
            "send 1 span=trace-1/span-1",
            "log attempt=2",
            "send 2 span=trace-1/span-1",
            "tag http.attempt_count=2",
        ]
    );
    assert!(recorded[6].starts_with("log event=error error.object="));
    assert_eq!(recorded[7], "tag error=true");
    assert_eq!(recorded[8], "finish");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn untraced_calls_send_no_span_context() {
    let log = EventLog::default();
    let client = traced_client(LoggingTransport::new(&log, 0), LoggingTracer::new(&log), 1);

    client
        .get(
            &CallContext::new(),
            "http://127.0.0.1:9/checkout",
            &[with_tracing(false, "", SpanOptions::new())],
        )
        .await
        .expect("request should succeed");
    assert_eq!(events(&log), vec!["send 1 span=none"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backends_without_context_send_none() {
    let log = EventLog::default();
    let client = traced_client(LoggingTransport::new(&log, 0), NoopTracer, 1);

    client
        .get(&CallContext::new(), "http://127.0.0.1:9/checkout", &[])
        .await
        .expect("request should succeed");
    assert_eq!(events(&log), vec!["send 1 span=none"]);
}
