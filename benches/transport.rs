use std::hint::black_box;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use egress::prelude::{CallContext, Client, RequestBody};
use egress::{BoxError, ReqBody, Transport, TransportFuture, with_retry_policy};
use futures_util::future::join_all;
use http::header::CONTENT_LENGTH;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use tokio::runtime::Runtime;

/// Answers every request in memory, failing the first `failures_per_call`
/// attempts of each call.
#[derive(Clone)]
struct InMemoryTransport {
    failures_per_call: u32,
    seen: Arc<AtomicU32>,
}

impl InMemoryTransport {
    fn new(failures_per_call: u32) -> Self {
        Self {
            failures_per_call,
            seen: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl Transport for InMemoryTransport {
    fn send(&self, request: Request<ReqBody>) -> TransportFuture {
        let cycle = self.failures_per_call + 1;
        let position = self.seen.fetch_add(1, Ordering::Relaxed) % cycle;
        let fail = position < self.failures_per_call;
        Box::pin(async move {
            let payload = request.into_body().collect().await?.to_bytes();
            if fail {
                return Err(Box::new(std::io::Error::from(
                    std::io::ErrorKind::ConnectionReset,
                )) as BoxError);
            }
            let body = Full::new(Bytes::from(format!("{{\"received\":{}}}", payload.len())))
                .map_err(|never| -> BoxError { match never {} })
                .boxed_unsync();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(body)
                .map_err(|error| Box::new(error) as BoxError)?)
        })
    }
}

fn benchmark_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("build benchmark runtime")
}

fn benchmark_client(transport: InMemoryTransport, max_attempts: u32) -> Client {
    Client::builder()
        .transport(transport)
        .option(with_retry_policy(Duration::from_secs(2), max_attempts, []))
        .try_build()
        .expect("build benchmark client")
}

fn bench_small_get_latency(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let client = benchmark_client(InMemoryTransport::new(0), 1);

    let mut group = c.benchmark_group("small_get_latency");
    group.sample_size(80);
    group.bench_function("get_200_json", |b| {
        b.to_async(&runtime).iter(|| async {
            let response = client
                .get(&CallContext::new(), "http://bench.local/v1/ping", &[])
                .await
                .expect("small get request should succeed");
            black_box(response.into_body().bytes().await.expect("read body"));
        });
    });
    group.finish();
}

fn bench_retry_overhead(c: &mut Criterion) {
    let runtime = benchmark_runtime();

    let mut group = c.benchmark_group("retry_overhead");
    group.sample_size(60);
    for failures in [0_u32, 1, 4] {
        let client = benchmark_client(InMemoryTransport::new(failures), failures + 1);
        group.bench_with_input(
            BenchmarkId::from_parameter(failures),
            &failures,
            |b, _| {
                b.to_async(&runtime).iter(|| async {
                    let response = client
                        .get(&CallContext::new(), "http://bench.local/v1/flaky", &[])
                        .await
                        .expect("final attempt should succeed");
                    black_box(response.status());
                });
            },
        );
    }
    group.finish();
}

fn bench_concurrent_calls(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let client = benchmark_client(InMemoryTransport::new(0), 1);

    let mut group = c.benchmark_group("concurrent_calls");
    group.sample_size(40);
    for concurrency in [8_usize, 32, 64] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&runtime).iter(|| {
                    let client = client.clone();
                    async move {
                        let ctx = CallContext::new();
                        let calls = (0..concurrency)
                            .map(|_| client.get(&ctx, "http://bench.local/v1/ping", &[]));
                        for response in join_all(calls).await {
                            black_box(response.expect("concurrent call should succeed").status());
                        }
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_replayable_uploads(c: &mut Criterion) {
    const PAYLOAD_BYTES: usize = 256 * 1024;

    let runtime = benchmark_runtime();
    let client = benchmark_client(InMemoryTransport::new(1), 2);
    let payload = Bytes::from(vec![b'x'; PAYLOAD_BYTES]);

    let mut group = c.benchmark_group("replayable_upload_256k");
    group.sample_size(40);
    group.throughput(Throughput::Bytes(PAYLOAD_BYTES as u64));

    group.bench_function("buffered", |b| {
        b.to_async(&runtime).iter(|| {
            let client = client.clone();
            let payload = payload.clone();
            async move {
                let request = Request::builder()
                    .method(Method::POST)
                    .uri("http://bench.local/v1/upload")
                    .body(RequestBody::from(payload))
                    .expect("build buffered request");
                let response = client
                    .execute(&CallContext::new(), request, &[])
                    .await
                    .expect("buffered upload should succeed");
                black_box(response.status());
            }
        });
    });

    group.bench_function("seekable", |b| {
        b.to_async(&runtime).iter(|| {
            let client = client.clone();
            let payload = payload.clone();
            async move {
                let request = Request::builder()
                    .method(Method::PUT)
                    .uri("http://bench.local/v1/upload")
                    .header(CONTENT_LENGTH, PAYLOAD_BYTES)
                    .body(RequestBody::seekable(Cursor::new(payload)))
                    .expect("build seekable request");
                let response = client
                    .execute(&CallContext::new(), request, &[])
                    .await
                    .expect("seekable upload should succeed");
                black_box(response.status());
            }
        });
    });

    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_secs(2))
        .measurement_time(Duration::from_secs(8));
    targets = bench_small_get_latency, bench_retry_overhead, bench_concurrent_calls,
        bench_replayable_uploads
);
criterion_main!(benches);
