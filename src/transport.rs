use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::Result;
use crate::body::{ReqBody, ResBody};
use crate::error::BoxError;
#[cfg(feature = "tls-rustls-ring")]
use crate::error::Error;

/// Future returned by [`Transport::send`].
pub type TransportFuture =
    BoxFuture<'static, std::result::Result<Response<ResBody>, BoxError>>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Sends one HTTP request and yields its response head.
///
/// The executor races every call to `send` against the attempt's timeout and
/// the caller's cancellation, dropping the future when either fires. Each
/// request carries an [`AttemptInfo`](crate::AttemptInfo) extension for
/// transports that want to observe cancellation themselves.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request<ReqBody>) -> TransportFuture;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn send(&self, request: Request<ReqBody>) -> TransportFuture {
        (**self).send(request)
    }
}

/// Connection settings for [`HyperTransport`].
#[derive(Clone, Debug)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub http2_only: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            http2_only: false,
        }
    }
}

#[cfg(feature = "tls-rustls-ring")]
type Connector = hyper_rustls::HttpsConnector<HttpConnector>;
#[cfg(not(feature = "tls-rustls-ring"))]
type Connector = HttpConnector;

/// Pooled hyper client. Speaks HTTPS through rustls when the
/// `tls-rustls-ring` feature is enabled, plain HTTP otherwise.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<Connector, ReqBody>,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn new() -> Result<Self> {
        Self::with_settings(&TransportSettings::default())
    }

    pub fn with_settings(settings: &TransportSettings) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(settings.connect_timeout));
        http.enforce_http(false);
        let connector = build_connector(http)?;
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(settings.pool_idle_timeout)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .http2_only(settings.http2_only)
            .build(connector);
        Ok(Self { client })
    }
}

#[cfg(feature = "tls-rustls-ring")]
fn build_connector(http: HttpConnector) -> Result<Connector> {
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|source| Error::TlsInit {
            message: source.to_string(),
        })?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);
    Ok(connector)
}

#[cfg(not(feature = "tls-rustls-ring"))]
fn build_connector(http: HttpConnector) -> Result<Connector> {
    Ok(http)
}

impl Transport for HyperTransport {
    fn send(&self, request: Request<ReqBody>) -> TransportFuture {
        let pending = self.client.request(request);
        Box::pin(async move {
            let response = pending.await.map_err(|error| Box::new(error) as BoxError)?;
            Ok(response.map(|body| {
                body.map_err(|error| Box::new(error) as BoxError)
                    .boxed_unsync()
            }))
        })
    }
}
