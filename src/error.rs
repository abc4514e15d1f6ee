use http::Method;
use thiserror::Error;

use crate::trace::CarrierError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    RequestBuild,
    BodyPrepare,
    BodyRewind,
    TraceSetup,
    Transport,
    Timeout,
    Cancelled,
    DeadlineExceeded,
    ReadBody,
    Deserialize,
    TlsInit,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::RequestBuild => "request_build",
            Self::BodyPrepare => "body_prepare",
            Self::BodyRewind => "body_rewind",
            Self::TraceSetup => "trace_setup",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::ReadBody => "read_body",
            Self::Deserialize => "deserialize",
            Self::TlsInit => "tls_init",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("failed to prepare request body: {source}")]
    BodyPrepare {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to rewind request body before attempt {attempt}: {source}")]
    BodyRewind {
        attempt: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start and inject tracing span: {source}")]
    TraceSetup {
        #[source]
        source: CarrierError,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http attempt {attempt} timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        attempt: u32,
        method: Method,
        uri: String,
    },
    #[error("http request cancelled for {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("http request deadline exceeded for {method} {uri}")]
    DeadlineExceeded { method: Method, uri: String },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("failed to decode response json: {source}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to initialize tls transport: {message}")]
    TlsInit { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::BodyPrepare { .. } => ErrorCode::BodyPrepare,
            Self::BodyRewind { .. } => ErrorCode::BodyRewind,
            Self::TraceSetup { .. } => ErrorCode::TraceSetup,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::TlsInit { .. } => ErrorCode::TlsInit,
        }
    }

    /// True when the caller's own context ended the call.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::DeadlineExceeded { .. })
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
