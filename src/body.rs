use std::convert::Infallible;
use std::future::{Future, poll_fn};
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use http_body_util::combinators::{BoxBody, UnsyncBoxBody};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, ReadBuf};

use crate::Result;
use crate::context::{Interrupt, call_interrupt_error};
use crate::error::{BoxError, Error};
use crate::timeout::{AttemptContext, AttemptRelease};
use crate::util::lock_unpoisoned;

/// Body type handed to a [`Transport`](crate::Transport) for one attempt.
pub type ReqBody = BoxBody<Bytes, BoxError>;
/// Body type a [`Transport`](crate::Transport) answers with.
pub type ResBody = UnsyncBoxBody<Bytes, BoxError>;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// A request body source that can be repositioned and read again.
pub trait ReplaySource: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T> ReplaySource for T where T: AsyncRead + AsyncSeek + Send + Unpin + ?Sized {}

/// Request payload as supplied by the caller.
///
/// Seekable sources are replayed in place. Plain readers are drained into
/// memory once, before the first attempt, and dropped.
#[derive(Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    Seekable(Box<dyn ReplaySource>),
}

impl RequestBody {
    pub fn empty() -> Self {
        Self::Empty
    }

    pub fn reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::Reader(Box::new(reader))
    }

    pub fn seekable<S>(source: S) -> Self
    where
        S: ReplaySource + 'static,
    {
        Self::Seekable(Box::new(source))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("RequestBody::Empty"),
            Self::Bytes(bytes) => formatter
                .debug_tuple("RequestBody::Bytes")
                .field(&bytes.len())
                .finish(),
            Self::Reader(_) => formatter.write_str("RequestBody::Reader(..)"),
            Self::Seekable(_) => formatter.write_str("RequestBody::Seekable(..)"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<&'static str> for RequestBody {
    fn from(value: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(value.as_bytes()))
    }
}

impl From<&'static [u8]> for RequestBody {
    fn from(value: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(value))
    }
}

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

struct SeekableState {
    source: Option<Box<dyn ReplaySource>>,
    generation: u64,
}

enum Replay {
    Empty,
    Buffered(Bytes),
    Seekable(Arc<Mutex<SeekableState>>),
}

/// The call's single copy of the request payload.
///
/// Dropping it drops the underlying source, so a source is closed exactly once
/// per call no matter how many attempts read from it.
pub(crate) struct ReplayableBody {
    replay: Replay,
}

impl ReplayableBody {
    pub(crate) async fn capture(body: RequestBody) -> io::Result<Self> {
        let replay = match body {
            RequestBody::Empty => Replay::Empty,
            RequestBody::Bytes(bytes) => Replay::Buffered(bytes),
            RequestBody::Seekable(source) => Replay::Seekable(Arc::new(Mutex::new(SeekableState {
                source: Some(source),
                generation: 0,
            }))),
            RequestBody::Reader(mut reader) => {
                let mut buffer = Vec::new();
                reader.read_to_end(&mut buffer).await?;
                drop(reader);
                Replay::Buffered(Bytes::from(buffer))
            }
        };
        Ok(Self { replay })
    }

    #[cfg(test)]
    pub(crate) fn is_present(&self) -> bool {
        !matches!(self.replay, Replay::Empty)
    }

    /// Positions the payload at offset zero and retires bodies handed to
    /// earlier attempts.
    pub(crate) async fn rewind(&self) -> io::Result<()> {
        let Replay::Seekable(state) = &self.replay else {
            return Ok(());
        };

        {
            let mut guard = lock_unpoisoned(state);
            guard.generation = guard.generation.wrapping_add(1);
            let Some(source) = guard.source.as_mut() else {
                return Err(io::Error::other("request body is already closed"));
            };
            Pin::new(source).start_seek(SeekFrom::Start(0))?;
        }

        let position = poll_fn(|cx| {
            let mut guard = lock_unpoisoned(state);
            match guard.source.as_mut() {
                Some(source) => Pin::new(source).poll_complete(cx),
                None => Poll::Ready(Err(io::Error::other("request body is already closed"))),
            }
        })
        .await?;

        if position != 0 {
            return Err(io::Error::other(format!(
                "request body rewound to offset {position} instead of 0"
            )));
        }
        Ok(())
    }

    pub(crate) fn attempt_body(&self) -> ReqBody {
        match &self.replay {
            Replay::Empty => Empty::<Bytes>::new()
                .map_err(map_infallible_to_box_error)
                .boxed(),
            Replay::Buffered(bytes) => Full::new(bytes.clone())
                .map_err(map_infallible_to_box_error)
                .boxed(),
            Replay::Seekable(state) => {
                let generation = lock_unpoisoned(state).generation;
                SeekableAttemptBody {
                    state: Arc::clone(state),
                    generation,
                    finished: false,
                }
                .boxed()
            }
        }
    }
}

impl Drop for ReplayableBody {
    fn drop(&mut self) {
        if let Replay::Seekable(state) = &self.replay {
            drop(lock_unpoisoned(state).source.take());
        }
    }
}

struct SeekableAttemptBody {
    state: Arc<Mutex<SeekableState>>,
    generation: u64,
    finished: bool,
}

impl SeekableAttemptBody {
    fn fail(&mut self, message: &'static str) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        self.finished = true;
        Poll::Ready(Some(Err(Box::new(io::Error::other(message)))))
    }
}

impl Body for SeekableAttemptBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }

        let state = Arc::clone(&this.state);
        let mut guard = lock_unpoisoned(&state);
        if guard.generation != this.generation {
            return this.fail("request body was superseded by a later attempt");
        }
        let Some(source) = guard.source.as_mut() else {
            return this.fail("request body is already closed");
        };

        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        let mut buffer = ReadBuf::new(&mut chunk);
        match Pin::new(source).poll_read(cx, &mut buffer) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(error)) => {
                this.finished = true;
                Poll::Ready(Some(Err(Box::new(error))))
            }
            Poll::Ready(Ok(())) => {
                let filled = buffer.filled();
                if filled.is_empty() {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Ok(Frame::data(Bytes::copy_from_slice(filled)))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }
}

type InterruptFuture = Pin<Box<dyn Future<Output = Interrupt> + Send>>;

/// Body of a successful response.
///
/// Owns the release of the attempt that produced it: the attempt's scope stays
/// alive, and its deadline keeps bounding reads, until this body is dropped or
/// [`close`](Self::close)d.
pub struct ResponseBody {
    inner: ResBody,
    interrupt: Option<InterruptFuture>,
    release: Option<AttemptRelease>,
    method: Method,
    uri: String,
    attempt: u32,
    timeout: Duration,
    done: bool,
}

impl ResponseBody {
    pub(crate) fn new(
        inner: ResBody,
        context: AttemptContext,
        release: AttemptRelease,
        method: Method,
        uri: String,
    ) -> Self {
        let attempt = context.attempt();
        let timeout = context.timeout();
        Self {
            inner,
            interrupt: Some(Box::pin(async move { context.interrupted().await })),
            release: Some(release),
            method,
            uri,
            attempt,
            timeout,
            done: false,
        }
    }

    pub async fn bytes(self) -> Result<Bytes> {
        let collected = BodyExt::collect(self).await.map_err(unbox_body_error)?;
        Ok(collected.to_bytes())
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T>(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| Error::Deserialize { source })
    }

    /// Ends the response and releases the attempt that produced it.
    pub fn close(mut self) {
        if let Some(release) = self.release.take() {
            release.release();
        }
    }

    fn interrupt_error(&self, interrupt: Interrupt) -> Error {
        match interrupt {
            Interrupt::AttemptTimeout => Error::Timeout {
                timeout_ms: self.timeout.as_millis(),
                attempt: self.attempt,
                method: self.method.clone(),
                uri: self.uri.clone(),
            },
            other => call_interrupt_error(other, &self.method, &self.uri),
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseBody")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("attempt", &self.attempt)
            .field("released", &self.release.is_none())
            .finish_non_exhaustive()
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        if let Some(interrupt) = this.interrupt.as_mut()
            && let Poll::Ready(interrupt) = interrupt.as_mut().poll(cx)
        {
            this.interrupt = None;
            if interrupt != Interrupt::Released {
                this.done = true;
                return Poll::Ready(Some(Err(Box::new(this.interrupt_error(interrupt)))));
            }
        }

        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(None) = polled {
            this.done = true;
            this.interrupt = None;
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn unbox_body_error(source: BoxError) -> Error {
    match source.downcast::<Error>() {
        Ok(error) => *error,
        Err(source) => Error::ReadBody { source },
    }
}
