use std::future::Future;
use std::time::Duration;

use http::Method;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Caller-owned cancellation scope for one call.
///
/// A call ends early when its token is cancelled or its deadline passes; every
/// attempt of the call derives its own context from this one.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Cancelled,
    DeadlineExceeded,
    AttemptTimeout,
    Released,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Tightens the deadline to `now + timeout`; a looser value never widens it.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Instant::now() + timeout)
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline_at(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub(crate) fn interrupt_now(&self) -> Option<Interrupt> {
        if self.token.is_cancelled() {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupt::DeadlineExceeded),
            _ => None,
        }
    }

    pub(crate) async fn interrupted(&self) -> Interrupt {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Interrupt::Cancelled,
            () = sleep_until_opt(self.deadline) => Interrupt::DeadlineExceeded,
        }
    }

    pub(crate) async fn run<F>(&self, future: F) -> Result<F::Output, Interrupt>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            interrupt = self.interrupted() => Err(interrupt),
            output = future => Ok(output),
        }
    }
}

pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(crate) fn call_interrupt_error(interrupt: Interrupt, method: &Method, uri: &str) -> Error {
    match interrupt {
        Interrupt::DeadlineExceeded => Error::DeadlineExceeded {
            method: method.clone(),
            uri: uri.to_owned(),
        },
        _ => Error::Cancelled {
            method: method.clone(),
            uri: uri.to_owned(),
        },
    }
}
