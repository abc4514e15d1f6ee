use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::context::{CallContext, Interrupt, sleep_until_opt};

/// Attempt metadata attached to every outgoing request as an extension.
///
/// Transports that can abort work early should watch `cancellation()`. With
/// a non-zero per-attempt timeout it is a child of the call token and fires
/// when the call is cancelled or the attempt is released. With a zero timeout
/// it is the call's own token: releasing the attempt does not fire it, and
/// `deadline()` is `None`.
#[derive(Clone, Debug)]
pub struct AttemptInfo {
    attempt: u32,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl AttemptInfo {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[derive(Clone, Debug)]
pub(crate) struct AttemptContext {
    call: CallContext,
    token: CancellationToken,
    deadline: Option<Instant>,
    timeout: Duration,
    attempt: u32,
}

/// Releases the attempt's cancellation scope when dropped.
pub(crate) struct AttemptRelease {
    guard: Option<DropGuard>,
}

impl AttemptRelease {
    pub(crate) fn release(mut self) {
        drop(self.guard.take());
    }
}

pub(crate) struct AttemptScope;

impl AttemptScope {
    pub(crate) fn begin(
        call: &CallContext,
        timeout: Duration,
        attempt: u32,
    ) -> (AttemptContext, AttemptRelease) {
        if timeout.is_zero() {
            let context = AttemptContext {
                call: call.clone(),
                token: call.cancellation_token().clone(),
                deadline: None,
                timeout,
                attempt,
            };
            return (context, AttemptRelease { guard: None });
        }

        let token = call.child_token();
        let context = AttemptContext {
            call: call.clone(),
            token: token.clone(),
            deadline: Some(Instant::now() + timeout),
            timeout,
            attempt,
        };
        let release = AttemptRelease {
            guard: Some(token.drop_guard()),
        };
        (context, release)
    }
}

impl AttemptContext {
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn info(&self) -> AttemptInfo {
        AttemptInfo {
            attempt: self.attempt,
            cancellation: self.token.clone(),
            deadline: self.deadline,
        }
    }

    pub(crate) async fn interrupted(&self) -> Interrupt {
        tokio::select! {
            biased;
            interrupt = self.call.interrupted() => interrupt,
            () = self.token.cancelled() => Interrupt::Released,
            () = sleep_until_opt(self.deadline) => Interrupt::AttemptTimeout,
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
