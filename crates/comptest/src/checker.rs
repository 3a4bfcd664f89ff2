//! The readiness-probe contract.
//!
//! A [`Checker`] answers one question: "can I reach dependency X right
//! now?". Implementations are stateless values (an address, connection
//! parameters) that are cheap to construct per use. The harness never
//! interprets *how* a dependency is probed; it only retries failed attempts
//! and aborts them through the [`CheckContext`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CheckError;

/// A single unit of readiness probing.
#[async_trait]
pub trait Checker: Send + Sync {
    /// Probe the dependency once.
    ///
    /// Implementations should bound their own I/O by `ctx` (see
    /// [`CheckContext::done`]); the retry engine also races every attempt
    /// against the context, so a probe that ignores it is abandoned rather
    /// than awaited past the deadline.
    async fn check(&self, ctx: &CheckContext) -> Result<(), CheckError>;

    /// Human-readable description for diagnostics, e.g. `[TCPCheck: db:5432]`.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Why a [`CheckContext`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cancellation token was triggered.
    Cancelled,
    /// The deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// Cancellation signal plus an optional deadline, shared by every probe of
/// one readiness sweep.
///
/// Passing the deadline is treated exactly like cancelling the token.
#[derive(Debug, Clone)]
pub struct CheckContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CheckContext {
    /// A context that stops only when `token` is cancelled.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn with_deadline(token: CancellationToken, deadline: Instant) -> Self {
        Self {
            token,
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(token: CancellationToken, timeout: Duration) -> Self {
        Self::with_deadline(token, Instant::now() + timeout)
    }

    /// Derive a context whose token is a child of this one.
    ///
    /// Cancelling the child leaves the parent untouched; cancelling the
    /// parent stops the child. The deadline is inherited.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// `Some` once the context has stopped. Cancellation wins over expiry.
    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.token.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.stop_reason().is_some()
    }

    /// Resolves when the token is cancelled or the deadline passes.
    pub async fn done(&self) -> StopReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => StopReason::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => StopReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                StopReason::Cancelled
            }
        }
    }
}

/// A [`Checker`] backed by an async closure.
pub struct FnChecker<F> {
    name: String,
    probe: F,
}

/// Build a checker from a name and an async closure.
///
/// ```no_run
/// use comptest::{from_fn, CheckError};
///
/// let ready = from_fn("[FileCheck: ./ready]", || async {
///     if std::path::Path::new("./ready").exists() {
///         Ok(())
///     } else {
///         Err(CheckError::not_ready("marker file missing"))
///     }
/// });
/// ```
pub fn from_fn<F, Fut>(name: impl Into<String>, probe: F) -> FnChecker<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CheckError>> + Send,
{
    FnChecker {
        name: name.into(),
        probe,
    }
}

#[async_trait]
impl<F, Fut> Checker for FnChecker<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CheckError>> + Send,
{
    async fn check(&self, _ctx: &CheckContext) -> Result<(), CheckError> {
        (self.probe)().await
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

impl<F> fmt::Debug for FnChecker<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnChecker").field("name", &self.name).finish()
    }
}
