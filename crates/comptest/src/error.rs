//! Error types for the comptest harness.

use std::io;

use thiserror::Error;

use crate::checker::StopReason;

/// Result type alias for harness operations.
pub type ComptestResult<T> = Result<T, ComptestError>;

/// Top-level errors surfaced by [`Comptest`](crate::Comptest).
///
/// Every variant is fatal for the run. By the time one reaches the caller
/// the subprocess (if any was started) has already been torn down.
#[derive(Debug, Error)]
pub enum ComptestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to build binary: {0}")]
    Build(#[from] BuildError),

    #[error("failed to run binary: {0}")]
    Process(#[from] ProcessError),

    #[error("failed to check readiness: {0}")]
    Readiness(#[from] ReadinessError),

    #[error("tests failed: {0:#}")]
    Tests(anyhow::Error),
}

/// Failure reported by a single [`Checker`](crate::Checker) attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    /// The dependency is not reachable yet. Retried.
    #[error("{0}")]
    NotReady(String),

    /// The probe hit a condition retrying cannot fix. Not retried.
    #[error("{0} (terminal)")]
    Terminal(String),
}

impl CheckError {
    pub fn not_ready(message: impl Into<String>) -> Self {
        CheckError::NotReady(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        CheckError::Terminal(message.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckError::Terminal(_))
    }
}

/// Why a retry loop gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} after {attempts} attempt(s)")]
pub struct RetryError {
    /// Number of probe invocations made, including the failing one.
    pub attempts: u32,
    pub kind: RetryErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryErrorKind {
    #[error("terminal failure: {0}")]
    Terminal(CheckError),

    /// The context was cancelled or its deadline passed.
    #[error("{reason}{}", last_suffix(.last))]
    Stopped {
        reason: StopReason,
        last: Option<CheckError>,
    },

    /// The policy's max elapsed time was reached.
    #[error("max elapsed time reached: {last}")]
    Exhausted { last: CheckError },
}

/// Errors produced by the readiness barrier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadinessError {
    #[error("no readiness checkers supplied")]
    NoCheckers,

    #[error("check {checker} failed after {attempts} attempt(s): {reason}")]
    CheckFailed {
        checker: String,
        attempts: u32,
        reason: CheckError,
    },

    #[error("check {checker} timed out after {attempts} attempt(s){}", last_suffix(.last))]
    TimedOut {
        checker: String,
        attempts: u32,
        last: Option<CheckError>,
    },

    #[error("check {checker} cancelled after {attempts} attempt(s){}", last_suffix(.last))]
    Cancelled {
        checker: String,
        attempts: u32,
        last: Option<CheckError>,
    },

    #[error("check {checker} gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        checker: String,
        attempts: u32,
        last: CheckError,
    },

    #[error("check {checker} panicked")]
    Panicked { checker: String },
}

impl ReadinessError {
    /// Description of the checker the failure is attributed to.
    pub fn checker(&self) -> Option<&str> {
        match self {
            ReadinessError::NoCheckers => None,
            ReadinessError::CheckFailed { checker, .. }
            | ReadinessError::TimedOut { checker, .. }
            | ReadinessError::Cancelled { checker, .. }
            | ReadinessError::Exhausted { checker, .. }
            | ReadinessError::Panicked { checker } => Some(checker),
        }
    }

    pub(crate) fn from_retry(checker: String, err: RetryError) -> Self {
        let attempts = err.attempts;
        match err.kind {
            RetryErrorKind::Terminal(reason) => ReadinessError::CheckFailed {
                checker,
                attempts,
                reason,
            },
            RetryErrorKind::Stopped {
                reason: StopReason::DeadlineExceeded,
                last,
            } => ReadinessError::TimedOut {
                checker,
                attempts,
                last,
            },
            RetryErrorKind::Stopped {
                reason: StopReason::Cancelled,
                last,
            } => ReadinessError::Cancelled {
                checker,
                attempts,
                last,
            },
            RetryErrorKind::Exhausted { last } => ReadinessError::Exhausted {
                checker,
                attempts,
                last,
            },
        }
    }
}

/// Errors produced while building the SUT.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to execute build tool {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error(
        "build of {entry} failed (exit code: {code}).\n\nStderr:\n{stderr}\n\nStdout:\n{stdout}"
    )]
    Failed {
        entry: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("build finished but no artifact was found at {0}")]
    MissingArtifact(String),

    #[error("failed to install artifact at {path}: {source}")]
    Install {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Errors produced while starting the SUT.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("couldn't create log file {path}: {source}")]
    CreateLog {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("couldn't start {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },
}

fn last_suffix(last: &Option<CheckError>) -> String {
    match last {
        Some(err) => format!(": {err}"),
        None => String::new(),
    }
}
