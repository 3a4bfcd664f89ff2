//! Component-test harness.
//!
//! Builds the system under test (SUT), runs it as a subprocess with its
//! output captured to a log file, waits until every external dependency and
//! the SUT itself report ready, hands control to the test routine and tears
//! the process down afterwards.
//!
//! # Architecture
//!
//! ```text
//! Comptest (harness)
//!   ├── process::build()          → BuildTool (go / cargo / command)
//!   ├── process::start()          → ProcessHandle
//!   │   └── exit monitor task     (kill request / unexpected exit)
//!   ├── barrier::wait_for_all()   → one task per Checker
//!   │   └── backoff::retry()      (ExponentialBackoff, CheckContext)
//!   └── tests(SutInfo)            → teardown on every exit path
//! ```
//!
//! # Cancellation
//!
//! A single [`CheckContext`] (cancellation token + deadline) flows from the
//! harness through the barrier into every retry loop. The first checker that
//! fails for good cancels the barrier's context, which aborts all sibling
//! probes before the barrier returns.

pub mod backoff;
pub mod barrier;
pub mod checker;
pub mod config;
pub mod error;
pub mod harness;
pub mod process;
pub mod waitfor;

pub use backoff::{BackoffPolicy, ExponentialBackoff, retry};
pub use barrier::{ReadinessReport, wait_for_all};
pub use checker::{CheckContext, Checker, StopReason, from_fn};
pub use config::HarnessConfig;
pub use error::{
    BuildError, CheckError, ComptestError, ComptestResult, ProcessError, ReadinessError,
    RetryError,
};
pub use harness::{Comptest, HarnessState, RunningSut, SutInfo, enabled};
pub use process::{
    BuildTool, CloseState, ExitHandler, ProcessHandle, ProcessOptions, UnexpectedExit,
    abort_on_unexpected_exit,
};
