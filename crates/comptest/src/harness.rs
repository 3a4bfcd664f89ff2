//! The component-test orchestrator.
//!
//! ```text
//! Idle → Building → Running → AwaitingReadiness → Ready → TestsExecuting → TornDown
//!  │        │          │              │
//!  └────────┴──────────┴──────────────┴──→ Aborted
//! ```
//!
//! A [`Comptest`] drives one SUT through those states. Every failure after
//! the process started tears it down before the error reaches the caller.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::barrier::{ReadinessReport, wait_for_all};
use crate::checker::{CheckContext, Checker};
use crate::config::HarnessConfig;
use crate::error::{ComptestError, ComptestResult};
use crate::process::{self, ExitHandler, ProcessHandle, ProcessOptions};
use crate::waitfor;

/// Component tests run only when this variable is `true`.
pub const ENV_RUN_COMPONENT_TESTS: &str = "RUN_COMPONENT_TESTS";

/// Whether component tests were requested for this run.
pub fn enabled() -> bool {
    is_enabled(std::env::var(ENV_RUN_COMPONENT_TESTS).ok().as_deref())
}

fn is_enabled(value: Option<&str>) -> bool {
    value == Some("true")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessState {
    Idle,
    Building,
    Running,
    AwaitingReadiness,
    Ready,
    TestsExecuting,
    TornDown,
    Aborted,
}

impl fmt::Display for HarnessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HarnessState::Idle => "idle",
            HarnessState::Building => "building",
            HarnessState::Running => "running",
            HarnessState::AwaitingReadiness => "awaiting_readiness",
            HarnessState::Ready => "ready",
            HarnessState::TestsExecuting => "tests_executing",
            HarnessState::TornDown => "torn_down",
            HarnessState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// State shared between the harness and the [`RunningSut`] it hands out.
#[derive(Debug, Clone)]
struct StateCell(Arc<Mutex<HarnessState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(HarnessState::Idle)))
    }

    fn get(&self) -> HarnessState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, to: HarnessState) {
        let from = std::mem::replace(
            &mut *self.0.lock().unwrap_or_else(PoisonError::into_inner),
            to,
        );
        info!(%from, %to, "harness state changed");
    }
}

/// What the test routine gets to know about the SUT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SutInfo {
    pub pid: Option<u32>,
    pub binary_path: PathBuf,
    pub logs_path: PathBuf,
}

/// Harness for one system under test.
///
/// ```no_run
/// use std::sync::Arc;
/// use comptest::{Comptest, HarnessConfig, waitfor};
///
/// # async fn example() -> comptest::ComptestResult<()> {
/// let config = HarnessConfig {
///     build_path: Some("./cmd/service".into()),
///     readiness_url: Some("http://127.0.0.1:9090/readiness".into()),
///     ..HarnessConfig::default()
/// };
///
/// let mut harness = Comptest::new(config).depends_on(Arc::new(waitfor::tcp("127.0.0.1:5432")));
/// harness
///     .run(None, |sut| async move {
///         println!("testing pid {:?}", sut.pid);
///         Ok(())
///     })
///     .await
/// # }
/// ```
pub struct Comptest {
    config: HarnessConfig,
    dependencies: Vec<Arc<dyn Checker>>,
    on_unexpected_exit: Option<ExitHandler>,
    state: StateCell,
    token: CancellationToken,
}

impl Comptest {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            dependencies: Vec::new(),
            on_unexpected_exit: None,
            state: StateCell::new(),
            token: CancellationToken::new(),
        }
    }

    /// Register an external dependency that must be ready alongside the SUT.
    pub fn depends_on(mut self, checker: Arc<dyn Checker>) -> Self {
        self.dependencies.push(checker);
        self
    }

    /// Replace the default unexpected-exit handler, which terminates the test
    /// process.
    pub fn with_exit_handler(mut self, handler: ExitHandler) -> Self {
        self.on_unexpected_exit = Some(handler);
        self
    }

    pub fn state(&self) -> HarnessState {
        self.state.get()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Cancelling this token aborts any readiness wait in progress.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn readiness_context(&self) -> CheckContext {
        CheckContext::with_timeout(self.token.child_token(), self.config.readiness_timeout)
    }

    /// Wait for arbitrary dependencies, bounded by the readiness timeout.
    ///
    /// Does not touch the SUT or the harness state, so it can gate setup
    /// steps (creating a database, seeding a queue) before the SUT is built.
    pub async fn health_checks(
        &self,
        checks: &[Arc<dyn Checker>],
    ) -> ComptestResult<ReadinessReport> {
        let ctx = self.readiness_context();
        Ok(wait_for_all(&ctx, &self.config.backoff, checks).await?)
    }

    fn abort(&self, err: ComptestError) -> ComptestError {
        error!(error = %err, state = %self.state.get(), "harness aborted");
        self.state.set(HarnessState::Aborted);
        err
    }

    fn readiness_set(
        &self,
        readiness: Option<Arc<dyn Checker>>,
    ) -> ComptestResult<Vec<Arc<dyn Checker>>> {
        let mut checks = self.config.dependency_checkers()?;
        checks.extend(self.dependencies.iter().cloned());

        match readiness {
            Some(checker) => checks.push(checker),
            None => {
                if let Some(url) = &self.config.readiness_url {
                    checks.push(Arc::new(waitfor::http(url.clone())));
                }
            }
        }

        if checks.is_empty() {
            return Err(ComptestError::Config(
                "no readiness checks: set readiness_url or pass a readiness checker".to_string(),
            ));
        }
        Ok(checks)
    }

    /// Build the SUT, start it and wait until it and every dependency are
    /// ready.
    ///
    /// `readiness` probes the SUT itself; when `None`, `readiness_url` from
    /// the config is used.
    pub async fn build_and_run(
        &mut self,
        readiness: Option<Arc<dyn Checker>>,
    ) -> ComptestResult<RunningSut> {
        let state = self.state.get();
        if state != HarnessState::Idle {
            return Err(ComptestError::Config(format!(
                "harness already used (state: {state})"
            )));
        }

        let Some(build_path) = self.config.build_path.clone() else {
            return Err(self.abort(ComptestError::Config("build_path is not set".to_string())));
        };
        let checks = match self.readiness_set(readiness) {
            Ok(checks) => checks,
            Err(err) => return Err(self.abort(err)),
        };

        self.state.set(HarnessState::Building);
        let binary_path = self.config.binary_path.clone();
        if let Err(err) = process::build(&self.config.build_tool, &build_path, &binary_path).await {
            return Err(self.abort(err.into()));
        }

        self.state.set(HarnessState::Running);
        let options = ProcessOptions {
            args: self.config.args.clone(),
            envs: self.config.env.clone(),
            current_dir: None,
            on_unexpected_exit: self.on_unexpected_exit.clone(),
        };
        let handle = match process::start(&binary_path, &self.config.logs_path, options) {
            Ok(handle) => handle,
            Err(err) => return Err(self.abort(err.into())),
        };

        self.state.set(HarnessState::AwaitingReadiness);
        let ctx = self.readiness_context();
        let report = match wait_for_all(&ctx, &self.config.backoff, &checks).await {
            Ok(report) => report,
            Err(err) => {
                handle.shutdown().await;
                return Err(self.abort(err.into()));
            }
        };

        self.state.set(HarnessState::Ready);
        let info = SutInfo {
            pid: handle.pid(),
            binary_path,
            logs_path: self.config.logs_path.clone(),
        };
        info!(pid = info.pid, checks = report.checks.len(), "system under test is ready");

        Ok(RunningSut {
            handle,
            info,
            report,
            state: self.state.clone(),
        })
    }

    /// Full lifecycle: build, start, gate on readiness, run `tests`, tear
    /// down.
    ///
    /// `tests` runs on its own task. The SUT is torn down whether it
    /// returns, fails or panics; a panic is resumed once teardown is done.
    pub async fn run<F, Fut, T>(
        &mut self,
        readiness: Option<Arc<dyn Checker>>,
        tests: F,
    ) -> ComptestResult<T>
    where
        F: FnOnce(SutInfo) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let sut = self.build_and_run(readiness).await?;

        self.state.set(HarnessState::TestsExecuting);
        let outcome = tokio::spawn(tests(sut.info().clone())).await;
        sut.teardown().await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ComptestError::Tests(err)),
            Err(join_err) if join_err.is_panic() => std::panic::resume_unwind(join_err.into_panic()),
            Err(join_err) => Err(ComptestError::Tests(anyhow::anyhow!(
                "test routine did not complete: {join_err}"
            ))),
        }
    }
}

impl fmt::Debug for Comptest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comptest")
            .field("config", &self.config)
            .field("dependencies", &self.dependencies.len())
            .field("state", &self.state.get())
            .finish()
    }
}

/// A SUT that passed its readiness gate.
///
/// Dropping it stops the process; [`teardown`](Self::teardown) also waits for
/// it to be reaped.
#[derive(Debug)]
pub struct RunningSut {
    handle: ProcessHandle,
    info: SutInfo,
    report: ReadinessReport,
    state: StateCell,
}

impl RunningSut {
    pub fn info(&self) -> &SutInfo {
        &self.info
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn readiness(&self) -> &ReadinessReport {
        &self.report
    }

    pub async fn teardown(self) {
        self.handle.shutdown().await;
        self.state.set(HarnessState::TornDown);
    }
}
