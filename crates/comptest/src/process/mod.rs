//! SUT subprocess lifecycle.
//!
//! ```text
//! start()
//!   ├── create log file, stdout + stderr → log
//!   ├── spawn child (kill_on_drop)
//!   └── exit monitor task
//!         ├── child exits on its own → state Open? → unexpected exit handler
//!         └── kill request from stop() → kill process group, reap
//!
//! stop()   Open → Closing → (kill, close log) → Closed   (exactly once)
//! ```
//!
//! The close state is the only thing shared between `stop()` and the exit
//! monitor. Whichever side moves it out of `Open` first decides whether an
//! exit counts as expected.

mod build;

pub use build::{BuildTool, build};

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ProcessError;

/// Callback invoked by the exit monitor when the SUT exits before `stop()`.
pub type ExitHandler = Arc<dyn Fn(UnexpectedExit) + Send + Sync>;

/// Details of a SUT that exited on its own.
#[derive(Debug, Clone)]
pub struct UnexpectedExit {
    pub executable: PathBuf,
    /// `None` when the exit status could not be collected.
    pub status: Option<ExitStatus>,
    /// Everything the process wrote to stdout and stderr.
    pub logs: String,
}

impl fmt::Display for UnexpectedExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "{} exited unexpectedly ({status})",
                self.executable.display()
            ),
            None => write!(f, "{} exited unexpectedly", self.executable.display()),
        }
    }
}

/// Default [`ExitHandler`]: dump the captured logs to stderr and terminate
/// the test process with exit code 1.
///
/// A component test must not keep running against a dead SUT.
pub fn abort_on_unexpected_exit() -> ExitHandler {
    Arc::new(|exit: UnexpectedExit| {
        eprintln!("{}", exit.logs);
        error!(
            executable = %exit.executable.display(),
            status = ?exit.status,
            "{exit}, check the logs above"
        );
        std::process::exit(1);
    })
}

/// Tri-state close flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    Open,
    /// `stop()` won the race and is tearing the process down.
    Closing,
    Closed,
}

/// How to launch the SUT.
#[derive(Clone, Default)]
pub struct ProcessOptions {
    pub args: Vec<String>,
    pub envs: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
    /// Defaults to [`abort_on_unexpected_exit`].
    pub on_unexpected_exit: Option<ExitHandler>,
}

impl ProcessOptions {
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn on_unexpected_exit(mut self, handler: ExitHandler) -> Self {
        self.on_unexpected_exit = Some(handler);
        self
    }
}

impl fmt::Debug for ProcessOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessOptions")
            .field("args", &self.args)
            .field("envs", &self.envs)
            .field("current_dir", &self.current_dir)
            .field("on_unexpected_exit", &self.on_unexpected_exit.is_some())
            .finish()
    }
}

struct Inner {
    state: CloseState,
    log: Option<File>,
    exit_status: Option<ExitStatus>,
}

struct Shared {
    executable: PathBuf,
    log_path: PathBuf,
    inner: Mutex<Inner>,
    kill_tx: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A running SUT. Dropping the handle stops the process.
pub struct ProcessHandle {
    shared: Arc<Shared>,
    pid: Option<u32>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Launch `executable` with stdout and stderr redirected to `log_path`.
///
/// The log file is created or truncated. Must be called from within a Tokio
/// runtime; the exit monitor runs as a task on it.
pub fn start(
    executable: impl AsRef<Path>,
    log_path: impl AsRef<Path>,
    options: ProcessOptions,
) -> Result<ProcessHandle, ProcessError> {
    let executable = executable.as_ref().to_path_buf();
    let log_path = log_path.as_ref().to_path_buf();

    let create_log = |source| ProcessError::CreateLog {
        path: log_path.display().to_string(),
        source,
    };
    let log = File::create(&log_path).map_err(create_log)?;
    let stdout = log.try_clone().map_err(create_log)?;
    let stderr = log.try_clone().map_err(create_log)?;

    let mut cmd = Command::new(&executable);
    cmd.args(&options.args)
        .envs(&options.envs)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);
    // The SUT leads its own process group so stop() reaches anything it forks.
    #[cfg(unix)]
    cmd.process_group(0);
    if let Some(dir) = &options.current_dir {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        executable: executable.display().to_string(),
        source,
    })?;
    let pid = child.id();

    let (kill_tx, kill_rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        executable,
        log_path,
        inner: Mutex::new(Inner {
            state: CloseState::Open,
            log: Some(log),
            exit_status: None,
        }),
        kill_tx,
    });

    let on_unexpected_exit = options
        .on_unexpected_exit
        .unwrap_or_else(abort_on_unexpected_exit);
    let monitor = tokio::spawn(monitor(child, kill_rx, Arc::clone(&shared), on_unexpected_exit));

    info!(
        pid,
        executable = %shared.executable.display(),
        logs = %shared.log_path.display(),
        "process started"
    );

    Ok(ProcessHandle {
        shared,
        pid,
        monitor: Mutex::new(Some(monitor)),
    })
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn executable(&self) -> &Path {
        &self.shared.executable
    }

    pub fn log_path(&self) -> &Path {
        &self.shared.log_path
    }

    pub fn state(&self) -> CloseState {
        self.shared.lock().state
    }

    /// Exit status, once the monitor has reaped the process.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shared.lock().exit_status
    }

    /// Kill the process and close its log file.
    ///
    /// Safe to call any number of times from any thread. Returns `true` only
    /// for the call that performed the teardown; later calls, and calls made
    /// after the process already exited on its own, return `false`.
    pub fn stop(&self) -> bool {
        let log = {
            let mut inner = self.shared.lock();
            if inner.state != CloseState::Open {
                return false;
            }
            inner.state = CloseState::Closing;
            inner.log.take()
        };

        debug!(pid = self.pid, "stopping process");
        self.shared.kill_tx.send_replace(true);
        close_log(log, &self.shared.log_path);

        self.shared.lock().state = CloseState::Closed;
        info!(pid = self.pid, executable = %self.shared.executable.display(), "process stopped");
        true
    }

    /// [`stop`](Self::stop), then wait for the monitor to reap the process.
    pub async fn shutdown(&self) {
        self.stop();
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            if let Err(err) = monitor.await {
                warn!(pid = self.pid, error = %err, "exit monitor failed");
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("executable", &self.shared.executable)
            .field("log_path", &self.shared.log_path)
            .field("state", &self.state())
            .finish()
    }
}

fn close_log(log: Option<File>, path: &Path) {
    let Some(log) = log else {
        return;
    };
    if let Err(err) = log.sync_all() {
        warn!(path = %path.display(), error = %err, "failed to flush log file");
    }
    drop(log);
}

/// Kill the child's process group, falling back to the child alone.
fn kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // SAFETY: kill(2) takes no pointers; a negative pid names the group.
        if unsafe { libc::kill(-pid, libc::SIGKILL) } == 0 {
            return;
        }
        warn!(pid, error = %std::io::Error::last_os_error(), "failed to kill process group");
    }
    if let Err(err) = child.start_kill() {
        warn!(pid = child.id(), error = %err, "failed to kill process");
    }
}

async fn monitor(
    mut child: Child,
    mut kill_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
    on_unexpected_exit: ExitHandler,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx.wait_for(|kill| *kill) => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            kill(&mut child);
            child.wait().await
        }
    };
    let status = match status {
        Ok(status) => Some(status),
        Err(err) => {
            warn!(error = %err, "failed to collect exit status");
            None
        }
    };

    let unexpected = {
        let mut inner = shared.lock();
        inner.exit_status = status;
        if inner.state == CloseState::Open {
            inner.state = CloseState::Closed;
            close_log(inner.log.take(), &shared.log_path);
            true
        } else {
            false
        }
    };

    if !unexpected {
        debug!(executable = %shared.executable.display(), status = ?status, "process exited after stop");
        return;
    }

    let logs = match tokio::fs::read(&shared.log_path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) => format!("<couldn't read {}: {err}>", shared.log_path.display()),
    };
    on_unexpected_exit(UnexpectedExit {
        executable: shared.executable.clone(),
        status,
        logs,
    });
}
