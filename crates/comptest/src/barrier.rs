//! Readiness barrier: one retry loop per checker, joined once.
//!
//! ```text
//! wait_for_all(ctx)
//!   ├── barrier ctx = ctx.child()
//!   ├── JoinSet
//!   │   ├── retry(checker 1, barrier ctx.child())
//!   │   ├── retry(checker 2, barrier ctx.child())
//!   │   └── ...
//!   ├── first failure → barrier ctx.cancel() → siblings abort
//!   └── join every task → Ok(report) | Err(first failure)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffPolicy, retry};
use crate::checker::{CheckContext, Checker};
use crate::error::{ReadinessError, RetryError};

/// Outcome of a successful barrier.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub checks: Vec<CheckReport>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub checker: String,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl ReadinessReport {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

type CheckOutcome = (String, Result<u32, RetryError>, Duration);

/// Wait until every checker succeeds.
///
/// Resolves with the first failure (terminal probe error, deadline, caller
/// cancellation, exhausted policy). All sibling probes are cancelled and
/// joined before this returns; no task outlives the call. Zero checkers is a
/// configuration error reported before anything is spawned.
pub async fn wait_for_all(
    ctx: &CheckContext,
    policy: &BackoffPolicy,
    checkers: &[Arc<dyn Checker>],
) -> Result<ReadinessReport, ReadinessError> {
    if checkers.is_empty() {
        return Err(ReadinessError::NoCheckers);
    }

    let started = Instant::now();
    let barrier = ctx.child();
    let mut tasks: JoinSet<CheckOutcome> = JoinSet::new();
    let mut names: HashMap<task::Id, String> = HashMap::with_capacity(checkers.len());

    for checker in checkers {
        let checker = Arc::clone(checker);
        let name = checker.describe();
        let ctx = barrier.child();
        let policy = *policy;
        let task_name = name.clone();

        let handle = tasks.spawn(async move {
            let started = Instant::now();
            let result = retry(&policy, &ctx, || checker.check(&ctx)).await;
            (task_name, result, started.elapsed())
        });
        names.insert(handle.id(), name);
    }

    debug!(checks = checkers.len(), "readiness barrier started");

    let mut reports = Vec::with_capacity(checkers.len());
    let mut failure: Option<ReadinessError> = None;

    while let Some(joined) = tasks.join_next_with_id().await {
        let err = match joined {
            Ok((_, (name, Ok(attempts), elapsed))) => {
                debug!(checker = %name, attempts, "check ready");
                reports.push(CheckReport {
                    checker: name,
                    attempts,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
                continue;
            }
            Ok((_, (name, Err(err), _))) => ReadinessError::from_retry(name, err),
            Err(join_err) => ReadinessError::Panicked {
                checker: names
                    .get(&join_err.id())
                    .cloned()
                    .unwrap_or_else(|| "<unknown>".to_string()),
            },
        };

        if failure.is_none() {
            warn!(error = %err, "readiness check failed, cancelling siblings");
            barrier.cancel();
            failure = Some(err);
        } else {
            debug!(error = %err, "sibling check aborted");
        }
    }

    if let Some(err) = failure {
        return Err(err);
    }

    let elapsed = started.elapsed();
    info!(
        checks = reports.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "all readiness checks passed"
    );
    Ok(ReadinessReport {
        checks: reports,
        elapsed_ms: elapsed.as_millis() as u64,
    })
}
