//! Routes of the demo service.
//!
//! | Server  | Path           | Response                 |
//! |---|---|---|
//! | main    | `/`            | `Potato`                 |
//! | main    | `/event`       | records an event, `Ok`   |
//! | main    | `/event_count` | `Current count: N`       |
//! | main    | `/exit`        | exits with [`EXIT_CODE`] |
//! | metrics | `/readiness`   | `ready!!!`               |

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use tokio::sync::watch;
use tracing::{info, warn};

/// Exit code used by `/exit`.
pub const EXIT_CODE: i32 = 3;

#[derive(Clone)]
pub struct AppState {
    events: Arc<AtomicU64>,
    exit_tx: Arc<watch::Sender<Option<i32>>>,
}

impl AppState {
    /// State plus the receiver that learns when `/exit` was requested.
    pub fn new() -> (Self, watch::Receiver<Option<i32>>) {
        let (exit_tx, exit_rx) = watch::channel(None);
        let state = Self {
            events: Arc::new(AtomicU64::new(0)),
            exit_tx: Arc::new(exit_tx),
        };
        (state, exit_rx)
    }
}

pub fn main_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(potato))
        .route("/event", get(event).post(event))
        .route("/event_count", get(event_count))
        .route("/exit", get(exit).post(exit))
        .with_state(state)
}

pub fn metrics_router() -> Router {
    Router::new().route("/readiness", get(readiness))
}

/// Resolves with the requested exit code once `/exit` was hit.
pub async fn exit_requested(mut exit_rx: watch::Receiver<Option<i32>>) -> i32 {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(code) => (*code).unwrap_or(EXIT_CODE),
        Err(_) => {
            warn!("exit channel closed");
            std::future::pending().await
        }
    }
}

async fn potato() -> &'static str {
    info!("Potato endpoint");
    "Potato"
}

async fn event(State(state): State<AppState>) -> &'static str {
    let count = state.events.fetch_add(1, Ordering::SeqCst) + 1;
    info!(count, "event recorded");
    "Ok"
}

async fn event_count(State(state): State<AppState>) -> String {
    format!("Current count: {}", state.events.load(Ordering::SeqCst))
}

async fn exit(State(state): State<AppState>) -> &'static str {
    warn!(code = EXIT_CODE, "exit requested");
    state.exit_tx.send_replace(Some(EXIT_CODE));
    "Bye"
}

async fn readiness() -> &'static str {
    info!("Readiness endpoint");
    "ready!!!"
}
