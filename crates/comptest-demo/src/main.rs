//! comptest-demo: example system under test.
//!
//! Serves the main API on `PORT` right away and the readiness endpoint on
//! `METRICS_ADDR` only after `READINESS_DELAY_MS`, so a harness that does not
//! wait for readiness would race it.
//!
//! ```text
//! PORT=8080 METRICS_ADDR=:9090 comptest-demo
//! ```

use std::io::IsTerminal;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

mod app;

struct Config {
    addr: String,
    metrics_addr: String,
    readiness_delay: Duration,
}

impl Config {
    fn from_env() -> Result<Self> {
        let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
        let metrics = std::env::var("METRICS_ADDR").unwrap_or_else(|_| ":9090".to_string());
        let readiness_delay = match std::env::var("READINESS_DELAY_MS") {
            Ok(ms) => Duration::from_millis(
                ms.parse()
                    .with_context(|| format!("Invalid READINESS_DELAY_MS: {ms:?}"))?,
            ),
            Err(_) => Duration::from_secs(1),
        };
        Ok(Self {
            addr: listen_addr(&port),
            metrics_addr: listen_addr(&metrics),
            readiness_delay,
        })
    }
}

/// Accept `8080`, `:8080` or `host:8080`.
fn listen_addr(value: &str) -> String {
    let value = value.trim();
    if value.chars().all(|c| c.is_ascii_digit()) {
        format!("0.0.0.0:{value}")
    } else if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_string()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::stdout().is_terminal())
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("comptest_demo=info".parse()?),
        )
        .init();

    let config = Config::from_env()?;
    info!(pid = std::process::id(), "START");

    let (state, exit_rx) = app::AppState::new();

    let metrics_addr = config.metrics_addr.clone();
    let delay = config.readiness_delay;
    tokio::spawn(async move {
        // Not ready to serve until the delay has passed.
        tokio::time::sleep(delay).await;
        info!(addr = %metrics_addr, "Start metrics server");
        let served = match TcpListener::bind(&metrics_addr).await {
            Ok(listener) => axum::serve(listener, app::metrics_router()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = served {
            error!(addr = %metrics_addr, error = %e, "metrics server failed");
            std::process::exit(1);
        }
    });

    let listener = TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr))?;
    info!(addr = %config.addr, "Start main server");

    let code = tokio::select! {
        served = axum::serve(listener, app::main_router(state)).into_future() => {
            served.context("main server failed")?;
            return Ok(());
        }
        code = app::exit_requested(exit_rx) => code,
    };

    // Let the /exit response reach the client.
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!(code, "exiting");
    std::process::exit(code);
}
