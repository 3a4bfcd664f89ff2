pub mod run;
pub mod wait;

use comptest::Comptest;
use tracing::warn;

/// Cancel the harness's readiness waits on Ctrl-C.
pub(crate) fn cancel_on_ctrl_c(harness: &Comptest) {
    let token = harness.cancellation_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupted, cancelling");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "failed to listen for Ctrl-C"),
        }
    });
}
