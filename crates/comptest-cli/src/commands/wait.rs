use std::sync::Arc;

use anyhow::Context;
use comptest::config::parse_duration;
use comptest::{Checker, Comptest, HarnessConfig, ReadinessReport, waitfor};

pub async fn wait(checks: &[String], timeout: &str, json: bool) -> anyhow::Result<()> {
    let readiness_timeout =
        parse_duration(timeout).with_context(|| format!("Invalid timeout: {timeout:?}"))?;
    let checkers = checks
        .iter()
        .map(|spec| waitfor::parse(spec))
        .collect::<Result<Vec<Arc<dyn Checker>>, _>>()?;

    let harness = Comptest::new(HarnessConfig {
        readiness_timeout,
        ..HarnessConfig::default()
    });
    super::cancel_on_ctrl_c(&harness);

    match harness.health_checks(&checkers).await {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", render(&report));
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Wait failed: {e}");
            Err(e.into())
        }
    }
}

fn render(report: &ReadinessReport) -> String {
    let mut out = String::new();
    for check in &report.checks {
        out.push_str(&format!(
            "✓ {} ready after {} attempt(s) ({} ms)\n",
            check.checker, check.attempts, check.elapsed_ms
        ));
    }
    out.push_str(&format!(
        "  {} check(s) ready in {} ms\n",
        report.checks.len(),
        report.elapsed_ms
    ));
    out
}
