use std::path::{Path, PathBuf};
use std::process::{ExitCode, ExitStatus};

use anyhow::{Context, bail};
use clap::Args;
use comptest::config::parse_duration;
use comptest::{BuildTool, Comptest, HarnessConfig, SutInfo};
use tokio::process::Command;
use tracing::info;

pub const DEFAULT_CONFIG: &str = "comptest.toml";

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Config file (default: ./comptest.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Build entry point of the SUT
    #[arg(short, long)]
    pub build: Option<PathBuf>,
    /// Build tool: go, cargo:<bin>, cargo-release:<bin> or a program
    #[arg(long)]
    pub tool: Option<String>,
    /// Where the built binary is written
    #[arg(long)]
    pub binary_path: Option<PathBuf>,
    /// Where the SUT's output is captured
    #[arg(long)]
    pub logs_path: Option<PathBuf>,
    /// Readiness deadline ("30s", "500ms", "2m")
    #[arg(short, long)]
    pub timeout: Option<String>,
    /// SUT readiness URL (200 means ready)
    #[arg(short, long)]
    pub readiness: Option<String>,
    /// Extra dependency to wait for (repeatable)
    #[arg(long = "check")]
    pub checks: Vec<String>,
    /// Environment for the SUT, KEY=VALUE (repeatable)
    #[arg(short, long)]
    pub env: Vec<String>,
    /// Test command, after `--`
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

pub async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = resolve_config(&args)?;
    let command = args.command;

    let mut harness = Comptest::new(config);
    super::cancel_on_ctrl_c(&harness);

    let status = harness
        .run(None, move |sut| async move { run_tests(&command, &sut).await })
        .await;

    match status {
        Ok(status) => {
            info!(%status, "test command finished");
            Ok(exit_code(status))
        }
        Err(e) => {
            eprintln!("Run failed: {e}");
            Err(e.into())
        }
    }
}

/// File (explicit or ./comptest.toml) → COMPTEST_* variables → flags.
fn resolve_config(args: &RunArgs) -> anyhow::Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).is_file() => {
            HarnessConfig::from_file(Path::new(DEFAULT_CONFIG))?
        }
        None => HarnessConfig::default(),
    };
    config.apply_env()?;
    apply_flags(&mut config, args)?;
    Ok(config)
}

fn apply_flags(config: &mut HarnessConfig, args: &RunArgs) -> anyhow::Result<()> {
    if let Some(build) = &args.build {
        config.build_path = Some(build.clone());
    }
    if let Some(tool) = &args.tool {
        config.build_tool = tool
            .parse::<BuildTool>()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Invalid --tool {tool:?}"))?;
    }
    if let Some(path) = &args.binary_path {
        config.binary_path = path.clone();
    }
    if let Some(path) = &args.logs_path {
        config.logs_path = path.clone();
    }
    if let Some(timeout) = &args.timeout {
        config.readiness_timeout =
            parse_duration(timeout).with_context(|| format!("Invalid --timeout {timeout:?}"))?;
    }
    if let Some(url) = &args.readiness {
        config.readiness_url = Some(url.clone());
    }
    config.dependencies.extend(args.checks.iter().cloned());
    for pair in &args.env {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid --env {pair:?}, expected KEY=VALUE");
        };
        config.env.insert(key.to_string(), value.to_string());
    }
    Ok(())
}

async fn run_tests(command: &[String], sut: &SutInfo) -> anyhow::Result<ExitStatus> {
    let Some((program, rest)) = command.split_first() else {
        bail!("No test command given");
    };

    let mut cmd = Command::new(program);
    cmd.args(rest).env("COMPTEST_LOGS_PATH", &sut.logs_path);
    if let Some(pid) = sut.pid {
        cmd.env("COMPTEST_SUT_PID", pid.to_string());
    }

    info!(command = ?command, "running test command");
    cmd.status()
        .await
        .with_context(|| format!("Failed to execute test command {program}"))
}

fn exit_code(status: ExitStatus) -> ExitCode {
    match status.code() {
        Some(0) => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    }
}
