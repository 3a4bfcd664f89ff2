use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "comptest",
    about = "Build, run and readiness-gate a system under test",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait until every dependency reports ready.
    ///
    /// Checks are `tcp://host:port` or `http://host:port/path` (200 only).
    Wait {
        /// Dependency to wait for (repeatable)
        #[arg(short, long = "check", required = true)]
        checks: Vec<String>,
        /// Deadline shared by all checks ("30s", "500ms", "2m")
        #[arg(short, long, default_value = "30s")]
        timeout: String,
        /// Print the readiness report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Build the SUT, start it, wait for readiness, run a test command and
    /// tear the SUT down.
    ///
    /// The test command receives COMPTEST_SUT_PID and COMPTEST_LOGS_PATH and
    /// its exit status becomes comptest's.
    Run(commands::run::RunArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive("comptest=info".parse()?);
    if std::env::var("COMPTEST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Wait {
            checks,
            timeout,
            json,
        } => {
            commands::wait::wait(&checks, &timeout, json).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => commands::run::run(args).await,
    }
}
