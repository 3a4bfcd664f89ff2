//! Building the SUT binary.
//!
//! The harness only needs an executable at a known path. How it gets there
//! depends on the project: `go build`, `cargo build` followed by a copy out
//! of the target directory, or any other program that accepts an entry point
//! and an output path.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::BuildError;

/// The tool that turns the build entry point into the SUT binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildTool {
    /// `go build -o <output> <entry>`.
    #[default]
    Go,
    /// `cargo build --manifest-path <entry> --bin <bin>`, then the artifact is
    /// copied to `<output>`.
    Cargo {
        bin: String,
        #[serde(default)]
        release: bool,
    },
    /// Any program. `{entry}` and `{output}` in `args` are replaced with the
    /// entry point and the output path.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Program plus arguments, resolved for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
    /// Where the tool leaves its artifact when that is not `output` itself.
    pub artifact: Option<PathBuf>,
}

impl BuildTool {
    pub(crate) fn invocation(&self, entry: &Path, output: &Path) -> Invocation {
        match self {
            BuildTool::Go => Invocation {
                program: "go".to_string(),
                args: vec![
                    "build".into(),
                    "-o".into(),
                    output.as_os_str().to_owned(),
                    entry.as_os_str().to_owned(),
                ],
                artifact: None,
            },
            BuildTool::Cargo { bin, release } => {
                let target_dir = output
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join("comptest-target");
                let profile = if *release { "release" } else { "debug" };
                let artifact = target_dir
                    .join(profile)
                    .join(format!("{bin}{}", std::env::consts::EXE_SUFFIX));

                let mut args: Vec<OsString> = vec![
                    "build".into(),
                    "--manifest-path".into(),
                    entry.as_os_str().to_owned(),
                    "--bin".into(),
                    bin.into(),
                    "--target-dir".into(),
                    target_dir.into_os_string(),
                ];
                if *release {
                    args.push("--release".into());
                }
                Invocation {
                    program: "cargo".to_string(),
                    args,
                    artifact: Some(artifact),
                }
            }
            BuildTool::Command { program, args } => Invocation {
                program: program.clone(),
                args: args
                    .iter()
                    .map(|arg| substitute(arg, entry, output))
                    .collect(),
                artifact: None,
            },
        }
    }
}

/// Replace `{entry}` and `{output}` in a single argument.
fn substitute(arg: &str, entry: &Path, output: &Path) -> OsString {
    match arg {
        "{entry}" => entry.as_os_str().to_owned(),
        "{output}" => output.as_os_str().to_owned(),
        _ => arg
            .replace("{entry}", &entry.to_string_lossy())
            .replace("{output}", &output.to_string_lossy())
            .into(),
    }
}

impl fmt::Display for BuildTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildTool::Go => f.write_str("go"),
            BuildTool::Cargo { bin, .. } => write!(f, "cargo:{bin}"),
            BuildTool::Command { program, .. } => f.write_str(program),
        }
    }
}

/// Shorthand used on the command line: `go`, `cargo:<bin>`,
/// `cargo-release:<bin>`, or `<program> [args...]`. A program given without
/// arguments is invoked as `<program> {entry} {output}`.
impl FromStr for BuildTool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty build tool".to_string());
        }
        if s == "go" {
            return Ok(BuildTool::Go);
        }
        for (prefix, release) in [("cargo:", false), ("cargo-release:", true)] {
            if let Some(bin) = s.strip_prefix(prefix) {
                if bin.is_empty() {
                    return Err(format!("missing binary name in '{s}'"));
                }
                return Ok(BuildTool::Cargo {
                    bin: bin.to_string(),
                    release,
                });
            }
        }

        let mut parts = s.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        let mut args: Vec<String> = parts.collect();
        if args.is_empty() {
            args = vec!["{entry}".to_string(), "{output}".to_string()];
        }
        Ok(BuildTool::Command { program, args })
    }
}

/// Compile `entry` into an executable at `output`.
///
/// The tool's stdout and stderr are captured and attached to the error when
/// it exits non-zero.
pub async fn build(tool: &BuildTool, entry: &Path, output: &Path) -> Result<(), BuildError> {
    if let Some(dir) = output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| BuildError::Install {
                path: dir.display().to_string(),
                source,
            })?;
    }

    let invocation = tool.invocation(entry, output);
    info!(tool = %tool, entry = %entry.display(), output = %output.display(), "building binary");

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!("Running: {:?}", cmd);

    let result = cmd.output().await.map_err(|source| BuildError::Spawn {
        program: invocation.program.clone(),
        source,
    })?;

    if !result.status.success() {
        return Err(BuildError::Failed {
            entry: entry.display().to_string(),
            code: result.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
        });
    }

    if let Some(artifact) = &invocation.artifact {
        if !artifact.is_file() {
            return Err(BuildError::MissingArtifact(artifact.display().to_string()));
        }
        tokio::fs::copy(artifact, output)
            .await
            .map_err(|source| BuildError::Install {
                path: output.display().to_string(),
                source,
            })?;
    }

    if !output.is_file() {
        return Err(BuildError::MissingArtifact(output.display().to_string()));
    }

    info!(output = %output.display(), "binary built");
    Ok(())
}
