//! comptest.toml configuration.
//!
//! Every field has a default, so an empty file (or no file at all) is a valid
//! configuration. Environment variables override the file; the CLI's flags
//! override both.
//!
//! ```toml
//! build_path = "./cmd/service"
//! readiness_url = "http://127.0.0.1:9090/readiness"
//! readiness_timeout = "30s"
//! dependencies = ["tcp://127.0.0.1:5432", "http://127.0.0.1:8200/v1/sys/health"]
//!
//! [build_tool]
//! kind = "cargo"
//! bin = "service"
//!
//! [env]
//! PORT = "8080"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::checker::Checker;
use crate::process::BuildTool;
use crate::waitfor;

pub const ENV_BINARY_PATH: &str = "COMPTEST_BINARY_PATH";
pub const ENV_LOGS_PATH: &str = "COMPTEST_LOGS_PATH";
pub const ENV_READINESS_TIMEOUT: &str = "COMPTEST_READINESS_TIMEOUT";
pub const ENV_BUILD_PATH: &str = "COMPTEST_BUILD_PATH";
pub const ENV_READINESS_URL: &str = "COMPTEST_READINESS_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Where the built SUT binary is written.
    pub binary_path: PathBuf,
    /// Where the SUT's stdout and stderr are captured.
    pub logs_path: PathBuf,
    /// Deadline shared by every readiness check of one sweep.
    #[serde(with = "duration_str")]
    pub readiness_timeout: Duration,
    /// Build entry point. Required to build and run the SUT.
    pub build_path: Option<PathBuf>,
    pub build_tool: BuildTool,
    /// SUT readiness endpoint, used when no readiness checker is supplied.
    pub readiness_url: Option<String>,
    /// External dependencies, as `tcp://host:port` or `http://...` specs.
    pub dependencies: Vec<String>,
    /// Environment passed to the SUT.
    pub env: BTreeMap<String, String>,
    /// Arguments passed to the SUT.
    pub args: Vec<String>,
    #[serde(skip, default = "BackoffPolicy::readiness")]
    pub backoff: BackoffPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            binary_path: std::env::temp_dir().join("main"),
            logs_path: PathBuf::from("./comptest.log"),
            readiness_timeout: Duration::from_secs(30),
            build_path: None,
            build_tool: BuildTool::default(),
            readiness_url: None,
            dependencies: Vec::new(),
            env: BTreeMap::new(),
            args: Vec::new(),
            backoff: BackoffPolicy::readiness(),
        }
    }
}

impl HarnessConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HarnessConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Defaults overlaid with the `COMPTEST_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay the `COMPTEST_*` environment variables on this config.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = var(ENV_BINARY_PATH) {
            self.binary_path = PathBuf::from(path);
        }
        if let Some(path) = var(ENV_LOGS_PATH) {
            self.logs_path = PathBuf::from(path);
        }
        if let Some(timeout) = var(ENV_READINESS_TIMEOUT) {
            self.readiness_timeout = parse_duration(&timeout)
                .with_context(|| format!("Invalid {ENV_READINESS_TIMEOUT}: {timeout:?}"))?;
        }
        if let Some(path) = var(ENV_BUILD_PATH) {
            self.build_path = Some(PathBuf::from(path));
        }
        if let Some(url) = var(ENV_READINESS_URL) {
            self.readiness_url = Some(url);
        }
        Ok(())
    }

    /// Checkers for [`dependencies`](Self::dependencies).
    pub fn dependency_checkers(&self) -> crate::ComptestResult<Vec<Arc<dyn Checker>>> {
        self.dependencies.iter().map(|spec| waitfor::parse(spec)).collect()
    }
}

/// Parse `"500ms"`, `"5s"`, `"2m"`, `"1h"` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "" | "s" => Some(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs),
        "h" => value.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

/// Render a duration the way [`parse_duration`] reads it.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 || d.as_secs() == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    use super::{format_duration, parse_duration};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Secs(u64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text)
                .ok_or_else(|| de::Error::custom(format!("invalid duration {text:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.binary_path, std::env::temp_dir().join("main"));
        assert_eq!(config.logs_path, PathBuf::from("./comptest.log"));
        assert_eq!(config.readiness_timeout, Duration::from_secs(30));
        assert_eq!(config.build_tool, BuildTool::Go);
        assert_eq!(config.backoff, BackoffPolicy::readiness());
        assert!(config.build_path.is_none());
    }

    #[test]
    fn empty_file_is_default() {
        assert_eq!(HarnessConfig::from_toml_str("").unwrap(), HarnessConfig::default());
    }

    #[test]
    fn full_file() {
        let config = HarnessConfig::from_toml_str(
            r#"
            binary_path = "/tmp/svc"
            build_path = "./svc/Cargo.toml"
            readiness_url = "http://127.0.0.1:9090/readiness"
            readiness_timeout = "1500ms"
            dependencies = ["tcp://127.0.0.1:5432"]
            args = ["--verbose"]

            [build_tool]
            kind = "cargo"
            bin = "svc"

            [env]
            PORT = "8080"
            "#,
        )
        .unwrap();

        assert_eq!(config.binary_path, PathBuf::from("/tmp/svc"));
        assert_eq!(config.readiness_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.build_tool,
            BuildTool::Cargo {
                bin: "svc".to_string(),
                release: false
            }
        );
        assert_eq!(config.env.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(config.dependency_checkers().unwrap().len(), 1);
        assert_eq!(config.logs_path, PathBuf::from("./comptest.log"));
    }

    #[test]
    fn timeout_as_bare_seconds() {
        let config = HarnessConfig::from_toml_str("readiness_timeout = 10").unwrap();
        assert_eq!(config.readiness_timeout, Duration::from_secs(10));
    }

    #[test]
    fn invalid_timeout_is_rejected() {
        assert!(HarnessConfig::from_toml_str(r#"readiness_timeout = "soon""#).is_err());
    }

    #[test]
    fn command_build_tool_from_toml() {
        let config = HarnessConfig::from_toml_str(
            r#"
            [build_tool]
            kind = "command"
            program = "make"
            args = ["OUT={output}"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.build_tool,
            BuildTool::Command {
                program: "make".to_string(),
                args: vec!["OUT={output}".to_string()],
            }
        );
    }

    #[test]
    fn env_overrides() {
        let vars: BTreeMap<&str, &str> = [
            (ENV_BINARY_PATH, "/opt/sut"),
            (ENV_READINESS_TIMEOUT, "2m"),
            (ENV_BUILD_PATH, "./cmd"),
            (ENV_READINESS_URL, "http://localhost:1/ready"),
        ]
        .into_iter()
        .collect();

        let mut config = HarnessConfig::default();
        config
            .apply_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.binary_path, PathBuf::from("/opt/sut"));
        assert_eq!(config.readiness_timeout, Duration::from_secs(120));
        assert_eq!(config.build_path, Some(PathBuf::from("./cmd")));
        assert_eq!(config.readiness_url.as_deref(), Some("http://localhost:1/ready"));
        assert_eq!(config.logs_path, PathBuf::from("./comptest.log"));
    }

    #[test]
    fn invalid_env_timeout_is_rejected() {
        let mut config = HarnessConfig::default();
        let err = config
            .apply_vars(|key| (key == ENV_READINESS_TIMEOUT).then(|| "later".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_READINESS_TIMEOUT));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comptest.toml");
        std::fs::write(&path, "logs_path = \"/tmp/sut.log\"\n").unwrap();
        let config = HarnessConfig::from_file(&path).unwrap();
        assert_eq!(config.logs_path, PathBuf::from("/tmp/sut.log"));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration(" 3s "), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("5 s"), None);
        assert_eq!(parse_duration("5d"), None);
        assert_eq!(parse_duration("ms"), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn format_duration_reads_back() {
        for d in [Duration::from_secs(30), Duration::from_millis(1500), Duration::ZERO] {
            assert_eq!(parse_duration(&format_duration(d)), Some(d));
        }
    }
}
