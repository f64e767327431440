//! Executor configuration.
//!
//! Configuration is plain JSON, either inline in the `CODE_EXECUTOR_CONFIG`
//! environment variable or in a file. A handful of single-value environment
//! variables override the most commonly tuned fields.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::functions::{self, FunctionWithRequirements};

/// Top-level configuration for a [`CodeExecutor`](crate::executor::CodeExecutor).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Which provider hosts the execution environment.
    #[serde(default)]
    pub backend: BackendType,

    /// Image reference the container is created from. Must already be
    /// present on the Docker host.
    #[serde(default = "default_image")]
    pub image: String,

    /// Container name. Defaults to `code-exec-<uuid>`.
    #[serde(default)]
    pub container_name: Option<String>,

    /// Host directory where code is staged. When absent, the executor
    /// creates a temporary directory and deletes it on stop.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Host path bound into the container, when it differs from `work_dir`
    /// (e.g. when the executor itself runs inside a container).
    #[serde(default)]
    pub bind_dir: Option<PathBuf>,

    /// Mount point of the working directory inside the container.
    #[serde(default = "default_container_work_dir")]
    pub container_work_dir: String,

    /// Per-block execution timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Additional bind mounts, keyed by host path.
    #[serde(default)]
    pub extra_volumes: HashMap<String, VolumeMount>,

    /// Extra `/etc/hosts` entries, hostname → address.
    #[serde(default)]
    pub extra_hosts: HashMap<String, String>,

    /// Shell command run once after the environment is up.
    #[serde(default)]
    pub init_command: Option<String>,

    /// Let Docker remove the container once it stops.
    #[serde(default = "default_true")]
    pub auto_remove: bool,

    /// How long to wait for the container to report `running`.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_seconds: u64,

    /// Cap on captured output per block. `None` captures everything.
    #[serde(default)]
    pub max_output_bytes: Option<usize>,

    /// Append `-qqq` to `pip install` lines.
    #[serde(default = "default_true")]
    pub silence_pip: bool,

    /// Program that wraps every command for the process backend (for
    /// example a bubblewrap launcher). Ignored by the Docker backend.
    #[serde(default)]
    pub wrapper: Option<String>,

    /// Python functions importable from blocks via `functions_module`.
    #[serde(default)]
    pub functions: Vec<FunctionWithRequirements>,

    /// Module name the functions are written to (`<name>.py`).
    #[serde(default = "default_functions_module")]
    pub functions_module: String,

    /// Delete each call's staged files when the call ends.
    #[serde(default = "default_true")]
    pub delete_tmp_files: bool,
}

/// A bind mount in Docker's `host:bind:mode` form.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VolumeMount {
    /// Path inside the container.
    pub bind: String,

    /// `rw` or `ro`.
    #[serde(default = "default_mode")]
    pub mode: String,
}

/// Available environment providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Docker container via the local daemon.
    #[default]
    Docker,
    /// Host child processes (no isolation of its own).
    Process,
}

fn default_image() -> String {
    "python:3-slim".into()
}

fn default_container_work_dir() -> String {
    "/workspace".into()
}

fn default_functions_module() -> String {
    "functions".into()
}

fn default_mode() -> String {
    "rw".into()
}

const fn default_timeout() -> u64 {
    60
}

const fn default_start_timeout() -> u64 {
    60
}

const fn default_true() -> bool {
    true
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            image: default_image(),
            container_name: None,
            work_dir: None,
            bind_dir: None,
            container_work_dir: default_container_work_dir(),
            timeout_seconds: default_timeout(),
            extra_volumes: HashMap::new(),
            extra_hosts: HashMap::new(),
            init_command: None,
            auto_remove: true,
            start_timeout_seconds: default_start_timeout(),
            max_output_bytes: None,
            silence_pip: true,
            wrapper: None,
            functions: Vec::new(),
            functions_module: default_functions_module(),
            delete_tmp_files: true,
        }
    }
}

impl ExecutorConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse executor config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json)
    }

    /// Load configuration from the environment.
    ///
    /// `CODE_EXECUTOR_CONFIG` holds an optional JSON document; then
    /// `CODE_EXECUTOR_IMAGE`, `CODE_EXECUTOR_TIMEOUT` (seconds) and
    /// `CODE_EXECUTOR_WORK_DIR` override individual fields.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("CODE_EXECUTOR_CONFIG") {
            Ok(json) => Self::from_json(&json).context("Invalid CODE_EXECUTOR_CONFIG")?,
            Err(_) => Self::default(),
        };

        if let Ok(image) = std::env::var("CODE_EXECUTOR_IMAGE") {
            debug!(image = %image, "Image overridden from environment");
            config.image = image;
        }
        if let Ok(timeout) = std::env::var("CODE_EXECUTOR_TIMEOUT") {
            config.timeout_seconds = timeout
                .parse()
                .with_context(|| format!("CODE_EXECUTOR_TIMEOUT is not a number: {timeout}"))?;
        }
        if let Ok(dir) = std::env::var("CODE_EXECUTOR_WORK_DIR") {
            config.work_dir = Some(PathBuf::from(dir));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.timeout_seconds >= 1, "timeout_seconds must be at least 1");
        anyhow::ensure!(!self.image.trim().is_empty(), "image must not be empty");
        anyhow::ensure!(
            self.container_work_dir.starts_with('/'),
            "container_work_dir must be absolute: {}",
            self.container_work_dir
        );
        anyhow::ensure!(
            functions::is_module_name(&self.functions_module),
            "functions_module is not a valid Python module name: {}",
            self.functions_module
        );
        for (i, function) in self.functions.iter().enumerate() {
            anyhow::ensure!(
                function.name().is_some(),
                "functions[{i}] must define exactly one top-level function"
            );
        }
        Ok(())
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub const fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_seconds)
    }

    /// Bind specs for the container: the working directory first, then the
    /// extra volumes in a stable order.
    pub fn binds(&self, work_dir: &Path) -> Vec<String> {
        let host_dir = self.bind_dir.as_deref().unwrap_or(work_dir);
        let mut binds = vec![format!(
            "{}:{}:rw",
            host_dir.display(),
            self.container_work_dir
        )];

        let mut extra: Vec<_> = self.extra_volumes.iter().collect();
        extra.sort_by(|a, b| a.0.cmp(b.0));
        binds.extend(
            extra
                .into_iter()
                .map(|(host, mount)| format!("{host}:{}:{}", mount.bind, mount.mode)),
        );
        binds
    }

    /// Extra hosts in Docker's `host:ip` form, sorted by hostname.
    pub fn extra_host_entries(&self) -> Vec<String> {
        let mut hosts: Vec<_> = self
            .extra_hosts
            .iter()
            .map(|(host, ip)| format!("{host}:{ip}"))
            .collect();
        hosts.sort();
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config = ExecutorConfig::from_json("{}").unwrap();

        assert_eq!(config.backend, BackendType::Docker);
        assert_eq!(config.image, "python:3-slim");
        assert_eq!(config.container_work_dir, "/workspace");
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert_eq!(config.start_timeout(), Duration::from_secs(60));
        assert!(config.auto_remove);
        assert!(config.silence_pip);
        assert!(config.work_dir.is_none());
        assert!(config.max_output_bytes.is_none());
        assert!(config.functions.is_empty());
        assert_eq!(config.functions_module, "functions");
        assert!(config.delete_tmp_files);
    }

    #[test]
    fn parse_functions() {
        let config = ExecutorConfig::from_json(
            r#"{
                "functions_module": "helpers",
                "delete_tmp_files": false,
                "functions": [
                    {"code": "def add(a, b):\n    return a + b"},
                    {"code": "def load():\n    return pandas.DataFrame()",
                     "python_packages": ["pandas"], "global_imports": ["pandas"]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.functions_module, "helpers");
        assert!(!config.delete_tmp_files);
        assert_eq!(config.functions.len(), 2);
        assert_eq!(config.functions[1].python_packages, vec!["pandas"]);
    }

    #[test]
    fn rejects_bad_functions() {
        let err = ExecutorConfig::from_json(r#"{"functions_module": "my-funcs"}"#).unwrap_err();
        assert!(err.to_string().contains("functions_module"));

        let err = ExecutorConfig::from_json(r#"{"functions": [{"code": "x = 1"}]}"#).unwrap_err();
        assert!(err.to_string().contains("functions[0]"));
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "backend": "process",
            "image": "my-sandbox:latest",
            "container_name": "exec-1",
            "work_dir": "/tmp/code",
            "timeout_seconds": 5,
            "extra_volumes": {
                "/data": { "bind": "/mnt/data", "mode": "ro" },
                "/cache": { "bind": "/mnt/cache" }
            },
            "extra_hosts": { "db": "10.0.0.2" },
            "init_command": "pip install numpy",
            "auto_remove": false,
            "max_output_bytes": 1024,
            "wrapper": "/usr/bin/jail"
        }"#;

        let config = ExecutorConfig::from_json(json).unwrap();
        assert_eq!(config.backend, BackendType::Process);
        assert_eq!(config.container_name.as_deref(), Some("exec-1"));
        assert_eq!(config.work_dir, Some(PathBuf::from("/tmp/code")));
        assert_eq!(config.timeout_seconds, 5);
        assert_eq!(config.extra_volumes["/cache"].mode, "rw");
        assert_eq!(config.max_output_bytes, Some(1024));
        assert!(!config.auto_remove);
        assert_eq!(config.wrapper.as_deref(), Some("/usr/bin/jail"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = ExecutorConfig::from_json(r#"{"timeout_seconds": 0}"#).unwrap_err();
        assert!(err.to_string().contains("timeout_seconds"));
    }

    #[test]
    fn rejects_relative_container_dir() {
        assert!(ExecutorConfig::from_json(r#"{"container_work_dir": "work"}"#).is_err());
    }

    #[test]
    fn binds_put_work_dir_first() {
        let json = r#"{
            "extra_volumes": {
                "/b": { "bind": "/mnt/b", "mode": "ro" },
                "/a": { "bind": "/mnt/a" }
            }
        }"#;
        let config = ExecutorConfig::from_json(json).unwrap();
        let binds = config.binds(Path::new("/host/work"));
        assert_eq!(
            binds,
            vec![
                "/host/work:/workspace:rw".to_string(),
                "/a:/mnt/a:rw".to_string(),
                "/b:/mnt/b:ro".to_string(),
            ]
        );
    }

    #[test]
    fn bind_dir_overrides_host_path() {
        let config = ExecutorConfig {
            bind_dir: Some(PathBuf::from("/outer/work")),
            ..ExecutorConfig::default()
        };
        assert_eq!(
            config.binds(Path::new("/inner/work"))[0],
            "/outer/work:/workspace:rw"
        );
    }

    #[test]
    fn extra_hosts_are_formatted() {
        let config = ExecutorConfig::from_json(
            r#"{"extra_hosts": {"web": "10.0.0.3", "db": "10.0.0.2"}}"#,
        )
        .unwrap();
        assert_eq!(config.extra_host_entries(), vec!["db:10.0.0.2", "web:10.0.0.3"]);
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor.json");
        std::fs::write(&path, r#"{"image": "sandbox:1", "timeout_seconds": 10}"#).unwrap();

        let config = ExecutorConfig::from_file(&path).unwrap();
        assert_eq!(config.image, "sandbox:1");
        assert_eq!(config.timeout_seconds, 10);
    }

    #[test]
    fn from_file_missing_is_an_error() {
        assert!(ExecutorConfig::from_file(Path::new("/nonexistent/executor.json")).is_err());
    }
}
