//! Environment provider trait and implementations.
//!
//! A provider owns the mechanics of one kind of isolated runtime: bringing
//! an environment up, running a command inside it, and tearing it down.
//! The executor drives providers through this trait only.

mod docker;
mod process;

pub use docker::{container_name, DockerProvider, MANAGED_LABEL};
pub use process::ProcessProvider;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::config::ExecutorConfig;
use crate::error::ProviderError;

/// Identifier of an environment, as understood by its provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentId(pub String);

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a provider needs to create an environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    /// Name to give the environment (container name for Docker).
    pub name: String,
    pub image: String,
    /// Host directory where blocks are staged.
    pub work_dir: PathBuf,
    /// Where `work_dir` appears inside the environment.
    pub container_work_dir: String,
    /// Bind mounts in `host:container:mode` form.
    pub binds: Vec<String>,
    /// Extra hosts in `host:ip` form.
    pub extra_hosts: Vec<String>,
    pub auto_remove: bool,
    /// How long to wait for the environment to become ready.
    pub start_timeout: Duration,
}

impl EnvironmentSpec {
    pub fn from_config(config: &ExecutorConfig, name: String, work_dir: PathBuf) -> Self {
        Self {
            binds: config.binds(&work_dir),
            extra_hosts: config.extra_host_entries(),
            name,
            image: config.image.clone(),
            work_dir,
            container_work_dir: config.container_work_dir.clone(),
            auto_remove: config.auto_remove,
            start_timeout: config.start_timeout(),
        }
    }
}

/// A command to run inside an environment.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Argument vector; runs in the environment's working directory.
    pub command: Vec<String>,
    /// Pattern that identifies the command's processes, used to kill them
    /// when the provider has no direct handle on the process.
    pub kill_pattern: Option<String>,
    /// Extra environment variables, `(name, value)`.
    pub env: Vec<(String, String)>,
}

impl ExecRequest {
    pub const fn new(command: Vec<String>) -> Self {
        Self {
            command,
            kill_pattern: None,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_kill_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.kill_pattern = Some(pattern.into());
        self
    }
}

/// Reference to a started command.
#[derive(Debug, Clone)]
pub struct ExecHandle {
    pub id: String,
    pub request: ExecRequest,
}

/// A started command and its combined stdout/stderr.
///
/// The stream ends when the command's output is closed; the exit code is
/// then available from [`EnvironmentProvider::exit_code`].
pub struct ExecStream {
    pub handle: ExecHandle,
    pub output: BoxStream<'static, Result<Vec<u8>, ProviderError>>,
}

/// Boundary to an isolated-runtime provider.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Create and start an environment, returning once it is ready.
    ///
    /// On failure the provider makes a best effort to remove anything it
    /// created; the caller may still call [`destroy_environment`] with the
    /// spec's name.
    ///
    /// [`destroy_environment`]: EnvironmentProvider::destroy_environment
    async fn create_environment(&self, spec: &EnvironmentSpec)
        -> Result<EnvironmentId, ProviderError>;

    /// Start a command inside the environment.
    async fn exec(
        &self,
        env: &EnvironmentId,
        request: ExecRequest,
    ) -> Result<ExecStream, ProviderError>;

    /// Exit code of a command whose output stream has ended.
    async fn exit_code(&self, env: &EnvironmentId, exec: &ExecHandle)
        -> Result<i64, ProviderError>;

    /// Forcibly stop a running command. Succeeds if it already exited.
    async fn terminate(&self, env: &EnvironmentId, exec: &ExecHandle)
        -> Result<(), ProviderError>;

    /// Tear down the environment. Succeeds if it does not exist.
    async fn destroy_environment(&self, env: &EnvironmentId) -> Result<(), ProviderError>;

    /// Environments currently allocated by this provider.
    async fn list_environments(&self) -> Result<Vec<EnvironmentId>, ProviderError>;
}

#[async_trait]
impl<T: EnvironmentProvider + ?Sized> EnvironmentProvider for Arc<T> {
    async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentId, ProviderError> {
        (**self).create_environment(spec).await
    }

    async fn exec(
        &self,
        env: &EnvironmentId,
        request: ExecRequest,
    ) -> Result<ExecStream, ProviderError> {
        (**self).exec(env, request).await
    }

    async fn exit_code(
        &self,
        env: &EnvironmentId,
        exec: &ExecHandle,
    ) -> Result<i64, ProviderError> {
        (**self).exit_code(env, exec).await
    }

    async fn terminate(&self, env: &EnvironmentId, exec: &ExecHandle) -> Result<(), ProviderError> {
        (**self).terminate(env, exec).await
    }

    async fn destroy_environment(&self, env: &EnvironmentId) -> Result<(), ProviderError> {
        (**self).destroy_environment(env).await
    }

    async fn list_environments(&self) -> Result<Vec<EnvironmentId>, ProviderError> {
        (**self).list_environments().await
    }
}
