//! Host process backend.
//!
//! Runs each command as a child process in the environment's working
//! directory, optionally behind a wrapper program (a bubblewrap or
//! jail.nix launcher, say) that does the actual sandboxing. Without a
//! wrapper there is no isolation at all.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    EnvironmentId, EnvironmentProvider, EnvironmentSpec, ExecHandle, ExecRequest, ExecStream,
};
use crate::error::ProviderError;

/// Exit code reported when the command's program cannot be found, as a shell would.
const EXIT_COMMAND_NOT_FOUND: i64 = 127;

const READ_CHUNK: usize = 8 * 1024;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

enum ExecState {
    Running { env: EnvironmentId, child: Child },
    Exited(i64),
}

#[derive(Default)]
struct State {
    environments: HashMap<EnvironmentId, PathBuf>,
    execs: HashMap<String, ExecState>,
}

/// Provider that runs commands as local child processes.
#[derive(Default)]
pub struct ProcessProvider {
    wrapper: Option<String>,
    state: Mutex<State>,
}

impl ProcessProvider {
    /// Create a provider that runs commands directly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider that prefixes every command with `wrapper`.
    pub fn with_wrapper(wrapper: impl Into<String>) -> Self {
        Self {
            wrapper: Some(wrapper.into()),
            state: Mutex::default(),
        }
    }

    fn command(&self, argv: &[String]) -> Result<Command, ProviderError> {
        let (program, args) = match &self.wrapper {
            Some(wrapper) => (wrapper.as_str(), argv),
            None => {
                let (first, rest) = argv
                    .split_first()
                    .ok_or_else(|| ProviderError::Exec("empty command".into()))?;
                (first.as_str(), rest)
            }
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

#[async_trait]
impl EnvironmentProvider for ProcessProvider {
    async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentId, ProviderError> {
        tokio::fs::create_dir_all(&spec.work_dir).await?;

        let id = EnvironmentId(spec.name.clone());
        self.state
            .lock()
            .await
            .environments
            .insert(id.clone(), spec.work_dir.clone());

        debug!(env = %id, work_dir = %spec.work_dir.display(), "Process environment ready");
        Ok(id)
    }

    #[instrument(skip(self, request), fields(env = %env))]
    async fn exec(
        &self,
        env: &EnvironmentId,
        request: ExecRequest,
    ) -> Result<ExecStream, ProviderError> {
        let work_dir = self
            .state
            .lock()
            .await
            .environments
            .get(env)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("environment {env}")))?;

        let mut cmd = self.command(&request.command)?;
        cmd.current_dir(&work_dir)
            .envs(request.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so termination reaches everything the command spawned.
        #[cfg(unix)]
        cmd.process_group(0);

        let id = Uuid::new_v4().to_string();
        let handle = ExecHandle {
            id: id.clone(),
            request,
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Report a missing interpreter the way a shell would, not as a backend failure.
                let program = handle.request.command.first().cloned().unwrap_or_default();
                self.state
                    .lock()
                    .await
                    .execs
                    .insert(id, ExecState::Exited(EXIT_COMMAND_NOT_FOUND));
                let message = format!("{program}: command not found\n").into_bytes();
                return Ok(ExecStream {
                    handle,
                    output: stream::once(async move { Ok(message) }).boxed(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Exec("failed to open stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::Exec("failed to open stderr".into()))?;

        self.state.lock().await.execs.insert(
            id,
            ExecState::Running {
                env: env.clone(),
                child,
            },
        );

        Ok(ExecStream {
            handle,
            output: stream::select(read_chunks(stdout), read_chunks(stderr)).boxed(),
        })
    }

    async fn exit_code(
        &self,
        _env: &EnvironmentId,
        exec: &ExecHandle,
    ) -> Result<i64, ProviderError> {
        // The child stays in the map while we wait, so a concurrent or later
        // `terminate` can still reach its process group.
        loop {
            {
                let mut state = self.state.lock().await;
                let code = match state.execs.get_mut(&exec.id) {
                    Some(ExecState::Exited(code)) => Some(*code),
                    Some(ExecState::Running { child, .. }) => child
                        .try_wait()?
                        .map(|status| status.code().map_or(-1, i64::from)),
                    None => return Err(ProviderError::NotFound(format!("exec {}", exec.id))),
                };
                if let Some(code) = code {
                    state.execs.remove(&exec.id);
                    return Ok(code);
                }
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    async fn terminate(
        &self,
        _env: &EnvironmentId,
        exec: &ExecHandle,
    ) -> Result<(), ProviderError> {
        let state = self.state.lock().await.execs.remove(&exec.id);
        if let Some(ExecState::Running { mut child, .. }) = state {
            kill_process_group(&mut child).await?;
            debug!(exec = %exec.id, "Killed process group");
        }
        Ok(())
    }

    async fn destroy_environment(&self, env: &EnvironmentId) -> Result<(), ProviderError> {
        let orphans: Vec<Child> = {
            let mut state = self.state.lock().await;
            state.environments.remove(env);
            let ids: Vec<String> = state
                .execs
                .iter()
                .filter(|(_, s)| matches!(s, ExecState::Running { env: e, .. } if e == env))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| match state.execs.remove(id) {
                    Some(ExecState::Running { child, .. }) => Some(child),
                    _ => None,
                })
                .collect()
        };

        for mut child in orphans {
            warn!(env = %env, "Killing process left running at teardown");
            if let Err(e) = kill_process_group(&mut child).await {
                warn!(error = %e, "Failed to kill orphaned process");
            }
        }
        Ok(())
    }

    async fn list_environments(&self) -> Result<Vec<EnvironmentId>, ProviderError> {
        Ok(self.state.lock().await.environments.keys().cloned().collect())
    }
}

/// SIGKILL the child's process group, then reap the child.
async fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    child.kill().await
}

/// Stream a pipe in chunks until EOF.
fn read_chunks<R>(reader: R) -> BoxStream<'static, Result<Vec<u8>, ProviderError>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(reader), |reader| async move {
        let mut reader = reader?;
        let mut buf = vec![0u8; READ_CHUNK];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), Some(reader)))
            }
            Err(e) => Some((Err(e.into()), None)),
        }
    })
    .boxed()
}
