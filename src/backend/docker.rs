//! Docker backend.
//!
//! One long-lived container per environment, idling on `/bin/sh` with a
//! TTY. Each block runs as a `docker exec` in the bind-mounted working
//! directory.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    EnvironmentId, EnvironmentProvider, EnvironmentSpec, ExecHandle, ExecRequest, ExecStream,
};
use crate::error::ProviderError;

/// Label set on every container this backend creates.
pub const MANAGED_LABEL: &str = "docker-code-executor.managed";

/// Seconds Docker waits for the idle shell to exit before killing it.
const STOP_GRACE_SECS: i32 = 5;

const READY_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

const EXIT_CODE_POLLS: usize = 50;

/// Environment provider backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerProvider {
    docker: Docker,
}

impl DockerProvider {
    /// Connect using the platform's default socket and `DOCKER_HOST`.
    pub fn connect() -> Result<Self, ProviderError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub const fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), ProviderError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found_error(&e) => Err(ProviderError::NotFound(format!(
                "image '{image}' is not available locally; pull or build it first"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_until_running(&self, spec: &EnvironmentSpec) -> Result<(), ProviderError> {
        let deadline = Instant::now() + spec.start_timeout;
        loop {
            let inspect = self
                .docker
                .inspect_container(&spec.name, None::<InspectContainerOptions>)
                .await?;
            let running = inspect
                .state
                .as_ref()
                .and_then(|s| s.running)
                .unwrap_or(false);
            if running {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProviderError::Exec(format!(
                    "container '{}' not running after {:?}",
                    spec.name, spec.start_timeout
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn create_and_start(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentId, ProviderError> {
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            entrypoint: Some(vec!["/bin/sh".to_owned()]),
            tty: Some(true),
            open_stdin: Some(true),
            working_dir: Some(spec.container_work_dir.clone()),
            labels: Some(HashMap::from([(MANAGED_LABEL.to_owned(), "true".to_owned())])),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                extra_hosts: (!spec.extra_hosts.is_empty()).then(|| spec.extra_hosts.clone()),
                auto_remove: Some(spec.auto_remove),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                config,
            )
            .await?;
        for warning in &created.warnings {
            warn!(container = %spec.name, warning = %warning, "Docker create warning");
        }

        self.docker
            .start_container(&spec.name, None::<StartContainerOptions>)
            .await?;
        self.wait_until_running(spec).await?;

        Ok(EnvironmentId(spec.name.clone()))
    }

    async fn remove_container_if_exists(&self, name: &str) -> Result<(), ProviderError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found_error(&e) || is_removal_in_progress(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl EnvironmentProvider for DockerProvider {
    #[instrument(skip(self, spec), fields(container = %spec.name, image = %spec.image))]
    async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentId, ProviderError> {
        self.ensure_image(&spec.image).await?;

        match self.create_and_start(spec).await {
            Ok(id) => {
                info!("Container running");
                Ok(id)
            }
            Err(e) => {
                if let Err(cleanup) = self.remove_container_if_exists(&spec.name).await {
                    warn!(error = %cleanup, "Failed to remove half-started container");
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self, request), fields(container = %env))]
    async fn exec(
        &self,
        env: &EnvironmentId,
        request: ExecRequest,
    ) -> Result<ExecStream, ProviderError> {
        let created = self
            .docker
            .create_exec(
                &env.0,
                CreateExecOptions {
                    cmd: Some(request.command.clone()),
                    env: (!request.env.is_empty()).then(|| {
                        request.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
                    }),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let started = self
            .docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await?;

        let output = match started {
            StartExecResults::Attached { output, .. } => output
                .map(|item| {
                    item.map(|log| match log {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => message.to_vec(),
                    })
                    .map_err(ProviderError::from)
                })
                .boxed(),
            StartExecResults::Detached => {
                return Err(ProviderError::Exec("exec started detached".into()));
            }
        };

        debug!(exec = %created.id, "Exec started");
        Ok(ExecStream {
            handle: ExecHandle {
                id: created.id,
                request,
            },
            output,
        })
    }

    async fn exit_code(
        &self,
        _env: &EnvironmentId,
        exec: &ExecHandle,
    ) -> Result<i64, ProviderError> {
        // The attached stream can close a moment before Docker records the exit.
        for _ in 0..EXIT_CODE_POLLS {
            let inspect = self.docker.inspect_exec(&exec.id).await?;
            if let (Some(false), Some(code)) = (inspect.running, inspect.exit_code) {
                return Ok(code);
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        Err(ProviderError::Exec(format!("exec {} has no exit code", exec.id)))
    }

    #[instrument(skip(self, exec), fields(container = %env, exec = %exec.id))]
    async fn terminate(&self, env: &EnvironmentId, exec: &ExecHandle) -> Result<(), ProviderError> {
        // Docker has no kill for exec instances; match the processes by command line.
        let pattern = exec
            .request
            .kill_pattern
            .clone()
            .unwrap_or_else(|| exec.request.command.join(" "));

        let killer = self
            .exec(
                env,
                ExecRequest::new(kill_command()).with_env(KILL_PATTERN_VAR, pattern.clone()),
            )
            .await?;
        let ExecStream { handle, mut output } = killer;
        let mut report = Vec::new();
        while let Some(chunk) = output.next().await {
            report.extend(chunk?);
        }

        let code = self.exit_code(env, &handle).await?;
        if code != 0 {
            return Err(ProviderError::Exec(format!(
                "killing '{pattern}' exited with {code}: {}",
                String::from_utf8_lossy(&report).trim()
            )));
        }
        debug!("Terminated exec");
        Ok(())
    }

    #[instrument(skip(self), fields(container = %env))]
    async fn destroy_environment(&self, env: &EnvironmentId) -> Result<(), ProviderError> {
        let stop = self
            .docker
            .stop_container(
                &env.0,
                Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
            )
            .await;
        if let Err(e) = stop {
            if !is_not_found_error(&e) {
                debug!(error = %e, "Stop failed, forcing removal");
            }
        }
        self.remove_container_if_exists(&env.0).await?;
        info!("Container removed");
        Ok(())
    }

    async fn list_environments(&self) -> Result<Vec<EnvironmentId>, ProviderError> {
        let filters = HashMap::from([("label".to_owned(), vec![format!("{MANAGED_LABEL}=true")])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                c.names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_owned())
                    .or(c.id)
            })
            .map(EnvironmentId)
            .collect())
    }
}

/// Environment variable carrying the kill pattern, so it never appears in
/// the killer's own command line.
const KILL_PATTERN_VAR: &str = "CODE_EXECUTOR_KILL_PATTERN";

/// SIGKILL every process whose command line contains the pattern, walking
/// `/proc` directly. Slim images ship without procps.
const KILL_BY_PROC: &str = r#"for d in /proc/[0-9]*; do
  pid=${d#/proc/}
  [ "$pid" = "$$" ] && continue
  cmd=$(tr '\0' ' ' < "$d/cmdline" 2>/dev/null) || continue
  case "$cmd" in *"$CODE_EXECUTOR_KILL_PATTERN"*) kill -9 "$pid" 2>/dev/null ;; esac
done
exit 0"#;

/// `pkill` when the image has it (exit 1 means nothing matched), the
/// `/proc` walk otherwise.
fn kill_command() -> Vec<String> {
    let script = format!(
        r#"if command -v pkill >/dev/null 2>&1; then
  pkill -9 -f -- "$CODE_EXECUTOR_KILL_PATTERN"
  [ $? -le 1 ] || exit 1
  exit 0
fi
{KILL_BY_PROC}"#
    );
    vec!["sh".into(), "-c".into(), script]
}

/// Default container name for a new environment.
pub fn container_name() -> String {
    format!("code-exec-{}", Uuid::new_v4())
}

fn is_not_found_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code: 404, .. }
    )
}

fn is_removal_in_progress(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code: 409, message }
            if message.contains("already in progress")
    )
}
