//! Lifecycle manager for one execution environment.
//!
//! `CodeExecutor` owns the environment from `start()` to `stop()` and runs
//! calls of sequential code blocks inside it, one call at a time.
//!
//! Locking: the handle mutex guards lifecycle state and is held for the
//! whole of `start()` and `stop()`. A call takes it only briefly, and while
//! holding it *tries* the execution lock, so a call never waits on the
//! handle while holding the execution lock. `stop()` cancels the in-flight
//! call and then waits (bounded) for the execution lock before teardown.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::StreamExt;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::backend::{
    container_name, DockerProvider, EnvironmentId, EnvironmentProvider, EnvironmentSpec,
    ExecRequest, ExecStream,
};
use crate::block::{
    BlockResult, CodeBlock, CommandLineCodeResult, ResultAccumulator, EXIT_CODE_CANCELLED,
};
use crate::cancellation::CancellationToken;
use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, Result};
use crate::functions;
use crate::language::{BlockPlan, CommandMapper};
use crate::runner::{BlockRunner, StagingArea, CANCELLED_MESSAGE};

/// How long `stop()` waits for a cancelled call to wind down before tearing
/// the environment out from under it.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of the execution environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentStatus {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// The environment as seen by the executor. Never handed out.
#[derive(Debug)]
struct EnvironmentHandle {
    name: String,
    id: Option<EnvironmentId>,
    work_dir: Option<PathBuf>,
    /// Owned scratch directory when no `work_dir` was configured.
    temp_dir: Option<TempDir>,
    /// Functions module written at start-up.
    functions_file: Option<PathBuf>,
    status: EnvironmentStatus,
}

/// Runs code blocks in an isolated environment provided by `P`.
pub struct CodeExecutor<P: EnvironmentProvider + 'static> {
    provider: Arc<P>,
    config: ExecutorConfig,
    mapper: CommandMapper,
    handle: Mutex<EnvironmentHandle>,
    exec_lock: Mutex<()>,
    /// Token of the call currently executing, cancelled by `stop()`.
    in_flight: StdMutex<Option<CancellationToken>>,
}

impl CodeExecutor<DockerProvider> {
    /// Executor backed by the local Docker daemon.
    pub fn docker(config: ExecutorConfig) -> Result<Self> {
        let provider = DockerProvider::connect()
            .map_err(|e| ExecutorError::EnvironmentStart(format!("cannot reach Docker: {e}")))?;
        Ok(Self::new(config, provider))
    }
}

impl<P: EnvironmentProvider + 'static> CodeExecutor<P> {
    pub fn new(config: ExecutorConfig, provider: P) -> Self {
        let name = config.container_name.clone().unwrap_or_else(container_name);
        Self {
            provider: Arc::new(provider),
            config,
            mapper: CommandMapper::default(),
            handle: Mutex::new(EnvironmentHandle {
                name,
                id: None,
                work_dir: None,
                temp_dir: None,
                functions_file: None,
                status: EnvironmentStatus::Uninitialized,
            }),
            exec_lock: Mutex::new(()),
            in_flight: StdMutex::new(None),
        }
    }

    /// Replace the language table.
    #[must_use]
    pub fn with_mapper(mut self, mapper: CommandMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Module blocks import configured functions from.
    pub fn functions_module(&self) -> &str {
        &self.config.functions_module
    }

    pub async fn status(&self) -> EnvironmentStatus {
        self.handle.lock().await.status
    }

    /// Host directory blocks are staged in, once started.
    pub async fn work_dir(&self) -> Option<PathBuf> {
        self.handle.lock().await.work_dir.clone()
    }

    fn in_flight(&self) -> StdMutexGuard<'_, Option<CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring up the execution environment.
    ///
    /// A no-op when already running. Fails with `InvalidState` once the
    /// executor has been stopped. On failure anything partially created is
    /// torn down and the executor returns to `Uninitialized`.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        match handle.status {
            EnvironmentStatus::Running => return Ok(()),
            EnvironmentStatus::Uninitialized => {}
            status => {
                return Err(ExecutorError::InvalidState {
                    operation: "start",
                    status,
                })
            }
        }

        handle.status = EnvironmentStatus::Starting;
        match self.bring_up(&mut handle).await {
            Ok(()) => {
                handle.status = EnvironmentStatus::Running;
                info!(
                    environment = %handle.name,
                    work_dir = ?handle.work_dir,
                    "Execution environment running"
                );
                Ok(())
            }
            Err(e) => {
                warn!(environment = %handle.name, error = %e, "Start failed, cleaning up");
                self.release(&mut handle).await;
                handle.status = EnvironmentStatus::Uninitialized;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, handle: &mut EnvironmentHandle) -> Result<()> {
        // Leftover from an earlier failed start whose cleanup also failed.
        if let Some(stale) = handle.id.clone() {
            self.provider
                .destroy_environment(&stale)
                .await
                .map_err(|e| start_error("stale environment", e))?;
            handle.id = None;
        }

        let work_dir = match &self.config.work_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| start_error("cannot create work dir", e))?;
                dir.clone()
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("code-exec-")
                    .tempdir()
                    .map_err(|e| start_error("cannot create temp dir", e))?;
                let path = dir.path().to_path_buf();
                handle.temp_dir = Some(dir);
                path
            }
        };
        handle.work_dir = Some(work_dir.clone());

        let spec =
            EnvironmentSpec::from_config(&self.config, handle.name.clone(), work_dir.clone());
        // Record the name first so a failure below still gets torn down.
        handle.id = Some(EnvironmentId(handle.name.clone()));
        let id = self
            .provider
            .create_environment(&spec)
            .await
            .map_err(|e| start_error("provider", e))?;
        handle.id = Some(id.clone());

        if let Some(init) = &self.config.init_command {
            debug!(command = %init, "Running init command");
            let argv = vec!["sh".into(), "-c".into(), init.clone()];
            self.run_setup(&id, "init command", argv).await?;
        }
        if !self.config.functions.is_empty() {
            self.install_functions(handle, &id, &work_dir).await?;
        }
        Ok(())
    }

    /// Write the functions module into the work dir and install the
    /// packages the functions need.
    async fn install_functions(
        &self,
        handle: &mut EnvironmentHandle,
        env: &EnvironmentId,
        work_dir: &Path,
    ) -> Result<()> {
        let path = work_dir.join(format!("{}.py", self.config.functions_module));
        let source = functions::build_functions_file(&self.config.functions);
        tokio::fs::write(&path, source)
            .await
            .map_err(|e| start_error("cannot write functions module", e))?;
        handle.functions_file = Some(path);

        let packages = functions::required_packages(&self.config.functions);
        if !packages.is_empty() {
            info!(packages = ?packages, "Installing function requirements");
            let mut argv: Vec<String> = ["python", "-m", "pip", "install", "-qqq"]
                .into_iter()
                .map(String::from)
                .collect();
            argv.extend(packages);
            self.run_setup(env, "pip install", argv).await?;
        }
        debug!(
            module = %self.config.functions_module,
            functions = self.config.functions.len(),
            "Functions module ready"
        );
        Ok(())
    }

    /// Run a start-up command to completion; a non-zero exit fails the start.
    async fn run_setup(&self, env: &EnvironmentId, what: &str, argv: Vec<String>) -> Result<()> {
        let ExecStream { handle, mut output } = self
            .provider
            .exec(env, ExecRequest::new(argv))
            .await
            .map_err(|e| start_error(what, e))?;

        let mut bytes = Vec::new();
        while let Some(chunk) = output.next().await {
            bytes.extend(chunk.map_err(|e| start_error(what, e))?);
        }
        let code = self
            .provider
            .exit_code(env, &handle)
            .await
            .map_err(|e| start_error(what, e))?;

        if code != 0 {
            return Err(ExecutorError::EnvironmentStart(format!(
                "{what} exited with {code}: {}",
                String::from_utf8_lossy(&bytes).trim()
            )));
        }
        Ok(())
    }

    /// Tear down the environment and release everything it holds.
    ///
    /// Safe in any state and idempotent. An in-flight call is cancelled
    /// first. Teardown failures are logged; the executor always ends up
    /// `Stopped`.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut handle = self.handle.lock().await;
        if handle.status == EnvironmentStatus::Stopped {
            return;
        }
        handle.status = EnvironmentStatus::Stopping;

        let in_flight = self.in_flight().take();
        if let Some(token) = in_flight {
            info!("Cancelling in-flight execution before teardown");
            token.cancel();
        }
        let drained = tokio::time::timeout(STOP_DRAIN_TIMEOUT, self.exec_lock.lock()).await;
        if drained.is_err() {
            warn!("In-flight execution did not finish, tearing down anyway");
        }

        self.release(&mut handle).await;
        handle.status = EnvironmentStatus::Stopped;
        info!(environment = %handle.name, "Execution environment stopped");
    }

    /// Destroy the environment and delete an owned scratch directory.
    async fn release(&self, handle: &mut EnvironmentHandle) {
        if let Some(id) = handle.id.take() {
            if let Err(e) = self.provider.destroy_environment(&id).await {
                warn!(environment = %id, error = %e, "Failed to destroy environment");
                // Kept so a later start or drop retries the teardown.
                handle.id = Some(id);
            }
        }
        if let Some(dir) = handle.temp_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove work dir");
            }
        }
        if let Some(path) = handle.functions_file.take() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove functions module");
                }
            }
        }
        handle.work_dir = None;
    }

    /// Run `blocks` in order and aggregate their results.
    ///
    /// Every block is resolved before anything runs, so an unsupported
    /// language or bad filename fails the call without side effects.
    /// Execution stops at the first non-zero exit code or on cancellation;
    /// a failing block is reported through the result, not as an error.
    /// Staged files are removed however the call ends.
    #[instrument(skip_all, fields(blocks = blocks.len()))]
    pub async fn execute_code_blocks(
        &self,
        blocks: &[CodeBlock],
        token: &CancellationToken,
    ) -> Result<CommandLineCodeResult> {
        let (env, work_dir, call_token, _exec_guard) = {
            let handle = self.handle.lock().await;
            if handle.status != EnvironmentStatus::Running {
                return Err(ExecutorError::InvalidState {
                    operation: "execute code blocks",
                    status: handle.status,
                });
            }
            let guard = self
                .exec_lock
                .try_lock()
                .map_err(|_| ExecutorError::ConcurrentExecution)?;
            let (Some(env), Some(work_dir)) = (handle.id.clone(), handle.work_dir.clone()) else {
                return Err(ExecutorError::InvalidState {
                    operation: "execute code blocks",
                    status: handle.status,
                });
            };

            let call_token = CancellationToken::new();
            *self.in_flight() = Some(call_token.clone());
            (env, work_dir, call_token, guard)
        };
        let _in_flight = InFlight(&self.in_flight);

        let plans = self.plan(blocks, &work_dir)?;

        let _link = token.on_cancel({
            let call_token = call_token.clone();
            move || call_token.cancel()
        });

        let runner = BlockRunner::new(&*self.provider, &env, &work_dir, self.config.timeout())
            .with_output_cap(self.config.max_output_bytes);
        let mut staging = StagingArea::new(&work_dir).keep_files(!self.config.delete_tmp_files);
        let mut results = ResultAccumulator::new();

        for plan in &plans {
            let result = if call_token.is_cancelled() {
                BlockResult {
                    exit_code: EXIT_CODE_CANCELLED,
                    output: CANCELLED_MESSAGE.trim_start().to_string(),
                }
            } else {
                runner.run_planned(plan, &mut staging, &call_token).await?
            };
            if results.record(result).is_break() {
                break;
            }
        }

        debug!(executed = results.executed(), "Call finished");
        Ok(results.finish())
    }

    fn plan(&self, blocks: &[CodeBlock], work_dir: &Path) -> Result<Vec<BlockPlan>> {
        let mut names = HashSet::new();
        blocks
            .iter()
            .map(|block| {
                let plan = self.mapper.plan(block, self.config.silence_pip)?;
                if !names.insert(plan.file_name.clone()) {
                    return Err(ExecutorError::InvalidFilename(format!(
                        "'{}' is used by more than one block",
                        plan.file_name
                    )));
                }
                if work_dir.join(&plan.file_name).exists() {
                    return Err(ExecutorError::InvalidFilename(format!(
                        "'{}' already exists in the working directory",
                        plan.file_name
                    )));
                }
                Ok(plan)
            })
            .collect()
    }
}

impl<P: EnvironmentProvider + 'static> Drop for CodeExecutor<P> {
    fn drop(&mut self) {
        let handle = self.handle.get_mut();
        let Some(id) = handle.id.take() else {
            return;
        };

        warn!(environment = %id, "Executor dropped without stop(), destroying environment");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let provider = Arc::clone(&self.provider);
                runtime.spawn(async move {
                    if let Err(e) = provider.destroy_environment(&id).await {
                        warn!(environment = %id, error = %e, "Failed to destroy environment");
                    }
                });
            }
            Err(_) => warn!(environment = %id, "No async runtime, environment leaked"),
        }
    }
}

/// Clears the in-flight token when a call ends, however it ends.
struct InFlight<'a>(&'a StdMutex<Option<CancellationToken>>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

fn start_error(what: &str, err: impl fmt::Display) -> ExecutorError {
    ExecutorError::EnvironmentStart(format!("{what}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExecHandle, ProcessProvider};
    use crate::block::EXIT_CODE_TIMEOUT;
    use crate::config::BackendType;
    use crate::functions::FunctionWithRequirements;
    use crate::error::ProviderError;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    /// Process provider that counts execs and can refuse to create.
    #[derive(Default)]
    struct Recording {
        inner: ProcessProvider,
        refuse_create: bool,
        execs: AtomicUsize,
    }

    #[async_trait]
    impl EnvironmentProvider for Recording {
        async fn create_environment(
            &self,
            spec: &EnvironmentSpec,
        ) -> std::result::Result<EnvironmentId, ProviderError> {
            if self.refuse_create {
                return Err(ProviderError::Exec("daemon unavailable".into()));
            }
            self.inner.create_environment(spec).await
        }

        async fn exec(
            &self,
            env: &EnvironmentId,
            request: ExecRequest,
        ) -> std::result::Result<ExecStream, ProviderError> {
            self.execs.fetch_add(1, Ordering::SeqCst);
            self.inner.exec(env, request).await
        }

        async fn exit_code(
            &self,
            env: &EnvironmentId,
            exec: &ExecHandle,
        ) -> std::result::Result<i64, ProviderError> {
            self.inner.exit_code(env, exec).await
        }

        async fn terminate(
            &self,
            env: &EnvironmentId,
            exec: &ExecHandle,
        ) -> std::result::Result<(), ProviderError> {
            self.inner.terminate(env, exec).await
        }

        async fn destroy_environment(
            &self,
            env: &EnvironmentId,
        ) -> std::result::Result<(), ProviderError> {
            self.inner.destroy_environment(env).await
        }

        async fn list_environments(
            &self,
        ) -> std::result::Result<Vec<EnvironmentId>, ProviderError> {
            self.inner.list_environments().await
        }
    }

    fn config(dir: &Path) -> ExecutorConfig {
        ExecutorConfig {
            backend: BackendType::Process,
            work_dir: Some(dir.to_path_buf()),
            ..ExecutorConfig::default()
        }
    }

    fn executor(dir: &Path) -> CodeExecutor<Recording> {
        CodeExecutor::new(config(dir), Recording::default())
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    fn sh(code: &str) -> CodeBlock {
        CodeBlock::new("sh", code)
    }

    #[tokio::test]
    async fn execute_before_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        let err = executor
            .execute_code_blocks(&[sh("touch ran")], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExecutorError::InvalidState {
                status: EnvironmentStatus::Uninitialized,
                ..
            }
        ));
        assert!(files_in(dir.path()).is_empty());
        assert_eq!(executor.provider().execs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn runs_blocks_and_cleans_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        assert_ok!(executor.start().await);
        assert_eq!(executor.status().await, EnvironmentStatus::Running);

        let result = executor
            .execute_code_blocks(&[sh("echo hello"), sh("echo world")], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "hello\nworld\n");
        assert!(files_in(dir.path()).is_empty(), "staged files left behind");
        executor.stop().await;
    }

    #[tokio::test]
    async fn empty_call_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        executor.start().await.unwrap();

        let result = executor
            .execute_code_blocks(&[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.output.is_empty());
        executor.stop().await;
    }

    #[tokio::test]
    async fn stops_at_first_failing_block() {
        let dir = tempfile::tempdir().unwrap();
        let marker = tempfile::tempdir().unwrap();
        let marker_path = marker.path().join("third-ran");
        let executor = executor(dir.path());
        executor.start().await.unwrap();

        let result = executor
            .execute_code_blocks(
                &[
                    sh("echo one"),
                    sh("echo two\nexit 3"),
                    sh(&format!("touch '{}'", marker_path.display())),
                ],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.output, "one\ntwo\n");
        assert!(!marker_path.exists(), "block after the failure ran");
        assert_eq!(executor.provider().execs.load(Ordering::SeqCst), 2);
        executor.stop().await;
    }

    #[tokio::test]
    async fn named_files_are_visible_to_later_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        executor.start().await.unwrap();

        let result = executor
            .execute_code_blocks(
                &[
                    sh("# filename: lib.sh\ngreet() { echo \"hi $1\"; }"),
                    sh(". ./lib.sh\ngreet there"),
                ],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "hi there\n");
        assert!(!dir.path().join("lib.sh").exists());
        executor.stop().await;
    }

    #[tokio::test]
    async fn duplicate_file_names_are_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        executor.start().await.unwrap();

        let err = executor
            .execute_code_blocks(
                &[sh("# filename: a.sh\ntrue"), sh("# filename: a.sh\ntrue")],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::InvalidFilename(_)));
        assert_eq!(executor.provider().execs.load(Ordering::SeqCst), 0);
        executor.stop().await;
    }

    #[tokio::test]
    async fn unsupported_language_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        executor.start().await.unwrap();

        let err = executor
            .execute_code_blocks(
                &[
                    sh(&format!("touch '{}'", marker.path().join("ran").display())),
                    CodeBlock::new("cobol", "DISPLAY 'HI'."),
                ],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::UnsupportedLanguage(ref l) if l == "cobol"));
        assert!(files_in(marker.path()).is_empty());
        assert!(files_in(dir.path()).is_empty());
        assert_eq!(executor.provider().execs.load(Ordering::SeqCst), 0);
        executor.stop().await;
    }

    #[tokio::test]
    async fn timeout_reports_sentinel_and_stops_call() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CodeExecutor::new(
            ExecutorConfig {
                timeout_seconds: 1,
                ..config(dir.path())
            },
            Recording::default(),
        );
        executor.start().await.unwrap();

        let result = executor
            .execute_code_blocks(
                &[sh("echo start\nsleep 30"), sh("echo never")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.exit_code, EXIT_CODE_TIMEOUT);
        assert!(result.output.starts_with("start\n"));
        assert!(!result.output.contains("never"));
        executor.stop().await;
    }

    #[tokio::test]
    async fn cancellation_keeps_earlier_output() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        executor.start().await.unwrap();
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                token.cancel();
            })
        };

        let started = Instant::now();
        let result = executor
            .execute_code_blocks(&[sh("echo first"), sh("sleep 30"), sh("echo third")], &token)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.exit_code, EXIT_CODE_CANCELLED);
        assert!(result.output.starts_with("first\n"));
        assert!(!result.output.contains("third"));

        // The environment is still usable after a cancelled call.
        let again = executor
            .execute_code_blocks(&[sh("echo again")], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.output, "again\n");
        executor.stop().await;
    }

    #[tokio::test]
    async fn cancelled_before_call_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        executor.start().await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let result = executor
            .execute_code_blocks(&[sh("echo never")], &token)
            .await
            .unwrap();

        assert_eq!(result.exit_code, EXIT_CODE_CANCELLED);
        assert_eq!(result.output, "Code execution was cancelled.");
        assert_eq!(executor.provider().execs.load(Ordering::SeqCst), 0);
        executor.stop().await;
    }

    #[tokio::test]
    async fn concurrent_call_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(executor(dir.path()));
        executor.start().await.unwrap();
        let token = CancellationToken::new();

        let first = {
            let executor = Arc::clone(&executor);
            let token = token.clone();
            tokio::spawn(async move {
                executor
                    .execute_code_blocks(&[sh("sleep 30")], &token)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = executor
            .execute_code_blocks(&[sh("echo second")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ConcurrentExecution));

        token.cancel();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.exit_code, EXIT_CODE_CANCELLED);
        executor.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_call() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(executor(dir.path()));
        executor.start().await.unwrap();

        let running = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                executor
                    .execute_code_blocks(&[sh("echo busy\nsleep 30")], &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        executor.stop().await;
        assert!(started.elapsed() < Duration::from_secs(10));

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.exit_code, EXIT_CODE_CANCELLED);
        assert!(result.output.starts_with("busy\n"));
        assert_eq!(executor.status().await, EnvironmentStatus::Stopped);
        assert!(executor.provider().list_environments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        assert_eq!(executor.status().await, EnvironmentStatus::Uninitialized);

        executor.start().await.unwrap();
        // Starting twice is a no-op.
        executor.start().await.unwrap();
        assert_eq!(executor.provider().list_environments().await.unwrap().len(), 1);

        executor.stop().await;
        executor.stop().await;
        assert_eq!(executor.status().await, EnvironmentStatus::Stopped);
        assert!(executor.provider().list_environments().await.unwrap().is_empty());

        let err = assert_err!(executor.start().await);
        assert!(matches!(
            err,
            ExecutorError::InvalidState {
                status: EnvironmentStatus::Stopped,
                ..
            }
        ));
        let err = executor
            .execute_code_blocks(&[sh("true")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot execute code blocks while environment is stopped");
    }

    #[tokio::test]
    async fn failed_start_leaves_nothing_behind() {
        let executor = CodeExecutor::new(
            ExecutorConfig {
                backend: BackendType::Process,
                ..ExecutorConfig::default()
            },
            Recording {
                refuse_create: true,
                ..Recording::default()
            },
        );

        let err = assert_err!(executor.start().await);
        assert!(matches!(
            err,
            ExecutorError::EnvironmentStart(ref m) if m.contains("daemon unavailable")
        ));
        assert_eq!(executor.status().await, EnvironmentStatus::Uninitialized);
        assert!(executor.work_dir().await.is_none());

        executor.stop().await;
        assert_eq!(executor.status().await, EnvironmentStatus::Stopped);
        assert!(executor.provider().list_environments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn init_command_runs_once_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CodeExecutor::new(
            ExecutorConfig {
                init_command: Some("echo ready > init.txt".into()),
                ..config(dir.path())
            },
            Recording::default(),
        );

        executor.start().await.unwrap();
        let init = std::fs::read_to_string(dir.path().join("init.txt")).unwrap();
        assert_eq!(init, "ready\n");
        executor.stop().await;
    }

    #[tokio::test]
    async fn failing_init_command_aborts_start() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CodeExecutor::new(
            ExecutorConfig {
                init_command: Some("echo broken >&2; exit 2".into()),
                ..config(dir.path())
            },
            Recording::default(),
        );

        let err = assert_err!(executor.start().await);
        let ExecutorError::EnvironmentStart(message) = &err else {
            panic!("expected start error, got {err:?}");
        };
        assert!(message.contains("exited with 2"));
        assert!(message.contains("broken"));
        assert_eq!(executor.status().await, EnvironmentStatus::Uninitialized);
        assert!(executor.provider().list_environments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn owned_temp_dir_is_removed_on_stop() {
        let executor = CodeExecutor::new(
            ExecutorConfig {
                backend: BackendType::Process,
                ..ExecutorConfig::default()
            },
            Recording::default(),
        );
        executor.start().await.unwrap();
        let work_dir = executor.work_dir().await.unwrap();
        assert!(work_dir.is_dir());

        executor.stop().await;
        assert!(!work_dir.exists());
        assert!(executor.work_dir().await.is_none());
    }

    #[tokio::test]
    async fn dropping_without_stop_destroys_environment() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ProcessProvider::new());
        let executor = CodeExecutor::new(config(dir.path()), Arc::clone(&provider));
        executor.start().await.unwrap();
        assert_eq!(provider.list_environments().await.unwrap().len(), 1);

        drop(executor);
        for _ in 0..50 {
            if provider.list_environments().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(provider.list_environments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn existing_files_are_never_staged_over() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.sh"), "user file").unwrap();
        let executor = executor(dir.path());
        executor.start().await.unwrap();

        let err = executor
            .execute_code_blocks(
                &[sh("# filename: report.sh\necho replaced")],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExecutorError::InvalidFilename(ref m) if m.contains("already exists")
        ));
        let kept = std::fs::read_to_string(dir.path().join("report.sh")).unwrap();
        assert_eq!(kept, "user file");
        executor.stop().await;
    }

    #[tokio::test]
    async fn staged_files_can_be_kept() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CodeExecutor::new(
            ExecutorConfig {
                delete_tmp_files: false,
                ..config(dir.path())
            },
            Recording::default(),
        );
        executor.start().await.unwrap();

        executor
            .execute_code_blocks(
                &[sh("# filename: kept.sh\necho kept")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(dir.path().join("kept.sh").exists());
        executor.stop().await;
    }

    fn greet() -> FunctionWithRequirements {
        FunctionWithRequirements::new("def greet(name):\n    return f'hello {name}'")
            .with_imports(["json"])
    }

    #[tokio::test]
    async fn functions_module_is_written_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CodeExecutor::new(
            ExecutorConfig {
                functions: vec![greet()],
                functions_module: "helpers".into(),
                ..config(dir.path())
            },
            Recording::default(),
        );
        assert_eq!(executor.functions_module(), "helpers");
        executor.start().await.unwrap();

        let result = executor
            .execute_code_blocks(&[sh("cat helpers.py")], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(
            result.output,
            "import json\n\ndef greet(name):\n    return f'hello {name}'\n\n"
        );

        executor.stop().await;
        assert!(!dir.path().join("helpers.py").exists());
    }

    fn has_python() -> bool {
        std::process::Command::new("python")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    }

    #[tokio::test]
    async fn blocks_import_configured_functions() {
        if !has_python() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let executor = CodeExecutor::new(
            ExecutorConfig {
                functions: vec![greet()],
                ..config(dir.path())
            },
            Recording::default(),
        );
        executor.start().await.unwrap();

        let code = format!(
            "from {} import greet\nprint(greet('world'))",
            executor.functions_module()
        );
        let result = executor
            .execute_code_blocks(&[CodeBlock::new("python", code)], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "hello world\n");
        executor.stop().await;
    }

    #[tokio::test]
    async fn failed_requirement_install_aborts_start() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CodeExecutor::new(
            ExecutorConfig {
                functions: vec![greet().with_packages(["no-such-package-for-code-executor-0"])],
                ..config(dir.path())
            },
            Recording::default(),
        );

        let err = assert_err!(executor.start().await);
        assert!(matches!(err, ExecutorError::EnvironmentStart(ref m) if m.contains("pip install")));
        assert_eq!(executor.status().await, EnvironmentStatus::Uninitialized);
        assert!(!dir.path().join("functions.py").exists());
        assert!(executor.provider().list_environments().await.unwrap().is_empty());
    }

    #[test]
    fn status_display_is_lowercase() {
        assert_eq!(EnvironmentStatus::Uninitialized.to_string(), "uninitialized");
        assert_eq!(EnvironmentStatus::Stopping.to_string(), "stopping");
    }
}
