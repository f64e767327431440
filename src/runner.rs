//! Runs one code block inside an environment.
//!
//! The block is written to a uniquely named file in the working directory,
//! its run command is started through the provider, and the command's
//! output is collected while racing the timeout and the cancellation token.
//! When the timeout or the token wins, the command is terminated inside the
//! environment and a sentinel exit code is reported with whatever output
//! arrived before termination.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::stream::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::backend::{EnvironmentId, EnvironmentProvider, ExecHandle, ExecRequest, ExecStream};
use crate::block::{BlockResult, CodeBlock, EXIT_CODE_CANCELLED, EXIT_CODE_TIMEOUT};
use crate::cancellation::CancellationToken;
use crate::error::{ExecutorError, Result};
use crate::language::{BlockPlan, CommandMapper};

/// Upper bound on how long forced termination may take before we give up
/// waiting on the provider.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const TIMEOUT_MESSAGE: &str = "\nTimeout";
pub(crate) const CANCELLED_MESSAGE: &str = "\nCode execution was cancelled.";

/// Files staged during one call. Everything tracked is deleted on drop, so
/// staging never outlives the call regardless of how it ends, unless the
/// area was told to keep its files.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
    files: Vec<PathBuf>,
    keep: bool,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Vec::new(),
            keep: false,
        }
    }

    /// Leave staged files in place when dropped.
    #[must_use]
    pub fn keep_files(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Write the block's code to its file and track it, plus any build
    /// artifacts the run command will leave next to it.
    ///
    /// Never overwrites: a file already present under the block's name
    /// fails with `AlreadyExists`. Artifacts that existed beforehand are
    /// not tracked, so they survive the call.
    pub async fn stage(&mut self, plan: &BlockPlan) -> std::io::Result<PathBuf> {
        let path = self.dir.join(&plan.file_name);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        self.files.push(path.clone());

        for artifact in plan.artifacts() {
            let artifact = self.dir.join(artifact);
            if matches!(tokio::fs::try_exists(&artifact).await, Ok(false)) {
                self.files.push(artifact);
            }
        }

        file.write_all(plan.code.as_bytes()).await?;
        file.flush().await?;
        Ok(path)
    }

    pub fn staged(&self) -> &[PathBuf] {
        &self.files
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        for file in &self.files {
            match std::fs::remove_file(file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %file.display(), error = %e, "Failed to remove staged file"),
            }
        }
    }
}

/// Accumulates output up to an optional byte cap.
struct OutputBuffer {
    bytes: Vec<u8>,
    cap: Option<usize>,
    dropped: usize,
}

impl OutputBuffer {
    const fn new(cap: Option<usize>) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self
            .cap
            .map_or(chunk.len(), |cap| cap.saturating_sub(self.bytes.len()));
        let take = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    fn into_string(mut self) -> String {
        if self.dropped > 0 {
            // Don't leave half a character at the cut.
            if let Err(e) = std::str::from_utf8(&self.bytes) {
                if e.error_len().is_none() {
                    self.dropped += self.bytes.len() - e.valid_up_to();
                    self.bytes.truncate(e.valid_up_to());
                }
            }
        }
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n[output truncated: {} bytes omitted]", self.dropped));
        }
        text
    }
}

enum Outcome {
    Exited(i64),
    TimedOut,
    Cancelled,
}

/// Runs blocks against one environment.
pub struct BlockRunner<'a, P: ?Sized> {
    provider: &'a P,
    env: &'a EnvironmentId,
    work_dir: &'a Path,
    timeout: Duration,
    max_output_bytes: Option<usize>,
}

impl<'a, P: EnvironmentProvider + ?Sized> BlockRunner<'a, P> {
    pub const fn new(
        provider: &'a P,
        env: &'a EnvironmentId,
        work_dir: &'a Path,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            env,
            work_dir,
            timeout,
            max_output_bytes: None,
        }
    }

    #[must_use]
    pub const fn with_output_cap(mut self, max_output_bytes: Option<usize>) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Resolve, stage, and run a single block. Staged files are removed
    /// before this returns.
    pub async fn run(
        &self,
        mapper: &CommandMapper,
        block: &CodeBlock,
        token: &CancellationToken,
    ) -> Result<BlockResult> {
        let plan = mapper.plan(block, false)?;
        let mut staging = StagingArea::new(self.work_dir);
        self.run_planned(&plan, &mut staging, token).await
    }

    /// Stage an already-resolved block into `staging` and run it.
    #[instrument(skip_all, fields(language = %plan.language, file = %plan.file_name))]
    pub async fn run_planned(
        &self,
        plan: &BlockPlan,
        staging: &mut StagingArea,
        token: &CancellationToken,
    ) -> Result<BlockResult> {
        staging.stage(plan).await.map_err(ExecutorError::Staging)?;

        let request = ExecRequest::new(plan.command()).with_kill_pattern(plan.file_name.clone());

        // Scoped to this command: dropping the registration below keeps a
        // later cancellation from firing against the next block.
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let registration = token.on_cancel(move || {
            let _ = cancel_tx.send(());
        });

        let ExecStream { handle, mut output } = self.provider.exec(self.env, request).await?;
        debug!(exec = %handle.id, "Block started");

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut captured = OutputBuffer::new(self.max_output_bytes);

        let mut outcome = None;
        while outcome.is_none() {
            tokio::select! {
                chunk = output.next() => match chunk {
                    Some(Ok(bytes)) => captured.push(&bytes),
                    Some(Err(e)) => {
                        self.terminate(&handle).await;
                        return Err(e.into());
                    }
                    None => break,
                },
                () = &mut deadline => outcome = Some(Outcome::TimedOut),
                _ = &mut cancel_rx => outcome = Some(Outcome::Cancelled),
            }
        }

        // Output closed; the command may still be running, so keep racing.
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => tokio::select! {
                code = self.provider.exit_code(self.env, &handle) => Outcome::Exited(code?),
                () = &mut deadline => Outcome::TimedOut,
                _ = &mut cancel_rx => Outcome::Cancelled,
            },
        };
        drop(registration);
        drop(output);

        let result = match outcome {
            Outcome::Exited(code) => BlockResult {
                exit_code: i32::try_from(code).unwrap_or(-1),
                output: captured.into_string(),
            },
            Outcome::TimedOut => {
                warn!(timeout = ?self.timeout, "Block timed out");
                let failure = self.terminate(&handle).await;
                let mut text = captured.into_string();
                text.push_str(TIMEOUT_MESSAGE);
                push_termination_failure(&mut text, failure);
                BlockResult {
                    exit_code: EXIT_CODE_TIMEOUT,
                    output: text,
                }
            }
            Outcome::Cancelled => {
                debug!("Block cancelled");
                let failure = self.terminate(&handle).await;
                let mut text = captured.into_string();
                text.push_str(CANCELLED_MESSAGE);
                push_termination_failure(&mut text, failure);
                BlockResult {
                    exit_code: EXIT_CODE_CANCELLED,
                    output: text,
                }
            }
        };

        debug!(exit_code = result.exit_code, output_len = result.output.len(), "Block finished");
        Ok(result)
    }

    /// Best-effort forced termination, bounded by [`TERMINATE_GRACE`].
    /// Returns why it failed, if it did.
    async fn terminate(&self, handle: &ExecHandle) -> Option<String> {
        let terminate = self.provider.terminate(self.env, handle);
        match tokio::time::timeout(TERMINATE_GRACE, terminate).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!(exec = %handle.id, error = %e, "Failed to terminate command");
                Some(e.to_string())
            }
            Err(_) => {
                warn!(exec = %handle.id, "Termination did not finish within grace period");
                Some(format!("no response within {TERMINATE_GRACE:?}"))
            }
        }
    }
}

/// The command may still be running; say so in its output.
fn push_termination_failure(text: &mut String, failure: Option<String>) {
    if let Some(reason) = failure {
        text.push_str(&format!("\n[failed to terminate command: {reason}]"));
    }
}
