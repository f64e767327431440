//! Code blocks and the results of running them.

use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};

/// Exit code reported when a block is killed for exceeding its timeout.
/// Matches coreutils `timeout`.
pub const EXIT_CODE_TIMEOUT: i32 = 124;

/// Exit code reported when a block is killed because its call was cancelled.
pub const EXIT_CODE_CANCELLED: i32 = 130;

/// One unit of source code tagged with a language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub language: String,
    pub code: String,
}

impl CodeBlock {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
        }
    }
}

/// Outcome of a single block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockResult {
    /// Exit code of the command, or one of the sentinel codes on forced termination.
    pub exit_code: i32,
    /// Captured stdout and stderr, in arrival order.
    pub output: String,
}

impl BlockResult {
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub const fn timed_out(&self) -> bool {
        self.exit_code == EXIT_CODE_TIMEOUT
    }

    pub const fn was_cancelled(&self) -> bool {
        self.exit_code == EXIT_CODE_CANCELLED
    }
}

/// Aggregate outcome of one `execute_code_blocks` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLineCodeResult {
    pub exit_code: i32,
    pub output: String,
}

/// Folds block results into a [`CommandLineCodeResult`].
///
/// Output is concatenated in submission order. The first non-zero exit
/// code becomes the call's exit code and stops the fold: `record` returns
/// `Break` and the caller must not run any further block.
#[derive(Debug, Default)]
pub struct ResultAccumulator {
    output: String,
    exit_code: i32,
    executed: usize,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: BlockResult) -> ControlFlow<()> {
        debug_assert_eq!(self.exit_code, 0, "recorded a block after a failure");
        self.executed += 1;
        self.output.push_str(&result.output);
        if result.is_success() {
            ControlFlow::Continue(())
        } else {
            self.exit_code = result.exit_code;
            ControlFlow::Break(())
        }
    }

    /// Number of blocks recorded so far.
    pub const fn executed(&self) -> usize {
        self.executed
    }

    pub fn finish(self) -> CommandLineCodeResult {
        CommandLineCodeResult {
            exit_code: self.exit_code,
            output: self.output,
        }
    }
}
