//! docker-code-executor library
//!
//! Runs untrusted code blocks inside an ephemeral, isolated environment:
//! - Lifecycle management of one environment per [`CodeExecutor`]
//! - Language tag to run command mapping
//! - Per-block timeout and cooperative cancellation
//! - Docker and host-process environment providers
//! - Python functions shared with executed code

pub mod backend;
pub mod block;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod executor;
pub mod functions;
pub mod language;
pub mod runner;

pub use block::{CodeBlock, CommandLineCodeResult, EXIT_CODE_CANCELLED, EXIT_CODE_TIMEOUT};
pub use cancellation::CancellationToken;
pub use config::ExecutorConfig;
pub use error::{ExecutorError, ProviderError};
pub use executor::{CodeExecutor, EnvironmentStatus};
pub use functions::FunctionWithRequirements;
