//! docker-code-executor
//!
//! Runs a JSON list of code blocks in a fresh container and prints the
//! combined output. The process exits with the call's exit code.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use docker_code_executor::backend::{EnvironmentProvider, ProcessProvider};
use docker_code_executor::config::BackendType;
use docker_code_executor::language::CommandMapper;
use docker_code_executor::{
    CancellationToken, CodeBlock, CodeExecutor, CommandLineCodeResult, ExecutorConfig,
};

#[derive(Parser, Debug)]
#[command(name = "docker-code-executor")]
#[command(about = "Run code blocks in an ephemeral sandbox")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute code blocks from a JSON file (`-` for stdin)
    Run {
        /// JSON array of `{"language": ..., "code": ...}` objects
        blocks: String,

        /// JSON config file; defaults to `CODE_EXECUTOR_CONFIG`
        #[arg(long)]
        config: Option<PathBuf>,

        /// Container image
        #[arg(long)]
        image: Option<String>,

        /// Per-block timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Host directory to stage code in
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Environment provider
        #[arg(long, value_enum)]
        backend: Option<BackendType>,
    },

    /// List the supported language tags
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the blocks' output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Languages => {
            for language in CommandMapper::new().languages() {
                println!("{language}");
            }
            Ok(())
        }
        Command::Run {
            blocks,
            config,
            image,
            timeout,
            work_dir,
            backend,
        } => {
            let mut config = match config {
                Some(path) => ExecutorConfig::from_file(&path)?,
                None => ExecutorConfig::from_env().context("Failed to load configuration")?,
            };
            if let Some(image) = image {
                config.image = image;
            }
            if let Some(timeout) = timeout {
                config.timeout_seconds = timeout;
            }
            if work_dir.is_some() {
                config.work_dir = work_dir;
            }
            if let Some(backend) = backend {
                config.backend = backend;
            }
            config.validate()?;

            let blocks = read_blocks(&blocks)?;
            info!(
                backend = ?config.backend,
                image = %config.image,
                blocks = blocks.len(),
                "Loaded configuration"
            );

            let result = match config.backend {
                BackendType::Docker => run(CodeExecutor::docker(config)?, &blocks).await?,
                BackendType::Process => {
                    let provider = config
                        .wrapper
                        .clone()
                        .map_or_else(ProcessProvider::new, ProcessProvider::with_wrapper);
                    run(CodeExecutor::new(config, provider), &blocks).await?
                }
            };

            let mut stdout = std::io::stdout();
            stdout.write_all(result.output.as_bytes())?;
            stdout.flush()?;
            std::process::exit(result.exit_code);
        }
    }
}

fn read_blocks(source: &str) -> Result<Vec<CodeBlock>> {
    let json = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read blocks from stdin")?;
        buf
    } else {
        std::fs::read_to_string(source).with_context(|| format!("Failed to read {source}"))?
    };
    serde_json::from_str(&json).context("Blocks must be a JSON array of {language, code}")
}

/// Start, execute, and always stop. Ctrl-C cancels the call.
async fn run<P: EnvironmentProvider + 'static>(
    executor: CodeExecutor<P>,
    blocks: &[CodeBlock],
) -> Result<CommandLineCodeResult> {
    executor.start().await?;

    let token = CancellationToken::new();
    let interrupt = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling execution");
                token.cancel();
            }
        })
    };

    let result = executor.execute_code_blocks(blocks, &token).await;
    interrupt.abort();
    executor.stop().await;

    Ok(result?)
}
