// ricepipe CLI entry point

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use ricepipe::{Execution, Pipeline, PipelineConfig, PipelineError, ProcessSpec, StderrMode};
use ricepipe_cache::{CacheKey, ResultCache};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "ricepipe", version, about = "Stream lines through external commands")]
struct Cli {
    /// Config file (defaults to <config_dir>/ricepipe/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// What to do with child stderr
    #[arg(long, global = true, value_enum)]
    stderr: Option<StderrMode>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pipe stdin lines through one command and print its output lines
    Run {
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },

    /// Run a command per stdin line, substituting `{}` with the line
    Map {
        /// Commands running at once (defaults to config, then CPU count)
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Print results as they complete instead of in input order
        #[arg(long)]
        unordered: bool,

        /// Memoize outputs in the result cache
        #[arg(long)]
        cache: bool,

        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("ricepipe: {err:#}");
        let code = err
            .downcast_ref::<PipelineError>()
            .and_then(PipelineError::exit_code)
            .filter(|code| *code != 0)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load_from(path.clone()),
        None => PipelineConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(mode) = cli.stderr {
        config.stderr = mode;
    }
    config.validate().context("Invalid configuration")?;
    init_logging(&config);
    debug!(?config, "Configuration loaded");

    match cli.command {
        Command::Run { command } => run_command(&config, &command).await,
        Command::Map {
            jobs,
            unordered,
            cache,
            command,
        } => {
            if jobs == Some(0) {
                bail!("--jobs must be greater than 0");
            }
            let limit = jobs.unwrap_or_else(|| config.concurrency());
            map_command(&config, &command, limit, unordered, cache).await
        }
    }
}

/// Initialize tracing for the CLI, writing to stderr
fn init_logging(config: &PipelineConfig) {
    let level = config
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(level >= tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .init();
}

fn stdin_lines() -> Pipeline<String> {
    Pipeline::from_try_stream(ReaderStream::new(tokio::io::stdin())).lines()
}

fn spec_from(command: &[String]) -> Result<ProcessSpec> {
    let Some((program, args)) = command.split_first() else {
        bail!("no command given");
    };
    Ok(ProcessSpec::new(program).args(args))
}

/// Replace `{}` in every argument with `line`, appending it when no placeholder exists
fn substitute(command: &[String], line: &str) -> Vec<String> {
    if command.iter().skip(1).any(|arg| arg.contains("{}")) {
        let mut substituted = Vec::with_capacity(command.len());
        substituted.extend(command.first().cloned());
        substituted.extend(command.iter().skip(1).map(|arg| arg.replace("{}", line)));
        substituted
    } else {
        let mut appended = command.to_vec();
        appended.push(line.to_string());
        appended
    }
}

async fn run_command(config: &PipelineConfig, command: &[String]) -> Result<()> {
    let spec = spec_from(command)?;
    let options = ricepipe::RunOptions::default().stderr(config.stderr.policy());
    let mut lines = stdin_lines().run_with(spec, options).lines();

    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next().await {
        let line = line?;
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await?;
    Ok(())
}

async fn map_command(
    config: &PipelineConfig,
    command: &[String],
    limit: usize,
    unordered: bool,
    cache: bool,
) -> Result<()> {
    spec_from(command)?;
    let cache = cache.then(|| {
        ResultCache::new(config.cache_dir()).with_staleness(config.cache_staleness())
    });
    let stderr = config.stderr;
    let template = command.to_vec();

    let job = move |line: String| {
        let argv = substitute(&template, &line);
        let cache = cache.clone();
        async move {
            let output = |argv: Vec<String>| async move {
                let spec = spec_from(&argv).map_err(|e| PipelineError::msg(e.to_string()))?;
                let output = Execution::new(spec).stderr(stderr.policy()).output()?;
                Pipeline::from_try_stream(output).text().await
            };
            match cache {
                Some(cache) => {
                    let key = CacheKey::new(argv.clone())?;
                    cache.get_or_compute(&key, || output(argv)).await
                }
                None => output(argv).await,
            }
        }
    };

    let lines = stdin_lines();
    let mut results = if unordered {
        lines.concurrent_unordered_map(job, limit)?
    } else {
        lines.concurrent_map(job, limit)?
    };

    let mut stdout = tokio::io::stdout();
    while let Some(text) = results.next().await {
        stdout.write_all(text?.as_bytes()).await?;
    }
    stdout.flush().await?;
    Ok(())
}
