use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use directory_helpers::config::ProcessConfig;
use directory_helpers::fixture::Directory;
use directory_helpers::logging::init_logging;
use directory_helpers::subprocess::{ChunkSource, SubprocessManager};

/// Start project processes and watch their output
#[derive(Parser)]
#[command(name = "directory-helpers")]
#[command(about = "Start, watch and stop project processes", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the project's start script and wait until it reports readiness
    Start {
        /// Project directory containing the manifest
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Pattern a chunk of output must match for the project to count as ready
        #[arg(short, long)]
        ready: String,

        /// Give up if the project is not ready after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Run a program and print its output as it arrives
    Watch {
        /// Working directory for the program
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Stop the program once a chunk matches this pattern
        #[arg(short, long)]
        until: Option<String>,

        /// Program to run
        program: String,

        /// Arguments passed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = run(cli.command).await;

    if let Err(e) = result {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e}");
        if cli.verbose >= 1 {
            eprintln!("\nError chain:");
            for (i, cause) in e.chain().enumerate() {
                eprintln!("  {i}: {cause}");
            }
        }
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = ProcessConfig::from_env()?;

    match command {
        Commands::Start {
            dir,
            ready,
            timeout,
        } => {
            let config = match timeout {
                Some(secs) => config.with_ready_timeout(Duration::from_secs(secs)),
                None => config,
            };
            run_start(dir, &ready, config).await
        }
        Commands::Watch {
            dir,
            until,
            program,
            args,
        } => run_watch(dir, until.as_deref(), &program, &args, config).await,
    }
}

async fn run_start(dir: PathBuf, ready: &str, config: ProcessConfig) -> Result<()> {
    let ready = Regex::new(ready).with_context(|| format!("Invalid ready pattern '{ready}'"))?;
    let directory =
        Directory::new(&dir)?.with_subprocess(SubprocessManager::production(config));
    let mut controller = directory.lifecycle();

    let chunk = controller
        .start(&ready)
        .await
        .with_context(|| format!("Failed to start project in {}", directory.root().display()))?;
    let pid = controller.pid().unwrap_or_default();
    println!("pid {pid}: {}", chunk.text().trim_end());
    info!("Project running; press Ctrl-C to stop");

    let exited = match controller.handle().cloned() {
        Some(handle) => tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                false
            }
            status = handle.wait() => {
                info!("Project exited on its own ({})", status);
                true
            }
        },
        None => true,
    };
    if !exited {
        info!("Stopping process {}", pid);
    }

    let status = controller.stop().await?;
    println!("stopped: {status}");
    Ok(())
}

async fn run_watch(
    dir: PathBuf,
    until: Option<&str>,
    program: &str,
    args: &[String],
    config: ProcessConfig,
) -> Result<()> {
    let until = until
        .map(Regex::new)
        .transpose()
        .context("Invalid --until pattern")?;
    let grace = config.grace_period;
    let directory =
        Directory::new(&dir)?.with_subprocess(SubprocessManager::production(config));
    let spawned = directory.spawn(program, args)?;
    info!("Watching process {}", spawned.handle.pid());

    let mut stdout = std::io::stdout();
    loop {
        let chunk = match spawned.stream.next().await {
            Ok(chunk) => chunk,
            Err(e) if e.is_stream_closed() => break,
            Err(e) => return Err(e.into()),
        };
        stdout.write_all(chunk.text().as_bytes())?;
        stdout.flush()?;

        if until.as_ref().is_some_and(|re| re.is_match(chunk.text())) {
            info!("Pattern matched; stopping process {}", spawned.handle.pid());
            spawned.handle.terminate(grace).await?;
            break;
        }
    }

    let status = spawned.handle.wait().await;
    info!("Process {} finished with {}", spawned.handle.pid(), status);
    Ok(())
}
