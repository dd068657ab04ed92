use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use lakehost::config::{DEFAULT_CONFIG_PATH, DEFAULT_STATE_DIR};

mod cmd;

#[derive(Parser)]
#[command(name = "lakehost")]
#[command(version, about = "Resumable installer for the data-lake hypervisor host")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Answer yes to every confirmation
    #[arg(long, global = true)]
    pub yes: bool,

    /// Log commands instead of running them, regardless of the config file
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Holds the install state, the lock file and the log
    #[arg(long, global = true, default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resume the installation at the next pending step
    Run {
        /// Start from this step instead of the next pending one
        #[arg(long)]
        from: Option<String>,
    },
    /// Run a single step out of order
    Step { id: String },
    /// List all steps and their progress
    List,
    /// Show the last completed step and what comes next
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Forget all progress
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// View or change installation parameters
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration (credentials masked)
    Show,
    /// Write a config file with all defaults
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Set one value; prompts when the value is omitted
    Set { key: String, value: Option<String> },
    /// List the settable keys
    Keys,
}

/// Stderr plus a daily JSON log under the state directory. The file layer
/// is left out when the directory cannot be created.
fn init_tracing(cli: &Cli) -> Option<WorkerGuard> {
    let default = if cli.verbose {
        "lakehost=debug"
    } else {
        "lakehost=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let stderr = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    let appender = std::fs::create_dir_all(&cli.state_dir)
        .ok()
        .and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("lakehost.log")
                .build(&cli.state_dir)
                .ok()
        });
    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().json().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = init_tracing(&cli);

    match &cli.command {
        Commands::Run { from } => return cmd::cmd_run(&cli, from.as_deref()).await,
        Commands::Step { id } => return cmd::cmd_step(&cli, id).await,
        Commands::List => cmd::cmd_list(&cli)?,
        Commands::Status { json } => cmd::cmd_status(&cli, *json)?,
        Commands::Reset { force } => cmd::cmd_reset(&cli, *force)?,
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
    }

    Ok(ExitCode::SUCCESS)
}
