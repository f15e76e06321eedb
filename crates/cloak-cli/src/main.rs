//! cloak CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "cloak")]
#[command(about = "Run and queue C/C++ obfuscation jobs", long_about = None)]
struct Cli {
    /// Base directory for relative paths in the configuration
    #[arg(long, env = "CLOAK_HOME", global = true)]
    home: Option<PathBuf>,

    /// Configuration file, relative to the home directory
    #[arg(long, env = "CLOAK_CONFIG", default_value = "cloak.kdl", global = true)]
    config_file: PathBuf,

    /// Emit diagnostics as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or queue an obfuscation job
    Submit(commands::submit::SubmitArgs),
    /// Show one job, or a summary of all jobs
    Status {
        /// Job ID
        job_id: Option<String>,
    },
    /// Print a job's log
    Logs {
        /// Job ID
        job_id: String,
    },
    /// Report which external tools are available
    CheckTools,
    /// Process queued jobs until interrupted
    Serve {
        /// Seconds to sleep when the queue is empty
        #[arg(long)]
        poll_interval: Option<f64>,
        /// Process at most one job, then exit
        #[arg(long)]
        once: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let ctx = commands::Context::load(cli.home.as_deref(), &cli.config_file)?;

    match cli.command {
        Commands::Submit(args) => commands::submit::run(&ctx, args).await,
        Commands::Status { job_id } => commands::status(&ctx, job_id.as_deref()),
        Commands::Logs { job_id } => commands::logs(&ctx, &job_id),
        Commands::CheckTools => commands::check_tools(&ctx),
        Commands::Serve {
            poll_interval,
            once,
        } => commands::serve::run(&ctx, poll_interval, once).await,
    }
}
