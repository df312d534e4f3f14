//! camrec CLI: multi-camera recording into time-chunked segments.
//!
//! Usage:
//!   camrec cameras              List cameras that can be opened
//!   camrec record [OPTIONS]     Record the selected cameras until Ctrl+C
//!   camrec segments <DIR>       List recorded segments per camera
//!   camrec check                Check system capabilities

use std::path::PathBuf;

use camrec_common::config::AppConfig;
use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(
    name = "camrec",
    about = "Record several cameras at once into fixed-length segment files",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// How each camera worker is isolated from the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Isolation {
    /// One child process per camera
    Process,
    /// One OS thread per camera
    Thread,
}

#[derive(Subcommand)]
enum Commands {
    /// List cameras that can be opened
    Cameras {
        /// Number of device indices to probe (defaults to the config value)
        #[arg(long)]
        probe: Option<u32>,

        /// Probe generated test cameras instead of real devices
        #[arg(long)]
        synthetic: bool,
    },

    /// Record the selected cameras until Ctrl+C
    Record {
        /// Camera index to record (repeatable)
        #[arg(short, long = "camera")]
        cameras: Vec<u32>,

        /// Requested FPS (0 = device default)
        #[arg(long)]
        fps: Option<u32>,

        /// Requested frame width (0 = device default)
        #[arg(long)]
        width: Option<u32>,

        /// Requested frame height (0 = device default)
        #[arg(long)]
        height: Option<u32>,

        /// Segment length in minutes
        #[arg(long)]
        chunk_minutes: Option<u32>,

        /// Output directory (must already exist)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Worker isolation
        #[arg(long, value_enum, default_value_t = Isolation::Process)]
        isolation: Isolation,

        /// Record generated test cameras instead of real devices
        #[arg(long)]
        synthetic: bool,

        /// Seconds between status lines
        #[arg(long, default_value = "5")]
        status_every: u64,
    },

    /// List recorded segments per camera
    Segments {
        /// Directory holding segment files
        path: PathBuf,
    },

    /// Check system capabilities
    Check,

    /// Run one camera worker; spawned by `record --isolation process`
    #[command(hide = true)]
    Worker {
        /// Worker spec as JSON
        #[arg(long)]
        spec: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load();

    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    logging.json |= cli.log_json;
    camrec_common::logging::init_logging(&logging);

    match cli.command {
        Commands::Cameras { probe, synthetic } => commands::cameras::run(&config, probe, synthetic),
        Commands::Record {
            cameras,
            fps,
            width,
            height,
            chunk_minutes,
            output,
            isolation,
            synthetic,
            status_every,
        } => {
            let args = commands::record::RecordArgs {
                cameras,
                fps,
                width,
                height,
                chunk_minutes,
                output,
                isolation,
                synthetic,
                status_every,
            };
            commands::record::run(args, &config).await
        }
        Commands::Segments { path } => commands::segments::run(path),
        Commands::Check => commands::check::run(&config),
        Commands::Worker { spec } => commands::worker::run(&spec),
    }
}
