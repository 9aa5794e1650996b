use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload};

use diff_drive_runtime::config::DEFAULT_STORAGE_PATH;
use diff_drive_runtime::params::Parameters;
use diff_drive_runtime::runtime::{self, BoxError, LogReload, RunOptions};
use diff_drive_runtime::store::{ConfigStore, FileStorage};
use diff_drive_runtime::teleop;

#[derive(Debug, Parser)]
#[command(name = "diff-drive", about = "Differential drive base runtime")]
struct Cli {
    /// JSON parameter file (missing keys use defaults)
    #[arg(long, global = true)]
    params: Option<PathBuf>,

    /// File holding the persistent calibration record
    #[arg(long, global = true, default_value = DEFAULT_STORAGE_PATH)]
    storage: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the controller and telemetry loop (default)
    Run {
        /// Servo bus serial port; simulated wheels when omitted
        #[arg(long)]
        port: Option<String>,
    },
    /// Drive the base from the keyboard
    Teleop,
    /// Inspect or edit the calibration record
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the stored record as JSON
    Show,
    /// Restore compile-time defaults
    Reset,
    /// Change feature flags
    Set {
        #[arg(long)]
        debug_logging: Option<bool>,
        #[arg(long)]
        imu_enabled: Option<bool>,
        #[arg(long)]
        gps_enabled: Option<bool>,
    },
}

fn config_command(storage: PathBuf, action: ConfigAction) -> Result<(), BoxError> {
    let mut store = ConfigStore::new(FileStorage::new(storage));
    store.load();

    match action {
        ConfigAction::Show => {}
        ConfigAction::Reset => store.reset()?,
        ConfigAction::Set {
            debug_logging,
            imu_enabled,
            gps_enabled,
        } => store.update(|record| {
            if let Some(v) = debug_logging {
                record.debug_logging = v;
            }
            if let Some(v) = imu_enabled {
                record.imu_enabled = v;
            }
            if let Some(v) = gps_enabled {
                record.gps_enabled = v;
            }
        })?,
    }

    println!("{}", serde_json::to_string_pretty(&store.record())?);
    Ok(())
}

async fn dispatch(cli: Cli, log_reload: LogReload) -> Result<(), BoxError> {
    match cli.command.unwrap_or(Command::Run { port: None }) {
        Command::Run { port } => {
            let params = Parameters::load_or_default(cli.params.as_deref())?;
            runtime::run(RunOptions {
                params,
                storage_path: cli.storage,
                port,
                log_reload: Some(log_reload),
            })
            .await
        }
        Command::Teleop => teleop::run().await,
        Command::Config { action } => config_command(cli.storage, action),
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug); the stored record can
    // raise the level once `run` has loaded it
    let (filter, log_reload) = reload::Layer::new(runtime::log_filter(LevelFilter::INFO));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    if let Err(e) = dispatch(Cli::parse(), log_reload).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
