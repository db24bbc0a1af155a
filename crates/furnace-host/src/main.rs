//! # Furnace Host
//!
//! This is the main entry point for the furnace control firmware. It wires
//! the control plane to the runtime: one periodic controller task owns the
//! heater, vacuum, fan, thermocouples, and interlocks; the API server and
//! WebSocket broadcaster run alongside it and talk to it only through the
//! command mailbox and the published snapshot.
//!
//! ## Concurrency
//!
//! The controller is the single writer of all control state. External
//! adapters never touch actuators or the run state directly; they queue
//! validated commands that the controller applies at the start of its next
//! tick. Shutdown (Ctrl+C) asks the controller to stop gracefully, which
//! ends any run and forces every output off before the process exits.

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use furnace_host::api::{self, AppState};
use furnace_host::catalog::ProgramCatalog;
use furnace_host::config::FurnaceConfig;
use furnace_host::controller::Controller;
use furnace_host::gpio::Gpio;
use furnace_host::state::Snapshot;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Control firmware for a dental porcelain firing furnace.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the furnace controller and its API server.
    Run(RunArgs),
}

/// Arguments for the `run` command.
#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the furnace configuration file.
    #[arg(short, long, default_value = "furnace.cfg")]
    config_path: PathBuf,

    /// Web server port for the API and UI.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Run with simulated GPIO even if hardware is present.
    #[arg(long)]
    simulate: bool,

    /// Override the user-program store path from the config file.
    #[arg(long)]
    programs_file: Option<PathBuf>,
}

#[actix_rt::main]
async fn main() -> Result<()> {
    // Initialize the logging subscriber.
    tracing_subscriber::fmt::init();

    // Parse command-line arguments.
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_server(args).await,
    }
}

/// Initializes and runs all the main server components as concurrent tasks.
async fn run_server(args: RunArgs) -> Result<()> {
    info!("Starting furnace host...");

    // --- Initialization ---

    // 1. Load configuration.
    info!("Loading configuration from: {:?}", args.config_path);
    let config = FurnaceConfig::load(&args.config_path)?;

    // 2. Probe for GPIO hardware; degrade to simulation without it.
    let (gpio, gpio_available) = Gpio::probe(args.simulate);

    // 3. Load the program catalog.
    let store_path = args
        .programs_file
        .unwrap_or_else(|| config.storage.programs.clone());
    let catalog = Arc::new(Mutex::new(ProgramCatalog::load(Some(store_path))));

    // 4. Shared snapshot and communication channels.
    let snapshot = Arc::new(Mutex::new(Snapshot::initial(
        gpio_available,
        config.controller.ambient_c,
    )));
    let (command_tx, command_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let epoch = Instant::now();

    // --- Component Spawning ---

    // Controller: the periodic control loop owning all actuator state.
    let controller = Controller::new(
        &config,
        &gpio,
        catalog.clone(),
        snapshot.clone(),
        gpio_available,
    )?;
    let controller_task = tokio::spawn(controller.run(epoch, command_rx, shutdown_rx));
    info!("Controller task started.");

    // API Server: REST + WebSocket boundary.
    let api_state = AppState {
        snapshot,
        catalog,
        commands: command_tx,
        epoch,
    };
    let api_server = api::start_api_server(args.port, api_state)?;
    info!("API server started on port {}.", args.port);

    // --- Run and Shutdown ---

    // Wait for a shutdown signal (e.g., Ctrl+C).
    tokio::select! {
        _ = api_server => {
            info!("API server shut down.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting.");
        }
    }

    // Ask the controller to go safe and wait for it.
    let _ = shutdown_tx.send(true);
    let _ = controller_task.await;

    Ok(())
}
