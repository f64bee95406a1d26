//! Automated water tester - service entry point
//!
//! Brings up the database, homes the instrument, and starts the
//! long-running subsystems: job queue consumer, recurring scheduler,
//! diagnostics consumer, and the HTTP control surface.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use awt_common::alarms::Notifier;
use awt_common::db::{self, jobs, InstrumentSettings};
use awt_engine::api;
use awt_engine::diag::{self, DiagnosticQueue};
use awt_engine::exec::TestEngine;
use awt_engine::hardware::sim::{SimDevice, SimSensor};
use awt_engine::hardware::Device;
use awt_engine::queue;
use awt_engine::schedule;
use awt_engine::state::{SharedState, SystemStatus};

/// Command-line arguments for awt-engine
#[derive(Parser, Debug)]
#[command(name = "awt-engine")]
#[command(about = "Test execution service for the automated water tester")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "5750", env = "AWT_PORT")]
    port: u16,

    /// SQLite database path
    #[arg(short, long, default_value = "awt.db", env = "AWT_DB")]
    database: PathBuf,

    /// Run against the simulation backend instead of real hardware
    #[arg(long, env = "AWT_SIMULATION")]
    simulation: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "awt_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Starting awt-engine on port {}", args.port);

    let db = db::init_database(&args.database)
        .await
        .context("Failed to initialize database")?;
    let settings = InstrumentSettings::load(&db)
        .await
        .context("Failed to load instrument settings")?;
    info!("Instrument: {}", settings.instrument_name);

    if !args.simulation {
        // Hardware drivers plug in behind the Device/Sensor traits and
        // are linked by the deployment build; this build carries only
        // the simulation backend.
        bail!("no hardware backend compiled in; run with --simulation");
    }
    let device = SimDevice::new();
    let sensor = SimSensor::new();
    info!("Simulation backend selected");

    let state = Arc::new(SharedState::new());
    let notifier = Notifier::from_settings(&settings);

    // Orientation: home the stepper before accepting work.
    if let Err(e) = device.home().await {
        warn!("Homing failed at startup: {e}");
    }
    info!("Homing stepper done");

    // A crash mid-test must not wedge the queue.
    jobs::clear_running(&db).await.ok();

    state.set_status(SystemStatus::Idle).await;
    info!("Orientation done");

    let engine = Arc::new(TestEngine::new(
        db.clone(),
        device.clone(),
        sensor,
        Arc::clone(&state),
        notifier,
    ));
    let diagnostics = Arc::new(DiagnosticQueue::new());

    tokio::spawn(queue::run_consumer(Arc::clone(&engine)));
    tokio::spawn(schedule::run_scheduler(db.clone(), Arc::clone(&state)));
    tokio::spawn(diag::run_consumer(
        device.clone(),
        Arc::clone(&state),
        Arc::clone(&diagnostics),
    ));
    info!("Subsystem tasks started");

    let app = api::create_router(api::AppState {
        db,
        state,
        diagnostics,
        port: args.port,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Starting HTTP server on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
