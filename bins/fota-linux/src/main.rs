use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, routing::post, Router};
use clap::Parser;
use fota_core::{
    StdPlatform, SupervisorError, TriggerContext, TriggerSource, UpdateConfig, UpdateControl,
    UpdateEngine, UpdateStatus, UpdateSupervisor,
};
use fota_sim::{BlockServer, MemoryFlash};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Supervisor = UpdateSupervisor<BlockServer, MemoryFlash, StdPlatform>;

#[derive(Parser)]
#[command(name = "fota-update")]
#[command(about = "Run a firmware update against a simulated image server", long_about = None)]
struct Cli {
    /// Firmware image served by the simulated server
    #[arg(short, long)]
    image: PathBuf,

    /// Image the simulated device is currently running
    #[arg(short, long)]
    running_image: Option<PathBuf>,

    /// Engine configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Destination to fetch from, overrides the config file
    #[arg(short, long)]
    destination: Option<String>,

    /// Size of each OTA slot in bytes
    #[arg(long, default_value_t = 0x0010_0000)]
    partition_size: u64,

    /// Simulated response latency in milliseconds
    #[arg(long, default_value_t = 5)]
    latency_ms: u64,

    /// Announce the image size with the trigger
    #[arg(long)]
    announce_size: bool,

    /// Status API address
    #[arg(long, default_value = "0.0.0.0:3001")]
    http: SocketAddr,
}

#[derive(Clone)]
struct AppState {
    supervisor: Arc<Mutex<Supervisor>>,
    control: UpdateControl,
    declared_size: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,fota_core=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::info!("Firmware update runner starting...");

    let config = load_config(&cli)?;
    let image = std::fs::read(&cli.image)
        .with_context(|| format!("Failed to read image {}", cli.image.display()))?;
    tracing::info!("Serving {} ({} bytes)", cli.image.display(), image.len());

    let mut flash = MemoryFlash::new(cli.partition_size);
    if let Some(path) = &cli.running_image {
        let running = std::fs::read(path)
            .with_context(|| format!("Failed to read running image {}", path.display()))?;
        flash = flash.with_running_image(&running);
    }

    let declared_size = cli.announce_size.then_some(image.len() as u64);
    let server = BlockServer::new(image)
        .with_latency(Duration::from_millis(cli.latency_ms))
        .real_time();
    let redundant_poll = config.redundant_poll_interval();
    let engine = UpdateEngine::new(server, flash, StdPlatform, config)?;
    let supervisor = UpdateSupervisor::new(engine);

    let state = AppState {
        control: supervisor.control(),
        supervisor: Arc::new(Mutex::new(supervisor)),
        declared_size,
    };

    start(&state, TriggerSource::ServiceStart)?;

    let http_state = state.clone();
    let http_addr = cli.http;
    let http_handle = tokio::spawn(async move {
        if let Err(e) = start_http_server(http_addr, http_state).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    let monitor_handle = tokio::spawn(monitor(state.control.clone(), redundant_poll));

    tracing::info!("Status API: http://{}/ota/status", http_addr);
    tracing::info!("   curl -X POST http://{}/ota/start", http_addr);
    tracing::info!("   curl -X POST http://{}/ota/cancel", http_addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
        }
        _ = monitor_handle => {
            tracing::warn!("Status monitor stopped");
        }
    }

    shutdown(state).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<UpdateConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str::<UpdateConfig>(&json)?
        }
        None => UpdateConfig::new("coap://fw.local/firmware.bin"),
    };
    if let Some(destination) = &cli.destination {
        config.destination = destination.clone();
    }
    config.validate()?;
    Ok(config)
}

fn start(state: &AppState, source: TriggerSource) -> Result<(), SupervisorError> {
    let mut trigger = TriggerContext::new(source);
    trigger.declared_size = state.declared_size;

    let mut supervisor = state
        .supervisor
        .lock()
        .map_err(|_| SupervisorError::TaskPanicked)?;
    supervisor.start_update(trigger)
}

/// Log status changes and the passive wait after a redundant image.
async fn monitor(control: UpdateControl, redundant_poll: Duration) {
    let mut last = control.status();
    let mut ticker = tokio::time::interval(redundant_poll);
    loop {
        ticker.tick().await;
        let status = control.status();
        match &status {
            UpdateStatus::RedundantImage => tracing::info!("Waiting for a new firmware"),
            UpdateStatus::InProgress {
                bytes_written,
                total,
            } => match total {
                Some(total) => tracing::info!("Update progress: {}/{} bytes", bytes_written, total),
                None => tracing::info!("Update progress: {} bytes", bytes_written),
            },
            other if *other != last => tracing::info!("Update status: {:?}", other),
            _ => {}
        }
        last = status;
    }
}

async fn shutdown(state: AppState) {
    state.control.cancel();
    let supervisor = state.supervisor.clone();
    let joined = tokio::task::spawn_blocking(move || {
        supervisor
            .lock()
            .map_err(|_| SupervisorError::TaskPanicked)
            .and_then(|mut supervisor| supervisor.wait())
    })
    .await;

    match joined {
        Ok(Ok(status)) => tracing::info!("Update task stopped: {:?}", status),
        Ok(Err(SupervisorError::NotRunning)) => {}
        Ok(Err(e)) => tracing::warn!("Update task ended abnormally: {}", e),
        Err(e) => tracing::error!("Failed to join update task: {}", e),
    }
}

/// Start the status API server
async fn start_http_server(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/ota/status", get(status_handler))
        .route("/ota/start", post(start_handler))
        .route("/ota/cancel", post(cancel_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "update": state.control.status(),
        "state": state.control.state(),
    }))
}

async fn start_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    match start(&state, TriggerSource::Manual) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "started": true })),
        ),
        Err(e) => {
            let code = match e {
                SupervisorError::Busy
                | SupervisorError::AlreadyCommitted
                | SupervisorError::TaskFailed(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (code, Json(serde_json::json!({ "error": e.to_string() })))
        }
    }
}

async fn cancel_handler(State(state): State<AppState>) -> StatusCode {
    let cancelled = match state.supervisor.lock() {
        Ok(supervisor) => supervisor.cancel_update(),
        Err(_) => false,
    };
    if cancelled {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}
