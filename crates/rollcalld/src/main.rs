use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod dbus_interface;
mod engine;
mod extractor;
mod session;
mod store;

use config::{BusKind, Config};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};
use session::{HardwareCapture, Session, SessionSettings};
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path.display(),
        extractor = %config.extractor_command.display(),
        late_cutoff = %config.late_cutoff,
        threshold = config.match_threshold,
        "configuration loaded"
    );

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    let capture = HardwareCapture {
        camera_device: config.camera_device.clone(),
        width: config.camera_width,
        height: config.camera_height,
        extractor_command: config.extractor_command.clone(),
        extractor_args: config.extractor_args.clone(),
    };
    let settings = SessionSettings {
        sample_interval: config.sample_interval(),
        warmup_frames: config.warmup_frames,
        frames_per_enroll: config.frames_per_enroll,
        recent_capacity: config.recent_capacity,
        match_threshold: config.match_threshold,
        late_policy: config.late_policy(),
    };
    let session = Session::new(store, Arc::new(capture), settings);

    let gate = auth::PasswordGate::from_hex(config.admin_password_sha256.as_deref());
    if !gate.is_configured() {
        tracing::warn!("no admin password configured; export and clear are disabled");
    }
    let service = RollcallService::new(Arc::clone(&session), gate);

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    session.stop().await;

    Ok(())
}
