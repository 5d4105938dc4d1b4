//! vistad - camera detection daemon
//!
//! This daemon:
//! 1. Loads configuration (`VISTA_CONFIG` JSON file plus `VISTA_*` overrides)
//! 2. Opens the SQLite detection log
//! 3. Builds the detection models and the alert sound
//! 4. Serves the control API; the pipeline runs between `/start` and `/stop`
//! 5. Stops the pipeline cleanly on Ctrl-C

use anyhow::{anyhow, Context, Result};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use vista_sentinel::api::{ApiConfig, ApiServer};
use vista_sentinel::config::VistaConfig;
use vista_sentinel::{
    AlertController, DeviceSourceProvider, FrameHub, PipelineController, PipelineParts,
    SqliteEventLog,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = VistaConfig::load()?;
    log::info!(
        "vistad {} starting (source {}, {}x{} @ {} fps)",
        env!("CARGO_PKG_VERSION"),
        cfg.capture.url,
        cfg.capture.width,
        cfg.capture.height,
        cfg.capture.target_fps
    );

    let logger = SqliteEventLog::open(&cfg.db_path)
        .with_context(|| format!("open detection log {}", cfg.db_path))?;
    log::info!("detection log: {}", cfg.db_path);

    let registry = cfg.build_registry()?;
    registry.warm_up()?;
    log::info!("detection models: {}", registry.names().join(", "));

    let alert = Arc::new(AlertController::with_system_clock(
        cfg.cooldown,
        cfg.build_sound(),
    ));

    let controller = Arc::new(PipelineController::new(PipelineParts {
        provider: Arc::new(DeviceSourceProvider),
        settings: cfg.capture.clone(),
        registry,
        logger: Arc::new(Mutex::new(logger)),
        alert,
        hub: Arc::new(FrameHub::new()),
        channel_capacity: cfg.channel_capacity,
        threshold: cfg.confidence_threshold,
        jpeg_quality: cfg.jpeg_quality,
    }));

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
            default_subject: cfg.default_subject.clone(),
            ..ApiConfig::default()
        },
        controller.clone(),
    )
    .spawn()?;
    log::info!(
        "vistad ready: POST http://{}/start to begin detection",
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping pipeline...");
    if let Some(summary) = controller.stop() {
        if let Some(inference) = summary.inference {
            log::info!(
                "last run for {}: {} frames, {} detections",
                summary.subject,
                inference.frames_processed,
                inference.positive_events
            );
        }
    }
    api_handle.stop()?;

    Ok(())
}
