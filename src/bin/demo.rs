//! demo - synthetic end-to-end run of the detection pipeline
//!
//! Drives the stub camera (periodic flame patch) through the colour
//! heuristic, prints alert transitions as they happen and the event counts
//! at the end.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vista_sentinel::{
    AlertController, CaptureSettings, ColorBackend, DeviceSourceProvider, EventLogger, FrameHub,
    ModelKind, ModelRegistry, PipelineController, PipelineParts, SilentSound, SqliteEventLog,
    StubBackend,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// How long to run the pipeline, in seconds.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Frames per second for the synthetic source.
    #[arg(long, default_value_t = 20)]
    fps: u32,
    /// Source URL.
    #[arg(long, env = "VISTA_SOURCE_URL", default_value = "stub://demo")]
    url: String,
    /// SQLite path for the detection log.
    #[arg(long, env = "VISTA_DB_PATH", default_value = "demo_vista.db")]
    db: String,
    /// Subject the run is attributed to.
    #[arg(long, default_value = "demo")]
    subject: String,
    /// Acknowledge an active alert after this many seconds.
    #[arg(long, default_value_t = 1)]
    ack_after: u64,
    /// Alert cooldown in seconds.
    #[arg(long, default_value_t = 2)]
    cooldown: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut registry = ModelRegistry::new();
    registry.register(ModelKind::Fire, ColorBackend::fire());
    registry.register(ModelKind::Weapon, StubBackend::new());

    let logger = Arc::new(Mutex::new(SqliteEventLog::open(&args.db)?));
    let before = logger
        .lock()
        .map_err(|_| anyhow!("event log lock poisoned"))?
        .count()?;

    let alert = Arc::new(AlertController::with_system_clock(
        Duration::from_secs(args.cooldown),
        Arc::new(SilentSound),
    ));
    let controller = PipelineController::new(PipelineParts {
        provider: Arc::new(DeviceSourceProvider),
        settings: CaptureSettings {
            url: args.url.clone(),
            target_fps: args.fps,
            ..CaptureSettings::default()
        },
        registry,
        logger: logger.clone(),
        alert: alert.clone(),
        hub: Arc::new(FrameHub::new()),
        channel_capacity: vista_sentinel::DEFAULT_CHANNEL_CAPACITY,
        threshold: vista_sentinel::DEFAULT_CONFIDENCE_THRESHOLD,
        jpeg_quality: 80,
    });

    controller.start(&args.subject)?;
    println!("pipeline running on {} for {}s", args.url, args.seconds);

    let started = Instant::now();
    let run_for = Duration::from_secs(args.seconds);
    let ack_after = Duration::from_secs(args.ack_after);
    let mut active_since: Option<Instant> = None;
    while started.elapsed() < run_for && controller.is_running() {
        let status = controller.status();
        match (status.active, active_since) {
            (true, None) => {
                println!(
                    "[{:>5.2}s] ALERT: {}",
                    started.elapsed().as_secs_f32(),
                    status.anomaly.as_deref().unwrap_or("unknown")
                );
                active_since = Some(Instant::now());
            }
            (true, Some(since)) if since.elapsed() >= ack_after => {
                controller.acknowledge();
                println!("[{:>5.2}s] acknowledged", started.elapsed().as_secs_f32());
                active_since = None;
            }
            _ => {}
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let summary = controller.stop();
    let mut log = logger
        .lock()
        .map_err(|_| anyhow!("event log lock poisoned"))?;
    let written = log.count()? - before;
    let recent = log.recent_detections(&args.subject, 5)?;

    if let Some(inference) = summary.and_then(|s| s.inference) {
        println!(
            "frames processed: {}  positive: {}  dropped on encode: {}",
            inference.frames_processed,
            inference.positive_events,
            inference.frames_dropped_on_encode
        );
    }
    println!("events written: {}", written);
    println!("alert activations: {}", alert.activations());
    for event in recent {
        println!("  {}  {}  {}", event.timestamp_string(), event.subject, event.category);
    }
    Ok(())
}
