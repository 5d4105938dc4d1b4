//! Pipeline lifecycle.
//!
//! `PipelineController` owns the capture and inference tasks of the current
//! run. `start` and `stop` are serialized under one lifecycle mutex, so at
//! most one capture/inference pair exists at any time and a stop followed by
//! a start never overlaps two tasks on the same device. The run itself sits
//! behind a second mutex that is never held while tasks are joined, so
//! status queries stay prompt during a slow stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use anyhow::{Context, Result};

use crate::alert::{AlertController, AlertStatus};
use crate::capture::{spawn_capture, CaptureReport};
use crate::detect::ModelRegistry;
use crate::events::EventLogger;
use crate::frame::FrameChannel;
use crate::inference::{spawn_inference, InferenceContext, InferenceReport};
use crate::ingest::{CaptureSettings, SourceProvider};
use crate::stream::FrameHub;

/// Collaborators and settings shared by every run.
#[derive(Clone)]
pub struct PipelineParts {
    pub provider: Arc<dyn SourceProvider>,
    pub settings: CaptureSettings,
    pub registry: ModelRegistry,
    pub logger: Arc<Mutex<dyn EventLogger>>,
    pub alert: Arc<AlertController>,
    pub hub: Arc<FrameHub>,
    pub channel_capacity: usize,
    pub threshold: f32,
    pub jpeg_quality: u8,
}

struct RunningPipeline {
    running: Arc<AtomicBool>,
    channel: Arc<FrameChannel>,
    capture: JoinHandle<CaptureReport>,
    inference: JoinHandle<InferenceReport>,
    subject: String,
}

impl RunningPipeline {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal both tasks and wait for them.
    fn shut_down(self) -> (Option<CaptureReport>, Option<InferenceReport>) {
        self.running.store(false, Ordering::SeqCst);
        let discarded = self.channel.close_and_discard();
        if discarded > 0 {
            log::debug!("discarded {} buffered frames on stop", discarded);
        }
        let capture = self.capture.join().ok();
        let inference = self.inference.join().ok();
        if capture.is_none() || inference.is_none() {
            log::warn!("a pipeline task panicked");
        }
        (capture, inference)
    }
}

/// Reports from a finished run.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub subject: String,
    pub capture: Option<CaptureReport>,
    pub inference: Option<InferenceReport>,
}

pub struct PipelineController {
    parts: PipelineParts,
    lifecycle: Mutex<()>,
    current: Mutex<Option<RunningPipeline>>,
}

impl PipelineController {
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            parts,
            lifecycle: Mutex::new(()),
            current: Mutex::new(None),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunningPipeline>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start a run attributed to `subject`.
    ///
    /// Returns `Ok(false)` if a run is already active. The source is opened
    /// before any task is spawned, so `SourceUnavailable` comes back from
    /// this call and the pipeline stays stopped.
    pub fn start(&self, subject: &str) -> Result<bool> {
        let _lifecycle = self.lifecycle();
        let stale = {
            let mut current = self.lock();
            if current.as_ref().is_some_and(|run| run.is_running()) {
                return Ok(false);
            }
            current.take()
        };
        // Reap a run whose capture task ended on its own.
        if let Some(stale) = stale {
            let subject = stale.subject.clone();
            let (capture, _) = stale.shut_down();
            if let Some(err) = capture.and_then(|c| c.error) {
                log::info!("previous run for {} ended: {}", subject, err);
            }
        }

        let source = self
            .parts
            .provider
            .open(&self.parts.settings)
            .with_context(|| format!("open source {}", self.parts.settings.url))?;

        let running = Arc::new(AtomicBool::new(true));
        let channel = Arc::new(FrameChannel::new(self.parts.channel_capacity));
        self.parts.hub.reopen();

        let ctx = InferenceContext {
            registry: self.parts.registry.clone(),
            logger: self.parts.logger.clone(),
            alert: self.parts.alert.clone(),
            sink: self.parts.hub.clone(),
            threshold: self.parts.threshold,
            jpeg_quality: self.parts.jpeg_quality,
            subject: subject.to_string(),
        };
        let inference = spawn_inference(ctx, channel.clone(), running.clone())?;
        let capture = match spawn_capture(source, channel.clone(), running.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                channel.close();
                let _ = inference.join();
                return Err(e);
            }
        };

        log::info!(
            "pipeline started for {} on {} ({} models)",
            subject,
            self.parts.settings.url,
            self.parts.registry.len()
        );
        *self.lock() = Some(RunningPipeline {
            running,
            channel,
            capture,
            inference,
            subject: subject.to_string(),
        });
        Ok(true)
    }

    /// Stop the current run and wait for both tasks.
    ///
    /// Waiting on the capture task is bounded by the source's read timeout.
    /// The run reads as stopped as soon as this is called. Returns `None`
    /// when nothing was started.
    pub fn stop(&self) -> Option<RunSummary> {
        let _lifecycle = self.lifecycle();
        let run = self.lock().take()?;
        let subject = run.subject.clone();
        let (capture, inference) = run.shut_down();
        self.parts.hub.close();
        log::info!("pipeline stopped for {}", subject);
        Some(RunSummary {
            subject,
            capture,
            inference,
        })
    }

    /// True while the capture task is live. A failed capture reads as stopped.
    pub fn is_running(&self) -> bool {
        self.lock().as_ref().map(|r| r.is_running()).unwrap_or(false)
    }

    /// Subject of the active run.
    pub fn subject(&self) -> Option<String> {
        self.lock()
            .as_ref()
            .filter(|r| r.is_running())
            .map(|r| r.subject.clone())
    }

    pub fn status(&self) -> AlertStatus {
        self.parts.alert.status()
    }

    pub fn acknowledge(&self) {
        self.parts.alert.acknowledge();
    }

    pub fn alert(&self) -> &Arc<AlertController> {
        &self.parts.alert
    }

    pub fn hub(&self) -> &Arc<FrameHub> {
        &self.parts.hub
    }

    pub fn logger(&self) -> &Arc<Mutex<dyn EventLogger>> {
        &self.parts.logger
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.parts.registry
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{ColorBackend, ModelKind};
    use crate::error_kind;
    use crate::events::InMemoryEventLog;
    use crate::ingest::{DeviceSourceProvider, FrameSource};
    use crate::sound::SilentSound;
    use crate::stream::HubRecv;
    use crate::PipelineError;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// Counts sources that are open at the same time.
    struct TrackingProvider {
        inner: DeviceSourceProvider,
        open: Arc<AtomicUsize>,
        max_open: Arc<AtomicUsize>,
    }

    struct TrackedSource {
        inner: Box<dyn FrameSource>,
        open: Arc<AtomicUsize>,
        released: bool,
    }

    impl FrameSource for TrackedSource {
        fn read(&mut self) -> Result<crate::frame::Frame> {
            self.inner.read()
        }
        fn release(&mut self) {
            if !self.released {
                self.released = true;
                self.open.fetch_sub(1, Ordering::SeqCst);
            }
            self.inner.release();
        }
        fn stats(&self) -> crate::ingest::SourceStats {
            self.inner.stats()
        }
    }

    impl SourceProvider for TrackingProvider {
        fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
            let inner = self.inner.open(settings)?;
            let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_open.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(TrackedSource {
                inner,
                open: self.open.clone(),
                released: false,
            }))
        }
    }

    fn parts(url: &str, provider: Arc<dyn SourceProvider>) -> PipelineParts {
        let mut registry = ModelRegistry::new();
        registry.register(ModelKind::Fire, ColorBackend::fire());
        PipelineParts {
            provider,
            settings: CaptureSettings {
                url: url.to_string(),
                width: 32,
                height: 24,
                target_fps: 200,
                buffer_frames: 1,
            },
            registry,
            logger: Arc::new(Mutex::new(InMemoryEventLog::new())),
            alert: Arc::new(AlertController::with_system_clock(
                Duration::from_secs(600),
                Arc::new(SilentSound),
            )),
            hub: Arc::new(FrameHub::new()),
            channel_capacity: 10,
            threshold: 0.40,
            jpeg_quality: 70,
        }
    }

    #[test]
    fn start_is_idempotent_and_stop_releases_source() -> Result<()> {
        let open = Arc::new(AtomicUsize::new(0));
        let max_open = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(TrackingProvider {
            inner: DeviceSourceProvider,
            open: open.clone(),
            max_open: max_open.clone(),
        });
        let controller = PipelineController::new(parts("stub://cam", provider));

        assert!(controller.start("alice")?);
        assert!(!controller.start("bob")?);
        assert_eq!(controller.subject().as_deref(), Some("alice"));
        assert_eq!(open.load(Ordering::SeqCst), 1);

        for _ in 0..5 {
            controller.stop();
            assert!(controller.start("alice")?);
        }
        let summary = controller.stop().expect("run summary");
        assert_eq!(summary.subject, "alice");
        assert!(!controller.is_running());
        assert!(controller.stop().is_none());

        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert_eq!(max_open.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn unavailable_source_leaves_pipeline_stopped() {
        let controller =
            PipelineController::new(parts("stub://cam?fail=1", Arc::new(DeviceSourceProvider)));
        let err = controller.start("alice").unwrap_err();
        assert!(matches!(
            error_kind(&err),
            Some(PipelineError::SourceUnavailable(_))
        ));
        assert!(!controller.is_running());
    }

    #[test]
    fn capture_failure_surfaces_as_not_running() -> Result<()> {
        let controller =
            PipelineController::new(parts("stub://cam?frames=3", Arc::new(DeviceSourceProvider)));
        assert!(controller.start("alice")?);

        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!controller.is_running());

        // A new start reaps the failed run and begins again.
        assert!(controller.start("alice")?);
        assert!(controller.is_running());
        controller.stop();
        Ok(())
    }

    #[test]
    fn capture_failure_ends_open_streams() -> Result<()> {
        let controller =
            PipelineController::new(parts("stub://cam?frames=3", Arc::new(DeviceSourceProvider)));
        assert!(controller.start("alice")?);

        let hub = controller.hub().clone();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = 0;
        let mut ended = false;
        while Instant::now() < deadline {
            match hub.wait_next(seen, Duration::from_millis(200)) {
                HubRecv::Frame { sequence, .. } => seen = sequence,
                HubRecv::Closed => {
                    ended = true;
                    break;
                }
                HubRecv::Timeout => {}
            }
        }
        assert!(ended, "stream still open after the source failed");
        assert_eq!(seen, 3);
        assert!(!controller.is_running());
        Ok(())
    }

    /// Every read takes `delay`, like a camera that has stopped sending.
    struct SlowProvider {
        delay: Duration,
    }

    struct SlowSource {
        delay: Duration,
        frames: u64,
    }

    impl FrameSource for SlowSource {
        fn read(&mut self) -> Result<crate::frame::Frame> {
            std::thread::sleep(self.delay);
            self.frames += 1;
            Ok(crate::frame::Frame::filled(8, 8, [0, 0, 0], self.frames))
        }
        fn stats(&self) -> crate::ingest::SourceStats {
            crate::ingest::SourceStats {
                frames_captured: self.frames,
                source: "slow".to_string(),
            }
        }
    }

    impl SourceProvider for SlowProvider {
        fn open(&self, _settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(SlowSource {
                delay: self.delay,
                frames: 0,
            }))
        }
    }

    #[test]
    fn status_stays_prompt_while_stop_waits_on_capture() -> Result<()> {
        let provider = Arc::new(SlowProvider {
            delay: Duration::from_millis(800),
        });
        let controller = Arc::new(PipelineController::new(parts("slow://cam", provider)));
        assert!(controller.start("alice")?);
        std::thread::sleep(Duration::from_millis(50));

        let stopper = {
            let controller = controller.clone();
            std::thread::spawn(move || controller.stop())
        };
        std::thread::sleep(Duration::from_millis(50));

        let asked = Instant::now();
        assert!(!controller.is_running());
        assert_eq!(controller.subject(), None);
        assert!(asked.elapsed() < Duration::from_millis(300));

        assert!(stopper.join().expect("stop thread").is_some());
        Ok(())
    }
}
