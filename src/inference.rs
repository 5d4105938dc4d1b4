//! Inference loop: detection, annotation, event emission and alert
//! notification for every frame taken off the channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::alert::AlertController;
use crate::annotate::{annotate, encode_jpeg, Overlay};
use crate::detect::{Detection, ModelRegistry};
use crate::events::{DetectionEvent, EventLogger};
use crate::frame::{Frame, FrameChannel, PopResult};
use crate::stream::FrameSink;
use crate::{PipelineError, NO_CATEGORY};

/// How long one pop waits before the running flag is re-checked.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of processing a single frame.
#[derive(Debug)]
pub struct FrameOutcome {
    /// The one event this frame produces.
    pub event: DetectionEvent,
    /// Detections above the threshold, in model iteration order.
    pub accepted: Vec<Detection>,
    pub overlays: Vec<Overlay>,
}

impl FrameOutcome {
    /// Winning category when anything was accepted.
    pub fn category(&self) -> Option<&str> {
        self.event.occurred.then_some(self.event.category.as_str())
    }
}

/// Run every model on `frame` and build its event and overlays.
///
/// A detection is accepted when `confidence > threshold`. When several
/// models fire on the same frame the event carries the last one in
/// registry order, not the most confident. A failing model counts as
/// having detected nothing.
pub fn process_frame(
    frame: &Frame,
    registry: &ModelRegistry,
    threshold: f32,
    subject: &str,
) -> FrameOutcome {
    let mut accepted = Vec::new();
    let mut overlays = Vec::new();
    let mut winner: Option<String> = None;

    for output in registry.run_all(frame) {
        let detections = match output.detections {
            Ok(d) => d,
            Err(e) => {
                log::warn!("model {} failed on frame {}: {:#}", output.kind, frame.sequence, e);
                continue;
            }
        };
        let mut model_fired = false;
        for detection in detections {
            if detection.confidence > threshold {
                overlays.push(Overlay::for_detection(&detection, output.color));
                accepted.push(detection);
                model_fired = true;
            }
        }
        if model_fired {
            winner = Some(output.kind.name().to_string());
        }
    }

    let event = DetectionEvent::new(
        subject,
        frame.captured_at,
        winner.is_some(),
        winner.unwrap_or_else(|| NO_CATEGORY.to_string()),
    );
    FrameOutcome {
        event,
        accepted,
        overlays,
    }
}

/// Everything the inference task needs besides the channel.
#[derive(Clone)]
pub struct InferenceContext {
    pub registry: ModelRegistry,
    pub logger: Arc<Mutex<dyn EventLogger>>,
    pub alert: Arc<AlertController>,
    pub sink: Arc<dyn FrameSink>,
    pub threshold: f32,
    pub jpeg_quality: u8,
    pub subject: String,
}

/// Counters returned when the inference task exits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InferenceReport {
    pub frames_processed: u64,
    pub positive_events: u64,
    pub frames_dropped_on_encode: u64,
    pub log_failures: u64,
}

impl InferenceContext {
    /// Process one frame end to end. Per-frame failures are logged and
    /// counted, never returned.
    pub fn handle_frame(&self, frame: &Frame, report: &mut InferenceReport) {
        let outcome = process_frame(frame, &self.registry, self.threshold, &self.subject);
        report.frames_processed += 1;

        if let Err(e) = self.record(&outcome.event) {
            report.log_failures += 1;
            log::warn!("{:#}", e);
        }

        if let Some(category) = outcome.category() {
            report.positive_events += 1;
            self.alert.report_detection(category);
        }

        match annotate(frame, &outcome.overlays)
            .and_then(|image| encode_jpeg(&image, self.jpeg_quality))
        {
            Ok(jpeg) => self.sink.publish(jpeg),
            Err(e) => {
                report.frames_dropped_on_encode += 1;
                log::warn!("dropping frame {}: {:#}", frame.sequence, e);
            }
        }
    }

    fn record(&self, event: &DetectionEvent) -> Result<()> {
        let mut logger = self
            .logger
            .lock()
            .map_err(|_| PipelineError::LoggingFailure("event logger lock poisoned".into()))?;
        logger
            .record(event)
            .map_err(|e| PipelineError::LoggingFailure(format!("{:#}", e)).into())
    }
}

/// Spawn the inference task.
///
/// Frames are processed until the channel reports `Closed`. An empty pop
/// only ends the loop when `running` has been cleared. The sink is closed
/// on exit.
pub fn spawn_inference(
    ctx: InferenceContext,
    channel: Arc<FrameChannel>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<InferenceReport>> {
    thread::Builder::new()
        .name("vista-inference".to_string())
        .spawn(move || {
            let mut report = InferenceReport::default();
            loop {
                match channel.pop_timeout(POLL_INTERVAL) {
                    PopResult::Frame(frame) => ctx.handle_frame(&frame, &mut report),
                    PopResult::Empty => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    PopResult::Closed => break,
                }
            }
            // Ends open streams when capture fails as well as on stop.
            ctx.sink.close();
            log::info!(
                "inference stopped after {} frames ({} positive)",
                report.frames_processed,
                report.positive_events
            );
            report
        })
        .context("spawn inference thread")
}
