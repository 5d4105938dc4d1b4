//! Capture loop: reads frames from an opened source into the frame channel.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::frame::FrameChannel;
use crate::ingest::FrameSource;

/// How a capture task ended.
#[derive(Clone, Debug, Default)]
pub struct CaptureReport {
    pub frames_captured: u64,
    /// Set when the loop ended on a read failure rather than a stop request.
    pub error: Option<String>,
}

/// Spawn the capture task.
///
/// The source must already be open with its settings applied; opening is
/// done by the caller so that an unavailable device is reported before any
/// task exists. The loop runs until `running` is cleared, the channel is
/// closed, or a read fails. A read failure is terminal: the source is
/// released, `running` is cleared and the channel is closed so the
/// inference task drains and exits too.
pub fn spawn_capture(
    mut source: Box<dyn FrameSource>,
    channel: Arc<FrameChannel>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<CaptureReport>> {
    thread::Builder::new()
        .name("vista-capture".to_string())
        .spawn(move || {
            let mut report = CaptureReport::default();
            while running.load(Ordering::SeqCst) {
                match source.read() {
                    Ok(frame) => {
                        if !channel.push(frame) {
                            break;
                        }
                        report.frames_captured += 1;
                    }
                    Err(e) => {
                        log::warn!("capture ended: {:#}", e);
                        report.error = Some(format!("{:#}", e));
                        break;
                    }
                }
            }
            source.release();
            if report.error.is_some() {
                running.store(false, Ordering::SeqCst);
                channel.close();
            }
            log::info!(
                "capture stopped after {} frames ({})",
                report.frames_captured,
                source.stats().source
            );
            report
        })
        .context("spawn capture thread")
}
