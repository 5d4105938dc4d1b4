//! Frame ingestion sources.
//!
//! This module provides the sources that feed the capture loop:
//! - MJPEG over HTTP (phone webcams such as DroidCam, IP cameras)
//! - Stub source (`stub://`, synthetic scene for tests and the demo)
//!
//! Sources are opened through a `SourceProvider` so the pipeline controller
//! can open the device synchronously on `start()` and report
//! `SourceUnavailable` before any task is spawned.

pub mod mjpeg;
pub mod synthetic;

use anyhow::Result;
use std::time::Duration;

use crate::frame::Frame;
use crate::PipelineError;

pub use mjpeg::MjpegSource;
pub use synthetic::SyntheticSource;

/// Device configuration applied before the capture loop starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Source URL (`http://192.168.1.20:4747/video`, `stub://front_camera`).
    pub url: String,
    /// Target frame width; decoded frames are resized to this.
    pub width: u32,
    /// Target frame height.
    pub height: u32,
    /// Target frame rate. Sources decimate to this rate; 0 disables pacing.
    pub target_fps: u32,
    /// Frames the source may hold before handing out the newest one.
    pub buffer_frames: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            url: "stub://front_camera".to_string(),
            width: 320,
            height: 240,
            target_fps: 30,
            buffer_frames: 1,
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// An opened video input.
pub trait FrameSource: Send {
    /// Read the next frame. An error ends the capture task.
    fn read(&mut self) -> Result<Frame>;

    /// Free the underlying device. Called once when capture ends.
    fn release(&mut self) {}

    fn stats(&self) -> SourceStats;
}

/// Opens frame sources for the pipeline.
pub trait SourceProvider: Send + Sync {
    /// Open a source and apply `settings`. Fails with `SourceUnavailable`.
    fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn FrameSource>>;
}

/// Default provider: picks a source implementation from the URL scheme.
#[derive(Clone, Debug, Default)]
pub struct DeviceSourceProvider;

impl SourceProvider for DeviceSourceProvider {
    fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
        let url = settings.url.trim();
        if url.starts_with("stub://") {
            let source = SyntheticSource::open(settings.clone())?;
            Ok(Box::new(source))
        } else if url.starts_with("http://") || url.starts_with("https://") {
            let mut source = MjpegSource::new(settings.clone());
            source.connect()?;
            Ok(Box::new(source))
        } else {
            Err(PipelineError::SourceUnavailable(format!(
                "unsupported source url '{}'; expected stub:// or http(s)://",
                settings.url
            ))
            .into())
        }
    }
}

pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_kind;

    #[test]
    fn provider_rejects_unknown_scheme() {
        let settings = CaptureSettings {
            url: "rtsp://camera/stream".to_string(),
            ..CaptureSettings::default()
        };
        let err = match DeviceSourceProvider.open(&settings) {
            Ok(_) => panic!("rtsp should be rejected"),
            Err(err) => err,
        };
        assert!(matches!(
            error_kind(&err),
            Some(PipelineError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn provider_opens_stub_source_at_target_resolution() -> Result<()> {
        let settings = CaptureSettings {
            url: "stub://test".to_string(),
            width: 64,
            height: 48,
            target_fps: 0,
            buffer_frames: 1,
        };
        let mut source = DeviceSourceProvider.open(&settings)?;
        let frame = source.read()?;
        assert_eq!((frame.width, frame.height), (64, 48));
        assert_eq!(frame.sequence, 1);
        Ok(())
    }

    #[test]
    fn frame_interval_handles_zero_fps() {
        assert_eq!(frame_interval(0), Duration::from_millis(0));
        assert_eq!(frame_interval(30), Duration::from_millis(33));
    }
}
