//! Vista sentinel
//!
//! Live camera detection pipeline: frames are captured from a camera, run
//! through a configured set of object-detection models, annotated, streamed
//! back out as MJPEG, and logged as one detection event per frame. A
//! debounced alert fires when any model reports an object above the
//! acceptance threshold.
//!
//! # Architecture
//!
//! ```text
//! FrameSource -> capture -> FrameChannel -> inference -> { FrameHub, AlertController, EventLogger }
//! ```
//!
//! - `frame`: `Frame` and the bounded drop-oldest `FrameChannel`
//! - `ingest`: frame sources (synthetic, MJPEG over HTTP)
//! - `capture`: capture loop feeding the channel
//! - `detect`: detector backends and the ordered model registry
//! - `inference`: per-frame detection, annotation, event emission
//! - `alert` / `sound`: debounced alert state machine and playback
//! - `events`: detection event log (SQLite, in-memory)
//! - `stream`: multipart framing and the latest-frame hub
//! - `pipeline`: start/stop lifecycle
//! - `api`: HTTP control surface

pub mod alert;
pub mod annotate;
pub mod api;
pub mod capture;
pub mod config;
pub mod detect;
pub mod events;
pub mod frame;
pub mod inference;
pub mod ingest;
pub mod pipeline;
pub mod sound;
pub mod stream;

pub use alert::{AlertController, AlertStatus, Clock, ManualClock, SystemClock};
pub use detect::{
    BoundingBox, ColorBackend, Detection, DetectorBackend, ModelKind, ModelRegistry, StubBackend,
};
pub use events::{DetectionEvent, EventLogger, InMemoryEventLog, SqliteEventLog};
pub use frame::{Frame, FrameChannel, PopResult};
pub use ingest::{CaptureSettings, DeviceSourceProvider, FrameSource, SourceProvider};
pub use pipeline::{PipelineController, PipelineParts};
pub use sound::{AlertSound, CommandSound, SilentSound};
pub use stream::{FrameHub, FrameSink};

/// Frames buffered between capture and inference before the oldest is dropped.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;

/// A detection is accepted only when its confidence is strictly above this.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.40;

/// Seconds after an acknowledgement during which new alerts are suppressed.
pub const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 600;

/// Category recorded on events where nothing was accepted.
pub const NO_CATEGORY: &str = "none";

// -------------------- Errors --------------------

/// Failure categories the pipeline reports.
///
/// Carried inside `anyhow::Error`; callers that need to branch on the
/// category use `err.downcast_ref::<PipelineError>()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineError {
    /// The device or URL could not be opened.
    SourceUnavailable(String),
    /// A frame read failed; ends the capture task.
    ReadFailure(String),
    /// An annotated frame could not be encoded; that frame is dropped.
    EncodingFailure(String),
    /// The alert sound asset does not exist.
    AssetMissing(String),
    /// The event logger rejected an event.
    LoggingFailure(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable(_) => "SOURCE_UNAVAILABLE",
            PipelineError::ReadFailure(_) => "READ_FAILURE",
            PipelineError::EncodingFailure(_) => "ENCODING_FAILURE",
            PipelineError::AssetMissing(_) => "ASSET_MISSING",
            PipelineError::LoggingFailure(_) => "LOGGING_FAILURE",
        }
    }

    fn message(&self) -> &str {
        match self {
            PipelineError::SourceUnavailable(m)
            | PipelineError::ReadFailure(m)
            | PipelineError::EncodingFailure(m)
            | PipelineError::AssetMissing(m)
            | PipelineError::LoggingFailure(m) => m,
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for PipelineError {}

/// Returns the pipeline error category carried by `err`, if any.
pub fn error_kind(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain().find_map(|cause| cause.downcast_ref::<PipelineError>())
}
