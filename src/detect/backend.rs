use anyhow::Result;

use crate::detect::result::ScoredBox;
use crate::frame::Frame;

/// Detector backend trait.
///
/// A backend wraps one model. It reports every box it finds with its raw
/// confidence; the acceptance threshold is applied by the inference loop.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Implementations treat the frame as read-only and must not retain it.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<ScoredBox>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
