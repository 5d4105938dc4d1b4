use anyhow::Result;
use std::collections::VecDeque;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::ScoredBox;
use crate::frame::Frame;

/// Stub backend for testing.
///
/// Replays a script of per-frame results, then keeps returning the fallback
/// (empty unless built with `always`).
pub struct StubBackend {
    script: VecDeque<Vec<ScoredBox>>,
    fallback: Vec<ScoredBox>,
}

impl StubBackend {
    /// Backend that never detects anything.
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            fallback: Vec::new(),
        }
    }

    /// Backend that returns `frames[i]` for the i-th call, then nothing.
    pub fn scripted(frames: Vec<Vec<ScoredBox>>) -> Self {
        Self {
            script: frames.into(),
            fallback: Vec::new(),
        }
    }

    /// Backend that returns the same boxes for every frame.
    pub fn always(hits: Vec<ScoredBox>) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: hits,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<ScoredBox>> {
        Ok(self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
