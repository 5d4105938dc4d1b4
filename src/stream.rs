//! Annotated-frame output.
//!
//! Each processed frame is published as one JPEG. HTTP clients receive the
//! frames as a `multipart/x-mixed-replace` body; every part is
//! `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Multipart boundary marker (without the leading dashes).
pub const BOUNDARY: &str = "frame";

/// Response content type for the MJPEG stream.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Frame one encoded image as a multipart part.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--");
    part.extend_from_slice(BOUNDARY.as_bytes());
    part.extend_from_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Receives one encoded image per processed frame.
pub trait FrameSink: Send + Sync {
    fn publish(&self, jpeg: Vec<u8>);

    /// No more frames will be published for this run.
    fn close(&self) {}
}

/// Result of waiting on a `FrameHub`.
#[derive(Debug)]
pub enum HubRecv {
    Frame { sequence: u64, jpeg: Arc<Vec<u8>> },
    Timeout,
    Closed,
}

struct HubState {
    latest: Option<Arc<Vec<u8>>>,
    sequence: u64,
    closed: bool,
}

/// Latest-frame broadcast between the inference task and stream clients.
///
/// Only the newest frame is kept; a slow client skips frames rather than
/// holding the inference task back.
pub struct FrameHub {
    state: Mutex<HubState>,
    updated: Condvar,
}

impl FrameHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                latest: None,
                sequence: 0,
                closed: false,
            }),
            updated: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sequence number of the newest published frame (0 before the first).
    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    pub fn latest(&self) -> Option<(u64, Arc<Vec<u8>>)> {
        let state = self.lock();
        state.latest.clone().map(|jpeg| (state.sequence, jpeg))
    }

    /// Wait for a frame newer than `after`.
    pub fn wait_next(&self, after: u64, timeout: Duration) -> HubRecv {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.sequence > after {
                if let Some(jpeg) = state.latest.clone() {
                    return HubRecv::Frame {
                        sequence: state.sequence,
                        jpeg,
                    };
                }
            }
            if state.closed {
                return HubRecv::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return HubRecv::Timeout;
            }
            let (guard, _) = self
                .updated
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    /// End every open stream. Called when the inference task exits.
    pub fn close(&self) {
        self.lock().closed = true;
        self.updated.notify_all();
    }

    /// Accept frames again after a restart. The previous run's frame is
    /// dropped; the sequence keeps counting up.
    pub fn reopen(&self) {
        let mut state = self.lock();
        state.closed = false;
        state.latest = None;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl Default for FrameHub {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for FrameHub {
    fn publish(&self, jpeg: Vec<u8>) {
        let mut state = self.lock();
        state.latest = Some(Arc::new(jpeg));
        state.sequence += 1;
        drop(state);
        self.updated.notify_all();
    }

    fn close(&self) {
        FrameHub::close(self);
    }
}
