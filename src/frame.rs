//! Frames and the capture -> inference hand-off.
//!
//! - `Frame`: immutable RGB8 pixel buffer with dimensions and capture time.
//! - `FrameChannel`: fixed-capacity buffer between the capture and inference
//!   tasks. Pushing never blocks; when full, the oldest buffered frame is
//!   discarded. Popping blocks until a frame arrives or the channel closes.

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured frame. Pixels are packed RGB8, row-major.
///
/// There is no mutable access to the pixels: annotation works on a copy.
#[derive(Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic per-source sequence number, starting at 1.
    pub sequence: u64,
    pub captured_at: DateTime<Local>,
}

impl Frame {
    /// Build a frame from packed RGB8 pixels.
    ///
    /// Returns `None` when the buffer length does not match `width * height * 3`.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(3)?;
        if pixels.len() != expected {
            return None;
        }
        Some(Self {
            pixels,
            width,
            height,
            sequence,
            captured_at: Local::now(),
        })
    }

    /// Solid-colour frame, mostly for tests and the synthetic source.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], sequence: u64) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            pixels.extend_from_slice(&rgb);
        }
        Self {
            pixels,
            width,
            height,
            sequence,
            captured_at: Local::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// RGB value at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2]])
    }
}

// ----------------------------------------------------------------------------
// FrameChannel: bounded, drop-oldest
// ----------------------------------------------------------------------------

/// Outcome of a non-blocking or timed pop.
#[derive(Debug)]
pub enum PopResult {
    Frame(Frame),
    /// Nothing buffered right now; the channel is still open.
    Empty,
    /// The channel was closed and fully drained.
    Closed,
}

struct ChannelState {
    buffer: VecDeque<Frame>,
    closed: bool,
    dropped: u64,
}

/// Bounded frame buffer shared by the capture and inference tasks.
pub struct FrameChannel {
    state: Mutex<ChannelState>,
    available: Condvar,
    capacity: usize,
}

impl FrameChannel {
    /// Create a channel holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(ChannelState {
                buffer: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        // A panic while holding the lock cannot leave the deque half-updated,
        // so the poisoned state is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push a frame without blocking. Evicts the oldest frame when full.
    ///
    /// Returns `false` (and drops the frame) if the channel is closed.
    pub fn push(&self, frame: Frame) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        while state.buffer.len() >= self.capacity {
            state.buffer.pop_front();
            state.dropped += 1;
        }
        state.buffer.push_back(frame);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Block until a frame is available. Returns `None` once closed and drained.
    pub fn pop(&self) -> Option<Frame> {
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.buffer.pop_front() {
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Pop without blocking.
    pub fn try_pop(&self) -> PopResult {
        let mut state = self.lock();
        match state.buffer.pop_front() {
            Some(frame) => PopResult::Frame(frame),
            None if state.closed => PopResult::Closed,
            None => PopResult::Empty,
        }
    }

    /// Block for at most `timeout` waiting for a frame.
    pub fn pop_timeout(&self, timeout: Duration) -> PopResult {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.buffer.pop_front() {
                return PopResult::Frame(frame);
            }
            if state.closed {
                return PopResult::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return PopResult::Empty;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    /// Close the channel and wake every blocked consumer.
    ///
    /// Frames already buffered can still be popped.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }

    /// Close the channel and discard whatever is still buffered.
    ///
    /// Used on stop, so the consumer sees `Closed` on its next pop instead
    /// of working through stale frames. Returns the number discarded.
    pub fn close_and_discard(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let discarded = state.buffer.len();
        state.buffer.clear();
        drop(state);
        self.available.notify_all();
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buffer.is_empty()
    }

    /// Frames evicted by the drop-oldest policy since creation.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn frame(seq: u64) -> Frame {
        Frame::filled(4, 4, [0, 0, 0], seq)
    }

    fn drain(channel: &FrameChannel) -> Vec<u64> {
        let mut out = Vec::new();
        while let PopResult::Frame(f) = channel.try_pop() {
            out.push(f.sequence);
        }
        out
    }

    #[test]
    fn from_rgb_rejects_wrong_length() {
        assert!(Frame::from_rgb(vec![0; 10], 2, 2, 1).is_none());
        let f = Frame::from_rgb(vec![7; 12], 2, 2, 1).expect("2x2 frame");
        assert_eq!(f.pixel(1, 1), Some([7, 7, 7]));
        assert_eq!(f.pixel(2, 0), None);
    }

    #[test]
    fn channel_keeps_most_recent_frames_when_full() {
        for pushes in [1usize, 9, 10, 11, 25, 103] {
            let channel = FrameChannel::new(10);
            for seq in 1..=pushes as u64 {
                assert!(channel.push(frame(seq)));
            }
            assert!(channel.len() <= 10);
            let kept = drain(&channel);
            let first = pushes.saturating_sub(10) as u64 + 1;
            let expected: Vec<u64> = (first..=pushes as u64).collect();
            assert_eq!(kept, expected, "pushes={pushes}");
            assert_eq!(channel.dropped(), pushes.saturating_sub(10) as u64);
        }
    }

    #[test]
    fn pop_never_returns_same_frame_twice() {
        let channel = FrameChannel::new(3);
        channel.push(frame(1));
        assert_eq!(channel.pop().map(|f| f.sequence), Some(1));
        assert!(matches!(channel.try_pop(), PopResult::Empty));
        assert!(matches!(
            channel.pop_timeout(Duration::from_millis(20)),
            PopResult::Empty
        ));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let channel = Arc::new(FrameChannel::new(2));
        let consumer = {
            let channel = channel.clone();
            thread::spawn(move || channel.pop())
        };
        thread::sleep(Duration::from_millis(50));
        channel.close();
        let popped = consumer.join().expect("consumer thread");
        assert!(popped.is_none());
        assert!(matches!(channel.try_pop(), PopResult::Closed));
    }

    #[test]
    fn blocked_consumer_receives_pushed_frame() {
        let channel = Arc::new(FrameChannel::new(2));
        let consumer = {
            let channel = channel.clone();
            thread::spawn(move || channel.pop().map(|f| f.sequence))
        };
        thread::sleep(Duration::from_millis(20));
        channel.push(frame(42));
        assert_eq!(consumer.join().expect("consumer thread"), Some(42));
    }

    #[test]
    fn closed_channel_rejects_push_but_drains_buffer() {
        let channel = FrameChannel::new(2);
        channel.push(frame(1));
        channel.close();
        assert!(!channel.push(frame(2)));
        assert_eq!(channel.pop().map(|f| f.sequence), Some(1));
        assert!(channel.pop().is_none());
    }

    #[test]
    fn close_and_discard_drops_buffered_frames() {
        let channel = FrameChannel::new(4);
        channel.push(frame(1));
        channel.push(frame(2));
        assert_eq!(channel.close_and_discard(), 2);
        assert!(matches!(channel.try_pop(), PopResult::Closed));
    }
}
