//! MJPEG-over-HTTP frame source.
//!
//! Phone webcam apps (DroidCam, IP Webcam) and most IP cameras serve a
//! `multipart/x-mixed-replace` body of JPEG parts. This source:
//! - Connects with `ureq` and keeps the response body open
//! - Splits the byte stream on JPEG SOI/EOI markers
//! - Decodes in-memory and resizes to the configured resolution
//! - Decimates to the target frame rate; a plain JPEG endpoint is polled
//!   at most once per frame interval
//! - With `buffer_frames == 1`, always hands out the newest complete JPEG
//!   already received, so a slow reader never falls behind the camera

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

use super::{frame_interval, CaptureSettings, FrameSource, SourceStats};
use crate::frame::Frame;
use crate::PipelineError;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Also bounds how long a stop waits on a stalled camera.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MjpegSource {
    settings: CaptureSettings,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg(ureq::Agent),
}

impl MjpegSource {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            stream: None,
            last_frame_at: None,
            frame_count: 0,
        }
    }

    /// Open the HTTP stream. Failures are `SourceUnavailable`.
    pub fn connect(&mut self) -> Result<()> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        let response = agent.get(&self.settings.url).call().map_err(|e| {
            PipelineError::SourceUnavailable(format!(
                "could not open video stream {}: {}",
                self.settings.url, e
            ))
        })?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            let reader = response.into_reader();
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(
                reader,
                self.settings.buffer_frames,
            )));
        } else {
            self.stream = Some(HttpStream::SingleJpeg(agent));
        }
        log::info!(
            "MjpegSource: connected to {} ({}x{} @ {} fps, buffer {})",
            self.settings.url,
            self.settings.width,
            self.settings.height,
            self.settings.target_fps,
            self.settings.buffer_frames
        );
        Ok(())
    }

    fn to_frame(&mut self, jpeg_bytes: &[u8]) -> Result<Frame> {
        let image = image::load_from_memory(jpeg_bytes).context("decode jpeg")?;
        let mut rgb = image.into_rgb8();
        if self.settings.width > 0
            && self.settings.height > 0
            && (rgb.width() != self.settings.width || rgb.height() != self.settings.height)
        {
            rgb = image::imageops::resize(
                &rgb,
                self.settings.width,
                self.settings.height,
                FilterType::Triangle,
            );
        }
        let (width, height) = rgb.dimensions();
        self.frame_count += 1;
        Frame::from_rgb(rgb.into_raw(), width, height, self.frame_count)
            .ok_or_else(|| anyhow!("decoded frame has inconsistent dimensions"))
    }
}

impl FrameSource for MjpegSource {
    fn read(&mut self) -> Result<Frame> {
        let min_interval = frame_interval(self.settings.target_fps);
        loop {
            let stream = self.stream.as_mut().ok_or_else(|| {
                PipelineError::ReadFailure("mjpeg source not connected".to_string())
            })?;
            let jpeg_bytes = match stream {
                HttpStream::Mjpeg(stream) => stream.read_next_jpeg(),
                HttpStream::SingleJpeg(agent) => {
                    if let Some(last) = self.last_frame_at {
                        let elapsed = last.elapsed();
                        if elapsed < min_interval {
                            thread::sleep(min_interval - elapsed);
                        }
                    }
                    fetch_single_jpeg(agent, &self.settings.url)
                }
            }
            .map_err(|e| PipelineError::ReadFailure(format!("{:#}", e)))?;

            let now = Instant::now();
            if let Some(last) = self.last_frame_at {
                if now.duration_since(last) < min_interval {
                    continue;
                }
            }
            self.last_frame_at = Some(now);

            match self.to_frame(&jpeg_bytes) {
                Ok(frame) => return Ok(frame),
                // A corrupt part is skipped; the stream itself is still good.
                Err(e) => log::debug!("MjpegSource: skipping undecodable part: {:#}", e),
            }
        }
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            log::info!("MjpegSource: released {}", self.settings.url);
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.settings.url.clone(),
        }
    }
}

pub(crate) struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
    latest_only: bool,
}

impl MjpegStream {
    pub(crate) fn new(reader: Box<dyn Read + Send>, buffer_frames: usize) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
            latest_only: buffer_frames <= 1,
        }
    }

    pub(crate) fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            let bounds = if self.latest_only {
                find_last_jpeg_bounds(&self.buffer)
            } else {
                find_jpeg_bounds(&self.buffer)
            };
            if let Some((start, end)) = bounds {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

/// Bounds of the newest complete JPEG in `buffer`.
fn find_last_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut offset = 0;
    let mut last = None;
    while let Some((start, end)) = find_jpeg_bounds(&buffer[offset..]) {
        last = Some((offset + start, offset + end));
        offset += end;
    }
    last
}
