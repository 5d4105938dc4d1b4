//! Synthetic frame source (`stub://`).
//!
//! Produces a moving gradient scene at the configured resolution and rate.
//! Every `FLAME_PERIOD` frames a flame-coloured patch appears for
//! `FLAME_FRAMES` frames, so colour-heuristic detectors have something to
//! fire on during demos.
//!
//! Query parameters:
//! - `frames=N`: end the stream after N frames (the next read fails)
//! - `fail=1`: refuse to open (exercises `SourceUnavailable`)

use anyhow::{anyhow, Result};
use std::thread;
use std::time::Instant;
use url::Url;

use super::{frame_interval, CaptureSettings, FrameSource, SourceStats};
use crate::frame::Frame;
use crate::PipelineError;

const FLAME_PERIOD: u64 = 50;
const FLAME_FRAMES: u64 = 5;
const FLAME_RGB: [u8; 3] = [255, 120, 20];

pub struct SyntheticSource {
    settings: CaptureSettings,
    frame_limit: Option<u64>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    released: bool,
}

impl SyntheticSource {
    /// Open a synthetic source. Synthetic sources are always "connected"
    /// unless the URL asks for a failure.
    pub fn open(settings: CaptureSettings) -> Result<Self> {
        let url = Url::parse(&settings.url).map_err(|e| {
            PipelineError::SourceUnavailable(format!("invalid url {}: {}", settings.url, e))
        })?;
        let mut frame_limit = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => {
                    frame_limit = Some(value.parse::<u64>().map_err(|_| {
                        PipelineError::SourceUnavailable(format!(
                            "frames must be an integer in {}",
                            settings.url
                        ))
                    })?);
                }
                "fail" if value == "1" => {
                    return Err(PipelineError::SourceUnavailable(format!(
                        "{} refused to open",
                        settings.url
                    ))
                    .into());
                }
                _ => {}
            }
        }
        if settings.width == 0 || settings.height == 0 {
            return Err(PipelineError::SourceUnavailable(
                "synthetic source needs a non-zero resolution".to_string(),
            )
            .into());
        }
        log::info!(
            "SyntheticSource: connected to {} ({}x{} @ {} fps)",
            settings.url,
            settings.width,
            settings.height,
            settings.target_fps
        );
        Ok(Self {
            settings,
            frame_limit,
            frame_count: 0,
            last_frame_at: None,
            released: false,
        })
    }

    fn pace(&mut self) {
        let interval = frame_interval(self.settings.target_fps);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    fn flame_visible(&self) -> bool {
        self.frame_count % FLAME_PERIOD >= FLAME_PERIOD - FLAME_FRAMES
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let width = self.settings.width as usize;
        let height = self.settings.height as usize;
        let mut pixels = vec![0u8; width * height * 3];
        let shift = self.frame_count as usize;
        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) * 3;
                // Cool blue/grey background so only the patch reads as flame.
                let v = ((x + y + shift) % 64) as u8;
                pixels[idx] = 40 + v / 2;
                pixels[idx + 1] = 50 + v / 2;
                pixels[idx + 2] = 90 + v;
            }
        }

        if self.flame_visible() {
            let (x0, y0) = (width / 3, height / 3);
            let (x1, y1) = (width * 2 / 3, height * 2 / 3);
            for y in y0..y1 {
                for x in x0..x1 {
                    let idx = (y * width + x) * 3;
                    pixels[idx..idx + 3].copy_from_slice(&FLAME_RGB);
                }
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn read(&mut self) -> Result<Frame> {
        if self.released {
            return Err(PipelineError::ReadFailure("source released".to_string()).into());
        }
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                return Err(PipelineError::ReadFailure(format!(
                    "{} ended after {} frames",
                    self.settings.url, limit
                ))
                .into());
            }
        }
        self.pace();
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::from_rgb(
            pixels,
            self.settings.width,
            self.settings.height,
            self.frame_count,
        )
        .ok_or_else(|| anyhow!("synthetic frame has inconsistent dimensions"))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            log::info!("SyntheticSource: released {}", self.settings.url);
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.settings.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_kind;

    fn settings(url: &str) -> CaptureSettings {
        CaptureSettings {
            url: url.to_string(),
            width: 30,
            height: 30,
            target_fps: 0,
            buffer_frames: 1,
        }
    }

    #[test]
    fn frame_limit_ends_stream_with_read_failure() -> Result<()> {
        let mut source = SyntheticSource::open(settings("stub://cam?frames=2"))?;
        source.read()?;
        source.read()?;
        let err = source.read().unwrap_err();
        assert!(matches!(
            error_kind(&err),
            Some(PipelineError::ReadFailure(_))
        ));
        assert_eq!(source.stats().frames_captured, 2);
        Ok(())
    }

    #[test]
    fn fail_flag_refuses_to_open() {
        let err = match SyntheticSource::open(settings("stub://cam?fail=1")) {
            Ok(_) => panic!("open should fail"),
            Err(err) => err,
        };
        assert!(matches!(
            error_kind(&err),
            Some(PipelineError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn flame_patch_appears_periodically() -> Result<()> {
        let mut source = SyntheticSource::open(settings("stub://cam"))?;
        let mut flame_frames = Vec::new();
        for _ in 0..FLAME_PERIOD {
            let frame = source.read()?;
            if frame.pixel(15, 15) == Some(FLAME_RGB) {
                flame_frames.push(frame.sequence);
            }
        }
        assert_eq!(flame_frames, vec![45, 46, 47, 48, 49]);
        Ok(())
    }

    #[test]
    fn released_source_stops_reading() -> Result<()> {
        let mut source = SyntheticSource::open(settings("stub://cam"))?;
        source.release();
        assert!(source.read().is_err());
        Ok(())
    }
}
