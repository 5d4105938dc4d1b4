use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, ScoredBox};
use crate::frame::Frame;

/// CPU colour-range heuristic.
///
/// Counts pixels whose RGB values fall inside `[min, max]` and reports one
/// box around them. Confidence is the covered fraction of the frame divided
/// by `saturation`, capped at 1.0. Cheap enough to run on every frame
/// without a model file; the fire preset picks out saturated orange/red.
#[derive(Clone, Debug)]
pub struct ColorBackend {
    label: String,
    min: [u8; 3],
    max: [u8; 3],
    /// Fraction of the frame at which confidence reaches 1.0.
    saturation: f32,
    /// Matches covering less than this fraction are ignored as noise.
    min_fraction: f32,
}

impl ColorBackend {
    pub fn new(label: impl Into<String>, min: [u8; 3], max: [u8; 3]) -> Self {
        Self {
            label: label.into(),
            min,
            max,
            saturation: 0.05,
            min_fraction: 0.001,
        }
    }

    /// Flame-coloured pixels: strong red, mid green, little blue.
    pub fn fire() -> Self {
        Self::new("fire", [200, 60, 0], [255, 200, 90])
    }

    pub fn with_saturation(mut self, saturation: f32) -> Self {
        self.saturation = saturation.max(f32::EPSILON);
        self
    }

    fn matches(&self, rgb: &[u8]) -> bool {
        (0..3).all(|c| rgb[c] >= self.min[c] && rgb[c] <= self.max[c])
    }
}

impl DetectorBackend for ColorBackend {
    fn name(&self) -> &'static str {
        "color"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<ScoredBox>> {
        let width = frame.width as usize;
        let total = width * frame.height as usize;
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut count = 0usize;
        let (mut x1, mut y1, mut x2, mut y2) = (usize::MAX, usize::MAX, 0usize, 0usize);
        for (i, rgb) in frame.pixels().chunks_exact(3).enumerate() {
            if !self.matches(rgb) {
                continue;
            }
            let (x, y) = (i % width, i / width);
            count += 1;
            x1 = x1.min(x);
            y1 = y1.min(y);
            x2 = x2.max(x);
            y2 = y2.max(y);
        }

        let fraction = count as f32 / total as f32;
        if count == 0 || fraction < self.min_fraction {
            return Ok(Vec::new());
        }

        let confidence = (fraction / self.saturation).min(1.0);
        Ok(vec![ScoredBox::new(
            self.label.clone(),
            confidence,
            BoundingBox::new(x1 as f32, y1 as f32, (x2 + 1) as f32, (y2 + 1) as f32),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_patch(patch: [u8; 3], side: u32) -> Frame {
        let (w, h) = (100u32, 100u32);
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                if (10..10 + side).contains(&x) && (20..20 + side).contains(&y) {
                    pixels.extend_from_slice(&patch);
                } else {
                    pixels.extend_from_slice(&[30, 40, 120]);
                }
            }
        }
        Frame::from_rgb(pixels, w, h, 1).expect("frame")
    }

    #[test]
    fn color_backend_boxes_matching_pixels() {
        let mut backend = ColorBackend::fire();
        let hits = backend.detect(&frame_with_patch([255, 120, 20], 30)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].label, "fire");
        assert_eq!(hits[0].bbox, BoundingBox::new(10.0, 20.0, 40.0, 50.0));
        // 900 / 10000 = 9% of the frame, above the 5% saturation point.
        assert_eq!(hits[0].confidence, 1.0);
    }

    #[test]
    fn color_backend_scales_confidence_by_coverage() {
        let mut backend = ColorBackend::fire();
        let hits = backend.detect(&frame_with_patch([255, 120, 20], 10)).unwrap();
        // 100 / 10000 = 1% -> 0.2
        assert!((hits[0].confidence - 0.2).abs() < 1e-6);
    }

    #[test]
    fn color_backend_ignores_other_colors() {
        let mut backend = ColorBackend::fire();
        let hits = backend.detect(&frame_with_patch([20, 200, 20], 30)).unwrap();
        assert!(hits.is_empty());
    }
}
