#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, ScoredBox};
use crate::frame::Frame;

const CXYWH_OFFSET: usize = 4;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a single output of shape `[1, 4 + classes, anchors]` with
/// centre-format boxes in model input pixels. Frames are stretched to the
/// model input size and boxes are scaled back to frame coordinates.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    class_names: Vec<String>,
    min_confidence: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            class_names,
            min_confidence: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Lowest score the backend reports at all. The pipeline applies its own
    /// acceptance threshold on top of this.
    pub fn with_min_confidence(mut self, threshold: f32) -> Self {
        self.min_confidence = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let resized = if frame.width != self.width || frame.height != self.height {
            image::imageops::resize(&image, self.width, self.height, FilterType::Triangle)
        } else {
            image
        };

        let width = self.width as usize;
        let pixels = resized.as_raw();
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, width),
            |(_, channel, y, x)| {
                let idx = (y * width + x) * 3 + channel;
                pixels[idx] as f32 / 255.0
            },
        );

        Ok(input.into_tensor())
    }

    fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class{}", class_id))
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<ScoredBox>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape();
        if shape.len() != 3 || shape[1] <= CXYWH_OFFSET {
            return Err(anyhow!("unexpected output shape {:?}", shape));
        }
        let classes = shape[1] - CXYWH_OFFSET;
        let anchors = shape[2];
        let sx = frame.width as f32 / self.width as f32;
        let sy = frame.height as f32 / self.height as f32;

        let mut boxes: Vec<ScoredBox> = Vec::new();
        for a in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for c in 0..classes {
                let score = preds[[0, CXYWH_OFFSET + c, a]];
                if score > best.1 {
                    best = (c, score);
                }
            }
            if best.1 < self.min_confidence {
                continue;
            }
            let cx = preds[[0, 0, a]] * sx;
            let cy = preds[[0, 1, a]] * sy;
            let w = preds[[0, 2, a]] * sx;
            let h = preds[[0, 3, a]] * sy;
            boxes.push(ScoredBox::new(
                self.class_name(best.0),
                best.1,
                BoundingBox::new(
                    (cx - w / 2.0).max(0.0),
                    (cy - h / 2.0).max(0.0),
                    (cx + w / 2.0).min(frame.width as f32),
                    (cy + h / 2.0).min(frame.height as f32),
                ),
            ));
        }

        Ok(non_max_suppression(boxes, self.iou_threshold))
    }
}

fn non_max_suppression(mut boxes: Vec<ScoredBox>, iou_threshold: f32) -> Vec<ScoredBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<ScoredBox> = Vec::new();
    for candidate in boxes {
        let overlaps = kept.iter().any(|k| {
            k.label == candidate.label && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<ScoredBox>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }
}
