use std::fmt;

/// Which configured model produced a detection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Fire,
    Weapon,
    Custom(String),
}

impl ModelKind {
    /// Lower-case name, used as the event category.
    pub fn name(&self) -> &str {
        match self {
            ModelKind::Fire => "fire",
            ModelKind::Weapon => "weapon",
            ModelKind::Custom(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "fire" => ModelKind::Fire,
            "weapon" => ModelKind::Weapon,
            other => ModelKind::Custom(other.to_string()),
        }
    }

    /// Overlay colour (RGB): fire red, weapon green, others derived from the name.
    pub fn color(&self) -> [u8; 3] {
        match self {
            ModelKind::Fire => [255, 0, 0],
            ModelKind::Weapon => [0, 255, 0],
            ModelKind::Custom(name) => {
                let hash = name
                    .bytes()
                    .fold(0x811c_9dc5u32, |h, b| (h ^ b as u32).wrapping_mul(0x0100_0193));
                [
                    64 + (hash & 0xBF) as u8,
                    64 + ((hash >> 8) & 0xBF) as u8,
                    64 + ((hash >> 16) & 0xBF) as u8,
                ]
            }
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Axis-aligned box in frame pixel coordinates, `(x1, y1)` top-left.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = BoundingBox::new(ix1, iy1, ix2, iy2).area();
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One box reported by a backend, before the model is attached.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredBox {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl ScoredBox {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }
}

/// A detection attributed to the model that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub source_model: ModelKind,
}

impl Detection {
    pub fn from_scored(scored: ScoredBox, source_model: ModelKind) -> Self {
        Self {
            label: scored.label,
            confidence: scored.confidence.clamp(0.0, 1.0),
            bbox: scored.bbox,
            source_model,
        }
    }
}
