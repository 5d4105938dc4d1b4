use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::detect::result::{Detection, ModelKind};
use crate::frame::Frame;

use super::backend::DetectorBackend;

/// One configured model.
#[derive(Clone)]
pub struct RegisteredModel {
    pub kind: ModelKind,
    /// Overlay colour for this model's boxes.
    pub color: [u8; 3],
    backend: Arc<Mutex<dyn DetectorBackend>>,
}

impl RegisteredModel {
    pub fn backend_name(&self) -> Result<&'static str> {
        let guard = self
            .backend
            .lock()
            .map_err(|_| anyhow!("backend lock poisoned"))?;
        Ok(guard.name())
    }
}

/// What one model returned for one frame.
pub struct ModelOutput {
    pub kind: ModelKind,
    pub color: [u8; 3],
    pub detections: Result<Vec<Detection>>,
}

/// Ordered set of detection models.
///
/// Iteration order is registration order and is significant: the inference
/// loop attributes a frame to the last model that had an accepted detection.
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: Vec<RegisteredModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self { models: Vec::new() }
    }

    /// Register a model with its default overlay colour.
    pub fn register<B: DetectorBackend + 'static>(&mut self, kind: ModelKind, backend: B) {
        let color = kind.color();
        self.register_with_color(kind, color, backend);
    }

    /// Register a model. Registering an existing kind replaces its backend in place.
    pub fn register_with_color<B: DetectorBackend + 'static>(
        &mut self,
        kind: ModelKind,
        color: [u8; 3],
        backend: B,
    ) {
        let model = RegisteredModel {
            kind,
            color,
            backend: Arc::new(Mutex::new(backend)),
        };
        match self.models.iter_mut().find(|m| m.kind == model.kind) {
            Some(existing) => *existing = model,
            None => self.models.push(model),
        }
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Model names in iteration order.
    pub fn names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.kind.name().to_string()).collect()
    }

    pub fn models(&self) -> &[RegisteredModel] {
        &self.models
    }

    /// Run every backend's warm-up hook.
    pub fn warm_up(&self) -> Result<()> {
        for model in &self.models {
            let mut guard = model
                .backend
                .lock()
                .map_err(|_| anyhow!("backend lock poisoned"))?;
            guard.warm_up()?;
        }
        Ok(())
    }

    /// Run every model on `frame`, in registration order.
    ///
    /// A failing model does not prevent the others from running.
    pub fn run_all(&self, frame: &Frame) -> Vec<ModelOutput> {
        self.models
            .iter()
            .map(|model| {
                let detections = model
                    .backend
                    .lock()
                    .map_err(|_| anyhow!("backend lock poisoned"))
                    .and_then(|mut guard| guard.detect(frame))
                    .map(|boxes| {
                        boxes
                            .into_iter()
                            .map(|b| Detection::from_scored(b, model.kind.clone()))
                            .collect()
                    });
                ModelOutput {
                    kind: model.kind.clone(),
                    color: model.color,
                    detections,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubBackend;
    use crate::detect::result::{BoundingBox, ScoredBox};

    fn hit(label: &str, confidence: f32) -> ScoredBox {
        ScoredBox::new(label, confidence, BoundingBox::new(1.0, 1.0, 5.0, 5.0))
    }

    #[test]
    fn runs_models_in_registration_order() {
        let mut registry = ModelRegistry::new();
        registry.register(ModelKind::Weapon, StubBackend::always(vec![hit("gun", 0.9)]));
        registry.register(ModelKind::Fire, StubBackend::always(vec![hit("fire", 0.8)]));

        assert_eq!(registry.names(), vec!["weapon", "fire"]);

        let frame = Frame::filled(8, 8, [0, 0, 0], 1);
        let outputs = registry.run_all(&frame);
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].kind, ModelKind::Weapon);
        let fire = outputs[1].detections.as_ref().expect("fire output");
        assert_eq!(fire[0].source_model, ModelKind::Fire);
        assert_eq!(fire[0].label, "fire");
    }

    #[test]
    fn re_registering_keeps_position() {
        let mut registry = ModelRegistry::new();
        registry.register(ModelKind::Fire, StubBackend::new());
        registry.register(ModelKind::Weapon, StubBackend::new());
        registry.register(ModelKind::Fire, StubBackend::always(vec![hit("fire", 0.5)]));

        assert_eq!(registry.names(), vec!["fire", "weapon"]);
        let outputs = registry.run_all(&Frame::filled(2, 2, [0, 0, 0], 1));
        assert_eq!(outputs[0].detections.as_ref().map(|d| d.len()).ok(), Some(1));
    }
}
