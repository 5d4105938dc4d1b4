use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::detect::{ColorBackend, ModelKind, ModelRegistry, StubBackend};
use crate::ingest::CaptureSettings;
use crate::sound::{AlertSound, CommandSound, SilentSound};

const DEFAULT_DB_PATH: &str = "vista.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8799";
const DEFAULT_SUBJECT: &str = "operator";
const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Debug, Deserialize, Default)]
struct VistaConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    source: Option<SourceConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    alert: Option<AlertConfigFile>,
    models: Option<Vec<ModelConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    default_subject: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    buffer_frames: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    channel_capacity: Option<usize>,
    confidence_threshold: Option<f32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    cooldown_secs: Option<u64>,
    sound_path: Option<PathBuf>,
    player: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ModelConfigFile {
    name: String,
    backend: Option<String>,
    path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    classes: Option<Vec<String>>,
    color: Option<[u8; 3]>,
}

/// Which detector implementation backs a model.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendChoice {
    /// Flame-colour heuristic.
    Color,
    /// Never detects; placeholder until a real model is configured.
    Stub,
    /// ONNX model run with tract (feature `backend-tract`).
    Tract {
        path: PathBuf,
        input_width: u32,
        input_height: u32,
        classes: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub kind: ModelKind,
    pub backend: BackendChoice,
    pub color: Option<[u8; 3]>,
}

#[derive(Debug, Clone)]
pub struct VistaConfig {
    pub db_path: String,
    pub api_addr: String,
    pub default_subject: String,
    pub capture: CaptureSettings,
    pub channel_capacity: usize,
    pub confidence_threshold: f32,
    pub jpeg_quality: u8,
    pub cooldown: Duration,
    pub alert_sound: Option<PathBuf>,
    pub alert_player: Vec<String>,
    /// Detection models in evaluation order.
    pub models: Vec<ModelSpec>,
}

impl VistaConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VISTA_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VistaConfigFile) -> Result<Self> {
        let defaults = CaptureSettings::default();
        let source = file.source.unwrap_or_default();
        let capture = CaptureSettings {
            url: source.url.unwrap_or(defaults.url),
            width: source.width.unwrap_or(defaults.width),
            height: source.height.unwrap_or(defaults.height),
            target_fps: source.target_fps.unwrap_or(defaults.target_fps),
            buffer_frames: source.buffer_frames.unwrap_or(defaults.buffer_frames),
        };
        let api = file.api.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let alert = file.alert.unwrap_or_default();
        let models = match file.models {
            Some(models) => models
                .into_iter()
                .map(model_from_file)
                .collect::<Result<Vec<_>>>()?,
            None => default_models(),
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            default_subject: api
                .default_subject
                .unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            capture,
            channel_capacity: pipeline
                .channel_capacity
                .unwrap_or(crate::DEFAULT_CHANNEL_CAPACITY),
            confidence_threshold: pipeline
                .confidence_threshold
                .unwrap_or(crate::DEFAULT_CONFIDENCE_THRESHOLD),
            jpeg_quality: pipeline.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            cooldown: Duration::from_secs(
                alert
                    .cooldown_secs
                    .unwrap_or(crate::DEFAULT_ALERT_COOLDOWN_SECS),
            ),
            alert_sound: alert.sound_path,
            alert_player: alert.player.unwrap_or_else(|| {
                CommandSound::DEFAULT_PLAYER
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            }),
            models,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("VISTA_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("VISTA_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(url) = std::env::var("VISTA_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.capture.url = url;
            }
        }
        if let Ok(subject) = std::env::var("VISTA_SUBJECT") {
            if !subject.trim().is_empty() {
                self.default_subject = subject.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("VISTA_ALERT_SOUND") {
            if !path.trim().is_empty() {
                self.alert_sound = Some(PathBuf::from(path));
            }
        }
        if let Ok(cooldown) = std::env::var("VISTA_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.parse().map_err(|_| {
                anyhow!("VISTA_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.cooldown = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.api_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("invalid api addr '{}': {}", self.api_addr, e))?;
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("source width and height must be greater than zero"));
        }
        if self.capture.buffer_frames == 0 {
            return Err(anyhow!("source buffer_frames must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(anyhow!("channel_capacity must be greater than zero"));
        }
        if !(0.0..1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "confidence_threshold must be in [0, 1), got {}",
                self.confidence_threshold
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }
        if self.alert_player.is_empty() {
            return Err(anyhow!("alert player command must not be empty"));
        }
        if self.models.is_empty() {
            return Err(anyhow!("at least one detection model must be configured"));
        }
        for (i, model) in self.models.iter().enumerate() {
            if self.models[..i].iter().any(|m| m.kind == model.kind) {
                return Err(anyhow!("model '{}' configured twice", model.kind));
            }
        }
        Ok(())
    }

    /// Build the detection models in configured order.
    pub fn build_registry(&self) -> Result<ModelRegistry> {
        let mut registry = ModelRegistry::new();
        for spec in &self.models {
            let color = spec.color.unwrap_or_else(|| spec.kind.color());
            match &spec.backend {
                BackendChoice::Color => {
                    let backend = match spec.kind {
                        ModelKind::Fire => ColorBackend::fire(),
                        _ => {
                            return Err(anyhow!(
                                "color backend only implements the fire model, not '{}'",
                                spec.kind
                            ))
                        }
                    };
                    registry.register_with_color(spec.kind.clone(), color, backend);
                }
                BackendChoice::Stub => {
                    log::warn!("model '{}' has no detector configured; it will never fire", spec.kind);
                    registry.register_with_color(spec.kind.clone(), color, StubBackend::new());
                }
                #[cfg(feature = "backend-tract")]
                BackendChoice::Tract {
                    path,
                    input_width,
                    input_height,
                    classes,
                } => {
                    let backend = crate::detect::TractBackend::new(
                        path,
                        *input_width,
                        *input_height,
                        classes.clone(),
                    )?;
                    registry.register_with_color(spec.kind.clone(), color, backend);
                }
                #[cfg(not(feature = "backend-tract"))]
                BackendChoice::Tract { path, .. } => {
                    return Err(anyhow!(
                        "model '{}' needs {} but this build lacks the backend-tract feature",
                        spec.kind,
                        path.display()
                    ));
                }
            }
        }
        Ok(registry)
    }

    /// Open the alert sound. A missing asset is reported here once and
    /// playback is disabled for the session.
    pub fn build_sound(&self) -> Arc<dyn AlertSound> {
        let Some(path) = &self.alert_sound else {
            log::info!("no alert sound configured");
            return Arc::new(SilentSound);
        };
        match CommandSound::open(path, self.alert_player.clone()) {
            Ok(sound) => Arc::new(sound),
            Err(e) => {
                log::warn!("alert sound disabled: {:#}", e);
                Arc::new(SilentSound)
            }
        }
    }
}

fn default_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec {
            kind: ModelKind::Fire,
            backend: BackendChoice::Color,
            color: None,
        },
        ModelSpec {
            kind: ModelKind::Weapon,
            backend: BackendChoice::Stub,
            color: None,
        },
    ]
}

fn model_from_file(file: ModelConfigFile) -> Result<ModelSpec> {
    let kind = ModelKind::from_name(file.name.trim());
    let backend = match file.backend.as_deref().unwrap_or("stub") {
        "color" => BackendChoice::Color,
        "stub" => BackendChoice::Stub,
        "tract" => BackendChoice::Tract {
            path: file
                .path
                .ok_or_else(|| anyhow!("model '{}' uses tract but has no path", kind))?,
            input_width: file.input_width.unwrap_or(640),
            input_height: file.input_height.unwrap_or(640),
            classes: file.classes.unwrap_or_default(),
        },
        other => return Err(anyhow!("model '{}' has unknown backend '{}'", kind, other)),
    };
    Ok(ModelSpec {
        kind,
        backend,
        color: file.color,
    })
}

fn read_config_file(path: &Path) -> Result<VistaConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
