use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::models::{ModelRegistry, ModelSpec};

pub const CONFIG_PATH_ENV: &str = "VOIDWEAVER_CONFIG";

/// Provider endpoints, model names and per-provider timeouts.
///
/// Built-in defaults, then an optional JSON file, then environment
/// overrides. Every field has a default so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub gemini_api_base: String,
    pub novelai_api_base: String,
    pub models: ModelConfig,
    pub timeouts: TimeoutConfig,
    pub extra_models: Vec<ExtraModel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub gemini_image: String,
    pub gemini_edit: String,
    pub advisor: String,
    pub novelai: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub gemini_s: f64,
    pub novelai_s: f64,
    pub advisor_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraModel {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gemini_api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            novelai_api_base: "https://image.novelai.net".to_string(),
            models: ModelConfig::default(),
            timeouts: TimeoutConfig::default(),
            extra_models: Vec::new(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            gemini_image: "gemini-2.5-flash-image".to_string(),
            gemini_edit: "gemini-3-pro-image-preview".to_string(),
            advisor: "gemini-2.0-flash-exp".to_string(),
            novelai: "nai-diffusion-3".to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            gemini_s: 120.0,
            novelai_s: 120.0,
            advisor_s: 60.0,
        }
    }
}

impl TimeoutConfig {
    pub fn gemini(&self) -> Duration {
        seconds(self.gemini_s, 120.0)
    }

    pub fn novelai(&self) -> Duration {
        seconds(self.novelai_s, 120.0)
    }

    pub fn advisor(&self) -> Duration {
        seconds(self.advisor_s, 60.0)
    }
}

fn seconds(value: f64, default: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value.clamp(1.0, 600.0))
    } else {
        Duration::from_secs_f64(default)
    }
}

impl EngineConfig {
    /// Loads `path` (or `$VOIDWEAVER_CONFIG`) when given, then applies the
    /// process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let env_path = non_empty_env(CONFIG_PATH_ENV);
        let path = path.or(env_path.as_deref().map(Path::new));
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(non_empty_env);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON in {}", path.display()))
    }

    /// Applies overrides from `lookup`; blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(value) = get("GEMINI_API_BASE") {
            self.gemini_api_base = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = get("NOVELAI_API_BASE") {
            self.novelai_api_base = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = get("VOIDWEAVER_GEMINI_IMAGE_MODEL") {
            self.models.gemini_image = value;
        }
        if let Some(value) = get("VOIDWEAVER_GEMINI_EDIT_MODEL") {
            self.models.gemini_edit = value;
        }
        if let Some(value) = get("VOIDWEAVER_ADVISOR_MODEL") {
            self.models.advisor = value;
        }
        if let Some(value) = get("VOIDWEAVER_NOVELAI_MODEL") {
            self.models.novelai = value;
        }
        let parse_secs = |key: &str| get(key).and_then(|value| value.parse::<f64>().ok());
        if let Some(value) = parse_secs("VOIDWEAVER_GEMINI_TIMEOUT") {
            self.timeouts.gemini_s = value;
        }
        if let Some(value) = parse_secs("VOIDWEAVER_NOVELAI_TIMEOUT") {
            self.timeouts.novelai_s = value;
        }
        if let Some(value) = parse_secs("VOIDWEAVER_ADVISOR_TIMEOUT") {
            self.timeouts.advisor_s = value;
        }
    }

    /// Built-in models plus any `extra_models` from the config file.
    pub fn model_registry(&self) -> ModelRegistry {
        let mut registry = ModelRegistry::default();
        for extra in &self.extra_models {
            let capabilities = extra
                .capabilities
                .iter()
                .map(String::as_str)
                .collect::<Vec<&str>>();
            registry.register(ModelSpec::new(&extra.name, &extra.provider, &capabilities));
        }
        registry
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
