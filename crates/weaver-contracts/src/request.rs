use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::GenerationError;
use crate::prompts::ModuleSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// Gemini image models: inline image request/response.
    GoogleImagen,
    /// NovelAI: flat parameter bag, zip archive response.
    NovelAi,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GoogleImagen => "google-imagen",
            Self::NovelAi => "novelai",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::GoogleImagen => "Google Imagen",
            Self::NovelAi => "NovelAI V3",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = GenerationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "google-imagen" | "gemini" => Ok(Self::GoogleImagen),
            "novelai" => Ok(Self::NovelAi),
            _ => Err(GenerationError::UnsupportedEngine(raw.trim().to_string())),
        }
    }
}

/// Inbound generation request. The engine stays a string on the wire so an
/// unknown value can be reported as `UnsupportedEngine` instead of a decode
/// failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    pub engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub novelai_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_credentials: Option<String>,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    #[serde(default)]
    pub deep_thinking: bool,
}

fn default_resolution() -> String {
    "1024x1024".to_string()
}

impl GenerationRequest {
    pub fn engine_kind(&self) -> Result<EngineKind, GenerationError> {
        self.engine.parse()
    }

    /// The credential for the selected engine. Only the field matching the
    /// engine is consulted.
    pub fn credential(&self) -> Result<&str, GenerationError> {
        let kind = self.engine_kind()?;
        let (value, label) = match kind {
            EngineKind::GoogleImagen => (self.google_credentials.as_deref(), "Google API key"),
            EngineKind::NovelAi => (self.novelai_api_key.as_deref(), "NovelAI API key"),
        };
        value
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| GenerationError::InvalidCredential {
                provider: kind.display_name().to_string(),
                message: format!("{label} is required"),
            })
    }

    pub fn input_image(&self) -> Option<&str> {
        self.image
            .as_deref()
            .map(str::trim)
            .filter(|image| !image.is_empty())
    }

    pub fn validate(&self) -> Result<EngineKind, GenerationError> {
        if self.prompt.trim().is_empty() {
            return Err(GenerationError::InvalidRequest(
                "prompt is required".to_string(),
            ));
        }
        if self.resolution.trim().is_empty() {
            return Err(GenerationError::InvalidRequest(
                "resolution is required".to_string(),
            ));
        }
        if let Some(steps) = self.steps {
            if !(1..=50).contains(&steps) {
                return Err(GenerationError::InvalidRequest(format!(
                    "steps must be between 1 and 50 (got {steps})"
                )));
            }
        }
        if let Some(scale) = self.scale {
            if !(1.0..=20.0).contains(&scale) {
                return Err(GenerationError::InvalidRequest(format!(
                    "scale must be between 1 and 20 (got {scale})"
                )));
            }
        }
        let kind = self.engine_kind()?;
        self.credential()?;
        Ok(kind)
    }
}

/// Body of the synchronous endpoint: the final image only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    pub image_data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub image_data: String,
    pub gemini_api_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
    #[serde(default)]
    pub raw_prompt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefineRequest {
    pub modules: Vec<ModuleSpec>,
    pub instruction: String,
    pub gemini_api_key: String,
}

/// Updated modules; locked modules are never sent, so never returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefineResponse {
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

fn required_key<'a>(key: &'a str, label: &str) -> Result<&'a str, GenerationError> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::InvalidCredential {
            provider: "Gemini".to_string(),
            message: format!("{label} is required"),
        });
    }
    Ok(trimmed)
}

impl AnalyzeRequest {
    pub fn validate(&self) -> Result<&str, GenerationError> {
        if self.image_data.trim().is_empty() {
            return Err(GenerationError::InvalidRequest(
                "imageData is required".to_string(),
            ));
        }
        required_key(&self.gemini_api_key, "Gemini API key")
    }
}

impl RefineRequest {
    pub fn unlocked_modules(&self) -> Vec<&ModuleSpec> {
        self.modules.iter().filter(|module| !module.locked).collect()
    }

    pub fn validate(&self) -> Result<&str, GenerationError> {
        if self.instruction.trim().is_empty() {
            return Err(GenerationError::InvalidRequest(
                "instruction is required".to_string(),
            ));
        }
        required_key(&self.gemini_api_key, "Gemini API key")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::errors::ErrorKind;

    fn gemini_request() -> GenerationRequest {
        GenerationRequest {
            prompt: "a fox".to_string(),
            engine: "google-imagen".to_string(),
            google_credentials: Some("g-key".to_string()),
            resolution: "1024x1024".to_string(),
            ..GenerationRequest::default()
        }
    }

    #[test]
    fn deserializes_camel_case_payload() -> anyhow::Result<()> {
        let request: GenerationRequest = serde_json::from_value(json!({
            "prompt": "a fox",
            "engine": "novelai",
            "novelaiApiKey": "pst-123",
            "resolution": "832x1216",
            "steps": 28,
            "scale": 5,
            "deepThinking": true,
        }))?;
        assert_eq!(request.engine_kind()?, EngineKind::NovelAi);
        assert_eq!(request.credential()?, "pst-123");
        assert_eq!(request.resolution, "832x1216");
        assert_eq!(request.scale, Some(5.0));
        assert!(request.deep_thinking);
        assert!(request.input_image().is_none());
        Ok(())
    }

    #[test]
    fn engine_parsing_accepts_enum_style_names() {
        assert_eq!(
            "GOOGLE_IMAGEN".parse::<EngineKind>().ok(),
            Some(EngineKind::GoogleImagen)
        );
        assert_eq!("NOVELAI".parse::<EngineKind>().ok(), Some(EngineKind::NovelAi));
        let err = "midjourney".parse::<EngineKind>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedEngine);
    }

    #[test]
    fn credential_is_selected_by_engine() {
        let mut request = gemini_request();
        request.novelai_api_key = Some("nai-key".to_string());
        assert_eq!(request.credential().ok(), Some("g-key"));

        request.google_credentials = Some("   ".to_string());
        let err = request.credential().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCredential);
    }

    #[test]
    fn validate_rejects_out_of_range_steps() {
        let mut request = gemini_request();
        request.steps = Some(80);
        let err = request.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        request.steps = Some(28);
        assert_eq!(request.validate().ok(), Some(EngineKind::GoogleImagen));
    }

    #[test]
    fn blank_input_image_is_treated_as_absent() {
        let mut request = gemini_request();
        request.image = Some(String::new());
        assert!(request.input_image().is_none());
        request.image = Some("aGVsbG8=".to_string());
        assert_eq!(request.input_image(), Some("aGVsbG8="));
    }

    #[test]
    fn refine_request_filters_locked_modules() -> anyhow::Result<()> {
        let request: RefineRequest = serde_json::from_value(json!({
            "modules": [
                {"name": "style", "displayName": "Style", "locked": true, "tags": []},
                {"name": "subject", "displayName": "Subject", "tags": [{"text": "fox"}]},
            ],
            "instruction": "make it winter",
            "geminiApiKey": "g-key",
        }))?;
        let unlocked = request.unlocked_modules();
        assert_eq!(unlocked.len(), 1);
        assert_eq!(unlocked[0].name, "subject");
        assert_eq!(unlocked[0].tags[0].weight, 1.0);
        assert_eq!(request.validate().ok(), Some("g-key"));
        Ok(())
    }

    #[test]
    fn analyze_request_requires_key() {
        let request = AnalyzeRequest {
            image_data: "aGk=".to_string(),
            gemini_api_key: " ".to_string(),
        };
        assert_eq!(
            request.validate().unwrap_err().kind(),
            ErrorKind::InvalidCredential
        );
    }
}
