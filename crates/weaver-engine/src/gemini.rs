use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use weaver_contracts::config::EngineConfig;
use weaver_contracts::errors::GenerationError;
use weaver_contracts::models::{ModelRegistry, CAP_EDIT, CAP_IMAGE};

use crate::{
    build_http_client, response_json_or_error, select_model, ImageProvider,
    ProviderGenerateRequest, ProviderImage,
};

const PROVIDER: &str = "Gemini";
pub(crate) const API_KEY_HEADER: &str = "x-goog-api-key";

/// Inline-image adapter: the image travels base64 inside the JSON body in
/// both directions.
pub struct GeminiProvider {
    api_base: String,
    image_model: String,
    edit_model: String,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(config: &EngineConfig, registry: &ModelRegistry) -> Result<Self> {
        let models = &config.models;
        Ok(Self {
            api_base: config.gemini_api_base.trim_end_matches('/').to_string(),
            image_model: select_model(registry, &models.gemini_image, "gemini", &[CAP_IMAGE])?,
            edit_model: select_model(
                registry,
                &models.gemini_edit,
                "gemini",
                &[CAP_IMAGE, CAP_EDIT],
            )?,
            http: build_http_client(config.timeouts.gemini())?,
        })
    }

    /// The edit model whenever a reference image is present.
    fn model_for(&self, request: &ProviderGenerateRequest) -> &str {
        if request.input_image.is_some() {
            &self.edit_model
        } else {
            &self.image_model
        }
    }

    fn build_payload(request: &ProviderGenerateRequest) -> Value {
        let mut parts = vec![json!({ "text": request.prompt })];
        if let Some(image) = request.input_image.as_deref() {
            parts.push(json!({
                "inline_data": {
                    "mime_type": "image/png",
                    "data": image,
                }
            }));
        }
        json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
            },
        })
    }

    /// First inline image of the first candidate, still base64.
    fn extract_image(payload: &Value) -> Result<String> {
        let candidates = payload
            .get("candidates")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let Some(first) = candidates.first() else {
            return Err(GenerationError::EmptyResponse {
                provider: PROVIDER.to_string(),
            }
            .into());
        };
        let parts = first
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        parts
            .iter()
            .filter_map(|part| part.get("inlineData").or_else(|| part.get("inline_data")))
            .filter_map(|inline| inline.get("data").and_then(Value::as_str))
            .find(|data| !data.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                GenerationError::NoImageData {
                    provider: PROVIDER.to_string(),
                }
                .into()
            })
    }
}

pub(crate) fn endpoint_for_model(api_base: &str, model: &str) -> String {
    let trimmed = model.trim();
    let model_path = if trimmed.starts_with("models/") {
        trimmed.to_string()
    } else {
        format!("models/{trimmed}")
    };
    format!("{api_base}/{model_path}:generateContent")
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &ProviderGenerateRequest) -> Result<ProviderImage> {
        let model = self.model_for(request).to_string();
        let endpoint = endpoint_for_model(&self.api_base, &model);
        tracing::debug!(%model, img2img = request.input_image.is_some(), "gemini request");
        let response = self
            .http
            .post(&endpoint)
            .header(API_KEY_HEADER, request.credential.trim())
            .json(&Self::build_payload(request))
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let payload = response_json_or_error(PROVIDER, response)?;
        let image_data = Self::extract_image(&payload)?;
        Ok(ProviderImage { image_data, model })
    }
}
