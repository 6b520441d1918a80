use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use weaver_contracts::config::EngineConfig;
use weaver_contracts::errors::GenerationError;
use weaver_contracts::models::{ModelRegistry, CAP_TEXT, CAP_VISION};

use crate::gemini::{endpoint_for_model, API_KEY_HEADER};
use crate::{build_http_client, response_json_or_error, select_model};

pub const CRITIQUE_FALLBACK: &str = "improve lighting, refine details, enhance composition";
pub const STYLE_TAGS_FALLBACK: &str = "basic quality tags";

const ADVICE_MAX_CHARS: usize = 400;

/// Critique and style suggestion for the refinement phases.
///
/// Both operations are advisory: implementations return a usable string on
/// every path and never fail the pipeline.
pub trait Advisor: Send + Sync {
    fn critique(&self, image_data: &str, prompt: &str, credential: &str) -> String;
    fn suggest_style_tags(&self, prompt: &str, credential: &str) -> String;
}

/// Plain `generateContent` transport against a Gemini text/vision model.
#[derive(Clone)]
pub struct GeminiTextClient {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl GeminiTextClient {
    pub fn new(config: &EngineConfig, registry: &ModelRegistry) -> Result<Self> {
        Ok(Self {
            api_base: config.gemini_api_base.trim_end_matches('/').to_string(),
            model: select_model(
                registry,
                &config.models.advisor,
                "gemini",
                &[CAP_TEXT, CAP_VISION],
            )?,
            http: build_http_client(config.timeouts.advisor())?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends one user turn and returns the concatenated text parts of the
    /// first candidate.
    pub fn generate(&self, parts: Vec<Value>, json_response: bool, api_key: &str) -> Result<String> {
        let endpoint = endpoint_for_model(&self.api_base, &self.model);
        let mut payload = json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
        });
        if json_response {
            payload["generationConfig"] = json!({ "responseMimeType": "application/json" });
        }
        let response = self
            .http
            .post(&endpoint)
            .header(API_KEY_HEADER, api_key.trim())
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini text request failed ({endpoint})"))?;
        let parsed = response_json_or_error("Gemini", response)?;
        extract_text(&parsed)
    }
}

fn extract_text(payload: &Value) -> Result<String> {
    let Some(first) = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
    else {
        return Err(GenerationError::EmptyResponse {
            provider: "Gemini".to_string(),
        }
        .into());
    };
    let text = first
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<&str>>()
                .join("")
        })
        .unwrap_or_default();
    Ok(text)
}

pub struct GeminiAdvisor {
    client: GeminiTextClient,
}

impl GeminiAdvisor {
    pub fn new(client: GeminiTextClient) -> Self {
        Self { client }
    }

    fn ask(&self, step: &str, parts: Vec<Value>, credential: &str, fallback: &str) -> String {
        match self.client.generate(parts, false, credential) {
            Ok(text) => {
                let cleaned = clean_advice(&text);
                if cleaned.is_empty() {
                    tracing::warn!(step, model = self.client.model(), "empty advice, using fallback");
                    return fallback.to_string();
                }
                cleaned
            }
            Err(err) => {
                tracing::warn!(step, model = self.client.model(), "advice failed, using fallback: {err:#}");
                fallback.to_string()
            }
        }
    }
}

impl Advisor for GeminiAdvisor {
    fn critique(&self, image_data: &str, prompt: &str, credential: &str) -> String {
        let parts = vec![
            json!({ "text": critique_instruction(prompt) }),
            json!({
                "inline_data": {
                    "mime_type": "image/png",
                    "data": image_data,
                }
            }),
        ];
        self.ask("critique", parts, credential, CRITIQUE_FALLBACK)
    }

    fn suggest_style_tags(&self, prompt: &str, credential: &str) -> String {
        let parts = vec![json!({ "text": style_instruction(prompt) })];
        self.ask("style_tags", parts, credential, STYLE_TAGS_FALLBACK)
    }
}

fn critique_instruction(prompt: &str) -> String {
    format!(
        "You are an art director reviewing a draft image generated from the prompt: \"{prompt}\".\n\
         List exactly three short imperative commands that would fix its biggest problems.\n\
         Reply with the three commands as a single comma-separated line and nothing else."
    )
}

fn style_instruction(prompt: &str) -> String {
    format!(
        "Suggest five style or artist tags that would complement this image prompt: \"{prompt}\".\n\
         Reply with the five tags as a single comma-separated line and nothing else."
    )
}

/// Single line, no surrounding quotes or bullets, capped in length.
fn clean_advice(text: &str) -> String {
    let collapsed = text
        .lines()
        .map(|line| line.trim().trim_start_matches(['-', '*', '•']).trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<&str>>()
        .join(", ");
    let trimmed = collapsed.trim().trim_matches(['"', '\'', '`']).trim();
    if trimmed.chars().count() <= ADVICE_MAX_CHARS {
        return trimmed.to_string();
    }
    trimmed
        .chars()
        .take(ADVICE_MAX_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}
