use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde_json::json;
use weaver_contracts::prompts::{raw_prompt, ModuleSpec};
use weaver_contracts::request::{AnalyzeResponse, RefineResponse};

use crate::advisor::GeminiTextClient;

const MODULE_NAMES: [&str; 8] = [
    "style",
    "subject",
    "pose",
    "costume",
    "background",
    "composition",
    "atmosphere",
    "extra",
];

/// Splits an image into editable prompt modules and rewrites unlocked modules
/// from a natural-language instruction. Unlike the advisor these calls are
/// not fail-soft.
#[derive(Clone)]
pub struct ModuleAnalyst {
    client: GeminiTextClient,
}

impl ModuleAnalyst {
    pub fn new(client: GeminiTextClient) -> Self {
        Self { client }
    }

    pub fn analyze(&self, image_data: &str, api_key: &str) -> Result<AnalyzeResponse> {
        let parts = vec![
            json!({ "text": analyze_instruction() }),
            json!({
                "inlineData": {
                    "mimeType": "image/png",
                    "data": image_data,
                }
            }),
        ];
        let text = self.client.generate(parts, true, api_key)?;
        let mut response: AnalyzeResponse = serde_json::from_str(&strip_code_fence(&text))
            .context("Gemini analysis returned malformed module JSON")?;
        if response.raw_prompt.trim().is_empty() {
            response.raw_prompt = raw_prompt(&response.modules);
        }
        Ok(response)
    }

    /// Only `unlocked` is sent; anything the model returns under another
    /// module name is discarded so locked modules are never touched.
    pub fn refine(
        &self,
        unlocked: &[&ModuleSpec],
        instruction: &str,
        api_key: &str,
    ) -> Result<RefineResponse> {
        if unlocked.is_empty() {
            return Ok(RefineResponse::default());
        }
        let modules_json =
            serde_json::to_string(unlocked).context("failed to encode modules for refinement")?;
        let parts = vec![json!({ "text": refine_instruction(instruction.trim(), &modules_json) })];
        let text = self.client.generate(parts, true, api_key)?;
        let mut response: RefineResponse = serde_json::from_str(&strip_code_fence(&text))
            .context("Gemini refinement returned malformed module JSON")?;
        let allowed: BTreeSet<&str> = unlocked.iter().map(|module| module.name.as_str()).collect();
        response
            .modules
            .retain(|module| allowed.contains(module.name.as_str()));
        for module in &mut response.modules {
            module.locked = false;
        }
        Ok(response)
    }
}

fn analyze_instruction() -> String {
    format!(
        "You are an expert image analyst. Analyze the given image and extract descriptive tags into {} categories: {}.\n\
         Return a JSON object of the form {{\"modules\": [{{\"name\": \"style\", \"displayName\": \"Style\", \"locked\": false, \
         \"tags\": [{{\"id\": \"unique-id\", \"text\": \"tag text\", \"weight\": 1.0}}]}}], \"rawPrompt\": \"all tags joined with commas\"}}.\n\
         Use a unique id for every tag. Return only valid JSON, no markdown.",
        MODULE_NAMES.len(),
        MODULE_NAMES.join(", ")
    )
}

fn refine_instruction(instruction: &str, modules_json: &str) -> String {
    format!(
        "You are an AI prompt editor. Update the following modules according to the user instruction.\n\
         User instruction: {instruction}\n\
         Current modules: {modules_json}\n\
         Return a JSON object {{\"modules\": [...]}} keeping the same structure (name, displayName, locked, tags). \
         Give modified tags new ids. Return only valid JSON."
    )
}

fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    if !(raw.starts_with("```") && raw.ends_with("```")) {
        return raw.to_string();
    }
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() < 2 {
        return raw.to_string();
    }
    let mut body = lines[1..lines.len() - 1].join("\n").trim().to_string();
    if body.to_ascii_lowercase().starts_with("json") {
        body = body[4..].trim().to_string();
    }
    body
}

#[cfg(test)]
mod tests {
    use weaver_contracts::config::EngineConfig;
    use weaver_contracts::errors::{ErrorKind, GenerationError};
    use weaver_contracts::prompts::TagSpec;

    use super::*;
    use crate::test_support::serve_once;

    fn analyst(api_base: &str) -> anyhow::Result<ModuleAnalyst> {
        let config = EngineConfig {
            gemini_api_base: api_base.to_string(),
            ..EngineConfig::default()
        };
        Ok(ModuleAnalyst::new(GeminiTextClient::new(
            &config,
            &config.model_registry(),
        )?))
    }

    fn wrap(text: &str) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&json!({
            "candidates": [{"content": {"parts": [{"text": text}]}}]
        }))?)
    }

    fn module(name: &str, locked: bool, tags: &[&str]) -> ModuleSpec {
        ModuleSpec {
            name: name.to_string(),
            display_name: name.to_string(),
            locked,
            tags: tags.iter().map(|text| TagSpec::new(*text, 1.0)).collect(),
        }
    }

    #[test]
    fn analyze_parses_fenced_json_and_rebuilds_raw_prompt() -> anyhow::Result<()> {
        let modules = json!({"modules": [
            {"name": "subject", "displayName": "Subject", "tags": [{"id": "1", "text": "fox"}]},
            {"name": "atmosphere", "displayName": "Atmosphere", "tags": [{"id": "2", "text": "misty", "weight": 1.3}]}
        ]});
        let fenced = format!("```json\n{modules}\n```");
        let (base, handle) = serve_once(200, "application/json", wrap(&fenced)?);
        let response = analyst(&base)?.analyze("aW1n", "g-key")?;
        let captured = handle.join().map_err(|_| anyhow::anyhow!("server thread panicked"))?;

        assert_eq!(response.modules.len(), 2);
        assert_eq!(response.raw_prompt, "fox, misty");
        let sent = captured.json();
        assert_eq!(sent["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(sent["contents"][0]["parts"][1]["inlineData"]["data"], "aW1n");
        Ok(())
    }

    #[test]
    fn analyze_rejects_non_json_text() -> anyhow::Result<()> {
        let (base, handle) = serve_once(200, "application/json", wrap("I cannot do that")?);
        let err = analyst(&base)?.analyze("aW1n", "g-key").unwrap_err();
        handle.join().map_err(|_| anyhow::anyhow!("server thread panicked"))?;
        assert_eq!(GenerationError::from_anyhow(err).kind(), ErrorKind::InternalError);
        Ok(())
    }

    #[test]
    fn refine_drops_modules_that_were_not_sent() -> anyhow::Result<()> {
        let reply = json!({"modules": [
            {"name": "subject", "displayName": "Subject", "tags": [{"text": "snow fox"}]},
            {"name": "style", "displayName": "Style", "locked": true, "tags": [{"text": "oil"}]}
        ]});
        let (base, handle) = serve_once(200, "application/json", wrap(&reply.to_string())?);
        let subject = module("subject", false, &["fox"]);
        let response = analyst(&base)?.refine(&[&subject], "make it winter", "g-key")?;
        let captured = handle.join().map_err(|_| anyhow::anyhow!("server thread panicked"))?;

        assert_eq!(response.modules.len(), 1);
        assert_eq!(response.modules[0].tags[0].text, "snow fox");
        let prompt = captured.json()["contents"][0]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        assert!(prompt.contains("make it winter"));
        assert!(prompt.contains("\"subject\""));
        assert!(!prompt.contains("\"style\""));
        Ok(())
    }

    #[test]
    fn refine_with_everything_locked_makes_no_call() -> anyhow::Result<()> {
        let response = analyst("http://127.0.0.1:9")?.refine(&[], "anything", "g-key")?;
        assert!(response.modules.is_empty());
        Ok(())
    }
}
