use std::io::{Cursor, Read};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use weaver_contracts::config::EngineConfig;
use weaver_contracts::errors::GenerationError;
use weaver_contracts::models::{ModelRegistry, CAP_IMAGE};
use zip::ZipArchive;

use crate::{
    build_http_client, ensure_success, select_model, ImageProvider, ProviderGenerateRequest,
    ProviderImage,
};

const PROVIDER: &str = "NovelAI";
const DEFAULT_STEPS: u32 = 28;
const DEFAULT_SCALE: f64 = 6.0;
const DEFAULT_STRENGTH: f64 = 0.7;
const SAMPLER: &str = "k_euler";
const MAX_IMAGE_BYTES: u64 = 64 * 1024 * 1024;

/// Archive-response adapter: flat parameter bag in, zip of images out.
pub struct NovelAiProvider {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl NovelAiProvider {
    pub fn new(config: &EngineConfig, registry: &ModelRegistry) -> Result<Self> {
        Ok(Self {
            api_base: config.novelai_api_base.trim_end_matches('/').to_string(),
            model: select_model(registry, &config.models.novelai, "novelai", &[CAP_IMAGE])?,
            http: build_http_client(config.timeouts.novelai())?,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/ai/generate-image", self.api_base)
    }

    fn build_payload(&self, request: &ProviderGenerateRequest) -> Result<Value> {
        let (width, height) = parse_resolution(&request.resolution)?;
        let steps = request.steps.unwrap_or(DEFAULT_STEPS);
        let mut parameters = Map::new();
        parameters.insert("width".to_string(), json!(width));
        parameters.insert("height".to_string(), json!(height));
        parameters.insert("scale".to_string(), json!(request.scale.unwrap_or(DEFAULT_SCALE)));
        parameters.insert("sampler".to_string(), json!(SAMPLER));
        parameters.insert("steps".to_string(), json!(steps));
        parameters.insert("n_samples".to_string(), json!(1));
        parameters.insert("ucPreset".to_string(), json!(0));
        parameters.insert("qualityToggle".to_string(), json!(true));
        parameters.insert("sm".to_string(), json!(false));
        parameters.insert("sm_dyn".to_string(), json!(false));
        parameters.insert("dynamic_thresholding".to_string(), json!(false));
        parameters.insert("controlnet_strength".to_string(), json!(1.0));
        parameters.insert("legacy".to_string(), json!(false));
        parameters.insert("add_original_image".to_string(), json!(false));
        parameters.insert("cfg_rescale".to_string(), json!(0.0));
        parameters.insert("noise_schedule".to_string(), json!("native"));
        if let Some(image) = request.input_image.as_deref() {
            parameters.insert("image".to_string(), json!(image));
            parameters.insert(
                "strength".to_string(),
                json!(request.strength.unwrap_or(DEFAULT_STRENGTH)),
            );
            parameters.insert("noise".to_string(), json!(0.0));
            parameters.insert("extra_noise_seed".to_string(), json!(steps));
        }
        Ok(json!({
            "input": request.prompt,
            "model": self.model,
            "action": "generate",
            "parameters": parameters,
        }))
    }
}

/// `WIDTHxHEIGHT`, strictly numeric on both sides.
fn parse_resolution(raw: &str) -> Result<(u32, u32)> {
    let normalized = raw.trim().to_ascii_lowercase();
    let (width, height) = normalized
        .split_once('x')
        .with_context(|| format!("invalid resolution '{raw}', expected WIDTHxHEIGHT"))?;
    let width = width
        .trim()
        .parse::<u32>()
        .with_context(|| format!("invalid resolution width in '{raw}'"))?;
    let height = height
        .trim()
        .parse::<u32>()
        .with_context(|| format!("invalid resolution height in '{raw}'"))?;
    Ok((width, height))
}

/// Base64 of the first `.png` entry in the archive. Entry sizes come from the
/// archive itself, so both the declared and the actual size are capped.
fn extract_png(archive_bytes: &[u8]) -> Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(archive_bytes))
        .context("NovelAI returned an unreadable archive")?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed reading NovelAI archive entry {index}"))?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".png") {
            continue;
        }
        let name = entry.name().to_string();
        if entry.size() > MAX_IMAGE_BYTES {
            bail!(
                "NovelAI archive entry {name} declares {} bytes, over the {MAX_IMAGE_BYTES} byte limit",
                entry.size()
            );
        }
        let mut bytes = Vec::new();
        entry
            .by_ref()
            .take(MAX_IMAGE_BYTES + 1)
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed extracting {name}"))?;
        if bytes.len() as u64 > MAX_IMAGE_BYTES {
            bail!("NovelAI archive entry {name} exceeds the {MAX_IMAGE_BYTES} byte limit");
        }
        return Ok(BASE64.encode(bytes));
    }
    Err(GenerationError::NoImageData {
        provider: PROVIDER.to_string(),
    }
    .into())
}

impl ImageProvider for NovelAiProvider {
    fn name(&self) -> &str {
        "novelai"
    }

    fn generate(&self, request: &ProviderGenerateRequest) -> Result<ProviderImage> {
        let payload = self.build_payload(request)?;
        let endpoint = self.endpoint();
        tracing::debug!(model = %self.model, img2img = request.input_image.is_some(), "novelai request");
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(request.credential.trim())
            .json(&payload)
            .send()
            .with_context(|| format!("NovelAI request failed ({endpoint})"))?;
        let response = ensure_success(PROVIDER, response)?;
        let archive = response
            .bytes()
            .context("NovelAI response body read failed")?;
        let image_data = extract_png(&archive)?;
        Ok(ProviderImage {
            image_data,
            model: self.model.clone(),
        })
    }
}
