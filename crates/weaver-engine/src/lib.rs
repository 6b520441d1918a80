use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;
use sha2::{Digest, Sha256};
use weaver_contracts::config::EngineConfig;
use weaver_contracts::errors::GenerationError;
use weaver_contracts::events::{EventWriter, ThinkingEvent};
use weaver_contracts::models::ModelRegistry;
use weaver_contracts::prompts::compile;
use weaver_contracts::request::{
    AnalyzeRequest, AnalyzeResponse, EngineKind, GenerationRequest, GenerationResponse,
    RefineRequest, RefineResponse,
};
use weaver_contracts::thinking::{ThinkingLog, ThinkingResult};

mod advisor;
mod analysis;
mod deep_thinking;
mod gemini;
mod novelai;

pub use advisor::{
    Advisor, GeminiAdvisor, GeminiTextClient, CRITIQUE_FALLBACK, STYLE_TAGS_FALLBACK,
};
pub use analysis::ModuleAnalyst;
pub use deep_thinking::DeepThinking;
pub use gemini::GeminiProvider;
pub use novelai::NovelAiProvider;

const ERROR_BODY_LOG_CHARS: usize = 512;

/// One adapter call. The prompt is already in the form the provider wants
/// (compiled or verbatim).
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderGenerateRequest {
    pub prompt: String,
    pub input_image: Option<String>,
    pub credential: String,
    pub resolution: String,
    pub steps: Option<u32>,
    pub scale: Option<f64>,
    pub strength: Option<f64>,
}

impl ProviderGenerateRequest {
    pub fn from_request(
        request: &GenerationRequest,
        prompt: String,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            prompt,
            input_image: request.input_image().map(str::to_string),
            credential: request.credential()?.to_string(),
            resolution: request.resolution.trim().to_string(),
            steps: request.steps,
            scale: request.scale,
            strength: request.strength,
        })
    }

    pub fn with_prompt(&self, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..self.clone()
        }
    }

    pub fn with_input_image(&self, image: Option<String>) -> Self {
        Self {
            input_image: image,
            ..self.clone()
        }
    }
}

/// Base64 image bytes as returned (or re-encoded) by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderImage {
    pub image_data: String,
    pub model: String,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &ProviderGenerateRequest) -> Result<ProviderImage>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }
}

/// Registry key of the adapter serving `kind`.
pub fn provider_name(kind: EngineKind) -> &'static str {
    match kind {
        EngineKind::GoogleImagen => "gemini",
        EngineKind::NovelAi => "novelai",
    }
}

/// Request-scoped facade over the adapters and the advisor.
///
/// Construct it on the thread that will run the generation: the blocking
/// HTTP clients it owns must not be dropped inside an async context.
pub struct GenerationEngine {
    providers: ImageProviderRegistry,
    advisor: Box<dyn Advisor>,
    analyst: Option<ModuleAnalyst>,
}

impl GenerationEngine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let registry = config.model_registry();
        let mut providers = ImageProviderRegistry::new();
        providers.register(GeminiProvider::new(config, &registry)?);
        providers.register(NovelAiProvider::new(config, &registry)?);
        let text = GeminiTextClient::new(config, &registry)?;
        Ok(Self {
            providers,
            advisor: Box::new(GeminiAdvisor::new(text.clone())),
            analyst: Some(ModuleAnalyst::new(text)),
        })
    }

    /// Engine over caller-supplied parts; analysis is unavailable.
    pub fn with_parts(providers: ImageProviderRegistry, advisor: Box<dyn Advisor>) -> Self {
        Self {
            providers,
            advisor,
            analyst: None,
        }
    }

    fn provider_for(&self, kind: EngineKind) -> Result<&dyn ImageProvider, GenerationError> {
        self.providers
            .get(provider_name(kind))
            .ok_or_else(|| GenerationError::UnsupportedEngine(kind.as_str().to_string()))
    }

    fn analyst(&self) -> Result<&ModuleAnalyst, GenerationError> {
        self.analyst
            .as_ref()
            .ok_or_else(|| GenerationError::Internal("module analysis is not configured".to_string()))
    }

    /// Single-call generation. Gemini gets the weight-compiled prompt, NovelAI
    /// the prompt verbatim since it weights natively.
    pub fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        let kind = request.validate()?;
        let provider = self.provider_for(kind)?;
        let prompt = match kind {
            EngineKind::GoogleImagen => compile(&request.prompt),
            EngineKind::NovelAi => request.prompt.clone(),
        };
        let provider_request = ProviderGenerateRequest::from_request(request, prompt)?;
        tracing::info!(
            engine = kind.as_str(),
            key = %credential_fingerprint(&provider_request.credential),
            img2img = provider_request.input_image.is_some(),
            "direct generation"
        );
        let image = provider
            .generate(&provider_request)
            .map_err(GenerationError::from_anyhow)?;
        Ok(GenerationResponse {
            image_data: image.image_data,
        })
    }

    /// Streamed generation. Always finishes the stream with exactly one
    /// terminal event and returns the same outcome to the caller.
    pub fn stream(
        &self,
        request: &GenerationRequest,
        events: &EventWriter,
    ) -> Result<ThinkingResult, GenerationError> {
        let outcome = self.stream_inner(request, events);
        let terminal = match &outcome {
            Ok(result) => ThinkingEvent::Result(result.clone()),
            Err(err) => {
                tracing::warn!(run_id = events.run_id(), code = err.kind().code(), "{err}");
                ThinkingEvent::Error(err.to_string())
            }
        };
        if let Err(err) = events.emit(terminal) {
            tracing::warn!(run_id = events.run_id(), "terminal event not delivered: {err:#}");
        }
        outcome
    }

    fn stream_inner(
        &self,
        request: &GenerationRequest,
        events: &EventWriter,
    ) -> Result<ThinkingResult, GenerationError> {
        let kind = request.validate()?;
        if request.deep_thinking && kind == EngineKind::GoogleImagen {
            let provider = self.provider_for(kind)?;
            let base = ProviderGenerateRequest::from_request(request, request.prompt.clone())?;
            tracing::info!(
                run_id = events.run_id(),
                key = %credential_fingerprint(&base.credential),
                "deep thinking started"
            );
            return DeepThinking::new(provider, self.advisor.as_ref(), events).run(&base);
        }

        let mut log = ThinkingLog::new();
        let line = log.push(format!("Generating image with {}...", kind.display_name()));
        events.log(line).map_err(GenerationError::from_anyhow)?;
        let response = self.generate(request)?;
        Ok(ThinkingResult::new(response.image_data, None, log))
    }

    pub fn analyze(&self, request: &AnalyzeRequest) -> Result<AnalyzeResponse, GenerationError> {
        let api_key = request.validate()?;
        tracing::info!(key = %credential_fingerprint(api_key), "analyzing image");
        self.analyst()?
            .analyze(&request.image_data, api_key)
            .map_err(GenerationError::from_anyhow)
    }

    pub fn refine(&self, request: &RefineRequest) -> Result<RefineResponse, GenerationError> {
        let api_key = request.validate()?;
        let unlocked = request.unlocked_modules();
        tracing::info!(
            key = %credential_fingerprint(api_key),
            unlocked = unlocked.len(),
            "refining modules"
        );
        self.analyst()?
            .refine(&unlocked, &request.instruction, api_key)
            .map_err(GenerationError::from_anyhow)
    }
}

/// Short, stable identifier for a credential that is safe to log.
pub fn credential_fingerprint(credential: &str) -> String {
    let digest = Sha256::digest(credential.trim().as_bytes());
    let mut text = hex::encode(digest);
    text.truncate(12);
    text
}

/// Resolves a configured model name through the registry, logging when it
/// had to be substituted.
fn select_model(
    registry: &ModelRegistry,
    configured: &str,
    provider: &str,
    needs: &[&str],
) -> Result<String> {
    let choice = registry
        .resolve(configured, provider, needs)
        .map_err(anyhow::Error::msg)?;
    if let Some(reason) = choice.substituted.as_deref() {
        tracing::warn!(provider, model = %choice.model.name, "{reason}");
    }
    Ok(choice.model.name)
}

fn build_http_client(timeout: Duration) -> Result<HttpClient> {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

/// Passes a 2xx response through; otherwise reads the body and raises the
/// classified taxonomy error.
fn ensure_success(provider: &str, response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} error body read failed ({code})"))?;
    tracing::warn!(
        provider,
        status = code,
        body = %truncate_text(&body, ERROR_BODY_LOG_CHARS),
        "provider request failed"
    );
    Err(GenerationError::from_status(provider, code, &body).into())
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let response = ensure_success(provider, response)?;
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use weaver_contracts::errors::ErrorKind;
    use weaver_contracts::events::RecordingSink;

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingProvider {
        name: &'static str,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    impl ImageProvider for RecordingProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn generate(&self, request: &ProviderGenerateRequest) -> Result<ProviderImage> {
            self.prompts
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .push(request.prompt.clone());
            Ok(ProviderImage {
                image_data: format!("{}-image", self.name),
                model: "test".to_string(),
            })
        }
    }

    struct QuietAdvisor;

    impl Advisor for QuietAdvisor {
        fn critique(&self, _image: &str, _prompt: &str, _credential: &str) -> String {
            "fix a, fix b, fix c".to_string()
        }

        fn suggest_style_tags(&self, _prompt: &str, _credential: &str) -> String {
            "t1, t2, t3, t4, t5".to_string()
        }
    }

    fn engine() -> (GenerationEngine, RecordingProvider, RecordingProvider) {
        let gemini = RecordingProvider {
            name: "gemini",
            ..RecordingProvider::default()
        };
        let novelai = RecordingProvider {
            name: "novelai",
            ..RecordingProvider::default()
        };
        let mut providers = ImageProviderRegistry::new();
        providers.register(gemini.clone());
        providers.register(novelai.clone());
        (
            GenerationEngine::with_parts(providers, Box::new(QuietAdvisor)),
            gemini,
            novelai,
        )
    }

    fn request(engine: &str, prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            engine: engine.to_string(),
            google_credentials: Some("g-key".to_string()),
            novelai_api_key: Some("n-key".to_string()),
            resolution: "1024x1024".to_string(),
            ..GenerationRequest::default()
        }
    }

    #[test]
    fn direct_gemini_path_compiles_weights() -> anyhow::Result<()> {
        let (engine, gemini, _) = engine();
        let response = engine.generate(&request("google-imagen", "a 1.5::cat::"))?;
        assert_eq!(response.image_data, "gemini-image");
        let prompts = gemini.prompts.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        assert_eq!(prompts.as_slice(), ["a highly detailed, cat"]);
        Ok(())
    }

    #[test]
    fn direct_novelai_path_keeps_prompt_verbatim() -> anyhow::Result<()> {
        let (engine, _, novelai) = engine();
        engine.generate(&request("novelai", "a 1.5::cat::"))?;
        let prompts = novelai.prompts.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        assert_eq!(prompts.as_slice(), ["a 1.5::cat::"]);
        Ok(())
    }

    #[test]
    fn unknown_engine_is_rejected_before_any_call() {
        let (engine, gemini, novelai) = engine();
        let err = engine.generate(&request("dall-e", "a fox")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedEngine);
        assert!(gemini.prompts.lock().map(|p| p.is_empty()).unwrap_or(false));
        assert!(novelai.prompts.lock().map(|p| p.is_empty()).unwrap_or(false));
    }

    #[test]
    fn non_deep_stream_emits_log_then_result_without_sketch() {
        let (engine, _, _) = engine();
        let sink = RecordingSink::new();
        let writer = EventWriter::new(sink.clone(), "run-direct");
        let result = engine.stream(&request("novelai", "a fox"), &writer);
        assert!(result.is_ok());

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "log");
        match &events[1] {
            ThinkingEvent::Result(result) => {
                assert_eq!(result.image_data, "novelai-image");
                assert!(result.sketch_image.is_none());
                assert_eq!(result.thinking_log.len(), 1);
            }
            other => panic!("unexpected terminal {other:?}"),
        }
    }

    #[test]
    fn deep_thinking_on_novelai_falls_back_to_direct() {
        let (engine, _, novelai) = engine();
        let mut deep = request("novelai", "a fox");
        deep.deep_thinking = true;
        let sink = RecordingSink::new();
        let writer = EventWriter::new(sink.clone(), "run-nai");
        assert!(engine.stream(&deep, &writer).is_ok());
        assert_eq!(novelai.prompts.lock().map(|p| p.len()).unwrap_or(0), 1);
        assert!(sink.events().iter().all(|event| event.name() != "sketch"));
    }

    #[test]
    fn deep_thinking_on_gemini_streams_sketch_and_result() -> anyhow::Result<()> {
        let (engine, gemini, _) = engine();
        let mut deep = request("google-imagen", "a fox");
        deep.deep_thinking = true;
        let sink = RecordingSink::new();
        let writer = EventWriter::new(sink.clone(), "run-deep");
        let result = engine.stream(&deep, &writer).map_err(anyhow::Error::new)?;

        assert_eq!(result.sketch_image.as_deref(), Some("gemini-image"));
        assert!(result.thinking_log.len() >= 6);
        let prompts = gemini.prompts.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0], "a fox");
        let events = sink.events();
        assert_eq!(events.iter().filter(|event| event.name() == "sketch").count(), 1);
        assert_eq!(events.last().map(ThinkingEvent::name), Some("result"));
        Ok(())
    }

    #[test]
    fn stream_validation_failure_is_a_single_error_event() {
        let (engine, _, _) = engine();
        let mut bad = request("google-imagen", "a fox");
        bad.google_credentials = None;
        let sink = RecordingSink::new();
        let writer = EventWriter::new(sink.clone(), "run-bad");
        let err = engine.stream(&bad, &writer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCredential);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "error");
    }

    #[test]
    fn analysis_requires_configured_analyst() {
        let (engine, _, _) = engine();
        let err = engine
            .analyze(&AnalyzeRequest {
                image_data: "aGk=".to_string(),
                gemini_api_key: "g-key".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        let a = credential_fingerprint("secret-key");
        assert_eq!(a.len(), 12);
        assert_eq!(a, credential_fingerprint(" secret-key "));
        assert_ne!(a, credential_fingerprint("other-key"));
        assert!(!a.contains("secret"));
    }

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
