use weaver_contracts::errors::GenerationError;
use weaver_contracts::events::{EventWriter, ThinkingEvent};
use weaver_contracts::prompts::compile_refined_prompt;
use weaver_contracts::thinking::{ThinkingLog, ThinkingPhase, ThinkingResult};

use crate::{Advisor, ImageProvider, ProviderGenerateRequest};

/// Five-phase refinement run: sketch, critique, style tags, refine, final.
///
/// Phases run strictly in order on the calling thread. Every log entry is
/// streamed as it is appended and the sketch is streamed as soon as it
/// exists. The terminal event is left to the caller so that validation
/// failures and pipeline failures share one exit.
pub struct DeepThinking<'a> {
    provider: &'a dyn ImageProvider,
    advisor: &'a dyn Advisor,
    events: &'a EventWriter,
    phase: ThinkingPhase,
    log: ThinkingLog,
}

impl<'a> DeepThinking<'a> {
    pub fn new(
        provider: &'a dyn ImageProvider,
        advisor: &'a dyn Advisor,
        events: &'a EventWriter,
    ) -> Self {
        Self {
            provider,
            advisor,
            events,
            phase: ThinkingPhase::Idle,
            log: ThinkingLog::new(),
        }
    }

    pub fn phase(&self) -> ThinkingPhase {
        self.phase
    }

    /// `base` carries the raw prompt and the credential; its input image is
    /// ignored because the final render is anchored to the sketch.
    pub fn run(mut self, base: &ProviderGenerateRequest) -> Result<ThinkingResult, GenerationError> {
        match self.run_phases(base) {
            Ok(result) => {
                self.phase = ThinkingPhase::Completed;
                Ok(result)
            }
            Err(err) => {
                tracing::warn!(
                    run_id = self.events.run_id(),
                    phase = %self.phase,
                    code = err.kind().code(),
                    "deep thinking failed"
                );
                self.phase = ThinkingPhase::Failed;
                Err(err)
            }
        }
    }

    fn run_phases(&mut self, base: &ProviderGenerateRequest) -> Result<ThinkingResult, GenerationError> {
        let prompt = base.prompt.clone();
        let credential = base.credential.clone();

        self.advance(ThinkingPhase::Sketching)?;
        self.record("Phase 1/5: Sketching initial composition...")?;
        let sketch = self
            .provider
            .generate(&base.with_input_image(None))
            .map_err(GenerationError::from_anyhow)?
            .image_data;
        self.record("Phase 1/5: Sketch complete.")?;
        self.events
            .emit(ThinkingEvent::Sketch(sketch.clone()))
            .map_err(GenerationError::from_anyhow)?;

        self.advance(ThinkingPhase::Critiquing)?;
        let critique = self.advisor.critique(&sketch, &prompt, &credential);
        self.record(format!("Phase 2/5: Critique: {critique}"))?;

        self.advance(ThinkingPhase::StyleSuggesting)?;
        let style_tags = self.advisor.suggest_style_tags(&prompt, &credential);
        self.record(format!("Phase 3/5: Style suggestions: {style_tags}"))?;

        self.advance(ThinkingPhase::Refining)?;
        self.record("Phase 4/5: Refining prompt with critique and style guidance...")?;
        let refined = compile_refined_prompt(&prompt, &critique, &style_tags);
        tracing::debug!(run_id = self.events.run_id(), %refined, "refined prompt");

        self.advance(ThinkingPhase::FinalGenerating)?;
        self.record("Phase 5/5: Rendering final image from sketch...")?;
        let final_image = self
            .provider
            .generate(&base.with_prompt(refined).with_input_image(Some(sketch.clone())))
            .map_err(GenerationError::from_anyhow)?
            .image_data;
        self.record("Deep Thinking complete.")?;

        Ok(ThinkingResult::new(
            final_image,
            Some(sketch),
            std::mem::take(&mut self.log),
        ))
    }

    /// Moves to `next`, first checking that someone is still listening.
    fn advance(&mut self, next: ThinkingPhase) -> Result<(), GenerationError> {
        if self.events.is_closed() {
            return Err(GenerationError::Cancelled(format!(
                "consumer disconnected before {next}"
            )));
        }
        debug_assert_eq!(self.phase.next(), Some(next));
        tracing::debug!(run_id = self.events.run_id(), from = %self.phase, to = %next, "phase");
        self.phase = next;
        Ok(())
    }

    fn record(&mut self, line: impl Into<String>) -> Result<(), GenerationError> {
        let line = self.log.push(line);
        tracing::info!(run_id = self.events.run_id(), "{line}");
        self.events
            .log(line)
            .map_err(GenerationError::from_anyhow)?;
        Ok(())
    }
}
