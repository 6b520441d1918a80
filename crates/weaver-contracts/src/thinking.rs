use std::fmt;

use serde::{Deserialize, Serialize};

/// Deep Thinking workflow state. Transitions are strictly linear; the only
/// branch is into `Failed`, which any non-terminal state may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThinkingPhase {
    Idle,
    Sketching,
    Critiquing,
    StyleSuggesting,
    Refining,
    FinalGenerating,
    Completed,
    Failed,
}

impl ThinkingPhase {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::Sketching),
            Self::Sketching => Some(Self::Critiquing),
            Self::Critiquing => Some(Self::StyleSuggesting),
            Self::StyleSuggesting => Some(Self::Refining),
            Self::Refining => Some(Self::FinalGenerating),
            Self::FinalGenerating => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sketching => "sketching",
            Self::Critiquing => "critiquing",
            Self::StyleSuggesting => "style_suggesting",
            Self::Refining => "refining",
            Self::FinalGenerating => "final_generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ThinkingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, append-only record of phase milestones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThinkingLog {
    entries: Vec<String>,
}

impl ThinkingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry and returns it.
    pub fn push(&mut self, entry: impl Into<String>) -> &str {
        self.entries.push(entry.into());
        self.entries.last().map(String::as_str).unwrap_or_default()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }
}

/// Terminal payload of a completed run, assembled once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingResult {
    pub image_data: String,
    pub sketch_image: Option<String>,
    pub thinking_log: Vec<String>,
}

impl ThinkingResult {
    pub fn new(image_data: String, sketch_image: Option<String>, log: ThinkingLog) -> Self {
        Self {
            image_data,
            sketch_image,
            thinking_log: log.into_entries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn phases_walk_linearly_to_completed() {
        let mut phase = ThinkingPhase::Idle;
        let mut visited = vec![phase];
        while let Some(next) = phase.next() {
            visited.push(next);
            phase = next;
        }
        assert_eq!(
            visited,
            vec![
                ThinkingPhase::Idle,
                ThinkingPhase::Sketching,
                ThinkingPhase::Critiquing,
                ThinkingPhase::StyleSuggesting,
                ThinkingPhase::Refining,
                ThinkingPhase::FinalGenerating,
                ThinkingPhase::Completed,
            ]
        );
        assert!(ThinkingPhase::Failed.next().is_none());
        assert_eq!(ThinkingPhase::StyleSuggesting.to_string(), "style_suggesting");
    }

    #[test]
    fn log_keeps_insertion_order_and_duplicates() {
        let mut log = ThinkingLog::new();
        assert_eq!(log.push("a"), "a");
        log.push("b");
        log.push("a");
        assert_eq!(log.entries(), ["a", "b", "a"]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn result_serializes_with_wire_names() -> anyhow::Result<()> {
        let mut log = ThinkingLog::new();
        log.push("one");
        let result = ThinkingResult::new("final".to_string(), Some("sketch".to_string()), log);
        assert_eq!(
            serde_json::to_value(&result)?,
            json!({"imageData": "final", "sketchImage": "sketch", "thinkingLog": ["one"]})
        );
        Ok(())
    }
}
