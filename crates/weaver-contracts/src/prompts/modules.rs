use serde::{Deserialize, Serialize};

/// Weights closer to 1.0 than this are written without annotation.
pub const NEUTRAL_WEIGHT_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSpec {
    #[serde(default)]
    pub id: String,
    pub text: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Hidden tags are not shown in the editor but still take part in generation.
    #[serde(default)]
    pub hidden: bool,
}

fn default_weight() -> f64 {
    1.0
}

impl TagSpec {
    pub fn new(text: impl Into<String>, weight: f64) -> Self {
        Self {
            id: String::new(),
            text: text.into(),
            weight,
            hidden: false,
        }
    }

    pub fn is_neutral(&self) -> bool {
        (self.weight - 1.0).abs() < NEUTRAL_WEIGHT_EPSILON
    }

    /// `text` for neutral weights, `weight::text::` otherwise.
    pub fn to_prompt_fragment(&self) -> String {
        let text = self.text.trim();
        if self.is_neutral() {
            return text.to_string();
        }
        format!("{:.1}::{}::", self.weight, text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub tags: Vec<TagSpec>,
}

/// Flattens modules into one weighted prompt, preserving module and tag order.
pub fn build_prompt(modules: &[ModuleSpec]) -> String {
    modules
        .iter()
        .flat_map(|module| module.tags.iter())
        .filter(|tag| !tag.text.trim().is_empty())
        .map(TagSpec::to_prompt_fragment)
        .collect::<Vec<String>>()
        .join(", ")
}

/// Tag texts only, for copying into other tools.
pub fn raw_prompt(modules: &[ModuleSpec]) -> String {
    modules
        .iter()
        .flat_map(|module| module.tags.iter())
        .map(|tag| tag.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<&str>>()
        .join(", ")
}
