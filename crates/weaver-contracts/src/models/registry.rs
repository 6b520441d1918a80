use indexmap::IndexMap;

pub const CAP_IMAGE: &str = "image";
pub const CAP_EDIT: &str = "edit";
pub const CAP_TEXT: &str = "text";
pub const CAP_VISION: &str = "vision";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn new(name: &str, provider: &str, capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            provider: provider.to_string(),
            capabilities: capabilities
                .iter()
                .map(|item| (*item).to_string())
                .collect(),
        }
    }

    /// True when the model belongs to `provider` and has every capability in `needs`.
    pub fn serves(&self, provider: &str, needs: &[&str]) -> bool {
        self.provider == provider
            && needs
                .iter()
                .all(|need| self.capabilities.iter().any(|item| item == need))
    }
}

/// Outcome of resolving a configured model name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub model: ModelSpec,
    /// Set when the configured name could not be used as-is.
    pub substituted: Option<String>,
}

/// Known models in registration order; the first model serving a
/// provider/capability pair is its default.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self {
            models: default_models(),
        }
    }
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            models: IndexMap::new(),
        }
    }

    /// Adds or replaces a model, keeping the position of an existing entry.
    pub fn register(&mut self, spec: ModelSpec) {
        self.models.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    /// Uses `configured` when it serves `provider` with `needs`, otherwise
    /// the provider's default for those capabilities.
    pub fn resolve(
        &self,
        configured: &str,
        provider: &str,
        needs: &[&str],
    ) -> Result<ModelChoice, String> {
        let configured = configured.trim();
        if let Some(model) = self
            .get(configured)
            .filter(|model| model.serves(provider, needs))
        {
            return Ok(ModelChoice {
                model: model.clone(),
                substituted: None,
            });
        }

        let wanted = needs.join("+");
        let model = self
            .models
            .values()
            .find(|model| model.serves(provider, needs))
            .cloned()
            .ok_or_else(|| format!("no {provider} model offers {wanted}"))?;
        let substituted = if configured.is_empty() {
            format!("no {provider} model configured for {wanted}; using {}", model.name)
        } else {
            format!(
                "model '{configured}' cannot serve {provider} {wanted}; using {}",
                model.name
            )
        };
        Ok(ModelChoice {
            model,
            substituted: Some(substituted),
        })
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();
    let mut insert = |name: &str, provider: &str, capabilities: &[&str]| {
        map.insert(name.to_string(), ModelSpec::new(name, provider, capabilities));
    };

    insert("gemini-2.5-flash-image", "gemini", &[CAP_IMAGE]);
    insert("gemini-3-pro-image-preview", "gemini", &[CAP_IMAGE, CAP_EDIT]);
    insert("gemini-2.0-flash-exp", "gemini", &[CAP_TEXT, CAP_VISION]);
    insert("gemini-2.5-flash", "gemini", &[CAP_TEXT, CAP_VISION]);
    insert("nai-diffusion-3", "novelai", &[CAP_IMAGE, CAP_EDIT]);
    insert("nai-diffusion-4-full", "novelai", &[CAP_IMAGE, CAP_EDIT]);

    map
}
