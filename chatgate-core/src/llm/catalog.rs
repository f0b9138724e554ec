//! Model catalog

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Model catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Model used when a chat request names none
    pub default_model: String,

    /// Models known to accept image input
    pub multimodal_models: Vec<String>,

    /// Catalog served when the upstream listing is unavailable
    pub fallback_models: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_model: "meta-llama/llama-3.2-3b-instruct:free".to_string(),
            multimodal_models: vec!["google/gemma-2-9b-it:free".to_string()],
            fallback_models: [
                "meta-llama/llama-3.2-3b-instruct:free",
                "meta-llama/llama-3.2-1b-instruct:free",
                "google/gemma-2-9b-it:free",
                "microsoft/phi-3-mini-128k-instruct:free",
                "microsoft/phi-3-medium-128k-instruct:free",
                "huggingfaceh4/zephyr-7b-beta:free",
                "openchat/openchat-7b:free",
                "qwen/qwen-2-7b-instruct:free",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Information about a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u64>,
    pub supports_images: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Value>,
}

/// Known models and their capabilities.
///
/// Starts out with the fallback list; [`ModelCatalog::refresh_from_listing`]
/// replaces it with whatever the provider currently offers for free.
#[derive(Debug)]
pub struct ModelCatalog {
    config: ModelsConfig,
    models: RwLock<Vec<ModelInfo>>,
}

impl ModelCatalog {
    pub fn new(config: ModelsConfig) -> Self {
        let models = fallback_models(&config);
        Self {
            config,
            models: RwLock::new(models),
        }
    }

    pub fn config(&self) -> &ModelsConfig {
        &self.config
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    /// Current catalog
    pub fn models(&self) -> Vec<ModelInfo> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, model_id: &str) -> Option<ModelInfo> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.id == model_id)
            .cloned()
    }

    /// Whether `model_id` accepts image input.
    ///
    /// Models missing from the catalog fall back to the id heuristic.
    pub fn supports_images(&self, model_id: &str) -> bool {
        match self.get(model_id) {
            Some(model) => model.supports_images,
            None => self.looks_multimodal(model_id),
        }
    }

    fn looks_multimodal(&self, model_id: &str) -> bool {
        self.config.multimodal_models.iter().any(|m| m == model_id)
            || model_id.to_ascii_lowercase().contains("vision")
    }

    /// Fallback list as configured
    pub fn fallback(&self) -> Vec<ModelInfo> {
        fallback_models(&self.config)
    }

    /// Free models out of a provider `/models` listing.
    pub fn parse_listing(&self, listing: &Value) -> Vec<ModelInfo> {
        let Some(entries) = listing.get("data").and_then(Value::as_array) else {
            return Vec::new();
        };

        let mut models = Vec::new();
        for entry in entries {
            let Some(id) = entry.get("id").and_then(Value::as_str) else {
                continue;
            };
            if !is_free(id, entry.get("pricing")) {
                continue;
            }

            let modality = entry
                .pointer("/architecture/modality")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_ascii_lowercase();
            let supports_images = self.looks_multimodal(id)
                || modality == "multimodal"
                || modality.contains("image");

            models.push(ModelInfo {
                id: id.to_string(),
                name: entry
                    .get("name")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| id.to_string()),
                description: entry
                    .get("description")
                    .and_then(Value::as_str)
                    .map(String::from),
                context_length: entry.get("context_length").and_then(Value::as_u64),
                supports_images,
                pricing: entry.get("pricing").cloned(),
            });
        }
        models
    }

    /// Replace the catalog with the free models of `listing`.
    ///
    /// An empty result keeps the fallback list. Returns the models now in
    /// the catalog.
    pub fn refresh_from_listing(&self, listing: &Value) -> Vec<ModelInfo> {
        let mut models = self.parse_listing(listing);
        if models.is_empty() {
            tracing::info!("provider listed no free models, using fallback list");
            models = self.fallback();
        }
        *self.models.write().unwrap_or_else(PoisonError::into_inner) = models.clone();
        models
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(ModelsConfig::default())
    }
}

fn fallback_models(config: &ModelsConfig) -> Vec<ModelInfo> {
    config
        .fallback_models
        .iter()
        .map(|id| ModelInfo {
            id: id.clone(),
            name: display_name(id),
            description: None,
            context_length: None,
            supports_images: config.multimodal_models.contains(id),
            pricing: None,
        })
        .collect()
}

/// `google/gemma-2-9b-it:free` -> `Gemma 2 9b It`
pub fn display_name(model_id: &str) -> String {
    let tail = model_id.rsplit('/').next().unwrap_or(model_id);
    tail.trim_end_matches(":free")
        .split('-')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn price(pricing: Option<&Value>, field: &str) -> f64 {
    // Missing or unparsable prices count as paid.
    match pricing.and_then(|p| p.get(field)) {
        Some(Value::String(s)) => s.trim().parse().unwrap_or(1.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(1.0),
        _ => 1.0,
    }
}

fn is_free(model_id: &str, pricing: Option<&Value>) -> bool {
    (price(pricing, "prompt") == 0.0 && price(pricing, "completion") == 0.0)
        || model_id.contains(":free")
        || model_id.contains("/free")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("google/gemma-2-9b-it:free"), "Gemma 2 9b It");
        assert_eq!(display_name("plain"), "Plain");
    }

    #[test]
    fn test_fallback_catalog() {
        let catalog = ModelCatalog::default();
        assert_eq!(catalog.models().len(), 8);
        assert!(catalog.supports_images("google/gemma-2-9b-it:free"));
        assert!(!catalog.supports_images("meta-llama/llama-3.2-3b-instruct:free"));
    }

    #[test]
    fn test_unknown_model_uses_heuristic() {
        let catalog = ModelCatalog::default();
        assert!(catalog.supports_images("acme/llama-vision-11b"));
        assert!(!catalog.supports_images("acme/text-only"));
    }

    #[test]
    fn test_listing_keeps_free_models() {
        let catalog = ModelCatalog::default();
        let listing = json!({
            "data": [
                {"id": "a/paid", "pricing": {"prompt": "0.001", "completion": "0.002"}},
                {"id": "b/zero", "name": "Zero", "pricing": {"prompt": "0", "completion": "0"},
                 "context_length": 8192},
                {"id": "c/tagged:free", "pricing": {"prompt": "0.5"}},
                {"id": "d/unpriced"},
                {"id": "e/pic:free", "architecture": {"modality": "text+image->text"}},
                {"id": "f/multi:free", "architecture": {"modality": "multimodal"}},
                {"name": "no id"}
            ]
        });

        let models = catalog.parse_listing(&listing);
        let ids: Vec<_> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b/zero", "c/tagged:free", "e/pic:free", "f/multi:free"]);
        assert_eq!(models[0].name, "Zero");
        assert_eq!(models[0].context_length, Some(8192));
        assert!(!models[1].supports_images);
        assert!(models[2].supports_images);
        assert!(models[3].supports_images);
    }

    #[test]
    fn test_empty_listing_keeps_fallback() {
        let catalog = ModelCatalog::default();
        let models = catalog.refresh_from_listing(&json!({"data": []}));
        assert_eq!(models, catalog.fallback());

        catalog.refresh_from_listing(&json!({"data": [{"id": "x/new:free"}]}));
        assert_eq!(catalog.models().len(), 1);
        assert!(catalog.get("x/new:free").is_some());
    }
}
