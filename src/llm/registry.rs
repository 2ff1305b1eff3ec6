use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::provider::ChatModel;
use crate::errors::CoreError;

pub const DEFAULT_MODEL_NAME: &str = "gpt-4.1";
pub const DEFAULT_MODEL_PROVIDER: &str = "openai";

/// Capability flags for a configured model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Reasoning-only variants reject the system role.
    #[serde(default)]
    pub reasoning_only: bool,
    #[serde(default)]
    pub supports_tools: bool,
}

/// A user-configured model entry.
///
/// Identified by the composite key `(name, provider)`; the key is expected
/// to be unique across the configured list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomModel {
    pub name: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
}

impl CustomModel {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            endpoint: None,
            capabilities: ModelCapabilities::default(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}|{}", self.name, self.provider)
    }

    /// The built-in fallback used when the configured key does not resolve.
    pub fn builtin_default() -> Self {
        Self::new(DEFAULT_MODEL_NAME, DEFAULT_MODEL_PROVIDER)
    }
}

/// Resolve a model key against the configured custom models.
///
/// Returns `Ok(None)` when no entry carries the key. A key matching more
/// than one entry is a configuration defect and fails instead of silently
/// picking an arbitrary match.
pub fn find_custom_model<'a>(
    key: &str,
    models: &'a [CustomModel],
) -> Result<Option<&'a CustomModel>, CoreError> {
    let mut matches = models.iter().filter(|model| model.key() == key);
    let first = matches.next();
    if matches.next().is_some() {
        return Err(CoreError::DuplicateModel(key.to_string()));
    }
    Ok(first)
}

/// Provider model registry: maps a model spec to an initialized handle.
///
/// The host supplies the implementation; vendor SDK wiring happens behind
/// `set_chat_model`.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// The currently installed chat model handle, if any.
    fn get_chat_model(&self) -> Option<Arc<dyn ChatModel>>;

    /// The spec last installed via `set_chat_model`.
    fn active_model(&self) -> Option<CustomModel>;

    /// Initialize and install the handle for `model`.
    async fn set_chat_model(&self, model: &CustomModel) -> Result<(), CoreError>;

    /// Whether the handle is usable right now.
    async fn validate_chat_model(&self, model: &dyn ChatModel) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_exact_key() {
        let models = vec![
            CustomModel::new("sonnet", "anthropic"),
            CustomModel::new("gpt-4.1", "openai"),
        ];
        let found = find_custom_model("sonnet|anthropic", &models).expect("lookup");
        assert_eq!(found.map(|m| m.name.as_str()), Some("sonnet"));
    }

    #[test]
    fn lookup_misses_return_none() {
        let models = vec![CustomModel::new("gpt-4.1", "openai")];
        let found = find_custom_model("ghost|nowhere", &models).expect("lookup");
        assert!(found.is_none());
    }

    #[test]
    fn duplicate_keys_fail_loudly() {
        let models = vec![
            CustomModel::new("gpt-4.1", "openai"),
            CustomModel::new("gpt-4.1", "openai"),
        ];
        let err = find_custom_model("gpt-4.1|openai", &models).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateModel(_)));
    }
}
