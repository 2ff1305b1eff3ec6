use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::chain::ChainType;
use crate::llm::registry::CustomModel;

/// When to rebuild the vault index on entering a QA-capable mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReindexStrategy {
    /// Rebuild only when explicitly requested.
    #[default]
    Manual,
    /// Rebuild whenever a QA-capable mode is entered.
    OnModeSwitch,
}

/// Typed change notifications from the settings layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsEvent {
    ModelChanged,
    ChainTypeChanged(ChainType),
    SettingsChanged,
}

/// Synchronous view of the host's settings, plus change subscription.
///
/// Getters must be cheap; they are consulted on every pipeline rebuild.
pub trait SettingsProvider: Send + Sync {
    fn active_model_key(&self) -> String;
    fn chain_type(&self) -> ChainType;
    fn max_source_chunks(&self) -> usize;
    fn debug(&self) -> bool;
    fn system_prompt(&self) -> String;
    fn reindex_strategy(&self) -> ReindexStrategy;
    fn custom_models(&self) -> Vec<CustomModel>;

    /// New receiver on the settings event channel. The core subscribes at
    /// construction and listens for the process lifetime.
    fn subscribe(&self) -> broadcast::Receiver<SettingsEvent>;
}
