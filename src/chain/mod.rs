pub mod factory;
pub mod manager;
pub mod runner;


use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// Which conversational pipeline is active. Exactly one per manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    /// Prompt + memory + model, no retrieval.
    PlainChat,
    /// Question answering grounded in the vault index.
    VaultQa,
    /// Conversational pipeline with tool use and on-demand retrieval.
    Agentic,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::PlainChat => "plain_chat",
            ChainType::VaultQa => "vault_qa",
            ChainType::Agentic => "agentic",
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainType {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "plain_chat" => Ok(ChainType::PlainChat),
            "vault_qa" => Ok(ChainType::VaultQa),
            "agentic" => Ok(ChainType::Agentic),
            other => Err(CoreError::UnsupportedChainType(other.to_string())),
        }
    }
}
