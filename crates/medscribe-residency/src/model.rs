//! Model identifiers and per-slot residency states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of models sharing the accelerator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ModelName {
    /// Large multimodal clinical reasoning model
    Reasoning,
    /// Small function-calling model that routes requests
    Routing,
    /// Medical speech recognition model
    Speech,
}

impl ModelName {
    /// Every managed model, in bootstrap order.
    pub const ALL: [ModelName; 3] = [Self::Reasoning, Self::Routing, Self::Speech];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::Routing => "routing",
            Self::Speech => "speech",
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reasoning" => Ok(Self::Reasoning),
            "routing" => Ok(Self::Routing),
            "speech" => Ok(Self::Speech),
            other => Err(format!(
                "unknown model '{other}' (expected reasoning, routing or speech)"
            )),
        }
    }
}

/// Where a model's weights currently live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    /// Initialization never completed
    #[default]
    Unloaded,
    /// Weights evicted from the accelerator, restorable
    Dormant,
    /// Weights on the accelerator, ready for inference
    Resident,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => write!(f, "unloaded"),
            Self::Dormant => write!(f, "dormant"),
            Self::Resident => write!(f, "resident"),
        }
    }
}
