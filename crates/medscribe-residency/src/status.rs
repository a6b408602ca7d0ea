//! Status snapshots for diagnostics.
//!
//! Serializes to the shape the API layer returns verbatim:
//!
//! ```json
//! {"active": "routing", "models": {"reasoning": {"status": "dormant"}, ...}}
//! ```

use crate::model::{ModelName, ModelStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One slot's entry in a [`StatusSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub status: ModelStatus,
    /// Engine backing the slot, if it loaded
    #[serde(skip)]
    pub engine: Option<String>,
    /// Whether a stand-in replaced the primary engine
    #[serde(skip)]
    pub fallback: bool,
    /// Whether the slot counts against the GPU budget
    #[serde(skip)]
    pub uses_gpu: bool,
}

/// Consistent view of every slot plus the active model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub active: Option<ModelName>,
    pub models: BTreeMap<ModelName, SlotStatus>,
}

impl StatusSnapshot {
    pub fn status_of(&self, name: ModelName) -> ModelStatus {
        self.models
            .get(&name)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// Models currently reported resident, stand-ins included.
    pub fn resident_models(&self) -> Vec<ModelName> {
        self.models
            .iter()
            .filter(|(_, s)| s.status == ModelStatus::Resident)
            .map(|(name, _)| *name)
            .collect()
    }

    /// Number of GPU-backed models reported resident. Never above one.
    pub fn gpu_resident_count(&self) -> usize {
        self.models
            .values()
            .filter(|s| s.uses_gpu && s.status == ModelStatus::Resident)
            .count()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(status: ModelStatus, uses_gpu: bool) -> SlotStatus {
        SlotStatus {
            status,
            engine: Some("vllm".into()),
            fallback: !uses_gpu,
            uses_gpu,
        }
    }

    #[test]
    fn test_serializes_api_shape() {
        let snapshot = StatusSnapshot {
            active: Some(ModelName::Routing),
            models: BTreeMap::from([
                (ModelName::Reasoning, entry(ModelStatus::Dormant, true)),
                (ModelName::Routing, entry(ModelStatus::Resident, true)),
                (ModelName::Speech, entry(ModelStatus::Resident, false)),
            ]),
        };

        assert_eq!(
            snapshot.to_json(),
            json!({
                "active": "routing",
                "models": {
                    "reasoning": { "status": "dormant" },
                    "routing": { "status": "resident" },
                    "speech": { "status": "resident" },
                }
            })
        );
        assert_eq!(snapshot.gpu_resident_count(), 1);
        assert_eq!(
            snapshot.resident_models(),
            vec![ModelName::Routing, ModelName::Speech]
        );
    }

    #[test]
    fn test_no_active_serializes_null() {
        let snapshot = StatusSnapshot {
            active: None,
            models: BTreeMap::from([(ModelName::Reasoning, entry(ModelStatus::Unloaded, false))]),
        };
        assert_eq!(snapshot.to_json()["active"], serde_json::Value::Null);
        assert_eq!(snapshot.status_of(ModelName::Speech), ModelStatus::Unloaded);
    }
}
