//! Keyword router: the software-only stand-in for the routing model.
//!
//! Emits the same `{"tool": ..., "parameters": {...}}` call the routing model
//! is prompted to produce, so callers parse both the same way. Requests that
//! match no route are escalated to the reasoning model.

use super::request::InferenceRequest;
use super::{EngineHandle, EngineLoader};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use serde_json::json;

/// Tool name that hands the request to the reasoning model.
pub const ESCALATE_TOOL: &str = "escalate_to_medgemma";

/// A tool and the lowercase keywords that select it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordRoute {
    pub tool: String,
    pub keywords: Vec<String>,
}

impl KeywordRoute {
    pub fn new(tool: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            tool: tool.into(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    fn matches(&self, text: &str) -> bool {
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

/// First-match keyword router. Route order matters: more specific phrases
/// must come before the generic words they contain.
pub struct KeywordRouter {
    routes: Vec<KeywordRoute>,
}

impl Default for KeywordRouter {
    fn default() -> Self {
        Self::new(vec![
            KeywordRoute::new("check_drug_interactions", &["interaction", "contraindicat"]),
            KeywordRoute::new("search_fhir_observations", &["lab result", "observation", "vitals"]),
            KeywordRoute::new("order_lab_tests", &["order lab", "blood test", "panel", "cbc"]),
            KeywordRoute::new("retrieve_prior_imaging", &["prior imaging", "previous imaging", "prior scan"]),
            KeywordRoute::new("analyze_medical_image", &["x-ray", "xray", "image", "mri", "scan"]),
            KeywordRoute::new("schedule_appointment", &["schedule", "appointment", "follow-up", "follow up"]),
            KeywordRoute::new("notify_care_team", &["notify", "page the", "care team"]),
            KeywordRoute::new("generate_soap_note", &["soap", "note"]),
            KeywordRoute::new("update_ehr", &["update the chart", "update ehr", "document"]),
            KeywordRoute::new("fetch_patient_ehr", &["history", "ehr", "record", "chart"]),
        ])
    }
}

impl KeywordRouter {
    pub fn new(routes: Vec<KeywordRoute>) -> Self {
        Self { routes }
    }

    /// The tool selected for `prompt`, if any.
    pub fn route(&self, prompt: &str) -> Option<&str> {
        let text = prompt.to_lowercase();
        self.routes
            .iter()
            .find(|r| r.matches(&text))
            .map(|r| r.tool.as_str())
    }
}

#[async_trait]
impl EngineHandle for KeywordRouter {
    fn name(&self) -> &str {
        "keyword-router"
    }

    fn uses_gpu(&self) -> bool {
        false
    }

    async fn evict(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn restore(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn infer(&self, request: &InferenceRequest) -> EngineResult<String> {
        let InferenceRequest::Generate(req) = request else {
            return Err(EngineError::Unsupported {
                engine: self.name().to_string(),
                operation: request.operation(),
            });
        };

        let call = match self.route(&req.prompt) {
            Some(tool) => json!({ "tool": tool, "parameters": { "query": req.prompt } }),
            None => json!({
                "tool": ESCALATE_TOOL,
                "parameters": { "reason": "no keyword route matched" },
            }),
        };
        Ok(call.to_string())
    }
}

/// Loader that always yields the default [`KeywordRouter`].
pub struct KeywordRouterLoader;

#[async_trait]
impl EngineLoader for KeywordRouterLoader {
    fn describe(&self) -> String {
        "keyword-router".to_string()
    }

    async fn initialize(&self) -> EngineResult<Box<dyn EngineHandle>> {
        Ok(Box::new(KeywordRouter::default()))
    }
}
