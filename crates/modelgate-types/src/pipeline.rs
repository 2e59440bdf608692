//! Pipeline definitions.
//!
//! A pipeline is an ordered list of steps. Each step optionally names the
//! model (and provider) it consumes; the union of those models is what a job
//! on this pipeline reserves for its whole lifetime.
//!
//! ```yaml
//! name: text-to-video
//! steps:
//!   - name: generate
//!     model: gen-x
//!     provider: acme
//!     executor:
//!       type: http
//!       url: https://api.acme.test/generate
//!   - name: upscale
//!     model: upscaler
//!     timeout_secs: 600
//!     executor:
//!       type: http
//!       url: https://api.acme.test/upscale
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

impl PipelineDefinition {
    /// Step models deduplicated, preserving first-seen order.
    pub fn required_models(&self) -> Vec<String> {
        let mut models: Vec<String> = Vec::new();
        for model in self.steps.iter().filter_map(|s| s.model.as_ref()) {
            if !models.contains(model) {
                models.push(model.clone());
            }
        }
        models
    }

    pub fn total_steps(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn step(&self, index: u32) -> Option<&StepDefinition> {
        self.steps.get(index as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the pipeline.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider backing `model`, used for quota and credential checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Overrides the runner's default step timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub executor: ExecutorConfig,
}

/// How a step is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// POST (by default) the step input as JSON and take the JSON response
    /// body as the step output.
    Http {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

fn default_method() -> String {
    "POST".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, model: Option<&str>) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            model: model.map(str::to_string),
            provider: None,
            timeout_secs: None,
            executor: ExecutorConfig::Http {
                url: "http://localhost/step".to_string(),
                method: default_method(),
                headers: HashMap::new(),
            },
        }
    }

    #[test]
    fn required_models_dedupes_in_order() {
        let def = PipelineDefinition {
            name: "t2v".to_string(),
            description: None,
            steps: vec![
                step("generate", Some("gen-x")),
                step("caption", None),
                step("upscale", Some("upscaler")),
                step("refine", Some("gen-x")),
            ],
        };
        assert_eq!(def.required_models(), vec!["gen-x", "upscaler"]);
        assert_eq!(def.total_steps(), 4);
        assert_eq!(def.step(2).unwrap().name, "upscale");
        assert!(def.step(4).is_none());
    }

    #[test]
    fn http_executor_defaults_to_post() {
        let json = serde_json::json!({
            "type": "http",
            "url": "http://localhost/x"
        });
        let config: ExecutorConfig = serde_json::from_value(json).unwrap();
        let ExecutorConfig::Http { method, headers, .. } = config;
        assert_eq!(method, "POST");
        assert!(headers.is_empty());
    }
}
