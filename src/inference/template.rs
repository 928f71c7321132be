//! Chat template fallback
//!
//! Fetches `chat_template.jinja` from the model hub when the codec ships
//! without a template.

use std::time::Duration;

use crate::inference::engine::{EngineError, LoadSpec, TemplateSource};

/// Default hub endpoint
pub const DEFAULT_HUB_ENDPOINT: &str = "https://huggingface.co";

/// Template source backed by the model hub
#[derive(Clone, Debug)]
pub struct HubTemplateSource {
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for HubTemplateSource {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_HUB_ENDPOINT.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl HubTemplateSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// URL of the template file for `model_id`
    pub fn template_url(&self, model_id: &str) -> String {
        format!(
            "{}/{}/resolve/main/chat_template.jinja",
            self.endpoint.trim_end_matches('/'),
            model_id
        )
    }
}

impl TemplateSource for HubTemplateSource {
    /// Blocking. Called from the lifecycle's load path, which never runs on
    /// the async scheduler.
    fn fetch(&self, spec: &LoadSpec) -> Result<Option<String>, EngineError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| EngineError::init_failure(format!("HTTP client setup failed: {}", e)))?;

        let url = self.template_url(&spec.model_id);
        let mut request = client.get(&url);
        if let Some(credential) = &spec.credential {
            request = request.header("Authorization", format!("Bearer {}", credential.token));
        }

        let response = request
            .send()
            .map_err(|e| EngineError::init_failure(format!("Template request failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!("No chat template published at {}", url);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(EngineError::init_failure(format!(
                "Template download failed ({})",
                response.status()
            )));
        }

        let template = response
            .text()
            .map_err(|e| EngineError::init_failure(format!("Failed to read template: {}", e)))?;
        if template.trim().is_empty() {
            return Ok(None);
        }
        tracing::info!("Fetched chat template ({} bytes)", template.len());
        Ok(Some(template))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_url() {
        let source = HubTemplateSource::new("https://hub.example/");
        assert_eq!(
            source.template_url("Org/fin-8b"),
            "https://hub.example/Org/fin-8b/resolve/main/chat_template.jinja"
        );
    }

    #[test]
    fn test_unreachable_hub_is_an_error() {
        let source = HubTemplateSource {
            endpoint: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_millis(500),
        };
        let spec = LoadSpec {
            model_id: "Org/fin-8b".to_string(),
            credential: None,
            cache_dir: std::env::temp_dir(),
        };
        assert!(source.fetch(&spec).is_err());
    }
}
