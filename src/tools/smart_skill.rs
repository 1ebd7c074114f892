//! Smart skills: tools implemented by an LLM prompt instead of a subprocess.
//!
//! Each skill exposes exactly one tool. A call becomes a single chat
//! completion against the provider endpoint in the skill's config; anything
//! beyond that one call (fan-out, retries across providers) belongs to the
//! control plane.

use crate::config::SmartSkillConfig;
use crate::error::AgentError;
use crate::tools::{OriginKind, ToolDescriptor, ToolOrigin};
use rmcp::model::{CallToolResult, Content};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::debug;

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

pub struct SmartSkillWorker {
    config: SmartSkillConfig,
    signature: String,
    http: reqwest::Client,
}

impl SmartSkillWorker {
    pub fn new(config: SmartSkillConfig) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("toolbus/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AgentError::ToolCallFailed(format!("http client build failed: {e}")))?;
        let signature = config.signature();
        Ok(Self {
            config,
            signature,
            http,
        })
    }

    pub fn config(&self) -> &SmartSkillConfig {
        &self.config
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The single tool this skill advertises.
    pub fn descriptor(&self) -> ToolDescriptor {
        let schema = json!({
            "type": "object",
            "properties": {
                "input": {
                    "type": "string",
                    "description": "Text passed to the skill"
                }
            },
            "required": ["input"]
        });
        let schema = match schema {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        ToolDescriptor {
            name: self.config.name.clone().into(),
            description: format!("Smart skill `{}` ({})", self.config.name, self.config.model),
            input_schema: schema,
            annotations: None,
            origin: ToolOrigin {
                kind: OriginKind::SmartSkill,
                origin_ref: self.config.id.as_str().to_string(),
            },
        }
    }

    /// Run the skill: one chat completion with the configured system prompt.
    pub async fn call(&self, arguments: &Map<String, Value>) -> Result<CallToolResult, AgentError> {
        let input = arguments
            .get("input")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AgentError::SchemaValidation("smart skill requires a string `input`".to_string())
            })?;

        // The wire model name is the part after the provider prefix.
        let model = self
            .config
            .model
            .split_once('/')
            .map(|(_, m)| m)
            .unwrap_or(self.config.model.as_str());

        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": self.config.system_prompt},
                {"role": "user", "content": input}
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let url = format!(
            "{}/chat/completions",
            self.config.provider_config.base_url.trim_end_matches('/')
        );
        debug!(skill = %self.config.name, model, "dispatching smart skill call");

        let mut request = self.http.post(&url).json(&body);
        if let Some(api_key) = &self.config.provider_config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::ToolCallFailed(format!("provider request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AgentError::ToolCallFailed(format!(
                "provider returned {}",
                response.status()
            )));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| AgentError::ToolCallFailed(format!("provider reply malformed: {e}")))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::types::ConfigId;

    fn config() -> SmartSkillConfig {
        SmartSkillConfig {
            id: ConfigId::new("skill-1"),
            name: "summarize".to_string(),
            provider_config: ProviderConfig {
                base_url: "https://api.example.com/v1/".to_string(),
                api_key: None,
            },
            model: "example/large".to_string(),
            system_prompt: "Summarize.".to_string(),
            temperature: 0.1,
            max_tokens: 256,
        }
    }

    #[test]
    fn test_descriptor_shape() {
        let skill = SmartSkillWorker::new(config()).unwrap();
        let descriptor = skill.descriptor();
        assert_eq!(descriptor.name.as_str(), "summarize");
        assert_eq!(descriptor.origin.kind, OriginKind::SmartSkill);
        assert_eq!(descriptor.origin.origin_ref, "skill-1");
        assert_eq!(descriptor.input_schema["type"], "object");
    }

    #[test]
    fn test_signature_matches_config() {
        let skill = SmartSkillWorker::new(config()).unwrap();
        assert_eq!(skill.signature(), config().signature());
    }

    #[tokio::test]
    async fn test_call_without_input_is_schema_error() {
        let skill = SmartSkillWorker::new(config()).unwrap();
        let err = skill.call(&Map::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::SchemaValidation(_)));
    }
}
