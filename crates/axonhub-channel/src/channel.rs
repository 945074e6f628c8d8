use rand::Rng;
use serde::{Deserialize, Serialize};

use axonhub_protocol::ApiFormat;
use axonhub_transform::{ChannelEndpoint, Platform};

use crate::overrides::OverrideOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelError;

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("requested model is not served by this channel")
    }
}

impl std::error::Error for ModelError {}

/// Upstream provider family a channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    #[serde(rename = "openai_responses")]
    OpenAiResponses,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "anthropic_bedrock")]
    AnthropicBedrock,
    #[serde(rename = "gemini")]
    Gemini,
}

impl ChannelType {
    pub fn api_format(&self) -> ApiFormat {
        match self {
            ChannelType::OpenAi | ChannelType::OpenAiCompatible => {
                ApiFormat::OpenAiChatCompletions
            }
            ChannelType::OpenAiResponses => ApiFormat::OpenAiResponses,
            ChannelType::Anthropic | ChannelType::AnthropicBedrock => ApiFormat::AnthropicMessages,
            ChannelType::Gemini => ApiFormat::GeminiContents,
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            ChannelType::AnthropicBedrock => Platform::Bedrock,
            _ => Platform::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    Disabled,
    Archived,
}

/// Credential bundle: static headers plus one or more interchangeable keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelCredentials {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    /// Additional keys rotated per request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
}

impl ChannelCredentials {
    /// Pick one key from the bucket; single-key bundles always return it.
    pub fn pick_key(&self) -> &str {
        if self.api_keys.is_empty() {
            return &self.api_key;
        }
        let mut pool = Vec::with_capacity(self.api_keys.len() + 1);
        if !self.api_key.is_empty() {
            pool.push(self.api_key.as_str());
        }
        pool.extend(self.api_keys.iter().map(String::as_str));
        let index = rand::rng().random_range(0..pool.len());
        pool[index]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Alias prefix clients may use; `<prefix>/<model>` resolves to `<model>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_model_prefix: Option<String>,
    /// Prefixes that may be stripped from, or prepended to, the client model
    /// when matching against the supported set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auto_trimed_model_prefixes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_ops: Vec<OverrideOp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body_ops: Vec<OverrideOp>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_test_model: Option<String>,
}

/// One upstream endpoint as held by the hot registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub channel_type: ChannelType,
    pub status: ChannelStatus,
    pub base_url: String,
    pub credentials: ChannelCredentials,
    pub supported_models: Vec<String>,
    #[serde(default)]
    pub settings: ChannelSettings,
}

impl Channel {
    /// Resolve the client-requested model to the id this channel serves.
    pub fn choose_model(&self, requested: &str) -> Result<String, ModelError> {
        if self.supports_exact(requested) {
            return Ok(requested.to_string());
        }

        if let Some(prefix) = &self.settings.extra_model_prefix
            && let Some(stripped) = requested.strip_prefix(&format!("{prefix}/"))
        {
            if self.supports_exact(stripped) {
                return Ok(stripped.to_string());
            }
            return Err(ModelError);
        }

        for prefix in &self.settings.auto_trimed_model_prefixes {
            if let Some(stripped) = requested.strip_prefix(&format!("{prefix}/"))
                && self.supports_exact(stripped)
            {
                return Ok(stripped.to_string());
            }
        }
        for prefix in &self.settings.auto_trimed_model_prefixes {
            let prefixed = format!("{prefix}/{requested}");
            if self.supports_exact(&prefixed) {
                return Ok(prefixed);
            }
        }

        Err(ModelError)
    }

    pub fn is_model_supported(&self, requested: &str) -> bool {
        self.choose_model(requested).is_ok()
    }

    fn supports_exact(&self, model: &str) -> bool {
        self.supported_models.iter().any(|m| m == model)
    }

    /// Endpoint view handed to the outbound transformer.
    pub fn endpoint(&self) -> ChannelEndpoint {
        ChannelEndpoint {
            base_url: self.base_url.clone(),
            api_key: self.credentials.pick_key().to_string(),
            platform: self.channel_type.platform(),
            extra_headers: self.credentials.headers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(models: &[&str], settings: ChannelSettings) -> Channel {
        Channel {
            id: 1,
            name: "test".to_string(),
            channel_type: ChannelType::OpenAiCompatible,
            status: ChannelStatus::Enabled,
            base_url: "https://api.example.com/v1".to_string(),
            credentials: ChannelCredentials::default(),
            supported_models: models.iter().map(|m| m.to_string()).collect(),
            settings,
        }
    }

    #[test]
    fn extra_model_prefix_strips_to_supported() {
        let ch = channel(
            &["deepseek-chat"],
            ChannelSettings {
                extra_model_prefix: Some("deepseek".to_string()),
                ..ChannelSettings::default()
            },
        );
        assert_eq!(ch.choose_model("deepseek/deepseek-chat").unwrap(), "deepseek-chat");
        assert_eq!(ch.choose_model("deepseek-chat").unwrap(), "deepseek-chat");
        assert!(ch.choose_model("deepseek/gpt-4").is_err());
        assert!(ch.choose_model("openai/deepseek-chat").is_err());
    }

    #[test]
    fn auto_trimmed_prefix_synthesizes_supported_id() {
        let ch = channel(
            &["deepseek-ai/DeepSeek-V3.2"],
            ChannelSettings {
                auto_trimed_model_prefixes: vec!["deepseek-ai".to_string()],
                ..ChannelSettings::default()
            },
        );
        assert_eq!(
            ch.choose_model("DeepSeek-V3.2").unwrap(),
            "deepseek-ai/DeepSeek-V3.2"
        );
        assert_eq!(
            ch.choose_model("deepseek-ai/DeepSeek-V3.2").unwrap(),
            "deepseek-ai/DeepSeek-V3.2"
        );
    }

    #[test]
    fn auto_trimmed_prefix_strip_requires_supported_remainder() {
        let ch = channel(
            &["DeepSeek-V3.2"],
            ChannelSettings::default(),
        );
        assert!(ch.choose_model("deepseek-ai/DeepSeek-V3.2").is_err());
    }

    #[test]
    fn predicate_agrees_with_resolution() {
        let ch = channel(
            &["gpt-4o"],
            ChannelSettings {
                extra_model_prefix: Some("openai".to_string()),
                ..ChannelSettings::default()
            },
        );
        for model in ["gpt-4o", "openai/gpt-4o", "openai/gpt-5", "claude"] {
            assert_eq!(ch.is_model_supported(model), ch.choose_model(model).is_ok());
        }
    }

    #[test]
    fn key_bucket_returns_a_member() {
        let creds = ChannelCredentials {
            api_key: "a".to_string(),
            api_keys: vec!["b".to_string(), "c".to_string()],
            headers: Vec::new(),
        };
        for _ in 0..16 {
            assert!(["a", "b", "c"].contains(&creds.pick_key()));
        }
    }
}
