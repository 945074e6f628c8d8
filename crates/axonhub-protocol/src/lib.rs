pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod sse;
pub mod unified;

use serde::{Deserialize, Serialize};

/// Wire protocol families recognized on both sides of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiFormat {
    #[serde(rename = "openai/chat_completions")]
    OpenAiChatCompletions,
    #[serde(rename = "openai/responses")]
    OpenAiResponses,
    #[serde(rename = "anthropic/messages")]
    AnthropicMessages,
    #[serde(rename = "gemini/contents")]
    GeminiContents,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::OpenAiChatCompletions => "openai/chat_completions",
            ApiFormat::OpenAiResponses => "openai/responses",
            ApiFormat::AnthropicMessages => "anthropic/messages",
            ApiFormat::GeminiContents => "gemini/contents",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "openai/chat_completions" => Some(ApiFormat::OpenAiChatCompletions),
            "openai/responses" => Some(ApiFormat::OpenAiResponses),
            "anthropic/messages" => Some(ApiFormat::AnthropicMessages),
            "gemini/contents" => Some(ApiFormat::GeminiContents),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_round_trips_through_str() {
        for format in [
            ApiFormat::OpenAiChatCompletions,
            ApiFormat::OpenAiResponses,
            ApiFormat::AnthropicMessages,
            ApiFormat::GeminiContents,
        ] {
            assert_eq!(ApiFormat::parse(format.as_str()), Some(format));
        }
    }
}
