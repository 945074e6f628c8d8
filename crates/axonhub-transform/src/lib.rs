pub mod accumulator;
pub mod inbound;
pub mod outbound;
pub mod types;

pub use accumulator::StreamAccumulator;
pub use types::{
    ChannelEndpoint, HttpMethod, HttpRequestSpec, InboundContext, InboundStreamEncoder,
    InboundTransformer, OutboundStreamDecoder, OutboundTransformer, Platform, TransformError,
};

use axonhub_protocol::ApiFormat;

/// Stateless inbound codec for a wire format.
pub fn inbound(format: ApiFormat) -> &'static dyn InboundTransformer {
    match format {
        ApiFormat::OpenAiChatCompletions => &inbound::openai_chat::OpenAiChatInbound,
        ApiFormat::OpenAiResponses => &inbound::openai_responses::OpenAiResponsesInbound,
        ApiFormat::AnthropicMessages => &inbound::anthropic::AnthropicInbound,
        ApiFormat::GeminiContents => &inbound::gemini::GeminiInbound,
    }
}

/// Outbound codec bound to one channel endpoint.
pub fn outbound(format: ApiFormat, endpoint: ChannelEndpoint) -> Box<dyn OutboundTransformer> {
    match format {
        ApiFormat::OpenAiChatCompletions => {
            Box::new(outbound::openai_chat::OpenAiChatOutbound::new(endpoint))
        }
        ApiFormat::OpenAiResponses => Box::new(
            outbound::openai_responses::OpenAiResponsesOutbound::new(endpoint),
        ),
        ApiFormat::AnthropicMessages => {
            Box::new(outbound::anthropic::AnthropicOutbound::new(endpoint))
        }
        ApiFormat::GeminiContents => Box::new(outbound::gemini::GeminiOutbound::new(endpoint)),
    }
}
