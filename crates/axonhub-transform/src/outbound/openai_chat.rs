use bytes::Bytes;

use axonhub_protocol::ApiFormat;
use axonhub_protocol::openai::chat_completions as wire;
use axonhub_protocol::sse::SseEvent;
use axonhub_protocol::unified::{
    ChatChunk, ChatRequest, ChatResponse, Choice, ChunkDelta, ContentPart, Message, Role,
    ToolCallDelta, Usage,
};

use crate::inbound::openai_chat::{decode_finish_reason, encode_finish_reason};
use crate::outbound::join_url;
use crate::types::{
    ChannelEndpoint, HttpMethod, HttpRequestSpec, OutboundStreamDecoder, OutboundTransformer,
    TransformError,
};

pub struct OpenAiChatOutbound {
    endpoint: ChannelEndpoint,
}

impl OpenAiChatOutbound {
    pub fn new(endpoint: ChannelEndpoint) -> Self {
        Self { endpoint }
    }
}

impl OutboundTransformer for OpenAiChatOutbound {
    fn format(&self) -> ApiFormat {
        ApiFormat::OpenAiChatCompletions
    }

    fn transform_request(&self, request: &ChatRequest) -> Result<HttpRequestSpec, TransformError> {
        let wire = encode_request(request);
        let body = serde_json::to_vec(&wire).map_err(TransformError::invalid_request)?;
        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            (
                "authorization".to_string(),
                format!("Bearer {}", self.endpoint.api_key),
            ),
        ];
        headers.extend(self.endpoint.extra_headers.iter().cloned());
        Ok(HttpRequestSpec {
            method: HttpMethod::Post,
            url: join_url(&self.endpoint.base_url, "/chat/completions"),
            headers,
            body: Bytes::from(body),
            stream: request.stream,
        })
    }

    fn transform_response(&self, body: &[u8]) -> Result<ChatResponse, TransformError> {
        let wire: wire::ChatCompletionResponse =
            serde_json::from_slice(body).map_err(TransformError::invalid_response)?;
        Ok(decode_response(wire))
    }

    fn start_stream(&self) -> Box<dyn OutboundStreamDecoder> {
        Box::new(ChunkDecoder)
    }
}

pub(crate) fn encode_request(request: &ChatRequest) -> wire::ChatCompletionRequest {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(wire::ChatMessage::text("system", system.clone()));
    }
    for message in &request.messages {
        match message.role {
            Role::Tool => {
                for part in &message.parts {
                    if let ContentPart::ToolResult {
                        tool_call_id,
                        content,
                        ..
                    } = part
                    {
                        messages.push(wire::ChatMessage {
                            role: "tool".to_string(),
                            content: Some(wire::MessageContent::Text(content.clone())),
                            tool_calls: None,
                            tool_call_id: Some(tool_call_id.clone()),
                            name: None,
                        });
                    }
                }
            }
            role => {
                let role_name = match role {
                    Role::Assistant => "assistant",
                    Role::System => "system",
                    _ => "user",
                };
                let mut parts = Vec::new();
                for part in &message.parts {
                    match part {
                        ContentPart::Text { text } => {
                            parts.push(wire::ContentPart::Text { text: text.clone() });
                        }
                        ContentPart::ImageUrl { url } => {
                            parts.push(wire::ContentPart::ImageUrl {
                                image_url: wire::ImageUrl {
                                    url: url.clone(),
                                    detail: None,
                                },
                            });
                        }
                        // Reasoning is provider output; never replayed upstream.
                        ContentPart::Thinking { .. } | ContentPart::ToolResult { .. } => {}
                    }
                }
                let content = match parts.len() {
                    0 => None,
                    1 if matches!(parts[0], wire::ContentPart::Text { .. }) => {
                        match parts.remove(0) {
                            wire::ContentPart::Text { text } => {
                                Some(wire::MessageContent::Text(text))
                            }
                            _ => unreachable!(),
                        }
                    }
                    _ => Some(wire::MessageContent::Parts(parts)),
                };
                let tool_calls = if message.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        message
                            .tool_calls
                            .iter()
                            .map(|tc| wire::ToolCall {
                                id: tc.id.clone(),
                                r#type: "function".to_string(),
                                function: wire::FunctionCall {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                };
                messages.push(wire::ChatMessage {
                    role: role_name.to_string(),
                    content,
                    tool_calls,
                    tool_call_id: None,
                    name: None,
                });
            }
        }
    }

    wire::ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        tools: if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|tool| wire::Tool {
                        r#type: "function".to_string(),
                        function: wire::FunctionDefinition {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: Some(tool.parameters.clone()),
                        },
                    })
                    .collect(),
            )
        },
        tool_choice: request.tool_choice.clone(),
        max_tokens: request.max_tokens,
        max_completion_tokens: None,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: if request.stop.is_empty() {
            None
        } else {
            Some(wire::StopSequences::Many(request.stop.clone()))
        },
        stream: if request.stream { Some(true) } else { None },
        stream_options: if request.stream {
            Some(wire::StreamOptions {
                include_usage: Some(true),
            })
        } else {
            None
        },
        user: None,
    }
}

pub(crate) fn decode_response(wire: wire::ChatCompletionResponse) -> ChatResponse {
    let choices = wire
        .choices
        .into_iter()
        .map(|choice| {
            let mut parts = Vec::new();
            if let Some(reasoning) = choice.message.reasoning_content
                && !reasoning.is_empty()
            {
                parts.push(ContentPart::Thinking {
                    thinking: reasoning,
                    signature: None,
                });
            }
            if let Some(content) = choice.message.content
                && !content.is_empty()
            {
                parts.push(ContentPart::Text { text: content });
            }
            let tool_calls = choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| axonhub_protocol::unified::ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                })
                .collect();
            Choice {
                index: choice.index,
                message: Message {
                    role: Role::Assistant,
                    parts,
                    tool_calls,
                },
                finish_reason: choice.finish_reason.as_deref().map(decode_finish_reason),
            }
        })
        .collect();
    ChatResponse {
        id: wire.id,
        model: wire.model,
        choices,
        usage: wire.usage.map(decode_usage),
        created: wire.created,
    }
}

pub(crate) fn decode_usage(usage: wire::CompletionUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        cache_read_tokens: usage
            .prompt_tokens_details
            .and_then(|details| details.cached_tokens),
    }
}

struct ChunkDecoder;

impl OutboundStreamDecoder for ChunkDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatChunk>, TransformError> {
        if event.is_done_marker() {
            return Ok(vec![ChatChunk::done_marker()]);
        }
        if event.data.is_empty() {
            return Ok(Vec::new());
        }
        let wire: wire::ChatCompletionChunk =
            serde_json::from_str(&event.data).map_err(TransformError::invalid_response)?;
        let deltas = wire
            .choices
            .into_iter()
            .map(|choice| {
                let tool_call = choice.delta.tool_calls.and_then(|mut calls| {
                    if calls.is_empty() {
                        None
                    } else {
                        let call = calls.remove(0);
                        Some(ToolCallDelta {
                            index: call.index,
                            id: call.id,
                            name: call.function.as_ref().and_then(|f| f.name.clone()),
                            arguments_delta: call
                                .function
                                .and_then(|f| f.arguments)
                                .unwrap_or_default(),
                        })
                    }
                });
                ChunkDelta {
                    index: choice.index,
                    text: choice.delta.content,
                    thinking: choice.delta.reasoning_content,
                    tool_call,
                    finish_reason: choice.finish_reason.as_deref().map(decode_finish_reason),
                }
            })
            .collect();
        Ok(vec![ChatChunk {
            id: Some(wire.id),
            model: Some(wire.model),
            deltas,
            usage: wire.usage.map(decode_usage),
            done: false,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ChannelEndpoint {
        ChannelEndpoint {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: "sk-test".to_string(),
            ..ChannelEndpoint::default()
        }
    }

    #[test]
    fn builds_bearer_request() {
        let mut request = ChatRequest::new("gpt-4o");
        request.messages.push(axonhub_protocol::unified::Message::text(
            Role::User,
            "hi",
        ));
        let spec = OpenAiChatOutbound::new(endpoint())
            .transform_request(&request)
            .unwrap();
        assert_eq!(spec.url, "https://api.openai.com/v1/chat/completions");
        assert!(spec
            .headers
            .iter()
            .any(|(k, v)| k == "authorization" && v == "Bearer sk-test"));
        assert!(!spec.stream);
    }

    #[test]
    fn stream_decoder_recognizes_done() {
        let mut decoder = OpenAiChatOutbound::new(endpoint()).start_stream();
        let chunks = decoder.decode(&SseEvent::data("[DONE]")).unwrap();
        assert!(chunks[0].done);
    }

    #[test]
    fn round_trip_preserves_structure() {
        let mut request = ChatRequest::new("gpt-4o");
        request.system = Some("be brief".to_string());
        request.messages.push(Message::text(Role::User, "hi"));
        let wire = encode_request(&request);
        let decoded = crate::inbound::openai_chat::decode_request(wire).unwrap();
        assert_eq!(decoded.normalized(), request.normalized());
    }
}
