use std::collections::HashMap;

use bytes::Bytes;

use axonhub_protocol::ApiFormat;
use axonhub_protocol::anthropic::messages as wire;
use axonhub_protocol::sse::SseEvent;
use axonhub_protocol::unified::{
    ChatChunk, ChatRequest, ChatResponse, Choice, ChunkDelta, ContentPart, Message, Role,
    ToolCall, ToolCallDelta, Usage,
};

use crate::inbound::anthropic::decode_stop_reason;
use crate::outbound::join_url;
use crate::types::{
    ChannelEndpoint, HttpMethod, HttpRequestSpec, OutboundStreamDecoder, OutboundTransformer,
    Platform, TransformError,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const BEDROCK_VERSION: &str = "bedrock-2023-05-31";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicOutbound {
    endpoint: ChannelEndpoint,
}

impl AnthropicOutbound {
    pub fn new(endpoint: ChannelEndpoint) -> Self {
        Self { endpoint }
    }
}

impl OutboundTransformer for AnthropicOutbound {
    fn format(&self) -> ApiFormat {
        ApiFormat::AnthropicMessages
    }

    fn transform_request(&self, request: &ChatRequest) -> Result<HttpRequestSpec, TransformError> {
        let mut wire = encode_request(request);
        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        let url = match self.endpoint.platform {
            Platform::Default => {
                headers.push(("x-api-key".to_string(), self.endpoint.api_key.clone()));
                headers.push((
                    "anthropic-version".to_string(),
                    ANTHROPIC_VERSION.to_string(),
                ));
                join_url(&self.endpoint.base_url, "/v1/messages")
            }
            Platform::Bedrock => {
                headers.push((
                    "authorization".to_string(),
                    format!("Bearer {}", self.endpoint.api_key),
                ));
                let action = if request.stream {
                    "invoke-with-response-stream"
                } else {
                    "invoke"
                };
                let url = join_url(
                    &self.endpoint.base_url,
                    &format!("/model/{}/{action}", wire.model),
                );
                // Bedrock moves the model into the URL and versions the body.
                wire.model = String::new();
                wire.stream = None;
                url
            }
        };
        let mut body =
            serde_json::to_value(&wire).map_err(TransformError::invalid_request)?;
        if self.endpoint.platform == Platform::Bedrock
            && let Some(object) = body.as_object_mut()
        {
            object.remove("model");
            object.insert(
                "anthropic_version".to_string(),
                serde_json::Value::String(BEDROCK_VERSION.to_string()),
            );
        }
        headers.extend(self.endpoint.extra_headers.iter().cloned());
        let body = serde_json::to_vec(&body).map_err(TransformError::invalid_request)?;
        Ok(HttpRequestSpec {
            method: HttpMethod::Post,
            url,
            headers,
            body: Bytes::from(body),
            stream: request.stream,
        })
    }

    fn transform_response(&self, body: &[u8]) -> Result<ChatResponse, TransformError> {
        let wire: wire::MessageResponse =
            serde_json::from_slice(body).map_err(TransformError::invalid_response)?;
        Ok(decode_response(wire))
    }

    fn start_stream(&self) -> Box<dyn OutboundStreamDecoder> {
        Box::new(EventDecoder {
            id: None,
            model: None,
            blocks: HashMap::new(),
            next_tool_ordinal: 0,
        })
    }
}

pub(crate) fn encode_request(request: &ChatRequest) -> wire::CreateMessageRequest {
    let mut messages: Vec<wire::InputMessage> = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::Tool => {
                let blocks: Vec<wire::ContentBlock> = message
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::ToolResult {
                            tool_call_id,
                            content,
                            is_error,
                        } => Some(wire::ContentBlock::ToolResult {
                            tool_use_id: tool_call_id.clone(),
                            content: Some(wire::ToolResultContent::Text(content.clone())),
                            is_error: *is_error,
                        }),
                        _ => None,
                    })
                    .collect();
                if !blocks.is_empty() {
                    messages.push(wire::InputMessage {
                        role: "user".to_string(),
                        content: wire::MessageContent::Blocks(blocks),
                    });
                }
            }
            role => {
                let mut blocks = Vec::new();
                for part in &message.parts {
                    match part {
                        ContentPart::Text { text } => {
                            blocks.push(wire::ContentBlock::Text { text: text.clone() });
                        }
                        ContentPart::ImageUrl { url } => {
                            blocks.push(wire::ContentBlock::Image {
                                source: wire::ImageSource::Url { url: url.clone() },
                            });
                        }
                        ContentPart::Thinking {
                            thinking,
                            signature,
                        } => {
                            blocks.push(wire::ContentBlock::Thinking {
                                thinking: thinking.clone(),
                                signature: signature.clone(),
                            });
                        }
                        ContentPart::ToolResult { .. } => {}
                    }
                }
                for tool_call in &message.tool_calls {
                    blocks.push(wire::ContentBlock::ToolUse {
                        id: tool_call.id.clone(),
                        name: tool_call.name.clone(),
                        input: serde_json::from_str(&tool_call.arguments)
                            .unwrap_or_else(|_| serde_json::json!({})),
                    });
                }
                if blocks.is_empty() {
                    continue;
                }
                messages.push(wire::InputMessage {
                    role: match role {
                        Role::Assistant => "assistant".to_string(),
                        _ => "user".to_string(),
                    },
                    content: wire::MessageContent::Blocks(blocks),
                });
            }
        }
    }

    wire::CreateMessageRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: request.system.clone().map(wire::SystemPrompt::Text),
        tools: if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|tool| wire::Tool {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        input_schema: tool.parameters.clone(),
                    })
                    .collect(),
            )
        },
        tool_choice: request.tool_choice.clone(),
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: if request.stop.is_empty() {
            None
        } else {
            Some(request.stop.clone())
        },
        stream: if request.stream { Some(true) } else { None },
        metadata: None,
    }
}

pub(crate) fn decode_response(wire: wire::MessageResponse) -> ChatResponse {
    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in wire.content {
        match block {
            wire::ContentBlock::Text { text } => parts.push(ContentPart::Text { text }),
            wire::ContentBlock::Thinking {
                thinking,
                signature,
            } => parts.push(ContentPart::Thinking {
                thinking,
                signature,
            }),
            wire::ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: input.to_string(),
            }),
            wire::ContentBlock::Image { .. } | wire::ContentBlock::ToolResult { .. } => {}
        }
    }
    ChatResponse {
        id: wire.id,
        model: wire.model,
        choices: vec![Choice {
            index: 0,
            message: Message {
                role: Role::Assistant,
                parts,
                tool_calls,
            },
            finish_reason: wire.stop_reason.as_deref().map(decode_stop_reason),
        }],
        usage: Some(decode_usage(wire.usage)),
        created: 0,
    }
}

pub(crate) fn decode_usage(usage: wire::Usage) -> Usage {
    Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
        cache_read_tokens: usage.cache_read_input_tokens,
    }
}

#[derive(Debug, Clone, Copy)]
enum BlockState {
    Text,
    Thinking,
    Tool { ordinal: u32 },
}

struct EventDecoder {
    id: Option<String>,
    model: Option<String>,
    /// Upstream content block index → decoded block state.
    blocks: HashMap<u32, BlockState>,
    next_tool_ordinal: u32,
}

impl OutboundStreamDecoder for EventDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatChunk>, TransformError> {
        if event.data.is_empty() || event.is_done_marker() {
            return Ok(Vec::new());
        }
        let parsed: wire::StreamEvent =
            serde_json::from_str(&event.data).map_err(TransformError::invalid_response)?;
        let chunk = match parsed {
            wire::StreamEvent::MessageStart { message } => {
                self.id = Some(message.id.clone());
                self.model = Some(message.model.clone());
                ChatChunk {
                    id: self.id.clone(),
                    model: self.model.clone(),
                    usage: Some(decode_usage(message.usage)),
                    ..ChatChunk::default()
                }
            }
            wire::StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                wire::ContentBlock::ToolUse { id, name, .. } => {
                    let ordinal = self.next_tool_ordinal;
                    self.next_tool_ordinal += 1;
                    self.blocks.insert(index, BlockState::Tool { ordinal });
                    ChatChunk {
                        id: self.id.clone(),
                        model: self.model.clone(),
                        deltas: vec![ChunkDelta {
                            index: 0,
                            tool_call: Some(ToolCallDelta {
                                index: ordinal,
                                id: Some(id),
                                name: Some(name),
                                arguments_delta: String::new(),
                            }),
                            ..ChunkDelta::default()
                        }],
                        ..ChatChunk::default()
                    }
                }
                wire::ContentBlock::Thinking { .. } => {
                    self.blocks.insert(index, BlockState::Thinking);
                    return Ok(Vec::new());
                }
                _ => {
                    self.blocks.insert(index, BlockState::Text);
                    return Ok(Vec::new());
                }
            },
            wire::StreamEvent::ContentBlockDelta { index, delta } => {
                let delta = match delta {
                    wire::ContentDelta::TextDelta { text } => ChunkDelta {
                        index: 0,
                        text: Some(text),
                        ..ChunkDelta::default()
                    },
                    wire::ContentDelta::ThinkingDelta { thinking } => ChunkDelta {
                        index: 0,
                        thinking: Some(thinking),
                        ..ChunkDelta::default()
                    },
                    wire::ContentDelta::SignatureDelta { .. } => return Ok(Vec::new()),
                    wire::ContentDelta::InputJsonDelta { partial_json } => {
                        let Some(BlockState::Tool { ordinal }) = self.blocks.get(&index) else {
                            return Ok(Vec::new());
                        };
                        ChunkDelta {
                            index: 0,
                            tool_call: Some(ToolCallDelta {
                                index: *ordinal,
                                arguments_delta: partial_json,
                                ..ToolCallDelta::default()
                            }),
                            ..ChunkDelta::default()
                        }
                    }
                };
                ChatChunk {
                    id: self.id.clone(),
                    model: self.model.clone(),
                    deltas: vec![delta],
                    ..ChatChunk::default()
                }
            }
            wire::StreamEvent::ContentBlockStop { .. } | wire::StreamEvent::Ping => {
                return Ok(Vec::new());
            }
            wire::StreamEvent::MessageDelta { delta, usage } => ChatChunk {
                id: self.id.clone(),
                model: self.model.clone(),
                deltas: delta
                    .stop_reason
                    .as_deref()
                    .map(|reason| {
                        vec![ChunkDelta {
                            index: 0,
                            finish_reason: Some(decode_stop_reason(reason)),
                            ..ChunkDelta::default()
                        }]
                    })
                    .unwrap_or_default(),
                usage: usage.map(decode_usage),
                ..ChatChunk::default()
            },
            wire::StreamEvent::MessageStop => ChatChunk::done_marker(),
        };
        Ok(vec![chunk])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(platform: Platform) -> ChannelEndpoint {
        ChannelEndpoint {
            base_url: "https://api.anthropic.com".to_string(),
            api_key: "sk-ant".to_string(),
            platform,
            ..ChannelEndpoint::default()
        }
    }

    #[test]
    fn direct_platform_uses_x_api_key() {
        let mut request = ChatRequest::new("claude-sonnet-4-5");
        request.messages.push(Message::text(Role::User, "hi"));
        let spec = AnthropicOutbound::new(endpoint(Platform::Default))
            .transform_request(&request)
            .unwrap();
        assert_eq!(spec.url, "https://api.anthropic.com/v1/messages");
        assert!(spec.headers.iter().any(|(k, _)| k == "x-api-key"));
    }

    #[test]
    fn bedrock_platform_moves_model_into_url() {
        let mut request = ChatRequest::new("anthropic.claude-sonnet");
        request.stream = true;
        request.messages.push(Message::text(Role::User, "hi"));
        let spec = AnthropicOutbound::new(endpoint(Platform::Bedrock))
            .transform_request(&request)
            .unwrap();
        assert!(spec
            .url
            .ends_with("/model/anthropic.claude-sonnet/invoke-with-response-stream"));
        let body: serde_json::Value = serde_json::from_slice(&spec.body).unwrap();
        assert!(body.get("model").is_none());
        assert_eq!(
            body.get("anthropic_version").and_then(|v| v.as_str()),
            Some(BEDROCK_VERSION)
        );
    }

    #[test]
    fn stream_decoder_assembles_tool_arguments() {
        let mut decoder = AnthropicOutbound::new(endpoint(Platform::Default)).start_stream();
        let start = serde_json::json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": {"type": "tool_use", "id": "toolu_1", "name": "f", "input": {}}
        });
        let delta = serde_json::json!({
            "type": "content_block_delta",
            "index": 1,
            "delta": {"type": "input_json_delta", "partial_json": "{\"a\":1}"}
        });
        let chunks = decoder
            .decode(&SseEvent::data(start.to_string()))
            .unwrap();
        let tool = chunks[0].deltas[0].tool_call.as_ref().unwrap();
        assert_eq!(tool.name.as_deref(), Some("f"));
        let chunks = decoder
            .decode(&SseEvent::data(delta.to_string()))
            .unwrap();
        assert_eq!(chunks[0].deltas[0].tool_call.as_ref().unwrap().arguments_delta, "{\"a\":1}");
    }

    #[test]
    fn round_trip_preserves_structure() {
        let mut request = ChatRequest::new("claude-sonnet-4-5");
        request.system = Some("be brief".to_string());
        request.max_tokens = Some(1024);
        request.messages.push(Message::text(Role::User, "hi"));
        let wire = encode_request(&request);
        let decoded = crate::inbound::anthropic::decode_request(wire).unwrap();
        assert_eq!(decoded.normalized(), request.normalized());
    }
}
