use std::collections::HashMap;

use bytes::Bytes;

use axonhub_protocol::ApiFormat;
use axonhub_protocol::openai::responses as wire;
use axonhub_protocol::sse::SseEvent;
use axonhub_protocol::unified::{
    ChatChunk, ChatRequest, ChatResponse, Choice, ChunkDelta, ContentPart, FinishReason, Message,
    Role, ToolCall, ToolCallDelta, Usage,
};

use crate::outbound::join_url;
use crate::types::{
    ChannelEndpoint, HttpMethod, HttpRequestSpec, OutboundStreamDecoder, OutboundTransformer,
    TransformError,
};

pub struct OpenAiResponsesOutbound {
    endpoint: ChannelEndpoint,
}

impl OpenAiResponsesOutbound {
    pub fn new(endpoint: ChannelEndpoint) -> Self {
        Self { endpoint }
    }
}

impl OutboundTransformer for OpenAiResponsesOutbound {
    fn format(&self) -> ApiFormat {
        ApiFormat::OpenAiResponses
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
            url: join_url(&self.endpoint.base_url, "/responses"),
            headers,
            body: Bytes::from(body),
            stream: request.stream,
        })
    }

    fn transform_response(&self, body: &[u8]) -> Result<ChatResponse, TransformError> {
        let wire: wire::Response =
            serde_json::from_slice(body).map_err(TransformError::invalid_response)?;
        Ok(decode_response(wire))
    }

    fn start_stream(&self) -> Box<dyn OutboundStreamDecoder> {
        Box::new(EventDecoder {
            tool_ordinals: HashMap::new(),
            next_tool_ordinal: 0,
        })
    }
}

pub(crate) fn encode_request(request: &ChatRequest) -> wire::CreateResponseRequest {
    let mut items = Vec::new();
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
                        items.push(wire::InputItem::FunctionCallOutput {
                            call_id: tool_call_id.clone(),
                            output: content.clone(),
                        });
                    }
                }
            }
            role => {
                let mut parts = Vec::new();
                for part in &message.parts {
                    match part {
                        ContentPart::Text { text } => {
                            parts.push(if role == Role::Assistant {
                                wire::InputContentPart::OutputText { text: text.clone() }
                            } else {
                                wire::InputContentPart::InputText { text: text.clone() }
                            });
                        }
                        ContentPart::ImageUrl { url } => {
                            parts.push(wire::InputContentPart::InputImage {
                                image_url: url.clone(),
                            });
                        }
                        ContentPart::Thinking { .. } | ContentPart::ToolResult { .. } => {}
                    }
                }
                if !parts.is_empty() {
                    items.push(wire::InputItem::Message {
                        role: match role {
                            Role::Assistant => "assistant".to_string(),
                            Role::System => "system".to_string(),
                            _ => "user".to_string(),
                        },
                        content: wire::InputContent::Parts(parts),
                    });
                }
                for tool_call in &message.tool_calls {
                    items.push(wire::InputItem::FunctionCall {
                        call_id: tool_call.id.clone(),
                        name: tool_call.name.clone(),
                        arguments: tool_call.arguments.clone(),
                    });
                }
            }
        }
    }

    wire::CreateResponseRequest {
        model: request.model.clone(),
        input: wire::ResponseInput::Items(items),
        instructions: request.system.clone(),
        tools: if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|tool| wire::ResponseTool {
                        r#type: "function".to_string(),
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: Some(tool.parameters.clone()),
                    })
                    .collect(),
            )
        },
        tool_choice: request.tool_choice.clone(),
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stream: if request.stream { Some(true) } else { None },
    }
}

pub(crate) fn decode_response(wire: wire::Response) -> ChatResponse {
    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();
    for item in wire.output {
        match item {
            wire::OutputItem::Message { content, .. } => {
                for piece in content {
                    let wire::OutputContent::OutputText { text } = piece;
                    parts.push(ContentPart::Text { text });
                }
            }
            wire::OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => {
                tool_calls.push(ToolCall {
                    id: call_id,
                    name,
                    arguments,
                });
            }
            wire::OutputItem::Reasoning { summary, .. } => {
                for piece in summary {
                    let wire::ReasoningSummary::SummaryText { text } = piece;
                    parts.push(ContentPart::Thinking {
                        thinking: text,
                        signature: None,
                    });
                }
            }
        }
    }
    let finish_reason = if tool_calls.is_empty() {
        match wire.status.as_str() {
            "incomplete" => Some(FinishReason::Length),
            "completed" => Some(FinishReason::Stop),
            _ => None,
        }
    } else {
        Some(FinishReason::ToolUse)
    };
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
            finish_reason,
        }],
        usage: wire.usage.map(decode_usage),
        created: wire.created_at,
    }
}

pub(crate) fn decode_usage(usage: wire::ResponseUsage) -> Usage {
    Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        cache_read_tokens: usage
            .input_tokens_details
            .and_then(|details| details.cached_tokens),
    }
}

struct EventDecoder {
    /// Stream item id → unified tool-call index.
    tool_ordinals: HashMap<String, u32>,
    next_tool_ordinal: u32,
}

impl OutboundStreamDecoder for EventDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatChunk>, TransformError> {
        if event.is_done_marker() {
            return Ok(vec![ChatChunk::done_marker()]);
        }
        if event.data.is_empty() {
            return Ok(Vec::new());
        }
        let Ok(parsed) = serde_json::from_str::<wire::StreamEvent>(&event.data) else {
            // Unknown event types flow through the Responses stream; skip them.
            return Ok(Vec::new());
        };
        let chunk = match parsed {
            wire::StreamEvent::Created { response } => ChatChunk {
                id: Some(response.id),
                model: Some(response.model),
                ..ChatChunk::default()
            },
            wire::StreamEvent::OutputItemAdded { item, .. } => match item {
                wire::OutputItem::FunctionCall {
                    id,
                    call_id,
                    name,
                    ..
                } => {
                    let ordinal = self.next_tool_ordinal;
                    self.next_tool_ordinal += 1;
                    self.tool_ordinals.insert(id, ordinal);
                    ChatChunk {
                        deltas: vec![ChunkDelta {
                            index: 0,
                            tool_call: Some(ToolCallDelta {
                                index: ordinal,
                                id: Some(call_id),
                                name: Some(name),
                                arguments_delta: String::new(),
                            }),
                            ..ChunkDelta::default()
                        }],
                        ..ChatChunk::default()
                    }
                }
                _ => return Ok(Vec::new()),
            },
            wire::StreamEvent::OutputTextDelta { delta, .. } => ChatChunk {
                deltas: vec![ChunkDelta {
                    index: 0,
                    text: Some(delta),
                    ..ChunkDelta::default()
                }],
                ..ChatChunk::default()
            },
            wire::StreamEvent::FunctionCallArgumentsDelta { item_id, delta, .. } => {
                let Some(ordinal) = self.tool_ordinals.get(&item_id) else {
                    return Ok(Vec::new());
                };
                ChatChunk {
                    deltas: vec![ChunkDelta {
                        index: 0,
                        tool_call: Some(ToolCallDelta {
                            index: *ordinal,
                            arguments_delta: delta,
                            ..ToolCallDelta::default()
                        }),
                        ..ChunkDelta::default()
                    }],
                    ..ChatChunk::default()
                }
            }
            wire::StreamEvent::OutputItemDone { .. } => return Ok(Vec::new()),
            wire::StreamEvent::Completed { response }
            | wire::StreamEvent::Failed { response } => {
                let decoded = decode_response(response);
                ChatChunk {
                    id: Some(decoded.id.clone()),
                    model: Some(decoded.model.clone()),
                    deltas: decoded
                        .choices
                        .first()
                        .and_then(|choice| choice.finish_reason)
                        .map(|reason| {
                            vec![ChunkDelta {
                                index: 0,
                                finish_reason: Some(reason),
                                ..ChunkDelta::default()
                            }]
                        })
                        .unwrap_or_default(),
                    usage: decoded.usage,
                    ..ChatChunk::default()
                }
            }
        };
        Ok(vec![chunk])
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
    fn tool_loop_encodes_as_items() {
        let mut request = ChatRequest::new("gpt-4o");
        request.messages.push(Message {
            role: Role::Assistant,
            parts: Vec::new(),
            tool_calls: vec![ToolCall {
                id: "c1".to_string(),
                name: "f".to_string(),
                arguments: "{}".to_string(),
            }],
        });
        request.messages.push(Message {
            role: Role::Tool,
            parts: vec![ContentPart::ToolResult {
                tool_call_id: "c1".to_string(),
                content: "ok".to_string(),
                is_error: false,
            }],
            tool_calls: Vec::new(),
        });
        let wire = encode_request(&request);
        let decoded = crate::inbound::openai_responses::decode_request(wire).unwrap();
        assert_eq!(decoded.normalized(), request.normalized());
    }

    #[test]
    fn completed_event_carries_usage() {
        let mut decoder = OpenAiResponsesOutbound::new(endpoint()).start_stream();
        let payload = serde_json::json!({
            "type": "response.completed",
            "response": {
                "id": "resp_1",
                "object": "response",
                "created_at": 1,
                "model": "gpt-4o",
                "status": "completed",
                "output": [],
                "usage": {"input_tokens": 3, "output_tokens": 2, "total_tokens": 5}
            }
        });
        let chunks = decoder.decode(&SseEvent::data(payload.to_string())).unwrap();
        assert_eq!(chunks[0].usage.unwrap().total_tokens, 5);
    }
}
