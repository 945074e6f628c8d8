use bytes::Bytes;

use axonhub_common::GatewayError;
use axonhub_protocol::ApiFormat;
use axonhub_protocol::anthropic::messages as wire;
use axonhub_protocol::anthropic::{ErrorBody, ErrorResponse};
use axonhub_protocol::sse::SseEvent;
use axonhub_protocol::unified::{
    ChatChunk, ChatRequest, ChatResponse, ContentPart, FinishReason, Message, Role, ToolCall,
    ToolDefinition, Usage,
};

use crate::types::{InboundContext, InboundStreamEncoder, InboundTransformer, TransformError};

pub struct AnthropicInbound;

impl InboundTransformer for AnthropicInbound {
    fn format(&self) -> ApiFormat {
        ApiFormat::AnthropicMessages
    }

    fn transform_request(
        &self,
        _ctx: &InboundContext,
        body: &[u8],
    ) -> Result<ChatRequest, TransformError> {
        let wire: wire::CreateMessageRequest =
            serde_json::from_slice(body).map_err(TransformError::invalid_request)?;
        decode_request(wire)
    }

    fn transform_response(&self, response: &ChatResponse) -> Result<Bytes, TransformError> {
        let wire = encode_response(response);
        let body = serde_json::to_vec(&wire).map_err(TransformError::invalid_response)?;
        Ok(Bytes::from(body))
    }

    fn start_stream(&self, request: &ChatRequest) -> Box<dyn InboundStreamEncoder> {
        Box::new(EventEncoder {
            model: request.model.clone(),
            started: false,
            block: None,
            next_block_index: 0,
        })
    }

    fn transform_error(&self, error: &GatewayError) -> (u16, Bytes) {
        let status = error.http_status();
        if let GatewayError::UpstreamStatus { body, .. } = error
            && serde_json::from_slice::<ErrorResponse>(body).is_ok()
        {
            return (status, body.clone());
        }
        let envelope = ErrorResponse {
            r#type: "error".to_string(),
            error: ErrorBody {
                r#type: error_type(status).to_string(),
                message: error.to_string(),
            },
        };
        let body = serde_json::to_vec(&envelope).unwrap_or_default();
        (status, Bytes::from(body))
    }
}

fn error_type(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        _ => "api_error",
    }
}

pub(crate) fn decode_request(
    wire: wire::CreateMessageRequest,
) -> Result<ChatRequest, TransformError> {
    if wire.model.is_empty() {
        return Err(TransformError::MissingField("model"));
    }
    let mut request = ChatRequest::new(wire.model);
    request.stream = wire.stream.unwrap_or(false);
    request.max_tokens = Some(wire.max_tokens);
    request.temperature = wire.temperature;
    request.top_p = wire.top_p;
    request.tool_choice = wire.tool_choice;
    request.stop = wire.stop_sequences.unwrap_or_default();
    request.system = wire.system.as_ref().map(wire::SystemPrompt::joined);
    if let Some(tools) = wire.tools {
        request.tools = tools
            .into_iter()
            .map(|tool| ToolDefinition {
                name: tool.name,
                description: tool.description,
                parameters: tool.input_schema,
            })
            .collect();
    }

    for message in wire.messages {
        let role = match message.role.as_str() {
            "assistant" => Role::Assistant,
            _ => Role::User,
        };
        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();
        match message.content {
            wire::MessageContent::Text(text) => parts.push(ContentPart::Text { text }),
            wire::MessageContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        wire::ContentBlock::Text { text } => {
                            parts.push(ContentPart::Text { text });
                        }
                        wire::ContentBlock::Image { source } => {
                            if let wire::ImageSource::Url { url } = source {
                                parts.push(ContentPart::ImageUrl { url });
                            }
                        }
                        wire::ContentBlock::Thinking {
                            thinking,
                            signature,
                        } => {
                            parts.push(ContentPart::Thinking {
                                thinking,
                                signature,
                            });
                        }
                        wire::ContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(ToolCall {
                                id,
                                name,
                                arguments: input.to_string(),
                            });
                        }
                        wire::ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            tool_results.push(ContentPart::ToolResult {
                                tool_call_id: tool_use_id,
                                content: content
                                    .as_ref()
                                    .map(wire::ToolResultContent::joined)
                                    .unwrap_or_default(),
                                is_error,
                            });
                        }
                    }
                }
            }
        }
        // Tool results become their own tool-role turn; Anthropic folds them
        // into the user message.
        if !tool_results.is_empty() {
            request.messages.push(Message {
                role: Role::Tool,
                parts: tool_results,
                tool_calls: Vec::new(),
            });
        }
        if !parts.is_empty() || !tool_calls.is_empty() {
            request.messages.push(Message {
                role,
                parts,
                tool_calls,
            });
        }
    }
    Ok(request)
}

pub(crate) fn encode_response(response: &ChatResponse) -> wire::MessageResponse {
    let choice = response.choices.first();
    let mut content = Vec::new();
    let mut stop_reason = None;
    if let Some(choice) = choice {
        for part in &choice.message.parts {
            match part {
                ContentPart::Thinking {
                    thinking,
                    signature,
                } => content.push(wire::ContentBlock::Thinking {
                    thinking: thinking.clone(),
                    signature: signature.clone(),
                }),
                ContentPart::Text { text } => content.push(wire::ContentBlock::Text {
                    text: text.clone(),
                }),
                ContentPart::ImageUrl { .. } | ContentPart::ToolResult { .. } => {}
            }
        }
        for tool_call in &choice.message.tool_calls {
            content.push(wire::ContentBlock::ToolUse {
                id: tool_call.id.clone(),
                name: tool_call.name.clone(),
                input: serde_json::from_str(&tool_call.arguments)
                    .unwrap_or_else(|_| serde_json::json!({})),
            });
        }
        stop_reason = choice.finish_reason.map(encode_stop_reason);
    }
    wire::MessageResponse {
        id: response.id.clone(),
        r#type: "message".to_string(),
        role: "assistant".to_string(),
        model: response.model.clone(),
        content,
        stop_reason,
        stop_sequence: None,
        usage: response.usage.map(encode_usage).unwrap_or_default(),
    }
}

fn encode_usage(usage: Usage) -> wire::Usage {
    wire::Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: usage.cache_read_tokens,
    }
}

pub(crate) fn encode_stop_reason(reason: FinishReason) -> String {
    match reason {
        FinishReason::Stop => "end_turn",
        FinishReason::Length => "max_tokens",
        FinishReason::ToolUse => "tool_use",
        FinishReason::ContentFilter => "refusal",
        FinishReason::Other => "end_turn",
    }
    .to_string()
}

pub(crate) fn decode_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolUse,
        "stop_sequence" => FinishReason::Stop,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    Tool,
}

struct EventEncoder {
    model: String,
    started: bool,
    /// Currently open content block: (index on the wire, kind).
    block: Option<(u32, BlockKind)>,
    next_block_index: u32,
}

impl EventEncoder {
    fn typed(event: wire::StreamEvent) -> Result<SseEvent, TransformError> {
        let data = serde_json::to_string(&event).map_err(TransformError::invalid_response)?;
        Ok(SseEvent {
            id: None,
            event: Some(event.event_name().to_string()),
            data,
        })
    }

    fn ensure_started(&mut self, events: &mut Vec<SseEvent>) -> Result<(), TransformError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        events.push(Self::typed(wire::StreamEvent::MessageStart {
            message: wire::MessageResponse {
                id: String::new(),
                r#type: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: wire::Usage::default(),
            },
        })?);
        Ok(())
    }

    fn open_block(
        &mut self,
        kind: BlockKind,
        start: wire::ContentBlock,
        events: &mut Vec<SseEvent>,
    ) -> Result<u32, TransformError> {
        if let Some((index, open_kind)) = self.block {
            if open_kind == kind && kind != BlockKind::Tool {
                return Ok(index);
            }
            self.close_block(events)?;
        }
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.block = Some((index, kind));
        events.push(Self::typed(wire::StreamEvent::ContentBlockStart {
            index,
            content_block: start,
        })?);
        Ok(index)
    }

    fn close_block(&mut self, events: &mut Vec<SseEvent>) -> Result<(), TransformError> {
        if let Some((index, _)) = self.block.take() {
            events.push(Self::typed(wire::StreamEvent::ContentBlockStop { index })?);
        }
        Ok(())
    }
}

impl InboundStreamEncoder for EventEncoder {
    fn encode(&mut self, chunk: &ChatChunk) -> Result<Vec<SseEvent>, TransformError> {
        if chunk.done {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        self.ensure_started(&mut events)?;
        for delta in &chunk.deltas {
            if let Some(thinking) = delta.thinking.as_deref().filter(|t| !t.is_empty()) {
                let index = self.open_block(
                    BlockKind::Thinking,
                    wire::ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                    &mut events,
                )?;
                events.push(Self::typed(wire::StreamEvent::ContentBlockDelta {
                    index,
                    delta: wire::ContentDelta::ThinkingDelta {
                        thinking: thinking.to_string(),
                    },
                })?);
            }
            if let Some(text) = delta.text.as_deref().filter(|t| !t.is_empty()) {
                let index = self.open_block(
                    BlockKind::Text,
                    wire::ContentBlock::Text {
                        text: String::new(),
                    },
                    &mut events,
                )?;
                events.push(Self::typed(wire::StreamEvent::ContentBlockDelta {
                    index,
                    delta: wire::ContentDelta::TextDelta {
                        text: text.to_string(),
                    },
                })?);
            }
            if let Some(tool) = &delta.tool_call {
                if tool.id.is_some() || tool.name.is_some() {
                    self.close_block(&mut events)?;
                    self.open_block(
                        BlockKind::Tool,
                        wire::ContentBlock::ToolUse {
                            id: tool.id.clone().unwrap_or_default(),
                            name: tool.name.clone().unwrap_or_default(),
                            input: serde_json::json!({}),
                        },
                        &mut events,
                    )?;
                }
                if !tool.arguments_delta.is_empty()
                    && let Some((index, BlockKind::Tool)) = self.block
                {
                    events.push(Self::typed(wire::StreamEvent::ContentBlockDelta {
                        index,
                        delta: wire::ContentDelta::InputJsonDelta {
                            partial_json: tool.arguments_delta.clone(),
                        },
                    })?);
                }
            }
        }
        Ok(events)
    }

    fn finish(&mut self, response: &ChatResponse) -> Result<Vec<SseEvent>, TransformError> {
        let mut events = Vec::new();
        self.ensure_started(&mut events)?;
        self.close_block(&mut events)?;
        let stop_reason = response
            .choices
            .first()
            .and_then(|choice| choice.finish_reason)
            .map(encode_stop_reason);
        events.push(Self::typed(wire::StreamEvent::MessageDelta {
            delta: wire::MessageDelta {
                stop_reason,
                stop_sequence: None,
            },
            usage: response.usage.map(encode_usage),
        })?);
        events.push(Self::typed(wire::StreamEvent::MessageStop)?);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axonhub_protocol::unified::ChunkDelta;

    #[test]
    fn decodes_tool_result_into_tool_turn() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "42"}
                ]}
            ]
        });
        let request = AnthropicInbound
            .transform_request(
                &InboundContext::default(),
                serde_json::to_vec(&body).unwrap().as_slice(),
            )
            .unwrap();
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, Role::Tool);
    }

    #[test]
    fn stream_events_bracket_content_blocks() {
        let request = ChatRequest::new("claude-sonnet-4-5");
        let mut encoder = AnthropicInbound.start_stream(&request);
        let events = encoder
            .encode(&ChatChunk {
                deltas: vec![ChunkDelta {
                    index: 0,
                    text: Some("hi".to_string()),
                    ..ChunkDelta::default()
                }],
                ..ChatChunk::default()
            })
            .unwrap();
        let names: Vec<_> = events
            .iter()
            .filter_map(|event| event.event.as_deref())
            .collect();
        assert_eq!(
            names,
            vec!["message_start", "content_block_start", "content_block_delta"]
        );
        let tail = encoder
            .finish(&ChatResponse {
                id: "msg".to_string(),
                model: "claude-sonnet-4-5".to_string(),
                choices: Vec::new(),
                usage: None,
                created: 0,
            })
            .unwrap();
        assert_eq!(tail.last().unwrap().event.as_deref(), Some("message_stop"));
    }
}
