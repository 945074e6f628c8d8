use std::collections::BTreeMap;

use bytes::Bytes;

use axonhub_common::GatewayError;
use axonhub_protocol::ApiFormat;
use axonhub_protocol::openai::responses as wire;
use axonhub_protocol::openai::{ErrorBody, ErrorResponse};
use axonhub_protocol::sse::SseEvent;
use axonhub_protocol::unified::{
    ChatChunk, ChatRequest, ChatResponse, ContentPart, FinishReason, Message, Role, ToolCall,
    ToolDefinition, Usage,
};

use crate::types::{InboundContext, InboundStreamEncoder, InboundTransformer, TransformError};

pub struct OpenAiResponsesInbound;

impl InboundTransformer for OpenAiResponsesInbound {
    fn format(&self) -> ApiFormat {
        ApiFormat::OpenAiResponses
    }

    fn transform_request(
        &self,
        _ctx: &InboundContext,
        body: &[u8],
    ) -> Result<ChatRequest, TransformError> {
        let wire: wire::CreateResponseRequest =
            serde_json::from_slice(body).map_err(TransformError::invalid_request)?;
        decode_request(wire)
    }

    fn transform_response(&self, response: &ChatResponse) -> Result<Bytes, TransformError> {
        let wire = encode_response(response, "completed");
        let body = serde_json::to_vec(&wire).map_err(TransformError::invalid_response)?;
        Ok(Bytes::from(body))
    }

    fn start_stream(&self, request: &ChatRequest) -> Box<dyn InboundStreamEncoder> {
        Box::new(EventEncoder {
            model: request.model.clone(),
            started: false,
            next_output_index: 0,
            message_item: None,
            tool_items: BTreeMap::new(),
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
            error: ErrorBody {
                message: error.to_string(),
                r#type: if status == 401 || status == 403 {
                    "authentication_error".to_string()
                } else {
                    "api_error".to_string()
                },
                param: None,
                code: None,
            },
        };
        let body = serde_json::to_vec(&envelope).unwrap_or_default();
        (status, Bytes::from(body))
    }
}

pub(crate) fn decode_request(
    wire: wire::CreateResponseRequest,
) -> Result<ChatRequest, TransformError> {
    if wire.model.is_empty() {
        return Err(TransformError::MissingField("model"));
    }
    let mut request = ChatRequest::new(wire.model);
    request.stream = wire.stream.unwrap_or(false);
    request.system = wire.instructions;
    request.max_tokens = wire.max_output_tokens;
    request.temperature = wire.temperature;
    request.top_p = wire.top_p;
    request.tool_choice = wire.tool_choice;
    if let Some(tools) = wire.tools {
        request.tools = tools
            .into_iter()
            .filter(|tool| tool.r#type == "function")
            .map(|tool| ToolDefinition {
                name: tool.name,
                description: tool.description,
                parameters: tool.parameters.unwrap_or_else(|| serde_json::json!({})),
            })
            .collect();
    }

    match wire.input {
        wire::ResponseInput::Text(text) => {
            request.messages.push(Message::text(Role::User, text));
        }
        wire::ResponseInput::Items(items) => {
            for item in items {
                match item {
                    wire::InputItem::Message { role, content } => {
                        let role = match role.as_str() {
                            "assistant" => Role::Assistant,
                            "system" | "developer" => {
                                let text = input_content_text(&content);
                                request.system = Some(match request.system.take() {
                                    Some(existing) => format!("{existing}\n{text}"),
                                    None => text,
                                });
                                continue;
                            }
                            _ => Role::User,
                        };
                        request.messages.push(Message {
                            role,
                            parts: input_content_parts(content),
                            tool_calls: Vec::new(),
                        });
                    }
                    wire::InputItem::FunctionCall {
                        call_id,
                        name,
                        arguments,
                    } => {
                        request.messages.push(Message {
                            role: Role::Assistant,
                            parts: Vec::new(),
                            tool_calls: vec![ToolCall {
                                id: call_id,
                                name,
                                arguments,
                            }],
                        });
                    }
                    wire::InputItem::FunctionCallOutput { call_id, output } => {
                        request.messages.push(Message {
                            role: Role::Tool,
                            parts: vec![ContentPart::ToolResult {
                                tool_call_id: call_id,
                                content: output,
                                is_error: false,
                            }],
                            tool_calls: Vec::new(),
                        });
                    }
                }
            }
        }
    }
    Ok(request)
}

fn input_content_text(content: &wire::InputContent) -> String {
    match content {
        wire::InputContent::Text(text) => text.clone(),
        wire::InputContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                wire::InputContentPart::InputText { text }
                | wire::InputContentPart::OutputText { text } => Some(text.as_str()),
                wire::InputContentPart::InputImage { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(""),
    }
}

fn input_content_parts(content: wire::InputContent) -> Vec<ContentPart> {
    match content {
        wire::InputContent::Text(text) => vec![ContentPart::Text { text }],
        wire::InputContent::Parts(parts) => parts
            .into_iter()
            .map(|part| match part {
                wire::InputContentPart::InputText { text }
                | wire::InputContentPart::OutputText { text } => ContentPart::Text { text },
                wire::InputContentPart::InputImage { image_url } => {
                    ContentPart::ImageUrl { url: image_url }
                }
            })
            .collect(),
    }
}

pub(crate) fn encode_response(response: &ChatResponse, status: &str) -> wire::Response {
    let mut output = Vec::new();
    for choice in &response.choices {
        let mut text = String::new();
        let mut reasoning = String::new();
        for part in &choice.message.parts {
            match part {
                ContentPart::Text { text: t } => text.push_str(t),
                ContentPart::Thinking { thinking, .. } => reasoning.push_str(thinking),
                ContentPart::ImageUrl { .. } | ContentPart::ToolResult { .. } => {}
            }
        }
        if !reasoning.is_empty() {
            output.push(wire::OutputItem::Reasoning {
                id: format!("rs_{}", response.id),
                summary: vec![wire::ReasoningSummary::SummaryText { text: reasoning }],
            });
        }
        if !text.is_empty() {
            output.push(wire::OutputItem::Message {
                id: format!("msg_{}", response.id),
                role: "assistant".to_string(),
                status: "completed".to_string(),
                content: vec![wire::OutputContent::OutputText { text }],
            });
        }
        for (ordinal, tool_call) in choice.message.tool_calls.iter().enumerate() {
            output.push(wire::OutputItem::FunctionCall {
                id: format!("fc_{}_{ordinal}", response.id),
                call_id: tool_call.id.clone(),
                name: tool_call.name.clone(),
                arguments: tool_call.arguments.clone(),
                status: "completed".to_string(),
            });
        }
    }
    wire::Response {
        id: response.id.clone(),
        object: "response".to_string(),
        created_at: response.created,
        model: response.model.clone(),
        status: status.to_string(),
        output,
        usage: response.usage.map(encode_usage),
    }
}

fn encode_usage(usage: Usage) -> wire::ResponseUsage {
    wire::ResponseUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        input_tokens_details: usage.cache_read_tokens.map(|cached| {
            wire::InputTokensDetails {
                cached_tokens: Some(cached),
            }
        }),
    }
}

struct ToolItemState {
    output_index: u32,
    item_id: String,
    call_id: String,
    name: String,
    arguments: String,
}

struct EventEncoder {
    model: String,
    started: bool,
    next_output_index: u32,
    message_item: Option<(u32, String)>,
    tool_items: BTreeMap<u32, ToolItemState>,
}

impl EventEncoder {
    fn sse(event: &wire::StreamEvent) -> Result<SseEvent, TransformError> {
        let data = serde_json::to_string(event).map_err(TransformError::invalid_response)?;
        Ok(SseEvent::data(data))
    }

    fn empty_response(&self, status: &str) -> wire::Response {
        wire::Response {
            id: String::new(),
            object: "response".to_string(),
            created_at: 0,
            model: self.model.clone(),
            status: status.to_string(),
            output: Vec::new(),
            usage: None,
        }
    }
}

impl InboundStreamEncoder for EventEncoder {
    fn encode(&mut self, chunk: &ChatChunk) -> Result<Vec<SseEvent>, TransformError> {
        if chunk.done {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(Self::sse(&wire::StreamEvent::Created {
                response: self.empty_response("in_progress"),
            })?);
        }
        for delta in &chunk.deltas {
            if let Some(text) = delta.text.as_deref().filter(|t| !t.is_empty()) {
                let (output_index, item_id) = match &self.message_item {
                    Some(open) => open.clone(),
                    None => {
                        let output_index = self.next_output_index;
                        self.next_output_index += 1;
                        let item_id = format!("msg_{output_index}");
                        events.push(Self::sse(&wire::StreamEvent::OutputItemAdded {
                            output_index,
                            item: wire::OutputItem::Message {
                                id: item_id.clone(),
                                role: "assistant".to_string(),
                                status: "in_progress".to_string(),
                                content: Vec::new(),
                            },
                        })?);
                        self.message_item = Some((output_index, item_id.clone()));
                        (output_index, item_id)
                    }
                };
                events.push(Self::sse(&wire::StreamEvent::OutputTextDelta {
                    item_id,
                    output_index,
                    delta: text.to_string(),
                })?);
            }
            if let Some(tool) = &delta.tool_call {
                if !self.tool_items.contains_key(&tool.index) {
                    let output_index = self.next_output_index;
                    self.next_output_index += 1;
                    let item_id = format!("fc_{output_index}");
                    let state = ToolItemState {
                        output_index,
                        item_id: item_id.clone(),
                        call_id: tool.id.clone().unwrap_or_default(),
                        name: tool.name.clone().unwrap_or_default(),
                        arguments: String::new(),
                    };
                    events.push(Self::sse(&wire::StreamEvent::OutputItemAdded {
                        output_index,
                        item: wire::OutputItem::FunctionCall {
                            id: item_id,
                            call_id: state.call_id.clone(),
                            name: state.name.clone(),
                            arguments: String::new(),
                            status: "in_progress".to_string(),
                        },
                    })?);
                    self.tool_items.insert(tool.index, state);
                }
                let state = self
                    .tool_items
                    .get_mut(&tool.index)
                    .expect("tool item inserted above");
                if let Some(id) = &tool.id {
                    state.call_id = id.clone();
                }
                if let Some(name) = &tool.name {
                    state.name = name.clone();
                }
                if !tool.arguments_delta.is_empty() {
                    state.arguments.push_str(&tool.arguments_delta);
                    events.push(Self::sse(&wire::StreamEvent::FunctionCallArgumentsDelta {
                        item_id: state.item_id.clone(),
                        output_index: state.output_index,
                        delta: tool.arguments_delta.clone(),
                    })?);
                }
            }
        }
        Ok(events)
    }

    fn finish(&mut self, response: &ChatResponse) -> Result<Vec<SseEvent>, TransformError> {
        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(Self::sse(&wire::StreamEvent::Created {
                response: self.empty_response("in_progress"),
            })?);
        }
        if let Some((output_index, item_id)) = self.message_item.take() {
            events.push(Self::sse(&wire::StreamEvent::OutputItemDone {
                output_index,
                item: wire::OutputItem::Message {
                    id: item_id,
                    role: "assistant".to_string(),
                    status: "completed".to_string(),
                    content: vec![wire::OutputContent::OutputText {
                        text: response.first_text(),
                    }],
                },
            })?);
        }
        for state in std::mem::take(&mut self.tool_items).into_values() {
            events.push(Self::sse(&wire::StreamEvent::OutputItemDone {
                output_index: state.output_index,
                item: wire::OutputItem::FunctionCall {
                    id: state.item_id,
                    call_id: state.call_id,
                    name: state.name,
                    arguments: state.arguments,
                    status: "completed".to_string(),
                },
            })?);
        }
        events.push(Self::sse(&wire::StreamEvent::Completed {
            response: encode_response(response, "completed"),
        })?);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_text_input_as_user_turn() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "input": "hello",
            "instructions": "be brief"
        });
        let request = OpenAiResponsesInbound
            .transform_request(
                &InboundContext::default(),
                serde_json::to_vec(&body).unwrap().as_slice(),
            )
            .unwrap();
        assert_eq!(request.system.as_deref(), Some("be brief"));
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, Role::User);
    }

    #[test]
    fn function_call_items_round_the_tool_loop() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "input": [
                {"type": "function_call", "call_id": "c1", "name": "f", "arguments": "{}"},
                {"type": "function_call_output", "call_id": "c1", "output": "ok"}
            ]
        });
        let request = OpenAiResponsesInbound
            .transform_request(
                &InboundContext::default(),
                serde_json::to_vec(&body).unwrap().as_slice(),
            )
            .unwrap();
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].tool_calls[0].id, "c1");
        assert_eq!(request.messages[1].role, Role::Tool);
    }

    #[test]
    fn stream_opens_and_completes_items() {
        let request = ChatRequest::new("gpt-4o");
        let mut encoder = OpenAiResponsesInbound.start_stream(&request);
        let events = encoder
            .encode(&ChatChunk {
                deltas: vec![axonhub_protocol::unified::ChunkDelta {
                    index: 0,
                    text: Some("hi".to_string()),
                    ..Default::default()
                }],
                ..ChatChunk::default()
            })
            .unwrap();
        assert_eq!(events.len(), 3);
        let tail = encoder
            .finish(&ChatResponse {
                id: "resp_1".to_string(),
                model: "gpt-4o".to_string(),
                choices: vec![],
                usage: None,
                created: 0,
            })
            .unwrap();
        assert!(tail
            .last()
            .unwrap()
            .data
            .contains("\"response.completed\""));
    }
}
