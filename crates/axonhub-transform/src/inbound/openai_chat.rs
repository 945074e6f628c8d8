use bytes::Bytes;

use axonhub_common::GatewayError;
use axonhub_protocol::ApiFormat;
use axonhub_protocol::openai::chat_completions as wire;
use axonhub_protocol::openai::{ErrorBody, ErrorResponse};
use axonhub_protocol::sse::SseEvent;
use axonhub_protocol::unified::{
    ChatChunk, ChatRequest, ChatResponse, ContentPart, FinishReason, Message, Role, ToolCall,
    ToolDefinition,
};

use crate::types::{
    InboundContext, InboundStreamEncoder, InboundTransformer, TransformError,
};

pub struct OpenAiChatInbound;

impl InboundTransformer for OpenAiChatInbound {
    fn format(&self) -> ApiFormat {
        ApiFormat::OpenAiChatCompletions
    }

    fn transform_request(
        &self,
        _ctx: &InboundContext,
        body: &[u8],
    ) -> Result<ChatRequest, TransformError> {
        let wire: wire::ChatCompletionRequest =
            serde_json::from_slice(body).map_err(TransformError::invalid_request)?;
        decode_request(wire)
    }

    fn transform_response(&self, response: &ChatResponse) -> Result<Bytes, TransformError> {
        let wire = encode_response(response);
        let body = serde_json::to_vec(&wire).map_err(TransformError::invalid_response)?;
        Ok(Bytes::from(body))
    }

    fn start_stream(&self, request: &ChatRequest) -> Box<dyn InboundStreamEncoder> {
        Box::new(ChunkEncoder {
            model: request.model.clone(),
            sent_role: false,
        })
    }

    fn transform_error(&self, error: &GatewayError) -> (u16, Bytes) {
        let status = error.http_status();
        // Pass provider error bodies through untouched when they already
        // carry the OpenAI envelope.
        if let GatewayError::UpstreamStatus { body, .. } = error
            && serde_json::from_slice::<ErrorResponse>(body).is_ok()
        {
            return (status, body.clone());
        }
        let envelope = ErrorResponse {
            error: ErrorBody {
                message: error.to_string(),
                r#type: error_type(status).to_string(),
                param: None,
                code: None,
            },
        };
        let body = serde_json::to_vec(&envelope).unwrap_or_default();
        (status, Bytes::from(body))
    }
}

fn error_type(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 | 403 => "authentication_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        _ => "api_error",
    }
}

pub(crate) fn decode_request(
    wire: wire::ChatCompletionRequest,
) -> Result<ChatRequest, TransformError> {
    if wire.model.is_empty() {
        return Err(TransformError::MissingField("model"));
    }
    let mut request = ChatRequest::new(wire.model);
    request.stream = wire.stream.unwrap_or(false);
    request.max_tokens = wire.max_completion_tokens.or(wire.max_tokens);
    request.temperature = wire.temperature;
    request.top_p = wire.top_p;
    request.tool_choice = wire.tool_choice;
    if let Some(stop) = wire.stop {
        request.stop = stop.into_vec();
    }
    if let Some(tools) = wire.tools {
        request.tools = tools
            .into_iter()
            .map(|tool| ToolDefinition {
                name: tool.function.name,
                description: tool.function.description,
                parameters: tool
                    .function
                    .parameters
                    .unwrap_or_else(|| serde_json::json!({})),
            })
            .collect();
    }

    let mut system = Vec::new();
    for message in wire.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = message.content {
                    system.push(content_text(content));
                }
            }
            "tool" => {
                let tool_call_id =
                    message.tool_call_id.ok_or(TransformError::MissingField("tool_call_id"))?;
                let content = message.content.map(content_text).unwrap_or_default();
                request.messages.push(Message {
                    role: Role::Tool,
                    parts: vec![ContentPart::ToolResult {
                        tool_call_id,
                        content,
                        is_error: false,
                    }],
                    tool_calls: Vec::new(),
                });
            }
            role => {
                let role = match role {
                    "assistant" => Role::Assistant,
                    _ => Role::User,
                };
                let mut parts = Vec::new();
                if let Some(content) = message.content {
                    parts = content_parts(content);
                }
                let tool_calls = message
                    .tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .map(|tc| ToolCall {
                        id: tc.id,
                        name: tc.function.name,
                        arguments: tc.function.arguments,
                    })
                    .collect();
                request.messages.push(Message {
                    role,
                    parts,
                    tool_calls,
                });
            }
        }
    }
    if !system.is_empty() {
        request.system = Some(system.join("\n"));
    }
    Ok(request)
}

fn content_text(content: wire::MessageContent) -> String {
    match content {
        wire::MessageContent::Text(text) => text,
        wire::MessageContent::Parts(parts) => parts
            .into_iter()
            .filter_map(|part| match part {
                wire::ContentPart::Text { text } => Some(text),
                wire::ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(""),
    }
}

fn content_parts(content: wire::MessageContent) -> Vec<ContentPart> {
    match content {
        wire::MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![ContentPart::Text { text }]
            }
        }
        wire::MessageContent::Parts(parts) => parts
            .into_iter()
            .map(|part| match part {
                wire::ContentPart::Text { text } => ContentPart::Text { text },
                wire::ContentPart::ImageUrl { image_url } => ContentPart::ImageUrl {
                    url: image_url.url,
                },
            })
            .collect(),
    }
}

pub(crate) fn encode_response(response: &ChatResponse) -> wire::ChatCompletionResponse {
    wire::ChatCompletionResponse {
        id: response.id.clone(),
        object: "chat.completion".to_string(),
        created: response.created,
        model: response.model.clone(),
        choices: response
            .choices
            .iter()
            .map(|choice| wire::ChatChoice {
                index: choice.index,
                message: encode_message(&choice.message),
                finish_reason: choice.finish_reason.map(encode_finish_reason),
            })
            .collect(),
        usage: response.usage.map(encode_usage),
    }
}

fn encode_message(message: &Message) -> wire::ResponseMessage {
    let mut content = String::new();
    let mut reasoning = String::new();
    for part in &message.parts {
        match part {
            ContentPart::Text { text } => content.push_str(text),
            ContentPart::Thinking { thinking, .. } => reasoning.push_str(thinking),
            ContentPart::ImageUrl { .. } | ContentPart::ToolResult { .. } => {}
        }
    }
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
    wire::ResponseMessage {
        role: "assistant".to_string(),
        content: if content.is_empty() && tool_calls.is_some() {
            None
        } else {
            Some(content)
        },
        reasoning_content: if reasoning.is_empty() {
            None
        } else {
            Some(reasoning)
        },
        tool_calls,
    }
}

fn encode_usage(usage: axonhub_protocol::unified::Usage) -> wire::CompletionUsage {
    wire::CompletionUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        prompt_tokens_details: usage.cache_read_tokens.map(|cached| {
            wire::PromptTokensDetails {
                cached_tokens: Some(cached),
            }
        }),
    }
}

pub(crate) fn encode_finish_reason(reason: FinishReason) -> String {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolUse => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
        FinishReason::Other => "stop",
    }
    .to_string()
}

pub(crate) fn decode_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolUse,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

struct ChunkEncoder {
    model: String,
    sent_role: bool,
}

impl InboundStreamEncoder for ChunkEncoder {
    fn encode(&mut self, chunk: &ChatChunk) -> Result<Vec<SseEvent>, TransformError> {
        if chunk.done {
            return Ok(vec![SseEvent::data("[DONE]")]);
        }
        let mut choices = Vec::with_capacity(chunk.deltas.len());
        for delta in &chunk.deltas {
            let tool_calls = delta.tool_call.as_ref().map(|tc| {
                vec![wire::ToolCallChunk {
                    index: tc.index,
                    id: tc.id.clone(),
                    r#type: tc.id.as_ref().map(|_| "function".to_string()),
                    function: Some(wire::FunctionCallChunk {
                        name: tc.name.clone(),
                        arguments: if tc.arguments_delta.is_empty() {
                            None
                        } else {
                            Some(tc.arguments_delta.clone())
                        },
                    }),
                }]
            });
            choices.push(wire::ChunkChoice {
                index: delta.index,
                delta: wire::ChunkDelta {
                    role: if self.sent_role {
                        None
                    } else {
                        Some("assistant".to_string())
                    },
                    content: delta.text.clone(),
                    reasoning_content: delta.thinking.clone(),
                    tool_calls,
                },
                finish_reason: delta.finish_reason.map(encode_finish_reason),
            });
            self.sent_role = true;
        }
        let wire_chunk = wire::ChatCompletionChunk {
            id: chunk.id.clone().unwrap_or_default(),
            object: "chat.completion.chunk".to_string(),
            created: 0,
            model: chunk.model.clone().unwrap_or_else(|| self.model.clone()),
            choices,
            usage: chunk.usage.map(encode_usage),
        };
        let data = serde_json::to_string(&wire_chunk).map_err(TransformError::invalid_response)?;
        Ok(vec![SseEvent::data(data)])
    }

    fn finish(&mut self, response: &ChatResponse) -> Result<Vec<SseEvent>, TransformError> {
        let mut events = Vec::new();
        if let Some(usage) = response.usage {
            let usage_chunk = wire::ChatCompletionChunk {
                id: response.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: response.created,
                model: response.model.clone(),
                choices: Vec::new(),
                usage: Some(encode_usage(usage)),
            };
            let data =
                serde_json::to_string(&usage_chunk).map_err(TransformError::invalid_response)?;
            events.push(SseEvent::data(data));
        }
        events.push(SseEvent::data("[DONE]"));
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_system_and_tool_messages() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "f", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "ok"}
            ]
        });
        let request = OpenAiChatInbound
            .transform_request(
                &InboundContext::default(),
                serde_json::to_vec(&body).unwrap().as_slice(),
            )
            .unwrap();
        assert_eq!(request.system.as_deref(), Some("be brief"));
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[1].tool_calls[0].id, "call_1");
        assert!(matches!(
            request.messages[2].parts[0],
            ContentPart::ToolResult { .. }
        ));
    }

    #[test]
    fn stream_encoder_terminates_with_done() {
        let request = ChatRequest::new("gpt-4o");
        let mut encoder = OpenAiChatInbound.start_stream(&request);
        let events = encoder
            .finish(&ChatResponse {
                id: "resp".to_string(),
                model: "gpt-4o".to_string(),
                choices: Vec::new(),
                usage: None,
                created: 0,
            })
            .unwrap();
        assert!(events.last().unwrap().is_done_marker());
    }
}
