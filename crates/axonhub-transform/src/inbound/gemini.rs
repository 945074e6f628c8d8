use bytes::Bytes;

use axonhub_common::GatewayError;
use axonhub_protocol::ApiFormat;
use axonhub_protocol::gemini::generate_content as wire;
use axonhub_protocol::gemini::{ErrorBody, ErrorResponse};
use axonhub_protocol::sse::SseEvent;
use axonhub_protocol::unified::{
    ChatChunk, ChatRequest, ChatResponse, ContentPart, FinishReason, META_GEMINI_MODEL_PATH,
    Message, Role, ToolCall, ToolDefinition, Usage,
};

use crate::types::{InboundContext, InboundStreamEncoder, InboundTransformer, TransformError};

pub struct GeminiInbound;

impl InboundTransformer for GeminiInbound {
    fn format(&self) -> ApiFormat {
        ApiFormat::GeminiContents
    }

    fn transform_request(
        &self,
        ctx: &InboundContext,
        body: &[u8],
    ) -> Result<ChatRequest, TransformError> {
        let model = ctx
            .path_model
            .clone()
            .ok_or(TransformError::MissingField("model"))?;
        let wire: wire::GenerateContentRequest =
            serde_json::from_slice(body).map_err(TransformError::invalid_request)?;
        let mut request = decode_request(model.clone(), wire)?;
        request.stream = ctx.stream.unwrap_or(false);
        request
            .metadata
            .insert(META_GEMINI_MODEL_PATH.to_string(), format!("models/{model}"));
        Ok(request)
    }

    fn transform_response(&self, response: &ChatResponse) -> Result<Bytes, TransformError> {
        let wire = encode_response(response);
        let body = serde_json::to_vec(&wire).map_err(TransformError::invalid_response)?;
        Ok(Bytes::from(body))
    }

    fn start_stream(&self, request: &ChatRequest) -> Box<dyn InboundStreamEncoder> {
        Box::new(ChunkEncoder {
            model: request.model.clone(),
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
                code: status as i32,
                message: error.to_string(),
                status: grpc_status(status).to_string(),
            },
        };
        let body = serde_json::to_vec(&envelope).unwrap_or_default();
        (status, Bytes::from(body))
    }
}

fn grpc_status(status: u16) -> &'static str {
    match status {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        499 => "CANCELLED",
        503 => "UNAVAILABLE",
        _ => "INTERNAL",
    }
}

pub(crate) fn decode_request(
    model: String,
    wire: wire::GenerateContentRequest,
) -> Result<ChatRequest, TransformError> {
    let mut request = ChatRequest::new(model);
    if let Some(system) = wire.system_instruction {
        let text = system
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            request.system = Some(text);
        }
    }
    if let Some(config) = wire.generation_config {
        request.max_tokens = config.max_output_tokens;
        request.temperature = config.temperature;
        request.top_p = config.top_p;
        request.stop = config.stop_sequences.unwrap_or_default();
    }
    if let Some(tools) = wire.tools {
        for tool in tools {
            for declaration in tool.function_declarations.unwrap_or_default() {
                request.tools.push(ToolDefinition {
                    name: declaration.name,
                    description: declaration.description,
                    parameters: declaration
                        .parameters
                        .unwrap_or_else(|| serde_json::json!({})),
                });
            }
        }
    }
    request.tool_choice = wire.tool_config;

    let mut synthetic_call_id = 0u32;
    for content in wire.contents {
        let role = match content.role.as_deref() {
            Some("model") => Role::Assistant,
            _ => Role::User,
        };
        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();
        for part in content.parts {
            if let Some(text) = part.text {
                if part.thought.unwrap_or(false) {
                    parts.push(ContentPart::Thinking {
                        thinking: text,
                        signature: None,
                    });
                } else {
                    parts.push(ContentPart::Text { text });
                }
            }
            if let Some(file) = part.file_data {
                parts.push(ContentPart::ImageUrl { url: file.file_uri });
            }
            if let Some(call) = part.function_call {
                let id = call.id.unwrap_or_else(|| {
                    synthetic_call_id += 1;
                    format!("{}-{synthetic_call_id}", call.name)
                });
                tool_calls.push(ToolCall {
                    id,
                    name: call.name,
                    arguments: call.args.to_string(),
                });
            }
            if let Some(result) = part.function_response {
                let id = result.id.unwrap_or_else(|| format!("{}-1", result.name));
                tool_results.push(ContentPart::ToolResult {
                    tool_call_id: id,
                    content: result.response.to_string(),
                    is_error: false,
                });
            }
        }
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

pub(crate) fn encode_response(response: &ChatResponse) -> wire::GenerateContentResponse {
    let candidates = response
        .choices
        .iter()
        .map(|choice| {
            let mut parts = Vec::new();
            for part in &choice.message.parts {
                match part {
                    ContentPart::Text { text } => parts.push(wire::Part::text(text.clone())),
                    ContentPart::Thinking { thinking, .. } => parts.push(wire::Part {
                        text: Some(thinking.clone()),
                        thought: Some(true),
                        ..wire::Part::default()
                    }),
                    ContentPart::ImageUrl { .. } | ContentPart::ToolResult { .. } => {}
                }
            }
            for tool_call in &choice.message.tool_calls {
                parts.push(wire::Part {
                    function_call: Some(wire::FunctionCall {
                        name: tool_call.name.clone(),
                        id: Some(tool_call.id.clone()),
                        args: serde_json::from_str(&tool_call.arguments)
                            .unwrap_or_else(|_| serde_json::json!({})),
                    }),
                    ..wire::Part::default()
                });
            }
            wire::Candidate {
                content: Some(wire::Content {
                    role: Some("model".to_string()),
                    parts,
                }),
                finish_reason: choice.finish_reason.map(encode_finish_reason),
                index: Some(choice.index),
            }
        })
        .collect();
    wire::GenerateContentResponse {
        candidates,
        usage_metadata: response.usage.map(encode_usage),
        model_version: Some(response.model.clone()),
        response_id: Some(response.id.clone()),
    }
}

fn encode_usage(usage: Usage) -> wire::UsageMetadata {
    wire::UsageMetadata {
        prompt_token_count: Some(usage.input_tokens),
        candidates_token_count: Some(usage.output_tokens),
        total_token_count: Some(usage.total_tokens),
        cached_content_token_count: usage.cache_read_tokens,
    }
}

pub(crate) fn encode_finish_reason(reason: FinishReason) -> String {
    match reason {
        FinishReason::Stop => "STOP",
        FinishReason::Length => "MAX_TOKENS",
        FinishReason::ToolUse => "STOP",
        FinishReason::ContentFilter => "SAFETY",
        FinishReason::Other => "OTHER",
    }
    .to_string()
}

pub(crate) fn decode_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

struct ChunkEncoder {
    model: String,
}

impl InboundStreamEncoder for ChunkEncoder {
    fn encode(&mut self, chunk: &ChatChunk) -> Result<Vec<SseEvent>, TransformError> {
        if chunk.done {
            return Ok(Vec::new());
        }
        let mut candidates = Vec::new();
        for delta in &chunk.deltas {
            let mut parts = Vec::new();
            if let Some(thinking) = delta.thinking.as_deref().filter(|t| !t.is_empty()) {
                parts.push(wire::Part {
                    text: Some(thinking.to_string()),
                    thought: Some(true),
                    ..wire::Part::default()
                });
            }
            if let Some(text) = delta.text.as_deref().filter(|t| !t.is_empty()) {
                parts.push(wire::Part::text(text.to_string()));
            }
            if let Some(tool) = &delta.tool_call
                && let Some(name) = &tool.name
            {
                // Gemini sends whole function calls, not argument fragments.
                parts.push(wire::Part {
                    function_call: Some(wire::FunctionCall {
                        name: name.clone(),
                        id: tool.id.clone(),
                        args: serde_json::from_str(&tool.arguments_delta)
                            .unwrap_or_else(|_| serde_json::json!({})),
                    }),
                    ..wire::Part::default()
                });
            }
            if parts.is_empty() && delta.finish_reason.is_none() {
                continue;
            }
            candidates.push(wire::Candidate {
                content: Some(wire::Content {
                    role: Some("model".to_string()),
                    parts,
                }),
                finish_reason: delta.finish_reason.map(encode_finish_reason),
                index: Some(delta.index),
            });
        }
        if candidates.is_empty() && chunk.usage.is_none() {
            return Ok(Vec::new());
        }
        let payload = wire::GenerateContentResponse {
            candidates,
            usage_metadata: chunk.usage.map(encode_usage),
            model_version: Some(self.model.clone()),
            response_id: chunk.id.clone(),
        };
        let data = serde_json::to_string(&payload).map_err(TransformError::invalid_response)?;
        Ok(vec![SseEvent::data(data)])
    }

    fn finish(&mut self, response: &ChatResponse) -> Result<Vec<SseEvent>, TransformError> {
        // Usage arrives on the final upstream chunk; re-emit only if the
        // stream never carried it.
        if response.usage.is_none() {
            return Ok(Vec::new());
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_comes_from_the_path() {
        let ctx = InboundContext {
            path_model: Some("gemini-2.0-flash".to_string()),
            stream: Some(true),
        };
        let body = serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "systemInstruction": {"parts": [{"text": "be brief"}]}
        });
        let request = GeminiInbound
            .transform_request(&ctx, serde_json::to_vec(&body).unwrap().as_slice())
            .unwrap();
        assert_eq!(request.model, "gemini-2.0-flash");
        assert!(request.stream);
        assert_eq!(request.system.as_deref(), Some("be brief"));
        assert_eq!(
            request.metadata.get(META_GEMINI_MODEL_PATH).map(String::as_str),
            Some("models/gemini-2.0-flash")
        );
    }

    #[test]
    fn missing_path_model_is_rejected() {
        let body = serde_json::json!({"contents": []});
        let err = GeminiInbound
            .transform_request(
                &InboundContext::default(),
                serde_json::to_vec(&body).unwrap().as_slice(),
            )
            .unwrap_err();
        assert!(matches!(err, TransformError::MissingField("model")));
    }
}
