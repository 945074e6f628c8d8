use bytes::Bytes;

use axonhub_protocol::ApiFormat;
use axonhub_protocol::gemini::generate_content as wire;
use axonhub_protocol::sse::SseEvent;
use axonhub_protocol::unified::{
    ChatChunk, ChatRequest, ChatResponse, Choice, ChunkDelta, ContentPart, META_GEMINI_MODEL_PATH,
    Message, Role, ToolCall, ToolCallDelta, Usage,
};

use crate::inbound::gemini::decode_finish_reason;
use crate::outbound::join_url;
use crate::types::{
    ChannelEndpoint, HttpMethod, HttpRequestSpec, OutboundStreamDecoder, OutboundTransformer,
    TransformError,
};

pub struct GeminiOutbound {
    endpoint: ChannelEndpoint,
}

impl GeminiOutbound {
    pub fn new(endpoint: ChannelEndpoint) -> Self {
        Self { endpoint }
    }
}

impl OutboundTransformer for GeminiOutbound {
    fn format(&self) -> ApiFormat {
        ApiFormat::GeminiContents
    }

    fn transform_request(&self, request: &ChatRequest) -> Result<HttpRequestSpec, TransformError> {
        let wire = encode_request(request);
        let body = serde_json::to_vec(&wire).map_err(TransformError::invalid_request)?;
        let model_path = request
            .metadata
            .get(META_GEMINI_MODEL_PATH)
            .cloned()
            .unwrap_or_else(|| format!("models/{}", request.model));
        let path = if request.stream {
            format!("/v1beta/{model_path}:streamGenerateContent?alt=sse")
        } else {
            format!("/v1beta/{model_path}:generateContent")
        };
        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("x-goog-api-key".to_string(), self.endpoint.api_key.clone()),
        ];
        headers.extend(self.endpoint.extra_headers.iter().cloned());
        Ok(HttpRequestSpec {
            method: HttpMethod::Post,
            url: join_url(&self.endpoint.base_url, &path),
            headers,
            body: Bytes::from(body),
            stream: request.stream,
        })
    }

    fn transform_response(&self, body: &[u8]) -> Result<ChatResponse, TransformError> {
        let wire: wire::GenerateContentResponse =
            serde_json::from_slice(body).map_err(TransformError::invalid_response)?;
        Ok(decode_response(wire))
    }

    fn start_stream(&self) -> Box<dyn OutboundStreamDecoder> {
        Box::new(ChunkDecoder {
            next_tool_ordinal: 0,
        })
    }
}

pub(crate) fn encode_request(request: &ChatRequest) -> wire::GenerateContentRequest {
    let mut contents: Vec<wire::Content> = Vec::new();
    for message in &request.messages {
        let role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        };
        let mut parts = Vec::new();
        for part in &message.parts {
            match part {
                ContentPart::Text { text } => parts.push(wire::Part::text(text.clone())),
                ContentPart::ImageUrl { url } => parts.push(wire::Part {
                    file_data: Some(wire::FileData {
                        mime_type: None,
                        file_uri: url.clone(),
                    }),
                    ..wire::Part::default()
                }),
                ContentPart::Thinking { .. } => {}
                ContentPart::ToolResult {
                    tool_call_id,
                    content,
                    ..
                } => {
                    let name = tool_call_id
                        .rsplit_once('-')
                        .map(|(name, _)| name.to_string())
                        .unwrap_or_else(|| tool_call_id.clone());
                    parts.push(wire::Part {
                        function_response: Some(wire::FunctionResponse {
                            name,
                            id: Some(tool_call_id.clone()),
                            response: serde_json::from_str(content)
                                .unwrap_or_else(|_| serde_json::json!({"result": content})),
                        }),
                        ..wire::Part::default()
                    });
                }
            }
        }
        for tool_call in &message.tool_calls {
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
        if parts.is_empty() {
            continue;
        }
        contents.push(wire::Content {
            role: Some(role.to_string()),
            parts,
        });
    }

    let generation_config = wire::GenerationConfig {
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: if request.stop.is_empty() {
            None
        } else {
            Some(request.stop.clone())
        },
    };
    let has_config = generation_config != wire::GenerationConfig::default();

    wire::GenerateContentRequest {
        contents,
        system_instruction: request.system.as_ref().map(|system| wire::Content {
            role: None,
            parts: vec![wire::Part::text(system.clone())],
        }),
        tools: if request.tools.is_empty() {
            None
        } else {
            Some(vec![wire::Tool {
                function_declarations: Some(
                    request
                        .tools
                        .iter()
                        .map(|tool| wire::FunctionDeclaration {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: Some(tool.parameters.clone()),
                        })
                        .collect(),
                ),
            }])
        },
        tool_config: request.tool_choice.clone(),
        generation_config: if has_config {
            Some(generation_config)
        } else {
            None
        },
    }
}

pub(crate) fn decode_response(wire: wire::GenerateContentResponse) -> ChatResponse {
    let mut choices = Vec::new();
    let mut synthetic_call_id = 0u32;
    for (position, candidate) in wire.candidates.into_iter().enumerate() {
        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        if let Some(content) = candidate.content {
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
            }
        }
        choices.push(Choice {
            index: candidate.index.unwrap_or(position as u32),
            message: Message {
                role: Role::Assistant,
                parts,
                tool_calls,
            },
            finish_reason: candidate.finish_reason.as_deref().map(decode_finish_reason),
        });
    }
    ChatResponse {
        id: wire.response_id.unwrap_or_default(),
        model: wire.model_version.unwrap_or_default(),
        choices,
        usage: wire.usage_metadata.map(decode_usage),
        created: 0,
    }
}

pub(crate) fn decode_usage(usage: wire::UsageMetadata) -> Usage {
    let input = usage.prompt_token_count.unwrap_or(0);
    let output = usage.candidates_token_count.unwrap_or(0);
    Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: usage.total_token_count.unwrap_or(input + output),
        cache_read_tokens: usage.cached_content_token_count,
    }
}

struct ChunkDecoder {
    next_tool_ordinal: u32,
}

impl OutboundStreamDecoder for ChunkDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatChunk>, TransformError> {
        if event.data.is_empty() || event.is_done_marker() {
            return Ok(Vec::new());
        }
        let wire: wire::GenerateContentResponse =
            serde_json::from_str(&event.data).map_err(TransformError::invalid_response)?;
        let mut deltas = Vec::new();
        for (position, candidate) in wire.candidates.iter().enumerate() {
            let index = candidate.index.unwrap_or(position as u32);
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = &part.text {
                        if part.thought.unwrap_or(false) {
                            deltas.push(ChunkDelta {
                                index,
                                thinking: Some(text.clone()),
                                ..ChunkDelta::default()
                            });
                        } else {
                            deltas.push(ChunkDelta {
                                index,
                                text: Some(text.clone()),
                                ..ChunkDelta::default()
                            });
                        }
                    }
                    if let Some(call) = &part.function_call {
                        let ordinal = self.next_tool_ordinal;
                        self.next_tool_ordinal += 1;
                        let id = call
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("{}-{}", call.name, ordinal + 1));
                        deltas.push(ChunkDelta {
                            index,
                            tool_call: Some(ToolCallDelta {
                                index: ordinal,
                                id: Some(id),
                                name: Some(call.name.clone()),
                                arguments_delta: call.args.to_string(),
                            }),
                            ..ChunkDelta::default()
                        });
                    }
                }
            }
            if let Some(reason) = &candidate.finish_reason {
                deltas.push(ChunkDelta {
                    index,
                    finish_reason: Some(decode_finish_reason(reason)),
                    ..ChunkDelta::default()
                });
            }
        }
        Ok(vec![ChatChunk {
            id: wire.response_id,
            model: wire.model_version,
            deltas,
            usage: wire.usage_metadata.map(decode_usage),
            done: false,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ChannelEndpoint {
        ChannelEndpoint {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            api_key: "AIza-test".to_string(),
            ..ChannelEndpoint::default()
        }
    }

    #[test]
    fn stream_url_requests_sse() {
        let mut request = ChatRequest::new("gemini-2.0-flash");
        request.stream = true;
        request.messages.push(Message::text(Role::User, "hi"));
        let spec = GeminiOutbound::new(endpoint())
            .transform_request(&request)
            .unwrap();
        assert!(spec.url.ends_with("models/gemini-2.0-flash:streamGenerateContent?alt=sse"));
        assert!(spec.headers.iter().any(|(k, _)| k == "x-goog-api-key"));
    }

    #[test]
    fn round_trip_preserves_structure() {
        let mut request = ChatRequest::new("gemini-2.0-flash");
        request.system = Some("be brief".to_string());
        request.messages.push(Message::text(Role::User, "hi"));
        let wire = encode_request(&request);
        let decoded =
            crate::inbound::gemini::decode_request("gemini-2.0-flash".to_string(), wire).unwrap();
        assert_eq!(decoded.normalized(), request.normalized());
    }

    #[test]
    fn decodes_usage_totals() {
        let usage = wire::UsageMetadata {
            prompt_token_count: Some(7),
            candidates_token_count: Some(3),
            total_token_count: None,
            cached_content_token_count: None,
        };
        assert_eq!(decode_usage(usage).total_tokens, 10);
    }
}
