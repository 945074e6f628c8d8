use axonhub_protocol::ApiFormat;
use axonhub_protocol::sse::SseEvent;
use axonhub_protocol::unified::{ChatRequest, FinishReason};
use axonhub_transform::{ChannelEndpoint, StreamAccumulator, inbound, outbound};

fn event(name: &str, data: serde_json::Value) -> SseEvent {
    SseEvent {
        id: None,
        event: Some(name.to_string()),
        data: data.to_string(),
    }
}

/// Anthropic upstream events for "Hello!" with usage on the tail.
fn anthropic_stream() -> Vec<SseEvent> {
    vec![
        event(
            "message_start",
            serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": "msg_1", "type": "message", "role": "assistant",
                    "model": "claude-sonnet-4-5", "content": [],
                    "usage": {"input_tokens": 9, "output_tokens": 0}
                }
            }),
        ),
        event(
            "content_block_start",
            serde_json::json!({
                "type": "content_block_start", "index": 0,
                "content_block": {"type": "text", "text": ""}
            }),
        ),
        event(
            "content_block_delta",
            serde_json::json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "Hel"}
            }),
        ),
        event(
            "content_block_delta",
            serde_json::json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "lo!"}
            }),
        ),
        event(
            "content_block_stop",
            serde_json::json!({"type": "content_block_stop", "index": 0}),
        ),
        event(
            "message_delta",
            serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
                "usage": {"input_tokens": 9, "output_tokens": 4}
            }),
        ),
        event("message_stop", serde_json::json!({"type": "message_stop"})),
    ]
}

#[test]
fn anthropic_stream_accumulates_and_reencodes_as_openai() {
    let endpoint = ChannelEndpoint {
        base_url: "https://api.anthropic.com".to_string(),
        api_key: "k".to_string(),
        ..ChannelEndpoint::default()
    };
    let out_codec = outbound(ApiFormat::AnthropicMessages, endpoint);
    let mut decoder = out_codec.start_stream();

    let mut request = ChatRequest::new("claude-sonnet-4-5");
    request.stream = true;
    let in_codec = inbound(ApiFormat::OpenAiChatCompletions);
    let mut encoder = in_codec.start_stream(&request);

    let mut accumulator = StreamAccumulator::new();
    let mut client_lines = Vec::new();
    for upstream_event in anthropic_stream() {
        for chunk in decoder.decode(&upstream_event).unwrap() {
            accumulator.push(&chunk);
            if chunk.done {
                continue;
            }
            for encoded in encoder.encode(&chunk).unwrap() {
                client_lines.push(encoded.data);
            }
        }
    }

    let usage = accumulator.usage().unwrap();
    assert_eq!(usage.input_tokens, 9);
    assert_eq!(usage.output_tokens, 4);

    let response = accumulator.finish("claude-sonnet-4-5", 0);
    assert_eq!(response.first_text(), "Hello!");
    assert_eq!(response.id, "msg_1");
    assert_eq!(
        response.choices[0].finish_reason,
        Some(FinishReason::Stop)
    );

    // Client saw OpenAI chunk payloads carrying the deltas.
    assert!(client_lines.iter().any(|line| line.contains("\"Hel\"")));
    let tail = encoder.finish(&response).unwrap();
    assert!(tail.last().unwrap().is_done_marker());
}

#[test]
fn openai_stream_reencodes_as_anthropic_events() {
    let endpoint = ChannelEndpoint {
        base_url: "https://api.openai.com/v1".to_string(),
        api_key: "k".to_string(),
        ..ChannelEndpoint::default()
    };
    let out_codec = outbound(ApiFormat::OpenAiChatCompletions, endpoint);
    let mut decoder = out_codec.start_stream();

    let mut request = ChatRequest::new("gpt-4o");
    request.stream = true;
    let in_codec = inbound(ApiFormat::AnthropicMessages);
    let mut encoder = in_codec.start_stream(&request);

    let chunk_payload = serde_json::json!({
        "id": "chatcmpl-1", "object": "chat.completion.chunk",
        "created": 1, "model": "gpt-4o",
        "choices": [{"index": 0, "delta": {"role": "assistant", "content": "hi"}}]
    });
    let mut names = Vec::new();
    let mut accumulator = StreamAccumulator::new();
    for chunk in decoder.decode(&SseEvent::data(chunk_payload.to_string())).unwrap() {
        accumulator.push(&chunk);
        for encoded in encoder.encode(&chunk).unwrap() {
            names.push(encoded.event.unwrap());
        }
    }
    for chunk in decoder.decode(&SseEvent::data("[DONE]")).unwrap() {
        accumulator.push(&chunk);
    }
    let response = accumulator.finish("gpt-4o", 0);
    for encoded in encoder.finish(&response).unwrap() {
        names.push(encoded.event.unwrap());
    }
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
}
