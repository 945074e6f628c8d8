use std::collections::BTreeMap;

use axonhub_protocol::unified::{
    ChatChunk, ChatResponse, Choice, ContentPart, FinishReason, Message, Role, ToolCall, Usage,
};

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct PartialChoice {
    text: String,
    thinking: String,
    thinking_signature: Option<String>,
    tool_calls: BTreeMap<u32, PartialToolCall>,
    finish_reason: Option<FinishReason>,
}

/// Reduces provider stream chunks into the final unified response used for
/// persistence and usage accounting. Chunks pass through to the client as
/// they arrive; this only mirrors them.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    id: Option<String>,
    model: Option<String>,
    choices: BTreeMap<u32, PartialChoice>,
    usage: Option<Usage>,
    saw_output: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk in. Returns true the first time a chunk carrying
    /// client-visible output is observed (first-token latency capture).
    pub fn push(&mut self, chunk: &ChatChunk) -> bool {
        if chunk.done {
            return false;
        }
        if self.id.is_none() {
            self.id = chunk.id.clone();
        }
        if self.model.is_none() {
            self.model = chunk.model.clone();
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(merge_usage(self.usage, usage));
        }

        let mut first_output = false;
        for delta in &chunk.deltas {
            let choice = self.choices.entry(delta.index).or_default();
            if let Some(text) = &delta.text {
                choice.text.push_str(text);
            }
            if let Some(thinking) = &delta.thinking {
                choice.thinking.push_str(thinking);
            }
            if let Some(tool) = &delta.tool_call {
                let partial = choice.tool_calls.entry(tool.index).or_default();
                if let Some(id) = &tool.id {
                    partial.id = id.clone();
                }
                if let Some(name) = &tool.name {
                    partial.name = name.clone();
                }
                partial.arguments.push_str(&tool.arguments_delta);
            }
            if let Some(reason) = delta.finish_reason {
                choice.finish_reason = Some(reason);
            }
            if !self.saw_output && delta.has_output() {
                self.saw_output = true;
                first_output = true;
            }
        }
        first_output
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn finish(self, fallback_model: &str, created: i64) -> ChatResponse {
        let mut choices = Vec::with_capacity(self.choices.len().max(1));
        for (index, partial) in self.choices {
            let mut parts = Vec::new();
            if !partial.thinking.is_empty() {
                parts.push(ContentPart::Thinking {
                    thinking: partial.thinking,
                    signature: partial.thinking_signature,
                });
            }
            if !partial.text.is_empty() {
                parts.push(ContentPart::Text { text: partial.text });
            }
            let tool_calls = partial
                .tool_calls
                .into_values()
                .map(|tc| ToolCall {
                    id: tc.id,
                    name: tc.name,
                    arguments: tc.arguments,
                })
                .collect();
            choices.push(Choice {
                index,
                message: Message {
                    role: Role::Assistant,
                    parts,
                    tool_calls,
                },
                finish_reason: partial.finish_reason,
            });
        }
        if choices.is_empty() {
            choices.push(Choice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    parts: Vec::new(),
                    tool_calls: Vec::new(),
                },
                finish_reason: None,
            });
        }

        ChatResponse {
            id: self.id.unwrap_or_default(),
            model: self.model.unwrap_or_else(|| fallback_model.to_string()),
            choices,
            usage: self.usage,
            created,
        }
    }
}

fn merge_usage(existing: Option<Usage>, incoming: Usage) -> Usage {
    let Some(existing) = existing else {
        return incoming;
    };
    // Later usage blocks win field-wise; providers re-send totals at the end.
    Usage {
        input_tokens: if incoming.input_tokens != 0 {
            incoming.input_tokens
        } else {
            existing.input_tokens
        },
        output_tokens: if incoming.output_tokens != 0 {
            incoming.output_tokens
        } else {
            existing.output_tokens
        },
        total_tokens: if incoming.total_tokens != 0 {
            incoming.total_tokens
        } else {
            existing.total_tokens
        },
        cache_read_tokens: incoming.cache_read_tokens.or(existing.cache_read_tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axonhub_protocol::unified::{ChunkDelta, ToolCallDelta};

    fn text_chunk(index: u32, text: &str) -> ChatChunk {
        ChatChunk {
            deltas: vec![ChunkDelta {
                index,
                text: Some(text.to_string()),
                ..ChunkDelta::default()
            }],
            ..ChatChunk::default()
        }
    }

    #[test]
    fn appends_text_deltas_per_choice() {
        let mut acc = StreamAccumulator::new();
        assert!(acc.push(&text_chunk(0, "Hel")));
        assert!(!acc.push(&text_chunk(0, "lo")));
        let response = acc.finish("m", 0);
        assert_eq!(response.first_text(), "Hello");
    }

    #[test]
    fn assembles_tool_call_fragments() {
        let mut acc = StreamAccumulator::new();
        acc.push(&ChatChunk {
            deltas: vec![ChunkDelta {
                index: 0,
                tool_call: Some(ToolCallDelta {
                    index: 0,
                    id: Some("call_1".to_string()),
                    name: Some("get_weather".to_string()),
                    arguments_delta: "{\"city\":".to_string(),
                }),
                ..ChunkDelta::default()
            }],
            ..ChatChunk::default()
        });
        acc.push(&ChatChunk {
            deltas: vec![ChunkDelta {
                index: 0,
                tool_call: Some(ToolCallDelta {
                    index: 0,
                    arguments_delta: "\"Paris\"}".to_string(),
                    ..ToolCallDelta::default()
                }),
                ..ChunkDelta::default()
            }],
            ..ChatChunk::default()
        });
        let response = acc.finish("m", 0);
        let tool_calls = &response.choices[0].message.tool_calls;
        assert_eq!(tool_calls.len(), 1);
        assert_eq!(tool_calls[0].name, "get_weather");
        assert_eq!(tool_calls[0].arguments, "{\"city\":\"Paris\"}");
    }

    #[test]
    fn done_marker_is_ignored() {
        let mut acc = StreamAccumulator::new();
        acc.push(&text_chunk(0, "x"));
        assert!(!acc.push(&ChatChunk::done_marker()));
        let response = acc.finish("m", 0);
        assert_eq!(response.first_text(), "x");
    }

    #[test]
    fn retains_last_usage_block() {
        let mut acc = StreamAccumulator::new();
        acc.push(&ChatChunk {
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 0,
                total_tokens: 0,
                cache_read_tokens: None,
            }),
            ..ChatChunk::default()
        });
        acc.push(&ChatChunk {
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                cache_read_tokens: None,
            }),
            ..ChatChunk::default()
        });
        let usage = acc.usage().unwrap();
        assert_eq!(usage.output_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
    }
}
