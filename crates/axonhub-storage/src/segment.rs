use futures_util::future::join_all;
use serde::Serialize;

use axonhub_common::{GatewayError, GatewayResult};
use axonhub_protocol::ApiFormat;
use axonhub_protocol::unified::{ChatRequest, ChatResponse, ContentPart, Role};
use axonhub_transform::{InboundContext, inbound};

use crate::entities;
use crate::request_service::RequestService;

/// A typed event inside a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    SystemInstruction,
    UserQuery,
    UserImageUrl,
    ToolResult,
    Text,
    Thinking,
    ToolUse,
    ImageUrl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Span {
    pub kind: SpanKind,
    pub content: String,
}

impl Span {
    fn new(kind: SpanKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }
}

/// Per-request node of the trace tree. Children are the later requests of
/// the same trace in chronological order; parent links stay integer ids.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub request_id: i64,
    pub model_id: String,
    pub request_spans: Vec<Span>,
    pub response_spans: Vec<Span>,
    pub children: Vec<Segment>,
}

impl Segment {
    /// Request + response spans, the view children de-duplicate against.
    pub fn combined_spans(&self) -> Vec<Span> {
        let mut combined = self.request_spans.clone();
        combined.extend(self.response_spans.iter().cloned());
        combined
    }
}

/// Request-side span derivation. Assistant history turns produce
/// response-kind spans so a follow-up request lines up with its
/// predecessor's combined spans.
pub fn request_spans(request: &ChatRequest) -> Vec<Span> {
    let mut spans = Vec::new();
    if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
        spans.push(Span::new(SpanKind::SystemInstruction, system));
    }
    for message in &request.messages {
        for part in &message.parts {
            match part {
                ContentPart::Text { text } => {
                    let kind = match message.role {
                        Role::Assistant => SpanKind::Text,
                        _ => SpanKind::UserQuery,
                    };
                    spans.push(Span::new(kind, text.clone()));
                }
                ContentPart::ImageUrl { url } => {
                    let kind = match message.role {
                        Role::Assistant => SpanKind::ImageUrl,
                        _ => SpanKind::UserImageUrl,
                    };
                    spans.push(Span::new(kind, url.clone()));
                }
                ContentPart::Thinking { thinking, .. } => {
                    spans.push(Span::new(SpanKind::Thinking, thinking.clone()));
                }
                ContentPart::ToolResult { content, .. } => {
                    spans.push(Span::new(SpanKind::ToolResult, content.clone()));
                }
            }
        }
        for tool_call in &message.tool_calls {
            spans.push(Span::new(
                SpanKind::ToolUse,
                format!("{}({})", tool_call.name, tool_call.arguments),
            ));
        }
    }
    spans
}

pub fn response_spans(response: &ChatResponse) -> Vec<Span> {
    let mut spans = Vec::new();
    for choice in &response.choices {
        for part in &choice.message.parts {
            match part {
                ContentPart::Thinking { thinking, .. } => {
                    spans.push(Span::new(SpanKind::Thinking, thinking.clone()));
                }
                ContentPart::Text { text } => {
                    spans.push(Span::new(SpanKind::Text, text.clone()));
                }
                ContentPart::ImageUrl { url } => {
                    spans.push(Span::new(SpanKind::ImageUrl, url.clone()));
                }
                ContentPart::ToolResult { .. } => {}
            }
        }
        for tool_call in &choice.message.tool_calls {
            spans.push(Span::new(
                SpanKind::ToolUse,
                format!("{}({})", tool_call.name, tool_call.arguments),
            ));
        }
    }
    spans
}

/// Drop the child's leading spans when they replay the predecessor's
/// combined spans (carried-forward context). Remaining spans keep order.
pub fn dedup_against_parent(child_request_spans: Vec<Span>, parent_combined: &[Span]) -> Vec<Span> {
    if parent_combined.is_empty() || child_request_spans.len() < parent_combined.len() {
        return child_request_spans;
    }
    if child_request_spans[..parent_combined.len()] == *parent_combined {
        return child_request_spans[parent_combined.len()..].to_vec();
    }
    child_request_spans
}

/// Rebuilds the hierarchical segment view of a trace from stored bodies.
pub struct SegmentBuilder<'a> {
    service: &'a RequestService,
}

impl<'a> SegmentBuilder<'a> {
    pub fn new(service: &'a RequestService) -> Self {
        Self { service }
    }

    /// Segment of the first completed request only, children omitted.
    pub async fn trace_first_segment(&self, trace_id: i64) -> GatewayResult<Option<Segment>> {
        let mut segments = self.load_segments(trace_id, Some(1)).await?;
        Ok(segments.pop())
    }

    /// Full chain: the first request is the root, each later request hangs
    /// off its predecessor with carried-forward context removed.
    pub async fn trace_root_segment(&self, trace_id: i64) -> GatewayResult<Option<Segment>> {
        let segments = self.load_segments(trace_id, None).await?;
        let mut iter = segments.into_iter();
        let Some(root) = iter.next() else {
            return Ok(None);
        };
        Ok(Some(chain_segments(root, iter.collect())))
    }

    async fn load_segments(
        &self,
        trace_id: i64,
        limit: Option<usize>,
    ) -> GatewayResult<Vec<Segment>> {
        let mut rows = self
            .service
            .storage()
            .list_trace_requests(trace_id)
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        if let Some(limit) = limit {
            rows.truncate(limit);
        }

        let loads = rows.iter().map(|row| async {
            let request_body = self.service.load_request_body(row).await?;
            let response_body = self.service.load_response_body(row).await.ok();
            Ok::<_, GatewayError>((request_body, response_body))
        });
        let bodies = join_all(loads).await;

        let mut segments = Vec::with_capacity(rows.len());
        for (row, loaded) in rows.iter().zip(bodies) {
            let (request_body, response_body) = loaded?;
            segments.push(derive_segment(row, &request_body, response_body.as_ref())?);
        }
        Ok(segments)
    }
}

fn chain_segments(mut root: Segment, rest: Vec<Segment>) -> Segment {
    let mut parent_combined = root.combined_spans();
    let mut chain: Vec<Segment> = Vec::new();
    for mut segment in rest {
        segment.request_spans = dedup_against_parent(segment.request_spans, &parent_combined);
        parent_combined = {
            let mut combined = parent_combined.clone();
            combined.extend(segment.request_spans.iter().cloned());
            combined.extend(segment.response_spans.iter().cloned());
            combined
        };
        chain.push(segment);
    }
    // Nest back-to-front so each request hangs off its predecessor.
    let mut nested: Option<Segment> = None;
    for mut segment in chain.into_iter().rev() {
        if let Some(child) = nested.take() {
            segment.children.push(child);
        }
        nested = Some(segment);
    }
    if let Some(child) = nested {
        root.children.push(child);
    }
    root
}

fn derive_segment(
    row: &entities::requests::Model,
    request_body: &serde_json::Value,
    response_body: Option<&serde_json::Value>,
) -> GatewayResult<Segment> {
    let format = ApiFormat::parse(&row.format)
        .ok_or_else(|| GatewayError::InternalStorage(format!("unknown format {}", row.format)))?;
    let ctx = InboundContext {
        path_model: Some(row.model_id.clone()),
        stream: None,
    };
    let body_bytes = serde_json::to_vec(request_body)
        .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
    let unified: ChatRequest = inbound(format)
        .transform_request(&ctx, &body_bytes)
        .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;

    let response = response_body
        .and_then(|value| serde_json::from_value::<ChatResponse>(value.clone()).ok());

    Ok(Segment {
        request_id: row.id,
        model_id: row.model_id.clone(),
        request_spans: request_spans(&unified),
        response_spans: response.as_ref().map(response_spans).unwrap_or_default(),
        children: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axonhub_protocol::unified::{Choice, Message, Usage};

    fn span(kind: SpanKind, content: &str) -> Span {
        Span::new(kind, content)
    }

    fn simple_request(system: Option<&str>, user: &str) -> ChatRequest {
        let mut request = ChatRequest::new("m");
        request.system = system.map(str::to_string);
        request.messages.push(Message::text(Role::User, user));
        request
    }

    fn simple_response(text: &str) -> ChatResponse {
        ChatResponse {
            id: "r".to_string(),
            model: "m".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message::text(Role::Assistant, text),
                finish_reason: None,
            }],
            usage: Some(Usage::default()),
            created: 0,
        }
    }

    #[test]
    fn request_spans_type_each_part() {
        let mut request = simple_request(Some("sys"), "q1");
        request.messages.push(Message::text(Role::Assistant, "a1"));
        let spans = request_spans(&request);
        assert_eq!(
            spans,
            vec![
                span(SpanKind::SystemInstruction, "sys"),
                span(SpanKind::UserQuery, "q1"),
                span(SpanKind::Text, "a1"),
            ]
        );
    }

    #[test]
    fn child_prefix_matching_parent_combined_is_dropped() {
        let parent_request = simple_request(Some("sys"), "q1");
        let parent = Segment {
            request_id: 1,
            model_id: "m".to_string(),
            request_spans: request_spans(&parent_request),
            response_spans: response_spans(&simple_response("a1")),
            children: Vec::new(),
        };

        // Follow-up carries the whole conversation so far plus a new query.
        let mut child_request = simple_request(Some("sys"), "q1");
        child_request
            .messages
            .push(Message::text(Role::Assistant, "a1"));
        child_request
            .messages
            .push(Message::text(Role::User, "q2"));
        let deduped =
            dedup_against_parent(request_spans(&child_request), &parent.combined_spans());
        assert_eq!(deduped, vec![span(SpanKind::UserQuery, "q2")]);
    }

    #[test]
    fn diverging_prefix_is_kept_in_full() {
        let parent_request = simple_request(Some("sys"), "q1");
        let parent = Segment {
            request_id: 1,
            model_id: "m".to_string(),
            request_spans: request_spans(&parent_request),
            response_spans: response_spans(&simple_response("a1")),
            children: Vec::new(),
        };
        let child_request = simple_request(Some("different"), "q2");
        let child_spans = request_spans(&child_request);
        let deduped = dedup_against_parent(child_spans.clone(), &parent.combined_spans());
        assert_eq!(deduped, child_spans);
    }

    #[test]
    fn chain_nests_children_in_order() {
        let make = |id: i64, query: &str, answer: &str| Segment {
            request_id: id,
            model_id: "m".to_string(),
            request_spans: vec![span(SpanKind::UserQuery, query)],
            response_spans: vec![span(SpanKind::Text, answer)],
            children: Vec::new(),
        };
        let root = chain_segments(make(1, "q1", "a1"), vec![make(2, "q2", "a2"), make(3, "q3", "a3")]);
        assert_eq!(root.request_id, 1);
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].request_id, 2);
        assert_eq!(root.children[0].children[0].request_id, 3);
    }
}
