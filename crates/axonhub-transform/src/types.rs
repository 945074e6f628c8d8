use bytes::Bytes;

use axonhub_common::GatewayError;
use axonhub_protocol::ApiFormat;
use axonhub_protocol::sse::SseEvent;
use axonhub_protocol::unified::{ChatChunk, ChatRequest, ChatResponse};

#[derive(Debug, Clone)]
pub enum TransformError {
    InvalidRequest(String),
    InvalidResponse(String),
    MissingField(&'static str),
    Unsupported(&'static str),
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::InvalidRequest(msg) => write!(f, "invalid request body: {msg}"),
            TransformError::InvalidResponse(msg) => write!(f, "invalid upstream body: {msg}"),
            TransformError::MissingField(field) => write!(f, "missing required field: {field}"),
            TransformError::Unsupported(what) => write!(f, "unsupported content: {what}"),
        }
    }
}

impl std::error::Error for TransformError {}

impl TransformError {
    pub fn invalid_request(err: impl std::fmt::Display) -> Self {
        TransformError::InvalidRequest(err.to_string())
    }

    pub fn invalid_response(err: impl std::fmt::Display) -> Self {
        TransformError::InvalidResponse(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Fully built upstream HTTP request, ready for dispatch.
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stream: bool,
}

/// Upstream platform subtype for providers that expose the same wire format
/// behind different hosting shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    Default,
    Bedrock,
}

/// Channel-side configuration an outbound codec needs to build requests.
#[derive(Debug, Clone, Default)]
pub struct ChannelEndpoint {
    pub base_url: String,
    pub api_key: String,
    pub platform: Platform,
    pub extra_headers: Vec<(String, String)>,
}

/// Extra routing facts that arrive outside the body (URL path, query).
#[derive(Debug, Clone, Default)]
pub struct InboundContext {
    /// Model id taken from the URL path (Gemini).
    pub path_model: Option<String>,
    /// Stream flag decided by the route rather than the body.
    pub stream: Option<bool>,
}

/// Decodes one wire format from clients and encodes results back to it.
pub trait InboundTransformer: Send + Sync {
    fn format(&self) -> ApiFormat;

    fn transform_request(
        &self,
        ctx: &InboundContext,
        body: &[u8],
    ) -> Result<ChatRequest, TransformError>;

    fn transform_response(&self, response: &ChatResponse) -> Result<Bytes, TransformError>;

    /// Per-request stream encoder; holds whatever sequencing state the
    /// format needs (Anthropic block lifecycle, OpenAI role priming).
    fn start_stream(&self, request: &ChatRequest) -> Box<dyn InboundStreamEncoder>;

    /// Encode a terminal error in this format. Returns (status, body).
    fn transform_error(&self, error: &GatewayError) -> (u16, Bytes);
}

pub trait InboundStreamEncoder: Send {
    fn encode(&mut self, chunk: &ChatChunk) -> Result<Vec<SseEvent>, TransformError>;

    /// Called once after the upstream stream ends, with the accumulated
    /// response. Emits trailing events (usage chunk, stop events, `[DONE]`).
    fn finish(&mut self, response: &ChatResponse) -> Result<Vec<SseEvent>, TransformError>;
}

/// Encodes the unified request for one provider and decodes its answers.
pub trait OutboundTransformer: Send + Sync {
    fn format(&self) -> ApiFormat;

    fn transform_request(&self, request: &ChatRequest) -> Result<HttpRequestSpec, TransformError>;

    fn transform_response(&self, body: &[u8]) -> Result<ChatResponse, TransformError>;

    fn start_stream(&self) -> Box<dyn OutboundStreamDecoder>;

    /// Lift an upstream non-2xx into the unified taxonomy, preserving the
    /// original status code.
    fn transform_error(&self, status: u16, body: Bytes) -> GatewayError {
        GatewayError::UpstreamStatus { status, body }
    }
}

pub trait OutboundStreamDecoder: Send {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatChunk>, TransformError>;
}
