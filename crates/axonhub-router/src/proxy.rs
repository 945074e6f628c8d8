use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use axonhub_channel::ChannelRegistry;
use axonhub_core::executor::{ClientReply, ExecutionContext, RequestExecutor};
use axonhub_core::{AuthContext, AuthService};
use axonhub_protocol::gemini::generate_content::split_model_action;
use axonhub_protocol::openai::ModelList;
use axonhub_protocol::ApiFormat;
use axonhub_protocol::sse::{SseEvent, encode_sse_event};
use axonhub_transform::InboundContext;

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";
const TRACE_HEADER: &str = "x-axonhub-trace-id";

#[derive(Clone)]
pub struct GatewayState {
    pub executor: Arc<RequestExecutor>,
    pub auth: Arc<AuthService>,
    pub registry: Arc<ChannelRegistry>,
}

pub fn proxy_router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1/responses", post(openai_responses))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1beta/models/{*model}", post(gemini_generate))
        .route("/v1/models", get(models_list))
        .layer(middleware::from_fn_with_state(state.clone(), proxy_auth))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Resolve the caller's API key, strip auth material, and stash the
/// identity for handlers.
async fn proxy_auth(
    State(state): State<GatewayState>,
    mut request: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let key = extract_api_key(request.headers());
    strip_auth_headers(request.headers_mut());

    let Some(key) = key else {
        return Err(unauthorized("missing api key"));
    };
    let auth = match state.auth.authenticate(&key).await {
        Ok(auth) => auth,
        Err(error) => {
            tracing::debug!(%error, "authentication rejected");
            return Err(unauthorized("invalid api key"));
        }
    };
    request.extensions_mut().insert(auth);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.trim().to_string());
    }
    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(name)
            && let Ok(value) = value.to_str()
        {
            return Some(value.trim().to_string());
        }
    }
    None
}

fn strip_auth_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
    headers.remove("x-goog-api-key");
}

fn unauthorized(message: &str) -> Response {
    let body = serde_json::json!({
        "error": {"message": message, "type": "authentication_error"}
    });
    (
        StatusCode::UNAUTHORIZED,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn execution_context(auth: &AuthContext, headers: &HeaderMap, format: ApiFormat) -> ExecutionContext {
    let trace_id = headers
        .get(TRACE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok());
    ExecutionContext {
        project_id: auth.project.id,
        api_key_id: auth.api_key.id,
        trace_id,
        format,
        source: "api".to_string(),
    }
}

async fn openai_chat_completions(
    State(state): State<GatewayState>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = execution_context(&auth, &headers, ApiFormat::OpenAiChatCompletions);
    let reply = state
        .executor
        .execute(ctx, InboundContext::default(), body)
        .await;
    into_response(reply, StreamFlavor::Sse)
}

async fn openai_responses(
    State(state): State<GatewayState>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = execution_context(&auth, &headers, ApiFormat::OpenAiResponses);
    let reply = state
        .executor
        .execute(ctx, InboundContext::default(), body)
        .await;
    into_response(reply, StreamFlavor::Sse)
}

async fn anthropic_messages(
    State(state): State<GatewayState>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = execution_context(&auth, &headers, ApiFormat::AnthropicMessages);
    let reply = state
        .executor
        .execute(ctx, InboundContext::default(), body)
        .await;
    into_response(reply, StreamFlavor::Sse)
}

#[derive(Debug, Deserialize)]
struct GeminiQuery {
    alt: Option<String>,
}

async fn gemini_generate(
    State(state): State<GatewayState>,
    Extension(auth): Extension<AuthContext>,
    Path(model_tail): Path<String>,
    Query(query): Query<GeminiQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((model, action)) = split_model_action(&model_tail) else {
        return (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            serde_json::json!({
                "error": {"code": 404, "message": "unknown action", "status": "NOT_FOUND"}
            })
            .to_string(),
        )
            .into_response();
    };
    let stream = action == "streamGenerateContent";
    let inbound_ctx = InboundContext {
        path_model: Some(model.to_string()),
        stream: Some(stream),
    };
    let flavor = if query.alt.as_deref() == Some("sse") {
        StreamFlavor::Sse
    } else {
        StreamFlavor::NdJson
    };
    let ctx = execution_context(&auth, &headers, ApiFormat::GeminiContents);
    let reply = state.executor.execute(ctx, inbound_ctx, body).await;
    into_response(reply, flavor)
}

async fn models_list(State(state): State<GatewayState>) -> Response {
    let snapshot = state.registry.snapshot();
    let mut models: Vec<String> = snapshot
        .iter()
        .flat_map(|runtime| runtime.channel.supported_models.iter().cloned())
        .collect();
    models.sort();
    models.dedup();
    let list = ModelList::new(models, time::OffsetDateTime::now_utc().unix_timestamp());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_string(&list).unwrap_or_default(),
    )
        .into_response()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamFlavor {
    Sse,
    NdJson,
}

fn into_response(reply: ClientReply, flavor: StreamFlavor) -> Response {
    match reply {
        ClientReply::Unary { status, body } => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        ClientReply::Stream { events } => match flavor {
            StreamFlavor::Sse => stream_response(events, "text/event-stream", encode_sse_frame),
            StreamFlavor::NdJson => stream_response(events, "application/x-ndjson", encode_ndjson_frame),
        },
    }
}

fn encode_sse_frame(event: &SseEvent) -> Bytes {
    Bytes::from(encode_sse_event(event).into_bytes())
}

fn encode_ndjson_frame(event: &SseEvent) -> Bytes {
    let mut line = event.data.clone().into_bytes();
    line.push(b'\n');
    Bytes::from(line)
}

/// Pump client events out as they arrive, with keep-alive comment frames on
/// idle SSE connections.
fn stream_response(
    mut events: mpsc::Receiver<SseEvent>,
    content_type: &'static str,
    encode: fn(&SseEvent) -> Bytes,
) -> Response {
    let heartbeat = content_type == "text/event-stream";
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.reset();
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    interval.reset();
                    if tx.send(encode(&event)).await.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if heartbeat
                        && tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    let body = Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
