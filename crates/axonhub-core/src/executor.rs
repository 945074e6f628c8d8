use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use axonhub_channel::{
    Candidate, LoadBalancer, PerfSender, PerformanceRecord, RetryPolicy, apply_body_ops,
    apply_header_ops,
};
use axonhub_common::{GatewayError, TransportErrorKind};
use axonhub_protocol::ApiFormat;
use axonhub_protocol::sse::{SseEvent, SseParser};
use axonhub_protocol::unified::ChatRequest;
use axonhub_storage::entities::{request_executions, requests};
use axonhub_storage::{CompletionMetrics, NewRequest, RequestService, StoredChunk};
use axonhub_transform::{
    InboundContext, InboundStreamEncoder, OutboundStreamDecoder, StreamAccumulator, inbound,
    outbound,
};

use crate::upstream_client::{UpstreamBody, UpstreamClient, UpstreamResponse};

/// Caller identity and routing facts for one inbound call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub project_id: i64,
    pub api_key_id: i64,
    pub trace_id: Option<i64>,
    pub format: ApiFormat,
    pub source: String,
}

/// What goes back to the client, still in unified/SSE form; the router
/// turns it into the format-appropriate HTTP response.
pub enum ClientReply {
    Unary {
        status: u16,
        body: Bytes,
    },
    /// Client-format events; the channel closes when the stream ends.
    Stream {
        events: mpsc::Receiver<SseEvent>,
    },
}

enum AttemptOutcome {
    Done(ClientReply),
    Retry(GatewayError),
    Fatal(GatewayError),
}

/// End-to-end pipeline: inbound decode, channel selection, outbound
/// dispatch, streaming accumulation, retry/failover, persistence, and
/// per-attempt performance records.
pub struct RequestExecutor {
    balancer: Arc<LoadBalancer>,
    client: Arc<dyn UpstreamClient>,
    requests: Arc<RequestService>,
    perf: PerfSender,
    policy: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(
        balancer: Arc<LoadBalancer>,
        client: Arc<dyn UpstreamClient>,
        requests: Arc<RequestService>,
        perf: PerfSender,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            balancer,
            client,
            requests,
            perf,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute(
        &self,
        ctx: ExecutionContext,
        inbound_ctx: InboundContext,
        raw_body: Bytes,
    ) -> ClientReply {
        let codec = inbound(ctx.format);
        let chat_request = match codec.transform_request(&inbound_ctx, &raw_body) {
            Ok(request) => request,
            Err(error) => {
                return error_reply(ctx.format, &GatewayError::InvalidRequest(error.to_string()));
            }
        };

        let body_json: serde_json::Value =
            serde_json::from_slice(&raw_body).unwrap_or(serde_json::Value::Null);
        let request_row = match self
            .requests
            .create_request(NewRequest {
                project_id: ctx.project_id,
                api_key_id: ctx.api_key_id,
                model_id: chat_request.model.clone(),
                format: ctx.format,
                stream: chat_request.stream,
                source: ctx.source.clone(),
                trace_id: ctx.trace_id,
                body: body_json,
            })
            .await
        {
            Ok(row) => row,
            Err(error) => {
                tracing::error!(%error, "failed to create request row");
                return error_reply(ctx.format, &error);
            }
        };

        let preferred = match ctx.trace_id {
            Some(trace_id) => self.requests.last_successful_channel_id(trace_id).await,
            None => None,
        };

        let overall_deadline = Instant::now() + self.policy.overall_deadline;
        let mut excluded: Vec<i64> = Vec::new();
        let mut last_error = GatewayError::InvalidModel(chat_request.model.clone());

        for attempt in 0..self.policy.max_attempts {
            if Instant::now() >= overall_deadline {
                break;
            }
            let sticky = if attempt == 0 { preferred } else { None };
            let Some(candidate) = self.balancer.pick_preferred(
                &chat_request.model,
                sticky,
                &excluded,
                unix_ms(),
            ) else {
                break;
            };
            excluded.push(candidate.channel_id());

            match self
                .attempt(&ctx, &request_row, &chat_request, candidate, overall_deadline)
                .await
            {
                AttemptOutcome::Done(reply) => return reply,
                AttemptOutcome::Retry(error) => {
                    tracing::debug!(%error, attempt, "attempt failed; trying next channel");
                    last_error = error;
                }
                AttemptOutcome::Fatal(error) => {
                    last_error = error;
                    break;
                }
            }
        }

        if let Err(error) = self
            .requests
            .update_request_status_from_error(request_row.id, &last_error)
            .await
        {
            tracing::warn!(%error, "failed to finalize request status");
        }
        error_reply(ctx.format, &last_error)
    }

    async fn attempt(
        &self,
        ctx: &ExecutionContext,
        request_row: &requests::Model,
        chat_request: &ChatRequest,
        candidate: Candidate,
        overall_deadline: Instant,
    ) -> AttemptOutcome {
        let channel = candidate.runtime.channel.clone();
        let channel_id = channel.id;
        let start_ms = unix_ms();

        let mut guard = AttemptGuard::new(
            self.perf.clone(),
            Arc::clone(&self.requests),
            channel_id,
            ctx.api_key_id,
            start_ms,
            chat_request.stream,
            request_row.id,
        );

        let mut attempt_request = chat_request.clone();
        attempt_request.model = candidate.resolved_model.clone();

        let out_codec = outbound(channel.channel_type.api_format(), channel.endpoint());
        let mut spec = match out_codec.transform_request(&attempt_request) {
            Ok(spec) => spec,
            Err(error) => {
                guard.abandon();
                return AttemptOutcome::Fatal(GatewayError::InvalidRequest(error.to_string()));
            }
        };

        // Channel overrides run after the codec so templates win.
        apply_header_ops(&mut spec.headers, &channel.settings.header_ops);
        if !channel.settings.body_ops.is_empty()
            && let Ok(mut body) = serde_json::from_slice::<serde_json::Value>(&spec.body)
        {
            apply_body_ops(&mut body, &channel.settings.body_ops);
            if let Ok(rewritten) = serde_json::to_vec(&body) {
                spec.body = Bytes::from(rewritten);
            }
        }

        let execution = self
            .requests
            .create_execution(
                request_row,
                channel_id,
                &candidate.resolved_model,
                out_codec.format(),
                serde_json::from_slice(&spec.body).unwrap_or(serde_json::Value::Null),
            )
            .await
            .map_err(|error| tracing::warn!(%error, "failed to create execution row"))
            .ok();
        guard.execution_id = execution.as_ref().map(|row| row.id);

        let attempt_deadline = self
            .policy
            .per_attempt_deadline
            .min(overall_deadline.saturating_duration_since(Instant::now()));
        let response =
            match tokio::time::timeout(attempt_deadline, self.client.send(spec)).await {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => {
                    let retryable = channel.settings.retryable.unwrap_or(true);
                    guard.failure(&error).await;
                    return if retryable {
                        AttemptOutcome::Retry(error)
                    } else {
                        AttemptOutcome::Fatal(error)
                    };
                }
                Err(_) => {
                    let error = GatewayError::transport(
                        TransportErrorKind::Timeout,
                        "attempt deadline exceeded",
                    );
                    guard.failure(&error).await;
                    return AttemptOutcome::Retry(error);
                }
            };

        if !(200..300).contains(&response.status) {
            let body = match response.body {
                UpstreamBody::Bytes(bytes) => bytes,
                UpstreamBody::Stream(_) => Bytes::new(),
            };
            let error = out_codec.transform_error(response.status, body);
            guard.failure(&error).await;
            let retryable = channel.settings.retryable.unwrap_or(true)
                && self.policy.is_retryable_status(response.status);
            return if retryable {
                AttemptOutcome::Retry(error)
            } else {
                AttemptOutcome::Fatal(error)
            };
        }

        if chat_request.stream {
            self.stream_attempt(
                ctx,
                request_row,
                execution,
                chat_request,
                attempt_request,
                out_codec.start_stream(),
                response,
                guard,
            )
            .await
        } else {
            self.unary_attempt(
                ctx,
                request_row,
                execution,
                out_codec.as_ref(),
                response,
                guard,
            )
            .await
        }
    }

    async fn unary_attempt(
        &self,
        ctx: &ExecutionContext,
        request_row: &requests::Model,
        execution: Option<request_executions::Model>,
        out_codec: &dyn axonhub_transform::OutboundTransformer,
        response: UpstreamResponse,
        guard: AttemptGuard,
    ) -> AttemptOutcome {
        let body = match response.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(mut rx) => {
                // Unary call answered with a stream body: drain it whole.
                let mut collected = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    collected.extend_from_slice(&chunk);
                }
                Bytes::from(collected)
            }
        };
        let unified = match out_codec.transform_response(&body) {
            Ok(unified) => unified,
            Err(error) => {
                let error = GatewayError::InternalStorage(error.to_string());
                guard.failure(&error).await;
                return AttemptOutcome::Retry(error);
            }
        };

        let metrics = CompletionMetrics {
            duration_ms: unix_ms() - guard.start_ms,
            first_token_ms: None,
            usage: unified.usage,
        };
        let external_id = Some(unified.id.clone()).filter(|id| !id.is_empty());
        if let Some(execution) = &execution
            && let Err(error) = self
                .requests
                .update_execution_completed(
                    request_row,
                    execution,
                    external_id.clone(),
                    &unified,
                    metrics,
                )
                .await
        {
            tracing::warn!(%error, "failed to persist execution completion");
        }
        if let Err(error) = self
            .requests
            .update_request_completed(request_row, guard.channel_id, external_id, &unified, metrics)
            .await
        {
            tracing::warn!(%error, "failed to persist request completion");
        }
        guard.success(&unified.usage);

        match inbound(ctx.format).transform_response(&unified) {
            Ok(body) => AttemptOutcome::Done(ClientReply::Unary { status: 200, body }),
            Err(error) => {
                AttemptOutcome::Fatal(GatewayError::InternalStorage(error.to_string()))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_attempt(
        &self,
        ctx: &ExecutionContext,
        request_row: &requests::Model,
        execution: Option<request_executions::Model>,
        chat_request: &ChatRequest,
        attempt_request: ChatRequest,
        mut decoder: Box<dyn OutboundStreamDecoder>,
        response: UpstreamResponse,
        mut guard: AttemptGuard,
    ) -> AttemptOutcome {
        let UpstreamBody::Stream(mut byte_rx) = response.body else {
            let error = GatewayError::transport(
                TransportErrorKind::Other,
                "upstream answered a stream request without a stream",
            );
            guard.failure(&error).await;
            return AttemptOutcome::Retry(error);
        };

        let in_codec = inbound(ctx.format);
        let mut encoder = in_codec.start_stream(chat_request);
        let mut accumulator = StreamAccumulator::new();
        let mut parser = SseParser::new();
        let mut pending: Vec<SseEvent> = Vec::new();
        let mut stored: Vec<StoredChunk> = Vec::new();
        let mut upstream_done = false;

        // Hold the stream back until the first content-bearing delta: an
        // empty stream inside the first-token window still fails over.
        let first_token_deadline = Instant::now() + self.policy.first_token_deadline;
        while guard.first_token_ms.is_none() && !upstream_done {
            let remaining = first_token_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, byte_rx.recv()).await {
                Err(_) => break,
                Ok(None) => upstream_done = true,
                Ok(Some(bytes)) => {
                    for event in parser.push_bytes(&bytes) {
                        if let Err(error) = process_event(
                            &event,
                            decoder.as_mut(),
                            encoder.as_mut(),
                            &mut accumulator,
                            &mut guard,
                            &mut pending,
                            &mut stored,
                        ) {
                            tracing::debug!(%error, "skipping malformed stream event");
                        }
                    }
                }
            }
        }

        if guard.first_token_ms.is_none() && !upstream_done {
            let error = GatewayError::transport(
                TransportErrorKind::ReadTimeout,
                "no stream output before the first-token deadline",
            );
            guard.failure(&error).await;
            return AttemptOutcome::Retry(error);
        }
        if guard.first_token_ms.is_none() && upstream_done && stored.is_empty() {
            let error = GatewayError::transport(
                TransportErrorKind::Other,
                "upstream stream closed without emitting events",
            );
            guard.failure(&error).await;
            return AttemptOutcome::Retry(error);
        }

        let (tx, rx) = mpsc::channel::<SseEvent>(32);
        let requests = Arc::clone(&self.requests);
        let request_row = request_row.clone();
        let fallback_model = attempt_request.model.clone();
        tokio::spawn(async move {
            for event in pending.drain(..) {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if !upstream_done {
                loop {
                    let Some(bytes) = byte_rx.recv().await else {
                        break;
                    };
                    let events = parser.push_bytes(&bytes);
                    let mut client_events = Vec::new();
                    for event in events {
                        if let Err(error) = process_event(
                            &event,
                            decoder.as_mut(),
                            encoder.as_mut(),
                            &mut accumulator,
                            &mut guard,
                            &mut client_events,
                            &mut stored,
                        ) {
                            tracing::debug!(%error, "skipping malformed stream event");
                        }
                    }
                    for event in client_events {
                        if tx.send(event).await.is_err() {
                            // Client went away: the armed guard records the
                            // cancellation when it drops.
                            return;
                        }
                    }
                }
                for event in parser.finish() {
                    let mut client_events = Vec::new();
                    let _ = process_event(
                        &event,
                        decoder.as_mut(),
                        encoder.as_mut(),
                        &mut accumulator,
                        &mut guard,
                        &mut client_events,
                        &mut stored,
                    );
                    for event in client_events {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }

            let usage = accumulator.usage();
            let unified = accumulator.finish(&fallback_model, unix_ms() / 1000);
            match encoder.finish(&unified) {
                Ok(events) => {
                    for event in events {
                        stored.push(StoredChunk {
                            last_event_id: event.id.clone(),
                            event: event.event.clone(),
                            data: event.data.clone(),
                        });
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(error) => tracing::warn!(%error, "failed to encode stream tail"),
            }

            // Chunk writes happen once at end of stream; failures are logged
            // and swallowed since the client already has the data.
            if let Err(error) = requests.save_request_chunks(&request_row, &stored).await {
                tracing::warn!(%error, "failed to persist response chunks");
            }
            if let Some(execution) = &execution {
                if let Err(error) = requests
                    .save_execution_chunks(&request_row, execution, &stored)
                    .await
                {
                    tracing::warn!(%error, "failed to persist execution chunks");
                }
            }

            let metrics = CompletionMetrics {
                duration_ms: unix_ms() - guard.start_ms,
                first_token_ms: guard.first_token_ms.map(|at| at - guard.start_ms),
                usage,
            };
            let external_id = Some(unified.id.clone()).filter(|id| !id.is_empty());
            if let Some(execution) = &execution
                && let Err(error) = requests
                    .update_execution_completed(
                        &request_row,
                        execution,
                        external_id.clone(),
                        &unified,
                        metrics,
                    )
                    .await
            {
                tracing::warn!(%error, "failed to persist execution completion");
            }
            if let Err(error) = requests
                .update_request_completed(
                    &request_row,
                    guard.channel_id,
                    external_id,
                    &unified,
                    metrics,
                )
                .await
            {
                tracing::warn!(%error, "failed to persist request completion");
            }
            guard.success(&usage);
        });

        AttemptOutcome::Done(ClientReply::Stream { events: rx })
    }
}

/// Decode one upstream SSE event, mirror it into the accumulator, and
/// encode the client-bound events.
fn process_event(
    event: &SseEvent,
    decoder: &mut dyn OutboundStreamDecoder,
    encoder: &mut dyn InboundStreamEncoder,
    accumulator: &mut StreamAccumulator,
    guard: &mut AttemptGuard,
    client_events: &mut Vec<SseEvent>,
    stored: &mut Vec<StoredChunk>,
) -> Result<(), axonhub_transform::TransformError> {
    for chunk in decoder.decode(event)? {
        if accumulator.push(&chunk) && guard.first_token_ms.is_none() {
            guard.first_token_ms = Some(unix_ms());
        }
        if chunk.done {
            continue;
        }
        for encoded in encoder.encode(&chunk)? {
            stored.push(StoredChunk {
                last_event_id: encoded.id.clone(),
                event: encoded.event.clone(),
                data: encoded.data.clone(),
            });
            client_events.push(encoded);
        }
    }
    Ok(())
}

fn error_reply(format: ApiFormat, error: &GatewayError) -> ClientReply {
    let (status, body) = inbound(format).transform_error(error);
    ClientReply::Unary { status, body }
}

pub(crate) fn unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Per-attempt bookkeeping. While armed, dropping the guard records a
/// cancellation: the selection-time request count is handed back and no
/// time slot is written.
struct AttemptGuard {
    perf: PerfSender,
    requests: Arc<RequestService>,
    channel_id: i64,
    api_key_id: i64,
    start_ms: i64,
    stream: bool,
    request_id: i64,
    execution_id: Option<i64>,
    first_token_ms: Option<i64>,
    armed: bool,
}

impl AttemptGuard {
    #[allow(clippy::too_many_arguments)]
    fn new(
        perf: PerfSender,
        requests: Arc<RequestService>,
        channel_id: i64,
        api_key_id: i64,
        start_ms: i64,
        stream: bool,
        request_id: i64,
    ) -> Self {
        Self {
            perf,
            requests,
            channel_id,
            api_key_id,
            start_ms,
            stream,
            request_id,
            execution_id: None,
            first_token_ms: None,
            armed: true,
        }
    }

    fn record(&self, success: bool, canceled: bool, tokens: i64, status: Option<u16>) {
        self.perf.send(PerformanceRecord {
            channel_id: self.channel_id,
            start_time_ms: self.start_ms,
            end_time_ms: unix_ms(),
            first_token_time_ms: self.first_token_ms,
            stream: self.stream,
            success,
            canceled,
            token_count: tokens,
            error_status_code: status,
            api_key_id: Some(self.api_key_id),
        });
    }

    fn success(mut self, usage: &Option<axonhub_protocol::unified::Usage>) {
        self.armed = false;
        let tokens = usage.map(|usage| usage.total_tokens).unwrap_or(0);
        self.record(true, false, tokens, None);
    }

    async fn failure(mut self, error: &GatewayError) {
        self.armed = false;
        self.record(false, false, 0, error.upstream_status_code());
        if let Some(execution_id) = self.execution_id
            && let Err(persist_error) = self
                .requests
                .update_execution_status_from_error(execution_id, error)
                .await
        {
            tracing::warn!(%persist_error, "failed to persist execution failure");
        }
    }

    /// Forget the selection without recording anything beyond the
    /// cancellation-style decrement.
    fn abandon(mut self) {
        self.armed = false;
        self.record(false, true, 0, None);
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Client went away mid-flight: reverse the selection bump and mark
        // the rows canceled off-task.
        self.record(false, true, 0, None);
        let requests = Arc::clone(&self.requests);
        let request_id = self.request_id;
        let execution_id = self.execution_id;
        tokio::spawn(async move {
            let canceled = GatewayError::Canceled;
            if let Some(execution_id) = execution_id {
                let _ = requests
                    .update_execution_status_from_error(execution_id, &canceled)
                    .await;
            }
            let _ = requests
                .update_request_status_from_error(request_id, &canceled)
                .await;
        });
    }
}
