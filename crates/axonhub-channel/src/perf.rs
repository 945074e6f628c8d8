use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::metrics::MetricsHub;
use crate::policy::{AutoDisablePolicy, DisableDecision, ErrorCounters};
use crate::registry::ChannelRegistry;

/// Per-attempt outcome fed to the metrics writer. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceRecord {
    pub channel_id: i64,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub first_token_time_ms: Option<i64>,
    pub stream: bool,
    pub success: bool,
    pub canceled: bool,
    pub token_count: i64,
    pub error_status_code: Option<u16>,
    pub api_key_id: Option<i64>,
}

const QUEUE_DEPTH_WARN: usize = 10_000;

/// Unbounded handle into the recorder queue. Sends never block the request
/// path; when the queue backs up we log and keep draining.
#[derive(Clone)]
pub struct PerfSender {
    tx: mpsc::UnboundedSender<PerformanceRecord>,
    depth: Arc<AtomicUsize>,
}

impl PerfSender {
    pub fn send(&self, record: PerformanceRecord) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > QUEUE_DEPTH_WARN {
            tracing::warn!(depth, "performance record queue is backing up");
        }
        if self.tx.send(record).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!("performance recorder stopped; dropping record");
        }
    }
}

/// Single writer task draining the performance queue. Serializes all
/// per-channel metrics mutation and applies the auto-disable policy.
pub struct PerformanceRecorder {
    handle: JoinHandle<()>,
}

impl PerformanceRecorder {
    pub fn start(
        metrics: Arc<MetricsHub>,
        counters: Arc<ErrorCounters>,
        policy: AutoDisablePolicy,
        registry: Arc<ChannelRegistry>,
    ) -> (PerfSender, Self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PerformanceRecord>();
        let depth = Arc::new(AtomicUsize::new(0));
        let sender = PerfSender {
            tx,
            depth: Arc::clone(&depth),
        };

        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                depth.fetch_sub(1, Ordering::Relaxed);
                metrics.record(&record);
                if record.canceled {
                    continue;
                }
                if record.success {
                    counters.on_success(record.channel_id, record.api_key_id);
                    continue;
                }
                let Some(status) = record.error_status_code else {
                    continue;
                };
                match counters.on_failure(&policy, record.channel_id, record.api_key_id, status) {
                    DisableDecision::Keep => {}
                    DisableDecision::Disable { status } => {
                        let reason = format!(
                            "auto-disabled after repeated {status} {}",
                            status_text(status)
                        );
                        tracing::warn!(
                            channel_id = record.channel_id,
                            status,
                            "disabling channel on error budget exhaustion"
                        );
                        if let Err(error) =
                            registry.disable_channel(record.channel_id, &reason).await
                        {
                            tracing::error!(
                                channel_id = record.channel_id,
                                %error,
                                "failed to persist channel disable"
                            );
                        }
                    }
                }
            }
        });

        (sender, Self { handle })
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

fn status_text(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("error")
}
