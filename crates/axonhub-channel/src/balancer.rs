use std::sync::Arc;

use crate::metrics::MetricsHub;
use crate::registry::{ChannelRegistry, ChannelRuntime};

/// One selectable (channel, resolved model) pair.
pub struct Candidate {
    pub runtime: Arc<ChannelRuntime>,
    pub resolved_model: String,
}

impl Candidate {
    pub fn channel_id(&self) -> i64 {
        self.runtime.id()
    }
}

/// Picks channels for a requested model.
///
/// Tie-break order: higher priority, fewer consecutive failures, lower live
/// request count, least recently selected. Picking bumps the winner's
/// request count so concurrent arrivals fan out.
pub struct LoadBalancer {
    registry: Arc<ChannelRegistry>,
    metrics: Arc<MetricsHub>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<ChannelRegistry>, metrics: Arc<MetricsHub>) -> Self {
        Self { registry, metrics }
    }

    pub fn metrics(&self) -> &Arc<MetricsHub> {
        &self.metrics
    }

    /// Number of channels currently able to serve the model.
    pub fn eligible_count(&self, model: &str) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|runtime| runtime.is_model_supported(model))
            .count()
    }

    /// Pick the best candidate, skipping `exclude` (already-attempted or
    /// known-bad channels). Re-reads the snapshot so channels disabled
    /// mid-flight drop out between attempts.
    pub fn pick(&self, model: &str, exclude: &[i64], now_ms: i64) -> Option<Candidate> {
        self.pick_preferred(model, None, exclude, now_ms)
    }

    /// Like `pick`, but a still-eligible preferred channel (sticky routing)
    /// wins outright.
    pub fn pick_preferred(
        &self,
        model: &str,
        preferred: Option<i64>,
        exclude: &[i64],
        now_ms: i64,
    ) -> Option<Candidate> {
        let snapshot = self.registry.snapshot();

        if let Some(preferred) = preferred
            && !exclude.contains(&preferred)
            && let Some(runtime) = snapshot.get(preferred)
            && let Ok(resolved_model) = runtime.choose_model(model)
        {
            self.metrics.mark_selected(preferred, now_ms);
            return Some(Candidate {
                runtime,
                resolved_model,
            });
        }

        let mut best: Option<(Arc<ChannelRuntime>, String, SortKey)> = None;
        for runtime in snapshot.iter() {
            if exclude.contains(&runtime.id()) {
                continue;
            }
            let Ok(resolved_model) = runtime.choose_model(model) else {
                continue;
            };
            let aggregated = self.metrics.snapshot(runtime.id());
            let key = SortKey {
                priority: runtime.channel.settings.priority,
                consecutive_failures: aggregated.consecutive_failures,
                request_count: aggregated.request_count,
                last_selected_at: aggregated.last_selected_at,
            };
            let replace = match &best {
                None => true,
                Some((_, _, current)) => key.beats(current),
            };
            if replace {
                best = Some((Arc::clone(runtime), resolved_model, key));
            }
        }

        let (runtime, resolved_model, _) = best?;
        self.metrics.mark_selected(runtime.id(), now_ms);
        Some(Candidate {
            runtime,
            resolved_model,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SortKey {
    priority: i32,
    consecutive_failures: u32,
    request_count: i64,
    last_selected_at: i64,
}

impl SortKey {
    fn beats(&self, other: &SortKey) -> bool {
        (
            std::cmp::Reverse(self.priority),
            self.consecutive_failures,
            self.request_count,
            self.last_selected_at,
        ) < (
            std::cmp::Reverse(other.priority),
            other.consecutive_failures,
            other.request_count,
            other.last_selected_at,
        )
    }
}
