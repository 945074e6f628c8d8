use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use crate::perf::PerformanceRecord;

pub const DEFAULT_WINDOW_SECS: i64 = 600;

/// One per-second aggregation slot inside the sliding window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricSlot {
    pub ts: i64,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub token_count: i64,
    pub request_latency_ms: i64,
    pub first_token_latency_ms: i64,
}

/// Rolling totals for one channel. `request_count` includes selections that
/// have not completed yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatedMetrics {
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub total_token_count: i64,
    pub total_request_latency_ms: i64,
    pub total_first_token_latency_ms: i64,
    /// Unix millis; 0 means never.
    pub last_selected_at: i64,
    pub last_failure_at: i64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
pub struct ChannelMetrics {
    slots: VecDeque<MetricSlot>,
    pub aggregated: AggregatedMetrics,
}

impl ChannelMetrics {
    fn slot_mut(&mut self, ts: i64) -> &mut MetricSlot {
        // Records arrive in enqueue order, so the matching slot is almost
        // always the newest one.
        if let Some(position) = self.slots.iter().rposition(|slot| slot.ts == ts) {
            return &mut self.slots[position];
        }
        let insert_at = self
            .slots
            .iter()
            .rposition(|slot| slot.ts < ts)
            .map(|position| position + 1)
            .unwrap_or(0);
        self.slots.insert(
            insert_at,
            MetricSlot {
                ts,
                ..MetricSlot::default()
            },
        );
        &mut self.slots[insert_at]
    }

    fn evict_expired(&mut self, window_secs: i64) {
        let Some(newest) = self.slots.back().map(|slot| slot.ts) else {
            return;
        };
        while let Some(front) = self.slots.front() {
            if newest - front.ts < window_secs {
                break;
            }
            let evicted = self.slots.pop_front().expect("front checked above");
            let agg = &mut self.aggregated;
            agg.request_count -= evicted.request_count;
            agg.success_count -= evicted.success_count;
            agg.failure_count -= evicted.failure_count;
            agg.total_token_count -= evicted.token_count;
            agg.total_request_latency_ms -= evicted.request_latency_ms;
            agg.total_first_token_latency_ms -= evicted.first_token_latency_ms;
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_sum(&self, field: impl Fn(&MetricSlot) -> i64) -> i64 {
        self.slots.iter().map(field).sum()
    }
}

/// Per-channel metrics map. The map itself takes a RW lock; individual
/// channel entries are mutated under their own short-held mutex, with the
/// recorder task as the only writer of completion data.
pub struct MetricsHub {
    window_secs: i64,
    inner: RwLock<HashMap<i64, Arc<Mutex<ChannelMetrics>>>>,
}

impl Default for MetricsHub {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SECS)
    }
}

impl MetricsHub {
    pub fn new(window_secs: i64) -> Self {
        Self {
            window_secs,
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, channel_id: i64) -> Arc<Mutex<ChannelMetrics>> {
        if let Some(entry) = self
            .inner
            .read()
            .expect("metrics map lock poisoned")
            .get(&channel_id)
        {
            return Arc::clone(entry);
        }
        let mut map = self.inner.write().expect("metrics map lock poisoned");
        Arc::clone(map.entry(channel_id).or_default())
    }

    /// Selection-time bump so burst arrivals spread across channels.
    pub fn mark_selected(&self, channel_id: i64, now_ms: i64) {
        let entry = self.entry(channel_id);
        let mut metrics = entry.lock().expect("channel metrics lock poisoned");
        metrics.aggregated.request_count += 1;
        metrics.aggregated.last_selected_at = now_ms;
    }

    /// Reverses a selection bump for a call canceled before completion.
    /// No slot is written.
    pub fn mark_canceled(&self, channel_id: i64) {
        let entry = self.entry(channel_id);
        let mut metrics = entry.lock().expect("channel metrics lock poisoned");
        if metrics.aggregated.request_count > 0 {
            metrics.aggregated.request_count -= 1;
        }
    }

    /// Apply one completed attempt. Called only from the recorder task.
    pub fn record(&self, record: &PerformanceRecord) {
        if record.canceled {
            self.mark_canceled(record.channel_id);
            return;
        }
        let entry = self.entry(record.channel_id);
        let mut metrics = entry.lock().expect("channel metrics lock poisoned");
        let slot_ts = record.end_time_ms / 1000;
        let latency_ms = (record.end_time_ms - record.start_time_ms).max(0);
        let first_token_ms = record
            .first_token_time_ms
            .filter(|_| record.stream)
            .map(|ft| (ft - record.start_time_ms).max(0))
            .unwrap_or(0);

        let slot = metrics.slot_mut(slot_ts);
        // The selection bump already counted this request in the aggregate;
        // the slot write reconciles it without double counting.
        slot.request_count += 1;
        if record.success {
            slot.success_count += 1;
            slot.token_count += record.token_count;
            slot.request_latency_ms += latency_ms;
            slot.first_token_latency_ms += first_token_ms;
        } else {
            slot.failure_count += 1;
        }

        let agg = &mut metrics.aggregated;
        if record.success {
            agg.success_count += 1;
            agg.total_token_count += record.token_count;
            agg.total_request_latency_ms += latency_ms;
            agg.total_first_token_latency_ms += first_token_ms;
            agg.consecutive_failures = 0;
        } else {
            agg.failure_count += 1;
            agg.consecutive_failures += 1;
            agg.last_failure_at = record.end_time_ms;
        }

        metrics.evict_expired(self.window_secs);
    }

    pub fn snapshot(&self, channel_id: i64) -> AggregatedMetrics {
        let entry = self.entry(channel_id);
        let metrics = entry.lock().expect("channel metrics lock poisoned");
        metrics.aggregated
    }

    /// Drop metrics for channels no longer present in the registry.
    pub fn retain(&self, live: &[i64]) {
        let mut map = self.inner.write().expect("metrics map lock poisoned");
        map.retain(|id, _| live.contains(id));
    }

    /// Test/inspection hook: run a closure against one channel's metrics.
    pub fn with_metrics<T>(&self, channel_id: i64, f: impl FnOnce(&ChannelMetrics) -> T) -> T {
        let entry = self.entry(channel_id);
        let metrics = entry.lock().expect("channel metrics lock poisoned");
        f(&metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(channel_id: i64, end_ms: i64, tokens: i64) -> PerformanceRecord {
        PerformanceRecord {
            channel_id,
            start_time_ms: end_ms - 250,
            end_time_ms: end_ms,
            first_token_time_ms: None,
            stream: false,
            success: true,
            canceled: false,
            token_count: tokens,
            error_status_code: None,
            api_key_id: None,
        }
    }

    fn failure(channel_id: i64, end_ms: i64, status: u16) -> PerformanceRecord {
        PerformanceRecord {
            success: false,
            error_status_code: Some(status),
            token_count: 0,
            ..success(channel_id, end_ms, 0)
        }
    }

    #[test]
    fn selection_bump_reconciles_at_completion() {
        let hub = MetricsHub::default();
        hub.mark_selected(1, 1_000);
        hub.record(&success(1, 1_000, 5));
        let agg = hub.snapshot(1);
        assert_eq!(agg.request_count, 1);
        assert_eq!(agg.success_count, 1);
        assert_eq!(agg.total_token_count, 5);
        hub.with_metrics(1, |m| {
            assert_eq!(m.slot_sum(|s| s.request_count), 1);
        });
    }

    #[test]
    fn cancel_reverses_selection_without_a_slot() {
        let hub = MetricsHub::default();
        hub.mark_selected(1, 1_000);
        hub.mark_canceled(1);
        let agg = hub.snapshot(1);
        assert_eq!(agg.request_count, 0);
        hub.with_metrics(1, |m| assert_eq!(m.slot_count(), 0));
    }

    #[test]
    fn failures_track_consecutive_count() {
        let hub = MetricsHub::default();
        for n in 0..3 {
            hub.mark_selected(1, 1_000 + n);
            hub.record(&failure(1, 1_000 + n, 503));
        }
        let agg = hub.snapshot(1);
        assert_eq!(agg.consecutive_failures, 3);
        hub.mark_selected(1, 2_000);
        hub.record(&success(1, 2_000, 1));
        assert_eq!(hub.snapshot(1).consecutive_failures, 0);
    }

    #[test]
    fn eviction_preserves_conservation() {
        let hub = MetricsHub::new(10);
        for second in 0..25i64 {
            let end_ms = second * 1_000;
            hub.mark_selected(1, end_ms);
            hub.record(&success(1, end_ms, 2));
        }
        let agg = hub.snapshot(1);
        hub.with_metrics(1, |m| {
            assert_eq!(agg.request_count, m.slot_sum(|s| s.request_count));
            assert_eq!(agg.success_count, m.slot_sum(|s| s.success_count));
            assert_eq!(agg.total_token_count, m.slot_sum(|s| s.token_count));
            assert!(m.slot_count() <= 10);
        });
    }

    #[test]
    fn pending_selection_shows_in_aggregate_only() {
        let hub = MetricsHub::default();
        hub.mark_selected(1, 5_000);
        hub.mark_selected(1, 5_001);
        hub.record(&success(1, 5_100, 1));
        let agg = hub.snapshot(1);
        hub.with_metrics(1, |m| {
            assert_eq!(agg.request_count, m.slot_sum(|s| s.request_count) + 1);
        });
    }
}
