pub mod balancer;
pub mod channel;
pub mod metrics;
pub mod overrides;
pub mod perf;
pub mod policy;
pub mod probe;
pub mod registry;

pub use balancer::{Candidate, LoadBalancer};
pub use channel::{
    Channel, ChannelCredentials, ChannelSettings, ChannelStatus, ChannelType, ModelError,
};
pub use metrics::{AggregatedMetrics, MetricsHub};
pub use overrides::{
    MergeOverrideError, OverrideOp, apply_body_ops, apply_header_ops, merge_override_ops,
    parse_legacy_headers, parse_legacy_parameters, validate_body_ops,
};
pub use perf::{PerfSender, PerformanceRecord, PerformanceRecorder};
pub use probe::{build_probe_request, evaluate_probe};
pub use policy::{AutoDisablePolicy, DisableDecision, ErrorCounters, RetryPolicy, StatusRule};
pub use registry::{ChannelRegistry, ChannelRuntime, ChannelSnapshot, ChannelSource};
