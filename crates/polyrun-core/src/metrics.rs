//! Metric snapshot types.
//!
//! Read-only, serializable snapshots captured on demand. Updates inside the
//! running system are best-effort; callers needing exact counts serialize
//! themselves. Nothing here is persisted across process restarts.

use crate::types::{Capability, RuntimeKind, TrustLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-back-end status counters, reported through the back-end contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendStatus {
    /// Modules currently compiled and resident
    pub modules: usize,
    /// Instances currently live
    pub live_instances: usize,
    /// Executions started over the back-end lifetime
    pub total_executions: u64,
    /// Executions that failed (error, timeout, memory)
    pub failed_executions: u64,
    /// Average execution time across completed executions, milliseconds
    pub avg_execution_time_ms: f64,
}

/// Aggregated scheduler counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    /// Scheduled executions over the controller lifetime
    pub total_executions: u64,
    /// Executions dispatched per runtime
    pub per_runtime_distribution: BTreeMap<RuntimeKind, u64>,
    /// Average end-to-end latency per runtime, milliseconds
    pub per_runtime_avg_latency_ms: BTreeMap<RuntimeKind, f64>,
    /// Success rate per runtime in `[0, 1]`
    pub per_runtime_success_rate: BTreeMap<RuntimeKind, f64>,
}

/// Per-trust-level cordon counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CordonPoolMetrics {
    /// Workers currently alive (idle + busy)
    pub total: usize,
    /// Workers currently executing
    pub active: usize,
    /// Workers currently idle
    pub idle: usize,
    /// Executions served by this cordon over its lifetime
    pub total_executions: u64,
}

/// Cordon metrics across all trust levels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CordonMetrics {
    /// Per-trust-level pool counters
    pub per_trust_level: BTreeMap<TrustLevel, CordonPoolMetrics>,
}

/// Capability check engine counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityCheckMetrics {
    /// Checks performed
    pub total: u64,
    /// Checks denied
    pub denied: u64,
    /// Checks performed per capability
    pub by_capability: BTreeMap<Capability, u64>,
}

/// OS sandbox counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSandboxMetrics {
    /// Namespace handles currently attached
    pub active_namespaces: usize,
    /// Syscall filter profiles installed
    pub profiles: usize,
}

/// Security layer snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityMetrics {
    /// Layer A: cordon pools
    pub process_isolation: CordonMetrics,
    /// Layer D: capability checks
    pub capability_checks: CapabilityCheckMetrics,
    /// Layer C: OS sandbox
    pub system_sandbox: SystemSandboxMetrics,
}

/// Top-level controller snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerMetrics {
    /// Whether back-ends have been initialized
    pub initialized: bool,
    /// Runtime kinds registered and available
    pub available_runtimes: Vec<RuntimeKind>,
    /// Queue bound
    pub queue_size: usize,
    /// Submissions waiting for a queue slot
    pub queue_pending: usize,
    /// Scheduler counters
    pub scheduler: SchedulerMetrics,
    /// When the snapshot was captured
    pub captured_at: DateTime<Utc>,
}

impl ControllerMetrics {
    /// Creates a snapshot stamped with the current time.
    #[must_use]
    pub fn new(
        initialized: bool,
        available_runtimes: Vec<RuntimeKind>,
        queue_size: usize,
        queue_pending: usize,
        scheduler: SchedulerMetrics,
    ) -> Self {
        Self {
            initialized,
            available_runtimes,
            queue_size,
            queue_pending,
            scheduler,
            captured_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let scheduler = SchedulerMetrics {
            total_executions: 7,
            per_runtime_distribution: BTreeMap::from([
                (RuntimeKind::Wasm, 5),
                (RuntimeKind::Ebpf, 2),
            ]),
            ..SchedulerMetrics::default()
        };

        let metrics = ControllerMetrics::new(
            true,
            vec![RuntimeKind::Wasm, RuntimeKind::Ebpf],
            100,
            0,
            scheduler,
        );

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["initialized"], true);
        assert_eq!(json["scheduler"]["total_executions"], 7);
        assert_eq!(json["scheduler"]["per_runtime_distribution"]["wasm"], 5);
    }

    #[test]
    fn test_security_metrics_default_is_empty() {
        let metrics = SecurityMetrics::default();
        assert_eq!(metrics.capability_checks.total, 0);
        assert!(metrics.process_isolation.per_trust_level.is_empty());
    }
}
