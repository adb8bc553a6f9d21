//! Intelligent scheduler: profile → history → select → run.
//!
//! Drives one execution end to end on the chosen back-end: compile,
//! instantiate, security setup, execute, history recording, destroy,
//! security teardown. Destroy and teardown run on every exit path after
//! compile succeeds, and every outcome, including failures, lands in
//! the history ring so the selector can learn from it.
//!
//! A back-end that rejects the task's language at compile time is
//! excluded and selection is retried, so a decision that looked right on
//! paper degrades into the language-compatibility rule instead of
//! failing the call.

use crate::history::{ExecutionHistory, task_shape_key};
use crate::profiler::profile_task;
use crate::selector::{CandidateRuntime, RuntimeSelector};
use chrono::Utc;
use polyrun_backends::{Backend, BackendRegistry};
use polyrun_core::{
    Error, ExecutionConfig, ExecutionResult, HistoryEntry, Result, RuntimeKind,
    SchedulerMetrics, SchedulingDecision, Task,
};
use polyrun_security::SecurityCoordinator;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Per-runtime dispatch counters.
#[derive(Debug, Default, Clone, Copy)]
struct RuntimeCounter {
    executions: u64,
    successes: u64,
    total_latency_ms: u64,
}

/// The intelligent scheduler.
pub struct Scheduler {
    registry: Arc<BackendRegistry>,
    selector: RuntimeSelector,
    history: ExecutionHistory,
    security: Arc<SecurityCoordinator>,
    total_executions: AtomicU64,
    counters: Mutex<std::collections::BTreeMap<RuntimeKind, RuntimeCounter>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field(
                "total_executions",
                &self.total_executions.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates the scheduler over a registry and security coordinator.
    #[must_use]
    pub fn new(registry: Arc<BackendRegistry>, security: Arc<SecurityCoordinator>) -> Self {
        Self {
            registry,
            selector: RuntimeSelector,
            history: ExecutionHistory::default(),
            security,
            total_executions: AtomicU64::new(0),
            counters: Mutex::new(std::collections::BTreeMap::new()),
        }
    }

    fn candidates(&self) -> Vec<CandidateRuntime> {
        self.registry
            .iter()
            .map(|backend| CandidateRuntime {
                kind: backend.kind(),
                cold_start: backend.nominal_cold_start(),
                memory_ceiling_bytes: backend.memory_ceiling_bytes(),
                languages: backend.supported_languages().to_vec(),
                all_languages: backend.supports_all_languages(),
            })
            .collect()
    }

    /// Runs the selection procedure without executing anything.
    pub fn decide(&self, task: &Task, config: &ExecutionConfig) -> Result<SchedulingDecision> {
        let profile = profile_task(task);
        let stats = self.history.stats_for(&task_shape_key(task));
        self.selector.select(
            profile,
            task,
            config,
            &stats,
            &self.candidates(),
            &BTreeSet::new(),
        )
    }

    /// Schedules and runs one task end to end.
    pub async fn run(
        &self,
        task: &Task,
        config: &ExecutionConfig,
    ) -> Result<(ExecutionResult, RuntimeKind)> {
        config.validate()?;
        if task.code.trim().is_empty() {
            return Err(Error::invalid_input("code must not be empty"));
        }

        let profile = profile_task(task);
        let shape_key = task_shape_key(task);
        let stats = self.history.stats_for(&shape_key);
        let candidates = self.candidates();
        let started = Instant::now();

        // A compile-time language rejection excludes the runtime and
        // re-enters selection; every other failure surfaces.
        let mut excluded = BTreeSet::new();
        let (backend, decision, module_id) = loop {
            let decision = self.selector.select(
                profile,
                task,
                config,
                &stats,
                &candidates,
                &excluded,
            )?;
            let backend = self.registry.get(decision.runtime).ok_or_else(|| {
                Error::NoRuntimeAvailable {
                    reason: format!("runtime '{}' is not registered", decision.runtime),
                }
            })?;
            tracing::debug!(
                runtime = %decision.runtime,
                confidence = decision.confidence,
                reason = %decision.reason,
                "runtime selected"
            );

            match backend.compile(task.code.as_bytes(), task.language).await {
                Ok(module_id) => break (backend, decision, module_id),
                Err(err) if err.is_unsupported_language() => {
                    tracing::debug!(
                        runtime = %decision.runtime,
                        "runtime rejected the language, re-selecting"
                    );
                    excluded.insert(decision.runtime);
                }
                Err(err) => return Err(err),
            }
        };
        let runtime = decision.runtime;

        let instance_id = backend.instantiate(module_id).await?;

        // Security context spans exactly the execute call.
        let mut ctx = match self
            .security
            .create_security_context(&config.permissions)
            .await
        {
            Ok(ctx) => ctx,
            Err(err) => {
                let _ = backend.destroy(instance_id).await;
                return Err(err);
            }
        };

        let outcome = backend.execute(instance_id, config).await;

        // Record the outcome, success or not, before anything can unwind.
        let total_time_ms = started.elapsed().as_millis() as u64;
        let (success, execution_time_ms, memory_used_bytes) = match &outcome {
            Ok(result) => (
                result.success,
                result.execution_time_ms,
                result.memory_used_bytes,
            ),
            Err(_) => (false, 0, 0),
        };
        self.history.record(HistoryEntry {
            task_shape_key: shape_key,
            runtime,
            success,
            execution_time_ms,
            total_time_ms,
            memory_used_bytes,
            timestamp: Utc::now(),
        });
        self.bump_counters(runtime, success, total_time_ms);

        if !success {
            ctx.mark_execution_failed();
        }
        if let Err(err) = backend.destroy(instance_id).await {
            tracing::warn!(instance = %instance_id, error = %err, "destroy after execute failed");
        }
        self.security.teardown(ctx);

        let result = outcome?;
        Ok((result, runtime))
    }

    fn bump_counters(&self, runtime: RuntimeKind, success: bool, latency_ms: u64) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters.entry(runtime).or_default();
        counter.executions += 1;
        if success {
            counter.successes += 1;
        }
        counter.total_latency_ms += latency_ms;
    }

    /// The execution history, for inspection and tests.
    #[must_use]
    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    /// Scheduler counters snapshot.
    #[must_use]
    pub fn metrics(&self) -> SchedulerMetrics {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let mut metrics = SchedulerMetrics {
            total_executions: self.total_executions.load(Ordering::Relaxed),
            ..SchedulerMetrics::default()
        };
        for (runtime, counter) in counters.iter() {
            metrics
                .per_runtime_distribution
                .insert(*runtime, counter.executions);
            if counter.executions > 0 {
                metrics.per_runtime_avg_latency_ms.insert(
                    *runtime,
                    counter.total_latency_ms as f64 / counter.executions as f64,
                );
                metrics.per_runtime_success_rate.insert(
                    *runtime,
                    counter.successes as f64 / counter.executions as f64,
                );
            }
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyrun_backends::testing::ScriptedBackend;
    use polyrun_backends::{EbpfBackend, WasmBackend};
    use polyrun_core::{Language, LatencyClass, SecurityToggles, TrustLevel};

    fn scheduler_with(backends: Vec<Arc<dyn Backend>>) -> Scheduler {
        let mut registry = BackendRegistry::new();
        for backend in backends {
            registry.register(backend);
        }
        let security =
            Arc::new(SecurityCoordinator::new(SecurityToggles::default()).unwrap());
        Scheduler::new(Arc::new(registry), security)
    }

    fn config() -> ExecutionConfig {
        ExecutionConfig::builder()
            .timeout_ms(5000)
            .memory_limit_bytes(64 * 1024 * 1024)
            .trust_level(TrustLevel::Low)
            .build()
    }

    #[tokio::test]
    async fn test_wasm_task_runs_on_wasm() {
        let wasm = Arc::new(WasmBackend::new().unwrap());
        wasm.initialize().await.unwrap();
        let scheduler = scheduler_with(vec![wasm]);

        let task = Task::builder(
            r#"(module (func (export "main") (result i32) (i32.const 7)))"#,
            Language::Wasm,
        )
        .latency_class(LatencyClass::Low)
        .build();

        let (result, runtime) = scheduler.run(&task, &config()).await.unwrap();
        assert!(result.success);
        assert_eq!(runtime, RuntimeKind::Wasm);
        assert_eq!(scheduler.metrics().total_executions, 1);
    }

    #[tokio::test]
    async fn test_ultra_low_filter_runs_on_ebpf() {
        let ebpf = Arc::new(EbpfBackend::new());
        ebpf.initialize().await.unwrap();
        let wasm = Arc::new(WasmBackend::new().unwrap());
        wasm.initialize().await.unwrap();
        let scheduler = scheduler_with(vec![ebpf, wasm]);

        let task = Task::builder(
            "int f(void* d, int n) { return n > 20 ? 1 : 0; }",
            Language::C,
        )
        .latency_class(LatencyClass::UltraLow)
        .build();
        let cfg = ExecutionConfig::builder()
            .timeout_ms(100)
            .memory_limit_bytes(1024 * 1024)
            .trust_level(TrustLevel::Low)
            .build();

        let (result, runtime) = scheduler.run(&task, &cfg).await.unwrap();
        assert_eq!(runtime, RuntimeKind::Ebpf);
        assert!(result.success);
        assert!(result.execution_time_ms < 10);
    }

    #[tokio::test]
    async fn test_language_rejection_falls_through() {
        // JavaScript maps to the isolate, which is absent; language
        // compatibility picks the catch-all interpreter double instead.
        let wasm = Arc::new(WasmBackend::new().unwrap());
        wasm.initialize().await.unwrap();
        let python = Arc::new(
            ScriptedBackend::builder(RuntimeKind::Python)
                .all_languages()
                .output(serde_json::json!("ok"))
                .build(),
        );
        let scheduler = scheduler_with(vec![wasm, python]);

        let task = Task::builder("function main() { return 1; }", Language::JavaScript)
            .build();
        let (result, runtime) = scheduler.run(&task, &config()).await.unwrap();
        assert!(result.success);
        assert_eq!(runtime, RuntimeKind::Python);
    }

    #[tokio::test]
    async fn test_failures_are_recorded_in_history() {
        let ebpf = Arc::new(EbpfBackend::new());
        let wasm = Arc::new(WasmBackend::new().unwrap());
        wasm.initialize().await.unwrap();
        let scheduler = scheduler_with(vec![ebpf, wasm]);

        // Traps at runtime: unreachable.
        let task = Task::builder(
            r#"(module (func (export "main") (result i32) unreachable))"#,
            Language::Wasm,
        )
        .build();

        let (result, runtime) = scheduler.run(&task, &config()).await.unwrap();
        assert!(!result.success);
        assert_eq!(runtime, RuntimeKind::Wasm);

        let key = task_shape_key(&task);
        let stats = scheduler.history().stats_for(&key);
        assert_eq!(stats[&RuntimeKind::Wasm].samples, 1);
        assert!((stats[&RuntimeKind::Wasm].success_rate - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_security_context_is_net_zero_after_run() {
        let wasm = Arc::new(WasmBackend::new().unwrap());
        wasm.initialize().await.unwrap();

        let mut registry = BackendRegistry::new();
        registry.register(wasm);
        let security =
            Arc::new(SecurityCoordinator::new(SecurityToggles::default()).unwrap());
        let scheduler = Scheduler::new(Arc::new(registry), Arc::clone(&security));

        let task = Task::builder(
            r#"(module (func (export "main") (result i32) (i32.const 1)))"#,
            Language::Wasm,
        )
        .build();
        scheduler.run(&task, &config()).await.unwrap();

        let metrics = security.metrics();
        for (_, pool) in &metrics.process_isolation.per_trust_level {
            assert_eq!(pool.active, 0);
        }
        assert_eq!(metrics.system_sandbox.active_namespaces, 0);
    }

    #[tokio::test]
    async fn test_no_backend_leaves_instances_behind() {
        let wasm = Arc::new(WasmBackend::new().unwrap());
        wasm.initialize().await.unwrap();
        let scheduler = scheduler_with(vec![Arc::clone(&wasm) as Arc<dyn Backend>]);

        let task = Task::builder(
            r#"(module (func (export "main") (result i32) (i32.const 1)))"#,
            Language::Wasm,
        )
        .build();
        for _ in 0..3 {
            scheduler.run(&task, &config()).await.unwrap();
        }
        assert_eq!(wasm.status().live_instances, 0);
    }

    #[tokio::test]
    async fn test_compile_rejection_exhausts_into_no_runtime() {
        // Only wasm is registered. The default fallback picks it for a
        // JavaScript task, compile rejects the language, and re-selection
        // with wasm excluded has nothing left.
        let wasm = Arc::new(WasmBackend::new().unwrap());
        wasm.initialize().await.unwrap();
        let scheduler = scheduler_with(vec![wasm]);

        let task = Task::builder("function main() { return 1; }", Language::JavaScript)
            .build();
        let err = scheduler.run(&task, &config()).await.unwrap_err();
        assert_eq!(err.kind(), polyrun_core::ErrorKind::NoRuntimeAvailable);
    }

    #[tokio::test]
    async fn test_empty_code_is_invalid_input() {
        let scheduler = scheduler_with(vec![Arc::new(EbpfBackend::new())]);
        let task = Task::builder("   ", Language::C).build();
        let err = scheduler.run(&task, &config()).await.unwrap_err();
        assert_eq!(err.kind(), polyrun_core::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_decide_is_deterministic() {
        let wasm = Arc::new(WasmBackend::new().unwrap());
        let scheduler = scheduler_with(vec![wasm]);
        let task = Task::builder("fn main() {}", Language::Rust).build();

        let first = scheduler.decide(&task, &config()).unwrap();
        let second = scheduler.decide(&task, &config()).unwrap();
        assert_eq!(first.runtime, second.runtime);
        assert_eq!(first.reason, second.reason);
    }
}
