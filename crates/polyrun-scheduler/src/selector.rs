//! Runtime selector: the scored decision procedure.
//!
//! Walks five rules in strict precedence: historical override, profile
//! mapping, latency class, language compatibility, default fallback. A
//! rule whose choice is unavailable (not registered, memory ceiling below
//! the configured limit, or explicitly excluded) falls through to the
//! next. The procedure is deterministic given identical inputs and an
//! identical history snapshot.

use crate::history::RuntimeShapeStats;
use polyrun_core::{
    Error, ExecutionConfig, Language, LatencyClass, Result, RuntimeKind, SchedulingDecision,
    Task, WorkloadProfile,
};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Historical score above which history overrides every other rule.
const HISTORY_OVERRIDE_THRESHOLD: f64 = 0.8;

/// Memory hint steering heavy compute onto the microVM: 128 MiB.
const HEAVY_COMPUTE_MEMORY_CUTOVER: u64 = 128 * 1024 * 1024;

/// Memory hint steering memory-intensive work onto the microVM: 512 MiB.
const MEMORY_INTENSIVE_CUTOVER: u64 = 512 * 1024 * 1024;

/// One selectable back-end as the selector sees it.
#[derive(Debug, Clone)]
pub struct CandidateRuntime {
    /// Runtime kind
    pub kind: RuntimeKind,
    /// Nominal cold-start latency, for ordering only
    pub cold_start: Duration,
    /// Memory ceiling the selector vetoes against
    pub memory_ceiling_bytes: u64,
    /// Languages the back-end declares
    pub languages: Vec<Language>,
    /// Whether the back-end declares support for every language
    pub all_languages: bool,
}

impl CandidateRuntime {
    /// Whether the candidate declares support for a language.
    #[must_use]
    pub fn supports(&self, language: Language) -> bool {
        self.all_languages || self.languages.contains(&language)
    }
}

/// The scored decision procedure.
#[derive(Debug, Default)]
pub struct RuntimeSelector;

impl RuntimeSelector {
    /// Picks a runtime for the task, or fails with `NoRuntimeAvailable`.
    ///
    /// `excluded` carries runtimes already rejected at compile time
    /// (unsupported language); they are treated as unavailable so the
    /// procedure falls through exactly as it would for an unregistered
    /// back-end.
    pub fn select(
        &self,
        profile: WorkloadProfile,
        task: &Task,
        config: &ExecutionConfig,
        history: &HashMap<RuntimeKind, RuntimeShapeStats>,
        candidates: &[CandidateRuntime],
        excluded: &BTreeSet<RuntimeKind>,
    ) -> Result<SchedulingDecision> {
        let usable = |kind: RuntimeKind| -> bool {
            !excluded.contains(&kind)
                && candidates.iter().any(|candidate| {
                    candidate.kind == kind
                        && candidate.memory_ceiling_bytes >= config.memory_limit_bytes
                })
        };

        // Rule 1: historical override. Ties break on runtime kind so the
        // decision stays deterministic for identical history snapshots.
        let mut best: Option<(RuntimeKind, f64)> = None;
        for (kind, stats) in history {
            if stats.samples == 0 || !usable(*kind) {
                continue;
            }
            let score = stats.score();
            let wins = match best {
                None => true,
                Some((best_kind, best_score)) => {
                    score > best_score || (score == best_score && *kind < best_kind)
                }
            };
            if wins {
                best = Some((*kind, score));
            }
        }
        if let Some((kind, score)) = best {
            if score > HISTORY_OVERRIDE_THRESHOLD {
                return Ok(SchedulingDecision::new(
                    kind,
                    format!("historical performance override (score {score:.2})"),
                    score,
                ));
            }
        }

        // Rule 2: profile mapping.
        let mapped: Option<(RuntimeKind, f64, &str)> = match profile {
            WorkloadProfile::SimpleFilter => {
                Some((RuntimeKind::Ebpf, 0.95, "simple filter maps to the kernel VM"))
            }
            WorkloadProfile::ShortCompute => {
                Some((RuntimeKind::Wasm, 0.90, "short compute maps to wasm"))
            }
            WorkloadProfile::JavaScript => Some((
                RuntimeKind::V8Isolate,
                0.95,
                "javascript workload maps to the isolate",
            )),
            WorkloadProfile::HeavyCompute | WorkloadProfile::Untrusted => {
                if task
                    .memory_hint
                    .is_some_and(|hint| hint > HEAVY_COMPUTE_MEMORY_CUTOVER)
                {
                    Some((
                        RuntimeKind::Firecracker,
                        0.85,
                        "heavy compute with a large memory hint maps to the microvm",
                    ))
                } else {
                    Some((RuntimeKind::Wasm, 0.85, "heavy compute maps to wasm"))
                }
            }
            WorkloadProfile::IoIntensive => Some((
                RuntimeKind::Firecracker,
                0.90,
                "io-intensive workload maps to the microvm",
            )),
            WorkloadProfile::MemoryIntensive => {
                if task
                    .memory_hint
                    .is_some_and(|hint| hint > MEMORY_INTENSIVE_CUTOVER)
                {
                    Some((
                        RuntimeKind::Firecracker,
                        0.95,
                        "memory-intensive workload maps to the microvm",
                    ))
                } else {
                    None
                }
            }
        };
        if let Some((kind, confidence, reason)) = mapped {
            if usable(kind) {
                return Ok(SchedulingDecision::new(kind, reason, confidence));
            }
        }

        // Rule 3: latency class.
        let by_latency: Option<(RuntimeKind, f64, &str)> = match task.latency_class {
            Some(LatencyClass::UltraLow) => Some((
                RuntimeKind::Ebpf,
                0.90,
                "ultra-low latency class prefers the kernel VM",
            )),
            Some(LatencyClass::Low) => {
                Some((RuntimeKind::Wasm, 0.85, "low latency class prefers wasm"))
            }
            Some(LatencyClass::Normal) if task.language.is_javascript_family() => Some((
                RuntimeKind::V8Isolate,
                0.80,
                "normal latency javascript prefers the isolate",
            )),
            _ => None,
        };
        if let Some((kind, confidence, reason)) = by_latency {
            if usable(kind) {
                return Ok(SchedulingDecision::new(kind, reason, confidence));
            }
        }

        // Rule 4: language compatibility, fastest cold start first.
        let mut supporters: Vec<&CandidateRuntime> = candidates
            .iter()
            .filter(|candidate| usable(candidate.kind) && candidate.supports(task.language))
            .collect();
        supporters.sort_by_key(|candidate| candidate.cold_start);
        if let Some(candidate) = supporters.first() {
            return Ok(SchedulingDecision::new(
                candidate.kind,
                format!("language compatibility for '{}'", task.language),
                0.70,
            ));
        }

        // Rule 5: default fallback.
        if usable(RuntimeKind::Wasm) {
            return Ok(SchedulingDecision::new(
                RuntimeKind::Wasm,
                "default fallback",
                0.5,
            ));
        }

        Err(Error::NoRuntimeAvailable {
            reason: format!(
                "no available runtime for language '{}' within a {} byte memory limit",
                task.language, config.memory_limit_bytes
            ),
        })
    }
}
