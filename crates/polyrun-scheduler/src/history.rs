//! Execution history: bounded per-task-shape outcome rings.
//!
//! Outcomes are keyed by a task shape (a 32-bit hash of the language and
//! code plus the complexity hint), so the selector can learn which runtime
//! served similar work best. Hash collisions merely broaden the learning
//! class. Each shape holds the last 100 outcomes; a global ring keeps the
//! last 1000 across all shapes for cross-task observation. Nothing is
//! persisted across restarts.

use polyrun_core::{HistoryEntry, RingBuffer, RuntimeKind, Task};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-shape ring capacity.
const PER_KEY_CAPACITY: usize = 100;

/// Default global ring capacity.
const GLOBAL_CAPACITY: usize = 1000;

/// Aggregated past outcomes of one runtime for one task shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeShapeStats {
    /// Outcomes observed
    pub samples: usize,
    /// Fraction of successful outcomes in `[0, 1]`
    pub success_rate: f64,
    /// Mean end-to-end time, milliseconds
    pub avg_total_ms: f64,
}

impl RuntimeShapeStats {
    /// Blended score: `0.7·success_rate + 0.3·(1/(1+avg_ms/1000))`.
    #[must_use]
    pub fn score(&self) -> f64 {
        0.7 * self.success_rate + 0.3 * (1.0 / (1.0 + self.avg_total_ms / 1000.0))
    }
}

/// Computes the task shape key: `hash32(language ‖ code)-complexity`.
#[must_use]
pub fn task_shape_key(task: &Task) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(task.language.as_str().as_bytes());
    hasher.update(task.code.as_bytes());
    let digest = hasher.finalize();
    let mut word = [0u8; 4];
    word.copy_from_slice(&digest.as_bytes()[..4]);
    format!(
        "{:08x}-{}",
        u32::from_le_bytes(word),
        task.complexity_or_default().as_str()
    )
}

/// Bounded execution history.
///
/// # Thread Safety
///
/// `Send + Sync`; the shape index sits behind a mutex, each ring handles
/// its own appends, readers take snapshots.
#[derive(Debug)]
pub struct ExecutionHistory {
    per_key: Mutex<HashMap<String, Arc<RingBuffer<HistoryEntry>>>>,
    global: RingBuffer<HistoryEntry>,
}

impl Default for ExecutionHistory {
    fn default() -> Self {
        Self::new(GLOBAL_CAPACITY)
    }
}

impl ExecutionHistory {
    /// Creates a history with the given global ring capacity.
    #[must_use]
    pub fn new(global_capacity: usize) -> Self {
        Self {
            per_key: Mutex::new(HashMap::new()),
            global: RingBuffer::new(global_capacity),
        }
    }

    /// Records one outcome, success or failure.
    pub fn record(&self, entry: HistoryEntry) {
        let ring = {
            let mut per_key = self.per_key.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                per_key
                    .entry(entry.task_shape_key.clone())
                    .or_insert_with(|| Arc::new(RingBuffer::new(PER_KEY_CAPACITY))),
            )
        };
        ring.push(entry.clone());
        self.global.push(entry);
    }

    /// Outcomes retained for one shape, oldest first.
    #[must_use]
    pub fn entries_for(&self, key: &str) -> Vec<HistoryEntry> {
        let per_key = self.per_key.lock().unwrap_or_else(|e| e.into_inner());
        per_key.get(key).map_or_else(Vec::new, |ring| ring.snapshot())
    }

    /// Per-runtime aggregates over one shape's retained outcomes.
    #[must_use]
    pub fn stats_for(&self, key: &str) -> HashMap<RuntimeKind, RuntimeShapeStats> {
        let mut sums: HashMap<RuntimeKind, (usize, usize, u64)> = HashMap::new();
        for entry in self.entries_for(key) {
            let slot = sums.entry(entry.runtime).or_insert((0, 0, 0));
            slot.0 += 1;
            if entry.success {
                slot.1 += 1;
            }
            slot.2 += entry.total_time_ms;
        }
        sums.into_iter()
            .map(|(runtime, (samples, successes, total_ms))| {
                (
                    runtime,
                    RuntimeShapeStats {
                        samples,
                        success_rate: successes as f64 / samples as f64,
                        avg_total_ms: total_ms as f64 / samples as f64,
                    },
                )
            })
            .collect()
    }

    /// Total outcomes recorded over the history's lifetime.
    #[must_use]
    pub fn total_recorded(&self) -> u64 {
        self.global.total_appended()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use polyrun_core::{Complexity, Language};

    fn entry(key: &str, runtime: RuntimeKind, success: bool, total_ms: u64) -> HistoryEntry {
        HistoryEntry {
            task_shape_key: key.to_string(),
            runtime,
            success,
            execution_time_ms: total_ms / 2,
            total_time_ms: total_ms,
            memory_used_bytes: 1024,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_shape_key_is_stable_and_hint_sensitive() {
        let task = Task::builder("fn main() {}", Language::Rust).build();
        assert_eq!(task_shape_key(&task), task_shape_key(&task));

        let complex = Task::builder("fn main() {}", Language::Rust)
            .complexity(Complexity::Complex)
            .build();
        assert_ne!(task_shape_key(&task), task_shape_key(&complex));

        let other_lang = Task::builder("fn main() {}", Language::C).build();
        assert_ne!(task_shape_key(&task), task_shape_key(&other_lang));

        assert!(task_shape_key(&task).ends_with("-simple"));
    }

    #[test]
    fn test_stats_aggregate_per_runtime() {
        let history = ExecutionHistory::default();
        history.record(entry("k", RuntimeKind::Wasm, true, 100));
        history.record(entry("k", RuntimeKind::Wasm, true, 300));
        history.record(entry("k", RuntimeKind::Ebpf, false, 10));

        let stats = history.stats_for("k");
        let wasm = &stats[&RuntimeKind::Wasm];
        assert_eq!(wasm.samples, 2);
        assert!((wasm.success_rate - 1.0).abs() < f64::EPSILON);
        assert!((wasm.avg_total_ms - 200.0).abs() < f64::EPSILON);

        let ebpf = &stats[&RuntimeKind::Ebpf];
        assert!((ebpf.success_rate - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_blend() {
        let fast_reliable = RuntimeShapeStats {
            samples: 10,
            success_rate: 1.0,
            avg_total_ms: 0.0,
        };
        assert!((fast_reliable.score() - 1.0).abs() < 1e-9);

        let slow_reliable = RuntimeShapeStats {
            samples: 10,
            success_rate: 1.0,
            avg_total_ms: 1000.0,
        };
        assert!((slow_reliable.score() - 0.85).abs() < 1e-9);

        let failing = RuntimeShapeStats {
            samples: 10,
            success_rate: 0.0,
            avg_total_ms: 0.0,
        };
        assert!((failing.score() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_per_key_ring_bounds_at_one_hundred() {
        let history = ExecutionHistory::default();
        for i in 0..150 {
            history.record(entry("k", RuntimeKind::Wasm, i % 2 == 0, i));
        }
        assert_eq!(history.entries_for("k").len(), 100);
        assert_eq!(history.total_recorded(), 150);
    }

    #[test]
    fn test_failures_are_recorded() {
        let history = ExecutionHistory::default();
        history.record(entry("k", RuntimeKind::V8Isolate, false, 50));
        let stats = history.stats_for("k");
        assert_eq!(stats[&RuntimeKind::V8Isolate].samples, 1);
    }
}
