//! The runtime back-end contract and registry.
//!
//! A back-end is an opaque engine exposing compile/instantiate/execute/
//! destroy for one execution technology. The controller relies on the
//! contract documented on [`Backend`]; anything beyond it (pre-warming,
//! internal pooling) is a latency optimization a caller must never depend
//! on for correctness.

use async_trait::async_trait;
use polyrun_core::{
    BackendStatus, Error, ExecutionConfig, ExecutionResult, InstanceId, Language, ModuleId,
    Result, RuntimeKind,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Uniform contract every execution back-end satisfies.
///
/// # Contract
///
/// - `initialize` and `shutdown` are idempotent.
/// - `compile` fails with [`polyrun_core::ErrorKind::UnsupportedLanguage`]
///   for any language the back-end does not declare.
/// - `execute` honors `timeout_ms` as a hard wall-clock bound and
///   `memory_limit_bytes` as an observable cap; execution-class failures
///   (trap, timeout, memory) come back as `Ok` results with
///   `success = false`, never as hangs.
/// - `execute` may be called concurrently for distinct instances; within
///   one instance execution is sequential.
/// - `destroy` releases every per-instance resource; destroying an unknown
///   or already-destroyed instance fails with
///   [`polyrun_core::ErrorKind::InstanceNotFound`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// The runtime kind this back-end implements.
    fn kind(&self) -> RuntimeKind;

    /// Languages this back-end accepts in `compile`.
    fn supported_languages(&self) -> &[Language];

    /// Whether the back-end declares support for every language.
    fn supports_all_languages(&self) -> bool {
        false
    }

    /// Returns `true` if `compile` would accept the language.
    fn supports_language(&self, language: Language) -> bool {
        self.supports_all_languages() || self.supported_languages().contains(&language)
    }

    /// Nominal cold-start latency, used only for ordering candidates.
    fn nominal_cold_start(&self) -> Duration {
        self.kind().nominal_cold_start()
    }

    /// Memory ceiling; the selector rejects this back-end for configs
    /// whose memory limit exceeds it.
    fn memory_ceiling_bytes(&self) -> u64 {
        self.kind().nominal_memory_ceiling_bytes()
    }

    /// One-time setup. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Compiles source into a reusable module.
    async fn compile(&self, code: &[u8], language: Language) -> Result<ModuleId>;

    /// Derives a live evaluation context from a compiled module.
    async fn instantiate(&self, module_id: ModuleId) -> Result<InstanceId>;

    /// Runs an instance under the given resource bounds.
    async fn execute(
        &self,
        instance_id: InstanceId,
        config: &ExecutionConfig,
    ) -> Result<ExecutionResult>;

    /// Releases all per-instance resources.
    async fn destroy(&self, instance_id: InstanceId) -> Result<()>;

    /// Tears the back-end down. Idempotent.
    async fn shutdown(&self) -> Result<()>;

    /// Current counters.
    fn status(&self) -> BackendStatus;

    /// Hint to pre-create idle evaluation contexts.
    ///
    /// Latency optimization only; implementations may ignore it and
    /// callers must not rely on it for correctness.
    async fn pre_warm(&self, n: usize) -> Result<()> {
        let _ = n;
        Ok(())
    }
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Default back-end preference order per language.
///
/// Used by `compile` when no scheduler is involved; the first enabled
/// back-end in the returned slice wins.
#[must_use]
pub fn default_backend_order(language: Language) -> &'static [RuntimeKind] {
    match language {
        Language::JavaScript | Language::TypeScript => &[RuntimeKind::V8Isolate],
        Language::Python => &[
            RuntimeKind::Python,
            RuntimeKind::Wasm,
            RuntimeKind::V8Isolate,
        ],
        Language::Rust | Language::C | Language::Cpp | Language::Go | Language::Wasm => {
            &[RuntimeKind::Wasm, RuntimeKind::V8Isolate]
        }
    }
}

/// Static registry mapping runtime kinds to back-ends.
///
/// Populated once at controller construction and read-only afterwards;
/// string-keyed dynamic dispatch is deliberately absent.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<RuntimeKind, Arc<dyn Backend>>,
    probe_order: Vec<RuntimeKind>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("probe_order", &self.probe_order)
            .finish_non_exhaustive()
    }
}

impl BackendRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a back-end. Registration order fixes the probe order.
    ///
    /// Registering a second back-end for the same kind replaces the first;
    /// that only happens in tests.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        let kind = backend.kind();
        if self.backends.insert(kind, backend).is_none() {
            self.probe_order.push(kind);
        }
        tracing::debug!(runtime = %kind, "registered back-end");
    }

    /// Returns the back-end for a kind, if registered.
    #[must_use]
    pub fn get(&self, kind: RuntimeKind) -> Option<Arc<dyn Backend>> {
        self.backends.get(&kind).cloned()
    }

    /// Registered kinds in probe order.
    #[must_use]
    pub fn kinds(&self) -> &[RuntimeKind] {
        &self.probe_order
    }

    /// Back-ends in probe order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.probe_order
            .iter()
            .filter_map(|kind| self.backends.get(kind))
    }

    /// Returns `true` if the registry holds no back-ends.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// First registered back-end declaring support for the language,
    /// following the static preference order.
    pub fn for_language(&self, language: Language) -> Result<Arc<dyn Backend>> {
        for kind in default_backend_order(language) {
            if let Some(backend) = self.get(*kind) {
                if backend.supports_language(language) {
                    return Ok(backend);
                }
            }
        }
        // Preference table exhausted; any registered back-end that takes
        // the language still qualifies.
        for backend in self.iter() {
            if backend.supports_language(language) {
                return Ok(Arc::clone(backend));
            }
        }
        Err(Error::NoRuntimeAvailable {
            reason: format!("no registered back-end supports language '{language}'"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    #[test]
    fn test_default_backend_order() {
        assert_eq!(
            default_backend_order(Language::JavaScript),
            &[RuntimeKind::V8Isolate]
        );
        assert_eq!(
            default_backend_order(Language::Python)[0],
            RuntimeKind::Python
        );
        assert_eq!(default_backend_order(Language::Rust)[0], RuntimeKind::Wasm);
        assert_eq!(default_backend_order(Language::Wasm)[0], RuntimeKind::Wasm);
    }

    #[test]
    fn test_registry_probe_order_is_registration_order() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(
            ScriptedBackend::builder(RuntimeKind::Ebpf)
                .language(Language::C)
                .build(),
        ));
        registry.register(Arc::new(
            ScriptedBackend::builder(RuntimeKind::Wasm)
                .language(Language::Wasm)
                .build(),
        ));

        assert_eq!(registry.kinds(), &[RuntimeKind::Ebpf, RuntimeKind::Wasm]);
        assert!(registry.get(RuntimeKind::Wasm).is_some());
        assert!(registry.get(RuntimeKind::Python).is_none());
    }

    #[test]
    fn test_for_language_follows_preference_table() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(
            ScriptedBackend::builder(RuntimeKind::Wasm)
                .language(Language::Wasm)
                .language(Language::Rust)
                .build(),
        ));
        registry.register(Arc::new(
            ScriptedBackend::builder(RuntimeKind::V8Isolate)
                .language(Language::JavaScript)
                .language(Language::TypeScript)
                .build(),
        ));

        let backend = registry.for_language(Language::Rust).unwrap();
        assert_eq!(backend.kind(), RuntimeKind::Wasm);

        let backend = registry.for_language(Language::JavaScript).unwrap();
        assert_eq!(backend.kind(), RuntimeKind::V8Isolate);

        let err = registry.for_language(Language::Python).unwrap_err();
        assert_eq!(err.kind(), polyrun_core::ErrorKind::NoRuntimeAvailable);
    }

    #[test]
    fn test_for_language_falls_back_to_any_supporting_backend() {
        // Only a catch-all back-end is registered; the preference table for
        // C does not name it, but it still takes the task.
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(
            ScriptedBackend::builder(RuntimeKind::Firecracker)
                .all_languages()
                .build(),
        ));

        let backend = registry.for_language(Language::C).unwrap();
        assert_eq!(backend.kind(), RuntimeKind::Firecracker);
    }
}
