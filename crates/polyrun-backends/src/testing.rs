//! Scripted contract double for back-end integration tests.
//!
//! Engines such as JS isolates, embedded interpreters, and microVMs are
//! external collaborators; scheduler and controller tests exercise their
//! routing and lifecycle against [`ScriptedBackend`], which satisfies the
//! full [`Backend`] contract with configurable canned behavior.

use crate::backend::Backend;
use async_trait::async_trait;
use polyrun_core::{
    BackendStatus, Error, ExecutionConfig, ExecutionResult, InstanceId, Language, ModuleId,
    Result, RuntimeKind,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Canned behavior for one `ScriptedBackend`.
#[derive(Debug, Default)]
struct Script {
    /// Results handed out in order; when exhausted, a default success
    /// result is synthesized
    canned_results: VecDeque<ExecutionResult>,
    /// When set, every `instantiate` fails with this message
    refuse_instantiate: Option<String>,
    /// When set, every `compile` fails as a compilation error
    refuse_compile: Option<String>,
}

/// Configurable back-end double.
///
/// # Examples
///
/// ```
/// use polyrun_backends::testing::ScriptedBackend;
/// use polyrun_core::{Language, RuntimeKind};
///
/// let backend = ScriptedBackend::builder(RuntimeKind::V8Isolate)
///     .language(Language::JavaScript)
///     .language(Language::TypeScript)
///     .output(serde_json::json!(55))
///     .build();
/// assert_eq!(backend.kind(), RuntimeKind::V8Isolate);
/// ```
pub struct ScriptedBackend {
    kind: RuntimeKind,
    languages: Vec<Language>,
    all_languages: bool,
    execute_delay: Option<Duration>,
    default_output: serde_json::Value,
    script: Mutex<Script>,

    modules: Mutex<HashSet<ModuleId>>,
    instances: Mutex<HashMap<InstanceId, ModuleId>>,
    total_executions: AtomicU64,
    failed_executions: AtomicU64,
    concurrent_executions: AtomicU64,
    max_observed_concurrency: AtomicU64,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("kind", &self.kind)
            .field("languages", &self.languages)
            .finish_non_exhaustive()
    }
}

impl ScriptedBackend {
    /// Starts building a double for the given runtime kind.
    #[must_use]
    pub fn builder(kind: RuntimeKind) -> ScriptedBackendBuilder {
        ScriptedBackendBuilder {
            kind,
            languages: Vec::new(),
            all_languages: false,
            execute_delay: None,
            default_output: serde_json::Value::Null,
            canned_results: VecDeque::new(),
            refuse_instantiate: None,
            refuse_compile: None,
        }
    }

    /// Queues one canned result to be returned by a future `execute`.
    pub fn push_result(&self, result: ExecutionResult) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .canned_results
            .push_back(result);
    }

    /// Largest number of `execute` calls observed in flight at once.
    #[must_use]
    pub fn max_observed_concurrency(&self) -> u64 {
        self.max_observed_concurrency.load(Ordering::Relaxed)
    }

    /// Number of instances currently live.
    #[must_use]
    pub fn live_instances(&self) -> usize {
        self.instances.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    fn supported_languages(&self) -> &[Language] {
        &self.languages
    }

    fn supports_all_languages(&self) -> bool {
        self.all_languages
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn compile(&self, code: &[u8], language: Language) -> Result<ModuleId> {
        if !self.supports_language(language) {
            return Err(Error::unsupported_language(
                language.as_str(),
                self.kind.as_str(),
            ));
        }
        if code.is_empty() {
            return Err(Error::invalid_input("code must not be empty"));
        }
        let refuse = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .refuse_compile
            .clone();
        if let Some(message) = refuse {
            return Err(Error::compilation(message));
        }
        let module_id = ModuleId::generate();
        self.modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(module_id);
        Ok(module_id)
    }

    async fn instantiate(&self, module_id: ModuleId) -> Result<InstanceId> {
        if !self
            .modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&module_id)
        {
            return Err(Error::ModuleNotFound {
                module_id: module_id.to_string(),
            });
        }
        let refuse = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .refuse_instantiate
            .clone();
        if let Some(message) = refuse {
            return Err(Error::InstantiationError { message });
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
        if !self
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&instance_id)
        {
            return Err(Error::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        }

        let in_flight = self.concurrent_executions.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed_concurrency
            .fetch_max(in_flight, Ordering::SeqCst);

        if let Some(delay) = self.execute_delay {
            tokio::time::sleep(delay).await;
        }

        let canned = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .canned_results
            .pop_front();
        let result = canned.unwrap_or_else(|| {
            ExecutionResult::success(self.default_output.clone(), 1, 1024, self.kind)
        });

        self.concurrent_executions.fetch_sub(1, Ordering::SeqCst);
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        if !result.success {
            self.failed_executions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(result)
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
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        let total = self.total_executions.load(Ordering::Relaxed);
        BackendStatus {
            modules: self.modules.lock().unwrap_or_else(|e| e.into_inner()).len(),
            live_instances: self.live_instances(),
            total_executions: total,
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
            avg_execution_time_ms: if total > 0 { 1.0 } else { 0.0 },
        }
    }
}

/// Builder for [`ScriptedBackend`].
#[derive(Debug)]
pub struct ScriptedBackendBuilder {
    kind: RuntimeKind,
    languages: Vec<Language>,
    all_languages: bool,
    execute_delay: Option<Duration>,
    default_output: serde_json::Value,
    canned_results: VecDeque<ExecutionResult>,
    refuse_instantiate: Option<String>,
    refuse_compile: Option<String>,
}

impl ScriptedBackendBuilder {
    /// Declares support for one language.
    #[must_use]
    pub fn language(mut self, language: Language) -> Self {
        self.languages.push(language);
        self
    }

    /// Declares support for every language.
    #[must_use]
    pub fn all_languages(mut self) -> Self {
        self.all_languages = true;
        self
    }

    /// Injects latency into every `execute`.
    #[must_use]
    pub fn execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = Some(delay);
        self
    }

    /// Sets the default success output.
    #[must_use]
    pub fn output(mut self, output: serde_json::Value) -> Self {
        self.default_output = output;
        self
    }

    /// Queues one canned result.
    #[must_use]
    pub fn result(mut self, result: ExecutionResult) -> Self {
        self.canned_results.push_back(result);
        self
    }

    /// Makes every `instantiate` fail (saturated internal pool).
    #[must_use]
    pub fn refuse_instantiate(mut self, message: impl Into<String>) -> Self {
        self.refuse_instantiate = Some(message.into());
        self
    }

    /// Makes every `compile` fail.
    #[must_use]
    pub fn refuse_compile(mut self, message: impl Into<String>) -> Self {
        self.refuse_compile = Some(message.into());
        self
    }

    /// Finishes the double.
    #[must_use]
    pub fn build(self) -> ScriptedBackend {
        ScriptedBackend {
            kind: self.kind,
            languages: self.languages,
            all_languages: self.all_languages,
            execute_delay: self.execute_delay,
            default_output: self.default_output,
            script: Mutex::new(Script {
                canned_results: self.canned_results,
                refuse_instantiate: self.refuse_instantiate,
                refuse_compile: self.refuse_compile,
            }),
            modules: Mutex::new(HashSet::new()),
            instances: Mutex::new(HashMap::new()),
            total_executions: AtomicU64::new(0),
            failed_executions: AtomicU64::new(0),
            concurrent_executions: AtomicU64::new(0),
            max_observed_concurrency: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_lifecycle() {
        let backend = ScriptedBackend::builder(RuntimeKind::V8Isolate)
            .language(Language::JavaScript)
            .output(serde_json::json!(55))
            .build();

        let module = backend
            .compile(b"function main() { return 55; }", Language::JavaScript)
            .await
            .unwrap();
        let instance = backend.instantiate(module).await.unwrap();
        let result = backend
            .execute(instance, &ExecutionConfig::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, Some(serde_json::json!(55)));

        backend.destroy(instance).await.unwrap();
        assert!(backend.destroy(instance).await.is_err());
    }

    #[tokio::test]
    async fn test_canned_results_in_order() {
        let backend = ScriptedBackend::builder(RuntimeKind::Python)
            .language(Language::Python)
            .result(ExecutionResult::failure("boom", 2, 0, RuntimeKind::Python))
            .build();

        let module = backend.compile(b"x = 1", Language::Python).await.unwrap();
        let instance = backend.instantiate(module).await.unwrap();

        let first = backend
            .execute(instance, &ExecutionConfig::default())
            .await
            .unwrap();
        assert!(!first.success);

        let second = backend
            .execute(instance, &ExecutionConfig::default())
            .await
            .unwrap();
        assert!(second.success);
    }

    #[tokio::test]
    async fn test_refuse_instantiate() {
        let backend = ScriptedBackend::builder(RuntimeKind::Firecracker)
            .all_languages()
            .refuse_instantiate("microvm pool saturated")
            .build();

        let module = backend.compile(b"anything", Language::C).await.unwrap();
        let err = backend.instantiate(module).await.unwrap_err();
        assert!(err.retriable());
    }
}
