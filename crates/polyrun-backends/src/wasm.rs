//! Wasmtime-backed WASM execution.
//!
//! Compiles WebAssembly (binary or WAT text) into cached modules and runs
//! each instance in its own resource-limited store. Hard timeouts use
//! Wasmtime's epoch interruption: a ticker thread advances the engine
//! epoch and each execution sets a deadline derived from its
//! `timeout_ms`, so even a busy loop that never yields is interrupted.
//!
//! For Rust, C, C++, and Go tasks the back-end executes the wasm artifact
//! produced by a host toolchain; the cross-compilation pipeline itself is
//! an external collaborator.
//!
//! # Examples
//!
//! ```no_run
//! use polyrun_backends::{Backend, WasmBackend};
//! use polyrun_core::{ExecutionConfig, Language};
//!
//! # async fn example() -> polyrun_core::Result<()> {
//! let backend = WasmBackend::new()?;
//! backend.initialize().await?;
//!
//! let wat = r#"(module (func (export "main") (result i32) (i32.const 42)))"#;
//! let module = backend.compile(wat.as_bytes(), Language::Wasm).await?;
//! let instance = backend.instantiate(module).await?;
//! let result = backend.execute(instance, &ExecutionConfig::default()).await?;
//! assert_eq!(result.output, Some(serde_json::json!(42)));
//! backend.destroy(instance).await?;
//! # Ok(())
//! # }
//! ```

use crate::backend::Backend;
use async_trait::async_trait;
use lru::LruCache;
use polyrun_core::{
    BackendStatus, Error, ExecutionConfig, ExecutionResult, InstanceId, Language, ModuleId,
    Result, RuntimeKind,
};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wasmtime::{Config, Engine, Linker, Module, ResourceLimiter, Store, Strategy, Trap};

/// Epoch tick interval; deadlines are expressed in these ticks.
const EPOCH_TICK_MS: u64 = 10;

/// Deadline delta large enough to never fire while an instance is idle.
const EPOCH_DISARMED: u64 = u64::MAX / 2;

/// Compiled-module LRU capacity.
const MODULE_CACHE_CAPACITY: usize = 100;

/// Per-store data: the memory limiter.
struct StoreData {
    limiter: MemoryLimiter,
}

/// Memory limiter tracking peak usage and enforcing the configured cap.
#[derive(Debug, Default)]
struct MemoryLimiter {
    /// Cap in bytes; `None` until an execute call sets it
    max_bytes: Option<usize>,
    /// Largest footprint the guest has requested
    peak_bytes: usize,
    /// Whether a growth request was denied
    denied: bool,
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if let Some(max) = self.max_bytes {
            if desired > max {
                tracing::warn!(desired, max, "memory growth denied");
                self.denied = true;
                return Ok(false);
            }
        }
        self.peak_bytes = self.peak_bytes.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        _desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// One live instance: the store and the instantiated module.
struct LiveInstance {
    store: Store<StoreData>,
    instance: wasmtime::Instance,
}

/// Ticker thread advancing the engine epoch.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(EPOCH_TICK_MS));
                engine.increment_epoch();
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wasmtime-backed execution back-end.
///
/// # Thread Safety
///
/// `Send + Sync`. Module and instance tables sit behind mutexes; an
/// executing instance is taken out of the table for the duration of the
/// call, so executions on distinct instances proceed in parallel.
pub struct WasmBackend {
    engine: Engine,
    modules: Mutex<HashMap<ModuleId, Module>>,
    instances: Mutex<HashMap<InstanceId, LiveInstance>>,
    module_cache: Mutex<LruCache<String, Module>>,
    ticker: Mutex<Option<EpochTicker>>,
    initialized: AtomicBool,

    total_executions: AtomicU64,
    failed_executions: AtomicU64,
    total_execution_time_us: AtomicU64,
}

impl std::fmt::Debug for WasmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmBackend")
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .field(
                "total_executions",
                &self.total_executions.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl WasmBackend {
    /// Languages this back-end accepts.
    const LANGUAGES: [Language; 5] = [
        Language::Wasm,
        Language::Rust,
        Language::C,
        Language::Cpp,
        Language::Go,
    ];

    /// Creates the back-end with an async-capable Cranelift engine.
    ///
    /// # Errors
    ///
    /// Returns an error if Wasmtime engine configuration fails.
    pub fn new() -> Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.epoch_interruption(true);
        config.strategy(Strategy::Cranelift);

        let engine = Engine::new(&config).map_err(|e| Error::ExecutionError {
            message: format!("failed to create Wasmtime engine: {e}"),
            source: Some(e.into()),
        })?;

        let capacity = NonZeroUsize::new(MODULE_CACHE_CAPACITY)
            .unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            engine,
            modules: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            module_cache: Mutex::new(LruCache::new(capacity)),
            ticker: Mutex::new(None),
            initialized: AtomicBool::new(false),
            total_executions: AtomicU64::new(0),
            failed_executions: AtomicU64::new(0),
            total_execution_time_us: AtomicU64::new(0),
        })
    }

    fn cache_key(code: &[u8]) -> String {
        blake3::hash(code).to_hex().to_string()
    }

    fn fresh_store(&self) -> Store<StoreData> {
        let mut store = Store::new(
            &self.engine,
            StoreData {
                limiter: MemoryLimiter::default(),
            },
        );
        store.limiter(|data| &mut data.limiter);
        // No deadline until an execute call arms one.
        store.set_epoch_deadline(EPOCH_DISARMED);
        store
    }

    fn record_execution(&self, elapsed: Duration, failed: bool) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed_executions.fetch_add(1, Ordering::Relaxed);
        }
        self.total_execution_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Runs the entry point, classifying traps into timeout / memory /
    /// execution failures. Returns a result, never an `Err`, for
    /// execution-class outcomes.
    async fn run_entry(
        &self,
        live: &mut LiveInstance,
        config: &ExecutionConfig,
        started: Instant,
    ) -> ExecutionResult {
        let timeout_ms = config.timeout_ms;

        // Typed entry: `main() -> i32`, falling back to wasi-style `_start`.
        let outcome: std::result::Result<i64, anyhow::Error> = if let Ok(func) = live
            .instance
            .get_typed_func::<(), i32>(&mut live.store, "main")
        {
            func.call_async(&mut live.store, ())
                .await
                .map(i64::from)
        } else if let Ok(func) = live
            .instance
            .get_typed_func::<(), ()>(&mut live.store, "_start")
        {
            func.call_async(&mut live.store, ()).await.map(|()| 0)
        } else {
            let elapsed = started.elapsed();
            self.record_execution(elapsed, true);
            return ExecutionResult::failure(
                "entry point 'main' or '_start' not found",
                elapsed.as_millis() as u64,
                live.store.data().limiter.peak_bytes as u64,
                RuntimeKind::Wasm,
            );
        };

        let elapsed = started.elapsed();
        let peak = live.store.data().limiter.peak_bytes as u64;
        let denied = live.store.data().limiter.denied;

        match outcome {
            Ok(code) => {
                self.record_execution(elapsed, false);
                tracing::debug!(exit_code = code, elapsed_ms = elapsed.as_millis() as u64, "wasm execution completed");
                ExecutionResult::success(
                    serde_json::json!(code),
                    elapsed.as_millis() as u64,
                    peak,
                    RuntimeKind::Wasm,
                )
            }
            Err(err) => {
                self.record_execution(elapsed, true);
                let interrupted = err
                    .downcast_ref::<Trap>()
                    .is_some_and(|trap| *trap == Trap::Interrupt);
                if interrupted {
                    tracing::warn!(timeout_ms, "wasm execution hit epoch deadline");
                    ExecutionResult::failure(
                        Error::Timeout { timeout_ms }.to_string(),
                        elapsed.as_millis() as u64,
                        peak,
                        RuntimeKind::Wasm,
                    )
                } else if denied {
                    ExecutionResult::failure(
                        Error::MemoryLimit {
                            limit_bytes: config.memory_limit_bytes,
                        }
                        .to_string(),
                        elapsed.as_millis() as u64,
                        config.memory_limit_bytes,
                        RuntimeKind::Wasm,
                    )
                } else {
                    tracing::debug!(error = %err, "wasm execution trapped");
                    ExecutionResult::failure(
                        format!("wasm trap: {err}"),
                        elapsed.as_millis() as u64,
                        peak,
                        RuntimeKind::Wasm,
                    )
                }
            }
        }
    }
}

#[async_trait]
impl Backend for WasmBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Wasm
    }

    fn supported_languages(&self) -> &[Language] {
        &Self::LANGUAGES
    }

    async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        *ticker = Some(EpochTicker::start(self.engine.clone()));
        tracing::info!("wasm back-end initialized");
        Ok(())
    }

    async fn compile(&self, code: &[u8], language: Language) -> Result<ModuleId> {
        if !self.supports_language(language) {
            return Err(Error::unsupported_language(language.as_str(), "wasm"));
        }
        if code.is_empty() {
            return Err(Error::invalid_input("code must not be empty"));
        }

        let key = Self::cache_key(code);
        let cached = {
            let mut cache = self.module_cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.get(&key).cloned()
        };

        let module = if let Some(module) = cached {
            tracing::debug!(key = %&key[..16.min(key.len())], "module cache hit");
            module
        } else {
            // Accepts both the binary format and WAT text.
            let wasm = wat::parse_bytes(code).map_err(|e| Error::CompilationError {
                message: format!("not a wasm artifact: {e}"),
                source: Some(Box::new(e)),
            })?;
            let module =
                Module::new(&self.engine, &wasm).map_err(|e| Error::CompilationError {
                    message: format!("wasm compilation failed: {e}"),
                    source: Some(e.into()),
                })?;
            let mut cache = self.module_cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.put(key, module.clone());
            module
        };

        let module_id = ModuleId::generate();
        self.modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(module_id, module);
        tracing::debug!(%module_id, %language, "module compiled");
        Ok(module_id)
    }

    async fn instantiate(&self, module_id: ModuleId) -> Result<InstanceId> {
        let module = {
            let modules = self.modules.lock().unwrap_or_else(|e| e.into_inner());
            modules
                .get(&module_id)
                .cloned()
                .ok_or_else(|| Error::ModuleNotFound {
                    module_id: module_id.to_string(),
                })?
        };

        let mut store = self.fresh_store();
        let linker: Linker<StoreData> = Linker::new(&self.engine);
        let instance = linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(|e| Error::InstantiationError {
                message: format!("wasm instantiation failed: {e}"),
            })?;

        let instance_id = InstanceId::generate();
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_id, LiveInstance { store, instance });
        tracing::debug!(%instance_id, %module_id, "instance created");
        Ok(instance_id)
    }

    async fn execute(
        &self,
        instance_id: InstanceId,
        config: &ExecutionConfig,
    ) -> Result<ExecutionResult> {
        config.validate()?;

        // Take the instance out of the table for the duration of the call;
        // executions on distinct instances stay parallel.
        let mut live = {
            let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            instances
                .remove(&instance_id)
                .ok_or_else(|| Error::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })?
        };

        let started = Instant::now();

        // Arm the memory cap and refuse instances already over it.
        live.store.data_mut().limiter.max_bytes = Some(config.memory_limit_bytes as usize);
        if live.store.data().limiter.peak_bytes as u64 > config.memory_limit_bytes {
            let result = ExecutionResult::failure(
                Error::MemoryLimit {
                    limit_bytes: config.memory_limit_bytes,
                }
                .to_string(),
                0,
                live.store.data().limiter.peak_bytes as u64,
                RuntimeKind::Wasm,
            );
            self.record_execution(started.elapsed(), true);
            self.instances
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(instance_id, live);
            return Ok(result);
        }

        // Arm the epoch deadline; the ticker advances one tick per
        // EPOCH_TICK_MS, so the trap lands within the reporting tolerance.
        live.store
            .set_epoch_deadline(config.timeout_ms / EPOCH_TICK_MS + 2);

        let guard_timeout = Duration::from_millis(config.timeout_ms.saturating_add(250));
        let result = match tokio::time::timeout(
            guard_timeout,
            self.run_entry(&mut live, config, started),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                // Epoch deadline should fire first; this is the outer belt.
                let elapsed = started.elapsed();
                self.record_execution(elapsed, true);
                ExecutionResult::failure(
                    Error::Timeout {
                        timeout_ms: config.timeout_ms,
                    }
                    .to_string(),
                    config.timeout_ms,
                    live.store.data().limiter.peak_bytes as u64,
                    RuntimeKind::Wasm,
                )
            }
        };

        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_id, live);
        Ok(result)
    }

    async fn destroy(&self, instance_id: InstanceId) -> Result<()> {
        let removed = self
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&instance_id);
        match removed {
            Some(_) => {
                tracing::debug!(%instance_id, "instance destroyed");
                Ok(())
            }
            None => Err(Error::InstanceNotFound {
                instance_id: instance_id.to_string(),
            }),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(mut ticker) = self
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            ticker.stop();
        }
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.module_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        tracing::info!("wasm back-end shut down");
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        let total = self.total_executions.load(Ordering::Relaxed);
        let total_us = self.total_execution_time_us.load(Ordering::Relaxed);
        BackendStatus {
            modules: self.modules.lock().unwrap_or_else(|e| e.into_inner()).len(),
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

    async fn pre_warm(&self, n: usize) -> Result<()> {
        // Warms allocator paths only; correctness never depends on it.
        for _ in 0..n {
            drop(self.fresh_store());
        }
        tracing::debug!(n, "pre-warmed wasm stores");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER_WAT: &str =
        r#"(module (func (export "main") (result i32) (i32.const 42)))"#;

    fn config_with(timeout_ms: u64, memory_limit_bytes: u64) -> ExecutionConfig {
        ExecutionConfig::builder()
            .timeout_ms(timeout_ms)
            .memory_limit_bytes(memory_limit_bytes)
            .build()
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let backend = WasmBackend::new().unwrap();
        backend.initialize().await.unwrap();

        let module = backend
            .compile(ANSWER_WAT.as_bytes(), Language::Wasm)
            .await
            .unwrap();
        let instance = backend.instantiate(module).await.unwrap();
        let result = backend
            .execute(instance, &ExecutionConfig::default())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output, Some(serde_json::json!(42)));
        assert_eq!(result.runtime, RuntimeKind::Wasm);

        backend.destroy(instance).await.unwrap();
        let err = backend.destroy(instance).await.unwrap_err();
        assert_eq!(err.kind(), polyrun_core::ErrorKind::InstanceNotFound);

        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let backend = WasmBackend::new().unwrap();
        let err = backend
            .compile(b"print('hi')", Language::Python)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), polyrun_core::ErrorKind::UnsupportedLanguage);
    }

    #[tokio::test]
    async fn test_invalid_wasm_is_compilation_error() {
        let backend = WasmBackend::new().unwrap();
        let err = backend
            .compile(b"fn main() {}", Language::Rust)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), polyrun_core::ErrorKind::CompilationError);
    }

    #[tokio::test]
    async fn test_stale_module_id() {
        let backend = WasmBackend::new().unwrap();
        let err = backend.instantiate(ModuleId::generate()).await.unwrap_err();
        assert_eq!(err.kind(), polyrun_core::ErrorKind::ModuleNotFound);
    }

    #[tokio::test]
    async fn test_busy_loop_hits_timeout() {
        let backend = WasmBackend::new().unwrap();
        backend.initialize().await.unwrap();

        let wat = r#"(module (func (export "main") (result i32)
            (loop $spin (br $spin))
            (i32.const 0)))"#;
        let module = backend.compile(wat.as_bytes(), Language::Wasm).await.unwrap();
        let instance = backend.instantiate(module).await.unwrap();

        let result = backend
            .execute(instance, &config_with(100, 64 * 1024 * 1024))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("timed out"));
        assert!(result.execution_time_ms <= 150);

        backend.destroy(instance).await.unwrap();
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_growth_denied() {
        let backend = WasmBackend::new().unwrap();
        backend.initialize().await.unwrap();

        // Grows memory by 64 pages (4 MiB) and traps on failure.
        let wat = r#"(module
            (memory 1)
            (func (export "main") (result i32)
                (if (i32.eq (memory.grow (i32.const 64)) (i32.const -1))
                    (then unreachable))
                (i32.const 0)))"#;
        let module = backend.compile(wat.as_bytes(), Language::Wasm).await.unwrap();
        let instance = backend.instantiate(module).await.unwrap();

        let result = backend
            .execute(instance, &config_with(5_000, 2 * 1024 * 1024))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("memory limit"));

        backend.destroy(instance).await.unwrap();
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_successful_execution_respects_memory_invariant() {
        let backend = WasmBackend::new().unwrap();
        backend.initialize().await.unwrap();

        let config = config_with(5_000, 64 * 1024 * 1024);
        let module = backend
            .compile(ANSWER_WAT.as_bytes(), Language::Wasm)
            .await
            .unwrap();
        let instance = backend.instantiate(module).await.unwrap();
        let result = backend.execute(instance, &config).await.unwrap();

        assert!(result.success);
        assert!(result.memory_used_bytes <= config.memory_limit_bytes);

        backend.destroy(instance).await.unwrap();
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_leaves_no_state() {
        let backend = WasmBackend::new().unwrap();
        backend.initialize().await.unwrap();

        let module = backend
            .compile(ANSWER_WAT.as_bytes(), Language::Wasm)
            .await
            .unwrap();
        let instance = backend.instantiate(module).await.unwrap();
        assert_eq!(backend.status().live_instances, 1);

        backend.destroy(instance).await.unwrap();
        assert_eq!(backend.status().live_instances, 0);

        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_executions_on_distinct_instances() {
        let backend = Arc::new(WasmBackend::new().unwrap());
        backend.initialize().await.unwrap();

        let module = backend
            .compile(ANSWER_WAT.as_bytes(), Language::Wasm)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let backend = Arc::clone(&backend);
            let instance = backend.instantiate(module).await.unwrap();
            handles.push(tokio::spawn(async move {
                let result = backend
                    .execute(instance, &ExecutionConfig::default())
                    .await
                    .unwrap();
                backend.destroy(instance).await.unwrap();
                result
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().success);
        }

        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let backend = WasmBackend::new().unwrap();
        backend.initialize().await.unwrap();
        backend.shutdown().await.unwrap();
        backend.shutdown().await.unwrap();
    }
}
