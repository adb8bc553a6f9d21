//! The execution controller.
//!
//! Public lifecycle operations over the registered back-ends: compile,
//! instantiate, execute, destroy, the scheduler-driven
//! `execute_with_scheduler`, and idempotent shutdown. Module and instance
//! handles carry their owning back-end in controller-side maps, so routing
//! is a lookup, not a probe; the fixed-order probe survives only for
//! handles minted outside this controller.

use crate::queue::AdmissionQueue;
use polyrun_backends::{Backend, BackendRegistry, EbpfBackend, WasmBackend};
use polyrun_core::{
    ControllerConfig, ControllerMetrics, Error, ExecutionConfig, ExecutionResult, InstanceId,
    Language, ModuleId, Result, RuntimeKind, SecurityMetrics, Task,
};
use polyrun_scheduler::Scheduler;
use polyrun_security::SecurityCoordinator;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::OnceCell;

/// Public entry point owning registry, scheduler, security, and queue.
pub struct Controller {
    config: ControllerConfig,
    registry: Arc<BackendRegistry>,
    scheduler: Scheduler,
    security: Arc<SecurityCoordinator>,
    queue: AdmissionQueue,
    modules: RwLock<HashMap<ModuleId, RuntimeKind>>,
    instances: RwLock<HashMap<InstanceId, RuntimeKind>>,
    init: OnceCell<()>,
    shutting_down: AtomicBool,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("initialized", &self.init.initialized())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller with the built-in reference back-ends, honoring
    /// the per-runtime enablement in the configuration.
    pub fn new(config: ControllerConfig) -> Result<Self> {
        let mut backends: Vec<Arc<dyn Backend>> = Vec::new();
        if config.runtime_enabled(RuntimeKind::Ebpf) {
            backends.push(Arc::new(EbpfBackend::new()));
        }
        if config.runtime_enabled(RuntimeKind::Wasm) {
            backends.push(Arc::new(WasmBackend::new()?));
        }
        Self::with_backends(config, backends)
    }

    /// Creates a controller over an explicit back-end set. Back-ends whose
    /// runtime kind is disabled in the configuration are skipped.
    pub fn with_backends(
        config: ControllerConfig,
        backends: Vec<Arc<dyn Backend>>,
    ) -> Result<Self> {
        let mut registry = BackendRegistry::new();
        for backend in backends {
            if config.runtime_enabled(backend.kind()) {
                registry.register(backend);
            }
        }
        if registry.is_empty() {
            return Err(Error::NoRuntimeAvailable {
                reason: "no back-end is enabled".to_string(),
            });
        }
        let registry = Arc::new(registry);
        let security = Arc::new(SecurityCoordinator::new(config.security.clone())?);
        let scheduler = Scheduler::new(Arc::clone(&registry), Arc::clone(&security));
        let queue = AdmissionQueue::new(config.concurrency);
        Ok(Self {
            config,
            registry,
            scheduler,
            security,
            queue,
            modules: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            init: OnceCell::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// One-time initialization of every registered back-end.
    async fn ensure_initialized(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                for backend in self.registry.iter() {
                    backend.initialize().await?;
                }
                tracing::info!(
                    runtimes = ?self.registry.kinds(),
                    "controller initialized"
                );
                Ok::<_, Error>(())
            })
            .await
            .copied()
    }

    fn reject_if_shutting_down(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Compiles code on the back-end statically mapped to the language.
    /// No scheduler involvement.
    pub async fn compile(&self, code: &[u8], language: Language) -> Result<ModuleId> {
        self.reject_if_shutting_down()?;
        self.ensure_initialized().await?;
        if code.is_empty() {
            return Err(Error::invalid_input("code must not be empty"));
        }
        let backend = self.registry.for_language(language)?;
        let module_id = backend.compile(code, language).await?;
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(module_id, backend.kind());
        Ok(module_id)
    }

    /// Instantiates a module on its owning back-end.
    ///
    /// Handles minted by this controller route directly; foreign handles
    /// fall back to probing back-ends in registration order, treating an
    /// "unknown module" answer as a miss and anything else as fatal.
    pub async fn instantiate(&self, module_id: ModuleId) -> Result<InstanceId> {
        self.reject_if_shutting_down()?;
        self.ensure_initialized().await?;

        let owner = self
            .modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&module_id)
            .copied();

        if let Some(kind) = owner {
            let backend = self
                .registry
                .get(kind)
                .ok_or_else(|| Error::NoRuntimeAvailable {
                    reason: format!("runtime '{kind}' is not registered"),
                })?;
            let instance_id = backend.instantiate(module_id).await?;
            self.instances
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(instance_id, kind);
            return Ok(instance_id);
        }

        for backend in self.registry.iter() {
            match backend.instantiate(module_id).await {
                Ok(instance_id) => {
                    self.instances
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(instance_id, backend.kind());
                    return Ok(instance_id);
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Err(Error::ModuleNotFound {
            module_id: module_id.to_string(),
        })
    }

    /// Executes an instance under the queue bound.
    pub async fn execute(
        &self,
        instance_id: InstanceId,
        config: &ExecutionConfig,
    ) -> Result<ExecutionResult> {
        self.reject_if_shutting_down()?;
        self.ensure_initialized().await?;
        config.validate()?;

        let _permit = self.queue.acquire().await?;
        let backend = self.owning_backend(instance_id)?;
        backend.execute(instance_id, config).await
    }

    /// Destroys an instance on its owning back-end.
    pub async fn destroy(&self, instance_id: InstanceId) -> Result<()> {
        self.ensure_initialized().await?;
        let backend = self.owning_backend(instance_id)?;
        let outcome = backend.destroy(instance_id).await;
        match &outcome {
            Ok(()) | Err(Error::InstanceNotFound { .. }) => {
                self.instances
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&instance_id);
            }
            Err(_) => {}
        }
        outcome
    }

    fn owning_backend(&self, instance_id: InstanceId) -> Result<Arc<dyn Backend>> {
        let kind = self
            .instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&instance_id)
            .copied()
            .ok_or_else(|| Error::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        self.registry
            .get(kind)
            .ok_or_else(|| Error::NoRuntimeAvailable {
                reason: format!("runtime '{kind}' is not registered"),
            })
    }

    /// The primary entry: schedules, compiles, instantiates, executes,
    /// and destroys within a single call, returning the result and the
    /// runtime that served it.
    pub async fn execute_with_scheduler(
        &self,
        task: &Task,
        config: &ExecutionConfig,
    ) -> Result<(ExecutionResult, RuntimeKind)> {
        self.reject_if_shutting_down()?;
        self.ensure_initialized().await?;
        config.validate()?;

        let _permit = self.queue.acquire().await?;
        if self.config.enable_scheduler {
            self.scheduler.run(task, config).await
        } else {
            self.run_static(task, config).await
        }
    }

    /// Static-mapping fallback used when the scheduler is disabled.
    async fn run_static(
        &self,
        task: &Task,
        config: &ExecutionConfig,
    ) -> Result<(ExecutionResult, RuntimeKind)> {
        let backend = self.registry.for_language(task.language)?;
        let runtime = backend.kind();
        let module_id = backend.compile(task.code.as_bytes(), task.language).await?;
        let instance_id = backend.instantiate(module_id).await?;

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
        if !outcome.as_ref().is_ok_and(|result| result.success) {
            ctx.mark_execution_failed();
        }
        if let Err(err) = backend.destroy(instance_id).await {
            tracing::warn!(instance = %instance_id, error = %err, "destroy after execute failed");
        }
        self.security.teardown(ctx);

        Ok((outcome?, runtime))
    }

    /// Drains the queue, destroys remaining instances, and shuts every
    /// back-end down. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("controller shutting down");
        self.queue.drain().await;

        let leftover: Vec<(InstanceId, RuntimeKind)> = {
            let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
            instances.drain().collect()
        };
        for (instance_id, kind) in leftover {
            if let Some(backend) = self.registry.get(kind) {
                if let Err(err) = backend.destroy(instance_id).await {
                    tracing::debug!(instance = %instance_id, error = %err, "shutdown destroy");
                }
            }
        }
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        self.security.shutdown();
        for backend in self.registry.iter() {
            backend.shutdown().await?;
        }
        Ok(())
    }

    /// Read-only controller snapshot.
    #[must_use]
    pub fn metrics(&self) -> ControllerMetrics {
        ControllerMetrics::new(
            self.init.initialized(),
            self.registry.kinds().to_vec(),
            self.queue.capacity(),
            self.queue.pending(),
            self.scheduler.metrics(),
        )
    }

    /// Read-only security snapshot.
    #[must_use]
    pub fn security_metrics(&self) -> SecurityMetrics {
        self.security.metrics()
    }

    /// Whether an instance handle is currently tracked.
    #[must_use]
    pub fn owns_instance(&self, instance_id: InstanceId) -> bool {
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&instance_id)
    }

    /// The security coordinator, for hosts wiring capability checks into
    /// back-end edges.
    #[must_use]
    pub fn security(&self) -> &Arc<SecurityCoordinator> {
        &self.security
    }
}
