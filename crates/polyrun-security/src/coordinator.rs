//! Security coordinator: assembles and tears down per-execution contexts.
//!
//! `create_security_context` walks the layers in order: acquire a cordon
//! worker (A), derive the sandbox configuration (B), apply the OS sandbox
//! (C), pre-validate the declared capabilities (D). Teardown releases
//! them in reverse. The context releases itself on drop, so no exit path
//! (including a panicking back-end) can leak a cordon reservation or a
//! namespace handle.

use crate::capability::{CapabilityChecker, CapabilityContext};
use crate::cordon::{InProcessSlotFactory, RecyclePolicy, TrustCordon, WorkerFactory, WorkerLease};
use crate::os_sandbox::{CgroupLimits, SandboxHandles, SystemSandbox};
use crate::policy::SandboxConfig;
use polyrun_core::{
    Error, Permissions, Result, SecurityMetrics, SecurityToggles, TrustLevel,
};
use std::fmt;
use std::sync::Arc;

/// Security context scoped to exactly one execution.
///
/// Construction order is A → B → C → D; drop releases in reverse. The
/// worker lease and namespace handles are freed at most once.
pub struct SecurityContext {
    /// Trust level the context was built for
    pub trust_level: TrustLevel,
    /// Permissions the caller declared
    pub permissions: Permissions,
    /// Derived sandbox configuration (layer B)
    pub sandbox_config: SandboxConfig,
    /// Worker slot id, when process isolation is enabled
    pub process_id: Option<u64>,
    lease: Option<WorkerLease>,
    handles: Option<SandboxHandles>,
    sandbox: Arc<SystemSandbox>,
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("trust_level", &self.trust_level)
            .field("process_id", &self.process_id)
            .field(
                "namespace_handles",
                &self.handles.as_ref().map(|h| h.namespace_handles.len()),
            )
            .finish_non_exhaustive()
    }
}

impl SecurityContext {
    /// Namespace handles attached for this execution.
    #[must_use]
    pub fn namespace_handles(&self) -> &[String] {
        self.handles
            .as_ref()
            .map_or(&[], |handles| handles.namespace_handles.as_slice())
    }

    /// Installed syscall profile id, when layer C took effect.
    #[must_use]
    pub fn syscall_profile_id(&self) -> Option<&str> {
        self.handles
            .as_ref()
            .and_then(|handles| handles.syscall_profile_id.as_deref())
    }

    /// Flags the reserved worker as having served a failed execution, so
    /// it sits out its cool-down before reuse.
    pub fn mark_execution_failed(&mut self) {
        if let Some(lease) = &mut self.lease {
            lease.mark_failed();
        }
    }

    /// Releases sub-layers in reverse order of construction.
    fn release(&mut self) {
        if let Some(handles) = self.handles.take() {
            self.sandbox.release(&handles);
        }
        // Dropping the lease returns the worker to its cordon.
        self.lease.take();
    }
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        self.release();
    }
}

/// Coordinates the four security layers.
pub struct SecurityCoordinator {
    toggles: SecurityToggles,
    cordon: Arc<TrustCordon>,
    checker: Arc<CapabilityChecker>,
    sandbox: Arc<SystemSandbox>,
}

impl fmt::Debug for SecurityCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityCoordinator")
            .field("toggles", &self.toggles)
            .finish_non_exhaustive()
    }
}

impl SecurityCoordinator {
    /// Creates the coordinator with the portable in-process slot factory.
    pub fn new(toggles: SecurityToggles) -> Result<Self> {
        Self::with_factory(toggles, Arc::new(InProcessSlotFactory::default()))
    }

    /// Creates the coordinator with a platform worker factory.
    pub fn with_factory(
        toggles: SecurityToggles,
        factory: Arc<dyn WorkerFactory>,
    ) -> Result<Self> {
        let cordon = Arc::new(TrustCordon::new(factory, RecyclePolicy::default())?);
        let sandbox = Arc::new(SystemSandbox::new(toggles.enable_system_sandbox));
        Ok(Self {
            toggles,
            cordon,
            checker: Arc::new(CapabilityChecker::new()),
            sandbox,
        })
    }

    /// The capability check engine, for per-operation checks at back-end
    /// edges.
    #[must_use]
    pub fn checker(&self) -> &Arc<CapabilityChecker> {
        &self.checker
    }

    /// The trust cordons.
    #[must_use]
    pub fn cordon(&self) -> &Arc<TrustCordon> {
        &self.cordon
    }

    /// Builds the security context for one execution.
    ///
    /// Any layer failing releases the layers already built before the
    /// error surfaces.
    pub async fn create_security_context(
        &self,
        permissions: &Permissions,
    ) -> Result<SecurityContext> {
        let trust_level = permissions.trust_level;

        // Layer A: reserve a worker from the trust cordon.
        let lease = if self.toggles.enable_process_isolation {
            Some(self.cordon.acquire(trust_level).await?)
        } else {
            None
        };
        let process_id = lease.as_ref().map(WorkerLease::worker_id);

        // Layer B: derive the sandbox configuration.
        let sandbox_config = SandboxConfig::derive(permissions);

        // Layer C: apply the OS sandbox to the reserved worker.
        let handles = if let Some(worker_id) = process_id {
            let limits = CgroupLimits {
                memory_max_bytes: sandbox_config.max_memory_bytes,
                cpu_quota_pct: sandbox_config.max_cpu_pct,
            };
            match self.sandbox.apply(worker_id, trust_level, limits) {
                Ok(handles) => Some(handles),
                Err(err) => {
                    // The lease drops here, returning the worker.
                    return Err(err);
                }
            }
        } else {
            None
        };

        let mut ctx = SecurityContext {
            trust_level,
            permissions: permissions.clone(),
            sandbox_config,
            process_id,
            lease,
            handles,
            sandbox: Arc::clone(&self.sandbox),
        };

        // Layer D: pre-validate every declared capability so undeclarable
        // requests fail fast, with audit.
        if self.toggles.enable_capability_checks {
            let check_ctx = CapabilityContext::new(permissions);
            for capability in permissions.capabilities.iter().copied() {
                if !self.checker.check(capability, &check_ctx) {
                    ctx.release();
                    return Err(Error::CapabilityDenied {
                        capability: capability.to_string(),
                        reason: "pre-validation failed".to_string(),
                    });
                }
            }
        }

        tracing::debug!(
            trust_level = %trust_level,
            process_id = ?ctx.process_id,
            namespaces = ctx.namespace_handles().len(),
            "security context created"
        );
        Ok(ctx)
    }

    /// Tears a context down. Equivalent to dropping it; provided so call
    /// sites can make the teardown point explicit.
    pub fn teardown(&self, ctx: SecurityContext) {
        drop(ctx);
    }

    /// Stops the cordons and refuses further context creation through
    /// them.
    pub fn shutdown(&self) {
        self.cordon.shutdown();
    }

    /// Security snapshot across all layers.
    #[must_use]
    pub fn metrics(&self) -> SecurityMetrics {
        SecurityMetrics {
            process_isolation: self.cordon.metrics(),
            capability_checks: self.checker.metrics(),
            system_sandbox: self.sandbox.metrics(),
        }
    }
}
