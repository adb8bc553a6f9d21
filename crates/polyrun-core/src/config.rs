//! Controller configuration.
//!
//! All keys are optional in the serialized form; defaults follow the
//! documented configuration surface. Host applications typically
//! deserialize this from their own config layer and pass it to the
//! controller constructor.

use crate::types::{RuntimeKind, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-runtime enablement and opaque back-end configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeToggle {
    /// Whether the back-end is loaded at init
    pub enabled: bool,
    /// Back-end-specific opaque configuration blob
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl RuntimeToggle {
    /// An enabled toggle with no back-end-specific configuration.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            config: None,
        }
    }

    /// A disabled toggle.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: None,
        }
    }
}

/// Security sub-layer toggles.
///
/// Disabling a layer is intended for tests on platforms where the OS
/// primitives are unavailable; it never silently escalates privileges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityToggles {
    /// Layer A: pre-spawned trust cordons
    pub enable_process_isolation: bool,
    /// Layer C: namespaces, syscall filters, cgroup limits
    pub enable_system_sandbox: bool,
    /// Layer D: capability check engine
    pub enable_capability_checks: bool,
    /// Trust level assumed when the caller provides none
    pub default_trust_level: TrustLevel,
}

impl Default for SecurityToggles {
    fn default() -> Self {
        Self {
            enable_process_isolation: true,
            enable_system_sandbox: true,
            enable_capability_checks: true,
            default_trust_level: TrustLevel::Low,
        }
    }
}

/// `(min, max)` pool sizes for one trust cordon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CordonSizing {
    /// Workers kept warm at all times
    pub min: usize,
    /// Hard cap on concurrently live workers
    pub max: usize,
}

impl CordonSizing {
    /// Default sizing per trust level: Low (5, 50), Medium (3, 30),
    /// High (2, 20).
    #[must_use]
    pub fn default_for(trust_level: TrustLevel) -> Self {
        match trust_level {
            TrustLevel::Low => Self { min: 5, max: 50 },
            TrustLevel::Medium => Self { min: 3, max: 30 },
            TrustLevel::High => Self { min: 2, max: 20 },
        }
    }
}

/// Top-level controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Bound on concurrently dispatched executions (queue limit)
    pub concurrency: usize,
    /// Whether `execute_with_scheduler` consults the intelligent scheduler;
    /// when false it falls back to the static language mapping
    pub enable_scheduler: bool,
    /// Per-runtime enablement
    pub runtimes: BTreeMap<RuntimeKind, RuntimeToggle>,
    /// Security sub-layer toggles
    pub security: SecurityToggles,
}

impl ControllerConfig {
    /// Default queue bound.
    pub const DEFAULT_CONCURRENCY: usize = 100;

    /// Returns `true` if the given runtime kind is enabled.
    ///
    /// Runtimes absent from the map are treated as enabled; the map only
    /// records explicit overrides.
    #[must_use]
    pub fn runtime_enabled(&self, kind: RuntimeKind) -> bool {
        self.runtimes.get(&kind).is_none_or(|t| t.enabled)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: Self::DEFAULT_CONCURRENCY,
            enable_scheduler: true,
            runtimes: BTreeMap::new(),
            security: SecurityToggles::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.concurrency, 100);
        assert!(config.enable_scheduler);
        assert!(config.security.enable_capability_checks);
        assert_eq!(config.security.default_trust_level, TrustLevel::Low);
    }

    #[test]
    fn test_runtime_enabled_defaults_to_true() {
        let mut config = ControllerConfig::default();
        assert!(config.runtime_enabled(RuntimeKind::Wasm));

        config
            .runtimes
            .insert(RuntimeKind::Firecracker, RuntimeToggle::disabled());
        assert!(!config.runtime_enabled(RuntimeKind::Firecracker));
        assert!(config.runtime_enabled(RuntimeKind::Ebpf));
    }

    #[test]
    fn test_cordon_sizing_defaults() {
        assert_eq!(
            CordonSizing::default_for(TrustLevel::Low),
            CordonSizing { min: 5, max: 50 }
        );
        assert_eq!(
            CordonSizing::default_for(TrustLevel::Medium),
            CordonSizing { min: 3, max: 30 }
        );
        assert_eq!(
            CordonSizing::default_for(TrustLevel::High),
            CordonSizing { min: 2, max: 20 }
        );
    }
}
