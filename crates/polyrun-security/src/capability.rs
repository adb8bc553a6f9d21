//! Capability check engine.
//!
//! Each [`Capability`] carries a policy: an optional validator over the
//! request context, an optional rate limit keyed by
//! `(trust_level, capability)`, and an audit-required flag. A check passes
//! only when the context holds the capability, the rate window has room,
//! and the validator accepts the context. Every denial is written to the
//! append-only audit ring even when auditing is optional for that
//! capability.
//!
//! # Examples
//!
//! ```
//! use polyrun_core::{Capability, Permissions, TrustLevel};
//! use polyrun_security::{CapabilityChecker, CapabilityContext};
//!
//! let checker = CapabilityChecker::new();
//! let ctx = CapabilityContext::new(&Permissions::for_trust_level(TrustLevel::Low));
//!
//! // Not declared, so the check is denied and audited.
//! assert!(!checker.check(Capability::FileSystemRead, &ctx));
//! assert_eq!(checker.audit_snapshot().len(), 1);
//! ```

use chrono::Utc;
use polyrun_core::{
    AuditEntry, Capability, CapabilityCheckMetrics, Permissions, RingBuffer, TrustLevel,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Audit ring capacity; oldest entries drop first.
const AUDIT_CAPACITY: usize = 10_000;

/// Hosts no guest may reach regardless of declared capabilities.
const BLOCKED_HOSTS: [&str; 2] = ["169.254.169.254", "metadata.google.internal"];

/// Ports no guest may reach regardless of declared capabilities.
const BLOCKED_PORTS: [u16; 5] = [22, 23, 25, 445, 3389];

/// Commands the spawn validator admits.
const SPAWN_WHITELIST: [&str; 5] = ["echo", "cat", "ls", "pwd", "date"];

/// Request context a capability check runs against.
#[derive(Debug, Clone)]
pub struct CapabilityContext {
    /// Trust level of the execution
    pub trust_level: TrustLevel,
    /// Capabilities the execution declared
    pub held: BTreeSet<Capability>,
    /// Target host, for network checks
    pub host: Option<String>,
    /// Target port, for network checks
    pub port: Option<u16>,
    /// Target path, for filesystem checks
    pub path: Option<PathBuf>,
    /// Command, for spawn checks
    pub command: Option<String>,
}

impl CapabilityContext {
    /// Creates a context from the execution's permissions.
    #[must_use]
    pub fn new(permissions: &Permissions) -> Self {
        Self {
            trust_level: permissions.trust_level,
            held: permissions.capabilities.clone(),
            host: None,
            port: None,
            path: None,
            command: None,
        }
    }

    /// Sets the target host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the target port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the target path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the command to spawn.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// Validator verdict: `None` grants, `Some(reason)` denies.
type Validator = Box<dyn Fn(&CapabilityContext) -> Option<String> + Send + Sync>;

/// Rate limit: at most `count` checks per `window`.
#[derive(Debug, Clone, Copy)]
struct RateLimit {
    count: u32,
    window: Duration,
}

/// Policy attached to one capability.
struct CapabilityPolicy {
    validator: Option<Validator>,
    rate_limit: Option<RateLimit>,
    audit_required: bool,
}

impl std::fmt::Debug for CapabilityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityPolicy")
            .field("has_validator", &self.validator.is_some())
            .field("rate_limit", &self.rate_limit)
            .field("audit_required", &self.audit_required)
            .finish()
    }
}

/// One rate window, reset by comparing against its start.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started: Instant,
    count: u32,
}

/// Capability check engine with audit ring and rate limiting.
///
/// # Thread Safety
///
/// `Send + Sync`; rate windows sit behind a mutex, audit and counters are
/// lock-free appends and atomics.
#[derive(Debug)]
pub struct CapabilityChecker {
    policies: BTreeMap<Capability, CapabilityPolicy>,
    windows: Mutex<HashMap<(TrustLevel, Capability), RateWindow>>,
    audit: RingBuffer<AuditEntry>,
    total_checks: AtomicU64,
    denied_checks: AtomicU64,
    by_capability: Mutex<BTreeMap<Capability, u64>>,
}

impl Default for CapabilityChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityChecker {
    /// Creates the engine with the built-in policy table.
    #[must_use]
    pub fn new() -> Self {
        let mut policies: BTreeMap<Capability, CapabilityPolicy> = BTreeMap::new();

        policies.insert(
            Capability::NetworkAccess,
            CapabilityPolicy {
                validator: Some(Box::new(network_validator)),
                rate_limit: Some(RateLimit {
                    count: 100,
                    window: Duration::from_secs(60),
                }),
                audit_required: true,
            },
        );
        policies.insert(
            Capability::FileSystemRead,
            CapabilityPolicy {
                validator: None,
                rate_limit: Some(RateLimit {
                    count: 200,
                    window: Duration::from_secs(60),
                }),
                audit_required: false,
            },
        );
        policies.insert(
            Capability::FileSystemWrite,
            CapabilityPolicy {
                validator: Some(Box::new(fs_write_validator)),
                rate_limit: Some(RateLimit {
                    count: 50,
                    window: Duration::from_secs(60),
                }),
                audit_required: true,
            },
        );
        policies.insert(
            Capability::ProcessSpawn,
            CapabilityPolicy {
                validator: Some(Box::new(spawn_validator)),
                rate_limit: Some(RateLimit {
                    count: 10,
                    window: Duration::from_secs(60),
                }),
                audit_required: true,
            },
        );
        policies.insert(
            Capability::SystemTime,
            CapabilityPolicy {
                validator: None,
                rate_limit: None,
                audit_required: false,
            },
        );
        policies.insert(
            Capability::EnvironmentVariables,
            CapabilityPolicy {
                validator: None,
                rate_limit: None,
                audit_required: true,
            },
        );
        policies.insert(
            Capability::SharedMemory,
            CapabilityPolicy {
                validator: None,
                rate_limit: Some(RateLimit {
                    count: 20,
                    window: Duration::from_secs(60),
                }),
                audit_required: false,
            },
        );
        policies.insert(
            Capability::CpuIntensive,
            CapabilityPolicy {
                validator: None,
                rate_limit: None,
                audit_required: false,
            },
        );
        policies.insert(
            Capability::GpuAccess,
            CapabilityPolicy {
                validator: None,
                rate_limit: Some(RateLimit {
                    count: 5,
                    window: Duration::from_secs(60),
                }),
                audit_required: true,
            },
        );

        Self {
            policies,
            windows: Mutex::new(HashMap::new()),
            audit: RingBuffer::new(AUDIT_CAPACITY),
            total_checks: AtomicU64::new(0),
            denied_checks: AtomicU64::new(0),
            by_capability: Mutex::new(BTreeMap::new()),
        }
    }

    /// Checks one capability against a context.
    ///
    /// Returns `true` iff the context holds the capability, the rate
    /// window is not exceeded, and the validator accepts the context.
    pub fn check(&self, capability: Capability, ctx: &CapabilityContext) -> bool {
        self.total_checks.fetch_add(1, Ordering::Relaxed);
        {
            let mut by_cap = self.by_capability.lock().unwrap_or_else(|e| e.into_inner());
            *by_cap.entry(capability).or_insert(0) += 1;
        }

        if !ctx.held.contains(&capability) {
            self.deny(capability, ctx, "capability not declared");
            return false;
        }

        let Some(policy) = self.policies.get(&capability) else {
            self.deny(capability, ctx, "no policy registered");
            return false;
        };

        if let Some(limit) = policy.rate_limit {
            if !self.rate_window_admits(capability, ctx.trust_level, limit) {
                self.deny(capability, ctx, "rate limit exceeded");
                return false;
            }
        }

        if let Some(validator) = &policy.validator {
            if let Some(reason) = validator(ctx) {
                self.deny(capability, ctx, &reason);
                return false;
            }
        }

        if policy.audit_required {
            self.audit.push(AuditEntry {
                capability,
                granted: true,
                timestamp: Utc::now(),
                trust_level: ctx.trust_level,
                detail: None,
            });
        }
        true
    }

    fn rate_window_admits(
        &self,
        capability: Capability,
        trust_level: TrustLevel,
        limit: RateLimit,
    ) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let window = windows
            .entry((trust_level, capability))
            .or_insert(RateWindow {
                started: now,
                count: 0,
            });
        if now.duration_since(window.started) >= limit.window {
            window.started = now;
            window.count = 0;
        }
        window.count += 1;
        window.count <= limit.count
    }

    fn deny(&self, capability: Capability, ctx: &CapabilityContext, reason: &str) {
        self.denied_checks.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            capability = %capability,
            trust_level = %ctx.trust_level,
            reason,
            "capability denied"
        );
        // Denials are always audited, audit_required or not.
        self.audit.push(AuditEntry {
            capability,
            granted: false,
            timestamp: Utc::now(),
            trust_level: ctx.trust_level,
            detail: Some(reason.to_string()),
        });
    }

    /// Snapshot of the audit ring, oldest first.
    #[must_use]
    pub fn audit_snapshot(&self) -> Vec<AuditEntry> {
        self.audit.snapshot()
    }

    /// Snapshot of the engine counters.
    #[must_use]
    pub fn metrics(&self) -> CapabilityCheckMetrics {
        CapabilityCheckMetrics {
            total: self.total_checks.load(Ordering::Relaxed),
            denied: self.denied_checks.load(Ordering::Relaxed),
            by_capability: self
                .by_capability
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

/// Rejects link-local metadata endpoints and administrative ports.
fn network_validator(ctx: &CapabilityContext) -> Option<String> {
    if let Some(host) = &ctx.host {
        if BLOCKED_HOSTS.contains(&host.as_str()) {
            return Some(format!("host '{host}' is blocked"));
        }
    }
    if let Some(port) = ctx.port {
        if BLOCKED_PORTS.contains(&port) {
            return Some(format!("port {port} is blocked"));
        }
    }
    None
}

/// Confines writes to the sandbox scratch area except at high trust.
fn fs_write_validator(ctx: &CapabilityContext) -> Option<String> {
    if ctx.trust_level == TrustLevel::High {
        return None;
    }
    match &ctx.path {
        Some(path) if path.starts_with("/tmp/sandbox") => None,
        Some(path) => Some(format!("write outside sandbox area: {}", path.display())),
        None => None,
    }
}

/// Admits only the whitelisted command set.
fn spawn_validator(ctx: &CapabilityContext) -> Option<String> {
    match &ctx.command {
        Some(command) => {
            let program = command.split_whitespace().next().unwrap_or(command);
            if SPAWN_WHITELIST.contains(&program) {
                None
            } else {
                Some(format!("command '{program}' is not whitelisted"))
            }
        }
        None => None,
    }
}
