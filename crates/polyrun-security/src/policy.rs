//! Sandbox policy engine.
//!
//! Derives a per-execution [`SandboxConfig`] from the declared
//! [`Permissions`]: every capability the caller did not declare becomes a
//! block, and the trust level selects the host, path, memory, CPU, and
//! timeout envelopes. [`validate_operation`] is the per-operation check
//! back-ends call at their edges.
//!
//! # Examples
//!
//! ```
//! use polyrun_core::{Capability, Permissions, TrustLevel};
//! use polyrun_security::policy::SandboxConfig;
//!
//! let perms = Permissions::for_trust_level(TrustLevel::Low);
//! let config = SandboxConfig::derive(&perms);
//! assert!(config.block_network);
//! assert!(config.blocked_syscalls.contains("socket"));
//! ```

use polyrun_core::{Capability, Permissions, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Syscalls blocked for every execution regardless of capabilities.
const BASELINE_BLOCKED: [&str; 8] = [
    "fork",
    "vfork",
    "clone",
    "execve",
    "execveat",
    "ptrace",
    "process_vm_readv",
    "process_vm_writev",
];

/// Network primitives blocked when `NetworkAccess` is not declared.
const NETWORK_BLOCKED: [&str; 8] = [
    "socket",
    "connect",
    "bind",
    "listen",
    "accept",
    "accept4",
    "sendto",
    "recvfrom",
];

/// Write-path syscalls blocked when `FileSystemWrite` is not declared.
const FS_WRITE_BLOCKED: [&str; 9] = [
    "creat",
    "rename",
    "renameat",
    "unlink",
    "unlinkat",
    "mkdir",
    "mkdirat",
    "truncate",
    "ftruncate",
];

/// Open-path syscalls blocked when `FileSystemRead` is not declared.
const FS_READ_BLOCKED: [&str; 3] = ["open", "openat", "openat2"];

/// An operation a back-end wants to perform on behalf of guest code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxOperation {
    /// Outbound connection
    NetworkConnect {
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },
    /// Filesystem read
    FileRead {
        /// Path being opened
        path: PathBuf,
    },
    /// Filesystem write
    FileWrite {
        /// Path being created or modified
        path: PathBuf,
    },
    /// Subprocess spawn
    SpawnProcess {
        /// Command being spawned
        command: String,
    },
}

/// Per-execution sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Whether outbound network is blocked
    pub block_network: bool,
    /// Whether filesystem reads are blocked
    pub block_fs_read: bool,
    /// Whether filesystem writes are blocked
    pub block_fs_write: bool,
    /// Whether subprocess spawning is blocked
    pub block_process_spawn: bool,
    /// Syscall names denied to the worker
    pub blocked_syscalls: BTreeSet<String>,
    /// Hosts reachable when network is allowed; `*` means any
    pub allowed_hosts: Vec<String>,
    /// Path prefixes readable/writable when filesystem access is allowed
    pub allowed_paths: Vec<PathBuf>,
    /// Memory envelope for the worker, bytes
    pub max_memory_bytes: u64,
    /// CPU envelope, percent of one core
    pub max_cpu_pct: u32,
    /// Wall-clock envelope
    pub timeout: Duration,
    /// Trust level the envelopes were selected for
    pub trust_level: TrustLevel,
}

impl SandboxConfig {
    /// Derives the configuration for one execution.
    #[must_use]
    pub fn derive(permissions: &Permissions) -> Self {
        let block_network = !permissions.holds(Capability::NetworkAccess);
        let block_fs_read = !permissions.holds(Capability::FileSystemRead);
        let block_fs_write = !permissions.holds(Capability::FileSystemWrite);
        let block_process_spawn = !permissions.holds(Capability::ProcessSpawn);

        let mut blocked_syscalls: BTreeSet<String> =
            BASELINE_BLOCKED.iter().map(ToString::to_string).collect();
        if block_network {
            blocked_syscalls.extend(NETWORK_BLOCKED.iter().map(ToString::to_string));
        }
        if block_fs_write {
            blocked_syscalls.extend(FS_WRITE_BLOCKED.iter().map(ToString::to_string));
        }
        if block_fs_read {
            blocked_syscalls.extend(FS_READ_BLOCKED.iter().map(ToString::to_string));
        }

        let trust_level = permissions.trust_level;
        let (allowed_hosts, allowed_paths, max_memory_bytes, max_cpu_pct, timeout) =
            match trust_level {
                TrustLevel::Low => (
                    Vec::new(),
                    vec![PathBuf::from("/tmp/sandbox")],
                    128 * 1024 * 1024,
                    25,
                    Duration::from_secs(30),
                ),
                TrustLevel::Medium => (
                    vec![
                        "localhost".to_string(),
                        "127.0.0.1".to_string(),
                        "::1".to_string(),
                    ],
                    vec![
                        PathBuf::from("/tmp/sandbox"),
                        PathBuf::from("/usr/share"),
                        PathBuf::from("/etc/ssl"),
                    ],
                    512 * 1024 * 1024,
                    50,
                    Duration::from_secs(5 * 60),
                ),
                TrustLevel::High => (
                    vec!["*".to_string()],
                    vec![PathBuf::from("/")],
                    2 * 1024 * 1024 * 1024,
                    100,
                    Duration::from_secs(30 * 60),
                ),
            };

        Self {
            block_network,
            block_fs_read,
            block_fs_write,
            block_process_spawn,
            blocked_syscalls,
            allowed_hosts,
            allowed_paths,
            max_memory_bytes,
            max_cpu_pct,
            timeout,
            trust_level,
        }
    }

    /// Returns `true` if the host is reachable under this configuration.
    #[must_use]
    pub fn host_allowed(&self, host: &str) -> bool {
        !self.block_network
            && self
                .allowed_hosts
                .iter()
                .any(|allowed| allowed == "*" || allowed == host)
    }

    /// Returns `true` if the path sits under an allowed prefix.
    #[must_use]
    pub fn path_allowed(&self, path: &Path) -> bool {
        self.allowed_paths
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }
}

/// Checks one operation against the derived configuration.
///
/// Back-ends call this at their edges; a `false` verdict means the
/// operation must be refused and reported as a capability denial.
#[must_use]
pub fn validate_operation(op: &SandboxOperation, config: &SandboxConfig) -> bool {
    match op {
        SandboxOperation::NetworkConnect { host, .. } => config.host_allowed(host),
        SandboxOperation::FileRead { path } => !config.block_fs_read && config.path_allowed(path),
        SandboxOperation::FileWrite { path } => {
            !config.block_fs_write && config.path_allowed(path)
        }
        SandboxOperation::SpawnProcess { .. } => !config.block_process_spawn,
    }
}
