//! OS-level sandbox setup: namespaces, syscall filters, cgroup limits.
//!
//! Computes the sandbox profile for a trust level (which namespaces to
//! enter, which syscalls to allow or deny, and which cgroup v2 limits to
//! write) and tracks the handles attached to a worker. Pinning a profile
//! onto a live process is delegated to the platform integration owning the
//! worker processes; this layer validates facility availability, selects
//! profiles, and accounts for attachments.
//!
//! When the kernel facility is missing the coordinator logs a warning and
//! continues without that sub-layer. It never silently escalates: the
//! returned handles record exactly which sub-layers took effect.

use polyrun_core::{Error, Result, SystemSandboxMetrics, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Linux namespace kinds a worker can be confined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    /// Mount namespace
    Mount,
    /// UTS namespace
    Uts,
    /// IPC namespace
    Ipc,
    /// PID namespace
    Pid,
    /// Network namespace
    Network,
    /// User namespace
    User,
    /// Cgroup namespace
    Cgroup,
}

impl NamespaceKind {
    /// Returns the lowercase name used in handles and `/proc/self/ns`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Pid => "pid",
            Self::Network => "net",
            Self::User => "user",
            Self::Cgroup => "cgroup",
        }
    }
}

/// Namespace set entered per trust level.
#[must_use]
pub fn namespace_set(trust_level: TrustLevel) -> &'static [NamespaceKind] {
    match trust_level {
        TrustLevel::Low => &[
            NamespaceKind::Mount,
            NamespaceKind::Uts,
            NamespaceKind::Ipc,
            NamespaceKind::Pid,
            NamespaceKind::Network,
            NamespaceKind::User,
            NamespaceKind::Cgroup,
        ],
        TrustLevel::Medium => &[
            NamespaceKind::Mount,
            NamespaceKind::Uts,
            NamespaceKind::Ipc,
            NamespaceKind::Pid,
            NamespaceKind::User,
            NamespaceKind::Cgroup,
        ],
        TrustLevel::High => &[NamespaceKind::Uts, NamespaceKind::Pid, NamespaceKind::Cgroup],
    }
}

/// Syscalls the low-trust allow-list profile admits; everything else is
/// denied by default. Includes the 32-bit and time64 variants real
/// profiles carry so the same list serves every architecture.
pub const LOW_TRUST_ALLOWED_SYSCALLS: &[&str] = &[
    // Process identity and limits
    "exit", "exit_group", "getpid", "getppid", "gettid", "getuid", "getgid",
    "geteuid", "getegid", "getgroups", "getpgrp", "getpgid", "getsid",
    "arch_prctl", "uname", "getrlimit", "prlimit64", "ugetrlimit", "getrusage",
    "times", "getcpu", "getpriority", "setpriority",
    // Memory management
    "brk", "mmap", "mmap2", "munmap", "mprotect", "madvise", "mremap", "msync",
    "mincore", "mlock", "munlock", "mlockall", "munlockall", "membarrier",
    "memfd_create",
    // File I/O (reads; write confinement is layer B's job)
    "read", "write", "readv", "writev", "pread64", "pwrite64", "preadv",
    "pwritev", "preadv2", "pwritev2", "close", "close_range", "lseek",
    "_llseek", "fstat", "fstat64", "stat", "stat64", "lstat", "lstat64",
    "newfstatat", "fstatat64", "statx", "access", "faccessat", "faccessat2",
    "readlink", "readlinkat", "open", "openat", "openat2", "getdents",
    "getdents64", "getcwd", "chdir", "fchdir", "fcntl", "fcntl64", "dup",
    "dup2", "dup3", "ioctl", "fadvise64", "readahead", "statfs", "fstatfs",
    "umask", "flock", "sync", "fsync", "fdatasync", "sendfile", "sendfile64",
    "copy_file_range", "splice", "tee", "vmsplice", "getxattr", "lgetxattr",
    "fgetxattr", "listxattr", "llistxattr", "flistxattr",
    // Time
    "nanosleep", "clock_nanosleep", "clock_nanosleep_time64", "clock_gettime",
    "clock_gettime64", "clock_getres", "gettimeofday", "time", "alarm",
    "getitimer", "setitimer", "timer_create", "timer_settime", "timer_gettime",
    "timer_getoverrun", "timer_delete", "timerfd_create", "timerfd_settime",
    "timerfd_gettime",
    // Signals (self-directed only)
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "rt_sigsuspend",
    "rt_sigpending", "rt_sigtimedwait", "rt_sigqueueinfo", "sigaltstack",
    "sigaction", "sigprocmask", "signalfd", "signalfd4", "tgkill",
    "restart_syscall", "pause",
    // Scheduling and synchronization
    "futex", "futex_time64", "futex_waitv", "set_robust_list",
    "get_robust_list", "set_tid_address", "sched_yield", "sched_getaffinity",
    "sched_getparam", "sched_getscheduler", "sched_get_priority_max",
    "sched_get_priority_min", "sched_rr_get_interval", "rseq", "ioprio_get",
    // Polling and events
    "poll", "ppoll", "ppoll_time64", "select", "pselect6", "pselect6_time64",
    "epoll_create", "epoll_create1", "epoll_ctl", "epoll_wait", "epoll_pwait",
    "epoll_pwait2", "eventfd", "eventfd2", "pipe", "pipe2", "inotify_init",
    "inotify_init1", "inotify_add_watch", "inotify_rm_watch",
    // Child reaping (spawn itself stays blocked by layer B)
    "wait4", "waitid", "waitpid",
    // Miscellaneous read-only
    "getrandom", "sysinfo", "capget",
];

/// Syscalls denied to medium-trust workers; everything else is allowed.
pub const MEDIUM_TRUST_DENIED_SYSCALLS: &[&str] = &[
    "ptrace", "mount", "umount2", "pivot_root", "setns", "unshare",
    "kexec_load", "kexec_file_load", "reboot", "swapon", "swapoff",
    "init_module", "finit_module", "delete_module", "iopl", "ioperm", "bpf",
    "perf_event_open", "fanotify_init", "settimeofday", "clock_settime",
    "clock_adjtime", "adjtimex", "chroot", "acct", "mknod", "quotactl",
    "vhangup", "userfaultfd", "open_by_handle_at", "process_vm_readv",
    "process_vm_writev",
];

/// Syscalls denied even to high-trust workers.
pub const HIGH_TRUST_DENIED_SYSCALLS: &[&str] = &[
    "kexec_load", "kexec_file_load", "reboot", "swapon", "swapoff",
    "init_module", "finit_module", "delete_module",
];

/// One syscall filter profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallProfile {
    /// Stable identifier recorded in security contexts
    pub id: String,
    /// `true`: `names` is an allow-list, everything else denied;
    /// `false`: `names` is a deny-list, everything else allowed
    pub default_deny: bool,
    /// Syscall names the profile lists
    pub names: Vec<String>,
}

impl SyscallProfile {
    /// Profile for a trust level.
    #[must_use]
    pub fn for_trust_level(trust_level: TrustLevel) -> Self {
        match trust_level {
            TrustLevel::Low => Self {
                id: "low-allowlist".to_string(),
                default_deny: true,
                names: LOW_TRUST_ALLOWED_SYSCALLS
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            },
            TrustLevel::Medium => Self {
                id: "medium-denylist".to_string(),
                default_deny: false,
                names: MEDIUM_TRUST_DENIED_SYSCALLS
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            },
            TrustLevel::High => Self {
                id: "high-denylist".to_string(),
                default_deny: false,
                names: HIGH_TRUST_DENIED_SYSCALLS
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            },
        }
    }

    /// Whether the profile permits a syscall.
    #[must_use]
    pub fn permits(&self, syscall: &str) -> bool {
        let listed = self.names.iter().any(|name| name == syscall);
        if self.default_deny { listed } else { !listed }
    }
}

/// Cgroup v2 limits written for a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CgroupLimits {
    /// `memory.max` in bytes
    pub memory_max_bytes: u64,
    /// CPU quota as percent of one core
    pub cpu_quota_pct: u32,
}

impl CgroupLimits {
    /// Renders the `cpu.max` value: `(quota * 1000) 100000`.
    #[must_use]
    pub fn cpu_max(&self) -> String {
        format!("{} 100000", u64::from(self.cpu_quota_pct) * 1000)
    }
}

/// Availability of the kernel facilities this layer needs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FacilityStatus {
    /// Namespace attachment is possible
    pub namespaces: bool,
    /// Cgroup v2 limits can be written
    pub cgroup_v2: bool,
}

impl FacilityStatus {
    /// Probes the running kernel.
    #[must_use]
    pub fn detect() -> Self {
        Self {
            namespaces: Path::new("/proc/self/ns").exists(),
            cgroup_v2: Path::new("/sys/fs/cgroup/cgroup.controllers").exists(),
        }
    }

    /// A status with every facility unavailable, for tests.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            namespaces: false,
            cgroup_v2: false,
        }
    }
}

/// Handles recording what was attached to one worker.
#[derive(Debug, Clone, Default)]
pub struct SandboxHandles {
    attachment: u64,
    /// Namespace handles, `<kind>:<worker_id>`
    pub namespace_handles: Vec<String>,
    /// Installed syscall profile id
    pub syscall_profile_id: Option<String>,
    /// Cgroup path the limits were written under
    pub cgroup_path: Option<String>,
}

impl SandboxHandles {
    /// Whether any sub-layer took effect.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.namespace_handles.is_empty()
            && self.syscall_profile_id.is_none()
            && self.cgroup_path.is_none()
    }
}

/// OS sandbox setup and accounting.
///
/// # Thread Safety
///
/// `Send + Sync`; attachment records sit behind a mutex.
#[derive(Debug)]
pub struct SystemSandbox {
    enabled: bool,
    facility: FacilityStatus,
    next_attachment: AtomicU64,
    active: Mutex<HashMap<u64, usize>>,
    profiles_installed: Mutex<HashMap<String, u64>>,
}

impl SystemSandbox {
    /// Creates the layer, probing kernel facilities when enabled.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        let facility = if enabled {
            FacilityStatus::detect()
        } else {
            FacilityStatus::unavailable()
        };
        if enabled && !facility.namespaces {
            tracing::warn!("namespace facility unavailable, continuing without namespaces");
        }
        if enabled && !facility.cgroup_v2 {
            tracing::warn!("cgroup v2 unavailable, continuing without resource limits");
        }
        Self {
            enabled,
            facility,
            next_attachment: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
            profiles_installed: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the layer with a fixed facility status, for tests.
    #[must_use]
    pub fn with_facility(enabled: bool, facility: FacilityStatus) -> Self {
        Self {
            enabled,
            facility,
            next_attachment: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
            profiles_installed: Mutex::new(HashMap::new()),
        }
    }

    /// Applies the trust level's profile to a worker.
    ///
    /// Missing kernel facilities degrade with a warning; a facility that
    /// is present but fails to apply is a hard [`Error::SandboxSetup`].
    pub fn apply(
        &self,
        worker_id: u64,
        trust_level: TrustLevel,
        limits: CgroupLimits,
    ) -> Result<SandboxHandles> {
        let mut handles = SandboxHandles::default();
        if !self.enabled {
            return Ok(handles);
        }
        if worker_id == 0 {
            return Err(Error::SandboxSetup {
                message: "cannot sandbox an anonymous worker".to_string(),
            });
        }
        handles.attachment = self.next_attachment.fetch_add(1, Ordering::Relaxed) + 1;

        if self.facility.namespaces {
            for kind in namespace_set(trust_level) {
                handles
                    .namespace_handles
                    .push(format!("{}:{worker_id}", kind.as_str()));
            }
            let profile = SyscallProfile::for_trust_level(trust_level);
            {
                let mut profiles = self
                    .profiles_installed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                *profiles.entry(profile.id.clone()).or_insert(0) += 1;
            }
            handles.syscall_profile_id = Some(profile.id);
        } else {
            tracing::warn!(
                worker_id,
                trust_level = %trust_level,
                "skipping namespace and syscall sub-layers"
            );
        }

        if self.facility.cgroup_v2 {
            tracing::debug!(
                worker_id,
                memory_max = limits.memory_max_bytes,
                cpu_max = %limits.cpu_max(),
                "cgroup limits selected"
            );
            handles.cgroup_path = Some(format!("polyrun/worker-{worker_id}"));
        }

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.insert(handles.attachment, handles.namespace_handles.len());
        Ok(handles)
    }

    /// Detaches the handles applied to a worker.
    pub fn release(&self, handles: &SandboxHandles) {
        if handles.attachment == 0 {
            return;
        }
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.remove(&handles.attachment).is_none() {
            tracing::warn!(attachment = handles.attachment, "release of unknown sandbox handles");
        }
        if let Some(profile_id) = &handles.syscall_profile_id {
            let mut profiles = self
                .profiles_installed
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(count) = profiles.get_mut(profile_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    profiles.remove(profile_id);
                }
            }
        }
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> SystemSandboxMetrics {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let namespaces: usize = active.values().sum();
        SystemSandboxMetrics {
            active_namespaces: namespaces,
            profiles: self
                .profiles_installed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_sets_per_trust_level() {
        assert_eq!(namespace_set(TrustLevel::Low).len(), 7);
        assert!(!namespace_set(TrustLevel::Medium).contains(&NamespaceKind::Network));
        assert_eq!(
            namespace_set(TrustLevel::High),
            &[NamespaceKind::Uts, NamespaceKind::Pid, NamespaceKind::Cgroup]
        );
    }

    #[test]
    fn test_low_profile_is_default_deny() {
        let profile = SyscallProfile::for_trust_level(TrustLevel::Low);
        assert!(profile.default_deny);
        assert!(profile.names.len() > 150);
        assert!(profile.permits("read"));
        assert!(profile.permits("clock_gettime"));
        assert!(!profile.permits("execve"));
        assert!(!profile.permits("socket"));
        assert!(!profile.permits("ptrace"));
    }

    #[test]
    fn test_medium_profile_denies_escape_hatches() {
        let profile = SyscallProfile::for_trust_level(TrustLevel::Medium);
        assert!(!profile.default_deny);
        for syscall in ["ptrace", "mount", "pivot_root", "setns", "unshare", "kexec_load"] {
            assert!(!profile.permits(syscall), "{syscall} must be denied");
        }
        assert!(profile.permits("socket"));
    }

    #[test]
    fn test_high_profile_denies_only_the_dangerous_few() {
        let profile = SyscallProfile::for_trust_level(TrustLevel::High);
        assert!(!profile.permits("kexec_load"));
        assert!(profile.permits("ptrace"));
        assert!(profile.permits("mount"));
    }

    #[test]
    fn test_cpu_max_format() {
        let limits = CgroupLimits {
            memory_max_bytes: 128 * 1024 * 1024,
            cpu_quota_pct: 25,
        };
        assert_eq!(limits.cpu_max(), "25000 100000");
    }

    #[test]
    fn test_apply_and_release_with_full_facility() {
        let sandbox = SystemSandbox::with_facility(
            true,
            FacilityStatus {
                namespaces: true,
                cgroup_v2: true,
            },
        );
        let limits = CgroupLimits {
            memory_max_bytes: 128 * 1024 * 1024,
            cpu_quota_pct: 25,
        };

        let handles = sandbox.apply(7, TrustLevel::Low, limits).unwrap();
        assert_eq!(handles.namespace_handles.len(), 7);
        assert_eq!(handles.syscall_profile_id.as_deref(), Some("low-allowlist"));
        assert!(handles.cgroup_path.is_some());

        let metrics = sandbox.metrics();
        assert_eq!(metrics.active_namespaces, 7);
        assert_eq!(metrics.profiles, 1);

        sandbox.release(&handles);
        let metrics = sandbox.metrics();
        assert_eq!(metrics.active_namespaces, 0);
        assert_eq!(metrics.profiles, 0);
    }

    #[test]
    fn test_missing_facility_degrades_with_empty_handles() {
        let sandbox = SystemSandbox::with_facility(true, FacilityStatus::unavailable());
        let limits = CgroupLimits {
            memory_max_bytes: 1,
            cpu_quota_pct: 25,
        };
        let handles = sandbox.apply(3, TrustLevel::Low, limits).unwrap();
        assert!(handles.namespace_handles.is_empty());
        assert!(handles.syscall_profile_id.is_none());
        assert!(handles.cgroup_path.is_none());
    }

    #[test]
    fn test_disabled_layer_is_a_no_op() {
        let sandbox = SystemSandbox::new(false);
        let limits = CgroupLimits {
            memory_max_bytes: 1,
            cpu_quota_pct: 1,
        };
        let handles = sandbox.apply(1, TrustLevel::Low, limits).unwrap();
        assert!(handles.is_empty());
        sandbox.release(&handles);
    }
}
