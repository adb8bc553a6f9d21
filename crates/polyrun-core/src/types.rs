//! Domain enums and identifier types.
//!
//! Strong types for languages, runtime kinds, trust levels, capabilities,
//! workload profiles, and the opaque module/instance handles minted by
//! back-ends. Identifiers follow the newtype pattern so handles from
//! different domains cannot be mixed up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Source language declared for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Rust source, expected as a precompiled wasm artifact
    Rust,
    /// JavaScript source
    JavaScript,
    /// TypeScript source
    TypeScript,
    /// Python source
    Python,
    /// Go source, expected as a precompiled wasm artifact
    Go,
    /// C source
    C,
    /// C++ source
    Cpp,
    /// WebAssembly, binary or WAT text
    Wasm,
}

impl Language {
    /// Returns the lowercase wire name of the language.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Python => "python",
            Self::Go => "go",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Wasm => "wasm",
        }
    }

    /// Returns `true` for the JavaScript family (JavaScript or TypeScript).
    #[must_use]
    pub fn is_javascript_family(self) -> bool {
        matches!(self, Self::JavaScript | Self::TypeScript)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Language {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rust" => Ok(Self::Rust),
            "javascript" | "js" => Ok(Self::JavaScript),
            "typescript" | "ts" => Ok(Self::TypeScript),
            "python" | "py" => Ok(Self::Python),
            "go" => Ok(Self::Go),
            "c" => Ok(Self::C),
            "cpp" | "c++" => Ok(Self::Cpp),
            "wasm" | "wat" => Ok(Self::Wasm),
            other => Err(crate::Error::invalid_input(format!(
                "unknown language '{other}'"
            ))),
        }
    }
}

/// Execution technology backing a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// JITed WebAssembly VM
    Wasm,
    /// In-kernel verified filter VM
    Ebpf,
    /// JavaScript isolate
    V8Isolate,
    /// Embedded interpreter
    Python,
    /// MicroVM
    Firecracker,
}

impl RuntimeKind {
    /// All runtime kinds, in registry probe order.
    pub const ALL: [Self; 5] = [
        Self::Ebpf,
        Self::Wasm,
        Self::V8Isolate,
        Self::Python,
        Self::Firecracker,
    ];

    /// Returns the lowercase wire name of the runtime kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wasm => "wasm",
            Self::Ebpf => "ebpf",
            Self::V8Isolate => "v8isolate",
            Self::Python => "python",
            Self::Firecracker => "firecracker",
        }
    }

    /// Nominal cold-start latency, used only for ordering candidates.
    #[must_use]
    pub fn nominal_cold_start(self) -> Duration {
        match self {
            Self::Ebpf => Duration::from_nanos(100),
            Self::Wasm => Duration::from_micros(50),
            Self::V8Isolate => Duration::from_millis(2),
            Self::Python => Duration::from_millis(30),
            Self::Firecracker => Duration::from_millis(150),
        }
    }

    /// Nominal memory ceiling; the selector rejects a runtime whose ceiling
    /// is below the configured memory limit.
    #[must_use]
    pub fn nominal_memory_ceiling_bytes(self) -> u64 {
        const MIB: u64 = 1024 * 1024;
        match self {
            Self::Ebpf => MIB,
            Self::Wasm => 256 * MIB,
            Self::V8Isolate | Self::Python => 512 * MIB,
            Self::Firecracker => 8 * 1024 * MIB,
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse policy tier selecting default capabilities, sandbox strictness,
/// and the worker cordon an execution is confined to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Untrusted code; tightest sandbox
    #[default]
    Low,
    /// Partially trusted code
    Medium,
    /// Trusted code; relaxed sandbox
    High,
}

impl TrustLevel {
    /// All trust levels, tightest first.
    pub const ALL: [Self; 3] = [Self::Low, Self::Medium, Self::High];

    /// Returns the lowercase wire name of the trust level.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Maximum capability set a context at this trust level may hold.
    ///
    /// The controller refuses configurations whose declared capabilities
    /// exceed this ceiling before any back-end is involved.
    #[must_use]
    pub fn max_allowed_capabilities(self) -> BTreeSet<Capability> {
        // Declaring a capability is cheaper than exercising it: low trust
        // may declare network and read access, but its sandbox config
        // still routes every host and path through the validators.
        let mut caps = BTreeSet::from([
            Capability::SystemTime,
            Capability::CpuIntensive,
            Capability::NetworkAccess,
            Capability::FileSystemRead,
        ]);
        if self >= Self::Medium {
            caps.extend([
                Capability::FileSystemWrite,
                Capability::EnvironmentVariables,
                Capability::SharedMemory,
            ]);
        }
        if self == Self::High {
            caps.extend([Capability::ProcessSpawn, Capability::GpuAccess]);
        }
        caps
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named permission controlling a class of side effects.
///
/// Advisory to back-ends, authoritative to the capability check engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Outbound network access
    NetworkAccess,
    /// Filesystem reads
    FileSystemRead,
    /// Filesystem writes
    FileSystemWrite,
    /// Spawning subprocesses
    ProcessSpawn,
    /// Reading wall-clock time
    SystemTime,
    /// Reading environment variables
    EnvironmentVariables,
    /// Shared memory segments
    SharedMemory,
    /// Sustained CPU-bound work
    CpuIntensive,
    /// GPU access
    GpuAccess,
}

impl Capability {
    /// All capabilities.
    pub const ALL: [Self; 9] = [
        Self::NetworkAccess,
        Self::FileSystemRead,
        Self::FileSystemWrite,
        Self::ProcessSpawn,
        Self::SystemTime,
        Self::EnvironmentVariables,
        Self::SharedMemory,
        Self::CpuIntensive,
        Self::GpuAccess,
    ];

    /// Returns the snake_case wire name of the capability.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkAccess => "network_access",
            Self::FileSystemRead => "file_system_read",
            Self::FileSystemWrite => "file_system_write",
            Self::ProcessSpawn => "process_spawn",
            Self::SystemTime => "system_time",
            Self::EnvironmentVariables => "environment_variables",
            Self::SharedMemory => "shared_memory",
            Self::CpuIntensive => "cpu_intensive",
            Self::GpuAccess => "gpu_access",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heuristic classification of a task, biasing runtime selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadProfile {
    /// Tiny predicate over an input record, ultra-low latency
    SimpleFilter,
    /// Sub-millisecond computation
    ShortCompute,
    /// JavaScript-family workload
    JavaScript,
    /// CPU-heavy computation
    HeavyCompute,
    /// Code with no trust signals at all
    Untrusted,
    /// Dominated by I/O waits
    IoIntensive,
    /// Dominated by large allocations
    MemoryIntensive,
}

/// Latency SLA class hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyClass {
    /// Nanosecond-to-microsecond budget
    UltraLow,
    /// Sub-millisecond budget
    Low,
    /// Millisecond budget
    Normal,
    /// No meaningful latency bound
    Relaxed,
}

/// Caller-declared complexity hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Straight-line or near-straight-line code
    #[default]
    Simple,
    /// Loops and branches, bounded work
    Moderate,
    /// Nested loops, recursion, or unbounded work
    Complex,
}

impl Complexity {
    /// Returns the lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }
}

/// Caller-declared CPU intensity hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuClass {
    /// Mostly idle
    Low,
    /// Moderate CPU use
    Medium,
    /// CPU-bound
    High,
}

/// Opaque handle for a compiled module, unique within a controller lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleId(Uuid);

impl ModuleId {
    /// Mints a fresh module handle.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mod-{}", self.0)
    }
}

/// Opaque handle for a live instance, owned by exactly one back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Mints a fresh instance handle.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inst-{}", self.0)
    }
}

/// Outcome of the runtime selection procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingDecision {
    /// Chosen runtime
    pub runtime: RuntimeKind,
    /// Human-readable sentence naming the winning rule
    pub reason: String,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
}

impl SchedulingDecision {
    /// Creates a decision, clamping confidence into `[0, 1]`.
    #[must_use]
    pub fn new(runtime: RuntimeKind, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            runtime,
            reason: reason.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// One recorded execution outcome, consulted by the runtime selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Task shape key this outcome belongs to
    pub task_shape_key: String,
    /// Runtime that executed the task
    pub runtime: RuntimeKind,
    /// Whether the execution succeeded
    pub success: bool,
    /// Back-end-reported execution time
    pub execution_time_ms: u64,
    /// End-to-end time including compile, instantiate, and teardown
    pub total_time_ms: u64,
    /// Peak observed memory
    pub memory_used_bytes: u64,
    /// When the outcome was recorded
    pub timestamp: DateTime<Utc>,
}

/// One capability check outcome in the append-only audit ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Capability that was checked
    pub capability: Capability,
    /// Whether the check passed
    pub granted: bool,
    /// When the check happened
    pub timestamp: DateTime<Utc>,
    /// Trust level of the requesting context
    pub trust_level: TrustLevel,
    /// Validator or rate-limit detail, present on denials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parse_round_trip() {
        for lang in [
            Language::Rust,
            Language::JavaScript,
            Language::TypeScript,
            Language::Python,
            Language::Go,
            Language::C,
            Language::Cpp,
            Language::Wasm,
        ] {
            let parsed: Language = lang.as_str().parse().unwrap();
            assert_eq!(parsed, lang);
        }
        assert!("fortran".parse::<Language>().is_err());
    }

    #[test]
    fn test_javascript_family() {
        assert!(Language::JavaScript.is_javascript_family());
        assert!(Language::TypeScript.is_javascript_family());
        assert!(!Language::Python.is_javascript_family());
    }

    #[test]
    fn test_trust_level_capability_ceiling() {
        let low = TrustLevel::Low.max_allowed_capabilities();
        assert!(low.contains(&Capability::CpuIntensive));
        assert!(low.contains(&Capability::NetworkAccess));
        assert!(!low.contains(&Capability::FileSystemWrite));
        assert!(!low.contains(&Capability::ProcessSpawn));

        let medium = TrustLevel::Medium.max_allowed_capabilities();
        assert!(medium.contains(&Capability::FileSystemWrite));
        assert!(medium.contains(&Capability::SharedMemory));
        assert!(!medium.contains(&Capability::ProcessSpawn));
        assert!(!medium.contains(&Capability::GpuAccess));

        let high = TrustLevel::High.max_allowed_capabilities();
        assert_eq!(high.len(), Capability::ALL.len());
    }

    #[test]
    fn test_cold_start_ordering() {
        let mut kinds = RuntimeKind::ALL;
        kinds.sort_by_key(|k| k.nominal_cold_start());
        assert_eq!(
            kinds,
            [
                RuntimeKind::Ebpf,
                RuntimeKind::Wasm,
                RuntimeKind::V8Isolate,
                RuntimeKind::Python,
                RuntimeKind::Firecracker,
            ]
        );
    }

    #[test]
    fn test_memory_ceilings() {
        assert!(
            RuntimeKind::Ebpf.nominal_memory_ceiling_bytes()
                < RuntimeKind::Wasm.nominal_memory_ceiling_bytes()
        );
        assert!(
            RuntimeKind::Wasm.nominal_memory_ceiling_bytes()
                < RuntimeKind::Firecracker.nominal_memory_ceiling_bytes()
        );
    }

    #[test]
    fn test_handles_are_unique() {
        assert_ne!(ModuleId::generate(), ModuleId::generate());
        assert_ne!(InstanceId::generate(), InstanceId::generate());
    }

    #[test]
    fn test_decision_clamps_confidence() {
        let decision = SchedulingDecision::new(RuntimeKind::Wasm, "test", 1.5);
        assert!((decision.confidence - 1.0).abs() < f64::EPSILON);
    }
}
