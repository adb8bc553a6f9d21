//! Tasks, execution configuration, permissions, and results.
//!
//! A [`Task`] is the immutable description of one unit of untrusted work:
//! the source code, its declared language, and optional workload hints that
//! bias runtime selection. [`ExecutionConfig`] carries the hard resource
//! bounds and the [`Permissions`] the caller grants the code.
//!
//! # Examples
//!
//! ```
//! use polyrun_core::{Capability, ExecutionConfig, Language, LatencyClass, Task, TrustLevel};
//!
//! let task = Task::builder("int f(void* d, int n) { return n > 20 ? 1 : 0; }", Language::C)
//!     .latency_class(LatencyClass::UltraLow)
//!     .build();
//!
//! let config = ExecutionConfig::builder()
//!     .timeout_ms(100)
//!     .memory_limit_bytes(1024 * 1024)
//!     .trust_level(TrustLevel::Low)
//!     .capability(Capability::CpuIntensive)
//!     .build();
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{Error, Result};
use crate::types::{
    Capability, Complexity, CpuClass, Language, LatencyClass, RuntimeKind, TrustLevel,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Immutable description of one unit of untrusted work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Source code, opaque to the controller
    pub code: String,
    /// Declared source language
    pub language: Language,
    /// Expected wall-clock duration hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_duration_ms: Option<u64>,
    /// Latency SLA class hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_class: Option<LatencyClass>,
    /// Declared complexity hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    /// Expected peak memory hint in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_hint: Option<u64>,
    /// CPU intensity hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_class: Option<CpuClass>,
    /// Whether the task is expected to be I/O bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_hint: Option<bool>,
}

impl Task {
    /// Starts building a task from code and language.
    #[must_use]
    pub fn builder(code: impl Into<String>, language: Language) -> TaskBuilder {
        TaskBuilder {
            code: code.into(),
            language,
            expected_duration_ms: None,
            latency_class: None,
            complexity: None,
            memory_hint: None,
            cpu_class: None,
            io_hint: None,
        }
    }

    /// Complexity used in the task shape key; defaults to `Simple`.
    #[must_use]
    pub fn complexity_or_default(&self) -> Complexity {
        self.complexity.unwrap_or_default()
    }
}

/// Builder for [`Task`]. All hints are optional.
#[derive(Debug)]
pub struct TaskBuilder {
    code: String,
    language: Language,
    expected_duration_ms: Option<u64>,
    latency_class: Option<LatencyClass>,
    complexity: Option<Complexity>,
    memory_hint: Option<u64>,
    cpu_class: Option<CpuClass>,
    io_hint: Option<bool>,
}

impl TaskBuilder {
    /// Sets the expected wall-clock duration hint.
    #[must_use]
    pub fn expected_duration_ms(mut self, ms: u64) -> Self {
        self.expected_duration_ms = Some(ms);
        self
    }

    /// Sets the latency SLA class hint.
    #[must_use]
    pub fn latency_class(mut self, class: LatencyClass) -> Self {
        self.latency_class = Some(class);
        self
    }

    /// Sets the complexity hint.
    #[must_use]
    pub fn complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = Some(complexity);
        self
    }

    /// Sets the expected peak memory hint.
    #[must_use]
    pub fn memory_hint(mut self, bytes: u64) -> Self {
        self.memory_hint = Some(bytes);
        self
    }

    /// Sets the CPU intensity hint.
    #[must_use]
    pub fn cpu_class(mut self, class: CpuClass) -> Self {
        self.cpu_class = Some(class);
        self
    }

    /// Marks the task as I/O bound.
    #[must_use]
    pub fn io_hint(mut self, io: bool) -> Self {
        self.io_hint = Some(io);
        self
    }

    /// Finishes the task.
    #[must_use]
    pub fn build(self) -> Task {
        Task {
            code: self.code,
            language: self.language,
            expected_duration_ms: self.expected_duration_ms,
            latency_class: self.latency_class,
            complexity: self.complexity,
            memory_hint: self.memory_hint,
            cpu_class: self.cpu_class,
            io_hint: self.io_hint,
        }
    }
}

/// Capabilities and trust level granted to one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Permissions {
    /// Capabilities the caller declares the code may exercise
    pub capabilities: BTreeSet<Capability>,
    /// Trust tier selecting cordon and sandbox strictness
    pub trust_level: TrustLevel,
}

impl Permissions {
    /// Creates permissions with the given trust level and no capabilities.
    #[must_use]
    pub fn for_trust_level(trust_level: TrustLevel) -> Self {
        Self {
            capabilities: BTreeSet::new(),
            trust_level,
        }
    }

    /// Returns `true` if the declared set holds the capability.
    #[must_use]
    pub fn holds(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Returns the declared capabilities exceeding the trust-level ceiling.
    #[must_use]
    pub fn excess_capabilities(&self) -> Vec<Capability> {
        let allowed = self.trust_level.max_allowed_capabilities();
        self.capabilities
            .iter()
            .copied()
            .filter(|cap| !allowed.contains(cap))
            .collect()
    }
}

/// Hard resource bounds and permissions for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Hard upper bound on wall-clock execution time, milliseconds
    pub timeout_ms: u64,
    /// Observable memory cap, bytes
    pub memory_limit_bytes: u64,
    /// Capabilities and trust level
    pub permissions: Permissions,
}

impl ExecutionConfig {
    /// Default timeout: 30 seconds.
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

    /// Default memory limit: 128 MiB.
    pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 128 * 1024 * 1024;

    /// Starts building an execution configuration.
    #[must_use]
    pub fn builder() -> ExecutionConfigBuilder {
        ExecutionConfigBuilder::default()
    }

    /// Rejects non-positive limits and capability sets exceeding the
    /// trust-level ceiling.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::invalid_input("timeout_ms must be positive"));
        }
        if self.memory_limit_bytes == 0 {
            return Err(Error::invalid_input("memory_limit_bytes must be positive"));
        }
        let excess = self.permissions.excess_capabilities();
        if !excess.is_empty() {
            let names: Vec<&str> = excess.iter().map(|c| c.as_str()).collect();
            return Err(Error::invalid_input(format!(
                "capabilities [{}] exceed the ceiling for trust level '{}'",
                names.join(", "),
                self.permissions.trust_level
            )));
        }
        Ok(())
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            memory_limit_bytes: Self::DEFAULT_MEMORY_LIMIT_BYTES,
            permissions: Permissions::default(),
        }
    }
}

/// Builder for [`ExecutionConfig`].
#[derive(Debug, Default)]
pub struct ExecutionConfigBuilder {
    timeout_ms: Option<u64>,
    memory_limit_bytes: Option<u64>,
    trust_level: Option<TrustLevel>,
    capabilities: BTreeSet<Capability>,
}

impl ExecutionConfigBuilder {
    /// Sets the wall-clock timeout in milliseconds.
    #[must_use]
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Sets the memory cap in bytes.
    #[must_use]
    pub fn memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    /// Sets the trust level.
    #[must_use]
    pub fn trust_level(mut self, trust_level: TrustLevel) -> Self {
        self.trust_level = Some(trust_level);
        self
    }

    /// Declares one capability the code may exercise.
    #[must_use]
    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Finishes the configuration.
    #[must_use]
    pub fn build(self) -> ExecutionConfig {
        ExecutionConfig {
            timeout_ms: self.timeout_ms.unwrap_or(ExecutionConfig::DEFAULT_TIMEOUT_MS),
            memory_limit_bytes: self
                .memory_limit_bytes
                .unwrap_or(ExecutionConfig::DEFAULT_MEMORY_LIMIT_BYTES),
            permissions: Permissions {
                capabilities: self.capabilities,
                trust_level: self.trust_level.unwrap_or_default(),
            },
        }
    }
}

/// Structured outcome of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the code ran to completion
    pub success: bool,
    /// Value produced by the code, when any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Failure description when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Back-end-reported execution time
    pub execution_time_ms: u64,
    /// Peak observed memory
    pub memory_used_bytes: u64,
    /// Runtime that executed the task
    pub runtime: RuntimeKind,
}

impl ExecutionResult {
    /// Creates a successful result.
    #[must_use]
    pub fn success(
        output: serde_json::Value,
        execution_time_ms: u64,
        memory_used_bytes: u64,
        runtime: RuntimeKind,
    ) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            execution_time_ms,
            memory_used_bytes,
            runtime,
        }
    }

    /// Creates a failed result with the given error description.
    #[must_use]
    pub fn failure(
        error: impl Into<String>,
        execution_time_ms: u64,
        memory_used_bytes: u64,
        runtime: RuntimeKind,
    ) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            execution_time_ms,
            memory_used_bytes,
            runtime,
        }
    }
}
