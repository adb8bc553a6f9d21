#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_const_for_fn)]

//! Core domain types for the polyrun execution controller.
//!
//! This crate defines the data model shared by every other crate in the
//! workspace: tasks, execution configuration, permissions, results,
//! scheduling decisions, the error taxonomy, and the bounded ring buffer
//! backing history and audit storage.
//!
//! # Examples
//!
//! ```
//! use polyrun_core::{Language, Task, TrustLevel};
//!
//! let task = Task::builder("function main() { return 1; }", Language::JavaScript)
//!     .expected_duration_ms(5)
//!     .build();
//! assert_eq!(task.language, Language::JavaScript);
//! assert_eq!(TrustLevel::default(), TrustLevel::Low);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod ring;
pub mod task;
pub mod types;

pub use config::{ControllerConfig, CordonSizing, RuntimeToggle, SecurityToggles};
pub use error::{Error, ErrorEnvelope, ErrorKind, Result};
pub use metrics::{
    BackendStatus, CapabilityCheckMetrics, ControllerMetrics, CordonMetrics, CordonPoolMetrics,
    SchedulerMetrics, SecurityMetrics, SystemSandboxMetrics,
};
pub use ring::RingBuffer;
pub use task::{ExecutionConfig, ExecutionResult, Permissions, Task, TaskBuilder};
pub use types::{
    AuditEntry, Capability, Complexity, CpuClass, HistoryEntry, InstanceId, Language, LatencyClass,
    ModuleId, RuntimeKind, SchedulingDecision, TrustLevel, WorkloadProfile,
};
