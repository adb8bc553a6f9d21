//! Error types for the polyrun execution controller.
//!
//! Every failure in the workspace is expressed through [`Error`], which
//! carries a structural [`ErrorKind`] plus a human-readable message. Control
//! flow decisions (scheduler fall-through, retry policy, probe misses) are
//! made on the kind, never by matching message strings.
//!
//! # Examples
//!
//! ```
//! use polyrun_core::{Error, ErrorKind};
//!
//! let err = Error::unsupported_language("python", "ebpf");
//! assert_eq!(err.kind(), ErrorKind::UnsupportedLanguage);
//! assert!(!err.retriable());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural error taxonomy.
///
/// Mirrors the failure modes of the public API surface; each [`Error`]
/// variant maps onto exactly one kind. Serialized in the error envelope
/// handed to host applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or empty code, non-positive limits, unknown enum value.
    InvalidInput,
    /// Back-end does not accept this language.
    UnsupportedLanguage,
    /// No enabled back-end can handle the task.
    NoRuntimeAvailable,
    /// Back-end rejected the source during compilation.
    CompilationError,
    /// Valid module failed to instantiate (often transient pool pressure).
    InstantiationError,
    /// Module handle is unknown to the probed back-end.
    ModuleNotFound,
    /// Instance handle is unknown or already destroyed.
    InstanceNotFound,
    /// Code threw, trapped, or exited non-zero.
    ExecutionError,
    /// Execution exceeded the configured timeout.
    Timeout,
    /// Execution exceeded the configured memory limit.
    MemoryLimit,
    /// A capability check, rate limit, or validator rejected the operation.
    CapabilityDenied,
    /// OS-level sandboxing could not be applied and was required.
    SandboxSetupError,
    /// Controller is shutting down; new submissions are rejected.
    Shutdown,
}

impl ErrorKind {
    /// Returns `true` if a caller may reasonably retry the operation.
    ///
    /// Only [`ErrorKind::InstantiationError`] is retriable: it usually
    /// signals transient pool pressure inside a back-end.
    #[must_use]
    pub fn retriable(self) -> bool {
        matches!(self, Self::InstantiationError)
    }
}

/// Main error type for the polyrun workspace.
///
/// All fallible operations across the controller, scheduler, security
/// layers, and back-ends return this type.
#[derive(Error, Debug)]
pub enum Error {
    /// Input validation failed before any back-end was involved.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the rejected input
        message: String,
    },

    /// The targeted back-end does not accept this language.
    #[error("language '{language}' is not supported by back-end '{backend}'")]
    UnsupportedLanguage {
        /// Language declared by the caller
        language: String,
        /// Back-end that rejected it
        backend: String,
    },

    /// No enabled back-end can handle the task.
    #[error("no runtime available: {reason}")]
    NoRuntimeAvailable {
        /// Why every candidate was rejected
        reason: String,
    },

    /// The back-end rejected the source during compilation.
    #[error("compilation failed: {message}")]
    CompilationError {
        /// Back-end compiler message
        message: String,
        /// Underlying engine error, when available
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A valid module failed to instantiate.
    #[error("instantiation failed: {message}")]
    InstantiationError {
        /// Description of the instantiation failure
        message: String,
    },

    /// Module handle is unknown.
    #[error("module not found: {module_id}")]
    ModuleNotFound {
        /// The stale or foreign module handle
        module_id: String,
    },

    /// Instance handle is unknown or already destroyed.
    #[error("instance not found: {instance_id}")]
    InstanceNotFound {
        /// The stale or destroyed instance handle
        instance_id: String,
    },

    /// Execution failed inside the back-end.
    #[error("execution failed: {message}")]
    ExecutionError {
        /// Back-end execution message
        message: String,
        /// Underlying engine error, when available
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Execution exceeded its wall-clock budget.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// Execution exceeded its memory budget.
    #[error("memory limit of {limit_bytes} bytes exceeded")]
    MemoryLimit {
        /// Configured memory limit in bytes
        limit_bytes: u64,
    },

    /// A capability check rejected the operation.
    #[error("capability '{capability}' denied: {reason}")]
    CapabilityDenied {
        /// Capability that was required
        capability: String,
        /// Validator or rate-limit rationale
        reason: String,
    },

    /// OS-level sandboxing could not be applied and was required.
    #[error("sandbox setup failed: {message}")]
    SandboxSetup {
        /// Which sub-layer failed and why
        message: String,
    },

    /// Controller is shutting down.
    #[error("controller is shutting down")]
    Shutdown,
}

impl Error {
    /// Returns the structural kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::UnsupportedLanguage { .. } => ErrorKind::UnsupportedLanguage,
            Self::NoRuntimeAvailable { .. } => ErrorKind::NoRuntimeAvailable,
            Self::CompilationError { .. } => ErrorKind::CompilationError,
            Self::InstantiationError { .. } => ErrorKind::InstantiationError,
            Self::ModuleNotFound { .. } => ErrorKind::ModuleNotFound,
            Self::InstanceNotFound { .. } => ErrorKind::InstanceNotFound,
            Self::ExecutionError { .. } => ErrorKind::ExecutionError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::MemoryLimit { .. } => ErrorKind::MemoryLimit,
            Self::CapabilityDenied { .. } => ErrorKind::CapabilityDenied,
            Self::SandboxSetup { .. } => ErrorKind::SandboxSetupError,
            Self::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Returns `true` if a caller may reasonably retry the operation.
    #[must_use]
    pub fn retriable(&self) -> bool {
        self.kind().retriable()
    }

    /// Returns `true` for the "unknown handle" kinds used during probing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ModuleNotFound | ErrorKind::InstanceNotFound
        )
    }

    /// Returns `true` if this error signals an unsupported language.
    #[must_use]
    pub fn is_unsupported_language(&self) -> bool {
        self.kind() == ErrorKind::UnsupportedLanguage
    }

    /// Convenience constructor for invalid-input failures.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Convenience constructor for unsupported-language failures.
    #[must_use]
    pub fn unsupported_language(
        language: impl Into<String>,
        backend: impl Into<String>,
    ) -> Self {
        Self::UnsupportedLanguage {
            language: language.into(),
            backend: backend.into(),
        }
    }

    /// Convenience constructor for execution failures without a source.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
            source: None,
        }
    }

    /// Convenience constructor for compilation failures without a source.
    #[must_use]
    pub fn compilation(message: impl Into<String>) -> Self {
        Self::CompilationError {
            message: message.into(),
            source: None,
        }
    }
}

/// Serializable error envelope handed to host applications.
///
/// Carries the structural kind, the rendered message, and the retry hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Structural error kind
    pub kind: ErrorKind,
    /// Rendered human-readable message
    pub message: String,
    /// Optional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Whether the caller may reasonably retry
    pub retriable: bool,
}

impl From<&Error> for ErrorEnvelope {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            details: None,
            retriable: err.retriable(),
        }
    }
}

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
