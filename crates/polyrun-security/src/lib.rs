#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_const_for_fn)]

//! Four-layer security model for the polyrun execution controller.
//!
//! Each execution passes through:
//!
//! - **Layer A**, [`cordon`]: pre-spawned isolation-slot pools
//!   partitioned by trust level, with recycling and idle reaping.
//! - **Layer B**, [`policy`]: per-execution sandbox configuration derived
//!   from the declared capability set and trust level.
//! - **Layer C**, [`os_sandbox`]: namespace sets, syscall filter
//!   profiles, and cgroup v2 limits, applied when the kernel facility is
//!   present and skipped with a warning when it is not.
//! - **Layer D**, [`capability`]: per-capability validators, rate limits,
//!   and an append-only audit ring.
//!
//! The [`coordinator`] assembles the layers into a [`SecurityContext`]
//! scoped to exactly one execution and torn down in reverse order of
//! construction on every exit path.

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod capability;
pub mod coordinator;
pub mod cordon;
pub mod os_sandbox;
pub mod policy;

pub use capability::{CapabilityChecker, CapabilityContext};
pub use coordinator::{SecurityContext, SecurityCoordinator};
pub use cordon::{
    InProcessSlotFactory, RecyclePolicy, TrustCordon, WorkerFactory, WorkerHandle, WorkerLease,
};
pub use os_sandbox::{FacilityStatus, SandboxHandles, SystemSandbox};
pub use policy::{SandboxConfig, SandboxOperation};
