#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_const_for_fn)]

//! Intelligent scheduling for the polyrun execution controller.
//!
//! The scheduler maps a task onto the best-fit runtime back-end in three
//! stages: the [`profiler`] classifies the workload from lexical signals
//! and caller hints, the [`history`] contributes past outcomes for the
//! same task shape, and the [`selector`] walks a scored decision
//! procedure with deterministic tie-breaks. The [`scheduler`] then drives
//! the full lifecycle on the chosen back-end with guaranteed destroy and
//! security teardown on every path.

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod history;
pub mod profiler;
pub mod scheduler;
pub mod selector;

pub use history::{ExecutionHistory, RuntimeShapeStats, task_shape_key};
pub use profiler::{CodeTraits, analyze_code, profile_task};
pub use scheduler::Scheduler;
pub use selector::{CandidateRuntime, RuntimeSelector};
