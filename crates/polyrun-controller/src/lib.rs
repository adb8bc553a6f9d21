#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_const_for_fn)]

//! Execution controller: the public entry point of polyrun.
//!
//! The [`Controller`] owns the back-end registry, the intelligent
//! scheduler, the security coordinator, and a bounded fair admission
//! queue. Hosts hand it `(code, language, config, hints)` and get back a
//! structured result with timing and resource accounting; module and
//! instance handles are routed to their owning back-end without probing.
//!
//! # Examples
//!
//! ```no_run
//! use polyrun_controller::Controller;
//! use polyrun_core::{ControllerConfig, ExecutionConfig, Language, Task};
//!
//! # async fn example() -> polyrun_core::Result<()> {
//! let controller = Controller::new(ControllerConfig::default())?;
//!
//! let task = Task::builder(
//!     r#"(module (func (export "main") (result i32) (i32.const 42)))"#,
//!     Language::Wasm,
//! )
//! .build();
//! let (result, runtime) = controller
//!     .execute_with_scheduler(&task, &ExecutionConfig::default())
//!     .await?;
//! assert!(result.success);
//! println!("ran on {runtime}");
//! controller.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod controller;
pub mod queue;

pub use controller::Controller;
pub use queue::AdmissionQueue;
