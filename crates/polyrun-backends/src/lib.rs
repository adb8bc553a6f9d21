#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_const_for_fn)]

//! Runtime back-ends for the polyrun execution controller.
//!
//! Every execution technology sits behind the [`Backend`] trait: an
//! idempotent `initialize`/`shutdown` pair around the
//! `compile → instantiate → execute → destroy` lifecycle. The controller
//! routes by [`polyrun_core::RuntimeKind`] through a [`BackendRegistry`]
//! built once at startup.
//!
//! Two reference back-ends ship in this crate:
//!
//! - [`WasmBackend`]: Wasmtime with epoch-based hard timeouts and a
//!   resource-limited store per instance.
//! - [`EbpfBackend`]: an in-process verified filter VM for
//!   ultra-low-latency predicates; the in-kernel loader is an external
//!   collaborator.
//!
//! The [`testing`] module provides a scripted contract double standing in
//! for engines that live outside this repository (JS isolates,
//! interpreters, microVMs).

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod backend;
pub mod ebpf;
pub mod testing;
pub mod wasm;

pub use backend::{Backend, BackendRegistry, default_backend_order};
pub use ebpf::EbpfBackend;
pub use wasm::WasmBackend;
