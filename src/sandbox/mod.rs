//! Execution sandboxes.
//!
//! Two independent executors that share only the error taxonomy:
//!
//! 1. [`seatbelt`]: runs an external command under `sandbox-exec` with a
//!    Seatbelt profile generated per call (read-only baseline plus optional
//!    writable roots). Every outcome is folded into an [`ExecutionResult`].
//! 2. [`wasm`]: runs Python code inside a precompiled CPython Wasm module
//!    under wasmtime, bounded by fuel instead of wall-clock time. Traps are
//!    returned as errors, never as partial results.
//!
//! Neither executor enforces anything itself: the kernel enforces the
//! profile and the engine meters the fuel.

pub mod error;
pub mod policy;
pub mod seatbelt;
pub mod wasm;

pub use error::SandboxError;
pub use seatbelt::{ExecutionConfig, ExecutionResult, SeatbeltExecutor};
pub use wasm::WasmExecutor;
