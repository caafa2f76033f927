//! Error taxonomy shared by both executors.

use std::path::PathBuf;
use std::time::Duration;

/// Why a guest run ended abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// The fuel budget ran out before the guest finished.
    OutOfFuel,
    /// The guest called `proc_exit` with a nonzero status.
    Exit(i32),
    /// Any other trap or host-side failure raised from the entry point.
    Fault,
}

/// Errors produced by the sandbox layer.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Error: Command '{tool}' not found in PATH.")]
    ToolUnavailable { tool: String },

    #[error("Command timed out after {} seconds.", .after.as_secs_f64())]
    Timeout {
        after: Duration,
        /// Output captured before the child was killed.
        stdout: String,
        stderr: String,
    },

    #[error("writable root '{}' is unusable: {reason}", .path.display())]
    WritableRootUnusable { path: PathBuf, reason: String },

    #[error("An unexpected error occurred during execution: {message}")]
    UnexpectedHostError { message: String, errno: Option<i32> },

    #[error("guest trapped ({kind:?}): {message}")]
    GuestTrap {
        kind: TrapKind,
        message: String,
        /// Whatever the guest wrote to stderr before it stopped.
        stderr: String,
    },

    #[error("interpreter module not found at '{}'. Please download {url} into {}", .path.display(), .path.parent().map(|p| p.display().to_string()).unwrap_or_default())]
    ArtifactMissing { path: PathBuf, url: String },
}

impl SandboxError {
    /// Wraps an I/O failure, keeping the OS error number when there is one.
    pub fn host(err: std::io::Error) -> Self {
        Self::UnexpectedHostError {
            message: err.to_string(),
            errno: err.raw_os_error(),
        }
    }

    /// Wraps an engine-side failure (compile, link, instantiate).
    pub fn engine(err: wasmtime::Error) -> Self {
        Self::UnexpectedHostError {
            message: format!("{err:#}"),
            errno: None,
        }
    }

    /// Returns true when the error is fuel exhaustion inside the guest.
    pub fn is_out_of_fuel(&self) -> bool {
        matches!(
            self,
            Self::GuestTrap {
                kind: TrapKind::OutOfFuel,
                ..
            }
        )
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
