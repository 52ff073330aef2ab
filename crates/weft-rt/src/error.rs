//! Error types for the runtime's few fallible public operations.
//!
//! Most contract violations in this crate are debug assertions that degrade
//! to logged no-ops in release builds, and allocation failure aborts the
//! worker. The variants below cover the cases a caller can meaningfully
//! handle.

use thiserror::Error;

/// Errors surfaced by the runtime API.
#[derive(Debug, Error)]
pub enum Error {
    /// Yield was requested while only the bootstrap coroutine is on the
    /// invocation stack. The bootstrap coroutine may never suspend.
    #[error("only the bootstrap coroutine is on the invocation stack; cannot yield")]
    IllegalYield,

    /// The kernel readiness backend could not be created or driven.
    #[error("reactor backend: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
