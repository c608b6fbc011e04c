#![forbid(unsafe_code)]
//! Error types for prewarm.
//!
//! Defines `PwError` and a `Result<T>` alias used throughout the workspace.
//! Per-file and per-record failures during tracing are absorbed (logged and
//! skipped) at their component boundary; only setup and invariant errors
//! travel through this type all the way to `main`.

use pw_types::ParseError;
use thiserror::Error;

/// Unified error type for all prewarm operations.
#[derive(Debug, Error)]
pub enum PwError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("bad pack file: {0}")]
    Pack(String),

    #[error("unable to determine pack file name: {0}")]
    NoPackName(String),

    #[error("trace setup failed: {0}")]
    TraceSetup(String),

    #[error("interrupted")]
    Interrupted,
}

impl PwError {
    /// Attach path context to an I/O error.
    #[must_use]
    pub fn io_at(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {err}", path.display()),
        ))
    }
}

/// Result alias using `PwError`.
pub type Result<T> = std::result::Result<T, PwError>;
