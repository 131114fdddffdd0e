//! Internal control-flow errors the CLI needs to distinguish (exit codes,
//! SPEC_FULL §1 "ambient stack / error handling"). Leaf crates below this one
//! keep returning `Result<T, String>` for human-facing text (DESIGN.md), as
//! the teacher's own leaf crates do; `EngineError` only exists at this layer
//! because the CLI needs *kinds*, not just messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("{0}")]
    Store(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("store format/version error: {0}")]
    Format(String),

    #[error("system error: {0}")]
    System(String),
}

/// Mirrors spec §6's CLI exit-code surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Usage = 1,
    System = 2,
    BuildFailed = 3,
    FormatError = 4,
}

impl EngineError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            EngineError::Usage(_) => ExitCode::Usage,
            EngineError::Store(_) => ExitCode::System,
            EngineError::BuildFailed(_) => ExitCode::BuildFailed,
            EngineError::Format(_) => ExitCode::FormatError,
            EngineError::System(_) => ExitCode::System,
        }
    }
}
