use thiserror::Error;

/// Errors produced by the engine.
///
/// Shape problems are reported before any kernel runs: a training step is either
/// rejected up front or runs to completion.
#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("aliased buffers in {what}: source and destination must be distinct")]
    AliasedBuffers { what: &'static str },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid model file: {0}")]
    Format(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[cfg(feature = "serde")]
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fails with [`Error::ShapeMismatch`] unless `actual == expected`.
#[inline]
pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::ShapeMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
