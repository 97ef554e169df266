//! Error types for the scan-matching core.

use thiserror::Error;

/// Errors surfaced by the scan-matching core.
///
/// A registration whose score falls below the critical threshold is *not*
/// an error: it is recoverable and reported as
/// [`Registration::Failed`](crate::processor::Registration::Failed).
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed reading or unregistered sensor. No state was mutated.
    #[error("invalid reading: {0}")]
    Validation(String),

    /// Invalid map geometry or parameters. Raised at setup, never per-scan.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
