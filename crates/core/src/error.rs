//! Errors recorded on resources.
//!
//! None of these propagate out of the manager: a failed stage stores its
//! error on the record, moves it to a terminal error state, and bumps the
//! failure statistics. Callers observe them through
//! [`RecordHandle::error`](crate::RecordHandle::error).

use mapstream_cache::AllocError;
use mapstream_scheduler::FetchError;

/// Failure while turning raw bytes into something the renderer can use.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrepareError {
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Allocation(#[from] AllocError),
}

/// Why a resource ended in an error state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("download failed: {0}")]
    Download(#[from] FetchError),

    #[error("preparation failed: {0}")]
    Prepare(#[from] PrepareError),

    /// The reply matched the resource's availability test.
    #[error("resource not available: {0}")]
    Unavailable(String),
}

impl ResourceError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ResourceError::Unavailable(_))
    }
}
