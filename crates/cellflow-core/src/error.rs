//! Error types for cellflow-core.

use thiserror::Error;

use crate::types::ResourceId;

/// Result type for cellflow-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cellflow-core.
///
/// Per-unit timeouts and mid-wait buffer invalidation are not errors;
/// they surface as [`WaitOutcome`](crate::poll::WaitOutcome) so runs can
/// degrade and continue.
#[derive(Debug, Error)]
pub enum Error {
    /// The reload guard hit its recursion ceiling.
    #[error("reload recursion limit reached for resource {resource} (depth {depth}, max {max})")]
    RecursionLimitExceeded {
        resource: ResourceId,
        depth: u32,
        max: u32,
    },

    /// The output marker channel could not be resolved by exact name.
    #[error("output marker channel not found for resource {0}")]
    ChannelNotFound(ResourceId),

    /// A run was requested while another run is active for the resource.
    #[error("a run is already in progress for resource {0}")]
    RunInProgress(ResourceId),

    /// A completion wait was started while one is already pending.
    #[error("a completion wait is already pending for resource {0}")]
    WaitInProgress(ResourceId),

    /// The kernel bridge reported a failure.
    #[error("kernel bridge error: {0}")]
    Bridge(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
