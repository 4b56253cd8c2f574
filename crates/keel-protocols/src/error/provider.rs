//! Language-model provider errors.

use thiserror::Error;

/// Provider error types.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider request failed.
    #[error("provider request failed: {0}")]
    RequestFailed(String),

    /// The provider returned something that cannot be interpreted.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    /// The provider rejected the request.
    #[error("provider rejected request: {0}")]
    Rejected(String),
}
