//! Error types for the offer pool and resource accounting.

use offergrid_state::StateError;
use thiserror::Error;

pub type OfferResult<T> = Result<T, OfferError>;

#[derive(Debug, Error)]
pub enum OfferError {
    #[error(transparent)]
    State(#[from] StateError),

    /// The cluster manager rejected or did not answer a decline.
    #[error("decline failed: {0}")]
    Decline(String),

    #[error("invalid pattern {pattern:?} in constraint {name:?}: {reason}")]
    InvalidPattern {
        name: String,
        pattern: String,
        reason: String,
    },
}
