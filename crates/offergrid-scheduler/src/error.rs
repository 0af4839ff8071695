//! Scheduler error types.

use thiserror::Error;

use offergrid_offer::OfferError;
use offergrid_state::{StateError, WorkloadKind};

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("application not found: {namespace}/{app}")]
    AppNotFound { namespace: String, app: String },

    #[error("application already exists: {namespace}/{app}")]
    AppExists { namespace: String, app: String },

    #[error("taskgroup not found: {0}")]
    TaskGroupNotFound(String),

    #[error("version not found: {0}")]
    VersionNotFound(String),

    #[error("{namespace}/{app} is a {actual:?} application, not {expected:?}")]
    KindMismatch {
        namespace: String,
        app: String,
        expected: WorkloadKind,
        actual: WorkloadKind,
    },

    #[error("{namespace}/{app} is in a rolling update")]
    InRollingUpdate { namespace: String, app: String },

    #[error("{namespace}/{app} is busy: {reason}")]
    UnderOperation {
        namespace: String,
        app: String,
        reason: String,
    },

    #[error("namespace {0} is over its resource quota")]
    QuotaExceeded(String),

    #[error("cluster manager error: {0}")]
    Cluster(String),

    #[error("not master")]
    NotMaster,

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("offer pool error: {0}")]
    Offer(#[from] OfferError),
}

impl SchedulerError {
    /// Whether retrying the same step later may succeed.
    ///
    /// Store and cluster transport failures and quota pressure are
    /// retried; anything describing the request itself is not.
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::Cluster(_) | SchedulerError::QuotaExceeded(_) => true,
            SchedulerError::State(e) | SchedulerError::Offer(OfferError::State(e)) => {
                state_transient(e)
            }
            SchedulerError::Offer(OfferError::Decline(_)) => true,
            SchedulerError::Offer(OfferError::InvalidPattern { .. }) => false,
            SchedulerError::AppNotFound { .. }
            | SchedulerError::AppExists { .. }
            | SchedulerError::TaskGroupNotFound(_)
            | SchedulerError::VersionNotFound(_)
            | SchedulerError::KindMismatch { .. }
            | SchedulerError::InRollingUpdate { .. }
            | SchedulerError::UnderOperation { .. }
            | SchedulerError::NotMaster => false,
        }
    }
}

fn state_transient(e: &StateError) -> bool {
    !matches!(
        e,
        StateError::MalformedId { .. }
            | StateError::InvalidConstraint { .. }
            | StateError::InvalidVersion(_)
            | StateError::NotFound(_)
    )
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
