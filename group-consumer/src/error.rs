use thiserror::Error;

use crate::types::Partition;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] assignment_coordination::error::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("coordination service unavailable: {0}")]
    TransientCoordination(String),

    #[error("partition {partition} is already claimed by {owner:?}")]
    ClaimConflict { partition: Partition, owner: String },

    #[error("ownership of partition {0} was lost")]
    OwnershipLost(Partition),

    #[error("fetch from partition {partition} failed: {reason}")]
    Fetch { partition: Partition, reason: String },

    #[error("partition {0} no longer exists")]
    PartitionGone(Partition),

    #[error("message delivery failed: {0}")]
    Delivery(String),

    #[error("membership tracking failed: {0}")]
    FatalTracker(String),

    #[error("cannot assign partitions without consumers")]
    NoConsumers,

    #[error("claim phase abandoned after {attempts} attempts: {cause}")]
    RebalanceExhausted { attempts: u32, cause: Box<Error> },

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("coordinator is shutting down")]
    Cancelled,
}

impl From<etcd_client::Error> for Error {
    fn from(e: etcd_client::Error) -> Self {
        Self::Store(e.into())
    }
}

impl Error {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::Store(assignment_coordination::error::Error::InvalidState(
            msg.into(),
        ))
    }

    /// Whether the operation may succeed if simply retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Store(assignment_coordination::error::Error::Etcd(_))
                | Error::TransientCoordination(_)
                | Error::ClaimConflict { .. }
                | Error::Fetch { .. }
                | Error::Delivery(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
