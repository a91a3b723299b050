use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no leader elected")]
    NoLeader,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, CoordError>;

/// etcd reports an election without a leader as a gRPC status; fold that
/// case into [`CoordError::NoLeader`] so callers can react to it.
pub(crate) fn map_election_error(error: etcd_client::Error) -> CoordError {
    if error.to_string().contains("no leader") {
        CoordError::NoLeader
    } else {
        CoordError::Etcd(error)
    }
}
