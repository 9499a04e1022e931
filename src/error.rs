use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("endpoint {0:?} is unreachable")]
    Unreachable(String),

    #[error("request to {0:?} was dropped")]
    Dropped(String),

    #[error("no handler registered for method {0:?}")]
    UnknownMethod(String),

    #[error("peer is shut down")]
    Dead,

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Protocol-level outcome of a client-visible operation. A closed set,
/// carried inside RPC replies; clients treat everything except `Ok` and
/// `NoKey` as a cue to try another replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    /// The key is absent; reads as the empty string.
    NoKey,
    /// This group does not currently own the key's shard.
    WrongGroup,
    /// This replica is not the leader of its group.
    WrongLeader,
    /// The operation did not commit within the rendezvous deadline.
    Timeout,
    /// Migration-internal: the shard is not ready to be pulled at the
    /// requested configuration number.
    NotReady,
}

impl Status {
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok | Status::NoKey)
    }
}
