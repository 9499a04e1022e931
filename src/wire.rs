//! RPC argument and reply schemas for all three services, plus the binary
//! codec they travel through. Replicas of one cluster share these types, so
//! wire agreement is a compile-time property.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::Config;
use crate::error::Status;
use crate::raft::log::Entry;
use crate::{ClientId, Gid, Result, Seq};

/// Encodes a message for the wire or the persister.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

/// Decodes a message produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// RPC method names, shared by callers and the dispatch tables.
pub mod method {
    pub const REQUEST_VOTE: &str = "Raft.RequestVote";
    pub const APPEND_ENTRIES: &str = "Raft.AppendEntries";
    pub const INSTALL_SNAPSHOT: &str = "Raft.InstallSnapshot";

    pub const CTRL_JOIN: &str = "ShardCtrler.Join";
    pub const CTRL_LEAVE: &str = "ShardCtrler.Leave";
    pub const CTRL_MOVE: &str = "ShardCtrler.Move";
    pub const CTRL_QUERY: &str = "ShardCtrler.Query";

    pub const KV_GET: &str = "KV.Get";
    pub const KV_PUT_APPEND: &str = "KV.PutAppend";

    pub const SHARD_GET: &str = "ShardKV.Get";
    pub const SHARD_PUT_APPEND: &str = "ShardKV.PutAppend";
    pub const SHARD_PULL: &str = "ShardKV.PullShard";
    pub const SHARD_CLEAR: &str = "ShardKV.ClearShard";
}

// ---------------------------------------------------------------------------
// Log engine

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: usize,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: usize,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub leader_commit: u64,
}

/// `x_term`/`x_index` carry the fast-backtrack conflict hint: the term of the
/// conflicting entry (if any) and the first index holding that term, letting
/// the leader skip a whole term per round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub x_term: Option<u64>,
    pub x_index: u64,
    pub x_len: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: usize,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub snapshot: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

// ---------------------------------------------------------------------------
// Shard controller

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CtrlOp {
    Join { servers: HashMap<Gid, Vec<String>> },
    Leave { gids: Vec<Gid> },
    Move { shard: usize, gid: Gid },
    /// `None` asks for the latest configuration.
    Query { num: Option<u64> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtrlArgs {
    pub client: ClientId,
    pub seq: Seq,
    pub op: CtrlOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtrlReply {
    pub status: Status,
    pub config: Option<Config>,
}

// ---------------------------------------------------------------------------
// Key/value services (single-group and sharded share the client schema)

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutAppendKind {
    Put,
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub client: ClientId,
    pub seq: Seq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReply {
    pub status: Status,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub kind: PutAppendKind,
    pub client: ClientId,
    pub seq: Seq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub status: Status,
}

// ---------------------------------------------------------------------------
// Shard migration

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullArgs {
    pub shard: usize,
    /// The configuration number at which the source owned the shard.
    pub num: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullReply {
    pub status: Status,
    pub db: HashMap<String, String>,
    pub client_seq: HashMap<ClientId, Seq>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearArgs {
    pub shard: usize,
    pub num: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearReply {
    pub status: Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_entries_survive_the_codec() {
        let args = AppendEntriesArgs {
            term: 3,
            leader_id: 1,
            prev_log_index: 7,
            prev_log_term: 2,
            entries: vec![Entry {
                term: 3,
                index: 8,
                command: Bytes::from_static(b"put a 1"),
            }],
            leader_commit: 7,
        };
        let back: AppendEntriesArgs = decode(&encode(&args).unwrap()).unwrap();
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].index, 8);
        assert_eq!(&back.entries[0].command[..], b"put a 1");
    }
}
