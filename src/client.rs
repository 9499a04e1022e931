//! Clerks: the client side of the at-most-once protocol.
//!
//! A clerk draws a 62-bit id once and numbers its operations with a
//! monotonic `seq` that is incremented per logical operation, never per
//! attempt; a retry carries the same `seq`, and the dedup tables server-side
//! make it apply at most once. Transport failures and every non-ok status are
//! treated alike: try the next replica, and after a full ring, back off
//! 50-100 ms.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::sleep;

use crate::config::Config;
use crate::error::Status;
use crate::rpc::{self, Transport};
use crate::wire::{
    method, CtrlArgs, CtrlOp, CtrlReply, GetArgs, GetReply, PutAppendArgs, PutAppendKind,
    PutAppendReply,
};
use crate::{new_client_id, shard_of, ClientId, Gid, Seq};

async fn ring_backoff() {
    let ms = rand::thread_rng().gen_range(50..100);
    sleep(Duration::from_millis(ms)).await;
}

// ---------------------------------------------------------------------------
// Shard controller clerk

pub struct CtrlClerk {
    transport: Arc<dyn Transport>,
    servers: Vec<String>,
    client: ClientId,
    seq: AtomicU64,
}

impl CtrlClerk {
    pub fn new(transport: Arc<dyn Transport>, servers: Vec<String>) -> Self {
        Self {
            transport,
            servers,
            client: new_client_id(),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> Seq {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn run(&self, op: CtrlOp) -> Option<Config> {
        let method_name = match &op {
            CtrlOp::Join { .. } => method::CTRL_JOIN,
            CtrlOp::Leave { .. } => method::CTRL_LEAVE,
            CtrlOp::Move { .. } => method::CTRL_MOVE,
            CtrlOp::Query { .. } => method::CTRL_QUERY,
        };
        let args = CtrlArgs {
            client: self.client,
            seq: self.next_seq(),
            op,
        };
        loop {
            for server in &self.servers {
                let reply: CtrlReply = match rpc::call(
                    &*self.transport,
                    server,
                    method_name,
                    &args,
                )
                .await
                {
                    Ok(reply) => reply,
                    Err(_) => continue,
                };
                if reply.status == Status::Ok {
                    return reply.config;
                }
            }
            ring_backoff().await;
        }
    }

    /// Fetches configuration `num`; `None` asks for the latest.
    pub async fn query(&self, num: Option<u64>) -> Config {
        loop {
            if let Some(config) = self.run(CtrlOp::Query { num }).await {
                return config;
            }
        }
    }

    pub async fn join(&self, servers: HashMap<Gid, Vec<String>>) {
        self.run(CtrlOp::Join { servers }).await;
    }

    pub async fn leave(&self, gids: Vec<Gid>) {
        self.run(CtrlOp::Leave { gids }).await;
    }

    pub async fn move_shard(&self, shard: usize, gid: Gid) {
        self.run(CtrlOp::Move { shard, gid }).await;
    }
}

// ---------------------------------------------------------------------------
// Single-group KV clerk

pub struct KvClerk {
    transport: Arc<dyn Transport>,
    servers: Vec<String>,
    client: ClientId,
    seq: AtomicU64,
}

impl KvClerk {
    pub fn new(transport: Arc<dyn Transport>, servers: Vec<String>) -> Self {
        Self {
            transport,
            servers,
            client: new_client_id(),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> Seq {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fetches the current value for a key; absent keys read as "".
    /// Keeps trying forever in the face of every other failure.
    pub async fn get(&self, key: &str) -> String {
        let args = GetArgs {
            key: key.to_string(),
            client: self.client,
            seq: self.next_seq(),
        };
        loop {
            for server in &self.servers {
                let reply: GetReply =
                    match rpc::call(&*self.transport, server, method::KV_GET, &args).await {
                        Ok(reply) => reply,
                        Err(_) => continue,
                    };
                if reply.status.is_ok() {
                    return reply.value;
                }
            }
            ring_backoff().await;
        }
    }

    pub async fn put(&self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendKind::Put).await;
    }

    pub async fn append(&self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendKind::Append).await;
    }

    async fn put_append(&self, key: &str, value: &str, kind: PutAppendKind) {
        let args = PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            kind,
            client: self.client,
            seq: self.next_seq(),
        };
        loop {
            for server in &self.servers {
                let reply: PutAppendReply =
                    match rpc::call(&*self.transport, server, method::KV_PUT_APPEND, &args).await {
                        Ok(reply) => reply,
                        Err(_) => continue,
                    };
                if reply.status == Status::Ok {
                    return;
                }
            }
            ring_backoff().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Sharded KV clerk

pub struct ShardClerk {
    transport: Arc<dyn Transport>,
    ctrl: CtrlClerk,
    config: Mutex<Config>,
    client: ClientId,
    seq: AtomicU64,
}

impl ShardClerk {
    pub fn new(transport: Arc<dyn Transport>, ctrl: CtrlClerk) -> Self {
        Self {
            transport,
            ctrl,
            config: Mutex::new(Config::default()),
            client: new_client_id(),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> Seq {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn refresh_config(&self) {
        let latest = self.ctrl.query(None).await;
        *self.config.lock() = latest;
    }

    pub async fn get(&self, key: &str) -> String {
        let args = GetArgs {
            key: key.to_string(),
            client: self.client,
            seq: self.next_seq(),
        };
        let shard = shard_of(key);
        loop {
            let owners: Vec<String> = {
                let config = self.config.lock();
                config.owner_of(shard).map(<[String]>::to_vec).unwrap_or_default()
            };
            for server in &owners {
                let reply: GetReply =
                    match rpc::call(&*self.transport, server, method::SHARD_GET, &args).await {
                        Ok(reply) => reply,
                        Err(_) => continue,
                    };
                if reply.status.is_ok() {
                    return reply.value;
                }
                if reply.status == Status::WrongGroup {
                    break;
                }
            }
            ring_backoff().await;
            self.refresh_config().await;
        }
    }

    pub async fn put(&self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendKind::Put).await;
    }

    pub async fn append(&self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendKind::Append).await;
    }

    async fn put_append(&self, key: &str, value: &str, kind: PutAppendKind) {
        let args = PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            kind,
            client: self.client,
            seq: self.next_seq(),
        };
        let shard = shard_of(key);
        loop {
            let owners: Vec<String> = {
                let config = self.config.lock();
                config.owner_of(shard).map(<[String]>::to_vec).unwrap_or_default()
            };
            for server in &owners {
                let reply: PutAppendReply = match rpc::call(
                    &*self.transport,
                    server,
                    method::SHARD_PUT_APPEND,
                    &args,
                )
                .await
                {
                    Ok(reply) => reply,
                    Err(_) => continue,
                };
                if reply.status == Status::Ok {
                    return;
                }
                if reply.status == Status::WrongGroup {
                    break;
                }
            }
            ring_backoff().await;
            self.refresh_config().await;
        }
    }
}
