//! A fault-tolerant, non-sharded key/value service over one replica group:
//! the at-most-once client protocol in its simplest setting. The sharded
//! service in [`crate::shardkv`] layers ownership and migration on top of
//! the same structure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Status;
use crate::persist::Persister;
use crate::raft::{ApplyMsg, Raft};
use crate::rendezvous::{self, Rendezvous};
use crate::rpc::{Service, Transport};
use crate::wire::{
    self, method, GetArgs, GetReply, PutAppendArgs, PutAppendKind, PutAppendReply,
};
use crate::{ClientId, Error, Result, Seq};

const OP_DEADLINE: Duration = Duration::from_millis(100);
const DRAIN_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
enum KvKind {
    Put,
    Append,
    Get,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvCommand {
    kind: KvKind,
    key: String,
    value: String,
    client: ClientId,
    seq: Seq,
}

#[derive(Clone)]
struct Applied {
    client: ClientId,
    seq: Seq,
    /// `None` for a `Get` whose key was absent.
    value: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct KvSnapshot {
    data: HashMap<String, String>,
    client_seq: HashMap<ClientId, Seq>,
}

struct KvState {
    last_applied: u64,
    data: HashMap<String, String>,
    client_seq: HashMap<ClientId, Seq>,
}

pub struct KvServer {
    rf: Arc<Raft>,
    persister: Arc<Persister>,
    max_raft_state: Option<usize>,
    dead: AtomicBool,
    state: Mutex<KvState>,
    waiters: Rendezvous<u64, Applied>,
}

impl KvServer {
    pub fn new(
        peers: Vec<String>,
        me: usize,
        persister: Arc<Persister>,
        transport: Arc<dyn Transport>,
        max_raft_state: Option<usize>,
    ) -> Arc<KvServer> {
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let rf = Raft::new(peers, me, Arc::clone(&persister), transport, apply_tx);

        let mut state = KvState {
            last_applied: 0,
            data: HashMap::new(),
            client_seq: HashMap::new(),
        };
        let snapshot = persister.read_snapshot();
        if let Ok(saved) = wire::decode::<KvSnapshot>(&snapshot) {
            state.data = saved.data;
            state.client_seq = saved.client_seq;
        }

        let server = Arc::new(KvServer {
            rf,
            persister,
            max_raft_state,
            dead: AtomicBool::new(false),
            state: Mutex::new(state),
            waiters: Rendezvous::new(),
        });
        tokio::spawn(Arc::clone(&server).apply_loop(apply_rx));
        server
    }

    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.rf.kill();
    }

    pub fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn raft(&self) -> &Arc<Raft> {
        &self.rf
    }

    pub async fn get(&self, args: GetArgs) -> GetReply {
        let command = KvCommand {
            kind: KvKind::Get,
            key: args.key,
            value: String::new(),
            client: args.client,
            seq: args.seq,
        };
        match self.submit(command).await {
            Ok(Some(value)) => GetReply {
                status: Status::Ok,
                value,
            },
            // Absent keys read as the empty string.
            Ok(None) => GetReply {
                status: Status::NoKey,
                value: String::new(),
            },
            Err(status) => GetReply {
                status,
                value: String::new(),
            },
        }
    }

    pub async fn put_append(&self, args: PutAppendArgs) -> PutAppendReply {
        let command = KvCommand {
            kind: match args.kind {
                PutAppendKind::Put => KvKind::Put,
                PutAppendKind::Append => KvKind::Append,
            },
            key: args.key,
            value: args.value,
            client: args.client,
            seq: args.seq,
        };
        PutAppendReply {
            status: match self.submit(command).await {
                Ok(_) => Status::Ok,
                Err(status) => status,
            },
        }
    }

    /// Replicates one client command and waits for its apply; the value is
    /// whatever the state machine read at apply time (`None` for writes and
    /// for reads of absent keys).
    async fn submit(&self, command: KvCommand) -> std::result::Result<Option<String>, Status> {
        let body = wire::encode(&command).map_err(|_| Status::WrongLeader)?;
        let Some((index, _term)) = self.rf.start(body) else {
            return Err(Status::WrongLeader);
        };

        let rx = self.waiters.register(index);
        let outcome = rendezvous::wait(rx, OP_DEADLINE).await;
        self.waiters.remove(&index);

        match outcome {
            Some(applied) if applied.client == command.client && applied.seq == command.seq => {
                Ok(applied.value)
            }
            Some(_) => Err(Status::WrongLeader),
            None => Err(Status::Timeout),
        }
    }

    async fn apply_loop(self: Arc<Self>, mut apply_rx: mpsc::UnboundedReceiver<ApplyMsg>) {
        loop {
            if self.killed() {
                return;
            }
            let msg = match tokio::time::timeout(DRAIN_TICK, apply_rx.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return,
                Err(_) => continue,
            };
            match msg {
                ApplyMsg::Command { index, command, .. } => self.apply_command(index, &command),
                ApplyMsg::Snapshot { index, snapshot, .. } => self.apply_snapshot(index, &snapshot),
            }
        }
    }

    fn apply_command(&self, index: u64, command: &Bytes) {
        let Ok(op) = wire::decode::<KvCommand>(&command[..]) else {
            return;
        };
        let applied = {
            let mut st = self.state.lock();
            if index <= st.last_applied {
                return;
            }
            st.last_applied = index;

            let fresh = st.client_seq.get(&op.client).copied().unwrap_or(0) < op.seq;
            if fresh {
                match op.kind {
                    KvKind::Put => {
                        st.data.insert(op.key.clone(), op.value.clone());
                    }
                    KvKind::Append => {
                        st.data.entry(op.key.clone()).or_default().push_str(&op.value);
                    }
                    KvKind::Get => {}
                }
                st.client_seq.insert(op.client, op.seq);
            }
            let value = match op.kind {
                KvKind::Get => st.data.get(&op.key).cloned(),
                _ => None,
            };

            self.maybe_compact(&st, index);
            Applied {
                client: op.client,
                seq: op.seq,
                value,
            }
        };
        self.waiters.complete(&index, applied);
    }

    fn apply_snapshot(&self, index: u64, snapshot: &Bytes) {
        let mut st = self.state.lock();
        if index <= st.last_applied {
            return;
        }
        let Ok(saved) = wire::decode::<KvSnapshot>(&snapshot[..]) else {
            return;
        };
        st.data = saved.data;
        st.client_seq = saved.client_seq;
        st.last_applied = index;
        debug!(index, "restored state from snapshot");
    }

    fn maybe_compact(&self, st: &KvState, index: u64) {
        let Some(max) = self.max_raft_state else {
            return;
        };
        if self.persister.state_size() <= max {
            return;
        }
        let encoded = wire::encode(&KvSnapshot {
            data: st.data.clone(),
            client_seq: st.client_seq.clone(),
        });
        if let Ok(blob) = encoded {
            self.rf.snapshot(index, blob);
        }
    }
}

#[async_trait::async_trait]
impl Service for KvServer {
    async fn dispatch(&self, method_name: &str, body: Bytes) -> Result<Bytes> {
        match method_name {
            method::KV_GET => {
                let args: GetArgs = wire::decode(&body)?;
                wire::encode(&self.get(args).await)
            }
            method::KV_PUT_APPEND => {
                let args: PutAppendArgs = wire::decode(&body)?;
                wire::encode(&self.put_append(args).await)
            }
            m if m.starts_with("Raft.") => self.rf.dispatch(m, body).await,
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }
}
