//! A sharded KV replica group: serves reads and writes for the shards it
//! owns under the newest configuration it has committed, and migrates shard
//! contents between groups as the controller publishes new placements.
//!
//! Every transition (client ops, configuration installs, shard arrivals,
//! archive cleanup, and the pull barrier) goes through the replicated log,
//! so all replicas of a group mirror the same shard state machine:
//!
//! ```text
//! Unowned --Config(gain, prev=0)----------------> Owned   (synthetic Migrate)
//! Unowned --Config(gain, prev!=0)--> AwaitingPull --Migrate--> Owned
//! Owned   --Config(lose)-----------> Unowned      (archive retained)
//! Owned   --Pull(served)-----------> Unowned      (after log commit)
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::client::CtrlClerk;
use crate::config::Config;
use crate::error::Status;
use crate::persist::Persister;
use crate::raft::{ApplyMsg, Raft};
use crate::rendezvous::{self, Rendezvous};
use crate::rpc::{self, Service, Transport};
use crate::wire::{
    self, method, ClearArgs, ClearReply, GetArgs, GetReply, PullArgs, PullReply, PutAppendArgs,
    PutAppendKind, PutAppendReply,
};
use crate::{shard_of, ClientId, Error, Gid, Result, Seq, NSHARDS};

const OP_DEADLINE: Duration = Duration::from_millis(200);
const PULL_DEADLINE: Duration = Duration::from_millis(1000);
const POLL_INTERVAL: Duration = Duration::from_millis(33);
const DRAIN_TICK: Duration = Duration::from_millis(100);
const RETRY_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardPhase {
    /// Not ours under the newest config (or never was).
    Unowned,
    /// Ours and servable.
    Owned,
    /// Gained but waiting for the previous owner's contents.
    AwaitingPull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum OpKind {
    Put,
    Append,
    Get,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvOp {
    kind: OpKind,
    key: String,
    value: String,
    client: ClientId,
    seq: Seq,
}

/// Everything a group commits to its log. Client ops and reconfiguration
/// events share one command stream so their relative order is the same on
/// every replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum GroupCommand {
    Kv(KvOp),
    /// Install the next configuration; only accepted when its number is
    /// exactly one past the current one.
    Config(Config),
    /// Install a shard's contents plus the dedup entries that travel with it.
    Migrate {
        shard: usize,
        num: u64,
        db: HashMap<String, String>,
        client_seq: HashMap<ClientId, Seq>,
        sources: Vec<String>,
    },
    /// Drop the archived copy of a shard the new owner has confirmed.
    Clear { shard: usize, num: u64 },
    /// Barrier on the source: capture the shard atomically with in-flight
    /// writes before handing it over.
    Pull { shard: usize, num: u64 },
}

#[derive(Clone)]
struct AppliedOp {
    client: ClientId,
    seq: Seq,
    value: String,
}

/// The persisted schema of a group's state machine.
#[derive(Debug, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub shards: Vec<HashMap<String, String>>,
    pub client_seq: HashMap<ClientId, Seq>,
    pub new_config: Config,
    pub old_config: Config,
    pub phase: Vec<ShardPhase>,
    pub shard_num: Vec<u64>,
    pub outed: HashMap<u64, HashMap<usize, HashMap<String, String>>>,
    pub shard_clients: HashMap<usize, BTreeSet<ClientId>>,
}

/// Decodes a group snapshot blob, e.g. straight out of a persister.
pub fn decode_group_snapshot(blob: &[u8]) -> Option<GroupSnapshot> {
    wire::decode(blob).ok()
}

struct GroupState {
    last_applied: u64,
    shards: Vec<HashMap<String, String>>,
    client_seq: HashMap<ClientId, Seq>,
    old_config: Config,
    new_config: Config,
    phase: [ShardPhase; NSHARDS],
    shard_num: [u64; NSHARDS],
    /// `outed[num][shard]`: contents shipped out when ownership was lost at
    /// config `num + 1`, kept until the new owner confirms receipt.
    outed: HashMap<u64, HashMap<usize, HashMap<String, String>>>,
    /// Which clients' dedup entries must travel with each shard.
    shard_clients: HashMap<usize, BTreeSet<ClientId>>,
}

impl GroupState {
    fn new() -> Self {
        Self {
            last_applied: 0,
            shards: vec![HashMap::new(); NSHARDS],
            client_seq: HashMap::new(),
            old_config: Config::default(),
            new_config: Config::default(),
            phase: [ShardPhase::Unowned; NSHARDS],
            shard_num: [0; NSHARDS],
            outed: HashMap::new(),
            shard_clients: HashMap::new(),
        }
    }

    fn restore(&mut self, saved: GroupSnapshot) {
        self.shards = saved.shards;
        self.client_seq = saved.client_seq;
        self.new_config = saved.new_config;
        self.old_config = saved.old_config;
        for (slot, phase) in self.phase.iter_mut().zip(saved.phase) {
            *slot = phase;
        }
        for (slot, num) in self.shard_num.iter_mut().zip(saved.shard_num) {
            *slot = num;
        }
        self.outed = saved.outed;
        self.shard_clients = saved.shard_clients;
    }

    fn to_snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            shards: self.shards.clone(),
            client_seq: self.client_seq.clone(),
            new_config: self.new_config.clone(),
            old_config: self.old_config.clone(),
            phase: self.phase.to_vec(),
            shard_num: self.shard_num.to_vec(),
            outed: self.outed.clone(),
            shard_clients: self.shard_clients.clone(),
        }
    }

    /// The dedup entries that must travel with `shard`.
    fn dedup_slice(&self, shard: usize) -> HashMap<ClientId, Seq> {
        let Some(clients) = self.shard_clients.get(&shard) else {
            return HashMap::new();
        };
        clients
            .iter()
            .filter_map(|c| self.client_seq.get(c).map(|s| (*c, *s)))
            .collect()
    }

    /// Archives a shard's contents under `num` and empties the live copy.
    fn archive(&mut self, shard: usize, num: u64) {
        let db = std::mem::take(&mut self.shards[shard]);
        if db.is_empty() {
            if let Some(per_num) = self.outed.get_mut(&num) {
                per_num.remove(&shard);
            }
        } else {
            self.outed.entry(num).or_default().insert(shard, db);
        }
    }
}

pub struct ShardKvServer {
    gid: Gid,
    me: usize,
    rf: Arc<Raft>,
    persister: Arc<Persister>,
    transport: Arc<dyn Transport>,
    ctrl: CtrlClerk,
    max_raft_state: Option<usize>,
    dead: AtomicBool,
    state: Mutex<GroupState>,
    waiters: Rendezvous<u64, AppliedOp>,
    pull_waiters: Rendezvous<(u64, usize), PullReply>,
}

impl ShardKvServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gid: Gid,
        peers: Vec<String>,
        me: usize,
        persister: Arc<Persister>,
        transport: Arc<dyn Transport>,
        ctrl: CtrlClerk,
        max_raft_state: Option<usize>,
    ) -> Arc<ShardKvServer> {
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let rf = Raft::new(
            peers,
            me,
            Arc::clone(&persister),
            Arc::clone(&transport),
            apply_tx,
        );

        let mut state = GroupState::new();
        let snapshot = persister.read_snapshot();
        if let Some(saved) = decode_group_snapshot(&snapshot) {
            state.restore(saved);
        }

        let server = Arc::new(ShardKvServer {
            gid,
            me,
            rf,
            persister,
            transport,
            ctrl,
            max_raft_state,
            dead: AtomicBool::new(false),
            state: Mutex::new(state),
            waiters: Rendezvous::new(),
            pull_waiters: Rendezvous::new(),
        });
        tokio::spawn(Arc::clone(&server).apply_loop(apply_rx));
        tokio::spawn(Arc::clone(&server).poll_loop());
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

    /// A shard is servable iff the newest config assigns it here, its
    /// contents have arrived, and its version matches that config.
    fn servable(&self, st: &GroupState, shard: usize) -> bool {
        st.new_config.shards[shard] == self.gid
            && st.phase[shard] == ShardPhase::Owned
            && st.shard_num[shard] == st.new_config.num
    }

    // -- Client-facing RPCs -------------------------------------------------

    pub async fn get(&self, args: GetArgs) -> GetReply {
        let op = KvOp {
            kind: OpKind::Get,
            key: args.key,
            value: String::new(),
            client: args.client,
            seq: args.seq,
        };
        match self.submit(op).await {
            Ok(value) => GetReply {
                status: Status::Ok,
                value,
            },
            Err(status) => GetReply {
                status,
                value: String::new(),
            },
        }
    }

    pub async fn put_append(&self, args: PutAppendArgs) -> PutAppendReply {
        let op = KvOp {
            kind: match args.kind {
                PutAppendKind::Put => OpKind::Put,
                PutAppendKind::Append => OpKind::Append,
            },
            key: args.key,
            value: args.value,
            client: args.client,
            seq: args.seq,
        };
        PutAppendReply {
            status: match self.submit(op).await {
                Ok(_) => Status::Ok,
                Err(status) => status,
            },
        }
    }

    async fn submit(&self, op: KvOp) -> std::result::Result<String, Status> {
        {
            let st = self.state.lock();
            if !self.servable(&st, shard_of(&op.key)) {
                return Err(Status::WrongGroup);
            }
        }

        let (client, seq) = (op.client, op.seq);
        let body = wire::encode(&GroupCommand::Kv(op)).map_err(|_| Status::WrongLeader)?;
        let Some((index, _term)) = self.rf.start(body) else {
            return Err(Status::WrongLeader);
        };

        let rx = self.waiters.register(index);
        let outcome = rendezvous::wait(rx, OP_DEADLINE).await;
        self.waiters.remove(&index);

        match outcome {
            Some(applied) if applied.client == client && applied.seq == seq => Ok(applied.value),
            Some(_) => Err(Status::WrongLeader),
            None => Err(Status::Timeout),
        }
    }

    // -- Migration RPCs (group to group) ------------------------------------

    /// Serves a shard to its new owner. Fast path: the archived copy from the
    /// moment ownership was lost. Slow path: the shard is still live here at
    /// `num`, so a `Pull` barrier is committed to capture it serialized with
    /// concurrent writes, after which this group stops serving it.
    pub async fn pull_shard(&self, args: PullArgs) -> PullReply {
        let not_ready = || PullReply {
            status: Status::NotReady,
            db: HashMap::new(),
            client_seq: HashMap::new(),
        };

        if !self.rf.state().1 {
            let mut reply = not_ready();
            reply.status = Status::WrongLeader;
            return reply;
        }

        {
            let st = self.state.lock();
            if args.num > st.new_config.num || st.shard_num[args.shard] < args.num {
                return not_ready();
            }
            let live = st.phase[args.shard] == ShardPhase::Owned
                && st.shard_num[args.shard] == args.num;
            if !live {
                return PullReply {
                    status: Status::Ok,
                    db: st
                        .outed
                        .get(&args.num)
                        .and_then(|per_num| per_num.get(&args.shard))
                        .cloned()
                        .unwrap_or_default(),
                    client_seq: st.dedup_slice(args.shard),
                };
            }
        }

        let command = GroupCommand::Pull {
            shard: args.shard,
            num: args.num,
        };
        let Ok(body) = wire::encode(&command) else {
            return not_ready();
        };
        if self.rf.start(body).is_none() {
            return not_ready();
        }

        let rx = self.pull_waiters.register((args.num, args.shard));
        let outcome = rendezvous::wait(rx, PULL_DEADLINE).await;
        self.pull_waiters.remove(&(args.num, args.shard));
        outcome.unwrap_or_else(|| not_ready())
    }

    /// The new owner confirms receipt; commit the archive cleanup.
    pub async fn clear_shard(&self, args: ClearArgs) -> ClearReply {
        let command = GroupCommand::Clear {
            shard: args.shard,
            num: args.num,
        };
        let status = match wire::encode(&command) {
            Ok(body) => {
                if self.rf.start(body).is_some() {
                    Status::Ok
                } else {
                    Status::WrongLeader
                }
            }
            _ => Status::WrongLeader,
        };
        ClearReply { status }
    }

    // -- Apply path ---------------------------------------------------------

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

    fn apply_command(self: &Arc<Self>, index: u64, command: &Bytes) {
        let Ok(command) = wire::decode::<GroupCommand>(&command[..]) else {
            return;
        };
        let mut st = self.state.lock();
        if index <= st.last_applied {
            return;
        }
        st.last_applied = index;

        match command {
            GroupCommand::Kv(op) => {
                drop(st);
                self.apply_kv(index, op);
                return;
            }
            GroupCommand::Config(config) => self.apply_config(&mut st, config),
            GroupCommand::Migrate {
                shard,
                num,
                db,
                client_seq,
                sources,
            } => self.apply_migrate(&mut st, shard, num, db, client_seq, &sources),
            GroupCommand::Clear { shard, num } => Self::apply_clear(&mut st, shard, num),
            GroupCommand::Pull { shard, num } => self.apply_pull(&mut st, shard, num),
        }
        self.maybe_compact(&st, index);
    }

    fn apply_kv(self: &Arc<Self>, index: u64, op: KvOp) {
        let shard = shard_of(&op.key);
        let applied = {
            let mut st = self.state.lock();
            if !self.servable(&st, shard) {
                // Ownership moved between Start and apply: drop the op. The
                // waiter times out and the client retries at the new owner.
                return;
            }

            let fresh = st.client_seq.get(&op.client).copied().unwrap_or(0) < op.seq;
            if fresh {
                match op.kind {
                    OpKind::Put => {
                        st.shards[shard].insert(op.key.clone(), op.value.clone());
                    }
                    OpKind::Append => {
                        st.shards[shard]
                            .entry(op.key.clone())
                            .or_default()
                            .push_str(&op.value);
                    }
                    OpKind::Get => {}
                }
                st.client_seq.insert(op.client, op.seq);
                st.shard_clients.entry(shard).or_default().insert(op.client);
            }
            let value = match op.kind {
                OpKind::Get => st.shards[shard].get(&op.key).cloned().unwrap_or_default(),
                _ => String::new(),
            };

            self.maybe_compact(&st, index);
            AppliedOp {
                client: op.client,
                seq: op.seq,
                value,
            }
        };
        self.waiters.complete(&index, applied);
    }

    fn apply_config(&self, st: &mut GroupState, config: Config) {
        if config.num != st.new_config.num + 1 {
            return;
        }
        info!(gid = self.gid, me = self.me, num = config.num, "installing config");
        st.old_config = std::mem::replace(&mut st.new_config, config);

        for shard in 0..NSHARDS {
            let before = st.old_config.shards[shard];
            let now = st.new_config.shards[shard];
            let num = st.new_config.num;

            if before == self.gid && now != self.gid {
                // Lost: archive under the config we owned it at, stop serving.
                if st.phase[shard] == ShardPhase::Owned {
                    st.archive(shard, st.old_config.num);
                    st.phase[shard] = ShardPhase::Unowned;
                    st.shard_num[shard] = num;
                }
            } else if before == self.gid && now == self.gid {
                st.shard_num[shard] = num;
            } else if now == self.gid && st.shard_num[shard] < num {
                // Gained, contents not here yet. (A Migrate committed ahead
                // of this config already made the shard servable; leave it.)
                st.phase[shard] = ShardPhase::AwaitingPull;
            }
        }
    }

    fn apply_migrate(
        self: &Arc<Self>,
        st: &mut GroupState,
        shard: usize,
        num: u64,
        db: HashMap<String, String>,
        client_seq: HashMap<ClientId, Seq>,
        sources: &[String],
    ) {
        if st.shard_num[shard] >= num || st.phase[shard] == ShardPhase::Owned {
            return;
        }
        debug!(gid = self.gid, me = self.me, shard, num, "shard arrived");
        st.shards[shard] = db;
        st.shard_clients.remove(&shard);
        for (client, seq) in client_seq {
            let entry = st.client_seq.entry(client).or_insert(0);
            *entry = (*entry).max(seq);
            st.shard_clients.entry(shard).or_default().insert(client);
        }
        st.phase[shard] = ShardPhase::Owned;
        st.shard_num[shard] = num;

        // The previous owner can drop its archive now. Leader-only; a lost
        // or unsent clear costs retained storage, never correctness.
        if !sources.is_empty() && self.rf.state().1 {
            self.send_clear(sources.to_vec(), shard, num - 1);
        }
    }

    fn apply_clear(st: &mut GroupState, shard: usize, num: u64) {
        if let Some(per_num) = st.outed.get_mut(&num) {
            per_num.remove(&shard);
            if per_num.is_empty() {
                st.outed.remove(&num);
            }
        }
        st.shard_clients.remove(&shard);
    }

    /// The barrier on the source side: runs after every write that preceded
    /// it in the log, so the captured contents are complete.
    fn apply_pull(&self, st: &mut GroupState, shard: usize, num: u64) {
        let reply = if st.phase[shard] == ShardPhase::Owned && st.shard_num[shard] == num {
            let db = st.shards[shard].clone();
            let client_seq = st.dedup_slice(shard);
            st.archive(shard, num);
            st.phase[shard] = ShardPhase::Unowned;
            st.shard_num[shard] = num;
            PullReply {
                status: Status::Ok,
                db,
                client_seq,
            }
        } else {
            PullReply {
                status: Status::Ok,
                db: st
                    .outed
                    .get(&num)
                    .and_then(|per_num| per_num.get(&shard))
                    .cloned()
                    .unwrap_or_default(),
                client_seq: st.dedup_slice(shard),
            }
        };
        self.pull_waiters.complete(&(num, shard), reply);
    }

    fn apply_snapshot(&self, index: u64, snapshot: &Bytes) {
        let mut st = self.state.lock();
        if index <= st.last_applied {
            return;
        }
        let Some(saved) = decode_group_snapshot(snapshot) else {
            return;
        };
        st.restore(saved);
        st.last_applied = index;
        debug!(gid = self.gid, me = self.me, index, "restored group snapshot");
    }

    fn maybe_compact(&self, st: &GroupState, index: u64) {
        let Some(max) = self.max_raft_state else {
            return;
        };
        if self.persister.state_size() <= max {
            return;
        }
        if let Ok(blob) = wire::encode(&st.to_snapshot()) {
            self.rf.snapshot(index, blob);
        }
    }

    // -- Reconfiguration (leader only) --------------------------------------

    async fn poll_loop(self: Arc<Self>) {
        loop {
            sleep(POLL_INTERVAL).await;
            if self.killed() {
                return;
            }
            if !self.rf.state().1 {
                continue;
            }

            let next_num = {
                let mut st = self.state.lock();
                if st.new_config.num != st.old_config.num {
                    // A migration is in flight; (re)derive the pending pulls
                    // from applied state. A new leader picks up exactly here.
                    self.drive_migrations(&mut st);
                    continue;
                }
                st.new_config.num + 1
            };

            let config = self.ctrl.query(Some(next_num)).await;
            if config.num != next_num || self.killed() {
                continue;
            }

            let st = self.state.lock();
            if config.num != st.new_config.num + 1 {
                continue;
            }
            if let Ok(body) = wire::encode(&GroupCommand::Config(config.clone())) {
                self.rf.start(body);
            }
            // Start fetching eagerly; the Migrate commands are version-gated,
            // so racing the Config apply is harmless.
            for shard in 0..NSHARDS {
                if config.shards[shard] != self.gid || st.new_config.shards[shard] == self.gid {
                    continue;
                }
                let prev = st.new_config.shards[shard];
                if prev == 0 {
                    self.start_empty_migrate(shard, config.num);
                } else if let Some(servers) = st.new_config.groups.get(&prev) {
                    self.spawn_pull_worker(shard, config.num - 1, servers.clone());
                }
            }
        }
    }

    /// Walks the shards gained in the pending config and restarts a pull for
    /// each one still missing; once none are, the config is fully installed.
    fn drive_migrations(self: &Arc<Self>, st: &mut GroupState) {
        let mut all_done = true;
        for shard in 0..NSHARDS {
            let gained = st.new_config.shards[shard] == self.gid
                && st.old_config.shards[shard] != self.gid;
            if !gained || st.shard_num[shard] == st.new_config.num {
                continue;
            }
            all_done = false;
            let prev = st.old_config.shards[shard];
            if prev == 0 {
                self.start_empty_migrate(shard, st.new_config.num);
            } else if let Some(servers) = st.old_config.groups.get(&prev) {
                self.spawn_pull_worker(shard, st.new_config.num - 1, servers.clone());
            }
        }
        if all_done {
            st.old_config = st.new_config.clone();
        }
    }

    /// A shard gained from gid 0 has no previous owner; it starts empty.
    fn start_empty_migrate(self: &Arc<Self>, shard: usize, num: u64) {
        let command = GroupCommand::Migrate {
            shard,
            num,
            db: HashMap::new(),
            client_seq: HashMap::new(),
            sources: Vec::new(),
        };
        if let Ok(body) = wire::encode(&command) {
            self.rf.start(body);
        }
    }

    fn spawn_pull_worker(self: &Arc<Self>, shard: usize, num: u64, sources: Vec<String>) {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.pull_worker(shard, num, sources).await });
    }

    /// Fetches one shard from its previous owner's replicas, keeping the
    /// largest successful payload: an empty archive stub is a valid reply,
    /// but a later peer may return the richer real one. Retries until the
    /// `Migrate` is submitted or the group dies.
    async fn pull_worker(self: Arc<Self>, shard: usize, num: u64, sources: Vec<String>) {
        let args = PullArgs { shard, num };
        loop {
            if self.killed() {
                return;
            }
            let calls = sources.iter().map(|source| {
                let args = args.clone();
                let transport = Arc::clone(&self.transport);
                let source = source.clone();
                async move {
                    rpc::call::<_, PullReply>(&*transport, &source, method::SHARD_PULL, &args)
                        .await
                }
            });
            let mut best: Option<PullReply> = None;
            for reply in futures::future::join_all(calls).await.into_iter().flatten() {
                if reply.status != Status::Ok {
                    continue;
                }
                let larger = best
                    .as_ref()
                    .map_or(true, |b| reply.db.len() >= b.db.len());
                if larger {
                    best = Some(reply);
                }
            }

            if let Some(reply) = best {
                let command = GroupCommand::Migrate {
                    shard,
                    num: num + 1,
                    db: reply.db,
                    client_seq: reply.client_seq,
                    sources: sources.clone(),
                };
                if let Ok(body) = wire::encode(&command) {
                    self.rf.start(body);
                }
                return;
            }
            sleep(RETRY_PAUSE).await;
        }
    }

    /// Tells every replica of the previous owner to drop its archive; each
    /// send retries until the transport delivers it once.
    fn send_clear(self: &Arc<Self>, sources: Vec<String>, shard: usize, num: u64) {
        for source in sources {
            let server = Arc::clone(self);
            tokio::spawn(async move {
                let args = ClearArgs { shard, num };
                while !server.killed() {
                    let done = rpc::call::<_, ClearReply>(
                        &*server.transport,
                        &source,
                        method::SHARD_CLEAR,
                        &args,
                    )
                    .await
                    .is_ok();
                    if done {
                        return;
                    }
                    sleep(RETRY_PAUSE).await;
                }
            });
        }
    }
}

#[async_trait::async_trait]
impl Service for ShardKvServer {
    async fn dispatch(&self, method_name: &str, body: Bytes) -> Result<Bytes> {
        match method_name {
            method::SHARD_GET => {
                let args: GetArgs = wire::decode(&body)?;
                wire::encode(&self.get(args).await)
            }
            method::SHARD_PUT_APPEND => {
                let args: PutAppendArgs = wire::decode(&body)?;
                wire::encode(&self.put_append(args).await)
            }
            method::SHARD_PULL => {
                let args: PullArgs = wire::decode(&body)?;
                wire::encode(&self.pull_shard(args).await)
            }
            method::SHARD_CLEAR => {
                let args: ClearArgs = wire::decode(&body)?;
                wire::encode(&self.clear_shard(args).await)
            }
            m if m.starts_with("Raft.") => self.rf.dispatch(m, body).await,
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }
}
