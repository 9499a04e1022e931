//! The shard controller: a replicated state machine whose commands are
//! `Join`, `Leave`, `Move`, and `Query`, producing an append-only sequence
//! of shard-placement configurations with strictly increasing numbers.
//!
//! Every replica must derive the same placement from the same command, so
//! the rebalance never iterates a map directly: groups are walked in
//! `(shard count desc, gid desc)` order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Config;
use crate::error::Status;
use crate::persist::Persister;
use crate::raft::{ApplyMsg, Raft};
use crate::rendezvous::{self, Rendezvous};
use crate::rpc::{Service, Transport};
use crate::wire::{self, method, CtrlArgs, CtrlOp, CtrlReply};
use crate::{ClientId, Error, Gid, Result, Seq, NSHARDS};

const OP_DEADLINE: Duration = Duration::from_millis(100);
const DRAIN_TICK: Duration = Duration::from_millis(100);

#[derive(Clone)]
struct Applied {
    client: ClientId,
    seq: Seq,
    config: Option<Config>,
}

struct CtrlState {
    configs: Vec<Config>,
    client_seq: HashMap<ClientId, Seq>,
}

pub struct CtrlServer {
    rf: Arc<Raft>,
    dead: AtomicBool,
    state: Mutex<CtrlState>,
    waiters: Rendezvous<u64, Applied>,
}

impl CtrlServer {
    pub fn new(
        peers: Vec<String>,
        me: usize,
        persister: Arc<Persister>,
        transport: Arc<dyn Transport>,
    ) -> Arc<CtrlServer> {
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let rf = Raft::new(peers, me, persister, transport, apply_tx);
        let server = Arc::new(CtrlServer {
            rf,
            dead: AtomicBool::new(false),
            state: Mutex::new(CtrlState {
                configs: vec![Config::default()],
                client_seq: HashMap::new(),
            }),
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

    /// Replicates one controller command and waits for its apply.
    pub async fn handle(&self, args: CtrlArgs) -> CtrlReply {
        let reply = |status, config| CtrlReply { status, config };

        let body = match wire::encode(&args) {
            Ok(body) => body,
            Err(_) => return reply(Status::WrongLeader, None),
        };
        let Some((index, _term)) = self.rf.start(body) else {
            return reply(Status::WrongLeader, None);
        };

        let rx = self.waiters.register(index);
        let outcome = rendezvous::wait(rx, OP_DEADLINE).await;
        self.waiters.remove(&index);

        match outcome {
            Some(applied) if applied.client == args.client && applied.seq == args.seq => {
                reply(Status::Ok, applied.config)
            }
            // A different command landed at our index: lost leadership.
            Some(_) => reply(Status::WrongLeader, None),
            None => reply(Status::Timeout, None),
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
            let ApplyMsg::Command { index, command, .. } = msg else {
                // The controller keeps its whole history; it never snapshots.
                continue;
            };
            let Ok(args) = wire::decode::<CtrlArgs>(&command) else {
                continue;
            };

            let applied = {
                let mut st = self.state.lock();
                if st.fresh(args.client, args.seq) {
                    st.client_seq.insert(args.client, args.seq);
                    match &args.op {
                        CtrlOp::Join { servers } => st.apply_join(servers),
                        CtrlOp::Leave { gids } => st.apply_leave(gids),
                        CtrlOp::Move { shard, gid } => st.apply_move(*shard, *gid),
                        CtrlOp::Query { .. } => {}
                    }
                }
                let config = match &args.op {
                    CtrlOp::Query { num } => Some(st.config_at(*num).clone()),
                    _ => None,
                };
                Applied {
                    client: args.client,
                    seq: args.seq,
                    config,
                }
            };
            self.waiters.complete(&index, applied);
        }
    }
}

impl CtrlState {
    /// A command is applied iff its seq is strictly newer than the client's
    /// last applied one; the table is then raised. Same predicate, same
    /// sense, at every replicated state machine in this crate.
    fn fresh(&self, client: ClientId, seq: Seq) -> bool {
        self.client_seq.get(&client).copied().unwrap_or(0) < seq
    }

    fn tail(&self) -> &Config {
        &self.configs[self.configs.len() - 1]
    }

    fn config_at(&self, num: Option<u64>) -> &Config {
        match num {
            None => self.tail(),
            Some(n) => {
                let i = (n as usize).min(self.configs.len() - 1);
                &self.configs[i]
            }
        }
    }

    fn apply_join(&mut self, servers: &HashMap<Gid, Vec<String>>) {
        let mut next = self.tail().successor();
        for (gid, endpoints) in servers {
            next.groups.insert(*gid, endpoints.clone());
        }
        rebalance(&mut next);
        debug!(num = next.num, "join produced config");
        self.configs.push(next);
    }

    fn apply_leave(&mut self, gids: &[Gid]) {
        let mut next = self.tail().successor();
        for gid in gids {
            next.groups.remove(gid);
        }
        for slot in next.shards.iter_mut() {
            if gids.contains(slot) {
                *slot = 0;
            }
        }
        rebalance(&mut next);
        debug!(num = next.num, "leave produced config");
        self.configs.push(next);
    }

    fn apply_move(&mut self, shard: usize, gid: Gid) {
        let mut next = self.tail().successor();
        next.shards[shard] = gid;
        self.configs.push(next);
    }
}

/// Evens shard counts to within one of each other, deterministically.
///
/// Two passes over the groups in `(count desc, gid desc)` order: first every
/// group above its goal releases its excess into the orphan pool (seeded
/// with unowned shards), then every group below its goal draws from the
/// pool. The pool size equals the total deficit by construction, so any mix
/// of zeros in the incoming placement drains exactly.
pub fn rebalance(config: &mut Config) {
    if config.groups.is_empty() {
        config.shards = [0; NSHARDS];
        return;
    }

    let mut holdings: HashMap<Gid, Vec<usize>> = config
        .groups
        .keys()
        .map(|gid| (*gid, Vec::new()))
        .collect();
    let mut orphans: Vec<usize> = Vec::new();
    for (shard, gid) in config.shards.iter().enumerate() {
        match holdings.get_mut(gid) {
            Some(held) => held.push(shard),
            None => orphans.push(shard),
        }
    }

    let mut order: Vec<Gid> = config.groups.keys().copied().collect();
    order.sort_by(|a, b| {
        let (ca, cb) = (holdings[a].len(), holdings[b].len());
        cb.cmp(&ca).then(b.cmp(a))
    });

    let avg = NSHARDS / order.len();
    let bonus = NSHARDS % order.len();
    let goal = |rank: usize| avg + usize::from(rank < bonus);

    for (rank, gid) in order.iter().enumerate() {
        let Some(held) = holdings.get_mut(gid) else {
            continue;
        };
        while held.len() > goal(rank) {
            if let Some(shard) = held.pop() {
                orphans.push(shard);
            }
        }
    }
    for (rank, gid) in order.iter().enumerate() {
        let Some(held) = holdings.get_mut(gid) else {
            continue;
        };
        while held.len() < goal(rank) {
            match orphans.pop() {
                Some(shard) => held.push(shard),
                None => break,
            }
        }
    }

    for (gid, held) in &holdings {
        for shard in held {
            config.shards[*shard] = *gid;
        }
    }
}

#[async_trait::async_trait]
impl Service for CtrlServer {
    async fn dispatch(&self, method_name: &str, body: Bytes) -> Result<Bytes> {
        match method_name {
            method::CTRL_JOIN | method::CTRL_LEAVE | method::CTRL_MOVE | method::CTRL_QUERY => {
                let args: CtrlArgs = wire::decode(&body)?;
                wire::encode(&self.handle(args).await)
            }
            m if m.starts_with("Raft.") => self.rf.dispatch(m, body).await,
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spread(config: &Config) -> (usize, usize) {
        let mut counts: HashMap<Gid, usize> = config.groups.keys().map(|g| (*g, 0)).collect();
        for gid in &config.shards {
            if let Some(c) = counts.get_mut(gid) {
                *c += 1;
            }
        }
        let min = counts.values().copied().min().unwrap_or(0);
        let max = counts.values().copied().max().unwrap_or(0);
        (min, max)
    }

    #[test]
    fn rebalance_assigns_every_shard_when_groups_exist() {
        let mut config = Config::default();
        config.groups.insert(1, vec!["a".into()]);
        config.groups.insert(2, vec!["b".into()]);
        config.groups.insert(3, vec!["c".into()]);
        rebalance(&mut config);

        assert!(config.shards.iter().all(|g| *g != 0));
        let (min, max) = spread(&config);
        assert!(max - min <= 1, "spread {min}..{max}");
    }

    #[test]
    fn rebalance_is_deterministic() {
        let build = || {
            let mut config = Config::default();
            for gid in [5, 9, 2, 14] {
                config.groups.insert(gid, vec![format!("g{gid}")]);
            }
            rebalance(&mut config);
            config.shards
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn rebalance_handles_preexisting_zeros_and_strays() {
        let mut config = Config::default();
        config.groups.insert(1, vec!["a".into()]);
        config.groups.insert(2, vec!["b".into()]);
        // A placement with zeros and a gid that no longer exists.
        config.shards = [1, 0, 0, 7, 7, 0, 2, 2, 2, 2];
        rebalance(&mut config);

        assert!(config.shards.iter().all(|g| *g == 1 || *g == 2));
        let (min, max) = spread(&config);
        assert_eq!((min, max), (5, 5));
    }

    proptest! {
        #[test]
        fn rebalance_spread_is_at_most_one(gids in proptest::collection::btree_set(1u64..40, 1..8)) {
            let mut config = Config::default();
            for gid in &gids {
                config.groups.insert(*gid, vec![format!("g{gid}")]);
            }
            rebalance(&mut config);

            prop_assert!(config.shards.iter().all(|g| config.groups.contains_key(g)));
            let (min, max) = spread(&config);
            prop_assert!(max - min <= 1);
        }

        #[test]
        fn rebalance_moves_nothing_when_already_balanced(seed in 0u64..1000) {
            let mut config = Config::default();
            config.groups.insert(1 + seed % 3, vec!["a".into()]);
            config.groups.insert(10, vec!["b".into()]);
            rebalance(&mut config);
            let first = config.shards;
            rebalance(&mut config);
            prop_assert_eq!(first, config.shards);
        }
    }
}
