//! Shared scaffolding for the integration tests and the demo binary:
//! in-process clusters with crash, restart, partition, and message-loss
//! controls, plus cross-replica consistency checking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::client::{CtrlClerk, KvClerk, ShardClerk};
use crate::ctrler::CtrlServer;
use crate::kv::KvServer;
use crate::persist::Persister;
use crate::raft::{ApplyMsg, Raft};
use crate::rpc::{Network, Service};
use crate::shardkv::{decode_group_snapshot, GroupSnapshot, ShardKvServer};
use crate::{wire, Gid};

/// Installs the global tracing subscriber once; `RUST_LOG` filters as usual.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

// ---------------------------------------------------------------------------
// Bare log-engine cluster

/// A raft cluster whose "state machine" is the test itself: every applied
/// command lands in a shared table keyed by index, and two replicas applying
/// different commands at one index is recorded as a safety violation.
pub struct RaftCluster {
    pub net: Network,
    names: Vec<String>,
    nodes: Vec<Option<Arc<Raft>>>,
    persisters: Vec<Arc<Persister>>,
    committed: Arc<Mutex<HashMap<u64, Bytes>>>,
    violation: Arc<Mutex<Option<String>>>,
    max_applied: Vec<Arc<AtomicU64>>,
    snapshot_every: Option<u64>,
}

impl RaftCluster {
    pub fn new(n: usize, snapshot_every: Option<u64>) -> Self {
        init_tracing();
        let mut cluster = RaftCluster {
            net: Network::new(),
            names: (0..n).map(|i| format!("raft-{i}")).collect(),
            nodes: (0..n).map(|_| None).collect(),
            persisters: (0..n).map(|_| Arc::new(Persister::new())).collect(),
            committed: Arc::new(Mutex::new(HashMap::new())),
            violation: Arc::new(Mutex::new(None)),
            max_applied: (0..n).map(|_| Arc::new(AtomicU64::new(0))).collect(),
            snapshot_every,
        };
        for i in 0..n {
            cluster.boot(i);
        }
        cluster
    }

    fn boot(&mut self, i: usize) {
        let (apply_tx, mut apply_rx) = mpsc::unbounded_channel();
        let rf = Raft::new(
            self.names.clone(),
            i,
            Arc::clone(&self.persisters[i]),
            self.net.handle(&self.names[i]),
            apply_tx,
        );
        self.net
            .register(&self.names[i], Arc::clone(&rf) as Arc<dyn Service>);

        let committed = Arc::clone(&self.committed);
        let violation = Arc::clone(&self.violation);
        let max_applied = Arc::clone(&self.max_applied[i]);
        let snapshot_every = self.snapshot_every;
        let snapshotter = Arc::clone(&rf);
        tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                match msg {
                    ApplyMsg::Command { index, command, .. } => {
                        {
                            let mut table = committed.lock();
                            let seen = table.get(&index).cloned();
                            match seen {
                                Some(prev) if prev != command => {
                                    *violation.lock() = Some(format!(
                                        "replica {i} applied a different command at index {index}"
                                    ));
                                }
                                Some(_) => {}
                                None => {
                                    table.insert(index, command);
                                }
                            }
                        }
                        max_applied.fetch_max(index, Ordering::SeqCst);
                        if let Some(every) = snapshot_every {
                            if index % every == 0 {
                                if let Ok(blob) = wire::encode(&index) {
                                    snapshotter.snapshot(index, blob);
                                }
                            }
                        }
                    }
                    ApplyMsg::Snapshot { index, .. } => {
                        max_applied.fetch_max(index, Ordering::SeqCst);
                    }
                }
            }
        });
        self.nodes[i] = Some(rf);
    }

    pub fn node(&self, i: usize) -> Arc<Raft> {
        Arc::clone(self.nodes[i].as_ref().expect("node is down"))
    }

    pub fn crash(&mut self, i: usize) {
        if let Some(rf) = self.nodes[i].take() {
            rf.kill();
        }
        self.net.set_attached(&self.names[i], false);
    }

    pub fn restart(&mut self, i: usize) {
        self.boot(i);
    }

    pub fn disconnect(&self, i: usize) {
        self.net.set_attached(&self.names[i], false);
    }

    pub fn reconnect(&self, i: usize) {
        self.net.set_attached(&self.names[i], true);
    }

    pub fn applied_up_to(&self, i: usize) -> u64 {
        self.max_applied[i].load(Ordering::SeqCst)
    }

    pub fn assert_consistent(&self) {
        if let Some(why) = self.violation.lock().clone() {
            panic!("{why}");
        }
    }

    /// Waits out elections and asserts at most one leader per term among the
    /// live, attached replicas; returns the newest-term leader.
    pub async fn check_one_leader(&self) -> usize {
        for _ in 0..12 {
            sleep(Duration::from_millis(450)).await;
            let mut by_term: HashMap<u64, Vec<usize>> = HashMap::new();
            for (i, node) in self.nodes.iter().enumerate() {
                let Some(node) = node else { continue };
                let (term, is_leader) = node.state();
                if is_leader {
                    by_term.entry(term).or_default().push(i);
                }
            }
            for (term, leaders) in &by_term {
                assert!(
                    leaders.len() <= 1,
                    "term {term} elected {} leaders",
                    leaders.len()
                );
            }
            if let Some(term) = by_term.keys().max().copied() {
                return by_term[&term][0];
            }
        }
        panic!("no leader emerged");
    }

    /// Commits one command through whatever leader exists, retrying across
    /// leader changes, and returns its log index.
    pub async fn one(&self, command: Bytes) -> u64 {
        for _ in 0..40 {
            let mut started = None;
            for node in self.nodes.iter().flatten() {
                if let Some((index, _term)) = node.start(command.clone()) {
                    started = Some(index);
                    break;
                }
            }
            let Some(index) = started else {
                sleep(Duration::from_millis(100)).await;
                continue;
            };
            for _ in 0..20 {
                sleep(Duration::from_millis(50)).await;
                match self.committed.lock().get(&index) {
                    Some(cmd) if *cmd == command => {
                        self.assert_consistent();
                        return index;
                    }
                    Some(_) => break, // lost the slot to another leader's entry
                    None => {}
                }
            }
        }
        panic!("command never committed");
    }
}

// ---------------------------------------------------------------------------
// Single-group KV cluster

pub struct KvCluster {
    pub net: Network,
    names: Vec<String>,
    servers: Vec<Option<Arc<KvServer>>>,
    persisters: Vec<Arc<Persister>>,
    max_raft_state: Option<usize>,
}

impl KvCluster {
    pub fn new(n: usize, max_raft_state: Option<usize>) -> Self {
        init_tracing();
        let mut cluster = KvCluster {
            net: Network::new(),
            names: (0..n).map(|i| format!("kv-{i}")).collect(),
            servers: (0..n).map(|_| None).collect(),
            persisters: (0..n).map(|_| Arc::new(Persister::new())).collect(),
            max_raft_state,
        };
        for i in 0..n {
            cluster.boot(i);
        }
        cluster
    }

    fn boot(&mut self, i: usize) {
        let server = KvServer::new(
            self.names.clone(),
            i,
            Arc::clone(&self.persisters[i]),
            self.net.handle(&self.names[i]),
            self.max_raft_state,
        );
        self.net
            .register(&self.names[i], Arc::clone(&server) as Arc<dyn Service>);
        self.servers[i] = Some(server);
    }

    pub fn clerk(&self) -> KvClerk {
        KvClerk::new(self.net.client_handle(), self.names.clone())
    }

    pub fn crash(&mut self, i: usize) {
        if let Some(server) = self.servers[i].take() {
            server.kill();
        }
        self.net.set_attached(&self.names[i], false);
    }

    pub fn restart(&mut self, i: usize) {
        self.boot(i);
    }

    pub fn disconnect(&self, i: usize) {
        self.net.set_attached(&self.names[i], false);
    }

    pub fn reconnect(&self, i: usize) {
        self.net.set_attached(&self.names[i], true);
    }

    pub async fn leader_index(&self) -> Option<usize> {
        for _ in 0..12 {
            for (i, server) in self.servers.iter().enumerate() {
                let Some(server) = server else { continue };
                if server.raft().state().1 {
                    return Some(i);
                }
            }
            sleep(Duration::from_millis(250)).await;
        }
        None
    }

    pub fn state_size(&self, i: usize) -> usize {
        self.persisters[i].state_size()
    }
}

// ---------------------------------------------------------------------------
// Controller cluster

pub struct CtrlCluster {
    pub net: Network,
    names: Vec<String>,
    servers: Vec<Option<Arc<CtrlServer>>>,
    persisters: Vec<Arc<Persister>>,
}

impl CtrlCluster {
    pub fn new(n: usize) -> Self {
        init_tracing();
        Self::on_network(Network::new(), n)
    }

    fn on_network(net: Network, n: usize) -> Self {
        let mut cluster = CtrlCluster {
            net,
            names: (0..n).map(|i| format!("ctl-{i}")).collect(),
            servers: (0..n).map(|_| None).collect(),
            persisters: (0..n).map(|_| Arc::new(Persister::new())).collect(),
        };
        for i in 0..n {
            cluster.boot(i);
        }
        cluster
    }

    fn boot(&mut self, i: usize) {
        let server = CtrlServer::new(
            self.names.clone(),
            i,
            Arc::clone(&self.persisters[i]),
            self.net.handle(&self.names[i]),
        );
        self.net
            .register(&self.names[i], Arc::clone(&server) as Arc<dyn Service>);
        self.servers[i] = Some(server);
    }

    pub fn names(&self) -> Vec<String> {
        self.names.clone()
    }

    pub fn clerk(&self) -> CtrlClerk {
        CtrlClerk::new(self.net.client_handle(), self.names.clone())
    }

    pub fn crash(&mut self, i: usize) {
        if let Some(server) = self.servers[i].take() {
            server.kill();
        }
        self.net.set_attached(&self.names[i], false);
    }

    pub fn restart(&mut self, i: usize) {
        self.boot(i);
    }
}

// ---------------------------------------------------------------------------
// The whole sharded system

pub struct ShardGroup {
    pub gid: Gid,
    pub names: Vec<String>,
    servers: Vec<Option<Arc<ShardKvServer>>>,
    persisters: Vec<Arc<Persister>>,
}

pub struct ShardSystem {
    pub net: Network,
    pub ctrl: CtrlCluster,
    groups: Vec<ShardGroup>,
    max_raft_state: Option<usize>,
}

impl ShardSystem {
    /// Builds a controller cluster plus `ngroups` replica groups (gids 100,
    /// 101, ...) of `npeers` each, all on one network. Groups are idle until
    /// joined.
    pub fn new(ngroups: usize, npeers: usize, max_raft_state: Option<usize>) -> Self {
        init_tracing();
        let net = Network::new();
        let ctrl = CtrlCluster::on_network(net.clone(), 3);
        let mut system = ShardSystem {
            net,
            ctrl,
            groups: Vec::new(),
            max_raft_state,
        };
        for g in 0..ngroups {
            let gid = 100 + g as Gid;
            let names: Vec<String> = (0..npeers).map(|i| format!("g{gid}-{i}")).collect();
            let mut group = ShardGroup {
                gid,
                names,
                servers: (0..npeers).map(|_| None).collect(),
                persisters: (0..npeers).map(|_| Arc::new(Persister::new())).collect(),
            };
            for i in 0..npeers {
                Self::boot_member(&system.net, &system.ctrl, &mut group, i, max_raft_state);
            }
            system.groups.push(group);
        }
        system
    }

    fn boot_member(
        net: &Network,
        ctrl: &CtrlCluster,
        group: &mut ShardGroup,
        i: usize,
        max_raft_state: Option<usize>,
    ) {
        let name = group.names[i].clone();
        let server = ShardKvServer::new(
            group.gid,
            group.names.clone(),
            i,
            Arc::clone(&group.persisters[i]),
            net.handle(&name),
            CtrlClerk::new(net.handle(&name), ctrl.names()),
            max_raft_state,
        );
        net.register(&name, Arc::clone(&server) as Arc<dyn Service>);
        group.servers[i] = Some(server);
    }

    fn group_index(&self, gid: Gid) -> usize {
        self.groups
            .iter()
            .position(|g| g.gid == gid)
            .expect("unknown gid")
    }

    pub fn group(&self, gid: Gid) -> &ShardGroup {
        &self.groups[self.group_index(gid)]
    }

    pub async fn join(&self, gid: Gid) {
        let group = self.group(gid);
        let mut servers = HashMap::new();
        servers.insert(gid, group.names.clone());
        self.ctrl.clerk().join(servers).await;
    }

    pub async fn leave(&self, gid: Gid) {
        self.ctrl.clerk().leave(vec![gid]).await;
    }

    pub fn clerk(&self) -> ShardClerk {
        ShardClerk::new(
            self.net.client_handle(),
            CtrlClerk::new(self.net.client_handle(), self.ctrl.names()),
        )
    }

    pub fn crash_member(&mut self, gid: Gid, i: usize) {
        let g = self.group_index(gid);
        if let Some(server) = self.groups[g].servers[i].take() {
            server.kill();
        }
        self.net.set_attached(&self.groups[g].names[i], false);
    }

    pub fn restart_member(&mut self, gid: Gid, i: usize) {
        let g = self.group_index(gid);
        Self::boot_member(
            &self.net,
            &self.ctrl,
            &mut self.groups[g],
            i,
            self.max_raft_state,
        );
    }

    /// Decodes replica `i` of `gid`'s persisted state-machine snapshot.
    pub fn group_snapshot(&self, gid: Gid, i: usize) -> Option<GroupSnapshot> {
        let group = self.group(gid);
        let blob = group.persisters[i].read_snapshot();
        decode_group_snapshot(&blob)
    }
}
