//! The replicated log engine: leader election, log replication with
//! fast-backtrack conflict recovery, snapshot installation, and in-order
//! delivery of committed commands to the state machine above.
//!
//! One coarse mutex guards each peer's mutable state. The lock is never held
//! across an outbound RPC or a send to the apply channel; after every await
//! the holder re-acquires and rechecks `(term, role)` before mutating.

pub mod log;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::persist::Persister;
use crate::rpc::{self, Service, Transport};
use crate::wire::{
    self, method, AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs,
    InstallSnapshotReply, RequestVoteArgs, RequestVoteReply,
};
use crate::{Error, Result};

use self::log::{Entry, Log};

const ELECTION_TICK: Duration = Duration::from_millis(20);
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
const APPLY_TICK: Duration = Duration::from_millis(10);
const ELECTION_TIMEOUT_MS: std::ops::Range<u64> = 200..400;

/// What the engine delivers upward, in strictly increasing index order. A
/// `Snapshot` message replaces every command at or below its index.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    Command { index: u64, term: u64, command: Bytes },
    Snapshot { index: u64, term: u64, snapshot: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    entries: Vec<Entry>,
    voted_for: Option<usize>,
    current_term: u64,
}

struct RaftState {
    role: Role,
    current_term: u64,
    voted_for: Option<usize>,
    log: Log,
    commit_index: u64,
    last_applied: u64,
    deadline: Instant,
    next_index: Vec<u64>,
    match_index: Vec<u64>,
    votes: usize,
    snapshot: Bytes,
}

pub struct Raft {
    me: usize,
    peers: Vec<String>,
    transport: Arc<dyn Transport>,
    persister: Arc<Persister>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    dead: AtomicBool,
    state: Mutex<RaftState>,
}

impl Raft {
    /// Boots a peer: restores persisted state, starts as follower with a
    /// fresh random deadline, and spawns the ticker and apply loops.
    /// `peers[me]` is this peer's own endpoint name.
    pub fn new(
        peers: Vec<String>,
        me: usize,
        persister: Arc<Persister>,
        transport: Arc<dyn Transport>,
        apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    ) -> Arc<Raft> {
        let n = peers.len();
        let mut state = RaftState {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            commit_index: 0,
            last_applied: 0,
            deadline: Instant::now(),
            next_index: vec![0; n],
            match_index: vec![0; n],
            votes: 0,
            snapshot: persister.read_snapshot(),
        };

        let persisted = persister.read_state();
        if !persisted.is_empty() {
            if let Ok(saved) = wire::decode::<PersistedState>(&persisted) {
                state.log = Log::from_entries(saved.entries);
                state.voted_for = saved.voted_for;
                state.current_term = saved.current_term;
            }
        }
        state.commit_index = state.log.first_index();
        state.last_applied = state.log.first_index();
        state.deadline = Instant::now()
            + Duration::from_millis(rand::thread_rng().gen_range(ELECTION_TIMEOUT_MS));

        let rf = Arc::new(Raft {
            me,
            peers,
            transport,
            persister,
            apply_tx,
            dead: AtomicBool::new(false),
            state: Mutex::new(state),
        });

        tokio::spawn(Arc::clone(&rf).election_loop());
        tokio::spawn(Arc::clone(&rf).heartbeat_loop());
        tokio::spawn(Arc::clone(&rf).apply_loop());
        rf
    }

    /// Appends a command on the leader and triggers replication. Returns the
    /// entry's `(index, term)`, or `None` when this peer is not the leader;
    /// the caller must try elsewhere, not retry here.
    pub fn start(self: &Arc<Self>, command: Bytes) -> Option<(u64, u64)> {
        let (index, term) = {
            let mut st = self.state.lock();
            if st.role != Role::Leader {
                return None;
            }
            let entry = Entry {
                term: st.current_term,
                index: st.log.last().index + 1,
                command,
            };
            let at = (entry.index, entry.term);
            st.log.append(entry);
            self.persist(&st);
            at
        };
        self.broadcast();
        Some((index, term))
    }

    /// Snapshot read of `(term, is_leader)`.
    pub fn state(&self) -> (u64, bool) {
        let st = self.state.lock();
        (st.current_term, st.role == Role::Leader)
    }

    /// Called by the state machine after applying `index`: truncates the log
    /// prefix through it and stores `blob` as the covering snapshot.
    pub fn snapshot(&self, index: u64, blob: Bytes) {
        let mut st = self.state.lock();
        if index <= st.log.first_index() || index > st.log.last().index {
            return;
        }
        st.log.compact_prefix(index);
        st.snapshot = blob;
        self.persist(&st);
    }

    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn persist(&self, st: &RaftState) {
        let encoded = wire::encode(&PersistedState {
            entries: st.log.entries().to_vec(),
            voted_for: st.voted_for,
            current_term: st.current_term,
        })
        .expect("log entries always encode");
        self.persister.save(encoded, st.snapshot.clone());
    }

    fn reset_deadline(st: &mut RaftState) {
        st.deadline = Instant::now()
            + Duration::from_millis(rand::thread_rng().gen_range(ELECTION_TIMEOUT_MS));
    }

    fn become_follower(st: &mut RaftState, term: u64) {
        st.role = Role::Follower;
        st.current_term = term;
        st.voted_for = None;
    }

    fn become_leader(&self, st: &mut RaftState) {
        st.role = Role::Leader;
        let next = st.log.last().index + 1;
        for p in 0..self.peers.len() {
            st.next_index[p] = next;
            st.match_index[p] = 0;
        }
        info!(me = self.me, term = st.current_term, "elected leader");
    }

    // -- RPC handlers -------------------------------------------------------

    pub fn handle_request_vote(&self, args: &RequestVoteArgs) -> RequestVoteReply {
        let mut st = self.state.lock();
        let mut reply = RequestVoteReply {
            term: st.current_term,
            vote_granted: false,
        };
        if args.term < st.current_term {
            return reply;
        }
        if args.term > st.current_term {
            Self::become_follower(&mut st, args.term);
            reply.term = args.term;
        }

        if let Some(voted) = st.voted_for {
            if voted != args.candidate_id {
                self.persist(&st);
                return reply;
            }
        }

        let last = st.log.last();
        let up_to_date = (args.last_log_term, args.last_log_index) >= (last.term, last.index);
        if up_to_date {
            st.voted_for = Some(args.candidate_id);
            st.role = Role::Follower;
            Self::reset_deadline(&mut st);
            reply.vote_granted = true;
            debug!(me = self.me, term = st.current_term, to = args.candidate_id, "vote granted");
        }
        self.persist(&st);
        reply
    }

    pub fn handle_append_entries(&self, args: &AppendEntriesArgs) -> AppendEntriesReply {
        let mut st = self.state.lock();
        let mut reply = AppendEntriesReply {
            term: st.current_term,
            success: false,
            x_term: None,
            x_index: 0,
            x_len: 0,
        };
        if args.term < st.current_term {
            return reply;
        }
        if args.term > st.current_term {
            Self::become_follower(&mut st, args.term);
            reply.term = args.term;
        }
        Self::reset_deadline(&mut st);
        st.role = Role::Follower;

        if args.prev_log_index < st.log.first_index() {
            // Everything at prev is already inside our snapshot; the leader
            // will fall back to nextIndex = matchIndex + 1.
            self.persist(&st);
            return reply;
        }
        if args.prev_log_index > st.log.last().index {
            reply.x_index = st.log.last().index + 1;
            reply.x_len = st.log.last().index + 1;
            self.persist(&st);
            return reply;
        }

        let local_term = st.log.term_at(args.prev_log_index);
        if local_term != args.prev_log_term {
            reply.x_term = Some(local_term);
            let mut first = args.prev_log_index;
            while first > st.log.first_index() && st.log.term_at(first - 1) == local_term {
                first -= 1;
            }
            reply.x_index = first;
            self.persist(&st);
            return reply;
        }

        for entry in &args.entries {
            if entry.index > st.log.last().index {
                st.log.append(entry.clone());
            } else if st.log.term_at(entry.index) != entry.term {
                st.log.truncate_from(entry.index);
                st.log.append(entry.clone());
            }
            // On term agreement the local entry stays: it may be committed.
        }

        let cap = args.leader_commit.min(st.log.last().index);
        st.commit_index = st.commit_index.max(cap);
        reply.success = true;
        self.persist(&st);
        reply
    }

    pub fn handle_install_snapshot(&self, args: &InstallSnapshotArgs) -> InstallSnapshotReply {
        let mut st = self.state.lock();
        let mut reply = InstallSnapshotReply {
            term: st.current_term,
        };
        if args.term < st.current_term {
            return reply;
        }
        if args.term > st.current_term {
            Self::become_follower(&mut st, args.term);
            reply.term = args.term;
        }
        Self::reset_deadline(&mut st);
        st.role = Role::Follower;

        if st.commit_index >= args.last_included_index {
            self.persist(&st);
            return reply;
        }

        st.log
            .reset_to_snapshot(args.last_included_index, args.last_included_term);
        st.snapshot = args.snapshot.clone();
        // Restart delivery from the snapshot: the apply loop re-feeds the
        // state machine through the snapshot path first.
        st.last_applied = 0;
        st.commit_index = args.last_included_index;
        self.persist(&st);
        debug!(
            me = self.me,
            index = args.last_included_index,
            "installed snapshot"
        );
        reply
    }

    // -- Election -----------------------------------------------------------

    async fn election_loop(self: Arc<Self>) {
        loop {
            sleep(ELECTION_TICK).await;
            if self.killed() {
                return;
            }
            let due = {
                let st = self.state.lock();
                st.role != Role::Leader && Instant::now() >= st.deadline
            };
            if due {
                self.start_election();
            }
        }
    }

    fn start_election(self: &Arc<Self>) {
        let args = {
            let mut st = self.state.lock();
            if st.role == Role::Leader || Instant::now() < st.deadline {
                return;
            }
            Self::reset_deadline(&mut st);
            st.role = Role::Candidate;
            st.current_term += 1;
            st.voted_for = Some(self.me);
            st.votes = 1;
            self.persist(&st);
            debug!(me = self.me, term = st.current_term, "starting election");
            RequestVoteArgs {
                term: st.current_term,
                candidate_id: self.me,
                last_log_index: st.log.last().index,
                last_log_term: st.log.last().term,
            }
        };

        for peer in 0..self.peers.len() {
            if peer == self.me {
                continue;
            }
            let rf = Arc::clone(self);
            let args = args.clone();
            tokio::spawn(async move {
                let target = rf.peers[peer].clone();
                let reply: RequestVoteReply = match rpc::call(
                    &*rf.transport,
                    &target,
                    method::REQUEST_VOTE,
                    &args,
                )
                .await
                {
                    Ok(reply) => reply,
                    Err(_) => return,
                };

                let mut st = rf.state.lock();
                if st.role != Role::Candidate || st.current_term != args.term {
                    return;
                }
                if reply.term > st.current_term {
                    Self::become_follower(&mut st, reply.term);
                    rf.persist(&st);
                    return;
                }
                if !reply.vote_granted {
                    return;
                }
                st.votes += 1;
                if st.votes > rf.peers.len() / 2 {
                    rf.become_leader(&mut st);
                    drop(st);
                    rf.broadcast();
                }
            });
        }
    }

    // -- Replication --------------------------------------------------------

    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            sleep(HEARTBEAT_INTERVAL).await;
            if self.killed() {
                return;
            }
            let is_leader = self.state.lock().role == Role::Leader;
            if is_leader {
                self.broadcast();
            }
        }
    }

    /// Sends the current suffix (or the snapshot) to every follower.
    fn broadcast(self: &Arc<Self>) {
        for peer in 0..self.peers.len() {
            if peer == self.me {
                continue;
            }
            let rf = Arc::clone(self);
            tokio::spawn(async move { rf.replicate_one(peer).await });
        }
    }

    async fn replicate_one(self: Arc<Self>, peer: usize) {
        enum Payload {
            Entries(AppendEntriesArgs),
            Snapshot(InstallSnapshotArgs),
        }

        let payload = {
            let st = self.state.lock();
            if st.role != Role::Leader {
                return;
            }
            if st.next_index[peer] <= st.log.first_index() {
                Payload::Snapshot(InstallSnapshotArgs {
                    term: st.current_term,
                    leader_id: self.me,
                    last_included_index: st.log.first_index(),
                    last_included_term: st.log.first_term(),
                    snapshot: st.snapshot.clone(),
                })
            } else {
                let prev = st.next_index[peer] - 1;
                Payload::Entries(AppendEntriesArgs {
                    term: st.current_term,
                    leader_id: self.me,
                    prev_log_index: prev,
                    prev_log_term: st.log.term_at(prev),
                    entries: st.log.suffix(prev + 1),
                    leader_commit: st.commit_index,
                })
            }
        };

        let target = self.peers[peer].clone();
        match payload {
            Payload::Snapshot(args) => {
                let reply: InstallSnapshotReply = match rpc::call(
                    &*self.transport,
                    &target,
                    method::INSTALL_SNAPSHOT,
                    &args,
                )
                .await
                {
                    Ok(reply) => reply,
                    Err(_) => return,
                };

                let mut st = self.state.lock();
                if st.role != Role::Leader || st.current_term != args.term {
                    return;
                }
                if reply.term > st.current_term {
                    Self::become_follower(&mut st, reply.term);
                    self.persist(&st);
                    return;
                }
                st.match_index[peer] = st.match_index[peer].max(args.last_included_index);
                st.next_index[peer] = st.match_index[peer] + 1;
            }
            Payload::Entries(args) => {
                let reply: AppendEntriesReply = match rpc::call(
                    &*self.transport,
                    &target,
                    method::APPEND_ENTRIES,
                    &args,
                )
                .await
                {
                    Ok(reply) => reply,
                    Err(_) => return,
                };

                let mut st = self.state.lock();
                if st.role != Role::Leader || st.current_term != args.term {
                    return;
                }
                if reply.term > st.current_term {
                    Self::become_follower(&mut st, reply.term);
                    self.persist(&st);
                    return;
                }

                if reply.success {
                    let matched = args.prev_log_index + args.entries.len() as u64;
                    st.match_index[peer] = st.match_index[peer].max(matched);
                    st.next_index[peer] = st.match_index[peer] + 1;
                    self.advance_commit(&mut st);
                    return;
                }

                // Fast backoff: jump the whole conflicting term in one round
                // trip instead of decrementing.
                st.next_index[peer] = (st.match_index[peer] + 1).max(reply.x_index);
                if let Some(x_term) = reply.x_term {
                    let mut boundary = reply.x_index.max(st.log.first_index());
                    while boundary <= st.log.last().index && st.log.term_at(boundary) == x_term {
                        boundary += 1;
                        st.next_index[peer] = boundary;
                    }
                }
            }
        }
    }

    /// Advances `commit_index` to the majority-replicated index, but only
    /// through an entry of the current term.
    fn advance_commit(&self, st: &mut RaftState) {
        let mut matches = st.match_index.clone();
        matches[self.me] = st.log.last().index;
        // Descending, so the element at n/2 is replicated on n/2 + 1 peers,
        // a majority for odd and even group sizes alike.
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matches[matches.len() / 2];
        if candidate > st.commit_index
            && candidate <= st.log.last().index
            && st.log.term_at(candidate) == st.current_term
        {
            st.commit_index = candidate;
        }
    }

    // -- Apply delivery -----------------------------------------------------

    async fn apply_loop(self: Arc<Self>) {
        loop {
            sleep(APPLY_TICK).await;
            if self.killed() {
                return;
            }

            let pending_snapshot = {
                let st = self.state.lock();
                if st.last_applied < st.log.first_index() {
                    let msg = ApplyMsg::Snapshot {
                        index: st.log.first_index(),
                        term: st.log.first_term(),
                        snapshot: st.snapshot.clone(),
                    };
                    Some((st.log.first_index(), msg))
                } else {
                    None
                }
            };
            if let Some((index, msg)) = pending_snapshot {
                if self.apply_tx.send(msg).is_err() {
                    return;
                }
                self.state.lock().last_applied = index;
            }

            let batch = {
                let st = self.state.lock();
                if st.last_applied < st.log.first_index() {
                    // A snapshot installed since the check above; deliver it
                    // on the next tick before any entries.
                    continue;
                }
                if st.last_applied >= st.commit_index {
                    continue;
                }
                st.log.range(st.last_applied + 1, st.commit_index)
            };
            let high = match batch.last() {
                Some(entry) => entry.index,
                None => continue,
            };
            for entry in batch {
                let msg = ApplyMsg::Command {
                    index: entry.index,
                    term: entry.term,
                    command: entry.command,
                };
                if self.apply_tx.send(msg).is_err() {
                    return;
                }
            }
            let mut st = self.state.lock();
            st.last_applied = st.last_applied.max(high);
        }
    }
}

/// Lets a raft peer be addressed directly on the network; group servers
/// delegate their `Raft.*` methods here.
#[async_trait::async_trait]
impl Service for Raft {
    async fn dispatch(&self, method_name: &str, body: Bytes) -> Result<Bytes> {
        match method_name {
            method::REQUEST_VOTE => {
                let args: RequestVoteArgs = wire::decode(&body)?;
                wire::encode(&self.handle_request_vote(&args))
            }
            method::APPEND_ENTRIES => {
                let args: AppendEntriesArgs = wire::decode(&body)?;
                wire::encode(&self.handle_append_entries(&args))
            }
            method::INSTALL_SNAPSHOT => {
                let args: InstallSnapshotArgs = wire::decode(&body)?;
                wire::encode(&self.handle_install_snapshot(&args))
            }
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }
}
