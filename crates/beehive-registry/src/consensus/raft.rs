//! Raft consensus core
//!
//! TigerStyle: Pure state machine, no I/O, no clocks.
//!
//! The driver feeds the core ticks, peer messages and proposals, then drains
//! a [`Ready`]: state to persist, messages to send once it is persisted, and
//! the entries applied to the [`StateMachine`] since the last drain.

use super::log::RaftLog;
use super::message::{Entry, EntryPayload, HardState, ProposalTag, RaftBody, RaftMessage, Snapshot};
use super::storage::PersistentState;
use crate::error::{RegistryError, RegistryResult};
use crate::node::{HiveInfo, MembershipChange};
use beehive_core::constants::RAFT_APPEND_ENTRIES_COUNT_MAX;
use beehive_core::{HiveId, RaftConfig, RngProvider};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// State Machine
// =============================================================================

/// Deterministic state machine replicated by the log
pub trait StateMachine: Send + 'static {
    /// Command carried (JSON-encoded) by log entries
    type Command: Serialize + DeserializeOwned + Send + fmt::Debug + 'static;
    /// Result of applying a command
    type Response: Clone + Send + fmt::Debug + 'static;

    /// Apply a committed command
    fn apply(&mut self, index: u64, command: Self::Command) -> Self::Response;

    /// Apply a committed voter set change
    fn apply_membership(&mut self, index: u64, change: &MembershipChange);

    /// Serialize the full state
    fn snapshot(&self) -> RegistryResult<Bytes>;

    /// Replace the full state
    fn restore(&mut self, data: &[u8]) -> RegistryResult<()>;
}

// =============================================================================
// Status and Ready
// =============================================================================

/// Role of a consensus node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Snapshot of who leads which term, published on every change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftStatus {
    pub id: HiveId,
    pub term: u64,
    pub role: Role,
    pub leader: Option<HiveId>,
}

impl RaftStatus {
    /// Initial status of a node that has not heard from anyone
    pub fn initial(id: HiveId) -> Self {
        Self {
            id,
            term: 0,
            role: Role::Follower,
            leader: None,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}

/// One applied entry
#[derive(Debug)]
pub struct Applied<R> {
    pub index: u64,
    pub tag: Option<ProposalTag>,
    /// `Ok(None)` for empty and membership entries
    pub result: RegistryResult<Option<R>>,
}

/// Work produced by the core since the last drain
#[derive(Debug)]
pub struct Ready<R> {
    /// Must be saved before `messages` are sent
    pub persist: Option<PersistentState>,
    pub messages: Vec<RaftMessage>,
    pub applied: Vec<Applied<R>>,
    /// Set when term, role or leader changed
    pub status: Option<RaftStatus>,
}

impl<R> Ready<R> {
    pub fn is_empty(&self) -> bool {
        self.persist.is_none()
            && self.messages.is_empty()
            && self.applied.is_empty()
            && self.status.is_none()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Timing and compaction knobs of the core
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub election_ticks: u64,
    pub heartbeat_ticks: u64,
    pub snapshot_entries_count: u64,
    pub append_entries_count_max: usize,
}

impl From<&RaftConfig> for CoreConfig {
    fn from(config: &RaftConfig) -> Self {
        Self {
            election_ticks: config.election_ticks,
            heartbeat_ticks: config.heartbeat_ticks,
            snapshot_entries_count: config.snapshot_entries_count,
            append_entries_count_max: RAFT_APPEND_ENTRIES_COUNT_MAX,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    next_index: u64,
    match_index: u64,
}

// =============================================================================
// RaftCore
// =============================================================================

/// Single-node view of the Raft protocol
pub struct RaftCore<M: StateMachine> {
    id: HiveId,
    config: CoreConfig,
    rng: Arc<dyn RngProvider>,
    machine: M,

    term: u64,
    voted_for: Option<HiveId>,
    role: Role,
    leader: Option<HiveId>,

    log: RaftLog,
    commit_index: u64,
    applied_index: u64,
    snapshot: Option<Snapshot>,
    applied_since_snapshot: u64,

    peers: BTreeMap<HiveId, String>,
    votes: BTreeSet<HiveId>,
    progress: BTreeMap<HiveId, Progress>,

    election_elapsed: u64,
    election_timeout: u64,
    heartbeat_elapsed: u64,

    messages: Vec<RaftMessage>,
    applied: Vec<Applied<M::Response>>,
    dirty: bool,
    last_status: RaftStatus,
}

impl<M: StateMachine> RaftCore<M> {
    /// A node with an empty log; it waits to be added by a leader
    pub fn new(id: HiveId, config: CoreConfig, machine: M, rng: Arc<dyn RngProvider>) -> Self {
        assert!(id.is_assigned());
        assert!(config.election_ticks > config.heartbeat_ticks);
        assert!(config.heartbeat_ticks > 0);

        let mut core = Self {
            id,
            config,
            rng,
            machine,
            term: 0,
            voted_for: None,
            role: Role::Follower,
            leader: None,
            log: RaftLog::new(),
            commit_index: 0,
            applied_index: 0,
            snapshot: None,
            applied_since_snapshot: 0,
            peers: BTreeMap::new(),
            votes: BTreeSet::new(),
            progress: BTreeMap::new(),
            election_elapsed: 0,
            election_timeout: 0,
            heartbeat_elapsed: 0,
            messages: Vec::new(),
            applied: Vec::new(),
            dirty: false,
            last_status: RaftStatus::initial(id),
        };
        core.reset_election_timer();
        core
    }

    /// The first node of a new cluster, sole voter
    pub fn bootstrap(
        id: HiveId,
        addr: impl Into<String>,
        config: CoreConfig,
        machine: M,
        rng: Arc<dyn RngProvider>,
    ) -> Self {
        let mut core = Self::new(id, config, machine, rng);
        core.term = 1;
        core.log.append(Entry {
            index: 1,
            term: 1,
            payload: EntryPayload::Membership {
                change: MembershipChange::AddNode {
                    hive: id,
                    addr: addr.into(),
                },
            },
            tag: None,
        });
        core.commit_index = 1;
        core.dirty = true;
        core
    }

    /// Resume from persisted state; committed entries are re-applied on the
    /// next [`RaftCore::ready`]
    pub fn restore(
        id: HiveId,
        state: PersistentState,
        config: CoreConfig,
        machine: M,
        rng: Arc<dyn RngProvider>,
    ) -> RegistryResult<Self> {
        let mut core = Self::new(id, config, machine, rng);
        core.term = state.hard_state.term;
        core.voted_for = state.hard_state.voted_for;

        let (snapshot_index, snapshot_term) = match &state.snapshot {
            Some(snapshot) => {
                core.machine.restore(&snapshot.data)?;
                core.peers = snapshot
                    .peers
                    .iter()
                    .map(|p| (p.id, p.addr.clone()))
                    .collect();
                (snapshot.last_index, snapshot.last_term)
            }
            None => (0, 0),
        };
        core.snapshot = state.snapshot;
        core.log = RaftLog::from_parts(snapshot_index, snapshot_term, state.entries);
        core.applied_index = snapshot_index;
        core.commit_index = state
            .hard_state
            .commit
            .max(snapshot_index)
            .min(core.log.last_index());

        info!(
            hive = %id,
            term = core.term,
            commit = core.commit_index,
            last_index = core.log.last_index(),
            "Restored consensus state"
        );
        Ok(core)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> HiveId {
        self.id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn leader(&self) -> Option<HiveId> {
        self.leader
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn last_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id,
            term: self.term,
            role: self.role,
            leader: self.leader,
        }
    }

    /// Current voters
    pub fn peers(&self) -> Vec<HiveInfo> {
        self.peers
            .iter()
            .map(|(id, addr)| HiveInfo::new(*id, addr.clone()))
            .collect()
    }

    fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    fn others(&self) -> Vec<HiveId> {
        self.peers
            .keys()
            .filter(|p| **p != self.id)
            .copied()
            .collect()
    }

    // =========================================================================
    // Inputs
    // =========================================================================

    /// Advance the logical clock by one tick
    pub fn tick(&mut self) {
        match self.role {
            Role::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_ticks {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_append();
                }
            }
            Role::Follower | Role::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.election_timeout {
                    self.campaign();
                }
            }
        }
    }

    /// Propose an entry; followers forward it to the known leader
    ///
    /// # Errors
    /// `NoLeader` when this node is not the leader and knows no leader.
    pub fn propose(&mut self, payload: EntryPayload, tag: ProposalTag) -> RegistryResult<()> {
        if self.role == Role::Leader {
            self.append_entry(payload, Some(tag));
            self.broadcast_append();
            return Ok(());
        }
        match self.leader {
            Some(leader) => {
                self.send(leader, RaftBody::Propose { payload, tag });
                Ok(())
            }
            None => Err(RegistryError::NoLeader),
        }
    }

    /// Process a message from a peer
    pub fn step(&mut self, msg: RaftMessage) {
        if msg.to != self.id {
            debug!(hive = %self.id, to = %msg.to, "Dropping misaddressed raft message");
            return;
        }

        if let RaftBody::Propose { payload, tag } = msg.body {
            if self.role == Role::Leader {
                self.append_entry(payload, Some(tag));
                self.broadcast_append();
            } else {
                debug!(hive = %self.id, tag = %tag, "Dropping forwarded proposal, not leader");
            }
            return;
        }

        if msg.term > self.term {
            let leader = match msg.body {
                RaftBody::AppendEntries { .. } | RaftBody::InstallSnapshot { .. } => Some(msg.from),
                _ => None,
            };
            self.become_follower(msg.term, leader);
        } else if msg.term < self.term {
            match msg.body {
                RaftBody::RequestVote { .. } => {
                    self.send(msg.from, RaftBody::RequestVoteResponse { granted: false })
                }
                RaftBody::AppendEntries { .. } => self.send(
                    msg.from,
                    RaftBody::AppendEntriesResponse {
                        success: false,
                        match_index: self.log.last_index(),
                    },
                ),
                _ => {}
            }
            return;
        }

        match msg.body {
            RaftBody::RequestVote {
                last_log_index,
                last_log_term,
            } => self.handle_vote_request(msg.from, last_log_index, last_log_term),
            RaftBody::RequestVoteResponse { granted } => self.handle_vote_response(msg.from, granted),
            RaftBody::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append(msg.from, prev_log_index, prev_log_term, entries, leader_commit),
            RaftBody::AppendEntriesResponse {
                success,
                match_index,
            } => self.handle_append_response(msg.from, success, match_index),
            RaftBody::InstallSnapshot { snapshot } => self.handle_snapshot(msg.from, snapshot),
            RaftBody::InstallSnapshotResponse { last_index } => {
                self.handle_snapshot_response(msg.from, last_index)
            }
            RaftBody::Propose { .. } => {}
        }
    }

    /// Apply committed entries and drain pending work
    pub fn ready(&mut self) -> Ready<M::Response> {
        self.apply_committed();

        let status = self.status();
        let status = if status != self.last_status {
            self.last_status = status;
            Some(status)
        } else {
            None
        };

        let persist = if self.dirty {
            self.dirty = false;
            Some(self.persistent_state())
        } else {
            None
        };

        Ready {
            persist,
            messages: std::mem::take(&mut self.messages),
            applied: std::mem::take(&mut self.applied),
            status,
        }
    }

    // =========================================================================
    // Elections
    // =========================================================================

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.election_timeout = self
            .rng
            .gen_range(self.config.election_ticks, 2 * self.config.election_ticks);
    }

    fn campaign(&mut self) {
        self.reset_election_timer();
        // A node that has never received a log is not a voter yet.
        if self.log.is_empty() || !self.peers.contains_key(&self.id) {
            return;
        }

        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id);
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.id);
        self.dirty = true;

        info!(hive = %self.id, term = self.term, "Starting election");

        if self.votes.len() >= self.quorum() {
            self.become_leader();
            return;
        }

        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        for peer in self.others() {
            self.send(
                peer,
                RaftBody::RequestVote {
                    last_log_index,
                    last_log_term,
                },
            );
        }
    }

    fn become_follower(&mut self, term: u64, leader: Option<HiveId>) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.dirty = true;
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        self.progress.clear();
        self.reset_election_timer();
    }

    fn become_leader(&mut self) {
        debug_assert_eq!(self.role, Role::Candidate);
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.heartbeat_elapsed = 0;

        let next_index = self.log.last_index() + 1;
        self.progress = self
            .others()
            .into_iter()
            .map(|peer| {
                (
                    peer,
                    Progress {
                        next_index,
                        match_index: 0,
                    },
                )
            })
            .collect();

        info!(hive = %self.id, term = self.term, "Became leader");

        self.append_entry(EntryPayload::Empty, None);
        self.broadcast_append();
    }

    fn handle_vote_request(&mut self, from: HiveId, last_log_index: u64, last_log_term: u64) {
        let can_vote = self.voted_for.map_or(true, |v| v == from);
        let granted = can_vote && self.log.is_up_to_date(last_log_index, last_log_term);
        if granted {
            self.voted_for = Some(from);
            self.dirty = true;
            self.reset_election_timer();
        }
        debug!(hive = %self.id, candidate = %from, term = self.term, granted, "Vote requested");
        self.send(from, RaftBody::RequestVoteResponse { granted });
    }

    fn handle_vote_response(&mut self, from: HiveId, granted: bool) {
        if self.role != Role::Candidate || !granted || !self.peers.contains_key(&from) {
            return;
        }
        self.votes.insert(from);
        if self.votes.len() >= self.quorum() {
            self.become_leader();
        }
    }

    // =========================================================================
    // Replication
    // =========================================================================

    fn append_entry(&mut self, payload: EntryPayload, tag: Option<ProposalTag>) -> u64 {
        debug_assert_eq!(self.role, Role::Leader);
        let index = self.log.last_index() + 1;
        self.log.append(Entry {
            index,
            term: self.term,
            payload,
            tag,
        });
        self.dirty = true;
        self.maybe_commit();
        index
    }

    fn broadcast_append(&mut self) {
        for peer in self.others() {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, peer: HiveId) {
        let Some(progress) = self.progress.get(&peer).copied() else {
            return;
        };

        let next_index = progress.next_index.min(self.log.last_index() + 1).max(1);
        if next_index <= self.log.snapshot_index() {
            match &self.snapshot {
                Some(snapshot) => {
                    let snapshot = snapshot.clone();
                    debug!(hive = %self.id, peer = %peer, index = snapshot.last_index, "Sending snapshot");
                    self.send(peer, RaftBody::InstallSnapshot { snapshot });
                }
                None => warn!(hive = %self.id, peer = %peer, "Log compacted without a snapshot"),
            }
            return;
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self
            .log
            .entries_from(next_index, self.config.append_entries_count_max);
        self.send(
            peer,
            RaftBody::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            },
        );
    }

    fn handle_append(
        &mut self,
        from: HiveId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: u64,
    ) {
        if self.role != Role::Follower || self.leader != Some(from) {
            self.become_follower(self.term, Some(from));
        } else {
            self.election_elapsed = 0;
        }

        let appended = !entries.is_empty();
        match self.log.try_append(prev_log_index, prev_log_term, entries) {
            Some(last) => {
                if appended {
                    self.dirty = true;
                }
                let commit = leader_commit.min(last);
                if commit > self.commit_index {
                    self.commit_index = commit;
                    self.dirty = true;
                }
                self.send(
                    from,
                    RaftBody::AppendEntriesResponse {
                        success: true,
                        match_index: last,
                    },
                );
            }
            None => {
                let hint = self
                    .log
                    .last_index()
                    .min(prev_log_index.saturating_sub(1));
                self.send(
                    from,
                    RaftBody::AppendEntriesResponse {
                        success: false,
                        match_index: hint,
                    },
                );
            }
        }
    }

    fn handle_append_response(&mut self, from: HiveId, success: bool, match_index: u64) {
        if self.role != Role::Leader {
            return;
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return;
        };

        if success {
            if match_index > progress.match_index {
                progress.match_index = match_index;
            }
            progress.next_index = progress.match_index + 1;
            let behind = progress.next_index <= last_index;
            self.maybe_commit();
            if behind {
                self.send_append(from);
            }
        } else {
            progress.next_index = (match_index + 1)
                .min(progress.next_index.saturating_sub(1))
                .max(1);
            self.send_append(from);
        }
    }

    fn handle_snapshot(&mut self, from: HiveId, snapshot: Snapshot) {
        if self.role != Role::Follower || self.leader != Some(from) {
            self.become_follower(self.term, Some(from));
        } else {
            self.election_elapsed = 0;
        }

        if snapshot.last_index <= self.commit_index {
            self.send(
                from,
                RaftBody::InstallSnapshotResponse {
                    last_index: self.commit_index,
                },
            );
            return;
        }

        if let Err(e) = self.machine.restore(&snapshot.data) {
            warn!(hive = %self.id, error = %e, "Failed to install snapshot");
            return;
        }

        let last_index = snapshot.last_index;
        self.log.restore(last_index, snapshot.last_term);
        self.commit_index = last_index;
        self.applied_index = last_index;
        self.applied_since_snapshot = 0;
        self.peers = snapshot
            .peers
            .iter()
            .map(|p| (p.id, p.addr.clone()))
            .collect();
        self.snapshot = Some(snapshot);
        self.dirty = true;

        info!(hive = %self.id, index = last_index, "Installed snapshot");
        self.send(from, RaftBody::InstallSnapshotResponse { last_index });
    }

    fn handle_snapshot_response(&mut self, from: HiveId, last_index: u64) {
        if self.role != Role::Leader {
            return;
        }
        let log_last = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return;
        };
        progress.match_index = progress.match_index.max(last_index);
        progress.next_index = progress.match_index + 1;
        let behind = progress.next_index <= log_last;
        self.maybe_commit();
        if behind {
            self.send_append(from);
        }
    }

    /// Advance the commit index to the highest current-term entry stored on
    /// a majority
    fn maybe_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let quorum = self.quorum();
        let mut index = self.log.last_index();
        while index > self.commit_index {
            if self.log.term_at(index) != Some(self.term) {
                break;
            }
            let replicated = self
                .peers
                .keys()
                .filter(|peer| {
                    if **peer == self.id {
                        true
                    } else {
                        self.progress
                            .get(peer)
                            .map_or(false, |p| p.match_index >= index)
                    }
                })
                .count();
            if replicated >= quorum {
                self.commit_index = index;
                self.dirty = true;
                break;
            }
            index -= 1;
        }
    }

    // =========================================================================
    // Apply and Snapshot
    // =========================================================================

    fn apply_committed(&mut self) {
        while self.applied_index < self.commit_index {
            let index = self.applied_index + 1;
            let Some(entry) = self.log.entry(index).cloned() else {
                warn!(hive = %self.id, index, "Committed entry missing from log");
                break;
            };
            self.applied_index = index;
            self.applied_since_snapshot += 1;

            let result = match entry.payload {
                EntryPayload::Empty => Ok(None),
                EntryPayload::Command { data } => serde_json::from_slice::<M::Command>(&data)
                    .map(|command| Some(self.machine.apply(index, command)))
                    .map_err(RegistryError::corrupted),
                EntryPayload::Membership { change } => {
                    self.apply_membership(index, &change);
                    Ok(None)
                }
            };
            if let Err(e) = &result {
                warn!(hive = %self.id, index, error = %e, "Failed to apply entry");
            }
            self.applied.push(Applied {
                index,
                tag: entry.tag,
                result,
            });
        }

        if self.applied_since_snapshot >= self.config.snapshot_entries_count {
            self.take_snapshot();
        }
    }

    fn apply_membership(&mut self, index: u64, change: &MembershipChange) {
        match change {
            MembershipChange::AddNode { hive, addr } => {
                info!(hive = %self.id, peer = %hive, addr = %addr, "Voter added");
                self.peers.insert(*hive, addr.clone());
                if self.role == Role::Leader && *hive != self.id {
                    let next_index = self.log.last_index() + 1;
                    self.progress.entry(*hive).or_insert(Progress {
                        next_index,
                        match_index: 0,
                    });
                    self.send_append(*hive);
                }
            }
            MembershipChange::RemoveNode { hive } => {
                info!(hive = %self.id, peer = %hive, "Voter removed");
                self.peers.remove(hive);
                self.progress.remove(hive);
                if *hive == self.id && self.role == Role::Leader {
                    self.become_follower(self.term, None);
                }
            }
        }
        self.machine.apply_membership(index, change);
    }

    fn take_snapshot(&mut self) {
        let data = match self.machine.snapshot() {
            Ok(data) => data,
            Err(e) => {
                warn!(hive = %self.id, error = %e, "Failed to snapshot state machine");
                return;
            }
        };
        let last_index = self.applied_index;
        let last_term = self.log.term_at(last_index).unwrap_or(0);
        self.snapshot = Some(Snapshot {
            last_index,
            last_term,
            peers: self.peers(),
            data,
        });
        self.log.compact(last_index);
        self.applied_since_snapshot = 0;
        self.dirty = true;
        debug!(hive = %self.id, index = last_index, "Compacted log");
    }

    fn persistent_state(&self) -> PersistentState {
        PersistentState {
            hard_state: HardState {
                term: self.term,
                voted_for: self.voted_for,
                commit: self.commit_index,
            },
            snapshot: self.snapshot.clone(),
            entries: self.log.entries().to_vec(),
        }
    }

    fn send(&mut self, to: HiveId, body: RaftBody) {
        self.messages.push(RaftMessage {
            from: self.id,
            to,
            term: self.term,
            body,
        });
    }
}

impl<M: StateMachine> fmt::Debug for RaftCore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftCore")
            .field("id", &self.id)
            .field("term", &self.term)
            .field("role", &self.role)
            .field("leader", &self.leader)
            .field("commit_index", &self.commit_index)
            .field("applied_index", &self.applied_index)
            .field("last_index", &self.log.last_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beehive_core::ChaChaRngProvider;
    use serde::Deserialize;

    #[derive(Debug, Default)]
    struct Counter {
        total: i64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Add(i64);

    impl StateMachine for Counter {
        type Command = Add;
        type Response = i64;

        fn apply(&mut self, _index: u64, command: Add) -> i64 {
            self.total += command.0;
            self.total
        }

        fn apply_membership(&mut self, _index: u64, _change: &MembershipChange) {}

        fn snapshot(&self) -> RegistryResult<Bytes> {
            Ok(Bytes::from(self.total.to_string()))
        }

        fn restore(&mut self, data: &[u8]) -> RegistryResult<()> {
            let text = std::str::from_utf8(data).map_err(RegistryError::corrupted)?;
            self.total = text.parse().map_err(RegistryError::corrupted)?;
            Ok(())
        }
    }

    fn config(snapshot_entries_count: u64) -> CoreConfig {
        CoreConfig {
            election_ticks: 5,
            heartbeat_ticks: 1,
            snapshot_entries_count,
            append_entries_count_max: 64,
        }
    }

    fn rng(seed: u64) -> Arc<dyn RngProvider> {
        Arc::new(ChaChaRngProvider::with_seed(seed))
    }

    fn add(n: i64) -> EntryPayload {
        EntryPayload::Command {
            data: Bytes::from(serde_json::to_vec(&Add(n)).unwrap()),
        }
    }

    fn tag(origin: u64, seq: u64) -> ProposalTag {
        ProposalTag {
            origin: HiveId(origin),
            incarnation: 0,
            seq,
        }
    }

    /// In-process cluster that delivers messages synchronously
    struct Cluster {
        nodes: BTreeMap<HiveId, RaftCore<Counter>>,
        down: BTreeSet<HiveId>,
        persisted: BTreeMap<HiveId, PersistentState>,
        applied: BTreeMap<HiveId, Vec<(u64, Option<ProposalTag>)>>,
        seq: u64,
    }

    impl Cluster {
        /// Hive 1 bootstraps; the others start empty and are added as voters
        fn new(size: u64, snapshot_entries_count: u64) -> Self {
            let mut nodes = BTreeMap::new();
            nodes.insert(
                HiveId(1),
                RaftCore::bootstrap(HiveId(1), "h1", config(snapshot_entries_count), Counter::default(), rng(1)),
            );
            for id in 2..=size {
                nodes.insert(
                    HiveId(id),
                    RaftCore::new(HiveId(id), config(snapshot_entries_count), Counter::default(), rng(id)),
                );
            }
            let mut cluster = Self {
                nodes,
                down: BTreeSet::new(),
                persisted: BTreeMap::new(),
                applied: BTreeMap::new(),
                seq: 0,
            };
            cluster.tick(20);
            assert_eq!(cluster.leader(), Some(HiveId(1)));
            for id in 2..=size {
                cluster.propose(
                    HiveId(1),
                    EntryPayload::Membership {
                        change: MembershipChange::AddNode {
                            hive: HiveId(id),
                            addr: format!("h{}", id),
                        },
                    },
                )
                .unwrap();
                cluster.tick(3);
            }
            cluster
        }

        fn node(&self, id: u64) -> &RaftCore<Counter> {
            &self.nodes[&HiveId(id)]
        }

        fn propose(&mut self, at: HiveId, payload: EntryPayload) -> RegistryResult<()> {
            self.seq += 1;
            let tag = tag(at.0, self.seq);
            let result = self
                .nodes
                .get_mut(&at)
                .unwrap()
                .propose(payload, tag);
            self.pump();
            result
        }

        fn pump(&mut self) {
            for _ in 0..1000 {
                let mut outbound = Vec::new();
                for (id, node) in self.nodes.iter_mut() {
                    let ready = node.ready();
                    if let Some(state) = ready.persist {
                        self.persisted.insert(*id, state);
                    }
                    let log = self.applied.entry(*id).or_default();
                    log.extend(ready.applied.iter().map(|a| (a.index, a.tag)));
                    if !self.down.contains(id) {
                        outbound.extend(ready.messages);
                    }
                }
                if outbound.is_empty() {
                    return;
                }
                for msg in outbound {
                    if self.down.contains(&msg.to) {
                        continue;
                    }
                    if let Some(node) = self.nodes.get_mut(&msg.to) {
                        node.step(msg);
                    }
                }
            }
        }

        fn tick(&mut self, ticks: usize) {
            for _ in 0..ticks {
                for (id, node) in self.nodes.iter_mut() {
                    if !self.down.contains(id) {
                        node.tick();
                    }
                }
                self.pump();
            }
        }

        fn leader(&self) -> Option<HiveId> {
            self.nodes
                .values()
                .filter(|n| !self.down.contains(&n.id()) && n.role() == Role::Leader)
                .max_by_key(|n| n.term())
                .map(|n| n.id())
        }
    }

    #[test]
    fn test_single_node_commits() {
        let mut cluster = Cluster::new(1, 1000);
        cluster.propose(HiveId(1), add(5)).unwrap();
        cluster.propose(HiveId(1), add(2)).unwrap();
        assert_eq!(cluster.node(1).machine().total, 7);
        assert_eq!(cluster.node(1).peers().len(), 1);
    }

    #[test]
    fn test_empty_log_never_campaigns() {
        let mut core = RaftCore::new(HiveId(2), config(1000), Counter::default(), rng(2));
        for _ in 0..100 {
            core.tick();
        }
        let ready = core.ready();
        assert_eq!(core.role(), Role::Follower);
        assert_eq!(core.term(), 0);
        assert!(ready.messages.is_empty());
    }

    #[test]
    fn test_follower_without_leader_rejects() {
        let mut core = RaftCore::new(HiveId(2), config(1000), Counter::default(), rng(2));
        let err = core.propose(add(1), tag(2, 1)).unwrap_err();
        assert!(matches!(err, RegistryError::NoLeader));
    }

    #[test]
    fn test_three_nodes_replicate() {
        let mut cluster = Cluster::new(3, 1000);
        cluster.propose(HiveId(1), add(3)).unwrap();
        cluster.propose(HiveId(2), add(4)).unwrap();
        cluster.tick(3);

        for id in 1..=3 {
            assert_eq!(cluster.node(id).machine().total, 7, "hive {}", id);
            assert_eq!(cluster.node(id).peers().len(), 3);
            assert_eq!(cluster.node(id).leader(), Some(HiveId(1)));
        }

        // The forwarded proposal keeps its origin tag.
        let on_two = &cluster.applied[&HiveId(2)];
        assert!(on_two.iter().any(|(_, t)| t.map(|t| t.origin) == Some(HiveId(2))));
    }

    #[test]
    fn test_leader_failure_elects_new_leader() {
        let mut cluster = Cluster::new(3, 1000);
        cluster.propose(HiveId(1), add(1)).unwrap();
        let old_term = cluster.node(1).term();

        cluster.down.insert(HiveId(1));
        cluster.tick(40);

        let leader = cluster.leader().expect("a new leader");
        assert_ne!(leader, HiveId(1));
        assert!(cluster.nodes[&leader].term() > old_term);

        cluster.propose(leader, add(10)).unwrap();
        cluster.tick(2);
        assert_eq!(cluster.node(2).machine().total, 11);
        assert_eq!(cluster.node(3).machine().total, 11);
    }

    #[test]
    fn test_lagging_follower_gets_snapshot() {
        let mut cluster = Cluster::new(3, 4);
        cluster.down.insert(HiveId(3));
        for n in 1..=12 {
            cluster.propose(HiveId(1), add(n)).unwrap();
        }
        assert!(cluster.node(1).log.snapshot_index() > cluster.node(3).last_index());

        cluster.down.remove(&HiveId(3));
        cluster.tick(5);

        assert_eq!(cluster.node(3).machine().total, 78);
        assert_eq!(cluster.node(3).commit_index(), cluster.node(1).commit_index());
    }

    #[test]
    fn test_restart_reapplies_committed_entries() {
        let mut cluster = Cluster::new(1, 1000);
        cluster.propose(HiveId(1), add(2)).unwrap();
        cluster.propose(HiveId(1), add(3)).unwrap();
        let state = cluster.persisted[&HiveId(1)].clone();

        let mut restored =
            RaftCore::restore(HiveId(1), state, config(1000), Counter::default(), rng(9)).unwrap();
        assert_eq!(restored.machine().total, 0);
        let ready = restored.ready();
        assert_eq!(restored.machine().total, 5);
        assert!(ready.applied.iter().all(|a| a.result.is_ok()));
        assert_eq!(restored.peers().len(), 1);
    }

    #[test]
    fn test_restart_from_snapshot() {
        let mut cluster = Cluster::new(1, 3);
        for n in 1..=7 {
            cluster.propose(HiveId(1), add(n)).unwrap();
        }
        let state = cluster.persisted[&HiveId(1)].clone();
        assert!(state.snapshot.is_some());

        let mut restored =
            RaftCore::restore(HiveId(1), state, config(3), Counter::default(), rng(9)).unwrap();
        restored.ready();
        assert_eq!(restored.machine().total, 28);
    }

    #[test]
    fn test_status_reported_once_per_change() {
        let mut core = RaftCore::bootstrap(HiveId(1), "h1", config(1000), Counter::default(), rng(1));
        core.ready();
        for _ in 0..20 {
            core.tick();
        }
        let ready = core.ready();
        let status = ready.status.expect("status change");
        assert!(status.is_leader());
        assert!(core.ready().status.is_none());
    }
}
