// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Raft-style role machine, election, replication, commit, and snapshot
//! coordination (spec.md §4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dotdb_common::Term;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::channel::{Channel, DataChunk, JoinReply, QueryData, QueryTerms, RequestVote, RequestVoteReply, SnapshotScore, SyncCommit, SyncCommitReply, TermRangeEntry, UpdateRole, UpdateRoleReply, WriteData, WriteDataReply};
use crate::config::ReplicationConfig;
use crate::error::{JoinErrorCode, ReplicationError, ReplicationResult};
use crate::group_file::{GroupControlMessage, GroupFile, Role};
use crate::scheduler::{Cancellation, Scheduler};
use crate::state_log::StateLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Follower,
    Candidate,
    Leader,
}

struct Peer {
    member_id: u64,
    role: Role,
    channel: Arc<dyn Channel>,
    match_index: AtomicU64,
    sync_match_index: AtomicU64,
}

struct ElectionState {
    mode: Mode,
    current_term: Term,
    voted_for: Option<u64>,
    grants_remaining: usize,
    votes_needed: usize,
    leader_id: Option<u64>,
}

/// Deferral counter: while positive, a scheduled election is skipped once
/// and the counter decremented, per spec.md §4.7.
struct ElectionValidation(AtomicI64);

/// A control-message acceptor supplied by the embedder (spec.md §4.7): it
/// decides whether a proposed control message should be admitted onto the
/// replicated log before the controller appends it.
pub trait ControlMessageAcceptor: Send + Sync {
    fn accept(&self, message: &GroupControlMessage) -> bool;
}

pub struct Controller {
    config: ReplicationConfig,
    local_member_id: u64,
    state_log: Mutex<StateLog>,
    group: Mutex<GroupFile>,
    peers: RwLock<Vec<Peer>>,
    election: RwLock<ElectionState>,
    election_validated: ElectionValidation,
    scheduler: Arc<Scheduler>,
    election_timer: Mutex<Option<Cancellation>>,
    missing_data_timer: Mutex<Option<Cancellation>>,
    last_query_terms: Mutex<HashMap<u64, Instant>>,
    acceptor: Mutex<Option<Arc<dyn ControlMessageAcceptor>>>,
    /// Control messages appended to the log but not yet committed, keyed by
    /// their starting log index and carrying the index one past their last
    /// byte so [`Self::dispatch_committed_control_messages`] knows when a
    /// message has been fully subsumed by a new commit index.
    pending_control_messages: Mutex<HashMap<u64, (u64, GroupControlMessage)>>,
}

impl Controller {
    pub fn new(config: ReplicationConfig, state_log: StateLog, group: GroupFile, scheduler: Arc<Scheduler>) -> Arc<Self> {
        let local_member_id = config.local_member_id;
        let current_term = state_log.current_term();
        let voted_for = state_log.voted_for();
        Arc::new(Self {
            config,
            local_member_id,
            state_log: Mutex::new(state_log),
            group: Mutex::new(group),
            peers: RwLock::new(Vec::new()),
            election: RwLock::new(ElectionState {
                mode: Mode::Follower,
                current_term,
                voted_for,
                grants_remaining: 0,
                votes_needed: 0,
                leader_id: None,
            }),
            election_validated: ElectionValidation(AtomicI64::new(0)),
            scheduler,
            election_timer: Mutex::new(None),
            missing_data_timer: Mutex::new(None),
            last_query_terms: Mutex::new(HashMap::new()),
            acceptor: Mutex::new(None),
            pending_control_messages: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_control_message_acceptor(&self, acceptor: Arc<dyn ControlMessageAcceptor>) {
        *self.acceptor.lock() = Some(acceptor);
    }

    pub fn mode(&self) -> Mode {
        self.election.read().mode
    }

    pub fn current_term(&self) -> Term {
        self.election.read().current_term
    }

    /// Refresh the peer set from the group file's consensus members, each
    /// wired to the given channel factory (so tests can supply loopback
    /// channels instead of real TCP connections).
    pub fn refresh_peers(self: &Arc<Self>, channel_for: impl Fn(u64) -> Arc<dyn Channel>) {
        let group = self.group.lock();
        let mut peers = self.peers.write();
        peers.clear();
        for member in group.members() {
            if member.member_id == self.local_member_id {
                continue;
            }
            peers.push(Peer {
                member_id: member.member_id,
                role: member.role,
                channel: channel_for(member.member_id),
                match_index: AtomicU64::new(0),
                sync_match_index: AtomicU64::new(0),
            });
        }
    }

    fn consensus_peer_count_including_self(&self) -> usize {
        1 + self.peers.read().iter().filter(|p| p.role.is_consensus()).count()
    }

    /// Start the controller's background timers (election timeout, missing
    /// data repair).
    pub fn start(self: &Arc<Self>) {
        self.reset_election_timer();
        self.reset_missing_data_timer();
    }

    pub fn shutdown(&self) {
        if let Some(c) = self.election_timer.lock().take() {
            c.cancel();
        }
        if let Some(c) = self.missing_data_timer.lock().take() {
            c.cancel();
        }
    }

    fn random_election_timeout(&self) -> Duration {
        let (lo, hi) = self.config.election_timeout;
        let lo_ms = lo.as_millis() as u64;
        let hi_ms = hi.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(lo_ms..hi_ms.max(lo_ms + 1)))
    }

    fn reset_election_timer(self: &Arc<Self>) {
        if let Some(c) = self.election_timer.lock().take() {
            c.cancel();
        }
        let timeout = self.random_election_timeout();
        let weak = Arc::downgrade(self);
        let cancellation = self.scheduler.schedule_cancellable(timeout, move || {
            if let Some(this) = weak.upgrade() {
                this.on_election_timeout();
            }
        });
        *self.election_timer.lock() = Some(cancellation);
    }

    fn reset_missing_data_timer(self: &Arc<Self>) {
        if let Some(c) = self.missing_data_timer.lock().take() {
            c.cancel();
        }
        let (lo, hi) = self.config.missing_data_delay;
        let lo_ms = lo.as_millis() as u64;
        let hi_ms = hi.as_millis() as u64;
        let delay = Duration::from_millis(rand::thread_rng().gen_range(lo_ms..hi_ms.max(lo_ms + 1)));
        let weak = Arc::downgrade(self);
        let cancellation = self.scheduler.schedule_cancellable(delay, move || {
            if let Some(this) = weak.upgrade() {
                this.run_missing_data_task();
            }
        });
        *self.missing_data_timer.lock() = Some(cancellation);
    }

    /// Called whenever a current-term leader's message arrives, per
    /// spec.md §4.7 ("Timer is reset whenever a current-term leader's
    /// message arrives").
    pub fn note_leader_activity(self: &Arc<Self>) {
        self.reset_election_timer();
    }

    fn on_election_timeout(self: &Arc<Self>) {
        if self.election_validated.0.load(AtomicOrdering::Acquire) > 0 {
            self.election_validated.0.fetch_sub(1, AtomicOrdering::AcqRel);
            self.reset_election_timer();
            return;
        }
        {
            let election = self.election.read();
            if election.mode == Mode::Leader {
                self.reset_election_timer();
                return;
            }
        }
        if !self.local_role_is_normal() {
            self.reset_election_timer();
            return;
        }
        self.start_election();
        self.reset_election_timer();
    }

    fn local_role_is_normal(&self) -> bool {
        let group = self.group.lock();
        group.members().iter().find(|m| m.member_id == self.local_member_id).map(|m| m.role == Role::Normal).unwrap_or(true)
    }

    fn start_election(self: &Arc<Self>) {
        let (term, highest_term, highest_position) = {
            let mut election = self.election.write();
            let new_term = Term(election.current_term.0 + 1);
            election.mode = Mode::Candidate;
            election.current_term = new_term;
            election.voted_for = Some(self.local_member_id);
            let votes_needed = self.majority_count();
            election.votes_needed = votes_needed;
            election.grants_remaining = votes_needed.saturating_sub(1); // self-vote already counts
            election.leader_id = None;
            let (ht, hp) = self.state_log.lock().highest_term_and_position();
            self.state_log.lock().persist_term_vote(new_term, Some(self.local_member_id)).ok();
            (new_term, ht, hp)
        };
        info!(term = term.0, "starting election");

        let peers: Vec<Arc<dyn Channel>> = self.peers.read().iter().filter(|p| p.role.is_consensus()).map(|p| p.channel.clone()).collect();
        let local_member_id = self.local_member_id;
        let weak = Arc::downgrade(self);
        for channel in peers {
            let weak = weak.clone();
            std::thread::spawn(move || {
                let reply = channel.request_vote(RequestVote {
                    term,
                    candidate_id: local_member_id,
                    highest_term,
                    highest_position,
                });
                if let (Ok(reply), Some(this)) = (reply, weak.upgrade()) {
                    this.handle_vote_reply(term, reply);
                }
            });
        }
    }

    fn majority_count(&self) -> usize {
        self.consensus_peer_count_including_self() / 2 + 1
    }

    fn handle_vote_reply(self: &Arc<Self>, requested_term: Term, reply: RequestVoteReply) {
        let mut election = self.election.write();
        if election.mode != Mode::Candidate || election.current_term != requested_term {
            return;
        }
        if reply.term > election.current_term {
            election.mode = Mode::Follower;
            election.current_term = reply.term;
            election.voted_for = None;
            return;
        }
        if !reply.granted {
            return;
        }
        if election.grants_remaining > 0 {
            election.grants_remaining -= 1;
        }
        if election.grants_remaining == 0 {
            election.mode = Mode::Leader;
            election.leader_id = Some(self.local_member_id);
            info!(term = election.current_term.0, "elected leader");
            drop(election);
            self.affirm_leadership();
        }
    }

    /// Vote-grant rule, spec.md §4.7.
    pub fn handle_request_vote(self: &Arc<Self>, req: RequestVote) -> RequestVoteReply {
        let mut election = self.election.write();
        if req.term < election.current_term {
            return RequestVoteReply { term: election.current_term, granted: false };
        }
        if req.term > election.current_term {
            election.current_term = req.term;
            election.voted_for = None;
            election.mode = Mode::Follower;
        }
        let (local_highest_term, local_highest_position) = self.state_log.lock().highest_term_and_position();
        let log_ok = (req.highest_term, req.highest_position) >= (local_highest_term, local_highest_position);
        let can_vote = election.voted_for.is_none() || election.voted_for == Some(req.candidate_id);
        let granted = log_ok && can_vote;
        if granted {
            election.voted_for = Some(req.candidate_id);
            drop(election);
            self.state_log.lock().persist_term_vote(req.term, Some(req.candidate_id)).ok();
            self.reset_election_timer();
            return RequestVoteReply { term: req.term, granted: true };
        }
        RequestVoteReply { term: election.current_term, granted: false }
    }

    /// Unconditional affirm-leadership broadcast (spec.md §9 redesign:
    /// "this spec makes the affirm-leadership broadcast unconditional").
    fn affirm_leadership(self: &Arc<Self>) {
        self.replicate(&[]);
    }

    /// Leader-side: append `payload` to the local log under the current
    /// term and broadcast `write-data` to every peer. Returns the log index
    /// the payload was written at (its start, not its end).
    pub fn replicate(self: &Arc<Self>, payload: &[u8]) -> ReplicationResult<u64> {
        let (term, index, prev_term, commit_index) = {
            let election = self.election.read();
            if election.mode != Mode::Leader {
                return Err(ReplicationError::NotLeader);
            }
            let mut state_log = self.state_log.lock();
            let term = election.current_term;
            let (_, highest) = state_log.highest_term_and_position();
            if state_log.term_count() == 0 {
                state_log.define_term(Term(0), term, 0).ok();
            }
            let index = highest;
            let prev_term = if index == 0 { Term(0) } else { state_log.highest_term_and_position().0 };
            state_log.write(term, index, payload)?;
            (term, index, prev_term, state_log.commit_position())
        };
        let highest_index = index + payload.len() as u64;

        let peers: Vec<(u64, Arc<dyn Channel>)> = self.peers.read().iter().map(|p| (p.member_id, p.channel.clone())).collect();
        let weak = Arc::downgrade(self);
        for (member_id, channel) in peers {
            let weak = weak.clone();
            let payload = payload.to_vec();
            std::thread::spawn(move || {
                let reply = channel.write_data(WriteData {
                    prev_term,
                    term,
                    index,
                    highest_index,
                    commit_index,
                    bytes: payload,
                });
                if let (Ok(reply), Some(this)) = (reply, weak.upgrade()) {
                    this.handle_write_data_reply(member_id, reply);
                }
            });
        }
        Ok(index)
    }

    /// Follower-side accept/reject of a leader's `write-data` RPC.
    pub fn handle_write_data(self: &Arc<Self>, req: WriteData) -> WriteDataReply {
        {
            let mut election = self.election.write();
            if req.term < election.current_term {
                return WriteDataReply { term: election.current_term, highest_index: 0, accepted: false };
            }
            if election.mode == Mode::Candidate || req.term > election.current_term {
                election.mode = Mode::Follower;
                election.current_term = req.term;
            }
        }
        self.note_leader_activity();

        let mut state_log = self.state_log.lock();
        match state_log.define_term(req.prev_term, req.term, req.index) {
            Ok(()) => {}
            Err(ReplicationError::CommitConflict(reason)) => {
                warn!(reason, "write-data define-term commit conflict, rate-limiting query-terms");
                drop(state_log);
                self.maybe_query_terms(req.index);
                return WriteDataReply { term: req.term, highest_index: 0, accepted: false };
            }
            Err(e) => {
                warn!(error = %e, "write-data define-term failed");
                return WriteDataReply { term: req.term, highest_index: 0, accepted: false };
            }
        }
        if let Err(e) = state_log.write(req.term, req.index, &req.bytes) {
            warn!(error = %e, "write-data append failed");
            return WriteDataReply { term: req.term, highest_index: 0, accepted: false };
        }
        let highest_index = req.index + req.bytes.len() as u64;
        if !req.bytes.is_empty() {
            match GroupControlMessage::decode(&req.bytes) {
                Ok(message) => {
                    self.pending_control_messages.lock().insert(req.index, (highest_index, message));
                }
                Err(e) => warn!(error = %e, "failed to decode write-data payload as a control message"),
            }
        }
        let committed = state_log.commit(req.commit_index.min(req.highest_index)).unwrap_or(false);
        let commit_position = state_log.commit_position();
        drop(state_log);
        if committed {
            self.dispatch_committed_control_messages(commit_position);
        }
        WriteDataReply { term: req.term, highest_index, accepted: true }
    }

    /// Rate-limited reconciliation: ask a random peer for the term
    /// boundaries around `gap_marker` so the next `write-data` retry's
    /// `define-term` has a chance of succeeding (spec.md §4.7).
    fn maybe_query_terms(self: &Arc<Self>, gap_marker: u64) {
        {
            let mut last = self.last_query_terms.lock();
            let now = Instant::now();
            if let Some(prev) = last.get(&gap_marker) {
                if now.duration_since(*prev) < self.config.query_terms_rate_limit {
                    return;
                }
            }
            last.insert(gap_marker, now);
        }
        let peers: Vec<Arc<dyn Channel>> = self.peers.read().iter().map(|p| p.channel.clone()).collect();
        if peers.is_empty() {
            return;
        }
        let start = gap_marker.saturating_sub(1);
        let end = gap_marker + 1;
        let weak = Arc::downgrade(self);
        std::thread::spawn(move || {
            let idx = rand::thread_rng().gen_range(0..peers.len());
            match peers[idx].query_terms(QueryTerms { start, end }) {
                Ok(entries) => {
                    if let Some(this) = weak.upgrade() {
                        this.handle_query_terms_reply(entries);
                    }
                }
                Err(e) => warn!(error = %e, "query-terms failed"),
            }
        });
    }

    /// Feed term boundaries learned from a peer back into the local log so
    /// a subsequent `define-term` call can find the right previous term.
    fn handle_query_terms_reply(self: &Arc<Self>, entries: Vec<TermRangeEntry>) {
        let mut state_log = self.state_log.lock();
        for entry in entries {
            if let Err(e) = state_log.define_term(entry.prev_term, entry.term, entry.start_position) {
                debug!(error = %e, term = entry.term.0, start = entry.start_position, "query-terms reconciliation skipped an entry");
            }
        }
    }

    /// Leader-side: update the peer's `match_index` and recompute the
    /// commit index as the `⌈N/2⌉`-th largest match-index among all
    /// consensus peers plus the leader itself (spec.md §8).
    fn handle_write_data_reply(self: &Arc<Self>, member_id: u64, reply: WriteDataReply) {
        if !reply.accepted {
            return;
        }
        let peers = self.peers.read();
        if let Some(peer) = peers.iter().find(|p| p.member_id == member_id) {
            peer.match_index.store(reply.highest_index, AtomicOrdering::Release);
        }
        let mut match_indices: Vec<u64> = peers.iter().filter(|p| p.role.is_consensus()).map(|p| p.match_index.load(AtomicOrdering::Acquire)).collect();
        drop(peers);
        let (_, self_highest) = self.state_log.lock().highest_term_and_position();
        match_indices.push(self_highest);
        let new_commit = median_match_index(&match_indices);
        let advanced = self.state_log.lock().commit(new_commit).unwrap_or(false);
        if advanced {
            debug!(commit_index = new_commit, "advanced commit index");
            self.dispatch_committed_control_messages(new_commit);
        }
    }

    /// `sync-commit-reply` applies the same median algorithm to
    /// `sync_match_index` to compute the durable index.
    pub fn handle_sync_commit_reply(self: &Arc<Self>, member_id: u64, reply: SyncCommitReply) {
        let peers = self.peers.read();
        if let Some(peer) = peers.iter().find(|p| p.member_id == member_id) {
            peer.sync_match_index.store(reply.index, AtomicOrdering::Release);
        }
        let mut sync_indices: Vec<u64> = peers.iter().filter(|p| p.role.is_consensus()).map(|p| p.sync_match_index.load(AtomicOrdering::Acquire)).collect();
        drop(peers);
        let local_durable = self.state_log.lock().highest_durable_position();
        sync_indices.push(local_durable);
        let new_durable = median_match_index(&sync_indices);
        let _ = self.state_log.lock().commit_durable(new_durable);
    }

    pub fn handle_sync_commit(self: &Arc<Self>, req: SyncCommit) -> ReplicationResult<SyncCommitReply> {
        let mut state_log = self.state_log.lock();
        state_log.sync_commit(req.prev_term, req.term, req.index)?;
        Ok(SyncCommitReply {
            group_version: self.group.lock().version(),
            term: req.term,
            index: state_log.highest_durable_position(),
        })
    }

    pub fn handle_query_terms(&self, req: QueryTerms) -> Vec<TermRangeEntry> {
        self.state_log
            .lock()
            .terms_overlapping(req.start, req.end)
            .into_iter()
            .map(|(prev_term, term, start_position)| TermRangeEntry { prev_term, term, start_position })
            .collect()
    }

    pub fn handle_query_data(&self, req: QueryData) -> ReplicationResult<Vec<DataChunk>> {
        let mut state_log = self.state_log.lock();
        let (term, _) = state_log.highest_term_and_position();
        let len = (req.end - req.start) as usize;
        let bytes = state_log.read(term, req.start, len)?;
        Ok(vec![DataChunk {
            prev_term: Term(0),
            term,
            position: req.start,
            bytes,
        }])
    }

    /// Run one round of missing-data repair: compute gaps and issue
    /// `query-data` to a random peer per range, distributing across peers
    /// on failure.
    fn run_missing_data_task(self: &Arc<Self>) {
        if self.mode() == Mode::Leader {
            self.reset_missing_data_timer();
            return;
        }
        let contiguous = self.state_log.lock().contiguous_position();
        let mut ranges = Vec::new();
        self.state_log.lock().check_for_missing_data(contiguous, &mut ranges);
        let peers: Vec<Arc<dyn Channel>> = self.peers.read().iter().map(|p| p.channel.clone()).collect();
        if !peers.is_empty() {
            for (start, end) in ranges {
                let mut rng = rand::thread_rng();
                let idx = rng.gen_range(0..peers.len());
                let channel = peers[idx].clone();
                match channel.query_data(QueryData { start, end }) {
                    Ok(chunks) => {
                        let mut state_log = self.state_log.lock();
                        for chunk in chunks {
                            if state_log.define_term(chunk.prev_term, chunk.term, chunk.position).is_ok() {
                                let _ = state_log.write(chunk.term, chunk.position, &chunk.bytes);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, start, end, "query-data failed, will retry on a different peer next round");
                    }
                }
            }
        }
        self.reset_missing_data_timer();
    }

    /// Invoked after replication durably commits a control-message index.
    /// Dispatches by opcode to apply join/role-update/remove, refreshes the
    /// peer set if membership changed, and schedules a quick leader
    /// affirmation so the change propagates promptly.
    pub fn control_message_received(self: &Arc<Self>, _index: u64, message: GroupControlMessage) -> ReplicationResult<()> {
        {
            let mut group = self.group.lock();
            group.apply(&message)?;
        }
        if self.mode() == Mode::Leader {
            self.affirm_leadership();
        }
        Ok(())
    }

    /// Drain and apply every pending control message whose span is fully
    /// covered by `commit_index`, in ascending log-index order. Application
    /// errors (e.g. a stale group version) are logged and otherwise
    /// swallowed: the message is already durable on the log, so there is
    /// nothing left to retry against.
    fn dispatch_committed_control_messages(self: &Arc<Self>, commit_index: u64) {
        let mut ready: Vec<(u64, GroupControlMessage)> = {
            let mut pending = self.pending_control_messages.lock();
            let ready_keys: Vec<u64> = pending.iter().filter(|(_, (end_index, _))| *end_index <= commit_index).map(|(start_index, _)| *start_index).collect();
            ready_keys.into_iter().map(|start_index| (start_index, pending.remove(&start_index).unwrap().1)).collect()
        };
        ready.sort_by_key(|(start_index, _)| *start_index);
        for (index, message) in ready {
            if let Err(e) = self.control_message_received(index, message) {
                warn!(error = %e, index, "failed to apply committed control message");
            }
        }
    }

    /// Propose `message` for replication: runs it past the control-message
    /// acceptor, then appends it to the log and broadcasts it like any
    /// other replicated payload. Returns the log index it was proposed at;
    /// the message is only actually applied once that index commits (see
    /// [`Self::dispatch_committed_control_messages`]).
    pub fn propose_control_message(self: &Arc<Self>, message: GroupControlMessage) -> ReplicationResult<u64> {
        if let Some(acceptor) = self.acceptor.lock().as_ref() {
            if !acceptor.accept(&message) {
                return Err(ReplicationError::CommitConflict("control message acceptor rejected proposal".into()));
            }
        }
        let encoded = message.encode();
        let span = encoded.len() as u64;
        let index = self.replicate(&encoded)?;
        self.pending_control_messages.lock().insert(index, (index + span, message));
        Ok(index)
    }

    pub fn handle_update_role(self: &Arc<Self>, req: UpdateRole) -> UpdateRoleReply {
        let message = GroupControlMessage::UpdateRole {
            version: req.group_version,
            member_id: req.member_id,
            role: req.role,
        };
        match self.propose_control_message(message) {
            Ok(_) => UpdateRoleReply {
                group_version: self.group.lock().version(),
                member_id: req.member_id,
                error_code: JoinErrorCode::Success as u8,
            },
            Err(e) => UpdateRoleReply {
                group_version: self.group.lock().version(),
                member_id: req.member_id,
                error_code: JoinErrorCode::from(&e) as u8,
            },
        }
    }

    /// Leader-side join handling for the join listener (spec.md §4.7,
    /// §6): proposes a join control message, blocks (bounded by `timeout`)
    /// until it commits and is applied, then returns the post-join roster.
    /// Non-leaders redirect to the known leader, or report no-leader.
    pub fn handle_join(self: &Arc<Self>, address: String, timeout: Duration) -> JoinReply {
        if self.mode() != Mode::Leader {
            return match self.leader_id() {
                Some(leader_id) => match self.group_snapshot().members.iter().find(|m| m.member_id == leader_id) {
                    Some(m) => JoinReply::Address { leader_address: m.address.clone() },
                    None => JoinReply::Error { code: JoinErrorCode::NoLeader },
                },
                None => JoinReply::Error { code: JoinErrorCode::NoLeader },
            };
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let nonce = rand::thread_rng().gen::<u64>();
        let message = self.group.lock().propose_join(address, nonce, move |_snapshot| {
            let _ = tx.send(());
        });
        if let Err(e) = self.propose_control_message(message) {
            return JoinReply::Error { code: JoinErrorCode::from(&e) };
        }
        if rx.recv_timeout(timeout).is_err() {
            return JoinReply::Error { code: JoinErrorCode::NoConsensus };
        }

        let group = self.group.lock();
        let mut group_file_bytes = Vec::new();
        if let Err(e) = group.write_to(&mut group_file_bytes) {
            warn!(error = %e, "failed to encode group file for a newly joined member");
            return JoinReply::Error { code: JoinErrorCode::UnknownOperation };
        }
        drop(group);
        let (term, index) = self.state_log.lock().highest_term_and_position();
        JoinReply::Joined { prev_term: term, term, index, group_file_bytes }
    }

    pub fn handle_snapshot_score(&self) -> SnapshotScore {
        SnapshotScore {
            active_sessions: Arc::strong_count(&self.scheduler) as u32,
            weight: self.state_log.lock().highest_durable_position() as u32,
        }
    }

    pub fn handle_group_version(&self, _requested: u64) -> u64 {
        self.group.lock().version()
    }

    pub fn leader_id(&self) -> Option<u64> {
        self.election.read().leader_id
    }

    pub fn group_snapshot(&self) -> crate::group_file::GroupFileContents {
        self.group.lock().snapshot()
    }

    /// Decode one request frame's opcode byte, dispatch to the matching
    /// handler, and encode its reply. The inverse of what [`crate::channel::TcpChannel`]'s
    /// methods do on the caller's side.
    fn dispatch_peer_frame(self: &Arc<Self>, frame: &[u8]) -> ReplicationResult<Vec<u8>> {
        use crate::channel::*;
        if frame.is_empty() {
            return Err(ReplicationError::Corruption("empty peer frame".into()));
        }
        Ok(match frame[0] {
            OP_NOP => vec![OP_NOP],
            OP_REQUEST_VOTE => encode_request_vote_reply(&self.handle_request_vote(decode_request_vote(frame)?)),
            OP_QUERY_TERMS => encode_query_terms_reply(&self.handle_query_terms(decode_query_terms(frame)?)),
            OP_QUERY_DATA => encode_query_data_reply(&self.handle_query_data(decode_query_data(frame)?)?),
            OP_WRITE_DATA => encode_write_data_reply(&self.handle_write_data(decode_write_data(frame)?)),
            OP_SYNC_COMMIT => encode_sync_commit_reply(&self.handle_sync_commit(decode_sync_commit(frame)?)?),
            OP_SNAPSHOT_SCORE => encode_snapshot_score_reply(&self.handle_snapshot_score()),
            OP_UPDATE_ROLE => encode_update_role_reply(&self.handle_update_role(decode_update_role(frame)?)),
            OP_GROUP_VERSION => encode_group_version_reply(self.handle_group_version(decode_group_version_request(frame)?)),
            other => return Err(ReplicationError::UnknownOperation(other)),
        })
    }

    /// Serve one peer connection: read frames, dispatch, write replies,
    /// until the peer disconnects.
    pub fn serve_peer_connection(self: &Arc<Self>, mut stream: std::net::TcpStream) -> ReplicationResult<()> {
        loop {
            let frame = match crate::channel::read_frame(&mut stream) {
                Ok(f) => f,
                Err(ReplicationError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            let reply = self.dispatch_peer_frame(&frame)?;
            crate::channel::write_frame(&mut stream, &reply)?;
        }
    }

    /// Accept loop for the peer-to-peer wire protocol: one thread per
    /// connection, matching [`crate::join::run_join_listener`]'s shape.
    pub fn run_peer_listener(self: &Arc<Self>, listener: std::net::TcpListener) {
        for incoming in listener.incoming() {
            match incoming {
                Ok(stream) => {
                    let this = self.clone();
                    std::thread::spawn(move || {
                        if let Err(e) = this.serve_peer_connection(stream) {
                            warn!(error = %e, "peer connection closed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "peer listener accept failed");
                    break;
                }
            }
        }
    }
}

/// The controller implements its own wire capability trait so two
/// controllers can be wired together directly in tests without opening a
/// real socket (spec.md §9). The election-timer reset these handlers do
/// needs an `Arc<Controller>`, so the impl is on `Arc<Controller>` rather
/// than `Controller` itself.
impl Channel for Arc<Controller> {
    fn nop(&self) -> ReplicationResult<()> {
        Ok(())
    }

    fn request_vote(&self, req: RequestVote) -> ReplicationResult<RequestVoteReply> {
        Ok(self.handle_request_vote(req))
    }

    fn query_terms(&self, req: QueryTerms) -> ReplicationResult<Vec<TermRangeEntry>> {
        Ok(Controller::handle_query_terms(self, req))
    }

    fn query_data(&self, req: QueryData) -> ReplicationResult<Vec<DataChunk>> {
        Controller::handle_query_data(self, req)
    }

    fn write_data(&self, req: WriteData) -> ReplicationResult<WriteDataReply> {
        Ok(self.handle_write_data(req))
    }

    fn sync_commit(&self, req: SyncCommit) -> ReplicationResult<SyncCommitReply> {
        self.handle_sync_commit(req)
    }

    fn snapshot_score(&self) -> ReplicationResult<SnapshotScore> {
        Ok(Controller::handle_snapshot_score(self))
    }

    fn update_role(&self, req: UpdateRole) -> ReplicationResult<UpdateRoleReply> {
        Ok(Controller::handle_update_role(self, req))
    }

    fn group_version(&self, version: u64) -> ReplicationResult<u64> {
        Ok(Controller::handle_group_version(self, version))
    }
}

/// Sorted ascending; returns the `⌈N/2⌉`-th largest value (spec.md §8).
fn median_match_index(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    let majority = n.div_ceil(2);
    sorted[n - majority]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group_file::{GroupFileContents, Member};
    use tempfile::TempDir;

    #[test]
    fn median_of_five_is_third_largest() {
        let values = vec![10, 20, 30, 40, 50];
        assert_eq!(median_match_index(&values), 30);
    }

    #[test]
    fn median_of_four_is_second_largest() {
        let values = vec![10, 20, 30, 40];
        assert_eq!(median_match_index(&values), 30);
    }

    #[test]
    fn median_single_value() {
        assert_eq!(median_match_index(&[7]), 7);
    }

    fn make_controller(dir: &std::path::Path, member_id: u64, members: Vec<Member>) -> Arc<Controller> {
        let mut config = ReplicationConfig::default();
        config.local_member_id = member_id;
        config.election_timeout = (Duration::from_secs(3600), Duration::from_secs(3601));
        config.missing_data_delay = (Duration::from_secs(3600), Duration::from_secs(3601));
        let state_log = StateLog::open(&dir.join(format!("log-{member_id}")), "state", 4096).unwrap();
        let group_path = dir.join(format!("group-{member_id}"));
        let group = GroupFile::open(&group_path, member_id, || GroupFileContents { version: 2, group_id: 1, members: members.clone() }).unwrap();
        let scheduler = Scheduler::new(2);
        Controller::new(config, state_log, group, scheduler)
    }

    /// Exercises the full proposed-to-applied path: `propose_control_message`
    /// replicates to the one peer, the peer's ack advances the leader's
    /// commit index and applies the message locally, and the follow-on
    /// affirm-leadership broadcast carries the new commit index back to the
    /// peer so it applies the same message too.
    #[test]
    fn propose_control_message_commits_and_applies_on_both_sides() {
        let dir = TempDir::new().unwrap();
        let members = vec![
            Member { member_id: 1, address: "a".into(), role: Role::Normal },
            Member { member_id: 2, address: "b".into(), role: Role::Normal },
        ];
        let c1 = make_controller(dir.path(), 1, members.clone());
        let c2 = make_controller(dir.path(), 2, members.clone());

        let c2_for_1 = c2.clone();
        c1.refresh_peers(move |_| c2_for_1.clone() as Arc<dyn Channel>);
        let c1_for_2 = c1.clone();
        c2.refresh_peers(move |_| c1_for_2.clone() as Arc<dyn Channel>);

        // Install c1 as leader directly, skipping the election timer.
        {
            let mut election = c1.election.write();
            election.mode = Mode::Leader;
            election.current_term = Term(1);
            election.leader_id = Some(1);
        }
        c2.election.write().current_term = Term(1);

        let message = GroupControlMessage::UpdateRole {
            version: c1.group.lock().version(),
            member_id: 2,
            role: Role::Standby,
        };
        c1.propose_control_message(message).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let c1_done = c1.group.lock().members().iter().any(|m| m.member_id == 2 && m.role == Role::Standby);
            let c2_done = c2.group.lock().members().iter().any(|m| m.member_id == 2 && m.role == Role::Standby);
            if c1_done && c2_done {
                break;
            }
            assert!(Instant::now() < deadline, "control message did not propagate to both sides in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
