//! The raft actor: elections, replication and commit tracking.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conductor_storage::{BlockAddress, BlockLog, LogBlock, Position, StorageAdaptor};
use conductor_transport::{MemberId, Transport, TransportEnvelope};
use futures::StreamExt;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::handle::{Command, ReplicateReply};
use crate::message::RAFT_MESSAGE_TYPE;
use crate::metadata::HardState;
use crate::{
    Election, ElectionOutcome, EntryValidator, GapValidator, Quorum, RaftConfig, RaftError,
    RaftHandle, RaftMessage, RaftResult, RaftStatus, Role,
};

const COMMAND_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Progress {
    next_index: u64,
    match_index: u64,
}

/// An uncommitted entry of the current term
struct PendingEntry {
    quorum: Quorum,
    /// Members already counted, positively or negatively
    answered: HashSet<MemberId>,
    rounds: u32,
    deadline: Instant,
    waiter: Option<(BlockAddress, ReplicateReply)>,
}

impl PendingEntry {
    fn acknowledge(&mut self, member: &MemberId) {
        if self.answered.insert(member.clone()) {
            self.quorum.succeed();
        }
    }
}

struct LeaderState {
    followers: HashMap<MemberId, Progress>,
    pending: BTreeMap<u64, PendingEntry>,
}

/// One member of a partition's replication group.
///
/// Started with [`RaftServer::start`]; the server runs as its own task and
/// is driven through the returned [`RaftHandle`].
pub struct RaftServer<S, T> {
    id: MemberId,
    peers: Vec<MemberId>,
    config: RaftConfig,
    log: BlockLog<S>,
    transport: Arc<T>,
    validator: Arc<dyn EntryValidator>,
    hard_state: HardState,
    role: Role,
    leader: Option<MemberId>,
    election: Option<Election>,
    leader_state: Option<LeaderState>,
    election_deadline: Instant,
    status_tx: watch::Sender<RaftStatus>,
}

impl<S, T> RaftServer<S, T>
where
    S: StorageAdaptor,
    T: Transport,
{
    /// Start a member of the group `members` with gap validation.
    pub async fn start(
        id: MemberId,
        members: Vec<MemberId>,
        log: BlockLog<S>,
        transport: Arc<T>,
        config: RaftConfig,
    ) -> RaftResult<RaftHandle> {
        Self::start_with_validator(id, members, log, transport, config, Arc::new(GapValidator))
            .await
    }

    /// Start a member with a custom entry validator.
    pub async fn start_with_validator(
        id: MemberId,
        members: Vec<MemberId>,
        log: BlockLog<S>,
        transport: Arc<T>,
        config: RaftConfig,
        validator: Arc<dyn EntryValidator>,
    ) -> RaftResult<RaftHandle> {
        config.validate()?;
        let hard_state = HardState::load(log.storage(), log.namespace()).await?;

        let peers: Vec<MemberId> = members
            .into_iter()
            .filter(|m| *m != id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let (status_tx, status_rx) = watch::channel(RaftStatus::follower(hard_state.term, None));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let commits = log.subscribe_commits();
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        info!(
            member = %id,
            peers = peers.len(),
            term = hard_state.term,
            last_index = log.last_index(),
            "Starting raft server"
        );

        let mut server = Self {
            id: id.clone(),
            peers,
            config,
            log,
            transport,
            validator,
            hard_state,
            role: Role::Follower,
            leader: None,
            election: None,
            leader_state: None,
            election_deadline: Instant::now(),
            status_tx,
        };
        server.reset_election_deadline();

        let run_token = token.clone();
        tracker.spawn(server.run(commands_rx, run_token));
        tracker.close();

        Ok(RaftHandle::new(
            id,
            commands_tx,
            status_rx,
            commits,
            token,
            tracker,
        ))
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, token: CancellationToken) {
        let mut incoming = self.transport.incoming();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let is_leader = self.role == Role::Leader;
            let election_deadline = self.election_deadline;

            tokio::select! {
                _ = token.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(envelope) = incoming.next() => {
                    if let Err(e) = self.handle_envelope(envelope).await {
                        warn!(member = %self.id, "Failed to handle raft message: {}", e);
                    }
                }
                _ = heartbeat.tick() => {
                    if is_leader {
                        self.on_heartbeat().await;
                    }
                }
                _ = sleep_until(election_deadline), if !is_leader => {
                    if let Err(e) = self.start_election().await {
                        error!(member = %self.id, "Failed to start election: {}", e);
                    }
                }
            }
        }

        self.fail_pending(|| RaftError::Shutdown);
        self.role = Role::Follower;
        self.leader = None;
        self.publish_status(None);
        if let Err(e) = self.transport.shutdown().await {
            debug!(member = %self.id, "Transport shutdown failed: {}", e);
        }
        info!(member = %self.id, term = self.hard_state.term, "Raft server stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Replicate {
                lowest,
                highest,
                payload,
                reply,
            } => self.replicate(lowest, highest, payload, reply).await,
            Command::StepDown { reply } => {
                let result = if self.role == Role::Leader {
                    let term = self.hard_state.term;
                    let result = self.become_follower(term, None).await;
                    // Let another member win the next election.
                    self.election_deadline += self.config.election_timeout_max * 2;
                    info!(member = %self.id, term, "Stepped down on request");
                    result
                } else {
                    Err(RaftError::NotLeader {
                        leader: self.leader.clone(),
                    })
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn replicate(
        &mut self,
        lowest: Position,
        highest: Position,
        payload: Bytes,
        reply: ReplicateReply,
    ) {
        if self.role != Role::Leader {
            let _ = reply.send(Err(RaftError::NotLeader {
                leader: self.leader.clone(),
            }));
            return;
        }

        let block = LogBlock::application(self.hard_state.term, lowest, highest, payload);
        if let Err(e) = self
            .validator
            .validate(self.log.last_application().as_ref(), &block)
        {
            warn!(member = %self.id, lowest, highest, "Rejected entry: {}", e);
            let _ = reply.send(Err(e.into()));
            return;
        }

        let address = match self.log.append(block).await {
            Ok(address) => address,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        debug!(
            member = %self.id,
            index = address.index,
            lowest,
            highest,
            "Appended entry"
        );
        self.track(address.index, Some((address, reply)));
        self.broadcast_append().await;
        self.advance_commit().await;
    }

    /// Start counting acknowledgements for the entry at `index`.
    fn track(&mut self, index: u64, waiter: Option<(BlockAddress, ReplicateReply)>) {
        let member_count = self.peers.len() + 1;
        let deadline = Instant::now() + self.config.replication_timeout;
        let Some(leader) = self.leader_state.as_mut() else {
            return;
        };

        let mut entry = PendingEntry {
            quorum: Quorum::new(member_count),
            answered: HashSet::new(),
            rounds: 0,
            deadline,
            waiter,
        };
        entry.acknowledge(&self.id);
        for (member, progress) in &leader.followers {
            if progress.match_index >= index {
                entry.acknowledge(member);
            }
        }
        leader.pending.insert(index, entry);
    }

    /// Commit the longest elected prefix of pending entries. Steps down when
    /// an entry can no longer reach quorum.
    async fn advance_commit(&mut self) {
        let Some(leader) = self.leader_state.as_mut() else {
            return;
        };

        let mut committed = None;
        let mut ready = Vec::new();
        while let Some(entry) = leader.pending.first_entry() {
            if !entry.get().quorum.is_elected() {
                break;
            }
            let (index, entry) = entry.remove_entry();
            committed = Some(index);
            ready.extend(entry.waiter);
        }

        let lost = leader
            .pending
            .values()
            .any(|e| e.quorum.is_complete() && !e.quorum.is_elected());

        if let Some(index) = committed {
            let watermark = self.log.commit_to(index);
            debug!(
                member = %self.id,
                index = watermark.index,
                position = watermark.position,
                "Committed entries"
            );
        }
        for (address, reply) in ready {
            let _ = reply.send(Ok(address));
        }

        if lost {
            warn!(
                member = %self.id,
                term = self.hard_state.term,
                "Entry cannot reach quorum, stepping down"
            );
            let term = self.hard_state.term;
            if let Err(e) = self.become_follower(term, None).await {
                error!(member = %self.id, "Failed to step down: {}", e);
            }
        }
    }

    async fn on_heartbeat(&mut self) {
        let now = Instant::now();
        let max_rounds = self.config.max_append_retries;
        let replication_timeout = self.config.replication_timeout;
        let peers = self.peers.clone();

        if let Some(leader) = self.leader_state.as_mut() {
            for (index, entry) in leader.pending.iter_mut() {
                if now < entry.deadline {
                    continue;
                }
                entry.rounds += 1;
                entry.deadline = now + replication_timeout;
                debug!(index, rounds = entry.rounds, "Replication round expired");

                if entry.rounds >= max_rounds {
                    for peer in &peers {
                        if entry.answered.insert(peer.clone()) {
                            entry.quorum.fail();
                        }
                    }
                }
            }
        }

        self.advance_commit().await;
        if self.role == Role::Leader {
            self.broadcast_append().await;
        }
    }

    async fn broadcast_append(&mut self) {
        for peer in self.peers.clone() {
            if let Err(e) = self.send_append(&peer).await {
                warn!(member = %self.id, peer = %peer, "Failed to prepare append: {}", e);
            }
        }
    }

    async fn send_append(&self, peer: &MemberId) -> RaftResult<()> {
        let Some(next_index) = self
            .leader_state
            .as_ref()
            .and_then(|l| l.followers.get(peer))
            .map(|p| p.next_index)
        else {
            return Ok(());
        };

        let prev_index = next_index.saturating_sub(1);
        let Some(prev_term) = self.log.term_at(prev_index) else {
            warn!(
                member = %self.id,
                peer = %peer,
                prev_index,
                "Follower lags behind the compacted log"
            );
            return Ok(());
        };

        let last_index = self.log.last_index();
        let entries = if next_index <= last_index {
            let end = last_index.min(next_index + self.config.max_entries_per_append as u64 - 1);
            self.log.read_raw(next_index, end + 1).await?
        } else {
            Vec::new()
        };

        if entries.first().is_some_and(|(index, _)| *index != next_index) {
            warn!(member = %self.id, peer = %peer, next_index, "Entries missing from log");
            return Ok(());
        }

        let message = RaftMessage::AppendRequest {
            term: self.hard_state.term,
            leader: self.id.clone(),
            prev_index,
            prev_term,
            entries: entries.into_iter().map(|(_, data)| data).collect(),
            leader_commit: self.log.commit_watermark().index,
        };
        self.send(peer, &message).await;
        Ok(())
    }

    async fn send(&self, to: &MemberId, message: &RaftMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(member = %self.id, "Failed to encode raft message: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .transport
            .send_envelope(to, &payload, RAFT_MESSAGE_TYPE)
            .await
        {
            debug!(member = %self.id, to = %to, "Failed to send raft message: {}", e);
        }
    }

    async fn handle_envelope(&mut self, envelope: TransportEnvelope) -> RaftResult<()> {
        if envelope.message_type != RAFT_MESSAGE_TYPE {
            return Ok(());
        }
        let from = envelope.sender;

        match RaftMessage::decode(&envelope.payload)? {
            RaftMessage::VoteRequest {
                term,
                candidate,
                last_index,
                last_term,
            } => {
                self.handle_vote_request(&from, term, candidate, last_index, last_term)
                    .await
            }
            RaftMessage::VoteResponse { term, granted } => {
                self.handle_vote_response(&from, term, granted).await
            }
            RaftMessage::AppendRequest {
                term,
                leader,
                prev_index,
                prev_term,
                entries,
                leader_commit,
            } => {
                self.handle_append_request(
                    &from,
                    term,
                    leader,
                    prev_index,
                    prev_term,
                    entries,
                    leader_commit,
                )
                .await
            }
            RaftMessage::AppendResponse {
                term,
                success,
                last_index,
            } => {
                self.handle_append_response(&from, term, success, last_index)
                    .await
            }
        }
    }

    async fn start_election(&mut self) -> RaftResult<()> {
        self.reset_election_deadline();

        let term = self.hard_state.term + 1;
        let hard_state = HardState {
            term,
            voted_for: Some(self.id.clone()),
        };
        hard_state
            .store(self.log.storage(), self.log.namespace())
            .await?;
        self.hard_state = hard_state;

        self.role = Role::Candidate;
        self.leader = None;
        let election = Election::start(term, &self.id, self.peers.len() + 1);
        let outcome = election.outcome();
        self.election = Some(election);
        self.publish_status(None);
        info!(member = %self.id, term, "Starting election");

        if outcome == ElectionOutcome::Elected {
            return self.become_leader().await;
        }

        let request = RaftMessage::VoteRequest {
            term,
            candidate: self.id.clone(),
            last_index: self.log.last_index(),
            last_term: self.log.last_term(),
        };
        for peer in &self.peers {
            self.send(peer, &request).await;
        }
        Ok(())
    }

    async fn handle_vote_request(
        &mut self,
        from: &MemberId,
        term: u64,
        candidate: MemberId,
        last_index: u64,
        last_term: u64,
    ) -> RaftResult<()> {
        if term > self.hard_state.term {
            self.become_follower(term, None).await?;
        }

        let (my_last_term, my_last_index) = (self.log.last_term(), self.log.last_index());
        let up_to_date =
            last_term > my_last_term || (last_term == my_last_term && last_index >= my_last_index);
        let granted = term == self.hard_state.term
            && up_to_date
            && self
                .hard_state
                .voted_for
                .as_ref()
                .is_none_or(|voted| *voted == candidate);

        if granted {
            if self.hard_state.voted_for.is_none() {
                let hard_state = HardState {
                    term,
                    voted_for: Some(candidate.clone()),
                };
                hard_state
                    .store(self.log.storage(), self.log.namespace())
                    .await?;
                self.hard_state = hard_state;
            }
            self.reset_election_deadline();
        }

        debug!(member = %self.id, candidate = %candidate, term, granted, "Answered vote request");
        let response = RaftMessage::VoteResponse {
            term: self.hard_state.term,
            granted,
        };
        self.send(from, &response).await;
        Ok(())
    }

    async fn handle_vote_response(
        &mut self,
        from: &MemberId,
        term: u64,
        granted: bool,
    ) -> RaftResult<()> {
        if term > self.hard_state.term {
            return self.become_follower(term, None).await;
        }
        if self.role != Role::Candidate || term != self.hard_state.term {
            return Ok(());
        }
        let Some(election) = self.election.as_mut() else {
            return Ok(());
        };

        match election.record(from, granted) {
            ElectionOutcome::Elected => self.become_leader().await,
            ElectionOutcome::SteppedDown => {
                debug!(member = %self.id, term, "Lost election");
                Ok(())
            }
            ElectionOutcome::Pending => Ok(()),
        }
    }

    async fn become_leader(&mut self) -> RaftResult<()> {
        let term = self.hard_state.term;
        self.election = None;

        let next_index = self.log.last_index() + 1;
        let followers = self
            .peers
            .iter()
            .map(|peer| {
                (
                    peer.clone(),
                    Progress {
                        next_index,
                        match_index: 0,
                    },
                )
            })
            .collect();

        let address = match self.log.append(LogBlock::initial(term)).await {
            Ok(address) => address,
            Err(e) => {
                self.role = Role::Follower;
                self.reset_election_deadline();
                self.publish_status(None);
                return Err(e.into());
            }
        };

        self.role = Role::Leader;
        self.leader = Some(self.id.clone());
        self.leader_state = Some(LeaderState {
            followers,
            pending: BTreeMap::new(),
        });
        self.track(address.index, None);
        self.publish_status(Some(address.index));
        info!(
            member = %self.id,
            term,
            initial_index = address.index,
            "Became leader"
        );

        self.broadcast_append().await;
        self.advance_commit().await;
        Ok(())
    }

    /// Move to follower in `term`, failing every pending entry.
    async fn become_follower(&mut self, term: u64, leader: Option<MemberId>) -> RaftResult<()> {
        if term > self.hard_state.term {
            let hard_state = HardState {
                term,
                voted_for: None,
            };
            hard_state
                .store(self.log.storage(), self.log.namespace())
                .await?;
            self.hard_state = hard_state;
        }

        if let Some(election) = self.election.as_mut() {
            election.step_down();
        }
        self.election = None;

        let previous = self.role;
        let known_leader = leader.clone();
        self.fail_pending(|| RaftError::NotLeader {
            leader: known_leader.clone(),
        });

        self.role = Role::Follower;
        self.leader = leader;
        self.reset_election_deadline();
        self.publish_status(None);

        if previous != Role::Follower {
            info!(
                member = %self.id,
                term = self.hard_state.term,
                from = ?previous,
                "Became follower"
            );
        }
        Ok(())
    }

    fn fail_pending(&mut self, error: impl Fn() -> RaftError) {
        if let Some(leader) = self.leader_state.take() {
            for (_, entry) in leader.pending {
                if let Some((_, reply)) = entry.waiter {
                    let _ = reply.send(Err(error()));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_append_request(
        &mut self,
        from: &MemberId,
        term: u64,
        leader: MemberId,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<Bytes>,
        leader_commit: u64,
    ) -> RaftResult<()> {
        if term < self.hard_state.term {
            let response = RaftMessage::AppendResponse {
                term: self.hard_state.term,
                success: false,
                last_index: self.log.last_index(),
            };
            self.send(from, &response).await;
            return Ok(());
        }

        if term > self.hard_state.term
            || self.role != Role::Follower
            || self.leader.as_ref() != Some(&leader)
        {
            self.become_follower(term, Some(leader)).await?;
        }
        self.reset_election_deadline();

        let (success, last_index) = match self
            .accept_entries(prev_index, prev_term, entries, leader_commit)
            .await
        {
            Ok(matched) => (true, matched),
            Err(hint) => (false, hint),
        };

        let response = RaftMessage::AppendResponse {
            term: self.hard_state.term,
            success,
            last_index,
        };
        self.send(from, &response).await;
        Ok(())
    }

    /// Write the shipped entries after `prev_index`. Returns the last
    /// matching index, or the index the leader should resend after.
    async fn accept_entries(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<Bytes>,
        leader_commit: u64,
    ) -> Result<u64, u64> {
        let last_index = self.log.last_index();
        if prev_index > last_index {
            return Err(last_index);
        }
        // Compacted entries are committed and therefore match.
        if let Some(term) = self.log.term_at(prev_index) {
            if term != prev_term {
                debug!(member = %self.id, prev_index, term, prev_term, "Log mismatch");
                return Err(prev_index.saturating_sub(1));
            }
        }

        let mut index = prev_index;
        for data in entries {
            index += 1;
            let block = LogBlock::decode(index, &data).map_err(|e| {
                warn!(member = %self.id, index, "Received corrupt entry: {}", e);
                index - 1
            })?;

            if index <= self.log.last_index() {
                if self.log.term_at(index) == Some(block.term) {
                    continue;
                }
                self.log.truncate_after(index - 1).await.map_err(|e| {
                    error!(member = %self.id, index, "Failed to truncate conflicting entries: {}", e);
                    index - 1
                })?;
            }

            self.validator
                .validate(self.log.last_application().as_ref(), &block)
                .map_err(|e| {
                    warn!(member = %self.id, index, "Rejected replicated entry: {}", e);
                    index - 1
                })?;

            if let Err(e) = self.log.write_at(index, block).await {
                warn!(member = %self.id, index, "Failed to write replicated entry: {}", e);
                return Err(self.log.last_index().min(index - 1));
            }
        }

        let commit = leader_commit.min(index);
        if commit > self.log.commit_watermark().index {
            self.log.commit_to(commit);
        }
        Ok(index)
    }

    async fn handle_append_response(
        &mut self,
        from: &MemberId,
        term: u64,
        success: bool,
        last_index: u64,
    ) -> RaftResult<()> {
        if term > self.hard_state.term {
            return self.become_follower(term, None).await;
        }
        if self.role != Role::Leader || term < self.hard_state.term {
            return Ok(());
        }

        let log_last = self.log.last_index();
        let Some(leader) = self.leader_state.as_mut() else {
            return Ok(());
        };
        let Some(progress) = leader.followers.get_mut(from) else {
            return Ok(());
        };

        if success {
            progress.match_index = progress.match_index.max(last_index);
            progress.next_index = progress.match_index + 1;
            let behind = progress.next_index <= log_last;
            for (_, entry) in leader.pending.range_mut(..=last_index) {
                entry.acknowledge(from);
            }
            self.advance_commit().await;
            if behind && self.role == Role::Leader {
                self.send_append(from).await?;
            }
        } else {
            progress.next_index = (last_index + 1)
                .max(progress.match_index + 1)
                .min(log_last + 1);
            self.send_append(from).await?;
        }
        Ok(())
    }

    fn reset_election_deadline(&mut self) {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        let timeout = rand::thread_rng().gen_range(min..=max);
        self.election_deadline = Instant::now() + Duration::from_millis(timeout);
    }

    fn publish_status(&self, initial_index: Option<u64>) {
        let status = RaftStatus {
            role: self.role,
            term: self.hard_state.term,
            leader: self.leader.clone(),
            initial_index,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
