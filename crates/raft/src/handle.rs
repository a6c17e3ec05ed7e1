//! Client side of a running raft server.

use bytes::Bytes;
use conductor_storage::{BlockAddress, CommitWatermark, Position};
use conductor_transport::MemberId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{RaftError, RaftResult};

/// Role of a member in its current term
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts entries from a leader
    Follower,
    /// Asking for votes
    Candidate,
    /// Accepts and replicates new entries
    Leader,
}

/// Published on every role, term or leader change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    /// Current role
    pub role: Role,
    /// Current term
    pub term: u64,
    /// Known leader of the term
    pub leader: Option<MemberId>,
    /// Index of the initial entry this member appended when it became leader
    pub initial_index: Option<u64>,
}

impl RaftStatus {
    pub(crate) fn follower(term: u64, leader: Option<MemberId>) -> Self {
        Self {
            role: Role::Follower,
            term,
            leader,
            initial_index: None,
        }
    }
}

pub(crate) type ReplicateReply = oneshot::Sender<RaftResult<BlockAddress>>;

pub(crate) enum Command {
    Replicate {
        lowest: Position,
        highest: Position,
        payload: Bytes,
        reply: ReplicateReply,
    },
    StepDown {
        reply: oneshot::Sender<RaftResult<()>>,
    },
}

/// Handle to a [`crate::RaftServer`]. Clones share the same server.
#[derive(Clone)]
pub struct RaftHandle {
    member: MemberId,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<RaftStatus>,
    commits: watch::Receiver<CommitWatermark>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for RaftHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftHandle")
            .field("member", &self.member)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl RaftHandle {
    pub(crate) fn new(
        member: MemberId,
        commands: mpsc::Sender<Command>,
        status: watch::Receiver<RaftStatus>,
        commits: watch::Receiver<CommitWatermark>,
        token: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            member,
            commands,
            status,
            commits,
            token,
            tracker,
        }
    }

    /// The local member
    pub fn member_id(&self) -> &MemberId {
        &self.member
    }

    /// Replicate a block covering `[lowest, highest]` and wait until it is
    /// committed.
    ///
    /// Fails with [`RaftError::NotLeader`] on followers and when leadership
    /// is lost before the entry commits. Such an entry may still be
    /// committed later by another leader.
    pub async fn replicate(
        &self,
        lowest: Position,
        highest: Position,
        payload: Bytes,
    ) -> RaftResult<BlockAddress> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Replicate {
                lowest,
                highest,
                payload,
                reply,
            })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Watch the commit watermark of the local log
    pub fn commit_position(&self) -> watch::Receiver<CommitWatermark> {
        self.commits.clone()
    }

    /// Current status
    pub fn status(&self) -> RaftStatus {
        self.status.borrow().clone()
    }

    /// Current role
    pub fn role(&self) -> Role {
        self.status.borrow().role
    }

    /// Current term
    pub fn term(&self) -> u64 {
        self.status.borrow().term
    }

    /// Known leader
    pub fn leader(&self) -> Option<MemberId> {
        self.status.borrow().leader.clone()
    }

    /// Whether this member leads the current term
    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Watch role changes
    pub fn role_changes(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    /// Give up leadership and hold back from the next election.
    pub async fn transfer_step_down(&self) -> RaftResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::StepDown { reply })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Stop the server and wait for it to exit
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.wait().await;
    }
}
