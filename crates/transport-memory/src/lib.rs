//! In-memory transport implementation for testing
//!
//! Members of one [`MemoryNetwork`] exchange envelopes through channels
//! within the same process. The network can be told to misbehave the way a
//! real one does: cut links, isolate members, drop or duplicate messages.

use async_trait::async_trait;
use bytes::Bytes;
use conductor_transport::{Config, MemberId, Transport, TransportEnvelope, TransportError};
use dashmap::DashMap;
use futures::Stream;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

#[derive(Default)]
struct Faults {
    /// Unordered member pairs that cannot talk to each other
    cut_links: HashSet<(MemberId, MemberId)>,
    isolated: HashSet<MemberId>,
    drop_rate: f64,
    duplicate: bool,
}

impl Faults {
    fn link(a: &MemberId, b: &MemberId) -> (MemberId, MemberId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn blocks(&self, from: &MemberId, to: &MemberId) -> bool {
        self.isolated.contains(from)
            || self.isolated.contains(to)
            || self.cut_links.contains(&Self::link(from, to))
    }
}

#[derive(Default)]
struct NetworkInner {
    members: DashMap<MemberId, flume::Sender<TransportEnvelope>>,
    faults: RwLock<Faults>,
}

/// A process-local network connecting [`MemoryTransport`]s.
///
/// Clones share the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("members", &self.inner.members.len())
            .finish()
    }
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `member` with the default transport config.
    pub fn join(&self, member: impl Into<MemberId>) -> MemoryTransport {
        self.join_with_config(member, Config::default())
    }

    /// Attach `member`. Joining again replaces the previous registration.
    pub fn join_with_config(&self, member: impl Into<MemberId>, config: Config) -> MemoryTransport {
        let member = member.into();
        let (tx, rx) = flume::unbounded();
        self.inner.members.insert(member.clone(), tx);
        info!(member = %member, "Member joined memory network");

        MemoryTransport {
            member,
            network: self.clone(),
            rx,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn partition(&self, a: &MemberId, b: &MemberId) {
        self.inner.faults.write().cut_links.insert(Faults::link(a, b));
        debug!(a = %a, b = %b, "Link cut");
    }

    /// Cut every link of `member`.
    pub fn isolate(&self, member: &MemberId) {
        self.inner.faults.write().isolated.insert(member.clone());
        debug!(member = %member, "Member isolated");
    }

    /// Restore every link and stop dropping or duplicating messages.
    pub fn heal(&self) {
        *self.inner.faults.write() = Faults::default();
        debug!("Memory network healed");
    }

    /// Drop each message with probability `rate` (clamped to `0.0..=1.0`).
    pub fn set_drop_rate(&self, rate: f64) {
        self.inner.faults.write().drop_rate = rate.clamp(0.0, 1.0);
    }

    /// Deliver every message twice.
    pub fn set_duplicate(&self, duplicate: bool) {
        self.inner.faults.write().duplicate = duplicate;
    }

    /// How many copies of a message from `from` to `to` get delivered.
    fn copies(&self, from: &MemberId, to: &MemberId) -> usize {
        let faults = self.inner.faults.read();
        if faults.blocks(from, to) {
            return 0;
        }
        if faults.drop_rate > 0.0 && rand::thread_rng().gen_bool(faults.drop_rate) {
            return 0;
        }
        if faults.duplicate { 2 } else { 1 }
    }

    fn leave(&self, member: &MemberId) {
        self.inner.members.remove(member);
        info!(member = %member, "Member left memory network");
    }
}

/// One member's view of a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    member: MemberId,
    network: MemoryNetwork,
    rx: flume::Receiver<TransportEnvelope>,
    config: Config,
    shutdown: Arc<AtomicBool>,
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("member", &self.member)
            .field("pending", &self.rx.len())
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_member(&self) -> &MemberId {
        &self.member
    }

    async fn send_envelope(
        &self,
        recipient: &MemberId,
        payload: &Bytes,
        message_type: &str,
    ) -> Result<(), TransportError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(TransportError::Shutdown);
        }
        if payload.len() > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: payload.len(),
                limit: self.config.max_message_size,
            });
        }

        let sender = self
            .network
            .inner
            .members
            .get(recipient)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable(recipient.to_string()))?;

        let copies = self.network.copies(&self.member, recipient);
        if copies == 0 {
            debug!(
                from = %self.member,
                to = %recipient,
                message_type,
                "Memory network dropped message"
            );
            return Ok(());
        }

        let envelope = TransportEnvelope {
            message_type: message_type.to_string(),
            payload: payload.clone(),
            sender: self.member.clone(),
        };
        for _ in 0..copies {
            sender
                .send(envelope.clone())
                .map_err(|_| TransportError::Unreachable(recipient.to_string()))?;
        }

        Ok(())
    }

    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEnvelope> + Send>> {
        Box::pin(self.rx.clone().into_stream())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            self.network.leave(&self.member);
        }
        Ok(())
    }
}
