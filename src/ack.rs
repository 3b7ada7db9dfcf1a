use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::debug;

use crate::error::{Result, StompError};
use crate::frame::{Command, Frame};
use crate::writer::FrameWriter;

/// Subscription acknowledgement modes as defined by STOMP 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// The broker considers a message delivered as soon as it is sent.
    Auto,
    /// Cumulative acknowledgement: settling message `M` settles every
    /// earlier message of the same subscription too.
    #[default]
    Client,
    /// Each message is settled on its own.
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Whether deliveries under this mode need an ACK or NACK.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(format!("unknown ack mode '{}'", other)),
        }
    }
}

/// How a pending delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack,
}

impl Settlement {
    fn command(self) -> Command {
        match self {
            Settlement::Ack => Command::Ack,
            Settlement::Nack => Command::Nack,
        }
    }
}

/// Bookkeeping for a delivered but not yet acknowledged message.
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub message_id: String,
    pub subscription_id: String,
    /// Broker-assigned token sent back as the ACK/NACK `id` header.
    pub ack_token: String,
    pub mode: AckMode,
    pub received_at: Instant,
    pub(crate) epoch: u64,
    seq: u64,
}

impl PendingAck {
    fn frame(&self, settlement: Settlement) -> Frame {
        Frame::new(settlement.command())
            .header("id", &self.ack_token)
            .header("message-id", &self.message_id)
            .header("subscription", &self.subscription_id)
    }
}

#[derive(Default)]
struct TrackerState {
    /// message-id -> pending entry; at most one per id
    pending: HashMap<String, PendingAck>,
    next_seq: u64,
}

/// Tracks in-flight deliveries for `client` and `client-individual`
/// subscriptions and turns settlements into ACK/NACK frames.
///
/// Every pending entry settles exactly once: a second `ack`/`nack` for the
/// same message id fails with [`StompError::UnknownAck`] and sends nothing.
#[derive(Clone)]
pub struct AckTracker {
    state: Arc<Mutex<TrackerState>>,
    writer: FrameWriter,
}

impl AckTracker {
    pub fn new(writer: FrameWriter) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            writer,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a delivery and return the sequence number identifying this
    /// entry. Returns `None` if the message id is already pending, in which
    /// case nothing changes.
    pub(crate) fn track(
        &self,
        message_id: &str,
        subscription_id: &str,
        ack_token: &str,
        mode: AckMode,
        epoch: u64,
    ) -> Option<u64> {
        let mut state = self.lock();
        if state.pending.contains_key(message_id) {
            return None;
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        state.pending.insert(
            message_id.to_string(),
            PendingAck {
                message_id: message_id.to_string(),
                subscription_id: subscription_id.to_string(),
                ack_token: ack_token.to_string(),
                mode,
                received_at: Instant::now(),
                epoch,
                seq,
            },
        );
        Some(seq)
    }

    /// Remove the pending entry for `message_id`. In `client` mode the
    /// earlier entries of the same subscription go with it, since the broker
    /// treats the acknowledgement as cumulative.
    ///
    /// With `expected_seq` set, only the entry recorded under that sequence
    /// number is taken; a later redelivery of the same id stays pending.
    fn take(&self, message_id: &str, expected_seq: Option<u64>) -> Result<PendingAck> {
        let mut state = self.lock();
        let current = state
            .pending
            .get(message_id)
            .is_some_and(|p| expected_seq.is_none_or(|seq| p.seq == seq));
        if !current {
            return Err(StompError::UnknownAck(message_id.to_string()));
        }
        let entry = state
            .pending
            .remove(message_id)
            .ok_or_else(|| StompError::UnknownAck(message_id.to_string()))?;
        if entry.mode == AckMode::Client {
            state
                .pending
                .retain(|_, p| p.subscription_id != entry.subscription_id || p.seq > entry.seq);
        }
        Ok(entry)
    }

    /// Settle `message_id` and queue the matching ACK or NACK frame.
    pub async fn settle(&self, message_id: &str, settlement: Settlement) -> Result<()> {
        let entry = self.take(message_id, None)?;
        self.send(entry, settlement).await
    }

    /// Settle the delivery recorded as `seq` by [`track`](Self::track).
    /// Fails with `UnknownAck` if that entry is gone, even when a newer
    /// delivery of the same message id is pending.
    pub(crate) async fn settle_tracked(
        &self,
        message_id: &str,
        seq: u64,
        settlement: Settlement,
    ) -> Result<()> {
        let entry = self.take(message_id, Some(seq))?;
        self.send(entry, settlement).await
    }

    async fn send(&self, entry: PendingAck, settlement: Settlement) -> Result<()> {
        let message_id = entry.message_id.as_str();
        debug!(
            message_id,
            subscription = %entry.subscription_id,
            ?settlement,
            "settling delivery"
        );
        self.writer
            .send_session_frame(entry.frame(settlement), entry.epoch)
            .await
    }

    pub async fn ack(&self, message_id: &str) -> Result<()> {
        self.settle(message_id, Settlement::Ack).await
    }

    pub async fn nack(&self, message_id: &str) -> Result<()> {
        self.settle(message_id, Settlement::Nack).await
    }

    /// Forget every pending entry of a subscription without sending
    /// anything. Returns how many were dropped.
    pub(crate) fn drop_subscription(&self, subscription_id: &str) -> usize {
        let mut state = self.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|_, p| p.subscription_id != subscription_id);
        before - state.pending.len()
    }

    /// Forget the entry recorded as `seq` without sending anything.
    pub(crate) fn forget(&self, message_id: &str, seq: u64) -> bool {
        let mut state = self.lock();
        if state.pending.get(message_id).is_some_and(|p| p.seq == seq) {
            state.pending.remove(message_id);
            return true;
        }
        false
    }

    /// Forget everything; used when the session ends.
    pub(crate) fn clear(&self) -> usize {
        let mut state = self.lock();
        let n = state.pending.len();
        state.pending.clear();
        n
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.lock().pending.contains_key(message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Snapshot of the pending entries, oldest first.
    pub fn pending(&self) -> Vec<PendingAck> {
        let mut v: Vec<PendingAck> = self.lock().pending.values().cloned().collect();
        v.sort_by_key(|p| p.seq);
        v
    }
}
