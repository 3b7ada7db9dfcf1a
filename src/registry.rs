use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ack::{AckMode, AckTracker, Settlement};
use crate::error::{Result, StompError};
use crate::frame::{Command, Frame};
use crate::handler::{Message, MessageHandler};
use crate::writer::FrameWriter;

/// Options for a subscription.
///
/// `headers` are forwarded to the broker on SUBSCRIBE and re-sent with
/// every automatic resubscribe after a reconnect (selectors, durable
/// subscription names and other broker-specific settings go here).
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// Use this id instead of a generated `sub-N` one.
    pub id: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl SubscriptionOptions {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Public view of a registered subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub destination: String,
    pub ack: AckMode,
    pub headers: Vec<(String, String)>,
}

/// A routed message plus the message id and tracker sequence of its
/// pending acknowledgement, if one was created.
struct Delivery {
    message: Message,
    ack_key: Option<(String, u64)>,
}

struct SubscriptionEntry {
    info: SubscriptionInfo,
    seq: u64,
    deliveries: mpsc::UnboundedSender<Delivery>,
    stop: CancellationToken,
}

impl SubscriptionEntry {
    fn subscribe_frame(&self) -> Frame {
        subscribe_frame(&self.info)
    }
}

fn subscribe_frame(info: &SubscriptionInfo) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", &info.id)
        .header("destination", &info.destination)
        .header("ack", info.ack.as_str())
        .headers(info.headers.iter().cloned())
}

#[derive(Default)]
struct RegistryState {
    subs: HashMap<String, SubscriptionEntry>,
    next_id: u64,
    next_seq: u64,
}

/// Maps subscription ids to handlers and routes inbound MESSAGE frames.
///
/// Each subscription owns a worker task that runs its handler for one
/// message at a time, in arrival order, and settles the acknowledgement
/// before taking the next message. Different subscriptions never wait on
/// each other, and the connection's reader loop never waits on a handler.
///
/// Lock order: the registry lock may be held while taking the tracker's
/// lock, never the other way round.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    state: Arc<Mutex<RegistryState>>,
    writer: FrameWriter,
    tracker: AckTracker,
}

impl SubscriptionRegistry {
    pub fn new(writer: FrameWriter) -> Self {
        let tracker = AckTracker::new(writer.clone());
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            writer,
            tracker,
        }
    }

    pub fn tracker(&self) -> &AckTracker {
        &self.tracker
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for `destination` and return the subscription id.
    ///
    /// While a session is live the SUBSCRIBE frame is queued right away;
    /// otherwise it goes out when the next session starts. No broker
    /// confirmation is awaited.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        destination: &str,
        ack: AckMode,
        options: SubscriptionOptions,
        handler: H,
    ) -> Result<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let (info, epoch) = {
            let mut state = self.lock();
            let id = match options.id {
                Some(id) => {
                    if state.subs.contains_key(&id) {
                        return Err(StompError::DuplicateSubscription(id));
                    }
                    id
                }
                None => loop {
                    state.next_id += 1;
                    let candidate = format!("sub-{}", state.next_id);
                    if !state.subs.contains_key(&candidate) {
                        break candidate;
                    }
                },
            };
            state.next_seq += 1;
            let seq = state.next_seq;
            let info = SubscriptionInfo {
                id: id.clone(),
                destination: destination.to_string(),
                ack,
                headers: options.headers,
            };
            state.subs.insert(
                id,
                SubscriptionEntry {
                    info: info.clone(),
                    seq,
                    deliveries: tx,
                    stop: stop.clone(),
                },
            );
            // read under the lock so a session starting concurrently either
            // sees this entry in its snapshot or hands us its new epoch
            (info, self.writer.session_epoch())
        };

        tokio::spawn(run_worker(
            info.id.clone(),
            ack,
            Arc::new(handler),
            rx,
            stop,
            self.tracker.clone(),
        ));
        debug!(id = %info.id, destination, ack = %ack, "subscription registered");

        if let Some(epoch) = epoch {
            self.writer
                .send_session_frame(subscribe_frame(&info), epoch)
                .await?;
        }
        Ok(info.id)
    }

    /// Remove a subscription, stop its handler and drop its pending
    /// acknowledgements without sending ACK or NACK for them.
    pub async fn unsubscribe(&self, id: &str, headers: Vec<(String, String)>) -> Result<()> {
        let (dropped, epoch) = {
            let mut state = self.lock();
            let entry = state
                .subs
                .remove(id)
                .ok_or_else(|| StompError::UnknownSubscription(id.to_string()))?;
            entry.stop.cancel();
            (
                self.tracker.drop_subscription(id),
                self.writer.session_epoch(),
            )
        };
        debug!(id, dropped, "subscription removed");

        if let Some(epoch) = epoch {
            let frame = Frame::new(Command::Unsubscribe)
                .header("id", id)
                .headers(headers);
            self.writer.send_session_frame(frame, epoch).await?;
        }
        Ok(())
    }

    /// Hand a MESSAGE frame to the subscription named in its `subscription`
    /// header. Fails with `OrphanMessage` when no such subscription exists;
    /// the frame is dropped in that case.
    pub(crate) fn route(&self, frame: Frame) -> Result<()> {
        let sub_id = match frame.get_header("subscription") {
            Some(s) => s.to_string(),
            None => {
                return Err(StompError::OrphanMessage {
                    subscription: String::new(),
                });
            }
        };

        let state = self.lock();
        let entry = state
            .subs
            .get(&sub_id)
            .ok_or_else(|| StompError::OrphanMessage {
                subscription: sub_id.clone(),
            })?;
        let mode = entry.info.ack;

        let mut ack_key = None;
        if mode.requires_ack() {
            let key = frame
                .get_header("message-id")
                .or_else(|| frame.get_header("ack"))
                .map(str::to_string);
            match key {
                Some(key) => {
                    let token = frame.get_header("ack").unwrap_or(&key).to_string();
                    let epoch = self.writer.session_epoch().unwrap_or(0);
                    let Some(seq) = self.tracker.track(&key, &sub_id, &token, mode, epoch) else {
                        warn!(message_id = %key, subscription = %sub_id, "duplicate delivery of a pending message dropped");
                        return Ok(());
                    };
                    ack_key = Some((key, seq));
                }
                None => {
                    warn!(subscription = %sub_id, "MESSAGE without message-id cannot be acknowledged");
                }
            }
        }

        let delivery = Delivery {
            message: Message::new(frame, sub_id, mode),
            ack_key,
        };
        if let Err(mpsc::error::SendError(lost)) = entry.deliveries.send(delivery) {
            if let Some((key, seq)) = lost.ack_key {
                // worker already gone; nothing will settle this entry
                self.tracker.forget(&key, seq);
            }
        }
        Ok(())
    }

    /// Mark a new session live and return the SUBSCRIBE frames for every
    /// registered subscription, oldest first, with their original ids.
    pub(crate) fn begin_session(&self, epoch: u64) -> Vec<Frame> {
        let state = self.lock();
        self.writer.set_epoch(Some(epoch));
        let mut entries: Vec<&SubscriptionEntry> = state.subs.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.subscribe_frame()).collect()
    }

    /// Mark the session gone and discard its pending acknowledgements; the
    /// broker redelivers those under its own policy. Returns how many were
    /// discarded.
    pub(crate) fn end_session(&self) -> usize {
        let _state = self.lock();
        self.writer.set_epoch(None);
        self.tracker.clear()
    }

    /// Drop every subscription and stop all workers.
    pub(crate) fn clear(&self) {
        let mut state = self.lock();
        for (_, entry) in state.subs.drain() {
            entry.stop.cancel();
        }
        self.tracker.clear();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().subs.contains_key(id)
    }

    /// Registered subscriptions, oldest first.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let state = self.lock();
        let mut entries: Vec<&SubscriptionEntry> = state.subs.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.info.clone()).collect()
    }
}

async fn run_worker(
    subscription_id: String,
    mode: AckMode,
    handler: Arc<dyn MessageHandler>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    stop: CancellationToken,
    tracker: AckTracker,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            d = deliveries.recv() => match d {
                Some(d) => d,
                None => break,
            },
        };

        let outcome = AssertUnwindSafe(handler.handle(delivery.message))
            .catch_unwind()
            .await;
        let settlement = match outcome {
            Ok(Ok(())) => Settlement::Ack,
            Ok(Err(e)) => {
                warn!(subscription = %subscription_id, error = %e, "handler failed");
                Settlement::Nack
            }
            Err(_) => {
                warn!(subscription = %subscription_id, "handler panicked");
                Settlement::Nack
            }
        };

        if !mode.requires_ack() || stop.is_cancelled() {
            continue;
        }
        let Some((key, seq)) = delivery.ack_key else {
            continue;
        };
        match tracker.settle_tracked(&key, seq, settlement).await {
            Ok(()) => {}
            Err(StompError::UnknownAck(_)) => {
                // settled by the application, or discarded with its session;
                // a redelivered copy is settled by its own run
                debug!(message_id = %key, "delivery already settled");
            }
            Err(e) => {
                warn!(subscription = %subscription_id, error = %e, "could not queue acknowledgement");
                break;
            }
        }
    }
    debug!(subscription = %subscription_id, "subscription worker stopped");
}
