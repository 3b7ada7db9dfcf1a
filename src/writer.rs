use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::QueuePolicy;
use crate::error::{Result, StompError};
use crate::frame::Frame;

/// A frame waiting for the session writer.
///
/// Frames bound to a session (`epoch: Some`) are only meaningful to the
/// broker session that produced them: SUBSCRIBE/UNSUBSCRIBE for the live
/// registry state, ACK/NACK for tokens handed out by that session. The
/// session task drops them if the session changed before they were written.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) frame: Frame,
    pub(crate) epoch: Option<u64>,
}

/// Handle to the single outbound path of a connection.
///
/// Every frame other than CONNECT and heartbeats goes through this bounded
/// queue; only the session task drains it, and only while a session is
/// live, so the transport never sees concurrent writes.
#[derive(Clone)]
pub struct FrameWriter {
    tx: mpsc::Sender<Outbound>,
    rx: Arc<Mutex<mpsc::Receiver<Outbound>>>,
    /// Current session epoch; 0 while no session is live.
    epoch: Arc<AtomicU64>,
}

impl FrameWriter {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Epoch of the live session, or `None` when disconnected.
    pub fn session_epoch(&self) -> Option<u64> {
        match self.epoch.load(Ordering::SeqCst) {
            0 => None,
            e => Some(e),
        }
    }

    /// Frames currently queued and not yet written.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub(crate) fn set_epoch(&self, epoch: Option<u64>) {
        self.epoch.store(epoch.unwrap_or(0), Ordering::SeqCst);
    }

    /// Exclusive access to the queue for the session task.
    pub(crate) async fn lock_queue(&self) -> OwnedMutexGuard<mpsc::Receiver<Outbound>> {
        self.rx.clone().lock_owned().await
    }

    /// Queue a frame tied to session `epoch`, waiting for room if needed.
    pub(crate) async fn send_session_frame(&self, frame: Frame, epoch: u64) -> Result<()> {
        self.tx
            .send(Outbound {
                frame,
                epoch: Some(epoch),
            })
            .await
            .map_err(|_| StompError::Closed)
    }

    /// Queue a SEND frame according to `policy`.
    ///
    /// With [`QueuePolicy::Block`] this waits for queue space and may be
    /// abandoned through `cancel`, in which case nothing is queued.
    pub(crate) async fn enqueue(
        &self,
        frame: Frame,
        policy: QueuePolicy,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let item = Outbound { frame, epoch: None };
        match policy {
            QueuePolicy::Fail => {
                if self.session_epoch().is_none() {
                    return Err(StompError::NotConnected);
                }
                self.tx.try_send(item).map_err(|e| match e {
                    TrySendError::Full(_) => StompError::QueueFull,
                    TrySendError::Closed(_) => StompError::Closed,
                })
            }
            QueuePolicy::Block => {
                let permit = match cancel {
                    Some(token) => tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(StompError::Cancelled),
                        permit = self.tx.reserve() => permit,
                    },
                    None => self.tx.reserve().await,
                }
                .map_err(|_| StompError::Closed)?;
                permit.send(item);
                Ok(())
            }
        }
    }
}
