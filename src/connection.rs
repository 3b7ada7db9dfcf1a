use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures::{SinkExt, StreamExt};
use tokio::sync::{OwnedMutexGuard, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{CodecError, StompCodec, StompItem};
use crate::config::{BrokerAddress, ClientConfig};
use crate::error::{Result, StompError};
use crate::frame::{Command, Frame};
use crate::heartbeat::{
    format_heartbeat_header, inbound_deadline, negotiate_heartbeats, parse_heartbeat_header,
};
use crate::registry::SubscriptionRegistry;
use crate::transport::{BoxedStream, Transport};
use crate::writer::{FrameWriter, Outbound};

type Session = Framed<BoxedStream, StompCodec>;

/// Timer horizon used when a heartbeat direction is disabled.
const IDLE_TIMER: Duration = Duration::from_secs(86400);

/// `now + d`, saturating to the idle timer for intervals too large to add.
fn due_after(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d).unwrap_or(now + IDLE_TIMER)
}

const EVENT_CAPACITY: usize = 64;

/// Lifecycle of the connection as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Attempt 0 is the initial connect; reconnect attempts count from 1.
    Connecting { attempt: u32 },
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// What the broker told us in CONNECTED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Option<String>,
    pub server: Option<String>,
    pub version: Option<String>,
    /// Negotiated interval at which we send heartbeats.
    pub heartbeat_outgoing: Option<Duration>,
    /// Negotiated interval at which the broker sends heartbeats.
    pub heartbeat_incoming: Option<Duration>,
}

/// Notifications about the connection, delivered on a broadcast channel.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected(SessionInfo),
    Reconnecting { attempt: u32, delay: Duration },
    /// A failure that did not come back as the result of a call: a broker
    /// ERROR frame, a malformed inbound frame, a link lost for good, or a
    /// DISCONNECT the broker never confirmed.
    Error(Arc<StompError>),
    Disconnected,
}

/// Why a session ended.
enum SessionEnd {
    Shutdown,
    LinkLost(String),
    Fatal(StompError),
}

struct SessionTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    writer: FrameWriter,
    registry: SubscriptionRegistry,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    session: Mutex<Option<SessionInfo>>,
    /// receipt-id -> waiter, for frames sent with a `receipt` header
    receipts: Mutex<HashMap<String, oneshot::Sender<()>>>,
    task: tokio::sync::Mutex<Option<SessionTask>>,
    /// Set while `disconnect` runs so a broker closing the socket after
    /// its RECEIPT is not mistaken for a lost link.
    closing: AtomicBool,
    next_epoch: AtomicU64,
    next_receipt: AtomicU64,
}

/// Owns the broker connection: handshake, heartbeats, the session task
/// that reads and writes the transport, and reconnection after a lost link.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        writer: FrameWriter,
        registry: SubscriptionRegistry,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                writer,
                registry,
                state_tx,
                events,
                session: Mutex::new(None),
                receipts: Mutex::new(HashMap::new()),
                task: tokio::sync::Mutex::new(None),
                closing: AtomicBool::new(false),
                next_epoch: AtomicU64::new(1),
                next_receipt: AtomicU64::new(1),
            }),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.connect_with_cancel(None).await
    }

    /// Open the transport, perform the CONNECT handshake and start the
    /// session task. Returns once CONNECTED was received.
    ///
    /// Calling this while a session (or its reconnect loop) is running is a
    /// no-op. Cancelling through `cancel` aborts the attempt and leaves the
    /// manager `Disconnected`.
    pub async fn connect_with_cancel(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        let mut task = self.inner.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Ok(());
        }
        *task = None;
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Connecting { attempt: 0 });

        let attempt = self.inner.handshake();
        let result = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(StompError::Cancelled),
                r = attempt => r,
            },
            None => attempt.await,
        };
        let (mut framed, info) = match result {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "connect failed");
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let epoch = match self.inner.activate(&mut framed, info).await {
            Ok(epoch) => epoch,
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let queue = self.inner.writer.lock_queue().await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Inner::run(
            self.inner.clone(),
            framed,
            epoch,
            queue,
            shutdown.clone(),
        ));
        *task = Some(SessionTask { shutdown, handle });
        Ok(())
    }

    /// Close the session gracefully.
    ///
    /// Sends DISCONNECT with a receipt request and waits up to the
    /// configured disconnect timeout for the RECEIPT before closing the
    /// transport. Subscriptions and pending acknowledgements are dropped.
    pub async fn disconnect(&self) -> Result<()> {
        let mut task = self.inner.task.lock().await;
        let Some(session) = task.take() else {
            return Ok(());
        };
        if session.handle.is_finished() {
            // the session task already tore everything down
            return Ok(());
        }
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Disconnecting);

        if let Some(epoch) = self.inner.writer.session_epoch() {
            let receipt = format!(
                "disconnect-{}",
                self.inner.next_receipt.fetch_add(1, Ordering::SeqCst)
            );
            let (tx, rx) = oneshot::channel();
            self.inner.lock_receipts().insert(receipt.clone(), tx);
            let frame = Frame::new(Command::Disconnect).header("receipt", &receipt);

            match self.inner.writer.send_session_frame(frame, epoch).await {
                Ok(()) => {
                    match tokio::time::timeout(self.inner.config.disconnect_timeout(), rx).await {
                        Ok(Ok(())) => debug!(receipt = %receipt, "DISCONNECT acknowledged"),
                        Ok(Err(_)) => debug!("session ended before the DISCONNECT receipt"),
                        Err(_) => {
                            self.inner.lock_receipts().remove(&receipt);
                            let err = StompError::ReceiptTimeout(receipt);
                            warn!(error = %err, "closing without DISCONNECT receipt");
                            self.inner.emit(ConnectionEvent::Error(Arc::new(err)));
                        }
                    }
                }
                Err(e) => warn!(error = %e, "could not queue DISCONNECT"),
            }
        }

        session.shutdown.cancel();
        if let Err(e) = session.handle.await {
            warn!(error = %e, "session task ended abnormally");
        }
        self.inner.teardown();
        info!("disconnected");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch the connection state; the receiver always holds the latest value.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.inner.lock_session().clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn writer(&self) -> &FrameWriter {
        &self.inner.writer
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            trace!(?previous, ?state, "connection state changed");
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<SessionInfo>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_receipts(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        self.receipts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build CONNECT. Its headers go out unescaped, so a name or value that
    /// would break the header block is rejected.
    fn connect_frame(&self, address: &BrokerAddress) -> Result<Frame> {
        let config = &self.config;
        let host = config.virtual_host.as_deref().unwrap_or(&address.host);
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host);
        if let Some(login) = &config.login {
            frame = frame.header("login", login);
        }
        if let Some(passcode) = &config.passcode {
            frame = frame.header("passcode", passcode);
        }
        let frame = frame
            .header(
                "heart-beat",
                format_heartbeat_header(config.heartbeat_outgoing_ms, config.heartbeat_incoming_ms),
            )
            .headers(config.connect_headers.iter().cloned());

        let line_break = |c: char| matches!(c, '\r' | '\n' | '\0');
        for (name, value) in frame.header_pairs() {
            if name.is_empty() || name.contains(|c: char| line_break(c) || c == ':') {
                return Err(StompError::InvalidHeader(format!("CONNECT header name {:?}", name)));
            }
            if value.contains(line_break) {
                return Err(StompError::InvalidHeader(format!("CONNECT header '{}'", name)));
            }
        }
        Ok(frame)
    }

    /// Open the transport and run CONNECT/CONNECTED, bounded by the
    /// connect timeout.
    async fn handshake(&self) -> Result<(Session, SessionInfo)> {
        let address = self.config.broker_address()?;
        let connect = self.connect_frame(&address)?;
        match tokio::time::timeout(
            self.config.connect_timeout(),
            self.open_session(&address, connect),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StompError::TransportUnavailable(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no CONNECTED from {} within timeout", address),
            ))),
        }
    }

    async fn open_session(
        &self,
        address: &BrokerAddress,
        connect: Frame,
    ) -> Result<(Session, SessionInfo)> {
        debug!(%address, "opening transport");
        let stream = self
            .transport
            .open(address)
            .await
            .map_err(StompError::TransportUnavailable)?;
        let mut framed = Framed::new(
            stream,
            StompCodec::with_max_frame_size(self.config.max_frame_size),
        );
        framed.send(StompItem::Frame(connect)).await?;

        loop {
            match framed.next().await {
                Some(Ok(StompItem::Heartbeat)) => continue,
                Some(Ok(StompItem::Frame(frame))) => {
                    return match frame.command() {
                        Command::Connected => {
                            let info = self.session_info(&frame);
                            Ok((framed, info))
                        }
                        Command::Error => Err(StompError::HandshakeRejected {
                            message: frame.get_header("message").unwrap_or_default().to_string(),
                            body: frame
                                .body_str()
                                .filter(|b| !b.is_empty())
                                .map(str::to_string),
                        }),
                        other => Err(StompError::MalformedFrame(format!(
                            "expected CONNECTED, got {}",
                            other
                        ))),
                    };
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(StompError::TransportUnavailable(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before CONNECTED",
                    )));
                }
            }
        }
    }

    fn session_info(&self, connected: &Frame) -> SessionInfo {
        let (sx, sy) = connected
            .get_header("heart-beat")
            .map(parse_heartbeat_header)
            .unwrap_or((0, 0));
        let (outgoing, incoming) = negotiate_heartbeats(
            self.config.heartbeat_outgoing_ms,
            self.config.heartbeat_incoming_ms,
            sx,
            sy,
        );
        debug!(?outgoing, ?incoming, "heartbeats negotiated");
        SessionInfo {
            session_id: connected.get_header("session").map(str::to_string),
            server: connected.get_header("server").map(str::to_string),
            version: connected.get_header("version").map(str::to_string),
            heartbeat_outgoing: outgoing,
            heartbeat_incoming: incoming,
        }
    }

    /// Start a new session epoch, mark it `Connected` and replay the
    /// registry's subscriptions straight onto the transport, ahead of
    /// anything queued. A failed replay restores the previous state.
    async fn activate(&self, framed: &mut Session, info: SessionInfo) -> Result<u64> {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let subscribes = self.registry.begin_session(epoch);
        let resubscribed = subscribes.len();

        *self.lock_session() = Some(info.clone());
        let previous = *self.state_tx.borrow();
        self.set_state(ConnectionState::Connected);
        for frame in subscribes {
            if let Err(e) = framed.send(StompItem::Frame(frame)).await {
                self.registry.end_session();
                *self.lock_session() = None;
                self.set_state(previous);
                return Err(e.into());
            }
        }

        info!(
            session = info.session_id.as_deref().unwrap_or("-"),
            resubscribed, "connected"
        );
        self.emit(ConnectionEvent::Connected(info));
        Ok(epoch)
    }

    fn end_session(&self) {
        let dropped = self.registry.end_session();
        if dropped > 0 {
            debug!(dropped, "pending acknowledgements discarded with the session");
        }
        *self.lock_session() = None;
        // dropping the senders wakes anyone waiting for a receipt
        self.lock_receipts().clear();
    }

    /// Final cleanup once no session will follow.
    fn teardown(&self) {
        self.registry.clear();
        *self.lock_session() = None;
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected);
    }

    async fn run(
        self: Arc<Self>,
        framed: Session,
        epoch: u64,
        mut queue: OwnedMutexGuard<mpsc::Receiver<Outbound>>,
        shutdown: CancellationToken,
    ) {
        let mut current = Some((framed, epoch));
        while let Some((framed, epoch)) = current.take() {
            let end = self.drive(framed, epoch, &mut queue, &shutdown).await;
            self.end_session();

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Fatal(err) => {
                    warn!(error = %err, "closing connection");
                    self.emit(ConnectionEvent::Error(Arc::new(err)));
                    self.teardown();
                    break;
                }
                SessionEnd::LinkLost(reason) => {
                    if self.closing.load(Ordering::SeqCst) {
                        debug!(reason = %reason, "transport closed during disconnect");
                        break;
                    }
                    warn!(reason = %reason, "link lost");
                    if !self.config.reconnect.enabled {
                        self.emit(ConnectionEvent::Error(Arc::new(StompError::LinkLost)));
                        self.teardown();
                        break;
                    }
                    current = self.reconnect(&shutdown).await;
                }
            }
        }
        debug!("session task finished");
    }

    async fn reconnect(&self, shutdown: &CancellationToken) -> Option<(Session, u64)> {
        let policy = &self.config.reconnect;
        let mut backoff: ExponentialBackoff = policy.into();
        let max_delay = Duration::from_millis(policy.max_delay_ms);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if policy.max_attempts.is_some_and(|max| attempt > max) {
                warn!(attempts = attempt - 1, "giving up reconnecting");
                self.emit(ConnectionEvent::Error(Arc::new(StompError::LinkLost)));
                self.teardown();
                return None;
            }

            let delay = backoff.next_backoff().unwrap_or(max_delay);
            self.set_state(ConnectionState::Connecting { attempt });
            self.emit(ConnectionEvent::Reconnecting { attempt, delay });
            info!(attempt, ?delay, "reconnecting");

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = sleep(delay) => {}
            }
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                r = self.handshake() => r,
            };

            match result {
                Ok((mut framed, info)) => match self.activate(&mut framed, info).await {
                    Ok(epoch) => return Some((framed, epoch)),
                    Err(e) => warn!(attempt, error = %e, "resubscribe failed"),
                },
                Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
            }
        }
    }

    /// Run one live session until shutdown, link loss or a fatal error.
    ///
    /// This is the only place that writes to the transport after the
    /// handshake: queued frames, heartbeats and the final close.
    async fn drive(
        &self,
        framed: Session,
        epoch: u64,
        queue: &mut mpsc::Receiver<Outbound>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let (outgoing, incoming) = {
            let session = self.lock_session();
            let info = session.as_ref();
            (
                info.and_then(|s| s.heartbeat_outgoing),
                info.and_then(|s| s.heartbeat_incoming),
            )
        };
        let deadline = incoming.map(|d| inbound_deadline(d, self.config.heartbeat_grace));

        let (mut sink, mut stream) = framed.split();
        let heartbeat_due = sleep_until(due_after(outgoing.unwrap_or(IDLE_TIMER)));
        let watchdog = sleep_until(due_after(deadline.unwrap_or(IDLE_TIMER)));
        tokio::pin!(heartbeat_due, watchdog);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                item = stream.next() => {
                    if let Some(d) = deadline {
                        watchdog.as_mut().reset(due_after(d));
                    }
                    match item {
                        Some(Ok(StompItem::Heartbeat)) => trace!("heartbeat received"),
                        Some(Ok(StompItem::Frame(frame))) => self.handle_inbound(frame),
                        Some(Err(CodecError::Malformed(msg))) => {
                            let _ = sink.close().await;
                            return SessionEnd::Fatal(StompError::MalformedFrame(msg));
                        }
                        Some(Err(CodecError::Io(e))) => {
                            return SessionEnd::LinkLost(format!("read failed: {}", e));
                        }
                        None => return SessionEnd::LinkLost("transport closed".to_string()),
                    }
                }
                _ = &mut watchdog, if deadline.is_some() => {
                    let _ = sink.close().await;
                    return SessionEnd::LinkLost("heartbeat deadline missed".to_string());
                }
                next = queue.recv() => {
                    let Some(out) = next else {
                        return SessionEnd::Shutdown;
                    };
                    if out.epoch.is_some_and(|e| e != epoch) {
                        debug!(command = %out.frame.command(), "dropping frame queued for a previous session");
                        continue;
                    }
                    trace!(command = %out.frame.command(), "writing frame");
                    if let Err(e) = sink.send(StompItem::Frame(out.frame)).await {
                        return SessionEnd::LinkLost(format!("write failed: {}", e));
                    }
                    if let Some(d) = outgoing {
                        heartbeat_due.as_mut().reset(due_after(d));
                    }
                }
                _ = &mut heartbeat_due, if outgoing.is_some() => {
                    trace!("sending heartbeat");
                    if let Err(e) = sink.send(StompItem::Heartbeat).await {
                        return SessionEnd::LinkLost(format!("write failed: {}", e));
                    }
                    if let Some(d) = outgoing {
                        heartbeat_due.as_mut().reset(due_after(d));
                    }
                }
            }
        }
    }

    fn handle_inbound(&self, frame: Frame) {
        match frame.command() {
            Command::Message => {
                if let Err(e) = self.registry.route(frame) {
                    warn!(error = %e, "dropping MESSAGE");
                }
            }
            Command::Receipt => {
                let Some(id) = frame.get_header("receipt-id") else {
                    debug!("RECEIPT without receipt-id");
                    return;
                };
                match self.lock_receipts().remove(id) {
                    Some(waiter) => {
                        let _ = waiter.send(());
                    }
                    None => debug!(receipt = id, "unsolicited RECEIPT"),
                }
            }
            Command::Error => {
                let err = StompError::BrokerError {
                    message: frame.get_header("message").unwrap_or_default().to_string(),
                    body: frame
                        .body_str()
                        .filter(|b| !b.is_empty())
                        .map(str::to_string),
                };
                warn!(error = %err, "broker sent ERROR");
                self.emit(ConnectionEvent::Error(Arc::new(err)));
            }
            other => debug!(command = %other, "ignoring unexpected frame"),
        }
    }
}
