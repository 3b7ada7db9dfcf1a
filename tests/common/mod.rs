//! In-memory broker harness shared by the integration tests.
//!
//! `MockTransport` hands out one side of a `tokio::io::duplex` pipe per
//! `open` call; the test drives the other side through `MockBroker`.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use osmium_stomp::codec::{StompCodec, StompItem};
use osmium_stomp::{
    BoxedStream, BrokerAddress, Client, ClientConfig, Command, Frame, Transport,
};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;

const PIPE_SIZE: usize = 64 * 1024;
const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct MockTransport {
    pending: Mutex<VecDeque<DuplexStream>>,
    opens: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a broker for the next `open`. Opens with nothing queued fail
    /// with `ConnectionRefused`.
    pub fn broker(&self) -> MockBroker {
        let (client_side, broker_side) = tokio::io::duplex(PIPE_SIZE);
        self.pending
            .lock()
            .expect("pending lock")
            .push_back(client_side);
        MockBroker {
            framed: Framed::new(broker_side, StompCodec::new()),
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, _address: &BrokerAddress) -> io::Result<BoxedStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self.pending.lock().expect("pending lock").pop_front();
        match next {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no broker listening",
            )),
        }
    }
}

pub struct MockBroker {
    framed: Framed<DuplexStream, StompCodec>,
}

impl MockBroker {
    /// Read CONNECT and answer CONNECTED with the given `heart-beat` value.
    pub async fn accept(&mut self, heart_beat: &str) -> Frame {
        let connect = self.next_frame().await;
        assert_eq!(connect.command(), Command::Connect);
        self.send(
            Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("session", "session-1")
                .header("server", "mock/1.0")
                .header("heart-beat", heart_beat),
        )
        .await;
        connect
    }

    /// Read CONNECT and answer ERROR.
    pub async fn reject(&mut self, message: &str, body: &str) {
        let connect = self.next_frame().await;
        assert_eq!(connect.command(), Command::Connect);
        self.send(
            Frame::new(Command::Error)
                .header("message", message)
                .set_body(body.as_bytes().to_vec()),
        )
        .await;
    }

    /// Next frame from the client, skipping heartbeats.
    pub async fn next_frame(&mut self) -> Frame {
        self.try_next_frame(WAIT)
            .await
            .expect("timed out waiting for a frame from the client")
    }

    /// Next frame within `wait`, or `None` if the client sent nothing.
    pub async fn try_next_frame(&mut self, wait: Duration) -> Option<Frame> {
        let read = async {
            loop {
                match self.framed.next().await {
                    Some(Ok(StompItem::Frame(f))) => return Some(f),
                    Some(Ok(StompItem::Heartbeat)) => continue,
                    Some(Err(e)) => panic!("client sent undecodable bytes: {}", e),
                    None => return None,
                }
            }
        };
        tokio::time::timeout(wait, read).await.ok().flatten()
    }

    /// Next raw item (heartbeats included), or `None` on EOF or timeout.
    pub async fn next_item(&mut self, wait: Duration) -> Option<StompItem> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(item))) => Some(item),
            _ => None,
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed
            .send(StompItem::Frame(frame))
            .await
            .expect("broker send");
    }

    pub async fn send_heartbeat(&mut self) {
        self.framed
            .send(StompItem::Heartbeat)
            .await
            .expect("broker heartbeat");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.framed
            .get_mut()
            .write_all(bytes)
            .await
            .expect("broker raw write");
    }

    /// Deliver a MESSAGE for `subscription`.
    pub async fn deliver(&mut self, subscription: &str, message_id: &str, body: &str) {
        self.send(message(subscription, message_id, body)).await;
    }

    /// Answer a frame's `receipt` header.
    pub async fn send_receipt(&mut self, receipt_id: &str) {
        self.send(Frame::new(Command::Receipt).header("receipt-id", receipt_id))
            .await;
    }

    /// Drop the connection from the broker side.
    pub fn close(self) {
        drop(self);
    }
}

pub fn message(subscription: &str, message_id: &str, body: &str) -> Frame {
    Frame::new(Command::Message)
        .header("destination", "/queue/test")
        .header("message-id", message_id)
        .header("subscription", subscription)
        .header("ack", format!("ack-{}", message_id))
        .set_body(body.as_bytes().to_vec())
}

/// Config with heartbeats and reconnects off, so tests only see the
/// frames they provoke.
pub fn quiet_config() -> ClientConfig {
    ClientConfig::new("tcp://broker.test:61613")
        .with_heartbeat(0, 0)
        .with_connect_timeout(5_000)
        .with_disconnect_timeout(1_000)
        .without_reconnect()
}

/// Build a client on a mock transport and complete the handshake.
pub async fn connected_client(config: ClientConfig) -> (Client, Arc<MockTransport>, MockBroker) {
    let transport = MockTransport::new();
    let mut broker = transport.broker();
    let client = Client::with_transport(config, transport.clone());
    let (res, _) = tokio::join!(client.connect(), broker.accept("0,0"));
    res.expect("connect");
    (client, transport, broker)
}
