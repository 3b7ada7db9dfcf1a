use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::ack::AckMode;
use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::error::Result;
use crate::handler::MessageHandler;
use crate::publisher::{ContentLengthPolicy, Payload, Publisher};
use crate::registry::{SubscriptionInfo, SubscriptionOptions, SubscriptionRegistry};
use crate::transport::{TcpTransport, Transport};
use crate::writer::FrameWriter;

/// Application-facing STOMP client.
///
/// A thin facade over the connection manager, the subscription registry
/// and the publisher. Cloning is cheap and every clone drives the same
/// connection.
///
/// # Example
/// ```ignore
/// let client = Client::new(ClientConfig::new("tcp://localhost:61613"));
/// client.connect().await?;
/// client
///     .subscribe("/queue/orders", AckMode::Client, |msg: Message| async move {
///         println!("{:?}", msg.body_str());
///         Ok::<(), HandlerError>(())
///     })
///     .await?;
/// client.publish_json("/queue/orders", &order).await?;
/// ```
#[derive(Clone)]
pub struct Client {
    manager: ConnectionManager,
    registry: SubscriptionRegistry,
    publisher: Publisher,
}

impl Client {
    /// Client over plain TCP.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(config, Arc::new(TcpTransport))
    }

    /// Client over a caller-supplied transport (TLS, in-memory, ...).
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let writer = FrameWriter::new(config.publish_queue_capacity);
        let registry = SubscriptionRegistry::new(writer.clone());
        let publisher = Publisher::new(writer.clone(), config.publish_queue_policy);
        let manager = ConnectionManager::new(config, transport, writer, registry.clone());
        Self::from_parts(manager, registry, publisher)
    }

    /// Assemble a client from already-wired parts. The parts must share
    /// one [`FrameWriter`].
    pub fn from_parts(
        manager: ConnectionManager,
        registry: SubscriptionRegistry,
        publisher: Publisher,
    ) -> Self {
        Self {
            manager,
            registry,
            publisher,
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    pub async fn connect_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        self.manager.connect_with_cancel(Some(cancel)).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.manager.disconnect().await
    }

    /// Subscribe `handler` to `destination` with a generated id.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        destination: &str,
        ack: AckMode,
        handler: H,
    ) -> Result<String> {
        self.registry
            .subscribe(destination, ack, SubscriptionOptions::default(), handler)
            .await
    }

    pub async fn subscribe_with_options<H: MessageHandler>(
        &self,
        destination: &str,
        ack: AckMode,
        options: SubscriptionOptions,
        handler: H,
    ) -> Result<String> {
        self.registry
            .subscribe(destination, ack, options, handler)
            .await
    }

    pub async fn unsubscribe(&self, id: &str, headers: Option<Vec<(String, String)>>) -> Result<()> {
        self.registry
            .unsubscribe(id, headers.unwrap_or_default())
            .await
    }

    pub async fn publish(
        &self,
        destination: &str,
        payload: impl Into<Payload>,
        headers: Option<Vec<(String, String)>>,
        content_length: ContentLengthPolicy,
    ) -> Result<()> {
        self.publisher
            .publish(
                destination,
                payload.into(),
                headers.unwrap_or_default(),
                content_length,
            )
            .await
    }

    pub async fn publish_with_cancel(
        &self,
        destination: &str,
        payload: impl Into<Payload>,
        headers: Option<Vec<(String, String)>>,
        content_length: ContentLengthPolicy,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.publisher
            .publish_with_cancel(
                destination,
                payload.into(),
                headers.unwrap_or_default(),
                content_length,
                Some(cancel),
            )
            .await
    }

    /// Serialize `value` to JSON and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(&self, destination: &str, value: &T) -> Result<()> {
        let payload = Payload::json(value)?;
        self.publish(destination, payload, None, ContentLengthPolicy::default())
            .await
    }

    pub async fn publish_text(&self, destination: &str, text: &str) -> Result<()> {
        self.publish(destination, text, None, ContentLengthPolicy::default())
            .await
    }

    /// Acknowledge a delivery by message id. Only needed when the
    /// application settles messages itself; handler results are
    /// acknowledged automatically.
    pub async fn ack(&self, message_id: &str) -> Result<()> {
        self.registry.tracker().ack(message_id).await
    }

    pub async fn nack(&self, message_id: &str) -> Result<()> {
        self.registry.tracker().nack(message_id).await
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state_changes()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.manager.events()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.subscriptions()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }
}
