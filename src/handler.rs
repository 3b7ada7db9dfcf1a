use std::future::Future;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::ack::AckMode;
use crate::frame::Frame;

/// Error type handlers report failures with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A MESSAGE frame as seen by a subscription handler.
#[derive(Debug, Clone)]
pub struct Message {
    frame: Frame,
    subscription_id: String,
    ack_mode: AckMode,
}

impl Message {
    pub(crate) fn new(frame: Frame, subscription_id: String, ack_mode: AckMode) -> Self {
        Self {
            frame,
            subscription_id,
            ack_mode,
        }
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn destination(&self) -> Option<&str> {
        self.frame.get_header("destination")
    }

    pub fn message_id(&self) -> Option<&str> {
        self.frame.get_header("message-id")
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.frame.get_header(key)
    }

    pub fn body(&self) -> &[u8] {
        self.frame.body()
    }

    pub fn body_str(&self) -> Option<&str> {
        self.frame.body_str()
    }

    /// Deserialize a JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(self.frame.body())
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }
}

/// Unit of work run for every message delivered to a subscription.
///
/// The returned `Result` decides the acknowledgement for `client` and
/// `client-individual` subscriptions: `Ok` sends ACK, `Err` sends NACK. A
/// panicking handler counts as `Err`.
///
/// Closures of the form `|msg| async move { ... Ok(()) }` implement this
/// trait directly.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        (self)(message).await
    }
}
