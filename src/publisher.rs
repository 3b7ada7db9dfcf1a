use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::QueuePolicy;
use crate::error::Result;
use crate::frame::{Command, Frame};
use crate::writer::FrameWriter;

/// Whether `publish` adds a `content-length` header.
///
/// With `Omit` the header is still added by the codec when the body
/// contains a NUL byte, since such a body cannot be framed without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentLengthPolicy {
    Attach,
    #[default]
    Omit,
}

/// Body of a SEND frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    /// Serialize `value` as a JSON payload.
    ///
    /// The value goes through [`serde_json::Value`], so object keys come
    /// out sorted and the same value always yields the same body.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    fn into_bytes(self) -> Result<Vec<u8>> {
        Ok(match self {
            Payload::Bytes(b) => b,
            Payload::Text(s) => s.into_bytes(),
            Payload::Json(v) => serde_json::to_vec(&v)?,
        })
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(b)
    }
}

impl From<&[u8]> for Payload {
    fn from(b: &[u8]) -> Self {
        Payload::Bytes(b.to_vec())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Payload::Json(v)
    }
}

/// Builds SEND frames and hands them to the outbound queue.
#[derive(Clone)]
pub struct Publisher {
    writer: FrameWriter,
    policy: QueuePolicy,
}

impl Publisher {
    pub fn new(writer: FrameWriter, policy: QueuePolicy) -> Self {
        Self { writer, policy }
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Build the SEND frame for a publish.
    ///
    /// `destination` comes first, then the caller's headers in order. No
    /// `content-type` is added; callers that want one pass it in `headers`.
    pub fn build_frame(
        destination: &str,
        payload: Payload,
        headers: Vec<(String, String)>,
        content_length: ContentLengthPolicy,
    ) -> Result<Frame> {
        let body = payload.into_bytes()?;
        let has_length = headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-length"));

        let mut frame = Frame::new(Command::Send)
            .header("destination", destination)
            .headers(headers);
        if content_length == ContentLengthPolicy::Attach && !has_length {
            frame = frame.header("content-length", body.len().to_string());
        }
        Ok(frame.set_body(body))
    }

    pub async fn publish(
        &self,
        destination: &str,
        payload: Payload,
        headers: Vec<(String, String)>,
        content_length: ContentLengthPolicy,
    ) -> Result<()> {
        self.publish_with_cancel(destination, payload, headers, content_length, None)
            .await
    }

    /// Publish, giving up if `cancel` fires while waiting for queue space.
    ///
    /// Serialization failures are reported before anything is queued.
    pub async fn publish_with_cancel(
        &self,
        destination: &str,
        payload: Payload,
        headers: Vec<(String, String)>,
        content_length: ContentLengthPolicy,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let frame = Self::build_frame(destination, payload, headers, content_length)?;
        debug!(destination, bytes = frame.body().len(), "publishing");
        self.writer.enqueue(frame, self.policy, cancel).await
    }
}
