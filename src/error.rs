use std::io;
use thiserror::Error;

use crate::codec::CodecError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StompError>;

/// Errors returned by client operations and reported on the connection
/// event channel.
#[derive(Error, Debug)]
pub enum StompError {
    /// The transport could not be opened, or failed before the broker
    /// answered CONNECT (includes the connect timeout).
    #[error("transport unavailable: {0}")]
    TransportUnavailable(#[source] io::Error),

    /// The broker answered CONNECT with an ERROR frame.
    #[error("handshake rejected: {message}")]
    HandshakeRejected {
        /// Value of the ERROR frame's `message` header
        message: String,
        /// ERROR frame body, if any
        body: Option<String>,
    },

    /// Heartbeat deadline missed or transport closed, and no reconnect
    /// policy (left) to recover it.
    #[error("link lost")]
    LinkLost,

    /// Inbound bytes could not be decoded. Fatal to the connection.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A MESSAGE arrived for a subscription that is no longer registered.
    #[error("message for unknown subscription '{subscription}'")]
    OrphanMessage { subscription: String },

    /// ack()/nack() on a message id with no pending acknowledgement.
    #[error("no pending acknowledgement for message '{0}'")]
    UnknownAck(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("outbound queue full")]
    QueueFull,

    #[error("operation cancelled")]
    Cancelled,

    #[error("subscription id '{0}' already registered")]
    DuplicateSubscription(String),

    #[error("subscription id '{0}' not found")]
    UnknownSubscription(String),

    /// ERROR frame received on an established connection.
    #[error("broker error: {message}")]
    BrokerError {
        message: String,
        body: Option<String>,
    },

    /// Receipt timeout error
    #[error("receipt timeout: no RECEIPT received for '{0}' within timeout")]
    ReceiptTimeout(String),

    /// The client's background machinery has shut down.
    #[error("client closed")]
    Closed,

    #[error("invalid broker url: {0}")]
    InvalidUrl(String),

    /// A configured header cannot be written without breaking the frame.
    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

impl From<CodecError> for StompError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => StompError::TransportUnavailable(e),
            CodecError::Malformed(msg) => StompError::MalformedFrame(msg),
        }
    }
}

impl StompError {
    /// Caller-input errors never touch connection state.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            StompError::UnknownAck(_)
                | StompError::Serialization(_)
                | StompError::DuplicateSubscription(_)
                | StompError::UnknownSubscription(_)
                | StompError::InvalidHeader(_)
        )
    }
}
