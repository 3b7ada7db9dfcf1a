pub mod ack;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod heartbeat;
pub mod parser;
pub mod publisher;
pub mod registry;
pub mod transport;
pub mod writer;

pub use ack::{AckMode, AckTracker, PendingAck, Settlement};
pub use client::Client;
pub use codec::{CodecError, StompCodec, StompItem};
pub use config::{BrokerAddress, ClientConfig, QueuePolicy, ReconnectConfig};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, SessionInfo};
pub use error::{Result, StompError};
pub use frame::{Command, Frame};
pub use handler::{HandlerError, Message, MessageHandler};
pub use heartbeat::{negotiate_heartbeats, parse_heartbeat_header};
pub use publisher::{ContentLengthPolicy, Payload, Publisher};
pub use registry::{SubscriptionInfo, SubscriptionOptions, SubscriptionRegistry};
pub use transport::{AsyncStream, BoxedStream, TcpTransport, Transport};
pub use writer::FrameWriter;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke_frame_display() {
        let f = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .set_body(b"hello".to_vec());
        let s = format!("{}", f);
        assert!(s.contains("CONNECT"));
        assert!(s.contains("Body (5 bytes)"));
    }
}
