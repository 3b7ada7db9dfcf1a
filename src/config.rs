use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use url::Url;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{Result, StompError};

const DEFAULT_PORT: u16 = 61613;
const DEFAULT_HEARTBEAT_MS: u64 = 10_000;
const DEFAULT_HEARTBEAT_GRACE: f64 = 2.0;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_PUBLISH_QUEUE_CAPACITY: usize = 256;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_RECONNECT_DELAY_MS: u64 = 30_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.2;

/// What `publish` does when the message cannot be handed to a live session
/// right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Queue into the bounded outbound queue, waiting while it is full.
    /// Queued frames are written once the connection is (re)established.
    #[default]
    Block,
    /// Fail with `NotConnected` when no session is live and with
    /// `QueueFull` when the queue has no room.
    Fail,
}

/// Host and port of the broker, resolved from `broker_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parse `tcp://host:port`, `stomp://host:port` or a bare `host:port`.
    /// A missing port defaults to 61613.
    pub fn parse(broker_url: &str) -> Result<Self> {
        if broker_url.contains("://") {
            let url = Url::parse(broker_url)
                .map_err(|e| StompError::InvalidUrl(format!("{}: {}", broker_url, e)))?;
            let host = url
                .host_str()
                .ok_or_else(|| StompError::InvalidUrl(format!("{}: missing host", broker_url)))?;
            return Ok(Self {
                host: host.to_string(),
                port: url.port().unwrap_or(DEFAULT_PORT),
            });
        }

        match broker_url.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| StompError::InvalidUrl(format!("{}: {}", broker_url, e)))?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            Some(_) => Err(StompError::InvalidUrl(format!("{}: missing host", broker_url))),
            None if broker_url.is_empty() => {
                Err(StompError::InvalidUrl("empty broker url".to_string()))
            }
            None => Ok(Self {
                host: broker_url.to_string(),
                port: DEFAULT_PORT,
            }),
        }
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Automatic reconnection behaviour after a lost link.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Reconnect at all after a lost link.
    pub enabled: bool,
    /// Delay before the first reconnect attempt.
    pub delay_ms: u64,
    /// Upper bound for the backoff delay.
    pub max_delay_ms: u64,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Jitter applied to every delay (0.2 → ±20%).
    pub randomization_factor: f64,
    /// Maximum number of attempts before giving up.
    /// `None` means retry forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_RECONNECT_DELAY_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            max_attempts: None,
        }
    }
}

impl From<&ReconnectConfig> for ExponentialBackoff {
    fn from(config: &ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(Duration::from_millis(config.delay_ms))
            .with_max_interval(Duration::from_millis(config.max_delay_ms))
            .with_multiplier(config.multiplier)
            .with_randomization_factor(config.randomization_factor)
            .with_max_elapsed_time(None) // attempts are bounded separately
            .build()
    }
}

/// Configuration for a client connection.
///
/// Construct with `ClientConfig::new(url)` and adjust with the `with_*`
/// builder methods; every option has a default.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub broker_url: String,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Value of the CONNECT `host` header; defaults to the broker host.
    pub virtual_host: Option<String>,
    /// How often we promise to send heartbeats (0 disables).
    pub heartbeat_outgoing_ms: u64,
    /// How often we want the broker to send heartbeats (0 disables).
    pub heartbeat_incoming_ms: u64,
    /// Multiplier on the negotiated incoming interval before the link is
    /// considered lost. Clamped to `1.0..=100.0` when the deadline is
    /// computed.
    pub heartbeat_grace: f64,
    pub reconnect: ReconnectConfig,
    pub connect_timeout_ms: u64,
    /// How long `disconnect` waits for the broker's RECEIPT.
    pub disconnect_timeout_ms: u64,
    pub publish_queue_policy: QueuePolicy,
    pub publish_queue_capacity: usize,
    pub max_frame_size: usize,
    /// Extra headers added to the CONNECT frame.
    pub connect_headers: Vec<(String, String)>,
}

impl ClientConfig {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.passcode = Some(passcode.into());
        self
    }

    pub fn with_virtual_host(mut self, host: impl Into<String>) -> Self {
        self.virtual_host = Some(host.into());
        self
    }

    pub fn with_heartbeat(mut self, outgoing_ms: u64, incoming_ms: u64) -> Self {
        self.heartbeat_outgoing_ms = outgoing_ms;
        self.heartbeat_incoming_ms = incoming_ms;
        self
    }

    pub fn with_heartbeat_grace(mut self, grace: f64) -> Self {
        self.heartbeat_grace = grace;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Shorthand for the two most common reconnect knobs.
    pub fn with_reconnect_delay(mut self, delay_ms: u64, max_attempts: Option<u32>) -> Self {
        self.reconnect.delay_ms = delay_ms;
        self.reconnect.max_attempts = max_attempts;
        self
    }

    pub fn without_reconnect(mut self) -> Self {
        self.reconnect.enabled = false;
        self
    }

    pub fn with_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout_ms: u64) -> Self {
        self.disconnect_timeout_ms = timeout_ms;
        self
    }

    pub fn with_publish_queue(mut self, policy: QueuePolicy, capacity: usize) -> Self {
        self.publish_queue_policy = policy;
        self.publish_queue_capacity = capacity;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_connect_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connect_headers.push((key.into(), value.into()));
        self
    }

    pub fn broker_address(&self) -> Result<BrokerAddress> {
        BrokerAddress::parse(&self.broker_url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_url: format!("tcp://127.0.0.1:{}", DEFAULT_PORT),
            login: None,
            passcode: None,
            virtual_host: None,
            heartbeat_outgoing_ms: DEFAULT_HEARTBEAT_MS,
            heartbeat_incoming_ms: DEFAULT_HEARTBEAT_MS,
            heartbeat_grace: DEFAULT_HEARTBEAT_GRACE,
            reconnect: ReconnectConfig::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            publish_queue_policy: QueuePolicy::default(),
            publish_queue_capacity: DEFAULT_PUBLISH_QUEUE_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_headers: Vec::new(),
        }
    }
}
