//! Client, server and pool options.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;
use zeroize::Zeroizing;

use super::constants::*;
use super::error::{RelayError, Result};

/// How UDP packets travel over the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RelayMode {
    /// One unreliable QUIC datagram per packet fragment.
    #[default]
    Native,
    /// One one-shot unidirectional stream per packet.
    Quic,
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayMode::Native => f.write_str("native"),
            RelayMode::Quic => f.write_str("quic"),
        }
    }
}

impl FromStr for RelayMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(RelayMode::Native),
            "quic" => Ok(RelayMode::Quic),
            other => Err(RelayError::Config(format!("unknown udp relay mode: {other}"))),
        }
    }
}

/// Congestion controller requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CongestionControl {
    /// CUBIC.
    #[default]
    Cubic,
    /// NewReno.
    NewReno,
    /// BBR.
    Bbr,
}

impl fmt::Display for CongestionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CongestionControl::Cubic => f.write_str("cubic"),
            CongestionControl::NewReno => f.write_str("new_reno"),
            CongestionControl::Bbr => f.write_str("bbr"),
        }
    }
}

impl FromStr for CongestionControl {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cubic" => Ok(CongestionControl::Cubic),
            "new_reno" | "newreno" | "reno" => Ok(CongestionControl::NewReno),
            "bbr" => Ok(CongestionControl::Bbr),
            other => Err(RelayError::Config(format!(
                "unknown congestion controller: {other}"
            ))),
        }
    }
}

/// Client configuration.
#[derive(Clone)]
pub struct ClientOptions {
    /// Identity presented to the server.
    pub client_id: Uuid,

    /// Shared secret for `client_id`.
    pub password: Zeroizing<String>,

    /// TLS server name used when connecting.
    pub server_name: String,

    /// UDP relay mode, fixed for each connection.
    pub relay_mode: RelayMode,

    /// Congestion controller.
    pub congestion_control: CongestionControl,

    /// Attempt 0-RTT resumption.
    pub reduce_rtt: bool,

    /// Payloads above this size are fragmented.
    pub max_udp_relay_packet_size: usize,

    /// Logical streams allowed per connection.
    pub max_open_streams: usize,

    /// Heartbeat interval while streams are open. Zero disables heartbeats.
    pub heartbeat_interval: Duration,

    /// Bound on dialing and authenticating.
    pub request_timeout: Duration,

    /// Delay before a closed stream releases its slot.
    pub stream_linger: Duration,

    /// Bound on concurrently running receive tasks.
    pub max_concurrent_tasks: usize,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("client_id", &self.client_id)
            .field("password", &"<redacted>")
            .field("server_name", &self.server_name)
            .field("relay_mode", &self.relay_mode)
            .field("congestion_control", &self.congestion_control)
            .field("reduce_rtt", &self.reduce_rtt)
            .field("max_udp_relay_packet_size", &self.max_udp_relay_packet_size)
            .field("max_open_streams", &self.max_open_streams)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("request_timeout", &self.request_timeout)
            .field("stream_linger", &self.stream_linger)
            .finish_non_exhaustive()
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: Uuid::nil(),
            password: Zeroizing::new(String::new()),
            server_name: String::new(),
            relay_mode: RelayMode::default(),
            congestion_control: CongestionControl::default(),
            reduce_rtt: false,
            max_udp_relay_packet_size: DEFAULT_MAX_UDP_RELAY_PACKET_SIZE,
            max_open_streams: DEFAULT_MAX_OPEN_STREAMS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_linger: DEFAULT_STREAM_LINGER,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }
}

impl ClientOptions {
    /// Start building client options.
    pub fn builder(client_id: Uuid, password: impl Into<String>) -> ClientOptionsBuilder {
        ClientOptionsBuilder::new(client_id, password)
    }

    /// Check the options for values the relay cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_open_streams == 0 {
            return Err(RelayError::Config("max_open_streams must be positive".into()));
        }
        if self.max_udp_relay_packet_size == 0 {
            return Err(RelayError::Config(
                "max_udp_relay_packet_size must be positive".into(),
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(RelayError::Config(
                "max_concurrent_tasks must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`ClientOptions`].
#[derive(Debug)]
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    /// Create a builder for the given identity.
    pub fn new(client_id: Uuid, password: impl Into<String>) -> Self {
        Self {
            options: ClientOptions {
                client_id,
                password: Zeroizing::new(password.into()),
                ..ClientOptions::default()
            },
        }
    }

    /// Set the TLS server name.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.options.server_name = name.into();
        self
    }

    /// Set the UDP relay mode.
    pub fn relay_mode(mut self, mode: RelayMode) -> Self {
        self.options.relay_mode = mode;
        self
    }

    /// Set the congestion controller.
    pub fn congestion_control(mut self, cc: CongestionControl) -> Self {
        self.options.congestion_control = cc;
        self
    }

    /// Enable or disable 0-RTT.
    pub fn reduce_rtt(mut self, enabled: bool) -> Self {
        self.options.reduce_rtt = enabled;
        self
    }

    /// Set the fragmentation threshold.
    pub fn max_udp_relay_packet_size(mut self, size: usize) -> Self {
        self.options.max_udp_relay_packet_size = size;
        self
    }

    /// Set the per-connection stream limit.
    pub fn max_open_streams(mut self, max: usize) -> Self {
        self.options.max_open_streams = max;
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.options.heartbeat_interval = interval;
        self
    }

    /// Set the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    /// Set the stream linger delay.
    pub fn stream_linger(mut self, linger: Duration) -> Self {
        self.options.stream_linger = linger;
        self
    }

    /// Set the receive task bound.
    pub fn max_concurrent_tasks(mut self, max: usize) -> Self {
        self.options.max_concurrent_tasks = max;
        self
    }

    /// Build the options.
    pub fn build(self) -> ClientOptions {
        self.options
    }
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerOptions {
    /// Accepted identities and their passwords.
    pub users: HashMap<Uuid, Zeroizing<String>>,

    /// Time a connection may stay unauthenticated.
    pub authentication_timeout: Duration,

    /// Requested UDP relay packet size, clamped by
    /// [`effective_max_udp_relay_packet_size`](Self::effective_max_udp_relay_packet_size).
    pub max_udp_relay_packet_size: usize,

    /// Congestion controller.
    pub congestion_control: CongestionControl,

    /// Bound on concurrently running stream and datagram tasks.
    pub max_concurrent_tasks: usize,
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("users", &self.users.keys().collect::<Vec<_>>())
            .field("authentication_timeout", &self.authentication_timeout)
            .field("max_udp_relay_packet_size", &self.max_udp_relay_packet_size)
            .field("congestion_control", &self.congestion_control)
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .finish()
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            users: HashMap::new(),
            authentication_timeout: DEFAULT_AUTHENTICATION_TIMEOUT,
            max_udp_relay_packet_size: DEFAULT_MAX_UDP_RELAY_PACKET_SIZE,
            congestion_control: CongestionControl::default(),
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }
}

impl ServerOptions {
    /// Start building server options.
    pub fn builder() -> ServerOptionsBuilder {
        ServerOptionsBuilder::new()
    }

    /// Largest datagram frame the server advertises.
    pub fn max_datagram_frame_size(&self) -> usize {
        self.max_udp_relay_packet_size
            .saturating_add(PACKET_OVERHEAD)
            .min(SERVER_MAX_DATAGRAM_FRAME_SIZE)
    }

    /// Payload size above which the server fragments.
    pub fn effective_max_udp_relay_packet_size(&self) -> usize {
        self.max_datagram_frame_size().saturating_sub(PACKET_OVERHEAD)
    }

    /// Password for a client id, if known.
    pub fn password_for(&self, client_id: &Uuid) -> Option<&str> {
        self.users.get(client_id).map(|p| p.as_str())
    }

    /// Check the options for values the relay cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.users.is_empty() {
            return Err(RelayError::Config("no users configured".into()));
        }
        if self.authentication_timeout.is_zero() {
            return Err(RelayError::Config(
                "authentication_timeout must be positive".into(),
            ));
        }
        if self.max_udp_relay_packet_size == 0 {
            return Err(RelayError::Config(
                "max_udp_relay_packet_size must be positive".into(),
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(RelayError::Config(
                "max_concurrent_tasks must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`ServerOptions`].
#[derive(Debug, Default)]
pub struct ServerOptionsBuilder {
    options: ServerOptions,
}

impl ServerOptionsBuilder {
    /// Create a builder with default options and no users.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `client_id` with `password`.
    pub fn user(mut self, client_id: Uuid, password: impl Into<String>) -> Self {
        self.options
            .users
            .insert(client_id, Zeroizing::new(password.into()));
        self
    }

    /// Set the authentication timeout.
    pub fn authentication_timeout(mut self, timeout: Duration) -> Self {
        self.options.authentication_timeout = timeout;
        self
    }

    /// Set the requested UDP relay packet size.
    pub fn max_udp_relay_packet_size(mut self, size: usize) -> Self {
        self.options.max_udp_relay_packet_size = size;
        self
    }

    /// Set the congestion controller.
    pub fn congestion_control(mut self, cc: CongestionControl) -> Self {
        self.options.congestion_control = cc;
        self
    }

    /// Set the task bound.
    pub fn max_concurrent_tasks(mut self, max: usize) -> Self {
        self.options.max_concurrent_tasks = max;
        self
    }

    /// Build the options.
    pub fn build(self) -> ServerOptions {
        self.options
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Clients idle longer than this with no open streams are evicted.
    pub idle_ttl: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            idle_ttl: DEFAULT_POOL_IDLE_TTL,
        }
    }
}
