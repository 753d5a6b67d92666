//! Engine configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Priority of directly reachable candidates
pub const DIRECT_PRIORITY: u32 = 100;

/// Priority of relay candidates
pub const RELAY_PRIORITY: u32 = 0;

/// Configuration for the session engine
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Bound on awaiting a response to any outbound request
    pub response_timeout: Duration,
    /// Total budget for connecting to the peer's candidates
    pub connect_budget: Duration,
    /// Bound on relay activation (ours or the peer's)
    pub activation_timeout: Duration,
    /// Bound on waiting for the peer's candidate announcement
    pub announcement_timeout: Duration,
    /// Bound on unwrapping the security overlay key
    pub key_exchange_timeout: Duration,
    /// Bind address of the local stream-host server
    pub stream_host_bind: SocketAddr,
    /// Addresses announced as direct candidates
    pub local_addresses: Vec<IpAddr>,
    /// Whether relay candidates are gathered
    pub use_relays: bool,
    /// Priority of direct candidates
    pub direct_priority: u32,
    /// Priority of relay candidates
    pub relay_priority: u32,
    /// Interval between session-info pings on active sessions
    pub ping_interval: Option<Duration>,
    /// Consecutive failed pings before the session is terminated
    pub max_missed_pings: u32,
    /// Transport namespace to fall back to when a transport fails
    pub fallback_transport: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            connect_budget: Duration::from_secs(10),
            activation_timeout: Duration::from_secs(10),
            announcement_timeout: Duration::from_secs(30),
            key_exchange_timeout: Duration::from_secs(10),
            stream_host_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            local_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            use_relays: true,
            direct_priority: DIRECT_PRIORITY,
            relay_priority: RELAY_PRIORITY,
            ping_interval: None,
            max_missed_pings: 3,
            fallback_transport: None,
        }
    }
}
