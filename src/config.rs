//! Runtime settings shared by every tunnel of a gateway.

use std::time::Duration;

/// UDP port used for NAT-traversal encapsulated ESP and keep-alives.
pub const NAT_T_PORT: u16 = 4500;

/// Gateway-wide tunables.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Interval between keep-alive probes sent by the initiating side.
    pub keep_alive_interval: Duration,
    /// A TCP flow with no inbound traffic for this long is terminated.
    pub tcp_timeout: Duration,
    /// Port on which peers expect ESP-in-UDP traffic.
    pub nat_t_port: u16,
    /// Loopback port of the web application that emulated flows relay to.
    pub web_app_port: u16,
    /// Largest chunk read from a backing stream per reply segment.
    pub relay_buffer_size: usize,
    /// Period of the event pump ticker thread.
    pub event_pump_interval: Duration,
    /// Dump every plaintext IPv4 packet crossing a tunnel at trace level.
    pub capture_traffic: bool,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(10),
            tcp_timeout: Duration::from_secs(60),
            nat_t_port: NAT_T_PORT,
            web_app_port: 5223,
            // MTU 1500 - IPv4 20 - TCP 20 - ESP overhead, rounded down
            relay_buffer_size: 1360,
            event_pump_interval: Duration::from_millis(50),
            capture_traffic: false,
        }
    }
}
