use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::config::TransportConfig;

/// Configuration for a [`Dialer`](super::Dialer).
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// QUIC transport and session idle settings.
    pub transport: TransportConfig,

    /// Local address the dialer's endpoint binds to.
    pub bind_addr: SocketAddr,

    /// Deadline applied by [`Dialer::dial`](super::Dialer::dial), covering both
    /// session establishment and opening the stream.
    pub dial_timeout: Duration,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            dial_timeout: Duration::from_secs(20),
        }
    }
}

impl DialerConfig {
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}
