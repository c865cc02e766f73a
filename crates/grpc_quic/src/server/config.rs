use crate::config::TransportConfig;

/// Configuration for a [`Listener`](super::Listener).
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// QUIC transport and session idle settings.
    pub transport: TransportConfig,

    /// Accepted connections buffered before the per-session accept loops
    /// wait for `accept()` callers to catch up.
    pub accept_backlog: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            accept_backlog: 128,
        }
    }
}

impl ListenerConfig {
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog;
        self
    }
}
