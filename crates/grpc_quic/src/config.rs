use std::sync::Arc;
use std::time::Duration;

use quinn::{IdleTimeout, VarInt};

use crate::error::Error;

/// QUIC transport and session-lifetime settings shared by listeners and dialers.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long a session with zero open streams is kept before it is closed.
    pub session_idle_timeout: Duration,

    /// Transport-level idle timeout negotiated with the peer.
    pub max_idle_timeout: Duration,

    /// Keep-alive interval; `None` disables keep-alives.
    pub keep_alive_interval: Option<Duration>,

    /// Maximum number of concurrent bidirectional streams the peer may open.
    pub max_concurrent_bidi_streams: u32,

    /// Upper bound on a single QUIC handshake.
    pub handshake_timeout: Duration,

    /// Bytes a peer may send on one stream before this side reads them.
    pub stream_receive_window: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout: Duration::from_secs(30),
            max_idle_timeout: Duration::from_secs(60),
            keep_alive_interval: Some(Duration::from_secs(5)),
            max_concurrent_bidi_streams: 100,
            handshake_timeout: Duration::from_secs(10),
            stream_receive_window: 1_250_000,
        }
    }
}

impl TransportConfig {
    /// Set the idle grace period for sessions without open streams.
    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    /// Set the transport idle timeout.
    pub fn with_max_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Set the keep-alive interval.
    pub fn with_keep_alive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set the per-session stream concurrency limit.
    pub fn with_max_concurrent_bidi_streams(mut self, streams: u32) -> Self {
        self.max_concurrent_bidi_streams = streams;
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the per-stream flow-control window.
    pub fn with_stream_receive_window(mut self, bytes: u32) -> Self {
        self.stream_receive_window = bytes;
        self
    }

    pub(crate) fn build(&self) -> Result<Arc<quinn::TransportConfig>, Error> {
        let idle = IdleTimeout::try_from(self.max_idle_timeout)
            .map_err(|e| Error::Config(format!("max_idle_timeout out of range: {e}")))?;

        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(idle));
        transport.keep_alive_interval(self.keep_alive_interval);
        transport.max_concurrent_bidi_streams(VarInt::from_u32(self.max_concurrent_bidi_streams));
        // RPC traffic only ever uses bidirectional streams
        transport.max_concurrent_uni_streams(VarInt::from_u32(0));
        transport.stream_receive_window(VarInt::from_u32(self.stream_receive_window));

        Ok(Arc::new(transport))
    }
}
