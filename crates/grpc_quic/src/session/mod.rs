//! QUIC sessions and the registry that owns them.
//!
//! A [`Session`] is one established QUIC connection. It owns its streams; a
//! `StreamConn` is only a view over one stream plus a [`StreamLease`] that
//! keeps the session's open-stream count honest.

mod registry;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::conn::StreamConn;
use crate::credentials::AuthInfo;
use crate::error::Error;

pub use registry::{RegistryStats, SessionRegistry};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the listener or dialer that created a session.
pub(crate) fn next_owner_id() -> u64 {
    NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)
}

/// The local address a connection actually uses.
///
/// Endpoints are often bound to a wildcard address; the connection knows
/// which interface it was received on or sent from.
pub(crate) fn connection_local_addr(connection: &quinn::Connection, bound: SocketAddr) -> SocketAddr {
    SocketAddr::new(connection.local_ip().unwrap_or(bound.ip()), bound.port())
}

/// Which side of the handshake created the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Identifies a reusable client session.
///
/// Two dials share a session only when they target the same address with the
/// same security configuration from the same dialer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub target: String,
    pub fingerprint: u64,
}

impl SessionKey {
    pub fn new(target: impl Into<String>, fingerprint: u64) -> Self {
        Self {
            target: target.into(),
            fingerprint,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:016x}", self.target, self.fingerprint)
    }
}

/// One established QUIC connection.
pub struct Session {
    id: u64,
    role: Role,
    owner: u64,
    key: Option<SessionKey>,
    connection: quinn::Connection,
    local_addr: SocketAddr,
    auth_info: Arc<AuthInfo>,
    created_at: Instant,
    state: Mutex<SessionState>,
}

/// Mutable lifecycle state, always updated under the session lock so that
/// acquiring a stream and closing the session cannot interleave.
#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) open_streams: usize,
    pub(crate) draining: bool,
    pub(crate) closed: Option<String>,
    pub(crate) idle_timer: Option<JoinHandle<()>>,
    pub(crate) idle_deadline: Option<Instant>,
    /// Bumped whenever a pending idle timer is cancelled, so a timer that
    /// already woke up cannot close a session that was used in the meantime.
    pub(crate) idle_generation: u64,
}

impl Session {
    pub(crate) fn new(
        role: Role,
        key: Option<SessionKey>,
        owner: u64,
        connection: quinn::Connection,
        local_addr: SocketAddr,
        auth_info: AuthInfo,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            owner,
            key,
            connection,
            local_addr,
            auth_info: Arc::new(auth_info),
            created_at: Instant::now(),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The registry key for client sessions; server sessions are unkeyed.
    pub fn key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn auth_info(&self) -> Arc<AuthInfo> {
        Arc::clone(&self.auth_info)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn open_streams(&self) -> usize {
        self.lock_state().open_streams
    }

    /// When the pending idle-close fires, if one is armed.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.lock_state().idle_deadline
    }

    /// Whether new streams may still be acquired on this session.
    pub fn is_live(&self) -> bool {
        self.lock_state().closed.is_none() && self.connection.close_reason().is_none()
    }

    /// Why the session was closed, if it was.
    pub fn close_reason(&self) -> Option<String> {
        if let Some(reason) = self.lock_state().closed.clone() {
            return Some(reason);
        }
        self.connection.close_reason().map(|e| e.to_string())
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    pub(crate) fn connection(&self) -> &quinn::Connection {
        &self.connection
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        // The state holds plain counters; a panic elsewhere cannot leave it torn.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for the peer to open a stream and wrap it as a connection.
    pub(crate) async fn accept_conn(
        self: &Arc<Self>,
        registry: &SessionRegistry,
    ) -> Result<StreamConn, Error> {
        let (send, recv) = self
            .connection
            .accept_bi()
            .await
            .map_err(Error::from_connection)?;
        let lease = registry.acquire_stream(self)?;

        Ok(StreamConn::new(send, recv, lease))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("key", &self.key)
            .field("remote_addr", &self.remote_addr())
            .finish_non_exhaustive()
    }
}

/// One counted reference from an open stream to its session.
///
/// Releasing is idempotent: the count is decremented exactly once, either by
/// [`StreamLease::release`] or when the lease is dropped.
pub struct StreamLease {
    session: Arc<Session>,
    registry: SessionRegistry,
    released: bool,
}

impl StreamLease {
    pub(crate) fn new(session: Arc<Session>, registry: SessionRegistry) -> Self {
        Self {
            session,
            registry,
            released: false,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.registry.release(&self.session);
    }

    /// Move the reference into a new lease, leaving this one released.
    pub(crate) fn take(&mut self) -> StreamLease {
        let taken = StreamLease {
            session: Arc::clone(&self.session),
            registry: self.registry.clone(),
            released: self.released,
        };
        self.released = true;
        taken
    }

    /// Open a new outbound stream under this lease.
    ///
    /// The lease is taken before the stream is opened so the session cannot be
    /// considered idle while the open is in flight.
    pub(crate) async fn open_conn(self) -> Result<StreamConn, Error> {
        let (send, recv) = self
            .session
            .connection
            .open_bi()
            .await
            .map_err(Error::from_connection)?;

        Ok(StreamConn::new(send, recv, self))
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLease")
            .field("session", &self.session.id)
            .field("released", &self.released)
            .finish()
    }
}
