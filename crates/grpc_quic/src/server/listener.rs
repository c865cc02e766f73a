use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::conn::StreamConn;
use crate::credentials::ServerCredentials;
use crate::error::Error;
use crate::server::config::ListenerConfig;
use crate::session::{Role, Session, SessionRegistry, connection_local_addr, next_owner_id};

/// Presents every inbound QUIC stream, from any session, as an accepted connection.
///
/// A background task accepts sessions and one task per session accepts its
/// streams, so slow consumers of [`Listener::accept`] never hold up new
/// handshakes. Clones share the same listener.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

struct Inner {
    owner: u64,
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
    registry: SessionRegistry,
    accepted: tokio::sync::Mutex<mpsc::Receiver<StreamConn>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

/// State shared by the accept loop and the per-session tasks.
struct AcceptContext {
    owner: u64,
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
    credentials: ServerCredentials,
    handshake_timeout: Duration,
    registry: SessionRegistry,
    accepted: mpsc::Sender<StreamConn>,
}

impl Listener {
    /// Bind a new QUIC endpoint on `addr` with its own session registry.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        credentials: ServerCredentials,
        config: ListenerConfig,
    ) -> Result<Self, Error> {
        let registry = SessionRegistry::new(config.transport.session_idle_timeout);
        Self::bind_with_registry(addr, credentials, config, registry)
    }

    /// Bind a new QUIC endpoint on `addr`, tracking sessions in `registry`.
    pub fn bind_with_registry(
        addr: SocketAddr,
        credentials: ServerCredentials,
        config: ListenerConfig,
        registry: SessionRegistry,
    ) -> Result<Self, Error> {
        let server_config = credentials.server_config(&config.transport)?;
        let endpoint = quinn::Endpoint::server(server_config, addr)
            .map_err(|e| Error::Io(format!("failed to bind {addr}: {e}")))?;

        Self::start(endpoint, credentials, config, registry)
    }

    /// Serve on an endpoint the caller already bound.
    ///
    /// The endpoint's server configuration is replaced with one built from
    /// `credentials`.
    pub fn from_endpoint(
        endpoint: quinn::Endpoint,
        credentials: ServerCredentials,
        config: ListenerConfig,
        registry: SessionRegistry,
    ) -> Result<Self, Error> {
        endpoint.set_server_config(Some(credentials.server_config(&config.transport)?));
        Self::start(endpoint, credentials, config, registry)
    }

    fn start(
        endpoint: quinn::Endpoint,
        credentials: ServerCredentials,
        config: ListenerConfig,
        registry: SessionRegistry,
    ) -> Result<Self, Error> {
        let local_addr = endpoint
            .local_addr()
            .map_err(|e| Error::Io(format!("failed to read local address: {e}")))?;

        let owner = next_owner_id();
        let (accepted_tx, accepted_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let context = Arc::new(AcceptContext {
            owner,
            endpoint: endpoint.clone(),
            local_addr,
            credentials,
            handshake_timeout: config.transport.handshake_timeout,
            registry: registry.clone(),
            accepted: accepted_tx,
        });
        let accept_loop = tokio::spawn(accept_sessions(context, shutdown_rx));

        info!(local_addr = %local_addr, "Listener started");

        Ok(Self {
            inner: Arc::new(Inner {
                owner,
                endpoint,
                local_addr,
                registry,
                accepted: tokio::sync::Mutex::new(accepted_rx),
                shutdown,
                closed: AtomicBool::new(false),
                accept_loop: Mutex::new(Some(accept_loop)),
            }),
        })
    }

    /// Wait for the next inbound stream.
    ///
    /// Fails with [`Error::Closed`] once the listener is closed; callers
    /// blocked here at that moment are woken with the same error.
    pub async fn accept(&self) -> Result<StreamConn, Error> {
        let mut shutdown = self.inner.shutdown.subscribe();
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut accepted = tokio::select! {
            biased;
            _ = shutdown.changed() => return Err(Error::Closed),
            accepted = self.inner.accepted.lock() => accepted,
        };

        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                drain_queue(&mut accepted);
                Err(Error::Closed)
            }
            conn = accepted.recv() => conn.ok_or(Error::Closed),
        }
    }

    /// The accepted connections as a stream, for `Server::serve_with_incoming`.
    ///
    /// The stream ends when the listener is closed.
    pub fn into_incoming(self) -> impl Stream<Item = Result<StreamConn, Error>> + Send + 'static {
        async_stream::stream! {
            loop {
                match self.accept().await {
                    Ok(conn) => yield Ok(conn),
                    Err(Error::Closed) => break,
                    Err(e) => yield Err(e),
                }
            }
        }
    }

    /// Stop accepting and close every session without open connections.
    ///
    /// Sessions that still back a connection handed out by `accept` are
    /// closed once their last connection is closed.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.inner.endpoint
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.inner.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);

        if let Some(task) = self
            .accept_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
        // Refuse new handshakes instead of leaving them to time out.
        self.endpoint.set_server_config(None);

        // Queued connections hold leases; a concurrent `accept` drains them
        // itself if it holds the queue right now.
        if let Ok(mut accepted) = self.accepted.try_lock() {
            drain_queue(&mut accepted);
        }

        for session in self.registry.sessions_owned_by(self.owner) {
            self.registry.drain_session(&session);
        }

        info!(local_addr = %self.local_addr, "Listener closed");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

fn drain_queue(accepted: &mut mpsc::Receiver<StreamConn>) {
    accepted.close();
    // Nobody ever saw these; there is nothing to deliver gracefully.
    while let Ok(mut conn) = accepted.try_recv() {
        conn.reset(Error::CODE_STREAM_CANCELED);
    }
}

async fn accept_sessions(context: Arc<AcceptContext>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.changed() => break,
            incoming = context.endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };

        tokio::spawn(serve_session(
            Arc::clone(&context),
            incoming,
            shutdown.clone(),
        ));
    }

    debug!(local_addr = %context.local_addr, "Accept loop stopped");
}

async fn serve_session(
    context: Arc<AcceptContext>,
    incoming: quinn::Incoming,
    mut shutdown: watch::Receiver<bool>,
) {
    let remote = incoming.remote_address();
    let (connection, auth_info) = match context
        .credentials
        .accept(incoming, context.handshake_timeout)
        .await
    {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(remote = %remote, error = %e, "Rejected inbound session");
            return;
        }
    };

    let local_addr = connection_local_addr(&connection, context.local_addr);
    let session = Arc::new(Session::new(
        Role::Server,
        None,
        context.owner,
        connection,
        local_addr,
        auth_info,
    ));
    context.registry.register(&session);

    let closing = *shutdown.borrow();
    if closing {
        context.registry.drain_session(&session);
        return;
    }

    loop {
        let conn = tokio::select! {
            _ = shutdown.changed() => break,
            conn = session.accept_conn(&context.registry) => conn,
        };

        match conn {
            Ok(conn) => {
                debug!(
                    session_id = session.id(),
                    stream_id = %conn.stream_id(),
                    "Accepted stream"
                );
                let sent = tokio::select! {
                    _ = shutdown.changed() => break,
                    sent = context.accepted.send(conn) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(session_id = session.id(), error = %e, "Session stopped accepting streams");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::config::TransportConfig;
    use crate::credentials::{ClientCredentials, Identity};
    use crate::test_util::eventually;

    fn listener(identity: &Identity) -> Listener {
        Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            ServerCredentials::new(identity.clone()),
            ListenerConfig::default(),
        )
        .unwrap()
    }

    async fn connect(listener: &Listener, credentials: ClientCredentials) -> Result<quinn::Connection, quinn::ConnectionError> {
        let endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
        let config = credentials.client_config(&TransportConfig::default()).unwrap();
        endpoint
            .connect_with(config, listener.local_addr(), "localhost")
            .unwrap()
            .await
    }

    #[tokio::test]
    async fn test_accepts_streams_from_one_session() {
        let identity = Identity::self_signed(["localhost"]).unwrap();
        let listener = listener(&identity);
        let connection = connect(&listener, ClientCredentials::with_roots(identity.cert_chain.clone()))
            .await
            .unwrap();

        for payload in [b"first", b"other"] {
            let (mut send, _recv) = connection.open_bi().await.unwrap();
            send.write_all(payload).await.unwrap();

            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, payload);
            assert_eq!(conn.auth_info().protocol_str(), Some("grpc-quic"));
        }

        assert_eq!(listener.registry().session_count(), 1);
    }

    #[tokio::test]
    async fn test_accept_after_close_fails() {
        let identity = Identity::self_signed(["localhost"]).unwrap();
        let listener = listener(&identity);

        listener.close();
        listener.close();

        assert_eq!(listener.accept().await.unwrap_err(), Error::Closed);
        assert_eq!(listener.accept().await.unwrap_err(), Error::Closed);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_accepts() {
        let identity = Identity::self_signed(["localhost"]).unwrap();
        let listener = listener(&identity);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let listener = listener.clone();
                tokio::spawn(async move { listener.accept().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.close();

        for waiter in waiters {
            let result = tokio::time::timeout(Duration::from_secs(2), waiter)
                .await
                .expect("accept did not return after close")
                .unwrap();
            assert_eq!(result.unwrap_err(), Error::Closed);
        }
    }

    #[tokio::test]
    async fn test_close_keeps_sessions_with_open_streams() {
        let identity = Identity::self_signed(["localhost"]).unwrap();
        let listener = listener(&identity);
        let connection = connect(&listener, ClientCredentials::with_roots(identity.cert_chain.clone()))
            .await
            .unwrap();

        let (mut send, mut recv) = connection.open_bi().await.unwrap();
        send.write_all(b"ping").await.unwrap();
        let mut conn = listener.accept().await.unwrap();
        let session = Arc::clone(conn.session());

        listener.close();
        assert!(session.is_live());

        conn.write_all(b"pong").await.unwrap();
        conn.close_write().unwrap();
        let reply = recv.read_to_end(64).await.unwrap();
        assert_eq!(reply, b"pong");

        drop(conn);
        assert!(eventually(|| !session.is_live()).await);
    }

    #[tokio::test]
    async fn test_alpn_mismatch_is_not_surfaced_to_accept() {
        let identity = Identity::self_signed(["localhost"]).unwrap();
        let listener = listener(&identity);

        let credentials = ClientCredentials::with_roots(identity.cert_chain.clone())
            .with_alpn_protocols(["h3"]);
        assert!(connect(&listener, credentials).await.is_err());

        let pending = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(pending.is_err());
        assert!(listener.registry().is_empty());
    }

    #[tokio::test]
    async fn test_incoming_stream_ends_on_close() {
        use futures::StreamExt;

        let identity = Identity::self_signed(["localhost"]).unwrap();
        let listener = listener(&identity);
        let incoming = listener.clone().into_incoming();
        futures::pin_mut!(incoming);

        listener.close();
        assert!(incoming.next().await.is_none());
    }
}
