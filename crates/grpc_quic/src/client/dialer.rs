use std::future::Future;
use std::hash::{BuildHasher, Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use hyper_util::rt::TokioIo;
use quinn::VarInt;
use tokio::time::Instant;
use tonic::transport::Uri;
use tracing::{debug, info};

use crate::client::config::DialerConfig;
use crate::conn::StreamConn;
use crate::credentials::{AuthInfo, ClientCredentials};
use crate::error::Error;
use crate::session::{
    Role, Session, SessionKey, SessionRegistry, connection_local_addr, next_owner_id,
};

/// Produces one [`StreamConn`] per outbound connection, sharing a QUIC session
/// per target.
///
/// Each dialer owns a client endpoint. Sessions it establishes are keyed by
/// target and by the dialer's security configuration, and concurrent dials to
/// the same target wait on a single handshake. Clones share the same dialer.
///
/// Implements `tower::Service<Uri>` so it can be passed to
/// `tonic::transport::Endpoint::connect_with_connector`.
#[derive(Clone)]
pub struct Dialer {
    inner: Arc<Inner>,
}

struct Inner {
    owner: u64,
    endpoint: quinn::Endpoint,
    credentials: ClientCredentials,
    client_config: quinn::ClientConfig,
    registry: SessionRegistry,
    config: DialerConfig,
    fingerprint: u64,
    closed: AtomicBool,
}

impl Dialer {
    /// Create a dialer with its own endpoint and session registry.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(credentials: ClientCredentials, config: DialerConfig) -> Result<Self, Error> {
        let registry = SessionRegistry::new(config.transport.session_idle_timeout);
        Self::with_registry(credentials, config, registry)
    }

    /// Create a dialer that tracks its sessions in `registry`.
    pub fn with_registry(
        credentials: ClientCredentials,
        config: DialerConfig,
        registry: SessionRegistry,
    ) -> Result<Self, Error> {
        let client_config = credentials.client_config(&config.transport)?;
        let endpoint = quinn::Endpoint::client(config.bind_addr)
            .map_err(|e| Error::Io(format!("failed to bind {}: {e}", config.bind_addr)))?;

        let owner = next_owner_id();
        let fingerprint = session_fingerprint(credentials.fingerprint(), owner);

        Ok(Self {
            inner: Arc::new(Inner {
                owner,
                endpoint,
                credentials,
                client_config,
                registry,
                config,
                fingerprint,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Open a connection to `target` (`host:port`) within the configured dial timeout.
    pub async fn dial(&self, target: &str) -> Result<StreamConn, Error> {
        self.dial_timeout(target, self.inner.config.dial_timeout).await
    }

    /// Open a connection to `target`, failing with `Timeout` after `timeout`.
    pub async fn dial_timeout(&self, target: &str, timeout: Duration) -> Result<StreamConn, Error> {
        self.dial_with_cancel(target, timeout, futures::future::pending())
            .await
    }

    /// Open a connection to `target`, giving up when `cancel` completes.
    ///
    /// Giving up never cancels a session establishment other dials are
    /// waiting on.
    pub async fn dial_with_cancel<C>(
        &self,
        target: &str,
        timeout: Duration,
        cancel: C,
    ) -> Result<StreamConn, Error>
    where
        C: Future<Output = ()>,
    {
        let deadline = Instant::now() + timeout;

        tokio::select! {
            biased;
            _ = cancel => {
                debug!(target = %target, "Dial canceled");
                Err(Error::DialCanceled)
            }
            result = tokio::time::timeout_at(deadline, self.connect(target)) => {
                result.unwrap_or(Err(Error::Timeout))
            }
        }
    }

    /// Security state of the live session to `target`, if there is one.
    pub fn auth_info_for(&self, target: &str) -> Option<Arc<AuthInfo>> {
        self.inner
            .registry
            .lookup(&self.session_key(target))
            .map(|session| session.auth_info())
    }

    /// The live session to `target`, if there is one.
    pub fn session_for(&self, target: &str) -> Option<Arc<Session>> {
        self.inner.registry.lookup(&self.session_key(target))
    }

    /// Close every session this dialer established and its endpoint.
    ///
    /// Connections handed out earlier fail with `SessionClosed`; later dials
    /// fail with `Closed`.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.inner
            .endpoint
            .local_addr()
            .map_err(|e| Error::Io(e.to_string()))
    }

    fn session_key(&self, target: &str) -> SessionKey {
        SessionKey::new(target, self.inner.fingerprint)
    }

    async fn connect(&self, target: &str) -> Result<StreamConn, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let key = self.session_key(target);
        let lease = self
            .inner
            .registry
            .get_or_create_stream(key.clone(), || {
                let establish = Establish {
                    owner: self.inner.owner,
                    endpoint: self.inner.endpoint.clone(),
                    credentials: self.inner.credentials.clone(),
                    client_config: self.inner.client_config.clone(),
                    handshake_timeout: self.inner.config.transport.handshake_timeout,
                };
                establish.run(key)
            })
            .await?;

        if self.is_closed() {
            self.inner
                .registry
                .close_session(lease.session(), "dialer closed");
            return Err(Error::Closed);
        }

        lease.open_conn().await
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("owner", &self.inner.owner)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for session in self.registry.sessions_owned_by(self.owner) {
            self.registry.close_session(&session, "dialer closed");
        }
        self.endpoint
            .close(VarInt::from_u32(Error::CODE_CLOSED), b"dialer closed");

        debug!(owner = self.owner, "Dialer closed");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

impl tower::Service<Uri> for Dialer {
    type Response = TokioIo<StreamConn>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.is_closed() {
            return Poll::Ready(Err(Error::Closed));
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.clone();
        Box::pin(async move {
            let target = target_from_uri(&uri)?;
            dialer.dial(&target).await.map(TokioIo::new)
        })
    }
}

/// Everything a session establishment needs, detached from the dialer so the
/// handshake can outlive the dial that started it.
struct Establish {
    owner: u64,
    endpoint: quinn::Endpoint,
    credentials: ClientCredentials,
    client_config: quinn::ClientConfig,
    handshake_timeout: Duration,
}

impl Establish {
    async fn run(self, key: SessionKey) -> Result<Session, Error> {
        let (host, port) = split_host_port(&key.target)?;
        let remote = self.resolve(host, port).await?;
        let server_name = self.credentials.server_name_for(host);

        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), remote, server_name)
            .map_err(Error::from_connect)?;
        let connection = tokio::time::timeout(self.handshake_timeout, connecting)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::from_handshake)?;

        let auth_info = match self.credentials.auth_info(&connection) {
            Ok(auth_info) => auth_info,
            Err(e) => {
                connection.close(
                    VarInt::from_u32(Error::CODE_NO_APPLICATION_PROTOCOL),
                    b"no application protocol",
                );
                return Err(e);
            }
        };

        let bound = self
            .endpoint
            .local_addr()
            .map_err(|e| Error::Io(e.to_string()))?;
        let local_addr = connection_local_addr(&connection, bound);

        info!(
            target = %key.target,
            remote = %remote,
            protocol = ?auth_info.protocol_str(),
            verification = ?auth_info.verification(),
            "Session established"
        );

        Ok(Session::new(
            Role::Client,
            Some(key),
            self.owner,
            connection,
            local_addr,
            auth_info,
        ))
    }

    /// Resolve `host`, preferring addresses the local socket can reach.
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, Error> {
        let local = self
            .endpoint
            .local_addr()
            .map_err(|e| Error::Io(e.to_string()))?;

        let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::InvalidTarget(format!("{host}:{port}: {e}")))?
            .collect();

        candidates
            .iter()
            .find(|addr| addr.is_ipv4() == local.is_ipv4())
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| Error::InvalidTarget(format!("{host}:{port}: no addresses")))
    }
}

/// Scope a credentials fingerprint to one dialer; each dialer has its own endpoint.
fn session_fingerprint(credentials: u64, owner: u64) -> u64 {
    let mut hasher = ahash::RandomState::with_seeds(1, 2, 3, 4).build_hasher();
    credentials.hash(&mut hasher);
    owner.hash(&mut hasher);
    hasher.finish()
}

/// Split `host:port`, accepting bracketed IPv6 literals.
fn split_host_port(target: &str) -> Result<(&str, u16), Error> {
    let invalid = || Error::InvalidTarget(target.to_string());

    let (host, port) = match target.strip_prefix('[') {
        Some(rest) => {
            let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
            (host, rest.strip_prefix(':').ok_or_else(invalid)?)
        }
        None => target.rsplit_once(':').ok_or_else(invalid)?,
    };
    if host.is_empty() {
        return Err(invalid());
    }

    let port = port.parse().map_err(|_| invalid())?;
    Ok((host, port))
}

/// The dial target for an `http://host:port` URI handed over by tonic.
fn target_from_uri(uri: &Uri) -> Result<String, Error> {
    let host = uri
        .host()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| Error::InvalidTarget(uri.to_string()))?;

    let port = match (uri.port_u16(), uri.scheme_str()) {
        (Some(port), _) => port,
        (None, Some("https")) => 443,
        (None, _) => 80,
    };

    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Identity, ServerCredentials};
    use crate::server::{Listener, ListenerConfig};

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("localhost:1234").unwrap(), ("localhost", 1234));
        assert_eq!(split_host_port("[::1]:443").unwrap(), ("::1", 443));
        assert!(matches!(split_host_port("localhost"), Err(Error::InvalidTarget(_))));
        assert!(matches!(split_host_port(":80"), Err(Error::InvalidTarget(_))));
        assert!(matches!(split_host_port("host:http"), Err(Error::InvalidTarget(_))));
    }

    #[test]
    fn test_target_from_uri() {
        let uri: Uri = "http://localhost:1234".parse().unwrap();
        assert_eq!(target_from_uri(&uri).unwrap(), "localhost:1234");

        let uri: Uri = "http://[::1]:50051/hello.Hello/SayHi".parse().unwrap();
        assert_eq!(target_from_uri(&uri).unwrap(), "[::1]:50051");

        let uri: Uri = "https://example.test".parse().unwrap();
        assert_eq!(target_from_uri(&uri).unwrap(), "example.test:443");
    }

    #[test]
    fn test_fingerprint_is_scoped_to_dialer() {
        assert_eq!(session_fingerprint(7, 1), session_fingerprint(7, 1));
        assert_ne!(session_fingerprint(7, 1), session_fingerprint(7, 2));
    }

    #[tokio::test]
    async fn test_dials_share_one_session() {
        let identity = Identity::self_signed(["localhost"]).unwrap();
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            ServerCredentials::new(identity.clone()),
            ListenerConfig::default(),
        )
        .unwrap();
        let target = format!("localhost:{}", listener.local_addr().port());

        let dialer = Dialer::new(
            ClientCredentials::with_roots(identity.cert_chain.clone()),
            DialerConfig::default(),
        )
        .unwrap();

        let first = dialer.dial(&target).await.unwrap();
        let second = dialer.dial(&target).await.unwrap();

        assert_eq!(first.session_id(), second.session_id());
        assert_ne!(first.stream_id(), second.stream_id());
        assert_eq!(dialer.registry().session_count(), 1);
        assert_eq!(first.session().open_streams(), 2);

        let auth_info = dialer.auth_info_for(&target).unwrap();
        assert_eq!(auth_info.protocol_str(), Some("grpc-quic"));
        assert!(auth_info.is_peer_verified());
    }

    #[tokio::test]
    async fn test_closed_dialer_rejects_dials() {
        let dialer = Dialer::new(ClientCredentials::insecure_skip_verify(), DialerConfig::default()).unwrap();
        dialer.close();

        assert_eq!(dialer.dial("localhost:1").await.unwrap_err(), Error::Closed);

        let mut service = dialer.clone();
        let ready = futures::future::poll_fn(|cx| tower::Service::poll_ready(&mut service, cx)).await;
        assert_eq!(ready.unwrap_err(), Error::Closed);
    }

    #[tokio::test]
    async fn test_invalid_target() {
        let dialer = Dialer::new(ClientCredentials::insecure_skip_verify(), DialerConfig::default()).unwrap();
        let err = dialer.dial("no-port").await.unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
        assert_eq!(dialer.registry().stats().establishing, 0);
    }

    #[test]
    fn test_empty_roots_fail_before_dialing() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let err = Dialer::new(ClientCredentials::with_roots(vec![]), DialerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::UntrustedPeer(_)));
    }
}
