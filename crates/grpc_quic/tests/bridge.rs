use std::time::Duration;

use grpc_quic::credentials::{ClientAuth, Verification};
use grpc_quic::{
    ClientCredentials, Dialer, DialerConfig, Error, Identity, Listener, ListenerConfig,
    ServerCredentials, TransportConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

fn identity() -> Identity {
    Identity::self_signed(["localhost"]).unwrap()
}

fn listen(credentials: ServerCredentials) -> (Listener, String) {
    let listener = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        credentials,
        ListenerConfig::default(),
    )
    .unwrap();
    let target = format!("localhost:{}", listener.local_addr().port());
    (listener, target)
}

fn dialer(server: &Identity, config: DialerConfig) -> Dialer {
    Dialer::new(ClientCredentials::with_roots(server.cert_chain.clone()), config).unwrap()
}

/// Closed connections release their session once the peer acknowledges them.
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_request_reply_over_one_stream() {
    let server_identity = identity();
    let (listener, target) = listen(ServerCredentials::new(server_identity.clone()));

    let server = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        let mut request = Vec::new();
        conn.read_to_end(&mut request).await.unwrap();

        conn.write_all(b"from server").await.unwrap();
        conn.shutdown().await.unwrap();
        (request, conn.auth_info())
    });

    let dialer = dialer(&server_identity, DialerConfig::default());
    let mut conn = dialer.dial(&target).await.unwrap();
    assert_eq!(conn.auth_info().protocol(), b"grpc-quic");
    assert_eq!(conn.auth_info().verification(), Verification::Verified);

    conn.write_all(b"Tom").await.unwrap();
    conn.close_write().unwrap();

    let mut reply = Vec::new();
    conn.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"from server");

    let (request, server_auth) = server.await.unwrap();
    assert_eq!(request, b"Tom");
    assert_eq!(server_auth.server_name(), Some("localhost"));
    assert_eq!(server_auth.verification(), Verification::NotRequested);
}

#[tokio::test]
async fn test_wildcard_bound_dialer_reports_concrete_local_addr() {
    let server_identity = identity();
    let (listener, target) = listen(ServerCredentials::new(server_identity.clone()));
    let dialer = dialer(&server_identity, DialerConfig::default());
    assert!(dialer.local_addr().unwrap().ip().is_unspecified());

    let mut conn = dialer.dial(&target).await.unwrap();
    conn.write_all(b"x").await.unwrap();
    let accepted = listener.accept().await.unwrap();

    assert!(!conn.local_addr().ip().is_unspecified());
    assert_eq!(conn.local_addr().port(), dialer.local_addr().unwrap().port());
    assert_eq!(conn.local_addr(), accepted.remote_addr());
}

#[tokio::test]
async fn test_concurrent_dials_share_one_handshake() {
    let server_identity = identity();
    let (listener, target) = listen(ServerCredentials::new(server_identity.clone()));
    let dialer = dialer(&server_identity, DialerConfig::default());

    let (a, b) = tokio::join!(dialer.dial(&target), dialer.dial(&target));
    let (mut a, mut b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.session_id(), b.session_id());
    assert_ne!(a.stream_id(), b.stream_id());
    assert_eq!(dialer.registry().session_count(), 1);

    a.write_all(b"a").await.unwrap();
    b.write_all(b"b").await.unwrap();
    let first = listener.accept().await.unwrap();
    let second = listener.accept().await.unwrap();

    assert_eq!(first.session_id(), second.session_id());
    assert_eq!(listener.registry().session_count(), 1);
}

#[tokio::test]
async fn test_byte_stream_fidelity() {
    let server_identity = identity();
    let (listener, target) = listen(ServerCredentials::new(server_identity.clone()));

    let server = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        let mut received = Vec::new();
        conn.read_to_end(&mut received).await.unwrap();
        conn.write_all(&received).await.unwrap();
        conn.shutdown().await.unwrap();
    });

    let payload: Vec<u8> = (0..(1 << 20)).map(|i: u32| (i * 31 % 251) as u8).collect();

    let dialer = dialer(&server_identity, DialerConfig::default());
    let mut conn = dialer.dial(&target).await.unwrap();

    // Uneven chunk sizes so message boundaries never line up with packets.
    let mut offset = 0;
    for size in [1, 7, 1200, 65_536, 3].into_iter().cycle() {
        if offset == payload.len() {
            break;
        }
        let end = (offset + size).min(payload.len());
        conn.write_all(&payload[offset..end]).await.unwrap();
        offset = end;
    }
    conn.close_write().unwrap();

    let mut echoed = Vec::new();
    conn.read_to_end(&mut echoed).await.unwrap();
    server.await.unwrap();

    assert_eq!(echoed.len(), payload.len());
    assert!(echoed == payload);
}

#[tokio::test]
async fn test_close_releases_session_once() {
    let server_identity = identity();
    let (_listener, target) = listen(ServerCredentials::new(server_identity.clone()));
    let dialer = dialer(&server_identity, DialerConfig::default());

    let mut first = dialer.dial(&target).await.unwrap();
    let second = dialer.dial(&target).await.unwrap();
    let session = first.session().clone();
    assert_eq!(session.open_streams(), 2);

    first.close();
    first.close();
    drop(first);
    assert!(eventually(|| session.open_streams() == 1).await);

    drop(second);
    assert!(eventually(|| session.open_streams() == 0).await);
    assert!(session.idle_deadline().is_some());
}

#[tokio::test]
async fn test_idle_session_is_replaced() {
    let server_identity = identity();
    let (_listener, target) = listen(ServerCredentials::new(server_identity.clone()));
    let config = DialerConfig::default().with_transport(
        TransportConfig::default().with_session_idle_timeout(Duration::from_millis(200)),
    );
    let dialer = dialer(&server_identity, config);

    let conn = dialer.dial(&target).await.unwrap();
    let first_session = conn.session_id();
    drop(conn);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(dialer.session_for(&target).is_none());

    let conn = dialer.dial(&target).await.unwrap();
    assert_ne!(conn.session_id(), first_session);
}

#[tokio::test]
async fn test_untrusted_server_is_rejected() {
    let (_listener, target) = listen(ServerCredentials::new(identity()));
    let dialer = dialer(&identity(), DialerConfig::default());

    let err = dialer.dial(&target).await.unwrap_err();

    assert!(matches!(err, Error::UntrustedPeer(_)), "got {err:?}");
    assert!(dialer.registry().is_empty());
    assert_eq!(dialer.registry().stats().establishing, 0);
}

#[tokio::test]
async fn test_insecure_mode_skips_verification() {
    let (_listener, target) = listen(ServerCredentials::new(identity()));
    let dialer = Dialer::new(
        ClientCredentials::insecure_skip_verify(),
        DialerConfig::default(),
    )
    .unwrap();

    let conn = dialer.dial(&target).await.unwrap();
    assert_eq!(conn.auth_info().verification(), Verification::Skipped);
    assert!(!conn.auth_info().is_peer_verified());
}

#[tokio::test]
async fn test_alpn_mismatch_fails_establishment() {
    let server_identity = identity();
    let (_listener, target) = listen(
        ServerCredentials::new(server_identity.clone()).with_alpn_protocols(["grpc-quic-v2"]),
    );
    let dialer = dialer(&server_identity, DialerConfig::default());

    let err = dialer.dial(&target).await.unwrap_err();
    assert!(matches!(err, Error::Establishment(_)), "got {err:?}");
    assert!(dialer.registry().is_empty());
}

#[tokio::test]
async fn test_mutual_tls_reports_client_identity() {
    let server_identity = identity();
    let client_identity = identity();
    let (listener, target) = listen(
        ServerCredentials::new(server_identity.clone())
            .with_client_auth(ClientAuth::Required(client_identity.cert_chain.clone())),
    );

    let credentials = ClientCredentials::with_roots(server_identity.cert_chain.clone())
        .with_identity(client_identity.clone());
    let dialer = Dialer::new(credentials, DialerConfig::default()).unwrap();

    let mut conn = dialer.dial(&target).await.unwrap();
    conn.write_all(b"hi").await.unwrap();

    let accepted = listener.accept().await.unwrap();
    let auth_info = accepted.auth_info();
    assert!(auth_info.is_peer_verified());
    assert_eq!(auth_info.peer_identity(), client_identity.leaf());
}

#[tokio::test]
async fn test_dial_deadline_against_silent_peer() {
    // Swallows the handshake without ever answering.
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = silent.local_addr().unwrap().to_string();
    let dialer = Dialer::new(ClientCredentials::insecure_skip_verify(), DialerConfig::default()).unwrap();

    let started = Instant::now();
    let err = dialer
        .dial_timeout(&target, Duration::from_secs(1))
        .await
        .unwrap_err();

    assert_eq!(err, Error::Timeout);
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test]
async fn test_dial_cancellation() {
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = silent.local_addr().unwrap().to_string();
    let dialer = Dialer::new(ClientCredentials::insecure_skip_verify(), DialerConfig::default()).unwrap();

    let started = Instant::now();
    let err = dialer
        .dial_with_cancel(
            &target,
            Duration::from_secs(10),
            tokio::time::sleep(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert_eq!(err, Error::DialCanceled);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_canceled_dial_does_not_abort_shared_establishment() {
    let server_identity = identity();
    let (_listener, target) = listen(ServerCredentials::new(server_identity.clone()));
    let dialer = dialer(&server_identity, DialerConfig::default());

    let canceled = dialer.dial_with_cancel(&target, Duration::from_secs(10), async {
        tokio::task::yield_now().await;
    });
    let waiting = dialer.dial(&target);
    let (canceled, waiting) = tokio::join!(canceled, waiting);

    assert_eq!(canceled.unwrap_err(), Error::DialCanceled);
    let conn = waiting.unwrap();
    assert!(conn.session().is_live());
    assert_eq!(dialer.registry().session_count(), 1);
}

#[tokio::test]
async fn test_listener_close_stops_serving() {
    let server_identity = identity();
    let (listener, target) = listen(ServerCredentials::new(server_identity.clone()));
    let dialer = dialer(&server_identity, DialerConfig::default());

    let mut conn = dialer.dial(&target).await.unwrap();
    conn.write_all(b"x").await.unwrap();
    let accepted = listener.accept().await.unwrap();
    let server_session = accepted.session().clone();

    listener.close();
    assert_eq!(listener.accept().await.unwrap_err(), Error::Closed);
    assert!(server_session.is_live());

    drop(accepted);
    assert!(eventually(|| !server_session.is_live()).await);
    assert!(listener.registry().is_empty());
}

#[tokio::test]
async fn test_final_reply_survives_listener_close() {
    let server_identity = identity();
    let (listener, target) = listen(ServerCredentials::new(server_identity.clone()));
    let reply: Vec<u8> = (0..(64 * 1024)).map(|i: u32| (i % 199) as u8).collect();
    let expected = reply.clone();

    let server = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        let mut request = [0u8; 3];
        conn.read_exact(&mut request).await.unwrap();
        conn.write_all(&reply).await.unwrap();
        drop(conn);
        listener.close();
        listener
    });

    let dialer = dialer(&server_identity, DialerConfig::default());
    let mut conn = dialer.dial(&target).await.unwrap();
    conn.write_all(b"Tom").await.unwrap();

    let mut received = Vec::new();
    conn.read_to_end(&mut received).await.unwrap();
    assert!(received == expected);

    let listener = server.await.unwrap();
    assert!(eventually(|| listener.registry().is_empty()).await);
}

#[tokio::test]
async fn test_dialer_close_fails_open_connections() {
    let server_identity = identity();
    let (_listener, target) = listen(ServerCredentials::new(server_identity.clone()));
    let dialer = dialer(&server_identity, DialerConfig::default());

    let mut conn = dialer.dial(&target).await.unwrap();
    dialer.close();

    let mut buf = [0u8; 4];
    let err = conn.read(&mut buf).await.unwrap_err();
    assert_eq!(
        Error::from_io(&err),
        Some(&Error::SessionClosed("dialer closed".to_string()))
    );
    assert_eq!(dialer.dial(&target).await.unwrap_err(), Error::Closed);
    assert!(dialer.registry().is_empty());
}
