//! Server and client in one process: listen, dial, greet, print the reply.

use anyhow::Result;
use grpc_quic::{
    ClientCredentials, Dialer, DialerConfig, Identity, Listener, ListenerConfig,
    ServerCredentials,
};
use quic_grpc::grpc;
use quic_grpc::{DEFAULT_ADDR, DEFAULT_MESSAGE, resolve_addr};
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let addr = std::env::var("HELLO_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let message = std::env::var("HELLO_MESSAGE").unwrap_or_else(|_| DEFAULT_MESSAGE.to_string());

    let host = addr.rsplit_once(':').map_or(addr.as_str(), |(host, _)| host);
    let identity = Identity::self_signed([host])?;

    let listener = Listener::bind(
        resolve_addr(&addr).await?,
        ServerCredentials::new(identity.clone()),
        ListenerConfig::default(),
    )?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(grpc::serve(listener, async move {
        let _ = stop_rx.await;
    }));

    let dialer = Dialer::new(
        ClientCredentials::with_roots(identity.cert_chain.clone()),
        DialerConfig::default(),
    )?;
    let mut client = grpc::connect(dialer.clone(), &addr).await?;
    let reply = grpc::say_hi(&mut client, &message).await?;

    println!("{reply}");

    drop(client);
    dialer.close();
    let _ = stop_tx.send(());
    server.await??;

    Ok(())
}
