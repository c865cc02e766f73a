use anyhow::Result;
use grpc_quic::{Identity, Listener, ListenerConfig, ServerCredentials};
use quic_grpc::{DEFAULT_ADDR, grpc, resolve_addr};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let addr = std::env::var("HELLO_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());

    let identity = match (std::env::var("HELLO_CERT"), std::env::var("HELLO_KEY")) {
        (Ok(cert), Ok(key)) => {
            info!(cert = %cert, "Loading server identity");
            Identity::from_pem_files(cert, key)?
        }
        _ => {
            warn!("HELLO_CERT/HELLO_KEY not set, generating a self-signed identity for localhost");
            Identity::self_signed(["localhost"])?
        }
    };

    let listener = Listener::bind(
        resolve_addr(&addr).await?,
        ServerCredentials::new(identity),
        ListenerConfig::default(),
    )?;

    grpc::serve(listener, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    })
    .await
}
