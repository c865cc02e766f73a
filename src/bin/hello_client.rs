use anyhow::{Result, bail};
use grpc_quic::credentials::load_pem_certs;
use grpc_quic::{ClientCredentials, Dialer, DialerConfig};
use quic_grpc::{DEFAULT_ADDR, DEFAULT_MESSAGE, grpc};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let addr = std::env::var("HELLO_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let message = std::env::var("HELLO_MESSAGE").unwrap_or_else(|_| DEFAULT_MESSAGE.to_string());
    let insecure = std::env::var("HELLO_INSECURE").is_ok_and(|v| v == "1" || v == "true");

    let credentials = match std::env::var("HELLO_CA_CERT") {
        Ok(path) => ClientCredentials::with_roots(load_pem_certs(path)?),
        Err(_) if insecure => ClientCredentials::insecure_skip_verify(),
        Err(_) => bail!("set HELLO_CA_CERT to the server's CA certificate, or HELLO_INSECURE=1"),
    };

    let dialer = Dialer::new(credentials, DialerConfig::default())?;
    let mut client = grpc::connect(dialer.clone(), &addr).await?;
    let reply = grpc::say_hi(&mut client, &message).await?;

    println!("{reply}");

    dialer.close();
    Ok(())
}
