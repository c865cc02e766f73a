use anyhow::Result;
use grpc_quic::Dialer;
use tonic::transport::{Channel, Endpoint};
use tracing::info;

use crate::hello_proto::Req;
use crate::hello_proto::hello_client::HelloClient;

/// Connect a hello client to `target` (`host:port`) through `dialer`.
///
/// tonic speaks plain HTTP/2 here; the QUIC session underneath is what is
/// encrypted and authenticated.
pub async fn connect(dialer: Dialer, target: &str) -> Result<HelloClient<Channel>> {
    let channel = Endpoint::from_shared(format!("http://{target}"))?
        .connect_with_connector(dialer)
        .await?;

    Ok(HelloClient::new(channel))
}

/// Send one greeting and return the server's reply.
pub async fn say_hi(client: &mut HelloClient<Channel>, message: &str) -> Result<String> {
    let response = client
        .say_hi(Req {
            message: message.to_string(),
        })
        .await?;

    let reply = response.into_inner().message;
    info!(message = %message, reply = %reply, "Greeting answered");
    Ok(reply)
}
