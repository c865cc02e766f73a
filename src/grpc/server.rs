use std::future::Future;

use grpc_quic::{Listener, StreamConnInfo};
use tonic::{Request, Response, Status};
use tracing::info;

use crate::hello_proto::hello_server::{Hello, HelloServer};
use crate::hello_proto::{Req, Res};

/// What the server answers to every greeting.
pub const REPLY: &str = "from server";

/// Serve the hello service on `listener` until `shutdown` completes.
pub async fn serve<F>(listener: Listener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    info!(local_addr = %listener.local_addr(), "Hello service listening over QUIC");

    tonic::transport::Server::builder()
        .add_service(HelloServer::new(HelloService))
        .serve_with_incoming_shutdown(listener.into_incoming(), shutdown)
        .await?;

    info!("Hello service stopped");
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HelloService;

#[tonic::async_trait]
impl Hello for HelloService {
    async fn say_hi(&self, request: Request<Req>) -> Result<Response<Res>, Status> {
        let conn = request.extensions().get::<StreamConnInfo>().cloned();
        let message = request.into_inner().message;

        match conn {
            Some(conn) => info!(
                message = %message,
                remote = %conn.remote_addr,
                session_id = conn.session_id,
                stream_id = %conn.stream_id,
                protocol = ?conn.auth_info.protocol_str(),
                "Received greeting"
            ),
            None => info!(message = %message, "Received greeting"),
        }

        Ok(Response::new(Res {
            message: REPLY.to_string(),
        }))
    }
}
