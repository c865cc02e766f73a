pub mod grpc;

use std::net::SocketAddr;

use anyhow::{Context, Result};

pub mod hello_proto {
    include!(concat!(env!("OUT_DIR"), "/hello.rs"));
}

/// Address the demo server listens on and the client dials.
pub const DEFAULT_ADDR: &str = "localhost:1234";

/// Greeting the demo client sends.
pub const DEFAULT_MESSAGE: &str = "Tom";

/// Resolve a `host:port` string to a socket address, preferring IPv4.
pub async fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("failed to resolve {addr}"))?
        .collect();

    candidates
        .iter()
        .find(|candidate| candidate.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .with_context(|| format!("{addr} did not resolve to any address"))
}
