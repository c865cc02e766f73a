mod client;
mod server;

pub use client::{connect, say_hi};
pub use server::{HelloService, REPLY, serve};

pub use crate::hello_proto::hello_client::HelloClient;
pub use crate::hello_proto::hello_server::HelloServer;
