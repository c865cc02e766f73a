//! A QUIC transport for tonic.
//!
//! `grpc_quic` makes QUIC sessions look like the listener, connector and
//! connection types tonic already knows how to serve and dial on:
//!
//! - [`Listener`] accepts streams from any inbound session and yields each one
//!   as a new connection; pass [`Listener::into_incoming`] to
//!   `Server::serve_with_incoming`.
//! - [`Dialer`] opens one stream per connection, reusing a single session per
//!   target; pass it to `Endpoint::connect_with_connector`.
//! - [`StreamConn`] is one QUIC stream behaving as a byte-stream connection.
//! - [`credentials`] builds the TLS configuration for both roles and reports
//!   the negotiated security state as [`AuthInfo`].
//!
//! Sessions are owned by a [`SessionRegistry`] that counts open streams and
//! closes sessions that stay idle.

pub mod client;
pub mod config;
mod conn;
pub mod credentials;
mod error;
pub mod server;
pub mod session;

pub use client::{Dialer, DialerConfig};
pub use config::TransportConfig;
pub use conn::{DEFAULT_CLOSE_LINGER, StreamConn, StreamConnInfo};
pub use credentials::{AuthInfo, ClientCredentials, Identity, ServerCredentials};
pub use error::Error;
pub use server::{Listener, ListenerConfig};
pub use session::{Session, SessionRegistry};
