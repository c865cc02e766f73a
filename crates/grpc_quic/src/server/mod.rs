//! Server-side types: the listener adapter and its configuration.

mod config;
mod listener;

pub use config::ListenerConfig;
pub use listener::Listener;
