//! Client-side types: the dialer adapter and its configuration.

mod config;
mod dialer;

pub use config::DialerConfig;
pub use dialer::Dialer;
