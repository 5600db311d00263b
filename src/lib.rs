//! A transparent TCP proxy that delays everything it relays.
//!
//! Point the service under test to the proxy and the proxy to the real dependency: every chunk of bytes is
//! forwarded unmodified, in both directions, but only after a fixed delay has elapsed. Useful for testing how a
//! service copes with a slow network or a slow dependency without touching either of them.

#[macro_use] extern crate log;

pub mod config;
pub mod connection_table;
pub mod delayed_item;
pub mod delivery_queue;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod multiplexer;
pub mod relay;

pub use crate::config::{LogLevel, PartialConfig, ProxyConfig};
pub use crate::delayed_item::{Chunk, Delayed, DelayedItem};
pub use crate::delivery_queue::DeliveryQueue;
pub use crate::error::{ConfigError, ProxyError};
pub use crate::events::ProxyEvent;
pub use crate::multiplexer::Proxy;

/// Binds the local port and relays connections until the process terminates. Only returns if setting up the proxy
/// fails.
pub fn run(config: &ProxyConfig) -> Result<(), ProxyError> {
    Proxy::bind(config)?.run()
}
