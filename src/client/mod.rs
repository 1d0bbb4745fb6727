//! Relay client.
//!
//! [`Client`] manages one physical connection; [`Pool`] spreads requests
//! over clients per network path and shares dialed transports between them
//! through a [`DialCache`].

#[allow(clippy::module_inception)]
mod client;
mod dial;
mod pool;

pub use client::{Client, ClientPhase};
pub use dial::DialCache;
pub use pool::Pool;
