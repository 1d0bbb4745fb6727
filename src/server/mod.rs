//! Relay server.
//!
//! [`Server`] accepts physical connections and runs one session per
//! connection. Authenticated traffic is handed to a [`ServerHandler`].

mod handler;
#[allow(clippy::module_inception)]
mod server;
mod session;

pub use handler::{ServerHandler, UdpPacket};
pub use server::Server;
