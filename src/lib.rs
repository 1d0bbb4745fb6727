//! # tuic-relay
//!
//! A relay protocol carrying TCP streams and UDP datagrams over one shared,
//! authenticated QUIC connection (TUIC version 5 wire format).
//!
//! - **Streams**: each proxied TCP session is one bidirectional stream,
//!   prefixed by a `Connect` command
//! - **Datagrams**: UDP packets travel as QUIC datagrams (native mode) or as
//!   one-shot unidirectional streams (QUIC mode), fragmented when too large
//! - **Authentication**: a token exported from the TLS session, so the
//!   password never crosses the wire
//! - **Pooling**: many logical requests share few physical connections
//!
//! ## Feature Flags
//!
//! - `client` (default): connection lifecycle and pool
//! - `server` (default): server sessions and the handler interface
//! - `quinn`: transport adapter over a quinn endpoint
//!
//! ## Modules
//!
//! - [`core`]: constants, errors, options and transport traits
//! - [`protocol`]: command frames, addresses, fragmentation
//! - [`crypto`]: authentication tokens and the per-connection gate
//! - [`transport`]: in-memory transport, task scopes, quinn adapter
//! - [`relay`]: stream and datagram relay
//! - [`client`], [`server`]: the two ends
//!
//! ## Example Usage
//!
//! ```rust
//! use tuic_relay::prelude::*;
//!
//! # async fn run() -> tuic_relay::core::Result<()> {
//! let (transport, _listener) = memory_endpoint(MemoryConfig::default());
//! let options = ClientOptions::builder(uuid::Uuid::new_v4(), "password")
//!     .server_name("relay.example")
//!     .build();
//! let pool = Pool::new(options, PoolOptions::default())?;
//! let dialer = MemoryDialer::new("relay", transport);
//! let _stream = pool.connect_tcp(&dialer, "example.com:443".parse()?).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

pub mod crypto;
pub mod protocol;
pub mod relay;
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        ClientOptions, ClientOptionsBuilder, CloseCode, CongestionControl, Dialer, Listener,
        PoolOptions, QuicConnection, RelayError, RelayMode, ServerOptions, ServerOptionsBuilder,
        Transport,
    };
    pub use crate::protocol::{Address, CodecError, Command, CommandType};
    pub use crate::relay::{StreamConn, UdpAssociation};
    pub use crate::transport::{
        MemoryConfig, MemoryConnection, MemoryDialer, MemoryListener, MemoryTransport,
        memory_endpoint,
    };

    #[cfg(feature = "client")]
    pub use crate::client::{Client, ClientPhase, Pool};

    #[cfg(feature = "server")]
    pub use crate::server::{Server, ServerHandler, UdpPacket};
}

// Re-export commonly used items at crate root
pub use crate::core::{CloseCode, RelayError, Result};
pub use crate::protocol::{Address, CodecError};
