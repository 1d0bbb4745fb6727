//! Transports and per-connection task management.
//!
//! - [`TaskScope`]: cancellation plus a bound on handler tasks for one
//!   physical connection
//! - [`memory`]: in-process transport for tests and embedding
//! - `quic` (feature `quinn`): adapter over a quinn endpoint

pub mod memory;
mod scope;

#[cfg(feature = "quinn")]
#[cfg_attr(docsrs, doc(cfg(feature = "quinn")))]
pub mod quic;

pub use memory::{
    MemoryConfig, MemoryConnection, MemoryDialer, MemoryListener, MemoryTransport, memory_endpoint,
};
pub use scope::{CloseSignal, TaskScope};
