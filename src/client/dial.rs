//! Per-dialer transport cache.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::core::{Dialer, Transport};

type Entry<D> = (Arc<<D as Dialer>::Transport>, SocketAddr);

/// Caches the transport and server address resolved for each dialer.
///
/// Every client created for the same dialer shares one transport. Cached
/// transports are released only by [`close`](Self::close) or on drop.
pub struct DialCache<D: Dialer> {
    entries: Mutex<HashMap<D, Entry<D>>>,
    dial_lock: AsyncMutex<()>,
    closed: AtomicBool,
}

impl<D: Dialer> fmt::Debug for DialCache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialCache")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<D: Dialer> Default for DialCache<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Dialer> DialCache<D> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dial_lock: AsyncMutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Cached transport for `dialer`, dialing on first use.
    pub async fn get(&self, dialer: &D) -> io::Result<Entry<D>> {
        if let Some(entry) = self.lookup(dialer)? {
            return Ok(entry);
        }
        let _dialing = self.dial_lock.lock().await;
        if let Some(entry) = self.lookup(dialer)? {
            return Ok(entry);
        }
        let (transport, remote) = dialer.dial().await?;
        tracing::debug!(?dialer, %remote, "dialed transport");
        let transport = Arc::new(transport);
        let mut entries = self.entries.lock();
        if self.is_closed() {
            transport.close();
            return Err(closed_error());
        }
        entries.insert(dialer.clone(), (transport.clone(), remote));
        Ok((transport, remote))
    }

    fn lookup(&self, dialer: &D) -> io::Result<Option<Entry<D>>> {
        let entries = self.entries.lock();
        if self.is_closed() {
            return Err(closed_error());
        }
        Ok(entries
            .get(dialer)
            .map(|(transport, remote)| (transport.clone(), *remote)))
    }

    /// Close every cached transport. Later `get` calls fail.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock();
            self.closed.store(true, Ordering::Release);
            entries.drain().collect()
        };
        for (dialer, (transport, _)) in drained {
            tracing::debug!(?dialer, "closing cached transport");
            transport.close();
        }
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<D: Dialer> Drop for DialCache<D> {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "dial cache closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryConfig, MemoryDialer, memory_endpoint};

    #[tokio::test]
    async fn test_dials_once_per_dialer() {
        let (transport, _listener) = memory_endpoint(MemoryConfig::default());
        let a = MemoryDialer::new("a", transport.clone());
        let b = MemoryDialer::new("b", transport.clone());
        let cache = DialCache::new();

        cache.get(&a).await.unwrap();
        cache.get(&a.clone()).await.unwrap();
        cache.get(&b).await.unwrap();
        assert_eq!(a.dial_count(), 1);
        assert_eq!(b.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_close_releases_transports() {
        let (transport, _listener) = memory_endpoint(MemoryConfig::default());
        let dialer = MemoryDialer::new("a", transport.clone());
        let cache = DialCache::new();
        cache.get(&dialer).await.unwrap();
        assert!(!transport.is_closed());

        cache.close();
        assert!(transport.is_closed());
        assert!(cache.get(&dialer).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_releases_transports() {
        let (transport, _listener) = memory_endpoint(MemoryConfig::default());
        let dialer = MemoryDialer::new("a", transport.clone());
        let cache = DialCache::new();
        cache.get(&dialer).await.unwrap();
        drop(cache);
        assert!(transport.is_closed());
    }
}
