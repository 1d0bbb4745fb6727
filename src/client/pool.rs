//! Connection pool.
//!
//! Keeps separate client lists for TCP and UDP traffic. Each request goes to
//! the least-loaded live client for its dialer; a new client is created and
//! pushed to the front when none is usable, or when the chosen one turns out
//! to be full or closed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::client::Client;
use super::dial::DialCache;
use crate::core::{ClientOptions, Dialer, DialerConnection, PoolOptions, Result};
use crate::protocol::Address;
use crate::relay::{StreamConn, UdpAssociation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Traffic {
    Tcp,
    Udp,
}

/// Pool of relay clients keyed by dialer.
pub struct Pool<D: Dialer> {
    options: ClientOptions,
    pool_options: PoolOptions,
    dials: Arc<DialCache<D>>,
    tcp: Mutex<VecDeque<Client<D>>>,
    udp: Mutex<VecDeque<Client<D>>>,
}

impl<D: Dialer> fmt::Debug for Pool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("tcp_clients", &self.tcp_clients())
            .field("udp_clients", &self.udp_clients())
            .field("idle_ttl", &self.pool_options.idle_ttl)
            .finish()
    }
}

impl<D: Dialer> Pool<D> {
    /// Create an empty pool.
    pub fn new(options: ClientOptions, pool_options: PoolOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            pool_options,
            dials: Arc::new(DialCache::new()),
            tcp: Mutex::new(VecDeque::new()),
            udp: Mutex::new(VecDeque::new()),
        })
    }

    /// Relay a TCP connection to `address` through `dialer`.
    pub async fn connect_tcp(
        &self,
        dialer: &D,
        address: Address,
    ) -> Result<StreamConn<DialerConnection<D>>> {
        let client = self.get(Traffic::Tcp, dialer);
        match client.connect_tcp(address.clone()).await {
            Err(e) if e.needs_new_connection() => {
                tracing::debug!(?dialer, error = %e, "retrying tcp on a new client");
                self.fresh(Traffic::Tcp, dialer).connect_tcp(address).await
            }
            result => result,
        }
    }

    /// Open a UDP association through `dialer`.
    pub async fn associate(&self, dialer: &D) -> Result<UdpAssociation<DialerConnection<D>>> {
        let client = self.get(Traffic::Udp, dialer);
        match client.associate().await {
            Err(e) if e.needs_new_connection() => {
                tracing::debug!(?dialer, error = %e, "retrying udp on a new client");
                self.fresh(Traffic::Udp, dialer).associate().await
            }
            result => result,
        }
    }

    /// Clients currently held for TCP traffic.
    pub fn tcp_clients(&self) -> usize {
        self.tcp.lock().len()
    }

    /// Clients currently held for UDP traffic.
    pub fn udp_clients(&self) -> usize {
        self.udp.lock().len()
    }

    /// Close every client and release cached transports.
    pub fn close(&self) {
        let clients: Vec<_> = self
            .tcp
            .lock()
            .drain(..)
            .chain(self.udp.lock().drain(..))
            .collect();
        for client in clients {
            client.close();
        }
        self.dials.close();
    }

    fn list(&self, traffic: Traffic) -> &Mutex<VecDeque<Client<D>>> {
        match traffic {
            Traffic::Tcp => &self.tcp,
            Traffic::Udp => &self.udp,
        }
    }

    /// Least-loaded live client for `dialer`. Sweeps closed clients and
    /// idle ones past the TTL on the way.
    fn get(&self, traffic: Traffic, dialer: &D) -> Client<D> {
        let mut list = self.list(traffic).lock();
        let now = Instant::now();

        let best = list
            .iter()
            .filter(|c| c.dialer() == dialer && !c.is_closed())
            .min_by_key(|c| c.open_streams())
            .cloned();

        let idle_ttl = self.pool_options.idle_ttl;
        list.retain(|c| {
            if c.is_closed() {
                return false;
            }
            if c.dialer() != dialer || best.as_ref().is_some_and(|b| b.same_as(c)) {
                return true;
            }
            if c.open_streams() == 0 && now.duration_since(c.last_visited()) > idle_ttl {
                tracing::debug!(?traffic, ?dialer, "evicting idle client");
                c.close();
                return false;
            }
            true
        });

        match best {
            Some(client) => client,
            None => {
                let client = self.new_client(dialer);
                list.push_front(client.clone());
                client
            }
        }
    }

    fn fresh(&self, traffic: Traffic, dialer: &D) -> Client<D> {
        let client = self.new_client(dialer);
        self.list(traffic).lock().push_front(client.clone());
        client
    }

    fn new_client(&self, dialer: &D) -> Client<D> {
        tracing::debug!(?dialer, "creating client");
        Client::with_cache(dialer.clone(), self.options.clone(), self.dials.clone())
    }
}

impl<D: Dialer> Drop for Pool<D> {
    fn drop(&mut self) {
        self.close();
    }
}
