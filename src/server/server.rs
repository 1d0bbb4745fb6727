//! Relay server front-end.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::handler::ServerHandler;
use super::session::Session;
use crate::core::constants::DEFAULT_MAX_CONCURRENT_TASKS;
use crate::core::{Listener, QuicConnection, Result, ServerOptions};
use crate::transport::TaskScope;

/// Accepts physical connections and runs a session for each.
///
/// # Example
///
/// ```ignore
/// use tuic_relay::server::Server;
///
/// let options = ServerOptions::builder().user(id, "password").build();
/// let server = Server::new(options, MyHandler)?;
/// server.serve(listener).await?;
/// ```
pub struct Server<H> {
    options: Arc<ServerOptions>,
    handler: Arc<H>,
    scope: TaskScope,
}

impl<H> fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.options)
            .field("shut_down", &self.scope.is_cancelled())
            .finish()
    }
}

impl<H> Server<H> {
    /// Create a server handing relayed traffic to `handler`.
    pub fn new(options: ServerOptions, handler: H) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options: Arc::new(options),
            handler: Arc::new(handler),
            scope: TaskScope::new(DEFAULT_MAX_CONCURRENT_TASKS),
        })
    }

    /// Server options.
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Accept connections from `listener` until it ends or the server is
    /// shut down.
    pub async fn serve<L>(&self, mut listener: L) -> Result<()>
    where
        L: Listener,
        H: ServerHandler<L::Connection>,
    {
        if let Ok(local) = listener.local_addr() {
            tracing::info!(%local, "relay server listening");
        }
        loop {
            let next = tokio::select! {
                biased;
                _ = self.scope.cancelled() => return Ok(()),
                next = listener.accept() => next,
            };
            match next {
                Some(Ok(conn)) => {
                    self.serve_connection(conn);
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "accept failed");
                    return Err(e.into());
                }
                None => return Ok(()),
            }
        }
    }

    /// Run a session for one already-accepted connection.
    pub fn serve_connection<C>(&self, conn: C) -> JoinHandle<()>
    where
        C: QuicConnection,
        H: ServerHandler<C>,
    {
        let scope = self.scope.child(self.options.max_concurrent_tasks);
        let session = Session::new(conn, self.options.clone(), self.handler.clone(), scope);
        tokio::spawn(session.run())
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        tracing::info!("relay server shutting down");
        self.scope.cancel();
    }
}

impl<H> Drop for Server<H> {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}
