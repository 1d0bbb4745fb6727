//! Shared fixtures for the end-to-end relay tests.
//!
//! Every test runs a real [`Server`] behind an in-memory listener and talks
//! to it through [`Client`]s or a [`Pool`]; no sockets are involved.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tuic_relay::prelude::*;
use uuid::Uuid;

pub const PASSWORD: &str = "correct horse battery staple";

/// Install a test-scoped subscriber. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Echoes TCP streams back to the client and reflects UDP datagrams to
/// their sender, recording each TCP target.
pub struct Echo {
    targets: mpsc::UnboundedSender<(Address, Uuid)>,
}

#[async_trait]
impl ServerHandler<MemoryConnection> for Echo {
    async fn handle_tcp(
        &self,
        stream: StreamConn<MemoryConnection>,
        target: Address,
        user: Uuid,
    ) -> tuic_relay::Result<()> {
        let _ = self.targets.send((target, user));
        let (mut reader, mut writer) = tokio::io::split(stream);
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.shutdown().await?;
        Ok(())
    }

    async fn handle_udp(&self, packet: UdpPacket<MemoryConnection>) -> tuic_relay::Result<()> {
        let target = packet.target().clone();
        packet.write_back(packet.data().clone(), target).await?;
        Ok(())
    }
}

/// A running relay server and the transport reaching it.
pub struct Relay {
    pub server: Arc<Server<Echo>>,
    pub transport: MemoryTransport,
    pub user: Uuid,
    pub targets: mpsc::UnboundedReceiver<(Address, Uuid)>,
    serving: JoinHandle<tuic_relay::Result<()>>,
}

impl Relay {
    /// Start a server with one user and default options.
    pub fn start() -> Self {
        Self::start_with(ServerOptions::builder(), MemoryConfig::default())
    }

    /// Start a server from `builder`, adding the test user.
    pub fn start_with(builder: ServerOptionsBuilder, config: MemoryConfig) -> Self {
        init_tracing();
        let user = Uuid::new_v4();
        let options = builder.user(user, PASSWORD).build();
        let (targets_tx, targets) = mpsc::unbounded_channel();
        let server = Arc::new(
            Server::new(options, Echo { targets: targets_tx }).expect("valid server options"),
        );
        let (transport, listener) = memory_endpoint(config);
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        Self {
            server,
            transport,
            user,
            targets,
            serving,
        }
    }

    /// A dialer reaching this server.
    pub fn dialer(&self, name: &str) -> MemoryDialer {
        MemoryDialer::new(name, self.transport.clone())
    }

    /// Client options for the test user.
    pub fn client_options(&self) -> ClientOptionsBuilder {
        ClientOptions::builder(self.user, PASSWORD)
            .server_name("relay.test")
            .stream_linger(Duration::ZERO)
    }

    /// A client for the test user.
    pub fn client(&self) -> Client<MemoryDialer> {
        Client::new(self.dialer("relay"), self.client_options().build())
            .expect("valid client options")
    }

    pub async fn stop(self) {
        self.server.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), self.serving).await;
    }
}

/// Run `fut` with a generous upper bound so a hang fails instead of
/// stalling the suite.
pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("operation timed out")
}
