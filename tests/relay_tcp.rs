//! End-to-end TCP relay over an in-memory connection.

mod common;

use std::net::SocketAddr;

use common::{Relay, within};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tuic_relay::prelude::*;

async fn echo(stream: &mut StreamConn<MemoryConnection>, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut back = Vec::new();
    stream.read_to_end(&mut back).await.unwrap();
    back
}

#[tokio::test]
async fn relays_ipv4_destination() {
    let mut relay = Relay::start();
    let client = relay.client();
    let target: SocketAddr = "93.184.216.34:443".parse().unwrap();

    let mut stream = within(client.connect_tcp(target.into())).await.unwrap();
    let back = within(echo(&mut stream, b"hello relay")).await;
    assert_eq!(back, b"hello relay");

    let (seen, user) = within(relay.targets.recv()).await.unwrap();
    assert_eq!(seen, Address::SocketAddress(target));
    assert_eq!(user, relay.user);
    assert_eq!(client.phase(), ClientPhase::Open);

    client.close();
    relay.stop().await;
}

#[tokio::test]
async fn relays_domain_destination() {
    let mut relay = Relay::start();
    let client = relay.client();
    let target: Address = "example.com:80".parse().unwrap();

    let mut stream = within(client.connect_tcp(target.clone())).await.unwrap();
    let payload = vec![0x5a; 48 * 1024];
    let back = within(echo(&mut stream, &payload)).await;
    assert_eq!(back.len(), payload.len());
    assert!(back == payload);

    let (seen, _) = within(relay.targets.recv()).await.unwrap();
    assert_eq!(seen, target);
    relay.stop().await;
}

#[tokio::test]
async fn concurrent_streams_share_one_connection() {
    let relay = Relay::start();
    let client = relay.client();

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let mut stream = client
                .connect_tcp("10.0.0.1:8080".parse().unwrap())
                .await
                .unwrap();
            let payload = vec![i; 4096];
            let back = echo(&mut stream, &payload).await;
            assert_eq!(back, payload);
        }));
    }
    for task in tasks {
        within(task).await.unwrap();
    }

    assert_eq!(relay.transport.connect_count(), 1);
    relay.stop().await;
}

#[tokio::test]
async fn close_waits_for_open_streams() {
    let relay = Relay::start();
    let client = relay.client();

    let mut stream = within(client.connect_tcp("10.0.0.2:22".parse().unwrap()))
        .await
        .unwrap();
    client.close();
    assert_eq!(client.phase(), ClientPhase::Closing);
    assert!(matches!(
        client.connect_tcp("10.0.0.2:22".parse().unwrap()).await,
        Err(RelayError::ClientClosed)
    ));

    let back = within(echo(&mut stream, b"still flowing")).await;
    assert_eq!(back, b"still flowing");

    drop(stream);
    within(async {
        while client.phase() != ClientPhase::Closed {
            tokio::task::yield_now().await;
        }
    })
    .await;
    relay.stop().await;
}

#[tokio::test]
async fn server_shutdown_terminates_client() {
    let relay = Relay::start();
    let client = relay.client();

    let mut stream = within(client.connect_tcp("10.0.0.3:25".parse().unwrap()))
        .await
        .unwrap();
    relay.server.shutdown();

    let mut buf = [0u8; 16];
    let read = within(stream.read(&mut buf)).await;
    assert!(matches!(read, Err(_) | Ok(0)), "unexpected read {read:?}");
    within(async {
        while client.phase() != ClientPhase::Closed {
            tokio::task::yield_now().await;
        }
    })
    .await;
    assert!(matches!(
        client.connect_tcp("10.0.0.3:25".parse().unwrap()).await,
        Err(RelayError::ClientClosed)
    ));
}
