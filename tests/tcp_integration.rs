//! Loopback tests for the default tokio engine
//!
//! Run with: cargo test --test tcp_integration

mod common;

use common::init_tracing;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wire_connect::connection::{LifecycleState, SocketOption, StaticResolver};
use wire_connect::{ErrorKind, TcpClient, TcpServer};

#[tokio::test]
async fn test_connect_to_loopback_listener() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(&buf).await.unwrap();
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
        rest.len()
    });

    let conn = TcpClient::create()
        .remote_address(addr)
        .option(SocketOption::TcpNoDelay(true))
        .wiretap()
        .connect()
        .await
        .expect("connect");

    assert_eq!(conn.address().unwrap(), addr);
    assert_eq!(conn.state(), LifecycleState::Active);
    assert!(conn.peer_certificate_fingerprint().is_none());

    let mut io = conn.take_io().expect("io");
    assert!(conn.take_io().is_none());
    io.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    io.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    drop(io);

    conn.dispose_now(Duration::from_secs(1)).await.unwrap();
    assert!(conn.is_disposed());
    assert_eq!(server.await.unwrap(), 0);
}

#[tokio::test]
async fn test_dispose_closes_socket_under_taken_io() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 16];
        tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf)).await
    });

    let conn = TcpClient::create().remote_address(addr).connect().await.unwrap();
    let mut io = conn.take_io().expect("io");

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        let n = io.read(&mut buf).await;
        (n.map_err(|e| e.kind()), io)
    });
    tokio::task::yield_now().await;

    conn.dispose_now(Duration::from_secs(1)).await.unwrap();
    assert!(conn.is_disposed());

    let read = server.await.unwrap().expect("peer saw the close");
    assert_eq!(read.unwrap(), 0);

    let (n, mut io) = tokio::time::timeout(Duration::from_secs(1), reader)
        .await
        .expect("pending read woke up")
        .unwrap();
    assert_eq!(n, Ok(0));
    assert!(io.write_all(b"late").await.is_err());
    assert!(conn.take_io().is_none());
}

#[tokio::test]
async fn test_connect_through_static_resolver() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _accept = tokio::spawn(async move { listener.accept().await });

    let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let resolver = StaticResolver::new().with_host("service.test", [loopback]);
    let conn = TcpClient::create()
        .host("service.test")
        .port(addr.port())
        .resolver(Arc::new(resolver))
        .connect()
        .await
        .expect("connect");
    assert_eq!(conn.address().unwrap(), addr);
    conn.dispose();
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = TcpClient::create()
        .remote_address(addr)
        .connect()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connect, "{}", err);
}

#[tokio::test]
async fn test_unknown_host_fails_resolution() {
    let err = TcpClient::create()
        .host("nowhere.test")
        .resolver(Arc::new(StaticResolver::new()))
        .connect()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connect);
    assert!(err.to_string().contains("nowhere.test"));
}

#[tokio::test]
async fn test_server_echoes_each_child() {
    init_tracing();
    let served = Arc::new(AtomicUsize::new(0));
    let bound = Arc::new(AtomicUsize::new(0));
    let (s, b) = (served.clone(), bound.clone());

    let listener = TcpServer::create()
        .host("127.0.0.1")
        .port(0)
        .do_on_bound(move |_| {
            b.fetch_add(1, Ordering::SeqCst);
        })
        .handler(move |conn| {
            let s = s.clone();
            async move {
                let Some(mut io) = conn.take_io() else {
                    return Ok(());
                };
                let mut buf = [0u8; 5];
                io.read_exact(&mut buf).await?;
                io.write_all(&buf).await?;
                io.flush().await?;
                s.fetch_add(1, Ordering::SeqCst);
                Ok::<_, wire_connect::Error>(())
            }
        })
        .bind()
        .await
        .expect("bind");

    assert_eq!(bound.load(Ordering::SeqCst), 1);
    let addr: SocketAddr = listener.address().unwrap();
    assert_ne!(addr.port(), 0);

    for _ in 0..3 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    assert!(common::eventually(|| served.load(Ordering::SeqCst) == 3).await);
    assert_eq!(listener.state(), LifecycleState::Active);

    listener.dispose_now(Duration::from_secs(1)).await.unwrap();
    assert_eq!(listener.state(), LifecycleState::Disposed);
}

#[tokio::test]
async fn test_client_and_server_together() {
    let server = TcpServer::create()
        .bind_address("127.0.0.1:0".parse().unwrap())
        .handler(|conn| async move {
            if let Some(mut io) = conn.take_io() {
                io.write_all(b"welcome\n").await?;
            }
            Ok::<_, wire_connect::Error>(())
        })
        .bind()
        .await
        .unwrap();

    let conn = TcpClient::create()
        .remote_address(server.address().unwrap())
        .connect()
        .await
        .unwrap();
    let mut io = conn.take_io().unwrap();
    let mut greeting = Vec::new();
    io.read_to_end(&mut greeting).await.unwrap();
    assert_eq!(greeting, b"welcome\n");

    conn.dispose();
    server.dispose_now(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_bind_conflict_fails() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap();

    let err = TcpServer::create()
        .bind_address(addr)
        .option(SocketOption::ReuseAddress(false))
        .bind()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connect, "{}", err);
}
