//! Benchmarks for chain composition and connect overhead
//!
//! Measures:
//! - Cost of deriving a client (one more node)
//! - Cost of `configure()` for chains of growing length
//! - Full connect/dispose round trip against a loopback listener
//!
//! Run with: cargo bench --bench chain_benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;
use tokio::runtime::Runtime;
use wire_connect::connection::SocketOption;
use wire_connect::{TcpClient, TcpServer};

// ============================================================================
// Composition
// ============================================================================

fn composition_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("composition");

    let base = TcpClient::create().host("example.com").port(443);
    group.bench_function("derive_one_node", |b| {
        b.iter(|| black_box(base.option(SocketOption::TcpNoDelay(true))))
    });

    for depth in [1usize, 8, 32, 128] {
        let client = (0..depth).fold(TcpClient::create(), |client, i| {
            client.port(1000 + i as u16)
        });
        group.bench_with_input(BenchmarkId::new("configure", depth), &client, |b, client| {
            b.iter(|| black_box(client.configure()))
        });
    }

    group.finish();
}

// ============================================================================
// Connect round trip
// ============================================================================

fn connect_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let listener = rt
        .block_on(
            TcpServer::create()
                .host("127.0.0.1")
                .port(0)
                .handler(|_conn| async { Ok::<_, wire_connect::Error>(()) })
                .bind(),
        )
        .expect("bind");
    let addr = listener.address().expect("listener address");
    let client = TcpClient::create()
        .remote_address(addr)
        .option(SocketOption::TcpNoDelay(true));

    let mut group = c.benchmark_group("connect");
    group.measurement_time(Duration::from_secs(5));
    group.bench_function("loopback_connect_dispose", |b| {
        b.to_async(&rt).iter(|| async {
            let conn = client.connect().await.expect("connect");
            conn.dispose_now(Duration::from_secs(1))
                .await
                .expect("dispose");
        })
    });
    group.finish();

    listener.dispose();
}

criterion_group!(benches, composition_benchmarks, connect_benchmarks);
criterion_main!(benches);
