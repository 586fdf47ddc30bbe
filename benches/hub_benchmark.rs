//! Hub resolution and broadcast benchmarks.
//!
//! Run with: cargo bench

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use certdeliver::protocol::{Envelope, Message};
use certdeliver::server::hub::{Connection, Hub};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

fn patterns_for(i: usize) -> BTreeSet<String> {
    let mut set = BTreeSet::new();
    set.insert(format!("site{}.example.com", i));
    if i % 10 == 0 {
        set.insert("*.example.com".to_string());
    }
    set
}

/// Hub with `n` subscribers; receivers are returned so mailboxes stay open.
fn populated_hub(rt: &Runtime, n: usize) -> (Arc<Hub>, Vec<mpsc::Receiver<Envelope>>) {
    let hub = Arc::new(Hub::new());
    let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    let mut receivers = Vec::with_capacity(n);

    rt.block_on(async {
        for i in 0..n {
            let (tx, rx) = mpsc::channel(1024);
            let conn = Arc::new(Connection::new(format!("client-{}", i), addr, tx));
            hub.register(conn, patterns_for(i)).await;
            receivers.push(rx);
        }
    });
    (hub, receivers)
}

fn bench_resolve(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("hub_resolve");

    for size in [10usize, 100, 1000] {
        let (hub, _receivers) = populated_hub(&rt, size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| rt.block_on(async { black_box(hub.resolve("site5.example.com").await) }));
        });
    }
    group.finish();
}

fn bench_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("hub_broadcast");
    let envelope = Message::Ping.into_envelope_at(0).unwrap();

    for size in [10usize, 100, 1000] {
        let (hub, mut receivers) = populated_hub(&rt, size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let sent = rt.block_on(hub.broadcast("site5.example.com", envelope.clone()));
                for rx in receivers.iter_mut() {
                    while rx.try_recv().is_ok() {}
                }
                black_box(sent)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_resolve, bench_broadcast);
criterion_main!(benches);
