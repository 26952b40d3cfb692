//! Fan-out benchmarks for Surge.
//!
//! These benchmarks measure how fast the hub copies one message into many
//! connection mailboxes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::{Duration, Instant};
use surge_core::{
    mailbox, CloseSignal, ConnectionHandle, Hub, HubConfig, HubHandle, MailboxReceiver, Message,
    Registration, SessionCloser,
};
use tokio::runtime::Runtime;

struct Subscribers {
    receivers: Vec<MailboxReceiver>,
    _registrations: Vec<Registration>,
}

fn subscribe(hub: &HubHandle, count: usize, capacity: usize) -> Subscribers {
    let mut receivers = Vec::with_capacity(count);
    let mut registrations = Vec::with_capacity(count);
    for i in 0..count {
        let (tx, rx) = mailbox(capacity);
        let closer: Arc<dyn SessionCloser> = Arc::new(CloseSignal::new());
        let handle = ConnectionHandle::new(format!("conn-{}", i).into(), tx, closer);
        registrations.push(hub.register(handle).expect("hub running"));
        receivers.push(rx);
    }
    Subscribers {
        receivers,
        _registrations: registrations,
    }
}

/// Benchmark broadcast plus delivery to every subscriber.
fn bench_fanout(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("fanout");

    for size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let (hub, _task) = Hub::spawn(HubConfig::default());
                    let mut subscribers = subscribe(&hub, size, 64);
                    let message = Message::new(vec![0u8; 64]);

                    let start = Instant::now();
                    for _ in 0..iters {
                        hub.broadcast(black_box(message.clone())).await.unwrap();
                        for rx in &mut subscribers.receivers {
                            black_box(rx.recv().await);
                        }
                    }
                    let elapsed = start.elapsed();

                    hub.shutdown();
                    elapsed
                })
            });
        });
    }

    group.finish();
}

/// Benchmark broadcasting into mailboxes nobody drains.
///
/// Every subscriber is evicted once its mailbox fills, so this measures the
/// eviction path as well as plain delivery.
fn bench_overflow(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("overflow");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("100_sub_capacity_4", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let (hub, _task) = Hub::spawn(HubConfig::default());
                let _subscribers = subscribe(&hub, 100, 4);

                let start = Instant::now();
                for _ in 0..iters {
                    hub.broadcast(Message::new(vec![0u8; 64])).await.unwrap();
                }
                hub.stats().await.unwrap();
                let elapsed = start.elapsed();

                hub.shutdown();
                elapsed
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_fanout, bench_overflow);
criterion_main!(benches);
