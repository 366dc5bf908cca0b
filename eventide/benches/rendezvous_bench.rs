//! Benchmarks for event synchronization.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use eventide::prelude::*;

fn rendezvous_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("tokio runtime");

    c.bench_function("always_sync", |b| {
        b.iter(|| runtime.block_on(async { sync(always(black_box(42))).await }));
    });

    c.bench_function("choose_of_eight", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mut events: Vec<Event<i32>> =
                    (0..7).map(|_| never()).collect();
                events.push(always(black_box(1)));
                sync(choose(events)).await
            })
        });
    });

    c.bench_function("channel_pingpong", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let chan = Channel::new();
                let tx = chan.clone();
                let sender = tokio::spawn(async move { tx.send(7).await });
                let received = chan.recv().await;
                let _ = sender.await;
                black_box(received)
            })
        });
    });

    c.bench_function("mailbox_buffered_recv", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mailbox = Mailbox::new();
                mailbox.send(black_box(3));
                mailbox.recv().await
            })
        });
    });
}

criterion_group!(benches, rendezvous_benchmark);
criterion_main!(benches);
