use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use std::time::{Duration, Instant};
use tandem_core::{History, HistoryConfig, Origin, ReplicatedText};

fn bench_local_keystroke(c: &mut Criterion) {
    let mut group = c.benchmark_group("CRDT Operations");
    group.throughput(Throughput::Elements(1));

    group.bench_function("mutate_local_append", |b| {
        // Appending to an ever-growing document, one character per iteration.
        let mut text = ReplicatedText::with_text("# Notes\n");
        let mut buf = text.to_string();
        b.iter(|| {
            buf.push('x');
            black_box(text.mutate_local(black_box(&buf), Origin::Local));
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("CRDT Operations");
    group.throughput(Throughput::Elements(1));

    let mut source = ReplicatedText::new();
    let update = source
        .mutate_local("A paragraph typed by a collaborator.", Origin::Local)
        .unwrap();

    group.bench_function("apply_remote_update", |b| {
        // Same update each iteration: measures the idempotent path after the first.
        let mut dest = ReplicatedText::new();
        b.iter(|| {
            dest.apply_remote(black_box(&update)).unwrap();
        })
    });

    group.finish();
}

fn bench_history_typing(c: &mut Criterion) {
    c.bench_function("history_set_content_burst_100", |b| {
        b.iter(|| {
            let start = Instant::now();
            let mut history = History::new("", HistoryConfig::default());
            let mut buf = String::new();
            for i in 0..100u64 {
                buf.push('a');
                let now = start + Duration::from_millis(i * 10);
                history.set_content(buf.clone(), Origin::Local, now);
                history.poll(now);
            }
            black_box(history.flush());
        })
    });
}

criterion_group!(benches, bench_local_keystroke, bench_apply_remote, bench_history_typing);
criterion_main!(benches);
