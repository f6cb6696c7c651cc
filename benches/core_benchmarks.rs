//! Benchmarks for the hot paths of live distribution

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rdio_core::{Command, LiveFeedMatrix, Message, Scope};
use serde_json::json;
use std::hint::black_box;

/// Scope checks run once per session per call
fn bench_scope(c: &mut Criterion) {
    let mut group = c.benchmark_group("scope");

    let entries: Vec<_> = (0..50u32)
        .map(|system| json!({"id": system, "talkgroups": (0..200u32).map(|t| system * 1000 + t).collect::<Vec<_>>()}))
        .collect();
    let scope = Scope::from_value(&json!(entries));

    for (system, talkgroup) in [(0u32, 5u32), (49, 49_199), (60, 1)] {
        group.bench_with_input(
            BenchmarkId::new("has_access", format!("{system}/{talkgroup}")),
            &(system, talkgroup),
            |b, &(system, talkgroup)| b.iter(|| scope.has_access(black_box(system), black_box(talkgroup))),
        );
    }

    group.finish();
}

/// Matrix checks including patch fallbacks
fn bench_livefeed(c: &mut Criterion) {
    let mut group = c.benchmark_group("livefeed");

    let payload: serde_json::Map<String, serde_json::Value> = (0..20u32)
        .map(|system| {
            let talkgroups: serde_json::Map<String, serde_json::Value> = (0..500u32)
                .map(|talkgroup| (talkgroup.to_string(), json!(talkgroup % 3 == 0)))
                .collect();
            (system.to_string(), serde_json::Value::Object(talkgroups))
        })
        .collect();
    let matrix = LiveFeedMatrix::from_value(Some(&serde_json::Value::Object(payload)));
    let patches: Vec<u32> = (1..10).map(|p| p * 3 + 1).collect();

    group.bench_function("admits_direct", |b| {
        b.iter(|| matrix.admits(black_box(7), black_box(300), &[]));
    });
    group.bench_function("admits_patched", |b| {
        b.iter(|| matrix.admits(black_box(7), black_box(301), black_box(&patches)));
    });

    group.finish();
}

/// Envelope encode / decode
fn bench_protocol(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol");

    let frames = [
        r#"["VER"]"#,
        r#"["PIN","MTIzNA=="]"#,
        r#"["CAL",42,"d"]"#,
        r#"["LFM",{"1":{"10":true,"20":false},"2":{"200":true}}]"#,
    ];

    group.throughput(Throughput::Elements(frames.len() as u64));
    group.bench_function("decode_batch", |b| {
        b.iter(|| {
            frames
                .iter()
                .filter_map(|frame| Message::decode(black_box(frame)).ok())
                .count()
        });
    });

    let message = Message::new(Command::ListCalls)
        .with_payload(json!({"count": 2, "results": [{"id": 1}, {"id": 2}]}))
        .with_flag(Some(json!(1)));
    group.bench_function("encode", |b| b.iter(|| black_box(&message).encode()));

    group.finish();
}

criterion_group!(benches, bench_scope, bench_livefeed, bench_protocol);
criterion_main!(benches);
