// packages/engine/benches/recording_bench.rs
//! Block writing and session discrimination throughput

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use quoll_engine::discrimination::{
    CallOutboundMatcherCnf, Discriminate, Discriminator, DiscriminatorConfig, PatternGroup,
    SessionMatcherCnf,
};
use quoll_engine::recording::compressor::Lz4Compressor;
use quoll_engine::recording::codec::append_entry;
use quoll_engine::recording::{Store, StoreConfig};
use std::collections::BTreeMap;

const SESSION: &str = r#"{"CallFromInbound":{"Request":"\\x0bQREQUEST_URI/test\\x0c2DOCUMENT_URI"},"ReturnInbound":{"Response":"product_id=3&combo_type=1"},"Actions":[{"ActionType":"CallOutbound","ServiceName":"passport","Request":"{\"user_role\":\"driver\"}","Response":"{\"user_type\":\"normal\"}"}]}"#;

fn patterns(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn bench_block_compression(c: &mut Criterion) {
    let mut raw = Vec::new();
    for i in 0..1000u32 {
        append_entry(&mut raw, i, SESSION.as_bytes());
    }

    let mut group = c.benchmark_group("block");
    group.throughput(Throughput::Bytes(raw.len() as u64));
    group.bench_function("lz4_compress_1000_entries", |b| {
        let mut compressor = Lz4Compressor::new();
        b.iter(|| black_box(compressor.compress(black_box(&raw)).map(|out| out.len())))
    });
    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(StoreConfig {
        root_dir: dir.path().to_path_buf(),
        queue_capacity: 1000,
        ..StoreConfig::default()
    })
    .unwrap();
    let mut writer = store.writer();

    let mut group = c.benchmark_group("store");
    group.throughput(Throughput::Elements(1000));
    group.bench_function("add_and_flush_1000", |b| {
        b.iter_batched(
            || {
                for _ in 0..1000 {
                    store.add(SESSION.as_bytes()).unwrap();
                }
            },
            |_| writer.flush_input_queue().unwrap(),
            BatchSize::PerIteration,
        )
    });
    group.finish();
}

fn bench_pattern_group(c: &mut Criterion) {
    let pg = PatternGroup::compile(&patterns(&[
        ("product_id", r"product_id=(\d+)"),
        ("combo_type", r"combo_type=(\d+)"),
        ("missing", r"absent=(\w+)"),
    ]))
    .unwrap();

    c.bench_function("pattern_group_find", |b| {
        b.iter(|| black_box(pg.find(black_box(b"product_id=3&combo_type=1")).len()))
    });
}

fn bench_scene_of(c: &mut Criterion) {
    let mut discr = Discriminator::standalone(&DiscriminatorConfig::default());
    discr
        .update_session_matcher(&SessionMatcherCnf {
            session_type: "/test".to_string(),
            keep_n_sessions_per_scene: 1,
            inbound_response_patterns: patterns(&[("product_id", r"product_id=(\d+)")]),
            call_outbounds: vec![CallOutboundMatcherCnf {
                service_name: "passport".to_string(),
                request_patterns: patterns(&[("user_role", r#""user_role":\s*"(\w+)""#)]),
                response_patterns: BTreeMap::new(),
            }],
            ..Default::default()
        })
        .unwrap();

    c.bench_function("scene_of", |b| {
        b.iter(|| black_box(discr.scene_of(black_box(SESSION.as_bytes()))))
    });
}

criterion_group!(
    benches,
    bench_block_compression,
    bench_flush,
    bench_pattern_group,
    bench_scene_of
);
criterion_main!(benches);
