use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_keyblob::{
    crypto::SoftwareCrypto,
    keyblob::{EngineConfig, KeyBlobEngine},
    param::{Param, ParamSet, Tag},
    rkc::StaticMainKey,
    storage::encode_file_name,
    KeyAlg, KeyFlag, KeyPurpose, ProcessIdentity,
};
use std::sync::Arc;
use std::time::Duration;

fn engine(iterations: u32) -> KeyBlobEngine {
    KeyBlobEngine::new(
        Arc::new(SoftwareCrypto::new()),
        Arc::new(StaticMainKey::new(vec![7u8; 32]).unwrap()),
        EngineConfig {
            kdf_iterations: iterations,
            allow_weak_kdf: true,
            ..EngineConfig::default()
        },
    )
    .unwrap()
}

fn params() -> ParamSet {
    ParamSet::from_params(&[
        Param::uint(Tag::ALGORITHM, KeyAlg::Aes.as_u32()),
        Param::uint(Tag::PURPOSE, (KeyPurpose::ENCRYPT | KeyPurpose::DECRYPT).bits()),
        Param::uint(Tag::KEY_SIZE, 256),
        Param::bytes(Tag::KEY_ALIAS, b"bench".to_vec()),
    ])
    .unwrap()
}

/// Build and parse at the production and a reduced iteration count
fn bench_key_blob(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_blob");
    group.measurement_time(Duration::from_secs(10));
    let identity = ProcessIdentity::new("0", "bench").unwrap();
    let gen = params();

    for iterations in [1_000u32, 10_000] {
        let engine = engine(iterations);
        group.bench_function(format!("build_{iterations}"), |b| {
            b.iter(|| {
                engine
                    .build_key_blob(b"bench", KeyFlag::Generate, black_box(&[0x42; 32]), &gen, &identity)
                    .unwrap()
            });
        });

        let blob = engine
            .build_key_blob(b"bench", KeyFlag::Generate, &[0x42; 32], &gen, &identity)
            .unwrap();
        group.bench_function(format!("parse_{iterations}"), |b| {
            b.iter(|| engine.parse_key_blob(black_box(&blob), &identity).unwrap());
        });
    }

    group.finish();
}

fn bench_param_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("param_set");
    let bytes = params().to_bytes().unwrap();

    group.bench_function("serialize", |b| {
        let set = params();
        b.iter(|| black_box(&set).to_bytes().unwrap());
    });
    group.bench_function("parse", |b| {
        b.iter(|| ParamSet::from_bytes(black_box(&bytes)).unwrap());
    });
    group.bench_function("encode_file_name", |b| {
        let alias: Vec<u8> = (0u8..64).map(|i| i.wrapping_mul(37)).collect();
        b.iter(|| encode_file_name(black_box(&alias)));
    });

    group.finish();
}

criterion_group!(benches, bench_key_blob, bench_param_set);
criterion_main!(benches);
