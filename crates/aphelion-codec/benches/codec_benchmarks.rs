//! Codec performance benchmarks
//!
//! Benchmarks the hot serialization paths:
//! - BPv6 serialize/parse
//! - BPv7 serialize/parse
//! - ACS run-length encoding
//!
//! Run with: cargo bench -p aphelion-codec

use std::collections::BTreeSet;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use aphelion_codec::{
    Bundle, CipherSuite, CustodyBlock, IntegrityBlock, PcfFlags, PrimaryBlock, WireVersion, admin,
    integrity, parse, serialize,
};
use aphelion_core::EndpointId;
use bytes::Bytes;

fn sample_bundle(payload_len: usize) -> Bundle {
    let payload = vec![0x5Au8; payload_len];
    Bundle {
        primary: PrimaryBlock {
            flags: PcfFlags::CUSTODY_REQUEST | PcfFlags::SINGLETON,
            destination: EndpointId::new(200, 4),
            source: EndpointId::new(100, 4),
            report_to: EndpointId::new(100, 4),
            custodian: EndpointId::new(100, 4),
            creation_secs: 1_700_000_000,
            creation_seq: 1,
            lifetime_secs: 86_400,
            fragment_offset: 0,
            total_adu_len: 0,
        },
        custody: Some(CustodyBlock {
            custody_id: 12_345,
            custodian: EndpointId::new(100, 4),
        }),
        integrity: Some(IntegrityBlock {
            suite: CipherSuite::Crc16X25,
            result: integrity::crc16(&payload).to_be_bytes().to_vec(),
        }),
        payload: Bytes::from(payload),
        unknown: Vec::new(),
    }
}

fn bench_serialize(c: &mut Criterion) {
    let bundle = sample_bundle(1024);
    for version in [WireVersion::V6, WireVersion::V7] {
        c.bench_function(&format!("serialize_{version:?}_1k"), |b| {
            b.iter(|| serialize(version, black_box(&bundle)).unwrap())
        });
    }
}

fn bench_parse(c: &mut Criterion) {
    let bundle = sample_bundle(1024);
    for version in [WireVersion::V6, WireVersion::V7] {
        let encoded = serialize(version, &bundle).unwrap();
        c.bench_function(&format!("parse_{version:?}_1k"), |b| {
            b.iter(|| parse(version, black_box(&encoded.bytes)).unwrap())
        });
    }
}

fn bench_acs_encode(c: &mut Criterion) {
    c.bench_function("acs_encode_1000_sparse", |b| {
        b.iter_batched(
            || (0..2000u64).step_by(2).collect::<BTreeSet<u64>>(),
            |mut cids| {
                while !cids.is_empty() {
                    black_box(admin::encode_acs(&mut cids, 64));
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_serialize, bench_parse, bench_acs_encode);
criterion_main!(benches);
