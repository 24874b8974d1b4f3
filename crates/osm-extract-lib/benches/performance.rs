//! Performance benchmarks for osm-extract-lib
//!
//! Run with: cargo bench --package osm-extract-lib

use std::collections::HashMap;
use std::io::Cursor;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use osm_extract_lib::{CancelToken, Node, Parser, U64Map, read_varint};

fn encode_varint(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(b);
            return;
        }
        out.push(b | 0x80);
    }
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn bytes_field(out: &mut Vec<u8>, field: u64, data: &[u8]) {
    encode_varint(field << 3 | 2, out);
    encode_varint(data.len() as u64, out);
    out.extend_from_slice(data);
}

/// Builds a single-blob PBF file holding `count` dense nodes.
fn synthesize_file(count: usize) -> Vec<u8> {
    let mut ids = Vec::new();
    let mut lats = Vec::new();
    let mut lons = Vec::new();
    let mut key_vals = Vec::new();
    let mut prev_lat = 0i64;
    let mut prev_lon = 0i64;
    for i in 0..count {
        encode_varint(zigzag(1), &mut ids); // ids 1, 2, 3, ...
        let lat = 530_000_000 + (i as i64 % 1000) * 100;
        let lon = 65_000_000 + (i as i64 % 1000) * 100;
        encode_varint(zigzag(lat - prev_lat), &mut lats);
        encode_varint(zigzag(lon - prev_lon), &mut lons);
        encode_varint(0, &mut key_vals);
        prev_lat = lat;
        prev_lon = lon;
    }

    let mut dense = Vec::new();
    bytes_field(&mut dense, 1, &ids);
    bytes_field(&mut dense, 8, &lats);
    bytes_field(&mut dense, 9, &lons);
    bytes_field(&mut dense, 10, &key_vals);

    let mut group = Vec::new();
    bytes_field(&mut group, 2, &dense);

    let mut table = Vec::new();
    bytes_field(&mut table, 1, b"");

    let mut block = Vec::new();
    bytes_field(&mut block, 1, &table);
    bytes_field(&mut block, 2, &group);

    let mut blob = Vec::new();
    bytes_field(&mut blob, 1, &block); // raw payload

    let mut header = Vec::new();
    bytes_field(&mut header, 1, b"OSMData");
    encode_varint(3 << 3, &mut header);
    encode_varint(blob.len() as u64, &mut header);

    let mut file = Vec::new();
    file.extend_from_slice(&(header.len() as u32).to_be_bytes());
    file.extend_from_slice(&header);
    file.extend_from_slice(&blob);
    file
}

fn bench_varint(c: &mut Criterion) {
    let mut group = c.benchmark_group("varint");

    // A mix of short and long encodings.
    let mut buf = Vec::new();
    let mut count = 0u64;
    for i in 0..100_000u64 {
        encode_varint(i.wrapping_mul(0x9e37_79b9) >> (i % 48), &mut buf);
        count += 1;
    }

    group.throughput(Throughput::Elements(count));
    group.bench_function("decode_mixed", |b| {
        b.iter(|| {
            let mut i = 0;
            let mut sum = 0u64;
            while i < buf.len() {
                let (v, n) = read_varint(&buf[i..]);
                sum = sum.wrapping_add(v);
                i += n;
            }
            sum
        });
    });

    group.finish();
}

fn bench_dense_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("u64map");
    const N: u64 = 100_000;

    group.throughput(Throughput::Elements(N));
    group.bench_function("fill_dense", |b| {
        b.iter(|| {
            let mut m = U64Map::new(2048, 0.6);
            for i in 1..=N {
                m.insert(i.wrapping_mul(0x9e37_79b9), i);
            }
            m.len()
        });
    });
    group.bench_function("fill_std", |b| {
        b.iter(|| {
            let mut m: HashMap<u64, u64> = HashMap::with_capacity(2048);
            for i in 1..=N {
                m.insert(i.wrapping_mul(0x9e37_79b9), i);
            }
            m.len()
        });
    });

    let mut dense = U64Map::new(2048, 0.6);
    for i in 1..=N {
        dense.insert(i.wrapping_mul(0x9e37_79b9), i);
    }
    group.bench_function("get_dense", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for i in 1..=N {
                if let Some(v) = dense.get(i.wrapping_mul(0x9e37_79b9)) {
                    sum = sum.wrapping_add(v);
                }
            }
            sum
        });
    });

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.sample_size(20);

    const NODES: usize = 50_000;
    let file = synthesize_file(NODES);
    group.throughput(Throughput::Elements(NODES as u64));
    group.bench_function("dense_nodes_50k", |b| {
        b.iter(|| {
            let mut parser = Parser::new(Cursor::new(file.clone()));
            let count = std::sync::atomic::AtomicU64::new(0);
            let nodes = |_: &Node<'_>| {
                count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            };
            parser
                .parse(&CancelToken::new(), Some(&nodes), None, None)
                .unwrap();
            count.into_inner()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_varint, bench_dense_map, bench_parse);
criterion_main!(benches);
