//! In-memory PBF builders for tests: enough of the write path to frame
//! blobs and encode primitive blocks the decoder understands.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::blob::{BLOB_RAW, BLOB_ZLIB};
use crate::element::ElementKind;

pub(crate) fn put_varint(out: &mut Vec<u8>, mut v: u64) {
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

pub(crate) fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn put_tag(out: &mut Vec<u8>, field: u64, wire: u8) {
    put_varint(out, field << 3 | wire as u64);
}

fn put_bytes_field(out: &mut Vec<u8>, field: u64, data: &[u8]) {
    put_tag(out, field, 2);
    put_varint(out, data.len() as u64);
    out.extend_from_slice(data);
}

fn put_varint_field(out: &mut Vec<u8>, field: u64, v: u64) {
    put_tag(out, field, 0);
    put_varint(out, v);
}

fn put_packed_varints(out: &mut Vec<u8>, field: u64, values: impl Iterator<Item = u64>) {
    let mut packed = Vec::new();
    for v in values {
        put_varint(&mut packed, v);
    }
    put_bytes_field(out, field, &packed);
}

fn put_packed_deltas(out: &mut Vec<u8>, field: u64, values: &[i64]) {
    let mut packed = Vec::new();
    let mut prev = 0i64;
    for &v in values {
        put_varint(&mut packed, zigzag(v - prev));
        prev = v;
    }
    put_bytes_field(out, field, &packed);
}

/// Degrees to wire units at the default granularity of 100 nanodegrees.
fn to_raw(degrees: f64) -> i64 {
    (degrees * 1e7).round() as i64
}

/// Builds a `PrimitiveBlock` with a shared string table and one primitive
/// group per `dense_nodes`/`ways`/`relations` call.
pub(crate) struct BlockBuilder {
    strings: Vec<Vec<u8>>,
    groups: Vec<Vec<u8>>,
}

impl BlockBuilder {
    pub fn new() -> BlockBuilder {
        BlockBuilder {
            // Index 0 is reserved as the dense key/value separator.
            strings: vec![Vec::new()],
            groups: Vec::new(),
        }
    }

    fn intern(&mut self, s: &str) -> u64 {
        if let Some(i) = self.strings.iter().position(|v| v == s.as_bytes()) {
            return i as u64;
        }
        self.strings.push(s.as_bytes().to_vec());
        (self.strings.len() - 1) as u64
    }

    pub fn dense_nodes(&mut self, nodes: &[(u64, f64, f64, &[(&str, &str)])]) {
        let ids: Vec<i64> = nodes.iter().map(|n| n.0 as i64).collect();
        let lons: Vec<i64> = nodes.iter().map(|n| to_raw(n.1)).collect();
        let lats: Vec<i64> = nodes.iter().map(|n| to_raw(n.2)).collect();

        let mut key_vals = Vec::new();
        for (_, _, _, tags) in nodes {
            for (k, v) in *tags {
                let k = self.intern(k);
                let v = self.intern(v);
                put_varint(&mut key_vals, k);
                put_varint(&mut key_vals, v);
            }
            put_varint(&mut key_vals, 0);
        }

        let mut dense = Vec::new();
        put_packed_deltas(&mut dense, 1, &ids);
        put_packed_deltas(&mut dense, 8, &lats);
        put_packed_deltas(&mut dense, 9, &lons);
        put_bytes_field(&mut dense, 10, &key_vals);

        let mut group = Vec::new();
        put_bytes_field(&mut group, 2, &dense);
        self.groups.push(group);
    }

    pub fn ways(&mut self, ways: &[(u64, &[u64], &[(&str, &str)])]) {
        let mut group = Vec::new();
        for (id, refs, tags) in ways {
            let keys: Vec<u64> = tags.iter().map(|(k, _)| self.intern(k)).collect();
            let vals: Vec<u64> = tags.iter().map(|(_, v)| self.intern(v)).collect();

            let mut way = Vec::new();
            put_varint_field(&mut way, 1, *id);
            put_packed_varints(&mut way, 2, keys.into_iter());
            put_packed_varints(&mut way, 3, vals.into_iter());
            let refs: Vec<i64> = refs.iter().map(|&r| r as i64).collect();
            put_packed_deltas(&mut way, 8, &refs);
            put_bytes_field(&mut group, 3, &way);
        }
        self.groups.push(group);
    }

    pub fn relations(&mut self, relations: &[(u64, &[(ElementKind, u64, &str)], &[(&str, &str)])]) {
        let mut group = Vec::new();
        for (id, members, tags) in relations {
            let keys: Vec<u64> = tags.iter().map(|(k, _)| self.intern(k)).collect();
            let vals: Vec<u64> = tags.iter().map(|(_, v)| self.intern(v)).collect();
            let roles: Vec<u64> = members.iter().map(|(_, _, r)| self.intern(r)).collect();

            let mut relation = Vec::new();
            put_varint_field(&mut relation, 1, *id);
            put_packed_varints(&mut relation, 2, keys.into_iter());
            put_packed_varints(&mut relation, 3, vals.into_iter());
            put_packed_varints(&mut relation, 8, roles.into_iter());
            let memids: Vec<i64> = members.iter().map(|(_, id, _)| *id as i64).collect();
            put_packed_deltas(&mut relation, 9, &memids);
            put_packed_varints(
                &mut relation,
                10,
                members.iter().map(|(kind, _, _)| match kind {
                    ElementKind::Node => 0,
                    ElementKind::Way => 1,
                    ElementKind::Relation => 2,
                }),
            );
            put_bytes_field(&mut group, 4, &relation);
        }
        self.groups.push(group);
    }

    pub fn build(&self) -> Vec<u8> {
        let mut table = Vec::new();
        for s in &self.strings {
            put_bytes_field(&mut table, 1, s);
        }

        let mut block = Vec::new();
        put_bytes_field(&mut block, 1, &table);
        for group in &self.groups {
            put_bytes_field(&mut block, 2, group);
        }
        block
    }
}

fn frame(blob_type: &str, blob: &[u8]) -> Vec<u8> {
    let mut header = Vec::new();
    put_bytes_field(&mut header, 1, blob_type.as_bytes());
    put_varint_field(&mut header, 3, blob.len() as u64);

    let mut out = Vec::new();
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(blob);
    out
}

/// Frames `block` as an `OSMData` blob, optionally zlib-compressed.
pub(crate) fn data_blob(block: &[u8], zlib: bool) -> Vec<u8> {
    let mut blob = Vec::new();
    if zlib {
        put_varint_field(&mut blob, 2, block.len() as u64);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(block).unwrap();
        let compressed = encoder.finish().unwrap();
        put_bytes_field(&mut blob, BLOB_ZLIB, &compressed);
    } else {
        put_bytes_field(&mut blob, BLOB_RAW, block);
    }
    frame("OSMData", &blob)
}

/// Frames `block` as an `OSMData` blob with an arbitrary payload field
/// number, for exercising unsupported compressions.
pub(crate) fn data_blob_with_field(block: &[u8], field: u64) -> Vec<u8> {
    let mut blob = Vec::new();
    put_varint_field(&mut blob, 2, block.len() as u64);
    put_bytes_field(&mut blob, field, block);
    frame("OSMData", &blob)
}

/// A minimal `OSMHeader` blob; its payload is read and discarded.
pub(crate) fn header_blob() -> Vec<u8> {
    let mut blob = Vec::new();
    put_bytes_field(&mut blob, BLOB_RAW, &[]);
    frame("OSMHeader", &blob)
}
