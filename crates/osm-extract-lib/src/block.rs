//! Block decoding: blob payload decompression and the `PrimitiveBlock`
//! envelope (string table, primitive groups, granularity, offsets).

use std::ops::Range;
use std::sync::Mutex;

use flate2::{Decompress, FlushDecompress, Status};

use crate::blob::{
    Blob, BufferPool, BLOB_BZIP2, BLOB_LZ4, BLOB_LZMA, BLOB_RAW, BLOB_ZLIB, BLOB_ZSTD,
};
use crate::varint::{read_field, read_varint, skip_field};
use crate::{OsmError, Result};

/// Pool of resettable zlib decompressor states shared by the workers.
#[derive(Default)]
pub(crate) struct ZlibPool {
    states: Mutex<Vec<Decompress>>,
}

impl ZlibPool {
    fn get(&self) -> Decompress {
        match self.states.lock().unwrap().pop() {
            Some(mut state) => {
                state.reset(true);
                state
            }
            None => Decompress::new(true),
        }
    }

    fn put(&self, state: Decompress) {
        self.states.lock().unwrap().push(state);
    }
}

/// A materialized `PrimitiveBlock`: the owning byte buffer plus ranges for
/// the string table and each primitive group.
#[derive(Debug)]
pub(crate) struct Block {
    pub granularity: i64,
    pub lat_offset: i64,
    pub lon_offset: i64,
    string_table: Range<usize>,
    groups: Vec<Range<usize>>,
    data: Vec<u8>,
}

impl Block {
    /// Decompresses `blob` if needed and parses the block envelope.
    pub fn decode(blob: Blob, buffers: &BufferPool, zlib: &ZlibPool) -> Result<Block> {
        let (data, body) = match blob.compression {
            BLOB_RAW => {
                let body = blob.payload.clone();
                (blob.buf, body)
            }
            BLOB_ZLIB => {
                let out = inflate(blob.payload(), blob.raw_size, buffers, zlib)?;
                let body = 0..out.len();
                buffers.put(blob.buf);
                (out, body)
            }
            BLOB_LZMA => return Err(OsmError::UnsupportedCompression("LZMA")),
            BLOB_BZIP2 => return Err(OsmError::UnsupportedCompression("bzip2")),
            BLOB_LZ4 => return Err(OsmError::UnsupportedCompression("LZ4")),
            BLOB_ZSTD => return Err(OsmError::UnsupportedCompression("Zstandard")),
            _ => return Err(OsmError::UnsupportedCompression("unknown")),
        };

        let buf = &data[body.clone()];
        let base = body.start;
        let mut i = 0;
        let mut string_table: Option<Range<usize>> = None;
        let mut groups = Vec::new();
        let mut granularity = 100i64;
        let mut lat_offset = 0i64;
        let mut lon_offset = 0i64;

        while i < buf.len() {
            let (field, wire, n) = read_field(&buf[i..]);
            i += n;
            if n == 0 || field == 0 {
                return Err(OsmError::invalid_field("PrimitiveBlock", field));
            }
            match field {
                1 => {
                    // stringtable
                    if wire != 2 {
                        return Err(OsmError::invalid_field("PrimitiveBlock", field));
                    }
                    let (size, n) = read_varint(&buf[i..]);
                    i += n;
                    let size = size as usize;
                    if n == 0 || size > buf.len() - i {
                        return Err(OsmError::invalid_field("PrimitiveBlock", field));
                    }
                    string_table = Some(base + i..base + i + size);
                    i += size;
                }
                2 => {
                    // primitivegroup
                    if wire != 2 {
                        return Err(OsmError::invalid_field("PrimitiveBlock", field));
                    }
                    let (size, n) = read_varint(&buf[i..]);
                    i += n;
                    let size = size as usize;
                    if n == 0 || size > buf.len() - i {
                        return Err(OsmError::invalid_field("PrimitiveBlock", field));
                    }
                    if size > 0 {
                        groups.push(base + i..base + i + size);
                    }
                    i += size;
                }
                17 | 19 | 20 => {
                    // granularity, lat_offset, lon_offset
                    let (val, n) = read_varint(&buf[i..]);
                    i += n;
                    if n == 0 {
                        return Err(OsmError::invalid_field("PrimitiveBlock", field));
                    }
                    match field {
                        17 => granularity = val as i64,
                        19 => lat_offset = val as i64,
                        _ => lon_offset = val as i64,
                    }
                }
                _ => {
                    let n = skip_field(&buf[i..], wire);
                    if n == 0 {
                        return Err(OsmError::invalid_field("PrimitiveBlock", field));
                    }
                    i = i.saturating_add(n);
                }
            }
        }

        let string_table = match string_table {
            Some(range) if i == buf.len() => range,
            _ => return Err(OsmError::invalid_field("PrimitiveBlock", 0)),
        };

        Ok(Block {
            granularity,
            lat_offset,
            lon_offset,
            string_table,
            groups,
            data,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn string_table_bytes(&self) -> &[u8] {
        &self.data[self.string_table.clone()]
    }

    pub fn string_table_span(&self) -> Range<usize> {
        self.string_table.clone()
    }

    pub fn groups(&self) -> impl Iterator<Item = &[u8]> {
        self.groups.iter().map(|range| &self.data[range.clone()])
    }

    /// Hands the backing buffer back for pooling.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Inflates a zlib payload into a pooled buffer of `raw_size` bytes, or of
/// whatever the stream yields when the size was not declared.
fn inflate(
    input: &[u8],
    raw_size: usize,
    buffers: &BufferPool,
    zlib: &ZlibPool,
) -> Result<Vec<u8>> {
    let mut state = zlib.get();
    let mut out = buffers.get_with_capacity(if raw_size > 0 { raw_size } else { 64 * 1024 });
    let mut remaining = input;

    loop {
        let before = state.total_in();
        let status = state
            .decompress_vec(remaining, &mut out, FlushDecompress::Finish)
            .map_err(|_| OsmError::invalid_field("Blob zlib data", BLOB_ZLIB))?;
        let consumed = (state.total_in() - before) as usize;
        remaining = &remaining[consumed..];

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if out.len() == out.capacity() {
                    out.reserve(out.capacity().max(4096));
                } else if remaining.is_empty() {
                    // Input exhausted without reaching the stream end.
                    return Err(OsmError::invalid_field("Blob zlib data", BLOB_ZLIB));
                }
            }
        }
    }
    zlib.put(state);

    if raw_size > 0 && out.len() != raw_size {
        return Err(OsmError::invalid_field("Blob zlib data", BLOB_ZLIB));
    }
    Ok(out)
}
