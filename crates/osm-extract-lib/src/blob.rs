//! Blob framing: length-prefixed `BlobHeader`/`Blob` records.
//!
//! A PBF file is a concatenation of `(u32 length, BlobHeader, Blob)` triples.
//! The framer runs on the reader thread, validates sizes, extracts the
//! payload field, and hands whole `OSMData` blobs to workers; `OSMHeader`
//! and unknown blob types are read and discarded.

use std::io::Read;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::varint::{read_field, read_varint, skip_field};
use crate::{OsmError, Result};

/// Maximum encoded `BlobHeader` length.
pub const MAX_BLOB_HEADER_SIZE: usize = 64 * 1024;
/// Maximum `Blob` size, compressed or raw.
pub const MAX_BLOB_SIZE: usize = 32 * 1024 * 1024;

/// Payload field numbers of the `Blob` message. Only raw and zlib payloads
/// are decoded; the rest surface as typed errors at block-decode time.
pub(crate) const BLOB_RAW: u64 = 1;
pub(crate) const BLOB_ZLIB: u64 = 3;
pub(crate) const BLOB_LZMA: u64 = 4;
pub(crate) const BLOB_BZIP2: u64 = 5;
pub(crate) const BLOB_LZ4: u64 = 6;
pub(crate) const BLOB_ZSTD: u64 = 7;

/// A framed `OSMData` blob, holding the full `Blob` message bytes and the
/// range of the payload field within them.
#[derive(Debug)]
pub(crate) struct Blob {
    /// Payload field number (`BLOB_RAW`, `BLOB_ZLIB`, ...).
    pub compression: u64,
    pub buf: Vec<u8>,
    pub payload: Range<usize>,
    /// Uncompressed size when declared, 0 otherwise.
    pub raw_size: usize,
    /// Position of this blob in the file's frame sequence.
    pub index: usize,
    /// Encoded blob size, credited to the progress counter once consumed.
    pub datasize: u64,
}

impl Blob {
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload.clone()]
    }
}

/// Shared free-list of byte buffers, resized in place on reuse.
#[derive(Default)]
pub(crate) struct BufferPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// A zeroed buffer of exactly `len` bytes.
    pub fn get(&self, len: usize) -> Vec<u8> {
        let mut buf = self.bufs.lock().unwrap().pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// An empty buffer with at least `capacity` bytes reserved.
    pub fn get_with_capacity(&self, capacity: usize) -> Vec<u8> {
        let mut buf = self.bufs.lock().unwrap().pop().unwrap_or_default();
        buf.clear();
        buf.reserve(capacity);
        buf
    }

    pub fn put(&self, buf: Vec<u8>) {
        self.bufs.lock().unwrap().push(buf);
    }
}

/// Sequential frame reader over the input stream. Advances the shared byte
/// position counter as frames are consumed so progress can be polled
/// concurrently.
pub(crate) struct BlobReader<'a, R> {
    input: &'a mut R,
    pos: &'a AtomicU64,
    pool: &'a BufferPool,
    header_buf: Vec<u8>,
    index: usize,
}

impl<'a, R: Read> BlobReader<'a, R> {
    pub fn new(input: &'a mut R, pos: &'a AtomicU64, pool: &'a BufferPool) -> BlobReader<'a, R> {
        BlobReader {
            input,
            pos,
            pool,
            header_buf: Vec::new(),
            index: 0,
        }
    }

    /// Reads frames until the next `OSMData` blob. Returns `None` at a clean
    /// end of stream.
    pub fn next_blob(&mut self) -> Result<Option<Blob>> {
        loop {
            let mut len_buf = [0u8; 4];
            if !read_or_eof(&mut *self.input, &mut len_buf)? {
                return Ok(None);
            }
            let header_len = u32::from_be_bytes(len_buf) as usize;
            if header_len > MAX_BLOB_HEADER_SIZE {
                return Err(OsmError::OversizeBlobHeader);
            }

            self.header_buf.resize(header_len, 0);
            read_exact(&mut *self.input, &mut self.header_buf)?;
            let (is_data, datasize) = parse_blob_header(&self.header_buf)?;
            self.pos.fetch_add(4 + header_len as u64, Ordering::Relaxed);

            let mut buf = self.pool.get(datasize);
            read_exact(&mut *self.input, &mut buf)?;
            let index = self.index;
            self.index += 1;

            if datasize == 0 || !is_data {
                // The discarded body is consumed here, so credit it now.
                self.pos.fetch_add(datasize as u64, Ordering::Relaxed);
                self.pool.put(buf);
                continue;
            }

            let (compression, payload, raw_size) = parse_blob(&buf)?;
            return Ok(Some(Blob {
                compression,
                buf,
                payload,
                raw_size,
                index,
                datasize: datasize as u64,
            }));
        }
    }
}

/// Parses a `BlobHeader`, returning whether the blob carries `OSMData` and
/// its declared size.
fn parse_blob_header(buf: &[u8]) -> Result<(bool, usize)> {
    let mut i = 0;
    let mut typ: Option<&[u8]> = None;
    let mut datasize: Option<usize> = None;

    while i < buf.len() {
        let (field, wire, n) = read_field(&buf[i..]);
        i += n;
        if n == 0 || field == 0 {
            return Err(OsmError::invalid_field("BlobHeader", field));
        }
        match field {
            1 => {
                if wire != 2 {
                    return Err(OsmError::invalid_field("BlobHeader", field));
                }
                let (size, n) = read_varint(&buf[i..]);
                i += n;
                let size = size as usize;
                if n == 0 || size > buf.len() - i {
                    return Err(OsmError::invalid_field("BlobHeader", field));
                }
                typ = Some(&buf[i..i + size]);
                i += size;
            }
            3 => {
                if wire != 0 {
                    return Err(OsmError::invalid_field("BlobHeader", field));
                }
                let (val, n) = read_varint(&buf[i..]);
                i += n;
                if n == 0 {
                    return Err(OsmError::invalid_field("BlobHeader", field));
                } else if val > MAX_BLOB_SIZE as u64 {
                    return Err(OsmError::OversizeBlob);
                }
                datasize = Some(val as usize);
            }
            _ => {
                let n = skip_field(&buf[i..], wire);
                if n == 0 {
                    return Err(OsmError::invalid_field("BlobHeader", field));
                }
                i = i.saturating_add(n);
            }
        }
    }

    match (typ, datasize) {
        (Some(typ), Some(datasize)) if i == buf.len() => Ok((typ == b"OSMData", datasize)),
        _ => Err(OsmError::invalid_field("BlobHeader", 0)),
    }
}

/// Parses a `Blob` message, returning the payload field number, its range
/// within `buf`, and the declared raw size.
fn parse_blob(buf: &[u8]) -> Result<(u64, Range<usize>, usize)> {
    let mut i = 0;
    let mut raw_size = 0usize;
    let mut payload: Option<(u64, Range<usize>)> = None;

    while i < buf.len() {
        let (field, wire, n) = read_field(&buf[i..]);
        i += n;
        if n == 0 || field == 0 {
            return Err(OsmError::invalid_field("Blob", field));
        }
        if field == 2 {
            // raw_size
            if wire != 0 {
                return Err(OsmError::invalid_field("Blob", field));
            }
            let (val, n) = read_varint(&buf[i..]);
            i += n;
            if n == 0 {
                return Err(OsmError::invalid_field("Blob", field));
            } else if val > MAX_BLOB_SIZE as u64 {
                return Err(OsmError::OversizeBlob);
            }
            raw_size = val as usize;
        } else if (BLOB_RAW..=BLOB_ZSTD).contains(&field) {
            // raw, zlib_data, lzma_data, bzip2_data, lz4_data, zstd_data
            if wire != 2 {
                return Err(OsmError::invalid_field("Blob", field));
            }
            let (size, n) = read_varint(&buf[i..]);
            i += n;
            let size = size as usize;
            if n == 0 || size > buf.len() - i {
                return Err(OsmError::invalid_field("Blob", field));
            }
            payload = Some((field, i..i + size));
            i += size;
        } else {
            let n = skip_field(&buf[i..], wire);
            if n == 0 {
                return Err(OsmError::invalid_field("Blob", field));
            }
            i = i.saturating_add(n);
        }
    }

    match payload {
        Some((compression, range)) if i == buf.len() => Ok((compression, range, raw_size)),
        _ => Err(OsmError::invalid_field("Blob", 0)),
    }
}

/// Fills `buf` completely, or returns `Ok(false)` when the stream ends
/// before the first byte. A partial read is a truncation error.
fn read_or_eof(input: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut n = 0;
    while n < buf.len() {
        match input.read(&mut buf[n..]) {
            Ok(0) if n == 0 => return Ok(false),
            Ok(0) => return Err(OsmError::Truncated),
            Ok(m) => n += m,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(OsmError::Io(e)),
        }
    }
    Ok(true)
}

fn read_exact(input: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    input.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            OsmError::Truncated
        } else {
            OsmError::Io(e)
        }
    })
}
