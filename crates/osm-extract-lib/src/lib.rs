//! Parallel OSM PBF decoding and bounded-memory vector geometry extraction.
//!
//! This library reads the OpenStreetMap PBF container format (length-prefixed,
//! optionally zlib-compressed blobs of primitive blocks) and turns it into a
//! stream of nodes, ways, and relations, or into assembled vector geometries
//! clipped to a bounding box. It is built for planet-sized inputs: blobs are
//! decoded on a pool of worker threads, decoded entities borrow per-worker
//! scratch memory, and the multi-pass extractor keeps only the identifier sets
//! and coordinate buffers it still needs alive between passes.
//!
//! # Architecture
//!
//! - **[`Parser`]**: blob framing, parallel block decoding, per-kind callbacks
//! - **[`Parser::stats`]**: single-pass aggregate statistics ([`Stats`])
//! - **[`Parser::extract`]**: multi-pass clipping/assembly into [`Geometry`]
//! - **[`U64Map`] / [`U64Set`]**: dense open-addressed id containers
//!
//! Only raw and zlib blob encodings are decoded; LZMA, bzip2, LZ4 and Zstd
//! surface as [`OsmError::UnsupportedCompression`].
//!
//! Decoded entities are valid only for the duration of a single callback
//! invocation; call `to_owned` on an entity to retain it.

mod blob;
mod block;
mod clip;
mod decode;
mod element;
mod extract;
mod find;
mod geometry;
mod parser;
mod stats;
mod u64map;
mod u64set;
mod varint;

#[cfg(test)]
mod testutil;

pub use blob::{MAX_BLOB_HEADER_SIZE, MAX_BLOB_SIZE};
pub use element::{
    ElementKind, Member, Node, OwnedMember, OwnedNode, OwnedRelation, OwnedTags, OwnedWay,
    Relation, Tag, Tags, Way,
};
pub use extract::FilterFn;
pub use geometry::{Bounds, Class, Coord, Geometry, Polygon, signed_area};
pub use parser::{CancelToken, NodeHandler, Parser, RelationHandler, WayHandler};
pub use stats::{Histogram, MAX_RELATION_DEPTH, Stats};
pub use u64map::U64Map;
pub use u64set::U64Set;
pub use varint::{read_field, read_sint, read_varint, skip_field};

/// Error types for PBF parsing and geometry extraction.
#[derive(Debug, thiserror::Error)]
pub enum OsmError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated input")]
    Truncated,

    #[error("BlobHeader length exceeds {MAX_BLOB_HEADER_SIZE} bytes")]
    OversizeBlobHeader,

    #[error("Blob size exceeds {MAX_BLOB_SIZE} bytes")]
    OversizeBlob,

    #[error("invalid field {field} in {context}")]
    InvalidField { context: &'static str, field: u64 },

    #[error("invalid {kind:?} with id {id}")]
    InvalidEntity { kind: ElementKind, id: u64 },

    #[error("unsupported {0} compression in Blob")]
    UnsupportedCompression(&'static str),

    #[error("parsing was cancelled")]
    Cancelled,

    #[error("{}", list_errors(.0))]
    Multiple(Vec<OsmError>),
}

pub type Result<T> = std::result::Result<T, OsmError>;

impl OsmError {
    pub(crate) fn invalid_field(context: &'static str, field: u64) -> OsmError {
        OsmError::InvalidField { context, field }
    }
}

/// Collapses a list of accumulated errors into zero, one, or a joined error.
pub(crate) fn join_errors(mut errors: Vec<OsmError>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.pop().expect("length checked")),
        _ => Err(OsmError::Multiple(errors)),
    }
}

fn list_errors(errors: &[OsmError]) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for (i, err) in errors.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        let _ = write!(out, "{err}");
    }
    out
}
