//! Primitive group decoders: dense nodes, ways, and relations.
//!
//! Decoders fill per-worker scratch buffers with the parsed parallel arrays,
//! validate them against the block's string table, and invoke the caller's
//! callback once per entity with a borrowing view.

use crate::block::Block;
use crate::element::{ElementKind, Member, Node, Relation, Tag, Tags, Way};
use crate::varint::{read_field, read_sint, read_varint, skip_field};
use crate::{OsmError, Result};

/// Per-block string table: spans into the block's decompressed buffer.
/// Strings stay valid until the next block is decoded on the same worker.
#[derive(Default)]
pub(crate) struct StringTable {
    spans: Vec<(u32, u32)>,
}

impl StringTable {
    pub fn clear(&mut self) {
        self.spans.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Rebuilds the table from the block's string table bytes, validating
    /// UTF-8 once per string.
    pub fn rebuild(&mut self, block: &Block) -> Result<()> {
        self.spans.clear();
        let buf = block.string_table_bytes();
        let base = block.string_table_span().start;

        let mut i = 0;
        while i < buf.len() {
            let (field, wire, n) = read_field(&buf[i..]);
            i += n;
            if n == 0 || field == 0 {
                return Err(OsmError::invalid_field("StringTable", field));
            }
            if field == 1 {
                if wire != 2 {
                    return Err(OsmError::invalid_field("StringTable", field));
                }
                let (size, n) = read_varint(&buf[i..]);
                i += n;
                let size = size as usize;
                if n == 0 || size > buf.len() - i {
                    return Err(OsmError::invalid_field("StringTable", field));
                }
                if std::str::from_utf8(&buf[i..i + size]).is_err() {
                    return Err(OsmError::invalid_field("StringTable", field));
                }
                self.spans.push(((base + i) as u32, size as u32));
                i += size;
            } else {
                let n = skip_field(&buf[i..], wire);
                if n == 0 {
                    return Err(OsmError::invalid_field("StringTable", field));
                }
                i = i.saturating_add(n);
            }
        }
        if self.spans.len() > u32::MAX as usize {
            return Err(OsmError::invalid_field("StringTable", 1));
        }
        Ok(())
    }

    /// Resolves an already-validated index against the block buffer.
    #[inline]
    fn get<'b>(&self, data: &'b [u8], index: u32) -> &'b str {
        let (start, len) = self.spans[index as usize];
        let bytes = &data[start as usize..(start + len) as usize];
        // UTF-8 was validated in rebuild().
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }
}

/// Per-worker scratch buffers, reused across blocks to keep allocation
/// pressure near-constant regardless of input size.
#[derive(Default)]
pub(crate) struct Scratch {
    pub strings: StringTable,

    // dense node buffers
    node_ids: Vec<u64>,
    lats: Vec<i64>,
    lons: Vec<i64>,
    key_vals: Vec<u32>,
    key_val_ends: Vec<usize>,

    // way and relation buffers
    keys: Vec<u32>,
    vals: Vec<u32>,
    roles: Vec<u32>,
    refs: Vec<u64>,
    kinds: Vec<ElementKind>,
}

fn ensure_strings(block: &Block, scratch: &mut Scratch) -> Result<()> {
    if scratch.strings.is_empty() {
        scratch.strings.rebuild(block)?;
    }
    Ok(())
}

/// Accumulates packed zig-zag deltas into absolute u64 ids, rejecting
/// under- and overflow.
fn accumulate_ids(
    buf: &[u8],
    out: &mut Vec<u64>,
    context: &'static str,
    field: u64,
) -> Result<()> {
    out.clear();
    let mut id = 0u64;
    let mut i = 0;
    while i < buf.len() {
        let (delta, n) = read_sint(&buf[i..]);
        i += n;
        if n == 0 {
            return Err(OsmError::invalid_field(context, field));
        }
        if delta >= 0 {
            id = id
                .checked_add(delta as u64)
                .ok_or(OsmError::invalid_field(context, field))?;
        } else {
            let sub = delta.unsigned_abs();
            if id <= sub {
                return Err(OsmError::invalid_field(context, field));
            }
            id -= sub;
        }
        out.push(id);
    }
    Ok(())
}

/// Accumulates packed zig-zag deltas into cumulative i64 coordinates.
fn accumulate_coords(
    buf: &[u8],
    out: &mut Vec<i64>,
    context: &'static str,
    field: u64,
) -> Result<()> {
    out.clear();
    let mut coord = 0i64;
    let mut i = 0;
    while i < buf.len() {
        let (delta, n) = read_sint(&buf[i..]);
        i += n;
        if n == 0 {
            return Err(OsmError::invalid_field(context, field));
        }
        coord = coord.wrapping_add(delta);
        out.push(coord);
    }
    Ok(())
}

/// Reads packed varints that index the string table, bounds-checking each.
fn read_string_indices(
    buf: &[u8],
    out: &mut Vec<u32>,
    table_len: usize,
    context: &'static str,
    field: u64,
) -> Result<()> {
    out.clear();
    let mut i = 0;
    while i < buf.len() {
        let (val, n) = read_varint(&buf[i..]);
        i += n;
        if n == 0 || val >= table_len as u64 {
            return Err(OsmError::invalid_field(context, field));
        }
        out.push(val as u32);
    }
    Ok(())
}

/// Reads the length prefix of a nested message, returning the payload range.
#[inline]
fn nested(buf: &[u8], i: &mut usize, context: &'static str, field: u64) -> Result<usize> {
    let (size, n) = read_varint(&buf[*i..]);
    *i += n;
    let size = size as usize;
    if n == 0 || size > buf.len() - *i {
        return Err(OsmError::invalid_field(context, field));
    }
    Ok(*i + size)
}

#[inline]
fn to_degrees(offset: i64, granularity: i64, raw: i64) -> f64 {
    1e-9 * offset.wrapping_add(granularity.wrapping_mul(raw)) as f64
}

/// Decodes a dense-nodes primitive group, invoking `f` once per node.
pub(crate) fn dense_nodes<F: Fn(&Node<'_>)>(
    block: &Block,
    scratch: &mut Scratch,
    buf: &[u8],
    f: F,
) -> Result<()> {
    ensure_strings(block, scratch)?;

    let (field, wire, n) = read_field(buf);
    let mut i = n;
    if n == 0 || field != 2 || wire != 2 {
        return Err(OsmError::invalid_field("PrimitiveGroup", field));
    }
    let (size, n) = read_varint(&buf[i..]);
    i += n;
    if n == 0 || size as usize != buf.len() - i {
        return Err(OsmError::invalid_field("DenseNodes", 2));
    }

    scratch.node_ids.clear();
    scratch.lats.clear();
    scratch.lons.clear();
    scratch.key_vals.clear();
    scratch.key_val_ends.clear();

    while i < buf.len() {
        let (field, wire, n) = read_field(&buf[i..]);
        i += n;
        if n == 0 || field == 0 {
            return Err(OsmError::invalid_field("DenseNodes", field));
        }
        match field {
            1 => {
                // id
                if wire != 2 {
                    return Err(OsmError::invalid_field("DenseNodes", field));
                }
                let end = nested(buf, &mut i, "DenseNodes", field)?;
                accumulate_ids(&buf[i..end], &mut scratch.node_ids, "DenseNodes", field)?;
                i = end;
            }
            8 | 9 => {
                // lat and lon
                if wire != 2 {
                    return Err(OsmError::invalid_field("DenseNodes", field));
                }
                let end = nested(buf, &mut i, "DenseNodes", field)?;
                let coords = if field == 8 {
                    &mut scratch.lats
                } else {
                    &mut scratch.lons
                };
                accumulate_coords(&buf[i..end], coords, "DenseNodes", field)?;
                i = end;
            }
            10 => {
                // keys_vals: (key, val)* groups separated by a 0 sentinel
                if wire != 2 {
                    return Err(OsmError::invalid_field("DenseNodes", field));
                }
                let end = nested(buf, &mut i, "DenseNodes", field)?;
                scratch.key_vals.clear();
                scratch.key_val_ends.clear();
                let table_len = scratch.strings.len() as u64;
                while i < end {
                    let (key, n) = read_varint(&buf[i..end]);
                    i += n;
                    if n == 0 || key >= table_len {
                        return Err(OsmError::invalid_field("DenseNodes", field));
                    }
                    if key == 0 {
                        scratch.key_val_ends.push(scratch.key_vals.len());
                        continue;
                    }
                    let (val, n) = read_varint(&buf[i..end]);
                    i += n;
                    if n == 0 || val >= table_len {
                        return Err(OsmError::invalid_field("DenseNodes", field));
                    }
                    scratch.key_vals.push(key as u32);
                    scratch.key_vals.push(val as u32);
                }
            }
            _ => {
                let n = skip_field(&buf[i..], wire);
                if n == 0 {
                    return Err(OsmError::invalid_field("DenseNodes", field));
                }
                i = i.saturating_add(n);
            }
        }
    }

    let count = scratch.node_ids.len();
    if i != buf.len()
        || scratch.lats.len() != count
        || scratch.lons.len() != count
        || (!scratch.key_val_ends.is_empty() && scratch.key_val_ends.len() != count)
    {
        return Err(OsmError::invalid_field("DenseNodes", 2));
    }

    let data = block.data();
    let mut tag_buf: Vec<Tag<'_>> = Vec::new();
    let mut start = 0usize;
    for (index, &id) in scratch.node_ids.iter().enumerate() {
        tag_buf.clear();
        if !scratch.key_val_ends.is_empty() {
            let end = scratch.key_val_ends[index];
            for pair in scratch.key_vals[start..end].chunks_exact(2) {
                tag_buf.push(Tag {
                    key: scratch.strings.get(data, pair[0]),
                    value: scratch.strings.get(data, pair[1]),
                });
            }
            start = end;
        }

        let node = Node {
            id,
            lon: to_degrees(block.lon_offset, block.granularity, scratch.lons[index]),
            lat: to_degrees(block.lat_offset, block.granularity, scratch.lats[index]),
            tags: Tags::new(&tag_buf),
        };
        f(&node);
    }
    Ok(())
}

/// Decodes a ways primitive group, invoking `f` once per way.
pub(crate) fn ways<F: Fn(&Way<'_>)>(
    block: &Block,
    scratch: &mut Scratch,
    buf: &[u8],
    f: F,
) -> Result<()> {
    ensure_strings(block, scratch)?;

    let data = block.data();
    let mut tag_buf: Vec<Tag<'_>> = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        let (field, wire, n) = read_field(&buf[i..]);
        i += n;
        if n == 0 || field != 3 || wire != 2 {
            return Err(OsmError::invalid_field("PrimitiveGroup", field));
        }
        let end = nested(buf, &mut i, "Way", 3)?;

        let mut id = 0u64;
        scratch.keys.clear();
        scratch.vals.clear();
        scratch.refs.clear();
        while i < end {
            let (field, wire, n) = read_field(&buf[i..end]);
            i += n;
            if n == 0 || field == 0 {
                return Err(OsmError::invalid_field("Way", field));
            }
            match field {
                1 => {
                    if wire != 0 {
                        return Err(OsmError::invalid_field("Way", field));
                    }
                    let (val, n) = read_varint(&buf[i..end]);
                    i += n;
                    if n == 0 {
                        return Err(OsmError::invalid_field("Way", field));
                    }
                    id = val;
                }
                2 | 3 => {
                    if wire != 2 {
                        return Err(OsmError::invalid_field("Way", field));
                    }
                    let sub_end = nested(&buf[..end], &mut i, "Way", field)?;
                    let out = if field == 2 {
                        &mut scratch.keys
                    } else {
                        &mut scratch.vals
                    };
                    read_string_indices(&buf[i..sub_end], out, scratch.strings.len(), "Way", field)?;
                    i = sub_end;
                }
                8 => {
                    if wire != 2 {
                        return Err(OsmError::invalid_field("Way", field));
                    }
                    let sub_end = nested(&buf[..end], &mut i, "Way", field)?;
                    accumulate_ids(&buf[i..sub_end], &mut scratch.refs, "Way", field)?;
                    i = sub_end;
                }
                _ => {
                    let n = skip_field(&buf[i..end], wire);
                    if n == 0 {
                        return Err(OsmError::invalid_field("Way", field));
                    }
                    i = i.saturating_add(n);
                }
            }
        }
        if i != end || scratch.keys.len() != scratch.vals.len() {
            return Err(OsmError::invalid_field("Way", 3));
        }
        if id == 0 {
            return Err(OsmError::InvalidEntity {
                kind: ElementKind::Way,
                id: 0,
            });
        }

        tag_buf.clear();
        for (&k, &v) in scratch.keys.iter().zip(&scratch.vals) {
            tag_buf.push(Tag {
                key: scratch.strings.get(data, k),
                value: scratch.strings.get(data, v),
            });
        }
        let way = Way {
            id,
            refs: &scratch.refs,
            tags: Tags::new(&tag_buf),
        };
        f(&way);
    }
    Ok(())
}

/// Decodes a relations primitive group, invoking `f` once per relation.
pub(crate) fn relations<F: Fn(&Relation<'_>)>(
    block: &Block,
    scratch: &mut Scratch,
    buf: &[u8],
    f: F,
) -> Result<()> {
    ensure_strings(block, scratch)?;

    let data = block.data();
    let mut tag_buf: Vec<Tag<'_>> = Vec::new();
    let mut member_buf: Vec<Member<'_>> = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        let (field, wire, n) = read_field(&buf[i..]);
        i += n;
        if n == 0 || field != 4 || wire != 2 {
            return Err(OsmError::invalid_field("PrimitiveGroup", field));
        }
        let end = nested(buf, &mut i, "Relation", 4)?;

        let mut id = 0u64;
        scratch.keys.clear();
        scratch.vals.clear();
        scratch.roles.clear();
        scratch.refs.clear();
        scratch.kinds.clear();
        while i < end {
            let (field, wire, n) = read_field(&buf[i..end]);
            i += n;
            if n == 0 || field == 0 {
                return Err(OsmError::invalid_field("Relation", field));
            }
            match field {
                1 => {
                    if wire != 0 {
                        return Err(OsmError::invalid_field("Relation", field));
                    }
                    let (val, n) = read_varint(&buf[i..end]);
                    i += n;
                    if n == 0 {
                        return Err(OsmError::invalid_field("Relation", field));
                    }
                    id = val;
                }
                2 | 3 | 8 => {
                    // keys, vals, roles_sid: packed string-table indices
                    if wire != 2 {
                        return Err(OsmError::invalid_field("Relation", field));
                    }
                    let sub_end = nested(&buf[..end], &mut i, "Relation", field)?;
                    let out = match field {
                        2 => &mut scratch.keys,
                        3 => &mut scratch.vals,
                        _ => &mut scratch.roles,
                    };
                    read_string_indices(
                        &buf[i..sub_end],
                        out,
                        scratch.strings.len(),
                        "Relation",
                        field,
                    )?;
                    i = sub_end;
                }
                9 => {
                    // memids
                    if wire != 2 {
                        return Err(OsmError::invalid_field("Relation", field));
                    }
                    let sub_end = nested(&buf[..end], &mut i, "Relation", field)?;
                    accumulate_ids(&buf[i..sub_end], &mut scratch.refs, "Relation", field)?;
                    i = sub_end;
                }
                10 => {
                    // types
                    if wire != 2 {
                        return Err(OsmError::invalid_field("Relation", field));
                    }
                    let sub_end = nested(&buf[..end], &mut i, "Relation", field)?;
                    scratch.kinds.clear();
                    while i < sub_end {
                        let (val, n) = read_varint(&buf[i..sub_end]);
                        i += n;
                        if n == 0 {
                            return Err(OsmError::invalid_field("Relation", field));
                        }
                        let kind = match val {
                            0 => ElementKind::Node,
                            1 => ElementKind::Way,
                            2 => ElementKind::Relation,
                            _ => return Err(OsmError::invalid_field("Relation", field)),
                        };
                        scratch.kinds.push(kind);
                    }
                }
                _ => {
                    let n = skip_field(&buf[i..end], wire);
                    if n == 0 {
                        return Err(OsmError::invalid_field("Relation", field));
                    }
                    i = i.saturating_add(n);
                }
            }
        }
        if i != end
            || scratch.keys.len() != scratch.vals.len()
            || scratch.roles.len() != scratch.refs.len()
            || scratch.roles.len() != scratch.kinds.len()
        {
            return Err(OsmError::invalid_field("Relation", 4));
        }
        if id == 0 {
            return Err(OsmError::InvalidEntity {
                kind: ElementKind::Relation,
                id: 0,
            });
        }

        member_buf.clear();
        for k in 0..scratch.roles.len() {
            member_buf.push(Member {
                id: scratch.refs[k],
                kind: scratch.kinds[k],
                role: scratch.strings.get(data, scratch.roles[k]),
            });
        }
        tag_buf.clear();
        for (&k, &v) in scratch.keys.iter().zip(&scratch.vals) {
            tag_buf.push(Tag {
                key: scratch.strings.get(data, k),
                value: scratch.strings.get(data, v),
            });
        }
        let relation = Relation {
            id,
            members: &member_buf,
            tags: Tags::new(&tag_buf),
        };
        f(&relation);
    }
    Ok(())
}
