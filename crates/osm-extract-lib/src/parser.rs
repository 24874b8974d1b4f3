//! Parallel streaming parser: a single reader thread frames blobs and a
//! bounded channel fans them out to worker threads for decompression and
//! primitive decoding.
//!
//! Callbacks run concurrently on the workers; callers that mutate shared
//! state from a callback must synchronize it themselves. Entities are
//! delivered in file order within a single blob's primitive group and in no
//! particular order across blobs.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{Receiver, bounded};

use crate::blob::{Blob, BlobReader, BufferPool};
use crate::block::{Block, ZlibPool};
use crate::decode::{self, Scratch};
use crate::element::{Node, Relation, Way};
use crate::varint::read_field;
use crate::{OsmError, Result, join_errors};

/// Per-kind callback references; any may be omitted to skip decoding that
/// kind entirely.
pub type NodeHandler<'h> = &'h (dyn Fn(&Node<'_>) + Sync);
pub type WayHandler<'h> = &'h (dyn Fn(&Way<'_>) + Sync);
pub type RelationHandler<'h> = &'h (dyn Fn(&Relation<'_>) + Sync);

/// Cloneable cancellation handle threaded through [`Parser::parse`].
///
/// Once cancelled, the reader stops producing, workers drain their channel
/// and exit, and the parse call returns [`OsmError::Cancelled`].
#[derive(Clone, Debug, Default)]
pub struct CancelToken(std::sync::Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Which entity kinds a blob turned out to contain, recorded on its first
/// decode so later passes can skip blobs without any relevant kind.
#[derive(Clone, Copy, Default)]
struct BlobContent {
    nodes: bool,
    ways: bool,
    relations: bool,
}

/// Streaming PBF parser over a seekable input.
///
/// The input is re-read from position 0 on every [`parse`](Parser::parse)
/// call, which is what the multi-pass operations build on.
pub struct Parser<R> {
    input: R,
    /// Number of worker threads; values < 1 fall back to the number of
    /// available hardware threads.
    pub workers: usize,
    pos: AtomicU64,
    contents: Mutex<HashMap<usize, BlobContent>>,
    buffers: BufferPool,
    zlib: ZlibPool,
}

impl<R: Read + Seek> Parser<R> {
    pub fn new(input: R) -> Parser<R> {
        Parser {
            input,
            workers: default_workers(),
            pos: AtomicU64::new(0),
            contents: Mutex::new(HashMap::new()),
            buffers: BufferPool::default(),
            zlib: ZlibPool::default(),
        }
    }

    /// Current parsing progress in bytes. Divide by the input's total size
    /// to obtain a progress ratio; safe to call concurrently with `parse`.
    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Relaxed)
    }

    /// Parses the whole input, invoking the given callbacks for each entity.
    ///
    /// Passing `None` for a kind skips its primitive decoder for every blob,
    /// which is considerably cheaper than ignoring entities in a callback.
    /// Callbacks execute concurrently on worker threads. Entities borrow
    /// worker scratch memory; call `to_owned` to retain one past the
    /// callback.
    pub fn parse(
        &mut self,
        cancel: &CancelToken,
        nodes: Option<NodeHandler<'_>>,
        ways: Option<WayHandler<'_>>,
        relations: Option<RelationHandler<'_>>,
    ) -> Result<()> {
        let workers = if self.workers < 1 {
            default_workers()
        } else {
            self.workers
        };
        self.input.seek(SeekFrom::Start(0))?;
        self.pos.store(0, Ordering::Relaxed);

        let abort = AtomicBool::new(false);
        let errors: Mutex<Vec<OsmError>> = Mutex::new(Vec::new());
        let (tx, rx) = bounded::<Blob>(2 * workers);

        let input = &mut self.input;
        let pos = &self.pos;
        let contents = &self.contents;
        let buffers = &self.buffers;
        let zlib = &self.zlib;

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let rx: Receiver<Blob> = rx.clone();
                let abort = &abort;
                let errors = &errors;
                scope.spawn(move || {
                    let mut scratch = Scratch::default();
                    for blob in rx.iter() {
                        if abort.load(Ordering::Relaxed) || cancel.is_cancelled() {
                            abort.store(true, Ordering::Relaxed);
                            // Keep draining so the reader never blocks on a
                            // full channel.
                            continue;
                        }
                        let datasize = blob.datasize;
                        match process_blob(
                            blob,
                            &mut scratch,
                            contents,
                            buffers,
                            zlib,
                            nodes,
                            ways,
                            relations,
                        ) {
                            Ok(()) => {
                                pos.fetch_add(datasize, Ordering::Relaxed);
                            }
                            Err(err) => {
                                errors.lock().unwrap().push(err);
                                abort.store(true, Ordering::Relaxed);
                            }
                        }
                    }
                });
            }
            drop(rx);

            let mut reader = BlobReader::new(input, pos, buffers);
            loop {
                if abort.load(Ordering::Relaxed) || cancel.is_cancelled() {
                    break;
                }
                match reader.next_blob() {
                    Ok(Some(blob)) => {
                        if tx.send(blob).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        errors.lock().unwrap().push(err);
                        abort.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
            drop(tx);
        });

        let mut errors = errors.into_inner().unwrap();
        if cancel.is_cancelled() {
            errors.push(OsmError::Cancelled);
        }
        join_errors(errors)
    }

    #[cfg(test)]
    pub(crate) fn blob_content_bits(&self) -> Vec<(usize, bool, bool, bool)> {
        let contents = self.contents.lock().unwrap();
        let mut bits: Vec<_> = contents
            .iter()
            .map(|(&index, c)| (index, c.nodes, c.ways, c.relations))
            .collect();
        bits.sort_unstable();
        bits
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Decompresses and decodes one blob on a worker, skipping it entirely when
/// its recorded fingerprint matches no active callback.
#[allow(clippy::too_many_arguments)]
fn process_blob(
    blob: Blob,
    scratch: &mut Scratch,
    contents: &Mutex<HashMap<usize, BlobContent>>,
    buffers: &BufferPool,
    zlib: &ZlibPool,
    nodes: Option<NodeHandler<'_>>,
    ways: Option<WayHandler<'_>>,
    relations: Option<RelationHandler<'_>>,
) -> Result<()> {
    let index = blob.index;
    let known = contents.lock().unwrap().get(&index).copied();
    if let Some(content) = known {
        let relevant = nodes.is_some() && content.nodes
            || ways.is_some() && content.ways
            || relations.is_some() && content.relations;
        if !relevant {
            buffers.put(blob.buf);
            return Ok(());
        }
    }

    let block = Block::decode(blob, buffers, zlib)?;
    scratch.strings.clear();

    let mut content = known.unwrap_or_default();
    for group in block.groups() {
        let (field, _, n) = read_field(group);
        if n == 0 || field == 0 {
            return Err(OsmError::invalid_field("PrimitiveGroup", field));
        }
        match field {
            2 => {
                // DenseNodes
                if let Some(f) = nodes {
                    decode::dense_nodes(&block, scratch, group, f)?;
                }
                content.nodes = true;
            }
            3 => {
                // Way
                if let Some(f) = ways {
                    decode::ways(&block, scratch, group, f)?;
                }
                content.ways = true;
            }
            4 => {
                // Relation
                if let Some(f) = relations {
                    decode::relations(&block, scratch, group, f)?;
                }
                content.relations = true;
            }
            // Plain (non-dense) nodes and changesets are not produced by
            // planet exports; both are skipped.
            _ => {}
        }
    }
    buffers.put(block.into_data());

    if known.is_none() {
        contents.lock().unwrap().insert(index, content);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    fn two_block_file() -> Vec<u8> {
        let mut nodes = testutil::BlockBuilder::new();
        nodes.dense_nodes(&[
            (1, 6.5, 53.2, &[("natural", "water")]),
            (2, 6.6, 53.3, &[]),
            (3, 6.7, 53.4, &[("amenity", "bench")]),
        ]);

        let mut ways_rels = testutil::BlockBuilder::new();
        ways_rels.ways(&[(10, &[1, 2, 3], &[("highway", "residential")])]);
        ways_rels.relations(&[(
            20,
            &[(crate::ElementKind::Way, 10, "outer")],
            &[("type", "multipolygon")],
        )]);

        let mut file = testutil::header_blob();
        file.extend_from_slice(&testutil::data_blob(&nodes.build(), true));
        file.extend_from_slice(&testutil::data_blob(&ways_rels.build(), false));
        file
    }

    #[test]
    fn visits_every_entity_exactly_once() {
        let file = two_block_file();
        let mut parser = Parser::new(Cursor::new(file.clone()));
        parser.workers = 2;

        let node_count = AtomicUsize::new(0);
        let way_count = AtomicUsize::new(0);
        let relation_count = AtomicUsize::new(0);
        let node_ids = Mutex::new(Vec::new());

        let nodes = |n: &Node<'_>| {
            node_count.fetch_add(1, Ordering::Relaxed);
            node_ids.lock().unwrap().push(n.id);
        };
        let ways = |w: &Way<'_>| {
            assert_eq!(w.refs, &[1, 2, 3]);
            assert_eq!(w.tags.find("highway"), "residential");
            way_count.fetch_add(1, Ordering::Relaxed);
        };
        let relations = |r: &Relation<'_>| {
            assert_eq!(r.members.len(), 1);
            assert_eq!(r.members[0].role, "outer");
            relation_count.fetch_add(1, Ordering::Relaxed);
        };

        parser
            .parse(
                &CancelToken::new(),
                Some(&nodes),
                Some(&ways),
                Some(&relations),
            )
            .unwrap();

        assert_eq!(node_count.load(Ordering::Relaxed), 3);
        assert_eq!(way_count.load(Ordering::Relaxed), 1);
        assert_eq!(relation_count.load(Ordering::Relaxed), 1);

        // Within a primitive group entities arrive in file order.
        assert_eq!(*node_ids.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(parser.pos(), file.len() as u64);
    }

    #[test]
    fn decoded_coordinates_are_exact() {
        let mut block = testutil::BlockBuilder::new();
        block.dense_nodes(&[(7, -0.1278, 51.5074, &[])]);
        let file = testutil::data_blob(&block.build(), false);

        let mut parser = Parser::new(Cursor::new(file));
        let seen = Mutex::new(Vec::new());
        let nodes = |n: &Node<'_>| {
            seen.lock().unwrap().push((n.id, n.lon, n.lat));
        };
        parser
            .parse(&CancelToken::new(), Some(&nodes), None, None)
            .unwrap();

        // Expected values follow the wire representation exactly:
        // 1e-9 * granularity * round(deg / granularity / 1e-9).
        let wire = |deg: f64| 1e-9 * ((deg * 1e7).round() * 100.0);
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen, vec![(7, wire(-0.1278), wire(51.5074))]);
    }

    #[test]
    fn subset_of_callbacks_sees_same_entities() {
        let file = two_block_file();

        let mut all = {
            let mut parser = Parser::new(Cursor::new(file.clone()));
            let seen = Mutex::new(Vec::new());
            let nodes = |n: &Node<'_>| seen.lock().unwrap().push(("node", n.id));
            let ways = |w: &Way<'_>| seen.lock().unwrap().push(("way", w.id));
            let relations = |r: &Relation<'_>| seen.lock().unwrap().push(("relation", r.id));
            parser
                .parse(
                    &CancelToken::new(),
                    Some(&nodes),
                    Some(&ways),
                    Some(&relations),
                )
                .unwrap();
            seen.into_inner().unwrap()
        };
        all.retain(|(kind, _)| *kind == "way");

        let mut parser = Parser::new(Cursor::new(file));
        let seen = Mutex::new(Vec::new());
        let ways = |w: &Way<'_>| seen.lock().unwrap().push(("way", w.id));
        parser
            .parse(&CancelToken::new(), None, Some(&ways), None)
            .unwrap();

        assert_eq!(seen.into_inner().unwrap(), all);
    }

    #[test]
    fn fingerprints_recorded_on_first_parse() {
        let file = two_block_file();
        let mut parser = Parser::new(Cursor::new(file));
        let nodes = |_: &Node<'_>| {};
        let ways = |_: &Way<'_>| {};
        let relations = |_: &Relation<'_>| {};
        parser
            .parse(
                &CancelToken::new(),
                Some(&nodes),
                Some(&ways),
                Some(&relations),
            )
            .unwrap();

        // Frame 0 is the header; frames 1 and 2 carry the data blobs.
        assert_eq!(
            parser.blob_content_bits(),
            vec![(1, true, false, false), (2, false, true, true)]
        );
    }

    #[test]
    fn repeat_parse_skips_irrelevant_blobs() {
        let file = two_block_file();
        let mut parser = Parser::new(Cursor::new(file));

        let first = AtomicUsize::new(0);
        let nodes = |_: &Node<'_>| {
            first.fetch_add(1, Ordering::Relaxed);
        };
        let ways = |_: &Way<'_>| {};
        let relations = |_: &Relation<'_>| {};
        parser
            .parse(
                &CancelToken::new(),
                Some(&nodes),
                Some(&ways),
                Some(&relations),
            )
            .unwrap();
        assert_eq!(first.load(Ordering::Relaxed), 3);

        // Second pass with only the node callback: the way/relation blob is
        // skipped by fingerprint, yet all nodes are still delivered.
        let second = AtomicUsize::new(0);
        let nodes = |_: &Node<'_>| {
            second.fetch_add(1, Ordering::Relaxed);
        };
        parser
            .parse(&CancelToken::new(), Some(&nodes), None, None)
            .unwrap();
        assert_eq!(second.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn cancellation_is_surfaced() {
        let file = two_block_file();
        let mut parser = Parser::new(Cursor::new(file));
        let cancel = CancelToken::new();
        cancel.cancel();

        let nodes = |_: &Node<'_>| {};
        let result = parser.parse(&cancel, Some(&nodes), None, None);
        assert!(matches!(result, Err(OsmError::Cancelled)));
    }

    #[test]
    fn truncated_file_is_an_error() {
        let mut file = two_block_file();
        file.truncate(file.len() - 7);
        let mut parser = Parser::new(Cursor::new(file));
        let ways = |_: &Way<'_>| {};
        let result = parser.parse(&CancelToken::new(), None, Some(&ways), None);
        assert!(result.is_err());
    }
}
