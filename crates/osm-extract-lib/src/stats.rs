//! Single-pass aggregate statistics over a PBF file: entity counts, id
//! ranges, coordinate bounds, cross-reference sets, and relation nesting
//! depths.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Seek};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::element::{ElementKind, Node, Relation, Way};
use crate::geometry::{Bounds, Coord};
use crate::parser::{CancelToken, Parser};
use crate::u64set::U64Set;
use crate::Result;

/// Relation nesting is explored at most this deep; anything deeper is
/// counted as recursive.
pub const MAX_RELATION_DEPTH: usize = 16;

const HIST_SAMPLES: usize = 2048;
const HIST_SEED: u64 = 0x34234;

/// Reservoir-sampled histogram of small counts (refs per way, members per
/// relation). Min, max, and count are exact; quantiles come from a bounded
/// sample.
pub struct Histogram {
    min: u64,
    max: u64,
    count: u64,
    samples: Vec<u64>,
    capacity: usize,
    rng: StdRng,
}

impl Histogram {
    pub fn new(max_samples: usize) -> Histogram {
        Histogram {
            min: 0,
            max: 0,
            count: 0,
            samples: Vec::with_capacity(max_samples),
            capacity: max_samples,
            rng: StdRng::seed_from_u64(HIST_SEED),
        }
    }

    pub fn add(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else if value > self.max {
            self.max = value;
        } else if value < self.min {
            self.min = value;
        }
        self.count += 1;

        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            let i = self.rng.random_range(0..self.count);
            if (i as usize) < self.samples.len() {
                self.samples[i as usize] = value;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn quantile(&self, phi: f64) -> f64 {
        self.quantiles(&[phi])[0]
    }

    pub fn quantiles(&self, phis: &[f64]) -> Vec<f64> {
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        phis.iter()
            .map(|&phi| {
                if sorted.is_empty() || phi.is_nan() {
                    f64::NAN
                } else if phi <= 0.0 {
                    self.min as f64
                } else if phi >= 1.0 {
                    self.max as f64
                } else {
                    let mut idx = (phi * (sorted.len() - 1) as f64 + 0.5) as usize;
                    if idx == sorted.len() {
                        idx -= 1;
                    }
                    sorted[idx] as f64
                }
            })
            .collect()
    }

    fn mean_stddev(&self) -> (f64, f64) {
        if self.samples.is_empty() {
            return (f64::NAN, f64::NAN);
        }
        let mean = self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64;
        let var = self
            .samples
            .iter()
            .map(|&s| (mean - s as f64) * (mean - s as f64))
            .sum::<f64>()
            / (self.samples.len() as f64 - 1.0);
        (mean, var.sqrt())
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (mean, stddev) = self.mean_stddev();
        let qs = self.quantiles(&[0.5, 0.75, 0.9, 0.99]);
        write!(
            f,
            "mean={}±{}  q(.5,.75,.9,.99)=[{}, {}, {}, {}]",
            mean as i64, stddev as i64, qs[0], qs[1], qs[2], qs[3]
        )
    }
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Histogram")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("count", &self.count)
            .field("samples", &self.samples.len())
            .finish()
    }
}

/// Aggregate statistics from one pass over the file.
#[derive(Debug)]
pub struct Stats {
    pub num_nodes: u64,
    pub num_ways: u64,
    pub num_relations: u64,
    /// Lowest and highest id per entity kind.
    pub node_id_range: [u64; 2],
    pub way_id_range: [u64; 2],
    pub relation_id_range: [u64; 2],
    /// Bounding box over all node coordinates.
    pub bounds: Bounds,

    /// Distinct nodes referenced by ways.
    pub way_nodes: u64,
    /// Distinct nodes referenced by relations.
    pub relation_nodes: u64,
    /// Existing nodes referenced by both ways and relations.
    pub doubly_referenced_nodes: u64,
    pub missing_way_nodes: u64,
    pub hist_way_nodes: Histogram,

    /// Distinct ways referenced by relations.
    pub relation_ways: u64,
    pub missing_relation_nodes: u64,
    pub missing_relation_ways: u64,

    /// Distinct relations referenced by other relations.
    pub relation_relations: u64,
    pub missing_relation_relations: u64,
    pub hist_relation_nodes: Histogram,
    pub hist_relation_ways: Histogram,
    pub hist_relation_relations: Histogram,
    /// Relations per nesting depth; index 0 holds leaves.
    pub relation_depths: Vec<u64>,
    /// Relations whose parent chain exceeds [`MAX_RELATION_DEPTH`].
    pub recursive_relations: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.num_nodes == 0 && self.num_ways == 0 && self.num_relations == 0 {
            return write!(f, "empty");
        }

        let pct = |part: u64, total: u64| {
            if total == 0 {
                0.0
            } else {
                part as f64 / total as f64 * 100.0
            }
        };

        let in_relation = self.relation_nodes - self.missing_relation_nodes;
        let relation_only = in_relation - self.doubly_referenced_nodes;
        let way_only =
            self.way_nodes - self.missing_way_nodes - self.doubly_referenced_nodes;
        let root_nodes = self
            .num_nodes
            .saturating_sub(way_only)
            .saturating_sub(in_relation);
        let in_relation_ways = self.relation_ways - self.missing_relation_ways;
        let root_ways = self.num_ways - in_relation_ways;
        let in_relation_relations = self.relation_relations - self.missing_relation_relations;
        let root_relations = self.num_relations - in_relation_relations;

        if self.num_nodes > 0 {
            writeln!(
                f,
                "Nodes:        num={}  id=[{},{}]",
                self.num_nodes, self.node_id_range[0], self.node_id_range[1]
            )?;
            writeln!(
                f,
                "  parents:    relation={} ({:.1}%)  way={} ({:.1}%)  both={} ({:.1}%)  none={} ({:.1}%)",
                relation_only,
                pct(relation_only, self.num_nodes),
                way_only,
                pct(way_only, self.num_nodes),
                self.doubly_referenced_nodes,
                pct(self.doubly_referenced_nodes, self.num_nodes),
                root_nodes,
                pct(root_nodes, self.num_nodes),
            )?;
        }
        if self.num_ways > 0 {
            writeln!(
                f,
                "Ways:         num={}  id=[{},{}]",
                self.num_ways, self.way_id_range[0], self.way_id_range[1]
            )?;
            writeln!(
                f,
                "  parents:    relation={} ({:.1}%)  none={} ({:.1}%)",
                in_relation_ways,
                pct(in_relation_ways, self.num_ways),
                root_ways,
                pct(root_ways, self.num_ways),
            )?;
            writeln!(
                f,
                "  nodes:      num={}  {}  missing={}",
                self.way_nodes, self.hist_way_nodes, self.missing_way_nodes
            )?;
        }
        if self.num_relations > 0 {
            writeln!(
                f,
                "Relations:    num={}  id=[{},{}]",
                self.num_relations, self.relation_id_range[0], self.relation_id_range[1]
            )?;
            writeln!(
                f,
                "  parents:    relation={} ({:.1}%)  none={} ({:.1}%)",
                in_relation_relations,
                pct(in_relation_relations, self.num_relations),
                root_relations,
                pct(root_relations, self.num_relations),
            )?;
            write!(f, "  depths:   ")?;
            for (depth, num) in self.relation_depths.iter().enumerate() {
                write!(f, "  {depth}={num}")?;
            }
            if self.recursive_relations > 0 {
                write!(f, "  RECURSIVE={}", self.recursive_relations)?;
            }
            writeln!(f)?;
            writeln!(
                f,
                "  nodes:      num={}  {}  missing={}",
                self.relation_nodes, self.hist_relation_nodes, self.missing_relation_nodes
            )?;
            writeln!(
                f,
                "  ways:       num={}  {}  missing={}",
                self.relation_ways, self.hist_relation_ways, self.missing_relation_ways
            )?;
            writeln!(
                f,
                "  relations:  num={}  {}  missing={}",
                self.relation_relations, self.hist_relation_relations,
                self.missing_relation_relations
            )?;
        }
        if self.num_nodes > 0 {
            writeln!(
                f,
                "Bounds:       lon=[{},{}]  lat=[{},{}]",
                self.bounds.min.x, self.bounds.max.x, self.bounds.min.y, self.bounds.max.y
            )?;
        }
        Ok(())
    }
}

/// Running id-range/bounds aggregation guarded by one mutex per kind.
struct NodeAgg {
    ids: U64Set,
    id_range: [u64; 2],
    bounds: Bounds,
    seen: bool,
}

struct WayAgg {
    ids: U64Set,
    id_range: [u64; 2],
    hist_refs: Histogram,
    seen: bool,
}

struct RelationAgg {
    ids: U64Set,
    id_range: [u64; 2],
    hist_nodes: Histogram,
    hist_ways: Histogram,
    hist_relations: Histogram,
    parents: HashMap<u64, Vec<u64>>,
    seen: bool,
}

fn widen(range: &mut [u64; 2], seen: &mut bool, id: u64) {
    if !*seen {
        *range = [id, id];
        *seen = true;
    } else if id < range[0] {
        range[0] = id;
    } else if id > range[1] {
        range[1] = id;
    }
}

impl<R: Read + Seek> Parser<R> {
    /// Computes aggregate statistics in a single parallel pass.
    pub fn stats(&mut self, cancel: &CancelToken) -> Result<Stats> {
        let num_nodes = AtomicU64::new(0);
        let num_ways = AtomicU64::new(0);
        let num_relations = AtomicU64::new(0);

        let node_agg = Mutex::new(NodeAgg {
            ids: U64Set::new(8, 0.6),
            id_range: [0, 0],
            bounds: Bounds::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 0.0, y: 0.0 }),
            seen: false,
        });
        let way_agg = Mutex::new(WayAgg {
            ids: U64Set::new(8, 0.6),
            id_range: [0, 0],
            hist_refs: Histogram::new(HIST_SAMPLES),
            seen: false,
        });
        let relation_agg = Mutex::new(RelationAgg {
            ids: U64Set::new(8, 0.6),
            id_range: [0, 0],
            hist_nodes: Histogram::new(HIST_SAMPLES),
            hist_ways: Histogram::new(HIST_SAMPLES),
            hist_relations: Histogram::new(HIST_SAMPLES),
            parents: HashMap::new(),
            seen: false,
        });
        let way_node_ids = Mutex::new(U64Set::new(8, 0.6));
        let relation_node_ids = Mutex::new(U64Set::new(8, 0.6));
        let relation_way_ids = Mutex::new(U64Set::new(8, 0.6));
        let relation_relation_ids = Mutex::new(U64Set::new(8, 0.6));

        let node_cb = |node: &Node<'_>| {
            num_nodes.fetch_add(1, Ordering::Relaxed);
            let mut agg = node_agg.lock().unwrap();
            agg.ids.insert(node.id);
            let NodeAgg {
                id_range,
                bounds,
                seen,
                ..
            } = &mut *agg;
            if !*seen {
                bounds.min = Coord {
                    x: node.lon,
                    y: node.lat,
                };
                bounds.max = bounds.min;
            } else {
                bounds.min.x = bounds.min.x.min(node.lon);
                bounds.min.y = bounds.min.y.min(node.lat);
                bounds.max.x = bounds.max.x.max(node.lon);
                bounds.max.y = bounds.max.y.max(node.lat);
            }
            widen(id_range, seen, node.id);
        };

        let way_cb = |way: &Way<'_>| {
            num_ways.fetch_add(1, Ordering::Relaxed);
            {
                let mut agg = way_agg.lock().unwrap();
                agg.ids.insert(way.id);
                let WayAgg {
                    id_range,
                    hist_refs,
                    seen,
                    ..
                } = &mut *agg;
                widen(id_range, seen, way.id);
                hist_refs.add(way.refs.len() as u64);
            }
            let mut refs = way_node_ids.lock().unwrap();
            for &id in way.refs {
                refs.insert(id);
            }
        };

        let relation_cb = |relation: &Relation<'_>| {
            num_relations.fetch_add(1, Ordering::Relaxed);

            let mut node_members = 0u64;
            let mut way_members = 0u64;
            let mut relation_members = 0u64;
            for member in relation.members {
                match member.kind {
                    ElementKind::Node => node_members += 1,
                    ElementKind::Way => way_members += 1,
                    ElementKind::Relation => relation_members += 1,
                }
            }

            {
                let mut agg = relation_agg.lock().unwrap();
                agg.ids.insert(relation.id);
                let RelationAgg {
                    id_range,
                    hist_nodes,
                    hist_ways,
                    hist_relations,
                    parents,
                    seen,
                    ..
                } = &mut *agg;
                widen(id_range, seen, relation.id);
                hist_nodes.add(node_members);
                hist_ways.add(way_members);
                hist_relations.add(relation_members);
                for member in relation.members {
                    if member.kind == ElementKind::Relation {
                        parents.entry(member.id).or_default().push(relation.id);
                    }
                }
            }

            if node_members > 0 {
                let mut ids = relation_node_ids.lock().unwrap();
                for member in relation.members {
                    if member.kind == ElementKind::Node {
                        ids.insert(member.id);
                    }
                }
            }
            if way_members > 0 {
                let mut ids = relation_way_ids.lock().unwrap();
                for member in relation.members {
                    if member.kind == ElementKind::Way {
                        ids.insert(member.id);
                    }
                }
            }
            if relation_members > 0 {
                let mut ids = relation_relation_ids.lock().unwrap();
                for member in relation.members {
                    if member.kind == ElementKind::Relation {
                        ids.insert(member.id);
                    }
                }
            }
        };

        self.parse(cancel, Some(&node_cb), Some(&way_cb), Some(&relation_cb))?;

        let node_agg = node_agg.into_inner().unwrap();
        let way_agg = way_agg.into_inner().unwrap();
        let relation_agg = relation_agg.into_inner().unwrap();
        let way_node_ids = way_node_ids.into_inner().unwrap();
        let relation_node_ids = relation_node_ids.into_inner().unwrap();
        let relation_way_ids = relation_way_ids.into_inner().unwrap();
        let relation_relation_ids = relation_relation_ids.into_inner().unwrap();

        let mut stats = Stats {
            num_nodes: num_nodes.into_inner(),
            num_ways: num_ways.into_inner(),
            num_relations: num_relations.into_inner(),
            node_id_range: node_agg.id_range,
            way_id_range: way_agg.id_range,
            relation_id_range: relation_agg.id_range,
            bounds: node_agg.bounds,
            way_nodes: way_node_ids.len() as u64,
            relation_nodes: relation_node_ids.len() as u64,
            doubly_referenced_nodes: 0,
            missing_way_nodes: 0,
            hist_way_nodes: way_agg.hist_refs,
            relation_ways: relation_way_ids.len() as u64,
            missing_relation_nodes: 0,
            missing_relation_ways: 0,
            relation_relations: relation_relation_ids.len() as u64,
            missing_relation_relations: 0,
            hist_relation_nodes: relation_agg.hist_nodes,
            hist_relation_ways: relation_agg.hist_ways,
            hist_relation_relations: relation_agg.hist_relations,
            relation_depths: Vec::new(),
            recursive_relations: 0,
        };

        way_node_ids.for_each(|id| {
            if !node_agg.ids.contains(id) {
                stats.missing_way_nodes += 1;
            }
        });
        relation_node_ids.for_each(|id| {
            if !node_agg.ids.contains(id) {
                stats.missing_relation_nodes += 1;
            } else if way_node_ids.contains(id) {
                stats.doubly_referenced_nodes += 1;
            }
        });
        relation_way_ids.for_each(|id| {
            if !way_agg.ids.contains(id) {
                stats.missing_relation_ways += 1;
            }
        });
        relation_relation_ids.for_each(|id| {
            if !relation_agg.ids.contains(id) {
                stats.missing_relation_relations += 1;
            } else {
                let depth = relation_depth(id, &relation_agg.parents, 0);
                match depth {
                    None => stats.recursive_relations += 1,
                    Some(depth) => {
                        if stats.relation_depths.len() <= depth {
                            stats.relation_depths.resize(depth + 1, 0);
                        }
                        stats.relation_depths[depth] += 1;
                    }
                }
            }
        });

        if stats.relation_depths.is_empty() && stats.num_relations > 0 {
            stats.relation_depths.push(0);
        }
        if !stats.relation_depths.is_empty() {
            stats.relation_depths[0] = stats.num_relations
                - (stats.relation_relations - stats.missing_relation_relations);
        }
        Ok(stats)
    }
}

/// Depth of a relation measured up its parent chain. `None` means the chain
/// exceeded [`MAX_RELATION_DEPTH`], treated as a reference cycle.
fn relation_depth(id: u64, parents: &HashMap<u64, Vec<u64>>, depth: usize) -> Option<usize> {
    if depth >= MAX_RELATION_DEPTH {
        return None;
    }
    let mut max_depth = depth;
    if let Some(ps) = parents.get(&id) {
        for &p in ps {
            match relation_depth(p, parents, depth + 1) {
                None => return None,
                Some(d) => max_depth = max_depth.max(d),
            }
        }
    }
    Some(max_depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use crate::ElementKind;
    use std::io::Cursor;

    #[test]
    fn histogram_tracks_extremes_and_quantiles() {
        let mut hist = Histogram::new(64);
        for v in 1..=100u64 {
            hist.add(v);
        }
        assert_eq!(hist.count(), 100);
        assert_eq!(hist.min(), 1);
        assert_eq!(hist.max(), 100);
        assert_eq!(hist.quantile(0.0), 1.0);
        assert_eq!(hist.quantile(1.0), 100.0);
        let median = hist.quantile(0.5);
        assert!((20.0..=80.0).contains(&median), "median {median}");
        assert!(hist.quantile(f64::NAN).is_nan());
    }

    #[test]
    fn histogram_reservoir_is_bounded() {
        let mut hist = Histogram::new(16);
        for v in 0..10_000u64 {
            hist.add(v);
        }
        assert_eq!(hist.count(), 10_000);
        assert!(hist.samples.len() <= 16);
    }

    fn stats_file() -> Vec<u8> {
        let mut block = testutil::BlockBuilder::new();
        block.dense_nodes(&[
            (1, 6.5, 53.1, &[]),
            (2, 6.6, 53.2, &[]),
            (3, 6.7, 53.3, &[]),
            (4, 6.8, 53.4, &[("amenity", "bench")]),
        ]);
        block.ways(&[
            (10, &[1, 2], &[]),
            // Node 99 is missing from the file.
            (11, &[2, 3, 99], &[]),
        ]);
        block.relations(&[
            (
                20,
                &[
                    (ElementKind::Way, 10, "outer"),
                    (ElementKind::Node, 3, ""),
                ],
                &[],
            ),
            (21, &[(ElementKind::Relation, 20, "")], &[]),
        ]);

        let mut file = testutil::header_blob();
        file.extend_from_slice(&testutil::data_blob(&block.build(), false));
        file
    }

    #[test]
    fn aggregates_counts_ranges_and_references() {
        let mut parser = Parser::new(Cursor::new(stats_file()));
        let stats = parser.stats(&CancelToken::new()).unwrap();

        assert_eq!(stats.num_nodes, 4);
        assert_eq!(stats.num_ways, 2);
        assert_eq!(stats.num_relations, 2);
        assert_eq!(stats.node_id_range, [1, 4]);
        assert_eq!(stats.way_id_range, [10, 11]);
        assert_eq!(stats.relation_id_range, [20, 21]);

        assert_eq!(stats.way_nodes, 4); // nodes 1, 2, 3, 99
        assert_eq!(stats.missing_way_nodes, 1); // node 99
        assert_eq!(stats.relation_nodes, 1); // node 3
        assert_eq!(stats.doubly_referenced_nodes, 1); // node 3 is also in way 11
        assert_eq!(stats.relation_ways, 1);
        assert_eq!(stats.missing_relation_ways, 0);
        assert_eq!(stats.relation_relations, 1);
        assert_eq!(stats.missing_relation_relations, 0);

        assert_eq!(stats.hist_way_nodes.count(), 2);
        assert_eq!(stats.hist_way_nodes.max(), 3);

        // Relation 20 is nested under 21; one relation at depth 1, and the
        // remaining root at depth 0.
        assert_eq!(stats.relation_depths[0], 1);
        assert_eq!(stats.relation_depths[1], 1);
        assert_eq!(stats.recursive_relations, 0);

        assert!((stats.bounds.min.x - 6.5).abs() < 1e-7);
        assert!((stats.bounds.max.y - 53.4).abs() < 1e-7);

        let report = stats.to_string();
        assert!(report.contains("Nodes:"));
        assert!(report.contains("Bounds:"));
    }

    #[test]
    fn cyclic_relations_are_counted_as_recursive() {
        let mut block = testutil::BlockBuilder::new();
        block.relations(&[
            (30, &[(ElementKind::Relation, 31, "")], &[]),
            (31, &[(ElementKind::Relation, 30, "")], &[]),
        ]);
        let file = testutil::data_blob(&block.build(), false);

        let mut parser = Parser::new(Cursor::new(file));
        let stats = parser.stats(&CancelToken::new()).unwrap();
        assert_eq!(stats.recursive_relations, 2);
    }

    #[test]
    fn empty_file_reports_empty() {
        let mut parser = Parser::new(Cursor::new(testutil::header_blob()));
        let stats = parser.stats(&CancelToken::new()).unwrap();
        assert_eq!(stats.to_string(), "empty");
    }
}
