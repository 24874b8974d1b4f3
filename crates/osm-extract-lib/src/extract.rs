//! Multi-pass geometry extraction: everything inside or crossing a bounding
//! box, assembled into points, line strings, and polygons per user class.
//!
//! Peak memory is proportional to the selected subset, not to the file:
//! each pass keeps only the identifier sets and coordinate buffers later
//! passes still need, and drops them as soon as the last user completes.
//! Missing cross-references are tolerated and simply omitted; real OSM
//! exports are often incomplete.

use std::collections::HashMap;
use std::io::{Read, Seek};
use std::sync::Mutex;

use tracing::debug;

use crate::clip::{Clipper, outcode};
use crate::element::{ElementKind, Node, OwnedTags, Relation, Tags, Way};
use crate::geometry::{Bounds, Class, Coord, Geometry, Polygon, orient_ring};
use crate::parser::{CancelToken, Parser};
use crate::u64map::U64Map;
use crate::u64set::U64Set;
use crate::Result;

/// Classifies an entity; returning 0 rejects it.
pub type FilterFn<'f> = &'f (dyn Fn(ElementKind, u64, Tags<'_>) -> Class + Sync);

/// A node cached between passes: its coordinate, region code against the
/// clip window, and, for nodes that may be emitted standalone, class and
/// tags. `consumed` flips once a way or relation claims the node.
struct CachedNode {
    coord: Coord,
    code: u8,
    candidate: Option<(Class, OwnedTags)>,
    consumed: bool,
}

/// A way cached between passes: clipped coordinates plus the original
/// endpoint node ids used for contour joining.
struct WayEntry {
    coords: Vec<Coord>,
    first: u64,
    last: u64,
    class: Class,
    is_area: bool,
    tags: OwnedTags,
    consumed: bool,
}

/// A member way queued for contour assembly.
struct ContourPiece {
    coords: Vec<Coord>,
    first: u64,
    last: u64,
}

impl<R: Read + Seek> Parser<R> {
    /// Extracts a `class -> geometries` mapping of everything inside or
    /// crossing `bounds`.
    ///
    /// With a filter, two extra passes resolve which relations, ways, and
    /// nodes are needed before the main node/way/relation passes run; the
    /// blob fingerprints recorded on the first pass keep the re-reads
    /// cheap. Without a filter everything is selected under class 0.
    ///
    /// Ways consumed by an emitted relation, and nodes consumed by a way or
    /// relation, are not additionally emitted standalone. A closed relation
    /// contour becomes a polygon only when the relation's tags pass the
    /// area predicate; otherwise it stays a line string.
    pub fn extract(
        &mut self,
        cancel: &CancelToken,
        bounds: Bounds,
        filter: Option<FilterFn<'_>>,
    ) -> Result<HashMap<Class, Vec<Geometry>>> {
        let selected_relations = Mutex::new(U64Map::new(8, 0.6));
        let selected_ways = Mutex::new(U64Map::new(8, 0.6));
        let selected_nodes = Mutex::new(U64Set::new(8, 0.6));

        if let Some(f) = filter {
            // Pass 0 (relations): record classes and register node/way
            // members as dependencies. A relation that is itself a member
            // of an earlier-seen selected relation expands too; a child
            // seen before its parent degrades to missing members.
            let relation_cb = |relation: &Relation<'_>| {
                let class = f(ElementKind::Relation, relation.id, relation.tags);
                let mut relations = selected_relations.lock().unwrap();
                let known_dependency = matches!(relations.get(relation.id), Some(0));
                if class != 0 {
                    relations.insert(relation.id, u64::from(class));
                }
                if class == 0 && !known_dependency {
                    return;
                }
                let mut nodes = selected_nodes.lock().unwrap();
                let mut ways = selected_ways.lock().unwrap();
                for member in relation.members {
                    match member.kind {
                        ElementKind::Node => nodes.insert(member.id),
                        ElementKind::Way => {
                            if ways.get(member.id).is_none() {
                                ways.insert(member.id, 0);
                            }
                        }
                        ElementKind::Relation => {
                            if relations.get(member.id).is_none() {
                                relations.insert(member.id, 0);
                            }
                        }
                    }
                }
            };
            self.parse(cancel, None, None, Some(&relation_cb))?;
            debug!(
                relations = selected_relations.lock().unwrap().len(),
                "selection pass over relations done"
            );

            // Pass 1 (ways): classify ways and register the node refs of
            // every selected or depended-upon way.
            let way_cb = |way: &Way<'_>| {
                let class = f(ElementKind::Way, way.id, way.tags);
                let mut ways = selected_ways.lock().unwrap();
                if class != 0 {
                    ways.insert(way.id, u64::from(class));
                }
                if class != 0 || ways.contains(way.id) {
                    let mut nodes = selected_nodes.lock().unwrap();
                    for &r in way.refs {
                        nodes.insert(r);
                    }
                }
            };
            self.parse(cancel, None, Some(&way_cb), None)?;
            debug!(
                ways = selected_ways.lock().unwrap().len(),
                nodes = selected_nodes.lock().unwrap().len(),
                "selection pass over ways done"
            );
        }

        // Pass 2 (nodes): cache coordinates and region codes for every
        // selected node, and queue contained filter matches as standalone
        // point candidates. Emission is deferred so nodes consumed by a
        // way or relation are not duplicated.
        let node_table: Mutex<HashMap<u64, CachedNode>> = Mutex::new(HashMap::new());
        let node_cb = |node: &Node<'_>| {
            let coord = Coord {
                x: node.lon,
                y: node.lat,
            };
            let code = outcode(&bounds, coord);
            let class = match filter {
                Some(f) => f(ElementKind::Node, node.id, node.tags),
                None => 0,
            };
            let passes = filter.is_none() || class != 0;
            let candidate = passes && code == 0;
            let needed = match filter {
                None => true,
                Some(_) => candidate || selected_nodes.lock().unwrap().contains(node.id),
            };
            if needed {
                node_table.lock().unwrap().insert(
                    node.id,
                    CachedNode {
                        coord,
                        code,
                        candidate: candidate.then(|| (class, node.tags.to_owned())),
                        consumed: false,
                    },
                );
            }
        };
        self.parse(cancel, Some(&node_cb), None, None)?;
        drop(selected_nodes);
        debug!(
            nodes = node_table.lock().unwrap().len(),
            "node pass done"
        );

        // Pass 3 (ways): clip each selected way against the window and
        // store the result keyed by way id for relation assembly.
        let way_table: Mutex<HashMap<u64, WayEntry>> = Mutex::new(HashMap::new());
        let way_cb = |way: &Way<'_>| {
            let class = match filter {
                None => 0,
                Some(_) => match selected_ways.lock().unwrap().get(way.id) {
                    Some(class) => class as Class,
                    None => return,
                },
            };
            if way.refs.is_empty() {
                return;
            }
            let closed = way.is_closed();
            let is_area = closed && way.tags.is_area();

            let mut clipper = Clipper::new(&bounds);
            {
                let mut nodes = node_table.lock().unwrap();
                for r in way.refs {
                    if let Some(node) = nodes.get_mut(r) {
                        node.consumed = true;
                        clipper.add(node.coord, node.code);
                    }
                    // Refs to nodes missing from the file are omitted.
                }
            }
            let mut coords = clipper.finish();
            if closed && coords.len() >= 3 && coords.first() != coords.last() {
                // Clipping opened the loop; re-close it.
                let first = coords[0];
                coords.push(first);
            }
            if closed {
                if coords.len() < 4 {
                    return;
                }
            } else if coords.len() < 2 {
                return;
            }

            way_table.lock().unwrap().insert(
                way.id,
                WayEntry {
                    coords,
                    first: way.refs[0],
                    last: *way.refs.last().expect("refs checked non-empty"),
                    class,
                    is_area,
                    tags: way.tags.to_owned(),
                    consumed: false,
                },
            );
        };
        self.parse(cancel, None, Some(&way_cb), None)?;
        drop(selected_ways);
        debug!(ways = way_table.lock().unwrap().len(), "way pass done");

        // Pass 4 (relations): group member ways by role, join contours by
        // endpoint identity, and emit per-role polygons and line strings.
        let out: Mutex<HashMap<Class, Vec<Geometry>>> = Mutex::new(HashMap::new());
        let relation_cb = |relation: &Relation<'_>| {
            let class = match filter {
                None => 0,
                Some(_) => match selected_relations.lock().unwrap().get(relation.id) {
                    Some(class) if class != 0 => class as Class,
                    _ => return,
                },
            };

            let mut geometry =
                Geometry::empty(ElementKind::Relation, relation.id, relation.tags.to_owned());
            let mut role_groups: Vec<(&str, Vec<ContourPiece>)> = Vec::new();
            let mut node_members = Vec::new();
            {
                let mut ways = way_table.lock().unwrap();
                for member in relation.members {
                    match member.kind {
                        ElementKind::Way => {
                            if let Some(entry) = ways.get_mut(&member.id) {
                                entry.consumed = true;
                                let piece = ContourPiece {
                                    coords: entry.coords.clone(),
                                    first: entry.first,
                                    last: entry.last,
                                };
                                match role_groups.iter_mut().find(|(role, _)| *role == member.role)
                                {
                                    Some((_, pieces)) => pieces.push(piece),
                                    None => role_groups.push((member.role, vec![piece])),
                                }
                            }
                        }
                        ElementKind::Node => node_members.push(member.id),
                        // Member relations are not expanded into coordinates;
                        // they were registered as dependencies in pass 0 and
                        // emit their own geometry.
                        ElementKind::Relation => {}
                    }
                }
            }

            let relation_is_area = relation.tags.is_area();
            for (role, pieces) in role_groups {
                let fill = role != "inner";
                let (closed_contours, open_contours) = assemble_contours(pieces);
                for mut ring in closed_contours {
                    if ring.first() != ring.last() {
                        let first = ring[0];
                        ring.push(first);
                    }
                    if ring.len() < 4 {
                        continue;
                    }
                    // A closed contour only fills when the relation's tags
                    // pass the area predicate; a closed route stays a line
                    // string.
                    if relation_is_area {
                        orient_ring(&mut ring, fill);
                        geometry.polygons.push(Polygon { coords: ring, fill });
                    } else {
                        geometry.line_strings.push(ring);
                    }
                }
                for contour in open_contours {
                    if role == "outer" || role == "inner" {
                        tracing::warn!(
                            relation = relation.id,
                            role,
                            "relation contour could not be closed"
                        );
                    }
                    geometry.line_strings.push(contour);
                }
            }

            {
                let mut nodes = node_table.lock().unwrap();
                for id in node_members {
                    if let Some(node) = nodes.get_mut(&id) {
                        node.consumed = true;
                        if node.code == 0 {
                            geometry.points.push(node.coord);
                        }
                    }
                }
            }

            // Filled rings first.
            geometry.polygons.sort_by_key(|p| !p.fill);
            if !geometry.is_empty() {
                out.lock().unwrap().entry(class).or_default().push(geometry);
            }
        };
        self.parse(cancel, None, None, Some(&relation_cb))?;
        drop(selected_relations);

        // Emit the ways no relation claimed, then the remaining standalone
        // node candidates.
        let way_table = way_table.into_inner().unwrap();
        let node_table = node_table.into_inner().unwrap();
        let mut out = out.into_inner().unwrap();

        for (id, entry) in way_table {
            if entry.consumed || (filter.is_some() && entry.class == 0) {
                continue;
            }
            let mut geometry = Geometry::empty(ElementKind::Way, id, entry.tags);
            let mut coords = entry.coords;
            if entry.is_area {
                orient_ring(&mut coords, true);
                geometry.polygons.push(Polygon {
                    coords,
                    fill: true,
                });
            } else {
                geometry.line_strings.push(coords);
            }
            out.entry(entry.class).or_default().push(geometry);
        }

        for (id, entry) in node_table {
            if entry.consumed {
                continue;
            }
            if let Some((class, tags)) = entry.candidate {
                let mut geometry = Geometry::empty(ElementKind::Node, id, tags);
                geometry.points.push(entry.coord);
                out.entry(class).or_default().push(geometry);
            }
        }

        Ok(out)
    }
}

/// Joins member ways into contours by endpoint identity (node ids, not
/// coordinates, to tolerate floating-point drift). Returns the closed
/// contours and the still-open concatenations with more than two points.
fn assemble_contours(pieces: Vec<ContourPiece>) -> (Vec<Vec<Coord>>, Vec<Vec<Coord>>) {
    let mut closed = Vec::new();
    let mut rest = Vec::new();
    for piece in pieces {
        if piece.first == piece.last {
            closed.push(piece.coords);
        } else {
            rest.push(piece);
        }
    }

    let mut open = Vec::new();
    while let Some(mut current) = rest.pop() {
        loop {
            if current.first == current.last {
                break;
            }
            let Some(i) = rest
                .iter()
                .position(|p| p.first == current.last || p.last == current.first)
            else {
                break;
            };
            let piece = rest.swap_remove(i);
            if piece.first == current.last {
                // Append.
                if current.coords.last() == piece.coords.first() {
                    current.coords.extend_from_slice(&piece.coords[1..]);
                } else {
                    current.coords.extend_from_slice(&piece.coords);
                }
                current.last = piece.last;
            } else {
                // Prepend.
                let mut joined = piece.coords;
                if joined.last() == current.coords.first() {
                    joined.extend_from_slice(&current.coords[1..]);
                } else {
                    joined.extend_from_slice(&current.coords);
                }
                current.coords = joined;
                current.first = piece.first;
            }
        }
        if current.first == current.last {
            closed.push(current.coords);
        } else if current.coords.len() > 2 {
            open.push(current.coords);
        }
    }
    (closed, open)
}
