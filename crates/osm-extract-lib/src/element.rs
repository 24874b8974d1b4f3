//! Borrowed element views and their owned snapshots.
//!
//! The decoder places strings, refs, and members in per-worker scratch
//! buffers and hands callbacks a borrowing view; those views are valid only
//! for the duration of the callback invocation. Call `to_owned` on a view to
//! deep-copy everything it references and retain it afterwards.

use std::collections::HashMap;

/// The three OSM entity kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ElementKind {
    Node,
    Way,
    Relation,
}

/// A single key/value pair borrowed from a decoded primitive block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag<'a> {
    pub key: &'a str,
    pub value: &'a str,
}

/// An ordered tag list borrowed from worker scratch.
#[derive(Clone, Copy, Debug, Default)]
pub struct Tags<'a> {
    tags: &'a [Tag<'a>],
}

impl<'a> Tags<'a> {
    pub fn new(tags: &'a [Tag<'a>]) -> Tags<'a> {
        Tags { tags }
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Tag<'a>> + 'a {
        self.tags.iter().copied()
    }

    /// Returns true if `key` exists in the tag list.
    pub fn has(&self, key: &str) -> bool {
        self.tags.iter().any(|t| t.key == key)
    }

    /// Returns the value of `key`, or the empty string if absent.
    pub fn find(&self, key: &str) -> &'a str {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map_or("", |t| t.value)
    }

    /// Converts the tag list to a key/value map.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.tags
            .iter()
            .map(|t| (t.key.to_string(), t.value.to_string()))
            .collect()
    }

    /// Deep-copies the tag list, including the string bytes.
    pub fn to_owned(&self) -> OwnedTags {
        OwnedTags {
            tags: self
                .tags
                .iter()
                .map(|t| (t.key.to_string(), t.value.to_string()))
                .collect(),
        }
    }
}

/// An owned deep copy of a tag list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OwnedTags {
    tags: Vec<(String, String)>,
}

impl OwnedTags {
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn has(&self, key: &str) -> bool {
        self.tags.iter().any(|(k, _)| k == key)
    }

    pub fn find(&self, key: &str) -> &str {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map_or("", |(_, v)| v.as_str())
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.tags.iter().cloned().collect()
    }
}

impl FromIterator<(String, String)> for OwnedTags {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> OwnedTags {
        OwnedTags {
            tags: iter.into_iter().collect(),
        }
    }
}

/// A node with decoded degree coordinates.
#[derive(Clone, Copy, Debug)]
pub struct Node<'a> {
    pub id: u64,
    pub lon: f64,
    pub lat: f64,
    pub tags: Tags<'a>,
}

impl Node<'_> {
    /// Deep-copies the node for use after the callback returns.
    pub fn to_owned(&self) -> OwnedNode {
        OwnedNode {
            id: self.id,
            lon: self.lon,
            lat: self.lat,
            tags: self.tags.to_owned(),
        }
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OwnedNode {
    pub id: u64,
    pub lon: f64,
    pub lat: f64,
    pub tags: OwnedTags,
}

/// An ordered sequence of node references with tags.
#[derive(Clone, Copy, Debug)]
pub struct Way<'a> {
    pub id: u64,
    pub refs: &'a [u64],
    pub tags: Tags<'a>,
}

impl Way<'_> {
    /// A way is closed iff its first and last refs are the same node.
    pub fn is_closed(&self) -> bool {
        self.refs.len() >= 2 && self.refs.first() == self.refs.last()
    }

    /// Deep-copies the way for use after the callback returns.
    pub fn to_owned(&self) -> OwnedWay {
        OwnedWay {
            id: self.id,
            refs: self.refs.to_vec(),
            tags: self.tags.to_owned(),
        }
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OwnedWay {
    pub id: u64,
    pub refs: Vec<u64>,
    pub tags: OwnedTags,
}

/// A typed relation member with its role string.
#[derive(Clone, Copy, Debug)]
pub struct Member<'a> {
    pub id: u64,
    pub kind: ElementKind,
    pub role: &'a str,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OwnedMember {
    pub id: u64,
    pub kind: ElementKind,
    pub role: String,
}

/// An ordered sequence of typed members with tags. Member order is
/// semantically significant for ring assembly.
#[derive(Clone, Copy, Debug)]
pub struct Relation<'a> {
    pub id: u64,
    pub members: &'a [Member<'a>],
    pub tags: Tags<'a>,
}

impl Relation<'_> {
    /// Deep-copies the relation for use after the callback returns.
    pub fn to_owned(&self) -> OwnedRelation {
        OwnedRelation {
            id: self.id,
            members: self
                .members
                .iter()
                .map(|m| OwnedMember {
                    id: m.id,
                    kind: m.kind,
                    role: m.role.to_string(),
                })
                .collect(),
            tags: self.tags.to_owned(),
        }
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OwnedRelation {
    pub id: u64,
    pub members: Vec<OwnedMember>,
    pub tags: OwnedTags,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tags() -> [Tag<'static>; 2] {
        [
            Tag {
                key: "natural",
                value: "water",
            },
            Tag {
                key: "name",
                value: "Paterswoldsemeer",
            },
        ]
    }

    #[test]
    fn tags_lookup() {
        let tags = sample_tags();
        let tags = Tags::new(&tags);
        assert!(tags.has("natural"));
        assert!(!tags.has("landuse"));
        assert_eq!(tags.find("name"), "Paterswoldsemeer");
        assert_eq!(tags.find("missing"), "");

        let map = tags.to_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["natural"], "water");
    }

    #[test]
    fn snapshot_outlives_source() {
        let owned = {
            let storage = sample_tags();
            let tags = Tags::new(&storage);
            Node {
                id: 7,
                lon: 6.5,
                lat: 53.2,
                tags,
            }
            .to_owned()
        };
        assert_eq!(owned.id, 7);
        assert_eq!(owned.tags.find("natural"), "water");
        assert_eq!(owned.tags.to_map()["name"], "Paterswoldsemeer");
    }

    #[test]
    fn way_closed() {
        let tags = Tags::default();
        let closed = Way {
            id: 1,
            refs: &[5, 6, 7, 5],
            tags,
        };
        let open = Way {
            id: 2,
            refs: &[5, 6, 7],
            tags,
        };
        let single = Way {
            id: 3,
            refs: &[5],
            tags,
        };
        assert!(closed.is_closed());
        assert!(!open.is_closed());
        assert!(!single.is_closed());
    }

    #[test]
    fn relation_snapshot() {
        let members = [Member {
            id: 9,
            kind: ElementKind::Way,
            role: "outer",
        }];
        let storage = sample_tags();
        let relation = Relation {
            id: 4,
            members: &members,
            tags: Tags::new(&storage),
        };
        let owned = relation.to_owned();
        assert_eq!(owned.members.len(), 1);
        assert_eq!(owned.members[0].role, "outer");
        assert_eq!(owned.members[0].kind, ElementKind::Way);
    }
}
