//! Geometry model: coordinates, bounds, polygons, and the area predicate
//! deciding whether a closed way is a filled ring or just a closed path.

use crate::element::{OwnedTags, Tags};
use crate::ElementKind;

/// A longitude/latitude pair in degrees; `x` is longitude, `y` latitude.
pub type Coord = geo::Coord<f64>;

/// User-defined class attached by an extraction filter; 0 rejects.
pub type Class = u32;

/// An axis-aligned rectangle spanned by its minimum and maximum corners.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Bounds {
    pub min: Coord,
    pub max: Coord,
}

impl Bounds {
    pub fn new(min: Coord, max: Coord) -> Bounds {
        Bounds { min, max }
    }

    /// Inclusive containment test.
    pub fn contains(&self, c: Coord) -> bool {
        self.min.x <= c.x && c.x <= self.max.x && self.min.y <= c.y && c.y <= self.max.y
    }

    pub fn center(&self) -> Coord {
        Coord {
            x: (self.min.x + self.max.x) / 2.0,
            y: (self.min.y + self.max.y) / 2.0,
        }
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    /// Bounds of the rectangle under `transform`: the componentwise min/max
    /// of the four projected corners. The transform need not be affine.
    pub fn project(&self, transform: impl Fn(Coord) -> Coord) -> Bounds {
        let corners = [
            transform(self.min),
            transform(Coord {
                x: self.max.x,
                y: self.min.y,
            }),
            transform(self.max),
            transform(Coord {
                x: self.min.x,
                y: self.max.y,
            }),
        ];
        let mut min = corners[0];
        let mut max = corners[0];
        for c in &corners[1..] {
            min.x = min.x.min(c.x);
            min.y = min.y.min(c.y);
            max.x = max.x.max(c.x);
            max.y = max.y.max(c.y);
        }
        Bounds { min, max }
    }

    /// Grows every side by `factor` times the corresponding extent.
    pub fn expand_by_factor(&self, factor: f64) -> Bounds {
        let dx = factor * self.width();
        let dy = factor * self.height();
        Bounds {
            min: Coord {
                x: self.min.x - dx,
                y: self.min.y - dy,
            },
            max: Coord {
                x: self.max.x + dx,
                y: self.max.y + dy,
            },
        }
    }
}

/// A single ring; `fill` distinguishes filled areas from holes.
/// Filled rings wind counter-clockwise, holes clockwise.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Polygon {
    pub coords: Vec<Coord>,
    pub fill: bool,
}

/// An assembled vector geometry for one entity.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Geometry {
    pub kind: ElementKind,
    pub id: u64,
    pub points: Vec<Coord>,
    pub line_strings: Vec<Vec<Coord>>,
    pub polygons: Vec<Polygon>,
    pub tags: OwnedTags,
}

impl Geometry {
    pub(crate) fn empty(kind: ElementKind, id: u64, tags: OwnedTags) -> Geometry {
        Geometry {
            kind,
            id,
            points: Vec::new(),
            line_strings: Vec::new(),
            polygons: Vec::new(),
            tags,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.line_strings.is_empty() && self.polygons.is_empty()
    }
}

/// Twice-signed shoelace sum halved: positive for counter-clockwise rings.
/// Works with or without a repeated closing coordinate.
pub fn signed_area(coords: &[Coord]) -> f64 {
    if coords.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..coords.len() {
        let a = coords[i];
        let b = coords[(i + 1) % coords.len()];
        sum += a.x * b.y - b.x * a.y;
    }
    sum / 2.0
}

/// Reverses `coords` when its winding does not match the requested fill:
/// filled rings end up counter-clockwise, holes clockwise.
pub(crate) fn orient_ring(coords: &mut [Coord], fill: bool) {
    let area = signed_area(coords);
    if (area > 0.0) != fill && area != 0.0 {
        coords.reverse();
    }
}

fn tags_indicate_area<'x>(tags: impl Iterator<Item = (&'x str, &'x str)>) -> bool {
    let mut area = false;
    for (key, value) in tags {
        match (key, value) {
            ("area", "yes") => return true,
            ("area", "no") => return false,
            _ => {}
        }
        let is_area_tag = matches!(
            key,
            "building"
                | "landuse"
                | "amenity"
                | "shop"
                | "building:part"
                | "boundary"
                | "historic"
                | "place"
                | "area:highway"
        ) || (key == "waterway" && value == "riverbank")
            || (key == "highway" && matches!(value, "rest_area" | "services" | "platform"))
            || (key == "railway" && value == "platform")
            || (key == "aeroway" && value == "aerodrome")
            || (key == "leisure" && !matches!(value, "picnic_table" | "slipway" | "firepit"))
            || (key == "natural"
                && matches!(
                    value,
                    "coastline"
                        | "water"
                        | "wood"
                        | "scrub"
                        | "wetland"
                        | "grassland"
                        | "heath"
                        | "rock"
                        | "bare_rock"
                        | "sand"
                        | "beach"
                        | "scree"
                        | "bay"
                        | "glacier"
                        | "shingle"
                        | "fell"
                        | "reef"
                        | "stone"
                        | "mud"
                        | "landslide"
                        | "sinkhole"
                        | "crevasse"
                        | "desert"
                ));
        if is_area_tag {
            area = true;
        }
    }
    area
}

impl Tags<'_> {
    /// Returns true if the tags mark an enclosed area rather than an open
    /// path. A closed way is not automatically a filled ring (a roundabout
    /// is a closed line string); this predicate is the authoritative test.
    pub fn is_area(&self) -> bool {
        tags_indicate_area(self.iter().map(|t| (t.key, t.value)))
    }
}

impl OwnedTags {
    pub fn is_area(&self) -> bool {
        tags_indicate_area(self.iter())
    }
}
