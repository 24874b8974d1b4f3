//! Rectangle clipping of coordinate polylines using Cohen–Sutherland
//! outcodes.
//!
//! Every coordinate gets a 4-bit region code relative to the clip window;
//! traversing a way's nodes in order, segments are emitted, intersected
//! with the window edges, or replaced by a window corner when they pass
//! around one. Clip-generated points are collapsed so the output never
//! carries duplicate or colinear boundary runs.

use crate::geometry::{Bounds, Coord};

pub(crate) const OUT_LEFT: u8 = 0b0001;
pub(crate) const OUT_RIGHT: u8 = 0b0010;
pub(crate) const OUT_BOTTOM: u8 = 0b0100;
pub(crate) const OUT_TOP: u8 = 0b1000;

const X_MASK: u8 = OUT_LEFT | OUT_RIGHT;
const Y_MASK: u8 = OUT_BOTTOM | OUT_TOP;

/// Region code of `c` relative to `bounds`: 0 inside, with bits set for
/// left/right/bottom/top when outside the corresponding edge.
pub(crate) fn outcode(bounds: &Bounds, c: Coord) -> u8 {
    let mut code = 0;
    if c.x < bounds.min.x {
        code |= OUT_LEFT;
    } else if bounds.max.x < c.x {
        code |= OUT_RIGHT;
    }
    if c.y < bounds.min.y {
        code |= OUT_BOTTOM;
    } else if bounds.max.y < c.y {
        code |= OUT_TOP;
    }
    code
}

/// Parametric clip of the segment `a -> b` against `bounds`, returning the
/// `(t_entry, t_exit)` interval within `[0, 1]`, or `None` when the segment
/// misses the window.
fn clip_params(bounds: &Bounds, a: Coord, b: Coord) -> Option<(f64, f64)> {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;

    let edges = [
        (-dx, a.x - bounds.min.x),
        (dx, bounds.max.x - a.x),
        (-dy, a.y - bounds.min.y),
        (dy, bounds.max.y - a.y),
    ];
    for (p, q) in edges {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            if r > t0 {
                t0 = r;
            }
        } else {
            if r < t0 {
                return None;
            }
            if r < t1 {
                t1 = r;
            }
        }
    }
    Some((t0, t1))
}

fn lerp(a: Coord, b: Coord, t: f64) -> Coord {
    Coord {
        x: a.x + (b.x - a.x) * t,
        y: a.y + (b.y - a.y) * t,
    }
}

/// Incremental polyline clipper. Feed coordinates with their outcodes in
/// traversal order, then take the clipped sequence with [`finish`].
///
/// [`finish`]: Clipper::finish
pub(crate) struct Clipper<'b> {
    bounds: &'b Bounds,
    out: Vec<Coord>,
    prev: Option<(Coord, u8)>,
    last_synthetic: bool,
}

impl<'b> Clipper<'b> {
    pub fn new(bounds: &'b Bounds) -> Clipper<'b> {
        Clipper {
            bounds,
            out: Vec::new(),
            prev: None,
            last_synthetic: false,
        }
    }

    /// Emits an original node coordinate.
    fn push_node(&mut self, c: Coord) {
        if self.out.last() == Some(&c) {
            return;
        }
        self.out.push(c);
        self.last_synthetic = false;
    }

    /// Emits a clip-generated boundary point, collapsing duplicates,
    /// back-and-forth spurs, and colinear boundary runs.
    fn push_clip(&mut self, c: Coord) {
        if let Some(&last) = self.out.last() {
            if last == c {
                return;
            }
            if self.last_synthetic && self.out.len() >= 2 {
                let before = self.out[self.out.len() - 2];
                if before == c {
                    // A -> B -> A: drop the zero-area spur.
                    self.out.pop();
                    return;
                }
                if (before.x == last.x && last.x == c.x) || (before.y == last.y && last.y == c.y) {
                    // Three boundary points on one edge: replace the middle.
                    *self.out.last_mut().expect("checked non-empty") = c;
                    return;
                }
            }
        }
        self.out.push(c);
        self.last_synthetic = true;
    }

    /// Feeds the next coordinate of the traversal.
    pub fn add(&mut self, c: Coord, code: u8) {
        let Some((p, pc)) = self.prev.replace((c, code)) else {
            if code == 0 {
                self.push_node(c);
            }
            return;
        };

        match (pc == 0, code == 0) {
            (true, true) => self.push_node(c),
            (true, false) => {
                // Inside -> outside: emit the exit intersection.
                if let Some((_, t1)) = clip_params(self.bounds, p, c) {
                    self.push_clip(lerp(p, c, t1));
                }
            }
            (false, true) => {
                // Outside -> inside: emit the entry intersection, then the
                // node itself.
                if let Some((t0, _)) = clip_params(self.bounds, p, c) {
                    self.push_clip(lerp(p, c, t0));
                }
                self.push_node(c);
            }
            (false, false) => {
                if pc & code != 0 {
                    // Both on the same side: nothing visible.
                    return;
                }
                match clip_params(self.bounds, p, c) {
                    Some((t0, t1)) => {
                        // The segment crosses the window: entry and exit.
                        self.push_clip(lerp(p, c, t0));
                        self.push_clip(lerp(p, c, t1));
                    }
                    None => {
                        // The segment passes around the window; keep the
                        // traversal attached to the matching corner.
                        if let Some(corner) = self.wrap_corner(p, pc, c, code) {
                            self.push_clip(corner);
                        }
                    }
                }
            }
        }
    }

    /// The window corner a fully-outside segment wraps around. Only spans
    /// between two opposite corner regions (both outcodes with two bits)
    /// determine one; the axis whose boundary the segment crosses first
    /// hands its side over to the far endpoint.
    fn wrap_corner(&self, a: Coord, ca: u8, b: Coord, cb: u8) -> Option<Coord> {
        let ax = ca & X_MASK;
        let ay = ca & Y_MASK;
        let bx = cb & X_MASK;
        let by = cb & Y_MASK;
        if ax == 0 || ay == 0 || bx == 0 || by == 0 {
            return None;
        }

        let edge_x = |bit: u8| {
            if bit == OUT_LEFT {
                self.bounds.min.x
            } else {
                self.bounds.max.x
            }
        };
        let edge_y = |bit: u8| {
            if bit == OUT_BOTTOM {
                self.bounds.min.y
            } else {
                self.bounds.max.y
            }
        };

        let tx = (edge_x(ax) - a.x) / (b.x - a.x);
        let ty = (edge_y(ay) - a.y) / (b.y - a.y);
        let corner = if tx < ty {
            Coord {
                x: edge_x(bx),
                y: edge_y(ay),
            }
        } else {
            Coord {
                x: edge_x(ax),
                y: edge_y(by),
            }
        };
        Some(corner)
    }

    pub fn finish(self) -> Vec<Coord> {
        self.out
    }
}

/// Clips a full coordinate sequence in one call.
#[cfg(test)]
pub(crate) fn clip_polyline(bounds: &Bounds, coords: &[Coord]) -> Vec<Coord> {
    let mut clipper = Clipper::new(bounds);
    for &c in coords {
        clipper.add(c, outcode(bounds, c));
    }
    clipper.finish()
}
