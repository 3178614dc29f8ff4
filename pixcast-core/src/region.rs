//! Rectangle algebra for damage tracking.
//!
//! [`Rectangle`] is a plain value type; [`RegionSet`] is the normalised
//! collection a pending batch accumulates. Adding a rectangle that the
//! existing members already cover (alone or together) is a no-op, and
//! members fully covered by a new rectangle are dropped, so the set
//! never carries redundant duplicates.

use serde::{Deserialize, Serialize};

// ── Rectangle ────────────────────────────────────────────────────

/// An axis-aligned rectangle in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rectangle {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle anchored at the origin.
    pub const fn sized(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn intersects(&self, other: &Rectangle) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// True if `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Rectangle) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn intersection(&self, other: &Rectangle) -> Option<Rectangle> {
        if !self.intersects(other) {
            return None;
        }
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let r = self.right().min(other.right());
        let b = self.bottom().min(other.bottom());
        Some(Rectangle::new(x, y, r - x, b - y))
    }

    /// Smallest rectangle enclosing both.
    pub fn union_bounds(&self, other: &Rectangle) -> Rectangle {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let r = self.right().max(other.right());
        let b = self.bottom().max(other.bottom());
        Rectangle::new(x, y, r - x, b - y)
    }

    /// `self` minus `other`, as at most four non-overlapping pieces.
    ///
    /// Full-width bands above and below the cut, then the left and right
    /// slivers of the middle band.
    pub fn subtract(&self, other: &Rectangle) -> Vec<Rectangle> {
        let Some(cut) = self.intersection(other) else {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        };
        let mut out = Vec::with_capacity(4);
        if cut.y > self.y {
            out.push(Rectangle::new(self.x, self.y, self.width, cut.y - self.y));
        }
        if cut.bottom() < self.bottom() {
            out.push(Rectangle::new(
                self.x,
                cut.bottom(),
                self.width,
                self.bottom() - cut.bottom(),
            ));
        }
        if cut.x > self.x {
            out.push(Rectangle::new(self.x, cut.y, cut.x - self.x, cut.height));
        }
        if cut.right() < self.right() {
            out.push(Rectangle::new(
                cut.right(),
                cut.y,
                self.right() - cut.right(),
                cut.height,
            ));
        }
        out
    }

    /// Clip to a `width`×`height` window anchored at the origin.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<Rectangle> {
        self.intersection(&Rectangle::sized(width, height))
    }
}

impl std::fmt::Display for Rectangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Bounding rectangle of every member of `rects`.
pub fn merge_all<'a>(rects: impl IntoIterator<Item = &'a Rectangle>) -> Option<Rectangle> {
    rects
        .into_iter()
        .filter(|r| !r.is_empty())
        .fold(None, |acc, r| Some(acc.map_or(*r, |a: Rectangle| a.union_bounds(r))))
}

// ── RegionSet ────────────────────────────────────────────────────

/// A normalised set of damage rectangles, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionSet {
    rects: Vec<Rectangle>,
}

impl RegionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rectangle) -> Self {
        let mut set = Self::new();
        set.add(rect);
        set
    }

    /// Merge `rect` into the set.
    ///
    /// Returns `false` when the rectangle was already covered by the
    /// set (or is empty) and nothing changed.
    pub fn add(&mut self, rect: Rectangle) -> bool {
        if rect.is_empty() || self.covers(&rect) {
            return false;
        }
        self.rects.retain(|r| !rect.contains(r));
        self.rects.push(rect);
        true
    }

    /// Whether the union of the members contains all of `rect`.
    pub fn covers(&self, rect: &Rectangle) -> bool {
        let mut left = vec![*rect];
        for member in &self.rects {
            if !member.intersects(rect) {
                continue;
            }
            left = left.iter().flat_map(|piece| piece.subtract(member)).collect();
            if left.is_empty() {
                return true;
            }
        }
        left.is_empty()
    }

    /// Remove `rect` from every member, splitting where needed.
    pub fn subtract(&mut self, rect: &Rectangle) {
        if !self.rects.iter().any(|r| r.intersects(rect)) {
            return;
        }
        let rects = std::mem::take(&mut self.rects);
        for r in rects {
            for piece in r.subtract(rect) {
                self.add(piece);
            }
        }
    }

    pub fn intersects(&self, rect: &Rectangle) -> bool {
        self.rects.iter().any(|r| r.intersects(rect))
    }

    pub fn bounds(&self) -> Option<Rectangle> {
        merge_all(&self.rects)
    }

    /// Sum of member areas; overlapping parts count more than once.
    pub fn pixel_count(&self) -> u64 {
        self.rects.iter().map(Rectangle::area).sum()
    }

    /// Exact area of the union of all members.
    pub fn covered_area(&self) -> u64 {
        if self.rects.is_empty() {
            return 0;
        }
        let mut xs: Vec<u32> = self.rects.iter().flat_map(|r| [r.x, r.right()]).collect();
        xs.sort_unstable();
        xs.dedup();
        let mut total = 0u64;
        for pair in xs.windows(2) {
            let (x0, x1) = (pair[0], pair[1]);
            let mut spans: Vec<(u32, u32)> = self
                .rects
                .iter()
                .filter(|r| r.x <= x0 && r.right() >= x1)
                .map(|r| (r.y, r.bottom()))
                .collect();
            spans.sort_unstable();
            let mut covered = 0u64;
            let mut current: Option<(u32, u32)> = None;
            for (a, b) in spans {
                match current {
                    Some((ca, cb)) if a <= cb => current = Some((ca, cb.max(b))),
                    Some((ca, cb)) => {
                        covered += (cb - ca) as u64;
                        current = Some((a, b));
                    }
                    None => current = Some((a, b)),
                }
            }
            if let Some((ca, cb)) = current {
                covered += (cb - ca) as u64;
            }
            total += covered * (x1 - x0) as u64;
        }
        total
    }

    /// Clip every member to a window of the given size.
    pub fn clip_to(&mut self, width: u32, height: u32) {
        let rects = std::mem::take(&mut self.rects);
        for r in rects {
            if let Some(c) = r.clip_to(width, height) {
                self.add(c);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rectangle> {
        self.rects.iter()
    }

    pub fn as_slice(&self) -> &[Rectangle] {
        &self.rects
    }
}

impl FromIterator<Rectangle> for RegionSet {
    fn from_iter<I: IntoIterator<Item = Rectangle>>(iter: I) -> Self {
        let mut set = RegionSet::new();
        for r in iter {
            set.add(r);
        }
        set
    }
}

impl<'a> IntoIterator for &'a RegionSet {
    type Item = &'a Rectangle;
    type IntoIter = std::slice::Iter<'a, Rectangle>;

    fn into_iter(self) -> Self::IntoIter {
        self.rects.iter()
    }
}

// ── Tests ────────────────────────────────────────────────────────
