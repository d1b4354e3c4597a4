//! Pixel-aligned region arithmetic
//!
//! A [`Region`] is a set of non-overlapping rectangles in a common coordinate
//! space. Damage accumulation, node visibility and opaque-region propagation
//! are all expressed with these.

use super::{Coordinate, Point, Rectangle, Size};

/// A region described by a set of non-overlapping rectangles
pub struct Region<N, Kind> {
    rects: Vec<Rectangle<N, Kind>>,
}

impl<N: Coordinate, Kind> Region<N, Kind> {
    /// Create a new empty region
    #[inline]
    pub fn empty() -> Self {
        Region { rects: Vec::new() }
    }

    /// Create a region covering a single rectangle
    #[inline]
    pub fn from_rect(rect: Rectangle<N, Kind>) -> Self {
        if rect.is_empty() {
            return Self::empty();
        }
        Region { rects: vec![rect] }
    }

    /// Create a region from a set of possibly overlapping rectangles
    pub fn from_rects(rects: impl IntoIterator<Item = Rectangle<N, Kind>>) -> Self {
        let mut region = Self::empty();
        for rect in rects {
            region.add_rect(rect);
        }
        region
    }

    /// Check if this region is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// The rectangles making up this region
    ///
    /// The rectangles are non-overlapping, but in no particular order.
    #[inline]
    pub fn rects(&self) -> &[Rectangle<N, Kind>] {
        &self.rects
    }

    /// Union this region with a rectangle
    pub fn add_rect(&mut self, rect: Rectangle<N, Kind>) {
        if rect.is_empty() {
            return;
        }
        // keep the set disjoint by only inserting the parts not already covered
        let new_parts = rect.subtract_rects(self.rects.iter().copied());
        self.rects.extend(new_parts);
    }

    /// Union this region with another region
    pub fn add_region(&mut self, other: &Region<N, Kind>) {
        for rect in &other.rects {
            self.add_rect(*rect);
        }
    }

    /// Remove a rectangle from this region
    pub fn subtract_rect(&mut self, rect: Rectangle<N, Kind>) {
        if rect.is_empty() || self.rects.is_empty() {
            return;
        }
        let rects = std::mem::take(&mut self.rects);
        self.rects = Rectangle::subtract_rects_many_in_place(rects, [rect]);
    }

    /// Remove another region from this region
    pub fn subtract_region(&mut self, other: &Region<N, Kind>) {
        if other.rects.is_empty() || self.rects.is_empty() {
            return;
        }
        let rects = std::mem::take(&mut self.rects);
        self.rects = Rectangle::subtract_rects_many_in_place(rects, other.rects.iter().copied());
    }

    /// Restrict this region to a rectangle
    pub fn intersect_rect(&mut self, rect: Rectangle<N, Kind>) {
        self.rects = self
            .rects
            .drain(..)
            .filter_map(|r| r.intersection(rect))
            .collect();
    }

    /// Restrict this region to another region
    pub fn intersect_region(&mut self, other: &Region<N, Kind>) {
        let mut result = Vec::new();
        for rect in &self.rects {
            for other_rect in &other.rects {
                if let Some(intersection) = rect.intersection(*other_rect) {
                    result.push(intersection);
                }
            }
        }
        self.rects = result;
    }

    /// Returns the intersection of this region with a rectangle as a new region
    pub fn intersection_rect(&self, rect: Rectangle<N, Kind>) -> Region<N, Kind> {
        Region {
            rects: self.rects.iter().filter_map(|r| r.intersection(rect)).collect(),
        }
    }

    /// Check whether the region overlaps a rectangle
    pub fn overlaps(&self, rect: Rectangle<N, Kind>) -> bool {
        self.rects.iter().any(|r| r.overlaps(rect))
    }

    /// The bounding box of this region
    pub fn extents(&self) -> Rectangle<N, Kind> {
        let mut iter = self.rects.iter();
        let Some(first) = iter.next() else {
            return Rectangle::default();
        };
        iter.fold(*first, |acc, rect| acc.merge(*rect))
    }

    /// Translate the region by an offset
    pub fn translate(&mut self, offset: Point<N, Kind>) {
        for rect in &mut self.rects {
            rect.loc += offset;
        }
    }

    /// Map every rectangle of the region into another coordinate space
    pub fn map<J: Coordinate, OtherKind>(
        &self,
        mut f: impl FnMut(Rectangle<N, Kind>) -> Rectangle<J, OtherKind>,
    ) -> Region<J, OtherKind> {
        Region::from_rects(self.rects.iter().map(|rect| f(*rect)))
    }
}

impl<Kind> Region<i32, Kind> {
    /// Total area covered by the region
    ///
    /// The rectangle set is disjoint, so a plain sum is exact.
    pub fn area(&self) -> u64 {
        self.rects
            .iter()
            .map(|r| r.size.w as u64 * r.size.h as u64)
            .sum()
    }

}

impl<N: Coordinate, Kind> Clone for Region<N, Kind> {
    fn clone(&self) -> Self {
        Region {
            rects: self.rects.clone(),
        }
    }
}

impl<N: Coordinate, Kind> Default for Region<N, Kind> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<N: Coordinate, Kind> std::fmt::Debug for Region<N, Kind> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.rects.iter()).finish()
    }
}

impl<N: Coordinate, Kind> From<Rectangle<N, Kind>> for Region<N, Kind> {
    fn from(rect: Rectangle<N, Kind>) -> Self {
        Region::from_rect(rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Logical;

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Logical> {
        Rectangle::new(Point::new(x, y), Size::new(w, h))
    }

    #[test]
    fn union_of_overlapping_rects_is_disjoint() {
        let mut region = Region::from_rect(rect(0, 0, 100, 100));
        region.add_rect(rect(50, 50, 100, 100));
        assert_eq!(region.area(), 100 * 100 + 100 * 100 - 50 * 50);
        for (i, a) in region.rects().iter().enumerate() {
            for b in region.rects().iter().skip(i + 1) {
                assert!(!a.overlaps(*b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn subtract_then_union_restores_area() {
        let mut region = Region::from_rect(rect(0, 0, 1920, 1080));
        region.subtract_rect(rect(100, 100, 200, 200));
        assert_eq!(region.area(), 1920 * 1080 - 200 * 200);
        region.add_rect(rect(100, 100, 200, 200));
        assert_eq!(region.area(), 1920 * 1080);
    }

    #[test]
    fn intersect_clips_to_rect() {
        let mut region = Region::from_rects([rect(0, 0, 800, 600), rect(1000, 0, 400, 400)]);
        region.intersect_rect(rect(0, 0, 900, 600));
        assert_eq!(region.area(), 800 * 600);
    }

    #[test]
    fn extents_covers_all_rects() {
        let region = Region::from_rects([rect(10, 10, 10, 10), rect(50, 40, 10, 10)]);
        assert_eq!(region.extents(), rect(10, 10, 50, 40));
    }

    #[test]
    fn empty_region_has_empty_extents() {
        let region: Region<i32, Logical> = Region::empty();
        assert!(region.extents().is_empty());
        assert_eq!(region.area(), 0);
    }
}
