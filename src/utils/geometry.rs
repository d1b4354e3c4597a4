use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Type-level marker for the logical coordinate space
#[derive(Debug)]
pub struct Logical;

/// Type-level marker for the physical coordinate space
#[derive(Debug)]
pub struct Physical;

/// Type-level marker for the buffer coordinate space
#[derive(Debug)]
pub struct Buffer;

/// Trait for types serving as a coordinate for other geometry utils
pub trait Coordinate:
    Sized + Add<Self, Output = Self> + Sub<Self, Output = Self> + PartialOrd + Default + Copy + fmt::Debug
{
    /// A Coordinate that is 0
    const ZERO: Self;
    /// Downscale the coordinate
    fn downscale(self, scale: Self) -> Self;
    /// Upscale the coordinate
    fn upscale(self, scale: Self) -> Self;
    /// Convert the coordinate to a f64
    fn to_f64(self) -> f64;
    /// Convert to this coordinate from a f64
    fn from_f64(v: f64) -> Self;
    /// Compare and return the smaller one
    fn min(self, other: Self) -> Self {
        if self < other {
            self
        } else {
            other
        }
    }
    /// Compare and return the larger one
    fn max(self, other: Self) -> Self {
        if self > other {
            self
        } else {
            other
        }
    }
    /// Test if the coordinate is not negative
    fn non_negative(self) -> bool;
    /// Saturating integer addition
    fn saturating_add(self, other: Self) -> Self;
    /// Saturating integer subtraction
    fn saturating_sub(self, other: Self) -> Self;
}

macro_rules! signed_coordinate_impl {
    ($($ty:ty),*) => {
        $(
            impl Coordinate for $ty {
                const ZERO: $ty = 0;

                #[inline]
                fn downscale(self, scale: Self) -> Self {
                    self / scale
                }

                #[inline]
                fn upscale(self, scale: Self) -> Self {
                    self.saturating_mul(scale)
                }

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn from_f64(v: f64) -> Self {
                    v as Self
                }

                #[inline]
                fn non_negative(self) -> bool {
                    self >= 0
                }

                #[inline]
                fn saturating_add(self, other: Self) -> Self {
                    self.saturating_add(other)
                }

                #[inline]
                fn saturating_sub(self, other: Self) -> Self {
                    self.saturating_sub(other)
                }
            }
        )*
    };
}

signed_coordinate_impl!(i32, i64);

impl Coordinate for f64 {
    const ZERO: f64 = 0.0;

    #[inline]
    fn downscale(self, scale: Self) -> Self {
        self / scale
    }

    #[inline]
    fn upscale(self, scale: Self) -> Self {
        self * scale
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn non_negative(self) -> bool {
        self >= 0.0
    }

    #[inline]
    fn saturating_add(self, other: Self) -> Self {
        self + other
    }

    #[inline]
    fn saturating_sub(self, other: Self) -> Self {
        self - other
    }
}

/// A point as defined by its x and y coordinates
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: std::marker::PhantomData<Kind>,
}

impl<N: Coordinate, Kind> Point<N, Kind> {
    /// Create a new point from the coordinates
    #[inline]
    pub fn new(x: N, y: N) -> Self {
        Point {
            x,
            y,
            _kind: std::marker::PhantomData,
        }
    }

    /// Convert this point to f64 coordinates
    #[inline]
    pub fn to_f64(self) -> Point<f64, Kind> {
        Point::new(self.x.to_f64(), self.y.to_f64())
    }

    /// Convert the underlying numerical type to another
    #[inline]
    pub fn to<J: Coordinate>(self) -> Point<J, Kind> {
        Point::new(J::from_f64(self.x.to_f64()), J::from_f64(self.y.to_f64()))
    }

    /// Upscale the point by a scale factor
    #[inline]
    pub fn upscale(self, scale: N) -> Self {
        Point::new(self.x.upscale(scale), self.y.upscale(scale))
    }

    /// Downscale the point by a scale factor
    #[inline]
    pub fn downscale(self, scale: N) -> Self {
        Point::new(self.x.downscale(scale), self.y.downscale(scale))
    }
}

impl<N: Coordinate, Kind> Add for Point<N, Kind> {
    type Output = Point<N, Kind>;
    #[inline]
    fn add(self, other: Point<N, Kind>) -> Point<N, Kind> {
        Point::new(self.x + other.x, self.y + other.y)
    }
}

impl<N: Coordinate, Kind> AddAssign for Point<N, Kind> {
    #[inline]
    fn add_assign(&mut self, rhs: Point<N, Kind>) {
        self.x = self.x + rhs.x;
        self.y = self.y + rhs.y;
    }
}

impl<N: Coordinate, Kind> Sub for Point<N, Kind> {
    type Output = Point<N, Kind>;
    #[inline]
    fn sub(self, other: Point<N, Kind>) -> Point<N, Kind> {
        Point::new(self.x - other.x, self.y - other.y)
    }
}

impl<N: Coordinate, Kind> SubAssign for Point<N, Kind> {
    #[inline]
    fn sub_assign(&mut self, rhs: Point<N, Kind>) {
        self.x = self.x - rhs.x;
        self.y = self.y - rhs.y;
    }
}

impl<N: Coordinate, Kind> Clone for Point<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<N: Coordinate, Kind> Copy for Point<N, Kind> {}

impl<N: Coordinate, Kind> PartialEq for Point<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<N: Coordinate + Eq, Kind> Eq for Point<N, Kind> {}

impl<N: Coordinate, Kind> Default for Point<N, Kind> {
    #[inline]
    fn default() -> Self {
        Point::new(N::ZERO, N::ZERO)
    }
}

impl<N: Coordinate, Kind> fmt::Debug for Point<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point")
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

impl<N: Coordinate, Kind> From<(N, N)> for Point<N, Kind> {
    #[inline]
    fn from((x, y): (N, N)) -> Point<N, Kind> {
        Point::new(x, y)
    }
}

/// A size as defined by its width and height
///
/// Constructors of this type ensure width and height are never negative.
pub struct Size<N, Kind> {
    /// horizontal dimension
    pub w: N,
    /// vertical dimension
    pub h: N,
    _kind: std::marker::PhantomData<Kind>,
}

impl<N: Coordinate, Kind> Size<N, Kind> {
    /// Create a new size from the dimensions
    ///
    /// Negative dimensions are clamped to 0.
    #[inline]
    pub fn new(w: N, h: N) -> Self {
        Size {
            w: w.max(N::ZERO),
            h: h.max(N::ZERO),
            _kind: std::marker::PhantomData,
        }
    }

    /// Check if this size is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        !(self.w > N::ZERO && self.h > N::ZERO)
    }

    /// Convert this size to f64 dimensions
    #[inline]
    pub fn to_f64(self) -> Size<f64, Kind> {
        Size::new(self.w.to_f64(), self.h.to_f64())
    }

    /// Convert the underlying numerical type to another
    #[inline]
    pub fn to<J: Coordinate>(self) -> Size<J, Kind> {
        Size::new(J::from_f64(self.w.to_f64()), J::from_f64(self.h.to_f64()))
    }

    /// Upscale the size by a scale factor
    #[inline]
    pub fn upscale(self, scale: N) -> Self {
        Size::new(self.w.upscale(scale), self.h.upscale(scale))
    }

    /// Downscale the size by a scale factor
    #[inline]
    pub fn downscale(self, scale: N) -> Self {
        Size::new(self.w.downscale(scale), self.h.downscale(scale))
    }
}

impl<N: Coordinate, Kind> Clone for Size<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<N: Coordinate, Kind> Copy for Size<N, Kind> {}

impl<N: Coordinate, Kind> PartialEq for Size<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<N: Coordinate + Eq, Kind> Eq for Size<N, Kind> {}

impl<N: Coordinate, Kind> Default for Size<N, Kind> {
    #[inline]
    fn default() -> Self {
        Size::new(N::ZERO, N::ZERO)
    }
}

impl<N: Coordinate, Kind> fmt::Debug for Size<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size")
            .field("w", &self.w)
            .field("h", &self.h)
            .finish()
    }
}

impl<N: Coordinate, Kind> From<(N, N)> for Size<N, Kind> {
    #[inline]
    fn from((w, h): (N, N)) -> Size<N, Kind> {
        Size::new(w, h)
    }
}

impl<N: Coordinate, Kind> Add for Size<N, Kind> {
    type Output = Size<N, Kind>;
    #[inline]
    fn add(self, other: Size<N, Kind>) -> Size<N, Kind> {
        Size::new(self.w.saturating_add(other.w), self.h.saturating_add(other.h))
    }
}

/// A rectangle defined by its top-left corner and dimensions
pub struct Rectangle<N, Kind> {
    /// Location of the top-left corner of the rectangle
    pub loc: Point<N, Kind>,
    /// Size of the rectangle, as (width, height)
    pub size: Size<N, Kind>,
}

impl<N: Coordinate, Kind> Rectangle<N, Kind> {
    /// Create a new [`Rectangle`] from location and size
    #[inline]
    pub fn new(loc: Point<N, Kind>, size: Size<N, Kind>) -> Self {
        Rectangle { loc, size }
    }

    /// Create a new [`Rectangle`] with location (0, 0)
    #[inline]
    pub fn from_size(size: Size<N, Kind>) -> Self {
        Rectangle {
            loc: Point::default(),
            size,
        }
    }

    /// Create a new [`Rectangle`] from the coordinates of its top-left and bottom-right corners
    #[inline]
    pub fn from_extents(topleft: impl Into<Point<N, Kind>>, bottomright: impl Into<Point<N, Kind>>) -> Self {
        let topleft = topleft.into();
        let bottomright = bottomright.into();
        Rectangle {
            loc: topleft,
            size: Size::new(bottomright.x - topleft.x, bottomright.y - topleft.y),
        }
    }

    /// Check if this rectangle is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    /// Convert this rectangle to f64 coordinates
    #[inline]
    pub fn to_f64(self) -> Rectangle<f64, Kind> {
        Rectangle::new(self.loc.to_f64(), self.size.to_f64())
    }

    /// Convert the underlying numerical type to another
    #[inline]
    pub fn to<J: Coordinate>(self) -> Rectangle<J, Kind> {
        Rectangle::new(self.loc.to(), self.size.to())
    }

    /// Checks whether given point is inside the rectangle
    #[inline]
    pub fn contains<P: Into<Point<N, Kind>>>(self, point: P) -> bool {
        let p = point.into();
        (p.x >= self.loc.x)
            && (p.x < self.loc.x.saturating_add(self.size.w))
            && (p.y >= self.loc.y)
            && (p.y < self.loc.y.saturating_add(self.size.h))
    }

    /// Checks whether the given rectangle is fully contained in this one
    #[inline]
    pub fn contains_rect<R: Into<Rectangle<N, Kind>>>(self, rect: R) -> bool {
        let r = rect.into();
        r.loc.x >= self.loc.x
            && r.loc.y >= self.loc.y
            && r.loc.x.saturating_add(r.size.w) <= self.loc.x.saturating_add(self.size.w)
            && r.loc.y.saturating_add(r.size.h) <= self.loc.y.saturating_add(self.size.h)
    }

    /// Checks whether a given rectangle overlaps with this one
    #[inline]
    pub fn overlaps(self, other: impl Into<Rectangle<N, Kind>>) -> bool {
        let other = other.into();
        self.loc.x < other.loc.x.saturating_add(other.size.w)
            && other.loc.x < self.loc.x.saturating_add(self.size.w)
            && self.loc.y < other.loc.y.saturating_add(other.size.h)
            && other.loc.y < self.loc.y.saturating_add(self.size.h)
    }

    /// Clamp rectangle to another rectangle, returning `None` if they do not overlap
    #[inline]
    pub fn intersection(self, other: impl Into<Rectangle<N, Kind>>) -> Option<Self> {
        let other = other.into();
        if !self.overlaps(other) {
            return None;
        }
        Some(Rectangle::from_extents(
            (self.loc.x.max(other.loc.x), self.loc.y.max(other.loc.y)),
            (
                (self.loc.x.saturating_add(self.size.w)).min(other.loc.x.saturating_add(other.size.w)),
                (self.loc.y.saturating_add(self.size.h)).min(other.loc.y.saturating_add(other.size.h)),
            ),
        ))
    }

    /// Compute the bounding box of a given set of points
    pub fn bounding_box(points: impl IntoIterator<Item = Point<N, Kind>>) -> Self {
        let ret = points.into_iter().fold(None, |acc, point| match acc {
            None => Some((point, point)),
            Some((min_point, max_point)) => Some((
                (point.x.min(min_point.x), point.y.min(min_point.y)).into(),
                (point.x.max(max_point.x), point.y.max(max_point.y)).into(),
            )),
        });

        match ret {
            None => Rectangle::default(),
            Some((min_point, max_point)) => Rectangle::from_extents(min_point, max_point),
        }
    }

    /// Merge two [`Rectangle`] by producing the smallest rectangle that contains both
    #[inline]
    pub fn merge(self, other: Self) -> Self {
        Self::bounding_box([
            self.loc,
            self.loc + Point::new(self.size.w, self.size.h),
            other.loc,
            other.loc + Point::new(other.size.w, other.size.h),
        ])
    }

    /// Subtract another rectangle from this one, returning the remaining parts
    pub fn subtract_rect(self, other: Self) -> Vec<Self> {
        self.subtract_rects([other])
    }

    /// Subtract a set of rectangles from this one, returning the remaining parts
    pub fn subtract_rects(self, others: impl IntoIterator<Item = Self>) -> Vec<Self> {
        let mut remaining = Vec::with_capacity(4);
        remaining.push(self);
        Self::subtract_rects_many_in_place(remaining, others)
    }

    /// Subtract a set of rectangles from a set of rectangles, returning the remaining parts
    pub fn subtract_rects_many_in_place(
        mut rects: Vec<Self>,
        others: impl IntoIterator<Item = Self>,
    ) -> Vec<Self> {
        for other in others {
            let items = rects.len();
            let mut checked = 0usize;
            let mut index = 0usize;

            if items == 0 {
                return rects;
            }

            while checked != items {
                checked += 1;

                let Some(intersection) = rects[index].intersection(other) else {
                    index += 1;
                    continue;
                };

                let item = rects.remove(index);

                if other.contains_rect(item) {
                    continue;
                }

                let top_rect = Rectangle::new(
                    item.loc,
                    Size::new(item.size.w, intersection.loc.y.saturating_sub(item.loc.y)),
                );
                let left_rect = Rectangle::new(
                    Point::new(item.loc.x, intersection.loc.y),
                    Size::new(intersection.loc.x.saturating_sub(item.loc.x), intersection.size.h),
                );
                let right_rect = Rectangle::new(
                    Point::new(
                        intersection.loc.x.saturating_add(intersection.size.w),
                        intersection.loc.y,
                    ),
                    Size::new(
                        (item.loc.x.saturating_add(item.size.w))
                            .saturating_sub(intersection.loc.x.saturating_add(intersection.size.w)),
                        intersection.size.h,
                    ),
                );
                let bottom_rect = Rectangle::new(
                    Point::new(item.loc.x, intersection.loc.y.saturating_add(intersection.size.h)),
                    Size::new(
                        item.size.w,
                        (item.loc.y.saturating_add(item.size.h))
                            .saturating_sub(intersection.loc.y.saturating_add(intersection.size.h)),
                    ),
                );

                if !top_rect.is_empty() {
                    rects.push(top_rect);
                }
                if !left_rect.is_empty() {
                    rects.push(left_rect);
                }
                if !right_rect.is_empty() {
                    rects.push(right_rect);
                }
                if !bottom_rect.is_empty() {
                    rects.push(bottom_rect);
                }
            }
        }

        rects
    }

    /// Upscale the rectangle by a scale factor
    #[inline]
    pub fn upscale(self, scale: N) -> Self {
        Rectangle::new(self.loc.upscale(scale), self.size.upscale(scale))
    }

    /// Downscale the rectangle by a scale factor
    #[inline]
    pub fn downscale(self, scale: N) -> Self {
        Rectangle::new(self.loc.downscale(scale), self.size.downscale(scale))
    }
}

impl<Kind> Rectangle<f64, Kind> {
    /// Convert to i32, rounding the rectangle outwards so that it contains the original
    #[inline]
    pub fn to_i32_up(self) -> Rectangle<i32, Kind> {
        Rectangle::from_extents(
            (self.loc.x.floor() as i32, self.loc.y.floor() as i32),
            (
                (self.loc.x + self.size.w).ceil() as i32,
                (self.loc.y + self.size.h).ceil() as i32,
            ),
        )
    }

    /// Convert to i32 by rounding all coordinates
    #[inline]
    pub fn to_i32_round(self) -> Rectangle<i32, Kind> {
        Rectangle::new(
            Point::new(self.loc.x.round() as i32, self.loc.y.round() as i32),
            Size::new(self.size.w.round() as i32, self.size.h.round() as i32),
        )
    }
}

impl<N: Coordinate, Kind> Clone for Rectangle<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<N: Coordinate, Kind> Copy for Rectangle<N, Kind> {}

impl<N: Coordinate, Kind> PartialEq for Rectangle<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<N: Coordinate + Eq, Kind> Eq for Rectangle<N, Kind> {}

impl<N: Coordinate, Kind> Default for Rectangle<N, Kind> {
    #[inline]
    fn default() -> Self {
        Rectangle {
            loc: Default::default(),
            size: Default::default(),
        }
    }
}

impl<N: Coordinate, Kind> fmt::Debug for Rectangle<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

/// Possible transformations of an output or buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Transform {
    /// Identity transformation (plane is unaltered when applied)
    #[default]
    Normal,
    /// Plane is rotated by 90 degrees
    _90,
    /// Plane is rotated by 180 degrees
    _180,
    /// Plane is rotated by 270 degrees
    _270,
    /// Plane is flipped vertically
    Flipped,
    /// Plane is flipped vertically and rotated by 90 degrees
    Flipped90,
    /// Plane is flipped vertically and rotated by 180 degrees
    Flipped180,
    /// Plane is flipped vertically and rotated by 270 degrees
    Flipped270,
}

impl Transform {
    /// Inverts the transformation
    pub fn invert(&self) -> Transform {
        match self {
            Transform::Normal => Transform::Normal,
            Transform::Flipped => Transform::Flipped,
            Transform::_90 => Transform::_270,
            Transform::_180 => Transform::_180,
            Transform::_270 => Transform::_90,
            Transform::Flipped90 => Transform::Flipped90,
            Transform::Flipped180 => Transform::Flipped180,
            Transform::Flipped270 => Transform::Flipped270,
        }
    }

    /// Transformed size after applying this transformation
    pub fn transform_size<N: Coordinate, Kind>(&self, size: Size<N, Kind>) -> Size<N, Kind> {
        if self.flipped() {
            Size::new(size.h, size.w)
        } else {
            size
        }
    }

    /// Transforms a point inside an area of a given size by applying this transformation
    pub fn transform_point_in<N: Coordinate, Kind>(
        &self,
        point: Point<N, Kind>,
        area: &Size<N, Kind>,
    ) -> Point<N, Kind> {
        match *self {
            Transform::Normal => point,
            Transform::_90 => Point::new(area.h - point.y, point.x),
            Transform::_180 => Point::new(area.w - point.x, area.h - point.y),
            Transform::_270 => Point::new(point.y, area.w - point.x),
            Transform::Flipped => Point::new(area.w - point.x, point.y),
            Transform::Flipped90 => Point::new(point.y, point.x),
            Transform::Flipped180 => Point::new(point.x, area.h - point.y),
            Transform::Flipped270 => Point::new(area.h - point.y, area.w - point.x),
        }
    }

    /// Transforms a rectangle inside an area of a given size by applying this transformation
    pub fn transform_rect_in<N: Coordinate, Kind>(
        &self,
        rect: Rectangle<N, Kind>,
        area: &Size<N, Kind>,
    ) -> Rectangle<N, Kind> {
        let size = self.transform_size(rect.size);

        let loc = match *self {
            Transform::Normal => rect.loc,
            Transform::_90 => Point::new(area.h - rect.loc.y - rect.size.h, rect.loc.x),
            Transform::_180 => Point::new(
                area.w - rect.loc.x - rect.size.w,
                area.h - rect.loc.y - rect.size.h,
            ),
            Transform::_270 => Point::new(rect.loc.y, area.w - rect.loc.x - rect.size.w),
            Transform::Flipped => Point::new(area.w - rect.loc.x - rect.size.w, rect.loc.y),
            Transform::Flipped90 => Point::new(rect.loc.y, rect.loc.x),
            Transform::Flipped180 => Point::new(rect.loc.x, area.h - rect.loc.y - rect.size.h),
            Transform::Flipped270 => Point::new(
                area.h - rect.loc.y - rect.size.h,
                area.w - rect.loc.x - rect.size.w,
            ),
        };

        Rectangle::new(loc, size)
    }

    /// Returns true if the transformation would flip width and height
    pub fn flipped(&self) -> bool {
        matches!(
            self,
            Transform::_90 | Transform::_270 | Transform::Flipped90 | Transform::Flipped270
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Logical, Point, Rectangle, Size, Transform};

    #[test]
    fn rectangle_contains_rect_itself() {
        let rect: Rectangle<i32, Logical> = Rectangle::new(Point::new(100, 150), Size::new(200, 200));
        assert!(rect.contains_rect(rect));
    }

    #[test]
    fn rectangle_intersection_with_disjoint() {
        let rect1: Rectangle<i32, Logical> = Rectangle::from_size(Size::new(100, 100));
        let rect2: Rectangle<i32, Logical> = Rectangle::new(Point::new(200, 100), Size::new(100, 100));
        assert_eq!(rect1.intersection(rect2), None);
    }

    #[test]
    fn rectangle_subtract_full_overlap() {
        let rect: Rectangle<i32, Logical> = Rectangle::from_size(Size::new(100, 100));
        assert!(rect.subtract_rect(rect).is_empty());
    }

    #[test]
    fn rectangle_subtract_center() {
        let outer: Rectangle<i32, Logical> = Rectangle::from_size(Size::new(30, 30));
        let inner: Rectangle<i32, Logical> = Rectangle::new(Point::new(10, 10), Size::new(10, 10));
        let remaining = outer.subtract_rect(inner);
        assert_eq!(remaining.len(), 4);
        let area: i32 = remaining.iter().map(|r| r.size.w * r.size.h).sum();
        assert_eq!(area, 30 * 30 - 10 * 10);
    }

    #[test]
    fn transform_rect_in_90() {
        let area = Size::new(1080, 1920);
        let rect: Rectangle<i32, Logical> = Rectangle::new(Point::new(10, 20), Size::new(100, 200));
        let transformed = Transform::_90.transform_rect_in(rect, &area);
        assert_eq!(transformed, Rectangle::new(Point::new(860, 10), Size::new(200, 100)));
    }

    #[test]
    fn transform_size_flipped() {
        let size: Size<i32, Logical> = Size::new(800, 600);
        assert_eq!(Transform::Flipped270.transform_size(size), Size::new(600, 800));
        assert_eq!(Transform::_180.transform_size(size), size);
    }
}
