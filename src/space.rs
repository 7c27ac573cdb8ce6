use std::ops::Range;

use casey::snake;
use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::statement::Policy;

#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("segment error: begin {begin} exceeds end {end}")]
    Order { begin: usize, end: usize },
    #[error("segment error: stride must be positive")]
    Stride,
    #[error("tile error: tile size of dimension {0} must be positive")]
    TileSize(usize),
}

/// A bounded, steppable 1-D index range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{begin}..{end}:{stride}")]
pub struct Segment {
    begin: usize,
    end: usize,
    stride: usize,
}

impl Segment {
    pub fn new(begin: usize, end: usize, stride: usize) -> Result<Self, SpaceError> {
        if begin > end {
            return Err(SpaceError::Order { begin, end });
        }
        if stride == 0 {
            return Err(SpaceError::Stride);
        }
        Ok(Self { begin, end, stride })
    }

    /// A unit-stride segment. The bounds are not validated until [`Segment::check`], which
    /// building a kernel does for every segment of its space.
    #[inline]
    pub fn range(range: Range<usize>) -> Self {
        let Range { start, end } = range;
        Self {
            begin: start,
            end,
            stride: 1,
        }
    }

    pub fn check(self) -> Result<Self, SpaceError> {
        let Self { begin, end, stride } = self;
        Self::new(begin, end, stride)
    }

    #[inline]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of iterations.
    #[inline]
    pub fn len(&self) -> usize {
        self.end
            .saturating_sub(self.begin)
            .div_ceil(self.stride.max(1))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// The candidate global index of iteration `position`. It may lie past `end`.
    #[inline]
    pub fn index_at(&self, position: usize) -> usize {
        self.begin + position * self.stride
    }

    /// Checks if iteration `position` maps to an index strictly less than `end`.
    #[inline]
    pub fn contains_position(&self, position: usize) -> bool {
        self.index_at(position) < self.end
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = usize> + Clone {
        (self.begin..self.end).step_by(self.stride)
    }
}

impl From<Range<usize>> for Segment {
    #[inline]
    fn from(value: Range<usize>) -> Self {
        Self::range(value)
    }
}

/// The ordered tuple of segments a kernel traverses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct IterationSpace(Vec<Segment>);

impl IterationSpace {
    /// Number of dimensions.
    #[inline]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of points in the space.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.iter().map(Segment::len).product()
    }

    /// Fails on the first segment with inverted bounds or a zero stride.
    pub fn check(&self) -> Result<(), SpaceError> {
        self.0.iter().try_for_each(|segment| segment.check().map(|_| ()))
    }
}

macro_rules! impl_space_from {
    ($($t:ident),+) => {
        impl<$($t),+> From<($($t,)+)> for IterationSpace
        where
            $($t: Into<Segment>),+
        {
            #[inline]
            fn from(($(snake!($t),)+): ($($t,)+)) -> Self {
                Self(vec![$(snake!($t).into()),+])
            }
        }
    };
}

impl_space_from!(T0);
impl_space_from!(T0, T1);
impl_space_from!(T0, T1, T2);
impl_space_from!(T0, T1, T2, T3);
impl_space_from!(T0, T1, T2, T3, T4);
impl_space_from!(T0, T1, T2, T3, T4, T5);
impl_space_from!(T0, T1, T2, T3, T4, T5, T6);
impl_space_from!(T0, T1, T2, T3, T4, T5, T6, T7);

/// Partitions one dimension into fixed-size chunks.
///
/// Outer tile `b` and inner offset `t` address iteration `b * size + t` of the
/// dimension's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TileDescriptor {
    pub dim: usize,
    pub size: usize,
    /// Traversal of the outer tile index.
    pub outer: Policy,
    /// Traversal inherited by inner loops over the same dimension.
    pub inner: Policy,
}

impl TileDescriptor {
    pub fn check(self) -> Result<Self, SpaceError> {
        if self.size == 0 {
            return Err(SpaceError::TileSize(self.dim));
        }
        Ok(self)
    }

    /// Number of tiles covering `len` iterations.
    #[inline]
    pub fn num_tiles(&self, len: usize) -> usize {
        len.div_ceil(self.size)
    }
}

/// The part of a dimension a traversal currently covers, in iteration positions.
///
/// Windows created by tiling always span the full tile size; positions at or past
/// `limit` fall outside the segment or the enclosing tile and are invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub start: usize,
    pub len: usize,
    pub limit: usize,
}

impl Window {
    #[inline]
    pub fn full(segment: &Segment) -> Self {
        let len = segment.len();
        Self {
            start: 0,
            len,
            limit: len,
        }
    }

    /// Exclusive end of the valid positions in this window.
    #[inline]
    pub fn valid_end(&self) -> usize {
        self.limit.min(self.start + self.len)
    }

    /// Checks if absolute `position` is a valid iteration of this window.
    #[inline]
    pub fn contains(&self, position: usize) -> bool {
        position >= self.start && position < self.valid_end()
    }

    /// The window of tile `tile` of size `size` within this window.
    #[inline]
    pub fn tile(&self, size: usize, tile: usize) -> Self {
        Self {
            start: self.start + tile * size,
            len: size,
            limit: self.valid_end(),
        }
    }

    /// Number of tiles of `size` that start at a valid position of this window.
    #[inline]
    pub fn num_tiles(&self, size: usize) -> usize {
        self.valid_end().saturating_sub(self.start).div_ceil(size)
    }
}
