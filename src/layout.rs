use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("layout permutation error: {0:?} is not a permutation of {1} axes")]
    Permutation(Vec<usize>, usize),
    #[error("layout shape error: axis {0} has zero extent")]
    Empty(usize),
}

/// Maps a multi-dimensional index to a linear address.
///
/// The permutation lists axes from the slowest to the fastest varying one,
/// so the last entry of the permutation is the axis with stride 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("({}):({})", shape.iter().format(", "), stride.iter().format(", "))]
pub struct Layout {
    shape: Box<[usize]>,
    stride: Box<[usize]>,
    permutation: Box<[usize]>,
}

impl Layout {
    /// A row-major layout: the last axis is contiguous.
    pub fn from_shape(shape: impl AsRef<[usize]>) -> Self {
        let shape = shape.as_ref();
        let permutation = (0..shape.len()).collect_vec();
        let stride = compute_stride(shape, &permutation);
        Self {
            shape: shape.into(),
            stride: stride.into(),
            permutation: permutation.into(),
        }
    }

    /// A layout whose axes are ordered by `permutation`, slowest first.
    pub fn permuted(
        shape: impl AsRef<[usize]>,
        permutation: impl AsRef<[usize]>,
    ) -> Result<Self, LayoutError> {
        let shape = shape.as_ref();
        let permutation = permutation.as_ref();
        check_permutation(permutation, shape.len())?;
        let stride = compute_stride(shape, permutation);
        Ok(Self {
            shape: shape.into(),
            stride: stride.into(),
            permutation: permutation.into(),
        })
    }

    /// Fails if any axis has zero extent.
    pub fn check_extent(self) -> Result<Self, LayoutError> {
        match self.shape.iter().position(|&x| x == 0) {
            Some(axis) => Err(LayoutError::Empty(axis)),
            None => Ok(self),
        }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn stride(&self) -> &[usize] {
        &self.stride
    }

    #[inline]
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    /// Number of axes.
    #[inline]
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// Number of elements addressed by the layout.
    #[inline]
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// The axis with stride 1.
    #[inline]
    pub fn contiguous_axis(&self) -> Option<usize> {
        self.permutation.last().copied()
    }

    /// Linear address of `index`, without bounds checking.
    #[inline]
    pub fn value(&self, index: impl AsRef<[usize]>) -> usize {
        itertools::izip!(index.as_ref(), self.stride.iter())
            .map(|(index, stride)| index * stride)
            .sum()
    }

    /// Linear address of `index`, or `None` if the rank mismatches or any axis is out of range.
    #[inline]
    pub fn checked_value(&self, index: impl AsRef<[usize]>) -> Option<usize> {
        let index = index.as_ref();
        if index.len() != self.len() {
            return None;
        }
        itertools::izip!(index, self.shape.iter(), self.stride.iter())
            .try_fold(0, |acc, (&index, &shape, &stride)| {
                (index < shape).then_some(acc + index * stride)
            })
    }
}

fn check_permutation(permutation: &[usize], rank: usize) -> Result<(), LayoutError> {
    let valid = permutation.len() == rank
        && permutation.iter().all(|&axis| axis < rank)
        && permutation.iter().all_unique();
    if !valid {
        return Err(LayoutError::Permutation(permutation.to_vec(), rank));
    }
    Ok(())
}

fn compute_stride(shape: &[usize], permutation: &[usize]) -> Vec<usize> {
    let mut stride = vec![0; shape.len()];
    let mut acc = 1;
    for &axis in permutation.iter().rev() {
        stride[axis] = acc;
        acc *= shape[axis];
    }
    stride
}
