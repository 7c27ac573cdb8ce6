//! A shared, bounds-checked multi-dimensional accessor over a flat buffer.
//!
//! Bodies capture clones of a [`View`] to read and write caller memory from any backend.

use std::marker::PhantomData;

use itertools::Itertools;
use thiserror::Error;

use crate::{
    layout::{Layout, LayoutError},
    num::Scalar,
    tile::Cells,
};

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("view layout error")]
    Layout(#[from] LayoutError),
    #[error("view creation error: layout {0}'s size not match data len {1}")]
    Create(Layout, usize),
}

/// Clones share the same buffer.
#[derive(Debug, Clone)]
pub struct View<T> {
    layout: Layout,
    cells: Cells,
    phantom: PhantomData<T>,
}

impl<T: Scalar> View<T> {
    /// A zero-filled row-major view.
    pub fn new(shape: impl AsRef<[usize]>) -> Self {
        Self::with_layout(Layout::from_shape(shape))
    }

    /// A zero-filled view whose axes are ordered by `permutation`, slowest first.
    pub fn permuted(
        shape: impl AsRef<[usize]>,
        permutation: impl AsRef<[usize]>,
    ) -> Result<Self, ViewError> {
        let layout = Layout::permuted(shape, permutation)?;
        Ok(Self::with_layout(layout))
    }

    /// Wraps `data`, laid out in linear address order of a row-major layout.
    pub fn from_vec(shape: impl AsRef<[usize]>, data: Vec<T>) -> Result<Self, ViewError> {
        let layout = Layout::from_shape(shape);
        if layout.size() != data.len() {
            return Err(ViewError::Create(layout, data.len()));
        }
        let view = Self::with_layout(layout);
        for (address, value) in data.into_iter().enumerate() {
            view.cells.store(address, value.to_bits());
        }
        Ok(view)
    }

    fn with_layout(layout: Layout) -> Self {
        let cells = Cells::new(layout.size());
        let view = Self {
            layout,
            cells,
            phantom: PhantomData,
        };
        view.fill(T::zero());
        view
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.len() == 0
    }

    #[inline]
    fn address(&self, index: &[usize]) -> usize {
        match self.layout.checked_value(index) {
            Some(address) => address,
            None => panic!(
                "view index {index:?} out of bounds for layout {}",
                self.layout
            ),
        }
    }

    /// # Panics
    /// Panics if `index` is out of the view's shape.
    #[inline]
    pub fn get(&self, index: impl AsRef<[usize]>) -> T {
        let address = self.address(index.as_ref());
        T::from_bits(self.cells.load(address))
    }

    /// # Panics
    /// Panics if `index` is out of the view's shape.
    #[inline]
    pub fn set(&self, index: impl AsRef<[usize]>, value: T) {
        let address = self.address(index.as_ref());
        self.cells.store(address, value.to_bits())
    }

    /// Read-modify-write of one element. Not atomic with respect to other writers.
    #[inline]
    pub fn update(&self, index: impl AsRef<[usize]>, f: impl FnOnce(T) -> T) {
        let address = self.address(index.as_ref());
        let value = T::from_bits(self.cells.load(address));
        self.cells.store(address, f(value).to_bits())
    }

    pub fn fill(&self, value: T) {
        let bits = value.to_bits();
        (0..self.cells.len()).for_each(|address| self.cells.store(address, bits));
    }

    /// Copies the buffer out in linear address order.
    pub fn to_vec(&self) -> Vec<T> {
        (0..self.cells.len())
            .map(|address| T::from_bits(self.cells.load(address)))
            .collect_vec()
    }
}
