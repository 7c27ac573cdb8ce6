//! Local tile buffers: small dense arrays staged once per tile visit.
//!
//! Elements are stored as one relaxed atomic word each. Within a tile visit, cross-thread
//! visibility comes from the barrier or join the statement tree places between writers and
//! readers; a missing barrier yields stale numbers, never undefined behavior.

use std::{
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    layout::{Layout, LayoutError},
    num::{DataType, Scalar},
};

/// Flat storage of scalar words.
#[derive(Debug, Clone)]
pub(crate) struct Cells(Arc<[AtomicU64]>);

impl Cells {
    pub fn new(len: usize) -> Self {
        Self((0..len).map(|_| AtomicU64::new(0)).collect())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn load(&self, index: usize) -> u64 {
        self.0[index].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&self, index: usize, bits: u64) {
        self.0[index].store(bits, Ordering::Relaxed)
    }

    /// Checks if both handles point to the same storage.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Where a staged tile lives.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Storage {
    /// Allocated fresh on every staging visit; private to the traversal (or GPU thread)
    /// that staged it.
    #[default]
    Stack,
    /// Block-shared memory on the GPU backend, visible to every thread of a block.
    Shared,
}

/// The declared element type and shape of a local tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{}{}", r#type, layout)]
pub struct TileDecl {
    pub r#type: DataType,
    pub layout: Layout,
}

impl TileDecl {
    /// Declares a row-major tile.
    pub fn new<T: Scalar>(shape: impl AsRef<[usize]>) -> Result<Self, LayoutError> {
        let layout = Layout::from_shape(shape).check_extent()?;
        let r#type = T::DATA_TYPE;
        Ok(Self { r#type, layout })
    }

    /// Declares a tile whose axes are ordered by `permutation`, slowest first.
    pub fn permuted<T: Scalar>(
        shape: impl AsRef<[usize]>,
        permutation: impl AsRef<[usize]>,
    ) -> Result<Self, LayoutError> {
        let layout = Layout::permuted(shape, permutation)?.check_extent()?;
        let r#type = T::DATA_TYPE;
        Ok(Self { r#type, layout })
    }

    /// Allocates storage for one tile. The contents are unspecified.
    pub fn allocate(&self) -> LocalTile {
        let cells = Cells::new(self.layout.size());
        let layout = self.layout.clone();
        let r#type = self.r#type;
        LocalTile {
            layout,
            r#type,
            cells,
        }
    }
}

/// A handle to an allocated local tile. Clones share the same storage.
#[derive(Debug, Clone)]
pub struct LocalTile {
    layout: Layout,
    r#type: DataType,
    cells: Cells,
}

impl LocalTile {
    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    /// Checks if both handles refer to the same storage.
    #[inline]
    pub fn same_storage(&self, other: &Self) -> bool {
        self.cells.ptr_eq(&other.cells)
    }

    /// Returns a typed accessor.
    ///
    /// # Panics
    /// Panics if `T` is not the declared element type.
    #[inline]
    pub fn typed<T: Scalar>(&self) -> TileRef<'_, T> {
        assert_eq!(
            self.r#type,
            T::DATA_TYPE,
            "local tile holds {} elements, accessed as {}",
            self.r#type,
            T::DATA_TYPE
        );
        TileRef {
            tile: self,
            phantom: PhantomData,
        }
    }
}

/// Typed element access to a [`LocalTile`].
#[derive(Debug, Clone, Copy)]
pub struct TileRef<'a, T> {
    tile: &'a LocalTile,
    phantom: PhantomData<T>,
}

impl<T: Scalar> TileRef<'_, T> {
    #[inline]
    fn address(&self, index: &[usize]) -> usize {
        match self.tile.layout.checked_value(index) {
            Some(address) => address,
            None => panic!(
                "local tile index {index:?} out of bounds for layout {}",
                self.tile.layout
            ),
        }
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.tile.layout
    }

    /// # Panics
    /// Panics if `index` is out of the tile's shape.
    #[inline]
    pub fn get(&self, index: impl AsRef<[usize]>) -> T {
        let address = self.address(index.as_ref());
        T::from_bits(self.tile.cells.load(address))
    }

    /// # Panics
    /// Panics if `index` is out of the tile's shape.
    #[inline]
    pub fn set(&self, index: impl AsRef<[usize]>, value: T) {
        let address = self.address(index.as_ref());
        self.tile.cells.store(address, value.to_bits())
    }

    /// Read-modify-write of one element. Not atomic with respect to other writers.
    #[inline]
    pub fn update(&self, index: impl AsRef<[usize]>, f: impl FnOnce(T) -> T) {
        let address = self.address(index.as_ref());
        let value = T::from_bits(self.tile.cells.load(address));
        self.tile.cells.store(address, f(value).to_bits())
    }
}
