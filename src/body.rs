//! User-supplied per-element operations and the arguments bound to them.

use std::{fmt, sync::Arc};

use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    num::{DataType, Scalar},
    param::Slot,
    tile::TileRef,
};

/// The kind of one argument in a body's signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Arg {
    #[display("index")]
    Index,
    #[display("offset")]
    Offset,
    #[display("tile_index")]
    TileIndex,
    #[display("scalar<{_0}>")]
    Scalar(DataType),
    #[display("tile<{_0}>")]
    Tile(DataType),
}

type BodyFn = dyn Fn(&mut Args<'_>) + Send + Sync;

/// A callable with a declared signature. Clones share the callable.
#[derive(Clone)]
pub struct Body {
    signature: Arc<[Arg]>,
    f: Arc<BodyFn>,
}

impl Body {
    pub fn new(
        signature: impl Into<Vec<Arg>>,
        f: impl Fn(&mut Args<'_>) + Send + Sync + 'static,
    ) -> Self {
        let signature = signature.into().into();
        let f = Arc::new(f);
        Self { signature, f }
    }

    #[inline]
    pub fn signature(&self) -> &[Arg] {
        &self.signature
    }

    #[inline]
    pub(crate) fn call(&self, args: &mut Args<'_>) {
        (self.f)(args)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn({})", self.signature.iter().format(", "))
    }
}

/// A resolved argument: either an index value or a reference to a parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Value {
    Index(usize),
    Offset(usize),
    TileIndex(usize),
    Slot(usize),
}

/// The arguments of one body invocation, in binding order.
///
/// Accessors are checked against what the statement tree bound at each position. Asking
/// for a different kind or element type than the body's own signature is a programming
/// error and panics.
pub struct Args<'a> {
    values: &'a [Value],
    slots: &'a mut [Slot],
}

impl<'a> Args<'a> {
    #[inline]
    pub(crate) fn new(values: &'a [Value], slots: &'a mut [Slot]) -> Self {
        Self { values, slots }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    fn value(&self, position: usize) -> Value {
        match self.values.get(position) {
            Some(&value) => value,
            None => panic!(
                "argument {position} out of range for {} arguments",
                self.values.len()
            ),
        }
    }

    /// The global index bound at `position`.
    ///
    /// # Panics
    /// Panics if the argument is not an index.
    #[inline]
    pub fn index(&self, position: usize) -> usize {
        match self.value(position) {
            Value::Index(index) => index,
            value => panic!("argument {position} is {value:?}, not an index"),
        }
    }

    /// The local offset bound at `position`.
    ///
    /// # Panics
    /// Panics if the argument is not an offset.
    #[inline]
    pub fn offset(&self, position: usize) -> usize {
        match self.value(position) {
            Value::Offset(offset) => offset,
            value => panic!("argument {position} is {value:?}, not an offset"),
        }
    }

    /// The tile number bound at `position`.
    ///
    /// # Panics
    /// Panics if the argument is not a tile number.
    #[inline]
    pub fn tile_index(&self, position: usize) -> usize {
        match self.value(position) {
            Value::TileIndex(tile) => tile,
            value => panic!("argument {position} is {value:?}, not a tile number"),
        }
    }

    fn scalar_slot(&mut self, position: usize, data_type: DataType) -> &mut u64 {
        let slot = match self.value(position) {
            Value::Slot(slot) => slot,
            value => panic!("argument {position} is {value:?}, not a scalar"),
        };
        match &mut self.slots[slot] {
            Slot::Scalar { r#type, bits } => {
                assert_eq!(
                    *r#type, data_type,
                    "scalar argument {position} holds {}, accessed as {data_type}",
                    r#type
                );
                bits
            }
            Slot::Tile(_) => panic!("argument {position} is a tile, not a scalar"),
        }
    }

    /// Reads the scalar bound at `position`.
    ///
    /// # Panics
    /// Panics if the argument is not a scalar of type `T`.
    #[inline]
    pub fn scalar<T: Scalar>(&mut self, position: usize) -> T {
        T::from_bits(*self.scalar_slot(position, T::DATA_TYPE))
    }

    /// Writes the scalar bound at `position`. Later bodies in the same traversal context
    /// observe the new value.
    ///
    /// # Panics
    /// Panics if the argument is not a scalar of type `T`.
    #[inline]
    pub fn set_scalar<T: Scalar>(&mut self, position: usize, value: T) {
        *self.scalar_slot(position, T::DATA_TYPE) = value.to_bits();
    }

    /// # Panics
    /// Panics if the argument is not a scalar of type `T`.
    #[inline]
    pub fn update_scalar<T: Scalar>(&mut self, position: usize, f: impl FnOnce(T) -> T) {
        let bits = self.scalar_slot(position, T::DATA_TYPE);
        *bits = f(T::from_bits(*bits)).to_bits();
    }

    /// Typed access to the staged local tile bound at `position`.
    ///
    /// # Panics
    /// Panics if the argument is not a staged tile of element type `T`.
    #[inline]
    pub fn tile<T: Scalar>(&self, position: usize) -> TileRef<'_, T> {
        let slot = match self.value(position) {
            Value::Slot(slot) => slot,
            value => panic!("argument {position} is {value:?}, not a tile"),
        };
        match &self.slots[slot] {
            Slot::Tile(Some(tile)) => tile.typed(),
            Slot::Tile(None) => panic!("tile argument {position} is not staged"),
            Slot::Scalar { .. } => panic!("argument {position} is a scalar, not a tile"),
        }
    }
}
