use derive_more::{Deref, DerefMut, Display, From};
use itertools::Itertools;

use crate::{
    body::Arg,
    num::{DataType, Scalar},
    tile::{LocalTile, TileDecl},
};

/// One slot of the parameter tuple.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Param {
    /// A mutable scalar, copied into every traversal context.
    #[display("{}", r#type)]
    Scalar { r#type: DataType, bits: u64 },
    /// A local tile declaration, allocated by a `Stage` statement.
    #[display("tile<{_0}>")]
    Tile(TileDecl),
}

impl Param {
    /// A scalar slot with initial value `value`.
    #[inline]
    pub fn scalar<T: Scalar>(value: T) -> Self {
        let r#type = T::DATA_TYPE;
        let bits = value.to_bits();
        Self::Scalar { r#type, bits }
    }

    #[inline]
    pub fn tile(decl: TileDecl) -> Self {
        Self::Tile(decl)
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        match self {
            Param::Scalar { r#type, .. } => *r#type,
            Param::Tile(decl) => decl.r#type,
        }
    }

    /// The argument kind a body receives when bound to this slot.
    #[inline]
    pub fn arg(&self) -> Arg {
        match self {
            Param::Scalar { r#type, .. } => Arg::Scalar(*r#type),
            Param::Tile(decl) => Arg::Tile(decl.r#type),
        }
    }

    #[inline]
    pub fn as_tile(&self) -> Option<&TileDecl> {
        match self {
            Param::Tile(decl) => Some(decl),
            Param::Scalar { .. } => None,
        }
    }
}

impl From<TileDecl> for Param {
    fn from(value: TileDecl) -> Self {
        Self::Tile(value)
    }
}

/// The ordered, fixed-arity parameter tuple.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deref, DerefMut, From, Display)]
#[display("({})", _0.iter().format(", "))]
pub struct Params(Vec<Param>);

impl Params {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots.
    #[inline]
    pub fn arity(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<Param> for Params {
    fn from_iter<I: IntoIterator<Item = Param>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Param; N]> for Params {
    fn from(value: [Param; N]) -> Self {
        Self(value.into())
    }
}

/// The live value of a slot inside one traversal context.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Scalar { r#type: DataType, bits: u64 },
    /// `None` while the tile is not staged.
    Tile(Option<LocalTile>),
}

impl From<&Param> for Slot {
    fn from(value: &Param) -> Self {
        match value {
            &Param::Scalar { r#type, bits } => Slot::Scalar { r#type, bits },
            Param::Tile(_) => Slot::Tile(None),
        }
    }
}
