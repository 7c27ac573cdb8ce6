use bytemuck::Pod;
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F16,
    F32,
    F64,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl DataType {
    /// Returns the size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F16 => 2,
            DataType::F32 => 4,
            DataType::F64 => 8,
            DataType::I32 => 4,
            DataType::I64 => 8,
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 4,
            DataType::U64 => 8,
        }
    }
}

pub trait Zero {
    fn zero() -> Self;
}

macro_rules! impl_zero {
    ($ty:ty, $zero:expr) => {
        impl Zero for $ty {
            fn zero() -> Self {
                $zero
            }
        }
    };
}

impl_zero!(f16, f16::ZERO);
impl_zero!(f32, 0.0);
impl_zero!(f64, 0.0);
impl_zero!(i32, 0);
impl_zero!(i64, 0);
impl_zero!(u8, 0);
impl_zero!(u16, 0);
impl_zero!(u32, 0);
impl_zero!(u64, 0);

/// An element type that can live in a parameter slot, a local tile or a view.
///
/// Every scalar fits in 64 bits, so storage cells are uniform `u64` words regardless of the
/// element type.
pub trait Scalar:
    Sized + Copy + Pod + Zero + PartialEq + std::fmt::Debug + Send + Sync + sealed::Sealed
{
    const DATA_TYPE: DataType;

    /// Packs the value into the low bytes of a storage word.
    #[inline]
    fn to_bits(self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..size_of::<Self>()].copy_from_slice(bytemuck::bytes_of(&self));
        u64::from_ne_bytes(bytes)
    }

    /// Unpacks a value previously packed by [`Scalar::to_bits`].
    #[inline]
    fn from_bits(bits: u64) -> Self {
        let bytes = bits.to_ne_bytes();
        bytemuck::pod_read_unaligned(&bytes[..size_of::<Self>()])
    }
}

macro_rules! impl_scalar {
    ($ty:ty, $data_type:expr) => {
        impl Scalar for $ty {
            const DATA_TYPE: DataType = $data_type;
        }
    };
}

impl_scalar!(f16, DataType::F16);
impl_scalar!(f32, DataType::F32);
impl_scalar!(f64, DataType::F64);
impl_scalar!(i32, DataType::I32);
impl_scalar!(i64, DataType::I64);
impl_scalar!(u8, DataType::U8);
impl_scalar!(u16, DataType::U16);
impl_scalar!(u32, DataType::U32);
impl_scalar!(u64, DataType::U64);

mod sealed {
    use half::f16;

    pub trait Sealed {}

    impl Sealed for f16 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}
