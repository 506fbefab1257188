use bytemuck::Pod;
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    /// Stored as one byte per element, `0` or `1`.
    Bool,
    U8,
    U16,
    U32,
    I32,
    I64,
    F16,
    F32,
}

impl DataType {
    /// Returns the size in bytes of one element.
    pub const fn size(self) -> usize {
        match self {
            DataType::Bool => 1,
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 4,
            DataType::I32 => 4,
            DataType::I64 => 8,
            DataType::F16 => 2,
            DataType::F32 => 4,
        }
    }

    /// Returns `true` if elements of this type can be read back as integers.
    pub const fn is_integral(self) -> bool {
        !matches!(self, DataType::F16 | DataType::F32)
    }

    /// Decodes the first element of `bytes` as a signed integer.
    /// Returns `None` for floating point types or if `bytes` is too short.
    pub fn read_int(self, bytes: &[u8]) -> Option<i64> {
        let bytes = bytes.get(..self.size())?;
        let value = match self {
            DataType::Bool | DataType::U8 => bytes[0] as i64,
            DataType::U16 => u16::from_ne_bytes(bytes.try_into().ok()?) as i64,
            DataType::U32 => u32::from_ne_bytes(bytes.try_into().ok()?) as i64,
            DataType::I32 => i32::from_ne_bytes(bytes.try_into().ok()?) as i64,
            DataType::I64 => i64::from_ne_bytes(bytes.try_into().ok()?),
            DataType::F16 | DataType::F32 => return None,
        };
        Some(value)
    }

    /// Encodes `value` as one element of this type.
    /// Returns `None` for floating point types or if the value does not fit.
    pub fn write_int(self, value: i64) -> Option<Box<[u8]>> {
        let bytes = match self {
            DataType::Bool => match value {
                0 | 1 => vec![value as u8],
                _ => return None,
            },
            DataType::U8 => u8::try_from(value).ok()?.to_ne_bytes().to_vec(),
            DataType::U16 => u16::try_from(value).ok()?.to_ne_bytes().to_vec(),
            DataType::U32 => u32::try_from(value).ok()?.to_ne_bytes().to_vec(),
            DataType::I32 => i32::try_from(value).ok()?.to_ne_bytes().to_vec(),
            DataType::I64 => value.to_ne_bytes().to_vec(),
            DataType::F16 | DataType::F32 => return None,
        };
        Some(bytes.into_boxed_slice())
    }
}

pub trait Scalar: Sized + Pod + Send + Sync + sealed::Sealed {
    const DATA_TYPE: DataType;
}

impl Scalar for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

impl Scalar for u16 {
    const DATA_TYPE: DataType = DataType::U16;
}

impl Scalar for u32 {
    const DATA_TYPE: DataType = DataType::U32;
}

impl Scalar for i32 {
    const DATA_TYPE: DataType = DataType::I32;
}

impl Scalar for i64 {
    const DATA_TYPE: DataType = DataType::I64;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

mod sealed {
    use half::f16;

    pub trait Sealed {}

    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for f16 {}
    impl Sealed for f32 {}
}
