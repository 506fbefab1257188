use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    layout::{IntoLayout, Layout},
    num::{DataType, Scalar},
};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory type error: data type {0} mismatches {1}")]
    Type(DataType, DataType),
    #[error("memory creation error: layout {0}'s size not match data len {1}")]
    Create(Layout, usize),
    #[error("memory copy error: region {region} exceeds {side} buffer of {size} bytes")]
    Bounds {
        region: CopyRegion,
        side: &'static str,
        size: usize,
    },
    #[error("memory copy error: rows of region {0} overlap")]
    Overlap(CopyRegion),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MemoryId;

/// Shape and element type of a memory block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{}{}", r#type, layout)]
pub struct MemoryDesc {
    pub layout: Layout,
    pub r#type: DataType,
}

impl MemoryDesc {
    #[inline]
    pub fn new(layout: impl IntoLayout, r#type: DataType) -> Self {
        let layout = layout.into_layout();
        Self { layout, r#type }
    }

    /// Size of the described data in bytes.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.layout.size() * self.r#type.size()
    }
}

/// Byte-level description of a strided copy: `count` rows of `len` bytes each,
/// rows spaced `src_stride` and `dst_stride` bytes apart.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{{{src_offset}+{src_stride}n → {dst_offset}+{dst_stride}n, {len}B × {count}}}")]
pub struct CopyRegion {
    pub src_offset: usize,
    pub dst_offset: usize,
    pub src_stride: usize,
    pub dst_stride: usize,
    pub len: usize,
    pub count: usize,
}

impl CopyRegion {
    /// A single contiguous block of `len` bytes.
    #[inline]
    pub fn contiguous(len: usize) -> Self {
        Self {
            src_stride: len,
            dst_stride: len,
            len,
            count: 1,
            ..Default::default()
        }
    }

    /// Returns one past the last byte touched on the source side.
    #[inline]
    pub fn src_end(&self) -> usize {
        match self.count {
            0 => 0,
            count => self.src_offset + (count - 1) * self.src_stride + self.len,
        }
    }

    /// Returns one past the last byte touched on the destination side.
    #[inline]
    pub fn dst_end(&self) -> usize {
        match self.count {
            0 => 0,
            count => self.dst_offset + (count - 1) * self.dst_stride + self.len,
        }
    }

    /// Total number of bytes moved.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.len * self.count
    }

    /// Checks the region against buffer sizes.
    pub fn check(&self, src_size: usize, dst_size: usize) -> Result<(), MemoryError> {
        if self.count > 1 && (self.src_stride < self.len || self.dst_stride < self.len) {
            return Err(MemoryError::Overlap(*self));
        }
        if self.src_end() > src_size {
            let (region, side, size) = (*self, "source", src_size);
            return Err(MemoryError::Bounds { region, side, size });
        }
        if self.dst_end() > dst_size {
            let (region, side, size) = (*self, "destination", dst_size);
            return Err(MemoryError::Bounds { region, side, size });
        }
        Ok(())
    }
}

/// A handle to a block of host memory. Clones share the same storage.
#[derive(Debug, Clone)]
pub struct Memory {
    id: uid::Id<MemoryId>,
    desc: MemoryDesc,
    data: Arc<RwLock<Box<[u8]>>>,
}

impl PartialEq for Memory {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Memory {}

impl Memory {
    /// Create a zero-filled memory block.
    pub fn zeros(desc: MemoryDesc) -> Self {
        let data = vec![0u8; desc.data_size()].into_boxed_slice();
        Self::from_bytes(desc, data)
    }

    fn from_bytes(desc: MemoryDesc, data: Box<[u8]>) -> Self {
        let id = uid::Id::new();
        let data = Arc::new(RwLock::new(data));
        Self { id, desc, data }
    }

    /// Create a memory block from typed contents.
    pub fn create<T: Scalar>(layout: impl IntoLayout, contents: &[T]) -> Result<Self, MemoryError> {
        let layout = layout.into_layout();
        if layout.size() != contents.len() {
            return Err(MemoryError::Create(layout, contents.len()));
        }
        let desc = MemoryDesc::new(layout, T::DATA_TYPE);
        let data = bytemuck::cast_slice(contents).to_vec().into_boxed_slice();
        Ok(Self::from_bytes(desc, data))
    }

    /// Create a rank-0 memory block holding `value`.
    pub fn scalar<T: Scalar>(value: T) -> Self {
        let desc = MemoryDesc::new(Layout::scalar(), T::DATA_TYPE);
        let data = bytemuck::bytes_of(&value).to_vec().into_boxed_slice();
        Self::from_bytes(desc, data)
    }

    /// Create a rank-0 boolean memory block.
    pub fn boolean(value: bool) -> Self {
        let desc = MemoryDesc::new(Layout::scalar(), DataType::Bool);
        Self::from_bytes(desc, Box::new([value as u8]))
    }

    #[inline]
    pub fn id(&self) -> uid::Id<MemoryId> {
        self.id
    }

    #[inline]
    pub fn desc(&self) -> &MemoryDesc {
        &self.desc
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.desc.layout
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.desc.r#type
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.desc.data_size()
    }

    /// Returns `true` if both handles refer to the same storage.
    #[inline]
    pub fn shares_storage(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read().expect("failed to lock")
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write().expect("failed to lock")
    }

    /// Copies the contents out as typed values. Returns error if type mismatches.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>, MemoryError> {
        if self.data_type() != T::DATA_TYPE {
            return Err(MemoryError::Type(self.data_type(), T::DATA_TYPE));
        }
        Ok(bytemuck::pod_collect_to_vec(&self.read()[..]))
    }

    /// Reads the first element as an integer, if the element type is integral.
    pub fn read_int(&self) -> Option<i64> {
        self.data_type().read_int(&self.read()[..])
    }
}
