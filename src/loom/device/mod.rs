use super::memory::{CopyRegion, Memory, MemoryDesc, MemoryError};

pub use cpu::Cpu;

pub mod cpu;

/// Memory services the loop engine needs from a compute device.
pub trait Device {
    /// Allocates a zero-filled memory block.
    fn create(&self, desc: MemoryDesc) -> Memory;

    /// Performs a strided byte copy from `src` to `dst`.
    /// Fails without touching `dst` if the region exceeds either buffer.
    fn copy(&self, src: &Memory, dst: &Memory, region: CopyRegion) -> Result<(), MemoryError>;

    /// Allocates a block with the same description as `src` and copies all of it.
    fn duplicate(&self, src: &Memory) -> Result<Memory, MemoryError> {
        let dst = self.create(src.desc().clone());
        self.copy(src, &dst, CopyRegion::contiguous(src.data_size()))?;
        Ok(dst)
    }
}

/// Makes sure `slot` holds a memory block matching `desc`,
/// reallocating it if the shape or type differ. Returns `true` on reallocation.
pub fn ensure<D: Device>(device: &D, slot: &mut Memory, desc: &MemoryDesc) -> bool {
    if slot.desc() == desc {
        return false;
    }
    *slot = device.create(desc.clone());
    true
}
