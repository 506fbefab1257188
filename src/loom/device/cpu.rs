use super::Device;
use crate::loom::memory::{CopyRegion, Memory, MemoryDesc, MemoryError};

/// Rows below this count are copied on the calling thread.
#[cfg(feature = "rayon")]
const PARALLEL_ROWS: usize = 64;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Cpu;

impl Device for Cpu {
    #[inline]
    fn create(&self, desc: MemoryDesc) -> Memory {
        Memory::zeros(desc)
    }

    fn copy(&self, src: &Memory, dst: &Memory, region: CopyRegion) -> Result<(), MemoryError> {
        if region.bytes() == 0 {
            return Ok(());
        }
        if src.shares_storage(dst) {
            let mut data = dst.write();
            region.check(data.len(), data.len())?;
            for row in 0..region.count {
                let from = region.src_offset + row * region.src_stride;
                let to = region.dst_offset + row * region.dst_stride;
                data.copy_within(from..from + region.len, to);
            }
            return Ok(());
        }

        let src = src.read();
        let mut dst = dst.write();
        region.check(src.len(), dst.len())?;
        copy_rows(&src, &mut dst, region);
        Ok(())
    }
}

#[cfg(not(feature = "rayon"))]
fn copy_rows(src: &[u8], dst: &mut [u8], region: CopyRegion) {
    for row in 0..region.count {
        let from = region.src_offset + row * region.src_stride;
        let to = region.dst_offset + row * region.dst_stride;
        dst[to..to + region.len].copy_from_slice(&src[from..from + region.len]);
    }
}

#[cfg(feature = "rayon")]
fn copy_rows(src: &[u8], dst: &mut [u8], region: CopyRegion) {
    use rayon::prelude::*;

    let CopyRegion {
        src_offset,
        dst_offset,
        src_stride,
        dst_stride,
        len,
        count,
    } = region;

    if count < PARALLEL_ROWS {
        for row in 0..count {
            let from = src_offset + row * src_stride;
            let to = dst_offset + row * dst_stride;
            dst[to..to + len].copy_from_slice(&src[from..from + len]);
        }
        return;
    }

    // strides are at least `len` here, so every row starts its own chunk
    let src = &src[src_offset..region.src_end()];
    let dst = &mut dst[dst_offset..region.dst_end()];
    dst.par_chunks_mut(dst_stride)
        .zip(src.par_chunks(src_stride))
        .for_each(|(y, x)| y[..len].copy_from_slice(&x[..len]));
}
