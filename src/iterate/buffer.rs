//! Accumulation of concatenated outputs whose length is only known once the loop stops.

use super::{
    error::{LoopError, PortKind},
    mapper::{SlicePlan, window_index},
    port::PortMap,
};
use crate::loom::{
    device::Device,
    layout::PartialShape,
    memory::{CopyRegion, Memory, MemoryDesc},
};

/// Collects one chunk per iteration for a concatenated output, growing its storage geometrically.
///
/// Chunks are laid out along the concatenation axis, so a buffer holding `capacity` chunks is a
/// tensor whose axis is `capacity * part_size` long. Only the first `used` chunks of each row
/// are meaningful.
#[derive(Debug, Clone)]
pub struct DynamicBuffer {
    /// Body result feeding the buffer.
    from: usize,
    /// Output slot receiving the concatenation.
    to: usize,
    map: PortMap,
    /// Output when no chunk was ever written.
    empty: MemoryDesc,
    initial_capacity: usize,
    growth_factor: usize,

    chunk: Option<MemoryDesc>,
    plan: SlicePlan,
    buffer: Option<Memory>,
    capacity: usize,
    used: usize,
    growth_bytes: usize,
}

impl DynamicBuffer {
    pub fn new(
        map: PortMap,
        empty: MemoryDesc,
        initial_capacity: usize,
        growth_factor: usize,
    ) -> Self {
        let plan = SlicePlan {
            dim: 0,
            part_size: map.part_size,
            outer: 0,
            inner_bytes: 0,
        };
        Self {
            from: map.to,
            to: map.from,
            map,
            empty,
            initial_capacity: initial_capacity.max(1),
            growth_factor,
            chunk: None,
            plan,
            buffer: None,
            capacity: 0,
            used: 0,
            growth_bytes: 0,
        }
    }

    /// Body result feeding the buffer.
    #[inline]
    pub fn result(&self) -> usize {
        self.from
    }

    /// Output slot receiving the concatenation.
    #[inline]
    pub fn output(&self) -> usize {
        self.to
    }

    /// Number of chunks the storage can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of chunks written.
    #[inline]
    pub fn len(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Bytes moved while growing the storage since the last reset.
    #[inline]
    pub fn growth_bytes(&self) -> usize {
        self.growth_bytes
    }

    #[inline]
    fn axis(&self) -> usize {
        self.map.axis.unwrap_or_default()
    }

    fn storage_desc(&self, chunk: &MemoryDesc, capacity: usize) -> MemoryDesc {
        let layout = chunk.layout.with_dim(self.axis(), capacity * self.map.part_size);
        MemoryDesc::new(layout, chunk.r#type)
    }

    /// Appends the chunk produced by the body in this iteration.
    pub fn execute<D: Device>(&mut self, device: &D, chunk: &Memory) -> Result<(), LoopError> {
        if self.chunk.is_none() {
            self.init(device, chunk)?;
        }
        if let Some(desc) = &self.chunk {
            if desc != chunk.desc() {
                return Err(LoopError::ShapeMismatch {
                    kind: PortKind::Result,
                    index: self.from,
                    expected: PartialShape::from(desc.layout.clone()),
                    got: chunk.layout().clone(),
                    source: None,
                });
            }
        }

        if self.used == self.capacity {
            self.grow(device)?;
        }
        let Some(buffer) = &self.buffer else {
            return Ok(());
        };

        let len = self.plan.window_bytes();
        let region = CopyRegion {
            src_offset: 0,
            dst_offset: self.used * len,
            src_stride: len,
            dst_stride: self.capacity * len,
            len,
            count: self.plan.outer,
        };
        device.copy(chunk, buffer, region)?;
        self.used += 1;
        Ok(())
    }

    fn init<D: Device>(&mut self, device: &D, chunk: &Memory) -> Result<(), LoopError> {
        let axis = self.axis();
        let layout = chunk.layout();
        if layout.dim(axis) != Some(self.map.part_size) {
            let expected = match layout.rank() > axis {
                true => PartialShape::from(layout.with_dim(axis, self.map.part_size)),
                false => PartialShape::Dynamic,
            };
            return Err(LoopError::ShapeMismatch {
                kind: PortKind::Result,
                index: self.from,
                expected,
                got: layout.clone(),
                source: None,
            });
        }

        let desc = chunk.desc().clone();
        self.plan = SlicePlan::new(layout, axis, self.map.part_size, desc.r#type);
        self.capacity = self.initial_capacity;
        self.buffer = Some(device.create(self.storage_desc(&desc, self.capacity)));
        self.chunk = Some(desc);
        Ok(())
    }

    /// Reallocates to a larger capacity, keeping the chunks written so far.
    fn grow<D: Device>(&mut self, device: &D) -> Result<(), LoopError> {
        let (Some(chunk), Some(buffer)) = (&self.chunk, &self.buffer) else {
            return Ok(());
        };
        let capacity = (self.capacity * self.growth_factor).max(self.capacity + 1);
        let storage = device.create(self.storage_desc(chunk, capacity));

        let len = self.plan.window_bytes();
        let region = CopyRegion {
            src_offset: 0,
            dst_offset: 0,
            src_stride: self.capacity * len,
            dst_stride: capacity * len,
            len: self.used * len,
            count: self.plan.outer,
        };
        device.copy(buffer, &storage, region)?;
        self.growth_bytes += region.bytes();

        log::debug!(
            "output {} buffer grows from {} to {} chunks",
            self.to,
            self.capacity,
            capacity
        );
        self.capacity = capacity;
        self.buffer = Some(storage);
        Ok(())
    }

    /// Builds the concatenated output from the chunks written so far.
    /// Chunks of a negative-stride output come out in reverse iteration order.
    pub fn transfer<D: Device>(&self, device: &D) -> Result<Memory, LoopError> {
        let (Some(chunk), Some(buffer)) = (&self.chunk, &self.buffer) else {
            return Ok(device.create(self.empty.clone()));
        };
        let output = device.create(self.storage_desc(chunk, self.used));

        let len = self.plan.window_bytes();
        let region = CopyRegion {
            src_offset: 0,
            dst_offset: 0,
            src_stride: self.capacity * len,
            dst_stride: self.used * len,
            len,
            count: self.plan.outer,
        };
        match self.map.stride < 0 {
            true => {
                for iter in 0..self.used {
                    let index = window_index(self.map.stride, self.used, iter);
                    let region = CopyRegion {
                        src_offset: iter * len,
                        dst_offset: index * len,
                        ..region
                    };
                    device.copy(buffer, &output, region)?;
                }
            }
            false => {
                let region = CopyRegion {
                    len: self.used * len,
                    ..region
                };
                device.copy(buffer, &output, region)?;
            }
        }
        Ok(output)
    }

    /// Releases the storage and forgets every chunk.
    pub fn reset(&mut self) {
        self.chunk = None;
        self.buffer = None;
        self.capacity = 0;
        self.used = 0;
        self.growth_bytes = 0;
    }
}
