//! Data movement between external tensors and body ports.
//!
//! Each [`PortMapper`] moves one tensor for one kind of connection. Mappers address slots by index
//! and receive the live [`Bindings`] whenever they run.

use super::{
    error::{LoopError, PortKind},
    port::PortMap,
};
use crate::loom::{
    device::{Device, ensure},
    layout::{Layout, PartialShape},
    memory::{CopyRegion, Memory, MemoryDesc},
    num::DataType,
};

/// Tensors visible to mappers during one loop invocation.
#[derive(Debug)]
pub struct Bindings<'a> {
    /// External inputs, by input slot.
    pub inputs: &'a [Memory],
    /// Body parameters, by parameter index.
    pub params: Vec<Memory>,
    /// Body results of the latest iteration; empty before the first one.
    pub results: Vec<Memory>,
    /// External outputs, by output slot.
    pub outputs: Vec<Memory>,
}

impl<'a> Bindings<'a> {
    pub fn new(inputs: &'a [Memory], params: Vec<Memory>, outputs: Vec<Memory>) -> Self {
        Self {
            inputs,
            params,
            results: vec![],
            outputs,
        }
    }
}

/// Geometry of a tensor cut into windows along one axis.
///
/// A row is everything inside one window for a fixed index of the dimensions before the axis;
/// windows of consecutive iterations are adjacent in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlicePlan {
    /// Length of the axis in the whole tensor.
    pub dim: usize,
    /// Elements along the axis per window.
    pub part_size: usize,
    /// Number of rows.
    pub outer: usize,
    /// Bytes of one element step along the axis.
    pub inner_bytes: usize,
}

impl SlicePlan {
    pub fn new(layout: &Layout, axis: usize, part_size: usize, r#type: DataType) -> Self {
        Self {
            dim: layout.dim(axis).unwrap_or_default(),
            part_size,
            outer: layout.outer_size(axis),
            inner_bytes: layout.inner_size(axis) * r#type.size(),
        }
    }

    /// Bytes of one window in one row.
    #[inline]
    pub fn window_bytes(&self) -> usize {
        self.part_size * self.inner_bytes
    }

    /// Bytes of one whole row.
    #[inline]
    pub fn row_bytes(&self) -> usize {
        self.dim * self.inner_bytes
    }

    /// Copies the window starting at `offset` out of the whole tensor.
    pub fn gather(&self, offset: usize) -> CopyRegion {
        CopyRegion {
            src_offset: offset * self.inner_bytes,
            dst_offset: 0,
            src_stride: self.row_bytes(),
            dst_stride: self.window_bytes(),
            len: self.window_bytes(),
            count: self.outer,
        }
    }

    /// Copies a window into the whole tensor at `offset`.
    pub fn scatter(&self, offset: usize) -> CopyRegion {
        CopyRegion {
            src_offset: 0,
            dst_offset: offset * self.inner_bytes,
            src_stride: self.window_bytes(),
            dst_stride: self.row_bytes(),
            len: self.window_bytes(),
            count: self.outer,
        }
    }
}

/// Index of the window written at iteration `iter` of `iterations`; reversed for negative strides.
#[inline]
pub fn window_index(stride: isize, iterations: usize, iter: usize) -> usize {
    match stride < 0 {
        true => iterations - 1 - iter,
        false => iter,
    }
}

/// Value of a last-value output when the body never ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// The current value of a body parameter, i.e. the initializer of a back-edge.
    Param(usize),
    /// An empty tensor of the given description.
    Empty(MemoryDesc),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMapper {
    /// Copies the whole of an external input into a parameter.
    Invariant { from: usize, to: usize },
    /// Copies the window of the current iteration out of an external input into a parameter.
    SlicedIn {
        from: usize,
        to: usize,
        map: PortMap,
        plan: SlicePlan,
        desc: MemoryDesc,
    },
    /// Writes the iteration index into a parameter.
    Counter { to: usize, desc: MemoryDesc },
    /// Copies a result into the window of the current iteration of a preallocated output.
    SlicedOut {
        from: usize,
        to: usize,
        stride: isize,
        iterations: usize,
        plan: SlicePlan,
        chunk: MemoryDesc,
    },
    /// Copies a result into a parameter for the next iteration.
    BackEdge { from: usize, to: usize },
    /// Copies a result of the final iteration into an output.
    LastValue {
        from: usize,
        to: usize,
        fallback: Fallback,
    },
}

impl PortMapper {
    pub fn execute<D: Device>(
        &self,
        device: &D,
        iter: usize,
        bindings: &mut Bindings,
    ) -> Result<(), LoopError> {
        match self {
            PortMapper::Invariant { from, to } => {
                let input = &bindings.inputs[*from];
                let param = &mut bindings.params[*to];
                ensure(device, param, input.desc());
                device.copy(input, param, CopyRegion::contiguous(input.data_size()))?;
            }
            PortMapper::SlicedIn {
                from,
                to,
                map,
                plan,
                desc,
            } => {
                let offset = map.offset(plan.dim, iter).ok_or(LoopError::Range {
                    rule: *map,
                    dim: plan.dim,
                })?;
                let param = &mut bindings.params[*to];
                ensure(device, param, desc);
                device.copy(&bindings.inputs[*from], param, plan.gather(offset))?;
            }
            PortMapper::Counter { to, desc } => {
                let bytes = desc
                    .r#type
                    .write_int(iter as i64)
                    .ok_or(LoopError::Scalar("iteration counter"))?;
                let param = &mut bindings.params[*to];
                ensure(device, param, desc);
                let mut data = param.write();
                data.fill(0);
                data[..bytes.len()].copy_from_slice(&bytes);
            }
            PortMapper::SlicedOut {
                from,
                to,
                stride,
                iterations,
                plan,
                chunk,
            } => {
                let result = &bindings.results[*from];
                if result.desc() != chunk {
                    return Err(LoopError::ShapeMismatch {
                        kind: PortKind::Result,
                        index: *from,
                        expected: PartialShape::from(chunk.layout.clone()),
                        got: result.layout().clone(),
                        source: None,
                    });
                }
                let index = window_index(*stride, *iterations, iter);
                let region = plan.scatter(index * plan.part_size);
                device.copy(result, &bindings.outputs[*to], region)?;
            }
            PortMapper::BackEdge { from, to } => {
                let result = &bindings.results[*from];
                let param = &mut bindings.params[*to];
                if result.shares_storage(param) {
                    return Ok(());
                }
                if ensure(device, param, result.desc()) {
                    log::debug!("parameter {to} reallocated as {}", result.desc());
                }
                device.copy(result, param, CopyRegion::contiguous(result.data_size()))?;
            }
            PortMapper::LastValue { from, to, fallback } => {
                let output = match (bindings.results.get(*from), fallback) {
                    (Some(result), _) => device.duplicate(result)?,
                    (None, Fallback::Param(param)) => device.duplicate(&bindings.params[*param])?,
                    (None, Fallback::Empty(desc)) => device.create(desc.clone()),
                };
                bindings.outputs[*to] = output;
            }
        }
        Ok(())
    }
}
