use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::error::{ConstructionError, PortKind};
use crate::loom::{layout::PartialShape, num::DataType};

/// Correlates one external tensor with one body tensor across iterations.
///
/// For inputs, `from` is an external input slot and `to` a body parameter.
/// For outputs, `from` is an external output slot and `to` a body result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PortMap {
    pub from: usize,
    pub to: usize,
    /// Axis to iterate through; `None` if the tensor is the same every iteration.
    pub axis: Option<usize>,
    /// Step per iteration along `axis`; negative steps walk backwards.
    pub stride: isize,
    /// Boundary where iteration begins; negative values count from the end, `-1` being the end.
    pub start: isize,
    /// Boundary where iteration stops; negative values count from the end.
    pub end: isize,
    /// Number of elements along `axis` per iteration.
    pub part_size: usize,
}

impl fmt::Display for PortMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}", self.from, self.to)?;
        if let Some(axis) = self.axis {
            write!(
                f,
                " (axis {axis}, {}..{} by {}, part {})",
                self.start, self.end, self.stride, self.part_size
            )?;
        }
        Ok(())
    }
}

/// Slicing parameters of a sliced port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceRule {
    pub axis: usize,
    pub start: isize,
    pub stride: isize,
    pub part_size: usize,
    pub end: isize,
}

impl SliceRule {
    /// One element per iteration, front to back over the whole axis.
    #[inline]
    pub fn along(axis: usize) -> Self {
        Self {
            axis,
            start: 0,
            stride: 1,
            part_size: 1,
            end: -1,
        }
    }

    /// One element per iteration, back to front over the whole axis.
    #[inline]
    pub fn reversed(axis: usize) -> Self {
        Self {
            axis,
            start: -1,
            stride: -1,
            part_size: 1,
            end: 0,
        }
    }

    #[inline]
    pub fn with_part_size(self, part_size: usize) -> Self {
        let stride = self.stride.signum() * part_size as isize;
        Self {
            stride,
            part_size,
            ..self
        }
    }
}

/// Normalized iteration range of a sliced port over a concrete axis length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterRange {
    pub lo: usize,
    pub hi: usize,
    pub step: usize,
    pub iterations: usize,
}

impl PortMap {
    #[inline]
    pub fn invariant(from: usize, to: usize) -> Self {
        Self {
            from,
            to,
            axis: None,
            stride: 1,
            start: 0,
            end: -1,
            part_size: 1,
        }
    }

    #[inline]
    pub fn sliced(from: usize, to: usize, rule: SliceRule) -> Self {
        let SliceRule {
            axis,
            start,
            stride,
            part_size,
            end,
        } = rule;
        Self {
            from,
            to,
            axis: Some(axis),
            stride,
            start,
            end,
            part_size,
        }
    }

    #[inline]
    pub fn is_invariant(&self) -> bool {
        self.axis.is_none()
    }

    /// Resolves the range walked over an axis of length `dim`.
    /// Returns `None` if the rule does not describe a whole number of windows inside the axis.
    pub fn range(&self, dim: usize) -> Option<IterRange> {
        if self.stride == 0 || self.part_size == 0 {
            return None;
        }
        let space = dim as isize;
        let resolve = |x: isize| if x < 0 { space + 1 + x } else { x };
        let (start, end) = (resolve(self.start), resolve(self.end));
        let (lo, hi) = match self.stride < 0 {
            true => (end, start),
            false => (start, end),
        };
        if lo < 0 || hi > space || lo > hi {
            return None;
        }

        let (lo, hi) = (lo as usize, hi as usize);
        let step = self.stride.unsigned_abs();
        let length = hi - lo;
        if length % step != 0 {
            return None;
        }
        let iterations = length / step;

        // the farthest window must stay inside the axis
        let last = match (iterations, self.stride < 0) {
            (0, _) => None,
            (_, true) => Some(hi - step),
            (n, false) => Some(lo + (n - 1) * step),
        };
        if last.is_some_and(|offset| offset + self.part_size > dim) {
            return None;
        }

        Some(IterRange {
            lo,
            hi,
            step,
            iterations,
        })
    }

    #[inline]
    pub fn iterations(&self, dim: usize) -> Option<usize> {
        self.range(dim).map(|range| range.iterations)
    }

    /// Start of the window taken at iteration `iter` over an axis of length `dim`.
    pub fn offset(&self, dim: usize, iter: usize) -> Option<usize> {
        let IterRange {
            lo,
            hi,
            step,
            iterations,
        } = self.range(dim)?;
        if iter >= iterations {
            return None;
        }
        match self.stride < 0 {
            true => Some(hi - (iter + 1) * step),
            false => Some(lo + iter * step),
        }
    }
}

/// A body result feeding a body parameter on the next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BackEdge {
    /// Body result index.
    pub from: usize,
    /// Body parameter index.
    pub to: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpecialBodyPorts {
    /// Body parameter receiving the current iteration index.
    pub current_iteration: Option<usize>,
    /// Body result holding the continuation condition.
    pub condition: Option<usize>,
}

/// Declared name, shape and type of a body parameter or result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PortDesc {
    pub name: String,
    pub shape: PartialShape,
    pub r#type: DataType,
}

impl PortDesc {
    #[inline]
    pub fn new(name: impl Into<String>, shape: impl Into<PartialShape>, r#type: DataType) -> Self {
        let name = name.into();
        let shape = shape.into();
        Self {
            name,
            shape,
            r#type,
        }
    }
}

/// The interface of a body subgraph as seen at graph-construction time.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BodySignature {
    pub parameters: Vec<PortDesc>,
    pub results: Vec<PortDesc>,
}

/// A validated loop node. Immutable once built; shared by every executor of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LoopDescriptor {
    pub(super) trip_count: Option<usize>,
    pub(super) execution_condition: Option<usize>,
    pub(super) special: SpecialBodyPorts,
    pub(super) inputs: Vec<PortMap>,
    pub(super) outputs: Vec<PortMap>,
    pub(super) back_edges: Vec<BackEdge>,
    pub(super) body: BodySignature,
    pub(super) num_inputs: usize,
    pub(super) output_descs: Vec<PortDesc>,
}

impl LoopDescriptor {
    /// External input slot carrying the trip count.
    #[inline]
    pub fn trip_count(&self) -> Option<usize> {
        self.trip_count
    }

    /// External input slot carrying the initial execution condition.
    #[inline]
    pub fn execution_condition(&self) -> Option<usize> {
        self.execution_condition
    }

    #[inline]
    pub fn special_ports(&self) -> SpecialBodyPorts {
        self.special
    }

    #[inline]
    pub fn body(&self) -> &BodySignature {
        &self.body
    }

    #[inline]
    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    #[inline]
    pub fn num_outputs(&self) -> usize {
        self.output_descs.len()
    }

    /// Inferred shape and type of each external output.
    #[inline]
    pub fn output_descs(&self) -> &[PortDesc] {
        &self.output_descs
    }

    #[inline]
    pub fn input_maps(&self) -> &[PortMap] {
        &self.inputs
    }

    #[inline]
    pub fn output_maps(&self) -> &[PortMap] {
        &self.outputs
    }

    #[inline]
    pub fn back_edges(&self) -> &[BackEdge] {
        &self.back_edges
    }

    pub fn invariant_inputs(&self) -> impl Iterator<Item = &PortMap> {
        self.inputs.iter().filter(|map| map.is_invariant())
    }

    pub fn sliced_inputs(&self) -> impl Iterator<Item = &PortMap> {
        self.inputs.iter().filter(|map| !map.is_invariant())
    }

    pub fn sliced_outputs(&self) -> impl Iterator<Item = &PortMap> {
        self.outputs.iter().filter(|map| !map.is_invariant())
    }

    /// The back-edge reading body result `result`, if any.
    pub fn back_edge_from(&self, result: usize) -> Option<&BackEdge> {
        self.back_edges.iter().find(|edge| edge.from == result)
    }

    /// Checks every slot and port index against the input count and the body signature.
    ///
    /// Built descriptors always pass; deserialized ones may not.
    pub fn validate(&self) -> Result<(), ConstructionError> {
        let num_inputs = self.num_inputs;
        let num_outputs = self.output_descs.len();
        let input = |index: usize| match index < num_inputs {
            true => Ok(()),
            false => Err(ConstructionError::InputIndex {
                index,
                count: num_inputs,
            }),
        };
        let port = |kind: PortKind, index: usize| {
            let count = match kind {
                PortKind::Parameter => self.body.parameters.len(),
                PortKind::Result => self.body.results.len(),
            };
            match index < count {
                true => Ok(()),
                false => Err(ConstructionError::PortIndex { kind, index, count }),
            }
        };

        for &slot in self.trip_count.iter().chain(&self.execution_condition) {
            input(slot)?;
        }
        if let Some(index) = self.special.current_iteration {
            port(PortKind::Parameter, index)?;
        }
        if let Some(index) = self.special.condition {
            port(PortKind::Result, index)?;
        }
        for map in &self.inputs {
            input(map.from)?;
            port(PortKind::Parameter, map.to)?;
        }

        if self.outputs.len() != num_outputs {
            return Err(ConstructionError::OutputCount {
                maps: self.outputs.len(),
                descs: num_outputs,
            });
        }
        for map in &self.outputs {
            if map.from >= num_outputs {
                return Err(ConstructionError::OutputIndex {
                    index: map.from,
                    count: num_outputs,
                });
            }
            port(PortKind::Result, map.to)?;
        }

        for edge in &self.back_edges {
            port(PortKind::Result, edge.from)?;
            port(PortKind::Parameter, edge.to)?;
        }
        Ok(())
    }
}
