//! Construction of loop nodes.
//!
//! [`LoopBuilder`] wires external values to body ports and validates the result into an immutable
//! [`LoopDescriptor`]. Every index is checked here, so the engine never sees a dangling port.

use std::sync::Arc;

use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    error::{ConstructionError, PortKind},
    port::{BackEdge, BodySignature, LoopDescriptor, PortDesc, PortMap, SliceRule, SpecialBodyPorts},
};
use crate::loom::layout::{Dim, PartialShape};

/// A value of the graph enclosing the loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("%{_0}")]
pub struct ValueId(pub usize);

/// A built loop node: its descriptor and the external values feeding each input slot.
#[derive(Debug, Clone)]
pub struct LoopNode {
    pub descriptor: Arc<LoopDescriptor>,
    pub inputs: Vec<ValueId>,
}

#[derive(Debug, Default, Clone)]
pub struct LoopBuilder {
    inputs: Vec<ValueId>,
    trip_count: Option<usize>,
    execution_condition: Option<usize>,
    body: Option<BodySignature>,
    special: SpecialBodyPorts,
    input_maps: Vec<PortMap>,
    output_maps: Vec<PortMap>,
    back_edges: Vec<BackEdge>,
}

impl LoopBuilder {
    /// Starts a loop fed by an optional trip count and an optional initial execution condition.
    pub fn new(trip_count: Option<ValueId>, execution_condition: Option<ValueId>) -> Self {
        let mut builder = Self::default();
        if let Some(value) = trip_count {
            builder.trip_count = Some(builder.push_input(value));
        }
        if let Some(value) = execution_condition {
            builder.execution_condition = Some(builder.push_input(value));
        }
        builder
    }

    fn push_input(&mut self, value: ValueId) -> usize {
        self.inputs.push(value);
        self.inputs.len() - 1
    }

    /// Returns the input slot of `value`, appending one if the value is not an input yet.
    fn input_slot(&mut self, value: ValueId) -> usize {
        let reserved = self
            .trip_count
            .iter()
            .chain(self.execution_condition.iter())
            .count();
        match self.inputs.iter().skip(reserved).position(|&x| x == value) {
            Some(index) => index + reserved,
            None => self.push_input(value),
        }
    }

    fn body(&self) -> Result<&BodySignature, ConstructionError> {
        self.body.as_ref().ok_or(ConstructionError::MissingBody)
    }

    fn parameter(&self, index: usize) -> Result<&PortDesc, ConstructionError> {
        let parameters = &self.body()?.parameters;
        parameters.get(index).ok_or(ConstructionError::PortIndex {
            kind: PortKind::Parameter,
            index,
            count: parameters.len(),
        })
    }

    fn result(&self, index: usize) -> Result<&PortDesc, ConstructionError> {
        let results = &self.body()?.results;
        results.get(index).ok_or(ConstructionError::PortIndex {
            kind: PortKind::Result,
            index,
            count: results.len(),
        })
    }

    /// Fails unless `param` exists and nothing feeds it yet.
    fn check_unconnected(&self, param: usize) -> Result<(), ConstructionError> {
        self.parameter(param)?;
        let connected = self.input_maps.iter().any(|map| map.to == param)
            || self.special.current_iteration == Some(param);
        match connected {
            true => Err(ConstructionError::Reconnected(param)),
            false => Ok(()),
        }
    }

    /// Attaches the body subgraph. A loop holds exactly one body.
    pub fn set_body(&mut self, body: BodySignature) -> Result<&mut Self, ConstructionError> {
        if self.body.is_some() {
            return Err(ConstructionError::SubgraphCount(2));
        }
        self.body = Some(body);
        Ok(self)
    }

    pub fn set_special_body_ports(&mut self, ports: SpecialBodyPorts) -> &mut Self {
        self.special = ports;
        self
    }

    /// Feeds `param` with the whole of `value` on every iteration.
    pub fn set_invariant_input(
        &mut self,
        value: ValueId,
        param: usize,
    ) -> Result<&mut Self, ConstructionError> {
        self.check_unconnected(param)?;
        let slot = self.input_slot(value);
        self.input_maps.push(PortMap::invariant(slot, param));
        Ok(self)
    }

    /// Feeds `param` with a moving window of `value`.
    pub fn set_sliced_input(
        &mut self,
        value: ValueId,
        param: usize,
        rule: SliceRule,
    ) -> Result<&mut Self, ConstructionError> {
        self.check_unconnected(param)?;
        let shape = &self.parameter(param)?.shape;
        check_slice(&PortMap::sliced(0, param, rule), shape)?;
        let slot = self.input_slot(value);
        self.input_maps.push(PortMap::sliced(slot, param, rule));
        Ok(self)
    }

    /// Feeds `param` with `initial` on the first iteration and with `result` of the previous
    /// iteration afterwards.
    pub fn set_merged_input(
        &mut self,
        param: usize,
        initial: ValueId,
        result: usize,
    ) -> Result<&mut Self, ConstructionError> {
        self.check_unconnected(param)?;
        self.result(result)?;
        let slot = self.input_slot(initial);
        self.input_maps.push(PortMap::invariant(slot, param));
        self.back_edges.push(BackEdge {
            from: result,
            to: param,
        });
        Ok(self)
    }

    /// Exposes the value of `result` at the given iteration as a loop output.
    /// Only the last iteration (`-1`) is supported. Returns the output slot.
    pub fn get_iter_value(
        &mut self,
        result: usize,
        iteration: i64,
    ) -> Result<usize, ConstructionError> {
        if iteration != -1 {
            return Err(ConstructionError::IterValue(iteration));
        }
        self.result(result)?;
        let slot = self.output_maps.len();
        self.output_maps.push(PortMap::invariant(slot, result));
        Ok(slot)
    }

    /// Exposes the slices of `result` from every iteration, concatenated along `rule.axis`,
    /// as a loop output. Returns the output slot.
    pub fn get_concatenated_slices(
        &mut self,
        result: usize,
        rule: SliceRule,
    ) -> Result<usize, ConstructionError> {
        let shape = self.result(result)?.shape.clone();
        let slot = self.output_maps.len();
        let map = PortMap::sliced(slot, result, rule);
        if rule.stride.unsigned_abs() != rule.part_size {
            return Err(ConstructionError::SliceRule(map));
        }
        check_slice(&map, &shape)?;
        self.output_maps.push(map);
        Ok(slot)
    }

    /// Validates the wiring and infers output shapes.
    pub fn build(self) -> Result<LoopNode, ConstructionError> {
        let body = self.body()?;
        let special = self.special;
        if let Some(param) = special.current_iteration {
            self.parameter(param)?;
        }
        if let Some(result) = special.condition {
            let r#type = self.result(result)?.r#type;
            if !r#type.is_integral() {
                return Err(ConstructionError::ConditionType(r#type));
            }
        }

        // every parameter but the iteration counter must be fed
        if let Some((param, _)) = body.parameters.iter().enumerate().find(|&(index, _)| {
            special.current_iteration != Some(index)
                && !self.input_maps.iter().any(|map| map.to == index)
        }) {
            return Err(ConstructionError::Unconnected(param));
        }

        let output_descs = self
            .output_maps
            .iter()
            .map(|map| infer_output(body, &self.back_edges, map))
            .collect_vec();

        log::debug!(
            "built loop: {} inputs, {} outputs, {} back edges",
            self.inputs.len(),
            output_descs.len(),
            self.back_edges.len()
        );

        let descriptor = LoopDescriptor {
            trip_count: self.trip_count,
            execution_condition: self.execution_condition,
            special,
            inputs: self.input_maps,
            outputs: self.output_maps,
            back_edges: self.back_edges,
            body: self.body.unwrap_or_default(),
            num_inputs: self.inputs.len(),
            output_descs,
        };
        let descriptor = Arc::new(descriptor);
        let inputs = self.inputs;
        Ok(LoopNode { descriptor, inputs })
    }
}

/// Checks a slicing rule against the per-iteration body shape.
fn check_slice(map: &PortMap, shape: &PartialShape) -> Result<(), ConstructionError> {
    let axis = map.axis.unwrap_or_default();
    if map.stride == 0 || map.part_size == 0 {
        return Err(ConstructionError::SliceRule(*map));
    }
    let Some(dims) = shape.dims() else {
        return Ok(());
    };
    match dims.get(axis) {
        None => Err(ConstructionError::Axis {
            axis,
            shape: shape.clone(),
        }),
        Some(Dim::Known(dim)) if *dim != map.part_size => Err(ConstructionError::SliceRule(*map)),
        Some(_) => Ok(()),
    }
}

fn infer_output(body: &BodySignature, back_edges: &[BackEdge], map: &PortMap) -> PortDesc {
    let result = &body.results[map.to];
    let shape = match map.axis {
        Some(axis) => result.shape.with_dim(axis, Dim::Unknown),
        None => back_edges
            .iter()
            .filter(|edge| edge.from == map.to)
            .map(|edge| &body.parameters[edge.to].shape)
            .fold(result.shape.clone(), |shape, param| shape.relax(param)),
    };
    PortDesc::new(result.name.clone(), shape, result.r#type)
}
