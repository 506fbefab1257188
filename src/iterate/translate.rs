//! Translation of a framework loop operator into a loop node.
//!
//! The framework hands over a body whose extra parameters and results name the tensors they bind
//! to by integer index. Those names are decoded exactly once into [`BodySlots`]; nothing
//! downstream looks at names again.

use rustc_hash::FxHashMap as HashMap;

use super::{
    build::{LoopBuilder, LoopNode, ValueId},
    error::{ConstructionError, PortKind},
    port::{BodySignature, SpecialBodyPorts},
};

/// Tensors of the enclosing model, addressed by the integer indices the framework assigns.
#[derive(Debug, Default, Clone)]
pub struct TranslationContext {
    tensors: HashMap<usize, ValueId>,
    model_inputs: Vec<usize>,
    next_value: usize,
}

impl TranslationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a value id not used by anything in this context.
    pub fn new_value(&mut self) -> ValueId {
        let value = ValueId(self.next_value);
        self.next_value += 1;
        value
    }

    /// Registers `value` as the producer of tensor `index`.
    pub fn add_tensor(&mut self, index: usize, value: ValueId) {
        self.next_value = self.next_value.max(value.0 + 1);
        self.tensors.insert(index, value);
    }

    pub fn tensor(&self, index: usize) -> Option<ValueId> {
        self.tensors.get(&index).copied()
    }

    /// Looks up tensor `index`, creating a new model input for it if nothing produces it.
    pub fn get_tensor_or_create_input(&mut self, index: usize) -> ValueId {
        if let Some(value) = self.tensor(index) {
            return value;
        }
        let value = self.new_value();
        self.tensors.insert(index, value);
        self.model_inputs.push(index);
        value
    }

    /// Tensor indices that became model inputs during translation.
    pub fn model_inputs(&self) -> &[usize] {
        &self.model_inputs
    }
}

/// Body slots bound to model tensors, decoded from port names.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BodySlots {
    /// `(body parameter, tensor index)` for parameters fed from the enclosing model.
    pub parameters: Vec<(usize, usize)>,
    /// `(body result, tensor index)` for results exposed as loop outputs.
    pub results: Vec<(usize, usize)>,
}

impl BodySlots {
    /// Decodes parameters from `first_parameter` on and every result but the condition.
    pub fn decode(body: &BodySignature, first_parameter: usize) -> Result<Self, ConstructionError> {
        let parameters = body
            .parameters
            .iter()
            .enumerate()
            .skip(first_parameter)
            .map(|(index, port)| Ok((index, decode(PortKind::Parameter, &port.name)?)))
            .collect::<Result<Vec<_>, ConstructionError>>()?;

        let mut results: Vec<(usize, usize)> = Vec::with_capacity(body.results.len());
        for (index, port) in body.results.iter().enumerate().skip(1) {
            let tensor = decode(PortKind::Result, &port.name)?;
            if results.iter().any(|&(_, x)| x == tensor) {
                return Err(ConstructionError::DuplicateOutput(tensor));
            }
            results.push((index, tensor));
        }

        Ok(Self {
            parameters,
            results,
        })
    }
}

fn decode(kind: PortKind, name: &str) -> Result<usize, ConstructionError> {
    name.parse().map_err(|source| ConstructionError::TensorName {
        kind,
        name: name.to_owned(),
        source,
    })
}

/// A translated loop and the values produced by its outputs, one per output slot.
#[derive(Debug, Clone)]
pub struct TranslatedLoop {
    pub node: LoopNode,
    pub outputs: Vec<ValueId>,
}

/// Builds a loop node from framework inputs `[trip count, condition, carried...]` and exactly one
/// body subgraph.
///
/// Body parameter 0 receives the iteration counter and body result 0 is the continuation
/// condition. Carried input `i` initializes body parameter `i - 1`, which is fed back from body
/// result `i - 1` on later iterations. Remaining body parameters are bound to model tensors by
/// name, and every result after the condition becomes an output registered under its name.
///
/// On error `ctx` is left untouched.
pub fn translate_loop(
    ctx: &mut TranslationContext,
    inputs: &[ValueId],
    subgraphs: Vec<BodySignature>,
) -> Result<TranslatedLoop, ConstructionError> {
    if inputs.len() < 2 {
        return Err(ConstructionError::InputCount(inputs.len()));
    }
    let body = match <[BodySignature; 1]>::try_from(subgraphs) {
        Ok([body]) => body,
        Err(subgraphs) => return Err(ConstructionError::SubgraphCount(subgraphs.len())),
    };
    if body.results.is_empty() {
        return Err(ConstructionError::MissingCondition);
    }

    let slots = BodySlots::decode(&body, inputs.len() - 1)?;
    let num_parameters = body.parameters.len();
    let num_results = body.results.len();

    let mut staged = ctx.clone();
    let mut builder = LoopBuilder::new(Some(inputs[0]), Some(inputs[1]));
    builder.set_body(body)?.set_special_body_ports(SpecialBodyPorts {
        current_iteration: Some(0),
        condition: Some(0),
    });

    for (param, &value) in (1..num_parameters).zip(&inputs[2..]) {
        if param >= num_results {
            return Err(ConstructionError::MissingBackEdge(param));
        }
        builder.set_merged_input(param, value, param)?;
    }
    for &(param, tensor) in &slots.parameters {
        let value = staged.get_tensor_or_create_input(tensor);
        builder.set_invariant_input(value, param)?;
    }
    let mut exposed = Vec::with_capacity(slots.results.len());
    for &(result, tensor) in &slots.results {
        let slot = builder.get_iter_value(result, -1)?;
        exposed.push((slot, tensor));
    }

    let node = builder.build()?;
    let outputs = exposed
        .into_iter()
        .map(|(_, tensor)| {
            let value = staged.new_value();
            staged.add_tensor(tensor, value);
            value
        })
        .collect();

    log::debug!(
        "translated loop with {} model inputs created",
        staged.model_inputs().len() - ctx.model_inputs().len()
    );
    *ctx = staged;
    Ok(TranslatedLoop { node, outputs })
}
