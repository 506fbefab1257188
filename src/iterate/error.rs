use std::num::ParseIntError;

use derive_more::Display;
use thiserror::Error;

use super::{body::BodyError, port::PortMap};
use crate::loom::{
    layout::{Layout, PartialShape},
    memory::MemoryError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PortKind {
    #[display("parameter")]
    Parameter,
    #[display("result")]
    Result,
}

/// Malformed loop graphs. Raised while building, never retried.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("loop must have at least 2 inputs, got {0}")]
    InputCount(usize),
    #[error("loop must have exactly 1 body subgraph, got {0}")]
    SubgraphCount(usize),
    #[error("loop has no body subgraph")]
    MissingBody,
    #[error("at least one body result is required: the continuation condition")]
    MissingCondition,
    #[error("body {kind} name `{name}` is not a tensor index")]
    TensorName {
        kind: PortKind,
        name: String,
        #[source]
        source: ParseIntError,
    },
    #[error("more than one body result maps to tensor {0}")]
    DuplicateOutput(usize),
    #[error("body {kind} {index} is out of range ({count} in body)")]
    PortIndex {
        kind: PortKind,
        index: usize,
        count: usize,
    },
    #[error("external input {index} is out of range ({count} inputs)")]
    InputIndex { index: usize, count: usize },
    #[error("external output {index} is out of range ({count} outputs)")]
    OutputIndex { index: usize, count: usize },
    #[error("{maps} output maps but {descs} output descriptions")]
    OutputCount { maps: usize, descs: usize },
    #[error("body parameter {0} is connected more than once")]
    Reconnected(usize),
    #[error("body parameter {0} is not connected")]
    Unconnected(usize),
    #[error("loop-carried body parameter {0} has no matching body result")]
    MissingBackEdge(usize),
    #[error("axis {axis} is out of range for body shape {shape}")]
    Axis { axis: usize, shape: PartialShape },
    #[error("invalid slicing rule {0}")]
    SliceRule(PortMap),
    #[error("only the last iteration value (-1) can be taken, got {0}")]
    IterValue(i64),
    #[error("continuation condition result must be boolean or integral, got {0}")]
    ConditionType(crate::loom::num::DataType),
    #[error("body executable has {got} {kind}s, loop expects {expected}")]
    BodyMismatch {
        kind: PortKind,
        expected: usize,
        got: usize,
    },
    #[error("invalid executor config: {0}")]
    Config(&'static str),
}

/// Failures of a single loop invocation.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    #[error("trip count must be at least -1, got {0}")]
    TripCount(i64),
    #[error("execution condition must be 0 or 1, got {0}")]
    Condition(i64),
    #[error("expected an integral scalar for the {0}")]
    Scalar(&'static str),
    #[error("iteration range of {rule} does not fit axis of length {dim}")]
    Range { rule: PortMap, dim: usize },
    #[error("axis {axis} is out of range for input {slot} of layout {layout}")]
    InputAxis {
        slot: usize,
        axis: usize,
        layout: Layout,
    },
    #[error("loop expects {expected} inputs, got {got}")]
    InputCount { expected: usize, got: usize },
    #[error("body produced {got} results, expected {expected}")]
    ResultCount { expected: usize, got: usize },
    #[error("shape mismatch on body {kind} {index}: expected {expected}, got {got}")]
    ShapeMismatch {
        kind: PortKind,
        index: usize,
        expected: PartialShape,
        got: Layout,
        #[source]
        source: Option<BodyError>,
    },
    #[error("body execution failed at iteration {iteration}")]
    Execution {
        iteration: usize,
        #[source]
        source: BodyError,
    },
    #[error(transparent)]
    Memory(#[from] MemoryError),
}
