use super::{error::LoopError, mapper::Bindings};
use crate::loom::memory::Memory;

/// Where a checked scalar lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// An external input slot.
    Input(usize),
    /// A body result of the latest iteration.
    Result(usize),
}

/// Reads one of the scalars steering the loop: the trip count or an execution condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChecker {
    /// A constant standing in for an absent port.
    Static(i64),
    /// Maximum number of iterations; `-1` for unbounded.
    TripCount(Source),
    /// Whether to keep going, `0` or `1`.
    Condition(Source),
}

impl PortChecker {
    pub fn status(&self, bindings: &Bindings) -> Result<i64, LoopError> {
        let read = |source: &Source, name: &'static str| {
            let memory: Option<&Memory> = match source {
                Source::Input(slot) => bindings.inputs.get(*slot),
                Source::Result(index) => bindings.results.get(*index),
            };
            memory
                .and_then(Memory::read_int)
                .ok_or(LoopError::Scalar(name))
        };
        match self {
            PortChecker::Static(value) => Ok(*value),
            PortChecker::TripCount(source) => match read(source, "trip count")? {
                value if value < -1 => Err(LoopError::TripCount(value)),
                value => Ok(value),
            },
            PortChecker::Condition(source) => match read(source, "execution condition")? {
                value @ (0 | 1) => Ok(value),
                value => Err(LoopError::Condition(value)),
            },
        }
    }
}
