use thiserror::Error;

use super::port::PortDesc;
use crate::loom::{layout::Layout, memory::Memory, platform::BoxFuture};

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("body rejected reshape: {0}")]
    Reshape(String),
    #[error("body execution failed: {0}")]
    Execute(String),
}

/// An executable body subgraph. Opaque to the loop engine.
pub trait Body {
    /// Currently expected parameters. May change after [`Body::reshape`].
    fn parameters(&self) -> &[PortDesc];

    /// Declared results.
    fn results(&self) -> &[PortDesc];

    /// Re-validates the body for new parameter layouts, one per parameter.
    fn reshape(&mut self, layouts: &[Layout]) -> Result<(), BodyError>;

    /// Runs the body once. Resolves once every result is written.
    fn execute<'a>(&'a mut self, params: &'a [Memory]) -> BoxFuture<'a, Result<Vec<Memory>, BodyError>>;
}
