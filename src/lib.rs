//! `spindle` executes structured loops of an inference graph.
//!
//! A loop is a single graph node wrapping a body subgraph. The [`iterate`] module builds such a node
//! ahead of time ([`iterate::build`], [`iterate::translate`]) and drives it at runtime
//! ([`iterate::engine`]), on top of the memory abstractions in [`loom`].

pub mod iterate;
pub mod loom;
