//! # Structured Loops
//!
//! A loop is a single graph node wrapping a body subgraph that runs repeatedly.
//!
//! - [`build`] and [`translate`] turn a wiring of external values and body ports into an
//!   immutable [`port::LoopDescriptor`].
//! - [`engine`] runs a descriptor against concrete inputs, driving a [`body::Body`] once per
//!   iteration.
//! - [`mapper`], [`checker`] and [`buffer`] are the pieces the engine prepares for each call:
//!   data movement between ports, the scalars steering the loop, and accumulation of outputs
//!   of unknown length.

pub mod body;
pub mod buffer;
pub mod build;
pub mod checker;
pub mod engine;
pub mod error;
pub mod mapper;
pub mod port;
pub mod translate;
