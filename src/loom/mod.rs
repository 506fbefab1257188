//! The `loom` module provides the memory foundations the loop engine moves data with.
//!
//! ## Key Components
//! 1. **Layouts**:
//!    - Row-major tensor layouts (`Layout`) with per-axis geometry helpers.
//!    - Partially known shapes (`PartialShape`) for compile-time inference.
//!
//! 2. **Memory**:
//!    - Shared, lock-guarded byte buffers (`Memory`) tagged with a unique id.
//!    - Typed views through `bytemuck`.
//!
//! 3. **Device Abstraction**:
//!    - Allocation and bounds-checked strided copies via the `Device` trait.
//!    - A host implementation (`Cpu`), row-parallel with `rayon`.
//!
//! 4. **Numerical System**:
//!    - Scalar types (`f32`, `f16`, `i32`, `i64`, ...) and their `DataType` metadata.

pub mod device;
pub mod layout;
pub mod memory;
pub mod num;
pub mod platform;
