//! x64 Native Code Generation Backend
//!
//! Direct x64 machine code generation without runtime dependencies.
//!
//! ## Architecture
//!
//! ```text
//! Instruction body → X64Codegen → MachineCode → ExecutableRegion → call
//! ```
//!
//! ## Modules
//!
//! - `registers`: x64 register definitions and encoding
//! - `encoding`: x64 instruction encoding (REX, ModR/M, SIB)
//! - `codegen`: stack-machine to x64 translation

pub mod codegen;
pub mod encoding;
pub mod registers;

pub use codegen::X64Codegen;
