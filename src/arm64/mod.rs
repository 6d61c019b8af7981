//! ARM64 (AArch64) Native Code Generation Backend
//!
//! Direct ARM64 machine code generation without runtime dependencies.
//!
//! ## Architecture
//!
//! ```text
//! Instruction body → Arm64Codegen → MachineCode → ExecutableRegion → call
//! ```
//!
//! ## Modules
//!
//! - `registers`: ARM64 register definitions (X0-X30, SP)
//! - `encoding`: ARM64 instruction encoding (fixed 32-bit)
//! - `codegen`: stack-machine to ARM64 translation

pub mod codegen;
pub mod encoding;
pub mod registers;

pub use codegen::Arm64Codegen;
