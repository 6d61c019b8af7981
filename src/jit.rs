//! Code generator base.
//!
//! Orchestrates compilation: validate the body, pick the backend matching
//! the host CPU, emit machine code, install it as an executable region, and
//! hand back a callable artifact. Per the failure contract, codegen and
//! system failures collapse into an absent artifact (the caller's fallback
//! is the VM); only a missing `Main` surfaces as a hard error.

use thiserror::Error;

use crate::arm64::Arm64Codegen;
use crate::mem::{ExecutableRegion, MemoryError};
use crate::program::{Instruction, Program};
use crate::x64::X64Codegen;
use crate::{AnvilError, Result};

/// Capacity of the emitted function's red-zone stack, in 8-byte slots.
pub const VM_STACK_SLOTS: usize = 64;

/// Errors detected while generating machine code. These never escape the
/// public compile entries; they map to the artifact-absent fallback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    /// The instruction has no native implementation (`call`, `loadarg`).
    #[error("unsupported instruction '{mnemonic}' at instruction {at}")]
    UnsupportedInstruction { at: usize, mnemonic: &'static str },

    /// The body would pop an empty evaluation stack.
    #[error("stack underflow at instruction {at}")]
    StackUnderflow { at: usize },

    /// The body would outgrow the 512-byte red zone.
    #[error("evaluation stack would reach {depth} slots at instruction {at}")]
    RedZoneOverflow { at: usize, depth: usize },
}

/// A native code emitter for one target architecture.
pub trait Backend {
    /// Architecture name as reported by `std::env::consts::ARCH`.
    fn target(&self) -> &'static str;

    /// Emit a self-contained leaf function for one instruction body.
    fn emit(&self, body: &[Instruction]) -> std::result::Result<Vec<u8>, CodegenError>;
}

struct X64Backend;

impl Backend for X64Backend {
    fn target(&self) -> &'static str {
        "x86_64"
    }

    fn emit(&self, body: &[Instruction]) -> std::result::Result<Vec<u8>, CodegenError> {
        X64Codegen::new().compile_body(body)
    }
}

struct Arm64Backend;

impl Backend for Arm64Backend {
    fn target(&self) -> &'static str {
        "aarch64"
    }

    fn emit(&self, body: &[Instruction]) -> std::result::Result<Vec<u8>, CodegenError> {
        Arm64Codegen::new().compile_body(body)
    }
}

/// A compiled, installed, callable function. Owns its executable mapping;
/// dropping the artifact unmaps it.
#[derive(Debug)]
pub struct CompiledFunction {
    region: ExecutableRegion,
}

impl CompiledFunction {
    fn install(code: &[u8]) -> std::result::Result<Self, MemoryError> {
        Ok(Self {
            region: ExecutableRegion::install(code)?,
        })
    }

    /// Call the emitted function. The entry takes no arguments and returns
    /// one 64-bit signed integer in the architectural return register.
    pub fn invoke(&self) -> i64 {
        let entry: extern "C" fn() -> i64 = unsafe { std::mem::transmute(self.region.as_ptr()) };
        entry()
    }

    /// Size of the installed machine code in bytes.
    pub fn code_len(&self) -> usize {
        self.region.len()
    }
}

/// The JIT engine: backend selection plus the emit-install pipeline.
pub struct Jit {
    backend: Option<Box<dyn Backend>>,
}

impl Default for Jit {
    fn default() -> Self {
        Self::new()
    }
}

impl Jit {
    /// Select the backend whose target matches the host CPU. Hosts without
    /// a backend still construct; every compilation then reports an absent
    /// artifact.
    pub fn new() -> Self {
        let backend: Option<Box<dyn Backend>> = if cfg!(target_arch = "x86_64") {
            Some(Box::new(X64Backend))
        } else if cfg!(target_arch = "aarch64") {
            Some(Box::new(Arm64Backend))
        } else {
            None
        };
        Self { backend }
    }

    /// The selected backend's target name, if the host is supported.
    pub fn target(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.target())
    }

    /// Compile a flat instruction list. An absent artifact means the
    /// caller should fall back to the VM.
    pub fn compile_instructions(&self, instructions: &[Instruction]) -> Option<CompiledFunction> {
        self.compile_body(instructions)
    }

    /// Compile a program's `Main`. A program without `Main` is a hard
    /// error, distinct from the artifact-absent fallback.
    pub fn compile_program(&self, program: &Program) -> Result<Option<CompiledFunction>> {
        let main = program.main().ok_or(AnvilError::NoMainFunction)?;
        Ok(self.compile_body(&main.body))
    }

    /// Emit machine code for the body, if the host backend can. Useful for
    /// inspection without installing anything.
    pub fn emit_code(&self, body: &[Instruction]) -> Option<Vec<u8>> {
        let backend = self.backend.as_ref()?;
        validate_stack_effect(body).ok()?;
        backend.emit(body).ok()
    }

    fn compile_body(&self, body: &[Instruction]) -> Option<CompiledFunction> {
        let code = self.emit_code(body)?;
        CompiledFunction::install(&code).ok()
    }
}

/// Simulate the straight-line stack effect of a body, rejecting anything
/// the emitted leaf function could not run inside its red zone. Simulation
/// stops at the first `return`; later instructions are unreachable.
fn validate_stack_effect(body: &[Instruction]) -> std::result::Result<(), CodegenError> {
    let mut depth = 0usize;
    for (at, instr) in body.iter().enumerate() {
        match instr {
            Instruction::LoadImm(_) => {
                depth += 1;
                if depth > VM_STACK_SLOTS {
                    return Err(CodegenError::RedZoneOverflow { at, depth });
                }
            }
            Instruction::Add | Instruction::Sub | Instruction::Mul | Instruction::Div => {
                if depth < 2 {
                    return Err(CodegenError::StackUnderflow { at });
                }
                depth -= 1;
            }
            Instruction::Print => {
                if depth < 1 {
                    return Err(CodegenError::StackUnderflow { at });
                }
            }
            Instruction::Return => return Ok(()),
            Instruction::Call(_) | Instruction::LoadArg(_) => {
                return Err(CodegenError::UnsupportedInstruction {
                    at,
                    mnemonic: instr.mnemonic(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Function, Instruction::*};

    #[test]
    fn test_validate_accepts_straight_line_arithmetic() {
        assert!(validate_stack_effect(&[LoadImm(1), LoadImm(2), Add, Return]).is_ok());
        assert!(validate_stack_effect(&[]).is_ok());
    }

    #[test]
    fn test_validate_rejects_underflow() {
        assert_eq!(
            validate_stack_effect(&[Add]),
            Err(CodegenError::StackUnderflow { at: 0 })
        );
        assert_eq!(
            validate_stack_effect(&[LoadImm(1), Print, Div]),
            Err(CodegenError::StackUnderflow { at: 2 })
        );
        assert_eq!(
            validate_stack_effect(&[Print]),
            Err(CodegenError::StackUnderflow { at: 0 })
        );
    }

    #[test]
    fn test_validate_rejects_red_zone_overflow() {
        let mut body: Vec<_> = (0..65i64).map(LoadImm).collect();
        assert_eq!(
            validate_stack_effect(&body),
            Err(CodegenError::RedZoneOverflow { at: 64, depth: 65 })
        );
        // Exactly 64 slots fits.
        body.pop();
        assert!(validate_stack_effect(&body).is_ok());
    }

    #[test]
    fn test_validate_ignores_unreachable_tail() {
        assert!(validate_stack_effect(&[Return, Add, Div]).is_ok());
    }

    #[test]
    fn test_validate_rejects_calls() {
        assert_eq!(
            validate_stack_effect(&[Call("F".into())]),
            Err(CodegenError::UnsupportedInstruction {
                at: 0,
                mnemonic: "call"
            })
        );
    }

    #[test]
    fn test_compile_call_is_artifact_absent() {
        let jit = Jit::new();
        assert!(jit
            .compile_instructions(&[LoadImm(1), Call("F".into())])
            .is_none());
    }

    #[test]
    fn test_compile_program_without_main_is_hard_error() {
        let jit = Jit::new();
        let mut program = Program::new();
        program.push(Function::new("Helper", vec![], vec![Return]));
        assert!(matches!(
            jit.compile_program(&program),
            Err(AnvilError::NoMainFunction)
        ));
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    mod native {
        use super::*;
        use crate::program::Program;

        #[test]
        fn test_host_backend_selected() {
            let jit = Jit::new();
            assert_eq!(jit.target(), Some(std::env::consts::ARCH));
        }

        #[test]
        fn test_compile_and_invoke() {
            let jit = Jit::new();
            let compiled = jit
                .compile_instructions(&[LoadImm(10), LoadImm(5), Add, Return])
                .expect("host backend should compile arithmetic");
            assert_eq!(compiled.invoke(), 15);
            assert!(compiled.code_len() > 0);
        }

        #[test]
        fn test_empty_body_returns_zero() {
            let jit = Jit::new();
            let compiled = jit.compile_instructions(&[]).unwrap();
            assert_eq!(compiled.invoke(), 0);
        }

        #[test]
        fn test_compile_program_main() {
            let jit = Jit::new();
            let program = Program::from_instructions(vec![
                LoadImm(100),
                LoadImm(50),
                Sub,
                LoadImm(3),
                Div,
                LoadImm(4),
                Mul,
                Return,
            ]);
            let compiled = jit.compile_program(&program).unwrap().unwrap();
            assert_eq!(compiled.invoke(), 64);
        }

        #[test]
        fn test_invoke_is_repeatable() {
            let jit = Jit::new();
            let compiled = jit
                .compile_instructions(&[LoadImm(7), LoadImm(6), Mul, Return])
                .unwrap();
            for _ in 0..16 {
                assert_eq!(compiled.invoke(), 42);
            }
        }
    }
}
