//! # Anvil
//!
//! A small ahead-of-time-style JIT engine for a stack-based arithmetic
//! instruction set.
//!
//! A caller provides either a flat instruction list or a multi-function
//! program; the engine parses, validates, and then either interprets it on
//! a stack virtual machine or emits native machine code for the host CPU
//! (x86-64 or AArch64) and executes it as an ordinary native call.
//!
//! ## Pipeline
//!
//! ```text
//! source → parser → Program ─┬─→ Vm (reference semantics)
//!                            └─→ Jit → machine code → ExecutableRegion → call
//! ```
//!
//! The executable-memory lifecycle is W^X throughout: a region is writable
//! while code is copied in, then re-protected as read+execute before the
//! first call. Codegen failures and allocator failures collapse into an
//! absent artifact; callers fall back to the VM.

pub mod arm64;
pub mod fmt;
pub mod jit;
pub mod mem;
pub mod parser;
pub mod program;
pub mod vm;
pub mod x64;

use thiserror::Error;

pub use jit::{CompiledFunction, Jit};
pub use parser::{parse_flat, parse_program, ParseError};
pub use program::{Function, Instruction, Program};
pub use vm::{RuntimeError, Vm};

/// Top-level error type aggregating every failure a public entry point can
/// produce.
#[derive(Debug, Error)]
pub enum AnvilError {
    /// Either surface grammar rejected the input.
    #[error(transparent)]
    Parse(#[from] parser::ParseError),

    /// The VM raised a runtime error.
    #[error(transparent)]
    Runtime(#[from] vm::RuntimeError),

    /// A host memory operation failed.
    #[error(transparent)]
    Memory(#[from] mem::MemoryError),

    /// Code generation failed.
    #[error(transparent)]
    Codegen(#[from] jit::CodegenError),

    /// The program declares no `Main` to compile.
    #[error("program has no Main function")]
    NoMainFunction,
}

/// Result type for anvil operations
pub type Result<T> = std::result::Result<T, AnvilError>;

/// Execute flat source: parse, then JIT with VM fallback.
pub fn run_flat_source(source: &str) -> Result<i64> {
    // Phase 1: Parse
    let program = parser::parse_flat(source)?;

    // Phase 2: Execute
    run_program(&program)
}

/// Execute function-grammar source: parse, then JIT with VM fallback.
pub fn run_program_source(source: &str) -> Result<i64> {
    // Phase 1: Parse
    let program = parser::parse_program(source)?;

    // Phase 2: Execute
    run_program(&program)
}

/// Execute a parsed program.
///
/// Tries the native path first; an absent artifact (unsupported host,
/// unsupported instruction, allocator refusal) falls back to the VM.
/// Programs that rely on `print` output should run on the VM directly,
/// where the instruction has its side channel.
pub fn run_program(program: &Program) -> Result<i64> {
    let jit = Jit::new();
    match jit.compile_program(program)? {
        Some(compiled) => Ok(compiled.invoke()),
        None => {
            let mut vm = Vm::new();
            Ok(vm.execute_program(program)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flat_source() {
        assert_eq!(run_flat_source("load 10\nload 5\nadd\nret\n").unwrap(), 15);
        assert_eq!(run_flat_source("").unwrap(), 0);
    }

    #[test]
    fn test_run_program_source_with_calls() {
        let source = "\
int Main()
{
load 10
load 5
call Step1
load 2
mul
ret
}

int Step1(int, int)
{
loadarg 0
loadarg 1
add
ret
}
";
        // `call` forces the VM fallback; result matches the reference
        // semantics either way.
        assert_eq!(run_program_source(source).unwrap(), 30);
    }

    #[test]
    fn test_run_program_source_no_main() {
        let source = "int Helper()\n{\nload 1\nret\n}\n";
        assert!(matches!(
            run_program_source(source),
            Err(AnvilError::NoMainFunction)
        ));
    }

    #[test]
    fn test_parse_error_propagates() {
        assert!(matches!(
            run_flat_source("bogus\n"),
            Err(AnvilError::Parse(ParseError::UnknownInstruction { .. }))
        ));
    }

    #[test]
    fn test_runtime_error_propagates() {
        // Division by zero is a VM-level error; emitted native code has no
        // error channel, so the check belongs to the interpreter.
        let source = "int Main()\n{\nload 10\nload 0\ndiv\nret\n}\n";
        let program = parse_program(source).unwrap();
        let mut vm = Vm::new();
        assert!(matches!(
            vm.execute_program(&program),
            Err(RuntimeError::DivideByZero { .. })
        ));
    }
}
