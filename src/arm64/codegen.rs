//! Stack-machine to ARM64 translation.
//!
//! Same overall shape as the x64 backend, adapted to AArch64: the
//! evaluation stack lives in a 512-byte red zone below SP, indexed by X9
//! (a temporary register). X0 is the working accumulator and return
//! register, X1 the second operand. Loads and stores use scaled indexed
//! addressing `[SP, X9, LSL #3]`. The emitted function is a leaf: it
//! saves only the (FP, LR) pair.

use crate::jit::CodegenError;
use crate::program::Instruction;

use super::encoding;
use super::registers::{Reg64, RET_REG};

/// Bytes reserved below SP for the emitted function's private VM stack.
pub const RED_ZONE_BYTES: u16 = 512;

/// VM-top index register (temporary under AAPCS64).
const IDX: Reg64 = Reg64::X9;

/// Working accumulator; also the return register.
const ACC: Reg64 = RET_REG;

/// Second operand for binary operations.
const RHS: Reg64 = Reg64::X1;

/// ARM64 code generator for a single flat instruction body.
pub struct Arm64Codegen {
    code: Vec<u8>,
    /// Pending branches to the shared epilogue: byte offsets of B words.
    return_patches: Vec<usize>,
}

impl Default for Arm64Codegen {
    fn default() -> Self {
        Self::new()
    }
}

impl Arm64Codegen {
    pub fn new() -> Self {
        Self {
            code: Vec::with_capacity(256),
            return_patches: Vec::new(),
        }
    }

    /// Compile one instruction body into a self-contained leaf function.
    pub fn compile_body(mut self, body: &[Instruction]) -> Result<Vec<u8>, CodegenError> {
        self.emit_prologue();

        for (at, instr) in body.iter().enumerate() {
            match instr {
                Instruction::LoadImm(value) => self.emit_load_imm(*value),
                Instruction::Add => self.emit_binary(BinOp::Add),
                Instruction::Sub => self.emit_binary(BinOp::Sub),
                Instruction::Mul => self.emit_binary(BinOp::Mul),
                Instruction::Div => self.emit_binary(BinOp::Div),
                // Observation side channel exists only in the VM.
                Instruction::Print => {}
                Instruction::Return => {
                    self.return_patches.push(self.code.len());
                    encoding::b(&mut self.code, 0);
                }
                Instruction::Call(_) | Instruction::LoadArg(_) => {
                    return Err(CodegenError::UnsupportedInstruction {
                        at,
                        mnemonic: instr.mnemonic(),
                    });
                }
            }
        }

        self.emit_epilogue();
        Ok(self.code)
    }

    /// `stp x29, x30, [sp, #-16]!; mov x29, sp; sub sp, sp, #512;
    /// mov x9, xzr`
    fn emit_prologue(&mut self) {
        encoding::stp_pre_x(&mut self.code, Reg64::X29, Reg64::X30, Reg64::SP, -16);
        encoding::add_imm_x(&mut self.code, Reg64::X29, Reg64::SP, 0);
        encoding::sub_imm_x(&mut self.code, Reg64::SP, Reg64::SP, RED_ZONE_BYTES);
        encoding::mov_xzr(&mut self.code, IDX);
    }

    /// Materialize the literal and push it onto the red-zone stack.
    fn emit_load_imm(&mut self, value: i64) {
        encoding::load_imm64(&mut self.code, ACC, value);
        encoding::str_x_scaled(&mut self.code, ACC, Reg64::SP, IDX);
        encoding::add_imm_x(&mut self.code, IDX, IDX, 1);
    }

    /// Pop `b` (most recent) into X1, `a` into X0, combine as `a op b`,
    /// store the result back on the red-zone stack.
    fn emit_binary(&mut self, op: BinOp) {
        encoding::sub_imm_x(&mut self.code, IDX, IDX, 1);
        encoding::ldr_x_scaled(&mut self.code, RHS, Reg64::SP, IDX);
        encoding::sub_imm_x(&mut self.code, IDX, IDX, 1);
        encoding::ldr_x_scaled(&mut self.code, ACC, Reg64::SP, IDX);
        match op {
            BinOp::Add => encoding::add_x(&mut self.code, ACC, ACC, RHS),
            BinOp::Sub => encoding::sub_x(&mut self.code, ACC, ACC, RHS),
            BinOp::Mul => encoding::mul_x(&mut self.code, ACC, ACC, RHS),
            BinOp::Div => encoding::sdiv_x(&mut self.code, ACC, ACC, RHS),
        }
        encoding::str_x_scaled(&mut self.code, ACC, Reg64::SP, IDX);
        encoding::add_imm_x(&mut self.code, IDX, IDX, 1);
    }

    /// Shared epilogue: result is the red-zone top, or 0 for an empty
    /// stack; then release the red zone, restore (FP, LR), return.
    ///
    /// All epilogue instructions are fixed-size, so the internal branch
    /// offsets are static:
    ///
    /// ```text
    ///   cbz  x9, +16      ; empty stack -> zero result
    ///   sub  x9, x9, #1
    ///   ldr  x0, [sp, x9, lsl #3]
    ///   b    +8           ; skip the zero case
    ///   mov  x0, xzr
    ///   add  sp, sp, #512
    ///   ldp  x29, x30, [sp], #16
    ///   ret
    /// ```
    fn emit_epilogue(&mut self) {
        let epilogue = self.code.len();
        for patch in std::mem::take(&mut self.return_patches) {
            encoding::patch_b(&mut self.code, patch, epilogue);
        }

        encoding::cbz_x(&mut self.code, IDX, 16);
        encoding::sub_imm_x(&mut self.code, IDX, IDX, 1);
        encoding::ldr_x_scaled(&mut self.code, ACC, Reg64::SP, IDX);
        encoding::b(&mut self.code, 8);
        encoding::mov_xzr(&mut self.code, ACC);
        encoding::add_imm_x(&mut self.code, Reg64::SP, Reg64::SP, RED_ZONE_BYTES);
        encoding::ldp_post_x(&mut self.code, Reg64::X29, Reg64::X30, Reg64::SP, 16);
        encoding::ret(&mut self.code);
    }
}

#[derive(Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}
