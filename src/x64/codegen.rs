//! Stack-machine to x64 translation.
//!
//! Emits one leaf function per compilation. The evaluation stack lives in a
//! 512-byte red zone reserved on the machine stack, indexed by R11 (the
//! VM-top index, caller-saved). RAX is the working accumulator, RCX the
//! second operand; RDX is clobbered by division. The emitted function takes
//! no arguments and returns its result in RAX under both System V and
//! Microsoft x64, and touches no callee-saved register except RBP.

use crate::jit::CodegenError;
use crate::program::Instruction;

use super::encoding::CodeBuffer;
use super::registers::{Reg64, RET_REG};

/// Bytes reserved below RSP for the emitted function's private VM stack.
pub const RED_ZONE_BYTES: i32 = 512;

/// VM-top index register. Caller-saved, so the emitted leaf function needs
/// no save/restore for it.
const IDX: Reg64 = Reg64::R11;

/// Working accumulator; also the return register.
const ACC: Reg64 = RET_REG;

/// Second operand for binary operations.
const RHS: Reg64 = Reg64::RCX;

/// x64 code generator for a single flat instruction body.
pub struct X64Codegen {
    code: CodeBuffer,
    /// Pending jumps to the shared epilogue: rel32 patch offsets.
    return_patches: Vec<usize>,
}

impl Default for X64Codegen {
    fn default() -> Self {
        Self::new()
    }
}

impl X64Codegen {
    pub fn new() -> Self {
        Self {
            code: CodeBuffer::with_capacity(256),
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
                    let patch = self.code.jmp_rel32();
                    self.return_patches.push(patch);
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
        Ok(self.code.into_code())
    }

    /// `push rbp; mov rbp, rsp; sub rsp, 512; xor r11, r11`
    fn emit_prologue(&mut self) {
        self.code.push_r64(Reg64::RBP);
        self.code.mov_r64_r64(Reg64::RBP, Reg64::RSP);
        self.code.sub_r64_imm32(Reg64::RSP, RED_ZONE_BYTES);
        self.code.xor_r64_r64(IDX, IDX);
    }

    /// Materialize the literal and push it onto the red-zone stack.
    fn emit_load_imm(&mut self, value: i64) {
        self.code.mov_r64_imm64(ACC, value as u64);
        self.code.mov_sib8_r64(Reg64::RSP, IDX, ACC);
        self.code.inc_r64(IDX);
    }

    /// Pop `b` (most recent) into RCX, `a` into RAX, combine as `a op b`,
    /// store the result back on the red-zone stack.
    fn emit_binary(&mut self, op: BinOp) {
        self.code.dec_r64(IDX);
        self.code.mov_r64_sib8(RHS, Reg64::RSP, IDX);
        self.code.dec_r64(IDX);
        self.code.mov_r64_sib8(ACC, Reg64::RSP, IDX);
        match op {
            BinOp::Add => self.code.add_r64_r64(ACC, RHS),
            BinOp::Sub => self.code.sub_r64_r64(ACC, RHS),
            BinOp::Mul => self.code.imul_r64_r64(ACC, RHS),
            BinOp::Div => {
                // Sign-extend the dividend; quotient lands in RAX, the
                // remainder in RDX is discarded.
                self.code.cqo();
                self.code.idiv_r64(RHS);
            }
        }
        self.code.mov_sib8_r64(Reg64::RSP, IDX, ACC);
        self.code.inc_r64(IDX);
    }

    /// Shared epilogue: result is the red-zone top, or 0 for an empty
    /// stack; then release the red zone, restore RBP, return.
    fn emit_epilogue(&mut self) {
        let epilogue = self.code.offset();
        for patch in std::mem::take(&mut self.return_patches) {
            self.code.patch_rel32(patch, epilogue);
        }

        self.code.test_r64_r64(IDX, IDX);
        let empty = self.code.je_rel32();
        self.code.dec_r64(IDX);
        self.code.mov_r64_sib8(ACC, Reg64::RSP, IDX);
        let done = self.code.jmp_rel32();

        let empty_target = self.code.offset();
        self.code.patch_rel32(empty, empty_target);
        self.code.xor_r64_r64(ACC, ACC);

        let done_target = self.code.offset();
        self.code.patch_rel32(done, done_target);
        self.code.add_r64_imm32(Reg64::RSP, RED_ZONE_BYTES);
        self.code.pop_r64(Reg64::RBP);
        self.code.ret();
    }
}

#[derive(Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Instruction::*;

    #[test]
    fn test_empty_body_is_prologue_plus_epilogue() {
        let code = X64Codegen::new().compile_body(&[]).unwrap();
        // push rbp; mov rbp, rsp; sub rsp, 512; xor r11, r11
        assert_eq!(
            &code[0..13],
            &[
                0x55, // push rbp
                0x48, 0x89, 0xE5, // mov rbp, rsp
                0x48, 0x81, 0xEC, 0x00, 0x02, 0x00, 0x00, // sub rsp, 512
                0x4D, 0x31, // xor r11, r11 (first two bytes)
            ][0..13]
        );
        // ...add rsp, 512; pop rbp; ret
        let n = code.len();
        assert_eq!(
            &code[n - 9..],
            &[0x48, 0x81, 0xC4, 0x00, 0x02, 0x00, 0x00, 0x5D, 0xC3]
        );
    }

    #[test]
    fn test_load_imm_uses_movabs() {
        let code = X64Codegen::new()
            .compile_body(&[LoadImm(0x1122334455667788)])
            .unwrap();
        // After the 14-byte prologue: REX.W B8 imm64
        assert_eq!(&code[14..16], &[0x48, 0xB8]);
        assert_eq!(&code[16..24], &0x1122334455667788u64.to_le_bytes());
    }

    #[test]
    fn test_rejects_call() {
        let err = X64Codegen::new()
            .compile_body(&[LoadImm(1), Call("F".into())])
            .unwrap_err();
        assert_eq!(
            err,
            CodegenError::UnsupportedInstruction {
                at: 1,
                mnemonic: "call"
            }
        );
    }

    #[test]
    fn test_rejects_loadarg() {
        let err = X64Codegen::new().compile_body(&[LoadArg(0)]).unwrap_err();
        assert_eq!(
            err,
            CodegenError::UnsupportedInstruction {
                at: 0,
                mnemonic: "loadarg"
            }
        );
    }

    #[test]
    fn test_print_emits_nothing() {
        let quiet = X64Codegen::new().compile_body(&[LoadImm(1)]).unwrap();
        let printing = X64Codegen::new()
            .compile_body(&[LoadImm(1), Print])
            .unwrap();
        assert_eq!(quiet, printing);
    }

    #[test]
    fn test_mid_body_return_jumps_to_epilogue() {
        let with_tail = X64Codegen::new()
            .compile_body(&[LoadImm(1), Return])
            .unwrap();
        // The return emits a jmp rel32 whose displacement is 0: the
        // epilogue starts immediately after it. The shared epilogue is 33
        // bytes; the jmp itself is 5.
        let jmp_at = with_tail.len() - 33 - 5;
        assert_eq!(with_tail[jmp_at], 0xE9);
        assert_eq!(&with_tail[jmp_at + 1..jmp_at + 5], &0i32.to_le_bytes());
    }
}
