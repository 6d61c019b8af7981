//! x64 Instruction Encoding
//!
//! Direct machine code generation for x64 instructions.
//! No external assembler dependency.
//!
//! ## Instruction Format
//!
//! ```text
//! [Legacy Prefix] [REX] [Opcode] [ModR/M] [SIB] [Disp] [Imm]
//! ```

use super::registers::Reg64;

/// Machine code buffer for emitting instructions
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
        }
    }

    /// Get current code offset
    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a single byte
    #[inline]
    pub fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 64-bit little-endian value
    #[inline]
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a signed 32-bit little-endian value
    #[inline]
    pub fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Patch a 32-bit value at the given offset
    pub fn patch_i32(&mut self, offset: usize, value: i32) {
        let bytes = value.to_le_bytes();
        self.code[offset..offset + 4].copy_from_slice(&bytes);
    }

    /// Get the generated code
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Take ownership of the generated code
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}

/// REX prefix builder
#[derive(Debug, Clone, Copy, Default)]
pub struct Rex {
    w: bool, // 64-bit operand size
    r: bool, // ModR/M reg extension
    x: bool, // SIB index extension
    b: bool, // ModR/M r/m or SIB base extension
}

impl Rex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set W bit (64-bit operand size)
    pub fn w(mut self) -> Self {
        self.w = true;
        self
    }

    /// Set R bit (reg field extension for r8-r15)
    pub fn r(mut self) -> Self {
        self.r = true;
        self
    }

    /// Set X bit (SIB index extension for r8-r15)
    pub fn x(mut self) -> Self {
        self.x = true;
        self
    }

    /// Set B bit (r/m or base field extension for r8-r15)
    pub fn b(mut self) -> Self {
        self.b = true;
        self
    }

    /// Encode to byte (0x40-0x4F)
    pub fn encode(&self) -> u8 {
        0x40 | ((self.w as u8) << 3)
            | ((self.r as u8) << 2)
            | ((self.x as u8) << 1)
            | (self.b as u8)
    }
}

/// ModR/M byte builder
#[derive(Debug, Clone, Copy)]
pub struct ModRM {
    mod_: u8, // 2 bits: addressing mode
    reg: u8,  // 3 bits: register or opcode extension
    rm: u8,   // 3 bits: register or memory operand
}

impl ModRM {
    /// Create ModR/M for register-to-register (mod=11)
    pub fn reg_reg(reg: u8, rm: u8) -> Self {
        Self {
            mod_: 0b11,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Create ModR/M for register with opcode extension (mod=11)
    pub fn reg_opext(opext: u8, rm: u8) -> Self {
        Self {
            mod_: 0b11,
            reg: opext & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Create ModR/M for a SIB-addressed memory operand (rm=100)
    pub fn mem_sib(reg: u8, mod_: u8) -> Self {
        Self {
            mod_,
            reg: reg & 0x07,
            rm: 0b100,
        }
    }

    /// Encode to byte
    pub fn encode(&self) -> u8 {
        (self.mod_ << 6) | (self.reg << 3) | self.rm
    }
}

/// SIB byte builder
#[derive(Debug, Clone, Copy)]
pub struct Sib {
    scale: u8, // 2 bits: 1, 2, 4, 8
    index: u8, // 3 bits
    base: u8,  // 3 bits
}

impl Sib {
    /// Create SIB for `[base + index * 8]`
    pub fn scaled8(index: u8, base: u8) -> Self {
        Self {
            scale: 0b11,
            index: index & 0x07,
            base: base & 0x07,
        }
    }

    /// Encode to byte
    pub fn encode(&self) -> u8 {
        (self.scale << 6) | (self.index << 3) | self.base
    }
}

/// x64 instruction emitter
impl CodeBuffer {
    // ==================== Data Movement ====================

    /// MOV r64, imm64 (movabs)
    pub fn mov_r64_imm64(&mut self, dst: Reg64, imm: u64) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xB8 + dst.encoding()); // B8+rd
        self.emit_u64(imm);
    }

    /// MOV r64, r64
    pub fn mov_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x89); // 89 /r
        self.emit(ModRM::reg_reg(src.encoding(), dst.encoding()).encode());
    }

    /// MOV [base + index*8], r64 (scaled-index store)
    pub fn mov_sib8_r64(&mut self, base: Reg64, index: Reg64, src: Reg64) {
        self.emit_sib8(0x89, src, base, index);
    }

    /// MOV r64, [base + index*8] (scaled-index load)
    pub fn mov_r64_sib8(&mut self, dst: Reg64, base: Reg64, index: Reg64) {
        self.emit_sib8(0x8B, dst, base, index);
    }

    /// Shared REX + ModR/M + SIB emission for `[base + index*8]` operands.
    /// RSP cannot appear in the index field (its encoding means "no index").
    fn emit_sib8(&mut self, opcode: u8, reg: Reg64, base: Reg64, index: Reg64) {
        debug_assert!(index != Reg64::RSP, "rsp is not a valid SIB index");
        let mut rex = Rex::new().w();
        if reg.needs_rex_ext() {
            rex = rex.r();
        }
        if index.needs_rex_ext() {
            rex = rex.x();
        }
        if base.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(opcode);
        // mod=00 with base encoding 5 (rbp/r13) would mean disp32-only, so
        // those bases take the disp8 form with a zero displacement.
        let needs_disp8 = base.encoding() == 5;
        let mod_ = if needs_disp8 { 0b01 } else { 0b00 };
        self.emit(ModRM::mem_sib(reg.encoding(), mod_).encode());
        self.emit(Sib::scaled8(index.encoding(), base.encoding()).encode());
        if needs_disp8 {
            self.emit(0x00);
        }
    }

    // ==================== Arithmetic ====================

    /// ADD r64, r64
    pub fn add_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x01); // 01 /r
        self.emit(ModRM::reg_reg(src.encoding(), dst.encoding()).encode());
    }

    /// ADD r64, imm32 (sign-extended)
    pub fn add_r64_imm32(&mut self, dst: Reg64, imm: i32) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x81); // 81 /0
        self.emit(ModRM::reg_opext(0, dst.encoding()).encode());
        self.emit_i32(imm);
    }

    /// SUB r64, r64
    pub fn sub_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x29); // 29 /r
        self.emit(ModRM::reg_reg(src.encoding(), dst.encoding()).encode());
    }

    /// SUB r64, imm32 (sign-extended)
    pub fn sub_r64_imm32(&mut self, dst: Reg64, imm: i32) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x81); // 81 /5
        self.emit(ModRM::reg_opext(5, dst.encoding()).encode());
        self.emit_i32(imm);
    }

    /// IMUL r64, r64
    pub fn imul_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.r();
        }
        if src.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x0F);
        self.emit(0xAF); // 0F AF /r
        self.emit(ModRM::reg_reg(dst.encoding(), src.encoding()).encode());
    }

    /// CQO (sign-extend RAX into RDX:RAX for division)
    pub fn cqo(&mut self) {
        self.emit(Rex::new().w().encode());
        self.emit(0x99);
    }

    /// IDIV r64 (signed divide RDX:RAX by r64, quotient in RAX, remainder in RDX)
    pub fn idiv_r64(&mut self, divisor: Reg64) {
        let mut rex = Rex::new().w();
        if divisor.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xF7); // F7 /7
        self.emit(ModRM::reg_opext(7, divisor.encoding()).encode());
    }

    /// INC r64
    pub fn inc_r64(&mut self, dst: Reg64) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xFF); // FF /0
        self.emit(ModRM::reg_opext(0, dst.encoding()).encode());
    }

    /// DEC r64
    pub fn dec_r64(&mut self, dst: Reg64) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xFF); // FF /1
        self.emit(ModRM::reg_opext(1, dst.encoding()).encode());
    }

    // ==================== Comparison ====================

    /// TEST r64, r64
    pub fn test_r64_r64(&mut self, left: Reg64, right: Reg64) {
        let mut rex = Rex::new().w();
        if right.needs_rex_ext() {
            rex = rex.r();
        }
        if left.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x85); // 85 /r
        self.emit(ModRM::reg_reg(right.encoding(), left.encoding()).encode());
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push_r64(&mut self, reg: Reg64) {
        if reg.needs_rex_ext() {
            self.emit(Rex::new().b().encode());
        }
        self.emit(0x50 + reg.encoding()); // 50+rd
    }

    /// POP r64
    pub fn pop_r64(&mut self, reg: Reg64) {
        if reg.needs_rex_ext() {
            self.emit(Rex::new().b().encode());
        }
        self.emit(0x58 + reg.encoding()); // 58+rd
    }

    // ==================== Control Flow ====================

    /// RET
    pub fn ret(&mut self) {
        self.emit(0xC3);
    }

    /// JMP rel32 (near jump, returns offset of the displacement for patching)
    pub fn jmp_rel32(&mut self) -> usize {
        self.emit(0xE9); // E9 cd
        let offset = self.offset();
        self.emit_i32(0); // placeholder
        offset
    }

    /// JE rel32 (jump if equal, returns offset of the displacement)
    pub fn je_rel32(&mut self) -> usize {
        self.emit(0x0F);
        self.emit(0x84); // 0F 84 cd
        let offset = self.offset();
        self.emit_i32(0);
        offset
    }

    /// Patch a previously emitted rel32 displacement to land on `target`.
    pub fn patch_rel32(&mut self, disp_offset: usize, target: usize) {
        let rel = (target as i64 - (disp_offset as i64 + 4)) as i32;
        self.patch_i32(disp_offset, rel);
    }

    // ==================== Bitwise Operations ====================

    /// XOR r64, r64 (often used to zero a register)
    pub fn xor_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x31); // 31 /r
        self.emit(ModRM::reg_reg(src.encoding(), dst.encoding()).encode());
    }
}
