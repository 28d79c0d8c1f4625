//! AMD64 instruction encoding.
//!
//! Hand-rolled encoder for the instruction subset the machine emitter
//! needs. Emitted code assumes SSE2 is available (any 64-bit x86 does).
//!
//! Instruction format, for reference:
//! prefixes, REX if needed, opcode (1-3 bytes), ModR/M, SIB, displacement,
//! immediate; 15 bytes max.

use super::codebuf::CodeBuffer;
use super::operands::{Mem, OperandSize, Reg, RegMem, Xmm};

/// Comparison conditions; the value is the second opcode byte of the
/// corresponding SETcc instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    Eq = 0x94,
    Ne = 0x95,
    Lt = 0x9C,
    Ge = 0x9D,
    Le = 0x9E,
    Gt = 0x9F,
}

/// Operand combinations the encoder cannot express.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeError(pub &'static str);

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "not implemented: {}", self.0)
    }
}

impl std::error::Error for EncodeError {}

fn fits_i8(value: i32) -> bool {
    value == value as i8 as i32
}

/// AMD64 assembler writing into a [`CodeBuffer`].
pub struct Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn offset(&self) -> u32 {
        self.buf.offset()
    }

    // ==================== prefix and ModR/M helpers ====================

    /// REX is only emitted when one of W/R/X/B is set.
    fn rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        let flags = ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8);
        if flags != 0 {
            self.buf.emit_u8(0x40 | flags);
        }
    }

    /// An empty REX selects SPL/BPL/SIL/DIL instead of AH/CH/DH/BH for
    /// byte operands.
    fn force_rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        let flags = ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8);
        self.buf.emit_u8(0x40 | flags);
    }

    /// Operand-size override and REX for a reg, r/m operand pair. `reg` is
    /// `None` when the ModR/M reg field carries an opcode extension.
    fn prefixes(&mut self, size: OperandSize, reg: Option<Reg>, rm: RegMem) {
        if size == OperandSize::Word {
            self.buf.emit_u8(0x66);
        }

        let w = size == OperandSize::Qword;
        let r = reg.is_some_and(|r| r.is_extended());
        let x = match rm {
            RegMem::Mem(m) => m.index.is_some_and(|i| i.is_extended()),
            _ => false,
        };
        let b = match rm {
            RegMem::Reg(r) => r.is_extended(),
            RegMem::Xmm(x) => x.is_extended(),
            RegMem::Mem(m) => m.base.is_extended(),
        };

        // Byte accesses to SPL/BPL/SIL/DIL need an empty REX so the high
        // byte registers are not addressed instead.
        let byte_rex = size == OperandSize::Byte
            && (reg.is_some_and(|r| r as u8 > Reg::Rbx as u8)
                || matches!(rm, RegMem::Reg(r) if r as u8 > Reg::Rbx as u8));
        if byte_rex {
            self.force_rex(w, r, x, b);
        } else {
            self.rex(w, r, x, b);
        }
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.buf
            .emit_u8(((mode & 0b11) << 6) | ((reg & 0b111) << 3) | (rm & 0b111));
    }

    fn sib(&mut self, base: Reg, index_code: u8, scale: u8) {
        let log2 = scale.trailing_zeros() as u8;
        self.buf
            .emit_u8((log2 << 6) | ((index_code & 0b111) << 3) | base.code());
    }

    fn operands(&mut self, reg: u8, rm: RegMem) {
        match rm {
            RegMem::Reg(r) => self.modrm(0b11, reg, r.code()),
            RegMem::Xmm(x) => self.modrm(0b11, reg, x.code()),
            RegMem::Mem(m) => self.mem_operands(reg, m),
        }
    }

    fn mem_operands(&mut self, reg: u8, m: Mem) {
        match m.index {
            None => {
                if m.disp == 0 {
                    if m.base.code() == 0b100 {
                        // RSP/R12 as base force a SIB byte with no index
                        self.modrm(0b00, reg, 0b100);
                        self.sib(m.base, 0b100, 1);
                    } else if m.base.code() == 0b101 {
                        // RBP/R13 have no displacement-free form
                        self.modrm(0b01, reg, 0b101);
                        self.buf.emit_u8(0);
                    } else {
                        self.modrm(0b00, reg, m.base.code());
                    }
                } else if fits_i8(m.disp) {
                    if m.base.code() == 0b100 {
                        self.modrm(0b01, reg, 0b100);
                        self.sib(m.base, 0b100, 1);
                    } else {
                        self.modrm(0b01, reg, m.base.code());
                    }
                    self.buf.emit_u8(m.disp as u8);
                } else {
                    if m.base.code() == 0b100 {
                        self.modrm(0b10, reg, 0b100);
                        self.sib(m.base, 0b100, 1);
                    } else {
                        self.modrm(0b10, reg, m.base.code());
                    }
                    self.buf.emit_u32(m.disp as u32);
                }
            }
            Some(index) => {
                if m.disp == 0 && m.base.code() != 0b101 {
                    self.modrm(0b00, reg, 0b100);
                    self.sib(m.base, index.code(), m.scale);
                } else if fits_i8(m.disp) {
                    self.modrm(0b01, reg, 0b100);
                    self.sib(m.base, index.code(), m.scale);
                    self.buf.emit_u8(m.disp as u8);
                } else {
                    self.modrm(0b10, reg, 0b100);
                    self.sib(m.base, index.code(), m.scale);
                    self.buf.emit_u32(m.disp as u32);
                }
            }
        }
    }

    // ==================== data movement ====================

    /// Register to register move; a move onto itself emits nothing.
    pub fn mov_rr(&mut self, src: Reg, dst: Reg, size: OperandSize) {
        if src == dst {
            return;
        }
        self.mov_store(src, RegMem::Reg(dst), size);
    }

    /// MOV r/m, r (register into register or memory).
    pub fn mov_store(&mut self, src: Reg, dst: RegMem, size: OperandSize) {
        self.prefixes(size, Some(src), dst);
        self.buf
            .emit_u8(if size == OperandSize::Byte { 0x88 } else { 0x89 });
        self.operands(src.code(), dst);
    }

    /// MOV r, r/m (register or memory into register).
    pub fn mov_load(&mut self, src: RegMem, dst: Reg, size: OperandSize) {
        self.prefixes(size, Some(dst), src);
        self.buf
            .emit_u8(if size == OperandSize::Byte { 0x8A } else { 0x8B });
        self.operands(dst.code(), src);
    }

    /// Sign-extending load for BYTE and WORD sources.
    pub fn movsx(&mut self, src: RegMem, dst: Reg, size: OperandSize) -> Result<(), EncodeError> {
        self.prefixes(OperandSize::Qword, Some(dst), src);
        match size {
            OperandSize::Byte => {
                self.buf.emit_u8(0x0F);
                self.buf.emit_u8(0xBE);
            }
            OperandSize::Word => {
                self.buf.emit_u8(0x0F);
                self.buf.emit_u8(0xBF);
            }
            _ => return Err(EncodeError("movsx is only available for byte and word")),
        }
        self.operands(dst.code(), src);
        Ok(())
    }

    /// Zero-extend the low byte of a register over its full width.
    pub fn movzx8(&mut self, src: Reg, dst: Reg) {
        self.prefixes(OperandSize::Qword, Some(dst), RegMem::Reg(src));
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.modrm(0b11, dst.code(), src.code());
    }

    /// Sign-extending dword load.
    pub fn movsxd(&mut self, src: RegMem, dst: Reg) {
        self.prefixes(OperandSize::Qword, Some(dst), src);
        self.buf.emit_u8(0x63);
        self.operands(dst.code(), src);
    }

    /// Immediate into register: `xor` for zero, sign-extended imm32 when it
    /// fits, full imm64 otherwise.
    pub fn movimm(&mut self, imm: i64, dst: Reg) {
        if imm == 0 {
            if dst.is_extended() {
                self.rex(true, true, false, true);
            }
            self.buf.emit_u8(0x31);
            self.modrm(0b11, dst.code(), dst.code());
        } else if imm == imm as i32 as i64 {
            self.rex(true, false, false, dst.is_extended());
            self.buf.emit_u8(0xC7);
            self.modrm(0b11, 0, dst.code());
            self.buf.emit_u32(imm as i32 as u32);
        } else {
            self.rex(true, false, false, dst.is_extended());
            self.buf.emit_u8(0xB8 | dst.code());
            self.buf.emit_u64(imm as u64);
        }
    }

    /// MOV r/m, imm with the operand's width; the immediate must fit a
    /// sign-extended imm32.
    pub fn movimm_store(&mut self, imm: i64, dst: Mem, size: OperandSize) -> Result<(), EncodeError> {
        if imm != imm as i32 as i64 {
            return Err(EncodeError("64-bit immediate store to memory"));
        }
        self.prefixes(size, None, RegMem::Mem(dst));
        self.buf
            .emit_u8(if size == OperandSize::Byte { 0xC6 } else { 0xC7 });
        self.mem_operands(0, dst);
        match size {
            OperandSize::Byte => self.buf.emit_u8(imm as u8),
            OperandSize::Word => self.buf.emit_u16(imm as u16),
            _ => self.buf.emit_u32(imm as i32 as u32),
        }
        Ok(())
    }

    /// General move dispatcher over [`RegMem`] operands.
    pub fn mov(&mut self, src: RegMem, dst: RegMem, size: OperandSize) -> Result<(), EncodeError> {
        match (src, dst) {
            (RegMem::Reg(s), RegMem::Reg(d)) => {
                self.mov_rr(s, d, size);
                Ok(())
            }
            (RegMem::Reg(s), RegMem::Mem(_)) => {
                self.mov_store(s, dst, size);
                Ok(())
            }
            (RegMem::Mem(_), RegMem::Reg(d)) => {
                self.mov_load(src, d, size);
                Ok(())
            }
            (RegMem::Xmm(s), RegMem::Xmm(d)) => {
                self.movf(s, d, size);
                Ok(())
            }
            (RegMem::Mem(m), RegMem::Xmm(d)) => self.movf_load(m, d, size),
            (RegMem::Xmm(s), RegMem::Mem(m)) => self.movf_store(s, m, size),
            _ => Err(EncodeError("memory to memory move")),
        }
    }

    // ==================== SSE moves ====================

    fn sse_prefix(&mut self, size: OperandSize) -> Result<(), EncodeError> {
        match size {
            OperandSize::Dword => self.buf.emit_u8(0xF3),
            OperandSize::Qword => self.buf.emit_u8(0xF2),
            _ => return Err(EncodeError("sse operation with sub-dword size")),
        }
        Ok(())
    }

    /// MOVSS/MOVSD xmm, xmm.
    pub fn movf(&mut self, src: Xmm, dst: Xmm, size: OperandSize) {
        if src == dst {
            return;
        }
        // falls back to the double form for untyped moves
        let _ = self.sse_prefix(if size == OperandSize::Dword {
            OperandSize::Dword
        } else {
            OperandSize::Qword
        });
        self.rex(false, dst.is_extended(), false, src.is_extended());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x10);
        self.modrm(0b11, dst.code(), src.code());
    }

    /// MOVSS/MOVSD xmm, m.
    pub fn movf_load(&mut self, src: Mem, dst: Xmm, size: OperandSize) -> Result<(), EncodeError> {
        self.sse_prefix(size)?;
        self.rex(
            false,
            dst.is_extended(),
            src.index.is_some_and(|i| i.is_extended()),
            src.base.is_extended(),
        );
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x10);
        self.mem_operands(dst.code(), src);
        Ok(())
    }

    /// MOVSS/MOVSD m, xmm.
    pub fn movf_store(&mut self, src: Xmm, dst: Mem, size: OperandSize) -> Result<(), EncodeError> {
        self.sse_prefix(size)?;
        self.rex(
            false,
            src.is_extended(),
            dst.index.is_some_and(|i| i.is_extended()),
            dst.base.is_extended(),
        );
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x11);
        self.mem_operands(src.code(), dst);
        Ok(())
    }

    /// MOVD/MOVQ xmm, r: bit pattern transfer from a general register.
    pub fn movd(&mut self, src: Reg, dst: Xmm, size: OperandSize) {
        self.buf.emit_u8(0x66);
        self.rex(
            size == OperandSize::Qword,
            dst.is_extended(),
            false,
            src.is_extended(),
        );
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x6E);
        self.modrm(0b11, dst.code(), src.code());
    }

    // ==================== arithmetic ====================

    /// ADD dst, r/m.
    pub fn add(&mut self, src: RegMem, dst: Reg, size: OperandSize) -> Result<(), EncodeError> {
        match src {
            RegMem::Reg(s) => {
                self.prefixes(size, Some(s), RegMem::Reg(dst));
                self.buf.emit_u8(0x01);
                self.operands(s.code(), RegMem::Reg(dst));
            }
            RegMem::Mem(_) => {
                self.prefixes(size, Some(dst), src);
                self.buf.emit_u8(0x03);
                self.operands(dst.code(), src);
            }
            RegMem::Xmm(_) => return Err(EncodeError("add with xmm operand")),
        }
        Ok(())
    }

    /// ADD r64, imm32 (sign-extended).
    pub fn add_imm(&mut self, dst: Reg, imm: i32) {
        self.rex(true, false, false, dst.is_extended());
        self.buf.emit_u8(0x81);
        self.modrm(0b11, 0, dst.code());
        self.buf.emit_u32(imm as u32);
    }

    /// SUB dst, r/m.
    pub fn sub(&mut self, src: RegMem, dst: Reg, size: OperandSize) -> Result<(), EncodeError> {
        match src {
            RegMem::Reg(s) => {
                self.prefixes(size, Some(s), RegMem::Reg(dst));
                self.buf.emit_u8(0x29);
                self.operands(s.code(), RegMem::Reg(dst));
            }
            RegMem::Mem(_) => {
                self.prefixes(size, Some(dst), src);
                self.buf.emit_u8(0x2B);
                self.operands(dst.code(), src);
            }
            RegMem::Xmm(_) => return Err(EncodeError("sub with xmm operand")),
        }
        Ok(())
    }

    /// SUB r64, imm32 (sign-extended).
    pub fn sub_imm(&mut self, dst: Reg, imm: i32) {
        self.rex(true, false, false, dst.is_extended());
        self.buf.emit_u8(0x81);
        self.modrm(0b11, 5, dst.code());
        self.buf.emit_u32(imm as u32);
    }

    /// IMUL dst, r/m (two-operand form, always 64-bit).
    pub fn imul(&mut self, dst: Reg, src: RegMem) -> Result<(), EncodeError> {
        if src.is_xmm() {
            return Err(EncodeError("imul with xmm operand"));
        }
        self.prefixes(OperandSize::Qword, Some(dst), src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.operands(dst.code(), src);
        Ok(())
    }

    /// IDIV r/m: divides RDX:RAX, quotient in RAX, remainder in RDX.
    pub fn idiv(&mut self, divisor: RegMem, size: OperandSize) -> Result<(), EncodeError> {
        if divisor.is_xmm() {
            return Err(EncodeError("idiv with xmm operand"));
        }
        self.prefixes(size, None, divisor);
        self.buf.emit_u8(0xF7);
        self.operands(7, divisor);
        Ok(())
    }

    /// CQO: sign-extend RAX into RDX:RAX.
    pub fn cqo(&mut self) {
        self.rex(true, false, false, false);
        self.buf.emit_u8(0x99);
    }

    /// NEG r.
    pub fn neg(&mut self, dst: Reg, size: OperandSize) {
        self.prefixes(size, None, RegMem::Reg(dst));
        self.buf
            .emit_u8(if size == OperandSize::Byte { 0xF6 } else { 0xF7 });
        self.modrm(0b11, 3, dst.code());
    }

    /// NOT r64.
    pub fn not(&mut self, dst: Reg) {
        self.rex(true, false, false, dst.is_extended());
        self.buf.emit_u8(0xF7);
        self.modrm(0b11, 2, dst.code());
    }

    // ==================== SSE arithmetic ====================

    /// ADDSS/ADDSD dst, src.
    pub fn addf(&mut self, src: Xmm, dst: Xmm, size: OperandSize) -> Result<(), EncodeError> {
        self.sse_prefix(size)?;
        self.rex(false, dst.is_extended(), false, src.is_extended());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x58);
        self.modrm(0b11, dst.code(), src.code());
        Ok(())
    }

    /// SUBSS/SUBSD dst, src.
    pub fn subf(&mut self, src: Xmm, dst: Xmm, size: OperandSize) -> Result<(), EncodeError> {
        self.sse_prefix(size)?;
        self.rex(false, dst.is_extended(), false, src.is_extended());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x5C);
        self.modrm(0b11, dst.code(), src.code());
        Ok(())
    }

    /// MULSS/MULSD dst, src.
    pub fn mulf(&mut self, src: Xmm, dst: Xmm, size: OperandSize) -> Result<(), EncodeError> {
        self.sse_prefix(size)?;
        self.rex(false, dst.is_extended(), false, src.is_extended());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x59);
        self.modrm(0b11, dst.code(), src.code());
        Ok(())
    }

    /// DIVSS/DIVSD dst, src. The divisor must be a register.
    pub fn divf(&mut self, dst: Xmm, src: RegMem, size: OperandSize) -> Result<(), EncodeError> {
        self.sse_prefix(size)?;
        match src {
            RegMem::Xmm(s) => {
                self.rex(false, dst.is_extended(), false, s.is_extended());
                self.buf.emit_u8(0x0F);
                self.buf.emit_u8(0x5E);
                self.modrm(0b11, dst.code(), s.code());
                Ok(())
            }
            _ => Err(EncodeError("divf with memory second source")),
        }
    }

    // ==================== comparison and flags ====================

    /// CMP a, r/m.
    pub fn cmp(&mut self, a: Reg, b: RegMem, size: OperandSize) -> Result<(), EncodeError> {
        if b.is_xmm() {
            return Err(EncodeError("cmp with xmm operand"));
        }
        self.prefixes(size, Some(a), b);
        self.buf.emit_u8(0x3B);
        self.operands(a.code(), b);
        Ok(())
    }

    /// SETcc r8.
    pub fn set(&mut self, cc: Cc, dst: Reg) {
        if dst as u8 > Reg::Rbx as u8 {
            self.force_rex(false, false, false, dst.is_extended());
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(cc as u8);
        self.modrm(0b11, 0, dst.code());
    }

    /// SETcc on a spilled byte.
    pub fn set_mem(&mut self, cc: Cc, dst: Mem) {
        self.rex(
            false,
            false,
            dst.index.is_some_and(|i| i.is_extended()),
            dst.base.is_extended(),
        );
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(cc as u8);
        self.mem_operands(0, dst);
    }

    /// TEST r8, 1: sets ZF from the low bit of a boolean register.
    pub fn test(&mut self, src: Reg) {
        self.prefixes(OperandSize::Byte, None, RegMem::Reg(src));
        self.buf.emit_u8(0xF6);
        self.modrm(0b11, 0, src.code());
        self.buf.emit_u8(1);
    }

    // ==================== control flow ====================

    /// JMP rel32 with a zero placeholder; returns the displacement offset
    /// for later patching.
    pub fn jmp_rel32(&mut self) -> u32 {
        self.buf.emit_u8(0xE9);
        let at = self.buf.offset();
        self.buf.emit_u32(0);
        at
    }

    /// JNZ rel32 with a zero placeholder; returns the displacement offset.
    pub fn jnz_rel32(&mut self) -> u32 {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x85);
        let at = self.buf.offset();
        self.buf.emit_u32(0);
        at
    }

    /// CALL [mem].
    pub fn call_mem(&mut self, target: Mem) {
        self.rex(
            false,
            false,
            target.index.is_some_and(|i| i.is_extended()),
            target.base.is_extended(),
        );
        self.buf.emit_u8(0xFF);
        self.mem_operands(2, target);
    }

    /// JMP r (tail jump through a register).
    pub fn jmp_reg(&mut self, target: Reg) {
        self.rex(false, false, false, target.is_extended());
        self.buf.emit_u8(0xFF);
        self.modrm(0b11, 4, target.code());
    }

    /// CALL r.
    pub fn call_reg(&mut self, target: Reg) {
        self.rex(false, false, false, target.is_extended());
        self.buf.emit_u8(0xFF);
        self.modrm(0b11, 2, target.code());
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    pub fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }

    // ==================== stack ====================

    pub fn push(&mut self, src: Reg) {
        self.rex(false, false, false, src.is_extended());
        self.buf.emit_u8(0x50 | src.code());
    }

    pub fn pop(&mut self, dst: Reg) {
        self.rex(false, false, false, dst.is_extended());
        self.buf.emit_u8(0x58 | dst.code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);
        f(&mut asm);
        buf.code().to_vec()
    }

    #[test]
    fn test_movimm_zero_is_xor() {
        assert_eq!(assemble(|a| a.movimm(0, Reg::Rax)), vec![0x31, 0xC0]);
        assert_eq!(assemble(|a| a.movimm(0, Reg::Rcx)), vec![0x31, 0xC9]);
    }

    #[test]
    fn test_movimm_widths() {
        // imm32 form is seven bytes
        assert_eq!(
            assemble(|a| a.movimm(42, Reg::Rax)),
            vec![0x48, 0xC7, 0xC0, 42, 0, 0, 0]
        );
        // imm64 form is ten bytes
        assert_eq!(
            assemble(|a| a.movimm(0x1_0000_0000, Reg::Rax)),
            vec![0x48, 0xB8, 0, 0, 0, 0, 1, 0, 0, 0]
        );
        assert_eq!(
            assemble(|a| a.movimm(-1, Reg::Rax)),
            vec![0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_mov_reg_reg() {
        // mov rax, rcx
        assert_eq!(
            assemble(|a| a.mov_rr(Reg::Rcx, Reg::Rax, OperandSize::Qword)),
            vec![0x48, 0x89, 0xC8]
        );
        // self-move is elided
        assert_eq!(
            assemble(|a| a.mov_rr(Reg::Rax, Reg::Rax, OperandSize::Qword)),
            Vec::<u8>::new()
        );
        // byte move touching SIL forces an empty REX
        assert_eq!(
            assemble(|a| a.mov_rr(Reg::Rax, Reg::Rsi, OperandSize::Byte)),
            vec![0x40, 0x88, 0xC6]
        );
        // word move carries the operand-size override
        assert_eq!(
            assemble(|a| a.mov_rr(Reg::Rcx, Reg::Rax, OperandSize::Word)),
            vec![0x66, 0x89, 0xC8]
        );
    }

    #[test]
    fn test_rbp_base_forces_disp8() {
        // mov rax, [rbp]
        assert_eq!(
            assemble(|a| a.mov_load(RegMem::Mem(Mem::base(Reg::Rbp)), Reg::Rax, OperandSize::Qword)),
            vec![0x48, 0x8B, 0x45, 0x00]
        );
        // r13 shares the encoding quirk
        assert_eq!(
            assemble(|a| a.mov_load(RegMem::Mem(Mem::base(Reg::R13)), Reg::Rax, OperandSize::Qword)),
            vec![0x49, 0x8B, 0x45, 0x00]
        );
    }

    #[test]
    fn test_rsp_base_forces_sib() {
        // mov rax, [rsp]
        assert_eq!(
            assemble(|a| a.mov_load(RegMem::Mem(Mem::base(Reg::Rsp)), Reg::Rax, OperandSize::Qword)),
            vec![0x48, 0x8B, 0x04, 0x24]
        );
        // mov rax, [rsp + 8]
        assert_eq!(
            assemble(|a| a.mov_load(
                RegMem::Mem(Mem::offset(Reg::Rsp, 8)),
                Reg::Rax,
                OperandSize::Qword
            )),
            vec![0x48, 0x8B, 0x44, 0x24, 0x08]
        );
    }

    #[test]
    fn test_displacement_widths() {
        // disp8
        assert_eq!(
            assemble(|a| a.mov_load(
                RegMem::Mem(Mem::offset(Reg::Rax, 16)),
                Reg::Rcx,
                OperandSize::Qword
            )),
            vec![0x48, 0x8B, 0x48, 0x10]
        );
        // disp32
        assert_eq!(
            assemble(|a| a.mov_load(
                RegMem::Mem(Mem::offset(Reg::Rax, 0x1000)),
                Reg::Rcx,
                OperandSize::Qword
            )),
            vec![0x48, 0x8B, 0x88, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn test_indexed_addressing() {
        // mov rax, [rcx + rdx*8]
        assert_eq!(
            assemble(|a| a.mov_load(
                RegMem::Mem(Mem::indexed(Reg::Rcx, Reg::Rdx, 8, 0)),
                Reg::Rax,
                OperandSize::Qword
            )),
            vec![0x48, 0x8B, 0x04, 0xD1]
        );
    }

    #[test]
    fn test_setcc() {
        assert_eq!(assemble(|a| a.set(Cc::Eq, Reg::Rax)), vec![0x0F, 0x94, 0xC0]);
        assert_eq!(assemble(|a| a.set(Cc::Gt, Reg::Rcx)), vec![0x0F, 0x9F, 0xC1]);
        // byte access to DIL forces an empty REX
        assert_eq!(
            assemble(|a| a.set(Cc::Eq, Reg::Rdi)),
            vec![0x40, 0x0F, 0x94, 0xC7]
        );
        assert_eq!(
            assemble(|a| a.set(Cc::Ne, Reg::R8)),
            vec![0x41, 0x0F, 0x95, 0xC0]
        );
    }

    #[test]
    fn test_division_protocol() {
        assert_eq!(assemble(|a| a.cqo()), vec![0x48, 0x99]);
        // idiv rcx
        assert_eq!(
            assemble(|a| a.idiv(RegMem::Reg(Reg::Rcx), OperandSize::Qword).unwrap()),
            vec![0x48, 0xF7, 0xF9]
        );
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(assemble(|a| a.push(Reg::Rbx)), vec![0x53]);
        assert_eq!(assemble(|a| a.push(Reg::R12)), vec![0x41, 0x54]);
        assert_eq!(assemble(|a| a.pop(Reg::R12)), vec![0x41, 0x5C]);
    }

    #[test]
    fn test_calls() {
        // call [rbp - 24]
        assert_eq!(
            assemble(|a| a.call_mem(Mem::offset(Reg::Rbp, -24))),
            vec![0xFF, 0x55, 0xE8]
        );
        // call [rbp + rax*8]
        assert_eq!(
            assemble(|a| a.call_mem(Mem::indexed(Reg::Rbp, Reg::Rax, 8, 0))),
            vec![0xFF, 0x54, 0xC5, 0x00]
        );
        // call r11
        assert_eq!(assemble(|a| a.call_reg(Reg::R11)), vec![0x41, 0xFF, 0xD3]);
    }

    #[test]
    fn test_jump_placeholders() {
        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);
        let at = asm.jmp_rel32();
        assert_eq!(at, 1);
        let at = asm.jnz_rel32();
        assert_eq!(at, 7);
        assert_eq!(
            buf.code(),
            &[0xE9, 0, 0, 0, 0, 0x0F, 0x85, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_sse_prefixes() {
        // addsd xmm1, xmm2
        assert_eq!(
            assemble(|a| a.addf(Xmm::Xmm2, Xmm::Xmm1, OperandSize::Qword).unwrap()),
            vec![0xF2, 0x0F, 0x58, 0xCA]
        );
        // addss xmm1, xmm2
        assert_eq!(
            assemble(|a| a.addf(Xmm::Xmm2, Xmm::Xmm1, OperandSize::Dword).unwrap()),
            vec![0xF3, 0x0F, 0x58, 0xCA]
        );
        // divsd xmm0, xmm1
        assert_eq!(
            assemble(|a| a
                .divf(Xmm::Xmm0, RegMem::Xmm(Xmm::Xmm1), OperandSize::Qword)
                .unwrap()),
            vec![0xF2, 0x0F, 0x5E, 0xC1]
        );
        // movq xmm0, rax
        assert_eq!(
            assemble(|a| a.movd(Reg::Rax, Xmm::Xmm0, OperandSize::Qword)),
            vec![0x66, 0x48, 0x0F, 0x6E, 0xC0]
        );
    }

    #[test]
    fn test_divf_memory_rejected() {
        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);
        assert!(asm
            .divf(
                Xmm::Xmm0,
                RegMem::Mem(Mem::base(Reg::Rax)),
                OperandSize::Qword
            )
            .is_err());
    }

    #[test]
    fn test_sign_extension_loads() {
        // movsx rax, byte [rcx]
        assert_eq!(
            assemble(|a| a
                .movsx(RegMem::Mem(Mem::base(Reg::Rcx)), Reg::Rax, OperandSize::Byte)
                .unwrap()),
            vec![0x48, 0x0F, 0xBE, 0x01]
        );
        // movsxd rax, dword [rcx]
        assert_eq!(
            assemble(|a| a.movsxd(RegMem::Mem(Mem::base(Reg::Rcx)), Reg::Rax)),
            vec![0x48, 0x63, 0x01]
        );
        // movsx rejects dword and qword
        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);
        assert!(asm
            .movsx(RegMem::Reg(Reg::Rcx), Reg::Rax, OperandSize::Dword)
            .is_err());
    }

    #[test]
    fn test_frame_adjustment() {
        // sub rsp, 24
        assert_eq!(
            assemble(|a| a.sub_imm(Reg::Rsp, 24)),
            vec![0x48, 0x81, 0xEC, 24, 0, 0, 0]
        );
        // add rsp, 24
        assert_eq!(
            assemble(|a| a.add_imm(Reg::Rsp, 24)),
            vec![0x48, 0x81, 0xC4, 24, 0, 0, 0]
        );
    }

    #[test]
    fn test_test_and_not() {
        // test al, 1
        assert_eq!(assemble(|a| a.test(Reg::Rax)), vec![0xF6, 0xC0, 0x01]);
        // not rax
        assert_eq!(assemble(|a| a.not(Reg::Rax)), vec![0x48, 0xF7, 0xD0]);
    }
}
