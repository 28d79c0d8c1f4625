//! Register and operand model for the AMD64 backend.
//!
//! Registers are declared in hardware encoding order. A `RegMem` is the
//! three-way operand the machine emitter works with: general-purpose
//! register, XMM register, or memory.

use std::fmt;

/// Operand sizes in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum OperandSize {
    Byte = 1,
    Word = 2,
    Dword = 4,
    Qword = 8,
}

impl OperandSize {
    pub fn bytes(self) -> u16 {
        self as u16
    }
}

/// AMD64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Lower three bits for ModR/M and SIB fields.
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Registers R8..R15 need a REX extension bit.
    pub fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// AMD64 XMM registers. XMM15 is left out of the model, matching the
/// register file the allocator hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
}

impl Xmm {
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A memory operand: `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mem {
    pub base: Reg,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: i32,
}

impl Mem {
    pub fn base(base: Reg) -> Self {
        Mem::offset(base, 0)
    }

    pub fn offset(base: Reg, disp: i32) -> Self {
        Mem {
            base,
            index: None,
            scale: 1,
            disp,
        }
    }

    /// RSP cannot be encoded as an index register.
    pub fn indexed(base: Reg, index: Reg, scale: u8, disp: i32) -> Self {
        assert!(index != Reg::Rsp, "RSP is not encodable as an index register");
        assert!(matches!(scale, 1 | 2 | 4 | 8), "invalid scale {}", scale);
        Mem {
            base,
            index: Some(index),
            scale,
            disp,
        }
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(
                f,
                "[{} + {} * {} + {}]",
                self.base, index, self.scale, self.disp
            ),
            None => write!(f, "[{} + {}]", self.base, self.disp),
        }
    }
}

/// Three-way operand: general-purpose register, XMM register, or memory.
///
/// The derived ordering (registers before XMM before memory) is what the
/// emitter's move sorting relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegMem {
    Reg(Reg),
    Xmm(Xmm),
    Mem(Mem),
}

impl RegMem {
    pub fn is_reg(&self) -> bool {
        matches!(self, RegMem::Reg(_))
    }

    pub fn is_xmm(&self) -> bool {
        matches!(self, RegMem::Xmm(_))
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, RegMem::Mem(_))
    }

    pub fn reg(&self) -> Reg {
        match self {
            RegMem::Reg(r) => *r,
            other => panic!("expected register operand, found {}", other),
        }
    }

    pub fn xmm(&self) -> Xmm {
        match self {
            RegMem::Xmm(x) => *x,
            other => panic!("expected xmm operand, found {}", other),
        }
    }

    pub fn mem(&self) -> Mem {
        match self {
            RegMem::Mem(m) => *m,
            other => panic!("expected memory operand, found {}", other),
        }
    }
}

impl From<Reg> for RegMem {
    fn from(r: Reg) -> Self {
        RegMem::Reg(r)
    }
}

impl From<Xmm> for RegMem {
    fn from(x: Xmm) -> Self {
        RegMem::Xmm(x)
    }
}

impl From<Mem> for RegMem {
    fn from(m: Mem) -> Self {
        RegMem::Mem(m)
    }
}

impl fmt::Display for RegMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegMem::Reg(r) => write!(f, "{}", r),
            RegMem::Xmm(x) => write!(f, "{}", x),
            RegMem::Mem(m) => write!(f, "{}", m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_encoding() {
        assert_eq!(Reg::Rax.code(), 0);
        assert_eq!(Reg::R8.code(), 0);
        assert_eq!(Reg::R15.code(), 7);
        assert!(!Reg::Rdi.is_extended());
        assert!(Reg::R8.is_extended());
    }

    #[test]
    fn test_regmem_ordering() {
        let reg = RegMem::Reg(Reg::Rcx);
        let xmm = RegMem::Xmm(Xmm::Xmm0);
        let mem = RegMem::Mem(Mem::offset(Reg::Rsp, 8));
        assert!(reg < xmm);
        assert!(xmm < mem);
        assert!(RegMem::Reg(Reg::Rax) < reg);
    }

    #[test]
    #[should_panic]
    fn test_rsp_index_rejected() {
        Mem::indexed(Reg::Rax, Reg::Rsp, 8, 0);
    }
}
