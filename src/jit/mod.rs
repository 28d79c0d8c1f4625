//! The JIT backend: lowering, lifetime analysis, linear-scan register
//! allocation, machine emission, and the engine that owns the function
//! table and executable memory.

pub mod codebuf;
pub mod emit;
pub mod engine;
pub mod heap;
pub mod lifetime;
pub mod lir;
pub mod lower;
pub mod memory;
pub mod operands;
pub mod regalloc;
pub mod runtime;
pub mod stack;
pub mod x86_64;

pub use engine::JitEngine;

use crate::vm::TypeNotPacked;

/// System-V AMD64 register conventions.
pub mod abi {
    use super::operands::{Reg, Xmm};

    /// Integer registers the allocator may hand out (no RSP/RBP).
    pub const INT_REGISTERS: [Reg; 14] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    /// XMM registers the allocator may hand out.
    pub const FLOAT_REGISTERS: [Xmm; 6] = [
        Xmm::Xmm0,
        Xmm::Xmm1,
        Xmm::Xmm2,
        Xmm::Xmm3,
        Xmm::Xmm4,
        Xmm::Xmm5,
    ];

    pub const INT_PARAMETERS: [Reg; 6] = [
        Reg::Rdi,
        Reg::Rsi,
        Reg::Rdx,
        Reg::Rcx,
        Reg::R8,
        Reg::R9,
    ];

    pub const FLOAT_PARAMETERS: [Xmm; 8] = [
        Xmm::Xmm0,
        Xmm::Xmm1,
        Xmm::Xmm2,
        Xmm::Xmm3,
        Xmm::Xmm4,
        Xmm::Xmm5,
        Xmm::Xmm6,
        Xmm::Xmm7,
    ];

    pub const CALLER_SAVED: [Reg; 9] = [
        Reg::Rax,
        Reg::Rdi,
        Reg::Rsi,
        Reg::Rdx,
        Reg::Rcx,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
    ];

    pub const CALLEE_SAVED: [Reg; 5] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

    /// All XMM registers are caller-saved in System-V.
    pub const CALLER_SAVED_FLOAT: [Xmm; 15] = [
        Xmm::Xmm0,
        Xmm::Xmm1,
        Xmm::Xmm2,
        Xmm::Xmm3,
        Xmm::Xmm4,
        Xmm::Xmm5,
        Xmm::Xmm6,
        Xmm::Xmm7,
        Xmm::Xmm8,
        Xmm::Xmm9,
        Xmm::Xmm10,
        Xmm::Xmm11,
        Xmm::Xmm12,
        Xmm::Xmm13,
        Xmm::Xmm14,
    ];
}

/// A failed compilation. Everything is fatal; the driver reports and
/// exits.
#[derive(Debug)]
pub enum CompileError {
    /// An operand combination the emitter cannot express.
    Encode(x86_64::EncodeError),
    Heap(heap::HeapError),
    Memory(memory::MemoryError),
    NotImplemented(&'static str),
    /// A phi edge referenced a temporary that was never defined.
    UnresolvedTemporary(u16),
    InvalidFunctionIndex(u16),
    UnknownStructType(u8),
    TypeNotPacked(TypeNotPacked),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Encode(e) => write!(f, "{}", e),
            CompileError::Heap(e) => write!(f, "{}", e),
            CompileError::Memory(e) => write!(f, "{}", e),
            CompileError::NotImplemented(what) => write!(f, "not implemented: {}", what),
            CompileError::UnresolvedTemporary(t) => {
                write!(f, "phi references temporary {} which is never defined", t)
            }
            CompileError::InvalidFunctionIndex(i) => write!(f, "invalid function index {}", i),
            CompileError::UnknownStructType(id) => write!(f, "unknown struct type {}", id),
            CompileError::TypeNotPacked(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<x86_64::EncodeError> for CompileError {
    fn from(e: x86_64::EncodeError) -> Self {
        CompileError::Encode(e)
    }
}

impl From<heap::HeapError> for CompileError {
    fn from(e: heap::HeapError) -> Self {
        CompileError::Heap(e)
    }
}

impl From<memory::MemoryError> for CompileError {
    fn from(e: memory::MemoryError) -> Self {
        CompileError::Memory(e)
    }
}

impl From<TypeNotPacked> for CompileError {
    fn from(e: TypeNotPacked) -> Self {
        CompileError::TypeNotPacked(e)
    }
}
