//! Low-level IR.
//!
//! Linear three-address instructions over virtual registers, produced by
//! the lowering pass and consumed by lifetime analysis, allocation, and
//! emission. Every instruction carries a monotonically increasing id;
//! all later stages key off these ids.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::operands::OperandSize;

/// A virtual register.
pub type Vr = u16;

/// Comparison condition attached to a SET instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCc {
    Lt,
    Lte,
    Eq,
    Neq,
    Gte,
    Gt,
}

/// Source of a MOV-family instruction.
#[derive(Debug, Clone, Copy)]
pub enum MovArg {
    Imm(i64),
    Vr(Vr),
}

/// One incoming phi edge at the LIR level.
#[derive(Debug, Clone, Copy)]
pub struct PhiEdge {
    pub vreg: Vr,
    pub block: u16,
}

/// LIR operations. MOV/FMOV/MOV_I2F share the mov payload; DIV is the
/// three-source division (RAX, RDX, divisor) on the integer side and a
/// plain two-operand divide on the float side.
#[derive(Debug, Clone)]
pub enum LirOp {
    Mov { dst: Vr, src: MovArg, size: OperandSize },
    FMov { dst: Vr, src: MovArg, size: OperandSize },
    MovI2F { dst: Vr, src: Vr, size: OperandSize },
    MovMem {
        value: Vr,
        base: Vr,
        index: Option<(Vr, u8)>,
        offset: i32,
        size: OperandSize,
        to_mem: bool,
    },
    Phi { dst: Vr, edges: Vec<PhiEdge> },
    Cmp { l: Vr, r: Vr },
    Set { dst: Vr, cc: SetCc },
    Not { dst: Vr },
    Neg { dst: Vr },
    Test { src: Vr },
    Jmp { target: u16 },
    Jnz { target: u16 },
    Add { dst: Vr, src: Vr },
    Sub { dst: Vr, src: Vr },
    Mul { dst: Vr, src: Vr },
    FAdd { dst: Vr, src: Vr },
    Cqo { dst: Vr, src: Vr },
    Div { dst: Vr, src_a: Vr, src_b: Vr },
    Ret,
    Call {
        function: i32,
        dst: Option<Vr>,
        args: Vec<Vr>,
        clears: Vec<Vr>,
    },
    CallIdxInReg {
        index: Vr,
        dst: Option<Vr>,
        args: Vec<Vr>,
        clears: Vec<Vr>,
    },
    Alloc { dst: Vr, bytes: u16 },
    Nop,
}

/// An LIR instruction: operation plus id.
#[derive(Debug, Clone)]
pub struct Lir {
    pub id: u16,
    pub op: LirOp,
}

impl Lir {
    /// Virtual registers defined here. At most one, except for the void
    /// cases which define none.
    pub fn dst(&self) -> Vec<Vr> {
        match &self.op {
            LirOp::Mov { dst, .. }
            | LirOp::FMov { dst, .. }
            | LirOp::MovI2F { dst, .. }
            | LirOp::Phi { dst, .. }
            | LirOp::Set { dst, .. }
            | LirOp::Not { dst }
            | LirOp::Neg { dst }
            | LirOp::Add { dst, .. }
            | LirOp::Sub { dst, .. }
            | LirOp::Mul { dst, .. }
            | LirOp::FAdd { dst, .. }
            | LirOp::Cqo { dst, .. }
            | LirOp::Div { dst, .. }
            | LirOp::Alloc { dst, .. } => vec![*dst],
            LirOp::MovMem { value, to_mem, .. } => {
                if *to_mem {
                    vec![]
                } else {
                    vec![*value]
                }
            }
            LirOp::Call { dst, .. } | LirOp::CallIdxInReg { dst, .. } => {
                dst.map(|d| vec![d]).unwrap_or_default()
            }
            _ => vec![],
        }
    }

    /// Virtual registers read here, in a stable order. For MOV_MEM the
    /// order is index, base, then the stored value.
    pub fn inputs(&self) -> Vec<Vr> {
        match &self.op {
            LirOp::Mov { src, .. } | LirOp::FMov { src, .. } => match src {
                MovArg::Imm(_) => vec![],
                MovArg::Vr(v) => vec![*v],
            },
            LirOp::MovI2F { src, .. } => vec![*src],
            LirOp::MovMem {
                value,
                base,
                index,
                to_mem,
                ..
            } => {
                let mut inputs = Vec::new();
                if let Some((index, _)) = index {
                    inputs.push(*index);
                }
                inputs.push(*base);
                if *to_mem {
                    inputs.push(*value);
                }
                inputs
            }
            LirOp::Phi { edges, .. } => edges.iter().map(|e| e.vreg).collect(),
            LirOp::Cmp { l, r } => vec![*l, *r],
            LirOp::Test { src } => vec![*src],
            // NEG and NOT modify their operand in place
            LirOp::Not { dst } | LirOp::Neg { dst } => vec![*dst],
            LirOp::Cqo { src, .. } => vec![*src],
            LirOp::Div { src_a, src_b, .. } => vec![*src_a, *src_b],
            LirOp::Add { dst, src }
            | LirOp::Sub { dst, src }
            | LirOp::Mul { dst, src }
            | LirOp::FAdd { dst, src } => vec![*src, *dst],
            LirOp::Call { args, .. } => args.clone(),
            LirOp::CallIdxInReg { args, index, .. } => {
                let mut inputs = args.clone();
                inputs.push(*index);
                inputs
            }
            _ => vec![],
        }
    }

    /// Virtual registers whose contents are destroyed here; only calls
    /// clobber (the caller-saved registers).
    pub fn clears(&self) -> &[Vr] {
        match &self.op {
            LirOp::Call { clears, .. } | LirOp::CallIdxInReg { clears, .. } => clears,
            _ => &[],
        }
    }

    pub fn phi_input_of(&self, block: u16) -> Option<Vr> {
        match &self.op {
            LirOp::Phi { edges, .. } => {
                edges.iter().find(|e| e.block == block).map(|e| e.vreg)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Lir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:3}) ", self.id)?;
        match &self.op {
            LirOp::Mov { dst, src, .. } | LirOp::FMov { dst, src, .. } => match src {
                MovArg::Imm(imm) => write!(f, "mov i{}, ${}", dst, imm),
                MovArg::Vr(src) => write!(f, "mov i{}, i{}", dst, src),
            },
            LirOp::MovI2F { dst, src, .. } => write!(f, "mov2f i{}, i{}", dst, src),
            LirOp::MovMem {
                value,
                base,
                index,
                offset,
                to_mem,
                ..
            } => {
                let ptr = match index {
                    Some((index, scale)) => {
                        format!("PTR[i{} + (i{} * ${}) + ${}]", base, index, scale, offset)
                    }
                    None => format!("PTR[i{} + ${}]", base, offset),
                };
                if *to_mem {
                    write!(f, "mov {}, i{}", ptr, value)
                } else {
                    write!(f, "mov i{}, {}", value, ptr)
                }
            }
            LirOp::Phi { dst, edges } => {
                write!(f, "phi i{} = (", dst)?;
                for edge in edges {
                    write!(f, "i{} from {}, ", edge.vreg, edge.block)?;
                }
                write!(f, ")")
            }
            LirOp::Cmp { l, r } => write!(f, "cmp i{}, i{}", l, r),
            LirOp::Set { dst, cc } => write!(f, "set{:?} i{}", cc, dst),
            LirOp::Not { dst } => write!(f, "not i{}", dst),
            LirOp::Neg { dst } => write!(f, "neg i{}", dst),
            LirOp::Test { src } => write!(f, "test i{}", src),
            LirOp::Jmp { target } => write!(f, "jmp block {}", target),
            LirOp::Jnz { target } => write!(f, "jnz block {}", target),
            LirOp::Add { dst, src } => write!(f, "add i{}, i{}", dst, src),
            LirOp::Sub { dst, src } => write!(f, "sub i{}, i{}", dst, src),
            LirOp::Mul { dst, src } => write!(f, "mul i{}, i{}", dst, src),
            LirOp::FAdd { dst, src } => write!(f, "fadd i{}, i{}", dst, src),
            LirOp::Cqo { dst, src } => write!(f, "cqo i{}, i{}", dst, src),
            LirOp::Div { dst, src_a, src_b } => {
                write!(f, "div i{}, i{}, i{}", dst, src_a, src_b)
            }
            LirOp::Ret => write!(f, "ret"),
            LirOp::Call { function, dst, args, .. } => {
                write!(f, "call {} ", function)?;
                if let Some(dst) = dst {
                    write!(f, "i{} = ", dst)?;
                }
                write!(f, "(")?;
                for arg in args {
                    write!(f, "i{} ", arg)?;
                }
                write!(f, ")")
            }
            LirOp::CallIdxInReg { index, dst, args, .. } => {
                write!(f, "call (reg i{}) ", index)?;
                if let Some(dst) = dst {
                    write!(f, "i{} = ", dst)?;
                }
                write!(f, "(")?;
                for arg in args {
                    write!(f, "i{} ", arg)?;
                }
                write!(f, ")")
            }
            LirOp::Alloc { dst, bytes } => write!(f, "alloc i{}, size:{}", dst, bytes),
            LirOp::Nop => write!(f, "nop"),
        }
    }
}

/// How a virtual register is used at one instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub must_have_reg: bool,
}

/// Per-register use positions; `-1` marks "live on entry" parameter
/// uses.
pub type UsageMap = HashMap<Vr, BTreeMap<i32, Usage>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn lir(op: LirOp) -> Lir {
        Lir { id: 0, op }
    }

    #[test]
    fn test_mov_mem_input_order() {
        let store = lir(LirOp::MovMem {
            value: 5,
            base: 3,
            index: Some((4, 8)),
            offset: 0,
            size: OperandSize::Qword,
            to_mem: true,
        });
        assert_eq!(store.inputs(), vec![4, 3, 5]);
        assert!(store.dst().is_empty());

        let load = lir(LirOp::MovMem {
            value: 5,
            base: 3,
            index: None,
            offset: 8,
            size: OperandSize::Qword,
            to_mem: false,
        });
        assert_eq!(load.inputs(), vec![3]);
        assert_eq!(load.dst(), vec![5]);
    }

    #[test]
    fn test_void_call_defines_nothing() {
        let call = lir(LirOp::Call {
            function: 2,
            dst: None,
            args: vec![1, 2],
            clears: vec![7, 8],
        });
        assert!(call.dst().is_empty());
        assert_eq!(call.inputs(), vec![1, 2]);
        assert_eq!(call.clears(), &[7, 8]);
    }

    #[test]
    fn test_in_place_unary_reads_its_destination() {
        let neg = lir(LirOp::Neg { dst: 3 });
        assert_eq!(neg.inputs(), vec![3]);
        assert_eq!(neg.dst(), vec![3]);
    }

    #[test]
    fn test_div_sources() {
        let div = lir(LirOp::Div {
            dst: 1,
            src_a: 2,
            src_b: 3,
        });
        assert_eq!(div.inputs(), vec![2, 3]);
        assert_eq!(div.dst(), vec![1]);
    }
}
