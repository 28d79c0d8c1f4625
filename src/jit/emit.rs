//! Machine emission: LIR plus allocation to AMD64 bytes.
//!
//! Three preparatory artifacts are computed first: edge-move sets for
//! every CFG edge whose live values change location, spill moves at the
//! boundaries of split intervals, and a dependency-respecting order for
//! each move set (with a push/pop fallback for cycles). Emission then
//! walks the blocks in order, flushing spill moves by instruction id and
//! back-patching forward jumps at the end.
//!
//! Sub-qword integer values are kept sign-extended to the full register:
//! loads use movsx/movsxd and arithmetic runs at quadword width, so
//! comparisons and division see canonical 64-bit values.

use std::collections::{BTreeMap, HashMap};

use crate::vm::{BaseType, Type};

use super::codebuf::CodeBuffer;
use super::lifetime::{Interval, LirBlock};
use super::lir::{Lir, LirOp, MovArg, SetCc, Vr};
use super::operands::{Mem, OperandSize, Reg, RegMem};
use super::stack::{StackAllocator, StackSlot};
use super::x86_64::{Assembler, Cc};
use super::CompileError;

/// One location-to-location move. Locations are quadword containers,
/// so moves always transfer the full width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MoveOp {
    src: RegMem,
    dst: RegMem,
}

pub struct MachineEmitter<'a> {
    blocks: &'a [LirBlock],
    intervals: &'a [Interval],
    stack: &'a StackAllocator,
    vr_types: &'a HashMap<Vr, Type>,
    stack_frame_spills: &'a [(Reg, StackSlot)],
}

impl<'a> MachineEmitter<'a> {
    pub fn new(
        blocks: &'a [LirBlock],
        intervals: &'a [Interval],
        stack: &'a StackAllocator,
        vr_types: &'a HashMap<Vr, Type>,
        stack_frame_spills: &'a [(Reg, StackSlot)],
    ) -> Self {
        MachineEmitter {
            blocks,
            intervals,
            stack,
            vr_types,
            stack_frame_spills,
        }
    }

    fn vr_ty(&self, vr: Vr) -> Type {
        self.vr_types
            .get(&vr)
            .copied()
            .unwrap_or(Type::new(BaseType::Int64))
    }

    /// The interval holding `vr` at instruction `id`. The allocator may
    /// have assigned different storage to the same vr at different ids.
    fn interval_for(&self, id: i32, vr: Vr) -> &Interval {
        self.intervals
            .iter()
            .find(|i| {
                i.vr == vr && !i.spans.is_empty() && i.start() <= id && i.end() >= id
            })
            .unwrap_or_else(|| panic!("no interval for i{} at {}", vr, id))
    }

    fn location(&self, interval: &Interval) -> RegMem {
        if let Some(reg) = interval.reg {
            RegMem::Reg(reg)
        } else if let Some(xmm) = interval.xmm {
            RegMem::Xmm(xmm)
        } else if let Some(slot) = interval.stack {
            RegMem::Mem(self.stack.addressing(slot))
        } else {
            panic!("interval i{} has no storage", interval.vr)
        }
    }

    fn operand_for(&self, id: i32, vr: Vr) -> RegMem {
        self.location(self.interval_for(id, vr))
    }

    pub fn run(self) -> Result<Vec<u8>, CompileError> {
        let (mut edge_moves, conditional_at_target) = self.collect_edge_moves()?;
        let spill_moves = self.collect_spill_moves();

        let mut buf = CodeBuffer::new();
        let mut block_addresses: BTreeMap<u16, u32> = BTreeMap::new();
        // jump placeholders: (target block, displacement offset)
        let mut patches: Vec<(u16, u32)> = Vec::new();

        // prologue: frame and callee-saved saves
        {
            let mut asm = Assembler::new(&mut buf);
            asm.sub_imm(Reg::Rsp, self.stack.frame_size() as i32);
            for &(reg, slot) in self.stack_frame_spills {
                asm.mov_store(
                    reg,
                    RegMem::Mem(self.stack.addressing(slot)),
                    OperandSize::Qword,
                );
            }
        }

        // a function without any blocks still returns cleanly
        if self.blocks.is_empty() {
            let mut asm = Assembler::new(&mut buf);
            asm.add_imm(Reg::Rsp, self.stack.frame_size() as i32);
            asm.ret();
            return Ok(buf.build());
        }

        let mut prev_block: Option<u16> = None;
        for block in self.blocks {
            // moves for the fall-through edge run before the block label
            // so that jumps into the block skip them
            if let Some(prev) = prev_block {
                if let Some(moves) = edge_moves.remove(&(prev, block.index)) {
                    log::trace!(
                        target: "machine",
                        "inserting {} moves for fall-through {} -> {}",
                        moves.len(), prev, block.index
                    );
                    self.emit_moves(&mut buf, &moves)?;
                }
            }

            block_addresses.insert(block.index, buf.offset());

            if let Some(&pred) = conditional_at_target.get(&block.index) {
                if let Some(moves) = edge_moves.remove(&(pred, block.index)) {
                    log::trace!(
                        target: "machine",
                        "inserting {} moves for conditional edge {} -> {}",
                        moves.len(), pred, block.index
                    );
                    self.emit_moves(&mut buf, &moves)?;
                }
            }

            for lir in &block.lirs {
                if let Some(moves) = spill_moves.get(&(lir.id as i32)) {
                    log::trace!(
                        target: "machine",
                        "flushing {} spill moves before instruction {}",
                        moves.len(), lir.id
                    );
                    self.emit_moves(&mut buf, moves)?;
                }

                self.emit_instruction(
                    &mut buf,
                    block,
                    lir,
                    &mut edge_moves,
                    &mut patches,
                )?;
            }

            prev_block = Some(block.index);
        }

        if !edge_moves.is_empty() {
            return Err(CompileError::NotImplemented(
                "edge moves on an unstructured control-flow edge",
            ));
        }

        // resolve forward jumps now that every block address is known
        for (target, at) in patches {
            let address = block_addresses[&target];
            let rip_after = at + 4;
            buf.patch_u32(at, address.wrapping_sub(rip_after));
        }

        Ok(buf.build())
    }

    // ==================== move preparation ====================

    /// For every CFG edge, the moves reconciling each live value's
    /// location at the predecessor's end with its location at the
    /// successor's head.
    #[allow(clippy::type_complexity)]
    fn collect_edge_moves(
        &self,
    ) -> Result<(BTreeMap<(u16, u16), Vec<MoveOp>>, BTreeMap<u16, u16>), CompileError> {
        let mut edge_moves: BTreeMap<(u16, u16), Vec<MoveOp>> = BTreeMap::new();
        let mut conditional_at_target: BTreeMap<u16, u16> = BTreeMap::new();

        for pred in self.blocks {
            for &si in &pred.successors {
                let succ = &self.blocks[si as usize];
                let head = succ.from_lir();

                for interval in self.intervals {
                    if interval.fixed || interval.spans.is_empty() || !interval.covers(head) {
                        continue;
                    }

                    let from = if interval.start() == head {
                        // an interval born at the head must be a phi
                        // definition; its source is the edge's phi input
                        match &interval.phi {
                            Some(phi) => {
                                let operand = phi
                                    .phi_input_of(pred.index)
                                    .expect("phi has no input for predecessor");
                                self.location(self.interval_for(pred.to_lir(), operand))
                            }
                            None => continue,
                        }
                    } else {
                        self.location(self.interval_for(pred.to_lir(), interval.vr))
                    };

                    let to = self.location(self.interval_for(head, interval.vr));
                    if from == to {
                        continue;
                    }

                    let taken_edge = matches!(
                        pred.lirs.last().map(|l| &l.op),
                        Some(LirOp::Jnz { target }) if *target == succ.index
                    );
                    if taken_edge {
                        if succ.predecessors.len() == 1 {
                            conditional_at_target.insert(succ.index, pred.index);
                        } else {
                            return Err(CompileError::NotImplemented(
                                "edge moves on a critical conditional edge",
                            ));
                        }
                    }

                    log::trace!(
                        target: "machine",
                        "(block {} -> block {}) moving i{} from {} to {}",
                        pred.index, succ.index, interval.vr, from, to
                    );
                    edge_moves
                        .entry((pred.index, succ.index))
                        .or_default()
                        .push(MoveOp { src: from, dst: to });
                }
            }
        }

        Ok((edge_moves, conditional_at_target))
    }

    /// Moves between the two halves of every split interval, keyed by
    /// the follower's first instruction id.
    fn collect_spill_moves(&self) -> BTreeMap<i32, Vec<MoveOp>> {
        let mut spill_moves: BTreeMap<i32, Vec<MoveOp>> = BTreeMap::new();

        for interval in self.intervals {
            if !interval.has_follower || interval.spans.is_empty() {
                continue;
            }

            let starts_at = interval.end() + 1;
            let follower = self
                .intervals
                .iter()
                .find(|f| f.vr == interval.vr && !f.spans.is_empty() && f.start() == starts_at)
                .unwrap_or_else(|| {
                    panic!("split interval i{} has no follower", interval.vr)
                });

            let src = self.location(interval);
            let dst = self.location(follower);
            if src == dst {
                continue;
            }

            log::trace!(
                target: "machine",
                "spill move for i{} at {}: {} -> {}",
                interval.vr, starts_at, src, dst
            );
            spill_moves.entry(starts_at).or_default().push(MoveOp { src, dst });
        }

        spill_moves
    }

    /// Order moves so no destination is overwritten before it has been
    /// read. Returns `None` when a cycle remains.
    fn order_moves(moves: &[MoveOp]) -> Option<Vec<MoveOp>> {
        let mut pending: BTreeMap<RegMem, MoveOp> = BTreeMap::new();
        let mut reads: BTreeMap<RegMem, usize> = BTreeMap::new();
        for m in moves {
            pending.insert(m.dst, *m);
            *reads.entry(m.src).or_insert(0) += 1;
        }

        let mut ready: Vec<RegMem> = pending
            .keys()
            .filter(|dst| reads.get(dst).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut ordered = Vec::with_capacity(moves.len());
        while let Some(dst) = ready.pop() {
            let m = pending.remove(&dst).expect("ready move disappeared");
            ordered.push(m);

            let count = reads.get_mut(&m.src).expect("source has no read count");
            *count -= 1;
            if *count == 0 && pending.contains_key(&m.src) {
                ready.push(m.src);
            }
        }

        if pending.is_empty() {
            Some(ordered)
        } else {
            None
        }
    }

    fn emit_moves(&self, buf: &mut CodeBuffer, moves: &[MoveOp]) -> Result<(), CompileError> {
        let mut asm = Assembler::new(buf);

        match Self::order_moves(moves) {
            Some(ordered) => {
                for m in ordered {
                    // registers and stack slots are quadword containers;
                    // moving the full width preserves the sign-extended
                    // canonical form
                    asm.mov(m.src, m.dst, OperandSize::Qword)?;
                }
            }
            None => {
                // a cycle: push every source, pop into the destinations
                // in reverse
                for m in moves {
                    if !m.src.is_reg() || !m.dst.is_reg() {
                        return Err(CompileError::NotImplemented(
                            "cyclic edge moves with memory operands",
                        ));
                    }
                    asm.push(m.src.reg());
                }
                for m in moves.iter().rev() {
                    asm.pop(m.dst.reg());
                }
            }
        }

        Ok(())
    }

    // ==================== instruction emission ====================

    fn emit_instruction(
        &self,
        buf: &mut CodeBuffer,
        block: &LirBlock,
        lir: &Lir,
        edge_moves: &mut BTreeMap<(u16, u16), Vec<MoveOp>>,
        patches: &mut Vec<(u16, u32)>,
    ) -> Result<(), CompileError> {
        let id = lir.id as i32;

        // an unconditional jump's edge moves run right before it
        if let LirOp::Jmp { target } = &lir.op {
            if let Some(moves) = edge_moves.remove(&(block.index, *target)) {
                self.emit_moves(buf, &moves)?;
            }
            let mut asm = Assembler::new(buf);
            let at = asm.jmp_rel32();
            patches.push((*target, at));
            return Ok(());
        }

        let mut asm = Assembler::new(buf);

        match &lir.op {
            LirOp::Nop | LirOp::Phi { .. } => {}

            LirOp::Mov { dst, src, size } | LirOp::FMov { dst, src, size } => {
                let dst_loc = self.operand_for(id, *dst);
                match src {
                    MovArg::Imm(imm) => match dst_loc {
                        RegMem::Reg(reg) => {
                            // keep sub-qword constants sign-extended to
                            // the full register
                            let imm = truncate_to(*imm, *size);
                            asm.movimm(imm, reg);
                        }
                        RegMem::Mem(mem) => {
                            // spill slots are read back at full width
                            asm.movimm_store(
                                truncate_to(*imm, *size),
                                mem,
                                OperandSize::Qword,
                            )?;
                        }
                        RegMem::Xmm(_) => {
                            return Err(CompileError::NotImplemented(
                                "immediate move into an xmm register",
                            ))
                        }
                    },
                    MovArg::Vr(src) => {
                        let src_loc = self.operand_for(id, *src);
                        self.emit_sized_mov(&mut asm, src_loc, dst_loc, *size)?;
                    }
                }
            }

            LirOp::MovI2F { dst, src, size } => {
                let src = self.operand_for(id, *src).reg();
                let dst = self.operand_for(id, *dst).xmm();
                asm.movd(src, dst, *size);
            }

            LirOp::MovMem {
                value,
                base,
                index,
                offset,
                size,
                to_mem,
            } => {
                // base and index are guaranteed registers
                let base = self.operand_for(id, *base).reg();
                let mem = match index {
                    Some((index, scale)) => {
                        let index = self.operand_for(id, *index).reg();
                        Mem::indexed(base, index, *scale, *offset)
                    }
                    None => Mem::offset(base, *offset),
                };

                let value_loc = self.operand_for(id, *value);
                match value_loc {
                    RegMem::Reg(reg) => {
                        if *to_mem {
                            asm.mov_store(reg, RegMem::Mem(mem), *size);
                        } else {
                            // integer loads sign-extend to the full
                            // register regardless of declared signedness
                            match size {
                                OperandSize::Byte | OperandSize::Word => {
                                    asm.movsx(RegMem::Mem(mem), reg, *size)?;
                                }
                                OperandSize::Dword => asm.movsxd(RegMem::Mem(mem), reg),
                                OperandSize::Qword => asm.mov_load(RegMem::Mem(mem), reg, *size),
                            }
                        }
                    }
                    RegMem::Xmm(xmm) => {
                        if *to_mem {
                            asm.movf_store(xmm, mem, *size)?;
                        } else {
                            asm.movf_load(mem, xmm, *size)?;
                        }
                    }
                    RegMem::Mem(_) => {
                        return Err(CompileError::NotImplemented(
                            "memory-to-memory transfer in mov_mem",
                        ))
                    }
                }
            }

            LirOp::Cmp { l, r } => {
                // the left side is guaranteed to be in a register; with
                // registers holding sign-extended canonical values, the
                // quadword compare is width-correct
                let left = self.operand_for(id, *l).reg();
                let right = self.operand_for(id, *r);
                asm.cmp(left, right, OperandSize::Qword)?;
            }

            LirOp::Set { dst, cc } => {
                let cc = match cc {
                    SetCc::Lt => Cc::Lt,
                    SetCc::Lte => Cc::Le,
                    SetCc::Eq => Cc::Eq,
                    SetCc::Neq => Cc::Ne,
                    SetCc::Gte => Cc::Ge,
                    SetCc::Gt => Cc::Gt,
                };
                match self.operand_for(id, *dst) {
                    RegMem::Reg(reg) => {
                        // widen the flag byte to a canonical 0 or 1
                        asm.set(cc, reg);
                        asm.movzx8(reg, reg);
                    }
                    RegMem::Mem(mem) => {
                        // clear the slot first so full-width reads see a
                        // canonical 0 or 1 (mov to memory keeps flags)
                        asm.movimm_store(0, mem, OperandSize::Qword)?;
                        asm.set_mem(cc, mem);
                    }
                    RegMem::Xmm(_) => {
                        return Err(CompileError::NotImplemented("setcc into an xmm register"))
                    }
                }
            }

            LirOp::Neg { dst } => {
                let reg = self.operand_for(id, *dst).reg();
                asm.neg(reg, OperandSize::Qword);
            }

            LirOp::Not { dst } => {
                // boolean flip keeping the register canonical; a bitwise
                // NOT would leave garbage in the upper bits
                let reg = self.operand_for(id, *dst).reg();
                asm.test(reg);
                asm.set(Cc::Eq, reg);
                asm.movzx8(reg, reg);
            }

            LirOp::Test { src } => {
                let loc = self.operand_for(id, *src);
                if !loc.is_reg() {
                    return Err(CompileError::NotImplemented("test with memory operand"));
                }
                asm.test(loc.reg());
            }

            // Jmp is handled before the assembler is created
            LirOp::Jmp { .. } => unreachable!(),

            LirOp::Jnz { target } => {
                // taken-edge moves sit at the (single-predecessor)
                // target's head
                let at = asm.jnz_rel32();
                patches.push((*target, at));
            }

            LirOp::Add { dst, src } | LirOp::FAdd { dst, src } => {
                let src = self.operand_for(id, *src);
                let dst = self.operand_for(id, *dst);
                match (dst, src) {
                    (RegMem::Xmm(d), RegMem::Xmm(s)) => {
                        asm.addf(s, d, self.vr_ty(lir.dst()[0]).size())?;
                    }
                    (RegMem::Reg(d), _) => {
                        asm.add(src, d, OperandSize::Qword)?;
                    }
                    _ => return Err(CompileError::NotImplemented("add operand combination")),
                }
            }

            LirOp::Sub { dst, src } => {
                let src = self.operand_for(id, *src);
                let dst = self.operand_for(id, *dst);
                match (dst, src) {
                    (RegMem::Xmm(d), RegMem::Xmm(s)) => {
                        asm.subf(s, d, self.vr_ty(lir.dst()[0]).size())?;
                    }
                    (RegMem::Reg(d), _) => {
                        asm.sub(src, d, OperandSize::Qword)?;
                    }
                    _ => return Err(CompileError::NotImplemented("sub operand combination")),
                }
            }

            LirOp::Mul { dst, src } => {
                let src = self.operand_for(id, *src);
                let dst = self.operand_for(id, *dst);
                match (dst, src) {
                    (RegMem::Xmm(d), RegMem::Xmm(s)) => {
                        asm.mulf(s, d, self.vr_ty(lir.dst()[0]).size())?;
                    }
                    (RegMem::Reg(d), _) => {
                        asm.imul(d, src)?;
                    }
                    _ => return Err(CompileError::NotImplemented("mul operand combination")),
                }
            }

            LirOp::Cqo { .. } => asm.cqo(),

            LirOp::Div { dst, src_b, .. } => {
                let divisor = self.operand_for(id, *src_b);
                if self.vr_ty(*src_b).is_integer() {
                    asm.idiv(divisor, OperandSize::Qword)?;
                } else {
                    let target = self.operand_for(id, *dst).xmm();
                    asm.divf(target, divisor, self.vr_ty(*src_b).size())?;
                }
            }

            LirOp::Ret => {
                for &(reg, slot) in self.stack_frame_spills {
                    asm.mov_load(
                        RegMem::Mem(self.stack.addressing(slot)),
                        reg,
                        OperandSize::Qword,
                    );
                }
                asm.add_imm(Reg::Rsp, self.stack.frame_size() as i32);
                asm.ret();
            }

            LirOp::Call { function, .. } => {
                asm.call_mem(Mem::offset(Reg::Rbp, function * 8));
            }

            LirOp::CallIdxInReg { index, .. } => {
                let index = self.operand_for(id, *index).reg();
                asm.call_mem(Mem::indexed(Reg::Rbp, index, 8, 0));
            }

            LirOp::Alloc { .. } => {
                return Err(CompileError::NotImplemented("alloc instruction"));
            }
        }

        Ok(())
    }

    /// Integer register-destination moves sign-extend below quadword so
    /// registers always hold canonical 64-bit values.
    fn emit_sized_mov(
        &self,
        asm: &mut Assembler,
        src: RegMem,
        dst: RegMem,
        size: OperandSize,
    ) -> Result<(), CompileError> {
        match (src, dst) {
            (RegMem::Mem(_), RegMem::Reg(reg)) | (RegMem::Reg(_), RegMem::Reg(reg)) => {
                match size {
                    OperandSize::Byte | OperandSize::Word => asm.movsx(src, reg, size)?,
                    OperandSize::Dword => asm.movsxd(src, reg),
                    OperandSize::Qword => {
                        asm.mov(src, dst, size)?;
                    }
                }
                Ok(())
            }
            (RegMem::Reg(_), RegMem::Mem(_)) => {
                // spill slots hold the canonical full width
                asm.mov(src, dst, OperandSize::Qword)?;
                Ok(())
            }
            _ => {
                asm.mov(src, dst, size)?;
                Ok(())
            }
        }
    }
}

fn truncate_to(imm: i64, size: OperandSize) -> i64 {
    match size {
        OperandSize::Byte => imm as i8 as i64,
        OperandSize::Word => imm as i16 as i64,
        OperandSize::Dword => imm as i32 as i64,
        OperandSize::Qword => imm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::jit::lifetime::LifetimeAnalyzer;
    use crate::jit::lower::LirCompiler;
    use crate::jit::regalloc::RegisterAllocator;
    use crate::vm::load_program;

    fn compile(image: &[u8], function: usize) -> Vec<u8> {
        let program = load_program(image).unwrap();
        let function = &program.functions[function];
        let mut lower = LirCompiler::new(&program, function);
        lower.run().unwrap();

        let vr_count = lower.vr_count();
        let intervals =
            LifetimeAnalyzer::new(&mut lower.blocks, vr_count, function.parameters.len())
                .run(&lower.vr_types);

        let allocation = RegisterAllocator::new(
            function,
            &lower.usages,
            &lower.fixed_to_vr,
            &lower.fixed_xmm_to_vr,
            &lower.overflow_arg_to_vr,
            &lower.hint_same,
        )
        .run(intervals);

        MachineEmitter::new(
            &lower.blocks,
            &allocation.intervals,
            &allocation.stack,
            &lower.vr_types,
            &allocation.stack_frame_spills,
        )
        .run()
        .unwrap()
    }

    #[test]
    fn test_code_ends_with_trap() {
        let code = compile(&fixtures::trivial_return(7), 0);
        assert_eq!(&code[code.len() - 2..], &[0x0F, 0x0B]);
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let first = compile(&fixtures::loop_sum(), 0);
        let second = compile(&fixtures::loop_sum(), 0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_jump_displacements_are_patched() {
        let code = compile(&fixtures::loop_sum(), 0);
        // no zeroed rel32 placeholder may survive behind an E9
        for i in 0..code.len().saturating_sub(5) {
            if code[i] == 0xE9 {
                let disp = i32::from_le_bytes([
                    code[i + 1],
                    code[i + 2],
                    code[i + 3],
                    code[i + 4],
                ]);
                assert_ne!(disp, 0, "unpatched jump at {}", i);
            }
        }
    }

    #[test]
    fn test_callee_saved_saved_and_restored() {
        let code = compile(&fixtures::spill_pressure(), 0);
        // rbx is the first callee-saved register the allocator reaches;
        // a save of rbx to the stack must appear: mov [rsp+disp], rbx
        let save = [0x48, 0x89, 0x5C, 0x24];
        let restore = [0x48, 0x8B, 0x5C, 0x24];
        let contains = |needle: &[u8]| {
            code.windows(needle.len()).any(|w| w == needle)
        };
        assert!(contains(&save), "missing callee-saved save");
        assert!(contains(&restore), "missing callee-saved restore");
    }

    #[test]
    fn test_order_moves_identity_is_empty() {
        assert_eq!(MachineEmitter::order_moves(&[]), Some(vec![]));
    }

    #[test]
    fn test_order_moves_chain() {
        // c <- b must run before b <- a
        let a = RegMem::Reg(Reg::Rax);
        let b = RegMem::Reg(Reg::Rcx);
        let c = RegMem::Reg(Reg::Rdx);
        let moves = vec![
            MoveOp { src: a, dst: b },
            MoveOp { src: b, dst: c },
        ];
        let ordered = MachineEmitter::order_moves(&moves).unwrap();
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].dst, c);
        assert_eq!(ordered[1].dst, b);
    }

    #[test]
    fn test_order_moves_detects_cycles() {
        let a = RegMem::Reg(Reg::Rax);
        let b = RegMem::Reg(Reg::Rcx);
        let moves = vec![
            MoveOp { src: a, dst: b },
            MoveOp { src: b, dst: a },
        ];
        assert_eq!(MachineEmitter::order_moves(&moves), None);
    }

    #[test]
    fn test_shared_source_is_read_before_overwrite() {
        // b <- a, c <- a, a <- c: both readers of a must run first
        let a = RegMem::Reg(Reg::Rax);
        let b = RegMem::Reg(Reg::Rcx);
        let c = RegMem::Reg(Reg::Rdx);
        let moves = vec![
            MoveOp { src: a, dst: b },
            MoveOp { src: a, dst: c },
            MoveOp { src: c, dst: a },
        ];
        let ordered = MachineEmitter::order_moves(&moves).unwrap();
        let position = |dst: RegMem| ordered.iter().position(|m| m.dst == dst).unwrap();
        assert!(position(c) < position(a));
        assert!(position(b) < position(a));
    }

    #[test]
    fn test_functions_compile_to_code() {
        for image in [
            fixtures::trivial_return(0),
            fixtures::arithmetic(),
            fixtures::loop_sum(),
            fixtures::call_chain(),
            fixtures::polymorphic_call(),
            fixtures::float_divide(),
            fixtures::register_pressure(),
            fixtures::spill_pressure(),
        ] {
            let program = load_program(&image).unwrap();
            for i in 0..program.functions.len() {
                let code = compile(&image, i);
                assert!(code.len() > 2);
            }
        }
    }
}
