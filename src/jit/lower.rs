//! Bytecode to LIR lowering.
//!
//! One pass over a function's blocks, assigning monotonically increasing
//! instruction ids and building the virtual-register world the later
//! stages live in: the temporary-to-vr mapping (with provisional vrs for
//! phi inputs that have not been defined yet), fixed vrs bound to
//! physical registers for ABI points, stack-argument vrs for overflow
//! call arguments, per-use register requirements, and the phi hint sets.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::vm::{BaseType, BinaryOp, CompareOp, Function, Instruction, Program, Type};

use super::abi;
use super::lifetime::LirBlock;
use super::lir::{Lir, LirOp, MovArg, PhiEdge, SetCc, Usage, UsageMap, Vr};
use super::operands::{OperandSize, Reg, Xmm};
use super::runtime;
use super::CompileError;

/// Lowers one function. The public fields are the result consumed by
/// lifetime analysis, allocation, and emission.
pub struct LirCompiler<'p> {
    program: &'p Program,
    function: &'p Function,

    pub blocks: Vec<LirBlock>,
    pub usages: UsageMap,
    pub fixed_to_vr: BTreeMap<Reg, Vr>,
    pub fixed_xmm_to_vr: BTreeMap<Xmm, Vr>,
    pub overflow_arg_to_vr: BTreeMap<u16, Vr>,
    pub vr_types: HashMap<Vr, Type>,
    pub hint_same: BTreeSet<BTreeSet<Vr>>,

    temporary_to_vr: HashMap<u16, Vr>,
    unknown_to_known: HashMap<Vr, Vr>,
    next_vr: Vr,
    next_unknown: Vr,
    id: u16,
}

impl<'p> LirCompiler<'p> {
    pub fn new(program: &'p Program, function: &'p Function) -> Self {
        LirCompiler {
            program,
            function,
            blocks: Vec::new(),
            usages: UsageMap::new(),
            fixed_to_vr: BTreeMap::new(),
            fixed_xmm_to_vr: BTreeMap::new(),
            overflow_arg_to_vr: BTreeMap::new(),
            vr_types: HashMap::new(),
            hint_same: BTreeSet::new(),
            temporary_to_vr: HashMap::new(),
            unknown_to_known: HashMap::new(),
            next_vr: 0,
            next_unknown: u16::MAX,
            id: 0,
        }
    }

    /// Number of virtual registers handed out.
    pub fn vr_count(&self) -> u16 {
        self.next_vr
    }

    pub fn run(&mut self) -> Result<(), CompileError> {
        self.analyse_blocks();

        // parameters exist from function entry; the first six arrive in
        // registers
        for i in 0..self.function.parameters.len() {
            let vr = self.vr_for_temporary(i as u16);
            self.record_parameter_use(vr, i < abi::INT_PARAMETERS.len());
        }

        // dead-code tags; no tagging pass currently marks anything
        let skip = vec![false; self.function.instructions.len()];

        let function = self.function;
        let mut cursor = 0usize;
        for block in 0..self.blocks.len() {
            let count = function.blocks[block].instruction_count as usize;
            for i in cursor..cursor + count {
                if skip[i] {
                    continue;
                }
                self.compile_instruction(block, &function.instructions[i])?;
            }
            cursor += count;

            if self.blocks[block].lirs.is_empty() {
                // every block needs at least one instruction for its id
                // range; a function with no body at all returns void
                let id = self.next_id();
                if self.function.instructions.is_empty() {
                    self.push(block, id, LirOp::Ret);
                } else {
                    self.push(block, id, LirOp::Nop);
                }
            }
        }

        self.resolve_provisional_vrs()?;

        for block in &self.blocks {
            log::trace!(target: "lir", "-------- block {}", block.index);
            for lir in &block.lirs {
                log::trace!(target: "lir", "{}", lir);
            }
        }

        Ok(())
    }

    fn analyse_blocks(&mut self) {
        for (index, info) in self.function.blocks.iter().enumerate() {
            self.blocks.push(LirBlock::new(
                index as u16,
                info.successors.clone(),
                info.predecessors.clone(),
            ));
        }
    }

    // ==================== vr bookkeeping ====================

    fn alloc_vr(&mut self, ty: Type) -> Vr {
        let vr = self.next_vr;
        self.next_vr += 1;
        self.vr_types.insert(vr, ty);
        vr
    }

    /// The vr for a bytecode temporary, allocating on first mention. A
    /// provisional vr handed out by an earlier phi is replaced by a real
    /// one here and remembered for the fix-up pass.
    fn vr_for_temporary(&mut self, temporary: u16) -> Vr {
        match self.temporary_to_vr.get(&temporary).copied() {
            None => {
                let vr = self.alloc_vr(self.function.temporary_types[temporary as usize]);
                self.temporary_to_vr.insert(temporary, vr);
                vr
            }
            Some(provisional) if provisional >= self.next_unknown => {
                let vr = self.alloc_vr(self.function.temporary_types[temporary as usize]);
                self.unknown_to_known.insert(provisional, vr);
                self.temporary_to_vr.insert(temporary, vr);
                vr
            }
            Some(vr) => vr,
        }
    }

    /// Like [`Self::vr_for_temporary`], but for phi inputs: a temporary
    /// that has not appeared yet gets a provisional vr from the top of
    /// the range.
    fn vr_for_possibly_unknown_temporary(&mut self, temporary: u16) -> Vr {
        if self.temporary_to_vr.contains_key(&temporary) {
            self.vr_for_temporary(temporary)
        } else {
            let vr = self.next_unknown;
            self.next_unknown -= 1;
            self.temporary_to_vr.insert(temporary, vr);
            vr
        }
    }

    fn vr_for_fixed(&mut self, reg: Reg) -> Vr {
        if let Some(&vr) = self.fixed_to_vr.get(&reg) {
            return vr;
        }
        let vr = self.alloc_vr(Type::new(BaseType::Int64));
        self.fixed_to_vr.insert(reg, vr);
        vr
    }

    fn vr_for_fixed_xmm(&mut self, xmm: Xmm) -> Vr {
        if let Some(&vr) = self.fixed_xmm_to_vr.get(&xmm) {
            return vr;
        }
        let vr = self.alloc_vr(Type::new(BaseType::Flp64));
        self.fixed_xmm_to_vr.insert(xmm, vr);
        vr
    }

    fn vr_for_stack_argument(&mut self, index: u16, ty: Type) -> Vr {
        if let Some(&vr) = self.overflow_arg_to_vr.get(&index) {
            return vr;
        }
        let vr = self.alloc_vr(ty);
        self.overflow_arg_to_vr.insert(index, vr);
        vr
    }

    fn next_id(&mut self) -> u16 {
        let id = self.id;
        self.id += 1;
        id
    }

    fn push(&mut self, block: usize, id: u16, op: LirOp) {
        self.blocks[block].lirs.push(Lir { id, op });
    }

    fn record_use(&mut self, vr: Vr, id: u16, must_have_reg: bool) {
        self.usages
            .entry(vr)
            .or_default()
            .insert(id as i32, Usage { must_have_reg });
    }

    fn record_parameter_use(&mut self, vr: Vr, must_have_reg: bool) {
        self.usages
            .entry(vr)
            .or_default()
            .insert(-1, Usage { must_have_reg });
    }

    // ==================== shared expansions ====================

    fn ty(&self, vr: Vr) -> Type {
        self.vr_types[&vr]
    }

    /// `MOV dst, src` (or FMOV for floats) with explicit register
    /// requirements on both sides.
    fn emit_mov(&mut self, block: usize, dst: Vr, dst_must: bool, src: Vr, src_must: bool) {
        let ty = self.ty(src);
        let id = self.next_id();
        self.record_use(src, id, src_must);
        self.record_use(dst, id, dst_must);
        let op = if ty.is_floating_point() {
            LirOp::FMov {
                dst,
                src: MovArg::Vr(src),
                size: ty.size(),
            }
        } else {
            LirOp::Mov {
                dst,
                src: MovArg::Vr(src),
                size: ty.size(),
            }
        };
        self.push(block, id, op);
    }

    fn emit_mov_imm(&mut self, block: usize, dst: Vr, dst_must: bool, imm: i64, size: OperandSize) {
        let id = self.next_id();
        self.record_use(dst, id, dst_must);
        self.push(
            block,
            id,
            LirOp::Mov {
                dst,
                src: MovArg::Imm(imm),
                size,
            },
        );
    }

    /// Is every input an integer? Decides the int vs SSE lowering of an
    /// arithmetic instruction.
    fn is_integer_op(&self, instruction: &Instruction) -> bool {
        instruction
            .input_operands()
            .iter()
            .all(|&t| self.function.temporary_types[t as usize].is_integer())
    }

    // ==================== per-instruction lowering ====================

    fn compile_instruction(
        &mut self,
        block: usize,
        instruction: &Instruction,
    ) -> Result<(), CompileError> {
        match instruction {
            Instruction::Nop => {}

            Instruction::Const { dst, ty, value } => {
                if ty.is_floating_point() {
                    // materialise the bit pattern in an integer register,
                    // then transfer it into the XMM world
                    let bits = self.alloc_vr(Type::new(BaseType::Int64));
                    self.emit_mov_imm(block, bits, true, *value, OperandSize::Qword);

                    let dst = self.vr_for_temporary(*dst);
                    let id = self.next_id();
                    self.record_use(bits, id, true);
                    self.record_use(dst, id, true);
                    self.push(
                        block,
                        id,
                        LirOp::MovI2F {
                            dst,
                            src: bits,
                            size: ty.size(),
                        },
                    );
                } else {
                    let dst = self.vr_for_temporary(*dst);
                    self.emit_mov_imm(block, dst, true, *value, ty.size());
                }
            }

            Instruction::Load { dst, src } => {
                let src = self.vr_for_temporary(*src);
                let dst = self.vr_for_temporary(*dst);
                self.emit_mov(block, dst, true, src, false);
            }

            Instruction::Store { .. } => {
                return Err(CompileError::NotImplemented("store instruction"));
            }

            Instruction::Neg { dst, src } => {
                let src = self.vr_for_temporary(*src);
                let dst = self.vr_for_temporary(*dst);
                self.emit_mov(block, dst, true, src, false);

                let id = self.next_id();
                self.record_use(dst, id, true);
                self.push(block, id, LirOp::Neg { dst });
            }

            Instruction::Not { dst, src } => {
                let src = self.vr_for_temporary(*src);
                let dst = self.vr_for_temporary(*dst);
                self.emit_mov(block, dst, true, src, false);

                let id = self.next_id();
                self.record_use(dst, id, true);
                self.push(block, id, LirOp::Not { dst });
            }

            Instruction::Binary { op, dst, lsrc, rsrc } => {
                self.lower_binary(block, *op, *dst, *lsrc, *rsrc, self.is_integer_op(instruction))?;
            }

            Instruction::Compare { op, dst, lsrc, rsrc } => {
                let l = self.vr_for_temporary(*lsrc);
                let r = self.vr_for_temporary(*rsrc);
                let id = self.next_id();
                self.record_use(l, id, true);
                self.record_use(r, id, false);
                self.push(block, id, LirOp::Cmp { l, r });

                let cc = match op {
                    CompareOp::Gt => SetCc::Gt,
                    CompareOp::Gte => SetCc::Gte,
                    CompareOp::Eq => SetCc::Eq,
                    CompareOp::Neq => SetCc::Neq,
                    CompareOp::Lte => SetCc::Lte,
                    CompareOp::Lt => SetCc::Lt,
                };
                let dst = self.vr_for_temporary(*dst);
                let id = self.next_id();
                self.record_use(dst, id, false);
                self.push(block, id, LirOp::Set { dst, cc });
            }

            Instruction::New { dst, ty, count } => {
                let element_size = self.alloc_vr(Type::new(BaseType::Int32));
                self.emit_mov_imm(
                    block,
                    element_size,
                    false,
                    ty.size().bytes() as i64,
                    OperandSize::Dword,
                );

                let type_tag = self.alloc_vr(Type::new(BaseType::Int8));
                self.emit_mov_imm(block, type_tag, false, ty.base_type as i64, OperandSize::Byte);

                let count = self.vr_for_temporary(*count);
                self.build_call(
                    block,
                    runtime::special_function_index(runtime::SPECIAL_ALLOC_ARRAY),
                    false,
                    vec![element_size, type_tag, count],
                    Some(*dst),
                )?;
            }

            Instruction::Goto { block: target } => {
                let id = self.next_id();
                self.push(block, id, LirOp::Jmp { target: *target });
            }

            Instruction::IfGoto { cond, block: target } => {
                let src = self.vr_for_temporary(*cond);
                let id = self.next_id();
                self.record_use(src, id, false);
                self.push(block, id, LirOp::Test { src });

                let id = self.next_id();
                self.push(block, id, LirOp::Jnz { target: *target });
            }

            Instruction::Length { dst, array } => {
                let base = self.vr_for_temporary(*array);
                let value = self.vr_for_temporary(*dst);
                let id = self.next_id();
                self.record_use(base, id, true);
                self.record_use(value, id, true);
                // the element count sits just below the array data
                self.push(
                    block,
                    id,
                    LirOp::MovMem {
                        value,
                        base,
                        index: None,
                        offset: -4,
                        size: OperandSize::Dword,
                        to_mem: false,
                    },
                );
            }

            Instruction::LoadIdx { dst, array, index }
            | Instruction::StoreIdx {
                array,
                index,
                value: dst,
            } => {
                let to_mem = matches!(instruction, Instruction::StoreIdx { .. });
                let base = self.vr_for_temporary(*array);
                let idx = self.vr_for_temporary(*index);
                let value = self.vr_for_temporary(*dst);
                let size = self.ty(value).size();

                let id = self.next_id();
                self.record_use(base, id, true);
                self.record_use(idx, id, true);
                self.record_use(value, id, true);
                self.push(
                    block,
                    id,
                    LirOp::MovMem {
                        value,
                        base,
                        index: Some((idx, size.bytes() as u8)),
                        offset: 0,
                        size,
                        to_mem,
                    },
                );
            }

            Instruction::Phi { dst, edges } => {
                let dst = self.vr_for_temporary(*dst);
                let id = self.next_id();
                self.record_use(dst, id, false);

                let edges: Vec<PhiEdge> = edges
                    .iter()
                    .map(|e| PhiEdge {
                        vreg: self.vr_for_possibly_unknown_temporary(e.temp),
                        block: e.block,
                    })
                    .collect();

                // the allocator tries to keep all of these in one register
                let mut same: BTreeSet<Vr> = edges.iter().map(|e| e.vreg).collect();
                same.insert(dst);
                self.hint_same.insert(same);

                self.push(block, id, LirOp::Phi { dst, edges });
            }

            Instruction::Call { dst, function, args } => {
                let args = self.map_arguments(args);
                self.build_call(block, *function as i32, false, args, *dst)?;
            }

            Instruction::Special { dst, builtin, args } => {
                let index = runtime::resolve_builtin(*builtin)
                    .ok_or(CompileError::NotImplemented("unknown builtin"))?;
                let args = self.map_arguments(args);
                self.build_call(
                    block,
                    runtime::special_function_index(index),
                    false,
                    args,
                    *dst,
                )?;
            }

            Instruction::MemberCall { dst, method, ptr, args } => {
                // v-table pointer lives at offset 0 of the receiver
                let receiver = self.vr_for_temporary(*ptr);
                let v_table = self.alloc_vr(Type::new(BaseType::Int64));
                let id = self.next_id();
                self.record_use(receiver, id, true);
                self.record_use(v_table, id, true);
                self.push(
                    block,
                    id,
                    LirOp::MovMem {
                        value: v_table,
                        base: receiver,
                        index: None,
                        offset: 0,
                        size: OperandSize::Qword,
                        to_mem: false,
                    },
                );

                // global function index, a word per v-table slot, into RAX
                let index_reg = self.vr_for_fixed(Reg::Rax);
                let id = self.next_id();
                self.record_use(v_table, id, true);
                self.record_use(index_reg, id, true);
                self.push(
                    block,
                    id,
                    LirOp::MovMem {
                        value: index_reg,
                        base: v_table,
                        index: None,
                        offset: *method as i32 * 2,
                        size: OperandSize::Word,
                        to_mem: false,
                    },
                );

                let args = self.map_arguments(args);
                self.build_call(block, 0, true, args, *dst)?;
            }

            Instruction::Return { src } => {
                if let Some(src) = src {
                    let src = self.vr_for_temporary(*src);
                    let fixed = if self.function.return_type.is_integer() {
                        self.vr_for_fixed(Reg::Rax)
                    } else {
                        self.vr_for_fixed_xmm(Xmm::Xmm0)
                    };
                    self.emit_mov(block, fixed, true, src, false);

                    let id = self.next_id();
                    self.push(block, id, LirOp::Ret);
                    self.record_use(fixed, id, true);
                } else {
                    let id = self.next_id();
                    self.push(block, id, LirOp::Ret);
                }
            }

            Instruction::Allocate { dst, type_id } => {
                let ty = self
                    .program
                    .types
                    .get(type_id)
                    .ok_or(CompileError::UnknownStructType(*type_id))?;
                let object_size = ty.size()?;
                let v_table_ptr = ty.v_table.as_ptr() as i64;

                let size_vr = self.alloc_vr(Type::new(BaseType::Int64));
                self.emit_mov_imm(block, size_vr, false, object_size as i64, OperandSize::Qword);

                self.build_call(
                    block,
                    runtime::special_function_index(runtime::SPECIAL_ALLOCATE),
                    false,
                    vec![size_vr],
                    Some(*dst),
                )?;

                // plant the v-table pointer at offset 0
                let pointer = self.alloc_vr(Type::new(BaseType::Int64));
                self.emit_mov_imm(block, pointer, true, v_table_ptr, OperandSize::Qword);

                let object = self.vr_for_temporary(*dst);
                let id = self.next_id();
                self.record_use(pointer, id, true);
                self.record_use(object, id, true);
                self.push(
                    block,
                    id,
                    LirOp::MovMem {
                        value: pointer,
                        base: object,
                        index: None,
                        offset: 0,
                        size: OperandSize::Qword,
                        to_mem: true,
                    },
                );
            }

            Instruction::ObjLoad { dst, ptr, type_id, field }
            | Instruction::ObjStore {
                value: dst,
                ptr,
                type_id,
                field,
            } => {
                let to_mem = matches!(instruction, Instruction::ObjStore { .. });
                let ty = self
                    .program
                    .types
                    .get(type_id)
                    .ok_or(CompileError::UnknownStructType(*type_id))?;
                let offset = ty.field_offset(*field)? as i32;
                let size = ty.field_size(*field)?;

                let base = self.vr_for_temporary(*ptr);
                let value = self.vr_for_temporary(*dst);
                let id = self.next_id();
                self.record_use(base, id, true);
                self.record_use(value, id, true);
                self.push(
                    block,
                    id,
                    LirOp::MovMem {
                        value,
                        base,
                        index: None,
                        offset,
                        size,
                        to_mem,
                    },
                );
            }

            Instruction::GlobLoad { dst, global } | Instruction::GlobStore { value: dst, global } => {
                let to_mem = matches!(instruction, Instruction::GlobStore { .. });
                let field = &self.program.globals[*global as usize];
                let offset = field.offset as i32;
                let size = field.size().map_err(|_| {
                    CompileError::NotImplemented("global of void type")
                })?;

                // the globals base pointer lives in the frame the invoke
                // thunk set up
                let rbp = self.vr_for_fixed(Reg::Rbp);
                let base = self.alloc_vr(Type::new(BaseType::Int64));
                let id = self.next_id();
                self.record_use(rbp, id, true);
                self.record_use(base, id, true);
                self.push(
                    block,
                    id,
                    LirOp::MovMem {
                        value: base,
                        base: rbp,
                        index: None,
                        offset: -16,
                        size: OperandSize::Qword,
                        to_mem: false,
                    },
                );

                let value = self.vr_for_temporary(*dst);
                let id = self.next_id();
                self.record_use(base, id, true);
                self.record_use(value, id, true);
                self.push(
                    block,
                    id,
                    LirOp::MovMem {
                        value,
                        base,
                        index: None,
                        offset,
                        size,
                        to_mem,
                    },
                );
            }
        }

        Ok(())
    }

    fn lower_binary(
        &mut self,
        block: usize,
        op: BinaryOp,
        dst_t: u16,
        lsrc: u16,
        rsrc: u16,
        is_integer: bool,
    ) -> Result<(), CompileError> {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                return Err(CompileError::NotImplemented("logical and/or"));
            }
            BinaryOp::Div if !is_integer => return self.lower_float_div(block, dst_t, lsrc, rsrc),
            BinaryOp::Div | BinaryOp::Mod => {
                return self.lower_int_div(block, op, dst_t, lsrc, rsrc)
            }
            _ => {}
        }

        // not SSA on its own, but the mov and the op are adjacent and
        // never separated by a block boundary
        let l = self.vr_for_temporary(lsrc);
        let dst = self.vr_for_temporary(dst_t);
        self.emit_mov(block, dst, true, l, false);

        let src = self.vr_for_temporary(rsrc);
        let id = self.next_id();
        self.record_use(dst, id, true);
        self.record_use(src, id, false);
        let op = match (op, is_integer) {
            (BinaryOp::Add, true) => LirOp::Add { dst, src },
            (BinaryOp::Add, false) => LirOp::FAdd { dst, src },
            (BinaryOp::Sub, _) => LirOp::Sub { dst, src },
            (BinaryOp::Mul, _) => LirOp::Mul { dst, src },
            _ => unreachable!(),
        };
        self.push(block, id, op);
        Ok(())
    }

    /// Integer division and modulo share the RAX/RDX protocol; only the
    /// result register differs.
    fn lower_int_div(
        &mut self,
        block: usize,
        op: BinaryOp,
        dst_t: u16,
        lsrc: u16,
        rsrc: u16,
    ) -> Result<(), CompileError> {
        let rax = self.vr_for_fixed(Reg::Rax);
        let rdx = self.vr_for_fixed(Reg::Rdx);

        let dividend = self.vr_for_temporary(lsrc);
        self.emit_mov(block, rax, true, dividend, false);

        let id = self.next_id();
        self.record_use(rax, id, true);
        self.record_use(rdx, id, true);
        self.push(block, id, LirOp::Cqo { dst: rdx, src: rax });

        let divisor = self.vr_for_temporary(rsrc);
        let id = self.next_id();
        self.record_use(rax, id, true);
        self.record_use(rdx, id, true);
        self.record_use(divisor, id, false);
        self.push(
            block,
            id,
            LirOp::Div {
                dst: rax,
                src_a: rdx,
                src_b: divisor,
            },
        );

        let result = if op == BinaryOp::Div { rax } else { rdx };
        let dst = self.vr_for_temporary(dst_t);
        self.emit_mov(block, dst, false, result, true);
        Ok(())
    }

    fn lower_float_div(
        &mut self,
        block: usize,
        dst_t: u16,
        lsrc: u16,
        rsrc: u16,
    ) -> Result<(), CompileError> {
        let l = self.vr_for_temporary(lsrc);
        let dst = self.vr_for_temporary(dst_t);
        self.emit_mov(block, dst, false, l, true);

        let divisor = self.vr_for_temporary(rsrc);
        let id = self.next_id();
        self.record_use(dst, id, true);
        self.record_use(divisor, id, false);
        self.push(
            block,
            id,
            LirOp::Div {
                dst,
                src_a: dst,
                src_b: divisor,
            },
        );
        Ok(())
    }

    fn map_arguments(&mut self, args: &[u16]) -> Vec<Vr> {
        args.iter().map(|&t| self.vr_for_temporary(t)).collect()
    }

    /// Calling-convention expansion: argument moves into fixed vrs (or
    /// stack-argument vrs past the register file), the call itself with
    /// its caller-saved clear set, and the result move.
    fn build_call(
        &mut self,
        block: usize,
        f_idx: i32,
        is_member: bool,
        tmp_args: Vec<Vr>,
        dst_temp: Option<u16>,
    ) -> Result<(), CompileError> {
        let mut clears: Vec<Vr> = Vec::new();
        for reg in abi::CALLER_SAVED {
            let vr = self.vr_for_fixed(reg);
            clears.push(vr);
        }
        for xmm in abi::CALLER_SAVED_FLOAT {
            let vr = self.vr_for_fixed_xmm(xmm);
            clears.push(vr);
        }

        let mut int_next = 0usize;
        let mut float_next = 0usize;
        let mut overflow = 0u16;

        if is_member {
            // RAX carries the resolved function index into the call
            let rax = self.vr_for_fixed(Reg::Rax);
            clears.retain(|&v| v != rax);
        } else if f_idx < 0 {
            // runtime functions receive the engine pointer first
            let rbp = self.vr_for_fixed(Reg::Rbp);
            let engine = self.vr_for_fixed(abi::INT_PARAMETERS[int_next]);
            int_next += 1;

            let id = self.next_id();
            self.record_use(rbp, id, true);
            self.record_use(engine, id, true);
            self.push(
                block,
                id,
                LirOp::MovMem {
                    value: engine,
                    base: rbp,
                    index: None,
                    offset: -8,
                    size: OperandSize::Qword,
                    to_mem: false,
                },
            );

            clears.retain(|&v| v != engine);
        }

        let mut passed: Vec<Vr> = Vec::new();
        for arg in tmp_args {
            let ty = self.ty(arg);
            if ty.is_floating_point() && float_next < abi::FLOAT_PARAMETERS.len() {
                let dst = self.vr_for_fixed_xmm(abi::FLOAT_PARAMETERS[float_next]);
                float_next += 1;
                self.emit_mov(block, dst, true, arg, false);
                clears.retain(|&v| v != dst);
                passed.push(dst);
            } else if ty.is_integer() && int_next < abi::INT_PARAMETERS.len() {
                let dst = self.vr_for_fixed(abi::INT_PARAMETERS[int_next]);
                int_next += 1;
                self.emit_mov(block, dst, true, arg, false);
                clears.retain(|&v| v != dst);
                passed.push(dst);
            } else {
                let dst = self.vr_for_stack_argument(overflow, ty);
                overflow += 1;

                let id = self.next_id();
                self.record_use(arg, id, true);
                self.record_use(dst, id, false);
                self.push(
                    block,
                    id,
                    LirOp::Mov {
                        dst,
                        src: MovArg::Vr(arg),
                        size: OperandSize::Qword,
                    },
                );
                passed.push(dst);
            }
        }

        // the call's destination is the ABI return register; the user
        // destination is filled by a separate move below
        let return_vr = dst_temp.map(|t| {
            let user = self.vr_for_temporary(t);
            if self.ty(user).is_floating_point() {
                self.vr_for_fixed_xmm(Xmm::Xmm0)
            } else {
                self.vr_for_fixed(Reg::Rax)
            }
        });

        let id = self.next_id();
        if let Some(ret) = return_vr {
            self.record_use(ret, id, true);
        }
        for (i, &arg) in passed.iter().enumerate() {
            self.record_use(arg, id, i < abi::INT_PARAMETERS.len());
        }
        for &clear in &clears {
            self.record_use(clear, id, true);
        }

        let op = if is_member {
            let index = self.vr_for_fixed(Reg::Rax);
            self.record_use(index, id, true);
            LirOp::CallIdxInReg {
                index,
                dst: return_vr,
                args: passed,
                clears,
            }
        } else {
            LirOp::Call {
                function: f_idx,
                dst: return_vr,
                args: passed,
                clears,
            }
        };
        self.push(block, id, op);

        if let Some(t) = dst_temp {
            let dst = self.vr_for_temporary(t);
            let src = return_vr.expect("call with destination has a return vr");
            self.emit_mov(block, dst, false, src, true);
        }

        Ok(())
    }

    /// Rewrite provisional phi-input vrs (and the hint sets naming them)
    /// to the real vrs assigned later.
    fn resolve_provisional_vrs(&mut self) -> Result<(), CompileError> {
        for block in &mut self.blocks {
            for lir in &mut block.lirs {
                if let LirOp::Phi { edges, .. } = &mut lir.op {
                    for edge in edges {
                        if let Some(&known) = self.unknown_to_known.get(&edge.vreg) {
                            let old = edge.vreg;
                            edge.vreg = known;
                            if let Some(old_usages) = self.usages.remove(&old) {
                                self.usages.entry(known).or_default().extend(old_usages);
                            }
                        }
                    }
                }
            }
        }

        let hint_same = std::mem::take(&mut self.hint_same);
        self.hint_same = hint_same
            .into_iter()
            .map(|set| {
                set.into_iter()
                    .map(|vr| self.unknown_to_known.get(&vr).copied().unwrap_or(vr))
                    .collect()
            })
            .collect();

        // anything still in the provisional range was never defined
        let next_vr = self.next_vr;
        for block in &self.blocks {
            for lir in &block.lirs {
                if let LirOp::Phi { edges, .. } = &lir.op {
                    for edge in edges {
                        if edge.vreg >= next_vr {
                            return Err(CompileError::UnresolvedTemporary(edge.vreg));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::vm::load_program;

    fn lower(image: &[u8], function: usize) -> (Vec<LirBlock>, u16) {
        let program = load_program(image).unwrap();
        let mut compiler = LirCompiler::new(&program, &program.functions[function]);
        compiler.run().unwrap();
        let LirCompiler { blocks, next_vr, .. } = compiler;
        (blocks, next_vr)
    }

    #[test]
    fn test_trivial_return_shape() {
        let (blocks, _) = lower(&fixtures::trivial_return(42), 0);
        assert_eq!(blocks.len(), 1);

        let ops: Vec<&LirOp> = blocks[0].lirs.iter().map(|l| &l.op).collect();
        assert!(matches!(ops[0], LirOp::Mov { src: MovArg::Imm(42), .. }));
        // return value moves into the fixed RAX vr, then RET
        assert!(matches!(ops[1], LirOp::Mov { src: MovArg::Vr(_), .. }));
        assert!(matches!(ops[2], LirOp::Ret));
    }

    #[test]
    fn test_ids_are_monotone() {
        let (blocks, _) = lower(&fixtures::loop_sum(), 0);
        let mut last = None;
        for block in &blocks {
            for lir in &block.lirs {
                if let Some(last) = last {
                    assert!(lir.id > last);
                }
                last = Some(lir.id);
            }
        }
    }

    #[test]
    fn test_phi_lowering_builds_hints() {
        let program = load_program(&fixtures::loop_sum()).unwrap();
        let mut compiler = LirCompiler::new(&program, &program.functions[0]);
        compiler.run().unwrap();

        // two phis, two hint sets, each containing the phi destination
        // and both incoming vrs
        assert_eq!(compiler.hint_same.len(), 2);
        for set in &compiler.hint_same {
            assert_eq!(set.len(), 3);
        }

        // no provisional vrs survive lowering
        for block in &compiler.blocks {
            for lir in &block.lirs {
                if let LirOp::Phi { edges, .. } = &lir.op {
                    for edge in edges {
                        assert!(edge.vreg < compiler.vr_count());
                    }
                }
            }
        }
    }

    #[test]
    fn test_division_uses_fixed_registers() {
        let program = load_program(&fixtures::arithmetic()).unwrap();
        let mut compiler = LirCompiler::new(&program, &program.functions[0]);
        compiler.run().unwrap();

        let rax = compiler.fixed_to_vr[&Reg::Rax];
        let rdx = compiler.fixed_to_vr[&Reg::Rdx];

        let lirs = &compiler.blocks[0].lirs;
        let div = lirs
            .iter()
            .find(|l| matches!(l.op, LirOp::Div { .. }))
            .unwrap();
        match &div.op {
            LirOp::Div { dst, src_a, .. } => {
                assert_eq!(*dst, rax);
                assert_eq!(*src_a, rdx);
            }
            _ => unreachable!(),
        }
        assert!(lirs.iter().any(|l| matches!(l.op, LirOp::Cqo { .. })));
    }

    #[test]
    fn test_call_clears_caller_saved() {
        let program = load_program(&fixtures::call_chain()).unwrap();
        let mut compiler = LirCompiler::new(&program, &program.functions[0]);
        compiler.run().unwrap();

        let call = compiler.blocks[0]
            .lirs
            .iter()
            .find(|l| matches!(l.op, LirOp::Call { .. }))
            .unwrap();
        match &call.op {
            LirOp::Call { function, args, clears, dst } => {
                assert_eq!(*function, 1);
                assert_eq!(args.len(), 2);
                assert!(dst.is_some());
                // RDI and RSI carry arguments, RAX the result; the rest
                // of the caller-saved file is cleared
                let rdi = compiler.fixed_to_vr[&Reg::Rdi];
                let rsi = compiler.fixed_to_vr[&Reg::Rsi];
                let rax = compiler.fixed_to_vr[&Reg::Rax];
                assert!(!clears.contains(&rdi));
                assert!(!clears.contains(&rsi));
                assert!(!clears.contains(&rax));
                let rcx = compiler.fixed_to_vr[&Reg::Rcx];
                assert!(clears.contains(&rcx));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_stack_arguments_past_six() {
        let program = load_program(&fixtures::register_pressure()).unwrap();
        let mut compiler = LirCompiler::new(&program, &program.functions[0]);
        compiler.run().unwrap();

        // twelve integer arguments: six in registers, six on the stack
        assert_eq!(compiler.overflow_arg_to_vr.len(), 6);
    }

    #[test]
    fn test_member_call_loads_vtable_index_into_rax() {
        let program = load_program(&fixtures::polymorphic_call()).unwrap();
        let mut compiler = LirCompiler::new(&program, &program.functions[0]);
        compiler.run().unwrap();

        let rax = compiler.fixed_to_vr[&Reg::Rax];
        let lirs = &compiler.blocks[0].lirs;

        // a WORD load of the v-table entry targets the fixed RAX vr
        assert!(lirs.iter().any(|l| matches!(
            &l.op,
            LirOp::MovMem { value, size: OperandSize::Word, to_mem: false, .. } if *value == rax
        )));
        assert!(lirs
            .iter()
            .any(|l| matches!(&l.op, LirOp::CallIdxInReg { index, .. } if *index == rax)));
    }

    #[test]
    fn test_globals_go_through_frame_slot() {
        let program = load_program(&fixtures::global_roundtrip(3)).unwrap();
        let mut compiler = LirCompiler::new(&program, &program.functions[0]);
        compiler.run().unwrap();

        let rbp = compiler.fixed_to_vr[&Reg::Rbp];
        let lirs = &compiler.blocks[0].lirs;
        // globals base is loaded from [RBP - 16]
        assert!(lirs.iter().any(|l| matches!(
            &l.op,
            LirOp::MovMem { base, offset: -16, to_mem: false, .. } if *base == rbp
        )));
    }
}
