//! The JIT engine: function table, trampolines, and the per-function
//! compilation pipeline.
//!
//! The function table is one flat array. Counting from the user region's
//! base (which RBP points at while compiled code runs):
//!
//! ```text
//! [RBP - 8*(3+i)]  special function i (reversed order)
//! [RBP - 16]       globals buffer
//! [RBP - 8]        engine pointer
//! [RBP + 8*f]      user function f
//! ```
//!
//! Uncompiled user slots point at per-function thunks that carry their
//! index as an immediate; v-table slots point at a member stub that
//! takes the index from RAX, where the member-call sequence left it.
//! Both jump into a shared stub that preserves the argument registers,
//! calls back into the engine, and tail-jumps to the compiled code.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::config::Options;
use crate::vm::Program;

use super::codebuf::CodeBuffer;
use super::emit::MachineEmitter;
use super::heap::{CodeHeap, CodeSegment};
use super::lifetime::LifetimeAnalyzer;
use super::lower::LirCompiler;
use super::operands::{Mem, OperandSize, Reg, Xmm};
use super::regalloc::RegisterAllocator;
use super::runtime;
use super::x86_64::Assembler;
use super::CompileError;

/// Compile-on-demand entry invoked by the stubs.
extern "sysv64" fn jit_compile(engine: *mut JitEngine, index: u64) -> *const u8 {
    let engine = unsafe { &mut *engine };
    match engine.compile(index as u16) {
        Ok(address) => address,
        Err(e) => {
            // no way to unwind through emitted frames
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

pub struct JitEngine {
    program: Program,
    options: Options,
    heap: CodeHeap,
    /// Function table backing store; slots are code addresses.
    table: Box<[u64]>,
    /// Packed globals buffer, pointed to by the table.
    globals: Box<[u8]>,
    segments: BTreeMap<u16, CodeSegment>,
    compiled: BTreeMap<u16, *const u8>,
    #[allow(dead_code)] // owns the stub code the table points into
    trampolines: Option<CodeSegment>,
    invoke: Option<extern "sysv64" fn(*mut u64, u64) -> i64>,
    bench_begin: Option<Instant>,
}

impl JitEngine {
    pub fn new(program: Program, options: Options) -> Result<Box<Self>, CompileError> {
        let heap = CodeHeap::new()?;
        let table_len = runtime::SPECIAL_FUNCTIONS + 2 + program.functions.len();
        let globals_size = (program.globals_size() as usize).max(8);

        let mut engine = Box::new(JitEngine {
            program,
            options,
            heap,
            table: vec![0u64; table_len].into_boxed_slice(),
            globals: vec![0u8; globals_size].into_boxed_slice(),
            segments: BTreeMap::new(),
            compiled: BTreeMap::new(),
            trampolines: None,
            invoke: None,
            bench_begin: None,
        });

        engine.install_runtime();
        engine.emit_trampolines()?;

        log::trace!(target: "address", "engine at {:p}", &*engine);
        Ok(engine)
    }

    fn user_base(&self) -> usize {
        runtime::SPECIAL_FUNCTIONS + 2
    }

    fn install_runtime(&mut self) {
        let top = runtime::SPECIAL_FUNCTIONS - 1;
        self.table[top - runtime::SPECIAL_ALLOCATE as usize] =
            runtime::rt_allocate as usize as u64;
        self.table[top - runtime::SPECIAL_BENCH_BEGIN as usize] =
            runtime::rt_bench_begin as usize as u64;
        self.table[top - runtime::SPECIAL_BENCH_END as usize] =
            runtime::rt_bench_end as usize as u64;
        self.table[top - runtime::SPECIAL_PRINT_FLOAT as usize] =
            runtime::rt_print_float as usize as u64;
        self.table[top - runtime::SPECIAL_ALLOC_ARRAY as usize] =
            runtime::rt_alloc_array as usize as u64;
        self.table[top - runtime::SPECIAL_PRINTA_INT as usize] =
            runtime::rt_printa_int as usize as u64;
        self.table[top - runtime::SPECIAL_PRINT_DOUBLE as usize] =
            runtime::rt_print_double as usize as u64;
        self.table[top - runtime::SPECIAL_EXIT as usize] = runtime::rt_exit as usize as u64;

        self.table[runtime::SPECIAL_FUNCTIONS] = self.globals.as_ptr() as u64;
        self.table[runtime::SPECIAL_FUNCTIONS + 1] = self as *mut Self as u64;
    }

    /// Emit the invoke thunk, the shared compile stub, the member stub,
    /// and one index-carrying thunk per function, all into one segment.
    fn emit_trampolines(&mut self) -> Result<(), CompileError> {
        let engine_ptr = self as *mut Self as i64;
        let function_count = self.program.functions.len();

        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);

        // invoke(fptable, index): establish RBP and call the slot
        let invoke_offset = asm.offset();
        asm.push(Reg::Rbp);
        asm.mov_rr(Reg::Rdi, Reg::Rbp, OperandSize::Qword);
        asm.call_mem(Mem::indexed(Reg::Rbp, Reg::Rsi, 8, 0));
        asm.pop(Reg::Rbp);
        asm.ret();

        // shared stub; expects the function index in R10
        let shared_offset = asm.offset();
        for reg in [
            Reg::Rax,
            Reg::Rdi,
            Reg::Rsi,
            Reg::Rdx,
            Reg::Rcx,
            Reg::R8,
            Reg::R9,
        ] {
            asm.push(reg);
        }
        asm.sub_imm(Reg::Rsp, 64);
        for (i, xmm) in FLOAT_SPILL.iter().enumerate() {
            asm.movf_store(*xmm, Mem::offset(Reg::Rsp, i as i32 * 8), OperandSize::Qword)?;
        }

        asm.movimm(engine_ptr, Reg::Rdi);
        asm.mov_rr(Reg::R10, Reg::Rsi, OperandSize::Qword);
        asm.movimm(jit_compile as usize as i64, Reg::Rax);
        asm.call_reg(Reg::Rax);
        asm.mov_rr(Reg::Rax, Reg::R11, OperandSize::Qword);

        for (i, xmm) in FLOAT_SPILL.iter().enumerate() {
            asm.movf_load(Mem::offset(Reg::Rsp, i as i32 * 8), *xmm, OperandSize::Qword)?;
        }
        asm.add_imm(Reg::Rsp, 64);
        for reg in [
            Reg::R9,
            Reg::R8,
            Reg::Rcx,
            Reg::Rdx,
            Reg::Rsi,
            Reg::Rdi,
            Reg::Rax,
        ] {
            asm.pop(reg);
        }
        asm.jmp_reg(Reg::R11);

        // member stub: the member-call sequence left the index in RAX
        let member_offset = asm.offset();
        asm.mov_rr(Reg::Rax, Reg::R10, OperandSize::Qword);
        let at = asm.jmp_rel32();
        buf.patch_u32(at, shared_offset.wrapping_sub(at + 4));

        // one thunk per function, index as an immediate
        let mut thunk_offsets = Vec::with_capacity(function_count);
        for index in 0..function_count {
            let mut asm = Assembler::new(&mut buf);
            thunk_offsets.push(asm.offset());
            asm.movimm(index as i64, Reg::R10);
            let at = asm.jmp_rel32();
            buf.patch_u32(at, shared_offset.wrapping_sub(at + 4));
        }

        let code = buf.build();
        let mut segment = self.heap.allocate(code.len() as i64)?;
        segment.write(&code);
        segment.mark_executable()?;
        let base = segment.address() as u64;

        // install the stubs: thunks everywhere, the member stub for
        // every v-table-referenced slot
        let user_base = self.user_base();
        for (index, offset) in thunk_offsets.iter().enumerate() {
            self.table[user_base + index] = base + *offset as u64;
        }
        for ty in self.program.types.values() {
            for &index in &ty.v_table {
                self.table[user_base + index as usize] = base + member_offset as u64;
            }
        }

        self.invoke = Some(unsafe { std::mem::transmute(base + invoke_offset as u64) });
        self.trampolines = Some(segment);
        Ok(())
    }

    /// Run `main`; the return value becomes the process exit code.
    pub fn execute(&mut self) -> Result<i64, CompileError> {
        let index = self
            .program
            .find_main()
            .map_err(|_| CompileError::NotImplemented("main function not found"))?;
        self.compile(index)?;

        let fptable = unsafe { self.table.as_mut_ptr().add(self.user_base()) };
        log::trace!(target: "address", "invoking main, function table at {:p}", fptable);

        let invoke = self.invoke.expect("trampolines are emitted at startup");
        let result = invoke(fptable, index as u64);

        log::trace!(target: "result", "client program exited with code {}", result);
        Ok(result)
    }

    /// Compile one function. Idempotent: a slot that was already
    /// compiled returns the recorded address without recompiling.
    pub fn compile(&mut self, index: u16) -> Result<*const u8, CompileError> {
        if let Some(&address) = self.compiled.get(&index) {
            return Ok(address);
        }
        if index as usize >= self.program.functions.len() {
            return Err(CompileError::InvalidFunctionIndex(index));
        }

        log::trace!(
            target: "compile",
            "compiling function {}",
            self.program.functions[index as usize].name
        );

        let code = {
            let function = &self.program.functions[index as usize];

            let mut lower = LirCompiler::new(&self.program, function);
            lower.run()?;

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
            .run()?
        };

        let mut segment = self.heap.allocate(code.len() as i64)?;
        segment.write(&code);
        segment.mark_executable()?;
        let address = segment.address();

        if self.options.debug {
            let name = &self.program.functions[index as usize].name;
            let _ = std::fs::write(format!("function_{}.dump", name), &code);
            log::trace!(
                target: "address",
                "produced {} bytes for function {} at {:p}",
                code.len(), name, address
            );
        }

        // a single pointer-sized store publishes the compiled code
        self.table[self.user_base() + index as usize] = address as u64;
        self.segments.insert(index, segment);
        self.compiled.insert(index, address);
        Ok(address)
    }

    pub(crate) fn bench_begin(&mut self) {
        self.bench_begin = Some(Instant::now());
    }

    pub(crate) fn bench_end(&mut self) {
        let begin = self.bench_begin.take().unwrap_or_else(Instant::now);
        println!("{}", begin.elapsed().as_nanos());
    }
}

/// XMM registers the shared stub preserves (the float argument file).
const FLOAT_SPILL: [Xmm; 8] = [
    Xmm::Xmm0,
    Xmm::Xmm1,
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::vm::load_program;

    fn run_jit(image: &[u8]) -> i64 {
        let program = load_program(image).unwrap();
        let mut engine = JitEngine::new(program, Options::default()).unwrap();
        engine.execute().unwrap()
    }

    #[test]
    fn test_trivial_return() {
        assert_eq!(run_jit(&fixtures::trivial_return(42)), 42);
    }

    #[test]
    fn test_loop_sum() {
        assert_eq!(run_jit(&fixtures::loop_sum()), 45);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run_jit(&fixtures::arithmetic()), 4);
    }

    #[test]
    fn test_call_chain() {
        assert_eq!(run_jit(&fixtures::call_chain()), 12);
    }

    #[test]
    fn test_array_length() {
        assert_eq!(run_jit(&fixtures::array_length()), 7);
    }

    #[test]
    fn test_array_fill_sum() {
        assert_eq!(run_jit(&fixtures::array_fill_sum()), 10);
    }

    #[test]
    fn test_polymorphic_call() {
        assert_eq!(run_jit(&fixtures::polymorphic_call()), 3);
    }

    #[test]
    fn test_globals() {
        assert_eq!(run_jit(&fixtures::global_roundtrip(27)), 27);
    }

    #[test]
    fn test_object_fields() {
        assert_eq!(run_jit(&fixtures::object_fields()), 30);
    }

    #[test]
    fn test_register_pressure() {
        assert_eq!(run_jit(&fixtures::register_pressure()), 1);
    }

    #[test]
    fn test_spill_pressure() {
        assert_eq!(run_jit(&fixtures::spill_pressure()), 171);
    }

    #[test]
    fn test_float_divide_runs() {
        assert_eq!(run_jit(&fixtures::float_divide()), 0);
    }

    #[test]
    fn test_compile_is_idempotent() {
        let program = load_program(&fixtures::trivial_return(3)).unwrap();
        let mut engine = JitEngine::new(program, Options::default()).unwrap();
        let first = engine.compile(0).unwrap();
        let second = engine.compile(0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_interpreter_and_jit_agree() {
        use crate::vm::InterpretEngine;

        for image in [
            fixtures::trivial_return(11),
            fixtures::arithmetic(),
            fixtures::loop_sum(),
            fixtures::call_chain(),
            fixtures::array_fill_sum(),
            fixtures::polymorphic_call(),
            fixtures::global_roundtrip(5),
            fixtures::object_fields(),
            fixtures::spill_pressure(),
        ] {
            let jit = run_jit(&image);

            let program = load_program(&image).unwrap();
            let mut interp = InterpretEngine::new(program, Options::default());
            let expected = interp.execute().unwrap();

            assert_eq!(jit, expected as i64);
        }
    }
}
