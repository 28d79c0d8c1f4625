//! Tree-walking interpreter.
//!
//! The interpreter is the executable specification of operator
//! semantics: the JIT must agree with it on every program. Values live
//! in a flat frame of raw 64-bit slots indexed by temporary; all
//! arithmetic happens at the operand's declared width.

use std::rc::Rc;
use std::time::Instant;

use super::{BaseType, BinaryOp, CompareOp, Instruction, Program, Type};
use crate::config::Options;
use crate::jit::runtime::{alloc_array, alloc_object, print_int_array};

/// Errors during interpretation.
#[derive(Debug)]
pub enum VmError {
    NoMain,
    DivisionByZero,
    Unsupported(&'static str),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::NoMain => write!(f, "main function not found"),
            VmError::DivisionByZero => write!(f, "division by zero"),
            VmError::Unsupported(what) => write!(f, "not supported by the interpreter: {}", what),
        }
    }
}

impl std::error::Error for VmError {}

/// One raw value slot. The declared type of the owning temporary decides
/// how the bits are read; sub-qword integers are kept sign-extended, the
/// way the machine code's `movsx` loads leave them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Slot(u64);

impl Slot {
    fn from_i64(v: i64) -> Self {
        Slot(v as u64)
    }

    fn from_bool(v: bool) -> Self {
        Slot(v as u64)
    }

    fn from_f32(v: f32) -> Self {
        Slot(v.to_bits() as u64)
    }

    fn from_f64(v: f64) -> Self {
        Slot(v.to_bits())
    }

    fn from_ptr(v: *mut u8) -> Self {
        Slot(v as usize as u64)
    }

    fn bool(self) -> bool {
        self.0 & 1 != 0
    }

    fn i8(self) -> i8 {
        self.0 as i8
    }

    fn i16(self) -> i16 {
        self.0 as i16
    }

    fn i32(self) -> i32 {
        self.0 as i32
    }

    fn i64(self) -> i64 {
        self.0 as i64
    }

    fn f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    fn f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    fn ptr(self) -> *mut u8 {
        self.0 as usize as *mut u8
    }
}

fn int_binary<T>(op: BinaryOp, a: T, b: T) -> Result<T, VmError>
where
    T: Copy
        + num_ops::WrappingOps
{
    match op {
        BinaryOp::Add => Ok(a.wrapping_add(b)),
        BinaryOp::Sub => Ok(a.wrapping_sub(b)),
        BinaryOp::Mul => Ok(a.wrapping_mul(b)),
        BinaryOp::Div => a.checked_div(b).ok_or(VmError::DivisionByZero),
        BinaryOp::Mod => a.checked_rem(b).ok_or(VmError::DivisionByZero),
        BinaryOp::And | BinaryOp::Or => Err(VmError::Unsupported("logical and/or")),
    }
}

/// Minimal wrapping-arithmetic abstraction over the signed integer
/// widths the bytecode knows.
mod num_ops {
    pub trait WrappingOps: Sized {
        fn wrapping_add(self, other: Self) -> Self;
        fn wrapping_sub(self, other: Self) -> Self;
        fn wrapping_mul(self, other: Self) -> Self;
        fn checked_div(self, other: Self) -> Option<Self>;
        fn checked_rem(self, other: Self) -> Option<Self>;
    }

    macro_rules! impl_wrapping {
        ($($t:ty),*) => {$(
            impl WrappingOps for $t {
                fn wrapping_add(self, other: Self) -> Self { <$t>::wrapping_add(self, other) }
                fn wrapping_sub(self, other: Self) -> Self { <$t>::wrapping_sub(self, other) }
                fn wrapping_mul(self, other: Self) -> Self { <$t>::wrapping_mul(self, other) }
                fn checked_div(self, other: Self) -> Option<Self> { <$t>::checked_div(self, other) }
                fn checked_rem(self, other: Self) -> Option<Self> { <$t>::checked_rem(self, other) }
            }
        )*};
    }

    impl_wrapping!(i8, i16, i32, i64);
}

fn binary(op: BinaryOp, ty: Type, l: Slot, r: Slot) -> Result<Slot, VmError> {
    match ty.base_type {
        b if b == BaseType::Int8 as u8 => Ok(Slot::from_i64(int_binary(op, l.i8(), r.i8())? as i64)),
        b if b == BaseType::Int16 as u8 || b == BaseType::Char as u8 => {
            Ok(Slot::from_i64(int_binary(op, l.i16(), r.i16())? as i64))
        }
        b if b == BaseType::Int32 as u8 => {
            Ok(Slot::from_i64(int_binary(op, l.i32(), r.i32())? as i64))
        }
        b if b == BaseType::Int64 as u8 => Ok(Slot::from_i64(int_binary(op, l.i64(), r.i64())?)),
        b if b == BaseType::Flp32 as u8 => {
            let (a, b) = (l.f32(), r.f32());
            let v = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => return Err(VmError::Unsupported("float mod/and/or")),
            };
            Ok(Slot::from_f32(v))
        }
        b if b == BaseType::Flp64 as u8 => {
            let (a, b) = (l.f64(), r.f64());
            let v = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => return Err(VmError::Unsupported("float mod/and/or")),
            };
            Ok(Slot::from_f64(v))
        }
        _ => Err(VmError::Unsupported("binary op on this type")),
    }
}

fn compare(op: CompareOp, ty: Type, l: Slot, r: Slot) -> Slot {
    macro_rules! cmp {
        ($a:expr, $b:expr) => {{
            let (a, b) = ($a, $b);
            match op {
                CompareOp::Gt => a > b,
                CompareOp::Gte => a >= b,
                CompareOp::Eq => a == b,
                CompareOp::Neq => a != b,
                CompareOp::Lte => a <= b,
                CompareOp::Lt => a < b,
            }
        }};
    }

    let result = if ty.is_array {
        cmp!(l.0, r.0)
    } else {
        match ty.base_type {
            b if b == BaseType::Int8 as u8 => cmp!(l.i8(), r.i8()),
            b if b == BaseType::Int16 as u8 || b == BaseType::Char as u8 => cmp!(l.i16(), r.i16()),
            b if b == BaseType::Int32 as u8 => cmp!(l.i32(), r.i32()),
            b if b == BaseType::Int64 as u8 => cmp!(l.i64(), r.i64()),
            b if b == BaseType::Flp32 as u8 => cmp!(l.f32(), r.f32()),
            b if b == BaseType::Flp64 as u8 => cmp!(l.f64(), r.f64()),
            _ => cmp!(l.0, r.0), // pointers
        }
    };
    Slot::from_bool(result)
}

/// Fields carry their array flag in bit 7; array fields hold pointers.
fn field_base_type(type_id: u8) -> u8 {
    if type_id >> 7 != 0 {
        BaseType::Int64 as u8
    } else {
        type_id & 0x7F
    }
}

unsafe fn read_typed(address: *const u8, base_type: u8) -> Slot {
    match base_type {
        1 | 2 => Slot::from_i64(*(address as *const i8) as i64),
        3 | 4 => Slot::from_i64(*(address as *const i16) as i64),
        5 => Slot::from_i64(*(address as *const i32) as i64),
        7 => Slot(*(address as *const u32) as u64),
        _ => Slot(*(address as *const u64)),
    }
}

unsafe fn write_typed(address: *mut u8, base_type: u8, value: Slot) {
    match base_type {
        1 | 2 => *address = value.0 as u8,
        3 | 4 => *(address as *mut u16) = value.0 as u16,
        5 | 7 => *(address as *mut u32) = value.0 as u32,
        _ => *(address as *mut u64) = value.0,
    }
}

/// The interpreter engine.
pub struct InterpretEngine {
    program: Rc<Program>,
    #[allow(dead_code)]
    options: Options,
    globals: Vec<Slot>,
    bench_begin: Option<Instant>,
}

impl InterpretEngine {
    pub fn new(program: Program, options: Options) -> Self {
        let globals = vec![Slot::default(); program.globals.len()];
        InterpretEngine {
            program: Rc::new(program),
            options,
            globals,
            bench_begin: None,
        }
    }

    /// Run `main` and return its value as the process exit code.
    pub fn execute(&mut self) -> Result<i32, VmError> {
        let idx = self.program.find_main().map_err(|_| VmError::NoMain)?;

        let mut result = [Slot::default()];
        self.execute_function(idx as usize, &[], &mut result, Some(0))?;

        let value = result[0].i32();
        println!("returned {}", value);
        Ok(value)
    }

    fn execute_function(
        &mut self,
        idx: usize,
        args: &[u16],
        prev_frame: &mut [Slot],
        ret_idx: Option<u16>,
    ) -> Result<(), VmError> {
        let program = Rc::clone(&self.program);
        let function = &program.functions[idx];

        let mut values = vec![Slot::default(); function.temporary_count as usize];
        for (i, arg) in args.iter().enumerate().take(function.parameters.len()) {
            values[i] = prev_frame[*arg as usize];
        }

        // first instruction index of every block, for jump targets
        let block_starts: Vec<usize> = function
            .blocks
            .iter()
            .scan(0usize, |acc, b| {
                let start = *acc;
                *acc += b.instruction_count as usize;
                Some(start)
            })
            .collect();

        let block_of = |pc: usize| -> u16 {
            let mut instrs = 0usize;
            for (i, block) in function.blocks.iter().enumerate() {
                instrs += block.instruction_count as usize;
                if instrs > pc {
                    return i as u16;
                }
            }
            (function.blocks.len() - 1) as u16
        };

        let mut pc = 0usize;
        let mut prev = 0usize;

        loop {
            let instruction = &function.instructions[pc];

            match instruction {
                Instruction::Nop => {}

                Instruction::Const { dst, ty, value } => {
                    values[*dst as usize] = match ty.base_type {
                        b if b == BaseType::Flp32 as u8 => Slot(*value as u32 as u64),
                        b if b == BaseType::Flp64 as u8 => Slot(*value as u64),
                        b if b == BaseType::Bool as u8 => Slot::from_bool(*value != 0),
                        _ => Slot::from_i64(*value),
                    };
                }

                Instruction::Load { dst, src } => {
                    values[*dst as usize] = values[*src as usize];
                }

                Instruction::Store { .. } => {
                    return Err(VmError::Unsupported("store instruction in SSA form"));
                }

                Instruction::Binary { op, dst, lsrc, rsrc } => {
                    let ty = function.temporary_types[*lsrc as usize];
                    values[*dst as usize] =
                        binary(*op, ty, values[*lsrc as usize], values[*rsrc as usize])?;
                }

                Instruction::Compare { op, dst, lsrc, rsrc } => {
                    let ty = function.temporary_types[*lsrc as usize];
                    values[*dst as usize] =
                        compare(*op, ty, values[*lsrc as usize], values[*rsrc as usize]);
                }

                Instruction::Neg { dst, src } => {
                    let ty = function.temporary_types[*dst as usize];
                    let v = values[*src as usize];
                    values[*dst as usize] = match ty.base_type {
                        b if b == BaseType::Int8 as u8 => Slot::from_i64(v.i8().wrapping_neg() as i64),
                        b if b == BaseType::Int16 as u8 || b == BaseType::Char as u8 => {
                            Slot::from_i64(v.i16().wrapping_neg() as i64)
                        }
                        b if b == BaseType::Int32 as u8 => Slot::from_i64(v.i32().wrapping_neg() as i64),
                        b if b == BaseType::Int64 as u8 => Slot::from_i64(v.i64().wrapping_neg()),
                        b if b == BaseType::Flp32 as u8 => Slot::from_f32(-v.f32()),
                        b if b == BaseType::Flp64 as u8 => Slot::from_f64(-v.f64()),
                        _ => return Err(VmError::Unsupported("neg on this type")),
                    };
                }

                Instruction::Not { dst, src } => {
                    values[*dst as usize] = Slot::from_bool(!values[*src as usize].bool());
                }

                Instruction::New { dst, ty, count } => {
                    let elements = values[*count as usize].i32();
                    let address =
                        alloc_array(ty.size().bytes() as u8, ty.base_type, elements);
                    values[*dst as usize] = Slot::from_ptr(address);
                }

                Instruction::Length { dst, array } => {
                    let length =
                        unsafe { *(values[*array as usize].ptr() as *const i32).offset(-1) };
                    values[*dst as usize] = Slot::from_i64(length as i64);
                }

                Instruction::LoadIdx { dst, array, index } => {
                    let ty = function.temporary_types[*dst as usize];
                    let elem = ty.size().bytes() as usize;
                    let address = unsafe {
                        values[*array as usize]
                            .ptr()
                            .add(values[*index as usize].i32() as usize * elem)
                    };
                    values[*dst as usize] = unsafe { read_typed(address, ty.base_type) };
                }

                Instruction::StoreIdx { array, index, value } => {
                    let ty = function.temporary_types[*value as usize];
                    let elem = ty.size().bytes() as usize;
                    let address = unsafe {
                        values[*array as usize]
                            .ptr()
                            .add(values[*index as usize].i32() as usize * elem)
                    };
                    unsafe { write_typed(address, ty.base_type, values[*value as usize]) };
                }

                Instruction::Goto { block } => {
                    prev = pc;
                    pc = block_starts[*block as usize];
                    continue;
                }

                Instruction::IfGoto { cond, block } => {
                    prev = pc;
                    if values[*cond as usize].bool() {
                        pc = block_starts[*block as usize];
                    } else {
                        pc += 1;
                    }
                    continue;
                }

                Instruction::Phi { dst, edges } => {
                    let prev_block = block_of(prev);
                    for edge in edges {
                        if edge.block == prev_block {
                            values[*dst as usize] = values[edge.temp as usize];
                            break;
                        }
                    }
                    // `prev` must survive a run of consecutive phis
                    pc += 1;
                    continue;
                }

                Instruction::Call { dst, function: fidx, args } => {
                    self.execute_function(*fidx as usize, args, &mut values, *dst)?;
                }

                Instruction::MemberCall { dst, method, ptr, args } => {
                    let v_table = unsafe { *(values[*ptr as usize].ptr() as *const u64) };
                    let target =
                        unsafe { *(v_table as usize as *const u16).add(*method as usize) };
                    self.execute_function(target as usize, args, &mut values, *dst)?;
                }

                Instruction::Special { builtin, args, .. } => {
                    self.special(*builtin, args, &values)?;
                }

                Instruction::Return { src } => {
                    if let (Some(src), Some(ret)) = (src, ret_idx) {
                        prev_frame[ret as usize] = values[*src as usize];
                    }
                    return Ok(());
                }

                Instruction::Allocate { dst, type_id } => {
                    let ty = &program.types[type_id];
                    let size = ty.size().expect("struct types are packed at load time");
                    let address = alloc_object(size as u64);
                    unsafe {
                        *(address as *mut u64) = ty.v_table.as_ptr() as u64;
                    }
                    values[*dst as usize] = Slot::from_ptr(address);
                }

                Instruction::ObjLoad { dst, ptr, type_id, field } => {
                    let ty = &program.types[type_id];
                    let offset = ty
                        .field_offset(*field)
                        .expect("struct types are packed at load time");
                    // the field decides the access width, as in compiled code
                    let base = field_base_type(ty.fields[*field as usize].type_id);
                    let address = unsafe { values[*ptr as usize].ptr().add(offset as usize) };
                    values[*dst as usize] = unsafe { read_typed(address, base) };
                }

                Instruction::ObjStore { ptr, type_id, field, value } => {
                    let ty = &program.types[type_id];
                    let offset = ty
                        .field_offset(*field)
                        .expect("struct types are packed at load time");
                    let base = field_base_type(ty.fields[*field as usize].type_id);
                    let address = unsafe { values[*ptr as usize].ptr().add(offset as usize) };
                    unsafe { write_typed(address, base, values[*value as usize]) };
                }

                Instruction::GlobLoad { dst, global } => {
                    values[*dst as usize] = self.globals[*global as usize];
                }

                Instruction::GlobStore { global, value } => {
                    self.globals[*global as usize] = values[*value as usize];
                }
            }

            prev = pc;
            pc += 1;
        }
    }

    fn special(&mut self, builtin: u8, args: &[u16], values: &[Slot]) -> Result<(), VmError> {
        match builtin {
            0 => self.bench_begin = Some(Instant::now()),
            1 => {
                let begin = self.bench_begin.take().unwrap_or_else(Instant::now);
                println!("{}", begin.elapsed().as_nanos());
            }
            2 => println!("{:.6}", values[args[0] as usize].f32()),
            3 => {
                let array = values[args[0] as usize].ptr() as *const i32;
                print_int_array(array);
            }
            4 => println!("{:.6}", values[args[0] as usize].f64()),
            5 => {
                let code = values[args[0] as usize].i32();
                println!("Exiting {}", code);
                std::process::exit(code);
            }
            _ => return Err(VmError::Unsupported("unknown builtin")),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::vm::load_program;

    fn run(image: &[u8]) -> i32 {
        let program = load_program(image).unwrap();
        let mut engine = InterpretEngine::new(program, Options::default());
        engine.execute().unwrap()
    }

    #[test]
    fn test_trivial_return() {
        assert_eq!(run(&fixtures::trivial_return(42)), 42);
    }

    #[test]
    fn test_loop_sum() {
        assert_eq!(run(&fixtures::loop_sum()), 45);
    }

    #[test]
    fn test_arithmetic() {
        // (20 - 8) * 3 / 2 % 7 = 4
        assert_eq!(run(&fixtures::arithmetic()), 4);
    }

    #[test]
    fn test_call_chain() {
        assert_eq!(run(&fixtures::call_chain()), 12);
    }

    #[test]
    fn test_polymorphic_call() {
        assert_eq!(run(&fixtures::polymorphic_call()), 3);
    }

    #[test]
    fn test_array_sum() {
        assert_eq!(run(&fixtures::array_fill_sum()), 10);
    }

    #[test]
    fn test_array_length() {
        assert_eq!(run(&fixtures::array_length()), 7);
    }

    #[test]
    fn test_globals() {
        assert_eq!(run(&fixtures::global_roundtrip(27)), 27);
    }

    #[test]
    fn test_object_fields() {
        assert_eq!(run(&fixtures::object_fields()), 30);
    }

    #[test]
    fn test_register_pressure_program() {
        assert_eq!(run(&fixtures::register_pressure()), 1);
    }

    #[test]
    fn test_spill_pressure_program() {
        assert_eq!(run(&fixtures::spill_pressure()), 171);
    }
}
