//! Bytecode data model.
//!
//! A [`Program`] holds packed globals, struct types with v-tables, and
//! functions whose bodies are in block-structured SSA form with explicit
//! phi nodes. Temporaries are numbered in definition order after the
//! parameters; the per-temporary type table is computed at load time by
//! the verifier.

mod bytecode;
mod verifier;
#[allow(clippy::module_inception)]
mod vm;

pub use bytecode::{load_file, load_program, MAGIC};
pub use verifier::static_analysis;
pub use vm::{InterpretEngine, VmError};

use crate::jit::operands::OperandSize;
use std::collections::BTreeMap;
use std::io;

/// Errors from loading or statically analysing a bytecode file.
#[derive(Debug)]
pub enum BytecodeError {
    Io(io::Error),
    /// The leading magic word was not 0x06AA.
    InvalidMagic,
    UnexpectedEof,
    UnknownOpcode(u8),
    InvalidUtf8,
    /// Bytes remain after the last function body.
    TrailingBytes,
    /// A static-analysis check failed.
    Analysis(String),
}

impl From<io::Error> for BytecodeError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            BytecodeError::UnexpectedEof
        } else {
            BytecodeError::Io(e)
        }
    }
}

impl std::fmt::Display for BytecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BytecodeError::Io(e) => write!(f, "failed to load bytecode file: {}", e),
            BytecodeError::InvalidMagic => write!(f, "magic constant did not appear as expected"),
            BytecodeError::UnexpectedEof => write!(f, "unexpected end of file"),
            BytecodeError::UnknownOpcode(op) => write!(f, "invalid opcode encountered: {}", op),
            BytecodeError::InvalidUtf8 => write!(f, "invalid utf-8 in name"),
            BytecodeError::TrailingBytes => write!(f, "trailing bytes after last function"),
            BytecodeError::Analysis(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BytecodeError {}

/// Struct size or field offset queried before the type was packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeNotPacked(pub u8);

impl std::fmt::Display for TypeNotPacked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "struct type {} has not been packed yet", self.0)
    }
}

impl std::error::Error for TypeNotPacked {}

/// Primitive base types. Codes of 9 and above denote struct-pointer
/// types and are not part of the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BaseType {
    Void = 0,
    Bool = 1,
    Int8 = 2,
    Char = 3,
    Int16 = 4,
    Int32 = 5,
    Int64 = 6,
    Flp32 = 7,
    Flp64 = 8,
}

/// A value type: a base-type code plus an array flag.
#[derive(Debug, Clone, Copy)]
pub struct Type {
    pub is_array: bool,
    pub base_type: u8,
}

impl Type {
    pub fn new(base: BaseType) -> Self {
        Type {
            is_array: false,
            base_type: base as u8,
        }
    }

    pub fn is_floating_point(&self) -> bool {
        !self.is_array && (self.base_type == BaseType::Flp32 as u8 || self.base_type == BaseType::Flp64 as u8)
    }

    pub fn is_integer(&self) -> bool {
        self.base_type <= BaseType::Int64 as u8 || self.base_type >= 9
    }

    /// Machine size of a value of this type. Arrays and object pointers
    /// are pointers; VOID is the type of null constants.
    pub fn size(&self) -> OperandSize {
        if self.is_array {
            return OperandSize::Qword;
        }

        match self.base_type {
            0 => OperandSize::Qword,
            1 | 2 => OperandSize::Byte,
            3 | 4 => OperandSize::Word,
            5 | 7 => OperandSize::Dword,
            6 | 8 => OperandSize::Qword,
            _ => OperandSize::Qword, // struct pointer
        }
    }

    /// Type agreement as the verifier uses it: VOID acts as a wildcard so
    /// null constants compare against anything.
    pub fn matches(&self, other: &Type) -> bool {
        self.is_array == other.is_array
            && (self.base_type == other.base_type
                || self.base_type == BaseType::Void as u8
                || other.base_type == BaseType::Void as u8)
    }
}

/// A named, typed parameter.
#[derive(Debug, Clone)]
pub struct Local {
    pub ty: Type,
    pub name: String,
}

/// A basic block: an instruction count into the function's flat
/// instruction sequence plus the explicit CFG edges.
#[derive(Debug, Clone)]
pub struct Block {
    pub instruction_count: u16,
    pub successors: Vec<u16>,
    pub predecessors: Vec<u16>,
}

/// One incoming phi edge: the temporary flowing in from a predecessor.
#[derive(Debug, Clone, Copy)]
pub struct PhiEdge {
    pub temp: u16,
    pub block: u16,
}

/// Arithmetic and logical binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
}

/// Comparison operators; all produce a BOOL temporary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Gte,
    Eq,
    Neq,
    Lte,
    Lt,
}

/// A decoded bytecode instruction.
///
/// Destinations are SSA temporaries assigned by the verifier in
/// definition order after the parameters.
#[derive(Debug, Clone)]
pub enum Instruction {
    Nop,
    /// Copy of a parameter or earlier temporary.
    Load { dst: u16, src: u16 },
    /// Mutable variable store; not expressible in SSA programs and
    /// rejected by both backends.
    Store { var: u16, src: u16 },
    Const { dst: u16, ty: Type, value: i64 },
    Binary { op: BinaryOp, dst: u16, lsrc: u16, rsrc: u16 },
    Compare { op: CompareOp, dst: u16, lsrc: u16, rsrc: u16 },
    Neg { dst: u16, src: u16 },
    Not { dst: u16, src: u16 },
    /// Array allocation; `count` names the temporary holding the element
    /// count.
    New { dst: u16, ty: Type, count: u16 },
    Goto { block: u16 },
    IfGoto { cond: u16, block: u16 },
    Length { dst: u16, array: u16 },
    LoadIdx { dst: u16, array: u16, index: u16 },
    StoreIdx { array: u16, index: u16, value: u16 },
    Phi { dst: u16, edges: Vec<PhiEdge> },
    Call { dst: Option<u16>, function: u16, args: Vec<u16> },
    /// Call of a runtime builtin (print, benchmark timers, exit).
    Special { dst: Option<u16>, builtin: u8, args: Vec<u16> },
    MemberCall { dst: Option<u16>, method: u8, ptr: u16, args: Vec<u16> },
    Return { src: Option<u16> },
    /// Object allocation for a struct type.
    Allocate { dst: u16, type_id: u8 },
    ObjLoad { dst: u16, ptr: u16, type_id: u8, field: u8 },
    ObjStore { ptr: u16, type_id: u8, field: u8, value: u16 },
    GlobLoad { dst: u16, global: u16 },
    GlobStore { global: u16, value: u16 },
}

impl Instruction {
    /// The temporary this instruction defines, if any.
    pub fn dst_idx(&self) -> Option<u16> {
        match self {
            Instruction::Load { dst, .. }
            | Instruction::Const { dst, .. }
            | Instruction::Binary { dst, .. }
            | Instruction::Compare { dst, .. }
            | Instruction::Neg { dst, .. }
            | Instruction::Not { dst, .. }
            | Instruction::New { dst, .. }
            | Instruction::Length { dst, .. }
            | Instruction::LoadIdx { dst, .. }
            | Instruction::Phi { dst, .. }
            | Instruction::Allocate { dst, .. }
            | Instruction::ObjLoad { dst, .. }
            | Instruction::GlobLoad { dst, .. } => Some(*dst),
            Instruction::Call { dst, .. }
            | Instruction::Special { dst, .. }
            | Instruction::MemberCall { dst, .. } => *dst,
            _ => None,
        }
    }

    /// The temporaries this instruction reads, in a stable order.
    pub fn input_operands(&self) -> Vec<u16> {
        match self {
            Instruction::Nop
            | Instruction::Const { .. }
            | Instruction::Goto { .. }
            | Instruction::Allocate { .. }
            | Instruction::GlobLoad { .. }
            | Instruction::Return { src: None } => Vec::new(),
            Instruction::Load { src, .. }
            | Instruction::Store { src, .. }
            | Instruction::Neg { src, .. }
            | Instruction::Not { src, .. }
            | Instruction::Return { src: Some(src) } => vec![*src],
            Instruction::Binary { lsrc, rsrc, .. } | Instruction::Compare { lsrc, rsrc, .. } => {
                vec![*lsrc, *rsrc]
            }
            Instruction::New { count, .. } => vec![*count],
            Instruction::IfGoto { cond, .. } => vec![*cond],
            Instruction::Length { array, .. } => vec![*array],
            Instruction::LoadIdx { array, index, .. } => vec![*index, *array],
            Instruction::StoreIdx { array, index, value } => vec![*value, *index, *array],
            Instruction::Phi { edges, .. } => edges.iter().map(|e| e.temp).collect(),
            Instruction::Call { args, .. } | Instruction::Special { args, .. } => args.clone(),
            Instruction::MemberCall { args, .. } => args.clone(),
            Instruction::ObjLoad { ptr, .. } => vec![*ptr],
            Instruction::ObjStore { ptr, value, .. } => vec![*ptr, *value],
            Instruction::GlobStore { value, .. } => vec![*value],
        }
    }
}

/// A global or struct field: base-type code, name, and packed byte
/// offset.
#[derive(Debug, Clone)]
pub struct Field {
    pub type_id: u8,
    pub name: String,
    pub offset: u16,
}

impl Field {
    /// Store size of the field. VOID fields are invalid.
    pub fn size(&self) -> Result<OperandSize, BytecodeError> {
        match self.type_id {
            0 => Err(BytecodeError::Analysis("invalid member of type void".into())),
            1 | 2 => Ok(OperandSize::Byte),
            3 | 4 => Ok(OperandSize::Word),
            5 | 7 => Ok(OperandSize::Dword),
            6 | 8 => Ok(OperandSize::Qword),
            _ => Ok(OperandSize::Qword), // struct pointer
        }
    }
}

/// A struct type with its v-table of global function indices.
///
/// Instances are laid out as an 8-byte v-table pointer followed by the
/// fields packed without padding. Size and field offsets exist only
/// after [`StructType::pack`] has run; the verifier packs every type at
/// load time.
#[derive(Debug, Clone)]
pub struct StructType {
    pub id: u8,
    pub name: String,
    pub fields: Vec<Field>,
    pub v_table: Vec<u16>,
    size: u16,
}

impl StructType {
    pub fn new(id: u8, name: String, fields: Vec<Field>, v_table: Vec<u16>) -> Self {
        StructType {
            id,
            name,
            fields,
            v_table,
            size: 0,
        }
    }

    /// Assign field offsets and memoise the total size. Idempotent.
    pub fn pack(&mut self) -> Result<u16, BytecodeError> {
        let mut sum: u16 = 8; // v-table pointer slot
        for field in &mut self.fields {
            field.offset = sum;
            sum += field.size()?.bytes();
        }
        self.size = sum;
        Ok(sum)
    }

    pub fn size(&self) -> Result<u16, TypeNotPacked> {
        if self.size == 0 {
            return Err(TypeNotPacked(self.id));
        }
        Ok(self.size)
    }

    pub fn field_offset(&self, field_idx: u8) -> Result<u16, TypeNotPacked> {
        if self.size == 0 {
            return Err(TypeNotPacked(self.id));
        }
        Ok(self.fields[field_idx as usize].offset)
    }

    pub fn field_size(&self, field_idx: u8) -> Result<OperandSize, TypeNotPacked> {
        if self.size == 0 {
            return Err(TypeNotPacked(self.id));
        }
        self.fields[field_idx as usize]
            .size()
            .map_err(|_| TypeNotPacked(self.id))
    }
}

/// A function: parameters, return type, CFG, and the flat instruction
/// sequence the blocks partition.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<Local>,
    pub return_type: Type,
    pub blocks: Vec<Block>,
    pub instructions: Vec<Instruction>,
    pub temporary_count: u16,
    pub temporary_types: Vec<Type>,
}

/// A loaded program.
#[derive(Debug, Clone)]
pub struct Program {
    pub globals: Vec<Field>,
    pub types: BTreeMap<u8, StructType>,
    pub functions: Vec<Function>,
}

impl Program {
    /// Total size of the packed globals area in bytes.
    pub fn globals_size(&self) -> u16 {
        self.globals
            .iter()
            .map(|g| g.size().map(|s| s.bytes()).unwrap_or(8))
            .sum()
    }

    pub fn find_main(&self) -> Result<u16, BytecodeError> {
        self.functions
            .iter()
            .position(|f| f.name == "main")
            .map(|i| i as u16)
            .ok_or_else(|| BytecodeError::Analysis("main function not found".into()))
    }
}
