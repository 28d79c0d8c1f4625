//! Bytecode file loader.
//!
//! Binary format, little-endian throughout:
//! - optional `#!` shebang line, skipped before anything else
//! - magic `0x06AA` (u16)
//! - globals: length-prefixed fields
//! - struct types: length-prefixed `{id, name, fields, v-table}`
//! - functions: count, then per function name, parameters, return type,
//!   blocks, instructions
//!
//! Strings and sequences are u16-length-prefixed. The stream must end
//! exactly after the last function.

use std::io::{self, Read};

use super::{
    static_analysis, BaseType, BinaryOp, Block, BytecodeError, CompareOp, Field, Function,
    Instruction, Local, PhiEdge, Program, StructType, Type,
};

/// Leading magic word (1706 decimal).
pub const MAGIC: u16 = 0x06AA;

fn read_u8<R: Read>(r: &mut R) -> Result<u8, BytecodeError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16, BytecodeError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32, BytecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64, BytecodeError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_string<R: Read>(r: &mut R) -> Result<String, BytecodeError> {
    let length = read_u16(r)? as usize;
    let mut buf = vec![0u8; length];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| BytecodeError::InvalidUtf8)
}

fn read_u16_seq<R: Read>(r: &mut R) -> Result<Vec<u16>, BytecodeError> {
    let length = read_u16(r)? as usize;
    let mut result = Vec::with_capacity(length);
    for _ in 0..length {
        result.push(read_u16(r)?);
    }
    Ok(result)
}

/// Type byte: bit 7 is the array flag, bits 0..6 the base type.
fn read_type<R: Read>(r: &mut R) -> Result<Type, BytecodeError> {
    let byte = read_u8(r)?;
    Ok(Type {
        is_array: byte >> 7 != 0,
        base_type: byte & 0x7F,
    })
}

fn read_field<R: Read>(r: &mut R) -> Result<Field, BytecodeError> {
    Ok(Field {
        type_id: read_u8(r)?,
        name: read_string(r)?,
        offset: 0,
    })
}

fn read_fields<R: Read>(r: &mut R) -> Result<Vec<Field>, BytecodeError> {
    let length = read_u16(r)? as usize;
    let mut result = Vec::with_capacity(length);
    for _ in 0..length {
        result.push(read_field(r)?);
    }
    Ok(result)
}

fn read_const_value<R: Read>(r: &mut R, ty: Type) -> Result<i64, BytecodeError> {
    match ty.base_type {
        b if b == BaseType::Void as u8 => Ok(0),
        b if b == BaseType::Bool as u8 || b == BaseType::Int8 as u8 => Ok(read_u8(r)? as i64),
        b if b == BaseType::Char as u8 || b == BaseType::Int16 as u8 => Ok(read_u16(r)? as i64),
        b if b == BaseType::Int32 as u8 || b == BaseType::Flp32 as u8 => Ok(read_i32(r)? as i64),
        b if b == BaseType::Int64 as u8 || b == BaseType::Flp64 as u8 => read_i64(r),
        _ => Err(BytecodeError::Analysis(
            "unexpected type in const instruction".into(),
        )),
    }
}

fn read_instruction<R: Read>(r: &mut R) -> Result<Instruction, BytecodeError> {
    let opcode = read_u8(r)?;

    let binary = |op: BinaryOp, r: &mut R| -> Result<Instruction, BytecodeError> {
        Ok(Instruction::Binary {
            op,
            dst: 0,
            lsrc: read_u16(r)?,
            rsrc: read_u16(r)?,
        })
    };
    let compare = |op: CompareOp, r: &mut R| -> Result<Instruction, BytecodeError> {
        Ok(Instruction::Compare {
            op,
            dst: 0,
            lsrc: read_u16(r)?,
            rsrc: read_u16(r)?,
        })
    };

    match opcode {
        0 => Ok(Instruction::Nop),
        1 => Ok(Instruction::Load {
            dst: 0,
            src: read_u16(r)?,
        }),
        2 => Ok(Instruction::Store {
            var: read_u16(r)?,
            src: read_u16(r)?,
        }),
        3 => {
            let ty = read_type(r)?;
            if ty.is_array {
                return Err(BytecodeError::Analysis(
                    "received const with isArray flag".into(),
                ));
            }
            let value = read_const_value(r, ty)?;
            Ok(Instruction::Const { dst: 0, ty, value })
        }
        4 => binary(BinaryOp::Add, r),
        5 => binary(BinaryOp::Sub, r),
        6 => binary(BinaryOp::Mul, r),
        7 => binary(BinaryOp::Div, r),
        8 => binary(BinaryOp::Mod, r),
        9 => Ok(Instruction::Neg {
            dst: 0,
            src: read_u16(r)?,
        }),
        10 => compare(CompareOp::Gt, r),
        11 => compare(CompareOp::Gte, r),
        12 => compare(CompareOp::Eq, r),
        13 => compare(CompareOp::Neq, r),
        14 => compare(CompareOp::Lte, r),
        15 => compare(CompareOp::Lt, r),
        18 => binary(BinaryOp::And, r),
        19 => binary(BinaryOp::Or, r),
        20 => Ok(Instruction::Not {
            dst: 0,
            src: read_u16(r)?,
        }),
        21 => Ok(Instruction::New {
            dst: 0,
            ty: read_type(r)?,
            count: read_u16(r)?,
        }),
        22 => Ok(Instruction::Goto {
            block: read_u16(r)?,
        }),
        23 => Ok(Instruction::IfGoto {
            cond: read_u16(r)?,
            block: read_u16(r)?,
        }),
        25 => Ok(Instruction::Length {
            dst: 0,
            array: read_u16(r)?,
        }),
        26 => {
            let length = read_u16(r)? as usize;
            let mut edges = Vec::with_capacity(length);
            for _ in 0..length {
                edges.push(PhiEdge {
                    temp: read_u16(r)?,
                    block: read_u16(r)?,
                });
            }
            Ok(Instruction::Phi { dst: 0, edges })
        }
        28 => Ok(Instruction::Call {
            dst: Some(0),
            function: read_u16(r)?,
            args: read_u16_seq(r)?,
        }),
        29 => Ok(Instruction::Special {
            dst: Some(0),
            builtin: read_u8(r)?,
            args: read_u16_seq(r)?,
        }),
        30 => Ok(Instruction::Call {
            dst: None,
            function: read_u16(r)?,
            args: read_u16_seq(r)?,
        }),
        31 => Ok(Instruction::Special {
            dst: None,
            builtin: read_u8(r)?,
            args: read_u16_seq(r)?,
        }),
        32 => Ok(Instruction::Return { src: None }),
        33 => Ok(Instruction::Return {
            src: Some(read_u16(r)?),
        }),
        100 => Ok(Instruction::Allocate {
            dst: 0,
            type_id: read_u8(r)?,
        }),
        101 => Ok(Instruction::ObjLoad {
            dst: 0,
            ptr: read_u16(r)?,
            type_id: read_u8(r)?,
            field: read_u8(r)?,
        }),
        102 => Ok(Instruction::ObjStore {
            ptr: read_u16(r)?,
            type_id: read_u8(r)?,
            field: read_u8(r)?,
            value: read_u16(r)?,
        }),
        103 => Ok(Instruction::GlobLoad {
            dst: 0,
            global: read_u16(r)?,
        }),
        104 => Ok(Instruction::GlobStore {
            global: read_u16(r)?,
            value: read_u16(r)?,
        }),
        105 => {
            let method = read_u8(r)?;
            let args = read_u16_seq(r)?;
            Ok(Instruction::MemberCall {
                dst: None,
                method,
                ptr: args[0],
                args,
            })
        }
        106 => {
            let method = read_u8(r)?;
            let args = read_u16_seq(r)?;
            Ok(Instruction::MemberCall {
                dst: Some(0),
                method,
                ptr: args[0],
                args,
            })
        }
        129 => Ok(Instruction::LoadIdx {
            dst: 0,
            array: read_u16(r)?,
            index: read_u16(r)?,
        }),
        130 => Ok(Instruction::StoreIdx {
            array: read_u16(r)?,
            index: read_u16(r)?,
            value: read_u16(r)?,
        }),
        op => Err(BytecodeError::UnknownOpcode(op)),
    }
}

fn read_block<R: Read>(r: &mut R) -> Result<Block, BytecodeError> {
    Ok(Block {
        instruction_count: read_u16(r)?,
        successors: read_u16_seq(r)?,
        predecessors: Vec::new(),
    })
}

fn link_predecessors(blocks: &mut [Block]) {
    for predecessor in 0..blocks.len() {
        let successors = blocks[predecessor].successors.clone();
        for successor in successors {
            blocks[successor as usize].predecessors.push(predecessor as u16);
        }
    }
}

fn read_function<R: Read>(r: &mut R) -> Result<Function, BytecodeError> {
    let name = read_string(r)?;

    let parameter_count = read_u16(r)? as usize;
    let mut parameters = Vec::with_capacity(parameter_count);
    for _ in 0..parameter_count {
        parameters.push(Local {
            ty: read_type(r)?,
            name: read_string(r)?,
        });
    }

    let return_type = read_type(r)?;

    let block_count = read_u16(r)? as usize;
    let mut blocks = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        blocks.push(read_block(r)?);
    }
    link_predecessors(&mut blocks);

    let instruction_count = read_u16(r)? as usize;
    let mut instructions = Vec::with_capacity(instruction_count);
    for _ in 0..instruction_count {
        instructions.push(read_instruction(r)?);
    }

    Ok(Function {
        name,
        parameters,
        return_type,
        blocks,
        instructions,
        temporary_count: 0,
        temporary_types: Vec::new(),
    })
}

fn read_program<R: Read>(r: &mut R) -> Result<Program, BytecodeError> {
    let mut magic = read_u16(r)?;
    if magic == u16::from_le_bytes([b'#', b'!']) {
        // shebang line; skip to the newline and start over
        loop {
            if read_u8(r)? == b'\n' {
                break;
            }
        }
        magic = read_u16(r)?;
    }

    if magic != MAGIC {
        return Err(BytecodeError::InvalidMagic);
    }

    let globals = read_fields(r)?;

    let type_count = read_u16(r)? as usize;
    let mut types = std::collections::BTreeMap::new();
    for _ in 0..type_count {
        let id = read_u8(r)?;
        let name = read_string(r)?;
        let fields = read_fields(r)?;
        let v_table = read_u16_seq(r)?;
        types.insert(id, StructType::new(id, name, fields, v_table));
    }

    let function_count = read_u16(r)? as usize;
    let mut functions = Vec::with_capacity(function_count);
    for _ in 0..function_count {
        functions.push(read_function(r)?);
    }

    Ok(Program {
        globals,
        types,
        functions,
    })
}

/// Load a program from an in-memory image, including static analysis.
pub fn load_program(data: &[u8]) -> Result<Program, BytecodeError> {
    let mut cursor = io::Cursor::new(data);
    let mut program = read_program(&mut cursor)?;

    if cursor.position() != data.len() as u64 {
        return Err(BytecodeError::TrailingBytes);
    }

    static_analysis(&mut program)?;
    Ok(program)
}

/// Load a program from a bytecode file.
pub fn load_file(path: &std::path::Path) -> Result<Program, BytecodeError> {
    let data = std::fs::read(path)?;
    load_program(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    // image builders shared with the integration tests in spirit: a
    // handful of helpers writing the length-prefixed wire format

    fn string(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as u16).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    /// A program with no globals and no types, one `main()->int32`
    /// returning the constant 42.
    fn trivial_program() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // globals
        out.extend_from_slice(&0u16.to_le_bytes()); // types
        out.extend_from_slice(&1u16.to_le_bytes()); // functions
        string(&mut out, "main");
        out.extend_from_slice(&0u16.to_le_bytes()); // parameters
        out.push(5); // return type int32
        out.extend_from_slice(&1u16.to_le_bytes()); // blocks
        out.extend_from_slice(&2u16.to_le_bytes()); // instruction count
        out.extend_from_slice(&0u16.to_le_bytes()); // successors
        out.extend_from_slice(&2u16.to_le_bytes()); // instructions
        out.push(3); // const
        out.push(5); // int32
        out.extend_from_slice(&42i32.to_le_bytes());
        out.push(33); // return
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    #[test]
    fn test_load_trivial_program() {
        let program = load_program(&trivial_program()).unwrap();
        assert_eq!(program.functions.len(), 1);

        let main = &program.functions[0];
        assert_eq!(main.name, "main");
        assert_eq!(main.temporary_count, 1);
        assert_eq!(main.temporary_types.len(), 1);
        assert!(matches!(
            main.instructions[0],
            Instruction::Const { dst: 0, value: 42, .. }
        ));
    }

    #[test]
    fn test_loader_is_deterministic() {
        let image = trivial_program();
        let first = load_program(&image).unwrap();
        let second = load_program(&image).unwrap();
        assert_eq!(format!("{:?}", first), format!("{:?}", second));
    }

    #[test]
    fn test_shebang_is_skipped() {
        let mut image = b"#!/usr/bin/env basalt\n".to_vec();
        image.extend_from_slice(&trivial_program());
        let program = load_program(&image).unwrap();
        assert_eq!(program.functions[0].name, "main");
    }

    #[test]
    fn test_bad_magic() {
        let image = vec![0xAB, 0xCD];
        assert!(matches!(
            load_program(&image),
            Err(BytecodeError::InvalidMagic)
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut image = trivial_program();
        image.push(0);
        assert!(matches!(
            load_program(&image),
            Err(BytecodeError::TrailingBytes)
        ));
    }

    #[test]
    fn test_truncation_rejected() {
        let image = trivial_program();
        let truncated = &image[..image.len() - 1];
        assert!(matches!(
            load_program(truncated),
            Err(BytecodeError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        let mut image = trivial_program();
        // patch the CONST opcode into an unassigned one
        let at = image.len() - 9;
        image[at] = 77;
        assert!(matches!(
            load_program(&image),
            Err(BytecodeError::UnknownOpcode(77))
        ));
    }
}
