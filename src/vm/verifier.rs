//! Load-time static analysis.
//!
//! Three passes over a freshly decoded program: pack globals and struct
//! types, number the SSA temporaries (each destination index is the
//! parameter count plus the definition's ordinal), and infer a type for
//! every temporary while checking the operator typing rules.

use super::{
    BaseType, BinaryOp, BytecodeError, Function, Instruction, Program, Type,
};

/// Run all analysis passes. The program is not mutated afterwards.
pub fn static_analysis(program: &mut Program) -> Result<(), BytecodeError> {
    let mut offset = 0u16;
    for global in &mut program.globals {
        global.offset = offset;
        offset += global.size()?.bytes();
    }

    let ids: Vec<u8> = program.types.keys().copied().collect();
    for id in ids {
        program.types.get_mut(&id).unwrap().pack()?;
    }

    for function in &mut program.functions {
        count_temporaries(function);
    }

    let return_types: Vec<Type> = program.functions.iter().map(|f| f.return_type).collect();
    let mut functions = std::mem::take(&mut program.functions);
    let result = functions
        .iter_mut()
        .try_for_each(|f| assign_types(program, &return_types, f));
    program.functions = functions;
    result
}

/// Assign destination temporaries in definition order and record the
/// total count.
fn count_temporaries(function: &mut Function) {
    let mut next = function.parameters.len() as u16;

    for instruction in &mut function.instructions {
        match instruction {
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
            | Instruction::GlobLoad { dst, .. } => {
                *dst = next;
                next += 1;
            }
            Instruction::Call { dst: Some(dst), .. }
            | Instruction::Special { dst: Some(dst), .. }
            | Instruction::MemberCall { dst: Some(dst), .. } => {
                *dst = next;
                next += 1;
            }
            _ => {}
        }
    }

    function.temporary_count = next;
}

fn analysis(msg: impl Into<String>) -> BytecodeError {
    BytecodeError::Analysis(msg.into())
}

fn temp(types: &[Type], idx: u16) -> Result<Type, BytecodeError> {
    types
        .get(idx as usize)
        .copied()
        .ok_or_else(|| analysis(format!("unresolved temporary {}", idx)))
}

/// Infer the type of every temporary and check operator typing.
fn assign_types(
    program: &Program,
    return_types: &[Type],
    function: &mut Function,
) -> Result<(), BytecodeError> {
    let mut types = vec![Type::new(BaseType::Void); function.temporary_count as usize];

    for (i, parameter) in function.parameters.iter().enumerate() {
        types[i] = parameter.ty;
    }

    for instruction in &function.instructions {
        match instruction {
            Instruction::Compare { dst, lsrc, rsrc, .. } => {
                let l = temp(&types, *lsrc)?;
                let r = temp(&types, *rsrc)?;
                if l.is_array || r.is_array {
                    return Err(analysis("compare instruction is not allowed on arrays"));
                }
                if !l.matches(&r) {
                    return Err(analysis("types on compare instruction do not agree"));
                }
                types[*dst as usize] = Type::new(BaseType::Bool);
            }

            Instruction::Load { dst, src } => {
                let parameter = function
                    .parameters
                    .get(*src as usize)
                    .ok_or_else(|| analysis(format!("invalid variable index {}", src)))?;
                types[*dst as usize] = parameter.ty;
            }

            Instruction::LoadIdx { dst, array, .. } => {
                let source = temp(&types, *array)?;
                if !source.is_array {
                    return Err(analysis("type for loadIdx is not an array"));
                }
                types[*dst as usize] = Type {
                    is_array: false,
                    base_type: source.base_type,
                };
            }

            Instruction::Const { dst, ty, .. } => {
                if ty.is_array {
                    return Err(analysis("const cannot have array type"));
                }
                types[*dst as usize] = *ty;
            }

            Instruction::Binary { op, dst, lsrc, rsrc } => {
                let l = temp(&types, *lsrc)?;
                let r = temp(&types, *rsrc)?;
                if l.is_array || r.is_array {
                    return Err(analysis("binary instruction is not allowed on arrays"));
                }
                if !l.matches(&r) {
                    return Err(analysis("types on binary instruction do not agree"));
                }
                if matches!(op, BinaryOp::Mod) && !l.is_integer() {
                    return Err(analysis("mod is only defined on integers"));
                }
                types[*dst as usize] = l;
            }

            Instruction::Not { dst, src } => {
                let source = temp(&types, *src)?;
                if source.base_type != BaseType::Bool as u8 || source.is_array {
                    return Err(analysis("argument for `not` must be of type simple boolean"));
                }
                types[*dst as usize] = source;
            }

            Instruction::Neg { dst, src } => {
                let source = temp(&types, *src)?;
                if source.is_array {
                    return Err(analysis("argument for `neg` cannot have array type"));
                }
                types[*dst as usize] = source;
            }

            Instruction::Call {
                dst: Some(dst),
                function: idx,
                ..
            } => {
                let ty = return_types
                    .get(*idx as usize)
                    .ok_or_else(|| analysis(format!("call of unknown function {}", idx)))?;
                types[*dst as usize] = *ty;
            }

            Instruction::Length { dst, array } => {
                if !temp(&types, *array)?.is_array {
                    return Err(analysis("argument for `length` is not an array"));
                }
                types[*dst as usize] = Type::new(BaseType::Int32);
            }

            Instruction::New { dst, ty, .. } => {
                types[*dst as usize] = Type {
                    is_array: true,
                    base_type: ty.base_type,
                };
            }

            Instruction::Phi { dst, edges } => {
                let front = edges
                    .first()
                    .ok_or_else(|| analysis("phi node without incoming edges"))?;
                types[*dst as usize] = temp(&types, front.temp)?;
            }

            Instruction::Allocate { dst, type_id } => {
                types[*dst as usize] = Type {
                    is_array: false,
                    base_type: *type_id,
                };
            }

            Instruction::ObjLoad {
                dst,
                type_id,
                field,
                ..
            } => {
                let ty = program
                    .types
                    .get(type_id)
                    .ok_or_else(|| analysis(format!("access of unknown struct type {}", type_id)))?;
                let field_type = ty
                    .fields
                    .get(*field as usize)
                    .ok_or_else(|| analysis(format!("unknown field {} on type {}", field, type_id)))?
                    .type_id;
                types[*dst as usize] = Type {
                    is_array: field_type >> 7 != 0,
                    base_type: field_type & 0x7F,
                };
            }

            Instruction::GlobLoad { dst, global } => {
                let g = program
                    .globals
                    .get(*global as usize)
                    .ok_or_else(|| analysis(format!("access of unknown global {}", global)))?;
                types[*dst as usize] = Type {
                    is_array: false,
                    base_type: g.type_id,
                };
            }

            Instruction::MemberCall {
                dst: Some(dst),
                method,
                ptr,
                ..
            } => {
                let receiver = temp(&types, *ptr)?;
                let ty = program.types.get(&receiver.base_type).ok_or_else(|| {
                    analysis(format!(
                        "member call on non-struct type {}",
                        receiver.base_type
                    ))
                })?;
                let target = *ty
                    .v_table
                    .get(*method as usize)
                    .ok_or_else(|| analysis(format!("unknown v-table slot {}", method)))?;
                let ty = return_types
                    .get(target as usize)
                    .ok_or_else(|| analysis(format!("v-table names unknown function {}", target)))?;
                types[*dst as usize] = *ty;
            }

            // no temporary is created; Special results keep the VOID
            // default (they hold a qword)
            _ => {}
        }
    }

    function.temporary_types = types;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Block, Local};

    fn function(parameters: Vec<Local>, instructions: Vec<Instruction>) -> Function {
        Function {
            name: "test".to_string(),
            parameters,
            return_type: Type::new(BaseType::Int32),
            blocks: vec![Block {
                instruction_count: 0,
                successors: vec![],
                predecessors: vec![],
            }],
            instructions,
            temporary_count: 0,
            temporary_types: Vec::new(),
        }
    }

    fn empty_program() -> Program {
        Program {
            globals: vec![],
            types: Default::default(),
            functions: vec![],
        }
    }

    #[test]
    fn test_destination_numbering() {
        let mut f = function(
            vec![Local {
                ty: Type::new(BaseType::Int32),
                name: "a".to_string(),
            }],
            vec![
                Instruction::Const {
                    dst: 0,
                    ty: Type::new(BaseType::Int32),
                    value: 1,
                },
                Instruction::Binary {
                    op: BinaryOp::Add,
                    dst: 0,
                    lsrc: 0,
                    rsrc: 1,
                },
                Instruction::Return { src: Some(2) },
            ],
        );
        count_temporaries(&mut f);

        assert_eq!(f.temporary_count, 3);
        assert!(matches!(f.instructions[0], Instruction::Const { dst: 1, .. }));
        assert!(matches!(f.instructions[1], Instruction::Binary { dst: 2, .. }));

        let program = empty_program();
        assign_types(&program, &[], &mut f).unwrap();
        assert_eq!(f.temporary_types.len(), 3);
        assert_eq!(f.temporary_types[2].base_type, BaseType::Int32 as u8);
    }

    #[test]
    fn test_compare_requires_matching_types() {
        let mut f = function(
            vec![],
            vec![
                Instruction::Const {
                    dst: 0,
                    ty: Type::new(BaseType::Int32),
                    value: 1,
                },
                Instruction::Const {
                    dst: 0,
                    ty: Type::new(BaseType::Int64),
                    value: 1,
                },
                Instruction::Compare {
                    op: crate::vm::CompareOp::Eq,
                    dst: 0,
                    lsrc: 0,
                    rsrc: 1,
                },
            ],
        );
        count_temporaries(&mut f);
        let program = empty_program();
        assert!(assign_types(&program, &[], &mut f).is_err());
    }

    #[test]
    fn test_not_requires_bool() {
        let mut f = function(
            vec![],
            vec![
                Instruction::Const {
                    dst: 0,
                    ty: Type::new(BaseType::Int32),
                    value: 1,
                },
                Instruction::Not { dst: 0, src: 0 },
            ],
        );
        count_temporaries(&mut f);
        let program = empty_program();
        assert!(assign_types(&program, &[], &mut f).is_err());
    }

    #[test]
    fn test_compare_produces_bool() {
        let mut f = function(
            vec![],
            vec![
                Instruction::Const {
                    dst: 0,
                    ty: Type::new(BaseType::Int32),
                    value: 1,
                },
                Instruction::Const {
                    dst: 0,
                    ty: Type::new(BaseType::Int32),
                    value: 2,
                },
                Instruction::Compare {
                    op: crate::vm::CompareOp::Lt,
                    dst: 0,
                    lsrc: 0,
                    rsrc: 1,
                },
            ],
        );
        count_temporaries(&mut f);
        let program = empty_program();
        assign_types(&program, &[], &mut f).unwrap();
        assert_eq!(f.temporary_types[2].base_type, BaseType::Bool as u8);
    }
}
