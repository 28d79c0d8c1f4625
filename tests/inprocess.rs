//! In-process integration tests over the library API.

use basalt::vm::{load_program, BytecodeError};
use basalt::{fixtures, InterpretEngine, JitEngine, Options};

fn interpret(image: &[u8]) -> i32 {
    let program = load_program(image).unwrap();
    let mut engine = InterpretEngine::new(program, Options::default());
    engine.execute().unwrap()
}

fn jit(image: &[u8]) -> i64 {
    let program = load_program(image).unwrap();
    let mut engine = JitEngine::new(program, Options::default()).unwrap();
    engine.execute().unwrap()
}

#[test]
fn test_backends_agree_on_every_fixture() {
    for image in [
        fixtures::trivial_return(13),
        fixtures::arithmetic(),
        fixtures::loop_sum(),
        fixtures::call_chain(),
        fixtures::array_length(),
        fixtures::array_fill_sum(),
        fixtures::polymorphic_call(),
        fixtures::global_roundtrip(99),
        fixtures::object_fields(),
        fixtures::register_pressure(),
        fixtures::spill_pressure(),
        fixtures::float_divide(),
    ] {
        assert_eq!(interpret(&image) as i64, jit(&image));
    }
}

#[test]
fn test_loader_is_deterministic_on_well_formed_input() {
    let image = fixtures::polymorphic_call();
    let first = load_program(&image).unwrap();
    let second = load_program(&image).unwrap();
    assert_eq!(format!("{:?}", first), format!("{:?}", second));
}

#[test]
fn test_temporary_numbering_property() {
    // every function's type table covers parameters plus definitions,
    // and destinations are assigned in definition order
    let program = load_program(&fixtures::polymorphic_call()).unwrap();
    for function in &program.functions {
        let definitions = function
            .instructions
            .iter()
            .filter(|i| i.dst_idx().is_some())
            .count();
        assert_eq!(
            function.temporary_types.len(),
            function.parameters.len() + definitions
        );

        let mut expected = function.parameters.len() as u16;
        for instruction in &function.instructions {
            if let Some(dst) = instruction.dst_idx() {
                assert_eq!(dst, expected);
                expected += 1;
            }
        }
    }
}

#[test]
fn test_struct_sizes_are_packed() {
    let program = load_program(&fixtures::object_fields()).unwrap();
    let ty = &program.types[&9];
    // v-table pointer + int32 + int64
    assert_eq!(ty.size().unwrap(), 8 + 4 + 8);
    assert_eq!(ty.field_offset(0).unwrap(), 8);
    assert_eq!(ty.field_offset(1).unwrap(), 12);
}

#[test]
fn test_malformed_inputs_are_rejected() {
    assert!(matches!(
        load_program(&[0xAA, 0x06, 0x00]),
        Err(BytecodeError::UnexpectedEof) | Err(BytecodeError::TrailingBytes)
    ));

    let mut trailing = fixtures::trivial_return(1);
    trailing.extend_from_slice(&[1, 2, 3]);
    assert!(matches!(
        load_program(&trailing),
        Err(BytecodeError::TrailingBytes)
    ));
}

#[test]
fn test_compiling_twice_yields_the_same_address() {
    let program = load_program(&fixtures::call_chain()).unwrap();
    let mut engine = JitEngine::new(program, Options::default()).unwrap();
    let first = engine.compile(1).unwrap();
    let second = engine.compile(1).unwrap();
    assert_eq!(first, second);
}
