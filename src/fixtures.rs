//! Bytecode image builders for tests and benches.
//!
//! These write the binary wire format directly, so tests exercise the
//! loader on the same bytes an external producer would emit.

use crate::vm::MAGIC;

fn w16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn wstr(out: &mut Vec<u8>, s: &str) {
    w16(out, s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

/// Builds one function body; blocks and instructions are appended in
/// order.
pub struct FnBuilder {
    name: String,
    params: Vec<(u8, String)>,
    ret: u8,
    blocks: Vec<(u16, Vec<u16>)>,
    code: Vec<u8>,
    instructions: u16,
}

impl FnBuilder {
    pub fn new(name: &str, ret: u8) -> Self {
        FnBuilder {
            name: name.to_string(),
            params: Vec::new(),
            ret,
            blocks: Vec::new(),
            code: Vec::new(),
            instructions: 0,
        }
    }

    pub fn param(mut self, type_byte: u8, name: &str) -> Self {
        self.params.push((type_byte, name.to_string()));
        self
    }

    /// Open a new block with the given successor list. Instructions
    /// emitted afterwards belong to it.
    pub fn block(&mut self, successors: &[u16]) -> &mut Self {
        self.blocks.push((0, successors.to_vec()));
        self
    }

    fn op(&mut self, opcode: u8) -> &mut Self {
        assert!(!self.blocks.is_empty(), "no block opened");
        self.blocks.last_mut().unwrap().0 += 1;
        self.instructions += 1;
        self.code.push(opcode);
        self
    }

    pub fn const_i32(&mut self, value: i32) -> &mut Self {
        self.op(3);
        self.code.push(5);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn const_i64(&mut self, value: i64) -> &mut Self {
        self.op(3);
        self.code.push(6);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn const_f64(&mut self, value: f64) -> &mut Self {
        self.op(3);
        self.code.push(8);
        self.code.extend_from_slice(&value.to_bits().to_le_bytes());
        self
    }

    pub fn const_bool(&mut self, value: bool) -> &mut Self {
        self.op(3);
        self.code.push(1);
        self.code.push(value as u8);
        self
    }

    fn binary(&mut self, opcode: u8, lsrc: u16, rsrc: u16) -> &mut Self {
        self.op(opcode);
        w16(&mut self.code, lsrc);
        w16(&mut self.code, rsrc);
        self
    }

    pub fn add(&mut self, l: u16, r: u16) -> &mut Self {
        self.binary(4, l, r)
    }

    pub fn sub(&mut self, l: u16, r: u16) -> &mut Self {
        self.binary(5, l, r)
    }

    pub fn mul(&mut self, l: u16, r: u16) -> &mut Self {
        self.binary(6, l, r)
    }

    pub fn div(&mut self, l: u16, r: u16) -> &mut Self {
        self.binary(7, l, r)
    }

    pub fn modulo(&mut self, l: u16, r: u16) -> &mut Self {
        self.binary(8, l, r)
    }

    pub fn cmp_eq(&mut self, l: u16, r: u16) -> &mut Self {
        self.binary(12, l, r)
    }

    pub fn cmp_lt(&mut self, l: u16, r: u16) -> &mut Self {
        self.binary(15, l, r)
    }

    pub fn neg(&mut self, src: u16) -> &mut Self {
        self.op(9);
        w16(&mut self.code, src);
        self
    }

    pub fn not(&mut self, src: u16) -> &mut Self {
        self.op(20);
        w16(&mut self.code, src);
        self
    }

    pub fn new_array(&mut self, base_type: u8, count: u16) -> &mut Self {
        self.op(21);
        self.code.push(base_type);
        w16(&mut self.code, count);
        self
    }

    pub fn goto(&mut self, block: u16) -> &mut Self {
        self.op(22);
        w16(&mut self.code, block);
        self
    }

    pub fn if_goto(&mut self, cond: u16, block: u16) -> &mut Self {
        self.op(23);
        w16(&mut self.code, cond);
        w16(&mut self.code, block);
        self
    }

    pub fn length(&mut self, array: u16) -> &mut Self {
        self.op(25);
        w16(&mut self.code, array);
        self
    }

    pub fn phi(&mut self, edges: &[(u16, u16)]) -> &mut Self {
        self.op(26);
        w16(&mut self.code, edges.len() as u16);
        for (temp, block) in edges {
            w16(&mut self.code, *temp);
            w16(&mut self.code, *block);
        }
        self
    }

    fn call_like(&mut self, opcode: u8, idx: u16, args: &[u16], byte_idx: bool) -> &mut Self {
        self.op(opcode);
        if byte_idx {
            self.code.push(idx as u8);
        } else {
            w16(&mut self.code, idx);
        }
        w16(&mut self.code, args.len() as u16);
        for arg in args {
            w16(&mut self.code, *arg);
        }
        self
    }

    pub fn call(&mut self, function: u16, args: &[u16]) -> &mut Self {
        self.call_like(28, function, args, false)
    }

    pub fn call_void(&mut self, function: u16, args: &[u16]) -> &mut Self {
        self.call_like(30, function, args, false)
    }

    pub fn special_void(&mut self, builtin: u8, args: &[u16]) -> &mut Self {
        self.call_like(31, builtin as u16, args, true)
    }

    pub fn member_call(&mut self, method: u8, args: &[u16]) -> &mut Self {
        self.call_like(106, method as u16, args, true)
    }

    pub fn ret(&mut self, src: u16) -> &mut Self {
        self.op(33);
        w16(&mut self.code, src);
        self
    }

    pub fn ret_void(&mut self) -> &mut Self {
        self.op(32);
        self
    }

    pub fn allocate(&mut self, type_id: u8) -> &mut Self {
        self.op(100);
        self.code.push(type_id);
        self
    }

    pub fn obj_load(&mut self, ptr: u16, type_id: u8, field: u8) -> &mut Self {
        self.op(101);
        w16(&mut self.code, ptr);
        self.code.push(type_id);
        self.code.push(field);
        self
    }

    pub fn obj_store(&mut self, ptr: u16, type_id: u8, field: u8, value: u16) -> &mut Self {
        self.op(102);
        w16(&mut self.code, ptr);
        self.code.push(type_id);
        self.code.push(field);
        w16(&mut self.code, value);
        self
    }

    pub fn glob_load(&mut self, global: u16) -> &mut Self {
        self.op(103);
        w16(&mut self.code, global);
        self
    }

    pub fn glob_store(&mut self, global: u16, value: u16) -> &mut Self {
        self.op(104);
        w16(&mut self.code, global);
        w16(&mut self.code, value);
        self
    }

    pub fn load_idx(&mut self, array: u16, index: u16) -> &mut Self {
        self.op(129);
        w16(&mut self.code, array);
        w16(&mut self.code, index);
        self
    }

    pub fn store_idx(&mut self, array: u16, index: u16, value: u16) -> &mut Self {
        self.op(130);
        w16(&mut self.code, array);
        w16(&mut self.code, index);
        w16(&mut self.code, value);
        self
    }

    fn write(&self, out: &mut Vec<u8>) {
        wstr(out, &self.name);
        w16(out, self.params.len() as u16);
        for (ty, name) in &self.params {
            out.push(*ty);
            wstr(out, name);
        }
        out.push(self.ret);
        w16(out, self.blocks.len() as u16);
        for (count, successors) in &self.blocks {
            w16(out, *count);
            w16(out, successors.len() as u16);
            for s in successors {
                w16(out, *s);
            }
        }
        w16(out, self.instructions);
        out.extend_from_slice(&self.code);
    }
}

/// Builds a whole program image.
#[derive(Default)]
pub struct ProgramBuilder {
    globals: Vec<(u8, String)>,
    types: Vec<(u8, String, Vec<(u8, String)>, Vec<u16>)>,
    functions: Vec<FnBuilder>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global(mut self, type_id: u8, name: &str) -> Self {
        self.globals.push((type_id, name.to_string()));
        self
    }

    pub fn struct_type(
        mut self,
        id: u8,
        name: &str,
        fields: &[(u8, &str)],
        v_table: &[u16],
    ) -> Self {
        self.types.push((
            id,
            name.to_string(),
            fields.iter().map(|(t, n)| (*t, n.to_string())).collect(),
            v_table.to_vec(),
        ));
        self
    }

    pub fn function(mut self, f: FnBuilder) -> Self {
        self.functions.push(f);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        w16(&mut out, MAGIC);

        w16(&mut out, self.globals.len() as u16);
        for (ty, name) in &self.globals {
            out.push(*ty);
            wstr(&mut out, name);
        }

        w16(&mut out, self.types.len() as u16);
        for (id, name, fields, v_table) in &self.types {
            out.push(*id);
            wstr(&mut out, name);
            w16(&mut out, fields.len() as u16);
            for (ty, fname) in fields {
                out.push(*ty);
                wstr(&mut out, fname);
            }
            w16(&mut out, v_table.len() as u16);
            for entry in v_table {
                w16(&mut out, *entry);
            }
        }

        w16(&mut out, self.functions.len() as u16);
        for f in &self.functions {
            f.write(&mut out);
        }

        out
    }
}

/// `main()->int32 { return <value> }`
pub fn trivial_return(value: i32) -> Vec<u8> {
    let mut main = FnBuilder::new("main", 5);
    main.block(&[]);
    main.const_i32(value).ret(0);
    ProgramBuilder::new().function(main).build()
}

/// Scenario "loop sum": sums 0..10 with a phi-carried loop, returns 45.
///
/// temporaries: 0 = zero, 1 = i-phi, 2 = s-phi, 3 = ten, 4 = cond,
/// 5 = s', 6 = one, 7 = i'
pub fn loop_sum() -> Vec<u8> {
    let mut main = FnBuilder::new("main", 5);
    main.block(&[1]);
    main.const_i32(0).goto(1);
    main.block(&[2, 3]);
    main.phi(&[(0, 0), (7, 2)]) // i
        .phi(&[(0, 0), (5, 2)]) // s
        .const_i32(10)
        .cmp_eq(1, 3)
        .if_goto(4, 3);
    main.block(&[1]);
    main.add(2, 1) // s + i
        .const_i32(1)
        .add(1, 6) // i + 1
        .goto(1);
    main.block(&[]);
    main.ret(2);
    ProgramBuilder::new().function(main).build()
}

/// `(20 - 8) * 3 / 2 % 7 = 4`
pub fn arithmetic() -> Vec<u8> {
    let mut main = FnBuilder::new("main", 5);
    main.block(&[]);
    main.const_i32(20) // 0
        .const_i32(8) // 1
        .sub(0, 1) // 2
        .const_i32(3) // 3
        .mul(2, 3) // 4
        .const_i32(2) // 5
        .div(4, 5) // 6
        .const_i32(7) // 7
        .modulo(6, 7) // 8
        .ret(8);
    ProgramBuilder::new().function(main).build()
}

/// `main()->int32 { return addup(5, 7) }` where `addup(a, b) = a + b`.
pub fn call_chain() -> Vec<u8> {
    let mut main = FnBuilder::new("main", 5);
    main.block(&[]);
    main.const_i32(5).const_i32(7).call(1, &[0, 1]).ret(2);

    let mut addup = FnBuilder::new("addup", 5).param(5, "a").param(5, "b");
    addup.block(&[]);
    addup.add(0, 1).ret(2);

    ProgramBuilder::new().function(main).function(addup).build()
}

/// Scenario "polymorphic call": structs `A` and `B` whose v-table slot 0
/// returns 1 and 2 respectively; main allocates both and sums the
/// virtual results.
pub fn polymorphic_call() -> Vec<u8> {
    let mut main = FnBuilder::new("main", 5);
    main.block(&[]);
    main.allocate(9) // 0: A
        .allocate(10) // 1: B
        .member_call(0, &[0]) // 2
        .member_call(0, &[1]) // 3
        .add(2, 3) // 4
        .ret(4);

    let mut one = FnBuilder::new("a_method", 5).param(9, "this");
    one.block(&[]);
    one.const_i32(1).ret(1);

    let mut two = FnBuilder::new("b_method", 5).param(10, "this");
    two.block(&[]);
    two.const_i32(2).ret(1);

    ProgramBuilder::new()
        .struct_type(9, "A", &[], &[1])
        .struct_type(10, "B", &[], &[2])
        .function(main)
        .function(one)
        .function(two)
        .build()
}

/// Allocates a 4-element int32 array, stores 1..4, reloads and sums:
/// returns 10.
pub fn array_fill_sum() -> Vec<u8> {
    let mut main = FnBuilder::new("main", 5);
    main.block(&[]);
    main.const_i32(4) // 0
        .new_array(5, 0) // 1: array
        .const_i32(0) // 2
        .const_i32(1) // 3
        .store_idx(1, 2, 3)
        .const_i32(1) // 4
        .const_i32(2) // 5
        .store_idx(1, 4, 5)
        .const_i32(2) // 6
        .const_i32(3) // 7
        .store_idx(1, 6, 7)
        .const_i32(3) // 8
        .const_i32(4) // 9
        .store_idx(1, 8, 9)
        .load_idx(1, 2) // 10
        .load_idx(1, 4) // 11
        .load_idx(1, 6) // 12
        .load_idx(1, 8) // 13
        .add(10, 11) // 14
        .add(14, 12) // 15
        .add(15, 13) // 16
        .ret(16);
    ProgramBuilder::new().function(main).build()
}

/// Scenario "array length": `grab(a: int32[])->int32 = length(a)`,
/// main allocates seven elements and calls it.
pub fn array_length() -> Vec<u8> {
    let mut main = FnBuilder::new("main", 5);
    main.block(&[]);
    main.const_i32(7) // 0
        .new_array(5, 0) // 1
        .call(1, &[1]) // 2
        .ret(2);

    let mut grab = FnBuilder::new("grab", 5).param(0x80 | 5, "a");
    grab.block(&[]);
    grab.length(0).ret(1);

    ProgramBuilder::new().function(main).function(grab).build()
}

/// Stores a constant into global 0 and reads it back.
pub fn global_roundtrip(value: i32) -> Vec<u8> {
    let mut main = FnBuilder::new("main", 5);
    main.block(&[]);
    main.const_i32(value).glob_store(0, 0).glob_load(0).ret(1);
    ProgramBuilder::new()
        .global(5, "counter")
        .function(main)
        .build()
}

/// Scenario "register pressure": `sink` takes twelve parameters, stores
/// each into global 0, and returns the first.
pub fn register_pressure() -> Vec<u8> {
    let mut main = FnBuilder::new("main", 5);
    main.block(&[]);
    for i in 1..=12 {
        main.const_i32(i);
    }
    let args: Vec<u16> = (0..12).collect();
    main.call(1, &args).ret(12);

    let mut sink = FnBuilder::new("sink", 5);
    for i in 0..12 {
        sink = sink.param(5, &format!("p{}", i));
    }
    sink.block(&[]);
    for i in 0..12 {
        sink.glob_store(0, i);
    }
    sink.ret(0);

    ProgramBuilder::new()
        .global(5, "g")
        .function(main)
        .function(sink)
        .build()
}

/// Eighteen simultaneously live constants, summed afterwards; forces
/// spilling on fourteen allocatable registers. Returns 171.
pub fn spill_pressure() -> Vec<u8> {
    let mut main = FnBuilder::new("main", 5);
    main.block(&[]);
    for i in 1..=18 {
        main.const_i32(i);
    }
    main.add(0, 1); // 18
    for i in 2..18 {
        let prev = 16 + i;
        main.add(prev, i);
    }
    main.ret(34);
    ProgramBuilder::new().function(main).build()
}

/// Scenario "float divide": prints 6.0 / 4.0 via the runtime double
/// printer and returns 0.
pub fn float_divide() -> Vec<u8> {
    let mut main = FnBuilder::new("main", 5);
    main.block(&[]);
    main.const_f64(6.0) // 0
        .const_f64(4.0) // 1
        .div(0, 1) // 2
        .special_void(4, &[2])
        .const_i32(0) // 3
        .ret(3);
    ProgramBuilder::new().function(main).build()
}

/// Object field traffic: a struct with int32 and int64 fields written
/// and read back; returns 30.
pub fn object_fields() -> Vec<u8> {
    let mut main = FnBuilder::new("main", 5);
    main.block(&[]);
    main.allocate(9) // 0
        .const_i32(10) // 1
        .obj_store(0, 9, 0, 1)
        .const_i64(20) // 2
        .obj_store(0, 9, 1, 2)
        .obj_load(0, 9, 0) // 3
        .obj_load(0, 9, 1) // 4: int64
        .call(1, &[3, 4]) // 5
        .ret(5);

    // mixed-width add needs matching types, so sum in a helper taking
    // int32 and int64 and widening via a second field store
    let mut widen = FnBuilder::new("widen", 5).param(5, "a").param(6, "b");
    widen.block(&[]);
    widen
        .allocate(9)
        .obj_store(2, 9, 0, 0) // store a
        .obj_load(2, 9, 0) // 3
        .const_i64(0) // 4
        .add(1, 4) // 5: b + 0
        .allocate(9) // 6
        .obj_store(6, 9, 1, 5)
        .obj_load(6, 9, 1) // 7
        .call(2, &[3, 7]) // 8
        .ret(8);

    // final narrow add: int32 + int64 is a type error, so convert by
    // truncating store into an int32 field
    let mut narrow = FnBuilder::new("narrow", 5).param(5, "a").param(6, "b");
    narrow.block(&[]);
    narrow
        .allocate(9)
        .obj_store(2, 9, 0, 1) // truncating store of b into int32 field
        .obj_load(2, 9, 0) // 3
        .add(0, 3) // 4
        .ret(4);

    ProgramBuilder::new()
        .struct_type(9, "box", &[(5, "narrow"), (6, "wide")], &[])
        .function(main)
        .function(widen)
        .function(narrow)
        .build()
}
