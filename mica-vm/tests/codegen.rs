//! End-to-end code generation scenarios, driving the compiler exactly the
//! way the parser does.

use mica_vm::mica_asm::{from_constant, is_constant, Instruction, OpCode, MAX_SBX};
use mica_vm::{
    verify_proto, BinOp, CompileError, Compiler, ExpDesc, Heap, Proto, UnOp, Value, VmError,
};

fn compile(f: impl FnOnce(&mut Compiler) -> Result<(), VmError>) -> (Heap, Proto) {
    let mut heap = Heap::new();
    let proto = {
        let mut c = Compiler::new(&mut heap, "test").expect("fresh compiler");
        f(&mut c).expect("compilation succeeds");
        c.finish().expect("chunk closes")
    };
    let proto = heap.as_proto(proto).expect("finished prototype").clone();
    (heap, proto)
}

// `local a; local b` — one coalesced LOADNIL covering both registers.
#[test]
fn local_declarations_coalesce_into_one_loadnil() {
    let (_, proto) = compile(|c| {
        for name in ["a", "b"] {
            c.declare_local(name)?;
            let reg = c.free_reg_mark();
            c.load_nil(reg, 1)?;
            c.reserve_regs(1)?;
            c.activate_locals(1);
        }
        Ok(())
    });
    assert_eq!(
        proto.code[0],
        Instruction::abc(OpCode::LOADNIL, 0, 1, 0),
        "registers 0..1 must be initialized by a single instruction"
    );
    assert_eq!(proto.code.len(), 2); // LOADNIL + implicit RETURN
}

fn declare_locals(c: &mut Compiler, names: &[&str]) -> Result<(), VmError> {
    for name in names {
        c.declare_local(name)?;
    }
    c.reserve_regs(names.len() as u32)?;
    c.activate_locals(names.len() as u32);
    Ok(())
}

// `return a and b` with a, b in registers 0 and 1.
#[test]
fn short_circuit_and_uses_testset() {
    let (_, proto) = compile(|c| {
        declare_locals(c, &["a", "b"])?;
        let mut e = ExpDesc::local(0);
        c.infix(BinOp::And, &mut e)?;
        let mut e2 = ExpDesc::local(1);
        c.posfix(BinOp::And, &mut e, &mut e2, 1)?;
        let first = c.exp_to_any_reg(&mut e)?;
        c.ret(first, 1)?;
        Ok(())
    });
    assert_eq!(proto.code[0], Instruction::abc(OpCode::TESTSET, 2, 0, 0));
    assert_eq!(proto.code[1].opcode(), OpCode::JMP);
    assert_eq!(proto.code[1].sbx(), 1, "jump lands after the MOVE");
    assert_eq!(proto.code[2], Instruction::abc(OpCode::MOVE, 2, 1, 0));
    assert_eq!(proto.code[3], Instruction::abc(OpCode::RETURN, 2, 2, 0));
}

// `if x < 10 then y = 1 end` with x, y in registers 0 and 1.
#[test]
fn comparison_against_a_pooled_constant() {
    let (_, proto) = compile(|c| {
        declare_locals(c, &["x", "y"])?;
        let mut cond = ExpDesc::local(0);
        c.infix(BinOp::Lt, &mut cond)?;
        let mut ten = ExpDesc::int(10);
        c.posfix(BinOp::Lt, &mut cond, &mut ten, 1)?;
        c.go_if_true(&mut cond)?;
        let false_exits = cond.f;

        let var = ExpDesc::local(1);
        let mut one = ExpDesc::int(1);
        c.store_var(&var, &mut one)?;

        c.patch_to_here(false_exits)?;
        Ok(())
    });

    let lt = proto.code[0];
    assert_eq!(lt.opcode(), OpCode::LT);
    assert_eq!(lt.a(), 0, "sense negated so the false path takes the jump");
    assert_eq!(lt.b(), 0, "x sits in register 0");
    assert!(is_constant(lt.c()));
    assert_eq!(
        proto.constants[(lt.c() & !(1 << 8)) as usize],
        Value::Integer(10)
    );

    assert_eq!(proto.code[1].opcode(), OpCode::JMP);
    assert_eq!(proto.code[1].sbx(), 1, "false path jumps over the body");

    let loadk = proto.code[2];
    assert_eq!(loadk.opcode(), OpCode::LOADK);
    assert_eq!(loadk.a(), 1, "y sits in register 1");
    assert_eq!(proto.constants[loadk.bx() as usize], Value::Integer(1));

    assert_ne!(
        lt.c(),
        from_constant(loadk.bx()),
        "10 and 1 occupy distinct pool slots"
    );
}

// A 101-element constructor flushes three SETLIST blocks: 50, 50, 1.
#[test]
fn table_constructor_flushes_every_fifty_elements() {
    let (_, proto) = compile(|c| {
        let base = c.free_reg_mark();
        c.code_abc(OpCode::NEWTABLE, base, 0, 0)?;
        c.reserve_regs(1)?;
        let mut pending = 0u32;
        for i in 1..=101i64 {
            let mut e = ExpDesc::int(i);
            c.exp_to_next_reg(&mut e)?;
            pending += 1;
            if pending == 50 {
                c.set_list(base, i as u32, pending as i32)?;
                pending = 0;
            }
        }
        c.set_list(base, 101, pending as i32)?;
        Ok(())
    });
    let flushes: Vec<_> = proto
        .code
        .iter()
        .filter(|i| i.opcode() == OpCode::SETLIST)
        .map(|i| (i.a(), i.b(), i.c()))
        .collect();
    assert_eq!(flushes, vec![(0, 50, 1), (0, 50, 2), (0, 1, 3)]);
}

#[test]
fn jump_offsets_saturate_exactly_at_the_field_width() {
    let mut heap = Heap::new();
    let mut c = Compiler::new(&mut heap, "long").expect("fresh compiler");
    let j = c.jump().expect("open jump");
    for _ in 0..MAX_SBX + 1 {
        c.code_abc(OpCode::LOADNIL, 0, 0, 0).expect("filler");
    }
    // offset is target - pc - 1 = MAX_SBX: the last legal distance
    c.patch_list(j, MAX_SBX + 1).expect("maximal offset is legal");

    let mut heap = Heap::new();
    let mut c = Compiler::new(&mut heap, "too-long").expect("fresh compiler");
    let j = c.jump().expect("open jump");
    for _ in 0..MAX_SBX + 2 {
        c.code_abc(OpCode::LOADNIL, 0, 0, 0).expect("filler");
    }
    let err = c.patch_list(j, MAX_SBX + 2).expect_err("one past the field");
    assert!(matches!(err, CompileError::JumpTooLong { .. }));
}

// `not not e` on a comparison compiles exactly like `e`.
#[test]
fn double_negation_is_observably_identity() {
    fn build(negations: usize) -> Proto {
        let (_, proto) = compile(|c| {
            declare_locals(c, &["x"])?;
            let mut e = ExpDesc::local(0);
            c.infix(BinOp::Lt, &mut e)?;
            let mut zero = ExpDesc::int(0);
            c.posfix(BinOp::Lt, &mut e, &mut zero, 1)?;
            for _ in 0..negations {
                c.prefix(UnOp::Not, &mut e, 1)?;
            }
            let r = c.exp_to_any_reg(&mut e)?;
            c.ret(r, 1)?;
            Ok(())
        });
        proto
    }
    let plain = build(0);
    let double = build(2);
    assert_eq!(plain.code, double.code);
    assert_eq!(plain.constants, double.constants);

    let single = build(1);
    assert_ne!(
        plain.code, single.code,
        "a single negation must flip the test's sense"
    );
}

#[test]
fn double_negation_folds_literals() {
    let (_, _proto) = compile(|c| {
        let mut e = ExpDesc::boolean(true);
        c.prefix(UnOp::Not, &mut e, 1)?;
        assert_eq!(e, ExpDesc::boolean(false));
        c.prefix(UnOp::Not, &mut e, 1)?;
        assert_eq!(e, ExpDesc::boolean(true));
        Ok(())
    });
}

// `a .. b .. c` coalesces into one CONCAT spanning the whole chain.
#[test]
fn concat_chains_collapse_into_one_instruction() {
    let (_, proto) = compile(|c| {
        declare_locals(c, &["a", "b", "c"])?;
        let mut e1 = ExpDesc::local(0);
        c.infix(BinOp::Concat, &mut e1)?;
        let mut e2 = ExpDesc::local(1);
        c.infix(BinOp::Concat, &mut e2)?;
        let mut e3 = ExpDesc::local(2);
        c.posfix(BinOp::Concat, &mut e2, &mut e3, 1)?;
        c.posfix(BinOp::Concat, &mut e1, &mut e2, 1)?;
        let r = c.exp_to_any_reg(&mut e1)?;
        c.ret(r, 1)?;
        Ok(())
    });
    let concats: Vec<_> = proto
        .code
        .iter()
        .filter(|i| i.opcode() == OpCode::CONCAT)
        .collect();
    assert_eq!(concats.len(), 1);
    assert_eq!((concats[0].b(), concats[0].c()), (3, 5));
}

#[test]
fn arithmetic_on_literals_folds_at_compile_time() {
    let (_, proto) = compile(|c| {
        let mut e1 = ExpDesc::int(2);
        c.infix(BinOp::Add, &mut e1)?;
        let mut e2 = ExpDesc::int(3);
        c.posfix(BinOp::Add, &mut e1, &mut e2, 1)?;
        let r = c.exp_to_any_reg(&mut e1)?;
        c.ret(r, 1)?;
        Ok(())
    });
    assert!(
        proto.code.iter().all(|i| i.opcode() != OpCode::ADD),
        "2 + 3 must not survive to runtime"
    );
    assert_eq!(proto.constants, vec![Value::Integer(5)]);
}

#[test]
fn nested_functions_produce_closure_instructions() {
    let (heap, proto) = compile(|c| {
        c.begin_function(0, false);
        let mut body = ExpDesc::int(7);
        let r = c.exp_to_any_reg(&mut body)?;
        c.ret(r, 1)?;
        let mut closure = c.end_function()?;
        let r = c.exp_to_any_reg(&mut closure)?;
        c.ret(r, 1)?;
        Ok(())
    });
    assert_eq!(proto.protos.len(), 1);
    assert_eq!(proto.code[0].opcode(), OpCode::CLOSURE);
    let child = heap.as_proto(proto.protos[0]).expect("child prototype");
    assert!(verify_proto(child).is_ok());
}

#[test]
fn every_emitted_prototype_passes_the_verifier() {
    let (_, proto) = compile(|c| {
        declare_locals(c, &["x", "y"])?;
        let mut e = ExpDesc::local(0);
        c.infix(BinOp::Mul, &mut e)?;
        let mut e2 = ExpDesc::local(1);
        c.posfix(BinOp::Mul, &mut e, &mut e2, 1)?;
        let r = c.exp_to_any_reg(&mut e)?;
        c.ret(r, 1)?;
        Ok(())
    });
    assert!(verify_proto(&proto).is_ok());
    for ins in &proto.code {
        let op = ins.opcode();
        if op.sets_a() {
            assert!(ins.a() < proto.max_stack_size as u32);
        }
    }
}

#[test]
fn verifier_rejects_corrupted_prototypes() {
    let (_, good) = compile(|c| {
        declare_locals(c, &["x"])?;
        let mut e = ExpDesc::local(0);
        let r = c.exp_to_any_reg(&mut e)?;
        c.ret(r, 1)?;
        Ok(())
    });

    let mut out_of_frame = good.clone();
    out_of_frame.code[0] = Instruction::abc(OpCode::MOVE, 200, 0, 0);
    assert!(verify_proto(&out_of_frame).is_err());

    let mut bad_jump = good.clone();
    bad_jump.code[0] = Instruction::asbx(OpCode::JMP, 0, 1000);
    assert!(verify_proto(&bad_jump).is_err());

    let mut bad_constant = good.clone();
    bad_constant.code[0] = Instruction::abx(OpCode::LOADK, 0, 99);
    assert!(verify_proto(&bad_constant).is_err());

    let mut dangling_loadkx = good.clone();
    dangling_loadkx.code[0] = Instruction::abx(OpCode::LOADKX, 0, 0);
    assert!(
        verify_proto(&dangling_loadkx).is_err(),
        "LOADKX must always be followed by EXTRAARG"
    );

    let mut no_return = good;
    let last = no_return.code.len() - 1;
    no_return.code[last] = Instruction::abc(OpCode::MOVE, 0, 0, 0);
    assert!(verify_proto(&no_return).is_err());
}

#[test]
fn method_call_prep_reserves_function_and_receiver() {
    let (_, proto) = compile(|c| {
        declare_locals(c, &["obj"])?;
        let mut e = ExpDesc::local(0);
        let mut key = c.string_exp("update")?;
        c.op_self(&mut e, &mut key)?;
        let base = match e {
            ExpDesc { kind: mica_vm::ExpKind::NonReloc(r), .. } => r,
            other => panic!("SELF leaves a fixed base register, got {other:?}"),
        };
        let mut call = c.call_exp(base, 1)?;
        c.set_one_result(&mut call);
        let r = c.exp_to_any_reg(&mut call)?;
        c.ret(r, 1)?;
        Ok(())
    });
    let this = proto.code[0];
    assert_eq!(this.opcode(), OpCode::SELF);
    assert_eq!(this.a(), 1, "base lands above the local");
    assert_eq!(this.b(), 0, "receiver read from register 0");
    assert!(is_constant(this.c()), "method name comes from the pool");
}
