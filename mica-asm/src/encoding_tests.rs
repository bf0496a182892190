use rstest::rstest;
use strum::IntoEnumIterator;

use crate::*;

#[test]
fn abc_fields_round_trip() {
    let ins = Instruction::abc(OpCode::ADD, 17, from_constant(3), 211);
    assert_eq!(ins.opcode(), OpCode::ADD);
    assert_eq!(ins.a(), 17);
    assert_eq!(ins.b(), from_constant(3));
    assert_eq!(ins.c(), 211);
}

#[test]
fn abx_fields_round_trip() {
    let ins = Instruction::abx(OpCode::LOADK, MAX_A, MAX_BX);
    assert_eq!(ins.a(), MAX_A);
    assert_eq!(ins.bx(), MAX_BX);
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(-1)]
#[case(MAX_SBX)]
#[case(-MAX_SBX)]
fn sbx_round_trips(#[case] offset: i32) {
    let ins = Instruction::asbx(OpCode::JMP, 0, offset);
    assert_eq!(ins.sbx(), offset);
}

#[test]
fn sbx_zero_is_biased_to_2_pow_17() {
    let ins = Instruction::asbx(OpCode::JMP, 0, 0);
    assert_eq!(ins.bx(), 1 << 17);
}

#[test]
fn ax_uses_all_26_bits() {
    let ins = Instruction::ax(OpCode::EXTRAARG, MAX_AX);
    assert_eq!(ins.ax_field(), MAX_AX);
    assert_eq!(ins.opcode(), OpCode::EXTRAARG);
}

#[test]
fn every_opcode_survives_a_raw_round_trip() {
    for op in OpCode::iter() {
        let ins = match op.mode() {
            OpMode::Abc => Instruction::abc(op, 1, 2, 3),
            OpMode::ABx => Instruction::abx(op, 1, 2),
            OpMode::AsBx => Instruction::asbx(op, 1, -2),
            OpMode::Ax => Instruction::ax(op, 42),
        };
        let back = Instruction::try_from(ins.raw()).expect("constructed word must decode");
        assert_eq!(back, ins);
        assert_eq!(back.opcode(), op);
    }
}

#[test]
fn bytes_round_trip() {
    let ins = Instruction::abc(OpCode::TESTSET, 2, 0, 0);
    assert_eq!(Instruction::try_from(ins.to_bytes()), Ok(ins));
}

#[test]
fn unknown_opcode_bytes_are_rejected() {
    let raw = 0x3fu32; // all six opcode bits set, far past the last opcode
    assert_eq!(Instruction::try_from(raw), Err(InvalidOpcode(0x3f)));
    assert_eq!(OpCode::try_from(0x3fu8), Err(InvalidOpcode(0x3f)));
}

#[test]
fn field_rewrites_leave_neighbours_alone() {
    let mut ins = Instruction::abc(OpCode::TESTSET, 7, 12, 1);
    ins.set_a(250);
    assert_eq!((ins.opcode(), ins.b(), ins.c()), (OpCode::TESTSET, 12, 1));
    ins.set_opcode(OpCode::TEST);
    assert_eq!((ins.a(), ins.b(), ins.c()), (250, 12, 1));
    ins.set_sbx(-77);
    assert_eq!(ins.sbx(), -77);
    assert_eq!(ins.a(), 250);
}

#[rstest]
#[case(0, false)]
#[case(255, false)]
#[case(BIT_RK, true)]
#[case(BIT_RK | 255, true)]
fn rk_bit_selects_constants(#[case] rk: u32, #[case] constant: bool) {
    assert_eq!(is_constant(rk), constant);
    if constant {
        assert_eq!(from_constant(constant_index(rk)), rk);
    }
}

#[rstest]
#[case(0, 0)]
#[case(7, 7)]
#[case(8, 8)]
#[case(50, 52)]
#[case(1000, 1024)]
fn fb_encoding_rounds_up(#[case] n: u32, #[case] decoded: u32) {
    assert_eq!(fb_to_int(int_to_fb(n)), decoded);
    assert!(decoded >= n);
}

#[test]
fn fb_is_exact_on_representable_values() {
    for e in 0..20 {
        for m in 8..16 {
            let n = m << e;
            assert_eq!(fb_to_int(int_to_fb(n)), n);
        }
    }
}
