//! Bytecode verifier for finished prototypes.
//!
//! The compiler debug-asserts its own output passes; loaders of dumped
//! chunks run it on untrusted input. Checks field widths against the frame
//! and pools, jump targets, instruction pairing (tests before jumps,
//! EXTRAARG after LOADKX and spilled SETLIST) and register ranges.

use mica_asm::{constant_index, is_constant, OpCode, OpMode};

use crate::error::CompileError;
use crate::object::Proto;

fn bad(pc: usize, reason: &'static str) -> CompileError {
    CompileError::InvalidBytecode { pc, reason }
}

/// Verify one prototype (children are verified on their own).
pub fn verify_proto(proto: &Proto) -> Result<(), CompileError> {
    let stack = proto.max_stack_size as u32;
    let nk = proto.constants.len() as u32;
    let nup = proto.upvalues.len() as u32;
    let len = proto.code.len();

    if len == 0 {
        return Err(bad(0, "empty code vector"));
    }
    if proto.lines.len() != len {
        return Err(bad(0, "line info out of sync with code"));
    }
    if proto.code[len - 1].opcode() != OpCode::RETURN {
        return Err(bad(len - 1, "function does not end in RETURN"));
    }

    let reg = |pc: usize, r: u32| -> Result<(), CompileError> {
        if r < stack {
            Ok(())
        } else {
            Err(bad(pc, "register out of frame"))
        }
    };
    let rk = |pc: usize, operand: u32| -> Result<(), CompileError> {
        if is_constant(operand) {
            if constant_index(operand) < nk {
                Ok(())
            } else {
                Err(bad(pc, "constant operand out of pool"))
            }
        } else if operand < stack {
            Ok(())
        } else {
            Err(bad(pc, "register operand out of frame"))
        }
    };
    let upval = |pc: usize, u: u32| -> Result<(), CompileError> {
        if u < nup {
            Ok(())
        } else {
            Err(bad(pc, "upvalue index out of range"))
        }
    };
    let jump_target = |pc: usize, sbx: i32| -> Result<usize, CompileError> {
        let target = pc as i64 + 1 + sbx as i64;
        if target < 0 || target as usize >= len {
            return Err(bad(pc, "jump target outside the function"));
        }
        let t = target as usize;
        if proto.code[t].opcode() == OpCode::EXTRAARG {
            return Err(bad(pc, "jump lands on an EXTRAARG"));
        }
        Ok(t)
    };

    // pcs consumed as the EXTRAARG of their predecessor
    let mut pending_extraarg = false;

    for pc in 0..len {
        let ins = proto.code[pc];
        let op = ins.opcode();

        if pending_extraarg {
            if op != OpCode::EXTRAARG {
                return Err(bad(pc, "missing EXTRAARG"));
            }
            pending_extraarg = false;
            continue;
        }

        if op.is_test() {
            if pc + 1 >= len || proto.code[pc + 1].opcode() != OpCode::JMP {
                return Err(bad(pc, "test not followed by JMP"));
            }
        }

        match op {
            OpCode::MOVE => {
                reg(pc, ins.a())?;
                reg(pc, ins.b())?;
            }
            OpCode::LOADK => {
                reg(pc, ins.a())?;
                if ins.bx() >= nk {
                    return Err(bad(pc, "LOADK constant out of pool"));
                }
            }
            OpCode::LOADKX => {
                reg(pc, ins.a())?;
                let Some(extra) = proto.code.get(pc + 1) else {
                    return Err(bad(pc, "LOADKX at end of code"));
                };
                if extra.opcode() != OpCode::EXTRAARG {
                    return Err(bad(pc, "LOADKX not followed by EXTRAARG"));
                }
                if extra.ax_field() >= nk {
                    return Err(bad(pc + 1, "EXTRAARG constant out of pool"));
                }
                pending_extraarg = true;
            }
            OpCode::LOADBOOL => {
                reg(pc, ins.a())?;
                if ins.b() > 1 || ins.c() > 1 {
                    return Err(bad(pc, "LOADBOOL flags out of range"));
                }
                if ins.c() == 1 && pc + 2 > len {
                    return Err(bad(pc, "LOADBOOL skips past the end"));
                }
            }
            OpCode::LOADNIL => {
                reg(pc, ins.a())?;
                reg(pc, ins.a() + ins.b())?;
            }
            OpCode::GETUPVAL => {
                reg(pc, ins.a())?;
                upval(pc, ins.b())?;
            }
            OpCode::SETUPVAL => {
                reg(pc, ins.a())?;
                upval(pc, ins.b())?;
            }
            OpCode::GETTABUP => {
                reg(pc, ins.a())?;
                upval(pc, ins.b())?;
                rk(pc, ins.c())?;
            }
            OpCode::GETTABLE => {
                reg(pc, ins.a())?;
                reg(pc, ins.b())?;
                rk(pc, ins.c())?;
            }
            OpCode::SETTABUP => {
                upval(pc, ins.a())?;
                rk(pc, ins.b())?;
                rk(pc, ins.c())?;
            }
            OpCode::SETTABLE => {
                reg(pc, ins.a())?;
                rk(pc, ins.b())?;
                rk(pc, ins.c())?;
            }
            OpCode::NEWTABLE => {
                reg(pc, ins.a())?;
            }
            OpCode::SELF => {
                reg(pc, ins.a() + 1)?;
                reg(pc, ins.b())?;
                rk(pc, ins.c())?;
            }
            OpCode::ADD
            | OpCode::SUB
            | OpCode::MUL
            | OpCode::MOD
            | OpCode::POW
            | OpCode::DIV
            | OpCode::IDIV
            | OpCode::BAND
            | OpCode::BOR
            | OpCode::BXOR
            | OpCode::SHL
            | OpCode::SHR => {
                reg(pc, ins.a())?;
                rk(pc, ins.b())?;
                rk(pc, ins.c())?;
            }
            OpCode::UNM | OpCode::BNOT | OpCode::NOT | OpCode::LEN => {
                reg(pc, ins.a())?;
                reg(pc, ins.b())?;
            }
            OpCode::CONCAT => {
                reg(pc, ins.a())?;
                reg(pc, ins.b())?;
                reg(pc, ins.c())?;
                if ins.b() > ins.c() {
                    return Err(bad(pc, "CONCAT range is inverted"));
                }
            }
            OpCode::JMP => {
                jump_target(pc, ins.sbx())?;
                if ins.a() > stack {
                    return Err(bad(pc, "JMP close level out of frame"));
                }
            }
            OpCode::EQ | OpCode::LT | OpCode::LE => {
                if ins.a() > 1 {
                    return Err(bad(pc, "comparison expects a boolean A"));
                }
                rk(pc, ins.b())?;
                rk(pc, ins.c())?;
            }
            OpCode::TEST => {
                reg(pc, ins.a())?;
                if ins.c() > 1 {
                    return Err(bad(pc, "TEST expects a boolean C"));
                }
            }
            OpCode::TESTSET => {
                reg(pc, ins.a())?;
                reg(pc, ins.b())?;
                if ins.c() > 1 {
                    return Err(bad(pc, "TESTSET expects a boolean C"));
                }
            }
            OpCode::CALL | OpCode::TAILCALL => {
                reg(pc, ins.a())?;
                let b = ins.b();
                if b > 0 && ins.a() + b > stack {
                    return Err(bad(pc, "call arguments out of frame"));
                }
                let c = ins.c();
                if c > 1 && ins.a() + c - 1 > stack {
                    return Err(bad(pc, "call results out of frame"));
                }
            }
            OpCode::RETURN => {
                let b = ins.b();
                if b > 1 {
                    reg(pc, ins.a())?;
                    if ins.a() + b - 1 > stack {
                        return Err(bad(pc, "return range out of frame"));
                    }
                }
            }
            OpCode::FORLOOP | OpCode::FORPREP => {
                reg(pc, ins.a() + 3)?;
                jump_target(pc, ins.sbx())?;
            }
            OpCode::TFORLOOP => {
                reg(pc, ins.a() + 1)?;
                jump_target(pc, ins.sbx())?;
            }
            OpCode::TFORCALL => {
                reg(pc, ins.a() + 2 + ins.c())?;
            }
            OpCode::SETLIST => {
                reg(pc, ins.a())?;
                let b = ins.b();
                if b > 0 && ins.a() + b > stack {
                    return Err(bad(pc, "SETLIST flushes past the frame"));
                }
                if ins.c() == 0 {
                    let Some(extra) = proto.code.get(pc + 1) else {
                        return Err(bad(pc, "spilled SETLIST at end of code"));
                    };
                    if extra.opcode() != OpCode::EXTRAARG {
                        return Err(bad(pc, "spilled SETLIST not followed by EXTRAARG"));
                    }
                    pending_extraarg = true;
                }
            }
            OpCode::CLOSURE => {
                reg(pc, ins.a())?;
                if ins.bx() as usize >= proto.protos.len() {
                    return Err(bad(pc, "CLOSURE prototype out of range"));
                }
            }
            OpCode::VARARG => {
                reg(pc, ins.a())?;
                let b = ins.b();
                if b > 1 && ins.a() + b - 1 > stack {
                    return Err(bad(pc, "vararg range out of frame"));
                }
            }
            OpCode::EXTRAARG => {
                return Err(bad(pc, "stray EXTRAARG"));
            }
        }

        // generic width sanity for the layouts that carry A
        if matches!(op.mode(), OpMode::Abc | OpMode::ABx | OpMode::AsBx) && op.sets_a() {
            reg(pc, ins.a())?;
        }
    }

    if pending_extraarg {
        return Err(bad(len - 1, "missing EXTRAARG"));
    }
    Ok(())
}
