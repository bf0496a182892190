//! Operator compilation: arithmetic, comparisons and the short-circuit
//! boolean machinery.
//!
//! `and`/`or` and comparisons do not reduce to value-producing arithmetic;
//! they reduce to jumps accumulated on the descriptor's truelist and
//! falselist and resolved by the surrounding context.

use mica_asm::{from_constant, OpCode, NO_REG};

use super::expr::{ExpDesc, ExpKind};
use super::fold::{fold_binary, fold_unary};
use super::jump::NO_JUMP;
use super::Compiler;
use crate::error::CompileError;

/// Binary operators, in the parser's terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `%`
    Mod,
    /// `^`
    Pow,
    /// `/`
    Div,
    /// `//`
    IDiv,
    /// `&`
    BAnd,
    /// `|`
    BOr,
    /// `~`
    BXor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `..`
    Concat,
    /// `==`
    Eq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `~=`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `and`
    And,
    /// `or`
    Or,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    /// `-`
    Minus,
    /// `~`
    BNot,
    /// `not`
    Not,
    /// `#`
    Len,
}

fn arith_opcode(op: BinOp) -> OpCode {
    match op {
        BinOp::Add => OpCode::ADD,
        BinOp::Sub => OpCode::SUB,
        BinOp::Mul => OpCode::MUL,
        BinOp::Mod => OpCode::MOD,
        BinOp::Pow => OpCode::POW,
        BinOp::Div => OpCode::DIV,
        BinOp::IDiv => OpCode::IDIV,
        BinOp::BAnd => OpCode::BAND,
        BinOp::BOr => OpCode::BOR,
        BinOp::BXor => OpCode::BXOR,
        BinOp::Shl => OpCode::SHL,
        BinOp::Shr => OpCode::SHR,
        _ => unreachable!("not an arithmetic operator"),
    }
}

impl Compiler<'_> {
    // Emit a test instruction followed by its jump; the pair is one unit.
    fn cond_jump(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> Result<i32, CompileError> {
        self.code_abc(op, a, b, c)?;
        self.jump()
    }

    // Flip the expected-boolean field of the comparison controlling a VJMP.
    fn negate_condition_at(&mut self, pc: i32) {
        let control = self.jump_control_pc(pc);
        let ins = self.instruction_at_mut(control);
        debug_assert!(
            ins.opcode().is_test() && !matches!(ins.opcode(), OpCode::TEST | OpCode::TESTSET)
        );
        let a = ins.a();
        ins.set_a((a == 0) as u32);
    }

    // Emit a test on a register value; a TESTSET so a later patch can still
    // route the tested value into a destination register.
    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool) -> Result<i32, CompileError> {
        if let ExpKind::Reloc(pc) = e.kind {
            let ie = self.instruction_at(pc);
            if ie.opcode() == OpCode::NOT {
                // remove the NOT and test its operand with inverted sense
                let fs = self.fs();
                fs.proto.code.pop();
                fs.proto.lines.pop();
                return self.cond_jump(OpCode::TEST, ie.b(), 0, !cond as u32);
            }
        }
        self.discharge_to_any_reg(e)?;
        self.free_exp(e);
        let r = match e.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!("discharged expression sits in a register"),
        };
        self.cond_jump(OpCode::TESTSET, NO_REG, r, cond as u32)
    }

    /// Compile "continue if `e` is true, else jump": false exits accumulate
    /// on the falselist, pending true exits land here.
    pub fn go_if_true(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExpKind::Jump(info) => {
                // the test itself must jump when the value is false
                self.negate_condition_at(info);
                info
            }
            ExpKind::Const(_) | ExpKind::Int(_) | ExpKind::Float(_) | ExpKind::True => NO_JUMP,
            _ => self.jump_on_cond(e, false)?,
        };
        self.concat_jump(&mut e.f, pc)?;
        self.patch_to_here(e.t)?;
        e.t = NO_JUMP;
        Ok(())
    }

    /// Compile "continue if `e` is false, else jump".
    pub fn go_if_false(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExpKind::Jump(info) => info,
            ExpKind::Nil | ExpKind::False => NO_JUMP,
            _ => self.jump_on_cond(e, true)?,
        };
        self.concat_jump(&mut e.t, pc)?;
        self.patch_to_here(e.f)?;
        e.f = NO_JUMP;
        Ok(())
    }

    // `not e`: constant-fold, negate a test in place, or emit NOT. The
    // lists swap and lose their value-producing sides.
    fn code_not(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        match e.kind {
            ExpKind::Nil | ExpKind::False => e.kind = ExpKind::True,
            ExpKind::Const(_) | ExpKind::Int(_) | ExpKind::Float(_) | ExpKind::True => {
                e.kind = ExpKind::False;
            }
            ExpKind::Jump(pc) => self.negate_condition_at(pc),
            ExpKind::Reloc(_) | ExpKind::NonReloc(_) => {
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                let r = match e.kind {
                    ExpKind::NonReloc(r) => r,
                    _ => unreachable!(),
                };
                let pc = self.code_abc(OpCode::NOT, 0, r, 0)?;
                e.kind = ExpKind::Reloc(pc as i32);
            }
            _ => unreachable!("variables were discharged"),
        }
        std::mem::swap(&mut e.t, &mut e.f);
        // traversed values are no longer needed by either exit
        self.remove_values(e.f);
        self.remove_values(e.t);
        Ok(())
    }

    fn code_unary(&mut self, op: OpCode, e: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        let r = self.exp_to_any_reg(e)?;
        self.free_exp(e);
        let pc = self.code_abc(op, 0, r, 0)?;
        e.kind = ExpKind::Reloc(pc as i32);
        self.fix_line(line);
        Ok(())
    }

    fn code_binary(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let rk2 = self.exp_to_rk(e2)?;
        let rk1 = self.exp_to_rk(e1)?;
        self.free_exps(e1, e2);
        let pc = self.code_abc(op, 0, rk1, rk2)?;
        e1.kind = ExpKind::Reloc(pc as i32);
        self.fix_line(line);
        Ok(())
    }

    // Comparisons produce a JMP descriptor. `~=`, `>`, `>=` rewrite through
    // the equivalences a~=b == not(a==b), a>b == b<a, a>=b == b<=a.
    fn code_comparison(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        let rk1 = match e1.kind {
            ExpKind::Const(k) => from_constant(k),
            ExpKind::NonReloc(r) => r,
            _ => unreachable!("infix committed the first operand to R/K"),
        };
        let rk2 = self.exp_to_rk(e2)?;
        self.free_exps(e1, e2);
        let pc = match op {
            BinOp::Ne => self.cond_jump(OpCode::EQ, 0, rk1, rk2)?,
            BinOp::Gt => self.cond_jump(OpCode::LT, 1, rk2, rk1)?,
            BinOp::Ge => self.cond_jump(OpCode::LE, 1, rk2, rk1)?,
            BinOp::Eq => self.cond_jump(OpCode::EQ, 1, rk1, rk2)?,
            BinOp::Lt => self.cond_jump(OpCode::LT, 1, rk1, rk2)?,
            BinOp::Le => self.cond_jump(OpCode::LE, 1, rk1, rk2)?,
            _ => unreachable!("not a comparison"),
        };
        e1.kind = ExpKind::Jump(pc);
        Ok(())
    }

    /// Apply a unary operator.
    pub fn prefix(&mut self, op: UnOp, e: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        match op {
            UnOp::Minus | UnOp::BNot => {
                if !e.has_jumps() {
                    if let Some(folded) = fold_unary(op, e.kind) {
                        e.kind = folded;
                        return Ok(());
                    }
                }
                let opcode = if op == UnOp::Minus {
                    OpCode::UNM
                } else {
                    OpCode::BNOT
                };
                self.code_unary(opcode, e, line)
            }
            UnOp::Len => self.code_unary(OpCode::LEN, e, line),
            UnOp::Not => self.code_not(e),
        }
    }

    /// Prepare the first operand between parsing the two: commits it far
    /// enough that the second operand parses in a well-defined state.
    pub fn infix(&mut self, op: BinOp, e: &mut ExpDesc) -> Result<(), CompileError> {
        match op {
            BinOp::And => self.go_if_true(e),
            BinOp::Or => self.go_if_false(e),
            BinOp::Concat => self.exp_to_next_reg(e),
            BinOp::Add
            | BinOp::Sub
            | BinOp::Mul
            | BinOp::Mod
            | BinOp::Pow
            | BinOp::Div
            | BinOp::IDiv
            | BinOp::BAnd
            | BinOp::BOr
            | BinOp::BXor
            | BinOp::Shl
            | BinOp::Shr => {
                // keep numerals for folding in posfix
                if !e.is_numeral() {
                    self.exp_to_rk(e)?;
                }
                Ok(())
            }
            BinOp::Eq | BinOp::Lt | BinOp::Le | BinOp::Ne | BinOp::Gt | BinOp::Ge => {
                self.exp_to_rk(e)?;
                Ok(())
            }
        }
    }

    /// Finish a binary operator once both operands are parsed.
    pub fn posfix(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        match op {
            BinOp::And => {
                debug_assert_eq!(e1.t, NO_JUMP, "closed by infix");
                self.discharge_vars(e2)?;
                self.concat_jump(&mut e2.f, e1.f)?;
                *e1 = *e2;
                Ok(())
            }
            BinOp::Or => {
                debug_assert_eq!(e1.f, NO_JUMP, "closed by infix");
                self.discharge_vars(e2)?;
                self.concat_jump(&mut e2.t, e1.t)?;
                *e1 = *e2;
                Ok(())
            }
            BinOp::Concat => {
                self.exp_to_val(e2)?;
                let coalesce = match e2.kind {
                    ExpKind::Reloc(pc) => {
                        let ins = self.instruction_at(pc);
                        (ins.opcode() == OpCode::CONCAT).then_some((pc, ins.b()))
                    }
                    _ => None,
                };
                if let Some((pc, b)) = coalesce {
                    // chains are right-associative: extend the existing
                    // CONCAT's range downward instead of nesting
                    let r = match e1.kind {
                        ExpKind::NonReloc(r) => r,
                        _ => unreachable!("infix put the operand on the stack"),
                    };
                    debug_assert_eq!(r, b - 1);
                    self.free_exp(e1);
                    self.instruction_at_mut(pc).set_b(r);
                    e1.kind = ExpKind::Reloc(pc);
                    Ok(())
                } else {
                    self.exp_to_next_reg(e2)?;
                    self.code_binary(OpCode::CONCAT, e1, e2, line)
                }
            }
            BinOp::Add
            | BinOp::Sub
            | BinOp::Mul
            | BinOp::Mod
            | BinOp::Pow
            | BinOp::Div
            | BinOp::IDiv
            | BinOp::BAnd
            | BinOp::BOr
            | BinOp::BXor
            | BinOp::Shl
            | BinOp::Shr => {
                if e1.is_numeral() && e2.is_numeral() {
                    if let Some(folded) = fold_binary(op, e1.kind, e2.kind) {
                        e1.kind = folded;
                        return Ok(());
                    }
                }
                self.code_binary(arith_opcode(op), e1, e2, line)
            }
            BinOp::Eq | BinOp::Lt | BinOp::Le | BinOp::Ne | BinOp::Gt | BinOp::Ge => {
                self.code_comparison(op, e1, e2)
            }
        }
    }
}
