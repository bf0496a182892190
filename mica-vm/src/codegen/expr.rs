//! Expression descriptors and the discharge machinery.
//!
//! A descriptor represents a partially evaluated expression that may still
//! end up in a register, the constant pool, or as a pending jump. Nothing is
//! committed until a `to_*` operation forces it.

use mica_asm::{from_constant, OpCode, MAX_INDEX_RK};

use super::jump::NO_JUMP;
use super::Compiler;
use crate::error::CompileError;

/// Where an indexed expression's collection lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexedBase {
    /// Collection is in a register.
    Register(u32),
    /// Collection is an upvalue of the current function.
    Upvalue(u32),
}

/// The variant of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpKind {
    /// No value.
    Void,
    /// Literal `nil`.
    Nil,
    /// Literal `true`.
    True,
    /// Literal `false`.
    False,
    /// Integer literal, not yet pooled.
    Int(i64),
    /// Float literal, not yet pooled.
    Float(f64),
    /// Pooled constant, by index.
    Const(u32),
    /// Value sits in a specific register.
    NonReloc(u32),
    /// Named local, by register.
    Local(u32),
    /// Captured variable, by upvalue index.
    Upval(u32),
    /// `t[k]`, not yet materialized; the key is R/K-encoded.
    Indexed {
        /// Where `t` lives.
        base: IndexedBase,
        /// R/K operand for `k`.
        key: u32,
    },
    /// The expression is a conditional jump, by its pc.
    Jump(i32),
    /// Producing instruction emitted but its A field still open.
    Reloc(i32),
    /// Function call, by its pc; may yield multiple values.
    Call(i32),
    /// Vararg expression, by its pc.
    Vararg(i32),
}

/// A descriptor plus its short-circuit jump lists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpDesc {
    /// Current variant.
    pub kind: ExpKind,
    /// Truelist: jumps taken when the expression is true.
    pub t: i32,
    /// Falselist: jumps taken when the expression is false.
    pub f: i32,
}

impl ExpDesc {
    /// Wrap a kind with empty jump lists.
    pub fn new(kind: ExpKind) -> Self {
        Self {
            kind,
            t: NO_JUMP,
            f: NO_JUMP,
        }
    }

    /// Literal `nil`.
    pub fn nil() -> Self {
        Self::new(ExpKind::Nil)
    }

    /// Literal boolean.
    pub fn boolean(b: bool) -> Self {
        Self::new(if b { ExpKind::True } else { ExpKind::False })
    }

    /// Integer literal.
    pub fn int(i: i64) -> Self {
        Self::new(ExpKind::Int(i))
    }

    /// Float literal.
    pub fn float(f: f64) -> Self {
        Self::new(ExpKind::Float(f))
    }

    /// A named local resident in `reg`.
    pub fn local(reg: u32) -> Self {
        Self::new(ExpKind::Local(reg))
    }

    /// An upvalue of the current function.
    pub fn upvalue(index: u32) -> Self {
        Self::new(ExpKind::Upval(index))
    }

    /// Pending true/false exits?
    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    /// A numeric literal free of pending jumps (foldable).
    pub(crate) fn is_numeral(&self) -> bool {
        !self.has_jumps() && matches!(self.kind, ExpKind::Int(_) | ExpKind::Float(_))
    }

    /// Descriptor has a fixed register only in these two kinds.
    pub fn in_register(&self) -> bool {
        matches!(self.kind, ExpKind::NonReloc(_) | ExpKind::Local(_))
    }
}

impl Compiler<'_> {
    /// Eliminate variable kinds: locals become register values, upvalue and
    /// indexed reads emit their access instruction, multi-value producers
    /// collapse to one result.
    pub fn discharge_vars(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        match e.kind {
            ExpKind::Local(reg) => e.kind = ExpKind::NonReloc(reg),
            ExpKind::Upval(idx) => {
                let pc = self.code_abc(OpCode::GETUPVAL, 0, idx, 0)?;
                e.kind = ExpKind::Reloc(pc as i32);
            }
            ExpKind::Indexed { base, key } => {
                self.free_reg(key);
                let pc = match base {
                    IndexedBase::Register(t) => {
                        self.free_reg(t);
                        self.code_abc(OpCode::GETTABLE, 0, t, key)?
                    }
                    IndexedBase::Upvalue(u) => self.code_abc(OpCode::GETTABUP, 0, u, key)?,
                };
                e.kind = ExpKind::Reloc(pc as i32);
            }
            ExpKind::Call(_) | ExpKind::Vararg(_) => self.set_one_result(e),
            _ => {}
        }
        Ok(())
    }

    /// Fix a multi-value producer to exactly one result.
    pub fn set_one_result(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Call(pc) => {
                // the call leaves its single result at its base register
                let base = self.instruction_at(pc).a();
                e.kind = ExpKind::NonReloc(base);
            }
            ExpKind::Vararg(pc) => {
                self.instruction_at_mut(pc).set_b(2);
                e.kind = ExpKind::Reloc(pc);
            }
            _ => {}
        }
    }

    /// Fix a multi-value producer to `nresults` values (`MULTRET` for "all
    /// available").
    pub fn set_returns(&mut self, e: &mut ExpDesc, nresults: i32) -> Result<(), CompileError> {
        match e.kind {
            ExpKind::Call(pc) => {
                self.instruction_at_mut(pc).set_c((nresults + 1) as u32);
            }
            ExpKind::Vararg(pc) => {
                let free = self.fs_ref().freereg;
                let ins = self.instruction_at_mut(pc);
                ins.set_b((nresults + 1) as u32);
                ins.set_a(free);
                self.reserve_regs(1)?;
            }
            _ => debug_assert!(false, "set_returns on a single-value expression"),
        }
        Ok(())
    }

    // Emit code putting the (jump-free part of the) value into `reg`.
    fn discharge_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        match e.kind {
            ExpKind::Nil => self.load_nil(reg, 1)?,
            ExpKind::False => {
                self.code_abc(OpCode::LOADBOOL, reg, 0, 0)?;
            }
            ExpKind::True => {
                self.code_abc(OpCode::LOADBOOL, reg, 1, 0)?;
            }
            ExpKind::Const(k) => {
                self.code_k(reg, k)?;
            }
            ExpKind::Float(n) => {
                let k = self.float_k(n)?;
                self.code_k(reg, k)?;
            }
            ExpKind::Int(i) => {
                let k = self.int_k(i)?;
                self.code_k(reg, k)?;
            }
            ExpKind::Reloc(pc) => {
                self.instruction_at_mut(pc).set_a(reg);
            }
            ExpKind::NonReloc(r) => {
                if r != reg {
                    self.code_abc(OpCode::MOVE, reg, r, 0)?;
                }
            }
            ExpKind::Jump(_) => return Ok(()), // handled by exp_to_reg
            ExpKind::Void
            | ExpKind::Local(_)
            | ExpKind::Upval(_)
            | ExpKind::Indexed { .. }
            | ExpKind::Call(_)
            | ExpKind::Vararg(_) => {
                debug_assert!(false, "kind must have been discharged");
            }
        }
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    pub(crate) fn discharge_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if !matches!(e.kind, ExpKind::NonReloc(_)) {
            self.reserve_regs(1)?;
            let reg = self.fs_ref().freereg - 1;
            self.discharge_to_reg(e, reg)?;
        }
        Ok(())
    }

    pub(crate) fn code_loadbool(&mut self, reg: u32, b: u32, skip: u32) -> Result<i32, CompileError> {
        self.get_label(); // these instructions may be jump targets
        Ok(self.code_abc(OpCode::LOADBOOL, reg, b, skip)? as i32)
    }

    // Put the final value, jump lists resolved, into `reg`.
    pub(crate) fn exp_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> Result<(), CompileError> {
        self.discharge_to_reg(e, reg)?;
        if let ExpKind::Jump(pc) = e.kind {
            // the test itself is a true exit
            self.concat_jump(&mut e.t, pc)?;
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP; // where an eventual LOADBOOL false sits
            let mut p_t = NO_JUMP;
            if self.need_value(e.t) || self.need_value(e.f) {
                let fj = if matches!(e.kind, ExpKind::Jump(_)) {
                    NO_JUMP
                } else {
                    self.jump()?
                };
                p_f = self.code_loadbool(reg, 0, 1)?;
                p_t = self.code_loadbool(reg, 1, 0)?;
                self.patch_to_here(fj)?;
            }
            let end = self.get_label();
            self.patch_list_aux(e.f, end, reg, p_f)?;
            self.patch_list_aux(e.t, end, reg, p_t)?;
        }
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    /// Force the value into the next free register.
    pub fn exp_to_next_reg(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        self.free_exp(e);
        self.reserve_regs(1)?;
        let reg = self.fs_ref().freereg - 1;
        self.exp_to_reg(e, reg)
    }

    /// The register holding the value, allocating one only if needed.
    pub fn exp_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<u32, CompileError> {
        self.discharge_vars(e)?;
        if let ExpKind::NonReloc(r) = e.kind {
            if !e.has_jumps() {
                return Ok(r);
            }
            if r >= self.fs_ref().nactvar {
                // not a local: reuse its register for the synthesis
                self.exp_to_reg(e, r)?;
                return Ok(r);
            }
        }
        self.exp_to_next_reg(e)?;
        match e.kind {
            ExpKind::NonReloc(r) => Ok(r),
            _ => unreachable!("exp_to_next_reg always lands in a register"),
        }
    }

    /// Like [`Compiler::exp_to_any_reg`], but upvalues may stay where they
    /// are.
    pub fn exp_to_any_reg_up(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if !matches!(e.kind, ExpKind::Upval(_)) || e.has_jumps() {
            self.exp_to_any_reg(e)?;
        }
        Ok(())
    }

    /// Commit the value anywhere (register or constant).
    pub fn exp_to_val(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if e.has_jumps() {
            self.exp_to_any_reg(e)?;
        } else {
            self.discharge_vars(e)?;
        }
        Ok(())
    }

    /// An operand usable in an R/K field: a small-enough constant index, or
    /// a register.
    pub fn exp_to_rk(&mut self, e: &mut ExpDesc) -> Result<u32, CompileError> {
        self.exp_to_val(e)?;
        let k = match e.kind {
            // only pool nil/bool when the index can still be an R/K operand
            ExpKind::Nil if self.fs_ref().proto.constants.len() as u32 <= MAX_INDEX_RK => {
                Some(self.nil_k()?)
            }
            ExpKind::True if self.fs_ref().proto.constants.len() as u32 <= MAX_INDEX_RK => {
                Some(self.bool_k(true)?)
            }
            ExpKind::False if self.fs_ref().proto.constants.len() as u32 <= MAX_INDEX_RK => {
                Some(self.bool_k(false)?)
            }
            ExpKind::Int(i) => Some(self.int_k(i)?),
            ExpKind::Float(n) => Some(self.float_k(n)?),
            ExpKind::Const(k) => Some(k),
            _ => None,
        };
        if let Some(k) = k {
            if k <= MAX_INDEX_RK {
                e.kind = ExpKind::Const(k);
                return Ok(from_constant(k));
            }
        }
        self.exp_to_any_reg(e)
    }

    /// Free the register held by a committed expression, if any.
    pub(crate) fn free_exp(&mut self, e: &ExpDesc) {
        if let ExpKind::NonReloc(r) = e.kind {
            self.free_reg(r);
        }
    }

    // Operands are pushed left to right, so free in descending register
    // order.
    pub(crate) fn free_exps(&mut self, e1: &ExpDesc, e2: &ExpDesc) {
        let r1 = match e1.kind {
            ExpKind::NonReloc(r) => r as i64,
            _ => -1,
        };
        let r2 = match e2.kind {
            ExpKind::NonReloc(r) => r as i64,
            _ => -1,
        };
        if r1 > r2 {
            self.free_exp(e1);
            self.free_exp(e2);
        } else {
            self.free_exp(e2);
            self.free_exp(e1);
        }
    }

    /// Materialize the assignment `var = e`.
    pub fn store_var(&mut self, var: &ExpDesc, e: &mut ExpDesc) -> Result<(), CompileError> {
        match var.kind {
            ExpKind::Local(reg) => {
                self.free_exp(e);
                return self.exp_to_reg(e, reg);
            }
            ExpKind::Upval(idx) => {
                let r = self.exp_to_any_reg(e)?;
                self.code_abc(OpCode::SETUPVAL, r, idx, 0)?;
            }
            ExpKind::Indexed { base, key } => {
                let rk = self.exp_to_rk(e)?;
                match base {
                    IndexedBase::Register(t) => {
                        self.code_abc(OpCode::SETTABLE, t, key, rk)?;
                    }
                    IndexedBase::Upvalue(u) => {
                        self.code_abc(OpCode::SETTABUP, u, key, rk)?;
                    }
                }
            }
            _ => debug_assert!(false, "store target must be a variable"),
        }
        self.free_exp(e);
        Ok(())
    }

    /// Method-call preparation: `e:key` leaves the function and the
    /// receiver in two fresh consecutive registers.
    pub fn op_self(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> Result<(), CompileError> {
        self.exp_to_any_reg(e)?;
        let ereg = match e.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        self.free_exp(e);
        let base = self.fs_ref().freereg;
        e.kind = ExpKind::NonReloc(base);
        self.reserve_regs(2)?; // function and "self"
        let krk = self.exp_to_rk(key)?;
        self.code_abc(OpCode::SELF, base, ereg, krk)?;
        self.free_exp(key);
        Ok(())
    }

    /// Turn `t` into `t[k]`; `t` must already sit in a register or be an
    /// upvalue.
    pub fn indexed(&mut self, t: &mut ExpDesc, k: &mut ExpDesc) -> Result<(), CompileError> {
        debug_assert!(!t.has_jumps() && (t.in_register() || matches!(t.kind, ExpKind::Upval(_))));
        let key = self.exp_to_rk(k)?;
        let base = match t.kind {
            ExpKind::Upval(u) => IndexedBase::Upvalue(u),
            ExpKind::NonReloc(r) | ExpKind::Local(r) => IndexedBase::Register(r),
            _ => unreachable!(),
        };
        t.kind = ExpKind::Indexed { base, key };
        Ok(())
    }
}
