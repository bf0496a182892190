//! The jump-list patcher.
//!
//! A jump list is the head pc of a chain threaded through the `sBx` fields
//! of the jump instructions themselves: each link stores the offset to the
//! next member and the sentinel offset terminates. Appending at the head is
//! O(1), concatenation and patching walk the list.

use mica_asm::{Instruction, OpCode, MAX_SBX, NO_REG};

use super::Compiler;
use crate::error::CompileError;

/// Empty jump list / absent jump.
pub const NO_JUMP: i32 = -1;

impl Compiler<'_> {
    /// Emit an unconditional jump with an open target. Jumps pending to
    /// "here" join the new jump's list so they keep moving with it.
    pub fn jump(&mut self) -> Result<i32, CompileError> {
        let jpc = std::mem::replace(&mut self.fs().jpc, NO_JUMP);
        let mut j = self.code_asbx(OpCode::JMP, 0, NO_JUMP)? as i32;
        self.concat_jump(&mut j, jpc)?;
        Ok(j)
    }

    /// Emit a jump straight to a known target.
    pub fn jump_to(&mut self, target: i32) -> Result<(), CompileError> {
        let j = self.jump()?;
        self.patch_list(j, target)
    }

    /// Mark "here" as a jump target, barring peephole merges across it.
    pub fn get_label(&mut self) -> i32 {
        let fs = self.fs();
        fs.last_target = fs.pc();
        fs.last_target
    }

    // Destination of the jump at `pc`; NO_JUMP terminates a list.
    pub(crate) fn get_jump(&self, pc: i32) -> i32 {
        let offset = self.instruction_at(pc).sbx();
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc + 1 + offset
        }
    }

    fn fix_jump(&mut self, pc: i32, dest: i32) -> Result<(), CompileError> {
        debug_assert_ne!(dest, NO_JUMP);
        let line = self.line();
        let offset = dest - (pc + 1);
        if offset.abs() > MAX_SBX {
            return Err(CompileError::JumpTooLong { line });
        }
        self.instruction_at_mut(pc).set_sbx(offset);
        Ok(())
    }

    // The instruction controlling the jump at `pc`: the preceding test when
    // there is one, the jump itself otherwise.
    pub(crate) fn jump_control_pc(&self, pc: i32) -> i32 {
        if pc >= 1 && self.instruction_at(pc - 1).opcode().is_test() {
            pc - 1
        } else {
            pc
        }
    }

    /// Append jump list `l2` to `l1` (either may be empty).
    pub fn concat_jump(&mut self, l1: &mut i32, l2: i32) -> Result<(), CompileError> {
        if l2 == NO_JUMP {
            return Ok(());
        }
        if *l1 == NO_JUMP {
            *l1 = l2;
            return Ok(());
        }
        let mut list = *l1;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next;
        }
        self.fix_jump(list, l2)
    }

    // Rewrite the TESTSET controlling the jump at `node`: stamp the target
    // register when a value is produced here, or strip to a plain TEST when
    // this exit does not assign. False when the control is not a TESTSET.
    fn patch_test_reg(&mut self, node: i32, reg: u32) -> bool {
        let control_pc = self.jump_control_pc(node);
        let ins = self.instruction_at(control_pc);
        if ins.opcode() != OpCode::TESTSET {
            return false;
        }
        if reg != NO_REG && reg != ins.b() {
            self.instruction_at_mut(control_pc).set_a(reg);
        } else {
            *self.instruction_at_mut(control_pc) =
                Instruction::abc(OpCode::TEST, ins.b(), 0, ins.c());
        }
        true
    }

    /// Strip the value-producing side of every TESTSET on the list.
    pub(crate) fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_reg(list, NO_REG);
            list = self.get_jump(list);
        }
    }

    pub(crate) fn patch_list_aux(
        &mut self,
        mut list: i32,
        vtarget: i32,
        reg: u32,
        dtarget: i32,
    ) -> Result<(), CompileError> {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            if self.patch_test_reg(list, reg) {
                self.fix_jump(list, vtarget)?;
            } else {
                self.fix_jump(list, dtarget)?;
            }
            list = next;
        }
        Ok(())
    }

    /// Patch every jump of `list` to `target`.
    pub fn patch_list(&mut self, list: i32, target: i32) -> Result<(), CompileError> {
        if target == self.fs_ref().pc() {
            self.patch_to_here(list)
        } else {
            debug_assert!(target < self.fs_ref().pc());
            self.patch_list_aux(list, target, NO_REG, target)
        }
    }

    /// Defer `list` onto `jpc`: the next emitted instruction becomes its
    /// target.
    pub fn patch_to_here(&mut self, list: i32) -> Result<(), CompileError> {
        self.get_label();
        let mut jpc = self.fs_ref().jpc;
        self.concat_jump(&mut jpc, list)?;
        self.fs().jpc = jpc;
        Ok(())
    }

    /// Stamp the close-upvalues level on every jump of `list` (for jumps
    /// escaping a block whose locals are captured). Stored as `level + 1`;
    /// zero means "no close".
    pub fn patch_close(&mut self, mut list: i32, level: u32) {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            let ins = self.instruction_at_mut(list);
            debug_assert_eq!(ins.opcode(), OpCode::JMP);
            ins.set_a(level + 1);
            list = next;
        }
    }

    /// Whether any jump on the list needs a materialized value (its control
    /// is not a TESTSET that already writes the register).
    pub(crate) fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            let ins = self.instruction_at(self.jump_control_pc(list));
            if ins.opcode() != OpCode::TESTSET {
                return true;
            }
            list = self.get_jump(list);
        }
        false
    }

    // Resolve every jump pending on `jpc` to the pc being emitted.
    pub(crate) fn discharge_jpc(&mut self) -> Result<(), CompileError> {
        let jpc = std::mem::replace(&mut self.fs().jpc, NO_JUMP);
        let pc = self.fs_ref().pc();
        self.patch_list_aux(jpc, pc, NO_REG, pc)
    }
}
