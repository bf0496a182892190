//! Write barriers preserving "black never points to white".
//!
//! Both barriers are cheap no-ops unless the source is actually black and
//! the target actually white, so mutation paths call them unconditionally.

use super::{GcState, Heap};
use crate::object::{GcRef, Object, Upvalue};
use crate::value::Value;

impl Heap {
    // The invariant is maintained only through the mark phases; during
    // sweep, barriers instead recolor the source so it is swept cleanly.
    pub(crate) fn keep_invariant(&self) -> bool {
        matches!(self.state, GcState::Propagate | GcState::Atomic)
    }

    /// Forward barrier: a black `parent` acquired a reference to `child`.
    /// Marks the white child immediately. Used where the reference set is
    /// small or settles quickly: closed upvalues, prototype construction,
    /// host stores.
    pub fn barrier(&mut self, parent: GcRef, child: Value) {
        if let Some(c) = child.as_gc_ref() {
            self.barrier_object(parent, c);
        }
    }

    pub(crate) fn barrier_object(&mut self, parent: GcRef, child: GcRef) {
        if !(self.header(parent).is_black() && self.header(child).is_white()) {
            return;
        }
        if self.keep_invariant() {
            self.mark_object(child);
        } else {
            // sweeping: recolor the parent so it cannot trip again
            debug_assert!(matches!(
                self.state,
                GcState::SweepAllGc
                    | GcState::SweepFinObj
                    | GcState::SweepToBeFnz
                    | GcState::SweepEnd
            ));
            let white = self.current_white;
            self.header_mut(parent).make_white(white);
        }
    }

    /// Backward barrier: a black table was mutated. The table goes back to
    /// gray on `grayagain` and is re-traversed in the atomic phase, making
    /// every further write until then free.
    pub fn barrier_back(&mut self, table: GcRef) {
        debug_assert!(matches!(self.object(table), Object::Table(_)));
        if self.header(table).is_black() {
            if self.keep_invariant() {
                self.header_mut(table).black_to_gray();
                self.grayagain.push(table);
            } else {
                let white = self.current_white;
                self.header_mut(table).make_white(white);
            }
        }
    }

    /// Barrier for closed upvalues: marks the held value while the
    /// invariant is in force.
    pub fn upvalue_barrier(&mut self, upvalue: GcRef) {
        let value = match self.object(upvalue) {
            Object::Upvalue(Upvalue::Closed(v)) if v.is_collectable() => *v,
            _ => return,
        };
        if self.keep_invariant() {
            self.mark_value(value);
        }
    }
}
