//! Incremental sweep: free dead objects, recolor survivors to the new white.

use super::{GcState, Heap, SweepCursor, SweepTarget, SWEEP_COST, SWEEP_MAX};
use crate::object::{GcRef, Object, StrKind};

impl Heap {
    pub(crate) fn enter_sweep(&mut self) {
        self.state = GcState::SweepAllGc;
        self.sweep = Some(SweepCursor {
            target: SweepTarget::AllGc,
            prev: None,
        });
    }

    fn list_head(&self, target: SweepTarget) -> Option<GcRef> {
        match target {
            SweepTarget::AllGc => self.allgc,
            SweepTarget::FinObj => self.finobj,
            SweepTarget::ToBeFnz => self.tobefnz,
        }
    }

    fn set_list_head(&mut self, target: SweepTarget, head: Option<GcRef>) {
        match target {
            SweepTarget::AllGc => self.allgc = head,
            SweepTarget::FinObj => self.finobj = head,
            SweepTarget::ToBeFnz => self.tobefnz = head,
        }
    }

    /// Whether the collector is inside one of the sweep states.
    pub(crate) fn in_sweep_phase(&self) -> bool {
        matches!(
            self.state,
            GcState::SweepAllGc
                | GcState::SweepFinObj
                | GcState::SweepToBeFnz
                | GcState::SweepEnd
        )
    }

    /// Sweep a bounded slice; advances to the next state when the current
    /// list is exhausted.
    pub(crate) fn sweep_step(&mut self) -> usize {
        let (swept, finished) = self.sweep_list(SWEEP_MAX);
        if finished {
            match self.state {
                GcState::SweepAllGc => {
                    self.state = GcState::SweepFinObj;
                    self.sweep = Some(SweepCursor {
                        target: SweepTarget::FinObj,
                        prev: None,
                    });
                }
                GcState::SweepFinObj => {
                    self.state = GcState::SweepToBeFnz;
                    self.sweep = Some(SweepCursor {
                        target: SweepTarget::ToBeFnz,
                        prev: None,
                    });
                }
                GcState::SweepToBeFnz => {
                    self.state = GcState::SweepEnd;
                    self.sweep = None;
                }
                _ => {}
            }
        }
        swept * SWEEP_COST + 1
    }

    // Process up to `max` objects at the cursor. Returns (count, finished).
    fn sweep_list(&mut self, max: usize) -> (usize, bool) {
        let Some(mut cursor) = self.sweep else {
            return (0, true);
        };
        let other = self.other_white();
        let white = self.current_white;
        let mut count = 0;
        while count < max {
            let next = match cursor.prev {
                None => self.list_head(cursor.target),
                Some(p) => self.header(p).next,
            };
            let Some(o) = next else {
                self.sweep = Some(cursor);
                return (count, true);
            };
            count += 1;
            if self.header(o).is_dead(other) {
                let after = self.header(o).next;
                match cursor.prev {
                    None => self.set_list_head(cursor.target, after),
                    Some(p) => self.header_mut(p).next = after,
                }
                self.free_object(o);
            } else {
                self.header_mut(o).make_white(white);
                cursor.prev = Some(o);
            }
        }
        self.sweep = Some(cursor);
        (count, false)
    }

    /// Fix the sweep cursor when `o` is about to leave `allgc` (finalizer
    /// reclassification): the cursor must not point at a removed object.
    pub(crate) fn fixup_sweep_cursor(&mut self, o: GcRef, predecessor: Option<GcRef>) {
        if let Some(cursor) = &mut self.sweep {
            if cursor.target == SweepTarget::AllGc && cursor.prev == Some(o) {
                cursor.prev = predecessor;
            }
        }
    }

    fn free_object(&mut self, o: GcRef) {
        if let Object::Str(s) = self.object(o) {
            if s.kind() == StrKind::Short {
                let hash = s.hash;
                self.strings.remove(hash, o);
            }
        }
        let size = super::object_size(self.object(o));
        self.credit(size);
        self.free_slot(o);
    }
}
