//! Mark phase: root marking, gray propagation and the atomic step.

use super::{Heap, GcState};
use crate::object::{GcRef, Object, Upvalue};
use crate::value::Value;

impl Heap {
    pub(crate) fn mark_value(&mut self, v: Value) {
        if let Some(r) = v.as_gc_ref() {
            self.mark_object(r);
        }
    }

    /// Turn a white object gray (or directly black for leaf objects).
    pub(crate) fn mark_object(&mut self, r: GcRef) {
        if !self.header(r).is_white() {
            return;
        }
        self.header_mut(r).white_to_gray();
        match self.object(r) {
            // strings carry no references
            Object::Str(_) => self.header_mut(r).gray_to_black(),
            // upvalues hold exactly one reference; skip the worklist
            Object::Upvalue(u) => {
                let held = match u {
                    Upvalue::Open { thread, .. } => Value::Thread(*thread),
                    Upvalue::Closed(v) => *v,
                };
                self.header_mut(r).gray_to_black();
                self.mark_value(held);
            }
            _ => self.gray.push(r),
        }
    }

    /// Start a cycle: reset the worklists and mark the root set.
    pub(crate) fn restart_collection(&mut self) -> usize {
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        self.ephemeron.clear();
        self.allweak.clear();

        let main = self.main_thread();
        self.mark_object(main);
        let registry = self.registry();
        self.mark_value(registry);
        for mt in self.metatables {
            if let Some(m) = mt {
                self.mark_object(m);
            }
        }
        for r in self.anchored() {
            self.mark_object(r);
        }
        // the previous cycle's finalizer queue stays reachable
        self.mark_tobefnz();
        1
    }

    pub(crate) fn mark_tobefnz(&mut self) {
        let mut cursor = self.tobefnz;
        while let Some(o) = cursor {
            self.mark_object(o);
            cursor = self.header(o).next;
        }
    }

    /// Pop one gray object, scan its references, turn it black.
    pub(crate) fn propagate_mark(&mut self) -> usize {
        let Some(r) = self.gray.pop() else { return 0 };
        self.header_mut(r).gray_to_black();
        self.traverse(r)
    }

    pub(crate) fn propagate_all(&mut self) -> usize {
        let mut work = 0;
        while !self.gray.is_empty() {
            work += self.propagate_mark();
        }
        work
    }

    fn traverse(&mut self, r: GcRef) -> usize {
        match self.object(r) {
            Object::Table(_) => self.traverse_table(r),
            Object::Proto(_) => self.traverse_proto(r),
            Object::Closure(_) => self.traverse_closure(r),
            Object::Thread(_) => self.traverse_thread(r),
            Object::Userdata(_) => self.traverse_userdata(r),
            Object::Str(_) | Object::Upvalue(_) => 0,
        }
    }

    fn traverse_proto(&mut self, r: GcRef) -> usize {
        let (objs, constants, size) = match self.object(r) {
            Object::Proto(p) => {
                let mut objs: Vec<GcRef> = Vec::new();
                objs.extend(p.source);
                objs.extend(p.protos.iter().copied());
                objs.extend(p.upvalues.iter().filter_map(|u| u.name));
                objs.extend(p.locals.iter().map(|l| l.name));
                let constants: Vec<Value> = p
                    .constants
                    .iter()
                    .copied()
                    .filter(Value::is_collectable)
                    .collect();
                (objs, constants, super::object_size(self.object(r)))
            }
            _ => unreachable!(),
        };
        for o in objs {
            self.mark_object(o);
        }
        for v in constants {
            self.mark_value(v);
        }
        size
    }

    fn traverse_closure(&mut self, r: GcRef) -> usize {
        let (proto, upvalues) = match self.object(r) {
            Object::Closure(c) => (c.proto, c.upvalues.clone()),
            _ => unreachable!(),
        };
        self.mark_object(proto);
        for u in upvalues {
            self.mark_object(u);
        }
        super::object_size(self.object(r))
    }

    fn traverse_thread(&mut self, r: GcRef) -> usize {
        let stack = match self.object(r) {
            Object::Thread(th) => th.stack.clone(),
            _ => unreachable!(),
        };
        for v in stack {
            self.mark_value(v);
        }
        // threads keep changing: re-scan in the atomic phase and stay gray
        // with respect to stack writes
        if self.state == GcState::Propagate {
            self.header_mut(r).black_to_gray();
            self.grayagain.push(r);
        }
        super::object_size(self.object(r))
    }

    fn traverse_userdata(&mut self, r: GcRef) -> usize {
        let (mt, uv) = match self.object(r) {
            Object::Userdata(u) => (u.metatable, u.user_value),
            _ => unreachable!(),
        };
        if let Some(m) = mt {
            self.mark_object(m);
        }
        self.mark_value(uv);
        super::object_size(self.object(r))
    }

    // Re-mark values written through still-open upvalues of suspended
    // threads; drop dead threads from `twups`.
    fn remark_upvals(&mut self) {
        let threads = std::mem::take(&mut self.twups);
        for t in threads {
            if self.header(t).is_white() {
                // thread is unreachable: its open upvalues die with it
                match self.object_mut(t) {
                    Object::Thread(th) => th.in_twups = false,
                    _ => unreachable!(),
                }
                continue;
            }
            self.twups.push(t);
            let upvals = match self.object(t) {
                Object::Thread(th) => th.open_upvalues.clone(),
                _ => unreachable!(),
            };
            for u in upvals {
                let touched = match self.object_mut(u) {
                    Object::Upvalue(Upvalue::Open { touched, .. }) => {
                        std::mem::replace(touched, false)
                    }
                    _ => false,
                };
                if touched {
                    let v = self.get_upvalue(u);
                    self.mark_value(v);
                }
            }
        }
    }

    /// The non-incremental phase: close every race the incremental mark can
    /// lose, resolve weakness, flip the white.
    pub(crate) fn atomic(&mut self) -> usize {
        let mut work = 0;
        // barriers may have grayed objects since the propagate phase ended
        work += self.propagate_all();

        let grayagain = std::mem::take(&mut self.grayagain);

        // re-mark roots that may have changed since their scan
        let main = self.main_thread();
        self.mark_object(main);
        let registry = self.registry();
        self.mark_value(registry);
        for mt in self.metatables {
            if let Some(m) = mt {
                self.mark_object(m);
            }
        }
        for r in self.anchored() {
            self.mark_object(r);
        }
        self.remark_upvals();
        work += self.propagate_all();

        // tables demoted by the backward barrier, threads, weak tables seen
        // during propagate
        for r in grayagain {
            self.header_mut(r).black_to_gray();
            self.gray.push(r);
        }
        work += self.propagate_all();

        work += self.converge_ephemerons();

        // all strongly reachable objects are marked; clear dead values
        // before finalizers can resurrect anything
        self.clear_weak_values(0);
        self.clear_allweak_values(0);
        let orig_weak = self.weak.len();
        let orig_allweak = self.allweak.len();

        // unreachable finalizable objects move to the queue and come back
        // to life for one more cycle
        self.separate_tobefnz(false);
        self.mark_tobefnz();
        work += self.propagate_all();
        work += self.converge_ephemerons();

        // drop entries whose weak keys died
        self.clear_weak_keys();
        // resurrection may have appended fresh weak tables
        self.clear_weak_values(orig_weak);
        self.clear_allweak_values(orig_allweak);

        self.current_white = self.other_white();
        work + 1
    }
}
