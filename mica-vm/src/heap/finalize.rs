//! Finalizer routing: `finobj`, the `tobefnz` queue and protected `__gc`
//! calls.

use super::Heap;
use crate::error::VmError;
use crate::object::{GcRef, Marks, Object};
use crate::value::Value;

impl Heap {
    /// First-class value addressing a heap object.
    pub fn object_value(&self, o: GcRef) -> Value {
        match self.object(o) {
            Object::Str(_) => Value::Str(o),
            Object::Table(_) => Value::Table(o),
            Object::Closure(_) => Value::Closure(o),
            Object::Userdata(_) => Value::Userdata(o),
            Object::Thread(_) => Value::Thread(o),
            // prototypes and upvalues are not first-class
            Object::Proto(_) | Object::Upvalue(_) => Value::Nil,
        }
    }

    fn own_metatable(&self, o: GcRef) -> Option<GcRef> {
        match self.object(o) {
            Object::Table(t) => t.metatable,
            Object::Userdata(u) => u.metatable,
            _ => None,
        }
    }

    /// If the object's freshly installed metatable has a `__gc` entry, move
    /// it from `allgc` to `finobj` and flag it finalizable. Idempotent.
    pub fn check_finalizer(&mut self, o: GcRef) {
        if self.header(o).marks.contains(Marks::FINALIZED) {
            return;
        }
        let Some(mt) = self.own_metatable(o) else {
            return;
        };
        if matches!(self.metafield(mt, self.str_gc), Value::Nil) {
            return;
        }
        if self.in_sweep_phase() {
            // "sweep" the object here so the real sweep will not see a
            // stale color
            let white = self.current_white;
            self.header_mut(o).make_white(white);
        }
        // linear unlink from allgc
        let mut prev: Option<GcRef> = None;
        let mut cur = self.allgc;
        while let Some(c) = cur {
            if c == o {
                break;
            }
            prev = Some(c);
            cur = self.header(c).next;
        }
        debug_assert!(cur == Some(o), "finalizable object must be on allgc");
        self.fixup_sweep_cursor(o, prev);
        let after = self.header(o).next;
        match prev {
            None => self.allgc = after,
            Some(p) => self.header_mut(p).next = after,
        }
        self.header_mut(o).next = self.finobj;
        self.finobj = Some(o);
        self.header_mut(o).marks.insert(Marks::FINALIZED);
    }

    /// Move unreachable objects (or, with `all`, every object) from
    /// `finobj` to the end of the `tobefnz` queue, preserving order.
    pub(crate) fn separate_tobefnz(&mut self, all: bool) {
        let mut tail: Option<GcRef> = {
            let mut t = self.tobefnz;
            let mut last = None;
            while let Some(o) = t {
                last = Some(o);
                t = self.header(o).next;
            }
            last
        };
        let mut prev: Option<GcRef> = None;
        let mut cur = self.finobj;
        while let Some(o) = cur {
            let next = self.header(o).next;
            if !(all || self.header(o).is_white()) {
                prev = Some(o);
                cur = next;
                continue;
            }
            match prev {
                None => self.finobj = next,
                Some(p) => self.header_mut(p).next = next,
            }
            self.header_mut(o).next = None;
            match tail {
                None => self.tobefnz = Some(o),
                Some(t) => self.header_mut(t).next = Some(o),
            }
            tail = Some(o);
            cur = next;
        }
    }

    /// Pop and run up to `n` finalizers; returns how many actually ran.
    pub(crate) fn run_a_few_finalizers(&mut self, n: usize) -> Result<usize, VmError> {
        for i in 0..n {
            if self.tobefnz.is_none() {
                return Ok(i);
            }
            self.call_one_finalizer()?;
        }
        Ok(n)
    }

    // Port of the one-at-a-time finalizer call: the object returns to
    // `allgc` as a normal object first, then its `__gc` runs as a protected
    // call with debt-driven collection suspended.
    fn call_one_finalizer(&mut self) -> Result<(), VmError> {
        let Some(o) = self.tobefnz else {
            return Ok(());
        };
        self.tobefnz = self.header(o).next;
        self.header_mut(o).next = self.allgc;
        self.allgc = Some(o);
        self.header_mut(o).marks.remove(Marks::FINALIZED);
        if self.in_sweep_phase() {
            let white = self.current_white;
            self.header_mut(o).make_white(white);
        }

        let finalizer = match self.own_metatable(o) {
            Some(mt) => self.metafield(mt, self.str_gc),
            None => Value::Nil,
        };
        let value = self.object_value(o);
        match finalizer {
            Value::Nil => Ok(()),
            Value::NativeFn(f) => {
                // finalizers must not re-enter the collector
                let was_running = std::mem::replace(&mut self.running, false);
                tracing::trace!(object = %o, "running finalizer");
                let result = self.pcall(|heap| f(heap, &[value]).map(|_| ()));
                self.running = was_running;
                result.map_err(|e| match e {
                    already @ VmError::GcMetamethod(_) => already,
                    other => VmError::GcMetamethod(other.to_string()),
                })
            }
            other => {
                // closures need the interpreter loop; never swallow this
                Err(VmError::GcMetamethod(format!(
                    "cannot run a {} finalizer from the collector",
                    other.type_name()
                )))
            }
        }
    }

    /// Has the collector queued this object for finalization?
    pub fn is_finalizable(&self, o: GcRef) -> bool {
        self.header(o).marks.contains(Marks::FINALIZED)
    }

    /// Run every pending finalizer (used on shutdown and by `full_gc`
    /// callers that need a drained queue).
    pub fn call_all_pending_finalizers(&mut self) -> Result<(), VmError> {
        while self.tobefnz.is_some() {
            self.call_one_finalizer()?;
        }
        Ok(())
    }
}
