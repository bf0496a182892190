//! The heap: object arena, global lists and the incremental collector.
//!
//! The heap owns every collectable object. The collector is a state machine
//! advanced in small slices by allocation debt; see [`Heap::step`]. Mutation
//! of managed references goes through heap methods so the write barriers
//! cannot be forgotten.

mod barrier;
mod finalize;
mod mark;
mod sweep;
mod weak;

use crate::error::VmError;
use crate::object::{
    Closure, GcBox, GcRef, Header, LocalVar, Marks, Object, Proto, Str, StrKind, StringTable,
    Table, TableKey, Thread, Upvalue, UpvalDesc, Userdata, SHORT_STR_LIMIT,
};
use crate::value::{TypeTag, Value};

/// Nominal amount of allocation one collector slice pays off.
const GC_STEP_SIZE: isize = 2400;
/// Divisor applied to raw debt before the step multiplier scales it.
const STEP_MUL_ADJ: isize = 200;
/// Divisor turning the live estimate into pause-threshold units.
const PAUSE_ADJ: usize = 100;
/// Objects swept per sweep slice.
const SWEEP_MAX: usize = 80;
/// Work units charged per swept object.
const SWEEP_COST: usize = 32;
/// Work units charged per executed finalizer.
const FINALIZE_COST: usize = 200;
/// Finalizers run per CallFin slice.
const GC_FIN_NUM: usize = 4;

/// Collector pacing knobs, both percentages.
#[derive(Debug, Clone)]
pub struct GcParams {
    pause: u32,
    step_mul: u32,
    memory_limit: Option<usize>,
}

impl Default for GcParams {
    fn default() -> Self {
        Self {
            pause: 100,
            step_mul: 200,
            memory_limit: None,
        }
    }
}

impl GcParams {
    const MAX_PERCENT: u32 = 1_000_000;

    /// Pause percentage: the next cycle starts when the heap reaches
    /// `live * pause / 100` bytes.
    pub fn pause(&self) -> u32 {
        self.pause
    }

    /// Step multiplier percentage: how much work each slice does relative
    /// to the debt that triggered it.
    pub fn step_mul(&self) -> u32 {
        self.step_mul
    }

    /// Set the pause percentage, clamped against overflow.
    pub fn set_pause(&mut self, pause: u32) {
        self.pause = pause.clamp(10, Self::MAX_PERCENT);
    }

    /// Set the step multiplier, clamped against overflow.
    pub fn set_step_mul(&mut self, step_mul: u32) {
        self.step_mul = step_mul.clamp(40, Self::MAX_PERCENT);
    }

    /// Soft allocation ceiling driving emergency collections.
    pub fn set_memory_limit(&mut self, limit: Option<usize>) {
        self.memory_limit = limit;
    }
}

/// Phase of the collection cycle.
///
/// One [`Heap::step`] advances at most a bounded amount of work; the atomic
/// phase is the single non-incremental step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    /// Popping gray objects and scanning their references.
    Propagate,
    /// The one-shot fixpoint-and-flip step.
    Atomic,
    /// Sweeping the main object list.
    SweepAllGc,
    /// Sweeping objects with finalizers.
    SweepFinObj,
    /// Sweeping the finalization queue.
    SweepToBeFnz,
    /// Final bookkeeping: string-table shrink.
    SweepEnd,
    /// Running queued finalizers.
    CallFin,
    /// Between cycles.
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepTarget {
    AllGc,
    FinObj,
    ToBeFnz,
}

/// Position of the incremental sweep: the last live object kept (`None`
/// while still at the list head).
#[derive(Debug, Clone, Copy)]
pub(crate) struct SweepCursor {
    pub(crate) target: SweepTarget,
    pub(crate) prev: Option<GcRef>,
}

/// The single owner of all collectable objects.
pub struct Heap {
    slots: Vec<Option<GcBox>>,
    free_slots: Vec<u32>,

    pub(crate) allgc: Option<GcRef>,
    pub(crate) finobj: Option<GcRef>,
    pub(crate) tobefnz: Option<GcRef>,
    pub(crate) fixedgc: Option<GcRef>,

    pub(crate) gray: Vec<GcRef>,
    pub(crate) grayagain: Vec<GcRef>,
    pub(crate) weak: Vec<GcRef>,
    pub(crate) ephemeron: Vec<GcRef>,
    pub(crate) allweak: Vec<GcRef>,
    pub(crate) twups: Vec<GcRef>,

    pub(crate) state: GcState,
    pub(crate) current_white: Marks,
    pub(crate) sweep: Option<SweepCursor>,
    running: bool,
    pub(crate) emergency: bool,

    params: GcParams,
    total_bytes: isize,
    debt: isize,
    pub(crate) estimate: usize,

    pub(crate) strings: StringTable,

    main_thread: GcRef,
    registry: Value,
    pub(crate) metatables: [Option<GcRef>; TypeTag::COUNT],
    anchors: Vec<GcRef>,

    pub(crate) str_gc: GcRef,
    pub(crate) str_mode: GcRef,
    str_memerr: GcRef,
}

pub(crate) fn object_size(body: &Object) -> usize {
    use std::mem::size_of;

    let payload = match body {
        Object::Str(s) => s.len(),
        Object::Table(t) => {
            t.array.len() * size_of::<Value>()
                + t.hash_len() * size_of::<(TableKey, Value)>()
        }
        Object::Proto(p) => {
            p.code.len() * 4
                + p.lines.len() * 4
                + p.constants.len() * size_of::<Value>()
                + p.protos.len() * size_of::<GcRef>()
                + p.upvalues.len() * size_of::<UpvalDesc>()
                + p.locals.len() * size_of::<LocalVar>()
        }
        Object::Closure(c) => c.upvalues.len() * size_of::<GcRef>(),
        Object::Upvalue(_) | Object::Userdata(_) => 0,
        Object::Thread(t) => t.stack.len() * size_of::<Value>(),
    };
    std::mem::size_of::<GcBox>() + payload
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Fresh heap with default pacing.
    pub fn new() -> Self {
        Self::with_params(GcParams::default())
    }

    /// Fresh heap with the given pacing knobs.
    pub fn with_params(params: GcParams) -> Self {
        let placeholder = GcRef(u32::MAX);
        let mut heap = Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            allgc: None,
            finobj: None,
            tobefnz: None,
            fixedgc: None,
            gray: Vec::new(),
            grayagain: Vec::new(),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            twups: Vec::new(),
            state: GcState::Pause,
            current_white: Marks::WHITE0,
            sweep: None,
            running: true,
            emergency: false,
            params,
            total_bytes: 0,
            debt: 0,
            estimate: 0,
            strings: StringTable::default(),
            main_thread: placeholder,
            registry: Value::Nil,
            metatables: [None; TypeTag::COUNT],
            anchors: Vec::new(),
            str_gc: placeholder,
            str_mode: placeholder,
            str_memerr: placeholder,
        };
        heap.bootstrap();
        heap
    }

    // Allocate the permanent objects. Infallible: no memory limit applies
    // this early and the collector has nothing to do yet.
    fn bootstrap(&mut self) {
        let intern = |heap: &mut Heap, text: &str| match heap.new_string(text) {
            Ok(r) => r,
            Err(_) => unreachable!("no memory limit during bootstrap"),
        };
        self.str_gc = intern(self, "__gc");
        self.str_mode = intern(self, "__mode");
        self.str_memerr = intern(self, "not enough memory");
        self.fix(self.str_gc);
        self.fix(self.str_mode);
        self.fix(self.str_memerr);

        let main = self.alloc_raw(Object::Thread(Thread::default()));
        self.main_thread = main;
        let globals = self.alloc_raw(Object::Table(Table::default()));
        let registry = self.alloc_raw(Object::Table(Table::default()));
        self.registry = Value::Table(registry);
        if let Object::Table(t) = self.object_mut(registry) {
            t.set(TableKey::Integer(1), Value::Thread(main));
            t.set(TableKey::Integer(2), Value::Table(globals));
        }
    }

    // ---- arena plumbing ----------------------------------------------------

    pub(crate) fn gc_box(&self, r: GcRef) -> &GcBox {
        match self.slots.get(r.index()).and_then(Option::as_ref) {
            Some(b) => b,
            None => unreachable!("dangling heap handle {r}"),
        }
    }

    pub(crate) fn gc_box_mut(&mut self, r: GcRef) -> &mut GcBox {
        match self.slots.get_mut(r.index()).and_then(Option::as_mut) {
            Some(b) => b,
            None => unreachable!("dangling heap handle {r}"),
        }
    }

    pub(crate) fn header(&self, r: GcRef) -> &Header {
        &self.gc_box(r).header
    }

    pub(crate) fn header_mut(&mut self, r: GcRef) -> &mut Header {
        &mut self.gc_box_mut(r).header
    }

    pub(crate) fn object(&self, r: GcRef) -> &Object {
        &self.gc_box(r).body
    }

    pub(crate) fn object_mut(&mut self, r: GcRef) -> &mut Object {
        &mut self.gc_box_mut(r).body
    }

    pub(crate) fn other_white(&self) -> Marks {
        self.current_white ^ Marks::WHITES
    }

    // Place a box into a slot and link it at the head of `allgc`, colored
    // with the current white. Does not charge debt.
    fn alloc_raw(&mut self, body: Object) -> GcRef {
        self.debt += object_size(&body) as isize;
        let boxed = GcBox {
            header: Header::new(self.current_white),
            body,
        };
        let r = match self.free_slots.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(boxed);
                GcRef(i)
            }
            None => {
                self.slots.push(Some(boxed));
                GcRef((self.slots.len() - 1) as u32)
            }
        };
        self.header_mut(r).next = self.allgc;
        self.allgc = Some(r);
        r
    }

    /// Register a new object: linked into `allgc`, colored current-white.
    /// Crossing the configured memory limit triggers an emergency cycle and
    /// then fails if the heap is still over.
    pub(crate) fn new_object(&mut self, body: Object) -> Result<GcRef, VmError> {
        if let Some(limit) = self.params.memory_limit {
            let incoming = object_size(&body);
            if self.total_allocated() + incoming > limit {
                tracing::debug!(limit, incoming, "memory limit hit, emergency collection");
                self.full_gc_internal(true)?;
                if self.total_allocated() + incoming > limit {
                    return Err(VmError::OutOfMemory);
                }
            }
        }
        Ok(self.alloc_raw(body))
    }

    // Move a freshly allocated object from `allgc` to the permanent list.
    fn fix(&mut self, r: GcRef) {
        debug_assert_eq!(self.allgc, Some(r), "only the newest object can be fixed");
        self.header_mut(r).white_to_gray();
        self.allgc = self.header(r).next;
        self.header_mut(r).next = self.fixedgc;
        self.fixedgc = Some(r);
    }

    pub(crate) fn free_slot(&mut self, o: GcRef) {
        self.slots[o.index()] = None;
        self.free_slots.push(o.0);
    }

    pub(crate) fn charge(&mut self, bytes: usize) {
        self.debt += bytes as isize;
    }

    pub(crate) fn credit(&mut self, bytes: usize) {
        self.debt -= bytes as isize;
    }

    // ---- constructors ------------------------------------------------------

    /// Intern or allocate a string. Content at or below the short limit is
    /// interned: equal text yields the same handle.
    pub fn new_string(&mut self, text: &str) -> Result<GcRef, VmError> {
        if text.len() <= SHORT_STR_LIMIT {
            let hash = self.strings.hash_of(text);
            let slots = &self.slots;
            let found = self.strings.find(hash, text, |r| {
                match slots.get(r.index()).and_then(Option::as_ref) {
                    Some(GcBox {
                        body: Object::Str(s),
                        ..
                    }) => s.as_str(),
                    _ => unreachable!("intern table holds only strings"),
                }
            });
            if let Some(r) = found {
                // may be dead if found while sweeping: resurrect it
                if self.header(r).is_dead(self.other_white()) {
                    let white = self.current_white;
                    self.header_mut(r).make_white(white);
                }
                return Ok(r);
            }
            let r = self.new_object(Object::Str(Str {
                text: text.into(),
                kind: StrKind::Short,
                hash,
            }))?;
            self.strings.insert(hash, r);
            Ok(r)
        } else {
            let hash = self.strings.hash_of(text);
            self.new_object(Object::Str(Str {
                text: text.into(),
                kind: StrKind::Long,
                hash,
            }))
        }
    }

    /// Allocate an empty table.
    pub fn new_table(&mut self) -> Result<GcRef, VmError> {
        self.new_object(Object::Table(Table::default()))
    }

    /// Allocate a table with size hints.
    pub fn new_table_with(&mut self, narray: usize, nhash: usize) -> Result<GcRef, VmError> {
        self.new_object(Object::Table(Table::with_capacity(narray, nhash)))
    }

    /// Allocate a fresh thread.
    pub fn new_thread(&mut self) -> Result<GcRef, VmError> {
        self.new_object(Object::Thread(Thread::default()))
    }

    /// Allocate userdata carrying a user value.
    pub fn new_userdata(&mut self, user_value: Value) -> Result<GcRef, VmError> {
        self.new_object(Object::Userdata(Userdata {
            user_value,
            metatable: None,
        }))
    }

    /// Register a finished prototype.
    pub fn new_proto(&mut self, proto: Proto) -> Result<GcRef, VmError> {
        self.new_object(Object::Proto(proto))
    }

    /// Allocate a closure over a prototype, its upvalues initialized to
    /// closed `nil`.
    pub fn new_closure(&mut self, proto: GcRef) -> Result<GcRef, VmError> {
        let n = match self.object(proto) {
            Object::Proto(p) => p.upvalues.len(),
            _ => unreachable!("closure over a non-prototype"),
        };
        let mut upvalues = Vec::with_capacity(n);
        for _ in 0..n {
            upvalues.push(self.new_object(Object::Upvalue(Upvalue::Closed(Value::Nil)))?);
        }
        self.new_object(Object::Closure(Closure { proto, upvalues }))
    }

    // ---- typed views -------------------------------------------------------

    /// Text of a string object.
    pub fn str_text(&self, r: GcRef) -> Option<&str> {
        match self.object(r) {
            Object::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Read-only view of a table.
    pub fn as_table(&self, r: GcRef) -> Option<&Table> {
        match self.object(r) {
            Object::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Read-only view of a prototype.
    pub fn as_proto(&self, r: GcRef) -> Option<&Proto> {
        match self.object(r) {
            Object::Proto(p) => Some(p),
            _ => None,
        }
    }

    /// Read-only view of a closure.
    pub fn as_closure(&self, r: GcRef) -> Option<&Closure> {
        match self.object(r) {
            Object::Closure(c) => Some(c),
            _ => None,
        }
    }

    /// Read-only view of a thread.
    pub fn as_thread(&self, r: GcRef) -> Option<&Thread> {
        match self.object(r) {
            Object::Thread(t) => Some(t),
            _ => None,
        }
    }

    /// Read-only view of an upvalue.
    pub fn as_upvalue(&self, r: GcRef) -> Option<&Upvalue> {
        match self.object(r) {
            Object::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    /// Color of an object, for audits and tests.
    pub fn color_of(&self, r: GcRef) -> &'static str {
        let h = self.header(r);
        if h.is_black() {
            "black"
        } else if h.is_white() {
            "white"
        } else {
            "gray"
        }
    }

    /// Whether a handle still points at a live slot.
    pub fn is_live(&self, r: GcRef) -> bool {
        self.slots
            .get(r.index())
            .map(Option::is_some)
            .unwrap_or(false)
    }

    // ---- mutation, behind barriers -----------------------------------------

    /// `t[key] = value`, maintaining the tri-color invariant.
    pub fn table_set(&mut self, t: GcRef, key: Value, value: Value) -> Result<(), VmError> {
        let key = TableKey::from_value(key)
            .ok_or_else(|| VmError::Runtime("table index is nil or NaN".into()))?;
        let parent_black = self.header(t).is_black();
        let needs_barrier = parent_black
            && [key.as_gc_ref(), value.as_gc_ref()]
                .into_iter()
                .flatten()
                .any(|c| self.header(c).is_white());
        let grew = match self.object_mut(t) {
            Object::Table(table) => table.set(key, value),
            _ => unreachable!("table_set on a non-table"),
        };
        self.charge(grew);
        if needs_barrier {
            self.barrier_back(t);
        }
        Ok(())
    }

    /// `t[key]`, raw (no metamethods).
    pub fn table_get(&self, t: GcRef, key: Value) -> Value {
        let Some(key) = TableKey::from_value(key) else {
            return Value::Nil;
        };
        match self.object(t) {
            Object::Table(table) => table.get(key),
            _ => Value::Nil,
        }
    }

    /// Push onto a thread's value stack.
    pub fn thread_push(&mut self, t: GcRef, value: Value) {
        match self.object_mut(t) {
            Object::Thread(th) => th.stack.push(value),
            _ => unreachable!("thread_push on a non-thread"),
        }
        self.charge(std::mem::size_of::<Value>());
        // threads stay gray through mark, so stack writes need no barrier
    }

    /// Truncate a thread's value stack, closing upvalues above the new top.
    pub fn thread_truncate(&mut self, t: GcRef, top: usize) {
        self.close_upvalues(t, top);
        match self.object_mut(t) {
            Object::Thread(th) => th.stack.truncate(top),
            _ => unreachable!("thread_truncate on a non-thread"),
        }
    }

    /// Write through an upvalue: open upvalues hit the owning stack slot,
    /// closed ones own the value (forward barrier).
    pub fn set_upvalue(&mut self, u: GcRef, value: Value) {
        let open = match self.object_mut(u) {
            Object::Upvalue(up) => match up {
                Upvalue::Open { thread, index, touched } => {
                    *touched = true;
                    Some((*thread, *index))
                }
                Upvalue::Closed(slot) => {
                    *slot = value;
                    None
                }
            },
            _ => unreachable!("set_upvalue on a non-upvalue"),
        };
        match open {
            Some((thread, index)) => match self.object_mut(thread) {
                Object::Thread(th) => th.stack[index] = value,
                _ => unreachable!("open upvalue points at a non-thread"),
            },
            None => self.upvalue_barrier(u),
        }
    }

    /// Read through an upvalue.
    pub fn get_upvalue(&self, u: GcRef) -> Value {
        match self.object(u) {
            Object::Upvalue(Upvalue::Closed(v)) => *v,
            Object::Upvalue(Upvalue::Open { thread, index, .. }) => match self.object(*thread) {
                Object::Thread(th) => th.stack.get(*index).copied().unwrap_or(Value::Nil),
                _ => Value::Nil,
            },
            _ => Value::Nil,
        }
    }

    /// Bind slot `i` of a closure to an upvalue object (forward barrier:
    /// closure reference sets are small and settle at construction).
    pub fn closure_bind_upvalue(&mut self, closure: GcRef, i: usize, upvalue: GcRef) {
        match self.object_mut(closure) {
            Object::Closure(c) => c.upvalues[i] = upvalue,
            _ => unreachable!("closure_bind_upvalue on a non-closure"),
        }
        self.barrier_object(closure, upvalue);
    }

    /// Find or create the open upvalue aliasing `stack[index]` of a thread.
    /// The owning thread joins `twups` on its first open upvalue.
    pub fn find_upvalue(&mut self, thread: GcRef, index: usize) -> Result<GcRef, VmError> {
        let existing = match self.object(thread) {
            Object::Thread(th) => th
                .open_upvalues
                .iter()
                .copied()
                .find(|&u| matches!(self.object(u), Object::Upvalue(Upvalue::Open { index: i, .. }) if *i == index)),
            _ => unreachable!("find_upvalue on a non-thread"),
        };
        if let Some(u) = existing {
            return Ok(u);
        }
        let u = self.new_object(Object::Upvalue(Upvalue::Open {
            thread,
            index,
            touched: true,
        }))?;
        // keep the list sorted by descending stack index so closing scans a
        // prefix
        let at = match self.object(thread) {
            Object::Thread(th) => th
                .open_upvalues
                .iter()
                .position(|&o| self.upvalue_stack_index(o).is_some_and(|i| i < index))
                .unwrap_or(th.open_upvalues.len()),
            _ => unreachable!(),
        };
        let join_twups = match self.object_mut(thread) {
            Object::Thread(th) => {
                th.open_upvalues.insert(at, u);
                !std::mem::replace(&mut th.in_twups, true)
            }
            _ => unreachable!(),
        };
        if join_twups {
            self.twups.push(thread);
        }
        Ok(u)
    }

    fn upvalue_stack_index(&self, u: GcRef) -> Option<usize> {
        match self.object(u) {
            Object::Upvalue(Upvalue::Open { index, .. }) => Some(*index),
            _ => None,
        }
    }

    /// Close every open upvalue at or above `level`: the stack value moves
    /// into the upvalue, which then owns it.
    pub fn close_upvalues(&mut self, thread: GcRef, level: usize) {
        loop {
            let next = match self.object(thread) {
                Object::Thread(th) => th.open_upvalues.iter().copied().find(|&u| {
                    matches!(self.object(u), Object::Upvalue(Upvalue::Open { index, .. }) if *index >= level)
                }),
                _ => unreachable!("close_upvalues on a non-thread"),
            };
            let Some(u) = next else { break };
            let value = self.get_upvalue(u);
            match self.object_mut(thread) {
                Object::Thread(th) => th.open_upvalues.retain(|&o| o != u),
                _ => unreachable!(),
            }
            match self.object_mut(u) {
                Object::Upvalue(up) => *up = Upvalue::Closed(value),
                _ => unreachable!(),
            }
            self.upvalue_barrier(u);
        }
    }

    // ---- metatables and finalizers -----------------------------------------

    /// The metatable governing a value: per-object for tables and userdata,
    /// per-type otherwise.
    pub fn metatable_of(&self, v: Value) -> Option<GcRef> {
        match v {
            Value::Table(r) => match self.object(r) {
                Object::Table(t) => t.metatable,
                _ => None,
            },
            Value::Userdata(r) => match self.object(r) {
                Object::Userdata(u) => u.metatable,
                _ => None,
            },
            other => self.metatables[other.type_tag() as usize],
        }
    }

    /// Install a metatable. Installing one with a `__gc` entry reclassifies
    /// the object as finalizable.
    pub fn set_metatable(&mut self, v: Value, mt: Option<GcRef>) -> Result<(), VmError> {
        match v {
            Value::Table(r) => {
                match self.object_mut(r) {
                    Object::Table(t) => t.metatable = mt,
                    _ => unreachable!(),
                }
                if let Some(m) = mt {
                    self.barrier(r, Value::Table(m));
                    self.check_finalizer(r);
                }
            }
            Value::Userdata(r) => {
                match self.object_mut(r) {
                    Object::Userdata(u) => u.metatable = mt,
                    _ => unreachable!(),
                }
                if let Some(m) = mt {
                    self.barrier(r, Value::Table(m));
                    self.check_finalizer(r);
                }
            }
            other => self.metatables[other.type_tag() as usize] = mt,
        }
        Ok(())
    }

    pub(crate) fn metafield(&self, mt: GcRef, name: GcRef) -> Value {
        match self.object(mt) {
            Object::Table(t) => t.get(TableKey::Str(name)),
            _ => Value::Nil,
        }
    }

    // ---- roots -------------------------------------------------------------

    /// The registry table (index 1: main thread, index 2: globals).
    pub fn registry(&self) -> Value {
        self.registry
    }

    /// The globals table.
    pub fn globals(&self) -> GcRef {
        let Value::Table(reg) = self.registry else {
            unreachable!("registry is always a table");
        };
        match self.table_get(reg, Value::Integer(2)) {
            Value::Table(g) => g,
            _ => unreachable!("registry slot 2 is always the globals table"),
        }
    }

    /// The main thread.
    pub fn main_thread(&self) -> GcRef {
        self.main_thread
    }

    /// The always-live out-of-memory message.
    pub fn memory_error_message(&self) -> GcRef {
        self.str_memerr
    }

    /// Root a value against collection (compile-time and host scratch).
    /// Returns the depth to pass back to [`Heap::truncate_anchors`].
    pub fn anchor(&mut self, v: Value) -> usize {
        let depth = self.anchors.len();
        if let Some(r) = v.as_gc_ref() {
            self.anchors.push(r);
        }
        depth
    }

    /// Root an object that is not first-class (prototypes, upvalues).
    pub fn anchor_object(&mut self, r: GcRef) -> usize {
        let depth = self.anchors.len();
        self.anchors.push(r);
        depth
    }

    /// Drop anchors back to a depth returned by [`Heap::anchor`].
    pub fn truncate_anchors(&mut self, depth: usize) {
        self.anchors.truncate(depth);
    }

    pub(crate) fn anchored(&self) -> Vec<GcRef> {
        self.anchors.clone()
    }

    // ---- protected execution ----------------------------------------------

    /// Run host code under a protected boundary: on error the main thread's
    /// data stack is truncated to its saved top.
    pub fn pcall<T>(
        &mut self,
        f: impl FnOnce(&mut Heap) -> Result<T, VmError>,
    ) -> Result<T, VmError> {
        let saved_top = match self.object(self.main_thread) {
            Object::Thread(th) => th.top(),
            _ => unreachable!(),
        };
        match f(self) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.thread_truncate(self.main_thread, saved_top);
                Err(e)
            }
        }
    }

    // ---- collector driver --------------------------------------------------

    /// Allocation debt in bytes; positive means a step is due.
    pub fn debt(&self) -> isize {
        self.debt
    }

    /// Total bytes currently accounted to the heap.
    pub fn total_allocated(&self) -> usize {
        (self.total_bytes + self.debt).max(0) as usize
    }

    /// Current collector phase.
    pub fn gc_state(&self) -> GcState {
        self.state
    }

    /// Pacing knobs.
    pub fn params_mut(&mut self) -> &mut GcParams {
        &mut self.params
    }

    /// Stop debt-driven collection; explicit `full_gc` still works.
    pub fn stop_gc(&mut self) {
        self.running = false;
    }

    /// Resume debt-driven collection.
    pub fn restart_gc(&mut self) {
        self.running = true;
        self.set_debt(0);
    }

    /// Whether debt-driven collection is enabled.
    pub fn gc_running(&self) -> bool {
        self.running
    }

    pub(crate) fn set_debt(&mut self, debt: isize) {
        let total = self.total_bytes + self.debt;
        self.total_bytes = total - debt;
        self.debt = debt;
    }

    fn scaled_debt(&self) -> isize {
        if self.debt <= 0 {
            return 0;
        }
        let adjusted = self.debt / STEP_MUL_ADJ + 1;
        adjusted.saturating_mul(self.params.step_mul as isize)
    }

    // Set the debt so the next cycle starts when usage reaches
    // `estimate * pause / 100`.
    pub(crate) fn enter_pause(&mut self) {
        let estimate = (self.estimate / PAUSE_ADJ).max(1);
        let threshold = estimate.saturating_mul(self.params.pause as usize);
        let debt = self.total_allocated() as isize - threshold as isize;
        self.set_debt(debt);
        tracing::trace!(
            estimate = self.estimate,
            threshold,
            "collection cycle finished"
        );
    }

    /// Designated safe point: advance the collector if debt is due.
    pub fn check_gc(&mut self) -> Result<(), VmError> {
        if self.debt > 0 {
            self.step()?;
        }
        Ok(())
    }

    /// Advance the collector by one debt-sized slice.
    pub fn step(&mut self) -> Result<(), VmError> {
        if !self.running {
            self.set_debt(-GC_STEP_SIZE * 10);
            return Ok(());
        }
        let mut debt = self.scaled_debt();
        loop {
            let work = self.single_step()?;
            debt -= work as isize;
            if debt <= -GC_STEP_SIZE || self.state == GcState::Pause {
                break;
            }
        }
        if self.state == GcState::Pause {
            self.enter_pause();
        } else {
            let debt = debt / self.params.step_mul as isize * STEP_MUL_ADJ;
            self.set_debt(debt);
        }
        Ok(())
    }

    /// Advance exactly one state-machine transition, finer-grained than
    /// [`Heap::step`]; returns the work performed. Embedders use this for
    /// precise scheduling, tests for observing intermediate colors.
    pub fn single_step(&mut self) -> Result<usize, VmError> {
        match self.state {
            GcState::Pause => {
                let work = self.restart_collection();
                self.state = GcState::Propagate;
                tracing::trace!("mark phase started");
                Ok(work)
            }
            GcState::Propagate => {
                let work = self.propagate_mark();
                if self.gray.is_empty() {
                    self.state = GcState::Atomic;
                }
                Ok(work)
            }
            GcState::Atomic => {
                let work = self.atomic();
                self.enter_sweep();
                self.estimate = self.total_allocated();
                tracing::trace!(estimate = self.estimate, "atomic phase done");
                Ok(work)
            }
            GcState::SweepAllGc | GcState::SweepFinObj | GcState::SweepToBeFnz => {
                Ok(self.sweep_step())
            }
            GcState::SweepEnd => {
                if !self.emergency {
                    self.strings.shrink_if_sparse();
                }
                self.state = GcState::CallFin;
                Ok(0)
            }
            GcState::CallFin => {
                if self.tobefnz.is_some() && !self.emergency {
                    let ran = self.run_a_few_finalizers(GC_FIN_NUM)?;
                    Ok(ran * FINALIZE_COST)
                } else {
                    self.state = GcState::Pause;
                    Ok(0)
                }
            }
        }
    }

    /// Run a complete collection cycle to completion.
    pub fn full_gc(&mut self) -> Result<(), VmError> {
        self.full_gc_internal(false)
    }

    // Enumerate the strong references of an object; weak sides of weak
    // tables are skipped because the invariant does not cover them.
    fn for_each_strong_child(&self, r: GcRef, f: &mut dyn FnMut(GcRef)) {
        let mut value = |v: Value, f: &mut dyn FnMut(GcRef)| {
            if let Some(c) = v.as_gc_ref() {
                f(c);
            }
        };
        match self.object(r) {
            Object::Str(_) => {}
            Object::Table(t) => {
                let (weak_keys, weak_values) = self.table_weakness(r);
                if let Some(m) = t.metatable {
                    f(m);
                }
                if !weak_values {
                    for v in &t.array {
                        value(*v, f);
                    }
                }
                for (k, v) in t.hash.iter() {
                    if !weak_keys {
                        if let Some(c) = k.as_gc_ref() {
                            f(c);
                        }
                    }
                    // ephemeron values are only conditionally strong; the
                    // plain invariant covers neither weak side
                    if !weak_values && !weak_keys {
                        value(*v, f);
                    }
                }
            }
            Object::Proto(p) => {
                if let Some(s) = p.source {
                    f(s);
                }
                for v in &p.constants {
                    value(*v, f);
                }
                for &c in &p.protos {
                    f(c);
                }
                for u in &p.upvalues {
                    if let Some(n) = u.name {
                        f(n);
                    }
                }
                for l in &p.locals {
                    f(l.name);
                }
            }
            Object::Closure(c) => {
                f(c.proto);
                for &u in &c.upvalues {
                    f(u);
                }
            }
            Object::Upvalue(u) => match u {
                Upvalue::Open { thread, .. } => f(*thread),
                Upvalue::Closed(v) => value(*v, f),
            },
            Object::Userdata(u) => {
                if let Some(m) = u.metatable {
                    f(m);
                }
                value(u.user_value, f);
            }
            Object::Thread(t) => {
                for v in &t.stack {
                    value(*v, f);
                }
            }
        }
    }

    /// Audit the tri-color invariant: while marking, no black object may
    /// hold a strong reference to a white one. Returns human-readable
    /// descriptions of every violation found (empty outside mark phases).
    pub fn tricolor_violations(&self) -> Vec<String> {
        if !self.keep_invariant() {
            return Vec::new();
        }
        let mut violations = Vec::new();
        for i in 0..self.slots.len() {
            if self.slots[i].is_none() {
                continue;
            }
            let parent = GcRef(i as u32);
            if !self.header(parent).is_black() {
                continue;
            }
            self.for_each_strong_child(parent, &mut |child| {
                if self.header(child).is_white() {
                    violations.push(format!(
                        "black {} {parent} references white {} {child}",
                        self.object(parent).kind(),
                        self.object(child).kind(),
                    ));
                }
            });
        }
        violations
    }

    pub(crate) fn full_gc_internal(&mut self, emergency: bool) -> Result<(), VmError> {
        self.emergency = emergency;
        if emergency {
            tracing::debug!("emergency collection");
        }
        let result = (|| {
            // a half-done mark phase may hold stale grays: restart from a
            // clean sweep so every object is white when the cycle begins
            if matches!(self.state, GcState::Propagate | GcState::Atomic) {
                self.enter_sweep();
            }
            while self.state != GcState::Pause {
                self.single_step()?;
            }
            self.single_step()?; // restart the collection
            while self.state != GcState::Pause {
                self.single_step()?;
            }
            self.enter_pause();
            Ok(())
        })();
        self.emergency = false;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn pacing_knobs_are_clamped() {
        let mut params = GcParams::default();
        params.set_pause(0);
        assert_eq!(params.pause(), 10);
        params.set_step_mul(u32::MAX);
        assert_eq!(params.step_mul(), GcParams::MAX_PERCENT);
    }

    #[test]
    fn the_two_whites_alternate_every_cycle() {
        let mut heap = Heap::new();
        let before = heap.current_white;
        heap.full_gc().expect("collection");
        assert_eq!(heap.current_white, before ^ Marks::WHITES);
        heap.full_gc().expect("collection");
        assert_eq!(heap.current_white, before);
    }

    #[test]
    fn set_debt_preserves_the_total() {
        let mut heap = Heap::new();
        let total = heap.total_allocated();
        heap.set_debt(-10_000);
        assert_eq!(heap.total_allocated(), total);
        heap.set_debt(500);
        assert_eq!(heap.total_allocated(), total);
    }

    #[test_case("" ; "empty string")]
    #[test_case("short" ; "plain word")]
    fn bootstrap_objects_survive_interning_traffic(extra: &str) {
        let mut heap = Heap::new();
        let gc = heap.str_gc;
        let _ = heap.new_string(extra).expect("intern");
        heap.full_gc().expect("collection");
        assert!(heap.is_live(gc));
        assert_eq!(heap.new_string("__gc").expect("intern"), gc);
    }
}
