//! Collector scenarios: reachability, barriers, weak tables, finalizers and
//! pacing, driven the way a host runtime would.

use mica_vm::{GcState, Heap, Value, VmError};

fn set(heap: &mut Heap, t: mica_vm::GcRef, k: Value, v: Value) {
    heap.table_set(t, k, v).expect("valid table write");
}

#[test]
fn unreachable_objects_are_freed_and_roots_survive() {
    let mut heap = Heap::new();
    let kept = heap.new_table().expect("alloc");
    heap.anchor(Value::Table(kept));
    let garbage = heap.new_table().expect("alloc");

    heap.full_gc().expect("collection");

    assert!(heap.is_live(kept));
    assert!(!heap.is_live(garbage));
}

#[test]
fn a_second_collection_frees_nothing_new() {
    let mut heap = Heap::new();
    let kept = heap.new_table().expect("alloc");
    heap.anchor(Value::Table(kept));
    for i in 0..64 {
        let t = heap.new_table().expect("alloc");
        if i % 2 == 0 {
            set(&mut heap, kept, Value::Integer(i), Value::Table(t));
        }
    }

    heap.full_gc().expect("first collection");
    let after_first = heap.total_allocated();
    heap.full_gc().expect("second collection");
    assert_eq!(
        heap.total_allocated(),
        after_first,
        "an idle heap must be a fixpoint of collection"
    );
}

// Spec scenario: a black table acquiring a white reference must trip a
// barrier; at no observable point is the invariant broken.
#[test]
fn write_barrier_preserves_the_invariant_mid_cycle() {
    let mut heap = Heap::new();
    let t = heap.new_table().expect("alloc");
    heap.anchor(Value::Table(t));

    // walk the machine into the mark phase until `t` has been scanned
    heap.single_step().expect("restart");
    assert_eq!(heap.gc_state(), GcState::Propagate);
    for _ in 0..1000 {
        if heap.color_of(t) == "black" || heap.gc_state() != GcState::Propagate {
            break;
        }
        heap.single_step().expect("propagate");
    }
    assert_eq!(heap.color_of(t), "black", "anchored table must be scanned");
    assert_eq!(heap.gc_state(), GcState::Propagate);

    let v = heap.new_table().expect("alloc");
    assert_eq!(heap.color_of(v), "white");
    set(&mut heap, t, Value::Integer(1), Value::Table(v));

    assert!(
        heap.color_of(t) == "gray" || heap.color_of(v) != "white",
        "one of the two barriers must have fired"
    );
    assert!(heap.tricolor_violations().is_empty());

    heap.full_gc().expect("finish the cycle");
    assert!(heap.is_live(v), "the new reference must survive the cycle");
}

#[test]
fn the_audit_walk_stays_clean_across_a_mutating_workload() {
    let mut heap = Heap::new();
    let root = heap.new_table().expect("alloc");
    heap.anchor(Value::Table(root));
    let mut last = root;
    for i in 0..400i64 {
        let t = heap.new_table().expect("alloc");
        set(&mut heap, last, Value::Integer(1), Value::Table(t));
        set(&mut heap, root, Value::Integer(i % 16), Value::Table(t));
        last = t;
        heap.single_step().expect("incremental slice");
        assert!(
            heap.tricolor_violations().is_empty(),
            "invariant broken at iteration {i}"
        );
    }
}

fn weak_table(heap: &mut Heap, mode: &str) -> mica_vm::GcRef {
    let t = heap.new_table().expect("alloc");
    heap.anchor(Value::Table(t));
    let mt = heap.new_table().expect("alloc");
    heap.anchor(Value::Table(mt));
    let key = heap.new_string("__mode").expect("intern");
    let value = heap.new_string(mode).expect("intern");
    set(heap, mt, Value::Str(key), Value::Str(value));
    heap.set_metatable(Value::Table(t), Some(mt)).expect("mt");
    t
}

#[test]
fn weak_values_are_cleared_when_unreachable() {
    let mut heap = Heap::new();
    let t = weak_table(&mut heap, "v");

    let dead = heap.new_table().expect("alloc");
    set(&mut heap, t, Value::Integer(1), Value::Table(dead));
    set(&mut heap, t, Value::Integer(100), Value::Table(dead));

    let kept = heap.new_table().expect("alloc");
    heap.anchor(Value::Table(kept));
    set(&mut heap, t, Value::Integer(2), Value::Table(kept));

    heap.full_gc().expect("collection");

    assert!(!heap.is_live(dead));
    assert_eq!(heap.table_get(t, Value::Integer(1)), Value::Nil);
    assert_eq!(heap.table_get(t, Value::Integer(100)), Value::Nil);
    assert_eq!(heap.table_get(t, Value::Integer(2)), Value::Table(kept));
}

#[test]
fn ephemeron_cycle_collects_both_sides() {
    let mut heap = Heap::new();
    let t = weak_table(&mut heap, "k");

    // k and v keep each other alive only through the ephemeron entry
    let k = heap.new_table().expect("alloc");
    let v = heap.new_table().expect("alloc");
    set(&mut heap, v, Value::Integer(1), Value::Table(k));
    set(&mut heap, t, Value::Table(k), Value::Table(v));

    // an independently reachable key keeps its value alive
    let live_key = heap.new_table().expect("alloc");
    heap.anchor(Value::Table(live_key));
    let live_value = heap.new_table().expect("alloc");
    set(&mut heap, t, Value::Table(live_key), Value::Table(live_value));

    heap.full_gc().expect("collection");

    assert!(!heap.is_live(k), "key only reachable through its own entry");
    assert!(!heap.is_live(v));
    assert!(heap.is_live(live_value), "value with a live key survives");
    let table = heap.as_table(t).expect("weak table");
    assert_eq!(table.hash_len(), 1, "the dead entry is purged");
}

fn resurrect(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let key = heap.new_string("saved")?;
    let globals = heap.globals();
    heap.table_set(globals, Value::Str(key), args[0])?;
    Ok(Value::Nil)
}

#[test]
fn finalizers_resurrect_once_and_never_run_twice() {
    let mut heap = Heap::new();
    let mt = heap.new_table().expect("alloc");
    heap.anchor(Value::Table(mt));
    let gc_key = heap.new_string("__gc").expect("intern");
    set(&mut heap, mt, Value::Str(gc_key), Value::NativeFn(resurrect));

    let o = heap.new_table().expect("alloc");
    heap.set_metatable(Value::Table(o), Some(mt)).expect("mt");
    assert!(heap.is_finalizable(o));

    // first cycle: unreachable, finalized, resurrected into the globals
    heap.full_gc().expect("first collection");
    assert!(heap.is_live(o), "finalizer made the object reachable again");
    assert!(!heap.is_finalizable(o), "the finalizer flag is spent");
    let saved_key = heap.new_string("saved").expect("intern");
    assert_eq!(
        heap.table_get(heap.globals(), Value::Str(saved_key)),
        Value::Table(o)
    );

    // second cycle with the object reachable: nothing happens
    heap.full_gc().expect("second collection");
    assert!(heap.is_live(o));

    // drop the last reference: collected for real, finalizer not re-run
    heap.table_set(heap.globals(), Value::Str(saved_key), Value::Nil)
        .expect("clear");
    heap.full_gc().expect("third collection");
    assert!(!heap.is_live(o));
    assert_eq!(
        heap.table_get(heap.globals(), Value::Str(saved_key)),
        Value::Nil,
        "a spent finalizer must not resurrect again"
    );
}

fn faulty_finalizer(_heap: &mut Heap, _args: &[Value]) -> Result<Value, VmError> {
    Err(VmError::Runtime("boom".into()))
}

#[test]
fn finalizer_errors_are_wrapped_and_rethrown() {
    let mut heap = Heap::new();
    let mt = heap.new_table().expect("alloc");
    heap.anchor(Value::Table(mt));
    let gc_key = heap.new_string("__gc").expect("intern");
    set(&mut heap, mt, Value::Str(gc_key), Value::NativeFn(faulty_finalizer));

    let o = heap.new_table().expect("alloc");
    heap.set_metatable(Value::Table(o), Some(mt)).expect("mt");

    let err = heap.full_gc().expect_err("the __gc error must surface");
    match &err {
        VmError::GcMetamethod(inner) => assert_eq!(inner, "boom"),
        other => panic!("expected a wrapped metamethod error, got {other}"),
    }
    assert_eq!(err.to_string(), "error in __gc metamethod (boom)");
}

#[test]
fn crossing_the_memory_limit_triggers_emergency_collection() {
    let mut heap = Heap::new();
    let headroom = 64 * 1024;
    let limit = heap.total_allocated() + headroom;
    heap.params_mut().set_memory_limit(Some(limit));

    // garbage churn far past the limit succeeds: emergency cycles reclaim
    for _ in 0..4096 {
        heap.new_table().expect("garbage stays collectable");
    }

    // anchored growth eventually cannot be satisfied
    let mut failed = None;
    for _ in 0..16384 {
        match heap.new_table() {
            Ok(t) => {
                heap.anchor(Value::Table(t));
            }
            Err(e) => {
                failed = Some(e);
                break;
            }
        }
    }
    assert_eq!(failed, Some(VmError::OutOfMemory));
    assert_eq!(
        heap.str_text(heap.memory_error_message()),
        Some("not enough memory"),
        "the message object is pre-allocated and always live"
    );
}

#[test]
fn short_strings_intern_and_long_strings_do_not() {
    let mut heap = Heap::new();
    let a = heap.new_string("hello").expect("intern");
    let b = heap.new_string("hello").expect("intern");
    assert_eq!(a, b);

    let long = "x".repeat(64);
    let l1 = heap.new_string(&long).expect("alloc");
    let l2 = heap.new_string(&long).expect("alloc");
    assert_ne!(l1, l2, "long strings are not interned");

    // fixed strings survive any number of cycles
    heap.full_gc().expect("collection");
    heap.full_gc().expect("collection");
    assert_eq!(
        heap.str_text(heap.memory_error_message()),
        Some("not enough memory")
    );
}

#[test]
fn debt_driven_steps_keep_a_churning_heap_bounded() {
    let mut heap = Heap::new();
    for _ in 0..20_000 {
        heap.new_table().expect("alloc");
        heap.check_gc().expect("safe point");
    }
    assert!(
        heap.total_allocated() < 8 * 1024 * 1024,
        "collector must keep pace with garbage churn"
    );
}

#[test]
fn a_stopped_collector_ignores_debt() {
    let mut heap = Heap::new();
    heap.stop_gc();
    assert!(!heap.gc_running());
    for _ in 0..256 {
        heap.new_table().expect("alloc");
        heap.check_gc().expect("safe point");
    }
    assert_eq!(heap.gc_state(), GcState::Pause, "no cycle may have started");

    heap.restart_gc();
    heap.full_gc().expect("explicit collection still works");
}

#[test]
fn upvalues_close_over_thread_stack_slots() {
    let mut heap = Heap::new();
    let th = heap.new_thread().expect("alloc");
    heap.anchor(Value::Thread(th));
    heap.thread_push(th, Value::Integer(7));
    heap.thread_push(th, Value::Integer(8));

    let u = heap.find_upvalue(th, 1).expect("open upvalue");
    heap.anchor_object(u);
    let again = heap.find_upvalue(th, 1).expect("same slot");
    assert_eq!(u, again, "one upvalue object per stack slot");

    heap.set_upvalue(u, Value::Integer(42));
    assert_eq!(heap.get_upvalue(u), Value::Integer(42));

    heap.close_upvalues(th, 1);
    assert!(matches!(
        heap.as_upvalue(u),
        Some(mica_vm::Upvalue::Closed(Value::Integer(42)))
    ));

    // the closed upvalue now owns the value, independent of the stack
    heap.thread_truncate(th, 0);
    heap.full_gc().expect("collection");
    assert_eq!(heap.get_upvalue(u), Value::Integer(42));
}
