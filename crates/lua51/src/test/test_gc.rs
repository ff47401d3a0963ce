// Collector tests: reachability, cycles, weak values, finalizers, the
// tri-color steady-state invariant, and the control surface.

use crate::gc::GcState;
use crate::lua_value::LuaValue;
use crate::lua_vm::{GcOption, LuaResult, LuaVM};
use crate::test::num;

#[test]
fn test_unreachable_table_is_collected() {
    let mut vm = LuaVM::new();
    let live_before = vm.pool.tables.live_count();
    for _ in 0..10 {
        let _t = vm.new_table(0, 4); // dropped: never rooted
    }
    assert_eq!(vm.pool.tables.live_count(), live_before + 10);
    vm.collect_garbage();
    assert_eq!(vm.pool.tables.live_count(), live_before);
}

#[test]
fn test_rooted_table_survives() {
    let mut vm = LuaVM::new();
    let t = vm.new_table(0, 0);
    vm.set_global("keep", t);
    vm.collect_garbage();
    assert!(vm.get_global("keep").is_table());
    // Now unreachable.
    vm.set_global("keep", LuaValue::nil());
    let live = vm.pool.tables.live_count();
    vm.collect_garbage();
    assert_eq!(vm.pool.tables.live_count(), live - 1);
}

/// Cycles die together: two tables referencing each other, unreachable
/// from the roots, are both reclaimed.
#[test]
fn test_cycle_collected() {
    let mut vm = LuaVM::new();
    let live_before = vm.pool.tables.live_count();
    {
        let a = vm.new_table(0, 1);
        let b = vm.new_table(0, 1);
        let kother = vm.new_string("other");
        let _ = vm.table_set(a.hvalue(), kother, b);
        let _ = vm.table_set(b.hvalue(), kother, a);
    }
    vm.collect_garbage();
    assert_eq!(vm.pool.tables.live_count(), live_before);
}

/// S5: a weak-value table loses entries whose values became garbage.
#[test]
fn test_weak_value_table_cleared() {
    let mut vm = LuaVM::new();
    let t = vm.new_table(0, 0);
    vm.set_global("t", t);
    let mt = vm.new_table(0, 1);
    let kmode = vm.new_string("__mode");
    let vmode = vm.new_string("v");
    let _ = vm.table_set(mt.hvalue(), kmode, vmode);
    vm.set_metatable(&t, Some(mt.hvalue()));

    {
        let inner = vm.new_table(0, 0);
        vm.table_set_int(t.hvalue(), 1, inner);
    }
    // Two full cycles so the entry is examined after the value died.
    vm.collect_garbage();
    vm.collect_garbage();
    assert!(vm.pool.table(t.hvalue()).get_int(1).is_nil());
}

/// Strong entries in the same table survive.
#[test]
fn test_weak_value_table_keeps_reachable_values() {
    let mut vm = LuaVM::new();
    let t = vm.new_table(0, 0);
    vm.set_global("t", t);
    let mt = vm.new_table(0, 1);
    let kmode = vm.new_string("__mode");
    let vmode = vm.new_string("v");
    let _ = vm.table_set(mt.hvalue(), kmode, vmode);
    vm.set_metatable(&t, Some(mt.hvalue()));

    let kept = vm.new_table(0, 0);
    vm.set_global("kept", kept); // strong reference elsewhere
    vm.table_set_int(t.hvalue(), 1, kept);
    vm.collect_garbage();
    vm.collect_garbage();
    assert!(vm.pool.table(t.hvalue()).get_int(1).is_table());
}

#[test]
fn test_weak_key_table_cleared() {
    let mut vm = LuaVM::new();
    let t = vm.new_table(0, 0);
    vm.set_global("t", t);
    let mt = vm.new_table(0, 1);
    let kmode = vm.new_string("__mode");
    let kval = vm.new_string("k");
    let _ = vm.table_set(mt.hvalue(), kmode, kval);
    vm.set_metatable(&t, Some(mt.hvalue()));

    {
        let key = vm.new_table(0, 0);
        let _ = vm.table_set(t.hvalue(), key, num(1.0));
    }
    vm.collect_garbage();
    vm.collect_garbage();
    assert_eq!(vm.pool.table(t.hvalue()).entry_count(), 0);
}

/// __gc runs once, in a protected environment, when the object becomes
/// unreachable; the object is resurrected for the call.
#[test]
fn test_finalizer_runs() {
    let mut vm = LuaVM::new();
    fn finalizer(vm: &mut LuaVM) -> LuaResult<usize> {
        vm.set_global("finalized", LuaValue::boolean(true));
        Ok(0)
    }
    let mt = vm.new_table(0, 1);
    let kgc = vm.new_string("__gc");
    let _ = vm.table_set(mt.hvalue(), kgc, LuaValue::cfunction(finalizer));
    vm.set_global("mt", mt); // keep the metatable itself alive
    {
        let victim = vm.new_table(0, 0);
        vm.set_metatable(&victim, Some(mt.hvalue()));
    }
    assert!(vm.get_global("finalized").is_nil());
    vm.collect_garbage();
    assert!(vm.get_global("finalized").bvalue());
}

/// A raising finalizer is captured, not propagated.
#[test]
fn test_failing_finalizer_is_contained() {
    let mut vm = LuaVM::new();
    fn bad_finalizer(vm: &mut LuaVM) -> LuaResult<usize> {
        Err(vm.error("finalizer exploded"))
    }
    let mt = vm.new_table(0, 1);
    let kgc = vm.new_string("__gc");
    let _ = vm.table_set(mt.hvalue(), kgc, LuaValue::cfunction(bad_finalizer));
    vm.set_global("mt", mt);
    {
        let victim = vm.new_table(0, 0);
        vm.set_metatable(&victim, Some(mt.hvalue()));
    }
    vm.collect_garbage();
    let recorded = vm.last_finalizer_error.clone().unwrap_or_default();
    assert!(recorded.contains("finalizer exploded"), "{recorded}");
}

/// Steady state (Pause): nothing is gray.
#[test]
fn test_no_gray_objects_at_pause() {
    let mut vm = LuaVM::new();
    for i in 0..50 {
        let t = vm.new_table(i % 4, 2);
        if i % 3 == 0 {
            vm.set_global("anchor", t);
        }
    }
    vm.collect_garbage();
    assert_eq!(vm.gc.state, GcState::Pause);
    for i in 0..vm.pool.tables.slot_count() {
        if let Some(obj) = vm.pool.tables.slot(i) {
            assert!(!obj.header.is_gray());
        }
    }
    for i in 0..vm.pool.strings.slot_count() {
        if let Some(obj) = vm.pool.strings.slot(i) {
            assert!(!obj.header.is_gray());
        }
    }
}

/// stepmul 0 stalls the collector; garbage only goes away on a forced
/// full collection.
#[test]
fn test_stepmul_zero_disables_collection() {
    let mut vm = LuaVM::new();
    vm.gc_control(GcOption::SetStepMul(0));
    let live_before = vm.pool.tables.live_count();
    for _ in 0..100 {
        let _t = vm.new_table(0, 4);
        vm.check_gc();
    }
    // Nothing was reclaimed incrementally.
    assert_eq!(vm.pool.tables.live_count(), live_before + 100);
    vm.gc_control(GcOption::SetStepMul(200));
    vm.gc_control(GcOption::Collect);
    assert_eq!(vm.pool.tables.live_count(), live_before);
}

#[test]
fn test_gc_stop_and_restart() {
    let mut vm = LuaVM::new();
    vm.gc_control(GcOption::Stop);
    assert!(!vm.gc.running);
    let live_before = vm.pool.tables.live_count();
    for _ in 0..50 {
        let _t = vm.new_table(0, 2);
        vm.check_gc();
    }
    assert_eq!(vm.pool.tables.live_count(), live_before + 50);
    vm.gc_control(GcOption::Restart);
    vm.gc_control(GcOption::Collect);
    assert_eq!(vm.pool.tables.live_count(), live_before);
}

#[test]
fn test_count_tracks_allocation() {
    let mut vm = LuaVM::new();
    let kb_before = vm.gc_control(GcOption::Count);
    vm.gc_control(GcOption::Stop);
    let mut keep = Vec::new();
    for _ in 0..200 {
        keep.push(vm.new_table(16, 16));
    }
    for (i, t) in keep.iter().enumerate() {
        // Root them so collection cannot shrink the count.
        let key = vm.new_string(&format!("k{}", i));
        let g = vm.globals_table();
        let _ = vm.table_set(g, key, *t);
    }
    let kb_after = vm.gc_control(GcOption::Count);
    assert!(kb_after > kb_before);
}

/// Values reachable only through a closure's upvalues survive.
#[test]
fn test_closed_upvalue_roots_value() {
    let mut vm = LuaVM::new();
    let inner = vm.new_table(0, 0);
    let uv = vm.alloc_upvalue(crate::lua_vm::Upvalue::Closed(inner));
    // A Lua closure holding the cell, itself rooted via a global.
    let proto = crate::test::make_proto(crate::test::ProtoCfg {
        code: vec![
            crate::test::abc(crate::lua_vm::OpCode::GetUpval, 0, 0, 0),
            crate::test::abc(crate::lua_vm::OpCode::Return, 0, 2, 0),
        ],
        nups: 1,
        max_stack: 2,
        ..Default::default()
    });
    let closure = vm.new_lua_closure(proto, vec![uv]);
    vm.set_global("keeper", closure);

    let live = vm.pool.tables.live_count();
    vm.collect_garbage();
    assert_eq!(vm.pool.tables.live_count(), live);
    // The cell still yields the table.
    let r = vm.call_value(closure, &[]).unwrap();
    assert!(r[0].is_table());
}
