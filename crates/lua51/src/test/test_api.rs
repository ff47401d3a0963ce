// Embedding-API tests: stack discipline with negative indices, global
// shortcuts, host closures, and protected entry points.

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVM, OpCode};
use crate::test::*;

#[test]
fn test_push_get_pop() {
    let mut vm = LuaVM::new();
    vm.push(num(1.0)).unwrap();
    vm.push(num(2.0)).unwrap();
    vm.push(num(3.0)).unwrap();
    assert_eq!(vm.top_count(), 3);
    assert_eq!(vm.get(1).nvalue(), 1.0);
    assert_eq!(vm.get(3).nvalue(), 3.0);
    // Negative indices count from the top.
    assert_eq!(vm.get(-1).nvalue(), 3.0);
    assert_eq!(vm.get(-3).nvalue(), 1.0);
    // Out of range reads nil.
    assert!(vm.get(4).is_nil());
    assert!(vm.get(-4).is_nil());
    vm.pop(2);
    assert_eq!(vm.top_count(), 1);
    assert_eq!(vm.get(-1).nvalue(), 1.0);
    vm.pop(1);
}

#[test]
fn test_api_call_convention() {
    let mut vm = LuaVM::new();
    fn add(vm: &mut LuaVM) -> LuaResult<usize> {
        let a = vm.arg(1).and_then(|v| v.as_number()).unwrap_or(0.0);
        let b = vm.arg(2).and_then(|v| v.as_number()).unwrap_or(0.0);
        vm.push_value(LuaValue::number(a + b))?;
        Ok(1)
    }
    vm.push(LuaValue::cfunction(add)).unwrap();
    vm.push(num(2.0)).unwrap();
    vm.push(num(40.0)).unwrap();
    vm.call(2, 1).unwrap();
    assert_eq!(vm.top_count(), 1);
    assert_eq!(vm.get(-1).nvalue(), 42.0);
    vm.pop(1);
}

#[test]
fn test_api_pcall_catches() {
    let mut vm = LuaVM::new();
    fn failing(vm: &mut LuaVM) -> LuaResult<usize> {
        Err(vm.error("api failure"))
    }
    vm.push(LuaValue::cfunction(failing)).unwrap();
    let ok = vm.pcall(0, 0).unwrap();
    assert!(!ok);
    // The error value replaced the function slot.
    let err = vm.get(-1);
    assert!(vm.display_value(&err).contains("api failure"));
    vm.pop(1);
}

#[test]
fn test_globals_shortcut() {
    let mut vm = LuaVM::new();
    let v = vm.new_string("value");
    vm.set_global("config", v);
    assert!(vm.get_global("config").raw_equal(&v));
    assert!(vm.get_global("missing").is_nil());
}

#[test]
fn test_new_table_api() {
    let mut vm = LuaVM::new();
    let t = vm.new_table(4, 4);
    assert!(t.is_table());
    vm.table_set_int(t.hvalue(), 1, num(11.0));
    assert_eq!(vm.table_get(t.hvalue(), &num(1.0)).nvalue(), 11.0);
}

#[test]
fn test_native_closure_upvalues() {
    let mut vm = LuaVM::new();
    fn counter(vm: &mut LuaVM) -> LuaResult<usize> {
        let n = vm.native_upvalue(0).and_then(|v| v.as_number()).unwrap_or(0.0);
        vm.push_value(LuaValue::number(n + 1.0))?;
        Ok(1)
    }
    let f = vm.new_native_closure(counter, vec![num(10.0)]);
    let r = vm.call_value(f, &[]).unwrap();
    assert_eq!(r[0].nvalue(), 11.0);
}

#[test]
fn test_run_chunk_end_to_end() {
    let mut vm = LuaVM::new();
    // Chunk returning its first vararg plus one.
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::Vararg, 0, 2, 0),
            abc(OpCode::Add, 0, 0, kst(0)),
            abc(OpCode::Return, 0, 2, 0),
        ],
        k: vec![num(1.0)],
        is_vararg: true,
        max_stack: 2,
        ..Default::default()
    });
    let dumped = vm.dump_proto(&p);
    let r = vm.run_chunk(&dumped, &[num(41.0)]).unwrap();
    assert_eq!(r[0].nvalue(), 42.0);
}

#[test]
fn test_open_libs_installs_core_functions() {
    let mut vm = LuaVM::new();
    vm.open_libs().unwrap();
    assert!(vm.get_global("pcall").is_function());
    assert!(vm.get_global("setmetatable").is_function());
    assert!(vm.get_global("type").is_function());
    let co = vm.get_global("coroutine");
    assert!(co.is_table());
    let kresume = vm.new_string("resume");
    assert!(vm.table_get(co.hvalue(), &kresume).is_function());
}

#[test]
fn test_stdlib_type_and_tostring() {
    let mut vm = LuaVM::new();
    vm.open_libs().unwrap();
    let type_fn = vm.get_global("type");
    let t = vm.new_table(0, 0);
    let r = vm.call_value(type_fn, &[t]).unwrap();
    assert_eq!(vm.display_value(&r[0]), "table");

    let tostring_fn = vm.get_global("tostring");
    let r2 = vm.call_value(tostring_fn, &[num(0.5)]).unwrap();
    assert_eq!(vm.display_value(&r2[0]), "0.5");
}

#[test]
fn test_stdlib_select_and_unpack() {
    let mut vm = LuaVM::new();
    vm.open_libs().unwrap();
    let select_fn = vm.get_global("select");
    let hash = vm.new_string("#");
    let r = vm
        .call_value(select_fn, &[hash, num(7.0), num(8.0), num(9.0)])
        .unwrap();
    assert_eq!(r[0].nvalue(), 3.0);

    let unpack_fn = vm.get_global("unpack");
    let t = vm.new_table(3, 0);
    for i in 1..=3 {
        vm.table_set_int(t.hvalue(), i, num(i as f64));
    }
    let r2 = vm.call_value(unpack_fn, &[t]).unwrap();
    assert_eq!(r2.len(), 3);
    assert_eq!(r2[2].nvalue(), 3.0);
}
