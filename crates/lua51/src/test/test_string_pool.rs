// String pool tests: interning identity, the raw-equality law, weak
// pool entries, and the sampled hash.

use crate::lua_value::{SHORT_STRING_LIMIT, lua_str_hash};
use crate::lua_vm::LuaVM;

#[test]
fn test_interning_identity() {
    let mut vm = LuaVM::new();
    let a = vm.new_string("hello");
    let b = vm.new_string("hello");
    // Same bytes, same object.
    assert_eq!(a.tsvalue(), b.tsvalue());
    assert!(a.raw_equal(&b));

    let c = vm.new_string("world");
    assert_ne!(a.tsvalue(), c.tsvalue());
    assert!(!a.raw_equal(&c));
}

#[test]
fn test_long_strings_interned_too() {
    let mut vm = LuaVM::new();
    let long = "x".repeat(SHORT_STRING_LIMIT * 4);
    let a = vm.new_string(&long);
    let b = vm.new_string(&long);
    assert_eq!(a.tsvalue(), b.tsvalue());
}

#[test]
fn test_raw_equal_iff_same_identity() {
    let mut vm = LuaVM::new();
    let strings = ["", "a", "ab", "hello world", "\0binary\0bytes"];
    let mut values = Vec::new();
    for s in strings {
        values.push(vm.new_string_bytes(s.as_bytes()));
    }
    for (i, a) in values.iter().enumerate() {
        for (j, b) in values.iter().enumerate() {
            assert_eq!(a.raw_equal(b), i == j);
            assert_eq!(a.tsvalue() == b.tsvalue(), i == j);
        }
    }
}

#[test]
fn test_byte_content_preserved() {
    let mut vm = LuaVM::new();
    let bytes = [0u8, 1, 2, 255, 254, 0];
    let v = vm.new_string_bytes(&bytes);
    assert_eq!(vm.pool.string(v.tsvalue()).as_bytes(), &bytes);
    assert_eq!(vm.pool.string(v.tsvalue()).len(), 6);
}

#[test]
fn test_unreferenced_strings_are_reclaimed() {
    let mut vm = LuaVM::new();
    vm.collect_garbage();
    let live_before = vm.pool.strings.live_count();
    for i in 0..100 {
        let _s = vm.new_string(&format!("transient-{}", i));
    }
    assert!(vm.pool.strings.live_count() >= live_before + 100);
    vm.collect_garbage();
    assert_eq!(vm.pool.strings.live_count(), live_before);
    // A re-intern after the sweep produces a fresh, working string.
    let v = vm.new_string("transient-0");
    assert_eq!(vm.display_value(&v), "transient-0");
}

#[test]
fn test_referenced_strings_survive_collection() {
    let mut vm = LuaVM::new();
    let v = vm.new_string("anchored");
    vm.set_global("s", v);
    vm.collect_garbage();
    vm.collect_garbage();
    let after = vm.get_global("s");
    assert!(after.raw_equal(&v));
    assert_eq!(vm.display_value(&after), "anchored");
}

#[test]
fn test_hash_is_cached_and_stable() {
    let mut vm = LuaVM::new();
    let v = vm.new_string("cache me");
    let h1 = vm.pool.string(v.tsvalue()).hash();
    assert_eq!(h1, lua_str_hash(b"cache me"));
}
