// Dispatch-loop tests over hand-assembled chunks: loads, arithmetic
// with coercion, comparisons, branches, loops, tables and varargs.

use crate::lua_vm::{LuaVM, OpCode};
use crate::test::*;

#[test]
fn test_loadk_return() {
    let mut vm = LuaVM::new();
    let p = make_proto(ProtoCfg {
        code: vec![abx(OpCode::LoadK, 0, 0), abc(OpCode::Return, 0, 2, 0)],
        k: vec![num(42.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert_eq!(r.len(), 1);
    assert_eq!(r[0].nvalue(), 42.0);
}

#[test]
fn test_move_loadbool_loadnil() {
    let mut vm = LuaVM::new();
    // r0 = true; r1 = r0; r2..r3 = nil; return r1, r2
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::LoadBool, 0, 1, 0),
            abc(OpCode::Move, 1, 0, 0),
            abc(OpCode::LoadNil, 2, 3, 0),
            abc(OpCode::Return, 1, 3, 0),
        ],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert!(r[0].bvalue());
    assert!(r[1].is_nil());
}

#[test]
fn test_loadbool_skip() {
    let mut vm = LuaVM::new();
    // LOADBOOL with C=1 skips the next instruction.
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::LoadBool, 0, 1, 1),
            abx(OpCode::LoadK, 0, 0), // skipped
            abc(OpCode::Return, 0, 2, 0),
        ],
        k: vec![num(0.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert!(r[0].bvalue());
}

#[test]
fn test_arithmetic_ops() {
    let mut vm = LuaVM::new();
    // return 2 + 3 * 4 - 1, computed over registers
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::Mul, 0, kst(1), kst(2)),  // r0 = 3 * 4
            abc(OpCode::Add, 0, kst(0), 0),       // r0 = 2 + r0
            abc(OpCode::Sub, 0, 0, kst(3)),       // r0 = r0 - 1
            abc(OpCode::Return, 0, 2, 0),
        ],
        k: vec![num(2.0), num(3.0), num(4.0), num(1.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert_eq!(r[0].nvalue(), 13.0);
}

#[test]
fn test_string_coercion_in_arith() {
    let mut vm = LuaVM::new();
    // "3" + "4" is 7 under the numeric lexical grammar.
    let k3 = vm.new_string("3");
    let k4 = vm.new_string("4");
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::Add, 0, kst(0), kst(1)),
            abc(OpCode::Return, 0, 2, 0),
        ],
        k: vec![k3, k4],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert_eq!(r[0].nvalue(), 7.0);
}

#[test]
fn test_div_by_zero_is_inf() {
    let mut vm = LuaVM::new();
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::Div, 0, kst(0), kst(1)),
            abc(OpCode::Return, 0, 2, 0),
        ],
        k: vec![num(1.0), num(0.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert!(r[0].nvalue().is_infinite());
}

#[test]
fn test_mod_and_pow() {
    let mut vm = LuaVM::new();
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::Mod, 0, kst(0), kst(1)), // 7 % 3 = 1
            abc(OpCode::Pow, 1, kst(2), kst(3)), // 2 ^ 10 = 1024
            abc(OpCode::Return, 0, 3, 0),
        ],
        k: vec![num(7.0), num(3.0), num(2.0), num(10.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert_eq!(r[0].nvalue(), 1.0);
    assert_eq!(r[1].nvalue(), 1024.0);
}

#[test]
fn test_negative_mod_follows_floor() {
    let mut vm = LuaVM::new();
    // -5 % 3 = 1 in Lua (floored modulo).
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::Mod, 0, kst(0), kst(1)),
            abc(OpCode::Return, 0, 2, 0),
        ],
        k: vec![num(-5.0), num(3.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert_eq!(r[0].nvalue(), 1.0);
}

#[test]
fn test_unm_not_len() {
    let mut vm = LuaVM::new();
    let ks = vm.new_string("hello");
    let p = make_proto(ProtoCfg {
        code: vec![
            abx(OpCode::LoadK, 0, 0),
            abc(OpCode::Unm, 0, 0, 0),    // r0 = -5
            abc(OpCode::LoadBool, 1, 0, 0),
            abc(OpCode::Not, 1, 1, 0),    // r1 = not false = true
            abx(OpCode::LoadK, 2, 1),
            abc(OpCode::Len, 2, 2, 0),    // r2 = #"hello" = 5
            abc(OpCode::Return, 0, 4, 0),
        ],
        k: vec![num(5.0), ks],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert_eq!(r[0].nvalue(), -5.0);
    assert!(r[1].bvalue());
    assert_eq!(r[2].nvalue(), 5.0);
}

#[test]
fn test_concat() {
    let mut vm = LuaVM::new();
    let ka = vm.new_string("a");
    let kb = vm.new_string("b");
    let p = make_proto(ProtoCfg {
        code: vec![
            abx(OpCode::LoadK, 0, 0),
            abx(OpCode::LoadK, 1, 1),
            abx(OpCode::LoadK, 2, 2),
            abc(OpCode::Concat, 0, 0, 2), // r0 = "a".."b"..1
            abc(OpCode::Return, 0, 2, 0),
        ],
        k: vec![ka, kb, num(1.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert_eq!(vm.display_value(&r[0]), "ab1");
}

#[test]
fn test_eq_no_cross_type_coercion() {
    let mut vm = LuaVM::new();
    // "3" == 3 must be false.
    let k3s = vm.new_string("3");
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::Eq, 1, kst(0), kst(1)),
            asbx(OpCode::Jmp, 0, 1),
            abc(OpCode::LoadBool, 0, 0, 1),
            abc(OpCode::LoadBool, 0, 1, 0),
            abc(OpCode::Return, 0, 2, 0),
        ],
        k: vec![k3s, num(3.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert!(!r[0].bvalue());
}

#[test]
fn test_lt_le_numbers_and_strings() {
    let mut vm = LuaVM::new();
    let ka = vm.new_string("abc");
    let kb = vm.new_string("abd");
    // r0 = (1 < 2), r1 = ("abc" <= "abd")
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::Lt, 1, kst(0), kst(1)),
            asbx(OpCode::Jmp, 0, 1),
            abc(OpCode::LoadBool, 0, 0, 1),
            abc(OpCode::LoadBool, 0, 1, 0),
            abc(OpCode::Le, 1, kst(2), kst(3)),
            asbx(OpCode::Jmp, 0, 1),
            abc(OpCode::LoadBool, 1, 0, 1),
            abc(OpCode::LoadBool, 1, 1, 0),
            abc(OpCode::Return, 0, 3, 0),
        ],
        k: vec![num(1.0), num(2.0), ka, kb],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert!(r[0].bvalue());
    assert!(r[1].bvalue());
}

#[test]
fn test_test_and_testset() {
    let mut vm = LuaVM::new();
    // r0 = 5; if r0 then r1 = 1 else r1 = 2  (TEST with C=1)
    let p = make_proto(ProtoCfg {
        code: vec![
            abx(OpCode::LoadK, 0, 0),
            abc(OpCode::Test, 0, 0, 1),
            asbx(OpCode::Jmp, 0, 2),
            abx(OpCode::LoadK, 1, 2), // not taken
            asbx(OpCode::Jmp, 0, 1),
            abx(OpCode::LoadK, 1, 1), // taken branch
            abc(OpCode::Return, 1, 2, 0),
        ],
        k: vec![num(5.0), num(1.0), num(2.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert_eq!(r[0].nvalue(), 1.0);

    // TESTSET: r1 = r0 or 9  (r0 truthy -> copies r0)
    let p2 = make_proto(ProtoCfg {
        code: vec![
            abx(OpCode::LoadK, 0, 0),
            abc(OpCode::TestSet, 1, 0, 1),
            asbx(OpCode::Jmp, 0, 1),
            abx(OpCode::LoadK, 1, 1),
            abc(OpCode::Return, 1, 2, 0),
        ],
        k: vec![num(7.0), num(9.0)],
        ..Default::default()
    });
    let r2 = run(&mut vm, p2, &[]).unwrap();
    assert_eq!(r2[0].nvalue(), 7.0);
}

#[test]
fn test_numeric_for_loop() {
    let mut vm = LuaVM::new();
    // local s = 0; for i = 1, 10 do s = s + i end; return s
    let p = make_proto(ProtoCfg {
        code: vec![
            abx(OpCode::LoadK, 0, 0),      // s = 0
            abx(OpCode::LoadK, 1, 1),      // init 1
            abx(OpCode::LoadK, 2, 2),      // limit 10
            abx(OpCode::LoadK, 3, 1),      // step 1
            asbx(OpCode::ForPrep, 1, 1),   // -> FORLOOP
            abc(OpCode::Add, 0, 0, 4),     // s = s + i  (loop var r4)
            asbx(OpCode::ForLoop, 1, -2),  // back to body
            abc(OpCode::Return, 0, 2, 0),
        ],
        k: vec![num(0.0), num(1.0), num(10.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert_eq!(r[0].nvalue(), 55.0);
}

#[test]
fn test_for_loop_string_coercion_and_error() {
    let mut vm = LuaVM::new();
    // for i = "1", 3: FORPREP coerces the numeric string.
    let k1 = vm.new_string("1");
    let p = make_proto(ProtoCfg {
        code: vec![
            abx(OpCode::LoadK, 0, 3),
            abx(OpCode::LoadK, 1, 0),
            abx(OpCode::LoadK, 2, 1),
            abx(OpCode::LoadK, 3, 2),
            asbx(OpCode::ForPrep, 1, 1),
            abc(OpCode::Add, 0, 0, 4),
            asbx(OpCode::ForLoop, 1, -2),
            abc(OpCode::Return, 0, 2, 0),
        ],
        k: vec![k1, num(3.0), num(1.0), num(0.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p.clone(), &[]).unwrap();
    assert_eq!(r[0].nvalue(), 6.0);

    // A non-numeric initial value raises the 5.1 message.
    let kx = vm.new_string("x");
    let bad = make_proto(ProtoCfg {
        code: vec![
            abx(OpCode::LoadK, 0, 3),
            abx(OpCode::LoadK, 1, 0),
            abx(OpCode::LoadK, 2, 1),
            abx(OpCode::LoadK, 3, 2),
            asbx(OpCode::ForPrep, 1, 1),
            abc(OpCode::Add, 0, 0, 4),
            asbx(OpCode::ForLoop, 1, -2),
            abc(OpCode::Return, 0, 2, 0),
        ],
        k: vec![kx, num(3.0), num(1.0), num(0.0)],
        ..Default::default()
    });
    let (ok, errs) = run_protected(&mut vm, bad, &[]);
    assert!(!ok);
    let msg = vm.display_value(&errs[0]);
    assert!(msg.contains("'for' initial value must be a number"), "{msg}");
}

#[test]
fn test_newtable_setlist_len() {
    let mut vm = LuaVM::new();
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::NewTable, 0, 3, 0),
            abx(OpCode::LoadK, 1, 0),
            abx(OpCode::LoadK, 2, 1),
            abx(OpCode::LoadK, 3, 2),
            abc(OpCode::SetList, 0, 3, 1),
            abc(OpCode::Len, 1, 0, 0),
            abc(OpCode::Return, 0, 3, 0),
        ],
        k: vec![num(10.0), num(20.0), num(30.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert!(r[0].is_table());
    assert_eq!(r[1].nvalue(), 3.0);
    let t = r[0].hvalue();
    assert_eq!(vm.pool.table(t).get_int(2).nvalue(), 20.0);
}

#[test]
fn test_gettable_settable_self() {
    let mut vm = LuaVM::new();
    let kkey = vm.new_string("x");
    let kmeth = vm.new_string("m");
    // local t = {}; t.x = 99; t.m = function(self) return self.x end
    // return t:m()
    let method = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::GetTable, 1, 0, kst(0)),
            abc(OpCode::Return, 1, 2, 0),
        ],
        k: vec![kkey],
        num_params: 1,
        ..Default::default()
    });
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::NewTable, 0, 0, 2),
            abc(OpCode::SetTable, 0, kst(0), kst(1)), // t.x = 99
            abx(OpCode::Closure, 1, 0),
            abc(OpCode::SetTable, 0, kst(2), 1), // t.m = closure
            abc(OpCode::Self_, 1, 0, kst(2)),    // r1 = t.m; r2 = t
            abc(OpCode::Call, 1, 2, 2),
            abc(OpCode::Return, 1, 2, 0),
        ],
        k: vec![kkey, num(99.0), kmeth],
        protos: vec![method],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert_eq!(r[0].nvalue(), 99.0);
}

#[test]
fn test_globals() {
    let mut vm = LuaVM::new();
    let kname = vm.new_string("answer");
    let p = make_proto(ProtoCfg {
        code: vec![
            abx(OpCode::LoadK, 0, 1),
            abx(OpCode::SetGlobal, 0, 0),
            abx(OpCode::GetGlobal, 1, 0),
            abc(OpCode::Return, 1, 2, 0),
        ],
        k: vec![kname, num(42.0)],
        ..Default::default()
    });
    let r = run(&mut vm, p, &[]).unwrap();
    assert_eq!(r[0].nvalue(), 42.0);
    assert_eq!(vm.get_global("answer").nvalue(), 42.0);
}

#[test]
fn test_vararg_all() {
    let mut vm = LuaVM::new();
    let p = make_proto(ProtoCfg {
        code: vec![abc(OpCode::Vararg, 0, 0, 0), abc(OpCode::Return, 0, 0, 0)],
        is_vararg: true,
        ..Default::default()
    });
    let r = run(&mut vm, p, &[num(1.0), num(2.0), num(3.0)]).unwrap();
    assert_eq!(r.len(), 3);
    assert_eq!(r[2].nvalue(), 3.0);
}

#[test]
fn test_vararg_fixed_count_pads_nil() {
    let mut vm = LuaVM::new();
    // Two varargs requested, one supplied: second is nil.
    let p = make_proto(ProtoCfg {
        code: vec![abc(OpCode::Vararg, 0, 3, 0), abc(OpCode::Return, 0, 3, 0)],
        is_vararg: true,
        ..Default::default()
    });
    let r = run(&mut vm, p, &[num(7.0)]).unwrap();
    assert_eq!(r.len(), 2);
    assert_eq!(r[0].nvalue(), 7.0);
    assert!(r[1].is_nil());
}

#[test]
fn test_vararg_after_named_params() {
    let mut vm = LuaVM::new();
    // function f(a, ...) return a, ... end
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::Move, 1, 0, 0),
            abc(OpCode::Vararg, 2, 0, 0),
            abc(OpCode::Return, 1, 0, 0),
        ],
        num_params: 1,
        is_vararg: true,
        ..Default::default()
    });
    let r = run(&mut vm, p, &[num(1.0), num(2.0), num(3.0)]).unwrap();
    assert_eq!(r.len(), 3);
    assert_eq!(r[0].nvalue(), 1.0);
    assert_eq!(r[1].nvalue(), 2.0);
    assert_eq!(r[2].nvalue(), 3.0);
}

#[test]
fn test_generic_for_with_ipairs() {
    let mut vm = LuaVM::new();
    vm.open_libs().unwrap();
    let kipairs = vm.new_string("ipairs");
    let kzero = num(0.0);
    // local sum = 0; for _, v in ipairs(t) do sum = sum + v end
    let p = make_proto(ProtoCfg {
        code: vec![
            abx(OpCode::LoadK, 1, 1),      // sum = 0
            abx(OpCode::GetGlobal, 2, 0),  // ipairs
            abc(OpCode::Move, 3, 0, 0),
            abc(OpCode::Call, 2, 2, 4),    // iter, state, ctrl
            asbx(OpCode::Jmp, 0, 1),       // -> TFORLOOP
            abc(OpCode::Add, 1, 1, 6),     // sum = sum + v
            abc(OpCode::TForLoop, 2, 0, 2),
            asbx(OpCode::Jmp, 0, -3),
            abc(OpCode::Return, 1, 2, 0),
        ],
        k: vec![kipairs, kzero],
        num_params: 1,
        ..Default::default()
    });
    let t = vm.new_table(3, 0);
    let tid = t.hvalue();
    vm.table_set_int(tid, 1, num(5.0));
    vm.table_set_int(tid, 2, num(6.0));
    vm.table_set_int(tid, 3, num(7.0));
    let r = run(&mut vm, p, &[t]).unwrap();
    assert_eq!(r[0].nvalue(), 18.0);
}

#[test]
fn test_call_non_function_errors() {
    let mut vm = LuaVM::new();
    let p = make_proto(ProtoCfg {
        code: vec![
            abx(OpCode::LoadK, 0, 0),
            abc(OpCode::Call, 0, 1, 1),
            abc(OpCode::Return, 0, 1, 0),
        ],
        k: vec![num(3.0)],
        ..Default::default()
    });
    let (ok, errs) = run_protected(&mut vm, p, &[]);
    assert!(!ok);
    let msg = vm.display_value(&errs[0]);
    assert!(msg.contains("attempt to call a number value"), "{msg}");
}

#[test]
fn test_index_nil_errors() {
    let mut vm = LuaVM::new();
    let p = make_proto(ProtoCfg {
        code: vec![
            abc(OpCode::LoadNil, 0, 0, 0),
            abc(OpCode::GetTable, 1, 0, kst(0)),
            abc(OpCode::Return, 1, 2, 0),
        ],
        k: vec![num(1.0)],
        ..Default::default()
    });
    let (ok, errs) = run_protected(&mut vm, p, &[]);
    assert!(!ok);
    let msg = vm.display_value(&errs[0]);
    assert!(msg.contains("attempt to index a nil value"), "{msg}");
}
