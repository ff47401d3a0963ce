// Test module organization. Chunks are hand-assembled with the helpers
// below, since the compiler is out of tree; the bytecode matches what
// luac 5.1.5 emits for the equivalent source.

pub mod test_api;
pub mod test_gc;
pub mod test_string_pool;
pub mod test_vm;

use std::rc::Rc;

use smol_str::SmolStr;

use crate::lua_value::{LuaValue, Proto, VARARG_ISVARARG};
use crate::lua_vm::{Instruction, LuaResult, LuaVM, OpCode};

pub fn abc(op: OpCode, a: u32, b: u32, c: u32) -> u32 {
    Instruction::create_abc(op, a, b, c)
}

pub fn abx(op: OpCode, a: u32, bx: u32) -> u32 {
    Instruction::create_abx(op, a, bx)
}

pub fn asbx(op: OpCode, a: u32, sbx: i32) -> u32 {
    Instruction::create_asbx(op, a, sbx)
}

/// Constant operand in an RK slot.
pub fn kst(i: u32) -> u32 {
    Instruction::rk_as_k(i)
}

pub fn num(x: f64) -> LuaValue {
    LuaValue::number(x)
}

pub struct ProtoCfg {
    pub code: Vec<u32>,
    pub k: Vec<LuaValue>,
    pub protos: Vec<Rc<Proto>>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack: u8,
    pub nups: u8,
    pub source: &'static str,
}

impl Default for ProtoCfg {
    fn default() -> Self {
        Self {
            code: Vec::new(),
            k: Vec::new(),
            protos: Vec::new(),
            num_params: 0,
            is_vararg: false,
            max_stack: 10,
            nups: 0,
            source: "=test",
        }
    }
}

pub fn make_proto(cfg: ProtoCfg) -> Rc<Proto> {
    let line_info = vec![1; cfg.code.len()];
    Rc::new(Proto {
        source: SmolStr::new(cfg.source),
        line_defined: 0,
        last_line_defined: 0,
        nups: cfg.nups,
        num_params: cfg.num_params,
        is_vararg: if cfg.is_vararg { VARARG_ISVARARG } else { 0 },
        max_stack_size: cfg.max_stack,
        code: cfg.code,
        constants: cfg.k,
        protos: cfg.protos,
        line_info,
        loc_vars: Vec::new(),
        upvalue_names: Vec::new(),
    })
}

/// Wrap a prototype into a closure and call it with `args`.
pub fn run(vm: &mut LuaVM, proto: Rc<Proto>, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
    let closure = vm.new_lua_closure(proto, Vec::new());
    vm.call_value(closure, args)
}

/// Same, but protected: (ok, results).
pub fn run_protected(
    vm: &mut LuaVM,
    proto: Rc<Proto>,
    args: &[LuaValue],
) -> (bool, Vec<LuaValue>) {
    let closure = vm.new_lua_closure(proto, Vec::new());
    match vm.pcall_values(closure, args) {
        Ok(r) => r,
        Err(_) => (false, Vec::new()),
    }
}
