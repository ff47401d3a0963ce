// Arithmetic with 5.1 coercion: operands go through the numeric
// lexical grammar first; only when that fails is the metamethod
// consulted (first operand, then second).

use crate::lua_value::{LuaValue, value_to_number};
use crate::lua_vm::execute::metamethod::{TmKind, binary_tm, call_tm_res};
use crate::lua_vm::{LuaResult, LuaVM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
}

impl ArithOp {
    fn tm(self) -> TmKind {
        match self {
            ArithOp::Add => TmKind::Add,
            ArithOp::Sub => TmKind::Sub,
            ArithOp::Mul => TmKind::Mul,
            ArithOp::Div => TmKind::Div,
            ArithOp::Mod => TmKind::Mod,
            ArithOp::Pow => TmKind::Pow,
            ArithOp::Unm => TmKind::Unm,
        }
    }

    #[inline]
    pub(crate) fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            // Division by zero is inf/nan, not an error.
            ArithOp::Div => a / b,
            // luai_nummod: a - floor(a/b)*b
            ArithOp::Mod => a - (a / b).floor() * b,
            ArithOp::Pow => a.powf(b),
            ArithOp::Unm => -a,
        }
    }
}

pub fn arith(vm: &mut LuaVM, b: LuaValue, c: LuaValue, op: ArithOp) -> LuaResult<LuaValue> {
    let nb = value_to_number(&b, &vm.pool);
    let nc = value_to_number(&c, &vm.pool);
    if let (Some(x), Some(y)) = (nb, nc) {
        return Ok(LuaValue::number(op.apply(x, y)));
    }
    let mm = binary_tm(vm, &b, &c, op.tm());
    if mm.is_nil() {
        // Blame the operand that refused coercion.
        let bad = if nb.is_none() { &b } else { &c };
        let type_name = bad.type_name();
        return Err(vm.error(format!(
            "attempt to perform arithmetic on a {} value",
            type_name
        )));
    }
    call_tm_res(vm, mm, &[b, c])
}

pub fn unary_minus(vm: &mut LuaVM, b: LuaValue) -> LuaResult<LuaValue> {
    if let Some(n) = value_to_number(&b, &vm.pool) {
        return Ok(LuaValue::number(-n));
    }
    // The reference passes the operand twice to __unm.
    let mm = vm.get_metamethod(&b, TmKind::Unm);
    if mm.is_nil() {
        let type_name = b.type_name();
        return Err(vm.error(format!(
            "attempt to perform arithmetic on a {} value",
            type_name
        )));
    }
    call_tm_res(vm, mm, &[b, b])
}
