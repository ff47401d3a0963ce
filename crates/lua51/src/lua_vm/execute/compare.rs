// Comparison semantics: EQ never coerces across types; LT/LE order
// numbers and strings natively and otherwise require a *shared*
// metamethod, as luaV_lessthan/lessequal do.

use crate::lua_value::LuaValue;
use crate::lua_vm::execute::metamethod::{TmKind, call_tm_res};
use crate::lua_vm::{LuaResult, LuaVM};

/// Equality with the __eq protocol: both operands must be tables or
/// both userdata, raw-unequal, and their metatables must agree on the
/// handler.
pub fn equal_values(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
    if a.ttype() != b.ttype() {
        return Ok(false);
    }
    if a.raw_equal(&b) {
        return Ok(true);
    }
    if !(a.is_table() && b.is_table()) && !(a.is_userdata() && b.is_userdata()) {
        return Ok(false);
    }
    let mm1 = vm.get_metamethod(&a, TmKind::Eq);
    if mm1.is_nil() {
        return Ok(false);
    }
    let mm2 = vm.get_metamethod(&b, TmKind::Eq);
    if !mm1.raw_equal(&mm2) {
        return Ok(false);
    }
    let r = call_tm_res(vm, mm1, &[a, b])?;
    Ok(r.is_truthy())
}

fn string_less(vm: &LuaVM, a: &LuaValue, b: &LuaValue, or_equal: bool) -> bool {
    let sa = vm.pool.string(a.tsvalue()).as_bytes();
    let sb = vm.pool.string(b.tsvalue()).as_bytes();
    if or_equal { sa <= sb } else { sa < sb }
}

fn order_error(vm: &mut LuaVM, a: &LuaValue, b: &LuaValue) -> crate::lua_vm::LuaError {
    let (ta, tb) = (a.type_name(), b.type_name());
    if ta == tb {
        vm.error(format!("attempt to compare two {} values", ta))
    } else {
        vm.error(format!("attempt to compare {} with {}", ta, tb))
    }
}

/// Shared order metamethod, mirroring get_compTM: both operands must
/// carry the same handler for the event.
fn shared_order_tm(vm: &LuaVM, a: &LuaValue, b: &LuaValue, kind: TmKind) -> Option<LuaValue> {
    let mm1 = vm.get_metamethod(a, kind);
    if mm1.is_nil() {
        return None;
    }
    let mm2 = vm.get_metamethod(b, kind);
    if mm1.raw_equal(&mm2) { Some(mm1) } else { None }
}

pub fn less_than(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
    if a.is_number() && b.is_number() {
        return Ok(a.nvalue() < b.nvalue());
    }
    if a.is_string() && b.is_string() {
        return Ok(string_less(vm, &a, &b, false));
    }
    if let Some(mm) = shared_order_tm(vm, &a, &b, TmKind::Lt) {
        let r = call_tm_res(vm, mm, &[a, b])?;
        return Ok(r.is_truthy());
    }
    Err(order_error(vm, &a, &b))
}

pub fn less_equal(vm: &mut LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
    if a.is_number() && b.is_number() {
        return Ok(a.nvalue() <= b.nvalue());
    }
    if a.is_string() && b.is_string() {
        return Ok(string_less(vm, &a, &b, true));
    }
    if let Some(mm) = shared_order_tm(vm, &a, &b, TmKind::Le) {
        let r = call_tm_res(vm, mm, &[a, b])?;
        return Ok(r.is_truthy());
    }
    // No __le: fall back on not (b < a).
    if let Some(mm) = shared_order_tm(vm, &a, &b, TmKind::Lt) {
        let r = call_tm_res(vm, mm, &[b, a])?;
        return Ok(!r.is_truthy());
    }
    Err(order_error(vm, &a, &b))
}
