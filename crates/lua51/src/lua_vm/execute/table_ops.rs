// Indexed access with the __index/__newindex protocol. Raw table hits
// never consult metamethods; misses walk the handler chain, bounded so
// metatable cycles surface as "loop in gettable"/"loop in settable".

use crate::lua_value::{LuaValue, TableKeyError};
use crate::lua_vm::execute::metamethod::TmKind;
use crate::lua_vm::lua_limits::MAX_TAG_LOOP;
use crate::lua_vm::{LuaResult, LuaVM};

pub fn vm_gettable(vm: &mut LuaVM, t: LuaValue, key: LuaValue) -> LuaResult<LuaValue> {
    let mut t = t;
    for _ in 0..MAX_TAG_LOOP {
        let mm;
        if t.is_table() {
            let v = vm.pool.table(t.hvalue()).get(&key);
            if !v.is_nil() {
                return Ok(v);
            }
            mm = vm.get_metamethod(&t, TmKind::Index);
            if mm.is_nil() {
                return Ok(LuaValue::nil());
            }
        } else {
            mm = vm.get_metamethod(&t, TmKind::Index);
            if mm.is_nil() {
                let type_name = t.type_name();
                return Err(vm.error(format!("attempt to index a {} value", type_name)));
            }
        }
        if mm.is_function() {
            let results = vm.call_value(mm, &[t, key])?;
            return Ok(results.first().copied().unwrap_or(LuaValue::nil()));
        }
        t = mm;
    }
    Err(vm.error("loop in gettable"))
}

pub fn vm_settable(vm: &mut LuaVM, t: LuaValue, key: LuaValue, val: LuaValue) -> LuaResult<()> {
    let mut t = t;
    for _ in 0..MAX_TAG_LOOP {
        let mm;
        if t.is_table() {
            let id = t.hvalue();
            let existing = vm.pool.table(id).get(&key);
            if !existing.is_nil() {
                // Present key: plain raw update.
                return raw_set_checked(vm, id, key, val);
            }
            mm = vm.get_metamethod(&t, TmKind::NewIndex);
            if mm.is_nil() {
                return raw_set_checked(vm, id, key, val);
            }
        } else {
            mm = vm.get_metamethod(&t, TmKind::NewIndex);
            if mm.is_nil() {
                let type_name = t.type_name();
                return Err(vm.error(format!("attempt to index a {} value", type_name)));
            }
        }
        if mm.is_function() {
            vm.call_value(mm, &[t, key, val])?;
            return Ok(());
        }
        t = mm;
    }
    Err(vm.error("loop in settable"))
}

pub fn raw_set_checked(
    vm: &mut LuaVM,
    t: crate::gc::TableId,
    key: LuaValue,
    val: LuaValue,
) -> LuaResult<()> {
    match vm.table_set(t, key, val) {
        Ok(()) => Ok(()),
        Err(TableKeyError::NilKey) => Err(vm.error("table index is nil")),
        Err(TableKeyError::NanKey) => Err(vm.error("table index is NaN")),
    }
}
