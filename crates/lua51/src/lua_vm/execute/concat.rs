// CONCAT folds a register range right to left; strings and numbers
// concatenate natively, anything else goes through __concat.

use crate::gc::ThreadId;
use crate::lua_value::{LuaValue, value_to_string_bytes};
use crate::lua_vm::execute::metamethod::{TmKind, binary_tm, call_tm_res};
use crate::lua_vm::{LuaResult, LuaVM};

#[inline]
fn concatable(v: &LuaValue) -> bool {
    v.is_string() || v.is_number()
}

/// Fold R(b)..R(c) into a single value.
pub fn concat_range(
    vm: &mut LuaVM,
    tid: ThreadId,
    base: usize,
    b: usize,
    c: usize,
) -> LuaResult<LuaValue> {
    let mut acc = vm.thread(tid).stack[base + c];
    let mut i = c;
    while i > b {
        i -= 1;
        let v = vm.thread(tid).stack[base + i];
        if concatable(&v) && concatable(&acc) {
            let mut bytes = match value_to_string_bytes(&v, &vm.pool) {
                Some(b) => b,
                None => unreachable!("concatable implies a string form"),
            };
            if let Some(tail) = value_to_string_bytes(&acc, &vm.pool) {
                bytes.extend_from_slice(&tail);
            }
            acc = vm.new_string_bytes(&bytes);
        } else {
            let mm = binary_tm(vm, &v, &acc, TmKind::Concat);
            if mm.is_nil() {
                let bad = if concatable(&v) { &acc } else { &v };
                let type_name = bad.type_name();
                return Err(vm.error(format!(
                    "attempt to concatenate a {} value",
                    type_name
                )));
            }
            acc = call_tm_res(vm, mm, &[v, acc])?;
        }
    }
    Ok(acc)
}
