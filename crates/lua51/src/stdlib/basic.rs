// Base library subset: the pieces that are inseparable from the core
// (pcall/xpcall/error), plus the thin raw-access wrappers the test
// scenarios and any embedder need.

use crate::lib_registry::LibraryModule;
use crate::lua_value::{LuaValue, value_to_number};
use crate::lua_vm::execute::table_ops;
use crate::lua_vm::{GcOption, LuaResult, LuaVM};

pub fn create_basic_lib() -> LibraryModule {
    crate::lib_module!("_G", {
        "assert" => lua_assert,
        "collectgarbage" => lua_collectgarbage,
        "error" => lua_error,
        "getmetatable" => lua_getmetatable,
        "ipairs" => lua_ipairs,
        "next" => lua_next,
        "pairs" => lua_pairs,
        "pcall" => lua_pcall,
        "rawequal" => lua_rawequal,
        "rawget" => lua_rawget,
        "rawset" => lua_rawset,
        "select" => lua_select,
        "setmetatable" => lua_setmetatable,
        "tonumber" => lua_tonumber,
        "tostring" => lua_tostring,
        "type" => lua_type,
        "unpack" => lua_unpack,
        "xpcall" => lua_xpcall,
    })
}

fn lua_assert(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = vm.arg(1).unwrap_or(LuaValue::nil());
    if v.is_falsy() {
        let msg = match vm.arg(2) {
            Some(m) => vm.display_value(&m),
            None => "assertion failed!".to_string(),
        };
        return Err(vm.error(msg));
    }
    let args = vm.args();
    let n = args.len();
    for a in args {
        vm.push_value(a)?;
    }
    Ok(n)
}

fn lua_error(vm: &mut LuaVM) -> LuaResult<usize> {
    let v = vm.arg(1).unwrap_or(LuaValue::nil());
    let level = vm
        .arg(2)
        .and_then(|l| l.as_number())
        .unwrap_or(1.0)
        .max(0.0) as usize;
    if v.is_string() && level > 0 {
        let msg = format!("{}{}", vm.where_prefix(level), vm.display_value(&v));
        let s = vm.new_string(&msg);
        return Err(vm.throw_value(s));
    }
    Err(vm.throw_value(v))
}

fn lua_pcall(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(f) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'pcall' (value expected)"));
    };
    let args = vm.args();
    let call_args = &args[1..];
    let (ok, results) = vm.pcall_values(f, call_args)?;
    vm.push_value(LuaValue::boolean(ok))?;
    let n = results.len();
    for r in results {
        vm.push_value(r)?;
    }
    Ok(1 + n)
}

fn lua_xpcall(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(f) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'xpcall' (value expected)"));
    };
    let Some(handler) = vm.arg(2) else {
        return Err(vm.error("bad argument #2 to 'xpcall' (value expected)"));
    };
    let args = vm.args();
    let call_args = if args.len() > 2 { &args[2..] } else { &[] };
    let (ok, results) = vm.xpcall_values(f, call_args, Some(handler))?;
    vm.push_value(LuaValue::boolean(ok))?;
    let n = results.len();
    for r in results {
        vm.push_value(r)?;
    }
    Ok(1 + n)
}

fn lua_type(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(v) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'type' (value expected)"));
    };
    let name = vm.new_string(v.type_name());
    vm.push_value(name)?;
    Ok(1)
}

fn lua_tostring(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(v) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'tostring' (value expected)"));
    };
    // __tostring is a library-level protocol, not a core TmKind.
    if let Some(mt) = vm.metatable_of(&v) {
        let key = vm.new_string("__tostring");
        let mm = vm.table_get(mt, &key);
        if mm.is_function() {
            let results = vm.call_value(mm, &[v])?;
            let r = results.first().copied().unwrap_or(LuaValue::nil());
            vm.push_value(r)?;
            return Ok(1);
        }
    }
    let rendered = vm.display_value(&v);
    let s = vm.new_string(&rendered);
    vm.push_value(s)?;
    Ok(1)
}

fn lua_tonumber(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(v) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'tonumber' (value expected)"));
    };
    let base = vm.arg(2).and_then(|b| b.as_number()).unwrap_or(10.0) as u32;
    let result = if base == 10 {
        value_to_number(&v, &vm.pool).map(LuaValue::number)
    } else {
        if !(2..=36).contains(&base) {
            return Err(vm.error("bad argument #2 to 'tonumber' (base out of range)"));
        }
        v.as_string_id()
            .and_then(|id| vm.pool.string(id).as_str().map(str::to_owned))
            .and_then(|s| i64::from_str_radix(s.trim(), base).ok())
            .map(|i| LuaValue::number(i as f64))
    };
    vm.push_value(result.unwrap_or(LuaValue::nil()))?;
    Ok(1)
}

fn lua_setmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(t) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'setmetatable' (table expected)"));
    };
    if !t.is_table() {
        return Err(vm.error("bad argument #1 to 'setmetatable' (table expected)"));
    }
    let mt = vm.arg(2).unwrap_or(LuaValue::nil());
    if !mt.is_nil() && !mt.is_table() {
        return Err(vm.error("bad argument #2 to 'setmetatable' (nil or table expected)"));
    }
    if let Some(old) = vm.metatable_of(&t) {
        let key = vm.new_string("__metatable");
        if !vm.table_get(old, &key).is_nil() {
            return Err(vm.error("cannot change a protected metatable"));
        }
    }
    vm.set_metatable(&t, mt.as_table_id());
    vm.push_value(t)?;
    Ok(1)
}

fn lua_getmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(v) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'getmetatable' (value expected)"));
    };
    match vm.metatable_of(&v) {
        Some(mt) => {
            let key = vm.new_string("__metatable");
            let protected = vm.table_get(mt, &key);
            let out = if protected.is_nil() {
                LuaValue::table(mt)
            } else {
                protected
            };
            vm.push_value(out)?;
        }
        None => vm.push_value(LuaValue::nil())?,
    }
    Ok(1)
}

fn lua_rawget(vm: &mut LuaVM) -> LuaResult<usize> {
    let (Some(t), Some(k)) = (vm.arg(1), vm.arg(2)) else {
        return Err(vm.error("bad argument to 'rawget'"));
    };
    if !t.is_table() {
        return Err(vm.error("bad argument #1 to 'rawget' (table expected)"));
    }
    let v = vm.table_get(t.hvalue(), &k);
    vm.push_value(v)?;
    Ok(1)
}

fn lua_rawset(vm: &mut LuaVM) -> LuaResult<usize> {
    let (Some(t), Some(k)) = (vm.arg(1), vm.arg(2)) else {
        return Err(vm.error("bad argument to 'rawset'"));
    };
    let v = vm.arg(3).unwrap_or(LuaValue::nil());
    if !t.is_table() {
        return Err(vm.error("bad argument #1 to 'rawset' (table expected)"));
    }
    table_ops::raw_set_checked(vm, t.hvalue(), k, v)?;
    vm.push_value(t)?;
    Ok(1)
}

fn lua_rawequal(vm: &mut LuaVM) -> LuaResult<usize> {
    let a = vm.arg(1).unwrap_or(LuaValue::nil());
    let b = vm.arg(2).unwrap_or(LuaValue::nil());
    vm.push_value(LuaValue::boolean(a.raw_equal(&b)))?;
    Ok(1)
}

fn lua_next(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(t) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'next' (table expected)"));
    };
    if !t.is_table() {
        return Err(vm.error("bad argument #1 to 'next' (table expected)"));
    }
    let k = vm.arg(2).unwrap_or(LuaValue::nil());
    match vm.pool.table(t.hvalue()).next(&k) {
        Ok(Some((nk, nv))) => {
            vm.push_value(nk)?;
            vm.push_value(nv)?;
            Ok(2)
        }
        Ok(None) => {
            vm.push_value(LuaValue::nil())?;
            Ok(1)
        }
        Err(()) => Err(vm.error("invalid key to 'next'")),
    }
}

fn lua_pairs(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(t) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'pairs' (table expected)"));
    };
    vm.push_value(LuaValue::cfunction(lua_next))?;
    vm.push_value(t)?;
    vm.push_value(LuaValue::nil())?;
    Ok(3)
}

fn ipairs_iter(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(t) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'ipairs' iterator"));
    };
    let i = vm.arg(2).and_then(|v| v.as_number()).unwrap_or(0.0) as i64 + 1;
    if !t.is_table() {
        return Err(vm.error("bad argument #1 to 'ipairs' iterator"));
    }
    let v = vm.pool.table(t.hvalue()).get_int(i);
    if v.is_nil() {
        vm.push_value(LuaValue::nil())?;
        Ok(1)
    } else {
        vm.push_value(LuaValue::number(i as f64))?;
        vm.push_value(v)?;
        Ok(2)
    }
}

fn lua_ipairs(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(t) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'ipairs' (table expected)"));
    };
    vm.push_value(LuaValue::cfunction(ipairs_iter))?;
    vm.push_value(t)?;
    vm.push_value(LuaValue::number(0.0))?;
    Ok(3)
}

fn lua_select(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(sel) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'select' (number expected)"));
    };
    let args = vm.args();
    let rest = &args[1..];
    if sel.is_string() {
        let s = vm.pool.string(sel.tsvalue()).as_bytes();
        if s == b"#" {
            vm.push_value(LuaValue::number(rest.len() as f64))?;
            return Ok(1);
        }
        return Err(vm.error("bad argument #1 to 'select' (number expected)"));
    }
    let n = sel.as_number().unwrap_or(0.0) as i64;
    if n < 1 {
        return Err(vm.error("bad argument #1 to 'select' (index out of range)"));
    }
    let skipped: Vec<LuaValue> = rest.iter().skip(n as usize - 1).copied().collect();
    let count = skipped.len();
    for v in skipped {
        vm.push_value(v)?;
    }
    Ok(count)
}

fn lua_unpack(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(t) = vm.arg(1) else {
        return Err(vm.error("bad argument #1 to 'unpack' (table expected)"));
    };
    if !t.is_table() {
        return Err(vm.error("bad argument #1 to 'unpack' (table expected)"));
    }
    let id = t.hvalue();
    let i = vm.arg(2).and_then(|v| v.as_number()).unwrap_or(1.0) as i64;
    let j = vm
        .arg(3)
        .and_then(|v| v.as_number())
        .unwrap_or_else(|| vm.pool.table(id).length() as f64) as i64;
    let mut n = 0;
    for idx in i..=j {
        let v = vm.pool.table(id).get_int(idx);
        vm.push_value(v)?;
        n += 1;
    }
    Ok(n)
}

fn lua_collectgarbage(vm: &mut LuaVM) -> LuaResult<usize> {
    let opt = vm
        .arg(1)
        .and_then(|v| v.as_string_id())
        .and_then(|id| vm.pool.string(id).as_str().map(str::to_owned))
        .unwrap_or_else(|| "collect".to_string());
    let data = vm.arg(2).and_then(|v| v.as_number()).unwrap_or(0.0) as i32;
    let result = match opt.as_str() {
        "stop" => vm.gc_control(GcOption::Stop),
        "restart" => vm.gc_control(GcOption::Restart),
        "collect" => vm.gc_control(GcOption::Collect),
        "count" => vm.gc_control(GcOption::Count),
        "step" => vm.gc_control(GcOption::Step),
        "setpause" => vm.gc_control(GcOption::SetPause(data)),
        "setstepmul" => vm.gc_control(GcOption::SetStepMul(data)),
        _ => return Err(vm.error(format!("bad argument #1 to 'collectgarbage' (invalid option '{}')", opt))),
    };
    vm.push_value(LuaValue::number(result as f64))?;
    Ok(1)
}

/// Re-exported for tests that build iterators by hand.
pub fn next_function() -> LuaValue {
    LuaValue::cfunction(lua_next)
}
