// Coroutine library: create, resume, yield, status, running, wrap.
// The scheduler itself lives in the VM (execute/call.rs); these are the
// host-visible entry points over it.

use crate::lib_registry::LibraryModule;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVM};

pub fn create_coroutine_lib() -> LibraryModule {
    crate::lib_module!("coroutine", {
        "create" => coroutine_create,
        "resume" => coroutine_resume,
        "yield" => coroutine_yield,
        "status" => coroutine_status,
        "running" => coroutine_running,
        "wrap" => coroutine_wrap,
    })
}

fn check_function_arg(vm: &mut LuaVM, n: usize, who: &str) -> LuaResult<LuaValue> {
    match vm.arg(n) {
        Some(f) if f.is_function() => Ok(f),
        _ => Err(vm.error(format!(
            "bad argument #{} to '{}' (function expected)",
            n, who
        ))),
    }
}

fn coroutine_create(vm: &mut LuaVM) -> LuaResult<usize> {
    let f = check_function_arg(vm, 1, "create")?;
    let co = vm.new_thread(f);
    vm.push_value(co)?;
    Ok(1)
}

fn coroutine_resume(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = match vm.arg(1) {
        Some(t) if t.is_thread() => t,
        _ => return Err(vm.error("bad argument #1 to 'resume' (coroutine expected)")),
    };
    let args = vm.args();
    let (ok, results) = vm.resume_value(co, &args[1..]);
    vm.push_value(LuaValue::boolean(ok))?;
    let n = results.len();
    for r in results {
        vm.push_value(r)?;
    }
    Ok(1 + n)
}

fn coroutine_yield(vm: &mut LuaVM) -> LuaResult<usize> {
    let args = vm.args();
    Err(vm.do_yield(args))
}

fn coroutine_status(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = match vm.arg(1) {
        Some(t) if t.is_thread() => t,
        _ => return Err(vm.error("bad argument #1 to 'status' (coroutine expected)")),
    };
    let tid = co.thvalue();
    let name = if tid == vm.current {
        "running"
    } else {
        vm.thread(tid).status.name()
    };
    let s = vm.new_string(name);
    vm.push_value(s)?;
    Ok(1)
}

fn coroutine_running(vm: &mut LuaVM) -> LuaResult<usize> {
    if vm.current.is_main() {
        vm.push_value(LuaValue::nil())?;
    } else {
        let co = LuaValue::thread(vm.current);
        vm.push_value(co)?;
    }
    Ok(1)
}

fn coroutine_wrap(vm: &mut LuaVM) -> LuaResult<usize> {
    let f = check_function_arg(vm, 1, "wrap")?;
    let co = vm.new_thread(f);
    let wrapper = vm.new_native_closure(wrap_call, vec![co]);
    vm.push_value(wrapper)?;
    Ok(1)
}

/// The callable returned by wrap: resumes its captured coroutine and
/// re-raises errors instead of returning a status flag.
fn wrap_call(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = match vm.native_upvalue(0) {
        Some(v) if v.is_thread() => v,
        _ => return Err(vm.error("invalid wrapped coroutine")),
    };
    let args = vm.args();
    let (ok, results) = vm.resume_value(co, &args);
    if !ok {
        let err = results.first().copied().unwrap_or(LuaValue::nil());
        return Err(vm.throw_value(err));
    }
    let n = results.len();
    for r in results {
        vm.push_value(r)?;
    }
    Ok(n)
}

/// Status name as coroutine.status reports it, for host code.
pub fn status_name(vm: &LuaVM, co: &LuaValue) -> &'static str {
    match co.as_thread_id() {
        Some(tid) if tid == vm.current => "running",
        Some(tid) => vm.thread(tid).status.name(),
        None => "dead",
    }
}
