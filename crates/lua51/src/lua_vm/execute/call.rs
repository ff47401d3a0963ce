// Call machinery: frame setup/teardown for Lua and host functions,
// nested (protected) calls, and the coroutine resume/yield protocol.
//
// Plain Lua-to-Lua calls never recurse in Rust: the dispatch loop just
// pushes a frame and reloads. Nested dispatch happens only for
// metamethods, pcall bodies, iterator calls and resume entries; those
// frames carry CIST_FRESH, which is exactly the yield boundary.

use crate::gc::ThreadId;
use crate::lua_value::{Closure, LuaValue};
use crate::lua_vm::execute::lua_execute;
use crate::lua_vm::execute::metamethod::TmKind;
use crate::lua_vm::lua_limits::{LUA_MINSTACK, LUA_MULTRET, MAX_CALL_DEPTH};
use crate::lua_vm::{CallInfo, LuaError, LuaResult, LuaVM, ThreadStatus};

/// What precall did with the callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreCall {
    /// Host function: already ran to completion, results placed.
    Native,
    /// Lua closure: frame pushed, dispatch loop must enter it.
    Lua,
}

/// Resolve a non-function callee through __call, inserting the original
/// object as first argument. One level, as in 5.1.
fn resolve_call(
    vm: &mut LuaVM,
    tid: ThreadId,
    func_pos: usize,
    nargs: usize,
) -> LuaResult<usize> {
    let func = vm.thread(tid).stack[func_pos];
    let mm = vm.get_metamethod(&func, TmKind::Call);
    if !mm.is_function() {
        let type_name = func.type_name();
        return Err(vm.error(format!("attempt to call a {} value", type_name)));
    }
    let th = vm.thread_mut(tid);
    th.ensure_stack(func_pos + 2 + nargs)?;
    for i in (0..nargs).rev() {
        th.stack[func_pos + 2 + i] = th.stack[func_pos + 1 + i];
    }
    th.stack[func_pos + 1] = func;
    th.stack[func_pos] = mm;
    th.top = func_pos + 2 + nargs;
    Ok(nargs + 1)
}

/// Set up a call to stack[func_pos] with `nargs` arguments above it.
/// Host callees run to completion here; Lua callees get a frame.
pub fn precall(
    vm: &mut LuaVM,
    tid: ThreadId,
    func_pos: usize,
    mut nargs: usize,
    nresults: i32,
    fresh: bool,
) -> LuaResult<PreCall> {
    let mut func = vm.thread(tid).stack[func_pos];
    if !func.is_function() {
        nargs = resolve_call(vm, tid, func_pos, nargs)?;
        func = vm.thread(tid).stack[func_pos];
    }
    if vm.thread(tid).frames.len() >= MAX_CALL_DEPTH {
        return Err(vm.error("stack overflow"));
    }

    // Host function?
    let native_fn = if func.is_cfunction() {
        Some(func.fvalue())
    } else {
        match vm.pool.closure(func.clvalue()) {
            Closure::Native(nc) => Some(nc.f),
            Closure::Lua(_) => None,
        }
    };

    if let Some(f) = native_fn {
        let base = func_pos + 1;
        {
            let th = vm.thread_mut(tid);
            th.ensure_stack(base + nargs + LUA_MINSTACK)?;
            th.top = base + nargs;
            th.frames.push(CallInfo::new_c(func, func_pos, base, nargs, nresults));
        }
        match f(vm) {
            Ok(n) => {
                poscall_native(vm, tid, func_pos, n, nresults);
                Ok(PreCall::Native)
            }
            Err(LuaError::Yield) => {
                // Suspension point: drop the host frame and remember
                // where its results must land on resume.
                let th = vm.thread_mut(tid);
                th.frames.pop();
                th.resume_slot = Some((func_pos, nresults));
                Err(LuaError::Yield)
            }
            Err(e) => Err(e),
        }
    } else {
        // Lua closure.
        let proto = match vm.pool.closure(func.clvalue()) {
            Closure::Lua(lc) => lc.proto.clone(),
            Closure::Native(_) => unreachable!("native handled above"),
        };
        let max_stack = proto.max_stack_size as usize;
        let nfixed = proto.num_params as usize;

        let (base, num_varargs, arg_end) = if proto.is_vararg() {
            // Move the named parameters above the argument block; the
            // extras stay behind, addressed by VARARG.
            let base = func_pos + 1 + nargs;
            let th = vm.thread_mut(tid);
            th.ensure_stack(base + max_stack)?;
            let ncopy = nfixed.min(nargs);
            for i in 0..ncopy {
                th.stack[base + i] = th.stack[func_pos + 1 + i];
                th.stack[func_pos + 1 + i] = LuaValue::nil();
            }
            (base, nargs.saturating_sub(nfixed), base + ncopy)
        } else {
            let base = func_pos + 1;
            let th = vm.thread_mut(tid);
            th.ensure_stack(base + max_stack)?;
            (base, 0, base + nargs)
        };

        let th = vm.thread_mut(tid);
        // Registers past the arguments start out nil.
        for i in arg_end..(base + max_stack) {
            th.stack[i] = LuaValue::nil();
        }
        let mut ci = CallInfo::new_lua(func, func_pos, base, base + max_stack, nresults, fresh);
        ci.num_varargs = num_varargs;
        th.frames.push(ci);
        th.top = base + max_stack;
        Ok(PreCall::Lua)
    }
}

/// Move a finished host call's results down to the function slot and
/// adjust the count the caller asked for.
fn poscall_native(vm: &mut LuaVM, tid: ThreadId, func_pos: usize, n: usize, nresults: i32) {
    let th = vm.thread_mut(tid);
    let first = th.top - n;
    for i in 0..n {
        th.stack[func_pos + i] = th.stack[first + i];
    }
    th.frames.pop();
    if nresults == LUA_MULTRET {
        th.top = func_pos + n;
    } else {
        let wanted = nresults as usize;
        for i in n..wanted {
            th.stack[func_pos + i] = LuaValue::nil();
        }
        th.top = func_pos + wanted;
    }
}

/// Call stack[func_pos] and run it to completion with a nested dispatch
/// (the frame is "fresh": yields may not cross it).
pub fn call_at(
    vm: &mut LuaVM,
    tid: ThreadId,
    func_pos: usize,
    nargs: usize,
    nresults: i32,
) -> LuaResult<()> {
    let depth = vm.thread(tid).frames.len();
    match precall(vm, tid, func_pos, nargs, nresults, true)? {
        PreCall::Lua => lua_execute(vm, tid, depth),
        PreCall::Native => Ok(()),
    }
}

impl LuaVM {
    /// Call `f` with `args` on the current thread, collecting all
    /// results. Errors propagate to the nearest protected boundary.
    pub fn call_value(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
        let tid = self.current;
        let func_pos = self.thread(tid).top;
        {
            let th = self.thread_mut(tid);
            th.ensure_stack(func_pos + 1 + args.len())?;
            th.stack[func_pos] = f;
            for (i, a) in args.iter().enumerate() {
                th.stack[func_pos + 1 + i] = *a;
            }
            th.top = func_pos + 1 + args.len();
        }
        call_at(self, tid, func_pos, args.len(), LUA_MULTRET)?;
        let th = self.thread_mut(tid);
        let results = th.stack[func_pos..th.top].to_vec();
        th.top = func_pos;
        Ok(results)
    }

    /// Protected call of the function sitting at `func_pos`. Returns
    /// (true, nresults) or, after catching and unwinding, (false, 1)
    /// with the error value at `func_pos`.
    pub fn protected_call(
        &mut self,
        tid: ThreadId,
        func_pos: usize,
        nargs: usize,
        errfunc: Option<LuaValue>,
    ) -> (bool, usize) {
        let saved_depth = self.thread(tid).frames.len();
        let saved_errfunc = std::mem::replace(&mut self.thread_mut(tid).errfunc, errfunc);
        let result = call_at(self, tid, func_pos, nargs, LUA_MULTRET);
        self.thread_mut(tid).errfunc = saved_errfunc;
        match result {
            Ok(()) => {
                let n = self.thread(tid).top - func_pos;
                (true, n)
            }
            Err(kind) => {
                let errval = self.error_value_for(tid, kind);
                // Unwind: discard frames above the barrier, closing the
                // upvalues that pointed into the discarded region.
                self.close_upvalues(tid, func_pos);
                let th = self.thread_mut(tid);
                th.frames.truncate(saved_depth);
                th.stack[func_pos] = errval;
                th.top = func_pos + 1;
                (false, 1)
            }
        }
    }

    /// Materialize the error value for a caught error kind.
    pub(crate) fn error_value_for(&mut self, tid: ThreadId, kind: LuaError) -> LuaValue {
        match kind {
            LuaError::RuntimeError | LuaError::LoadError => self.thread(tid).error_value,
            LuaError::StackOverflow => self.new_string("stack overflow"),
            LuaError::OutOfMemory => self.new_string("not enough memory"),
            LuaError::Yield => {
                self.new_string("attempt to yield across metamethod/C-call boundary")
            }
        }
    }

    /// pcall-shaped helper over values: returns (ok, results).
    pub fn pcall_values(
        &mut self,
        f: LuaValue,
        args: &[LuaValue],
    ) -> LuaResult<(bool, Vec<LuaValue>)> {
        self.xpcall_values(f, args, None)
    }

    /// xpcall-shaped helper: the handler (when given) runs at the error
    /// site, before unwinding.
    pub fn xpcall_values(
        &mut self,
        f: LuaValue,
        args: &[LuaValue],
        handler: Option<LuaValue>,
    ) -> LuaResult<(bool, Vec<LuaValue>)> {
        let tid = self.current;
        let func_pos = self.thread(tid).top;
        {
            let th = self.thread_mut(tid);
            th.ensure_stack(func_pos + 1 + args.len())?;
            th.stack[func_pos] = f;
            for (i, a) in args.iter().enumerate() {
                th.stack[func_pos + 1 + i] = *a;
            }
            th.top = func_pos + 1 + args.len();
        }
        let (ok, n) = self.protected_call(tid, func_pos, args.len(), handler);
        let th = self.thread_mut(tid);
        let results = th.stack[func_pos..func_pos + n].to_vec();
        th.top = func_pos;
        Ok((ok, results))
    }

    // ============ Coroutines ============

    /// Resume a coroutine with `args`. Returns (true, values) on yield
    /// or completion, (false, [error]) on failure — the convention of
    /// coroutine.resume.
    pub fn resume_value(&mut self, co: LuaValue, args: &[LuaValue]) -> (bool, Vec<LuaValue>) {
        let Some(tid) = co.as_thread_id() else {
            let msg = self.new_string("cannot resume non-coroutine value");
            return (false, vec![msg]);
        };
        match self.thread(tid).status {
            ThreadStatus::Dead => {
                let msg = self.new_string("cannot resume dead coroutine");
                return (false, vec![msg]);
            }
            ThreadStatus::Running | ThreadStatus::Normal => {
                let msg = self.new_string("cannot resume non-suspended coroutine");
                return (false, vec![msg]);
            }
            ThreadStatus::Suspended => {}
        }

        let prev = self.current;
        self.thread_mut(prev).status = ThreadStatus::Normal;
        self.thread_mut(tid).status = ThreadStatus::Running;
        self.current = tid;

        let outcome = self.resume_body(tid, args);

        self.current = prev;
        self.thread_mut(prev).status = ThreadStatus::Running;

        match outcome {
            Ok(()) => {
                // Body returned: results sit at the stack bottom.
                self.close_upvalues(tid, 0);
                let th = self.thread_mut(tid);
                th.status = ThreadStatus::Dead;
                let results = th.stack[0..th.top].to_vec();
                th.top = 0;
                (true, results)
            }
            Err(LuaError::Yield) => {
                let th = self.thread_mut(tid);
                th.status = ThreadStatus::Suspended;
                let vals = std::mem::take(&mut th.transfer);
                (true, vals)
            }
            Err(kind) => {
                let errval = self.error_value_for(tid, kind);
                self.close_upvalues(tid, 0);
                let th = self.thread_mut(tid);
                th.status = ThreadStatus::Dead;
                th.frames.clear();
                th.top = 0;
                (false, vec![errval])
            }
        }
    }

    fn resume_body(&mut self, tid: ThreadId, args: &[LuaValue]) -> LuaResult<()> {
        if let Some((slot, wanted)) = self.thread_mut(tid).resume_slot.take() {
            // Continuing after a yield: the resume arguments are the
            // results of the suspended call.
            {
                let th = self.thread_mut(tid);
                th.ensure_stack(slot + args.len().max(wanted.max(0) as usize) + 1)?;
                if wanted == LUA_MULTRET {
                    for (i, a) in args.iter().enumerate() {
                        th.stack[slot + i] = *a;
                    }
                    th.top = slot + args.len();
                } else {
                    let wanted = wanted as usize;
                    for i in 0..wanted {
                        th.stack[slot + i] =
                            args.get(i).copied().unwrap_or(LuaValue::nil());
                    }
                    // Registers resynchronize with the frame window.
                    let frame_top = th.frames.last().map(|ci| ci.top);
                    th.top = frame_top.unwrap_or(slot + wanted);
                }
            }
            lua_execute(self, tid, 0)
        } else {
            // First resume: stage the body function and its arguments.
            {
                let th = self.thread_mut(tid);
                th.ensure_stack(1 + args.len())?;
                th.stack[0] = th.entry;
                for (i, a) in args.iter().enumerate() {
                    th.stack[1 + i] = *a;
                }
                th.top = 1 + args.len();
            }
            let depth = self.thread(tid).frames.len();
            match precall(self, tid, 0, args.len(), LUA_MULTRET, false)? {
                PreCall::Lua => lua_execute(self, tid, depth),
                PreCall::Native => Ok(()),
            }
        }
    }

    /// Suspend the running coroutine, handing `args` back to resume.
    /// Must be called from a host function invoked by a plain Lua frame
    /// of a coroutine; anything else is a boundary error.
    pub fn do_yield(&mut self, args: Vec<LuaValue>) -> LuaError {
        let tid = self.current;
        if tid.is_main() {
            return self.error("attempt to yield from outside a coroutine");
        }
        let blocked = {
            let th = self.thread(tid);
            let n = th.frames.len();
            // Every frame strictly between the coroutine body and the
            // yielding host frame must be a plain Lua frame.
            th.frames[..n.saturating_sub(1)]
                .iter()
                .enumerate()
                .any(|(i, f)| i > 0 && (f.is_c() || f.is_fresh()))
        };
        if blocked {
            return self.error("attempt to yield across metamethod/C-call boundary");
        }
        self.thread_mut(tid).transfer = args;
        LuaError::Yield
    }
}
