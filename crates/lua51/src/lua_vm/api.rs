// Host-facing stack API over the current thread, in the shape of the C
// API: 1-based indices, negatives counting back from the top.

use crate::lua_value::LuaValue;
use crate::lua_vm::execute::call::call_at;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

impl LuaVM {
    fn abs_index(&self, idx: i32) -> Option<usize> {
        let th = self.current_thread();
        if idx > 0 {
            let i = idx as usize - 1;
            if i < th.top { Some(i) } else { None }
        } else if idx < 0 {
            th.top.checked_sub((-idx) as usize)
        } else {
            None
        }
    }

    /// Value at a stack index; out-of-range reads are nil, as in the C
    /// API's acceptable-index convention.
    pub fn get(&self, idx: i32) -> LuaValue {
        match self.abs_index(idx) {
            Some(i) => self.current_thread().stack[i],
            None => LuaValue::nil(),
        }
    }

    pub fn push(&mut self, v: LuaValue) -> LuaResult<()> {
        self.current_thread_mut().push_value(v)
    }

    pub fn pop(&mut self, n: usize) {
        let th = self.current_thread_mut();
        let n = n.min(th.top);
        th.top -= n;
    }

    pub fn top_count(&self) -> usize {
        self.current_thread().top
    }

    /// Unprotected call: function at top-nargs-1, arguments above it.
    /// Results replace function and arguments.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> LuaResult<()> {
        let tid = self.current;
        let top = self.thread(tid).top;
        if top < nargs + 1 {
            return Err(self.error("not enough values for call"));
        }
        let func_pos = top - nargs - 1;
        call_at(self, tid, func_pos, nargs, nresults)
    }

    /// Protected variant of `call`: on failure the error value replaces
    /// the function and arguments, and false is returned.
    pub fn pcall(&mut self, nargs: usize, _nresults: i32) -> LuaResult<bool> {
        let tid = self.current;
        let top = self.thread(tid).top;
        if top < nargs + 1 {
            return Err(self.error("not enough values for call"));
        }
        let func_pos = top - nargs - 1;
        let (ok, _n) = self.protected_call(tid, func_pos, nargs, None);
        Ok(ok)
    }

    /// Load a chunk and run it protected with the given arguments;
    /// returns the chunk's results.
    pub fn run_chunk(&mut self, bytes: &[u8], args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
        let closure = self.load_chunk(bytes)?;
        let (ok, results) = self.pcall_values(closure, args)?;
        if ok {
            Ok(results)
        } else {
            let err = results.first().copied().unwrap_or(LuaValue::nil());
            self.current_thread_mut().error_value = err;
            Err(LuaError::RuntimeError)
        }
    }
}
