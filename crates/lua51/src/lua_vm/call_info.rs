// Per-frame bookkeeping, the counterpart of CallInfo in lstate.h.

use crate::lua_value::LuaValue;

/// Call status flags (CIST_*).
pub mod call_status {
    /// Frame runs a Lua closure.
    pub const CIST_LUA: u32 = 1 << 0;
    /// Frame runs a host function.
    pub const CIST_C: u32 = 1 << 1;
    /// Frame was reused by a tail call.
    pub const CIST_TAIL: u32 = 1 << 2;
    /// Frame was entered through a nested dispatch (pcall, metamethod,
    /// iterator call); yielding across it is an error.
    pub const CIST_FRESH: u32 = 1 << 3;
}

#[derive(Clone)]
pub struct CallInfo {
    /// The function being run.
    pub func: LuaValue,
    /// Absolute stack slot holding `func`; results land here on return.
    pub func_pos: usize,
    /// First register of this frame.
    pub base: usize,
    /// One past the frame's register window (base + maxstacksize for Lua
    /// frames, base + nargs for host frames).
    pub top: usize,
    /// Saved program counter (Lua frames only).
    pub pc: u32,
    /// Results expected by the caller; LUA_MULTRET for "all".
    pub nresults: i32,
    pub call_status: u32,
    /// Arguments beyond the named parameters (vararg frames).
    pub num_varargs: usize,
    /// Tail calls elided under this frame, for tracebacks.
    pub tailcalls: u32,
}

impl CallInfo {
    pub fn new_lua(
        func: LuaValue,
        func_pos: usize,
        base: usize,
        top: usize,
        nresults: i32,
        fresh: bool,
    ) -> Self {
        Self {
            func,
            func_pos,
            base,
            top,
            pc: 0,
            nresults,
            call_status: call_status::CIST_LUA | if fresh { call_status::CIST_FRESH } else { 0 },
            num_varargs: 0,
            tailcalls: 0,
        }
    }

    pub fn new_c(func: LuaValue, func_pos: usize, base: usize, nargs: usize, nresults: i32) -> Self {
        Self {
            func,
            func_pos,
            base,
            top: base + nargs,
            pc: 0,
            nresults,
            call_status: call_status::CIST_C,
            num_varargs: 0,
            tailcalls: 0,
        }
    }

    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        self.call_status & call_status::CIST_LUA != 0
    }

    #[inline(always)]
    pub fn is_c(&self) -> bool {
        self.call_status & call_status::CIST_C != 0
    }

    #[inline(always)]
    pub fn is_tail(&self) -> bool {
        self.call_status & call_status::CIST_TAIL != 0
    }

    #[inline(always)]
    pub fn is_fresh(&self) -> bool {
        self.call_status & call_status::CIST_FRESH != 0
    }

    #[inline(always)]
    pub fn set_tail(&mut self) {
        self.call_status |= call_status::CIST_TAIL;
    }
}
