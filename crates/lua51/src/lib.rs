// Lua 5.1.5 virtual machine core: tagged values over an interned string
// pool, an incremental tri-color GC, hybrid tables, the register-based
// dispatch loop, coroutines and protected calls, plus the precompiled
// chunk loader. The compiler is not included; chunks arrive as 5.1
// bytecode (luac output or the in-crate dumper).

#[cfg(test)]
mod test;

pub mod gc;
pub mod lib_registry;
pub mod lua_value;
pub mod lua_vm;
pub mod stdlib;

pub use gc::{GcState, ObjectPool, StringInterner, ThreadId};
pub use lib_registry::LibraryRegistry;
pub use lua_value::{Closure, LuaStr, LuaTable, LuaValue, Proto};
pub use lua_vm::{
    CFunction, GcOption, Instruction, LuaError, LuaFullError, LuaResult, LuaVM, OpCode, OpMode,
    ThreadStatus,
};
