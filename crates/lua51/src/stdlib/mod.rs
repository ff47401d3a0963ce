pub mod basic;
pub mod coroutine;

use crate::lib_registry::create_core_registry;
use crate::lua_vm::{LuaResult, LuaVM};

impl LuaVM {
    /// Install the core libraries (base functions and coroutine).
    pub fn open_libs(&mut self) -> LuaResult<()> {
        create_core_registry().load_all(self)
    }
}
