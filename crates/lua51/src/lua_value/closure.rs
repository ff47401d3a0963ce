// Closures: a prototype plus captured upvalues (Lua), or a host function
// plus captured values (native). Both carry an environment table that
// GETGLOBAL/SETGLOBAL index; it defaults to the VM globals.

use std::rc::Rc;

use crate::gc::{TableId, UpvalueId};
use crate::lua_value::Proto;
use crate::lua_vm::CFunction;

pub struct LuaClosure {
    pub proto: Rc<Proto>,
    pub upvalues: Vec<UpvalueId>,
    pub env: TableId,
}

pub struct NativeClosure {
    pub f: CFunction,
    /// Captured values playing the role of upvalues.
    pub upvalues: Vec<crate::lua_value::LuaValue>,
    pub env: TableId,
}

pub enum Closure {
    Lua(LuaClosure),
    Native(NativeClosure),
}

impl Closure {
    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        matches!(self, Closure::Lua(_))
    }

    #[inline(always)]
    pub fn as_lua(&self) -> Option<&LuaClosure> {
        match self {
            Closure::Lua(c) => Some(c),
            Closure::Native(_) => None,
        }
    }

    #[inline(always)]
    pub fn as_native(&self) -> Option<&NativeClosure> {
        match self {
            Closure::Native(c) => Some(c),
            Closure::Lua(_) => None,
        }
    }

    #[inline(always)]
    pub fn env(&self) -> TableId {
        match self {
            Closure::Lua(c) => c.env,
            Closure::Native(c) => c.env,
        }
    }
}
