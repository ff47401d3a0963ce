// Metamethod events and the helpers that invoke them.

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVM};

/// Metamethod kinds, in the order their names are interned at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmKind {
    Index = 0,
    NewIndex,
    Call,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Len,
    Concat,
    Eq,
    Lt,
    Le,
    Gc,
}

impl TmKind {
    pub const ALL: [TmKind; 16] = [
        TmKind::Index,
        TmKind::NewIndex,
        TmKind::Call,
        TmKind::Add,
        TmKind::Sub,
        TmKind::Mul,
        TmKind::Div,
        TmKind::Mod,
        TmKind::Pow,
        TmKind::Unm,
        TmKind::Len,
        TmKind::Concat,
        TmKind::Eq,
        TmKind::Lt,
        TmKind::Le,
        TmKind::Gc,
    ];

    pub fn event_name(self) -> &'static str {
        match self {
            TmKind::Index => "__index",
            TmKind::NewIndex => "__newindex",
            TmKind::Call => "__call",
            TmKind::Add => "__add",
            TmKind::Sub => "__sub",
            TmKind::Mul => "__mul",
            TmKind::Div => "__div",
            TmKind::Mod => "__mod",
            TmKind::Pow => "__pow",
            TmKind::Unm => "__unm",
            TmKind::Len => "__len",
            TmKind::Concat => "__concat",
            TmKind::Eq => "__eq",
            TmKind::Lt => "__lt",
            TmKind::Le => "__le",
            TmKind::Gc => "__gc",
        }
    }
}

/// Call a metamethod and keep its first result.
pub fn call_tm_res(vm: &mut LuaVM, f: LuaValue, args: &[LuaValue]) -> LuaResult<LuaValue> {
    let results = vm.call_value(f, args)?;
    Ok(results.first().copied().unwrap_or(LuaValue::nil()))
}

/// Binary metamethod lookup: first operand's handler wins, then the
/// second's.
pub fn binary_tm(vm: &LuaVM, a: &LuaValue, b: &LuaValue, kind: TmKind) -> LuaValue {
    let mm = vm.get_metamethod(a, kind);
    if !mm.is_nil() {
        return mm;
    }
    vm.get_metamethod(b, kind)
}
