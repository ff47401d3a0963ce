// Immutable function prototype: bytecode, constants, nested prototypes
// and debug information, produced by the bytecode loader. Prototypes are
// shared by Rc; their constants are interned strings and plain scalars,
// kept alive by tracing live closures.

use std::rc::Rc;

use smol_str::SmolStr;

use crate::lua_value::LuaValue;

// is_vararg flags (lobject.h)
pub const VARARG_HASARG: u8 = 1;
pub const VARARG_ISVARARG: u8 = 2;
pub const VARARG_NEEDSARG: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocVar {
    pub name: SmolStr,
    pub start_pc: i32,
    pub end_pc: i32,
}

pub struct Proto {
    pub source: SmolStr,
    pub line_defined: i32,
    pub last_line_defined: i32,
    pub nups: u8,
    pub num_params: u8,
    pub is_vararg: u8,
    pub max_stack_size: u8,
    pub code: Vec<u32>,
    /// Only nil, boolean, number and string constants exist on the wire.
    pub constants: Vec<LuaValue>,
    pub protos: Vec<Rc<Proto>>,
    /// Source line per instruction; may be empty when debug info was
    /// stripped.
    pub line_info: Vec<i32>,
    pub loc_vars: Vec<LocVar>,
    pub upvalue_names: Vec<SmolStr>,
}

impl Proto {
    #[inline(always)]
    pub fn is_vararg(&self) -> bool {
        (self.is_vararg & VARARG_ISVARARG) != 0
    }

    /// Source line of the instruction at `pc`, 0 when stripped.
    #[inline]
    pub fn line_at(&self, pc: usize) -> i32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }

    /// Printable chunk name, following luaO_chunkid: "@file" is a file
    /// name, "=name" is taken verbatim, anything else is literal source.
    pub fn chunk_name(&self) -> String {
        chunk_id(&self.source)
    }
}

pub fn chunk_id(source: &str) -> String {
    const MAX: usize = 60;
    if let Some(rest) = source.strip_prefix('=') {
        rest.chars().take(MAX).collect()
    } else if let Some(rest) = source.strip_prefix('@') {
        if rest.len() <= MAX {
            rest.to_string()
        } else {
            let tail: String = rest.chars().rev().take(MAX - 3).collect();
            format!("...{}", tail.chars().rev().collect::<String>())
        }
    } else {
        let first_line = source.lines().next().unwrap_or("");
        let truncated = first_line.len() > 40 || source.lines().count() > 1;
        let shown: String = first_line.chars().take(40).collect();
        if truncated {
            format!("[string \"{}...\"]", shown)
        } else {
            format!("[string \"{}\"]", shown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_forms() {
        assert_eq!(chunk_id("@test.lua"), "test.lua");
        assert_eq!(chunk_id("=stdin"), "stdin");
        assert_eq!(chunk_id("return 1"), "[string \"return 1\"]");
    }

    #[test]
    fn test_chunk_id_truncates_long_source() {
        let long = "x".repeat(100);
        let id = chunk_id(&long);
        assert!(id.starts_with("[string \""));
        assert!(id.ends_with("...\"]"));
    }
}
