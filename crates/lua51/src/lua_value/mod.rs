pub mod bytecode;
mod closure;
pub mod lua_convert;
mod lua_string;
mod lua_table;
mod lua_userdata;
#[allow(clippy::module_inception)]
mod lua_value;
mod proto;

pub use closure::{Closure, LuaClosure, NativeClosure};
pub use lua_convert::{num_to_display, str_to_number, value_to_number, value_to_string_bytes};
pub use lua_string::{LuaStr, SHORT_STRING_LIMIT, lua_str_hash};
pub use lua_table::{LuaTable, TableKeyError};
pub use lua_userdata::LuaUserdata;
pub use lua_value::*;
pub use proto::{LocVar, Proto, VARARG_HASARG, VARARG_ISVARARG, VARARG_NEEDSARG, chunk_id};
