// Execution limits, mirroring luaconf.h / llimits.h defaults.

/// Maximum call depth before "stack overflow" (LUAI_MAXCCALLS).
pub const MAX_CALL_DEPTH: usize = 200;

/// Hard cap on a coroutine's value stack, in slots (LUAI_MAXSTACK-ish).
pub const MAX_STACK_SLOTS: usize = 1_000_000;

/// Initial value stack size (BASIC_STACK_SIZE).
pub const BASIC_STACK_SIZE: usize = 40;

/// Extra slots kept above a frame for metamethod staging (EXTRA_STACK).
pub const EXTRA_STACK: usize = 5;

/// Guaranteed free slots for a host function (LUA_MINSTACK).
pub const LUA_MINSTACK: usize = 20;

/// Bound on __index/__newindex/__call chains (MAXTAGLOOP in the 5.1.5
/// lvm.c).
pub const MAX_TAG_LOOP: usize = 100;

/// Variable number of results marker (LUA_MULTRET).
pub const LUA_MULTRET: i32 = -1;
