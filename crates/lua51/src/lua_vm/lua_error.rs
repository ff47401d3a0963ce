// Lightweight error kind; the error *value* (whatever was passed to
// error()) lives on the raising thread so Results stay one byte wide.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    /// Runtime error; the error value is in the thread's error slot.
    RuntimeError,
    /// Bytecode stream rejected by the loader.
    LoadError,
    /// Coroutine yield unwinding toward resume; never escapes the VM.
    Yield,
    StackOverflow,
    OutOfMemory,
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaError::RuntimeError => write!(f, "runtime error"),
            LuaError::LoadError => write!(f, "load error"),
            LuaError::Yield => write!(f, "coroutine yield"),
            LuaError::StackOverflow => write!(f, "stack overflow"),
            LuaError::OutOfMemory => write!(f, "not enough memory"),
        }
    }
}

impl std::error::Error for LuaError {}

pub type LuaResult<T> = Result<T, LuaError>;

/// Error kind plus the rendered message, for embedders that want a
/// std::error::Error with the full "<source>:<line>: ..." text.
#[derive(Debug, Clone)]
pub struct LuaFullError {
    pub kind: LuaError,
    pub message: String,
}

impl std::fmt::Display for LuaFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for LuaFullError {}
