// The VM: global state shared by every coroutine. Owns the object
// pools, the string interner, the collector, the globals/registry
// tables and the thread pool; the dispatch loop in `execute` drives a
// thread against this state.

mod api;
pub mod call_info;
pub mod execute;
mod lua_error;
pub mod lua_limits;
mod lua_thread;
pub mod opcode;

pub use call_info::CallInfo;
pub use lua_error::{LuaError, LuaFullError, LuaResult};
pub use lua_limits::LUA_MULTRET;
pub use lua_thread::{LuaThread, ThreadStatus, Upvalue};
pub use opcode::{Instruction, OpCode, OpMode};

use std::rc::Rc;

use crate::gc::{
    GC, Gc, GcHeap, GcId, GcState, ObjectPool, StringId, TableId, ThreadId, ThreadPool,
    ThreadPoolExt, StringInterner, UpvalueId,
};
use crate::lua_value::{
    Closure, LuaClosure, LuaTable, LuaUserdata, LuaValue, NativeClosure, Proto, TableKeyError,
    num_to_display,
};
use execute::metamethod::TmKind;

/// Host function: reads its arguments from the current frame, pushes
/// its results on the current thread's stack, returns how many.
pub type CFunction = fn(&mut LuaVM) -> LuaResult<usize>;

/// collectgarbage() options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOption {
    Stop,
    Restart,
    Collect,
    Count,
    Step,
    SetPause(i32),
    SetStepMul(i32),
}

pub struct LuaVM {
    pub pool: ObjectPool,
    pub threads: ThreadPool,
    pub interner: StringInterner,
    pub gc: GC,
    globals: TableId,
    registry: TableId,
    /// The thread currently executing (or about to).
    pub current: ThreadId,
    /// Interned metamethod names, indexed by TmKind.
    tm_names: Vec<StringId>,
    /// Re-entrancy latch: no collection while a finalizer runs.
    in_finalizer: bool,
    /// Message of the most recent failing __gc, kept for inspection.
    pub last_finalizer_error: Option<String>,
}

impl LuaVM {
    pub fn new() -> Self {
        let mut vm = LuaVM {
            pool: ObjectPool::new(),
            threads: ThreadPool::new(),
            interner: StringInterner::new(),
            gc: GC::new(),
            globals: TableId(0),
            registry: TableId(0),
            current: ThreadId::MAIN,
            tm_names: Vec::new(),
            in_finalizer: false,
            last_finalizer_error: None,
        };

        // Main thread occupies slot 0 and is never collected.
        let main = LuaThread::new(LuaValue::nil());
        let mut main_obj = Gc::with_white(main, vm.gc.current_white, 512);
        main_obj.header.set_fixed();
        main_obj.data.status = ThreadStatus::Running;
        let main_id = vm.threads.alloc(main_obj);
        debug_assert_eq!(main_id, ThreadId::MAIN.0);

        vm.globals = vm.alloc_table(LuaTable::new(0, 32));
        vm.registry = vm.alloc_table(LuaTable::new(0, 8));

        // Fixed metamethod-name strings; "__mode" is shared with the GC.
        for kind in TmKind::ALL {
            let id = vm.intern_id(kind.event_name().as_bytes());
            vm.pool.strings.get_mut(id.0).header.set_fixed();
            vm.tm_names.push(id);
        }
        let mode = vm.intern_id(b"__mode");
        vm.pool.strings.get_mut(mode.0).header.set_fixed();
        vm.gc.set_mode_key(mode);

        vm
    }

    // ============ Allocation ============

    pub fn intern_id(&mut self, bytes: &[u8]) -> StringId {
        self.interner
            .intern(bytes, &mut self.pool.strings, &mut self.gc)
    }

    pub fn new_string(&mut self, s: &str) -> LuaValue {
        LuaValue::string(self.intern_id(s.as_bytes()))
    }

    pub fn new_string_bytes(&mut self, bytes: &[u8]) -> LuaValue {
        LuaValue::string(self.intern_id(bytes))
    }

    fn alloc_table(&mut self, t: LuaTable) -> TableId {
        let size = (std::mem::size_of::<Gc<LuaTable>>()
            + t.array_len() * 16
            + t.node_len() * 40) as u32;
        let id = TableId(
            self.pool
                .tables
                .alloc(Gc::with_white(t, self.gc.current_white, size)),
        );
        self.gc.note_alloc(size as usize);
        id
    }

    pub fn new_table(&mut self, narr: usize, nhash: usize) -> LuaValue {
        LuaValue::table(self.alloc_table(LuaTable::new(narr, nhash)))
    }

    pub fn new_lua_closure(&mut self, proto: Rc<Proto>, upvalues: Vec<UpvalueId>) -> LuaValue {
        let env = self.globals;
        self.new_lua_closure_with_env(proto, upvalues, env)
    }

    pub fn new_lua_closure_with_env(
        &mut self,
        proto: Rc<Proto>,
        upvalues: Vec<UpvalueId>,
        env: TableId,
    ) -> LuaValue {
        let size = (std::mem::size_of::<Gc<Closure>>() + upvalues.len() * 8) as u32;
        let closure = Closure::Lua(LuaClosure {
            proto,
            upvalues,
            env,
        });
        let id = self
            .pool
            .closures
            .alloc(Gc::with_white(closure, self.gc.current_white, size));
        self.gc.note_alloc(size as usize);
        LuaValue::closure(crate::gc::ClosureId(id))
    }

    pub fn new_native_closure(&mut self, f: CFunction, upvalues: Vec<LuaValue>) -> LuaValue {
        let size = (std::mem::size_of::<Gc<Closure>>() + upvalues.len() * 16) as u32;
        let closure = Closure::Native(NativeClosure {
            f,
            upvalues,
            env: self.globals,
        });
        let id = self
            .pool
            .closures
            .alloc(Gc::with_white(closure, self.gc.current_white, size));
        self.gc.note_alloc(size as usize);
        LuaValue::closure(crate::gc::ClosureId(id))
    }

    pub fn new_userdata(&mut self, data: Box<dyn std::any::Any>) -> LuaValue {
        let size = std::mem::size_of::<Gc<LuaUserdata>>() as u32 + 64;
        let id = self
            .pool
            .userdata
            .alloc(Gc::with_white(LuaUserdata::new(data), self.gc.current_white, size));
        self.gc.note_alloc(size as usize);
        LuaValue::userdata(crate::gc::UserdataId(id))
    }

    pub fn new_thread(&mut self, entry: LuaValue) -> LuaValue {
        let size = 512;
        let id = ThreadId(
            self.threads
                .alloc(Gc::with_white(LuaThread::new(entry), self.gc.current_white, size)),
        );
        self.gc.note_alloc(size as usize);
        LuaValue::thread(id)
    }

    pub fn alloc_upvalue(&mut self, uv: Upvalue) -> UpvalueId {
        let size = std::mem::size_of::<Gc<Upvalue>>() as u32;
        let id = UpvalueId(
            self.pool
                .upvalues
                .alloc(Gc::with_white(uv, self.gc.current_white, size)),
        );
        self.gc.note_alloc(size as usize);
        id
    }

    // ============ Threads ============

    #[inline(always)]
    pub fn thread(&self, id: ThreadId) -> &LuaThread {
        self.threads.thread(id)
    }

    #[inline(always)]
    pub fn thread_mut(&mut self, id: ThreadId) -> &mut LuaThread {
        self.threads.thread_mut(id)
    }

    #[inline(always)]
    pub fn current_thread(&self) -> &LuaThread {
        self.threads.thread(self.current)
    }

    #[inline(always)]
    pub fn current_thread_mut(&mut self) -> &mut LuaThread {
        self.threads.thread_mut(self.current)
    }

    // ============ Globals ============

    #[inline(always)]
    pub fn globals_table(&self) -> TableId {
        self.globals
    }

    #[inline(always)]
    pub fn globals_value(&self) -> LuaValue {
        LuaValue::table(self.globals)
    }

    #[inline(always)]
    pub fn registry_value(&self) -> LuaValue {
        LuaValue::table(self.registry)
    }

    pub fn set_global(&mut self, name: &str, v: LuaValue) {
        let key = self.new_string(name);
        let g = self.globals;
        // Global names are never nil or NaN.
        let _ = self.table_set(g, key, v);
    }

    pub fn get_global(&mut self, name: &str) -> LuaValue {
        let key = self.new_string(name);
        self.pool.table(self.globals).get(&key)
    }

    // ============ Tables (raw access + write barrier) ============

    pub fn table_get(&self, t: TableId, key: &LuaValue) -> LuaValue {
        self.pool.table(t).get(key)
    }

    /// Raw set with the backward write barrier: mutating a black table
    /// re-grays it so the atomic phase rescans its entries.
    pub fn table_set(
        &mut self,
        t: TableId,
        key: LuaValue,
        val: LuaValue,
    ) -> Result<(), TableKeyError> {
        self.pool.table_mut(t).set(key, val)?;
        self.gc.barrier_back(t, &mut self.pool);
        Ok(())
    }

    pub fn table_set_int(&mut self, t: TableId, i: i64, val: LuaValue) {
        self.pool.table_mut(t).set_int(i, val);
        self.gc.barrier_back(t, &mut self.pool);
    }

    // ============ Metatables ============

    pub fn metatable_of(&self, v: &LuaValue) -> Option<TableId> {
        if v.is_table() {
            self.pool.table(v.hvalue()).metatable()
        } else if v.is_userdata() {
            self.pool.userdata(v.uvalue()).metatable()
        } else {
            None
        }
    }

    /// Install a metatable and register the object for finalization when
    /// the metatable carries __gc.
    pub fn set_metatable(&mut self, v: &LuaValue, mt: Option<TableId>) {
        if v.is_table() {
            self.pool.table_mut(v.hvalue()).set_metatable(mt);
            self.gc.barrier_back(v.hvalue(), &mut self.pool);
        } else if v.is_userdata() {
            let id = v.uvalue();
            self.pool.userdata_mut(id).set_metatable(mt);
            if let Some(mt) = mt {
                let black = self.pool.userdata.get(id.0).header.is_black();
                let mt_val = LuaValue::table(mt);
                self.forward_barrier(black, mt_val);
            }
        } else {
            return;
        }
        if let Some(mt) = mt {
            let gc_key = LuaValue::string(self.tm_names[TmKind::Gc as usize]);
            if !self.pool.table(mt).get(&gc_key).is_nil() {
                let id = match v.gc_id() {
                    Some(id) => id,
                    None => return,
                };
                self.gc.register_finalizable(id);
            }
        }
    }

    #[inline]
    pub fn tm_name(&self, kind: TmKind) -> LuaValue {
        LuaValue::string(self.tm_names[kind as usize])
    }

    /// Metamethod lookup on a value (raw, no __index chasing).
    pub fn get_metamethod(&self, v: &LuaValue, kind: TmKind) -> LuaValue {
        match self.metatable_of(v) {
            Some(mt) => {
                let key = LuaValue::string(self.tm_names[kind as usize]);
                self.pool.table(mt).get(&key)
            }
            None => LuaValue::nil(),
        }
    }

    // ============ Upvalues ============

    /// Find a live open upvalue for this stack slot or create one; two
    /// closures capturing the same local share a cell.
    pub fn open_upvalue(&mut self, tid: ThreadId, index: usize) -> UpvalueId {
        let mut insert_at = 0;
        {
            let th = self.threads.thread(tid);
            for (pos, &uv) in th.open_upvalues.iter().enumerate() {
                match self.pool.upvalue(uv).open_index() {
                    Some(i) if i == index => return uv,
                    Some(i) if i > index => {
                        insert_at = pos + 1;
                    }
                    _ => break,
                }
            }
        }
        let id = self.alloc_upvalue(Upvalue::Open { thread: tid, index });
        self.threads
            .thread_mut(tid)
            .open_upvalues
            .insert(insert_at, id);
        id
    }

    /// Close every open upvalue at or above `level`: copy the stack
    /// value into the cell and detach it from the stack.
    pub fn close_upvalues(&mut self, tid: ThreadId, level: usize) {
        loop {
            let Some(&uv) = self.threads.thread(tid).open_upvalues.first() else {
                return;
            };
            let index = match self.pool.upvalue(uv).open_index() {
                Some(i) if i >= level => i,
                _ => return,
            };
            let value = self.threads.thread(tid).stack[index];
            let black = self.pool.upvalues.get(uv.0).header.is_black();
            *self.pool.upvalue_mut(uv) = Upvalue::Closed(value);
            self.forward_barrier(black, value);
            self.threads.thread_mut(tid).open_upvalues.remove(0);
        }
    }

    pub fn upvalue_get(&self, id: UpvalueId) -> LuaValue {
        match self.pool.upvalue(id) {
            Upvalue::Closed(v) => *v,
            Upvalue::Open { thread, index } => self.threads.thread(*thread).stack[*index],
        }
    }

    pub fn upvalue_set(&mut self, id: UpvalueId, v: LuaValue) {
        let black = self.pool.upvalues.get(id.0).header.is_black();
        match self.pool.upvalue_mut(id) {
            Upvalue::Closed(slot) => {
                *slot = v;
            }
            Upvalue::Open { thread, index } => {
                let (t, i) = (*thread, *index);
                self.threads.thread_mut(t).stack[i] = v;
                return; // stacks are rescanned in atomic, no barrier
            }
        }
        self.forward_barrier(black, v);
    }

    fn forward_barrier(&mut self, parent_black: bool, child: LuaValue) {
        let LuaVM {
            pool,
            threads,
            interner,
            gc,
            globals,
            registry,
            ..
        } = self;
        let mut heap = GcHeap {
            pool,
            threads,
            interner,
            globals: LuaValue::table(*globals),
            registry: LuaValue::table(*registry),
        };
        gc.barrier_forward(parent_black, child, &mut heap);
    }

    // ============ GC driving ============

    /// One incremental step if the collector is due; called by the
    /// dispatch loop after allocating instructions and by API entries.
    pub fn check_gc(&mut self) {
        if self.in_finalizer || !self.gc.should_step() {
            return;
        }
        self.gc_step_now(false);
    }

    fn gc_step_now(&mut self, unbounded: bool) {
        let due = {
            let LuaVM {
                pool,
                threads,
                interner,
                gc,
                globals,
                registry,
                ..
            } = self;
            let mut heap = GcHeap {
                pool,
                threads,
                interner,
                globals: LuaValue::table(*globals),
                registry: LuaValue::table(*registry),
            };
            gc.step(&mut heap, unbounded)
        };
        for id in due {
            self.run_finalizer(id);
        }
    }

    /// Run one __gc finalizer in a protected environment. A failing
    /// finalizer is recorded, never propagated.
    fn run_finalizer(&mut self, id: GcId) {
        let obj = match id {
            GcId::Table(t) => LuaValue::table(t),
            GcId::Userdata(u) => LuaValue::userdata(u),
            _ => return,
        };
        let mm = self.get_metamethod(&obj, TmKind::Gc);
        if !mm.is_function() {
            return;
        }
        self.in_finalizer = true;
        let result = self.pcall_values(mm, &[obj]);
        self.in_finalizer = false;
        if let Ok((false, errs)) = result {
            let msg = errs
                .first()
                .map(|e| self.display_value(e))
                .unwrap_or_default();
            self.last_finalizer_error = Some(msg);
        }
    }

    /// Run a full collection cycle to completion (collectgarbage
    /// "collect"): finish any cycle in flight, then run a whole one.
    pub fn collect_garbage(&mut self) {
        while self.gc.state != GcState::Pause {
            self.gc_step_now(true);
        }
        self.gc_step_now(true);
        while self.gc.state != GcState::Pause {
            self.gc_step_now(true);
        }
    }

    pub fn gc_control(&mut self, opt: GcOption) -> isize {
        match opt {
            GcOption::Stop => {
                self.gc.running = false;
                0
            }
            GcOption::Restart => {
                self.gc.running = true;
                0
            }
            GcOption::Collect => {
                self.collect_garbage();
                0
            }
            GcOption::Count => (self.gc.total_bytes() / 1024) as isize,
            GcOption::Step => {
                self.gc_step_now(false);
                (self.gc.state == GcState::Pause) as isize
            }
            GcOption::SetPause(p) => self.gc.set_pause(p) as isize,
            GcOption::SetStepMul(m) => self.gc.set_stepmul(m) as isize,
        }
    }

    // ============ Errors ============

    /// Render a value for error reporting and tostring().
    pub fn display_value(&self, v: &LuaValue) -> String {
        if v.is_string() {
            let s = self.pool.string(v.tsvalue());
            return String::from_utf8_lossy(s.as_bytes()).into_owned();
        }
        if v.is_number() {
            return num_to_display(v.nvalue());
        }
        match v.ttype() {
            crate::lua_value::LUA_TNIL => "nil".to_string(),
            crate::lua_value::LUA_TBOOLEAN => {
                if v.bvalue() { "true" } else { "false" }.to_string()
            }
            _ => {
                format!("{}: 0x{:08x}", v.type_name(), raw_obj_id(v))
            }
        }
    }

    /// Source position "<chunk>:<line>: " of the innermost Lua frame.
    pub fn where_prefix(&self, level: usize) -> String {
        let th = self.current_thread();
        let mut seen = 0;
        for ci in th.frames.iter().rev() {
            if !ci.is_lua() {
                continue;
            }
            seen += 1;
            if seen < level {
                continue;
            }
            if let Some(cl) = ci.func.as_closure_id() {
                if let Some(lua) = self.pool.closure(cl).as_lua() {
                    let line = lua.proto.line_at(ci.pc.saturating_sub(1) as usize);
                    return format!("{}:{}: ", lua.proto.chunk_name(), line);
                }
            }
        }
        String::new()
    }

    /// Raise a runtime error with source-position prefix.
    pub fn error(&mut self, msg: impl Into<String>) -> LuaError {
        let msg = format!("{}{}", self.where_prefix(1), msg.into());
        let v = self.new_string(&msg);
        self.throw_value(v)
    }

    /// Raise an arbitrary error value, invoking the active xpcall
    /// handler (if any) at the error site, before unwinding.
    pub fn throw_value(&mut self, v: LuaValue) -> LuaError {
        let handler = self.current_thread_mut().errfunc.take();
        let final_value = match handler {
            Some(h) if h.is_function() => {
                // The handler runs without itself being protected by the
                // same handler; a failing handler degenerates cleanly.
                let res = self.call_value(h, &[v]);
                self.current_thread_mut().errfunc = Some(h);
                match res {
                    Ok(vals) => vals.first().copied().unwrap_or(LuaValue::nil()),
                    Err(_) => self.new_string("error in error handling"),
                }
            }
            other => {
                self.current_thread_mut().errfunc = other;
                v
            }
        };
        self.current_thread_mut().error_value = final_value;
        LuaError::RuntimeError
    }

    /// Message of the current thread's pending error value.
    pub fn error_message(&self) -> String {
        self.display_value(&self.current_thread().error_value)
    }

    pub fn into_full_error(&self, kind: LuaError) -> LuaFullError {
        let message = match kind {
            LuaError::RuntimeError | LuaError::LoadError => self.error_message(),
            other => other.to_string(),
        };
        LuaFullError { kind, message }
    }

    // ============ Host-function argument helpers ============

    pub fn arg(&self, n: usize) -> Option<LuaValue> {
        self.current_thread().arg(n)
    }

    pub fn args(&self) -> Vec<LuaValue> {
        self.current_thread().c_args().to_vec()
    }

    pub fn arg_count(&self) -> usize {
        self.current_thread().arg_count()
    }

    pub fn push_value(&mut self, v: LuaValue) -> LuaResult<()> {
        self.current_thread_mut().push_value(v)
    }

    /// Captured value of the running native closure.
    pub fn native_upvalue(&self, n: usize) -> Option<LuaValue> {
        let ci = self.current_thread().current_frame()?;
        let id = ci.func.as_closure_id()?;
        match self.pool.closure(id) {
            Closure::Native(nc) => nc.upvalues.get(n).copied(),
            Closure::Lua(_) => None,
        }
    }
}

impl Default for LuaVM {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw id bits for printing "table: 0x...".
fn raw_obj_id(v: &LuaValue) -> u32 {
    match v.gc_id() {
        Some(GcId::Table(t)) => t.0,
        Some(GcId::Closure(c)) => c.0,
        Some(GcId::Userdata(u)) => u.0,
        Some(GcId::Thread(t)) => t.0,
        Some(GcId::String(s)) => s.0,
        Some(GcId::Upvalue(u)) => u.0,
        None => 0,
    }
}
