// Incremental tri-color mark-and-sweep collector.
//
// The cycle is a small state machine advanced by step():
//   Pause -> Propagate -> (atomic) -> Sweep -> Finalize -> Pause
//
// - Pause: idle until allocation passes the threshold.
// - Propagate: pop gray objects, mark their children, blacken them;
//   yields when the work budget runs out.
// - atomic (non-yielding, inside the transition): re-mark roots, drain
//   the "gray again" list fed by write barriers, clear weak-table
//   entries with unreachable components, separate and resurrect
//   unreachable finalizable objects, flip the white.
// - Sweep: walk the pools slot by slot; free objects carrying the old
//   white, repaint survivors with the new white.
// - Finalize: hand one pending __gc victim per step back to the VM.
//
// Tri-color invariant while marking: black objects never reference
// white ones. Tables restore it with a backward barrier (re-gray the
// table), everything else with a forward barrier (gray the child).

mod gc_id;
mod gc_object;
mod object_pool;
mod string_interner;

pub use gc_id::*;
pub use gc_object::{Gc, GcHeader};
pub use object_pool::{ObjectPool, Pool, ThreadPool, ThreadPoolExt};
pub use string_interner::StringInterner;

use crate::lua_value::LuaValue;

/// Default GC parameters (luaconf.h): both 200%.
const DEFAULT_PAUSE: i32 = 200;
const DEFAULT_STEPMUL: i32 = 200;

/// Threshold before the first cycle ever runs.
const INITIAL_THRESHOLD: usize = 64 * 1024;

/// Base work units granted per step, scaled by stepmul.
const STEP_WORK: usize = 256;

/// Slots swept per work unit.
const SWEEP_COST: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Pause,
    Propagate,
    Sweep,
    Finalize,
}

/// Mutable view of everything the collector traverses. The VM
/// destructures itself into this so the borrows stay disjoint.
pub struct GcHeap<'a> {
    pub pool: &'a mut ObjectPool,
    pub threads: &'a mut ThreadPool,
    pub interner: &'a mut StringInterner,
    pub globals: LuaValue,
    pub registry: LuaValue,
}

pub struct GC {
    pub state: GcState,
    pub current_white: u8,
    /// Collector enabled (collectgarbage "stop"/"restart").
    pub running: bool,

    total_bytes: usize,
    threshold: usize,
    estimate: usize,
    pause: i32,
    stepmul: i32,

    gray: Vec<GcId>,
    grayagain: Vec<GcId>,
    in_atomic: bool,

    /// Weak tables met during this cycle's marking.
    weak_tables: Vec<TableId>,
    /// Objects whose metatable carries __gc and whose finalizer has not
    /// been scheduled yet.
    finalizable: Vec<GcId>,
    /// Resurrected objects waiting for their finalizer to run.
    tobefnz: Vec<GcId>,

    /// Sweep cursor: pool ordinal and slot index.
    sweep_pool: u8,
    sweep_index: usize,

    /// Interned "__mode" key, set once by the VM.
    mode_key: Option<StringId>,

    pub cycle_count: usize,
}

impl GC {
    pub fn new() -> Self {
        Self {
            state: GcState::Pause,
            current_white: 0,
            running: true,
            total_bytes: 0,
            threshold: INITIAL_THRESHOLD,
            estimate: 0,
            pause: DEFAULT_PAUSE,
            stepmul: DEFAULT_STEPMUL,
            gray: Vec::with_capacity(64),
            grayagain: Vec::with_capacity(16),
            in_atomic: false,
            weak_tables: Vec::new(),
            finalizable: Vec::new(),
            tobefnz: Vec::new(),
            sweep_pool: 0,
            sweep_index: 0,
            mode_key: None,
            cycle_count: 0,
        }
    }

    pub fn set_mode_key(&mut self, id: StringId) {
        self.mode_key = Some(id);
    }

    // ============ Accounting ============

    #[inline(always)]
    pub fn note_alloc(&mut self, size: usize) {
        self.total_bytes += size;
    }

    #[inline(always)]
    pub fn note_free(&mut self, size: usize) {
        self.total_bytes = self.total_bytes.saturating_sub(size);
    }

    #[inline(always)]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Time for a step? Either a cycle is in flight or the threshold has
    /// been crossed.
    #[inline(always)]
    pub fn should_step(&self) -> bool {
        self.running
            && (self.state != GcState::Pause || self.total_bytes > self.threshold)
    }

    pub fn set_pause(&mut self, pause: i32) -> i32 {
        std::mem::replace(&mut self.pause, pause)
    }

    pub fn set_stepmul(&mut self, stepmul: i32) -> i32 {
        std::mem::replace(&mut self.stepmul, stepmul)
    }

    /// Register an object whose metatable gained a __gc field.
    pub fn register_finalizable(&mut self, id: GcId) {
        if !self.finalizable.contains(&id) {
            self.finalizable.push(id);
        }
    }

    // ============ Write barriers ============

    /// Backward barrier: a black table was mutated; re-gray it so the
    /// atomic step rescans it. Cheap for bulk stores.
    pub fn barrier_back(&mut self, id: TableId, pool: &mut ObjectPool) {
        if self.state != GcState::Propagate {
            return;
        }
        let header = &mut pool.tables.get_mut(id.0).header;
        if header.is_black() {
            header.make_gray();
            self.grayagain.push(GcId::Table(id));
        }
    }

    /// Forward barrier: a black non-table object now references `child`;
    /// mark the child immediately.
    pub fn barrier_forward(&mut self, parent_black: bool, child: LuaValue, heap: &mut GcHeap) {
        if self.state != GcState::Propagate || !parent_black {
            return;
        }
        self.mark_value(child, heap);
    }

    // ============ Stepping ============

    /// Advance the collection; returns objects whose finalizer the VM
    /// must now run. `unbounded` drives a forced full collection.
    pub fn step(&mut self, heap: &mut GcHeap, unbounded: bool) -> Vec<GcId> {
        let mut budget = if unbounded {
            usize::MAX
        } else {
            let w = (STEP_WORK as i64 * self.stepmul as i64 / 100) as i64;
            if w <= 0 {
                // stepmul 0 disables progress entirely.
                return Vec::new();
            }
            w as usize
        };

        let mut due = Vec::new();
        loop {
            match self.state {
                GcState::Pause => {
                    self.start_cycle(heap);
                    self.state = GcState::Propagate;
                }
                GcState::Propagate => {
                    while budget > 0 && !self.gray.is_empty() {
                        budget = budget.saturating_sub(self.propagate_one(heap));
                    }
                    if self.gray.is_empty() {
                        self.atomic(heap);
                        self.state = GcState::Sweep;
                        continue;
                    }
                    return due;
                }
                GcState::Sweep => {
                    let done = self.sweep_some(heap, &mut budget);
                    if done {
                        self.state = GcState::Finalize;
                        continue;
                    }
                    return due;
                }
                GcState::Finalize => {
                    if let Some(id) = self.tobefnz.pop() {
                        due.push(id);
                        if !unbounded {
                            return due;
                        }
                    } else {
                        self.finish_cycle();
                        return due;
                    }
                }
            }
            if budget == 0 && !unbounded {
                return due;
            }
        }
    }

    fn start_cycle(&mut self, heap: &mut GcHeap) {
        self.gray.clear();
        self.grayagain.clear();
        self.weak_tables.clear();
        self.mark_roots(heap);
    }

    fn finish_cycle(&mut self) {
        self.cycle_count += 1;
        self.estimate = self.total_bytes;
        let pause = self.pause.max(0) as usize;
        self.threshold = self.estimate / 100 * pause.max(100);
        self.state = GcState::Pause;
    }

    fn mark_roots(&mut self, heap: &mut GcHeap) {
        let globals = heap.globals;
        let registry = heap.registry;
        self.mark_value(globals, heap);
        self.mark_value(registry, heap);
        self.mark_object(GcId::Thread(ThreadId::MAIN), heap);
        let pending: Vec<GcId> = self.tobefnz.clone();
        for id in pending {
            self.mark_object(id, heap);
        }
    }

    // ============ Marking ============

    #[inline]
    fn mark_value(&mut self, v: LuaValue, heap: &mut GcHeap) {
        if let Some(id) = v.gc_id() {
            self.mark_object(id, heap);
        }
    }

    fn mark_object(&mut self, id: GcId, heap: &mut GcHeap) {
        match id {
            GcId::String(s) => {
                if let Some(obj) = heap.pool.strings.try_get_mut(s.0) {
                    if obj.header.is_white() {
                        obj.header.make_black();
                    }
                }
            }
            GcId::Thread(t) => {
                if let Some(obj) = heap.threads.try_get_mut(t.0) {
                    if obj.header.is_white() {
                        obj.header.make_gray();
                        self.gray.push(id);
                    }
                }
            }
            GcId::Table(t) => {
                if let Some(obj) = heap.pool.tables.try_get_mut(t.0) {
                    if obj.header.is_white() {
                        obj.header.make_gray();
                        self.gray.push(id);
                    }
                }
            }
            GcId::Closure(c) => {
                if let Some(obj) = heap.pool.closures.try_get_mut(c.0) {
                    if obj.header.is_white() {
                        obj.header.make_gray();
                        self.gray.push(id);
                    }
                }
            }
            GcId::Upvalue(u) => {
                if let Some(obj) = heap.pool.upvalues.try_get_mut(u.0) {
                    if obj.header.is_white() {
                        obj.header.make_gray();
                        self.gray.push(id);
                    }
                }
            }
            GcId::Userdata(u) => {
                if let Some(obj) = heap.pool.userdata.try_get_mut(u.0) {
                    if obj.header.is_white() {
                        obj.header.make_gray();
                        self.gray.push(id);
                    }
                }
            }
        }
    }

    /// Pop and traverse one gray object; returns work done.
    fn propagate_one(&mut self, heap: &mut GcHeap) -> usize {
        let Some(id) = self.gray.pop() else {
            return 1;
        };
        let work = match id {
            GcId::Table(t) => self.traverse_table(t, heap),
            GcId::Closure(c) => self.traverse_closure(c, heap),
            GcId::Upvalue(u) => self.traverse_upvalue(u, heap),
            GcId::Userdata(u) => self.traverse_userdata(u, heap),
            GcId::Thread(t) => self.traverse_thread(t, heap),
            GcId::String(_) => 1,
        };
        match id {
            GcId::Table(t) => heap.pool.tables.get_mut(t.0).header.make_black(),
            GcId::Closure(c) => heap.pool.closures.get_mut(c.0).header.make_black(),
            GcId::Upvalue(u) => heap.pool.upvalues.get_mut(u.0).header.make_black(),
            GcId::Userdata(u) => heap.pool.userdata.get_mut(u.0).header.make_black(),
            GcId::Thread(t) => {
                heap.threads.get_mut(t.0).header.make_black();
                // Thread stacks have no write barrier; rescan in atomic.
                if !self.in_atomic {
                    self.grayagain.push(id);
                }
            }
            GcId::String(_) => {}
        }
        work
    }

    fn traverse_table(&mut self, id: TableId, heap: &mut GcHeap) -> usize {
        let mt = heap.pool.table(id).metatable();
        let mut weak_keys = false;
        let mut weak_values = false;
        if let Some(mt) = mt {
            self.mark_object(GcId::Table(mt), heap);
            if let Some(mode) = self.mode_key {
                let mode_v = heap.pool.table(mt).get(&LuaValue::string(mode));
                if mode_v.is_string() {
                    let bytes = heap.pool.string(mode_v.tsvalue()).as_bytes();
                    weak_keys = bytes.contains(&b'k');
                    weak_values = bytes.contains(&b'v');
                }
            }
        }
        {
            let t = heap.pool.table_mut(id);
            t.weak_keys = weak_keys;
            t.weak_values = weak_values;
        }
        if weak_keys || weak_values {
            self.weak_tables.push(id);
            if weak_keys && weak_values {
                return 1;
            }
        }

        let alen = heap.pool.table(id).array_len();
        if !weak_values {
            for i in 0..alen {
                let v = heap.pool.tables.get(id.0).data.array[i];
                if !v.is_nil() {
                    self.mark_value(v, heap);
                }
            }
        }
        let nlen = heap.pool.table(id).node_len();
        for i in 0..nlen {
            let (key, val, dead) = {
                let n = &heap.pool.tables.get(id.0).data.nodes[i];
                (n.key, n.val, n.dead)
            };
            if dead {
                continue;
            }
            if val.is_nil() {
                // Cleared entry: the key only anchors iteration now.
                if key.iscollectable() {
                    heap.pool.tables.get_mut(id.0).data.nodes[i].dead = true;
                }
                continue;
            }
            if !weak_keys {
                self.mark_value(key, heap);
            }
            if !weak_values {
                self.mark_value(val, heap);
            }
        }
        1 + alen / 4 + nlen / 4
    }

    fn traverse_closure(&mut self, id: ClosureId, heap: &mut GcHeap) -> usize {
        use crate::lua_value::Closure;
        enum Parts {
            Lua(TableId, std::rc::Rc<crate::lua_value::Proto>, Vec<UpvalueId>),
            Native(TableId, Vec<LuaValue>),
        }
        // Copy the reference set out first; marking mutates the pool.
        let parts = match &heap.pool.closures.get(id.0).data {
            Closure::Lua(c) => Parts::Lua(c.env, c.proto.clone(), c.upvalues.clone()),
            Closure::Native(c) => Parts::Native(c.env, c.upvalues.clone()),
        };
        match parts {
            Parts::Lua(env, proto, upvals) => {
                self.mark_object(GcId::Table(env), heap);
                for uv in upvals {
                    self.mark_object(GcId::Upvalue(uv), heap);
                }
                self.mark_proto(&proto, heap);
                1 + proto.constants.len() / 8
            }
            Parts::Native(env, upvals) => {
                self.mark_object(GcId::Table(env), heap);
                for v in upvals {
                    self.mark_value(v, heap);
                }
                1
            }
        }
    }

    /// Prototypes are shared Rc data, not pool objects; their interned
    /// constant strings are kept alive through the closures using them.
    fn mark_proto(&mut self, proto: &crate::lua_value::Proto, heap: &mut GcHeap) {
        for k in &proto.constants {
            self.mark_value(*k, heap);
        }
        for p in &proto.protos {
            self.mark_proto(p, heap);
        }
    }

    fn traverse_upvalue(&mut self, id: UpvalueId, heap: &mut GcHeap) -> usize {
        use crate::lua_vm::Upvalue;
        enum Cell {
            Closed(LuaValue),
            Open(ThreadId),
        }
        let cell = match heap.pool.upvalue(id) {
            Upvalue::Closed(v) => Cell::Closed(*v),
            // The slot lives on the owner's stack; keep the owner (and
            // with it the slot) alive.
            Upvalue::Open { thread, .. } => Cell::Open(*thread),
        };
        match cell {
            Cell::Closed(v) => self.mark_value(v, heap),
            Cell::Open(t) => self.mark_object(GcId::Thread(t), heap),
        }
        1
    }

    fn traverse_userdata(&mut self, id: UserdataId, heap: &mut GcHeap) -> usize {
        let mt = heap.pool.userdata(id).metatable();
        if let Some(mt) = mt {
            self.mark_object(GcId::Table(mt), heap);
        }
        1
    }

    fn traverse_thread(&mut self, id: ThreadId, heap: &mut GcHeap) -> usize {
        let top = heap.threads.thread(id).top;
        for i in 0..top {
            let v = heap.threads.get(id.0).data.stack[i];
            self.mark_value(v, heap);
        }
        let nframes = heap.threads.thread(id).frames.len();
        for i in 0..nframes {
            let f = heap.threads.get(id.0).data.frames[i].func;
            self.mark_value(f, heap);
        }
        let (entry, errv, errf) = {
            let th = heap.threads.thread(id);
            (th.entry, th.error_value, th.errfunc)
        };
        self.mark_value(entry, heap);
        self.mark_value(errv, heap);
        if let Some(h) = errf {
            self.mark_value(h, heap);
        }
        let ntransfer = heap.threads.thread(id).transfer.len();
        for i in 0..ntransfer {
            let v = heap.threads.get(id.0).data.transfer[i];
            self.mark_value(v, heap);
        }
        let open = heap.threads.thread(id).open_upvalues.clone();
        for uv in open {
            self.mark_object(GcId::Upvalue(uv), heap);
        }
        1 + top / 4
    }

    // ============ Atomic ============

    fn atomic(&mut self, heap: &mut GcHeap) {
        self.in_atomic = true;

        // Roots may have moved since the cycle started.
        self.mark_roots(heap);
        while !self.gray.is_empty() {
            self.propagate_one(heap);
        }

        // Objects re-grayed by barriers, plus thread stacks.
        let again = std::mem::take(&mut self.grayagain);
        for id in again {
            self.gray.push(id);
        }
        while !self.gray.is_empty() {
            self.propagate_one(heap);
        }

        // Separate unreachable finalizable objects and resurrect them.
        let candidates: Vec<GcId> = self.finalizable.clone();
        for id in candidates {
            let (white, finalized) = match heap.pool.header(id) {
                Some(h) => (h.is_white(), h.is_finalized()),
                None => continue,
            };
            if white && !finalized {
                match id {
                    GcId::Table(t) => heap.pool.tables.get_mut(t.0).header.set_finalized(),
                    GcId::Userdata(u) => heap.pool.userdata.get_mut(u.0).header.set_finalized(),
                    _ => continue,
                }
                self.tobefnz.push(id);
                self.mark_object(id, heap);
                while !self.gray.is_empty() {
                    self.propagate_one(heap);
                }
            }
        }

        // Clear weak-table entries whose weak component died this cycle.
        let weak = std::mem::take(&mut self.weak_tables);
        for id in weak {
            self.clear_weak_table(id, heap);
        }

        self.current_white = GcHeader::otherwhite(self.current_white);
        self.sweep_pool = 0;
        self.sweep_index = 0;
        self.in_atomic = false;
    }

    /// Is this weak-slot value about to be collected? Strings behave as
    /// plain values and are never cleared from weak tables.
    fn is_cleared(&mut self, v: LuaValue, heap: &mut GcHeap) -> bool {
        let Some(id) = v.gc_id() else {
            return false;
        };
        if let GcId::String(_) = id {
            self.mark_object(id, heap);
            return false;
        }
        match id {
            GcId::Thread(t) => heap
                .threads
                .try_get(t.0)
                .is_none_or(|o| o.header.is_white()),
            _ => heap.pool.header(id).is_none_or(|h| h.is_white()),
        }
    }

    fn clear_weak_table(&mut self, id: TableId, heap: &mut GcHeap) {
        let (weak_keys, weak_values) = {
            let t = heap.pool.table(id);
            (t.weak_keys, t.weak_values)
        };
        let alen = heap.pool.table(id).array_len();
        if weak_values {
            for i in 0..alen {
                let v = heap.pool.tables.get(id.0).data.array[i];
                if !v.is_nil() && self.is_cleared(v, heap) {
                    heap.pool.tables.get_mut(id.0).data.array[i] = LuaValue::nil();
                }
            }
        }
        let nlen = heap.pool.table(id).node_len();
        for i in 0..nlen {
            let (key, val, dead) = {
                let n = &heap.pool.tables.get(id.0).data.nodes[i];
                (n.key, n.val, n.dead)
            };
            if dead || val.is_nil() {
                continue;
            }
            let drop_entry = (weak_keys && self.is_cleared(key, heap))
                || (weak_values && self.is_cleared(val, heap));
            if drop_entry {
                let node = &mut heap.pool.tables.get_mut(id.0).data.nodes[i];
                node.val = LuaValue::nil();
                if node.key.iscollectable() {
                    node.dead = true;
                }
            }
        }
    }

    // ============ Sweep ============

    /// Sweep up to `budget` slots; true when every pool has been walked.
    fn sweep_some(&mut self, heap: &mut GcHeap, budget: &mut usize) -> bool {
        let other = GcHeader::otherwhite(self.current_white);
        let white = self.current_white;

        // Check one slot: survivors are repainted in place; the dead are
        // reported back so the pool borrow is released before freeing.
        fn check<T>(pool: &mut Pool<T>, i: usize, other: u8, white: u8) -> bool {
            match pool.slot_mut(i) {
                Some(obj) => {
                    if obj.header.is_dead(other) && !obj.header.is_fixed() {
                        true
                    } else {
                        obj.header.make_white(white);
                        false
                    }
                }
                None => false,
            }
        }

        while *budget > 0 {
            *budget = budget.saturating_sub(SWEEP_COST);
            let i = self.sweep_index;
            match self.sweep_pool {
                0 => {
                    if i >= heap.pool.strings.slot_count() {
                        self.sweep_pool = 1;
                        self.sweep_index = 0;
                        continue;
                    }
                    self.sweep_index += 1;
                    if check(&mut heap.pool.strings, i, other, white) {
                        let hash = heap.pool.strings.get(i as u32).data.hash();
                        let freed = heap.pool.strings.free(i as u32);
                        heap.interner.remove_dead(StringId(i as u32), hash);
                        self.note_free(freed);
                    }
                }
                1 => {
                    if i >= heap.pool.tables.slot_count() {
                        self.sweep_pool = 2;
                        self.sweep_index = 0;
                        continue;
                    }
                    self.sweep_index += 1;
                    if check(&mut heap.pool.tables, i, other, white) {
                        let freed = heap.pool.tables.free(i as u32);
                        self.forget(GcId::Table(TableId(i as u32)));
                        self.note_free(freed);
                    }
                }
                2 => {
                    if i >= heap.pool.closures.slot_count() {
                        self.sweep_pool = 3;
                        self.sweep_index = 0;
                        continue;
                    }
                    self.sweep_index += 1;
                    if check(&mut heap.pool.closures, i, other, white) {
                        let freed = heap.pool.closures.free(i as u32);
                        self.note_free(freed);
                    }
                }
                3 => {
                    if i >= heap.pool.upvalues.slot_count() {
                        self.sweep_pool = 4;
                        self.sweep_index = 0;
                        continue;
                    }
                    self.sweep_index += 1;
                    if check(&mut heap.pool.upvalues, i, other, white) {
                        let freed = heap.pool.upvalues.free(i as u32);
                        self.note_free(freed);
                    }
                }
                4 => {
                    if i >= heap.pool.userdata.slot_count() {
                        self.sweep_pool = 5;
                        self.sweep_index = 0;
                        continue;
                    }
                    self.sweep_index += 1;
                    if check(&mut heap.pool.userdata, i, other, white) {
                        let freed = heap.pool.userdata.free(i as u32);
                        self.forget(GcId::Userdata(UserdataId(i as u32)));
                        self.note_free(freed);
                    }
                }
                _ => {
                    if i >= heap.threads.slot_count() {
                        return true;
                    }
                    self.sweep_index += 1;
                    if i == ThreadId::MAIN.0 as usize {
                        if let Some(obj) = heap.threads.slot_mut(i) {
                            obj.header.make_white(white);
                        }
                        continue;
                    }
                    if check(heap.threads, i, other, white) {
                        let freed = heap.threads.free(i as u32);
                        self.note_free(freed);
                    }
                }
            }
        }
        false
    }

    /// Drop bookkeeping for a freed id so a reused slot is not mistaken
    /// for the old object.
    fn forget(&mut self, id: GcId) {
        self.finalizable.retain(|&x| x != id);
    }
}

impl Default for GC {
    fn default() -> Self {
        Self::new()
    }
}
