// String interner: every Lua string lives exactly once in the string
// pool, so value identity is content equality. The index maps the 5.1
// content hash to the pool ids carrying it; entries are weak — the sweep
// removes a string here when it frees the object.

use ahash::RandomState;
use std::collections::HashMap;

use crate::gc::gc_object::Gc;
use crate::gc::object_pool::Pool;
use crate::gc::{GC, StringId};
use crate::lua_value::{LuaStr, lua_str_hash};

pub struct StringInterner {
    /// Content hash -> interned ids with that hash.
    map: HashMap<u32, Vec<StringId>, RandomState>,
}

impl StringInterner {
    pub fn new() -> Self {
        Self {
            map: HashMap::with_capacity_and_hasher(256, RandomState::new()),
        }
    }

    /// Return the canonical id for `bytes`, creating it on first sight.
    /// A string found white is blackened so a mid-cycle re-intern cannot
    /// hand out an id the sweep is about to free.
    pub fn intern(
        &mut self,
        bytes: &[u8],
        strings: &mut Pool<LuaStr>,
        gc: &mut GC,
    ) -> StringId {
        let hash = lua_str_hash(bytes);
        let other_white = crate::gc::GcHeader::otherwhite(gc.current_white);

        if let Some(ids) = self.map.get(&hash) {
            for &id in ids {
                let obj = strings.get(id.0);
                if obj.header.is_dead(other_white) {
                    continue;
                }
                if obj.data.as_bytes() == bytes {
                    if obj.header.is_white() {
                        strings.get_mut(id.0).header.make_black();
                    }
                    return id;
                }
            }
        }

        let size = (std::mem::size_of::<Gc<LuaStr>>() + bytes.len()) as u32;
        let data = LuaStr::new(bytes.to_vec().into_boxed_slice());
        let id = StringId(strings.alloc(Gc::with_white(data, gc.current_white, size)));
        gc.note_alloc(size as usize);
        self.map.entry(hash).or_default().push(id);
        id
    }

    /// Drop a dead string from the index (called by the sweep).
    pub fn remove_dead(&mut self, id: StringId, hash: u32) {
        if let Some(ids) = self.map.get_mut(&hash) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                self.map.remove(&hash);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}
