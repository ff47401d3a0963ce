// Hybrid array + hash table, following the 5.1 ltable.c layout: a
// contiguous array part for integer keys 1..n and an open-addressed node
// array with chained collisions ("Brent-style" main positions) for
// everything else. Nil values are never stored; deleting leaves the key
// in place until the next rehash so iteration can continue past it.

use crate::gc::TableId;
use crate::lua_value::LuaValue;

/// 2^MAXBITS is the largest array part and the largest hash part.
const MAXBITS: u32 = 26;
const MAXASIZE: usize = 1 << MAXBITS;

/// A key slot error the VM turns into a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKeyError {
    NilKey,
    NanKey,
}

pub(crate) struct Node {
    pub(crate) key: LuaValue,
    pub(crate) val: LuaValue,
    /// Index of the next node in this chain, or -1.
    pub(crate) next: i32,
    /// Key belongs to a removed or weak-cleared entry: it still anchors
    /// the collision chain and `next` iteration, but is never traced.
    pub(crate) dead: bool,
}

impl Node {
    fn empty() -> Self {
        Node {
            key: LuaValue::nil(),
            val: LuaValue::nil(),
            next: -1,
            dead: false,
        }
    }

    #[inline(always)]
    fn is_free(&self) -> bool {
        self.key.is_nil() && !self.dead
    }
}

pub struct LuaTable {
    pub(crate) array: Vec<LuaValue>,
    pub(crate) nodes: Vec<Node>,
    /// Scan cursor for free node slots, counting down from nodes.len().
    lastfree: usize,
    metatable: Option<TableId>,
    /// Weak-mode flags, refreshed by the collector from __mode each cycle.
    pub(crate) weak_keys: bool,
    pub(crate) weak_values: bool,
}

/// Integer-valued number usable as an array index (1-based).
#[inline]
fn array_index(key: &LuaValue) -> Option<usize> {
    let n = key.as_number()?;
    let i = n as i64;
    if i as f64 == n && i >= 1 && (i as usize) <= MAXASIZE {
        Some(i as usize)
    } else {
        None
    }
}

#[inline]
fn hash_key(key: &LuaValue) -> u64 {
    let (tag, bits) = key.key_bits();
    let h = (bits ^ ((tag as u64) << 56)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^ (h >> 32)
}

#[inline]
fn ceil_log2(mut x: usize) -> u32 {
    debug_assert!(x >= 1);
    x -= 1;
    usize::BITS - x.leading_zeros()
}

impl LuaTable {
    pub fn new(narr: usize, nhash: usize) -> Self {
        let narr = narr.min(MAXASIZE);
        let nnode = if nhash == 0 {
            0
        } else {
            1usize << ceil_log2(nhash).min(MAXBITS)
        };
        let mut t = LuaTable {
            array: Vec::new(),
            nodes: Vec::new(),
            lastfree: 0,
            metatable: None,
            weak_keys: false,
            weak_values: false,
        };
        t.array.resize(narr, LuaValue::nil());
        t.set_node_size(nnode);
        t
    }

    fn set_node_size(&mut self, n: usize) {
        self.nodes.clear();
        self.nodes.reserve_exact(n);
        for _ in 0..n {
            self.nodes.push(Node::empty());
        }
        self.lastfree = n;
    }

    #[inline(always)]
    pub fn metatable(&self) -> Option<TableId> {
        self.metatable
    }

    #[inline(always)]
    pub fn set_metatable(&mut self, mt: Option<TableId>) {
        self.metatable = mt;
    }

    #[inline(always)]
    fn main_position(&self, key: &LuaValue) -> usize {
        debug_assert!(!self.nodes.is_empty());
        (hash_key(key) as usize) & (self.nodes.len() - 1)
    }

    // ============ Lookup ============

    /// Raw get; missing keys (and nil/NaN keys) read as nil.
    pub fn get(&self, key: &LuaValue) -> LuaValue {
        if key.is_nil() {
            return LuaValue::nil();
        }
        if let Some(i) = array_index(key) {
            return self.get_int(i as i64);
        }
        if let Some(n) = key.as_number() {
            if n.is_nan() {
                return LuaValue::nil();
            }
        }
        self.hash_get(key)
    }

    pub fn get_int(&self, i: i64) -> LuaValue {
        if i >= 1 && (i as usize) <= self.array.len() {
            return self.array[i as usize - 1];
        }
        self.hash_get(&LuaValue::number(i as f64))
    }

    fn hash_get(&self, key: &LuaValue) -> LuaValue {
        if self.nodes.is_empty() {
            return LuaValue::nil();
        }
        let mut pos = self.main_position(key) as i32;
        while pos >= 0 {
            let node = &self.nodes[pos as usize];
            if !node.dead && node.key.raw_equal(key) {
                return node.val;
            }
            pos = node.next;
        }
        LuaValue::nil()
    }

    // ============ Assignment ============

    /// Raw set; assigning nil deletes. Nil and NaN keys are rejected.
    pub fn set(&mut self, key: LuaValue, val: LuaValue) -> Result<(), TableKeyError> {
        if key.is_nil() {
            return Err(TableKeyError::NilKey);
        }
        if let Some(i) = array_index(&key) {
            self.set_int(i as i64, val);
            return Ok(());
        }
        if let Some(n) = key.as_number() {
            if n.is_nan() {
                return Err(TableKeyError::NanKey);
            }
            // Fold -0 into +0 so it shares a slot with integer zero.
            if n == 0.0 {
                return self.hash_set(LuaValue::number(0.0), val).map(|_| ());
            }
        }
        self.hash_set(key, val).map(|_| ())
    }

    pub fn set_int(&mut self, i: i64, val: LuaValue) {
        if i >= 1 && (i as usize) <= self.array.len() {
            self.array[i as usize - 1] = val;
            return;
        }
        // Appending right past the array part grows it without a rehash.
        if i >= 1 && (i as usize) == self.array.len() + 1 && !val.is_nil() {
            self.array.push(val);
            self.migrate_from_hash();
            return;
        }
        // Infallible: integer keys are neither nil nor NaN.
        let _ = self.hash_set(LuaValue::number(i as f64), val);
    }

    /// After the array part grows, pull any now-in-range keys out of the
    /// hash part.
    fn migrate_from_hash(&mut self) {
        loop {
            let next_key = LuaValue::number((self.array.len() + 1) as f64);
            let v = self.hash_get(&next_key);
            if v.is_nil() {
                break;
            }
            self.hash_delete(&next_key);
            self.array.push(v);
        }
    }

    fn hash_delete(&mut self, key: &LuaValue) {
        if self.nodes.is_empty() {
            return;
        }
        let mut pos = self.main_position(key) as i32;
        while pos >= 0 {
            let node = &mut self.nodes[pos as usize];
            if !node.dead && node.key.raw_equal(key) {
                node.val = LuaValue::nil();
                return;
            }
            pos = node.next;
        }
    }

    fn hash_set(&mut self, key: LuaValue, val: LuaValue) -> Result<(), TableKeyError> {
        if !self.nodes.is_empty() {
            let mut pos = self.main_position(&key) as i32;
            while pos >= 0 {
                let node = &mut self.nodes[pos as usize];
                if !node.dead && node.key.raw_equal(&key) {
                    node.val = val;
                    return Ok(());
                }
                pos = node.next;
            }
        }
        // Absent key: deleting a key that is not there is a no-op.
        if val.is_nil() {
            return Ok(());
        }
        self.new_key(key, val);
        Ok(())
    }

    fn free_pos(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if self.nodes[self.lastfree].is_free() {
                return Some(self.lastfree);
            }
        }
        None
    }

    /// Insert a key not currently present (ltable.c "newkey"): every
    /// node stays reachable from its main position; a collider sitting
    /// outside its own main position is evicted to a free slot.
    fn new_key(&mut self, key: LuaValue, val: LuaValue) {
        if self.nodes.is_empty() {
            // Grow first; the rebuilt table routes the key to whichever
            // part now covers it.
            self.rehash(&key);
            let _ = self.set(key, val);
            return;
        }
        let mp = self.main_position(&key);
        if !self.nodes[mp].is_free() {
            let Some(free) = self.free_pos() else {
                self.rehash(&key);
                let _ = self.set(key, val);
                return;
            };
            let colliding_main = self.main_position(&self.nodes[mp].key);
            if colliding_main != mp {
                // Collider is not in its own chain: move it (with its
                // next link) to the free slot and take its place.
                let mut prev = colliding_main;
                while self.nodes[prev].next != mp as i32 {
                    prev = self.nodes[prev].next as usize;
                }
                self.nodes[prev].next = free as i32;
                self.nodes.swap(free, mp);
                self.nodes[mp] = Node {
                    key,
                    val,
                    next: -1,
                    dead: false,
                };
            } else {
                // Shared main position: chain the new node in behind it.
                self.nodes[free] = Node {
                    key,
                    val,
                    next: self.nodes[mp].next,
                    dead: false,
                };
                self.nodes[mp].next = free as i32;
            }
        } else {
            let next = self.nodes[mp].next;
            self.nodes[mp] = Node {
                key,
                val,
                next,
                dead: false,
            };
        }
    }

    // ============ Rehash ============

    /// Rebuild both parts sized for the live entries plus `extra_key`.
    fn rehash(&mut self, extra_key: &LuaValue) {
        // nums[i] counts integer keys in (2^(i-1), 2^i].
        let mut nums = [0usize; (MAXBITS + 1) as usize];
        let mut total_int = 0usize;
        let mut total = 0usize;

        let mut count_key = |k: &LuaValue, nums: &mut [usize]| {
            total += 1;
            if let Some(i) = array_index(k) {
                nums[ceil_log2(i.max(1)).min(MAXBITS) as usize] += 1;
                total_int += 1;
            }
        };

        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                count_key(&LuaValue::number((i + 1) as f64), &mut nums);
            }
        }
        for node in &self.nodes {
            if !node.val.is_nil() && !node.dead {
                count_key(&node.key, &mut nums);
            }
        }
        count_key(extra_key, &mut nums);
        drop(count_key);

        // Optimal array size: largest power of two with more than half of
        // its slots occupied by integer keys (computesizes).
        let mut new_asize = 0usize;
        let mut accum = 0usize;
        let mut covered = 0usize;
        for (bits, &n) in nums.iter().enumerate() {
            accum += n;
            if bits == 0 {
                if n > 0 {
                    new_asize = 1;
                    covered = accum;
                }
            } else {
                let half = 1usize << (bits - 1);
                if accum > half {
                    new_asize = half * 2;
                    covered = accum;
                }
            }
            if accum == total_int {
                break;
            }
        }

        let nhash = total - covered;
        self.resize(new_asize, nhash);
    }

    /// Rebuild with the given array size and at least `nhash` hash slots.
    pub fn resize(&mut self, new_asize: usize, nhash: usize) {
        let new_asize = new_asize.min(MAXASIZE);
        let old_array = std::mem::take(&mut self.array);
        let old_nodes = std::mem::take(&mut self.nodes);

        self.array = vec![LuaValue::nil(); new_asize];
        let nnode = if nhash == 0 {
            0
        } else {
            1usize << ceil_log2(nhash).min(MAXBITS)
        };
        self.set_node_size(nnode);

        for (i, v) in old_array.into_iter().enumerate() {
            if !v.is_nil() {
                self.set_int((i + 1) as i64, v);
            }
        }
        for node in old_nodes {
            if !node.val.is_nil() && !node.dead {
                // Keys already validated on first insertion.
                let _ = self.set(node.key, node.val);
            }
        }
    }

    // ============ Length ============

    /// A border: n >= 0 with t[n] non-nil and t[n+1] nil.
    pub fn length(&self) -> i64 {
        let j = self.array.len();
        if j > 0 && self.array[j - 1].is_nil() {
            // Binary search inside the array part.
            let mut lo = 0usize; // t[lo] non-nil (or lo == 0)
            let mut hi = j; // t[hi] nil
            while hi - lo > 1 {
                let m = (lo + hi) / 2;
                if self.array[m - 1].is_nil() {
                    hi = m;
                } else {
                    lo = m;
                }
            }
            return lo as i64;
        }
        if self.nodes.is_empty() {
            return j as i64;
        }
        // Unbound search in the hash part.
        let mut i = j as i64;
        let mut hi = i + 1;
        while !self.get_int(hi).is_nil() {
            i = hi;
            if hi > i64::MAX / 2 {
                // Pathological table: fall back to a linear scan.
                let mut n = 1;
                while !self.get_int(n).is_nil() {
                    n += 1;
                }
                return n - 1;
            }
            hi *= 2;
        }
        while hi - i > 1 {
            let m = (i + hi) / 2;
            if self.get_int(m).is_nil() {
                hi = m;
            } else {
                i = m;
            }
        }
        i
    }

    // ============ Iteration ============

    /// Position of `key` in the traversal order: array part first, then
    /// nodes in storage order. Dead keys still match so iteration can
    /// continue from a removed entry.
    fn find_index(&self, key: &LuaValue) -> Option<usize> {
        if key.is_nil() {
            return Some(0);
        }
        if let Some(i) = array_index(key) {
            if i <= self.array.len() {
                return Some(i);
            }
        }
        if self.nodes.is_empty() {
            return None;
        }
        let mut pos = self.main_position(key) as i32;
        while pos >= 0 {
            let node = &self.nodes[pos as usize];
            let matches = if node.dead {
                key.iscollectable() && node.key.key_bits() == key.key_bits()
            } else {
                node.key.raw_equal(key)
            };
            if matches {
                return Some(self.array.len() + pos as usize + 1);
            }
            pos = node.next;
        }
        None
    }

    /// Generic iteration step. `None` key starts; returns the next pair
    /// or Ok(None) when exhausted; Err(()) for a key not in the table.
    pub fn next(&self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, ()> {
        let start = self.find_index(key).ok_or(())?;
        for i in start..self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((LuaValue::number((i + 1) as f64), self.array[i])));
            }
        }
        let node_start = start.saturating_sub(self.array.len());
        for i in node_start..self.nodes.len() {
            let node = &self.nodes[i];
            if !node.val.is_nil() {
                return Ok(Some((node.key, node.val)));
            }
        }
        Ok(None)
    }

    /// Live entry count (diagnostics and tests).
    pub fn entry_count(&self) -> usize {
        let mut n = self.array.iter().filter(|v| !v.is_nil()).count();
        n += self.nodes.iter().filter(|e| !e.val.is_nil()).count();
        n
    }

    #[inline(always)]
    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    #[inline(always)]
    pub fn node_len(&self) -> usize {
        self.nodes.len()
    }
}
