//! The table engine: a dense array part for the 1-based integer prefix, a
//! hash part for everything else, and a lazily-rebuilt snapshot that gives
//! `next` a stable traversal order.
//!
//! This layer enforces the raw key contract by panicking on nil/NaN keys;
//! the dispatch and API layers validate keys first and raise catchable
//! errors, so scripts can never reach those panics.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::closure::{LuaClosure, NativeClosure};
use crate::coroutine::Coroutine;
use crate::error::Signal;
use crate::value::{float_to_integer_exact, LuaValue, TableRef, UserData};

/// Normalized hash-part key.
///
/// Integral floats collapse into integer keys so `t[2]` and `t[2.0]` are the
/// same slot; other floats key by bit pattern (NaN is rejected before this
/// point).  Reference kinds hold their `Arc` so identity stays stable for as
/// long as the entry lives.
#[derive(Debug, Clone)]
pub enum TableKey {
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    Bool(bool),
    Table(TableRef),
    Closure(Arc<LuaClosure>),
    Native(Arc<NativeClosure>),
    UserData(Arc<UserData>),
    Thread(Arc<Coroutine>),
}

impl TableKey {
    /// Normalize a value into a key.  `None` for the two illegal keys:
    /// nil and NaN.
    pub fn from_value(v: &LuaValue) -> Option<TableKey> {
        match v {
            LuaValue::Nil => None,
            LuaValue::Boolean(b) => Some(TableKey::Bool(*b)),
            LuaValue::Integer(n) => Some(TableKey::Int(*n)),
            LuaValue::Float(f) => {
                if f.is_nan() {
                    return None;
                }
                match float_to_integer_exact(*f) {
                    Some(n) => Some(TableKey::Int(n)),
                    None => Some(TableKey::Float(f.to_bits())),
                }
            }
            LuaValue::Str(s) => Some(TableKey::Str(s.clone())),
            LuaValue::Table(t) => Some(TableKey::Table(t.clone())),
            LuaValue::Closure(c) => Some(TableKey::Closure(c.clone())),
            LuaValue::Native(n) => Some(TableKey::Native(n.clone())),
            LuaValue::UserData(u) => Some(TableKey::UserData(u.clone())),
            LuaValue::Thread(t) => Some(TableKey::Thread(t.clone())),
        }
    }

    pub fn to_value(&self) -> LuaValue {
        match self {
            TableKey::Int(n) => LuaValue::Integer(*n),
            TableKey::Float(bits) => LuaValue::Float(f64::from_bits(*bits)),
            TableKey::Str(s) => LuaValue::Str(s.clone()),
            TableKey::Bool(b) => LuaValue::Boolean(*b),
            TableKey::Table(t) => LuaValue::Table(t.clone()),
            TableKey::Closure(c) => LuaValue::Closure(c.clone()),
            TableKey::Native(n) => LuaValue::Native(n.clone()),
            TableKey::UserData(u) => LuaValue::UserData(u.clone()),
            TableKey::Thread(t) => LuaValue::Thread(t.clone()),
        }
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TableKey::Int(a), TableKey::Int(b)) => a == b,
            (TableKey::Float(a), TableKey::Float(b)) => a == b,
            (TableKey::Str(a), TableKey::Str(b)) => a == b,
            (TableKey::Bool(a), TableKey::Bool(b)) => a == b,
            (TableKey::Table(a), TableKey::Table(b)) => Arc::ptr_eq(a, b),
            (TableKey::Closure(a), TableKey::Closure(b)) => Arc::ptr_eq(a, b),
            (TableKey::Native(a), TableKey::Native(b)) => Arc::ptr_eq(a, b),
            (TableKey::UserData(a), TableKey::UserData(b)) => Arc::ptr_eq(a, b),
            (TableKey::Thread(a), TableKey::Thread(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            TableKey::Int(n) => n.hash(state),
            TableKey::Float(bits) => bits.hash(state),
            TableKey::Str(s) => s.hash(state),
            TableKey::Bool(b) => b.hash(state),
            TableKey::Table(t) => (Arc::as_ptr(t) as usize).hash(state),
            TableKey::Closure(c) => (Arc::as_ptr(c) as usize).hash(state),
            TableKey::Native(n) => (Arc::as_ptr(n) as usize).hash(state),
            TableKey::UserData(u) => (Arc::as_ptr(u) as usize).hash(state),
            TableKey::Thread(t) => (Arc::as_ptr(t) as usize).hash(state),
        }
    }
}

/// A Lua table: array part + hash part + optional metatable.
#[derive(Debug)]
pub struct LuaTable {
    array: Vec<LuaValue>,
    hash: HashMap<TableKey, LuaValue>,
    pub metatable: Option<TableRef>,
    /// Frozen key order for `next`; key set changes mark it dirty and the
    /// next fresh traversal rebuilds it.
    snapshot: Vec<TableKey>,
    snapshot_pos: HashMap<TableKey, usize>,
    dirty: bool,
}

impl LuaTable {
    pub fn new() -> Self {
        Self::with_capacity(0, 0)
    }

    pub fn with_capacity(narr: usize, nhash: usize) -> Self {
        LuaTable {
            array: Vec::with_capacity(narr),
            hash: HashMap::with_capacity(nhash),
            metatable: None,
            snapshot: Vec::new(),
            snapshot_pos: HashMap::new(),
            dirty: true,
        }
    }

    /// Raw read.  Panics on nil/NaN keys — callers validate first.
    pub fn get(&self, key: &LuaValue) -> LuaValue {
        let key = Self::require_key(key);
        if let TableKey::Int(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                return self.array[i as usize - 1].clone();
            }
        }
        self.hash.get(&key).cloned().unwrap_or(LuaValue::Nil)
    }

    /// Raw write.  Panics on nil/NaN keys — callers validate first.
    pub fn put(&mut self, key: LuaValue, value: LuaValue) {
        let key = Self::require_key(&key);
        if let TableKey::Int(i) = key {
            let len = self.array.len() as i64;
            if i >= 1 && i <= len {
                let was_last = i == len;
                let removes = value.is_nil();
                self.array[i as usize - 1] = value;
                if removes {
                    self.dirty = true;
                    if was_last {
                        self.trim_trailing_nils();
                    }
                }
                return;
            }
            if i == len + 1 {
                if value.is_nil() {
                    return;
                }
                self.array.push(value);
                self.rehash_sequence();
                self.dirty = true;
                return;
            }
        }
        if value.is_nil() {
            if self.hash.remove(&key).is_some() {
                self.dirty = true;
            }
        } else if self.hash.insert(key, value).is_none() {
            self.dirty = true;
        }
    }

    fn require_key(key: &LuaValue) -> TableKey {
        match TableKey::from_value(key) {
            Some(k) => k,
            None if key.is_nil() => panic!("table index is nil"),
            None => panic!("table index is NaN"),
        }
    }

    /// Pull contiguous successors (`len+1`, `len+2`, …) out of the hash part
    /// after an append extended the array.
    fn rehash_sequence(&mut self) {
        loop {
            let next_key = TableKey::Int(self.array.len() as i64 + 1);
            match self.hash.remove(&next_key) {
                Some(v) => self.array.push(v),
                None => break,
            }
        }
    }

    fn trim_trailing_nils(&mut self) {
        while matches!(self.array.last(), Some(LuaValue::Nil)) {
            self.array.pop();
        }
    }

    /// Length of the sequence part.
    ///
    /// This is deliberately the array-part size, not a general border
    /// search: interior nils created by writing nil below the length keep
    /// the reported length unchanged.  Matches the loose border contract of
    /// the reference implementation.
    pub fn len(&self) -> i64 {
        self.array.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.is_empty()
    }

    pub fn set_metatable(&mut self, mt: Option<TableRef>) {
        self.metatable = mt;
    }

    /// Raw metatable field lookup, nil filtered out.
    pub fn meta_field(&self, name: &str) -> Option<LuaValue> {
        let mt = self.metatable.as_ref()?;
        let v = crate::lock_read(mt).get(&LuaValue::Str(name.into()));
        if v.is_nil() {
            None
        } else {
            Some(v)
        }
    }

    /// Pre-check used by the dispatch layer before consulting
    /// `__index`/`__newindex`.
    pub fn has_meta_field(&self, name: &str) -> bool {
        self.meta_field(name).is_some()
    }

    // ── Traversal ───────────────────────────────────────────────────────────

    /// Step to the key/value pair after `key` in the snapshot order.
    ///
    /// `next(nil)` starts a traversal, rebuilding the snapshot if the key
    /// set changed since the last build.  `Ok(None)` signals end of
    /// iteration.  A non-nil key that is not in the snapshot is an error.
    /// The snapshot itself is never restructured mid-traversal; callers
    /// must not add keys while iterating (removing the current key is fine,
    /// removed keys are skipped).
    pub fn next(&mut self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, Signal> {
        let start = if key.is_nil() {
            if self.dirty {
                self.rebuild_snapshot();
            }
            0
        } else {
            let k = TableKey::from_value(key)
                .ok_or_else(|| Signal::error_str("invalid key to 'next'"))?;
            match self.snapshot_pos.get(&k) {
                Some(pos) => pos + 1,
                None => return Err(Signal::error_str("invalid key to 'next'")),
            }
        };
        for k in &self.snapshot[start.min(self.snapshot.len())..] {
            let v = self.live_value(k);
            if !v.is_nil() {
                return Ok(Some((k.to_value(), v)));
            }
        }
        Ok(None)
    }

    fn live_value(&self, key: &TableKey) -> LuaValue {
        if let TableKey::Int(i) = key {
            if *i >= 1 && (*i as usize) <= self.array.len() {
                return self.array[*i as usize - 1].clone();
            }
        }
        self.hash.get(key).cloned().unwrap_or(LuaValue::Nil)
    }

    fn rebuild_snapshot(&mut self) {
        self.snapshot.clear();
        self.snapshot_pos.clear();
        for i in 1..=self.array.len() {
            self.snapshot.push(TableKey::Int(i as i64));
        }
        for k in self.hash.keys() {
            self.snapshot.push(k.clone());
        }
        for (pos, k) in self.snapshot.iter().enumerate() {
            self.snapshot_pos.insert(k.clone(), pos);
        }
        self.dirty = false;
    }
}

impl Default for LuaTable {
    fn default() -> Self {
        Self::new()
    }
}
