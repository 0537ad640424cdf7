//! The stack-based host API.
//!
//! Natives and embedding hosts manipulate a [`LuaState`] through indexed
//! slots: positive indices count from the current frame's first argument,
//! negative indices count back from the top, and pseudo-indices address
//! things that are not on the stack at all (the registry, the running
//! native's captured upvalues).  Every native is guaranteed a handful of
//! free slots beyond its arguments before it has to ask for more.

use std::sync::{Arc, RwLock};

use crate::closure::{NativeClosure, NativeFn};
use crate::coroutine::Coroutine;
use crate::dispatch::valid_key;
use crate::error::{Signal, Status};
use crate::frame::MULTRET;
use crate::global::PanicFn;
use crate::state::LuaState;
use crate::table::LuaTable;
use crate::value::{LuaType, LuaValue, TableRef, UserData};

/// Pseudo-index of the registry table.
pub const REGISTRY_INDEX: i32 = -10_000;

/// Pseudo-index of the running native's `i`-th captured upvalue (1-based).
pub fn upvalue_index(i: usize) -> i32 {
    REGISTRY_INDEX - i as i32
}

impl LuaState {
    // ── Index resolution ────────────────────────────────────────────────────

    /// Convert a relative index into an absolute one that stays valid as the
    /// stack grows.  Pseudo-indices and already-positive indices pass
    /// through.
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            self.top() as i32 + idx + 1
        }
    }

    fn slot_of(&self, idx: i32) -> Option<usize> {
        let base = self.base();
        let top = self.stack.top();
        if idx > 0 {
            let abs = base + (idx as usize - 1);
            (abs < top).then_some(abs)
        } else if idx < 0 && idx > REGISTRY_INDEX {
            let n = (-idx) as usize;
            (n <= top.saturating_sub(base)).then(|| top - n)
        } else {
            None
        }
    }

    fn current_native(&self) -> Option<Arc<NativeClosure>> {
        let ci = self.frames.current()?;
        if ci.is_script() {
            return None;
        }
        match self.stack.get(ci.func) {
            LuaValue::Native(n) => Some(n),
            _ => None,
        }
    }

    /// The value at `idx`; nil for an index that addresses nothing.
    pub fn value(&self, idx: i32) -> LuaValue {
        if idx == REGISTRY_INDEX {
            return LuaValue::Table(self.g.registry.clone());
        }
        if idx < REGISTRY_INDEX {
            let n = (REGISTRY_INDEX - idx) as usize;
            return match self.current_native() {
                Some(nc) => nc.upvalue(n),
                None => LuaValue::Nil,
            };
        }
        match self.slot_of(idx) {
            Some(abs) => self.stack.get(abs),
            None => LuaValue::Nil,
        }
    }

    fn put_at(&mut self, idx: i32, v: LuaValue) -> Result<(), Signal> {
        if idx == REGISTRY_INDEX {
            return Err(self.raise("the registry slot cannot be replaced"));
        }
        if idx < REGISTRY_INDEX {
            let n = (REGISTRY_INDEX - idx) as usize;
            if let Some(nc) = self.current_native() {
                if nc.set_upvalue(n, v) {
                    return Ok(());
                }
            }
            return Err(self.raise("no such upvalue"));
        }
        match self.slot_of(idx) {
            Some(abs) => {
                self.stack.set(abs, v);
                Ok(())
            }
            None => Err(self.raise("stack index out of range")),
        }
    }

    // ── Stack shaping ───────────────────────────────────────────────────────

    /// Number of values visible to the caller (above the frame's argument
    /// base).
    pub fn top(&self) -> usize {
        self.stack.top() - self.base()
    }

    /// Grow (with nils) or shrink the visible stack to exactly `n` values.
    pub fn set_top(&mut self, n: usize) -> Result<(), Signal> {
        let target = self.base() + n;
        let extra = target.saturating_sub(self.stack.top());
        self.stack.check(extra)?;
        self.stack.set_top(target);
        Ok(())
    }

    pub fn push_value(&mut self, v: LuaValue) -> Result<(), Signal> {
        self.stack.check(1)?;
        self.stack.push(v);
        Ok(())
    }

    pub fn push_nil(&mut self) -> Result<(), Signal> {
        self.push_value(LuaValue::Nil)
    }

    pub fn push_boolean(&mut self, b: bool) -> Result<(), Signal> {
        self.push_value(LuaValue::Boolean(b))
    }

    pub fn push_integer(&mut self, n: i64) -> Result<(), Signal> {
        self.push_value(LuaValue::Integer(n))
    }

    pub fn push_float(&mut self, f: f64) -> Result<(), Signal> {
        self.push_value(LuaValue::Float(f))
    }

    pub fn push_str(&mut self, s: &str) -> Result<(), Signal> {
        self.push_value(LuaValue::Str(s.into()))
    }

    pub fn push_userdata(&mut self, data: impl std::any::Any + Send + Sync) -> Result<(), Signal> {
        self.push_value(LuaValue::UserData(UserData::new(data)))
    }

    pub fn push_globals(&mut self) -> Result<(), Signal> {
        self.push_value(LuaValue::Table(self.g.globals.clone()))
    }

    /// Drop `n` values from the top (never below the frame base).
    pub fn pop(&mut self, n: usize) {
        let floor = self.base();
        let target = self.stack.top().saturating_sub(n);
        self.stack.set_top(target.max(floor));
    }

    /// Copy the value at `from` into the slot at `to`, leaving `from`
    /// untouched.
    pub fn copy(&mut self, from: i32, to: i32) -> Result<(), Signal> {
        let v = self.value(from);
        self.put_at(to, v)
    }

    /// Pop the top value into the slot at `idx`.
    pub fn replace(&mut self, idx: i32) -> Result<(), Signal> {
        let v = self.stack.pop();
        self.put_at(idx, v)
    }

    /// Pop the top value and wedge it in at `idx`, shifting everything above
    /// up by one.
    pub fn insert(&mut self, idx: i32) -> Result<(), Signal> {
        let abs = match self.slot_of(idx) {
            Some(abs) => abs,
            None => return Err(self.raise("stack index out of range")),
        };
        let v = self.stack.pop();
        self.stack.insert(abs, v);
        Ok(())
    }

    /// Remove the value at `idx`, shifting everything above down by one.
    pub fn remove(&mut self, idx: i32) -> Result<(), Signal> {
        let abs = match self.slot_of(idx) {
            Some(abs) => abs,
            None => return Err(self.raise("stack index out of range")),
        };
        let _ = self.stack.remove(abs);
        Ok(())
    }

    /// Rotate the segment between `idx` and the top by `n` positions, toward
    /// the top for positive `n`.
    pub fn rotate(&mut self, idx: i32, n: isize) -> Result<(), Signal> {
        let abs = match self.slot_of(idx) {
            Some(abs) => abs,
            None => return Err(self.raise("stack index out of range")),
        };
        self.stack.rotate(abs, n);
        Ok(())
    }

    // ── Type probes and coercions ───────────────────────────────────────────

    /// Type of the value at `idx`, or `None` for an index that addresses
    /// nothing.
    pub fn value_type(&self, idx: i32) -> Option<LuaType> {
        if idx <= REGISTRY_INDEX {
            return Some(self.value(idx).value_type());
        }
        self.slot_of(idx).map(|abs| self.stack.get(abs).value_type())
    }

    pub fn is_nil(&self, idx: i32) -> bool {
        self.value(idx).is_nil()
    }

    pub fn is_boolean(&self, idx: i32) -> bool {
        matches!(self.value(idx), LuaValue::Boolean(_))
    }

    pub fn is_integer(&self, idx: i32) -> bool {
        matches!(self.value(idx), LuaValue::Integer(_))
    }

    pub fn is_number(&self, idx: i32) -> bool {
        matches!(self.value(idx), LuaValue::Integer(_) | LuaValue::Float(_))
    }

    pub fn is_str(&self, idx: i32) -> bool {
        matches!(self.value(idx), LuaValue::Str(_))
    }

    pub fn is_table(&self, idx: i32) -> bool {
        matches!(self.value(idx), LuaValue::Table(_))
    }

    pub fn is_function(&self, idx: i32) -> bool {
        matches!(self.value(idx), LuaValue::Closure(_) | LuaValue::Native(_))
    }

    pub fn is_thread(&self, idx: i32) -> bool {
        matches!(self.value(idx), LuaValue::Thread(_))
    }

    pub fn is_userdata(&self, idx: i32) -> bool {
        matches!(self.value(idx), LuaValue::UserData(_))
    }

    /// Lenient: integers, integral floats, and numeric strings all convert.
    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        self.value(idx).to_integer_exact()
    }

    pub fn to_float(&self, idx: i32) -> Option<f64> {
        self.value(idx).to_float()
    }

    /// Lenient: numbers format to their display form, as the concatenation
    /// operator would.
    pub fn to_str(&self, idx: i32) -> Option<Arc<str>> {
        match self.value(idx) {
            LuaValue::Str(s) => Some(s),
            v @ (LuaValue::Integer(_) | LuaValue::Float(_)) => Some(Arc::from(v.to_string())),
            _ => None,
        }
    }

    /// Truthiness, never fails: nil and false are false, all else true.
    pub fn to_boolean(&self, idx: i32) -> bool {
        self.value(idx).is_truthy()
    }

    pub fn to_table(&self, idx: i32) -> Option<TableRef> {
        match self.value(idx) {
            LuaValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn to_thread(&self, idx: i32) -> Option<Arc<Coroutine>> {
        match self.value(idx) {
            LuaValue::Thread(co) => Some(co),
            _ => None,
        }
    }

    pub fn to_userdata(&self, idx: i32) -> Option<Arc<UserData>> {
        match self.value(idx) {
            LuaValue::UserData(u) => Some(u),
            _ => None,
        }
    }

    // ── Checked argument accessors ──────────────────────────────────────────

    pub fn check_integer(&self, arg: usize) -> Result<i64, Signal> {
        let v = self.value(arg as i32);
        v.to_integer_exact().ok_or_else(|| {
            self.raise(format!(
                "bad argument #{arg} (number expected, got {})",
                v.type_name()
            ))
        })
    }

    pub fn check_float(&self, arg: usize) -> Result<f64, Signal> {
        let v = self.value(arg as i32);
        v.to_float().ok_or_else(|| {
            self.raise(format!(
                "bad argument #{arg} (number expected, got {})",
                v.type_name()
            ))
        })
    }

    pub fn check_str(&self, arg: usize) -> Result<Arc<str>, Signal> {
        self.to_str(arg as i32).ok_or_else(|| {
            self.raise(format!(
                "bad argument #{arg} (string expected, got {})",
                self.value(arg as i32).type_name()
            ))
        })
    }

    pub fn check_table(&self, arg: usize) -> Result<TableRef, Signal> {
        self.to_table(arg as i32).ok_or_else(|| {
            self.raise(format!(
                "bad argument #{arg} (table expected, got {})",
                self.value(arg as i32).type_name()
            ))
        })
    }

    /// Like [`check_integer`](Self::check_integer) but a missing or nil
    /// argument falls back to `default`.
    pub fn opt_integer(&self, arg: usize, default: i64) -> Result<i64, Signal> {
        if self.value(arg as i32).is_nil() {
            return Ok(default);
        }
        self.check_integer(arg)
    }

    // ── Table operations ────────────────────────────────────────────────────

    /// Push a fresh table with capacity hints.
    pub fn new_table(&mut self, narr: usize, nhash: usize) -> Result<(), Signal> {
        let t = LuaTable::with_capacity(narr, nhash);
        self.push_value(LuaValue::Table(Arc::new(RwLock::new(t))))
    }

    /// `t[k]` with metamethods: pops the key, pushes the result.
    pub fn get_table(&mut self, idx: i32) -> Result<LuaType, Signal> {
        let t = self.value(idx);
        let k = self.stack.pop();
        let v = self.index_get(t, k)?;
        let ty = v.value_type();
        self.push_value(v)?;
        Ok(ty)
    }

    /// `t[k] = v` with metamethods: pops the value, then the key.
    pub fn set_table(&mut self, idx: i32) -> Result<(), Signal> {
        let t = self.value(idx);
        let v = self.stack.pop();
        let k = self.stack.pop();
        self.index_set(t, k, v)
    }

    /// `t[key]` with metamethods for a string key: pushes the result.
    pub fn get_field(&mut self, idx: i32, key: &str) -> Result<LuaType, Signal> {
        let t = self.value(idx);
        let v = self.index_get(t, LuaValue::Str(key.into()))?;
        let ty = v.value_type();
        self.push_value(v)?;
        Ok(ty)
    }

    /// `t[key] = v` with metamethods for a string key: pops the value.
    pub fn set_field(&mut self, idx: i32, key: &str) -> Result<(), Signal> {
        let t = self.value(idx);
        let v = self.stack.pop();
        self.index_set(t, LuaValue::Str(key.into()), v)
    }

    /// Raw read, bypassing `__index`: pops the key, pushes the result.
    /// Nil and NaN keys read as nil.
    pub fn raw_get(&mut self, idx: i32) -> Result<LuaType, Signal> {
        let tref = match self.value(idx) {
            LuaValue::Table(t) => t,
            other => {
                return Err(self.raise(format!("attempt to index a {} value", other.type_name())))
            }
        };
        let k = self.stack.pop();
        let v = if valid_key(&k) {
            crate::lock_read(&tref).get(&k)
        } else {
            LuaValue::Nil
        };
        let ty = v.value_type();
        self.push_value(v)?;
        Ok(ty)
    }

    /// Raw write, bypassing `__newindex`: pops the value, then the key.
    pub fn raw_set(&mut self, idx: i32) -> Result<(), Signal> {
        let tref = match self.value(idx) {
            LuaValue::Table(t) => t,
            other => {
                return Err(self.raise(format!("attempt to index a {} value", other.type_name())))
            }
        };
        let v = self.stack.pop();
        let k = self.stack.pop();
        if k.is_nil() {
            return Err(self.raise("table index is nil"));
        }
        if matches!(&k, LuaValue::Float(f) if f.is_nan()) {
            return Err(self.raise("table index is NaN"));
        }
        crate::lock_write(&tref).put(k, v);
        Ok(())
    }

    /// Raw length: bytes for strings, array border for tables, 0 otherwise.
    pub fn raw_len(&self, idx: i32) -> usize {
        match self.value(idx) {
            LuaValue::Str(s) => s.len(),
            LuaValue::Table(t) => crate::lock_read(&t).len() as usize,
            _ => 0,
        }
    }

    /// One traversal step: pops a key, pushes the successor key and its
    /// value, or pushes nothing and returns false at the end.
    pub fn next_entry(&mut self, idx: i32) -> Result<bool, Signal> {
        let tref = match self.value(idx) {
            LuaValue::Table(t) => t,
            other => {
                return Err(self.raise(format!(
                    "bad argument to 'next' (table expected, got {})",
                    other.type_name()
                )))
            }
        };
        let key = self.stack.pop();
        let stepped = match crate::lock_write(&tref).next(&key)? {
            Some((k, v)) => {
                self.stack.check(2)?;
                self.stack.push(k);
                self.stack.push(v);
                Ok(true)
            }
            None => Ok(false),
        };
        stepped
    }

    /// Push the metatable of the value at `idx`; false (and no push) when it
    /// has none.
    pub fn get_metatable(&mut self, idx: i32) -> Result<bool, Signal> {
        let v = self.value(idx);
        match self.metatable_of(&v) {
            Some(mt) => {
                self.push_value(LuaValue::Table(mt))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pop a table (or nil) and install it as the metatable of the value at
    /// `idx`.  Tables and userdata carry their own; every other type shares
    /// one per-type table.
    pub fn set_metatable(&mut self, idx: i32) -> Result<(), Signal> {
        let mt = match self.stack.pop() {
            LuaValue::Nil => None,
            LuaValue::Table(t) => Some(t),
            other => {
                return Err(self.raise(format!(
                    "invalid metatable (table expected, got {})",
                    other.type_name()
                )))
            }
        };
        match self.value(idx) {
            LuaValue::Table(t) => crate::lock_write(&t).set_metatable(mt),
            LuaValue::UserData(u) => u.set_metatable(mt),
            other => self.g.set_type_metatable(other.value_type(), mt),
        }
        Ok(())
    }

    /// The `#` operator with metamethods, returned rather than pushed.
    pub fn length_at(&mut self, idx: i32) -> Result<LuaValue, Signal> {
        self.length_of(self.value(idx))
    }

    // ── Globals ─────────────────────────────────────────────────────────────

    /// Push `_G[name]` (honoring metamethods on the globals table).
    pub fn get_global(&mut self, name: &str) -> Result<LuaType, Signal> {
        let gt = LuaValue::Table(self.g.globals.clone());
        let v = self.index_get(gt, LuaValue::Str(name.into()))?;
        let ty = v.value_type();
        self.push_value(v)?;
        Ok(ty)
    }

    /// Pop a value into `_G[name]`.
    pub fn set_global(&mut self, name: &str) -> Result<(), Signal> {
        let v = self.stack.pop();
        let gt = LuaValue::Table(self.g.globals.clone());
        self.index_set(gt, LuaValue::Str(name.into()), v)
    }

    // ── Calls ───────────────────────────────────────────────────────────────

    fn call_slot(&self, n_args: usize) -> Result<usize, Signal> {
        let need = n_args + 1;
        let top = self.stack.top();
        if top < self.base() + need {
            return Err(Signal::error_str(
                "not enough values on the stack for the call",
            ));
        }
        Ok(top - need)
    }

    /// Call the function below the `n_args` topmost values.  Results replace
    /// the function and its arguments, padded or truncated to `n_results`
    /// when one is given.  Calls made through here cannot be yielded across.
    pub fn call(&mut self, n_args: usize, n_results: Option<usize>) -> Result<(), Signal> {
        let func = self.call_slot(n_args)?;
        let want = n_results.map(|n| n as i32).unwrap_or(MULTRET);
        self.nny += 1;
        let r = self.call_value(func, want);
        self.nny -= 1;
        r
    }

    /// Like [`call`](Self::call), under error protection.  On failure the
    /// error value (run through the handler at `handler_slot`, if given)
    /// replaces the function and arguments.
    pub fn pcall(
        &mut self,
        n_args: usize,
        n_results: Option<usize>,
        handler_slot: Option<i32>,
    ) -> Status {
        let handler = handler_slot.map(|i| self.value(i));
        let func = match self.call_slot(n_args) {
            Ok(f) => f,
            Err(sig) => {
                let v = match sig {
                    Signal::Error(v) => v,
                    Signal::Yield(_) => LuaValue::Nil,
                };
                self.stack.push(v);
                return Status::RuntimeError;
            }
        };
        let want = n_results.map(|n| n as i32).unwrap_or(MULTRET);
        self.protected_call(func, want, handler)
    }

    /// Push a native function.
    pub fn push_native(&mut self, name: &str, f: NativeFn) -> Result<(), Signal> {
        self.push_value(LuaValue::Native(Arc::new(NativeClosure::new(name, f))))
    }

    /// Push a native closure capturing the `n_upvalues` topmost values, in
    /// stack order.
    pub fn push_native_closure(
        &mut self,
        name: &str,
        f: NativeFn,
        n_upvalues: usize,
    ) -> Result<(), Signal> {
        if self.top() < n_upvalues {
            return Err(Signal::error_str(
                "not enough values on the stack to capture",
            ));
        }
        let ups = self.stack.pop_n(n_upvalues);
        self.push_value(LuaValue::Native(Arc::new(NativeClosure::with_upvalues(
            name, f, ups,
        ))))
    }

    /// Bind `f` to the global `name`.
    pub fn register(&mut self, name: &str, f: NativeFn) -> Result<(), Signal> {
        self.push_native(name, f)?;
        self.set_global(name)
    }

    /// Remove the global binding for `name`.
    pub fn unregister(&mut self, name: &str) -> Result<(), Signal> {
        let gt = LuaValue::Table(self.g.globals.clone());
        self.index_set(gt, LuaValue::Str(name.into()), LuaValue::Nil)
    }

    // ── Coroutines ──────────────────────────────────────────────────────────

    /// Pop the callable on top of the stack and bind it as the body of a new
    /// coroutine; the thread value is pushed back and the handle returned.
    pub fn new_thread(&mut self) -> Result<Arc<Coroutine>, Signal> {
        let body = self.stack.pop();
        let co = Coroutine::new(self.g.clone(), body);
        self.push_value(LuaValue::Thread(co.clone()))?;
        Ok(co)
    }

    // ── Errors ──────────────────────────────────────────────────────────────

    /// Pop the top value and raise it as an error, exactly as popped (no
    /// position prefix).
    pub fn raise_top(&mut self) -> Signal {
        Signal::Error(self.stack.pop())
    }

    /// Install the hook consulted when an error reaches an unprotected
    /// host boundary; returns the previous hook.
    pub fn at_panic(&self, hook: Option<PanicFn>) -> Option<PanicFn> {
        self.g.at_panic(hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::GlobalState;
    use crate::lua::Options;

    fn state() -> LuaState {
        LuaState::new_main(GlobalState::new(Options::default()))
    }

    fn int(n: i64) -> LuaValue {
        LuaValue::Integer(n)
    }

    #[test]
    fn shaping_the_stack() {
        let mut st = state();
        st.push_integer(1).unwrap();
        st.push_integer(2).unwrap();
        st.push_integer(3).unwrap();
        assert_eq!(st.top(), 3);
        assert_eq!(st.value(1), int(1));
        assert_eq!(st.value(-1), int(3));
        assert_eq!(st.abs_index(-1), 3);
        assert_eq!(st.abs_index(2), 2);

        st.insert(1).unwrap(); // 3 1 2
        assert_eq!(st.value(1), int(3));
        assert_eq!(st.value(3), int(2));
        st.remove(1).unwrap(); // 1 2
        assert_eq!(st.value(1), int(1));
        st.rotate(1, 1).unwrap(); // 2 1
        assert_eq!(st.value(1), int(2));

        st.copy(1, 2).unwrap(); // 2 2
        assert_eq!(st.value(2), int(2));
        st.push_integer(9).unwrap();
        st.replace(1).unwrap(); // 9 2
        assert_eq!(st.value(1), int(9));
        assert_eq!(st.top(), 2);

        st.set_top(4).unwrap();
        assert_eq!(st.top(), 4);
        assert!(st.is_nil(4));
        st.pop(3);
        assert_eq!(st.top(), 1);
    }

    #[test]
    fn out_of_range_indices_read_nil_and_refuse_writes() {
        let mut st = state();
        st.push_integer(1).unwrap();
        assert!(st.value(5).is_nil());
        assert!(st.value(-5).is_nil());
        assert_eq!(st.value_type(5), None);
        assert_eq!(st.value_type(1), Some(LuaType::Number));
        assert!(st.copy(1, 5).is_err());
    }

    #[test]
    fn registry_is_reachable_through_its_pseudo_index() {
        let mut st = state();
        assert!(st.is_table(REGISTRY_INDEX));
        st.push_str("marker").unwrap();
        st.set_field(REGISTRY_INDEX, "k").unwrap();
        st.get_field(REGISTRY_INDEX, "k").unwrap();
        assert_eq!(st.to_str(-1).as_deref(), Some("marker"));
    }

    #[test]
    fn native_upvalues_act_as_captured_state() {
        fn counter(st: &mut LuaState) -> Result<usize, Signal> {
            let n = st.value(upvalue_index(1)).to_integer_exact().unwrap_or(0) + 1;
            st.push_integer(n)?;
            st.copy(-1, upvalue_index(1))?;
            Ok(1)
        }
        let mut st = state();
        st.push_integer(0).unwrap();
        st.push_native_closure("counter", counter, 1).unwrap();
        let f = st.value(-1);

        for expect in 1..=3 {
            st.push_value(f.clone()).unwrap();
            st.call(0, Some(1)).unwrap();
            assert_eq!(st.to_integer(-1), Some(expect));
            st.pop(1);
        }
    }

    #[test]
    fn table_round_trip_with_both_access_styles() {
        let mut st = state();
        st.new_table(0, 4).unwrap();
        st.push_integer(7).unwrap();
        st.set_field(1, "n").unwrap();

        st.push_str("n").unwrap();
        assert_eq!(st.get_table(1).unwrap(), LuaType::Number);
        assert_eq!(st.to_integer(-1), Some(7));
        st.pop(1);

        st.push_integer(1).unwrap();
        st.push_str("one").unwrap();
        st.raw_set(1).unwrap();
        assert_eq!(st.raw_len(1), 1);
        st.push_integer(1).unwrap();
        st.raw_get(1).unwrap();
        assert_eq!(st.to_str(-1).as_deref(), Some("one"));
    }

    #[test]
    fn next_entry_walks_every_pair() {
        let mut st = state();
        st.new_table(0, 4).unwrap();
        for (k, v) in [("a", 1), ("b", 2), ("c", 3)] {
            st.push_integer(v).unwrap();
            st.set_field(1, k).unwrap();
        }
        let mut seen = 0;
        st.push_nil().unwrap();
        while st.next_entry(1).unwrap() {
            seen += 1;
            st.pop(1); // drop the value, keep the key for the next step
        }
        assert_eq!(seen, 3);
        // the terminating call consumed the last key: only the table is left
        assert_eq!(st.top(), 1);
    }

    #[test]
    fn metatables_install_and_read_back() {
        let mut st = state();
        st.new_table(0, 0).unwrap();
        assert!(!st.get_metatable(1).unwrap());
        st.new_table(0, 1).unwrap();
        st.push_str("yes").unwrap();
        st.set_field(2, "__tag").unwrap();
        st.set_metatable(1).unwrap();
        assert!(st.get_metatable(1).unwrap());
        st.get_field(-1, "__tag").unwrap();
        assert_eq!(st.to_str(-1).as_deref(), Some("yes"));
    }

    #[test]
    fn call_and_pcall_through_the_api() {
        fn add(st: &mut LuaState) -> Result<usize, Signal> {
            let a = st.check_integer(1)?;
            let b = st.check_integer(2)?;
            st.push_integer(a + b)?;
            Ok(1)
        }
        let mut st = state();
        st.push_native("add", add).unwrap();
        st.push_integer(2).unwrap();
        st.push_integer(40).unwrap();
        st.call(2, Some(1)).unwrap();
        assert_eq!(st.to_integer(-1), Some(42));
        st.pop(1);

        // bad argument surfaces through pcall, stack height restored
        st.push_native("add", add).unwrap();
        st.push_integer(2).unwrap();
        st.push_str("nope").unwrap();
        let status = st.pcall(2, None, None);
        assert_eq!(status, Status::RuntimeError);
        assert_eq!(st.top(), 1);
        assert!(st.to_str(-1).map(|s| s.contains("bad argument #2")).unwrap_or(false));
    }

    #[test]
    fn globals_and_registration() {
        fn noop(_st: &mut LuaState) -> Result<usize, Signal> {
            Ok(0)
        }
        let mut st = state();
        st.register("noop", noop).unwrap();
        st.get_global("noop").unwrap();
        assert!(st.is_function(-1));
        st.pop(1);
        st.unregister("noop").unwrap();
        st.get_global("noop").unwrap();
        assert!(st.is_nil(-1));
    }

    #[test]
    fn checked_accessors_report_bad_arguments() {
        fn strict(st: &mut LuaState) -> Result<usize, Signal> {
            let _ = st.check_str(1)?;
            let n = st.opt_integer(2, 10)?;
            st.push_integer(n)?;
            Ok(1)
        }
        let mut st = state();
        st.push_native("strict", strict).unwrap();
        st.push_str("ok").unwrap();
        st.call(1, Some(1)).unwrap();
        assert_eq!(st.to_integer(-1), Some(10));
        st.pop(1);

        st.push_native("strict", strict).unwrap();
        st.push_boolean(true).unwrap();
        let status = st.pcall(1, None, None);
        assert!(!status.is_ok());
        assert!(st
            .to_str(-1)
            .map(|s| s.contains("string expected, got boolean"))
            .unwrap_or(false));
    }

    #[test]
    fn thread_creation_binds_the_top_value() {
        fn body(st: &mut LuaState) -> Result<usize, Signal> {
            st.push_integer(5)?;
            Ok(1)
        }
        let mut st = state();
        st.push_native("body", body).unwrap();
        let co = st.new_thread().unwrap();
        assert!(st.is_thread(-1));
        assert!(st.to_thread(-1).map(|t| Arc::ptr_eq(&t, &co)).unwrap_or(false));
        assert_eq!(
            co.resume(vec![]),
            crate::coroutine::Resume::Return(vec![int(5)])
        );
    }

    fn table_with_write_guard(st: &mut LuaState) {
        fn forbid(st: &mut LuaState) -> Result<usize, Signal> {
            Err(st.raise("write denied"))
        }
        st.new_table(0, 0).unwrap();
        st.new_table(0, 1).unwrap();
        st.push_native("forbid", forbid).unwrap();
        st.set_field(2, "__newindex").unwrap();
        st.set_metatable(1).unwrap();
    }

    #[test]
    fn guarded_writes_trip_the_newindex_handler() {
        let mut st = state();
        table_with_write_guard(&mut st);
        st.push_str("k").unwrap();
        st.push_integer(1).unwrap();
        match st.set_table(1).unwrap_err() {
            Signal::Error(v) => assert!(v.to_string().contains("write denied")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn raw_access_bypasses_metamethods() {
        let mut st = state();
        table_with_write_guard(&mut st);
        st.push_str("k").unwrap();
        st.push_integer(1).unwrap();
        st.raw_set(1).unwrap();
        st.push_str("k").unwrap();
        st.raw_get(1).unwrap();
        assert_eq!(st.to_integer(-1), Some(1));
    }
}
