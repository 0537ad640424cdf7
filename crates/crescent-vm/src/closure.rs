//! Function objects: script closures (a proto plus captured upvalues),
//! host closures, and the upvalue cell itself.
//!
//! An upvalue starts *open*, aliasing an absolute stack slot, and is
//! *closed* (the value moved into the cell) when its slot leaves the stack.
//! Closures capturing the same live local share one cell, so writes through
//! either are seen by both before and after closing.

use std::fmt;
use std::sync::{Arc, RwLock};

use crescent_core::Proto;

use crate::error::Signal;
use crate::state::LuaState;
use crate::value::LuaValue;

/// Host function signature: arguments arrive on the state's stack, the
/// return value is how many results were pushed on top.
pub type NativeFn = fn(&mut LuaState) -> Result<usize, Signal>;

// ── Upvalues ────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum UpvalueState {
    /// Aliases an absolute stack slot of the owning thread.
    Open(usize),
    /// The slot left the stack; the cell owns the value now.
    Closed(LuaValue),
}

/// Shared, interior-mutable upvalue cell.
#[derive(Debug, Clone)]
pub struct Upvalue(Arc<RwLock<UpvalueState>>);

impl Upvalue {
    pub fn open(slot: usize) -> Upvalue {
        Upvalue(Arc::new(RwLock::new(UpvalueState::Open(slot))))
    }

    pub fn closed(value: LuaValue) -> Upvalue {
        Upvalue(Arc::new(RwLock::new(UpvalueState::Closed(value))))
    }

    /// The absolute stack slot this cell aliases, if still open.
    pub fn open_slot(&self) -> Option<usize> {
        match &*crate::lock_read(&self.0) {
            UpvalueState::Open(slot) => Some(*slot),
            UpvalueState::Closed(_) => None,
        }
    }

    /// Read through the cell: from the stack while open, from the cell once
    /// closed.  `slots` is the owning thread's full slot slice.
    pub fn get(&self, slots: &[LuaValue]) -> LuaValue {
        match &*crate::lock_read(&self.0) {
            UpvalueState::Open(slot) => slots.get(*slot).cloned().unwrap_or(LuaValue::Nil),
            UpvalueState::Closed(v) => v.clone(),
        }
    }

    /// Write through the cell: to the stack while open, into the cell once
    /// closed.
    pub fn set(&self, slots: &mut [LuaValue], value: LuaValue) {
        let mut state = crate::lock_write(&self.0);
        match &mut *state {
            UpvalueState::Open(slot) => {
                if let Some(dst) = slots.get_mut(*slot) {
                    *dst = value;
                }
            }
            UpvalueState::Closed(v) => *v = value,
        }
    }

    /// Move the final slot value into the cell.  The state layer closes each
    /// cell exactly once, when its slot dies.
    pub fn close(&self, value: LuaValue) {
        *crate::lock_write(&self.0) = UpvalueState::Closed(value);
    }

    /// Identity, for cell-sharing checks.
    pub fn ptr_eq(a: &Upvalue, b: &Upvalue) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

// ── Script closures ─────────────────────────────────────────────────────────

/// A compiled function bound to its captured environment.
#[derive(Debug)]
pub struct LuaClosure {
    pub proto: Arc<Proto>,
    pub upvalues: Vec<Upvalue>,
}

impl LuaClosure {
    pub fn new(proto: Arc<Proto>, upvalues: Vec<Upvalue>) -> Self {
        LuaClosure { proto, upvalues }
    }
}

// ── Host closures ───────────────────────────────────────────────────────────

/// A host function plus its private upvalue slots, reachable through
/// pseudo-indices while the function runs.
pub struct NativeClosure {
    pub name: Arc<str>,
    pub func: NativeFn,
    upvalues: RwLock<Vec<LuaValue>>,
}

impl NativeClosure {
    pub fn new(name: &str, func: NativeFn) -> Self {
        Self::with_upvalues(name, func, Vec::new())
    }

    pub fn with_upvalues(name: &str, func: NativeFn, upvalues: Vec<LuaValue>) -> Self {
        NativeClosure {
            name: name.into(),
            func,
            upvalues: RwLock::new(upvalues),
        }
    }

    /// 1-based upvalue read; nil when out of range.
    pub fn upvalue(&self, index: usize) -> LuaValue {
        let ups = crate::lock_read(&self.upvalues);
        if index >= 1 && index <= ups.len() {
            ups[index - 1].clone()
        } else {
            LuaValue::Nil
        }
    }

    /// 1-based upvalue write; false when out of range.
    pub fn set_upvalue(&self, index: usize, value: LuaValue) -> bool {
        let mut ups = crate::lock_write(&self.upvalues);
        if index >= 1 && index <= ups.len() {
            ups[index - 1] = value;
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for NativeClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeClosure")
            .field("name", &self.name)
            .field("func", &(self.func as usize as *const ()))
            .finish()
    }
}
