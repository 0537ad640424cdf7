//! `crescent-vm` — the execution engine for compiled crescent units.
//!
//! This crate defines:
//! - [`LuaValue`] and its heap types ([`LuaTable`], [`LuaClosure`],
//!   [`NativeClosure`], [`UserData`], [`Coroutine`])
//! - [`LuaState`]: one thread of execution, carrying the value stack, the
//!   frame chain, and the stack-based host API
//! - [`Signal`] / [`Status`]: error and yield propagation
//! - [`Lua`]: the owning runtime handle a host embeds
//!
//! Units come from `crescent-core`; this crate only executes them.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod api;
pub mod call;
pub mod closure;
pub mod coroutine;
pub mod dispatch;
pub mod error;
pub mod exec;
pub mod frame;
pub mod global;
pub mod lua;
pub mod stack;
pub mod state;
pub mod table;
pub mod value;

pub use api::{upvalue_index, REGISTRY_INDEX};
pub use closure::{LuaClosure, NativeClosure, NativeFn, Upvalue};
pub use coroutine::{Coroutine, Resume, ThreadStatus};
pub use error::{Signal, Status};
pub use global::{GlobalRef, GlobalState, PanicFn};
pub use lua::{Lua, Options};
pub use state::LuaState;
pub use table::LuaTable;
pub use value::{LuaType, LuaValue, TableRef, UserData};

// Lock acquisition never blocks or poisons under the engine's one-owner
// discipline; a panicked test is the only writer that could have died.
pub(crate) fn lock_read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock_write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
