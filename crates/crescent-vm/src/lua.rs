//! The owning runtime handle: one [`Lua`] is one independent interpreter
//! with its own globals, registry, and main thread.

use std::sync::Arc;

use tracing::{debug, error};

use crescent_core::{load_unit, ChunkError, Proto};

use crate::closure::{LuaClosure, Upvalue};
use crate::coroutine::Coroutine;
use crate::error::Signal;
use crate::global::{GlobalRef, GlobalState};
use crate::state::LuaState;
use crate::value::LuaValue;

/// Runtime construction knobs.
#[derive(Debug, Clone)]
pub struct Options {
    /// Hard cap on value-stack slots per thread.
    pub max_stack: usize,
    /// Hard cap on nested native re-entries into the executor.
    pub max_call_depth: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_stack: 1_000_000,
            max_call_depth: 200,
        }
    }
}

/// An interpreter instance.  Dropping it drops everything it owns; values
/// that escaped through the host API keep their shared parts alive.
pub struct Lua {
    g: GlobalRef,
    main: Arc<Coroutine>,
}

impl Lua {
    pub fn new() -> Lua {
        Lua::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Lua {
        debug!(
            max_stack = options.max_stack,
            max_call_depth = options.max_call_depth,
            "runtime constructed"
        );
        let g = GlobalState::new(options);
        let main = Coroutine::main_thread(g.clone());
        g.bind_main(&main);
        Lua { g, main }
    }

    /// Shared global state (registry, globals table, per-type metatables).
    pub fn global_state(&self) -> &GlobalRef {
        &self.g
    }

    /// The main thread.
    pub fn main(&self) -> &Arc<Coroutine> {
        &self.main
    }

    /// Run `f` against the main thread's state.  All stack manipulation and
    /// most of the host API happen inside this scope.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut LuaState) -> R) -> R {
        f(&mut crate::lock_write(&self.main.state))
    }

    /// Decode a compiled unit and push its root closure onto the main stack.
    pub fn load(&self, bytes: &[u8]) -> Result<(), ChunkError> {
        let chunk = load_unit(bytes)?;
        self.load_proto(chunk.proto);
        Ok(())
    }

    /// Push a closure over `proto` onto the main stack.  Root protos own no
    /// live upvalues; any declared ones start as closed nil cells.
    pub fn load_proto(&self, proto: Arc<Proto>) {
        let upvalues = proto
            .upvalue_descs
            .iter()
            .map(|_| Upvalue::closed(LuaValue::Nil))
            .collect();
        let closure = LuaClosure::new(proto, upvalues);
        let mut st = crate::lock_write(&self.main.state);
        st.stack.push(LuaValue::Closure(Arc::new(closure)));
    }

    /// Call the function below the `n_args` topmost main-stack values with
    /// no protected boundary.  On an error the panic hook (if any) observes
    /// the value, the main stack is unwound to the call site, and the value
    /// comes back as `Err`.
    pub fn call(&self, n_args: usize, n_results: Option<usize>) -> Result<(), LuaValue> {
        let mut st = crate::lock_write(&self.main.state);
        let depth = st.frames.depth();
        let func = st.stack.top().saturating_sub(n_args + 1);
        match st.call(n_args, n_results) {
            Ok(()) => Ok(()),
            Err(sig) => {
                let v = match sig {
                    Signal::Error(v) => v,
                    Signal::Yield(_) => {
                        LuaValue::Str("attempt to yield from outside a coroutine".into())
                    }
                };
                st.close_upvalues(func);
                st.frames.truncate(depth);
                st.stack.set_top(func);
                if let Some(hook) = st.g.panic_hook() {
                    debug!("invoking panic hook");
                    hook(&v);
                }
                error!(value = %v, "unprotected error reached the host");
                Err(v)
            }
        }
    }
}

impl Default for Lua {
    fn default() -> Self {
        Lua::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crescent_core::{encode_chunk, Chunk, Constant, OpCode, ProtoBuilder};
    use crate::error::Status;

    #[test]
    fn loaded_units_run_through_the_handle() {
        let mut b = ProtoBuilder::new("unit");
        let k = b.add_constant(Constant::Integer(21));
        b.emit(OpCode::LoadConst { dst: 0, index: k });
        b.emit(OpCode::Arith {
            op: crescent_core::ArithOp::Add,
            dst: 0,
            lhs: crescent_core::Rk::Reg(0),
            rhs: crescent_core::Rk::Reg(0),
        });
        b.emit(OpCode::Return {
            first: 0,
            count: Some(1),
        });
        b.max_registers = 1;
        let bytes = encode_chunk(&Chunk::new(b.finish()));

        let lua = Lua::new();
        lua.load(&bytes).unwrap();
        lua.call(0, Some(1)).unwrap();
        let result = lua.with_state(|st| {
            let v = st.to_integer(-1);
            st.pop(1);
            v
        });
        assert_eq!(result, Some(42));
    }

    #[test]
    fn natives_register_and_run_end_to_end() {
        fn double(st: &mut LuaState) -> Result<usize, Signal> {
            let n = st.check_integer(1)?;
            st.push_integer(n * 2)?;
            Ok(1)
        }
        let lua = Lua::new();
        lua.with_state(|st| {
            st.register("double", double).unwrap();
            st.get_global("double").unwrap();
            st.push_integer(8).unwrap();
        });
        lua.call(1, Some(1)).unwrap();
        assert_eq!(lua.with_state(|st| st.to_integer(-1)), Some(16));
    }

    fn explode(st: &mut LuaState) -> Result<usize, Signal> {
        Err(st.raise("boom"))
    }

    #[test]
    fn unprotected_errors_fire_the_panic_hook_and_unwind() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn observe(_: &LuaValue) {
            HITS.fetch_add(1, Ordering::SeqCst);
        }
        let lua = Lua::new();
        lua.with_state(|st| st.at_panic(Some(observe)));
        lua.with_state(|st| {
            st.push_integer(7).unwrap();
            st.push_native("explode", explode).unwrap();
        });
        let err = lua.call(0, None).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        // unwound to the call site: the unrelated value below survives
        lua.with_state(|st| {
            assert_eq!(st.top(), 1);
            assert_eq!(st.to_integer(1), Some(7));
        });
    }

    #[test]
    fn protected_calls_never_reach_the_hook() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn observe(_: &LuaValue) {
            HITS.fetch_add(1, Ordering::SeqCst);
        }
        let lua = Lua::new();
        lua.with_state(|st| st.at_panic(Some(observe)));
        let status = lua.with_state(|st| {
            st.push_native("explode", explode).unwrap();
            st.pcall(0, None, None)
        });
        assert_eq!(status, Status::RuntimeError);
        assert_eq!(HITS.load(Ordering::SeqCst), 0);
    }
}
