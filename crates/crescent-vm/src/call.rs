//! The call protocol: frame entry and exit, result shaping, tail-call frame
//! reuse, protected calls, and the suspension path for natives that yield.

use std::sync::Arc;

use tracing::trace;

use crate::closure::{LuaClosure, NativeClosure};
use crate::error::{Signal, Status};
use crate::frame::{CallInfo, MULTRET};
use crate::state::{LuaState, ResumePoint};
use crate::value::LuaValue;

/// Scratch slots guaranteed to a native function beyond its arguments.
pub(crate) const MIN_NATIVE_SLOTS: usize = 20;

/// What `pre_call` did with the callee.
pub(crate) enum Invoked {
    /// A script frame was pushed; the executor must (re)enter it.
    Script,
    /// A native ran to completion; results are already shaped in place.
    Native,
}

/// How a tail call left the current frame.
pub(crate) enum TailOutcome {
    /// The frame was rebound to a script callee; re-enter it.
    Reentered,
    /// The callee was native and the whole frame already returned.
    Returned,
}

impl LuaState {
    // ── Frame entry ─────────────────────────────────────────────────────────

    /// Begin a call of the value at `func`; arguments sit between `func + 1`
    /// and the stack top.  Script callees get a frame and are left for the
    /// executor.  Native callees run to completion right here: on return
    /// their results are shaped at `func` and the frame is gone.
    pub(crate) fn pre_call(&mut self, func: usize, want: i32) -> Result<Invoked, Signal> {
        let callee = self.stack.get(func);
        let callee = match callee {
            LuaValue::Closure(_) | LuaValue::Native(_) => callee,
            other => match self.metamethod_of(&other, "__call") {
                // one retry: the handler is inserted before the value, which
                // becomes its first argument
                Some(handler) => {
                    self.stack.check(1)?;
                    self.stack.insert(func, handler.clone());
                    handler
                }
                None => {
                    return Err(
                        self.raise(format!("attempt to call a {} value", other.type_name()))
                    )
                }
            },
        };
        match callee {
            LuaValue::Closure(closure) => {
                self.push_script_frame(closure, func, want)?;
                Ok(Invoked::Script)
            }
            LuaValue::Native(native) => {
                self.run_native(native, func, want)?;
                Ok(Invoked::Native)
            }
            other => Err(self.raise(format!("attempt to call a {} value", other.type_name()))),
        }
    }

    fn push_script_frame(
        &mut self,
        closure: Arc<LuaClosure>,
        func: usize,
        want: i32,
    ) -> Result<(), Signal> {
        let proto = closure.proto.clone();
        let base = func + 1;
        let frame_top = base + proto.max_registers as usize;
        let extra = frame_top.saturating_sub(self.stack.top());
        self.stack.check(extra)?;

        let params = proto.param_count as usize;
        let given = self.stack.top().saturating_sub(base);
        let mut varargs = Vec::new();
        if proto.is_vararg && given > params {
            varargs.reserve(given - params);
            for i in params..given {
                varargs.push(self.stack.get(base + i));
                self.stack.set(base + i, LuaValue::Nil);
            }
        }
        // missing parameters read as nil: slots above the old top already
        // hold nil, so raising the top is all the padding needed
        self.stack.set_top(frame_top);

        let mut ci = CallInfo::script(closure, func, base, want);
        ci.varargs = varargs;
        self.frames.push(ci);
        trace!(func, base, params, "enter script frame");
        Ok(())
    }

    fn run_native(
        &mut self,
        native: Arc<NativeClosure>,
        func: usize,
        want: i32,
    ) -> Result<(), Signal> {
        self.stack.check(MIN_NATIVE_SLOTS)?;
        let base = func + 1;
        let ci = CallInfo::native(func, base, self.stack.top() + MIN_NATIVE_SLOTS, want);
        self.frames.push(ci);
        trace!(name = %native.name, func, "enter native frame");
        match (native.func)(self) {
            Ok(nresults) => {
                let first = self.stack.top().saturating_sub(nresults);
                self.pos_call(first, nresults);
                Ok(())
            }
            Err(Signal::Yield(values)) => {
                // Suspend.  The native frame unwinds now; the resume
                // arguments will stand in for its results later.
                self.frames.pop();
                self.stack.set_top(func);
                self.resume_point = Some(ResumePoint {
                    result_slot: func,
                    want,
                });
                trace!(n = values.len(), "native suspended");
                Err(Signal::Yield(values))
            }
            // the frame stays for the unwinder; a protected boundary
            // truncates it along with everything else
            Err(e) => Err(e),
        }
    }

    // ── Frame exit ──────────────────────────────────────────────────────────

    /// End the current frame: move its `n` results from `first` down over
    /// the callee slot, shape them to the caller's expectation, and pop the
    /// frame.  Returns the finished frame's `(func, want)`.
    pub(crate) fn pos_call(&mut self, first: usize, n: usize) -> (usize, i32) {
        debug_assert!(self.frames.depth() > 0, "pos_call without a frame");
        let (func, want) = self
            .frames
            .current()
            .map(|ci| (ci.func, ci.want))
            .unwrap_or((first, MULTRET));
        for i in 0..n {
            let v = self.stack.get(first + i);
            self.stack.set(func + i, v);
        }
        self.stack.set_top(func + n);
        let shaped = if want == MULTRET { n } else { want as usize };
        if shaped != n {
            self.stack.set_top(func + shaped);
        }
        self.frames.pop();
        trace!(func, results = n, "leave frame");
        (func, want)
    }

    /// Replace the current frame with a call to the value at `func` (callee
    /// plus arguments up to the stack top), keeping the caller's result
    /// expectation.
    pub(crate) fn tail_call(&mut self, func: usize) -> Result<TailOutcome, Signal> {
        let (cur_func, want, tail_calls) = match self.frames.current() {
            Some(ci) => (ci.func, ci.want, ci.tail_calls),
            None => return Err(Signal::error_str("tail call without a frame")),
        };
        // slide callee and arguments down over the dying frame
        let n = self.stack.top().saturating_sub(func);
        for i in 0..n {
            let v = self.stack.get(func + i);
            self.stack.set(cur_func + i, v);
        }
        self.stack.set_top(cur_func + n);
        self.frames.pop();

        match self.pre_call(cur_func, want)? {
            Invoked::Script => {
                if let Some(ci) = self.frames.current_mut() {
                    ci.tail_calls = tail_calls + 1;
                }
                Ok(TailOutcome::Reentered)
            }
            Invoked::Native => Ok(TailOutcome::Returned),
        }
    }

    // ── Re-entrant calls ────────────────────────────────────────────────────

    /// Call the value at `func` to completion: run natives, drive script
    /// frames through the executor.  This is the host/metamethod re-entry
    /// point, bounded by the configured native call depth.
    pub(crate) fn call_value(&mut self, func: usize, want: i32) -> Result<(), Signal> {
        if self.native_depth as usize >= self.g.options.max_call_depth {
            return Err(self.raise("native stack overflow"));
        }
        self.native_depth += 1;
        let result = match self.pre_call(func, want) {
            Ok(Invoked::Native) => Ok(()),
            Ok(Invoked::Script) => self.execute(self.frames.depth()),
            Err(e) => Err(e),
        };
        self.native_depth -= 1;
        result
    }

    /// Run a call under error protection.  On failure the stack and frames
    /// unwind to the call boundary and the error value (transformed by
    /// `handler` when one is given) replaces everything above `func`.
    pub(crate) fn protected_call(
        &mut self,
        func: usize,
        want: i32,
        handler: Option<LuaValue>,
    ) -> Status {
        let saved_depth = self.frames.depth();
        self.nny += 1;
        let result = self.call_value(func, want);
        self.nny -= 1;

        let err = match result {
            Ok(()) => return Status::Ok,
            Err(Signal::Error(e)) => e,
            // nny forbids crossing this boundary, so a yield arriving here
            // was misrouted by a native; surface it as an error
            Err(Signal::Yield(_)) => {
                LuaValue::Str("attempt to yield across a protected boundary".into())
            }
        };
        self.close_upvalues(func);
        self.frames.truncate(saved_depth);
        self.stack.set_top(func);

        let handler = match handler {
            None => {
                self.stack.push(err);
                return Status::RuntimeError;
            }
            Some(h) => h,
        };
        if self.stack.check(2).is_err() {
            self.stack.push(err);
            return Status::RuntimeError;
        }
        self.stack.push(handler);
        self.stack.push(err);
        self.nny += 1;
        let transformed = self.call_value(func, 1);
        self.nny -= 1;
        match transformed {
            Ok(()) => Status::RuntimeError,
            Err(sig) => {
                let err2 = match sig {
                    Signal::Error(e) => e,
                    Signal::Yield(_) => {
                        LuaValue::Str("attempt to yield across a protected boundary".into())
                    }
                };
                self.frames.truncate(saved_depth);
                self.stack.set_top(func);
                self.stack.push(err2);
                Status::HandlerError
            }
        }
    }

    // ── Yielding ────────────────────────────────────────────────────────────

    /// Suspend the running coroutine, handing `values` to the pending
    /// resume.  Never returns `Ok`: the signal unwinds to the resume
    /// boundary, and the eventual resume arguments become the results of
    /// the native call that yielded.
    pub fn yield_values(&mut self, values: Vec<LuaValue>) -> Result<usize, Signal> {
        if self.nny > 0 {
            let msg = if self.is_main {
                "attempt to yield from outside a coroutine"
            } else {
                "attempt to yield across a native boundary"
            };
            return Err(self.raise(msg));
        }
        Err(Signal::Yield(values))
    }

    /// Feed resume arguments to the suspension point recorded by the last
    /// yield, shaped exactly as the interrupted call's results would have
    /// been.
    pub(crate) fn deliver_resume_results(&mut self, values: Vec<LuaValue>) -> Result<(), Signal> {
        let rp = match self.resume_point.take() {
            Some(rp) => rp,
            None => return Err(Signal::error_str("cannot resume coroutine (no pending yield)")),
        };
        self.stack.set_top(rp.result_slot);
        self.stack.check(values.len().max(rp.want.max(0) as usize))?;
        let n = values.len();
        for v in values {
            self.stack.push(v);
        }
        if rp.want != MULTRET {
            let want = rp.want as usize;
            if want != n {
                self.stack.set_top(rp.result_slot + want);
            }
            // back to the register ceiling of the interrupted script frame
            if let Some(ci) = self.frames.current() {
                if ci.is_script() {
                    let top = ci.top;
                    self.stack.set_top(top);
                }
            }
        }
        Ok(())
    }
}
