//! Cooperative coroutines.
//!
//! Each coroutine owns a full [`LuaState`] (stack, frames, open upvalues)
//! and shares the globals with every other thread of the same runtime.  A
//! yield unwinds the Rust call chain to [`Coroutine::resume`] as a
//! [`Signal::Yield`]; the suspended script frames stay intact on the
//! thread's own stack, so resuming is just re-entering the executor.

use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::call::Invoked;
use crate::error::Signal;
use crate::frame::MULTRET;
use crate::global::GlobalRef;
use crate::state::LuaState;
use crate::value::LuaValue;

/// Lifecycle of a coroutine.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadStatus {
    /// Created, body never entered.
    NotStarted,
    /// Currently executing (or the currently-hosting main thread).
    Running,
    /// Stopped at a yield, resumable.
    Suspended,
    /// Body returned; holds nothing further.
    Dead,
    /// Body raised; the error value is kept for inspection.
    ErrorDead(LuaValue),
}

/// Outcome of one [`Coroutine::resume`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// The body suspended, passing these values out.
    Yield(Vec<LuaValue>),
    /// The body finished with these results.
    Return(Vec<LuaValue>),
    /// The body (or the resume itself) failed.
    Error(LuaValue),
}

/// A thread of execution.  The body function sits at slot 0 of the thread's
/// stack from creation until the first resume consumes it.
#[derive(Debug)]
pub struct Coroutine {
    status: RwLock<ThreadStatus>,
    pub(crate) state: RwLock<LuaState>,
}

impl Coroutine {
    /// A fresh coroutine around `body`, which may be any callable value.
    pub fn new(g: GlobalRef, body: LuaValue) -> Arc<Coroutine> {
        let mut state = LuaState::new_coroutine(g);
        state.stack.push(body);
        Arc::new(Coroutine {
            status: RwLock::new(ThreadStatus::NotStarted),
            state: RwLock::new(state),
        })
    }

    /// The main thread: never resumable, hosts top-level execution.
    pub(crate) fn main_thread(g: GlobalRef) -> Arc<Coroutine> {
        Arc::new(Coroutine {
            status: RwLock::new(ThreadStatus::Running),
            state: RwLock::new(LuaState::new_main(g)),
        })
    }

    pub fn status(&self) -> ThreadStatus {
        crate::lock_read(&self.status).clone()
    }

    pub fn is_resumable(&self) -> bool {
        matches!(
            self.status(),
            ThreadStatus::NotStarted | ThreadStatus::Suspended
        )
    }

    /// Run the coroutine until it yields, returns, or fails.
    ///
    /// On the first resume `args` become the body's arguments; on later
    /// resumes they become the results of the call that yielded.  The resume
    /// boundary is implicitly protected: an error inside the body kills the
    /// coroutine and comes back as [`Resume::Error`], it never unwinds the
    /// resumer.
    pub fn resume(self: &Arc<Self>, args: Vec<LuaValue>) -> Resume {
        // The status gate runs before the state lock is taken, so resuming
        // a coroutine from inside itself reports an error instead of
        // deadlocking on its own state.
        let starting = {
            let mut status = crate::lock_write(&self.status);
            match &*status {
                ThreadStatus::NotStarted => {
                    *status = ThreadStatus::Running;
                    true
                }
                ThreadStatus::Suspended => {
                    *status = ThreadStatus::Running;
                    false
                }
                ThreadStatus::Running => {
                    return Resume::Error(LuaValue::Str(
                        "cannot resume non-suspended coroutine".into(),
                    ))
                }
                ThreadStatus::Dead | ThreadStatus::ErrorDead(_) => {
                    return Resume::Error(LuaValue::Str("cannot resume dead coroutine".into()))
                }
            }
        };
        trace!(starting, n_args = args.len(), "resume");

        let mut st = crate::lock_write(&self.state);
        let result = if starting {
            Self::start(&mut st, args)
        } else {
            Self::reenter(&mut st, args)
        };

        let mut status = crate::lock_write(&self.status);
        match result {
            Ok(()) => {
                let n = st.stack.top();
                let results = st.stack.pop_n(n);
                *status = ThreadStatus::Dead;
                trace!(n_results = results.len(), "coroutine finished");
                Resume::Return(results)
            }
            Err(Signal::Yield(values)) => {
                *status = ThreadStatus::Suspended;
                trace!(n_values = values.len(), "coroutine suspended");
                Resume::Yield(values)
            }
            Err(Signal::Error(e)) => {
                // unwind the thread completely; the cells keep their last
                // values for any closure that escaped before the failure
                st.close_upvalues(0);
                st.frames.truncate(0);
                st.stack.set_top(0);
                *status = ThreadStatus::ErrorDead(e.clone());
                trace!("coroutine failed");
                Resume::Error(e)
            }
        }
    }

    fn start(st: &mut LuaState, args: Vec<LuaValue>) -> Result<(), Signal> {
        st.stack.check(args.len())?;
        for a in args {
            st.stack.push(a);
        }
        match st.pre_call(0, MULTRET)? {
            Invoked::Script => st.execute(1),
            // a native body already ran to completion (or suspended)
            Invoked::Native => Ok(()),
        }
    }

    fn reenter(st: &mut LuaState, args: Vec<LuaValue>) -> Result<(), Signal> {
        st.deliver_resume_results(args)?;
        st.execute(1)
    }
}
