//! Per-thread execution state: one value stack, one frame arena, the open
//! upvalue cells rooted in that stack, and a handle to the shared globals.

use std::fmt;

use crate::closure::Upvalue;
use crate::error::Signal;
use crate::frame::Frames;
use crate::global::GlobalRef;
use crate::stack::Stack;
use crate::value::LuaValue;

/// Where the results of a suspended native call land when the thread is
/// resumed, and how many the caller expected.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResumePoint {
    pub result_slot: usize,
    pub want: i32,
}

#[derive(Debug)]
pub struct LuaState {
    pub(crate) stack: Stack,
    pub(crate) frames: Frames,
    pub(crate) g: GlobalRef,
    /// Open cells of this thread, unordered.
    pub(crate) open_upvalues: Vec<Upvalue>,
    /// Non-yieldable nesting; a yield is legal only at zero.  The main
    /// thread starts at one and never drops below it.
    pub(crate) nny: u32,
    /// Rust-recursion depth from re-entrant calls (host API, metamethods).
    pub(crate) native_depth: u32,
    pub(crate) resume_point: Option<ResumePoint>,
    pub(crate) is_main: bool,
}

impl LuaState {
    pub(crate) fn new_main(g: GlobalRef) -> Self {
        Self::with_nny(g, 1, true)
    }

    pub(crate) fn new_coroutine(g: GlobalRef) -> Self {
        Self::with_nny(g, 0, false)
    }

    fn with_nny(g: GlobalRef, nny: u32, is_main: bool) -> Self {
        let max_stack = g.options.max_stack;
        LuaState {
            stack: Stack::new(max_stack),
            frames: Frames::new(),
            g,
            open_upvalues: Vec::new(),
            nny,
            native_depth: 0,
            resume_point: None,
            is_main,
        }
    }

    pub fn globals(&self) -> crate::value::TableRef {
        self.g.globals.clone()
    }

    /// First register of the running frame; absolute zero outside any call
    /// (the host working directly on the stack).
    pub(crate) fn base(&self) -> usize {
        self.frames.current().map(|ci| ci.base).unwrap_or(0)
    }

    pub fn is_yieldable(&self) -> bool {
        self.nny == 0
    }

    pub fn call_depth(&self) -> usize {
        self.frames.depth()
    }

    // ── Open upvalues ───────────────────────────────────────────────────────

    /// The cell aliasing `slot`, creating it if no closure captured that
    /// slot yet.  Two captures of one live local always share a cell.
    pub(crate) fn find_or_create_upvalue(&mut self, slot: usize) -> Upvalue {
        for uv in &self.open_upvalues {
            if uv.open_slot() == Some(slot) {
                return uv.clone();
            }
        }
        let uv = Upvalue::open(slot);
        self.open_upvalues.push(uv.clone());
        uv
    }

    /// Close every open cell rooted at `from` or above, moving the current
    /// slot values into the cells.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            match self.open_upvalues[i].open_slot() {
                Some(slot) if slot >= from => {
                    let value = self.stack.get(slot);
                    let uv = self.open_upvalues.swap_remove(i);
                    uv.close(value);
                }
                _ => i += 1,
            }
        }
    }

    // ── Errors ──────────────────────────────────────────────────────────────

    /// Build a runtime error, prefixed with the current script position when
    /// one is known.  Native frames add no position, as in the reference
    /// implementation.
    pub fn raise(&self, msg: impl fmt::Display) -> Signal {
        match self.position() {
            Some((source, line)) => {
                Signal::Error(LuaValue::Str(format!("{source}:{line}: {msg}").into()))
            }
            None => Signal::Error(LuaValue::Str(msg.to_string().into())),
        }
    }

    /// Source and line of the instruction being executed, if the innermost
    /// frame is a script frame.
    pub fn position(&self) -> Option<(std::sync::Arc<str>, u32)> {
        let ci = self.frames.current()?;
        let closure = ci.closure.as_ref()?;
        let line = ci.current_line()?;
        Some((closure.proto.source.clone(), line))
    }
}
