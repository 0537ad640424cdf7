//! Call frames.  `CallInfo` records one activation; `Frames` keeps them in
//! an arena indexed by depth so entering and leaving calls never reallocates
//! on the hot path.

use std::sync::Arc;

use crate::closure::LuaClosure;
use crate::value::LuaValue;

/// Result-count wildcard: keep every result the callee returns.
pub const MULTRET: i32 = -1;

/// Convert an instruction operand count (`None` = all) into the internal
/// signed convention.
pub fn count_to_want(count: Option<u8>) -> i32 {
    match count {
        Some(n) => n as i32,
        None => MULTRET,
    }
}

/// One activation record.  `closure` is `None` for host-function frames.
#[derive(Debug)]
pub struct CallInfo {
    pub closure: Option<Arc<LuaClosure>>,
    /// Absolute slot holding the callee value.
    pub func: usize,
    /// First register (`func + 1` for script frames).
    pub base: usize,
    /// Frame ceiling: `base + max_registers` for script frames.
    pub top: usize,
    /// Results expected by the caller; `MULTRET` keeps them all.
    pub want: i32,
    pub pc: usize,
    /// Extra arguments beyond the declared parameters, when the callee is
    /// vararg.
    pub varargs: Vec<LuaValue>,
    /// Number of tail calls that reused this frame, for tracebacks.
    pub tail_calls: u32,
}

impl CallInfo {
    pub fn script(closure: Arc<LuaClosure>, func: usize, base: usize, want: i32) -> Self {
        let top = base + closure.proto.max_registers as usize;
        CallInfo {
            closure: Some(closure),
            func,
            base,
            top,
            want,
            pc: 0,
            varargs: Vec::new(),
            tail_calls: 0,
        }
    }

    pub fn native(func: usize, base: usize, top: usize, want: i32) -> Self {
        CallInfo {
            closure: None,
            func,
            base,
            top,
            want,
            pc: 0,
            varargs: Vec::new(),
            tail_calls: 0,
        }
    }

    pub fn is_script(&self) -> bool {
        self.closure.is_some()
    }

    /// Source line for the instruction at `pc - 1` (the one being executed).
    pub fn current_line(&self) -> Option<u32> {
        let closure = self.closure.as_ref()?;
        Some(closure.proto.line_at(self.pc.saturating_sub(1)))
    }
}

/// Frame arena.  `depth` is the number of live frames; slots above it keep
/// their allocation for reuse.
#[derive(Debug, Default)]
pub struct Frames {
    frames: Vec<CallInfo>,
    depth: usize,
}

impl Frames {
    pub fn new() -> Self {
        Frames::default()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn push(&mut self, ci: CallInfo) {
        if self.depth < self.frames.len() {
            self.frames[self.depth] = ci;
        } else {
            self.frames.push(ci);
        }
        self.depth += 1;
    }

    /// Drop the innermost frame.  Its slot stays allocated.
    pub fn pop(&mut self) {
        debug_assert!(self.depth > 0, "pop on empty frame arena");
        self.depth = self.depth.saturating_sub(1);
    }

    /// Unwind to `depth` live frames.
    pub fn truncate(&mut self, depth: usize) {
        debug_assert!(depth <= self.depth);
        self.depth = depth.min(self.depth);
    }

    pub fn current(&self) -> Option<&CallInfo> {
        self.depth.checked_sub(1).map(|i| &self.frames[i])
    }

    pub fn current_mut(&mut self) -> Option<&mut CallInfo> {
        self.depth.checked_sub(1).map(move |i| &mut self.frames[i])
    }

    pub fn get(&self, level: usize) -> Option<&CallInfo> {
        if level < self.depth {
            Some(&self.frames[level])
        } else {
            None
        }
    }

    /// Live frames, outermost first.
    pub fn iter(&self) -> impl Iterator<Item = &CallInfo> {
        self.frames[..self.depth].iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_reuses_slots() {
        let mut frames = Frames::new();
        frames.push(CallInfo::native(0, 1, 21, MULTRET));
        frames.push(CallInfo::native(5, 6, 26, 2));
        assert_eq!(frames.depth(), 2);
        assert_eq!(frames.current().map(|ci| ci.func), Some(5));
        frames.pop();
        assert_eq!(frames.depth(), 1);
        frames.push(CallInfo::native(7, 8, 28, 0));
        assert_eq!(frames.depth(), 2);
        assert_eq!(frames.current().map(|ci| ci.want), Some(0));
    }

    #[test]
    fn truncate_unwinds_to_a_boundary() {
        let mut frames = Frames::new();
        for i in 0..4 {
            frames.push(CallInfo::native(i, i + 1, i + 21, MULTRET));
        }
        frames.truncate(1);
        assert_eq!(frames.depth(), 1);
        assert_eq!(frames.current().map(|ci| ci.func), Some(0));
        assert_eq!(frames.iter().count(), 1);
    }

    #[test]
    fn count_conversion() {
        assert_eq!(count_to_want(Some(0)), 0);
        assert_eq!(count_to_want(Some(3)), 3);
        assert_eq!(count_to_want(None), MULTRET);
    }
}
