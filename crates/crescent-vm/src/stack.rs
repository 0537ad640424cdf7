//! The value stack of a thread: one growable slot vector shared by every
//! frame, with an explicit top.  Slots at or above the top are dead and
//! always hold nil so dropped references are released promptly.

use crate::error::Signal;
use crate::value::LuaValue;

const INITIAL_SLOTS: usize = 64;

#[derive(Debug)]
pub struct Stack {
    slots: Vec<LuaValue>,
    top: usize,
    limit: usize,
}

impl Stack {
    pub fn new(limit: usize) -> Self {
        Stack {
            slots: vec![LuaValue::Nil; INITIAL_SLOTS.min(limit.max(1))],
            top: 0,
            limit,
        }
    }

    pub fn top(&self) -> usize {
        self.top
    }

    /// Move the top.  Slots above the top always hold nil: lowering clears
    /// the dropped range, so raising exposes fresh nils.
    pub fn set_top(&mut self, new_top: usize) {
        if new_top > self.slots.len() {
            self.slots.resize(new_top, LuaValue::Nil);
        }
        for slot in &mut self.slots[new_top..self.top.max(new_top)] {
            *slot = LuaValue::Nil;
        }
        self.top = new_top;
    }

    /// Reserve room for `extra` slots above the top.  This is the frame-entry
    /// overflow check; ordinary pushes past it only grow the vector.
    pub fn check(&mut self, extra: usize) -> Result<(), Signal> {
        let needed = self.top + extra;
        if needed > self.limit {
            return Err(Signal::error_str("stack overflow"));
        }
        if needed > self.slots.len() {
            self.slots.resize(needed, LuaValue::Nil);
        }
        Ok(())
    }

    pub fn push(&mut self, value: LuaValue) {
        if self.top == self.slots.len() {
            self.slots.resize(self.top + 1, LuaValue::Nil);
        }
        self.slots[self.top] = value;
        self.top += 1;
    }

    pub fn pop(&mut self) -> LuaValue {
        if self.top == 0 {
            return LuaValue::Nil;
        }
        self.top -= 1;
        std::mem::replace(&mut self.slots[self.top], LuaValue::Nil)
    }

    pub fn pop_n(&mut self, n: usize) -> Vec<LuaValue> {
        let n = n.min(self.top);
        let start = self.top - n;
        let mut out = Vec::with_capacity(n);
        for slot in &mut self.slots[start..self.top] {
            out.push(std::mem::replace(slot, LuaValue::Nil));
        }
        self.top = start;
        out
    }

    /// Absolute read; nil at and above the top.
    pub fn get(&self, abs: usize) -> LuaValue {
        if abs < self.top {
            self.slots[abs].clone()
        } else {
            LuaValue::Nil
        }
    }

    /// Absolute write below the top.
    pub fn set(&mut self, abs: usize, value: LuaValue) {
        debug_assert!(abs < self.top, "write above stack top");
        if abs < self.slots.len() {
            self.slots[abs] = value;
        }
    }

    /// Whole slot slice, for upvalue cells that index absolutely.
    pub fn slots(&self) -> &[LuaValue] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [LuaValue] {
        &mut self.slots
    }

    /// Shift `[abs..top)` up one and drop `value` into the gap.
    pub fn insert(&mut self, abs: usize, value: LuaValue) {
        debug_assert!(abs <= self.top);
        self.push(value);
        self.slots[abs..self.top].rotate_right(1);
    }

    /// Remove the slot at `abs`, shifting everything above it down.
    pub fn remove(&mut self, abs: usize) -> LuaValue {
        debug_assert!(abs < self.top);
        self.slots[abs..self.top].rotate_left(1);
        self.top -= 1;
        std::mem::replace(&mut self.slots[self.top], LuaValue::Nil)
    }

    /// Rotate `[abs..top)` by `n` positions: positive toward the top,
    /// negative toward the bottom.
    pub fn rotate(&mut self, abs: usize, n: isize) {
        debug_assert!(abs <= self.top);
        let window = &mut self.slots[abs..self.top];
        if window.is_empty() {
            return;
        }
        let n = n.rem_euclid(window.len() as isize) as usize;
        window.rotate_right(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(n: i64) -> LuaValue {
        LuaValue::Integer(n)
    }

    #[test]
    fn push_pop_and_top() {
        let mut s = Stack::new(100);
        s.push(int(1));
        s.push(int(2));
        assert_eq!(s.top(), 2);
        assert_eq!(s.pop(), int(2));
        assert_eq!(s.pop(), int(1));
        assert_eq!(s.pop(), LuaValue::Nil);
        assert_eq!(s.top(), 0);
    }

    #[test]
    fn set_top_fills_and_clears() {
        let mut s = Stack::new(100);
        s.push(int(1));
        s.set_top(3);
        assert_eq!(s.get(1), LuaValue::Nil);
        assert_eq!(s.get(2), LuaValue::Nil);
        s.set(2, int(9));
        s.set_top(1);
        s.set_top(3);
        // the dropped slot was cleared, not resurrected
        assert_eq!(s.get(2), LuaValue::Nil);
    }

    #[test]
    fn check_enforces_the_limit() {
        let mut s = Stack::new(8);
        s.set_top(6);
        assert!(s.check(2).is_ok());
        assert!(s.check(3).is_err());
    }

    #[test]
    fn insert_and_remove_shift_the_window() {
        let mut s = Stack::new(100);
        for i in 1..=4 {
            s.push(int(i));
        }
        s.insert(1, int(99));
        assert_eq!(s.get(1), int(99));
        assert_eq!(s.get(2), int(2));
        assert_eq!(s.get(4), int(4));
        assert_eq!(s.top(), 5);
        assert_eq!(s.remove(1), int(99));
        assert_eq!(s.get(1), int(2));
        assert_eq!(s.top(), 4);
    }

    #[test]
    fn rotate_moves_toward_the_top_for_positive_n() {
        let mut s = Stack::new(100);
        for i in 1..=4 {
            s.push(int(i));
        }
        s.rotate(0, 1);
        assert_eq!(s.get(0), int(4));
        assert_eq!(s.get(1), int(1));
        s.rotate(0, -1);
        assert_eq!(s.get(0), int(1));
        assert_eq!(s.get(3), int(4));
    }

    #[test]
    fn pop_n_preserves_order() {
        let mut s = Stack::new(100);
        for i in 1..=3 {
            s.push(int(i));
        }
        assert_eq!(s.pop_n(2), vec![int(2), int(3)]);
        assert_eq!(s.top(), 1);
    }
}
