//! The instruction executor.
//!
//! One Rust activation of [`LuaState::execute`] drives *all* script frames at
//! or above its floor: script-to-script calls push a frame and loop back to
//! the dispatch instead of recursing, so script recursion depth is bounded by
//! the value stack, not the Rust stack.  Rust recursion happens only where a
//! native re-enters the engine (host API, metamethod handlers).

use std::sync::{Arc, RwLock};

use crescent_core::{OpCode, Proto, Rk, UpvalueDesc};

use crate::call::{Invoked, TailOutcome};
use crate::closure::{LuaClosure, Upvalue};
use crate::error::Signal;
use crate::frame::{count_to_want, MULTRET};
use crate::state::LuaState;
use crate::table::LuaTable;
use crate::value::{str_to_number, LuaValue};

/// Offsets are relative to the instruction after the current one.
fn jump(pc: usize, offset: i16) -> usize {
    (pc as i64 + offset as i64).max(0) as usize
}

/// Numeric-for control values accept numbers and numeric strings, keeping
/// the integer/float distinction.
fn loop_number(v: &LuaValue) -> Option<LuaValue> {
    match v {
        LuaValue::Integer(_) | LuaValue::Float(_) => Some(v.clone()),
        LuaValue::Str(s) => str_to_number(s),
        _ => None,
    }
}

fn global_key(proto: &Proto, index: u16) -> LuaValue {
    proto
        .names
        .get(index as usize)
        .cloned()
        .map(LuaValue::Str)
        .unwrap_or(LuaValue::Nil)
}

impl LuaState {
    fn reg(&self, base: usize, r: u8) -> LuaValue {
        self.stack.get(base + r as usize)
    }

    fn set_reg(&mut self, base: usize, r: u8, v: LuaValue) {
        self.stack.set(base + r as usize, v);
    }

    fn rk_value(&self, base: usize, proto: &Proto, rk: Rk) -> LuaValue {
        match rk {
            Rk::Reg(r) => self.reg(base, r),
            Rk::Const(i) => proto
                .constants
                .get(i as usize)
                .map(LuaValue::from_constant)
                .unwrap_or(LuaValue::Nil),
        }
    }

    /// Run script frames until the frame depth drops below `floor`.
    ///
    /// The program counter is committed to the frame before each instruction
    /// executes, so an error or a yield always leaves the frame resumable at
    /// the following instruction.
    pub(crate) fn execute(&mut self, floor: usize) -> Result<(), Signal> {
        'reentry: loop {
            if self.frames.depth() < floor {
                return Ok(());
            }
            let (closure, base, mut pc) = {
                let ci = match self.frames.current() {
                    Some(ci) => ci,
                    None => return Ok(()),
                };
                let closure = match &ci.closure {
                    Some(c) => c.clone(),
                    None => return Err(Signal::error_str("cannot execute a native frame")),
                };
                (closure, ci.base, ci.pc)
            };
            let proto = closure.proto.clone();

            loop {
                let inst = match proto.instructions.get(pc) {
                    Some(i) => *i,
                    None => {
                        return Err(self.raise("malformed function: execution ran past the code"))
                    }
                };
                pc += 1;
                if let Some(ci) = self.frames.current_mut() {
                    ci.pc = pc;
                }

                match inst {
                    // ── Loads and moves ─────────────────────────────────────
                    OpCode::LoadConst { dst, index } => {
                        let v = proto
                            .constants
                            .get(index as usize)
                            .map(LuaValue::from_constant)
                            .unwrap_or(LuaValue::Nil);
                        self.set_reg(base, dst, v);
                    }
                    OpCode::LoadNil { dst, count } => {
                        for i in 0..count as usize {
                            self.stack.set(base + dst as usize + i, LuaValue::Nil);
                        }
                    }
                    OpCode::LoadBool { dst, value, skip } => {
                        self.set_reg(base, dst, LuaValue::Boolean(value));
                        if skip {
                            pc += 1;
                        }
                    }
                    OpCode::Move { dst, src } => {
                        let v = self.reg(base, src);
                        self.set_reg(base, dst, v);
                    }

                    // ── Upvalues and closures ───────────────────────────────
                    OpCode::GetUpvalue { dst, index } => {
                        let v = match closure.upvalues.get(index as usize) {
                            Some(uv) => uv.get(self.stack.slots()),
                            None => LuaValue::Nil,
                        };
                        self.set_reg(base, dst, v);
                    }
                    OpCode::SetUpvalue { src, index } => {
                        let v = self.reg(base, src);
                        if let Some(uv) = closure.upvalues.get(index as usize) {
                            uv.set(self.stack.slots_mut(), v);
                        }
                    }
                    OpCode::CloseUpvalues { from } => {
                        self.close_upvalues(base + from as usize);
                    }
                    OpCode::Closure { dst, proto: pidx } => {
                        let child = match proto.protos.get(pidx as usize) {
                            Some(p) => p.clone(),
                            None => {
                                return Err(
                                    self.raise("malformed function: no such nested prototype")
                                )
                            }
                        };
                        let mut upvalues = Vec::with_capacity(child.upvalue_descs.len());
                        for desc in &child.upvalue_descs {
                            let uv = match *desc {
                                UpvalueDesc::Stack(r) => {
                                    self.find_or_create_upvalue(base + r as usize)
                                }
                                UpvalueDesc::Upvalue(i) => match closure.upvalues.get(i as usize)
                                {
                                    Some(u) => u.clone(),
                                    None => Upvalue::closed(LuaValue::Nil),
                                },
                            };
                            upvalues.push(uv);
                        }
                        let c = LuaClosure::new(child, upvalues);
                        self.set_reg(base, dst, LuaValue::Closure(Arc::new(c)));
                    }

                    // ── Globals ─────────────────────────────────────────────
                    OpCode::GetGlobal { dst, name } => {
                        let key = global_key(&proto, name);
                        let gt = LuaValue::Table(self.g.globals.clone());
                        let v = self.index_get(gt, key)?;
                        self.set_reg(base, dst, v);
                    }
                    OpCode::SetGlobal { src, name } => {
                        let key = global_key(&proto, name);
                        let v = self.reg(base, src);
                        let gt = LuaValue::Table(self.g.globals.clone());
                        self.index_set(gt, key, v)?;
                    }

                    // ── Tables ──────────────────────────────────────────────
                    OpCode::NewTable {
                        dst,
                        array_hint,
                        hash_hint,
                    } => {
                        let t = LuaTable::with_capacity(array_hint as usize, hash_hint as usize);
                        self.set_reg(base, dst, LuaValue::Table(Arc::new(RwLock::new(t))));
                    }
                    OpCode::GetTable { dst, table, key } => {
                        let t = self.reg(base, table);
                        let k = self.rk_value(base, &proto, key);
                        let v = self.index_get(t, k)?;
                        self.set_reg(base, dst, v);
                    }
                    OpCode::SetTable { table, key, value } => {
                        let t = self.reg(base, table);
                        let k = self.rk_value(base, &proto, key);
                        let v = self.rk_value(base, &proto, value);
                        self.index_set(t, k, v)?;
                    }
                    OpCode::SetList {
                        table,
                        count,
                        batch,
                    } => {
                        let tslot = base + table as usize;
                        let n = match count {
                            Some(c) => c as usize,
                            None => self.stack.top().saturating_sub(tslot + 1),
                        };
                        let tref = match self.stack.get(tslot) {
                            LuaValue::Table(t) => t,
                            _ => {
                                return Err(self.raise(
                                    "malformed function: list constructor target is not a table",
                                ))
                            }
                        };
                        let first = batch as usize * crescent_core::FIELDS_PER_FLUSH + 1;
                        {
                            let mut t = crate::lock_write(&tref);
                            for i in 0..n {
                                let v = self.stack.get(tslot + 1 + i);
                                t.put(LuaValue::Integer((first + i) as i64), v);
                            }
                        }
                        if count.is_none() {
                            // drop the expanded tail back to the register ceiling
                            let t = self.frames.current().map(|ci| ci.top);
                            if let Some(t) = t {
                                self.stack.set_top(t);
                            }
                        }
                    }

                    // ── Arithmetic, logic, length, concatenation ────────────
                    OpCode::Arith { op, dst, lhs, rhs } => {
                        let a = self.rk_value(base, &proto, lhs);
                        let b = self.rk_value(base, &proto, rhs);
                        let v = self.arith(op, a, b)?;
                        self.set_reg(base, dst, v);
                    }
                    OpCode::Unm { dst, src } => {
                        let v = self.unary_minus(self.reg(base, src))?;
                        self.set_reg(base, dst, v);
                    }
                    OpCode::BNot { dst, src } => {
                        let v = self.bitwise_not(self.reg(base, src))?;
                        self.set_reg(base, dst, v);
                    }
                    OpCode::Not { dst, src } => {
                        let v = LuaValue::Boolean(!self.reg(base, src).is_truthy());
                        self.set_reg(base, dst, v);
                    }
                    OpCode::Len { dst, src } => {
                        let v = self.length_of(self.reg(base, src))?;
                        self.set_reg(base, dst, v);
                    }
                    OpCode::Concat { dst, from, to } => {
                        let mut acc = self.reg(base, to);
                        let mut i = to;
                        while i > from {
                            i -= 1;
                            acc = self.concat_pair(self.reg(base, i), acc)?;
                        }
                        self.set_reg(base, dst, acc);
                    }

                    // ── Comparisons ─────────────────────────────────────────
                    OpCode::Eq { dst, lhs, rhs } => {
                        let a = self.rk_value(base, &proto, lhs);
                        let b = self.rk_value(base, &proto, rhs);
                        let v = self.values_equal(&a, &b)?;
                        self.set_reg(base, dst, LuaValue::Boolean(v));
                    }
                    OpCode::Lt { dst, lhs, rhs } => {
                        let a = self.rk_value(base, &proto, lhs);
                        let b = self.rk_value(base, &proto, rhs);
                        let v = self.less_than(&a, &b)?;
                        self.set_reg(base, dst, LuaValue::Boolean(v));
                    }
                    OpCode::Le { dst, lhs, rhs } => {
                        let a = self.rk_value(base, &proto, lhs);
                        let b = self.rk_value(base, &proto, rhs);
                        let v = self.less_equal(&a, &b)?;
                        self.set_reg(base, dst, LuaValue::Boolean(v));
                    }

                    // ── Jumps ───────────────────────────────────────────────
                    OpCode::Jump { offset } => {
                        pc = jump(pc, offset);
                    }
                    OpCode::JumpIfTrue { src, offset } => {
                        if self.reg(base, src).is_truthy() {
                            pc = jump(pc, offset);
                        }
                    }
                    OpCode::JumpIfFalse { src, offset } => {
                        if !self.reg(base, src).is_truthy() {
                            pc = jump(pc, offset);
                        }
                    }

                    // ── Numeric for ─────────────────────────────────────────
                    OpCode::ForPrep { base: fb, offset } => {
                        let b = base + fb as usize;
                        let init = loop_number(&self.stack.get(b))
                            .ok_or_else(|| self.raise("'for' initial value must be a number"))?;
                        let limit = loop_number(&self.stack.get(b + 1))
                            .ok_or_else(|| self.raise("'for' limit must be a number"))?;
                        let step = loop_number(&self.stack.get(b + 2))
                            .ok_or_else(|| self.raise("'for' step must be a number"))?;
                        match (init, limit, step) {
                            (
                                LuaValue::Integer(i),
                                LuaValue::Integer(l),
                                LuaValue::Integer(s),
                            ) => {
                                if s == 0 {
                                    return Err(self.raise("'for' step is zero"));
                                }
                                // pre-subtract; the loop head adds it back
                                self.stack.set(b, LuaValue::Integer(i.wrapping_sub(s)));
                                self.stack.set(b + 1, LuaValue::Integer(l));
                                self.stack.set(b + 2, LuaValue::Integer(s));
                            }
                            (init, limit, step) => {
                                // any float control value makes a float loop
                                let i = init.to_float().unwrap_or(0.0);
                                let l = limit.to_float().unwrap_or(0.0);
                                let s = step.to_float().unwrap_or(0.0);
                                if s == 0.0 {
                                    return Err(self.raise("'for' step is zero"));
                                }
                                self.stack.set(b, LuaValue::Float(i - s));
                                self.stack.set(b + 1, LuaValue::Float(l));
                                self.stack.set(b + 2, LuaValue::Float(s));
                            }
                        }
                        pc = jump(pc, offset);
                    }
                    OpCode::ForLoop { base: fb, offset } => {
                        let b = base + fb as usize;
                        match (
                            self.stack.get(b),
                            self.stack.get(b + 1),
                            self.stack.get(b + 2),
                        ) {
                            (
                                LuaValue::Integer(i),
                                LuaValue::Integer(l),
                                LuaValue::Integer(s),
                            ) => {
                                let next = i.wrapping_add(s);
                                if if s > 0 { next <= l } else { l <= next } {
                                    self.stack.set(b, LuaValue::Integer(next));
                                    self.stack.set(b + 3, LuaValue::Integer(next));
                                    pc = jump(pc, offset);
                                }
                            }
                            (i, l, s) => {
                                let i = i.to_float().unwrap_or(f64::NAN);
                                let l = l.to_float().unwrap_or(f64::NAN);
                                let s = s.to_float().unwrap_or(f64::NAN);
                                let next = i + s;
                                if if s > 0.0 { next <= l } else { l <= next } {
                                    self.stack.set(b, LuaValue::Float(next));
                                    self.stack.set(b + 3, LuaValue::Float(next));
                                    pc = jump(pc, offset);
                                }
                            }
                        }
                    }

                    // ── Generic for ─────────────────────────────────────────
                    OpCode::TForCall { base: fb, want } => {
                        let b = base + fb as usize;
                        let call_at = b + 3;
                        for i in 0..3 {
                            let v = self.stack.get(b + i);
                            self.stack.set(call_at + i, v);
                        }
                        self.stack.set_top(call_at + 3);
                        match self.pre_call(call_at, want as i32)? {
                            Invoked::Script => continue 'reentry,
                            Invoked::Native => {
                                let t = self.frames.current().map(|ci| ci.top);
                                if let Some(t) = t {
                                    self.stack.set_top(t);
                                }
                            }
                        }
                    }
                    OpCode::TForLoop { base: fb, offset } => {
                        let b = base + fb as usize;
                        let first = self.stack.get(b + 3);
                        if !first.is_nil() {
                            self.stack.set(b + 2, first);
                            pc = jump(pc, offset);
                        }
                    }

                    // ── Varargs ─────────────────────────────────────────────
                    OpCode::VarArg { dst, want } => {
                        let varargs = self
                            .frames
                            .current()
                            .map(|ci| ci.varargs.clone())
                            .unwrap_or_default();
                        let d = base + dst as usize;
                        match want {
                            Some(w) => {
                                for i in 0..w as usize {
                                    let v = varargs.get(i).cloned().unwrap_or(LuaValue::Nil);
                                    self.stack.set(d + i, v);
                                }
                            }
                            None => {
                                let n = varargs.len();
                                let extra = (d + n).saturating_sub(self.stack.top());
                                self.stack.check(extra)?;
                                self.stack.set_top(d + n);
                                for (i, v) in varargs.into_iter().enumerate() {
                                    self.stack.set(d + i, v);
                                }
                            }
                        }
                    }

                    // ── Calls and returns ───────────────────────────────────
                    OpCode::Call {
                        func,
                        args,
                        results,
                    } => {
                        let funcabs = base + func as usize;
                        if let Some(n) = args {
                            self.stack.set_top(funcabs + 1 + n as usize);
                        }
                        match self.pre_call(funcabs, count_to_want(results))? {
                            Invoked::Script => continue 'reentry,
                            Invoked::Native => {
                                if results.is_some() {
                                    let t = self.frames.current().map(|ci| ci.top);
                                    if let Some(t) = t {
                                        self.stack.set_top(t);
                                    }
                                }
                            }
                        }
                    }
                    OpCode::TailCall { func, args } => {
                        let funcabs = base + func as usize;
                        if let Some(n) = args {
                            self.stack.set_top(funcabs + 1 + n as usize);
                        }
                        self.close_upvalues(base);
                        let want = self.frames.current().map(|ci| ci.want).unwrap_or(MULTRET);
                        match self.tail_call(funcabs)? {
                            TailOutcome::Reentered => continue 'reentry,
                            TailOutcome::Returned => {
                                if self.frames.depth() < floor {
                                    return Ok(());
                                }
                                if want != MULTRET {
                                    let t = self.frames.current().map(|ci| ci.top);
                                    if let Some(t) = t {
                                        self.stack.set_top(t);
                                    }
                                }
                                continue 'reentry;
                            }
                        }
                    }
                    OpCode::Return { first, count } => {
                        let first_abs = base + first as usize;
                        let n = match count {
                            Some(c) => c as usize,
                            None => self.stack.top().saturating_sub(first_abs),
                        };
                        self.close_upvalues(base);
                        let (_, want) = self.pos_call(first_abs, n);
                        if self.frames.depth() < floor {
                            return Ok(());
                        }
                        if want != MULTRET {
                            // the caller resumes with its register window intact
                            let t = self.frames.current().map(|ci| ci.top);
                            if let Some(t) = t {
                                self.stack.set_top(t);
                            }
                        }
                        continue 'reentry;
                    }

                    op => {
                        return Err(
                            self.raise(format!("malformed function: unhandled instruction {op:?}"))
                        )
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::NativeClosure;
    use crate::global::GlobalState;
    use crate::lua::Options;
    use crescent_core::{ArithOp, Constant, ProtoBuilder};

    fn state() -> LuaState {
        LuaState::new_main(GlobalState::new(Options::default()))
    }

    fn int(n: i64) -> LuaValue {
        LuaValue::Integer(n)
    }

    fn run(proto: Proto, args: Vec<LuaValue>) -> Result<Vec<LuaValue>, Signal> {
        let mut st = state();
        run_in(&mut st, proto, args)
    }

    fn run_in(
        st: &mut LuaState,
        proto: Proto,
        args: Vec<LuaValue>,
    ) -> Result<Vec<LuaValue>, Signal> {
        let closure = Arc::new(LuaClosure::new(Arc::new(proto), Vec::new()));
        let func = st.stack.top();
        st.stack.push(LuaValue::Closure(closure));
        for a in args {
            st.stack.push(a);
        }
        st.call_value(func, MULTRET)?;
        let n = st.stack.top() - func;
        Ok(st.stack.pop_n(n))
    }

    #[test]
    fn arithmetic_over_constants() {
        // return (2 + 3) * 4
        let mut b = ProtoBuilder::new("arith");
        let k2 = b.add_constant(Constant::Integer(2));
        let k3 = b.add_constant(Constant::Integer(3));
        let k4 = b.add_constant(Constant::Integer(4));
        b.max_registers = 2;
        b.emit(OpCode::Arith {
            op: ArithOp::Add,
            dst: 0,
            lhs: Rk::Const(k2),
            rhs: Rk::Const(k3),
        });
        b.emit(OpCode::Arith {
            op: ArithOp::Mul,
            dst: 1,
            lhs: Rk::Reg(0),
            rhs: Rk::Const(k4),
        });
        b.emit(OpCode::Return {
            first: 1,
            count: Some(1),
        });
        assert_eq!(run(b.finish(), vec![]).unwrap(), vec![int(20)]);
    }

    #[test]
    fn integer_for_loop_sums() {
        // s = 0; for i = 1, 5 do s = s + i end; return s
        // r0 = accumulator, r1..r3 = control, r4 = loop variable
        let mut b = ProtoBuilder::new("loop");
        let k0 = b.add_constant(Constant::Integer(0));
        let k1 = b.add_constant(Constant::Integer(1));
        let k5 = b.add_constant(Constant::Integer(5));
        b.max_registers = 5;
        b.emit(OpCode::LoadConst { dst: 0, index: k0 });
        b.emit(OpCode::LoadConst { dst: 1, index: k1 });
        b.emit(OpCode::LoadConst { dst: 2, index: k5 });
        b.emit(OpCode::LoadConst { dst: 3, index: k1 });
        b.emit(OpCode::ForPrep { base: 1, offset: 1 });
        b.emit(OpCode::Arith {
            op: ArithOp::Add,
            dst: 0,
            lhs: Rk::Reg(0),
            rhs: Rk::Reg(4),
        });
        b.emit(OpCode::ForLoop {
            base: 1,
            offset: -2,
        });
        b.emit(OpCode::Return {
            first: 0,
            count: Some(1),
        });
        assert_eq!(run(b.finish(), vec![]).unwrap(), vec![int(15)]);
    }

    #[test]
    fn float_for_loop_when_any_control_is_float() {
        // for i = 1, 2.5 do n = n + 1 end
        let mut b = ProtoBuilder::new("floop");
        let k0 = b.add_constant(Constant::Integer(0));
        let k1 = b.add_constant(Constant::Integer(1));
        let klim = b.add_constant(Constant::Float(2.5));
        b.max_registers = 5;
        b.emit(OpCode::LoadConst { dst: 0, index: k0 });
        b.emit(OpCode::LoadConst { dst: 1, index: k1 });
        b.emit(OpCode::LoadConst {
            dst: 2,
            index: klim,
        });
        b.emit(OpCode::LoadConst { dst: 3, index: k1 });
        b.emit(OpCode::ForPrep { base: 1, offset: 1 });
        b.emit(OpCode::Arith {
            op: ArithOp::Add,
            dst: 0,
            lhs: Rk::Reg(0),
            rhs: Rk::Const(k1),
        });
        b.emit(OpCode::ForLoop {
            base: 1,
            offset: -2,
        });
        b.emit(OpCode::Return {
            first: 0,
            count: Some(1),
        });
        // runs for 1.0 and 2.0
        assert_eq!(run(b.finish(), vec![]).unwrap(), vec![int(2)]);
    }

    #[test]
    fn zero_step_is_an_error() {
        let mut b = ProtoBuilder::new("zstep");
        let k1 = b.add_constant(Constant::Integer(1));
        let k0 = b.add_constant(Constant::Integer(0));
        b.max_registers = 4;
        b.emit(OpCode::LoadConst { dst: 0, index: k1 });
        b.emit(OpCode::LoadConst { dst: 1, index: k1 });
        b.emit(OpCode::LoadConst { dst: 2, index: k0 });
        b.emit(OpCode::ForPrep { base: 0, offset: 0 });
        b.emit(OpCode::Return {
            first: 0,
            count: Some(0),
        });
        let err = run(b.finish(), vec![]).unwrap_err();
        match err {
            Signal::Error(v) => assert!(v.to_string().contains("'for' step is zero")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn script_calls_script_with_fixed_results() {
        // child: return a + b
        let mut c = ProtoBuilder::new("child");
        c.param_count = 2;
        c.max_registers = 3;
        c.emit(OpCode::Arith {
            op: ArithOp::Add,
            dst: 2,
            lhs: Rk::Reg(0),
            rhs: Rk::Reg(1),
        });
        c.emit(OpCode::Return {
            first: 2,
            count: Some(1),
        });
        let child = Arc::new(c.finish());

        // main: return child(10, 32)
        let mut b = ProtoBuilder::new("main");
        let p = b.add_proto(child);
        let k10 = b.add_constant(Constant::Integer(10));
        let k32 = b.add_constant(Constant::Integer(32));
        b.max_registers = 3;
        b.emit(OpCode::Closure { dst: 0, proto: p });
        b.emit(OpCode::LoadConst { dst: 1, index: k10 });
        b.emit(OpCode::LoadConst { dst: 2, index: k32 });
        b.emit(OpCode::Call {
            func: 0,
            args: Some(2),
            results: Some(1),
        });
        b.emit(OpCode::Return {
            first: 0,
            count: Some(1),
        });
        assert_eq!(run(b.finish(), vec![]).unwrap(), vec![int(42)]);
    }

    #[test]
    fn open_call_feeds_multret_return() {
        // child: return 1, 2, 3
        let mut c = ProtoBuilder::new("three");
        let k1 = c.add_constant(Constant::Integer(1));
        let k2 = c.add_constant(Constant::Integer(2));
        let k3 = c.add_constant(Constant::Integer(3));
        c.max_registers = 3;
        c.emit(OpCode::LoadConst { dst: 0, index: k1 });
        c.emit(OpCode::LoadConst { dst: 1, index: k2 });
        c.emit(OpCode::LoadConst { dst: 2, index: k3 });
        c.emit(OpCode::Return {
            first: 0,
            count: Some(3),
        });
        let child = Arc::new(c.finish());

        // main: return three()
        let mut b = ProtoBuilder::new("main");
        let p = b.add_proto(child);
        b.max_registers = 1;
        b.emit(OpCode::Closure { dst: 0, proto: p });
        b.emit(OpCode::Call {
            func: 0,
            args: Some(0),
            results: None,
        });
        b.emit(OpCode::Return {
            first: 0,
            count: None,
        });
        assert_eq!(
            run(b.finish(), vec![]).unwrap(),
            vec![int(1), int(2), int(3)]
        );
    }

    #[test]
    fn closures_share_captured_locals() {
        // local n = 0
        // inc = closure over n: n = n + 1; return n
        // call it twice, return n from the outer frame via the cell
        let mut c = ProtoBuilder::new("inc");
        let k1 = c.add_constant(Constant::Integer(1));
        c.max_registers = 1;
        c.upvalue_descs.push(UpvalueDesc::Stack(0));
        c.emit(OpCode::GetUpvalue { dst: 0, index: 0 });
        c.emit(OpCode::Arith {
            op: ArithOp::Add,
            dst: 0,
            lhs: Rk::Reg(0),
            rhs: Rk::Const(k1),
        });
        c.emit(OpCode::SetUpvalue { src: 0, index: 0 });
        c.emit(OpCode::Return {
            first: 0,
            count: Some(1),
        });
        let inc = Arc::new(c.finish());

        let mut b = ProtoBuilder::new("main");
        let p = b.add_proto(inc);
        let k0 = b.add_constant(Constant::Integer(0));
        b.max_registers = 3;
        b.emit(OpCode::LoadConst { dst: 0, index: k0 });
        b.emit(OpCode::Closure { dst: 1, proto: p });
        b.emit(OpCode::Move { dst: 2, src: 1 });
        b.emit(OpCode::Call {
            func: 2,
            args: Some(0),
            results: Some(0),
        });
        b.emit(OpCode::Move { dst: 2, src: 1 });
        b.emit(OpCode::Call {
            func: 2,
            args: Some(0),
            results: Some(1),
        });
        b.emit(OpCode::Move { dst: 1, src: 2 });
        // r0 still aliases the open cell: the closure's writes are visible
        b.emit(OpCode::Return {
            first: 0,
            count: Some(2),
        });
        assert_eq!(run(b.finish(), vec![]).unwrap(), vec![int(2), int(2)]);
    }

    #[test]
    fn vararg_expansion_and_fixed_copy() {
        // function(...) local a = select-first(...); return a, ...
        let mut b = ProtoBuilder::new("va");
        b.is_vararg = true;
        b.max_registers = 2;
        b.emit(OpCode::VarArg {
            dst: 0,
            want: Some(1),
        });
        b.emit(OpCode::VarArg { dst: 1, want: None });
        b.emit(OpCode::Return {
            first: 0,
            count: None,
        });
        assert_eq!(
            run(b.finish(), vec![int(7), int(8)]).unwrap(),
            vec![int(7), int(7), int(8)]
        );
    }

    #[test]
    fn table_constructor_and_indexing() {
        // t = {10, 20, 30}; t["k"] = t[2]; return t["k"], #t
        let mut b = ProtoBuilder::new("tbl");
        let k10 = b.add_constant(Constant::Integer(10));
        let k20 = b.add_constant(Constant::Integer(20));
        let k30 = b.add_constant(Constant::Integer(30));
        let k2 = b.add_constant(Constant::Integer(2));
        let kk = b.add_constant(Constant::Str("k".into()));
        b.max_registers = 6;
        b.emit(OpCode::NewTable {
            dst: 0,
            array_hint: 3,
            hash_hint: 0,
        });
        b.emit(OpCode::LoadConst { dst: 1, index: k10 });
        b.emit(OpCode::LoadConst { dst: 2, index: k20 });
        b.emit(OpCode::LoadConst { dst: 3, index: k30 });
        b.emit(OpCode::SetList {
            table: 0,
            count: Some(3),
            batch: 0,
        });
        b.emit(OpCode::SetTable {
            table: 0,
            key: Rk::Const(kk),
            value: Rk::Const(k2),
        });
        b.emit(OpCode::GetTable {
            dst: 4,
            table: 0,
            key: Rk::Const(kk),
        });
        b.emit(OpCode::Len { dst: 5, src: 0 });
        b.emit(OpCode::Return {
            first: 4,
            count: Some(2),
        });
        assert_eq!(run(b.finish(), vec![]).unwrap(), vec![int(2), int(3)]);
    }

    #[test]
    fn concat_folds_right_to_left() {
        // return 1 .. 2 .. "x"
        let mut b = ProtoBuilder::new("cat");
        let k1 = b.add_constant(Constant::Integer(1));
        let k2 = b.add_constant(Constant::Integer(2));
        let kx = b.add_constant(Constant::Str("x".into()));
        b.max_registers = 3;
        b.emit(OpCode::LoadConst { dst: 0, index: k1 });
        b.emit(OpCode::LoadConst { dst: 1, index: k2 });
        b.emit(OpCode::LoadConst { dst: 2, index: kx });
        b.emit(OpCode::Concat {
            dst: 0,
            from: 0,
            to: 2,
        });
        b.emit(OpCode::Return {
            first: 0,
            count: Some(1),
        });
        assert_eq!(
            run(b.finish(), vec![]).unwrap(),
            vec![LuaValue::Str("12x".into())]
        );
    }

    #[test]
    fn generic_for_drives_a_native_iterator() {
        // iterator: (limit, last) -> last+1 while last < limit
        fn step(st: &mut LuaState) -> Result<usize, Signal> {
            let base = st.base();
            let limit = st.stack.get(base).to_integer_exact().unwrap_or(0);
            let last = st.stack.get(base + 1).to_integer_exact().unwrap_or(0);
            if last < limit {
                st.stack.push(LuaValue::Integer(last + 1));
            } else {
                st.stack.push(LuaValue::Nil);
            }
            Ok(1)
        }
        // s = 0; for i in step, 3, 0 do s = s + i end; return s
        // the iterator arrives as the parameter in r0 and moves to r1;
        // r0 = s, r1..r3 = f/s/ctl, r4 = i
        let mut st = state();
        let mut b = ProtoBuilder::new("gfor");
        let k0 = b.add_constant(Constant::Integer(0));
        let k3 = b.add_constant(Constant::Integer(3));
        b.param_count = 1;
        b.max_registers = 7;
        b.emit(OpCode::Move { dst: 1, src: 0 });
        b.emit(OpCode::LoadConst { dst: 0, index: k0 });
        b.emit(OpCode::LoadConst { dst: 2, index: k3 });
        b.emit(OpCode::LoadConst { dst: 3, index: k0 });
        b.emit(OpCode::Jump { offset: 1 });
        b.emit(OpCode::Arith {
            op: ArithOp::Add,
            dst: 0,
            lhs: Rk::Reg(0),
            rhs: Rk::Reg(4),
        });
        b.emit(OpCode::TForCall { base: 1, want: 1 });
        b.emit(OpCode::TForLoop {
            base: 1,
            offset: -3,
        });
        b.emit(OpCode::Return {
            first: 0,
            count: Some(1),
        });
        let iter = LuaValue::Native(Arc::new(NativeClosure::new("step", step)));
        assert_eq!(
            run_in(&mut st, b.finish(), vec![iter]).unwrap(),
            vec![int(6)]
        );
    }

    #[test]
    fn tail_calls_reuse_the_frame() {
        fn depth_probe(st: &mut LuaState) -> Result<usize, Signal> {
            st.stack.push(LuaValue::Integer(st.call_depth() as i64));
            Ok(1)
        }
        // f(n, probe): if n == 0 then return probe() else return f(n - 1, probe)
        let mut f = ProtoBuilder::new("f");
        let k0 = f.add_constant(Constant::Integer(0));
        let k1 = f.add_constant(Constant::Integer(1));
        f.param_count = 2;
        f.max_registers = 5;
        // captures main's r1, where main stores this very closure
        f.upvalue_descs.push(UpvalueDesc::Stack(1));
        f.emit(OpCode::Eq {
            dst: 2,
            lhs: Rk::Reg(0),
            rhs: Rk::Const(k0),
        });
        f.emit(OpCode::JumpIfFalse { src: 2, offset: 2 });
        f.emit(OpCode::Move { dst: 2, src: 1 });
        f.emit(OpCode::TailCall {
            func: 2,
            args: Some(0),
        });
        f.emit(OpCode::GetUpvalue { dst: 2, index: 0 });
        f.emit(OpCode::Arith {
            op: ArithOp::Sub,
            dst: 3,
            lhs: Rk::Reg(0),
            rhs: Rk::Const(k1),
        });
        f.emit(OpCode::Move { dst: 4, src: 1 });
        f.emit(OpCode::TailCall {
            func: 2,
            args: Some(2),
        });
        let fp = Arc::new(f.finish());

        // main(probe): local f = closure; return f(5, probe)
        let mut b = ProtoBuilder::new("main");
        let p = b.add_proto(fp);
        let k5 = b.add_constant(Constant::Integer(5));
        b.param_count = 1;
        b.max_registers = 4;
        b.emit(OpCode::Closure { dst: 1, proto: p });
        b.emit(OpCode::LoadConst { dst: 2, index: k5 });
        b.emit(OpCode::Move { dst: 3, src: 0 });
        b.emit(OpCode::Call {
            func: 1,
            args: Some(2),
            results: None,
        });
        b.emit(OpCode::Return { first: 1, count: None });
        let probe = LuaValue::Native(Arc::new(NativeClosure::new("probe", depth_probe)));
        // the recursion reuses one frame and the final tail call replaces
        // it, so the probe always sees main plus itself
        assert_eq!(run(b.finish(), vec![probe]).unwrap(), vec![int(2)]);
    }

    #[test]
    fn errors_carry_source_positions() {
        let mut b = ProtoBuilder::new("pos");
        let k1 = b.add_constant(Constant::Integer(1));
        let k0 = b.add_constant(Constant::Integer(0));
        b.max_registers = 1;
        b.emit_at(
            OpCode::Arith {
                op: ArithOp::IDiv,
                dst: 0,
                lhs: Rk::Const(k1),
                rhs: Rk::Const(k0),
            },
            7,
        );
        b.emit_at(
            OpCode::Return {
                first: 0,
                count: Some(1),
            },
            8,
        );
        let err = run(b.finish(), vec![]).unwrap_err();
        match err {
            Signal::Error(v) => {
                let text = v.to_string();
                assert!(text.starts_with("pos:7:"), "{text}");
                assert!(text.contains("attempt to perform 'n//0'"), "{text}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn globals_route_through_the_globals_table() {
        // answer = 42; return answer
        let mut b = ProtoBuilder::new("glb");
        let k42 = b.add_constant(Constant::Integer(42));
        let name = b.add_name("answer");
        b.max_registers = 2;
        b.emit(OpCode::LoadConst { dst: 0, index: k42 });
        b.emit(OpCode::SetGlobal { src: 0, name });
        b.emit(OpCode::GetGlobal { dst: 1, name });
        b.emit(OpCode::Return {
            first: 1,
            count: Some(1),
        });
        let mut st = state();
        assert_eq!(run_in(&mut st, b.finish(), vec![]).unwrap(), vec![int(42)]);
        let g = st.globals();
        let stored = crate::lock_read(&g).get(&LuaValue::Str("answer".into()));
        assert_eq!(stored, int(42));
    }

    #[test]
    fn missing_return_is_a_malformed_unit_error() {
        let mut b = ProtoBuilder::new("trunc");
        b.max_registers = 1;
        b.emit(OpCode::LoadNil { dst: 0, count: 1 });
        let err = run(b.finish(), vec![]).unwrap_err();
        match err {
            Signal::Error(v) => assert!(v.to_string().contains("malformed function"), "{v}"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
