//! Operator semantics: numeric kernels, coercions, and the metamethod
//! dispatch layered between the executor and raw values.
//!
//! Every operation here follows the same shape: try the built-in behavior
//! for the operand types, fall back to the relevant metamethod, and only
//! then raise a type error naming the offending operand.

use crescent_core::ArithOp;

use crate::error::Signal;
use crate::state::LuaState;
use crate::value::{str_to_number, LuaValue, TableRef};

/// Longest `__index`/`__newindex` delegation chain walked before assuming
/// the metatables form a loop.
pub(crate) const MAX_META_CHAIN: usize = 100;

/// 2^63 as a float: the first value above `i64::MAX`, and exactly
/// representable.
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

// ── Integer and float kernels ───────────────────────────────────────────────

/// Floor division.  Callers reject a zero divisor; `-1` wraps instead of
/// trapping on `i64::MIN`.
pub(crate) fn int_floor_div(x: i64, y: i64) -> i64 {
    if y == -1 {
        return x.wrapping_neg();
    }
    let q = x / y;
    if x % y != 0 && ((x < 0) != (y < 0)) {
        q - 1
    } else {
        q
    }
}

/// Floor remainder: the result has the divisor's sign.
pub(crate) fn int_floor_mod(x: i64, y: i64) -> i64 {
    if y == -1 {
        return 0;
    }
    let r = x % y;
    if r != 0 && ((r < 0) != (y < 0)) {
        r + y
    } else {
        r
    }
}

/// Float remainder with the divisor's sign.
pub(crate) fn float_floor_mod(x: f64, y: f64) -> f64 {
    let r = x % y;
    if r != 0.0 && (r * y < 0.0) {
        r + y
    } else {
        r
    }
}

/// Left shift by a signed count: negative counts shift right, counts past
/// the width produce zero, and the shift itself is logical (unsigned).
pub(crate) fn int_shift_left(x: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as i64
    } else {
        ((x as u64) >> -n) as i64
    }
}

// Mixed integer/float ordering is exact: the float is floored or ceiled onto
// the integer axis instead of widening the integer, which would lose
// precision past 2^53.

fn int_lt_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return true;
    }
    if f < -TWO_POW_63 {
        return false;
    }
    i < (f.ceil() as i64)
}

fn float_lt_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return false;
    }
    if f < -TWO_POW_63 {
        return true;
    }
    (f.floor() as i64) < i
}

fn int_le_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return true;
    }
    if f < -TWO_POW_63 {
        return false;
    }
    i <= (f.floor() as i64)
}

fn float_le_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return false;
    }
    if f < -TWO_POW_63 {
        return true;
    }
    (f.ceil() as i64) <= i
}

/// Numeric `<`; `None` when either operand is not a number.  NaN compares
/// false against everything, including itself.
pub(crate) fn num_lt(a: &LuaValue, b: &LuaValue) -> Option<bool> {
    match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => Some(x < y),
        (LuaValue::Float(x), LuaValue::Float(y)) => Some(x < y),
        (LuaValue::Integer(x), LuaValue::Float(y)) => Some(int_lt_float(*x, *y)),
        (LuaValue::Float(x), LuaValue::Integer(y)) => Some(float_lt_int(*x, *y)),
        _ => None,
    }
}

/// Numeric `<=`; `None` when either operand is not a number.
pub(crate) fn num_le(a: &LuaValue, b: &LuaValue) -> Option<bool> {
    match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => Some(x <= y),
        (LuaValue::Float(x), LuaValue::Float(y)) => Some(x <= y),
        (LuaValue::Integer(x), LuaValue::Float(y)) => Some(int_le_float(*x, *y)),
        (LuaValue::Float(x), LuaValue::Integer(y)) => Some(float_le_int(*x, *y)),
        _ => None,
    }
}

/// Metamethod event name for a binary operator.
fn arith_event(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "__add",
        ArithOp::Sub => "__sub",
        ArithOp::Mul => "__mul",
        ArithOp::Mod => "__mod",
        ArithOp::Pow => "__pow",
        ArithOp::Div => "__div",
        ArithOp::IDiv => "__idiv",
        ArithOp::BAnd => "__band",
        ArithOp::BOr => "__bor",
        ArithOp::BXor => "__bxor",
        ArithOp::Shl => "__shl",
        ArithOp::Shr => "__shr",
    }
}

pub(crate) fn valid_key(key: &LuaValue) -> bool {
    match key {
        LuaValue::Nil => false,
        LuaValue::Float(f) => !f.is_nan(),
        _ => true,
    }
}

/// Strings entering arithmetic convert up front with their numeric subtype
/// intact: "10" behaves as an integer, "1.5" as a float.
fn coerce_operand(v: LuaValue) -> LuaValue {
    if let LuaValue::Str(s) = &v {
        if let Some(n) = str_to_number(s) {
            return n;
        }
    }
    v
}

// ── Metamethod dispatch ─────────────────────────────────────────────────────

impl LuaState {
    /// The metatable governing `v`: per-value for tables and userdata,
    /// per-type for everything else.
    pub(crate) fn metatable_of(&self, v: &LuaValue) -> Option<TableRef> {
        match v {
            LuaValue::Table(t) => crate::lock_read(t).metatable.clone(),
            LuaValue::UserData(u) => u.metatable(),
            other => self.g.type_metatable(other.value_type()),
        }
    }

    /// Non-nil metatable field for `event`, if `v` has one.
    pub(crate) fn metamethod_of(&self, v: &LuaValue, event: &str) -> Option<LuaValue> {
        let mt = self.metatable_of(v)?;
        let h = crate::lock_read(&mt).get(&LuaValue::Str(event.into()));
        if h.is_nil() {
            None
        } else {
            Some(h)
        }
    }

    /// Invoke a metamethod handler above the current top and hand back its
    /// first result.  Handlers are a native re-entry point, so yields are
    /// barred for their duration.
    fn call_handler(&mut self, handler: LuaValue, args: &[LuaValue]) -> Result<LuaValue, Signal> {
        let slot = self.stack.top();
        self.stack.check(args.len() + 1)?;
        self.stack.push(handler);
        for arg in args {
            self.stack.push(arg.clone());
        }
        self.nny += 1;
        let called = self.call_value(slot, 1);
        self.nny -= 1;
        called?;
        let result = self.stack.get(slot);
        self.stack.set_top(slot);
        Ok(result)
    }

    // ── Arithmetic ──────────────────────────────────────────────────────────

    pub(crate) fn arith(&mut self, op: ArithOp, a: LuaValue, b: LuaValue) -> Result<LuaValue, Signal> {
        use ArithOp::*;
        let (a, b) = (coerce_operand(a), coerce_operand(b));
        match op {
            Add | Sub | Mul | Mod | IDiv => {
                if let (LuaValue::Integer(x), LuaValue::Integer(y)) = (&a, &b) {
                    let (x, y) = (*x, *y);
                    let r = match op {
                        Add => x.wrapping_add(y),
                        Sub => x.wrapping_sub(y),
                        Mul => x.wrapping_mul(y),
                        Mod if y == 0 => return Err(self.raise("attempt to perform 'n%0'")),
                        Mod => int_floor_mod(x, y),
                        IDiv if y == 0 => return Err(self.raise("attempt to perform 'n//0'")),
                        _ => int_floor_div(x, y), // IDiv
                    };
                    return Ok(LuaValue::Integer(r));
                }
                if let (Some(x), Some(y)) = (a.to_float(), b.to_float()) {
                    let r = match op {
                        Add => x + y,
                        Sub => x - y,
                        Mul => x * y,
                        Mod => float_floor_mod(x, y),
                        _ => (x / y).floor(), // IDiv
                    };
                    return Ok(LuaValue::Float(r));
                }
            }
            Div | Pow => {
                if let (Some(x), Some(y)) = (a.to_float(), b.to_float()) {
                    let r = if op == Div { x / y } else { x.powf(y) };
                    return Ok(LuaValue::Float(r));
                }
            }
            BAnd | BOr | BXor | Shl | Shr => {
                if let (Some(x), Some(y)) = (a.to_integer_exact(), b.to_integer_exact()) {
                    let r = match op {
                        BAnd => x & y,
                        BOr => x | y,
                        BXor => x ^ y,
                        Shl => int_shift_left(x, y),
                        _ => int_shift_left(x, y.wrapping_neg()), // Shr
                    };
                    return Ok(LuaValue::Integer(r));
                }
                if a.to_float().is_some() && b.to_float().is_some() {
                    return Err(self.raise("number has no integer representation"));
                }
            }
        }
        self.arith_meta(op, a, b)
    }

    fn arith_meta(&mut self, op: ArithOp, a: LuaValue, b: LuaValue) -> Result<LuaValue, Signal> {
        let event = arith_event(op);
        if let Some(h) = self
            .metamethod_of(&a, event)
            .or_else(|| self.metamethod_of(&b, event))
        {
            return self.call_handler(h, &[a, b]);
        }
        let offender = if a.to_float().is_some() { b } else { a };
        let action = if op.integer_only() {
            "perform bitwise operation on"
        } else {
            "perform arithmetic on"
        };
        Err(self.raise(format!(
            "attempt to {action} a {} value",
            offender.type_name()
        )))
    }

    pub(crate) fn unary_minus(&mut self, v: LuaValue) -> Result<LuaValue, Signal> {
        let v = coerce_operand(v);
        match &v {
            LuaValue::Integer(n) => return Ok(LuaValue::Integer(0i64.wrapping_sub(*n))),
            LuaValue::Float(f) => return Ok(LuaValue::Float(-f)),
            _ => {}
        }
        if let Some(h) = self.metamethod_of(&v, "__unm") {
            return self.call_handler(h, &[v.clone(), v]);
        }
        Err(self.raise(format!(
            "attempt to perform arithmetic on a {} value",
            v.type_name()
        )))
    }

    pub(crate) fn bitwise_not(&mut self, v: LuaValue) -> Result<LuaValue, Signal> {
        if let Some(n) = v.to_integer_exact() {
            return Ok(LuaValue::Integer(!n));
        }
        if v.to_float().is_some() {
            return Err(self.raise("number has no integer representation"));
        }
        if let Some(h) = self.metamethod_of(&v, "__bnot") {
            return self.call_handler(h, &[v.clone(), v]);
        }
        Err(self.raise(format!(
            "attempt to perform bitwise operation on a {} value",
            v.type_name()
        )))
    }

    // ── Comparison ──────────────────────────────────────────────────────────

    /// Script equality: primitive equality, then `__eq` when both operands
    /// are tables or both are userdata.
    pub(crate) fn values_equal(&mut self, a: &LuaValue, b: &LuaValue) -> Result<bool, Signal> {
        if a == b {
            return Ok(true);
        }
        let comparable = matches!(
            (a, b),
            (LuaValue::Table(_), LuaValue::Table(_))
                | (LuaValue::UserData(_), LuaValue::UserData(_))
        );
        if !comparable {
            return Ok(false);
        }
        match self
            .metamethod_of(a, "__eq")
            .or_else(|| self.metamethod_of(b, "__eq"))
        {
            Some(h) => Ok(self.call_handler(h, &[a.clone(), b.clone()])?.is_truthy()),
            None => Ok(false),
        }
    }

    pub(crate) fn less_than(&mut self, a: &LuaValue, b: &LuaValue) -> Result<bool, Signal> {
        if let Some(r) = num_lt(a, b) {
            return Ok(r);
        }
        if let (LuaValue::Str(x), LuaValue::Str(y)) = (a, b) {
            return Ok(x < y);
        }
        match self
            .metamethod_of(a, "__lt")
            .or_else(|| self.metamethod_of(b, "__lt"))
        {
            Some(h) => Ok(self.call_handler(h, &[a.clone(), b.clone()])?.is_truthy()),
            None => Err(self.compare_error(a, b)),
        }
    }

    pub(crate) fn less_equal(&mut self, a: &LuaValue, b: &LuaValue) -> Result<bool, Signal> {
        if let Some(r) = num_le(a, b) {
            return Ok(r);
        }
        if let (LuaValue::Str(x), LuaValue::Str(y)) = (a, b) {
            return Ok(x <= y);
        }
        if let Some(h) = self
            .metamethod_of(a, "__le")
            .or_else(|| self.metamethod_of(b, "__le"))
        {
            return Ok(self.call_handler(h, &[a.clone(), b.clone()])?.is_truthy());
        }
        // a <= b as not (b < a), for types that only define __lt
        if let Some(h) = self
            .metamethod_of(a, "__lt")
            .or_else(|| self.metamethod_of(b, "__lt"))
        {
            return Ok(!self.call_handler(h, &[b.clone(), a.clone()])?.is_truthy());
        }
        Err(self.compare_error(a, b))
    }

    fn compare_error(&self, a: &LuaValue, b: &LuaValue) -> Signal {
        let (ta, tb) = (a.type_name(), b.type_name());
        if ta == tb {
            self.raise(format!("attempt to compare two {ta} values"))
        } else {
            self.raise(format!("attempt to compare {ta} with {tb}"))
        }
    }

    // ── Indexing ────────────────────────────────────────────────────────────

    /// `obj[key]` with full `__index` semantics.  A raw hit wins; otherwise
    /// function handlers are called and table handlers re-enter the loop.
    pub(crate) fn index_get(&mut self, obj: LuaValue, key: LuaValue) -> Result<LuaValue, Signal> {
        let mut t = obj;
        for _ in 0..MAX_META_CHAIN {
            let handler = if let LuaValue::Table(tref) = &t {
                if valid_key(&key) {
                    let raw = crate::lock_read(tref).get(&key);
                    if !raw.is_nil() {
                        return Ok(raw);
                    }
                }
                match crate::lock_read(tref).meta_field("__index") {
                    None => return Ok(LuaValue::Nil),
                    Some(h) => h,
                }
            } else {
                match self.metamethod_of(&t, "__index") {
                    Some(h) => h,
                    None => {
                        return Err(
                            self.raise(format!("attempt to index a {} value", t.type_name()))
                        )
                    }
                }
            };
            match handler {
                h @ (LuaValue::Closure(_) | LuaValue::Native(_)) => {
                    return self.call_handler(h, &[t, key]);
                }
                next => t = next,
            }
        }
        Err(self.raise("'__index' chain too long; possible loop"))
    }

    /// `obj[key] = value` with full `__newindex` semantics.  Key validity is
    /// only enforced at the final raw write; handlers may see any key.
    pub(crate) fn index_set(
        &mut self,
        obj: LuaValue,
        key: LuaValue,
        value: LuaValue,
    ) -> Result<(), Signal> {
        let mut t = obj;
        for _ in 0..MAX_META_CHAIN {
            let handler = if let LuaValue::Table(tref) = &t {
                let existing = if valid_key(&key) {
                    crate::lock_read(tref).get(&key)
                } else {
                    LuaValue::Nil
                };
                if !existing.is_nil() {
                    crate::lock_write(tref).put(key, value);
                    return Ok(());
                }
                let newindex = crate::lock_read(tref).meta_field("__newindex");
                match newindex {
                    None => {
                        if key.is_nil() {
                            return Err(self.raise("table index is nil"));
                        }
                        if matches!(&key, LuaValue::Float(f) if f.is_nan()) {
                            return Err(self.raise("table index is NaN"));
                        }
                        crate::lock_write(tref).put(key, value);
                        return Ok(());
                    }
                    Some(h) => h,
                }
            } else {
                match self.metamethod_of(&t, "__newindex") {
                    Some(h) => h,
                    None => {
                        return Err(
                            self.raise(format!("attempt to index a {} value", t.type_name()))
                        )
                    }
                }
            };
            match handler {
                h @ (LuaValue::Closure(_) | LuaValue::Native(_)) => {
                    self.call_handler(h, &[t, key, value])?;
                    return Ok(());
                }
                next => t = next,
            }
        }
        Err(self.raise("'__newindex' chain too long; possible loop"))
    }

    // ── Length and concatenation ────────────────────────────────────────────

    /// The `#` operator.  For tables `__len` wins over the raw border; for
    /// strings the byte length is final.
    pub(crate) fn length_of(&mut self, v: LuaValue) -> Result<LuaValue, Signal> {
        if let LuaValue::Str(s) = &v {
            return Ok(LuaValue::Integer(s.len() as i64));
        }
        if let Some(h) = self.metamethod_of(&v, "__len") {
            return self.call_handler(h, &[v]);
        }
        if let LuaValue::Table(t) = &v {
            return Ok(LuaValue::Integer(crate::lock_read(t).len()));
        }
        Err(self.raise(format!(
            "attempt to get length of a {} value",
            v.type_name()
        )))
    }

    /// One step of the `..` fold: strings and numbers concatenate textually,
    /// anything else goes through `__concat`.
    pub(crate) fn concat_pair(&mut self, a: LuaValue, b: LuaValue) -> Result<LuaValue, Signal> {
        if let (Some(x), Some(y)) = (a.as_coerced_string(), b.as_coerced_string()) {
            return Ok(LuaValue::Str(format!("{x}{y}").into()));
        }
        if let Some(h) = self
            .metamethod_of(&a, "__concat")
            .or_else(|| self.metamethod_of(&b, "__concat"))
        {
            return self.call_handler(h, &[a, b]);
        }
        let offender = if a.as_coerced_string().is_some() { b } else { a };
        Err(self.raise(format!(
            "attempt to concatenate a {} value",
            offender.type_name()
        )))
    }
}
