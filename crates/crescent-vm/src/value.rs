use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock};

use crescent_core::Constant;

use crate::closure::{LuaClosure, NativeClosure};
use crate::coroutine::Coroutine;
use crate::table::LuaTable;

/// Shared handle to a table.
pub type TableRef = Arc<RwLock<LuaTable>>;

/// All Lua value types, mirroring the Lua 5.3 type system.
///
/// `Integer` and `Float` are distinct subtypes of one `number` type; the
/// conversion rules between them live in the methods below and never fire
/// implicitly.
#[derive(Clone)]
pub enum LuaValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    /// Immutable shared string.
    Str(Arc<str>),
    /// A Lua table (array + hash parts, reference-counted + interior mutability).
    Table(TableRef),
    /// A Lua closure (compiled function + captured upvalues).
    Closure(Arc<LuaClosure>),
    /// A native Rust function plus its captured upvalues.
    Native(Arc<NativeClosure>),
    /// Opaque host payload with an optional metatable.
    UserData(Arc<UserData>),
    /// A coroutine.
    Thread(Arc<Coroutine>),
}

/// Primitive type tags, used for type probes and the per-type metatable slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaType {
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    UserData,
    Thread,
}

impl LuaType {
    /// The Lua type name string as per the reference manual.
    pub fn name(self) -> &'static str {
        match self {
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::UserData => "userdata",
            LuaType::Thread => "thread",
        }
    }

    pub(crate) fn tag_index(self) -> usize {
        match self {
            LuaType::Nil => 0,
            LuaType::Boolean => 1,
            LuaType::Number => 2,
            LuaType::String => 3,
            LuaType::Table => 4,
            LuaType::Function => 5,
            LuaType::UserData => 6,
            LuaType::Thread => 7,
        }
    }
}

/// Number of distinct type tags (size of the per-type metatable array).
pub(crate) const TYPE_TAG_COUNT: usize = 8;

impl LuaValue {
    pub fn value_type(&self) -> LuaType {
        match self {
            LuaValue::Nil => LuaType::Nil,
            LuaValue::Boolean(_) => LuaType::Boolean,
            LuaValue::Integer(_) | LuaValue::Float(_) => LuaType::Number,
            LuaValue::Str(_) => LuaType::String,
            LuaValue::Table(_) => LuaType::Table,
            LuaValue::Closure(_) | LuaValue::Native(_) => LuaType::Function,
            LuaValue::UserData(_) => LuaType::UserData,
            LuaValue::Thread(_) => LuaType::Thread,
        }
    }

    /// Returns the Lua type name string as per the reference manual.
    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    /// Returns `true` if the value is truthy in Lua's sense
    /// (everything except `nil` and `false` is truthy).
    pub fn is_truthy(&self) -> bool {
        !matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    /// Create a new empty table value.
    pub fn new_table() -> Self {
        LuaValue::Table(Arc::new(RwLock::new(LuaTable::new())))
    }

    /// Materialize a constant-pool entry.
    pub fn from_constant(c: &Constant) -> LuaValue {
        match c {
            Constant::Nil => LuaValue::Nil,
            Constant::Boolean(b) => LuaValue::Boolean(*b),
            Constant::Integer(n) => LuaValue::Integer(*n),
            Constant::Float(f) => LuaValue::Float(*f),
            Constant::Str(s) => LuaValue::Str(s.clone()),
        }
    }

    // ── Numeric tower conversions ───────────────────────────────────────────

    /// Convert to a float: integers exactly, floats as-is, strings by parse.
    pub fn to_float(&self) -> Option<f64> {
        match self {
            LuaValue::Integer(n) => Some(*n as f64),
            LuaValue::Float(f) => Some(*f),
            LuaValue::Str(s) => match str_to_number(s)? {
                LuaValue::Integer(n) => Some(n as f64),
                LuaValue::Float(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    /// Convert to an integer without loss: integers as-is, floats only when
    /// they carry no fractional part and fit in 64 bits, strings by parse
    /// followed by the same rule.
    pub fn to_integer_exact(&self) -> Option<i64> {
        match self {
            LuaValue::Integer(n) => Some(*n),
            LuaValue::Float(f) => float_to_integer_exact(*f),
            LuaValue::Str(s) => match str_to_number(s)? {
                LuaValue::Integer(n) => Some(n),
                LuaValue::Float(f) => float_to_integer_exact(f),
                _ => None,
            },
            _ => None,
        }
    }

    /// String coercion as the concatenation operator sees it: strings pass
    /// through, numbers format, everything else refuses.
    pub fn as_coerced_string(&self) -> Option<String> {
        match self {
            LuaValue::Str(s) => Some(s.to_string()),
            LuaValue::Integer(_) | LuaValue::Float(_) => Some(self.to_string()),
            _ => None,
        }
    }
}

/// Convert a float to an integer only when the value is integral and
/// representable.  The upper bound is exclusive because 2^63 itself rounds
/// into the first unrepresentable value.
pub(crate) fn float_to_integer_exact(f: f64) -> Option<i64> {
    let min = i64::MIN as f64;
    if f.floor() == f && f >= min && f < -min {
        Some(f as i64)
    } else {
        None
    }
}

/// Parse a string as a Lua number: optional sign, hex integer (wrapping, as
/// the reference lexer does), decimal integer, else float.  Rejects the
/// `inf`/`nan` spellings Rust's float parser would otherwise accept.
pub fn str_to_number(s: &str) -> Option<LuaValue> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    let (neg, rest) = match t.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, t.strip_prefix('+').unwrap_or(t)),
    };
    if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        if hex.is_empty() {
            return None;
        }
        let mut n: i64 = 0;
        for c in hex.chars() {
            let d = c.to_digit(16)? as i64;
            n = n.wrapping_mul(16).wrapping_add(d);
        }
        return Some(LuaValue::Integer(if neg { n.wrapping_neg() } else { n }));
    }
    if let Ok(n) = t.parse::<i64>() {
        return Some(LuaValue::Integer(n));
    }
    let lower = t.to_ascii_lowercase();
    if lower.contains("inf") || lower.contains("nan") {
        return None;
    }
    t.parse::<f64>().ok().map(LuaValue::Float)
}

// ── UserData ──────────────────────────────────────────────────────────────────

/// Opaque host memory.  The engine never inspects the payload; all behavior
/// comes from the metatable.
pub struct UserData {
    data: Box<dyn Any + Send + Sync>,
    metatable: RwLock<Option<TableRef>>,
}

impl UserData {
    pub fn new(data: impl Any + Send + Sync) -> Arc<UserData> {
        Arc::new(UserData {
            data: Box::new(data),
            metatable: RwLock::new(None),
        })
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    pub fn metatable(&self) -> Option<TableRef> {
        crate::lock_read(&self.metatable).clone()
    }

    pub fn set_metatable(&self, mt: Option<TableRef>) {
        *crate::lock_write(&self.metatable) = mt;
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserData({:p})", self as *const _)
    }
}

// Closures, tables, userdata and threads compare by object identity; the
// numeric subtypes compare by mathematical value.  Metamethod-aware equality
// is layered on top of this in the dispatch module.
impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Integer(b)) => a == b,
            (LuaValue::Float(a), LuaValue::Float(b)) => a == b,
            // exact: a float equals an integer only when it has that integer value
            (LuaValue::Integer(a), LuaValue::Float(b)) => float_to_integer_exact(*b) == Some(*a),
            (LuaValue::Float(a), LuaValue::Integer(b)) => float_to_integer_exact(*a) == Some(*b),
            (LuaValue::Str(a), LuaValue::Str(b)) => a == b,
            (LuaValue::Table(a), LuaValue::Table(b)) => Arc::ptr_eq(a, b),
            (LuaValue::Closure(a), LuaValue::Closure(b)) => Arc::ptr_eq(a, b),
            (LuaValue::Native(a), LuaValue::Native(b)) => Arc::ptr_eq(a, b),
            (LuaValue::UserData(a), LuaValue::UserData(b)) => Arc::ptr_eq(a, b),
            (LuaValue::Thread(a), LuaValue::Thread(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "LuaValue::Nil"),
            LuaValue::Boolean(b) => write!(f, "LuaValue::Boolean({b})"),
            LuaValue::Integer(n) => write!(f, "LuaValue::Integer({n})"),
            LuaValue::Float(n) => write!(f, "LuaValue::Float({n})"),
            LuaValue::Str(s) => write!(f, "LuaValue::Str({s:?})"),
            LuaValue::Table(t) => write!(f, "LuaValue::Table({:p})", Arc::as_ptr(t)),
            LuaValue::Closure(c) => write!(f, "LuaValue::Closure({:p})", Arc::as_ptr(c)),
            LuaValue::Native(n) => write!(f, "LuaValue::Native({:p})", Arc::as_ptr(n)),
            LuaValue::UserData(u) => write!(f, "LuaValue::UserData({:p})", Arc::as_ptr(u)),
            LuaValue::Thread(t) => write!(f, "LuaValue::Thread({:p})", Arc::as_ptr(t)),
        }
    }
}

impl fmt::Display for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "nil"),
            LuaValue::Boolean(b) => write!(f, "{b}"),
            LuaValue::Integer(n) => write!(f, "{n}"),
            LuaValue::Float(n) => {
                // Lua displays 1.0 as "1.0", not "1"
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{n:.1}")
                } else {
                    write!(f, "{n}")
                }
            }
            LuaValue::Str(s) => write!(f, "{s}"),
            LuaValue::Table(t) => write!(f, "table: {:p}", Arc::as_ptr(t)),
            LuaValue::Closure(c) => write!(f, "function: {:p}", Arc::as_ptr(c)),
            LuaValue::Native(n) => write!(f, "function: builtin: {:p}", Arc::as_ptr(n)),
            LuaValue::UserData(u) => write!(f, "userdata: {:p}", Arc::as_ptr(u)),
            LuaValue::Thread(t) => write!(f, "thread: {:p}", Arc::as_ptr(t)),
        }
    }
}
