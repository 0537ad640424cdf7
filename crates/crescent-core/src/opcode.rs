/// Bytecode instruction set for the crescent virtual machine.
///
/// This is a register-based ISA, loosely inspired by the PUC-Lua 5.3 opcode
/// set. Variants carry typed operands; the wire encoding lives in
/// [`crate::encode`] and [`crate::decode`].
///
/// Operand conventions:
/// - `u8` register operands address slots in the current frame's window.
/// - [`Rk`] operands resolve to either a register or a constant-pool entry.
/// - `Option<u8>` count operands use `None` for "all values up to the stack
///   top" (the multiple-results marker).
/// - `i16` offsets are relative to the instruction *after* the current one.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub enum OpCode {
    /// Load a constant into register `dst`.
    LoadConst { dst: u8, index: u16 },
    /// Load `nil` into `count` consecutive registers starting at `dst`.
    LoadNil { dst: u8, count: u8 },
    /// Load boolean into register `dst`.  If `skip` is true, skip next instruction.
    LoadBool { dst: u8, value: bool, skip: bool },
    /// Move register `src` into `dst`.
    Move { dst: u8, src: u8 },

    // Closures & upvalues
    /// Load upvalue `index` of the current closure into `dst`.
    GetUpvalue { dst: u8, index: u8 },
    /// Store `src` into upvalue `index` of the current closure.
    SetUpvalue { src: u8, index: u8 },
    /// Close all open upvalues aliasing registers >= `from`.
    CloseUpvalues { from: u8 },
    /// Instantiate a closure from `protos[proto]` of the current unit.
    Closure { dst: u8, proto: u16 },

    // Global variable access (routed through the globals table, so
    // metamethods installed on it are honored)
    GetGlobal { dst: u8, name: u16 },
    SetGlobal { src: u8, name: u16 },

    // Tables
    /// Create a new table in `dst` with capacity hints for both parts.
    NewTable { dst: u8, array_hint: u8, hash_hint: u8 },
    /// `dst = table[key]` (metamethod-aware)
    GetTable { dst: u8, table: u8, key: Rk },
    /// `table[key] = value` (metamethod-aware)
    SetTable { table: u8, key: Rk, value: Rk },
    /// Constructor flush: store `count` values starting at register
    /// `table + 1` into the array part, at indices
    /// `batch * FIELDS_PER_FLUSH + 1 ...`.  `None` stores everything up to
    /// the stack top (trailing multi-value expression).
    SetList { table: u8, count: Option<u8>, batch: u16 },

    // Arithmetic & bitwise (operator selected by `op`; operand-kind rules
    // and metamethod fallback are uniform per family)
    Arith { op: ArithOp, dst: u8, lhs: Rk, rhs: Rk },
    /// Unary minus
    Unm { dst: u8, src: u8 },
    /// Bitwise not
    BNot { dst: u8, src: u8 },
    /// Logical not (no metamethod)
    Not { dst: u8, src: u8 },
    /// Length of `src` (string length, `__len`, or table border)
    Len { dst: u8, src: u8 },
    /// Concatenate registers `from ..= to`, right-associatively.
    Concat { dst: u8, from: u8, to: u8 },

    // Comparison (result stored as boolean in `dst`)
    Eq { dst: u8, lhs: Rk, rhs: Rk },
    Lt { dst: u8, lhs: Rk, rhs: Rk },
    Le { dst: u8, lhs: Rk, rhs: Rk },

    // Control flow
    Jump { offset: i16 },
    JumpIfTrue { src: u8, offset: i16 },
    JumpIfFalse { src: u8, offset: i16 },

    // Numeric for: three control registers at `base` (index/limit/step),
    // visible loop variable at `base + 3`.
    /// Validate the control registers, pre-subtract the step, jump to the
    /// matching [`OpCode::ForLoop`].
    ForPrep { base: u8, offset: i16 },
    /// Advance the index by the step; while it is within the limit, publish
    /// it to `base + 3` and jump back into the body.
    ForLoop { base: u8, offset: i16 },

    // Generic for: iterator triple at `base` (function/state/control),
    // results from `base + 3`.
    /// `base+3 ..= base+2+want = base(base+1, base+2)`
    TForCall { base: u8, want: u8 },
    /// If the first result at `base + 3` is non-nil, copy it into the
    /// control register `base + 2` and jump back into the body.
    TForLoop { base: u8, offset: i16 },

    // Calls
    /// Copy varargs into registers starting at `dst`.  `None` expands all of
    /// them, adjusting the stack top.
    VarArg { dst: u8, want: Option<u8> },
    /// Call `func` with `args` arguments expecting `results` results.
    /// `None` args = everything between `func` and the stack top;
    /// `None` results = keep all results (stack top marks the end).
    Call { func: u8, args: Option<u8>, results: Option<u8> },
    /// Call reusing the current frame slot instead of pushing a new one.
    TailCall { func: u8, args: Option<u8> },
    /// Return `count` values starting at `first` (`None` = everything up to
    /// the stack top).
    Return { first: u8, count: Option<u8> },
}

/// Instruction operand resolving to a register slot or a constant-pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rk {
    Reg(u8),
    Const(u16),
}

/// Binary arithmetic/bitwise operator selector for [`OpCode::Arith`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    /// Floor division (`//`)
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl ArithOp {
    /// Source-level operator symbol, used by the disassembler and in error
    /// messages.
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Mod => "%",
            ArithOp::Pow => "^",
            ArithOp::Div => "/",
            ArithOp::IDiv => "//",
            ArithOp::BAnd => "&",
            ArithOp::BOr => "|",
            ArithOp::BXor => "~",
            ArithOp::Shl => "<<",
            ArithOp::Shr => ">>",
        }
    }

    /// True for the bitwise family, which requires both operands to convert
    /// exactly to integers.
    pub fn integer_only(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
        )
    }

    /// True for operators that always produce a float.
    pub fn float_only(self) -> bool {
        matches!(self, ArithOp::Div | ArithOp::Pow)
    }
}

/// Number of constructor entries flushed per [`OpCode::SetList`] batch.
pub const FIELDS_PER_FLUSH: usize = 50;
