//! The compiled-function unit consumed by the VM.
//!
//! A [`Proto`] is immutable once built: the engine shares it freely between
//! closures and threads behind an `Arc` and never writes through it.

use std::fmt;
use std::sync::Arc;

use crate::opcode::OpCode;

/// An immutable compiled-function unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Proto {
    /// Bytecode.
    pub instructions: Vec<OpCode>,
    /// Constant pool referenced by `Rk::Const` and `LoadConst` operands.
    pub constants: Vec<Constant>,
    /// Global-variable names referenced by `GetGlobal`/`SetGlobal`.
    pub names: Vec<Arc<str>>,
    /// Nested function prototypes referenced by `Closure`.
    pub protos: Vec<Arc<Proto>>,
    /// One descriptor per upvalue the function captures.
    pub upvalue_descs: Vec<UpvalueDesc>,
    /// Number of fixed parameters.
    pub param_count: u8,
    /// Whether the function accepts varargs after its fixed parameters.
    pub is_vararg: bool,
    /// Number of register slots the function may touch.
    pub max_registers: u8,
    /// Name of the chunk this function came from (for error positions).
    pub source: Arc<str>,
    /// Line number per instruction; may be empty when debug info is stripped.
    pub lines: Vec<u32>,
}

impl Proto {
    /// Line for the instruction at `pc`, or 0 when debug info is absent.
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(0)
    }
}

/// How a closure captures one of its upvalues, relative to the *enclosing*
/// function at closure-instantiation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueDesc {
    /// Captures the enclosing frame's register `N` (opens an upvalue).
    Stack(u8),
    /// Re-captures the enclosing closure's upvalue `N` (shares the cell).
    Upvalue(u8),
}

/// A constant-pool entry.
///
/// Only primitives are representable: tables, closures and threads are
/// runtime objects and never appear in a compiled unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Str(Arc<str>),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Nil => write!(f, "nil"),
            Constant::Boolean(b) => write!(f, "{b}"),
            Constant::Integer(n) => write!(f, "{n}"),
            Constant::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Constant::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// A compiled top-level chunk — thin wrapper around the root [`Proto`].
///
/// This is the artifact produced by a front end (or by [`ProtoBuilder`] in
/// tests) and consumed by the VM.
#[derive(Debug)]
pub struct Chunk {
    /// The root function prototype.
    pub proto: Arc<Proto>,
}

impl Chunk {
    pub fn new(proto: Proto) -> Self {
        Self {
            proto: Arc::new(proto),
        }
    }
}

// ── Proto builder ─────────────────────────────────────────────────────────────

/// Mutable builder for a [`Proto`].
///
/// Front ends drive this while generating code; the engine's own tests use it
/// to assemble units by hand.
#[derive(Debug, Default)]
pub struct ProtoBuilder {
    pub instructions: Vec<OpCode>,
    pub constants: Vec<Constant>,
    pub names: Vec<String>,
    pub protos: Vec<Arc<Proto>>,
    pub upvalue_descs: Vec<UpvalueDesc>,
    pub param_count: u8,
    pub is_vararg: bool,
    pub max_registers: u8,
    pub source: String,
    pub lines: Vec<u32>,
}

impl ProtoBuilder {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    /// Append an instruction, returning its program-counter index.
    pub fn emit(&mut self, op: OpCode) -> usize {
        self.instructions.push(op);
        self.instructions.len() - 1
    }

    /// Append an instruction tagged with a source line.
    pub fn emit_at(&mut self, op: OpCode, line: u32) -> usize {
        self.lines.resize(self.instructions.len(), 0);
        self.lines.push(line);
        self.emit(op)
    }

    pub fn add_constant(&mut self, value: Constant) -> u16 {
        // deduplicate — avoid adding the same constant twice
        if let Some(idx) = self.constants.iter().position(|c| c == &value) {
            return idx as u16;
        }
        let idx = self.constants.len() as u16;
        self.constants.push(value);
        idx
    }

    pub fn add_name(&mut self, name: impl Into<String>) -> u16 {
        let name = name.into();
        if let Some(idx) = self.names.iter().position(|n| n == &name) {
            return idx as u16;
        }
        let idx = self.names.len() as u16;
        self.names.push(name);
        idx
    }

    pub fn add_proto(&mut self, proto: Arc<Proto>) -> u16 {
        let idx = self.protos.len() as u16;
        self.protos.push(proto);
        idx
    }

    pub fn finish(self) -> Proto {
        let mut lines = self.lines;
        if !lines.is_empty() {
            lines.resize(self.instructions.len(), 0);
        }
        Proto {
            instructions: self.instructions,
            constants: self.constants,
            names: self.names.into_iter().map(Arc::from).collect(),
            protos: self.protos,
            upvalue_descs: self.upvalue_descs,
            param_count: self.param_count,
            is_vararg: self.is_vararg,
            max_registers: self.max_registers,
            source: Arc::from(self.source),
            lines,
        }
    }
}
