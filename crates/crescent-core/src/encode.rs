//! Binary encoder: `Chunk` → `Vec<u8>`.
//!
//! Format: MAGIC (6 bytes) followed by a recursive Proto encoding.

use crate::chunk::{Chunk, Constant, Proto, UpvalueDesc};
use crate::opcode::{ArithOp, OpCode, Rk};

/// Magic bytes that identify a compiled crescent bytecode unit.
pub const MAGIC: &[u8] = b"\x1bCrsc\x01";

/// Byte marking an `Option<u8>` count operand as "all values up to top".
pub(crate) const COUNT_ALL: u8 = 0xFF;

// ── Low-level write helpers ────────────────────────────────────────────────

fn push_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

fn push_u16_le(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u32_le(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_i16_le(buf: &mut Vec<u8>, v: i16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_i64_le(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_f64_le(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    push_u16_le(buf, bytes.len() as u16);
    buf.extend_from_slice(bytes);
}

fn push_count(buf: &mut Vec<u8>, c: Option<u8>) {
    debug_assert!(c != Some(COUNT_ALL), "count {COUNT_ALL} is the all-marker");
    push_u8(buf, c.unwrap_or(COUNT_ALL));
}

fn push_rk(buf: &mut Vec<u8>, rk: Rk) {
    match rk {
        Rk::Reg(r) => {
            push_u8(buf, 0);
            push_u8(buf, r);
        }
        Rk::Const(k) => {
            push_u8(buf, 1);
            push_u16_le(buf, k);
        }
    }
}

// ── Proto encoder ──────────────────────────────────────────────────────────

fn encode_proto(proto: &Proto, buf: &mut Vec<u8>) {
    // source + shape
    push_str(buf, &proto.source);
    push_u8(buf, proto.param_count);
    push_u8(buf, proto.is_vararg as u8);
    push_u8(buf, proto.max_registers);

    // constants
    push_u16_le(buf, proto.constants.len() as u16);
    for c in &proto.constants {
        encode_constant(c, buf);
    }

    // names
    push_u16_le(buf, proto.names.len() as u16);
    for name in &proto.names {
        push_str(buf, name);
    }

    // upvalue_descs
    push_u16_le(buf, proto.upvalue_descs.len() as u16);
    for desc in &proto.upvalue_descs {
        match desc {
            UpvalueDesc::Stack(reg) => {
                push_u8(buf, 0);
                push_u8(buf, *reg);
            }
            UpvalueDesc::Upvalue(idx) => {
                push_u8(buf, 1);
                push_u8(buf, *idx);
            }
        }
    }

    // line table
    push_u32_le(buf, proto.lines.len() as u32);
    for line in &proto.lines {
        push_u32_le(buf, *line);
    }

    // nested protos
    push_u16_le(buf, proto.protos.len() as u16);
    for p in &proto.protos {
        encode_proto(p, buf);
    }

    // instructions
    push_u32_le(buf, proto.instructions.len() as u32);
    for op in &proto.instructions {
        encode_opcode(op, buf);
    }
}

fn encode_constant(val: &Constant, buf: &mut Vec<u8>) {
    match val {
        Constant::Nil => {
            push_u8(buf, 0);
        }
        Constant::Boolean(b) => {
            push_u8(buf, 1);
            push_u8(buf, *b as u8);
        }
        Constant::Integer(n) => {
            push_u8(buf, 2);
            push_i64_le(buf, *n);
        }
        Constant::Float(f) => {
            push_u8(buf, 3);
            push_f64_le(buf, *f);
        }
        Constant::Str(s) => {
            push_u8(buf, 4);
            push_str(buf, s);
        }
    }
}

fn arith_tag(op: ArithOp) -> u8 {
    match op {
        ArithOp::Add => 0,
        ArithOp::Sub => 1,
        ArithOp::Mul => 2,
        ArithOp::Mod => 3,
        ArithOp::Pow => 4,
        ArithOp::Div => 5,
        ArithOp::IDiv => 6,
        ArithOp::BAnd => 7,
        ArithOp::BOr => 8,
        ArithOp::BXor => 9,
        ArithOp::Shl => 10,
        ArithOp::Shr => 11,
    }
}

fn encode_opcode(op: &OpCode, buf: &mut Vec<u8>) {
    match op {
        OpCode::LoadConst { dst, index } => {
            push_u8(buf, 0);
            push_u8(buf, *dst);
            push_u16_le(buf, *index);
        }
        OpCode::LoadNil { dst, count } => {
            push_u8(buf, 1);
            push_u8(buf, *dst);
            push_u8(buf, *count);
        }
        OpCode::LoadBool { dst, value, skip } => {
            push_u8(buf, 2);
            push_u8(buf, *dst);
            push_u8(buf, *value as u8);
            push_u8(buf, *skip as u8);
        }
        OpCode::Move { dst, src } => {
            push_u8(buf, 3);
            push_u8(buf, *dst);
            push_u8(buf, *src);
        }
        OpCode::GetUpvalue { dst, index } => {
            push_u8(buf, 4);
            push_u8(buf, *dst);
            push_u8(buf, *index);
        }
        OpCode::SetUpvalue { src, index } => {
            push_u8(buf, 5);
            push_u8(buf, *src);
            push_u8(buf, *index);
        }
        OpCode::CloseUpvalues { from } => {
            push_u8(buf, 6);
            push_u8(buf, *from);
        }
        OpCode::Closure { dst, proto } => {
            push_u8(buf, 7);
            push_u8(buf, *dst);
            push_u16_le(buf, *proto);
        }
        OpCode::GetGlobal { dst, name } => {
            push_u8(buf, 8);
            push_u8(buf, *dst);
            push_u16_le(buf, *name);
        }
        OpCode::SetGlobal { src, name } => {
            push_u8(buf, 9);
            push_u8(buf, *src);
            push_u16_le(buf, *name);
        }
        OpCode::NewTable {
            dst,
            array_hint,
            hash_hint,
        } => {
            push_u8(buf, 10);
            push_u8(buf, *dst);
            push_u8(buf, *array_hint);
            push_u8(buf, *hash_hint);
        }
        OpCode::GetTable { dst, table, key } => {
            push_u8(buf, 11);
            push_u8(buf, *dst);
            push_u8(buf, *table);
            push_rk(buf, *key);
        }
        OpCode::SetTable { table, key, value } => {
            push_u8(buf, 12);
            push_u8(buf, *table);
            push_rk(buf, *key);
            push_rk(buf, *value);
        }
        OpCode::SetList {
            table,
            count,
            batch,
        } => {
            push_u8(buf, 13);
            push_u8(buf, *table);
            push_count(buf, *count);
            push_u16_le(buf, *batch);
        }
        OpCode::Arith { op, dst, lhs, rhs } => {
            push_u8(buf, 14);
            push_u8(buf, arith_tag(*op));
            push_u8(buf, *dst);
            push_rk(buf, *lhs);
            push_rk(buf, *rhs);
        }
        OpCode::Unm { dst, src } => {
            push_u8(buf, 15);
            push_u8(buf, *dst);
            push_u8(buf, *src);
        }
        OpCode::BNot { dst, src } => {
            push_u8(buf, 16);
            push_u8(buf, *dst);
            push_u8(buf, *src);
        }
        OpCode::Not { dst, src } => {
            push_u8(buf, 17);
            push_u8(buf, *dst);
            push_u8(buf, *src);
        }
        OpCode::Len { dst, src } => {
            push_u8(buf, 18);
            push_u8(buf, *dst);
            push_u8(buf, *src);
        }
        OpCode::Concat { dst, from, to } => {
            push_u8(buf, 19);
            push_u8(buf, *dst);
            push_u8(buf, *from);
            push_u8(buf, *to);
        }
        OpCode::Eq { dst, lhs, rhs } => {
            push_u8(buf, 20);
            push_u8(buf, *dst);
            push_rk(buf, *lhs);
            push_rk(buf, *rhs);
        }
        OpCode::Lt { dst, lhs, rhs } => {
            push_u8(buf, 21);
            push_u8(buf, *dst);
            push_rk(buf, *lhs);
            push_rk(buf, *rhs);
        }
        OpCode::Le { dst, lhs, rhs } => {
            push_u8(buf, 22);
            push_u8(buf, *dst);
            push_rk(buf, *lhs);
            push_rk(buf, *rhs);
        }
        OpCode::Jump { offset } => {
            push_u8(buf, 23);
            push_i16_le(buf, *offset);
        }
        OpCode::JumpIfTrue { src, offset } => {
            push_u8(buf, 24);
            push_u8(buf, *src);
            push_i16_le(buf, *offset);
        }
        OpCode::JumpIfFalse { src, offset } => {
            push_u8(buf, 25);
            push_u8(buf, *src);
            push_i16_le(buf, *offset);
        }
        OpCode::ForPrep { base, offset } => {
            push_u8(buf, 26);
            push_u8(buf, *base);
            push_i16_le(buf, *offset);
        }
        OpCode::ForLoop { base, offset } => {
            push_u8(buf, 27);
            push_u8(buf, *base);
            push_i16_le(buf, *offset);
        }
        OpCode::TForCall { base, want } => {
            push_u8(buf, 28);
            push_u8(buf, *base);
            push_u8(buf, *want);
        }
        OpCode::TForLoop { base, offset } => {
            push_u8(buf, 29);
            push_u8(buf, *base);
            push_i16_le(buf, *offset);
        }
        OpCode::VarArg { dst, want } => {
            push_u8(buf, 30);
            push_u8(buf, *dst);
            push_count(buf, *want);
        }
        OpCode::Call {
            func,
            args,
            results,
        } => {
            push_u8(buf, 31);
            push_u8(buf, *func);
            push_count(buf, *args);
            push_count(buf, *results);
        }
        OpCode::TailCall { func, args } => {
            push_u8(buf, 32);
            push_u8(buf, *func);
            push_count(buf, *args);
        }
        OpCode::Return { first, count } => {
            push_u8(buf, 33);
            push_u8(buf, *first);
            push_count(buf, *count);
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encode a compiled `Chunk` to a byte vector suitable for writing to disk.
pub fn encode_chunk(chunk: &Chunk) -> Vec<u8> {
    let mut buf = MAGIC.to_vec();
    encode_proto(&chunk.proto, &mut buf);
    buf
}
