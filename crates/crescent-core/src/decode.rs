//! Binary decoder: `&[u8]` → `Chunk`.
//!
//! Mirrors the encoding in `encode.rs` exactly.  This pair of functions is
//! the loader seam: the VM itself never parses binaries.

use std::sync::Arc;

use crate::chunk::{Chunk, Constant, Proto, UpvalueDesc};
use crate::encode::{COUNT_ALL, MAGIC};
use crate::error::ChunkError;
use crate::opcode::{ArithOp, OpCode, Rk};

// ── Cursor reader ─────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ChunkError> {
        if self.remaining() < n {
            return Err(ChunkError::Truncated {
                needed: n,
                offset: self.pos,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ChunkError> {
        let b = self.read_bytes(1)?;
        Ok(b[0])
    }

    fn read_u16_le(&mut self) -> Result<u16, ChunkError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32_le(&mut self) -> Result<u32, ChunkError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i16_le(&mut self) -> Result<i16, ChunkError> {
        let b = self.read_bytes(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn read_i64_le(&mut self) -> Result<i64, ChunkError> {
        let b = self.read_bytes(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_f64_le(&mut self) -> Result<f64, ChunkError> {
        let b = self.read_bytes(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_str(&mut self) -> Result<String, ChunkError> {
        let len = self.read_u16_le()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    fn read_count(&mut self) -> Result<Option<u8>, ChunkError> {
        let b = self.read_u8()?;
        Ok(if b == COUNT_ALL { None } else { Some(b) })
    }

    fn read_rk(&mut self) -> Result<Rk, ChunkError> {
        match self.read_u8()? {
            0 => Ok(Rk::Reg(self.read_u8()?)),
            1 => Ok(Rk::Const(self.read_u16_le()?)),
            tag => Err(ChunkError::UnknownTag {
                what: "operand",
                tag,
            }),
        }
    }
}

// ── Proto decoder ─────────────────────────────────────────────────────────────

fn decode_proto(r: &mut Reader<'_>) -> Result<Proto, ChunkError> {
    let source = r.read_str()?;
    let param_count = r.read_u8()?;
    let is_vararg = r.read_u8()? != 0;
    let max_registers = r.read_u8()?;

    // constants
    let const_count = r.read_u16_le()? as usize;
    let mut constants = Vec::with_capacity(const_count);
    for _ in 0..const_count {
        constants.push(decode_constant(r)?);
    }

    // names
    let name_count = r.read_u16_le()? as usize;
    let mut names = Vec::with_capacity(name_count);
    for _ in 0..name_count {
        names.push(Arc::from(r.read_str()?));
    }

    // upvalue_descs
    let upval_count = r.read_u16_le()? as usize;
    let mut upvalue_descs = Vec::with_capacity(upval_count);
    for _ in 0..upval_count {
        let tag = r.read_u8()?;
        let val = r.read_u8()?;
        let desc = match tag {
            0 => UpvalueDesc::Stack(val),
            1 => UpvalueDesc::Upvalue(val),
            tag => {
                return Err(ChunkError::UnknownTag {
                    what: "upvalue",
                    tag,
                })
            }
        };
        upvalue_descs.push(desc);
    }

    // line table
    let line_count = r.read_u32_le()? as usize;
    let mut lines = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        lines.push(r.read_u32_le()?);
    }

    // nested protos
    let proto_count = r.read_u16_le()? as usize;
    let mut protos = Vec::with_capacity(proto_count);
    for _ in 0..proto_count {
        protos.push(Arc::new(decode_proto(r)?));
    }

    // instructions
    let instr_count = r.read_u32_le()? as usize;
    let mut instructions = Vec::with_capacity(instr_count);
    for _ in 0..instr_count {
        instructions.push(decode_opcode(r)?);
    }

    Ok(Proto {
        instructions,
        constants,
        names,
        protos,
        upvalue_descs,
        param_count,
        is_vararg,
        max_registers,
        source: Arc::from(source),
        lines,
    })
}

fn decode_constant(r: &mut Reader<'_>) -> Result<Constant, ChunkError> {
    let tag = r.read_u8()?;
    match tag {
        0 => Ok(Constant::Nil),
        1 => Ok(Constant::Boolean(r.read_u8()? != 0)),
        2 => Ok(Constant::Integer(r.read_i64_le()?)),
        3 => Ok(Constant::Float(r.read_f64_le()?)),
        4 => Ok(Constant::Str(Arc::from(r.read_str()?))),
        tag => Err(ChunkError::UnknownTag {
            what: "constant",
            tag,
        }),
    }
}

fn decode_arith_op(r: &mut Reader<'_>) -> Result<ArithOp, ChunkError> {
    let tag = r.read_u8()?;
    match tag {
        0 => Ok(ArithOp::Add),
        1 => Ok(ArithOp::Sub),
        2 => Ok(ArithOp::Mul),
        3 => Ok(ArithOp::Mod),
        4 => Ok(ArithOp::Pow),
        5 => Ok(ArithOp::Div),
        6 => Ok(ArithOp::IDiv),
        7 => Ok(ArithOp::BAnd),
        8 => Ok(ArithOp::BOr),
        9 => Ok(ArithOp::BXor),
        10 => Ok(ArithOp::Shl),
        11 => Ok(ArithOp::Shr),
        tag => Err(ChunkError::UnknownTag {
            what: "operator",
            tag,
        }),
    }
}

fn decode_opcode(r: &mut Reader<'_>) -> Result<OpCode, ChunkError> {
    let tag = r.read_u8()?;
    match tag {
        0 => Ok(OpCode::LoadConst {
            dst: r.read_u8()?,
            index: r.read_u16_le()?,
        }),
        1 => Ok(OpCode::LoadNil {
            dst: r.read_u8()?,
            count: r.read_u8()?,
        }),
        2 => Ok(OpCode::LoadBool {
            dst: r.read_u8()?,
            value: r.read_u8()? != 0,
            skip: r.read_u8()? != 0,
        }),
        3 => Ok(OpCode::Move {
            dst: r.read_u8()?,
            src: r.read_u8()?,
        }),
        4 => Ok(OpCode::GetUpvalue {
            dst: r.read_u8()?,
            index: r.read_u8()?,
        }),
        5 => Ok(OpCode::SetUpvalue {
            src: r.read_u8()?,
            index: r.read_u8()?,
        }),
        6 => Ok(OpCode::CloseUpvalues { from: r.read_u8()? }),
        7 => Ok(OpCode::Closure {
            dst: r.read_u8()?,
            proto: r.read_u16_le()?,
        }),
        8 => Ok(OpCode::GetGlobal {
            dst: r.read_u8()?,
            name: r.read_u16_le()?,
        }),
        9 => Ok(OpCode::SetGlobal {
            src: r.read_u8()?,
            name: r.read_u16_le()?,
        }),
        10 => Ok(OpCode::NewTable {
            dst: r.read_u8()?,
            array_hint: r.read_u8()?,
            hash_hint: r.read_u8()?,
        }),
        11 => Ok(OpCode::GetTable {
            dst: r.read_u8()?,
            table: r.read_u8()?,
            key: r.read_rk()?,
        }),
        12 => Ok(OpCode::SetTable {
            table: r.read_u8()?,
            key: r.read_rk()?,
            value: r.read_rk()?,
        }),
        13 => Ok(OpCode::SetList {
            table: r.read_u8()?,
            count: r.read_count()?,
            batch: r.read_u16_le()?,
        }),
        14 => Ok(OpCode::Arith {
            op: decode_arith_op(r)?,
            dst: r.read_u8()?,
            lhs: r.read_rk()?,
            rhs: r.read_rk()?,
        }),
        15 => Ok(OpCode::Unm {
            dst: r.read_u8()?,
            src: r.read_u8()?,
        }),
        16 => Ok(OpCode::BNot {
            dst: r.read_u8()?,
            src: r.read_u8()?,
        }),
        17 => Ok(OpCode::Not {
            dst: r.read_u8()?,
            src: r.read_u8()?,
        }),
        18 => Ok(OpCode::Len {
            dst: r.read_u8()?,
            src: r.read_u8()?,
        }),
        19 => Ok(OpCode::Concat {
            dst: r.read_u8()?,
            from: r.read_u8()?,
            to: r.read_u8()?,
        }),
        20 => Ok(OpCode::Eq {
            dst: r.read_u8()?,
            lhs: r.read_rk()?,
            rhs: r.read_rk()?,
        }),
        21 => Ok(OpCode::Lt {
            dst: r.read_u8()?,
            lhs: r.read_rk()?,
            rhs: r.read_rk()?,
        }),
        22 => Ok(OpCode::Le {
            dst: r.read_u8()?,
            lhs: r.read_rk()?,
            rhs: r.read_rk()?,
        }),
        23 => Ok(OpCode::Jump {
            offset: r.read_i16_le()?,
        }),
        24 => Ok(OpCode::JumpIfTrue {
            src: r.read_u8()?,
            offset: r.read_i16_le()?,
        }),
        25 => Ok(OpCode::JumpIfFalse {
            src: r.read_u8()?,
            offset: r.read_i16_le()?,
        }),
        26 => Ok(OpCode::ForPrep {
            base: r.read_u8()?,
            offset: r.read_i16_le()?,
        }),
        27 => Ok(OpCode::ForLoop {
            base: r.read_u8()?,
            offset: r.read_i16_le()?,
        }),
        28 => Ok(OpCode::TForCall {
            base: r.read_u8()?,
            want: r.read_u8()?,
        }),
        29 => Ok(OpCode::TForLoop {
            base: r.read_u8()?,
            offset: r.read_i16_le()?,
        }),
        30 => Ok(OpCode::VarArg {
            dst: r.read_u8()?,
            want: r.read_count()?,
        }),
        31 => Ok(OpCode::Call {
            func: r.read_u8()?,
            args: r.read_count()?,
            results: r.read_count()?,
        }),
        32 => Ok(OpCode::TailCall {
            func: r.read_u8()?,
            args: r.read_count()?,
        }),
        33 => Ok(OpCode::Return {
            first: r.read_u8()?,
            count: r.read_count()?,
        }),
        tag => Err(ChunkError::UnknownTag { what: "opcode", tag }),
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Quick check whether `bytes` starts like a compiled crescent unit.
pub fn is_valid_unit(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

/// Decode a byte slice (previously produced by `encode_chunk`) back into a
/// runnable [`Chunk`].
pub fn load_unit(bytes: &[u8]) -> Result<Chunk, ChunkError> {
    if !is_valid_unit(bytes) {
        return Err(ChunkError::BadMagic);
    }
    let mut r = Reader::new(&bytes[MAGIC.len()..]);
    let proto = decode_proto(&mut r)?;
    Ok(Chunk::new(proto))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ProtoBuilder;
    use crate::encode::encode_chunk;

    fn sample_chunk() -> Chunk {
        let mut inner = ProtoBuilder::new("sample");
        inner.param_count = 1;
        inner.max_registers = 2;
        inner.upvalue_descs.push(UpvalueDesc::Stack(0));
        inner.emit(OpCode::GetUpvalue { dst: 1, index: 0 });
        inner.emit(OpCode::Return {
            first: 1,
            count: Some(1),
        });

        let mut b = ProtoBuilder::new("sample");
        b.is_vararg = true;
        b.max_registers = 4;
        let k = b.add_constant(Constant::Float(0.5));
        let n = b.add_name("answer");
        let p = b.add_proto(Arc::new(inner.finish()));
        b.emit_at(OpCode::LoadConst { dst: 0, index: k }, 1);
        b.emit_at(OpCode::Closure { dst: 1, proto: p }, 2);
        b.emit_at(OpCode::SetGlobal { src: 1, name: n }, 2);
        b.emit_at(
            OpCode::Arith {
                op: ArithOp::Shl,
                dst: 2,
                lhs: Rk::Const(k),
                rhs: Rk::Reg(0),
            },
            3,
        );
        b.emit_at(OpCode::VarArg { dst: 3, want: None }, 4);
        b.emit_at(OpCode::Return { first: 0, count: None }, 4);
        Chunk::new(b.finish())
    }

    #[test]
    fn round_trips_a_nested_unit() {
        let chunk = sample_chunk();
        let bytes = encode_chunk(&chunk);
        assert!(is_valid_unit(&bytes));
        let back = load_unit(&bytes).unwrap();
        assert_eq!(*back.proto, *chunk.proto);
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(!is_valid_unit(b"\x1bLuaQ"));
        assert!(matches!(load_unit(b"garbage"), Err(ChunkError::BadMagic)));
    }

    #[test]
    fn rejects_truncated_data() {
        let bytes = encode_chunk(&sample_chunk());
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(
            load_unit(cut),
            Err(ChunkError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_unknown_opcode_tag() {
        let mut bytes = encode_chunk(&sample_chunk());
        // corrupt the final Return opcode tag
        let n = bytes.len();
        bytes[n - 3] = 250;
        assert!(matches!(
            load_unit(&bytes),
            Err(ChunkError::UnknownTag { what: "opcode", .. })
        ));
    }
}
