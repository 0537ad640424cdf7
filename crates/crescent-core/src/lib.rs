//! `crescent-core` — the compiled-unit contract shared across the crescent workspace.
//!
//! This crate defines:
//! - [`Proto`] / [`Chunk`]: the immutable compiled-function unit and its builder
//! - Bytecode [`OpCode`] definitions and operand types
//! - The binary unit codec ([`encode_chunk`], [`load_unit`], [`is_valid_unit`])
//! - [`disassemble`] for debugging units
//!
//! The execution engine lives in `crescent-vm`; front ends only need this
//! crate to produce runnable units.

pub mod chunk;
pub mod decode;
pub mod disasm;
pub mod encode;
pub mod error;
pub mod opcode;

pub use chunk::{Chunk, Constant, Proto, ProtoBuilder, UpvalueDesc};
pub use decode::{is_valid_unit, load_unit};
pub use disasm::disassemble;
pub use encode::{encode_chunk, MAGIC};
pub use error::ChunkError;
pub use opcode::{ArithOp, OpCode, Rk, FIELDS_PER_FLUSH};
