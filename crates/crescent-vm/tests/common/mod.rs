//! Shared helpers for the integration suite: hand-assembled units executed
//! through the public handle.

use std::sync::Arc;

use crescent_core::{ArithOp, Constant, OpCode, ProtoBuilder, Rk};
use crescent_vm::{Lua, LuaValue};

/// Run a finished builder as the main chunk and hand back its first result.
/// `Err` carries the error value of an unprotected failure.
pub fn run_proto_in(lua: &Lua, b: ProtoBuilder) -> Result<LuaValue, LuaValue> {
    lua.load_proto(Arc::new(b.finish()));
    lua.call(0, Some(1))?;
    Ok(lua.with_state(|st| {
        let v = st.value(-1);
        st.pop(1);
        v
    }))
}

#[allow(dead_code)]
pub fn run_proto(b: ProtoBuilder) -> Result<LuaValue, LuaValue> {
    run_proto_in(&Lua::new(), b)
}

/// `return a <op> b`, both operands drawn from the constant pool.
#[allow(dead_code)]
pub fn eval_arith(op: ArithOp, a: Constant, b: Constant) -> Result<LuaValue, LuaValue> {
    let mut unit = ProtoBuilder::new("arith");
    let ka = unit.add_constant(a);
    let kb = unit.add_constant(b);
    unit.emit(OpCode::Arith {
        op,
        dst: 0,
        lhs: Rk::Const(ka),
        rhs: Rk::Const(kb),
    });
    unit.emit(OpCode::Return {
        first: 0,
        count: Some(1),
    });
    unit.max_registers = 1;
    run_proto(unit)
}

/// One comparison instruction over two constants; `op` picks which.
#[allow(dead_code)]
pub fn eval_compare(
    op: fn(u8, Rk, Rk) -> OpCode,
    a: Constant,
    b: Constant,
) -> Result<LuaValue, LuaValue> {
    let mut unit = ProtoBuilder::new("compare");
    let ka = unit.add_constant(a);
    let kb = unit.add_constant(b);
    unit.emit(op(0, Rk::Const(ka), Rk::Const(kb)));
    unit.emit(OpCode::Return {
        first: 0,
        count: Some(1),
    });
    unit.max_registers = 1;
    run_proto(unit)
}
