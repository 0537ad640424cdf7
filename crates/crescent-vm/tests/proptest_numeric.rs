//! Arithmetic and comparison properties of the two-subtype number model,
//! checked through fully executed units.
//!
//! - integer `+`/`-`/`*` wrap at 64 bits
//! - any float operand promotes the result to float
//! - `/` always produces a float
//! - comparisons agree with the host ordering; NaN compares false everywhere
//! - integer/float equality is exact, never rounded

mod common;

use common::{eval_arith, eval_compare, run_proto};
use crescent_core::{ArithOp, Constant, OpCode, ProtoBuilder};
use crescent_vm::LuaValue;
use proptest::prelude::*;

fn arb_finite_float() -> impl Strategy<Value = f64> {
    any::<f64>().prop_filter("finite", |f| f.is_finite())
}

fn eq(dst: u8, lhs: crescent_core::Rk, rhs: crescent_core::Rk) -> OpCode {
    OpCode::Eq { dst, lhs, rhs }
}

fn lt(dst: u8, lhs: crescent_core::Rk, rhs: crescent_core::Rk) -> OpCode {
    OpCode::Lt { dst, lhs, rhs }
}

fn le(dst: u8, lhs: crescent_core::Rk, rhs: crescent_core::Rk) -> OpCode {
    OpCode::Le { dst, lhs, rhs }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn integer_add_wraps(a in any::<i64>(), b in any::<i64>()) {
        let got = eval_arith(ArithOp::Add, Constant::Integer(a), Constant::Integer(b)).unwrap();
        prop_assert_eq!(got, LuaValue::Integer(a.wrapping_add(b)));
    }

    #[test]
    fn integer_sub_and_mul_wrap(a in any::<i64>(), b in any::<i64>()) {
        let got = eval_arith(ArithOp::Sub, Constant::Integer(a), Constant::Integer(b)).unwrap();
        prop_assert_eq!(got, LuaValue::Integer(a.wrapping_sub(b)));
        let got = eval_arith(ArithOp::Mul, Constant::Integer(a), Constant::Integer(b)).unwrap();
        prop_assert_eq!(got, LuaValue::Integer(a.wrapping_mul(b)));
    }

    #[test]
    fn mixed_operands_promote_to_float(a in any::<i64>(), b in arb_finite_float()) {
        let got = eval_arith(ArithOp::Add, Constant::Integer(a), Constant::Float(b)).unwrap();
        match got {
            LuaValue::Float(f) => prop_assert_eq!(f.to_bits(), (a as f64 + b).to_bits()),
            other => prop_assert!(false, "expected a float, got {:?}", other),
        }
    }

    #[test]
    fn division_always_floats(a in any::<i64>(), b in any::<i64>()) {
        let got = eval_arith(ArithOp::Div, Constant::Integer(a), Constant::Integer(b)).unwrap();
        match got {
            LuaValue::Float(f) => {
                prop_assert_eq!(f.to_bits(), (a as f64 / b as f64).to_bits())
            }
            other => prop_assert!(false, "expected a float, got {:?}", other),
        }
    }

    #[test]
    fn double_negation_is_identity(a in any::<i64>()) {
        let mut b = ProtoBuilder::new("unm");
        let k = b.add_constant(Constant::Integer(a));
        b.emit(OpCode::LoadConst { dst: 0, index: k });
        b.emit(OpCode::Unm { dst: 1, src: 0 });
        b.emit(OpCode::Unm { dst: 2, src: 1 });
        b.emit(OpCode::Return { first: 2, count: Some(1) });
        b.max_registers = 3;
        prop_assert_eq!(run_proto(b).unwrap(), LuaValue::Integer(a));
    }

    #[test]
    fn integer_comparisons_match_host_order(a in any::<i64>(), b in any::<i64>()) {
        let got = eval_compare(lt, Constant::Integer(a), Constant::Integer(b)).unwrap();
        prop_assert_eq!(got, LuaValue::Boolean(a < b));
        let got = eval_compare(le, Constant::Integer(a), Constant::Integer(b)).unwrap();
        prop_assert_eq!(got, LuaValue::Boolean(a <= b));
        let got = eval_compare(eq, Constant::Integer(a), Constant::Integer(b)).unwrap();
        prop_assert_eq!(got, LuaValue::Boolean(a == b));
    }

    #[test]
    fn float_comparisons_match_host_order(a in arb_finite_float(), b in arb_finite_float()) {
        let got = eval_compare(lt, Constant::Float(a), Constant::Float(b)).unwrap();
        prop_assert_eq!(got, LuaValue::Boolean(a < b));
        let got = eval_compare(le, Constant::Float(a), Constant::Float(b)).unwrap();
        prop_assert_eq!(got, LuaValue::Boolean(a <= b));
    }

    #[test]
    fn small_integers_equal_their_float_twins(n in -(1i64 << 53)..(1i64 << 53)) {
        let got = eval_compare(eq, Constant::Integer(n), Constant::Float(n as f64)).unwrap();
        prop_assert_eq!(got, LuaValue::Boolean(true));
    }
}

#[test]
fn nan_is_never_equal_less_or_less_equal() {
    for cmp in [eq, lt, le] {
        let got = eval_compare(cmp, Constant::Float(f64::NAN), Constant::Float(f64::NAN)).unwrap();
        assert_eq!(got, LuaValue::Boolean(false));
    }
    let got = eval_compare(eq, Constant::Float(f64::NAN), Constant::Integer(0)).unwrap();
    assert_eq!(got, LuaValue::Boolean(false));
}

#[test]
fn equality_at_the_precision_edge_is_exact() {
    // 2^63 as a float sits just above i64::MAX
    let got = eval_compare(
        eq,
        Constant::Integer(i64::MAX),
        Constant::Float(9_223_372_036_854_775_808.0),
    )
    .unwrap();
    assert_eq!(got, LuaValue::Boolean(false));
    let got = eval_compare(
        lt,
        Constant::Integer(i64::MAX),
        Constant::Float(9_223_372_036_854_775_808.0),
    )
    .unwrap();
    assert_eq!(got, LuaValue::Boolean(true));
}
