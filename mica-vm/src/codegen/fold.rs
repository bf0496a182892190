//! Compile-time arithmetic on literal operands.
//!
//! Folding refuses anything that could raise at runtime (division or modulo
//! by zero, bitwise operands with no exact integer value) and any float
//! result that would change observable identity (NaN, negative zero).

use super::expr::ExpKind;
use super::operators::{BinOp, UnOp};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

fn numeral(kind: ExpKind) -> Option<Num> {
    match kind {
        ExpKind::Int(i) => Some(Num::Int(i)),
        ExpKind::Float(f) => Some(Num::Float(f)),
        _ => None,
    }
}

fn as_float(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

// An exact integer view, accepting floats with integral value.
fn as_int(n: Num) -> Option<i64> {
    match n {
        Num::Int(i) => Some(i),
        Num::Float(f) => {
            if f == (f as i64) as f64 {
                Some(f as i64)
            } else {
                None
            }
        }
    }
}

// Floored integer division, wrapping on overflow like the runtime does.
fn int_idiv(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if (a ^ b) < 0 && q.wrapping_mul(b) != a {
        q - 1
    } else {
        q
    }
}

// Modulo with the sign of the divisor.
fn int_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        r + b
    } else {
        r
    }
}

fn float_mod(a: f64, b: f64) -> f64 {
    let m = a % b;
    if m * b < 0.0 {
        m + b
    } else {
        m
    }
}

// Left shift with the runtime's semantics: counts past the width produce
// zero, negative counts shift the other way.
fn int_shl(a: i64, b: i64) -> i64 {
    if b < 0 {
        int_shr(a, b.wrapping_neg())
    } else if b >= 64 {
        0
    } else {
        ((a as u64) << b) as i64
    }
}

fn int_shr(a: i64, b: i64) -> i64 {
    if b < 0 {
        int_shl(a, b.wrapping_neg())
    } else if b >= 64 {
        0
    } else {
        ((a as u64) >> b) as i64
    }
}

fn int_arith(op: BinOp, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Mod => {
            if b == 0 {
                return None; // raises at runtime
            }
            int_mod(a, b)
        }
        BinOp::IDiv => {
            if b == 0 {
                return None;
            }
            int_idiv(a, b)
        }
        BinOp::BAnd => a & b,
        BinOp::BOr => a | b,
        BinOp::BXor => a ^ b,
        BinOp::Shl => int_shl(a, b),
        BinOp::Shr => int_shr(a, b),
        _ => return None,
    })
}

fn float_arith(op: BinOp, a: f64, b: f64) -> Option<f64> {
    Some(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Pow => a.powf(b),
        BinOp::IDiv => (a / b).floor(),
        BinOp::Mod => float_mod(a, b),
        _ => return None,
    })
}

fn check_float(f: f64) -> Option<ExpKind> {
    if f.is_nan() || (f == 0.0 && f.is_sign_negative()) {
        // would change observable identity at runtime
        None
    } else {
        Some(ExpKind::Float(f))
    }
}

/// Fold a binary operation over two literal descriptor kinds.
pub(crate) fn fold_binary(op: BinOp, k1: ExpKind, k2: ExpKind) -> Option<ExpKind> {
    let a = numeral(k1)?;
    let b = numeral(k2)?;
    match op {
        BinOp::BAnd | BinOp::BOr | BinOp::BXor | BinOp::Shl | BinOp::Shr => {
            let r = int_arith(op, as_int(a)?, as_int(b)?)?;
            Some(ExpKind::Int(r))
        }
        // division and modulo by zero never fold, whatever the numeric kind
        BinOp::Div | BinOp::Mod | BinOp::IDiv if as_float(b) == 0.0 => None,
        BinOp::Div | BinOp::Pow => check_float(float_arith(op, as_float(a), as_float(b))?),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Mod | BinOp::IDiv => {
            match (a, b) {
                (Num::Int(x), Num::Int(y)) => Some(ExpKind::Int(int_arith(op, x, y)?)),
                _ => check_float(float_arith(op, as_float(a), as_float(b))?),
            }
        }
        _ => None,
    }
}

/// Fold a unary operation; reuses the binary path with a fake zero operand.
pub(crate) fn fold_unary(op: UnOp, k: ExpKind) -> Option<ExpKind> {
    match op {
        UnOp::Minus => fold_binary(BinOp::Sub, ExpKind::Int(0), k),
        UnOp::BNot => {
            let n = numeral(k)?;
            Some(ExpKind::Int(!as_int(n)?))
        }
        UnOp::Not | UnOp::Len => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(BinOp::Add, ExpKind::Int(2), ExpKind::Int(3), Some(ExpKind::Int(5)); "int add")]
    #[test_case(BinOp::Div, ExpKind::Int(1), ExpKind::Int(2), Some(ExpKind::Float(0.5)); "div is float")]
    #[test_case(BinOp::IDiv, ExpKind::Int(7), ExpKind::Int(2), Some(ExpKind::Int(3)); "idiv floors")]
    #[test_case(BinOp::IDiv, ExpKind::Int(-7), ExpKind::Int(2), Some(ExpKind::Int(-4)); "idiv floors negative")]
    #[test_case(BinOp::Mod, ExpKind::Int(-5), ExpKind::Int(3), Some(ExpKind::Int(1)); "mod follows divisor sign")]
    #[test_case(BinOp::IDiv, ExpKind::Int(1), ExpKind::Int(0), None; "int division by zero raises")]
    #[test_case(BinOp::Mod, ExpKind::Int(1), ExpKind::Int(0), None; "int modulo by zero raises")]
    #[test_case(BinOp::Div, ExpKind::Float(0.0), ExpKind::Float(-1.0), None; "negative zero is not folded")]
    #[test_case(BinOp::Div, ExpKind::Float(0.0), ExpKind::Float(0.0), None; "nan is not folded")]
    #[test_case(BinOp::BAnd, ExpKind::Float(3.0), ExpKind::Int(1), Some(ExpKind::Int(1)); "integral float converts for bitwise")]
    #[test_case(BinOp::BAnd, ExpKind::Float(3.5), ExpKind::Int(1), None; "fractional float refuses bitwise")]
    #[test_case(BinOp::Shl, ExpKind::Int(1), ExpKind::Int(70), Some(ExpKind::Int(0)); "oversized shift is zero")]
    #[test_case(BinOp::Shl, ExpKind::Int(8), ExpKind::Int(-2), Some(ExpKind::Int(2)); "negative shift reverses")]
    fn binary_folding(op: BinOp, a: ExpKind, b: ExpKind, expected: Option<ExpKind>) {
        assert_eq!(fold_binary(op, a, b), expected);
    }

    #[test]
    fn unary_minus_uses_fake_zero() {
        assert_eq!(
            fold_unary(UnOp::Minus, ExpKind::Int(7)),
            Some(ExpKind::Int(-7))
        );
        assert_eq!(
            fold_unary(UnOp::Minus, ExpKind::Float(2.5)),
            Some(ExpKind::Float(-2.5))
        );
        // -0.0 would lose its sign bit under folding
        assert_eq!(fold_unary(UnOp::Minus, ExpKind::Float(0.0)), None);
    }

    #[test]
    fn bnot_requires_integer_operand() {
        assert_eq!(fold_unary(UnOp::BNot, ExpKind::Int(0)), Some(ExpKind::Int(-1)));
        assert_eq!(fold_unary(UnOp::BNot, ExpKind::Float(1.5)), None);
    }

    #[test]
    fn division_by_zero_never_folds() {
        assert_eq!(fold_binary(BinOp::Div, ExpKind::Int(1), ExpKind::Int(0)), None);
        assert_eq!(fold_binary(BinOp::IDiv, ExpKind::Int(1), ExpKind::Int(0)), None);
        assert_eq!(
            fold_binary(BinOp::Mod, ExpKind::Float(1.0), ExpKind::Float(0.0)),
            None
        );
    }
}
