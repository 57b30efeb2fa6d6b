//! Symbolic integer expressions used by the mixed-boolean-arithmetic pass
//! (spec §4.5 "Obfuscation passes", grounded on the original's `expression`
//! class).
//!
//! Unlike the original, which matches rewrite rules by comparing two
//! expressions' pretty-printed strings, [`Expression`] derives structural
//! equality directly (spec §9 "Expression rewriting correctness": string
//! equality is fragile against operand reordering and whitespace; comparing
//! the trees themselves is not).

use crate::rng;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Var(&'static str),
    Const(i64),
    Unary(char, Box<Expression>),
    Binary(char, Box<Expression>, Box<Expression>),
}

/// The two named operands every MBA rewrite rule is expressed in terms of
/// (spec's `A`/`B`).
pub const A: Expression = Expression::Var("A");
pub const B: Expression = Expression::Var("B");

impl Expression {
    pub fn constant(value: i64) -> Self {
        Expression::Const(value)
    }

    fn bin(op: char, lhs: Expression, rhs: Expression) -> Self {
        Expression::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    fn un(op: char, operand: Expression) -> Self {
        Expression::Unary(op, Box::new(operand))
    }

    pub fn add(self, rhs: Expression) -> Self {
        Self::bin('+', self, rhs)
    }
    pub fn sub(self, rhs: Expression) -> Self {
        Self::bin('-', self, rhs)
    }
    pub fn xor(self, rhs: Expression) -> Self {
        Self::bin('^', self, rhs)
    }
    pub fn and(self, rhs: Expression) -> Self {
        Self::bin('&', self, rhs)
    }
    pub fn or(self, rhs: Expression) -> Self {
        Self::bin('|', self, rhs)
    }
    pub fn not(self) -> Self {
        Self::un('~', self)
    }
    pub fn neg(self) -> Self {
        Self::un('-', self)
    }

    /// Evaluate a closed expression (no [`Expression::Var`]) masked to
    /// `bits` (8/16/32/64), matching the original's per-width `evaluate<T>`.
    pub fn evaluate(&self, bits: u32) -> i64 {
        let mask = |v: i64| -> i64 {
            if bits >= 64 {
                v
            } else {
                let m = (1i64 << bits) - 1;
                let sign = 1i64 << (bits - 1);
                let masked = v & m;
                if masked & sign != 0 {
                    masked | !m
                } else {
                    masked
                }
            }
        };
        match self {
            Expression::Var(name) => panic!("can't evaluate a free variable '{name}'"),
            Expression::Const(v) => mask(*v),
            Expression::Binary(op, lhs, rhs) => {
                let l = lhs.evaluate(bits);
                let r = rhs.evaluate(bits);
                mask(match op {
                    '+' => l.wrapping_add(r),
                    '-' => l.wrapping_sub(r),
                    '^' => l ^ r,
                    '&' => l & r,
                    '|' => l | r,
                    op => unreachable!("unknown binary operator {op}"),
                })
            }
            Expression::Unary(op, operand) => {
                let v = operand.evaluate(bits);
                mask(match op {
                    '~' => !v,
                    '-' => v.wrapping_neg(),
                    op => unreachable!("unknown unary operator {op}"),
                })
            }
        }
    }

    /// Build an expression tree that evaluates to `target` under `bits`,
    /// without ever containing `target` as a literal (spec's constant-hiding
    /// MBA: random operand pairs combined by a random operator, then a final
    /// correction term restores the intended value).
    pub fn obfuscated_constant(target: i64, bits: u32, depth: u32) -> Self {
        if depth == 0 {
            return Expression::Const(target);
        }

        let left = Self::obfuscated_constant(rng::next::<i64>(), bits, depth - 1);
        let right = Self::obfuscated_constant(rng::next::<i64>(), bits, depth - 1);

        let combined = match rng::below(5) {
            0 => left.add(right),
            1 => left.sub(right),
            2 => left.xor(right),
            3 => left.and(right),
            _ => left.or(right),
        };

        let correction = target.wrapping_sub(combined.evaluate(bits));
        combined.add(Expression::Const(correction))
    }

    /// Replace every subtree structurally equal to `pattern` with
    /// `replacement`, recursing into children first (spec's `transform`).
    pub fn rewrite(&self, pattern: &Expression, replacement: &Expression) -> Expression {
        if self == pattern {
            return replacement.clone();
        }
        match self {
            Expression::Binary(op, lhs, rhs) => Expression::Binary(
                *op,
                Box::new(lhs.rewrite(pattern, replacement)),
                Box::new(rhs.rewrite(pattern, replacement)),
            ),
            Expression::Unary(op, operand) => Expression::Unary(*op, Box::new(operand.rewrite(pattern, replacement))),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Var(name) => write!(f, "{name}"),
            Expression::Const(v) => write!(f, "{v}"),
            Expression::Unary(op, operand) => write!(f, "({op}{operand})"),
            Expression::Binary(op, lhs, rhs) => write!(f, "({lhs}{op}{rhs})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obfuscated_constant_evaluates_to_the_target() {
        for target in [0i64, 1, -1, 12345, i32::MIN as i64] {
            let expr = Expression::obfuscated_constant(target, 32, 3);
            assert_eq!(expr.evaluate(32), target as i32 as i64);
        }
    }

    #[test]
    fn rewrite_replaces_structurally_equal_subtrees() {
        let expr = A.clone().xor(B.clone());
        let rewritten = expr.rewrite(&A.clone().xor(B.clone()), &A.clone().or(B.clone()));
        assert_eq!(rewritten, A.clone().or(B.clone()));
    }

    #[test]
    fn rewrite_is_a_no_op_when_the_pattern_does_not_occur() {
        let expr = A.clone().add(B.clone());
        let rewritten = expr.rewrite(&A.clone().xor(B.clone()), &Expression::constant(0));
        assert_eq!(rewritten, expr);
    }
}
