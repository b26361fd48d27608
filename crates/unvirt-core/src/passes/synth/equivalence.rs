/*! Equivalence checking for synthesized replacements.
 *
 * A replacement is only ever substituted after a proof that it agrees with the reference on every
 * input of the declared width. Small domains are enumerated outright. Larger domains are handled
 * by two exact procedures: fragments built purely from bitwise operators are checked one bit
 * position at a time, and linear mixed boolean-arithmetic differences are decided on their truth
 * table over single-bit inputs. Anything outside those classes stays unproven and is rejected.
 */

use crate::expr::Expr;
use crate::instructions::{BinaryOp, UnaryOp};
use crate::types::Width;
use serde::{Deserialize, Serialize};

/// How far the checker may go to prove two expressions equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EquivalencePolicy {
    /// Enumerate the whole input domain, rejecting larger domains.
    Exhaustive { max_domain_bits: u32 },
    /// Enumerate small domains, then try the bitwise and linear MBA procedures.
    Decision { max_domain_bits: u32 },
}

impl Default for EquivalencePolicy {
    fn default() -> Self {
        EquivalencePolicy::Decision {
            max_domain_bits: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Proven,
    /// A concrete input on which the two sides differ.
    Refuted(u64),
    Unproven,
}

/// Inputs beyond this make the per-bit and truth-table procedures too costly.
const MAX_DECISION_INPUTS: usize = 12;

impl EquivalencePolicy {
    fn max_domain_bits(self) -> u32 {
        match self {
            EquivalencePolicy::Exhaustive { max_domain_bits }
            | EquivalencePolicy::Decision { max_domain_bits } => max_domain_bits.min(24),
        }
    }

    pub fn check(self, reference: &Expr, candidate: &Expr, arity: usize, width: Width) -> Verdict {
        let arity = arity.max(reference.arity()).max(candidate.arity());
        let domain_bits = arity as u64 * u64::from(width.bits());
        if domain_bits <= u64::from(self.max_domain_bits()) {
            return exhaustive(reference, candidate, arity, width);
        }
        if matches!(self, EquivalencePolicy::Exhaustive { .. }) || arity > MAX_DECISION_INPUTS {
            return Verdict::Unproven;
        }

        if reference.is_bitwise() && candidate.is_bitwise() {
            return per_bit(reference, candidate, arity, width);
        }
        let difference = Expr::binary(BinaryOp::Sub, reference.clone(), candidate.clone());
        match linearize(&difference, width) {
            Some(terms) => linear_mba(&terms, arity, width),
            None => Verdict::Unproven,
        }
    }
}

/// Input vector whose `i`-th entry is the `i`-th `bits`-wide digit of `index`.
fn unpack(index: u64, arity: usize, width: Width) -> Vec<u64> {
    let bits = width.bits();
    (0..arity)
        .map(|i| width.truncate(index.checked_shr(bits * i as u32).unwrap_or(0)))
        .collect()
}

fn exhaustive(reference: &Expr, candidate: &Expr, arity: usize, width: Width) -> Verdict {
    let total = 1u64 << (arity as u32 * width.bits());
    for index in 0..total {
        let inputs = unpack(index, arity, width);
        if reference.eval(&inputs, width) != candidate.eval(&inputs, width) {
            return Verdict::Refuted(index);
        }
    }
    Verdict::Proven
}

/// Bitwise operators act on every bit position independently, so it is
/// enough to try each position with every single-bit assignment.
fn per_bit(reference: &Expr, candidate: &Expr, arity: usize, width: Width) -> Verdict {
    for position in 0..width.bits() {
        let bit = 1u64 << position;
        for assignment in 0..(1u64 << arity) {
            let inputs: Vec<u64> = (0..arity)
                .map(|i| if (assignment >> i) & 1 == 1 { bit } else { 0 })
                .collect();
            let lhs = reference.eval(&inputs, width) & bit;
            let rhs = candidate.eval(&inputs, width) & bit;
            if lhs != rhs {
                return Verdict::Refuted(assignment);
            }
        }
    }
    Verdict::Proven
}

/// Bitwise subtree whose constants are all zeros or all ones.
fn is_atom(expr: &Expr, width: Width) -> bool {
    match expr {
        Expr::Input(_) => true,
        Expr::Const(c) => {
            let c = width.truncate(*c);
            c == 0 || c == width.mask()
        }
        Expr::Unary(UnaryOp::Not, operand) => is_atom(operand, width),
        Expr::Unary(UnaryOp::Neg, _) => false,
        Expr::Binary(op, lhs, rhs) => {
            op.is_bitwise() && is_atom(lhs, width) && is_atom(rhs, width)
        }
    }
}

fn scale(terms: Vec<(u64, Expr)>, factor: u64, width: Width) -> Vec<(u64, Expr)> {
    terms
        .into_iter()
        .map(|(coeff, atom)| (width.truncate(coeff.wrapping_mul(factor)), atom))
        .collect()
}

/// Rewrite `expr` as a sum of coefficients times bitwise atoms, if it is a
/// linear MBA expression.
pub fn linearize(expr: &Expr, width: Width) -> Option<Vec<(u64, Expr)>> {
    if is_atom(expr, width) {
        return Some(vec![(1, expr.clone())]);
    }
    let all_ones = Expr::Const(width.mask());
    match expr {
        // c == (-c) * (all ones)
        Expr::Const(c) => Some(vec![(width.truncate(c.wrapping_neg()), all_ones)]),
        Expr::Unary(UnaryOp::Neg, operand) => {
            Some(scale(linearize(operand, width)?, u64::MAX, width))
        }
        // !a == -a - 1 == -a + 1 * (all ones)
        Expr::Unary(UnaryOp::Not, operand) => {
            let mut terms = scale(linearize(operand, width)?, u64::MAX, width);
            terms.push((1, all_ones));
            Some(terms)
        }
        Expr::Binary(BinaryOp::Add, lhs, rhs) => {
            let mut terms = linearize(lhs, width)?;
            terms.extend(linearize(rhs, width)?);
            Some(terms)
        }
        Expr::Binary(BinaryOp::Sub, lhs, rhs) => {
            let mut terms = linearize(lhs, width)?;
            terms.extend(scale(linearize(rhs, width)?, u64::MAX, width));
            Some(terms)
        }
        Expr::Binary(BinaryOp::Mul, lhs, rhs) => match (lhs.as_ref(), rhs.as_ref()) {
            (Expr::Const(c), other) | (other, Expr::Const(c)) => {
                Some(scale(linearize(other, width)?, *c, width))
            }
            _ => None,
        },
        Expr::Binary(BinaryOp::Shl, lhs, rhs) => match rhs.as_ref() {
            Expr::Const(k) => {
                let k = width.truncate(*k);
                if k >= u64::from(width.bits()) {
                    Some(Vec::new())
                } else {
                    Some(scale(linearize(lhs, width)?, 1u64 << k, width))
                }
            }
            _ => None,
        },
        _ => None,
    }
}

/// A linear combination of bitwise atoms is zero on every input exactly when
/// it is zero on every single-bit assignment.
fn linear_mba(terms: &[(u64, Expr)], arity: usize, width: Width) -> Verdict {
    for assignment in 0..(1u64 << arity) {
        let inputs: Vec<u64> = (0..arity).map(|i| (assignment >> i) & 1).collect();
        let sum = terms.iter().fold(0u64, |acc, (coeff, atom)| {
            let bit = atom.eval(&inputs, Width::W1);
            acc.wrapping_add(coeff.wrapping_mul(bit))
        });
        if width.truncate(sum) != 0 {
            return Verdict::Refuted(assignment);
        }
    }
    Verdict::Proven
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x() -> Expr {
        Expr::Input(0)
    }

    fn y() -> Expr {
        Expr::Input(1)
    }

    fn mba_add() -> Expr {
        Expr::binary(
            BinaryOp::Add,
            Expr::binary(BinaryOp::Xor, x(), y()),
            Expr::binary(
                BinaryOp::Mul,
                Expr::Const(2),
                Expr::binary(BinaryOp::And, x(), y()),
            ),
        )
    }

    #[test]
    fn test_small_domain_is_enumerated() {
        let policy = EquivalencePolicy::Exhaustive { max_domain_bits: 16 };
        let sum = Expr::binary(BinaryOp::Add, x(), y());
        assert_eq!(policy.check(&mba_add(), &sum, 2, Width::W8), Verdict::Proven);

        let wrong = Expr::binary(BinaryOp::Or, x(), y());
        assert!(matches!(
            policy.check(&mba_add(), &wrong, 2, Width::W8),
            Verdict::Refuted(_)
        ));
    }

    #[test]
    fn test_exhaustive_rejects_large_domains() {
        let policy = EquivalencePolicy::Exhaustive { max_domain_bits: 16 };
        let sum = Expr::binary(BinaryOp::Add, x(), y());
        assert_eq!(policy.check(&mba_add(), &sum, 2, Width::W64), Verdict::Unproven);
    }

    #[test]
    fn test_linear_mba_at_full_width() {
        let policy = EquivalencePolicy::default();
        let sum = Expr::binary(BinaryOp::Add, x(), y());
        assert_eq!(policy.check(&mba_add(), &sum, 2, Width::W64), Verdict::Proven);

        // x - y == (x ^ y) - 2 * (!x & y)
        let sub = Expr::binary(
            BinaryOp::Sub,
            Expr::binary(BinaryOp::Xor, x(), y()),
            Expr::binary(
                BinaryOp::Shl,
                Expr::binary(BinaryOp::And, Expr::unary(UnaryOp::Not, x()), y()),
                Expr::Const(1),
            ),
        );
        let plain = Expr::binary(BinaryOp::Sub, x(), y());
        assert_eq!(policy.check(&sub, &plain, 2, Width::W32), Verdict::Proven);

        let off_by_one = Expr::binary(BinaryOp::Add, sum, Expr::Const(1));
        assert!(matches!(
            policy.check(&mba_add(), &off_by_one, 2, Width::W64),
            Verdict::Refuted(_)
        ));
    }

    #[test]
    fn test_bitwise_identity() {
        // (x & y) | (x & !y) == x
        let reference = Expr::binary(
            BinaryOp::Or,
            Expr::binary(BinaryOp::And, x(), y()),
            Expr::binary(BinaryOp::And, x(), Expr::unary(UnaryOp::Not, y())),
        );
        let policy = EquivalencePolicy::default();
        assert_eq!(policy.check(&reference, &x(), 2, Width::W64), Verdict::Proven);
        assert!(matches!(
            policy.check(&reference, &y(), 2, Width::W64),
            Verdict::Refuted(_)
        ));
    }

    #[test]
    fn test_nonlinear_is_unproven() {
        let square = Expr::binary(BinaryOp::Mul, x(), x());
        let policy = EquivalencePolicy::default();
        assert_eq!(policy.check(&square, &square, 1, Width::W64), Verdict::Unproven);
    }

    #[test]
    fn test_negated_constant_linearizes() {
        let terms = linearize(&Expr::unary(UnaryOp::Neg, Expr::Const(5)), Width::W8).unwrap();
        assert_eq!(terms, vec![(5, Expr::Const(0xff))]);
    }
}
