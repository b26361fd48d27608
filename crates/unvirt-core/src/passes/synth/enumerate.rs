use super::backend::{CancelToken, SynthesisBackend, SynthesisRequest, SynthesisResponse};
use crate::config::SynthesisConfig;
use crate::expr::Expr;
use crate::instructions::{BinaryOp, UnaryOp};
use crate::types::Width;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use tracing::trace;

/// Candidates built between two polls of the cancel token.
const POLL_INTERVAL: usize = 256;

/// Bottom-up enumerator that builds expressions in order of increasing cost
/// and keeps one representative per observed behaviour.
#[derive(Debug, Clone)]
pub struct EnumerativeSynthesizer {
    test_vectors: usize,
    seed: u64,
    max_candidates: usize,
}

impl Default for EnumerativeSynthesizer {
    fn default() -> Self {
        Self::from_config(&SynthesisConfig::default())
    }
}

type Signature = Vec<u64>;

impl EnumerativeSynthesizer {
    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self {
            test_vectors: config.test_vectors,
            seed: config.seed,
            max_candidates: config.max_candidates,
        }
    }

    /// Corner values first, then seeded random rows. Deterministic for a given seed.
    pub fn vectors(&self, arity: usize, width: Width) -> Vec<Vec<u64>> {
        let corners: Vec<u64> = [
            0,
            1,
            2,
            width.mask(),
            width.mask() - 1,
            width.sign_bit(),
            width.sign_bit().wrapping_sub(1),
            0x5555_5555_5555_5555,
            0xaaaa_aaaa_aaaa_aaaa,
            0x0f0f_0f0f_0f0f_0f0f,
        ]
        .into_iter()
        .map(|v| width.truncate(v))
        .collect();

        let mut rows = Vec::new();
        for r in 0..corners.len() {
            rows.push(vec![corners[r]; arity]);
            rows.push(
                (0..arity)
                    .map(|i| corners[(r + 3 * i + 1) % corners.len()])
                    .collect(),
            );
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        for _ in 0..self.test_vectors {
            rows.push((0..arity).map(|_| width.truncate(rng.gen::<u64>())).collect());
        }
        rows
    }

    fn leaves(&self, request: &SynthesisRequest, vectors: &[Vec<u64>]) -> Vec<(Expr, Signature)> {
        let width = request.spec.width;
        let mut leaves: Vec<Expr> = (0..request.inputs.len()).map(Expr::Input).collect();

        let mut pool = vec![0, 1, width.mask()];
        pool.extend(request.spec.reference.constants().into_iter().map(|c| width.truncate(c)));
        let mut seen = HashSet::new();
        leaves.extend(pool.into_iter().filter(|c| seen.insert(*c)).map(Expr::Const));

        leaves
            .into_iter()
            .map(|leaf| {
                let signature = vectors.iter().map(|row| leaf.eval(row, width)).collect();
                (leaf, signature)
            })
            .collect()
    }
}

impl SynthesisBackend for EnumerativeSynthesizer {
    fn name(&self) -> &'static str {
        "enumerative"
    }

    fn synthesize(&self, request: &SynthesisRequest, cancel: &CancelToken) -> SynthesisResponse {
        if cancel.is_cancelled() {
            return SynthesisResponse::Timeout;
        }
        let width = request.spec.width;
        let vectors = self.vectors(request.inputs.len(), width);
        let target: Signature = vectors
            .iter()
            .map(|row| request.spec.reference.eval(row, width))
            .collect();

        let mut seen: HashSet<Signature> = HashSet::new();
        let mut levels: Vec<Vec<(Expr, Signature)>> = Vec::new();
        let mut level0 = Vec::new();
        for (leaf, signature) in self.leaves(request, &vectors) {
            if signature == target {
                return SynthesisResponse::Expression(leaf);
            }
            if seen.insert(signature.clone()) {
                level0.push((leaf, signature));
            }
        }
        levels.push(level0);

        let mut built = 0usize;
        for cost in 1..=request.cost_bound {
            let mut current: Vec<(Expr, Signature)> = Vec::new();
            let mut consider = |expr: Expr, signature: Signature| -> Option<SynthesisResponse> {
                built += 1;
                if built % POLL_INTERVAL == 0 && cancel.is_cancelled() {
                    return Some(SynthesisResponse::Timeout);
                }
                if built > self.max_candidates {
                    return Some(SynthesisResponse::NoSolution);
                }
                if signature == target {
                    return Some(SynthesisResponse::Expression(expr));
                }
                if seen.insert(signature.clone()) {
                    current.push((expr, signature));
                }
                None
            };

            let c = cost as usize;
            for op in [UnaryOp::Not, UnaryOp::Neg] {
                for (operand, sig) in &levels[c - 1] {
                    let signature = sig.iter().map(|v| op.eval(*v, width)).collect();
                    if let Some(response) = consider(Expr::unary(op, operand.clone()), signature) {
                        return response;
                    }
                }
            }

            for op in BinaryOp::ALL {
                let op_cost = Expr::op_cost(op) as usize;
                if op_cost > c {
                    continue;
                }
                let rest = c - op_cost;
                for lhs_cost in 0..=rest {
                    let rhs_cost = rest - lhs_cost;
                    if op.is_commutative() && lhs_cost > rhs_cost {
                        continue;
                    }
                    for (i, (lhs, lhs_sig)) in levels[lhs_cost].iter().enumerate() {
                        for (j, (rhs, rhs_sig)) in levels[rhs_cost].iter().enumerate() {
                            if op.is_commutative() && lhs_cost == rhs_cost && j < i {
                                continue;
                            }
                            let signature = lhs_sig
                                .iter()
                                .zip(rhs_sig)
                                .map(|(a, b)| op.eval(*a, *b, width))
                                .collect();
                            let expr = Expr::binary(op, lhs.clone(), rhs.clone());
                            if let Some(response) = consider(expr, signature) {
                                return response;
                            }
                        }
                    }
                }
            }

            trace!(cost, classes = current.len(), "enumerated cost level");
            levels.push(current);
        }
        SynthesisResponse::NoSolution
    }
}
