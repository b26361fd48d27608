/*! Synthesis-based simplification of arithmetic fragments.
 *
 * Virtualizing protectors bury simple arithmetic under mixed boolean-arithmetic identities. This
 * pass carves side-effect-free expression trees out of each block, asks a synthesis backend for a
 * cheaper equivalent, and substitutes the answer only once the equivalence policy has proven it.
 * Queries are independent, so they run concurrently on a rayon pool; substitution happens
 * afterwards on the calling thread.
 */

pub mod backend;
pub mod enumerate;
pub mod equivalence;

pub use backend::{CancelToken, OutputSpec, SynthesisBackend, SynthesisRequest, SynthesisResponse};
pub use enumerate::EnumerativeSynthesizer;
pub use equivalence::{EquivalencePolicy, Verdict};

use crate::analysis::{AnalysisId, AnalysisManager, DefUseChains};
use crate::block::{BasicBlock, BlockId};
use crate::config::SynthesisConfig;
use crate::diagnostics::Diagnostic;
use crate::expr::Expr;
use crate::function::Function;
use crate::instructions::Instruction;
use crate::module::Module;
use crate::passes::utils::remove_dead_instructions;
use crate::passes::{Pass, PassLedger};
use crate::types::Width;
use crate::values::{Value, ValueId};
use anyhow::Result;
use indexmap::IndexSet;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// A side-effect-free expression tree rooted at one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub function: String,
    pub block: BlockId,
    pub root: ValueId,
    pub inputs: Vec<(ValueId, Width)>,
    pub expr: Expr,
    pub width: Width,
    pub cost: u32,
}

impl Fragment {
    fn key(&self) -> (Expr, Width) {
        (self.expr.clone(), self.width)
    }
}

/// Values that are consumed exactly once, by an arithmetic instruction of the
/// same width. These are folded into their user's fragment.
fn interior_values(block: &BasicBlock, chains: &DefUseChains) -> HashSet<ValueId> {
    let mut widths: HashMap<ValueId, Width> = HashMap::new();
    let mut interior = HashSet::new();

    for inst in &block.instructions {
        let user_width = match inst {
            Instruction::Binary { width, .. } | Instruction::Unary { width, .. } => Some(*width),
            _ => None,
        };
        for operand in inst.operands() {
            let Value::Var(id) = operand else {
                continue;
            };
            let same_width = user_width.is_some() && widths.get(&id).copied() == user_width;
            if same_width && chains.use_count(id) == 1 {
                interior.insert(id);
            }
        }
        if let Instruction::Binary { result, width, .. } | Instruction::Unary { result, width, .. } =
            inst
        {
            widths.insert(*result, *width);
        }
    }
    interior
}

struct Expander<'a> {
    block: &'a BasicBlock,
    definitions: HashMap<ValueId, usize>,
    interior: &'a HashSet<ValueId>,
    width: Width,
    max_instructions: usize,
    expanded: usize,
    inputs: Vec<(ValueId, Width)>,
}

impl<'a> Expander<'a> {
    fn new(block: &'a BasicBlock, interior: &'a HashSet<ValueId>, width: Width, max: usize) -> Self {
        let definitions = block
            .instructions
            .iter()
            .enumerate()
            .filter_map(|(i, inst)| inst.result().map(|r| (r, i)))
            .collect();
        Self {
            block,
            definitions,
            interior,
            width,
            max_instructions: max,
            expanded: 0,
            inputs: Vec::new(),
        }
    }

    fn input(&mut self, id: ValueId) -> Expr {
        let index = match self.inputs.iter().position(|(v, _)| *v == id) {
            Some(index) => index,
            None => {
                self.inputs.push((id, self.width));
                self.inputs.len() - 1
            }
        };
        Expr::Input(index)
    }

    fn operand(&mut self, value: Value) -> Expr {
        match value {
            Value::Const(c) => Expr::Const(self.width.truncate(c.bits)),
            Value::Var(id) => {
                if self.interior.contains(&id) && self.expanded < self.max_instructions {
                    if let Some(expr) = self.definition(id) {
                        return expr;
                    }
                }
                self.input(id)
            }
        }
    }

    fn definition(&mut self, id: ValueId) -> Option<Expr> {
        let block = self.block;
        let inst = &block.instructions[*self.definitions.get(&id)?];
        match inst {
            Instruction::Binary {
                op, lhs, rhs, width, ..
            } if *width == self.width => {
                let (op, lhs, rhs) = (*op, *lhs, *rhs);
                self.expanded += 1;
                let lhs = self.operand(lhs);
                let rhs = self.operand(rhs);
                Some(Expr::binary(op, lhs, rhs))
            }
            Instruction::Unary {
                op, operand, width, ..
            } if *width == self.width => {
                let (op, operand) = (*op, *operand);
                self.expanded += 1;
                let operand = self.operand(operand);
                Some(Expr::unary(op, operand))
            }
            _ => None,
        }
    }
}

fn extract_at(
    function: &str,
    block_id: BlockId,
    block: &BasicBlock,
    interior: &HashSet<ValueId>,
    index: usize,
    config: &SynthesisConfig,
) -> Option<Fragment> {
    let inst = block.instructions.get(index)?;
    let (root, width) = match inst {
        Instruction::Binary { result, width, .. } | Instruction::Unary { result, width, .. } => {
            (*result, *width)
        }
        _ => return None,
    };
    if interior.contains(&root) {
        return None;
    }

    let mut expander = Expander::new(block, interior, width, config.max_instructions);
    let expr = expander.definition(root)?;
    if expander.inputs.len() > config.max_inputs {
        return None;
    }
    let cost = expr.cost();
    (cost > config.min_cost).then(|| Fragment {
        function: function.to_string(),
        block: block_id,
        root,
        inputs: expander.inputs,
        expr,
        width,
        cost,
    })
}

/// Every fragment of `function` worth a synthesis query.
pub fn extract_fragments(
    function: &Function,
    chains: &DefUseChains,
    config: &SynthesisConfig,
) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    for (block_id, block) in &function.blocks {
        let interior = interior_values(block, chains);
        for index in 0..block.instructions.len() {
            if let Some(fragment) =
                extract_at(&function.name, *block_id, block, &interior, index, config)
            {
                fragments.push(fragment);
            }
        }
    }
    fragments
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueryOutcome {
    Replace(Expr),
    Timeout,
    NoSolution,
    Unproven,
    NotCheaper,
}

fn query(
    backend: &dyn SynthesisBackend,
    policy: EquivalencePolicy,
    cancel: &CancelToken,
    (reference, width): &(Expr, Width),
    max_candidate_cost: u32,
) -> QueryOutcome {
    let arity = reference.arity();
    let cost_bound = reference.cost().saturating_sub(1).min(max_candidate_cost);
    let request = SynthesisRequest::new(reference.clone(), arity, *width, cost_bound);

    match backend.synthesize(&request, cancel) {
        SynthesisResponse::Expression(candidate) => {
            let candidate = candidate.normalized(*width);
            if candidate.arity() > arity {
                return QueryOutcome::Unproven;
            }
            if candidate.cost() >= reference.cost() {
                return QueryOutcome::NotCheaper;
            }
            match policy.check(reference, &candidate, arity, *width) {
                Verdict::Proven => QueryOutcome::Replace(candidate),
                Verdict::Refuted(_) | Verdict::Unproven => QueryOutcome::Unproven,
            }
        }
        SynthesisResponse::NoSolution => QueryOutcome::NoSolution,
        SynthesisResponse::Timeout => QueryOutcome::Timeout,
    }
}

/// Append instructions computing `expr` and return the value holding it.
///
/// `None` if `expr` reads an input the fragment does not have.
fn materialize(
    function: &mut Function,
    expr: &Expr,
    inputs: &[(ValueId, Width)],
    width: Width,
    out: &mut Vec<Instruction>,
) -> Option<Value> {
    let value = match expr {
        Expr::Input(i) => Value::Var(inputs.get(*i)?.0),
        Expr::Const(c) => Value::konst(*c, width),
        Expr::Unary(op, operand) => {
            let operand = materialize(function, operand, inputs, width, out)?;
            let result = function.new_value();
            out.push(Instruction::Unary {
                op: *op,
                result,
                operand,
                width,
            });
            Value::Var(result)
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = materialize(function, lhs, inputs, width, out)?;
            let rhs = materialize(function, rhs, inputs, width, out)?;
            let result = function.new_value();
            out.push(Instruction::Binary {
                op: *op,
                result,
                lhs,
                rhs,
                width,
            });
            Value::Var(result)
        }
    };
    Some(value)
}

/// Replace `fragment` with `candidate` if the fragment is still present unchanged.
fn substitute(
    function: &mut Function,
    chains: &DefUseChains,
    fragment: &Fragment,
    candidate: &Expr,
    config: &SynthesisConfig,
) -> bool {
    let Some(block) = function.block(fragment.block) else {
        return false;
    };
    let Some(index) = block
        .instructions
        .iter()
        .position(|inst| inst.result() == Some(fragment.root))
    else {
        return false;
    };
    let interior = interior_values(block, chains);
    let current = extract_at(&function.name, fragment.block, block, &interior, index, config);
    if current.as_ref() != Some(fragment) {
        return false;
    }

    let mut emitted = Vec::new();
    let Some(value) =
        materialize(function, candidate, &fragment.inputs, fragment.width, &mut emitted)
    else {
        return false;
    };
    let Some(block) = function.block_mut(fragment.block) else {
        return false;
    };
    block.instructions[index] = Instruction::Copy {
        result: fragment.root,
        value,
        width: fragment.width,
    };
    block.instructions.splice(index..index, emitted);
    remove_dead_instructions(block);
    true
}

/// Asks a synthesis backend for cheaper equivalents of arithmetic fragments.
#[derive(Clone)]
pub struct SynthesisPass {
    config: SynthesisConfig,
    backend: Arc<dyn SynthesisBackend>,
    cancel: CancelToken,
    memo: HashMap<(Expr, Width), QueryOutcome>,
    ledger: PassLedger,
}

impl fmt::Debug for SynthesisPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesisPass")
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .field("memoized", &self.memo.len())
            .finish_non_exhaustive()
    }
}

impl Default for SynthesisPass {
    fn default() -> Self {
        Self::new(SynthesisConfig::default())
    }
}

impl SynthesisPass {
    pub fn new(config: SynthesisConfig) -> Self {
        let backend = Arc::new(EnumerativeSynthesizer::from_config(&config));
        Self {
            config,
            backend,
            cancel: CancelToken::new(),
            memo: HashMap::new(),
            ledger: PassLedger::default(),
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn SynthesisBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Token every query derives from. Cancelling it stops all queries in flight.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn run_queries(&mut self, pending: Vec<(Expr, Width)>) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers.max(1))
            .build()?;
        let backend = self.backend.as_ref();
        let policy = self.config.policy;
        let timeout = self.config.query_timeout;
        let max_cost = self.config.max_candidate_cost;
        let cancel = &self.cancel;

        let answers: Vec<((Expr, Width), QueryOutcome)> = pool.install(|| {
            pending
                .into_par_iter()
                .map(|key| {
                    let token = cancel.child(timeout);
                    let outcome = query(backend, policy, &token, &key, max_cost);
                    (key, outcome)
                })
                .collect()
        });
        self.memo.extend(answers);
        Ok(())
    }

    fn diagnose(&mut self, fragment: &Fragment) {
        let (function, block, root) = (fragment.function.clone(), fragment.block, fragment.root);
        let diagnostic = match self.memo.get(&fragment.key()) {
            Some(QueryOutcome::Timeout) => Diagnostic::SynthesisTimeout {
                function,
                block,
                root,
            },
            Some(QueryOutcome::NoSolution) => Diagnostic::SynthesisNoSolution {
                function,
                block,
                root,
            },
            Some(QueryOutcome::Unproven) => Diagnostic::SynthesisUnproven {
                function,
                block,
                root,
            },
            Some(QueryOutcome::NotCheaper) => {
                debug!(%function, %block, %root, "candidate is not cheaper than the fragment");
                return;
            }
            Some(QueryOutcome::Replace(_)) | None => return,
        };
        self.ledger.record(diagnostic);
    }
}

impl Pass for SynthesisPass {
    fn name(&self) -> &'static str {
        "synthesize"
    }

    fn run(&mut self, module: &mut Module, analyses: &mut AnalysisManager) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }

        let mut fragments: Vec<Fragment> = Vec::new();
        for function in module.functions.values() {
            let chains = analyses.def_use(function);
            fragments.extend(extract_fragments(function, &chains, &self.config));
        }
        let pending: IndexSet<(Expr, Width)> = fragments
            .iter()
            .map(Fragment::key)
            .filter(|key| !self.memo.contains_key(key))
            .collect();

        let queried = pending.len();
        if queried > 0 {
            debug!(fragments = fragments.len(), queries = queried, "dispatching synthesis queries");
            let keys: Vec<(Expr, Width)> = pending.iter().cloned().collect();
            self.run_queries(keys)?;
        }

        let mut substituted = 0u64;
        for fragment in &fragments {
            let outcome = self.memo.get(&fragment.key()).cloned();
            let Some(QueryOutcome::Replace(candidate)) = outcome else {
                if pending.contains(&fragment.key()) {
                    self.diagnose(fragment);
                }
                continue;
            };
            let Some(function) = module.functions.get_mut(&fragment.function) else {
                continue;
            };
            let chains = analyses.def_use(function);
            if substitute(function, &chains, fragment, &candidate, &self.config) {
                analyses.invalidate(&fragment.function, &[AnalysisId::DefUse]);
                info!(
                    function = %fragment.function,
                    block = %fragment.block,
                    root = %fragment.root,
                    from = %fragment.expr,
                    to = %candidate,
                    "substituted fragment"
                );
                substituted += 1;
            }
        }

        self.ledger.count(queried as u64 + substituted);
        Ok(substituted > 0)
    }

    fn required_analyses(&self) -> Vec<AnalysisId> {
        vec![AnalysisId::DefUse]
    }

    fn invalidated_analyses(&self) -> Vec<AnalysisId> {
        vec![AnalysisId::DefUse]
    }

    fn take_ledger(&mut self) -> PassLedger {
        std::mem::take(&mut self.ledger)
    }

    /// Proven replacements and definite failures hold for any module; timeouts are retried.
    fn reset(&mut self) {
        self.memo.retain(|_, outcome| *outcome != QueryOutcome::Timeout);
        self.ledger = PassLedger::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FunctionBuilder;
    use crate::instructions::BinaryOp;
    use crate::interp::{Interpreter, MachineState};
    use crate::layout::StateLayout;
    use crate::verify::verify_function;
    use pretty_assertions::assert_eq;

    /// `rax = (rbx ^ rcx) + 2 * (rbx & rcx)`
    fn mba_module() -> Module {
        let mut builder = FunctionBuilder::new("f");
        let mut entry = builder.entry_block();
        let x = entry.load_state(8, Width::W64);
        let y = entry.load_state(16, Width::W64);
        let a = entry.xor(x, y, Width::W64);
        let b = entry.and(x, y, Width::W64);
        let two = entry.konst(2, Width::W64);
        let c = entry.mul(b, two, Width::W64);
        let d = entry.add(a, c, Width::W64);
        entry.store_state(0, d, Width::W64);
        entry.ret().unwrap();

        let mut module = Module::new("m", Arc::new(StateLayout::x86_64()));
        module.add_function(builder.build().unwrap());
        module
    }

    fn rax_after(module: &Module, rbx: u64, rcx: u64) -> u64 {
        let mut state = MachineState::for_module(module);
        state.set_state(8, 8, rbx);
        state.set_state(16, 8, rcx);
        let execution = Interpreter::new(module).run("f", state).unwrap();
        execution.state.read_state(0, 8)
    }

    struct Wrong;

    impl SynthesisBackend for Wrong {
        fn name(&self) -> &'static str {
            "wrong"
        }

        fn synthesize(&self, _: &SynthesisRequest, _: &CancelToken) -> SynthesisResponse {
            SynthesisResponse::Expression(Expr::binary(
                BinaryOp::Xor,
                Expr::Input(0),
                Expr::Input(1),
            ))
        }
    }

    /// Answers with the reference itself.
    struct Echo;

    impl SynthesisBackend for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn synthesize(&self, request: &SynthesisRequest, _: &CancelToken) -> SynthesisResponse {
            SynthesisResponse::Expression(request.spec.reference.clone())
        }
    }

    /// Reads an input the request never offered.
    struct Overreach;

    impl SynthesisBackend for Overreach {
        fn name(&self) -> &'static str {
            "overreach"
        }

        fn synthesize(&self, request: &SynthesisRequest, _: &CancelToken) -> SynthesisResponse {
            SynthesisResponse::Expression(Expr::Input(request.inputs.len()))
        }
    }

    #[test]
    fn test_extract_single_fragment() {
        let module = mba_module();
        let function = module.function("f").unwrap();
        let fragments =
            extract_fragments(function, &DefUseChains::build(function), &SynthesisConfig::default());
        assert_eq!(fragments.len(), 1);
        let fragment = &fragments[0];
        assert_eq!(fragment.cost, 7);
        assert_eq!(fragment.inputs.len(), 2);
        assert_eq!(
            fragment.expr.to_string(),
            "(add (xor x0 x1) (mul (and x0 x1) 2))"
        );
    }

    #[test]
    fn test_mba_is_replaced() {
        let original = mba_module();
        let mut module = original.clone();
        let mut pass = SynthesisPass::new(SynthesisConfig::default().with_workers(2));
        assert!(pass.run(&mut module, &mut AnalysisManager::new()).unwrap());

        let function = module.function("f").unwrap();
        verify_function(function).unwrap();
        assert!(function
            .entry_block()
            .instructions
            .iter()
            .all(|i| !matches!(i, Instruction::Binary { op: BinaryOp::Mul, .. })));

        for (rbx, rcx) in [(0, 0), (1, u64::MAX), (0x1234, 0xdead_beef), (u64::MAX, u64::MAX)] {
            assert_eq!(rax_after(&original, rbx, rcx), rax_after(&module, rbx, rcx));
        }
        let chains = DefUseChains::build(function);
        assert!(extract_fragments(function, &chains, &SynthesisConfig::default()).is_empty());
    }

    #[test]
    fn test_unproven_candidate_is_rejected() {
        let original = mba_module();
        let mut module = original.clone();
        let mut pass = SynthesisPass::default().with_backend(Arc::new(Wrong));
        let mut analyses = AnalysisManager::new();

        assert!(!pass.run(&mut module, &mut analyses).unwrap());
        assert_eq!(module, original);
        let ledger = pass.take_ledger();
        assert_eq!(ledger.operations, 1);
        assert!(matches!(
            ledger.diagnostics.as_slice(),
            [Diagnostic::SynthesisUnproven { .. }]
        ));

        // Failed fragments are memoized and not queried again.
        assert!(!pass.run(&mut module, &mut analyses).unwrap());
        assert_eq!(pass.take_ledger(), PassLedger::default());
    }

    #[test]
    fn test_candidate_that_is_not_cheaper_is_dropped_quietly() {
        let original = mba_module();
        let mut module = original.clone();
        let mut pass = SynthesisPass::default().with_backend(Arc::new(Echo));

        assert!(!pass.run(&mut module, &mut AnalysisManager::new()).unwrap());
        assert_eq!(module, original);
        let ledger = pass.take_ledger();
        assert_eq!(ledger.operations, 1);
        assert!(ledger.diagnostics.is_empty());
    }

    #[test]
    fn test_candidate_reading_unknown_input_is_rejected() {
        let original = mba_module();
        let mut module = original.clone();
        let mut pass = SynthesisPass::default().with_backend(Arc::new(Overreach));

        assert!(!pass.run(&mut module, &mut AnalysisManager::new()).unwrap());
        assert_eq!(module, original);
        assert!(matches!(
            pass.take_ledger().diagnostics.as_slice(),
            [Diagnostic::SynthesisUnproven { .. }]
        ));

        let mut function = original.function("f").unwrap().clone();
        let mut emitted = Vec::new();
        let inputs = [(ValueId(0), Width::W64)];
        assert_eq!(
            materialize(&mut function, &Expr::Input(1), &inputs, Width::W64, &mut emitted),
            None
        );
        assert_eq!(
            materialize(&mut function, &Expr::Input(0), &inputs, Width::W64, &mut emitted),
            Some(Value::Var(ValueId(0)))
        );
    }

    #[test]
    fn test_cancelled_queries_leave_module_untouched() {
        let original = mba_module();
        let mut module = original.clone();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut pass = SynthesisPass::default().with_cancel_token(cancel);

        assert!(!pass.run(&mut module, &mut AnalysisManager::new()).unwrap());
        assert_eq!(module, original);
        assert!(matches!(
            pass.take_ledger().diagnostics.as_slice(),
            [Diagnostic::SynthesisTimeout { .. }]
        ));
    }

    #[test]
    fn test_disabled_pass_is_a_no_op() {
        let mut module = mba_module();
        let mut pass = SynthesisPass::new(SynthesisConfig::default().disabled());
        assert!(!pass.run(&mut module, &mut AnalysisManager::new()).unwrap());
    }
}
