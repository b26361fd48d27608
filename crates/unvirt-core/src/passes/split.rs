use crate::analysis::alias::{AliasClass, Location};
use crate::analysis::cfg::ControlFlowGraph;
use crate::analysis::dominator::DominatorTree;
use crate::analysis::memory::lookup;
use crate::analysis::{AnalysisId, AnalysisManager, MemoryFacts};
use crate::block::{BasicBlock, BlockId};
use crate::config::SplitterConfig;
use crate::diagnostics::Diagnostic;
use crate::function::Function;
use crate::instructions::Instruction;
use crate::module::Module;
use crate::passes::{Pass, PassLedger};
use crate::values::{Value, ValueId};
use anyhow::Result;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

/// Literal contents of the dispatch selector locations at a predecessor's exit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextKey(pub Vec<Option<u64>>);

impl ContextKey {
    pub fn is_known(&self) -> bool {
        self.0.iter().all(Option::is_some)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match value {
                Some(bits) => write!(f, "{bits:#x}")?,
                None => write!(f, "?")?,
            }
        }
        write!(f, "]")
    }
}

/// Clones produced for one origin block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginRecord {
    pub function: String,
    pub origin: BlockId,
    pub clones: Vec<(ContextKey, BlockId)>,
}

/// Every split performed so far, grouped by origin block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicationRecord {
    origins: Vec<OriginRecord>,
}

impl DuplicationRecord {
    pub fn clones_of(&self, function: &str, origin: BlockId) -> &[(ContextKey, BlockId)] {
        self.origins
            .iter()
            .find(|r| r.function == function && r.origin == origin)
            .map_or(&[], |r| r.clones.as_slice())
    }

    pub fn insert(&mut self, function: &str, origin: BlockId, key: ContextKey, clone: BlockId) {
        match self
            .origins
            .iter_mut()
            .find(|r| r.function == function && r.origin == origin)
        {
            Some(record) => record.clones.push((key, clone)),
            None => self.origins.push(OriginRecord {
                function: function.to_string(),
                origin,
                clones: vec![(key, clone)],
            }),
        }
    }

    pub fn origins(&self) -> impl Iterator<Item = &OriginRecord> {
        self.origins.iter()
    }

    pub fn total_clones(&self) -> usize {
        self.origins.iter().map(|r| r.clones.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

/// A dispatch node worth splitting, with its predecessors grouped by context.
struct SplitPlan {
    node: BlockId,
    region: IndexSet<BlockId>,
    groups: Vec<(ContextKey, Vec<BlockId>)>,
}

/// Duplicates dispatch nodes per predecessor context so that each copy sees
/// a single literal selector.
#[derive(Debug, Clone, Default)]
pub struct SplitPass {
    config: SplitterConfig,
    record: DuplicationRecord,
    exhausted: HashSet<(String, BlockId)>,
    ledger: PassLedger,
}

impl SplitPass {
    pub fn new(config: SplitterConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn record(&self) -> &DuplicationRecord {
        &self.record
    }

    fn plan(
        &self,
        function: &Function,
        cfg: &ControlFlowGraph,
        dominators: &DominatorTree,
        facts: &MemoryFacts,
    ) -> Option<SplitPlan> {
        for &node in cfg.reverse_postorder() {
            if node == function.entry || self.exhausted.contains(&(function.name.clone(), node)) {
                continue;
            }
            if cfg.reachable_predecessors(node).len() < 2 {
                continue;
            }
            let Some(block) = function.block(node) else {
                continue;
            };
            if !block.terminator.is_conditional() {
                continue;
            }
            let Some(selector) = selector_locations(block) else {
                continue;
            };

            let region = clone_region(function, cfg, dominators, node, self.config.horizon);
            let mut groups: IndexMap<ContextKey, Vec<BlockId>> = IndexMap::new();
            for pred in cfg.reachable_predecessors(node) {
                if region.contains(&pred) {
                    continue;
                }
                let key = ContextKey(
                    selector
                        .iter()
                        .map(|loc| facts.block_out(pred).and_then(|out| lookup(out, loc)))
                        .collect(),
                );
                groups.entry(key).or_default().push(pred);
            }

            let known = groups.keys().filter(|k| k.is_known()).count();
            if groups.len() < 2 || known < 2 {
                continue;
            }
            return Some(SplitPlan {
                node,
                region,
                groups: groups.into_iter().collect(),
            });
        }
        None
    }

    /// Apply `plan`. Returns the number of blocks created.
    fn split(&mut self, function: &mut Function, plan: SplitPlan) -> usize {
        let name = function.name.clone();
        let origin = function
            .block(plan.node)
            .map_or(plan.node, BasicBlock::root_origin);
        let mut created = 0;

        // The first fully known group keeps the shared node.
        let clone_groups = plan
            .groups
            .into_iter()
            .filter(|(key, _)| key.is_known())
            .skip(1);

        for (key, preds) in clone_groups {
            let over_blocks = function.blocks.len() + plan.region.len() > self.config.max_blocks;
            let over_origin =
                self.record.clones_of(&name, origin).len() >= self.config.max_clones_per_origin;
            if over_blocks || over_origin {
                info!(function = %name, block = %plan.node, %key, "split budget exhausted");
                self.ledger.record(Diagnostic::SplitBudgetExceeded {
                    function: name.clone(),
                    block: plan.node,
                });
                self.exhausted.insert((name.clone(), plan.node));
                break;
            }

            let clones = clone_blocks(function, plan.node, &plan.region);
            let head = clones[&plan.node];
            for pred in &preds {
                if let Some(block) = function.block_mut(*pred) {
                    block.terminator.retarget(plan.node, head);
                }
            }
            debug!(
                function = %name,
                node = %plan.node,
                clone = %head,
                %key,
                preds = preds.len(),
                "split node"
            );
            self.record.insert(&name, origin, key, head);
            created += clones.len();
        }
        created
    }
}

/// Precise locations the terminator of `block` depends on, or `None` when the
/// selector is not a pure function of in-block loads.
pub fn selector_locations(block: &BasicBlock) -> Option<Vec<Location>> {
    let Value::Var(root) = block.terminator.operand()? else {
        return None;
    };
    let definitions: HashMap<ValueId, usize> = block
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(i, inst)| inst.result().map(|r| (r, i)))
        .collect();

    let mut locations = Vec::new();
    let mut visited = HashSet::new();
    let mut worklist = vec![root];
    while let Some(value) = worklist.pop() {
        if !visited.insert(value) {
            continue;
        }
        let index = *definitions.get(&value)?;
        let inst = &block.instructions[index];
        match inst {
            Instruction::Load { class, .. } => {
                let location = class.location()?;
                if written_before(block, index, &location) {
                    return None;
                }
                locations.push(location);
            }
            _ if inst.is_pure() => {
                worklist.extend(inst.operands().into_iter().filter_map(|v| v.as_var()));
            }
            _ => return None,
        }
    }

    locations.sort();
    locations.dedup();
    (!locations.is_empty()).then_some(locations)
}

fn written_before(block: &BasicBlock, index: usize, location: &Location) -> bool {
    block.instructions[..index].iter().any(|inst| match inst {
        Instruction::Store { class, .. } => match class.location() {
            Some(written) => written.overlaps(location),
            None => *class == AliasClass::Unknown,
        },
        Instruction::Call { .. } | Instruction::Opaque { .. } => true,
        _ => false,
    })
}

/// `node` plus the successors it exclusively owns, up to `horizon` levels deep.
///
/// Sources of back edges into `node` stay outside: they are the handlers of a
/// dispatch loop and must remain predecessors that can be grouped by context.
pub fn clone_region(
    function: &Function,
    cfg: &ControlFlowGraph,
    dominators: &DominatorTree,
    node: BlockId,
    horizon: usize,
) -> IndexSet<BlockId> {
    let back_edges: HashSet<BlockId> = cfg
        .reachable_predecessors(node)
        .into_iter()
        .filter(|&pred| dominators.dominates(node, pred))
        .collect();
    let mut region = IndexSet::new();
    region.insert(node);
    let mut frontier = vec![node];

    for _ in 0..horizon {
        let mut next = Vec::new();
        for block in frontier {
            for &succ in cfg.successors(block) {
                if succ == function.entry || region.contains(&succ) || back_edges.contains(&succ) {
                    continue;
                }
                let owned = cfg
                    .reachable_predecessors(succ)
                    .iter()
                    .all(|p| region.contains(p));
                if owned {
                    region.insert(succ);
                    next.push(succ);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }
    region
}

/// Copy every block of `region` with fresh block and value ids. Edges between
/// region members are redirected to the copies, except edges back to `node`.
fn clone_blocks(
    function: &mut Function,
    node: BlockId,
    region: &IndexSet<BlockId>,
) -> HashMap<BlockId, BlockId> {
    let ids: HashMap<BlockId, BlockId> = region
        .iter()
        .map(|&original| (original, function.create_block()))
        .collect();

    for &original in region {
        let Some(source) = function.block(original).cloned() else {
            continue;
        };
        let id = ids[&original];
        let mut copy = BasicBlock::new(id);
        copy.address = source.address;
        copy.origin = Some(source.root_origin());

        let mut values: HashMap<ValueId, ValueId> = HashMap::new();
        for mut inst in source.instructions {
            for operand in inst.operands_mut() {
                if let Value::Var(v) = operand {
                    if let Some(fresh) = values.get(v) {
                        *operand = Value::Var(*fresh);
                    }
                }
            }
            if let Some(result) = inst.result_mut() {
                let fresh = function.new_value();
                values.insert(*result, fresh);
                *result = fresh;
            }
            copy.instructions.push(inst);
        }

        copy.terminator = source.terminator;
        if let Some(Value::Var(v)) = copy.terminator.operand_mut() {
            if let Some(fresh) = values.get(v) {
                *v = *fresh;
            }
        }
        for succ in copy.terminator.successors() {
            if succ != node {
                if let Some(target) = ids.get(&succ) {
                    copy.terminator.retarget(succ, *target);
                }
            }
        }

        if let Some(slot) = function.block_mut(id) {
            *slot = copy;
        }
    }
    ids
}

impl Pass for SplitPass {
    fn name(&self) -> &'static str {
        "split"
    }

    fn run(&mut self, module: &mut Module, analyses: &mut AnalysisManager) -> Result<bool> {
        let mut created = 0usize;

        for function in module.functions.values_mut() {
            loop {
                let cfg = analyses.control_flow(function);
                let dominators = analyses.dominators(function);
                let facts = analyses.memory_facts(function);
                let Some(plan) = self.plan(function, &cfg, &dominators, &facts) else {
                    break;
                };
                let added = self.split(function, plan);
                if added == 0 {
                    continue;
                }
                created += added;
                analyses.invalidate(&function.name, &self.invalidated_analyses());
            }
        }

        self.ledger.count(created as u64);
        Ok(created > 0)
    }

    fn required_analyses(&self) -> Vec<AnalysisId> {
        vec![
            AnalysisId::ControlFlow,
            AnalysisId::Dominators,
            AnalysisId::MemoryFacts,
        ]
    }

    fn invalidated_analyses(&self) -> Vec<AnalysisId> {
        vec![
            AnalysisId::ControlFlow,
            AnalysisId::Dominators,
            AnalysisId::MemoryFacts,
            AnalysisId::DefUse,
        ]
    }

    fn take_ledger(&mut self) -> PassLedger {
        std::mem::take(&mut self.ledger)
    }

    fn reset(&mut self) {
        self.record = DuplicationRecord::default();
        self.exhausted.clear();
        self.ledger = PassLedger::default();
    }
}
