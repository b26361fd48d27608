use crate::analysis::cfg::ControlFlowGraph;
use crate::block::BasicBlock;
use crate::function::Function;
use crate::values::{Value, ValueId};
use std::collections::HashMap;

/// Number of uses of every value inside `block`, terminator included.
fn use_counts(block: &BasicBlock) -> HashMap<ValueId, usize> {
    let mut counts: HashMap<ValueId, usize> = HashMap::new();
    let operands = block
        .instructions
        .iter()
        .flat_map(|inst| inst.operands())
        .chain(block.terminator.operand());
    for operand in operands {
        if let Value::Var(id) = operand {
            *counts.entry(id).or_default() += 1;
        }
    }
    counts
}

/// Remove unused instructions that have no effect, until none are left.
pub fn remove_dead_instructions(block: &mut BasicBlock) -> usize {
    let mut removed = 0;
    loop {
        let counts = use_counts(block);
        let before = block.instructions.len();
        block.instructions.retain(|inst| match inst.result() {
            Some(result) if inst.is_removable_when_dead() => counts.contains_key(&result),
            _ => true,
        });
        let dropped = before - block.instructions.len();
        if dropped == 0 {
            return removed;
        }
        removed += dropped;
    }
}

/// Delete every block the entry cannot reach.
pub fn remove_unreachable_blocks(function: &mut Function) -> usize {
    let cfg = ControlFlowGraph::build(function);
    let dead: Vec<_> = function
        .blocks
        .keys()
        .copied()
        .filter(|b| !cfg.is_reachable(*b))
        .collect();
    for block in &dead {
        function.remove_block(*block);
    }
    dead.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FunctionBuilder;
    use crate::types::Width;

    #[test]
    fn test_dead_chain_removed() {
        let mut builder = FunctionBuilder::new("f");
        let orphan = builder.create_block();
        let mut entry = builder.entry_block();
        let a = entry.load_state(0, Width::W64);
        let b = entry.xor(a, a, Width::W64);
        let _c = entry.add(b, b, Width::W64);
        entry.ret().unwrap();
        builder.block(orphan).unwrap().ret().unwrap();
        let mut function = builder.build().unwrap();

        // The load is unclassified, so only the arithmetic goes.
        let entry_id = function.entry;
        let removed = remove_dead_instructions(function.block_mut(entry_id).unwrap());
        assert_eq!(removed, 2);
        assert_eq!(function.entry_block().instructions.len(), 3);

        assert_eq!(remove_unreachable_blocks(&mut function), 1);
        assert_eq!(function.blocks.len(), 1);
    }
}
