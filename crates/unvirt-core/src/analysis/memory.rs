/*! Reaching literal definitions over precise memory locations.
 *
 * Lifted handlers communicate exclusively through memory: the dispatcher writes the next handler
 * index into a state field and the next block loads it back. `MemoryFacts` tracks which precise
 * locations hold a known literal at every block boundary so that loads can be forwarded and
 * dispatch selectors resolved per predecessor.
 */

use crate::analysis::alias::{AliasClass, Location};
use crate::analysis::cfg::ControlFlowGraph;
use crate::block::BlockId;
use crate::function::Function;
use crate::instructions::Instruction;
use crate::values::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Literal contents of precise locations. Absent locations are unknown.
pub type Facts = BTreeMap<Location, u64>;

#[derive(Debug, Clone, Default)]
pub struct MemoryFacts {
    in_facts: HashMap<BlockId, Facts>,
    out_facts: HashMap<BlockId, Facts>,
    conflicts: HashMap<BlockId, BTreeSet<Location>>,
}

impl MemoryFacts {
    pub fn compute(function: &Function, cfg: &ControlFlowGraph) -> Self {
        let order = cfg.reverse_postorder();
        // `None` is the optimistic top element.
        let mut outs: HashMap<BlockId, Option<Facts>> = order.iter().map(|b| (*b, None)).collect();
        let mut ins: HashMap<BlockId, Facts> = HashMap::new();

        let mut changed = true;
        while changed {
            changed = false;
            for &block_id in order {
                let in_state = if block_id == cfg.entry {
                    Facts::new()
                } else {
                    let pred_outs = cfg
                        .reachable_predecessors(block_id)
                        .into_iter()
                        .filter_map(|p| outs.get(&p).and_then(Option::as_ref));
                    meet(pred_outs)
                };

                let Some(block) = function.block(block_id) else {
                    continue;
                };
                let mut out_state = in_state.clone();
                for inst in &block.instructions {
                    transfer(&mut out_state, inst);
                }

                ins.insert(block_id, in_state);
                let slot = outs.entry(block_id).or_insert(None);
                if slot.as_ref() != Some(&out_state) {
                    *slot = Some(out_state);
                    changed = true;
                }
            }
        }

        let out_facts: HashMap<BlockId, Facts> = outs
            .into_iter()
            .filter_map(|(b, facts)| facts.map(|f| (b, f)))
            .collect();

        let mut conflicts: HashMap<BlockId, BTreeSet<Location>> = HashMap::new();
        for &block_id in order {
            if block_id == cfg.entry {
                continue;
            }
            let in_state = &ins[&block_id];
            for pred in cfg.reachable_predecessors(block_id) {
                if let Some(pred_out) = out_facts.get(&pred) {
                    for location in pred_out.keys() {
                        if !in_state.contains_key(location) {
                            conflicts.entry(block_id).or_default().insert(*location);
                        }
                    }
                }
            }
        }

        Self {
            in_facts: ins,
            out_facts,
            conflicts,
        }
    }

    pub fn block_in(&self, block: BlockId) -> Option<&Facts> {
        self.in_facts.get(&block)
    }

    pub fn block_out(&self, block: BlockId) -> Option<&Facts> {
        self.out_facts.get(&block)
    }

    /// Whether some predecessor knew a literal for a location overlapping `location`
    /// that did not survive the meet into `block`.
    pub fn is_conflicted(&self, block: BlockId, location: &Location) -> bool {
        self.conflicts
            .get(&block)
            .is_some_and(|set| set.iter().any(|l| l.overlaps(location)))
    }
}

/// Keep only the locations on which every input agrees.
pub fn meet<'a>(mut inputs: impl Iterator<Item = &'a Facts>) -> Facts {
    let Some(first) = inputs.next() else {
        return Facts::new();
    };
    let mut result = first.clone();
    for facts in inputs {
        result.retain(|location, value| facts.get(location) == Some(value));
    }
    result
}

/// Apply the memory effect of one instruction.
pub fn transfer(facts: &mut Facts, inst: &Instruction) {
    match inst {
        Instruction::Store {
            value,
            width,
            class,
            ..
        } => match class {
            AliasClass::StateField { .. } | AliasClass::Stack { .. } => {
                let Some(location) = class.location() else {
                    return;
                };
                facts.retain(|l, _| !l.overlaps(&location));
                if let Value::Const(c) = value {
                    facts.insert(location, width.truncate(c.bits));
                }
            }
            AliasClass::Heap => {}
            AliasClass::Unknown => facts.clear(),
        },
        Instruction::Call { .. } | Instruction::Opaque { .. } => facts.clear(),
        _ => {}
    }
}

/// Literal stored at `location`, assembled little-endian from the known bytes.
pub fn lookup(facts: &Facts, location: &Location) -> Option<u64> {
    if let Some(value) = facts.get(location) {
        return Some(*value);
    }

    let mut result = 0u64;
    for i in 0..i64::from(location.width) {
        let byte_offset = location.offset + i;
        let byte = facts.iter().find_map(|(l, v)| {
            if l.region == location.region && l.offset <= byte_offset && byte_offset < l.end() {
                let shift = (byte_offset - l.offset) * 8;
                Some((v >> shift) & 0xff)
            } else {
                None
            }
        })?;
        result |= byte << (i * 8);
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::alias::Region;
    use crate::block::Terminator;
    use crate::types::Width;
    use crate::values::ValueId;

    fn field(offset: i64, width: u8) -> Location {
        Location {
            region: Region::State,
            offset,
            width,
        }
    }

    fn store(offset: u32, bits: u64) -> Instruction {
        Instruction::Store {
            address: Value::Var(ValueId(0)),
            value: Value::konst(bits, Width::W64),
            width: Width::W64,
            class: AliasClass::StateField { offset, width: 8 },
        }
    }

    #[test]
    fn test_subrange_lookup_is_little_endian() {
        let mut facts = Facts::new();
        facts.insert(field(0, 8), 0x1122_3344_5566_7788);
        assert_eq!(lookup(&facts, &field(0, 4)), Some(0x5566_7788));
        assert_eq!(lookup(&facts, &field(4, 2)), Some(0x3344));
        assert_eq!(lookup(&facts, &field(6, 4)), None);
    }

    #[test]
    fn test_transfer_kills_overlaps() {
        let mut facts = Facts::new();
        transfer(&mut facts, &store(0, 5));
        transfer(&mut facts, &store(8, 6));
        transfer(
            &mut facts,
            &Instruction::Store {
                address: Value::Var(ValueId(0)),
                value: Value::Var(ValueId(1)),
                width: Width::W32,
                class: AliasClass::StateField {
                    offset: 4,
                    width: 4,
                },
            },
        );
        assert_eq!(facts.len(), 1);
        assert_eq!(lookup(&facts, &field(8, 8)), Some(6));

        transfer(
            &mut facts,
            &Instruction::Call {
                result: None,
                target: 0x401000,
                args: vec![],
            },
        );
        assert!(facts.is_empty());
    }

    #[test]
    fn test_meet_by_agreement() {
        let mut func = Function::new("merge");
        let entry = func.entry;
        let left = func.create_block();
        let right = func.create_block();
        let join = func.create_block();

        let entry_block = func.block_mut(entry).unwrap();
        entry_block.add_instruction(store(16, 1));
        entry_block.set_terminator(Terminator::Branch {
            cond: Value::Var(ValueId(9)),
            then_block: left,
            else_block: right,
        });
        let left_block = func.block_mut(left).unwrap();
        left_block.add_instruction(store(0, 10));
        left_block.set_terminator(Terminator::Jump(join));
        let right_block = func.block_mut(right).unwrap();
        right_block.add_instruction(store(0, 20));
        right_block.set_terminator(Terminator::Jump(join));
        func.block_mut(join).unwrap().set_terminator(Terminator::Return);

        let cfg = ControlFlowGraph::build(&func);
        let facts = MemoryFacts::compute(&func, &cfg);

        let join_in = facts.block_in(join).unwrap();
        assert_eq!(lookup(join_in, &field(16, 8)), Some(1));
        assert_eq!(lookup(join_in, &field(0, 8)), None);
        assert!(facts.is_conflicted(join, &field(0, 8)));
        assert!(!facts.is_conflicted(join, &field(16, 8)));
    }

    #[test]
    fn test_loop_reaches_fixpoint() {
        let mut func = Function::new("loop");
        let entry = func.entry;
        let header = func.create_block();
        let body = func.create_block();
        let exit = func.create_block();

        let entry_block = func.block_mut(entry).unwrap();
        entry_block.add_instruction(store(0, 1));
        entry_block.add_instruction(store(8, 7));
        entry_block.set_terminator(Terminator::Jump(header));
        func.block_mut(header).unwrap().set_terminator(Terminator::Branch {
            cond: Value::Var(ValueId(9)),
            then_block: body,
            else_block: exit,
        });
        let body_block = func.block_mut(body).unwrap();
        body_block.add_instruction(store(0, 2));
        body_block.set_terminator(Terminator::Jump(header));
        func.block_mut(exit).unwrap().set_terminator(Terminator::Return);

        let facts = MemoryFacts::compute(&func, &ControlFlowGraph::build(&func));
        let header_in = facts.block_in(header).unwrap();
        assert_eq!(lookup(header_in, &field(0, 8)), None);
        assert_eq!(lookup(header_in, &field(8, 8)), Some(7));
    }
}
