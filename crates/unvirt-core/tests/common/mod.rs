#![allow(dead_code)]

use std::sync::Arc;
use unvirt_core::interp::{Effect, Interpreter, MachineState, Outcome};
use unvirt_core::{
    AnalysisManager, BlockId, CmpPred, FunctionBuilder, Module, StateLayout, Value, Width,
};
use unvirt_core::passes::{ClassifyPass, Pass};

pub const RAX: i64 = 0;
pub const RCX: i64 = 8;
pub const RDX: i64 = 16;
pub const RBX: i64 = 24;

pub fn empty_module() -> Module {
    Module::new("fixture", Arc::new(StateLayout::x86_64()))
}

pub fn classified(mut module: Module) -> Module {
    ClassifyPass::default()
        .run(&mut module, &mut AnalysisManager::new())
        .expect("classification never fails");
    module
}

/// Blocks of the dispatch fixture, by role.
pub struct DispatchVm {
    pub module: Module,
    pub handlers: Vec<BlockId>,
    pub dispatcher: BlockId,
    pub targets: Vec<BlockId>,
}

/// A virtual machine loop in miniature: `rcx` picks one of `n` handlers (the
/// last one doubles as the default), each
/// handler writes its own opcode into `rax` and jumps to a shared dispatcher,
/// which switches on `rax` and calls `0x1000 + opcode`.
pub fn dispatch_vm(n: u64) -> DispatchVm {
    let mut builder = FunctionBuilder::new("vm");
    let handlers: Vec<BlockId> = (0..n).map(|_| builder.create_block()).collect();
    let dispatcher = builder.create_block();
    let targets: Vec<BlockId> = (0..n).map(|_| builder.create_block()).collect();
    let bad = builder.create_block();

    let mut entry = builder.entry_block();
    let rcx = entry.load_state(RCX, Width::W64);
    let (last, rest) = handlers.split_last().unwrap();
    let cases: Vec<(u64, BlockId)> = rest
        .iter()
        .enumerate()
        .map(|(i, h)| (i as u64, *h))
        .collect();
    entry.switch(rcx, cases, *last).unwrap();

    for (i, handler) in handlers.iter().enumerate() {
        let mut h = builder.block(*handler).unwrap();
        h.store_state(RAX, Value::konst(i as u64 + 1, Width::W64), Width::W64);
        h.store_state(RDX, Value::konst(0x77, Width::W64), Width::W64);
        h.jump(dispatcher).unwrap();
    }

    let mut d = builder.block(dispatcher).unwrap();
    let opcode = d.load_state(RAX, Width::W64);
    let cases: Vec<(u64, BlockId)> = targets
        .iter()
        .enumerate()
        .map(|(i, t)| (i as u64 + 1, *t))
        .collect();
    d.switch(opcode, cases, bad).unwrap();

    for (i, target) in targets.iter().enumerate() {
        let mut t = builder.block(*target).unwrap();
        let rdx = t.load_state(RDX, Width::W64);
        t.call_void(0x1000 + i as u64, vec![rdx]);
        t.ret().unwrap();
    }
    builder.block(bad).unwrap().trap("invalid opcode").unwrap();

    let mut module = empty_module();
    module.add_function(builder.build().unwrap());
    DispatchVm {
        module,
        handlers,
        dispatcher,
        targets,
    }
}

/// Blocks of the dispatch loop fixture, by role.
pub struct DispatchLoop {
    pub module: Module,
    pub dispatcher: BlockId,
    pub handlers: Vec<BlockId>,
}

/// A dispatch loop whose handlers jump back to the dispatcher. `rcx == 0`
/// enters with opcode 1, anything else with opcode 2. Handler 1 calls `0x100`
/// and continues with opcode 2; handler 2 calls `0x200` and continues with
/// opcode 3, which leaves the loop.
pub fn dispatch_loop() -> DispatchLoop {
    let mut builder = FunctionBuilder::new("loop");
    let first = builder.create_block();
    let second = builder.create_block();
    let dispatcher = builder.create_block();
    let handlers: Vec<BlockId> = (0..2).map(|_| builder.create_block()).collect();
    let exit = builder.create_block();

    let mut entry = builder.entry_block();
    let rcx = entry.load_state(RCX, Width::W64);
    let zero = entry.konst(0, Width::W64);
    let cond = entry.compare(CmpPred::Eq, rcx, zero, Width::W64);
    entry.branch(cond, first, second).unwrap();

    for (block, opcode) in [(first, 1), (second, 2)] {
        let mut b = builder.block(block).unwrap();
        b.store_state(RAX, Value::konst(opcode, Width::W64), Width::W64);
        b.jump(dispatcher).unwrap();
    }

    let mut d = builder.block(dispatcher).unwrap();
    let opcode = d.load_state(RAX, Width::W64);
    d.switch(opcode, vec![(1, handlers[0]), (2, handlers[1])], exit)
        .unwrap();

    for (handler, target, next) in [(handlers[0], 0x100, 2), (handlers[1], 0x200, 3)] {
        let mut h = builder.block(handler).unwrap();
        h.call_void(target, Vec::new());
        h.store_state(RAX, Value::konst(next, Width::W64), Width::W64);
        h.jump(dispatcher).unwrap();
    }
    builder.block(exit).unwrap().ret().unwrap();

    let mut module = empty_module();
    module.add_function(builder.build().unwrap());
    DispatchLoop {
        module,
        dispatcher,
        handlers,
    }
}

/// `f` stores 1 to `rax`, overwrites it with `alternate` when `rcx != 0`, and
/// calls `0x100` with `rax` at the join.
pub fn selector_join(alternate: u64) -> Module {
    let mut builder = FunctionBuilder::new("f");
    let join = builder.create_block();
    let other = builder.create_block();

    let mut entry = builder.entry_block();
    entry.store_state(RAX, Value::konst(1, Width::W64), Width::W64);
    let rcx = entry.load_state(RCX, Width::W64);
    let zero = entry.konst(0, Width::W64);
    let cond = entry.compare(CmpPred::Eq, rcx, zero, Width::W64);
    entry.branch(cond, join, other).unwrap();

    let mut o = builder.block(other).unwrap();
    o.store_state(RAX, Value::konst(alternate, Width::W64), Width::W64);
    o.jump(join).unwrap();

    let mut j = builder.block(join).unwrap();
    let rax = j.load_state(RAX, Width::W64);
    j.call_void(0x100, vec![rax]);
    j.ret().unwrap();

    let mut module = empty_module();
    module.add_function(builder.build().unwrap());
    module
}

/// `rax = (rbx ^ rcx) + 2 * (rbx & rcx)` at `width`.
pub fn mba_module(width: Width) -> Module {
    let mut builder = FunctionBuilder::new("mba");
    let mut entry = builder.entry_block();
    let x = entry.load_state(RBX, width);
    let y = entry.load_state(RCX, width);
    let a = entry.xor(x, y, width);
    let b = entry.and(x, y, width);
    let two = entry.konst(2, width);
    let c = entry.mul(b, two, width);
    let d = entry.add(a, c, width);
    entry.store_state(RAX, d, width);
    entry.ret().unwrap();

    let mut module = empty_module();
    module.add_function(builder.build().unwrap());
    module
}

/// Branches on `rcx == 0`; both arms agree on `rbx` but not on `rdx`.
pub fn forwarding_module() -> Module {
    let mut builder = FunctionBuilder::new("fwd");
    let frame = builder.new_frame();
    let left = builder.create_block();
    let right = builder.create_block();
    let join = builder.create_block();

    let mut entry = builder.entry_block();
    let base = entry.frame_base(frame);
    let slot = entry.ptr_add(base, -8);
    entry.store(slot, Value::konst(0x40, Width::W64), Width::W64);
    let rcx = entry.load_state(RCX, Width::W64);
    let zero = entry.konst(0, Width::W64);
    let cond = entry.compare(CmpPred::Eq, rcx, zero, Width::W64);
    entry.branch(cond, left, right).unwrap();

    for (block, rdx) in [(left, 1), (right, 2)] {
        let mut b = builder.block(block).unwrap();
        b.store_state(RBX, Value::konst(0x1122_3344, Width::W64), Width::W64);
        b.store_state(RDX, Value::konst(rdx, Width::W64), Width::W64);
        b.jump(join).unwrap();
    }

    let mut j = builder.block(join).unwrap();
    let rbx = j.load_state(RBX, Width::W64);
    let rdx = j.load_state(RDX, Width::W64);
    let low = j.load_state(RBX, Width::W16);
    let shifted = j.shl(rbx, Value::konst(4, Width::W64), Width::W64);
    let base = j.frame_base(frame);
    let slot = j.ptr_add(base, -8);
    let local = j.load(slot, Width::W64);
    let table = j.konst(0x5000, Width::W64);
    let entry_word = j.load(table, Width::W32);
    j.call_void(0x2000, vec![rbx, rdx, low, shifted, local, entry_word]);
    j.ret().unwrap();

    let mut module = empty_module().with_image(
        unvirt_core::BinaryImage::new().with_segment(0x5000, vec![0x78, 0x56, 0x34, 0x12], false),
    );
    module.add_function(builder.build().unwrap());
    module
}

pub fn state_with(module: &Module, fields: &[(i64, u64)]) -> MachineState {
    let mut state = MachineState::for_module(module);
    for (offset, value) in fields {
        state.set_state(*offset as u32, 8, *value);
    }
    state
}

pub fn observe(module: &Module, function: &str, fields: &[(i64, u64)]) -> (Outcome, Vec<Effect>, MachineState) {
    let execution = Interpreter::new(module)
        .run(function, state_with(module, fields))
        .expect("interpretation succeeds");
    (execution.outcome, execution.effects, execution.state)
}
