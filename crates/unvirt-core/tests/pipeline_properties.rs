mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use unvirt_core::analysis::AliasClass;
use unvirt_core::interp::{frame_base, Effect, Interpreter, Outcome, STATE_BASE};
use unvirt_core::passes::synth::{
    CancelToken, EquivalencePolicy, SynthesisBackend, SynthesisRequest, SynthesisResponse,
};
use unvirt_core::verify::verify_module;
use unvirt_core::{
    Budget, ClassifierConfig, ConcretizerConfig, Instruction, Module, Pipeline, PipelineConfig,
    PipelineStatus, SplitterConfig, SynthesisConfig, Terminator, Value, Width,
};

fn optimize(module: &mut Module, config: PipelineConfig) -> unvirt_core::PipelineReport {
    Pipeline::new(config).run(module)
}

fn assert_same_behaviour(before: &Module, after: &Module, function: &str, inputs: &[Vec<(i64, u64)>]) {
    for fields in inputs {
        let original = observe(before, function, fields);
        let rewritten = observe(after, function, fields);
        assert_eq!(original, rewritten, "inputs {:x?}", fields);
    }
}

#[test]
fn test_dispatch_vm_is_devirtualized() {
    let vm = dispatch_vm(3);
    let before = vm.module.clone();
    let mut module = vm.module;

    let report = optimize(&mut module, PipelineConfig::default());
    assert!(report.is_converged());
    assert_eq!(report.duplication.total_clones(), 2);
    assert_eq!(report.duplication.clones_of("vm", vm.dispatcher).len(), 2);
    assert!(report.diagnostics_of_kind("concretization-conflict").count() >= 1);

    let function = module.function("vm").unwrap();
    for (id, block) in &function.blocks {
        if *id == function.entry {
            continue;
        }
        assert!(!block.terminator.is_conditional(), "{} still dispatches", id);
        assert!(!matches!(block.terminator, Terminator::Trap(_)));
    }

    let inputs: Vec<Vec<(i64, u64)>> = (0..4).map(|rcx| vec![(RCX, rcx)]).collect();
    assert_same_behaviour(&before, &module, "vm", &inputs);

    for (rcx, target) in [(0u64, 0x1000u64), (1, 0x1001), (2, 0x1002), (9, 0x1002)] {
        let (outcome, effects, _) = observe(&module, "vm", &[(RCX, rcx)]);
        assert_eq!(outcome, Outcome::Returned);
        assert_eq!(
            effects,
            vec![Effect::Call {
                target,
                args: vec![0x77]
            }]
        );
    }
}

#[test]
fn test_dispatch_loop_is_split_per_context() {
    let vm = dispatch_loop();
    let before = vm.module.clone();
    let mut module = vm.module;

    let report = optimize(&mut module, PipelineConfig::default());
    assert!(report.is_converged());
    assert_eq!(report.duplication.clones_of("loop", vm.dispatcher).len(), 2);
    verify_module(&module).unwrap();

    let function = module.function("loop").unwrap();
    for (id, block) in &function.blocks {
        if *id != function.entry {
            assert!(!block.terminator.is_conditional(), "{} still dispatches", id);
        }
    }
    for handler in &vm.handlers {
        assert!(function.block(*handler).is_some());
    }

    let inputs = vec![vec![(RCX, 0)], vec![(RCX, 1)]];
    assert_same_behaviour(&before, &module, "loop", &inputs);

    let call = |target| Effect::Call {
        target,
        args: Vec::new(),
    };
    let (outcome, effects, _) = observe(&module, "loop", &[(RCX, 0)]);
    assert_eq!(outcome, Outcome::Returned);
    assert_eq!(effects, vec![call(0x100), call(0x200)]);
    let (_, effects, _) = observe(&module, "loop", &[(RCX, 1)]);
    assert_eq!(effects, vec![call(0x200)]);
}

#[test]
fn test_reused_pipeline_starts_fresh() {
    let mut pipeline = Pipeline::new(PipelineConfig::default());

    let mut agreeing = selector_join(1);
    assert!(pipeline.run(&mut agreeing).is_converged());
    let (_, effects, _) = observe(&agreeing, "f", &[(RCX, 1)]);
    assert_eq!(
        effects,
        vec![Effect::Call {
            target: 0x100,
            args: vec![1]
        }]
    );

    let before = selector_join(2);
    let mut conflicting = before.clone();
    assert!(pipeline.run(&mut conflicting).is_converged());
    let inputs = vec![vec![(RCX, 0)], vec![(RCX, 1)]];
    assert_same_behaviour(&before, &conflicting, "f", &inputs);
    let (_, effects, _) = observe(&conflicting, "f", &[(RCX, 1)]);
    assert_eq!(
        effects,
        vec![Effect::Call {
            target: 0x100,
            args: vec![2]
        }]
    );

    for _ in 0..2 {
        let mut module = dispatch_vm(3).module;
        let report = pipeline.run(&mut module);
        assert!(report.is_converged());
        assert_eq!(report.duplication.total_clones(), 2);
    }
}

#[test]
fn test_call_arguments_become_literals() {
    let vm = dispatch_vm(2);
    let mut module = vm.module;
    optimize(&mut module, PipelineConfig::default());

    let function = module.function("vm").unwrap();
    let calls: Vec<&Instruction> = function
        .blocks
        .values()
        .flat_map(|block| block.instructions.iter())
        .filter(|inst| matches!(inst, Instruction::Call { .. }))
        .collect();
    assert_eq!(calls.len(), 2);
    for call in calls {
        let Instruction::Call { args, .. } = call else {
            unreachable!()
        };
        assert_eq!(args, &vec![Value::konst(0x77, Width::W64)]);
    }
}

#[test]
fn test_pipeline_is_idempotent() {
    for mut module in [dispatch_vm(3).module, mba_module(Width::W64), forwarding_module()] {
        let first = optimize(&mut module, PipelineConfig::default());
        assert!(first.is_converged());
        let settled = module.clone();

        let second = optimize(&mut module, PipelineConfig::default());
        assert!(second.is_converged());
        assert_eq!(second.iterations, 1);
        assert!(second.stage_changes.iter().all(|stage| !stage.changed));
        assert_eq!(module, settled);
    }
}

#[test]
fn test_classification_matches_concrete_addresses() {
    let module = classified(forwarding_module());
    let function = module.function("fwd").unwrap();
    let state_size = u64::from(module.layout.size);

    for rcx in [0u64, 1] {
        let execution = Interpreter::new(&module)
            .with_value_recording()
            .run("fwd", state_with(&module, &[(RCX, rcx)]))
            .unwrap();

        for (site, class) in module.alias_table() {
            let block = function.block(site.block).unwrap();
            let (Instruction::Load { address, .. } | Instruction::Store { address, .. }) =
                &block.instructions[site.index]
            else {
                unreachable!()
            };
            let addresses = match address {
                Value::Const(c) => vec![c.bits],
                Value::Var(id) => execution
                    .observed
                    .get(&(site.block, *id))
                    .cloned()
                    .unwrap_or_default(),
            };
            for concrete in addresses {
                match class {
                    AliasClass::StateField { offset, .. } => {
                        assert_eq!(concrete, STATE_BASE + u64::from(offset));
                    }
                    AliasClass::Stack { frame, offset, .. } => {
                        assert_eq!(concrete, frame_base(frame).wrapping_add(offset as u64));
                    }
                    AliasClass::Heap => {
                        assert!(!(STATE_BASE..STATE_BASE + state_size).contains(&concrete));
                    }
                    AliasClass::Unknown => {}
                }
            }
        }
    }
}

#[test]
fn test_forwarding_keeps_disagreeing_loads() {
    let before = forwarding_module();
    let mut module = before.clone();
    let report = optimize(&mut module, PipelineConfig::default());
    assert!(report.is_converged());

    let function = module.function("fwd").unwrap();
    let join = function.blocks.keys().last().copied().unwrap();
    let Some(Instruction::Call { args, .. }) = function
        .block(join)
        .unwrap()
        .instructions
        .iter()
        .find(|inst| matches!(inst, Instruction::Call { .. }))
    else {
        panic!("call disappeared");
    };

    assert_eq!(args[0], Value::konst(0x1122_3344, Width::W64));
    assert!(args[1].as_var().is_some());
    assert_eq!(args[2], Value::konst(0x3344, Width::W16));
    assert_eq!(args[3], Value::konst(0x1_1223_3440, Width::W64));
    assert_eq!(args[4], Value::konst(0x40, Width::W64));
    assert_eq!(args[5], Value::konst(0x1234_5678, Width::W32));

    let inputs = vec![vec![(RCX, 0)], vec![(RCX, 1)]];
    assert_same_behaviour(&before, &module, "fwd", &inputs);
}

#[test]
fn test_synthesis_preserves_semantics_at_byte_width() {
    let before = mba_module(Width::W8);
    let mut module = before.clone();
    let report = optimize(&mut module, PipelineConfig::default());
    assert!(report.is_converged());

    let function = module.function("mba").unwrap();
    let entry = function.block(function.entry).unwrap();
    assert!(!entry.instructions.iter().any(|inst| matches!(
        inst,
        Instruction::Binary {
            op: unvirt_core::BinaryOp::Mul,
            ..
        }
    )));

    for x in 0..=255u64 {
        for y in (0..=255u64).step_by(5) {
            let (_, _, expected) = observe(&before, "mba", &[(RBX, x), (RCX, y)]);
            let (_, _, actual) = observe(&module, "mba", &[(RBX, x), (RCX, y)]);
            assert_eq!(actual.read_state(RAX as u32, 1), (x + y) & 0xff);
            assert_eq!(actual, expected);
        }
    }
}

#[test]
fn test_disabled_synthesis_keeps_mba() {
    let before = mba_module(Width::W64);
    let mut module = before.clone();
    let config = PipelineConfig::default().with_synthesis(SynthesisConfig::default().disabled());
    let report = optimize(&mut module, config);
    assert!(report.is_converged());
    assert_eq!(
        module.function("mba").unwrap().instruction_count(),
        before.function("mba").unwrap().instruction_count()
    );
}

#[test]
fn test_iteration_budget_leaves_valid_ir() {
    let vm = dispatch_vm(3);
    let before = vm.module.clone();
    let mut module = vm.module;
    let config = PipelineConfig::default().with_budget(Budget::default().with_max_iterations(1));

    let report = optimize(&mut module, config);
    assert_eq!(report.status, PipelineStatus::BudgetExceeded);
    assert_eq!(report.iterations, 1);
    assert!(report.duplication.is_empty());
    verify_module(&module).unwrap();

    let inputs: Vec<Vec<(i64, u64)>> = (0..3).map(|rcx| vec![(RCX, rcx)]).collect();
    assert_same_behaviour(&before, &module, "vm", &inputs);
}

#[test]
fn test_operation_budget_stops_the_run() {
    let mut module = dispatch_vm(3).module;
    let config = PipelineConfig::default().with_budget(Budget::default().with_max_operations(0));
    let report = optimize(&mut module, config);
    assert_eq!(report.status, PipelineStatus::BudgetExceeded);
    verify_module(&module).unwrap();
}

struct Stalled;

impl SynthesisBackend for Stalled {
    fn name(&self) -> &'static str {
        "stalled"
    }

    fn synthesize(&self, _request: &SynthesisRequest, _cancel: &CancelToken) -> SynthesisResponse {
        SynthesisResponse::Timeout
    }
}

#[test]
fn test_timed_out_queries_keep_the_original() {
    let before = mba_module(Width::W64);
    let mut module = before.clone();
    let config = PipelineConfig::new()
        .with_classifier(ClassifierConfig { field_aligned: true })
        .with_concretizer(ConcretizerConfig::default())
        .with_splitter(SplitterConfig::default().with_max_clones_per_origin(4))
        .with_synthesis(
            SynthesisConfig::default()
                .with_query_timeout(Duration::from_millis(50))
                .with_policy(EquivalencePolicy::Exhaustive { max_domain_bits: 16 }),
        );

    let report = Pipeline::new(config)
        .with_synthesis_backend(Arc::new(Stalled))
        .run(&mut module);
    assert!(report.is_converged());
    assert!(report.diagnostics_of_kind("synthesis-timeout").count() >= 1);
    assert_eq!(
        module.function("mba").unwrap().instruction_count(),
        before.function("mba").unwrap().instruction_count()
    );
}
