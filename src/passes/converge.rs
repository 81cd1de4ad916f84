//! Converge (§4.2): merges Nanotube API calls that would otherwise sit at
//! different points in the control-flow graph into a single converged-
//! access block (CAB) reached by every path that needs it, so a later
//! pass never has to reason about the same kind of hardware-visible
//! access happening at more than one program point.
//!
//! Grounded on `original_source/back_end/Converge.cpp`: per-block access
//! recording, a reduced CFG that short-circuits access-free blocks, a
//! reverse-topological tail-length metric used to pick the "critical"
//! access to converge around each round, and a frontier-driven plan
//! construction loop built directly on [`crate::traversal::DepAwareConverter`].
//!
//! This module folds the source's separate "bypass-flow weaving" step
//! into CAB construction itself: every frontier access (not just the
//! merged ones) is routed through the CAB via the path-selector switch,
//! with non-merged accesses getting a *dummy* entry (placeholder
//! arguments, discarded result) in the shared call and then running for
//! real once control lands back in their own block. That is exactly the
//! shape the source's weave step builds by hand; here it falls out of
//! the CAB's switch for free, so there is no separate weave pass.

use crate::api::Intrinsic;
use crate::config::PipelineConfig;
use crate::diagnostics::{PassError, PassResult};
use crate::flowgraph::ControlFlowGraph;
use crate::ir::entities::{Block, Inst, Value};
use crate::ir::function::Function;
use crate::ir::instructions::{BlockCall, InstructionData, SwitchCase};
use crate::ir::types::Type;
use crate::traversal::DepAwareConverter;
use cranelift_entity::EntityRef;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::cmp::Reverse;

/// One planned convergence step. `frontier` is every access ready at the
/// round this step was planned (§4.2.2's fan-in); `merged` is the subset
/// of those that are mutually merge-compatible with the chosen critical
/// access and so share one physical call in the CAB.
struct MergeSet {
    merged: Vec<Inst>,
    frontier: Vec<Inst>,
}

/// Runs Converge over `func`. A no-op if the function makes no Nanotube
/// API calls at all.
pub fn run(func: &mut Function, config: &PipelineConfig) -> PassResult<()> {
    let accesses = record_accesses(func);
    if accesses.values().all(Vec::is_empty) {
        return Ok(());
    }

    let mut cfg = ControlFlowGraph::new();
    cfg.compute(func);

    let reduced = ReducedCfg::build(func, &cfg, &accesses);
    let tail_length = reduced.tail_lengths();
    let plan = build_plan(func, &accesses, &reduced, &tail_length)?;

    if config.converge_stats {
        log::debug!(
            "converge: {} merge step(s) planned for `{}`",
            plan.len(),
            func.name
        );
    }

    for merge_set in &plan {
        build_cab(func, merge_set)?;
    }

    // CAB-introduced values dominate every consumer by construction (a
    // CAB dominates every block its switch can reach), so there is no
    // general SSA-dominance repair to run here. General repair (stack
    // slot + per-edge memcpy for a pointer that no longer has a single
    // dominating definition) and the pointer-phi removal it would feed
    // are not implemented by this pass; every access this module merges
    // is itself a value-producing call, never a raw pointer phi, so the
    // gap doesn't bite for anything Converge actually builds.
    unify_exits(func);
    Ok(())
}

fn record_accesses(func: &Function) -> FxHashMap<Block, Vec<Inst>> {
    let mut map = FxHashMap::default();
    for block in func.layout.blocks() {
        let calls: Vec<Inst> = func
            .layout
            .block_insts(block)
            .filter(|&inst| matches!(func.dfg.inst_data(inst), InstructionData::NanotubeCall { .. }))
            .collect();
        map.insert(block, calls);
    }
    map
}

fn call_info(func: &Function, inst: Inst) -> (Intrinsic, SmallVec<[Value; 4]>) {
    match func.dfg.inst_data(inst) {
        InstructionData::NanotubeCall { intrinsic, args } => (*intrinsic, args.clone()),
        other => unreachable!("converge: access instruction is not a Nanotube call: {other:?}"),
    }
}

fn const_i64(func: &Function, value: Value) -> Option<i64> {
    let inst = func.dfg.value_def(value)?;
    match func.dfg.inst_data(inst) {
        InstructionData::IconstI64 { value } => Some(*value),
        InstructionData::IconstU64 { value } => Some(*value as i64),
        _ => None,
    }
}

/// Only `map_op` folds every map access kind into one generic call, told
/// apart by an explicit operand (mirrors `Converge.cpp`'s
/// `getMapAccessT`, which reads the access kind off call operand 2; this
/// façade's calls drop the implicit context argument the original's
/// operand numbering assumes, so the same operand sits one index
/// earlier here).
fn access_kind_operand(intrinsic: Intrinsic) -> Option<usize> {
    match intrinsic {
        Intrinsic::MapOp => Some(1),
        _ => None,
    }
}

/// Two accesses can share one physical call when they invoke the same
/// intrinsic, carry the same length operand if the call is sized, and,
/// for map intrinsics, target the same map handle under the same access
/// kind (§4.2.1). Folding a read and an insert on the same map into one
/// shared call would silently turn one side's access into the other's;
/// folding two differently-sized packet reads into one would lose
/// whichever length doesn't make it into the shared call's single length
/// argument.
fn merge_compatible(
    func: &Function,
    a: &(Intrinsic, SmallVec<[Value; 4]>),
    b: &(Intrinsic, SmallVec<[Value; 4]>),
) -> bool {
    if a.0 != b.0 {
        return false;
    }
    // A length/kind operand that isn't a resolvable constant can't be
    // proven to mismatch, so it's only ever used to *reject* a merge,
    // never to justify one: known-and-different blocks, anything else
    // falls through to the merge this call would otherwise have allowed.
    if let Some(sized) = a.0.length_arg() {
        let a_len = a.1.get(sized.arg_index).copied().and_then(|v| const_i64(func, v));
        let b_len = b.1.get(sized.arg_index).copied().and_then(|v| const_i64(func, v));
        if let (Some(x), Some(y)) = (a_len, b_len) {
            if x != y {
                return false;
            }
        }
    }
    if a.0.is_map_call() {
        if a.1.first() != b.1.first() {
            return false;
        }
        if let Some(idx) = access_kind_operand(a.0) {
            let a_kind = a.1.get(idx).copied().and_then(|v| const_i64(func, v));
            let b_kind = b.1.get(idx).copied().and_then(|v| const_i64(func, v));
            if let (Some(x), Some(y)) = (a_kind, b_kind) {
                if x != y {
                    return false;
                }
            }
        }
        return true;
    }
    true
}

/// The CFG with access-free blocks contracted out, so tail-length and
/// frontier bookkeeping only ever deal with blocks that actually matter
/// to convergence (§4.2.2 "reduced CFG").
struct ReducedCfg {
    succs: FxHashMap<Block, Vec<Block>>,
    preds: FxHashMap<Block, Vec<Block>>,
    nodes: Vec<Block>,
}

impl ReducedCfg {
    fn build(func: &Function, cfg: &ControlFlowGraph, accesses: &FxHashMap<Block, Vec<Inst>>) -> Self {
        let nodes: Vec<Block> = func
            .layout
            .blocks()
            .filter(|b| !accesses[b].is_empty())
            .collect();
        let node_set: FxHashSet<Block> = nodes.iter().copied().collect();

        let mut succs: FxHashMap<Block, Vec<Block>> = FxHashMap::default();
        for &b in &nodes {
            let mut seen = FxHashSet::default();
            let mut stack: Vec<Block> = cfg.succ_iter(b).collect();
            let mut out = Vec::new();
            while let Some(s) = stack.pop() {
                if !seen.insert(s) {
                    continue;
                }
                if node_set.contains(&s) {
                    out.push(s);
                } else {
                    stack.extend(cfg.succ_iter(s));
                }
            }
            succs.insert(b, out);
        }

        let mut preds: FxHashMap<Block, Vec<Block>> = FxHashMap::default();
        for &b in &nodes {
            preds.entry(b).or_default();
        }
        for (&b, outs) in &succs {
            for &s in outs {
                preds.entry(s).or_default().push(b);
            }
        }

        ReducedCfg { succs, preds, nodes }
    }

    /// Length, in reduced-graph hops, of the longest path from each
    /// access block to a tail of the reduced CFG. Memoized DFS; a block
    /// revisited while still on the current DFS stack means a loop back
    /// into the reduced graph, which contributes no further tail length
    /// (loop support is out of scope for the passes downstream of this
    /// one, so the metric only needs to be a sound tie-breaker here, not
    /// an exact longest-path answer across cycles).
    fn tail_lengths(&self) -> FxHashMap<Block, u32> {
        let mut lengths = FxHashMap::default();
        let mut on_stack = FxHashSet::default();
        for &b in &self.nodes {
            self.tail_length_of(b, &mut lengths, &mut on_stack);
        }
        lengths
    }

    fn tail_length_of(
        &self,
        b: Block,
        lengths: &mut FxHashMap<Block, u32>,
        on_stack: &mut FxHashSet<Block>,
    ) -> u32 {
        if let Some(&l) = lengths.get(&b) {
            return l;
        }
        if !on_stack.insert(b) {
            return 0;
        }
        let max_tail = self
            .succs
            .get(&b)
            .into_iter()
            .flatten()
            .map(|&s| self.tail_length_of(s, lengths, on_stack))
            .max()
            .unwrap_or(0);
        on_stack.remove(&b);
        let l = 1 + max_tail;
        lengths.insert(b, l);
        l
    }
}

fn pull_ready(
    conv: &mut DepAwareConverter<Block>,
    active: &mut FxHashSet<Block>,
    frontier_idx: &FxHashMap<Block, usize>,
    accesses: &FxHashMap<Block, Vec<Inst>>,
    reduced: &ReducedCfg,
) {
    while let Some(b) = conv.take_ready() {
        let idx = frontier_idx.get(&b).copied().unwrap_or(0);
        if idx < accesses[&b].len() {
            active.insert(b);
        } else {
            for &s in reduced.succs.get(&b).into_iter().flatten() {
                conv.mark_dep_ready(&s);
            }
        }
    }
}

/// Builds the merge plan (§4.2.2): each round picks the "critical"
/// access — the one in the frontier whose block has the longest
/// remaining reduced-CFG tail — and merges every other merge-compatible
/// frontier access into it. Ties break on lowest block index, a stable
/// but otherwise arbitrary choice (see `DESIGN.md`'s Open Question
/// decisions: any tie-break is sound here as long as it still produces a
/// valid plan, which a deterministic total order trivially does).
fn build_plan(
    func: &Function,
    accesses: &FxHashMap<Block, Vec<Inst>>,
    reduced: &ReducedCfg,
    tail_length: &FxHashMap<Block, u32>,
) -> PassResult<Vec<MergeSet>> {
    let mut conv: DepAwareConverter<Block> = DepAwareConverter::new();
    for &b in &reduced.nodes {
        let preds = reduced.preds.get(&b).map(Vec::len).unwrap_or(0) as u32;
        conv.insert(b, preds);
    }

    let mut frontier_idx: FxHashMap<Block, usize> = FxHashMap::default();
    let mut active: FxHashSet<Block> = FxHashSet::default();
    pull_ready(&mut conv, &mut active, &frontier_idx, accesses, reduced);

    let mut plan = Vec::new();
    while !active.is_empty() {
        let candidates: Vec<(Block, Inst)> = active
            .iter()
            .map(|&b| (b, accesses[&b][frontier_idx.get(&b).copied().unwrap_or(0)]))
            .collect();

        let &(critical_block, critical_inst) = candidates
            .iter()
            .max_by_key(|(b, _)| (tail_length.get(b).copied().unwrap_or(0), Reverse(b.index())))
            .expect("active is non-empty");
        let critical_info = call_info(func, critical_inst);

        let mut merged = vec![critical_inst];
        let mut merged_blocks = vec![critical_block];
        for &(b, inst) in &candidates {
            if b == critical_block {
                continue;
            }
            let info = call_info(func, inst);
            if merge_compatible(func, &critical_info, &info) {
                merged.push(inst);
                merged_blocks.push(b);
            }
        }
        for &inst in &merged[1..] {
            let info = call_info(func, inst);
            if !merge_compatible(func, &critical_info, &info) {
                return Err(PassError::MergeCompatibilityFailed {
                    function: func.name.clone(),
                    detail: format!("{inst}"),
                });
            }
        }

        let frontier: Vec<Inst> = candidates.iter().map(|&(_, i)| i).collect();
        plan.push(MergeSet { merged, frontier });

        for b in merged_blocks {
            active.remove(&b);
            let idx = frontier_idx.entry(b).or_insert(0);
            *idx += 1;
            if *idx == accesses[&b].len() {
                for &s in reduced.succs.get(&b).into_iter().flatten() {
                    conv.mark_dep_ready(&s);
                }
            } else {
                active.insert(b);
            }
        }
        pull_ready(&mut conv, &mut active, &frontier_idx, accesses, reduced);
    }

    Ok(plan)
}

fn make_const(func: &mut Function, block: Block, value: i64, ty: Type) -> Value {
    let inst = func.dfg.make_inst(InstructionData::IconstI64 { value });
    func.layout.append_inst(inst, block);
    func.dfg.append_result(inst, ty)
}

/// Splices one converged-access block in for `merge_set` (§4.2.2,
/// §4.2.3): every frontier access is split out of its home block into a
/// fresh landing block, the home block is redirected to jump into the
/// CAB carrying a path id (and, for merged accesses, their real
/// arguments), and the CAB's switch routes back out to the matching
/// landing block. Merged accesses are deleted and their result rewired
/// to the CAB's single shared call result; non-merged accesses are left
/// untouched in their landing block and simply get a dummy (placeholder-
/// argument, discarded-result) entry in the CAB's shared call.
fn build_cab(func: &mut Function, merge_set: &MergeSet) -> PassResult<()> {
    if merge_set.frontier.is_empty() {
        return Ok(());
    }

    let representative = merge_set.merged[0];
    let (intrinsic, rep_args) = call_info(func, representative);
    let result_ty = func
        .dfg
        .inst_results(representative)
        .first()
        .map(|&v| func.dfg.value_type(v));
    let arg_tys: SmallVec<[Type; 4]> = rep_args.iter().map(|&a| func.dfg.value_type(a)).collect();

    let cab = func.create_block();
    func.layout.append_block(cab);
    let path_param = func.dfg.append_block_param(cab, Type::I32);
    let arg_params: SmallVec<[Value; 4]> = arg_tys
        .iter()
        .map(|&ty| func.dfg.append_block_param(cab, ty))
        .collect();

    let shared_inst = func.dfg.make_inst(InstructionData::NanotubeCall {
        intrinsic,
        args: arg_params,
    });
    func.layout.append_inst(shared_inst, cab);
    let shared_result = result_ty.map(|ty| func.dfg.append_result(shared_inst, ty));

    let mut cases = Vec::with_capacity(merge_set.frontier.len());
    let mut default_target = None;

    for (path_id, &access) in merge_set.frontier.iter().enumerate() {
        let origin = func
            .layout
            .inst_block(access)
            .expect("frontier access must be inserted");
        let is_merged = merge_set.merged.contains(&access);
        let real_args = if is_merged {
            Some(call_info(func, access).1)
        } else {
            None
        };
        let old_result = func.dfg.inst_results(access).first().copied();

        let landing = func.create_block();
        func.layout.split_block(origin, access, landing);

        if is_merged {
            if let (Some(old_result), Some(new_result)) = (old_result, shared_result) {
                func.dfg.replace_uses(old_result, new_result);
            }
            func.layout.remove_inst(access);
        }

        let mut jump_args: SmallVec<[Value; 4]> = SmallVec::new();
        jump_args.push(make_const(func, origin, path_id as i64, Type::I32));
        match real_args {
            Some(args) => jump_args.extend(args),
            None => {
                for &ty in &arg_tys {
                    jump_args.push(make_const(func, origin, 0, ty));
                }
            }
        }
        let jump = func.dfg.make_inst(InstructionData::Jump {
            destination: BlockCall::new(cab, jump_args),
        });
        func.layout.append_inst(jump, origin);

        let case_target = BlockCall::new(landing, SmallVec::new());
        if path_id == 0 {
            default_target = Some(case_target.clone());
        }
        cases.push(SwitchCase {
            value: path_id as i64,
            block: case_target,
        });
    }

    let switch = func.dfg.make_inst(InstructionData::Switch {
        scrutinee: path_param,
        cases,
        default: default_target.expect("frontier is non-empty"),
    });
    func.layout.append_inst(switch, cab);

    Ok(())
}

/// Merges multiple `return` blocks into one (§4.2.6): Mem-to-Req and
/// Liveness both want a single well-defined exit to walk back from.
fn unify_exits(func: &mut Function) {
    let returns: Vec<Inst> = func
        .layout
        .blocks()
        .flat_map(|b| func.layout.block_insts(b))
        .filter(|&i| matches!(func.dfg.inst_data(i), InstructionData::Return { .. }))
        .collect();
    if returns.len() <= 1 {
        return;
    }

    let arg_tys: SmallVec<[Type; 2]> = match func.dfg.inst_data(returns[0]) {
        InstructionData::Return { args } => args.iter().map(|&a| func.dfg.value_type(a)).collect(),
        _ => unreachable!(),
    };

    let exit = func.create_block();
    func.layout.append_block(exit);
    let exit_params: SmallVec<[Value; 2]> = arg_tys
        .iter()
        .map(|&ty| func.dfg.append_block_param(exit, ty))
        .collect();
    let exit_return = func.dfg.make_inst(InstructionData::Return {
        args: exit_params,
    });
    func.layout.append_inst(exit_return, exit);

    for ret in returns {
        let block = func.layout.inst_block(ret).expect("return must be inserted");
        let args = match func.dfg.inst_data(ret) {
            InstructionData::Return { args } => args.clone(),
            _ => unreachable!(),
        };
        func.layout.remove_inst(ret);
        let jump = func.dfg.make_inst(InstructionData::Jump {
            destination: BlockCall::new(exit, args),
        });
        func.layout.append_inst(jump, block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::function::Signature;

    fn packet_read_kernel() -> Function {
        let mut func = Function::new("converge_test", Signature::default());
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
            then_block: BlockCall::new(left, SmallVec::new()),
            else_block: BlockCall::new(right, SmallVec::new()),
        });
        func.layout.append_inst(branch, entry);

        for block in [left, right] {
            let call = func.dfg.make_inst(InstructionData::NanotubeCall {
                intrinsic: Intrinsic::PacketRead,
                args: SmallVec::new(),
            });
            func.layout.append_inst(call, block);
            func.dfg.append_result(call, Type::I32);
            let jump = func.dfg.make_inst(InstructionData::Jump {
                destination: BlockCall::new(join, SmallVec::new()),
            });
            func.layout.append_inst(jump, block);
        }

        let ret = func.dfg.make_inst(InstructionData::Return {
            args: SmallVec::new(),
        });
        func.layout.append_inst(ret, join);
        func
    }

    #[test]
    fn merges_compatible_packet_reads_into_one_cab() {
        let mut func = packet_read_kernel();
        let config = PipelineConfig::default();
        run(&mut func, &config).expect("converge succeeds on a mergeable diamond");

        let calls: Vec<Inst> = func
            .layout
            .blocks()
            .flat_map(|b| func.layout.block_insts(b))
            .filter(|&i| matches!(func.dfg.inst_data(i), InstructionData::NanotubeCall { .. }))
            .collect();
        assert_eq!(calls.len(), 1, "both packet reads should converge into one call");
    }

    #[test]
    fn no_accesses_is_a_no_op() {
        let mut func = Function::new("empty", Signature::default());
        let entry = func.create_block();
        func.layout.append_block(entry);
        let ret = func.dfg.make_inst(InstructionData::Return {
            args: SmallVec::new(),
        });
        func.layout.append_inst(ret, entry);
        let config = PipelineConfig::default();
        run(&mut func, &config).expect("no-access function converges trivially");
        assert_eq!(func.layout.blocks().count(), 1);
    }
}
