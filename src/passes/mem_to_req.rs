//! Mem-to-Req (§4.3): rewrites loads, stores, and raw pointer arithmetic
//! whose address derives from a packet or map origin into explicit
//! Nanotube API calls against a scratch stack buffer, so later passes
//! never have to reason about a bare pointer into hardware-backed memory.
//!
//! Grounded on `original_source/back_end/Mem2req.cpp`'s two-phase shape:
//! Phase A classifies which values carry packet/map pointer-ness forward
//! from `packet_data`/`packet_end`/`map_lookup` roots; Phase B rewrites
//! every classified value and its terminating consumers in dependency
//! order via [`crate::traversal::DepAwareConverter`], exactly as Converge
//! does for its own worklist.
//!
//! This façade's IR has no `gep`/`inttoptr`/`ptrtoint`/`memcpy`
//! instructions (see `ir/instructions.rs`'s `StackAddr` doc comment):
//! pointer arithmetic is plain integer `iadd` over a `Ptr`-typed value,
//! and casts are `bitcast`. Phase A's "propagating" opcode list is
//! narrowed accordingly (`bitcast`, `iadd`, `phi` via block parameters,
//! `select`); the spec's `gep`/`inttoptr`/`ptrtoint` cases collapse into
//! the `iadd`/`bitcast` cases since this IR never splits them out.
//! Ordinary SSA merges are block parameters here rather than an explicit
//! `phi` instruction (the explicit `Phi` variant is reified later, by
//! Liveness/Flatten-CFG) — Phase A/B treat a flow-classified block
//! parameter exactly as the spec treats a `phi`: splitting it into a
//! parallel integer-offset parameter (plus, for map origins, key-pointer
//! and presence parameters), propagated by rewriting every predecessor's
//! jump/branch argument list in lockstep.

use crate::alias::Origin;
use crate::api::Intrinsic;
use crate::config::PipelineConfig;
use crate::diagnostics::{PassError, PassResult};
use crate::ir::entities::{Block, Inst, MapId, Value};
use crate::ir::function::Function;
use crate::ir::instructions::{BlockCall, InstructionData, Opcode};
use crate::ir::types::Type;
use crate::traversal::DepAwareConverter;
use cranelift_entity::EntityRef;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Saturation bound handed to `packet_bounded_length` in place of a raw
/// `packet_end` pointer (§4.3 Phase B "packet_end"). Not load-bearing for
/// correctness of in-bounds kernels, only for how far a runaway offset
/// computation can run before the bounded-length call clamps it.
const PACKET_LENGTH_SATURATION_BOUND: i64 = 0xFFFF;

/// A scratch-buffer size used for an opaque callee's pointer argument
/// when no per-function ABI is known (§4.3 Phase B "calls with
/// packet/map pointer arguments"). This façade carries no interprocedural
/// signature table for user-defined `Call` targets, so a pointer-word
/// sized buffer is used conservatively for both the pre-call read and the
/// post-call write-back.
const UNKNOWN_CALLEE_SCRATCH_SIZE: u32 = 8;

#[derive(Clone, Debug)]
struct MapFact {
    key_ptr: Value,
    key_size: u32,
    /// Result of the dummy presence read (§4.3 Phase B "map_lookup"),
    /// used in place of a null check against the old raw pointer.
    present: Option<Value>,
}

/// What Phase B has materialized for one originally-pointer-valued SSA
/// value: an integer byte offset from its origin, plus map-specific
/// metadata when the origin is a map.
#[derive(Clone, Debug)]
struct PointerFact {
    origin: Origin,
    offset: Value,
    map: Option<MapFact>,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
enum FlowNode {
    Inst(Inst),
    Param(Value),
}

pub fn run(func: &mut Function, config: &PipelineConfig) -> PassResult<()> {
    let origin = classify_origins(func)?;
    if origin.is_empty() {
        return Ok(());
    }
    let rewritten = rewrite(func, &origin, &func.name.clone())?;
    if config.print_analysis_info {
        log::debug!(
            "mem-to-req: rewrote {rewritten} pointer-flow node(s) in `{}`",
            func.name
        );
    }
    Ok(())
}

fn producer_of(func: &Function, v: Value) -> FlowNode {
    match func.dfg.value_def(v) {
        Some(inst) => FlowNode::Inst(inst),
        None => FlowNode::Param(v),
    }
}

/// For every block parameter, the value supplied at that position across
/// every edge that targets its block — `Jump`/`Branch`/`Switch`
/// destinations are all genuine predecessor edges (§3.1).
fn build_incoming_param_map(func: &Function) -> FxHashMap<Value, Vec<Value>> {
    let mut map: FxHashMap<Value, Vec<Value>> = FxHashMap::default();
    for block in func.layout.blocks() {
        for inst in func.layout.block_insts(block) {
            for call in block_calls(func.dfg.inst_data(inst)) {
                let params = func.dfg.block_params(call.block);
                for (&param, &arg) in params.iter().zip(call.args.iter()) {
                    map.entry(param).or_default().push(arg);
                }
            }
        }
    }
    map
}

fn block_calls(data: &InstructionData) -> Vec<&BlockCall> {
    match data {
        InstructionData::Jump { destination } => vec![destination],
        InstructionData::Branch {
            then_block,
            else_block,
            ..
        } => vec![then_block, else_block],
        InstructionData::Switch { cases, default, .. } => {
            let mut v: Vec<&BlockCall> = cases.iter().map(|c| &c.block).collect();
            v.push(default);
            v
        }
        _ => Vec::new(),
    }
}

fn join_all(items: impl IntoIterator<Item = Option<Origin>>) -> Result<Option<Origin>, ()> {
    let mut acc: Option<Origin> = None;
    for item in items {
        acc = match (acc, item) {
            (None, x) => x,
            (x, None) => x,
            (Some(a), Some(b)) if a == b => Some(a),
            _ => return Err(()),
        };
    }
    Ok(acc)
}

fn const_i64(func: &Function, value: Option<Value>) -> Option<i64> {
    let inst = func.dfg.value_def(value?)?;
    match func.dfg.inst_data(inst) {
        InstructionData::IconstI64 { value } => Some(*value),
        InstructionData::IconstU64 { value } => Some(*value as i64),
        _ => None,
    }
}

fn resolve_map_id(func: &Function, value: Option<Value>) -> Option<MapId> {
    const_i64(func, value).map(|v| MapId::new(v as u32 as usize))
}

/// Phase A (§4.3): propagates packet/map origin forward from
/// `packet_data`/`packet_end`/`map_lookup` roots through `bitcast`,
/// `iadd`, block parameters, and `select`, to a fixed point. Bounded to
/// `block_count + 2` rounds, which is exact for this façade's loop-free,
/// Converge-reduced CFGs (every flow value is reachable from a root
/// within one pass per merge point at worst).
fn classify_origins(func: &Function) -> PassResult<FxHashMap<Value, Origin>> {
    let mut origin: FxHashMap<Value, Origin> = FxHashMap::default();

    for block in func.layout.blocks() {
        for inst in func.layout.block_insts(block) {
            let root = match func.dfg.inst_data(inst) {
                InstructionData::NanotubeCall { intrinsic, args } => match intrinsic {
                    Intrinsic::PacketData | Intrinsic::PacketEnd => Some(Origin::Packet),
                    Intrinsic::MapLookup => Some(
                        resolve_map_id(func, args.first().copied())
                            .map(Origin::Map)
                            .unwrap_or(Origin::Unknown),
                    ),
                    _ => None,
                },
                _ => None,
            };
            if let Some(root) = root {
                if let Some(&result) = func.dfg.inst_results(inst).first() {
                    origin.insert(result, root);
                }
            }
        }
    }

    let incoming_params = build_incoming_param_map(func);
    let rounds = func.layout.blocks().count() as u32 + 2;

    for _ in 0..rounds {
        let mut changed = false;

        for block in func.layout.blocks() {
            for inst in func.layout.block_insts(block) {
                let Some(&result) = func.dfg.inst_results(inst).first() else {
                    continue;
                };
                if origin.contains_key(&result) {
                    continue;
                }
                let derived = match func.dfg.inst_data(inst) {
                    InstructionData::Unary {
                        opcode: Opcode::Bitcast,
                        arg,
                        ..
                    } => origin.get(arg).copied(),
                    InstructionData::Binary {
                        opcode: Opcode::Iadd,
                        args,
                    } => match (origin.get(&args[0]).copied(), origin.get(&args[1]).copied()) {
                        (Some(o), None) | (None, Some(o)) => Some(o),
                        (Some(a), Some(b)) if a == b => Some(a),
                        (Some(_), Some(_)) => {
                            return Err(PassError::MixedMapAndPacketOrigin {
                                function: func.name.clone(),
                                detail: format!("{inst}"),
                            })
                        }
                        (None, None) => None,
                    },
                    InstructionData::Select {
                        then_value,
                        else_value,
                        ..
                    } => join_all([origin.get(then_value).copied(), origin.get(else_value).copied()]).map_err(
                        |()| PassError::MixedMapAndPacketOrigin {
                            function: func.name.clone(),
                            detail: format!("{inst}"),
                        },
                    )?,
                    InstructionData::Phi { incoming } => {
                        join_all(incoming.iter().map(|(_, v)| origin.get(v).copied())).map_err(|()| {
                            PassError::MixedMapAndPacketOrigin {
                                function: func.name.clone(),
                                detail: format!("{inst}"),
                            }
                        })?
                    }
                    _ => None,
                };
                if let Some(o) = derived {
                    origin.insert(result, o);
                    changed = true;
                }
            }
        }

        for block in func.layout.blocks() {
            for &param in func.dfg.block_params(block) {
                if origin.contains_key(&param) {
                    continue;
                }
                let Some(incoming) = incoming_params.get(&param) else {
                    continue;
                };
                let joined = join_all(incoming.iter().map(|v| origin.get(v).copied())).map_err(|()| {
                    PassError::MixedMapAndPacketOrigin {
                        function: func.name.clone(),
                        detail: format!("block parameter {param}"),
                    }
                })?;
                if let Some(o) = joined {
                    origin.insert(param, o);
                    changed = true;
                }
            }
        }

        if !changed {
            break;
        }
    }

    Ok(origin)
}

fn distinct_deps(
    func: &Function,
    node: FlowNode,
    to_process: &FxHashSet<FlowNode>,
    incoming_params: &FxHashMap<Value, Vec<Value>>,
) -> Vec<FlowNode> {
    let operands: Vec<Value> = match node {
        FlowNode::Inst(i) => func.dfg.inst_data(i).arguments().into_vec(),
        FlowNode::Param(v) => incoming_params.get(&v).cloned().unwrap_or_default(),
    };
    let mut seen = FxHashSet::default();
    let mut out = Vec::new();
    for v in operands {
        let p = producer_of(func, v);
        if to_process.contains(&p) && seen.insert(p) {
            out.push(p);
        }
    }
    out
}

fn unrooted_err(function_name: &str, inst: Inst) -> PassError {
    PassError::UnrootedMemoryAccess {
        function: function_name.to_string(),
        detail: format!("{inst}"),
    }
}

fn make_const_before(func: &mut Function, before: Inst, value: i64, ty: Type) -> Value {
    let inst = func.dfg.make_inst(InstructionData::IconstI64 { value });
    func.layout.insert_inst_before(inst, before);
    func.dfg.append_result(inst, ty)
}

fn combine_offset(func: &mut Function, before: Inst, base: Value, delta: i64) -> Value {
    if delta == 0 {
        return base;
    }
    let delta_val = make_const_before(func, before, delta, Type::I64);
    let inst = func.dfg.make_inst(InstructionData::Binary {
        opcode: Opcode::Iadd,
        args: [base, delta_val],
    });
    func.layout.insert_inst_before(inst, before);
    func.dfg.append_result(inst, Type::I64)
}

fn insert_after(func: &mut Function, after: Inst, new_inst: Inst) {
    match func.layout.next_inst(after) {
        Some(next) => func.layout.insert_inst_before(new_inst, next),
        None => {
            let block = func.layout.inst_block(after).expect("after must be inserted");
            func.layout.append_inst(new_inst, block);
        }
    }
}

/// Rewrites a `packet_data`/`packet_end`/`map_lookup` root call into its
/// Phase B replacement (§4.3 Phase B), reusing the call's own `Inst` id
/// and pre-existing result `Value` so every not-yet-processed consumer's
/// reference stays valid.
fn rewrite_root_call(func: &mut Function, inst: Inst, facts: &mut FxHashMap<Value, PointerFact>, function_name: &str) -> PassResult<()> {
    let (intrinsic, args) = match func.dfg.inst_data(inst).clone() {
        InstructionData::NanotubeCall { intrinsic, args } => (intrinsic, args),
        other => unreachable!("rewrite_root_call called on {other:?}"),
    };
    let result = func.dfg.inst_results(inst).first().copied();

    match intrinsic {
        Intrinsic::PacketData => {
            func.dfg.replace_inst(inst, InstructionData::IconstI64 { value: 0 });
            if let Some(r) = result {
                facts.insert(r, PointerFact { origin: Origin::Packet, offset: r, map: None });
            }
        }
        Intrinsic::PacketEnd => {
            let bound = make_const_before(func, inst, PACKET_LENGTH_SATURATION_BOUND, Type::I64);
            func.dfg.replace_inst(
                inst,
                InstructionData::NanotubeCall {
                    intrinsic: Intrinsic::PacketBoundedLength,
                    args: smallvec::smallvec![bound],
                },
            );
            if let Some(r) = result {
                facts.insert(r, PointerFact { origin: Origin::Packet, offset: r, map: None });
            }
        }
        Intrinsic::MapLookup => {
            let map_id = resolve_map_id(func, args.first().copied()).ok_or_else(|| unrooted_err(function_name, inst))?;
            let key_ptr = *args.get(1).ok_or_else(|| unrooted_err(function_name, inst))?;
            let key_size = const_i64(func, args.get(2).copied())
                .map(|v| v as u32)
                .ok_or_else(|| PassError::IrreducibleAddressComputation {
                    function: function_name.to_string(),
                    detail: format!("{inst}"),
                })?;

            // Copy the key into a fresh, locally-owned stack buffer
            // (§4.3 Phase B "copy the key into a fresh stack buffer"): a
            // byte-at-a-time copy since `key_size` is a compile-time
            // constant and this façade has no memcpy instruction.
            let key_slot = func.create_stack_slot(key_size, 0);
            let key_buf_inst = func.dfg.make_inst(InstructionData::StackAddr { slot: key_slot, offset: 0 });
            func.layout.insert_inst_before(key_buf_inst, inst);
            let key_buf = func.dfg.append_result(key_buf_inst, Type::Ptr);
            for i in 0..key_size {
                let load_inst = func.dfg.make_inst(InstructionData::Load { ptr: key_ptr, offset: i as i32, ty: Type::I8 });
                func.layout.insert_inst_before(load_inst, inst);
                let byte = func.dfg.append_result(load_inst, Type::I8);
                let store_inst = func.dfg.make_inst(InstructionData::Store { ptr: key_buf, offset: i as i32, value: byte });
                func.layout.insert_inst_before(store_inst, inst);
            }

            let handle = make_const_before(func, inst, map_id.index() as i64, Type::I64);
            let dummy_slot = func.create_stack_slot(1, 0);
            let dummy_buf_inst = func.dfg.make_inst(InstructionData::StackAddr { slot: dummy_slot, offset: 0 });
            func.layout.insert_inst_before(dummy_buf_inst, inst);
            let dummy_buf = func.dfg.append_result(dummy_buf_inst, Type::Ptr);
            let one = make_const_before(func, inst, 1, Type::I64);
            let key_size_const = make_const_before(func, inst, key_size as i64, Type::I64);

            func.dfg.replace_inst(
                inst,
                InstructionData::NanotubeCall {
                    intrinsic: Intrinsic::MapRead,
                    args: smallvec::smallvec![handle, dummy_buf, one, key_buf, key_size_const],
                },
            );
            let present = result.unwrap_or_else(|| func.dfg.append_result(inst, Type::I32));
            let offset = make_const_before(func, inst, 0, Type::I64);
            facts.insert(
                present,
                PointerFact {
                    origin: Origin::Map(map_id),
                    offset,
                    map: Some(MapFact { key_ptr: key_buf, key_size, present: Some(present) }),
                },
            );
        }
        other => unreachable!("rewrite_root_call called on non-root intrinsic {other:?}"),
    }
    Ok(())
}

fn rewrite_iadd(func: &mut Function, inst: Inst, args: [Value; 2], facts: &mut FxHashMap<Value, PointerFact>, function_name: &str) -> PassResult<()> {
    let fact_a = facts.get(&args[0]).cloned();
    let fact_b = facts.get(&args[1]).cloned();
    let (fact, delta) = match (fact_a, fact_b) {
        (Some(_), Some(_)) => {
            return Err(PassError::IrreducibleAddressComputation {
                function: function_name.to_string(),
                detail: format!("{inst}: pointer plus pointer"),
            })
        }
        (Some(f), None) => (f, args[1]),
        (None, Some(f)) => (f, args[0]),
        (None, None) => return Err(unrooted_err(function_name, inst)),
    };
    func.dfg.replace_inst(
        inst,
        InstructionData::Binary { opcode: Opcode::Iadd, args: [fact.offset, delta] },
    );
    if let Some(&result) = func.dfg.inst_results(inst).first() {
        facts.insert(result, PointerFact { origin: fact.origin, offset: result, map: fact.map });
    }
    Ok(())
}

fn rewrite_terminating_binary(func: &mut Function, inst: Inst, facts: &FxHashMap<Value, PointerFact>, function_name: &str) -> PassResult<()> {
    let (opcode, args) = match func.dfg.inst_data(inst) {
        InstructionData::Binary { opcode, args } => (*opcode, *args),
        other => unreachable!("rewrite_terminating_binary called on {other:?}"),
    };
    let use_presence = opcode.is_compare();
    let field = |fact: &PointerFact| -> Value {
        if use_presence {
            if let (Origin::Map(_), Some(map)) = (fact.origin, &fact.map) {
                if let Some(p) = map.present {
                    return p;
                }
            }
        }
        fact.offset
    };
    let fact_a = facts.get(&args[0]);
    let fact_b = facts.get(&args[1]);
    if let (Some(a), Some(b)) = (fact_a, fact_b) {
        if a.origin != b.origin {
            return Err(PassError::MixedMapAndPacketOrigin {
                function: function_name.to_string(),
                detail: format!("{inst}"),
            });
        }
    }
    if fact_a.is_none() && fact_b.is_none() {
        return Err(unrooted_err(function_name, inst));
    }
    let new_a = fact_a.map(field).unwrap_or(args[0]);
    let new_b = fact_b.map(field).unwrap_or(args[1]);
    func.dfg.replace_inst(inst, InstructionData::Binary { opcode, args: [new_a, new_b] });
    Ok(())
}

fn rewrite_select(
    func: &mut Function,
    inst: Inst,
    condition: Value,
    then_value: Value,
    else_value: Value,
    facts: &mut FxHashMap<Value, PointerFact>,
    function_name: &str,
) -> PassResult<()> {
    let (ft, fe) = match (facts.get(&then_value).cloned(), facts.get(&else_value).cloned()) {
        (Some(t), Some(e)) => (t, e),
        _ => return Err(unrooted_err(function_name, inst)),
    };
    if ft.origin != fe.origin {
        return Err(PassError::MixedMapAndPacketOrigin {
            function: function_name.to_string(),
            detail: format!("{inst}"),
        });
    }

    func.dfg.replace_inst(
        inst,
        InstructionData::Select { condition, then_value: ft.offset, else_value: fe.offset },
    );
    let result = func.dfg.inst_results(inst).first().copied();

    let map = match ft.origin {
        Origin::Map(_) => {
            let kt = ft.map.as_ref().expect("map origin carries map fields");
            let ke = fe.map.as_ref().expect("map origin carries map fields");
            let key_ptr = if kt.key_ptr == ke.key_ptr {
                kt.key_ptr
            } else {
                let sel = func.dfg.make_inst(InstructionData::Select { condition, then_value: kt.key_ptr, else_value: ke.key_ptr });
                func.layout.insert_inst_before(sel, inst);
                func.dfg.append_result(sel, Type::Ptr)
            };
            let present = match (kt.present, ke.present) {
                (Some(pt), Some(pe)) if pt == pe => Some(pt),
                (Some(pt), Some(pe)) => {
                    let sel = func.dfg.make_inst(InstructionData::Select { condition, then_value: pt, else_value: pe });
                    func.layout.insert_inst_before(sel, inst);
                    Some(func.dfg.append_result(sel, Type::I32))
                }
                _ => None,
            };
            Some(MapFact { key_ptr, key_size: kt.key_size, present })
        }
        _ => None,
    };

    if let Some(r) = result {
        facts.insert(r, PointerFact { origin: ft.origin, offset: r, map });
    }
    Ok(())
}

fn emit_read(func: &mut Function, before: Inst, fact: &PointerFact, buf: Value, size: u32, function_name: &str, inst_for_err: Inst) -> PassResult<InstructionData> {
    Ok(match fact.origin {
        Origin::Packet => InstructionData::NanotubeCall {
            intrinsic: Intrinsic::PacketRead,
            args: smallvec::smallvec![fact.offset, buf, make_const_before(func, before, size as i64, Type::I64)],
        },
        Origin::Map(map_id) => {
            let map = fact.map.as_ref().expect("map origin carries map fields");
            let handle = make_const_before(func, before, map_id.index() as i64, Type::I64);
            let len = make_const_before(func, before, size as i64, Type::I64);
            let key_size = make_const_before(func, before, map.key_size as i64, Type::I64);
            InstructionData::NanotubeCall {
                intrinsic: Intrinsic::MapRead,
                args: smallvec::smallvec![handle, buf, len, map.key_ptr, key_size],
            }
        }
        Origin::Stack(_) | Origin::Unknown => return Err(unrooted_err(function_name, inst_for_err)),
    })
}

fn emit_write(func: &mut Function, before: Inst, fact: &PointerFact, buf: Value, size: u32, function_name: &str, inst_for_err: Inst) -> PassResult<InstructionData> {
    Ok(match fact.origin {
        Origin::Packet => InstructionData::NanotubeCall {
            intrinsic: Intrinsic::PacketWrite,
            args: smallvec::smallvec![fact.offset, buf, make_const_before(func, before, size as i64, Type::I64)],
        },
        Origin::Map(map_id) => {
            let map = fact.map.as_ref().expect("map origin carries map fields");
            let handle = make_const_before(func, before, map_id.index() as i64, Type::I64);
            let len = make_const_before(func, before, size as i64, Type::I64);
            let key_size = make_const_before(func, before, map.key_size as i64, Type::I64);
            InstructionData::NanotubeCall {
                intrinsic: Intrinsic::MapWrite,
                args: smallvec::smallvec![handle, buf, len, map.key_ptr, key_size],
            }
        }
        Origin::Stack(_) | Origin::Unknown => return Err(unrooted_err(function_name, inst_for_err)),
    })
}

fn rewrite_load(func: &mut Function, inst: Inst, facts: &FxHashMap<Value, PointerFact>, function_name: &str) -> PassResult<()> {
    let (ptr, offset, ty) = match func.dfg.inst_data(inst).clone() {
        InstructionData::Load { ptr, offset, ty } => (ptr, offset, ty),
        other => unreachable!("rewrite_load called on {other:?}"),
    };
    let fact = facts.get(&ptr).cloned().ok_or_else(|| unrooted_err(function_name, inst))?;
    let size = ty.bytes();

    let slot = func.create_stack_slot(size, 0);
    let buf_inst = func.dfg.make_inst(InstructionData::StackAddr { slot, offset: 0 });
    func.layout.insert_inst_before(buf_inst, inst);
    let buf = func.dfg.append_result(buf_inst, Type::Ptr);

    let combined = combine_offset(func, inst, fact.offset, offset as i64);
    let mut combined_fact = fact.clone();
    combined_fact.offset = combined;

    let call_data = emit_read(func, inst, &combined_fact, buf, size, function_name, inst)?;
    let call_inst = func.dfg.make_inst(call_data);
    func.layout.insert_inst_before(call_inst, inst);

    func.dfg.replace_inst(inst, InstructionData::Load { ptr: buf, offset: 0, ty });
    Ok(())
}

fn rewrite_store(func: &mut Function, inst: Inst, facts: &FxHashMap<Value, PointerFact>, function_name: &str) -> PassResult<()> {
    let (ptr, offset, value) = match func.dfg.inst_data(inst).clone() {
        InstructionData::Store { ptr, offset, value } => (ptr, offset, value),
        other => unreachable!("rewrite_store called on {other:?}"),
    };
    let fact = facts.get(&ptr).cloned().ok_or_else(|| unrooted_err(function_name, inst))?;
    let ty = func.dfg.value_type(value);
    let size = ty.bytes();

    let slot = func.create_stack_slot(size, 0);
    let buf_inst = func.dfg.make_inst(InstructionData::StackAddr { slot, offset: 0 });
    func.layout.insert_inst_before(buf_inst, inst);
    let buf = func.dfg.append_result(buf_inst, Type::Ptr);

    let write_buf_inst = func.dfg.make_inst(InstructionData::Store { ptr: buf, offset: 0, value });
    func.layout.insert_inst_before(write_buf_inst, inst);

    let combined = combine_offset(func, inst, fact.offset, offset as i64);
    let mut combined_fact = fact.clone();
    combined_fact.offset = combined;

    let call_data = emit_write(func, inst, &combined_fact, buf, size, function_name, inst)?;
    func.dfg.replace_inst(inst, call_data);
    Ok(())
}

/// §4.3 Phase B "calls with packet/map pointer arguments": every argument
/// carrying a materialized fact is swapped for a scratch buffer, read
/// before the call and conservatively written back after, since this
/// façade has no per-callee ABI classifying which arguments the callee
/// only reads versus also writes.
fn rewrite_generic_call_args(func: &mut Function, inst: Inst, facts: &FxHashMap<Value, PointerFact>, function_name: &str) -> PassResult<()> {
    let mut data = func.dfg.inst_data(inst).clone();
    let args: Vec<Value> = match &data {
        InstructionData::Call { args, .. } => args.to_vec(),
        InstructionData::NanotubeCall { args, .. } => args.to_vec(),
        other => unreachable!("rewrite_generic_call_args called on {other:?}"),
    };

    let mut writebacks = Vec::new();
    let mut replacements = Vec::new();
    for arg in args {
        let Some(fact) = facts.get(&arg).cloned() else { continue };
        let slot = func.create_stack_slot(UNKNOWN_CALLEE_SCRATCH_SIZE, 0);
        let buf_inst = func.dfg.make_inst(InstructionData::StackAddr { slot, offset: 0 });
        func.layout.insert_inst_before(buf_inst, inst);
        let buf = func.dfg.append_result(buf_inst, Type::Ptr);

        let read_data = emit_read(func, inst, &fact, buf, UNKNOWN_CALLEE_SCRATCH_SIZE, function_name, inst)?;
        let read_inst = func.dfg.make_inst(read_data);
        func.layout.insert_inst_before(read_inst, inst);

        let write_data = emit_write(func, inst, &fact, buf, UNKNOWN_CALLEE_SCRATCH_SIZE, function_name, inst)?;
        writebacks.push(write_data);
        replacements.push((arg, buf));
    }

    match &mut data {
        InstructionData::Call { args, .. } | InstructionData::NanotubeCall { args, .. } => {
            for (from, to) in &replacements {
                for a in args.iter_mut() {
                    if a == from {
                        *a = *to;
                    }
                }
            }
        }
        _ => unreachable!(),
    }
    func.dfg.replace_inst(inst, data);

    for write_data in writebacks {
        let write_inst = func.dfg.make_inst(write_data);
        insert_after(func, inst, write_inst);
    }
    Ok(())
}

/// Splits a flow-classified block parameter into a parallel offset (and,
/// for map origins, key-pointer/presence) parameter, and patches every
/// predecessor edge targeting this block to carry the matching fact
/// field at the new position (§4.3 Phase B "phi").
fn rewrite_param(
    func: &mut Function,
    param: Value,
    param_origin: Origin,
    incoming_params: &FxHashMap<Value, Vec<Value>>,
    facts: &mut FxHashMap<Value, PointerFact>,
    function_name: &str,
) -> PassResult<()> {
    let (block, idx) = func.dfg.value_is_param(param).expect("FlowNode::Param must be a block param");
    let idx = idx as usize;

    let incoming = incoming_params.get(&param).cloned().unwrap_or_default();
    let key_size = incoming
        .iter()
        .find_map(|v| facts.get(v).and_then(|f| f.map.as_ref()).map(|m| m.key_size))
        .unwrap_or(0);

    let offset_param = func.dfg.append_block_param(block, Type::I64);
    let map_params = match param_origin {
        Origin::Map(_) => {
            let key_ptr_param = func.dfg.append_block_param(block, Type::Ptr);
            let present_param = func.dfg.append_block_param(block, Type::I32);
            Some((key_ptr_param, present_param))
        }
        _ => None,
    };

    let all_blocks: Vec<Block> = func.layout.blocks().collect();
    for term_block in all_blocks {
        let insts: Vec<Inst> = func.layout.block_insts(term_block).collect();
        for term_inst in insts {
            patch_terminator_for_param(func, term_inst, block, idx, facts, function_name)?;
        }
    }

    facts.insert(
        param,
        PointerFact {
            origin: param_origin,
            offset: offset_param,
            map: map_params.map(|(key_ptr, present)| MapFact { key_ptr, key_size, present: Some(present) }),
        },
    );
    Ok(())
}

fn patch_terminator_for_param(
    func: &mut Function,
    term_inst: Inst,
    target_block: Block,
    idx: usize,
    facts: &FxHashMap<Value, PointerFact>,
    function_name: &str,
) -> PassResult<()> {
    let mut to_append: Vec<SmallVec<[Value; 2]>> = Vec::new();
    let call_count = block_calls(func.dfg.inst_data(term_inst))
        .iter()
        .filter(|c| c.block == target_block)
        .count();
    if call_count == 0 {
        return Ok(());
    }

    for call in block_calls(func.dfg.inst_data(term_inst)) {
        if call.block != target_block {
            continue;
        }
        let original_arg = call.args[idx];
        let fact = facts.get(&original_arg).cloned().ok_or_else(|| unrooted_err(function_name, term_inst))?;
        let mut extra: SmallVec<[Value; 2]> = smallvec::smallvec![fact.offset];
        if let Some(map) = &fact.map {
            extra.push(map.key_ptr);
            extra.push(map.present.unwrap_or(fact.offset));
        }
        to_append.push(extra);
    }

    let data = func.dfg.inst_data_mut(term_inst);
    let mut calls_mut: Vec<&mut BlockCall> = match data {
        InstructionData::Jump { destination } => vec![destination],
        InstructionData::Branch { then_block, else_block, .. } => vec![then_block, else_block],
        InstructionData::Switch { cases, default, .. } => {
            let mut v: Vec<&mut BlockCall> = cases.iter_mut().map(|c| &mut c.block).collect();
            v.push(default);
            v
        }
        _ => Vec::new(),
    };
    let mut i = 0;
    for call in calls_mut.iter_mut() {
        if call.block != target_block {
            continue;
        }
        call.args.extend(to_append[i].iter().copied());
        i += 1;
    }
    Ok(())
}

fn rewrite_node(
    func: &mut Function,
    node: FlowNode,
    origin: &FxHashMap<Value, Origin>,
    facts: &mut FxHashMap<Value, PointerFact>,
    incoming_params: &FxHashMap<Value, Vec<Value>>,
    function_name: &str,
) -> PassResult<()> {
    match node {
        FlowNode::Param(v) => {
            let o = origin[&v];
            rewrite_param(func, v, o, incoming_params, facts, function_name)
        }
        FlowNode::Inst(inst) => {
            let data = func.dfg.inst_data(inst).clone();
            match data {
                InstructionData::NanotubeCall { intrinsic, .. }
                    if matches!(intrinsic, Intrinsic::PacketData | Intrinsic::PacketEnd | Intrinsic::MapLookup) =>
                {
                    rewrite_root_call(func, inst, facts, function_name)
                }
                InstructionData::Unary { opcode: Opcode::Bitcast, arg, .. } => {
                    let fact = facts.get(&arg).cloned().ok_or_else(|| unrooted_err(function_name, inst))?;
                    if let Some(&result) = func.dfg.inst_results(inst).first() {
                        facts.insert(result, PointerFact { origin: fact.origin, offset: fact.offset, map: fact.map });
                    }
                    Ok(())
                }
                InstructionData::Binary { opcode: Opcode::Iadd, args } => rewrite_iadd(func, inst, args, facts, function_name),
                InstructionData::Binary { opcode, .. } if opcode.is_compare() || opcode == Opcode::Isub => {
                    rewrite_terminating_binary(func, inst, facts, function_name)
                }
                InstructionData::Select { condition, then_value, else_value } => {
                    rewrite_select(func, inst, condition, then_value, else_value, facts, function_name)
                }
                InstructionData::Phi { .. } => Err(PassError::IrreducibleAddressComputation {
                    function: function_name.to_string(),
                    detail: format!("{inst}: explicit phi encountered before CFG flattening"),
                }),
                InstructionData::Load { .. } => rewrite_load(func, inst, facts, function_name),
                InstructionData::Store { .. } => rewrite_store(func, inst, facts, function_name),
                InstructionData::Call { .. } | InstructionData::NanotubeCall { .. } => {
                    rewrite_generic_call_args(func, inst, facts, function_name)
                }
                _ => Ok(()),
            }
        }
    }
}

fn rewrite(func: &mut Function, origin: &FxHashMap<Value, Origin>, function_name: &str) -> PassResult<usize> {
    let incoming_params = build_incoming_param_map(func);

    let mut to_process: FxHashSet<FlowNode> = FxHashSet::default();
    for &v in origin.keys() {
        to_process.insert(producer_of(func, v));
    }
    for block in func.layout.blocks() {
        for inst in func.layout.block_insts(block) {
            let data = func.dfg.inst_data(inst);
            if to_process.contains(&FlowNode::Inst(inst)) {
                continue;
            }
            let args = data.arguments();
            if !args.iter().any(|a| origin.contains_key(a)) {
                continue;
            }
            let is_terminating_consumer = match data {
                InstructionData::Binary { opcode, .. } => opcode.is_compare() || *opcode == Opcode::Isub,
                InstructionData::Load { .. } | InstructionData::Store { .. } => true,
                InstructionData::Call { .. } => true,
                InstructionData::NanotubeCall { intrinsic, .. } => !matches!(
                    intrinsic,
                    Intrinsic::PacketData | Intrinsic::PacketEnd | Intrinsic::MapLookup
                ),
                _ => false,
            };
            if is_terminating_consumer {
                to_process.insert(FlowNode::Inst(inst));
            }
        }
    }

    let deps_of: FxHashMap<FlowNode, Vec<FlowNode>> = to_process
        .iter()
        .map(|&n| (n, distinct_deps(func, n, &to_process, &incoming_params)))
        .collect();
    let mut users: FxHashMap<FlowNode, Vec<FlowNode>> = FxHashMap::default();
    for (&node, deps) in &deps_of {
        for &d in deps {
            users.entry(d).or_default().push(node);
        }
    }

    let mut conv: DepAwareConverter<FlowNode> = DepAwareConverter::new();
    for (&node, deps) in &deps_of {
        conv.insert(node, deps.len() as u32);
    }

    let mut facts: FxHashMap<Value, PointerFact> = FxHashMap::default();
    let mut err: Option<PassError> = None;
    let mut processed = 0usize;
    conv.execute(|conv, node| {
        if err.is_some() {
            return;
        }
        match rewrite_node(func, node, origin, &mut facts, &incoming_params, function_name) {
            Ok(()) => {
                processed += 1;
                if let Some(us) = users.get(&node) {
                    for &u in us {
                        conv.mark_dep_ready(&u);
                    }
                }
            }
            Err(e) => err = Some(e),
        }
    });
    if let Some(e) = err {
        return Err(e);
    }
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::function::Signature;
    use crate::ir::instructions::{BlockCall, InstructionData};

    fn packet_load_kernel() -> Function {
        let mut func = Function::new("mem_to_req_test", Signature::default());
        let entry = func.create_block();
        func.layout.append_block(entry);

        let base_call = func.dfg.make_inst(InstructionData::NanotubeCall {
            intrinsic: Intrinsic::PacketData,
            args: SmallVec::new(),
        });
        func.layout.append_inst(base_call, entry);
        let base = func.dfg.append_result(base_call, Type::Ptr);

        let eight = func.dfg.make_inst(InstructionData::IconstI64 { value: 8 });
        func.layout.append_inst(eight, entry);
        let eight_val = func.dfg.append_result(eight, Type::I64);

        let add = func.dfg.make_inst(InstructionData::Binary { opcode: Opcode::Iadd, args: [base, eight_val] });
        func.layout.append_inst(add, entry);
        let ptr = func.dfg.append_result(add, Type::Ptr);

        let load = func.dfg.make_inst(InstructionData::Load { ptr, offset: 0, ty: Type::I32 });
        func.layout.append_inst(load, entry);
        func.dfg.append_result(load, Type::I32);

        let ret = func.dfg.make_inst(InstructionData::Return { args: SmallVec::new() });
        func.layout.append_inst(ret, entry);
        func
    }

    #[test]
    fn rewrites_offset_load_into_packet_read() {
        let mut func = packet_load_kernel();
        let config = PipelineConfig::default();
        run(&mut func, &config).expect("mem-to-req succeeds on a simple offset load");

        let calls: Vec<Intrinsic> = func
            .layout
            .blocks()
            .flat_map(|b| func.layout.block_insts(b))
            .filter_map(|i| match func.dfg.inst_data(i) {
                InstructionData::NanotubeCall { intrinsic, .. } => Some(*intrinsic),
                _ => None,
            })
            .collect();
        assert!(calls.contains(&Intrinsic::PacketRead), "expected a synthesized packet_read, got {calls:?}");
    }

    #[test]
    fn no_pointer_flow_is_a_no_op() {
        let mut func = Function::new("plain", Signature::default());
        let entry = func.create_block();
        func.layout.append_block(entry);
        let ret = func.dfg.make_inst(InstructionData::Return { args: SmallVec::new() });
        func.layout.append_inst(ret, entry);
        let config = PipelineConfig::default();
        run(&mut func, &config).expect("a function with no Nanotube calls is untouched");
    }

    #[test]
    fn mismatched_pointer_add_is_rejected() {
        let mut func = Function::new("bad_add", Signature::default());
        let entry = func.create_block();
        func.layout.append_block(entry);

        let a_call = func.dfg.make_inst(InstructionData::NanotubeCall { intrinsic: Intrinsic::PacketData, args: SmallVec::new() });
        func.layout.append_inst(a_call, entry);
        let a = func.dfg.append_result(a_call, Type::Ptr);
        let b_call = func.dfg.make_inst(InstructionData::NanotubeCall { intrinsic: Intrinsic::PacketData, args: SmallVec::new() });
        func.layout.append_inst(b_call, entry);
        let b = func.dfg.append_result(b_call, Type::Ptr);

        let add = func.dfg.make_inst(InstructionData::Binary { opcode: Opcode::Iadd, args: [a, b] });
        func.layout.append_inst(add, entry);
        func.dfg.append_result(add, Type::Ptr);

        let ret = func.dfg.make_inst(InstructionData::Return { args: SmallVec::new() });
        func.layout.append_inst(ret, entry);

        let config = PipelineConfig::default();
        assert!(run(&mut func, &config).is_err());
    }

    #[allow(dead_code)]
    fn unused_block_call(b: Block) -> BlockCall {
        BlockCall::new(b, SmallVec::new())
    }
}
