//! The data-flow graph: owns instruction and value storage and answers
//! def/use queries (§3.1, §4.0). Adapted from the teacher's
//! `ir::dfg::DataFlowGraph`, trimmed to the single-result-per-value model
//! the façade's `InstructionData` set needs (no result-tuple value
//! aliasing, since no opcode here produces more than one result except
//! calls, which the façade gives a `Vec<Value>` directly).

use crate::ir::entities::{Block, Inst, Value};
use crate::ir::instructions::InstructionData;
use crate::ir::types::Type;
use cranelift_entity::{PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

/// What a [`Value`] denotes: either a block parameter or an instruction
/// result (§3.1).
#[derive(Clone, Debug, PartialEq, Eq)]
enum ValueData {
    Param { block: Block, ty: Type, num: u32 },
    Result { inst: Inst, ty: Type, num: u32 },
}

#[derive(Default)]
pub struct DataFlowGraph {
    values: PrimaryMap<Value, ValueData>,
    insts: PrimaryMap<Inst, InstructionData>,
    /// Results produced by each instruction, in order.
    results: SecondaryMap<Inst, SmallVec<[Value; 1]>>,
    /// Parameters taken by each block, in order.
    params: SecondaryMap<Block, SmallVec<[Value; 4]>>,
}

impl DataFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_inst(&mut self, data: InstructionData) -> Inst {
        self.insts.push(data)
    }

    pub fn inst_data(&self, inst: Inst) -> &InstructionData {
        &self.insts[inst]
    }

    pub fn inst_data_mut(&mut self, inst: Inst) -> &mut InstructionData {
        &mut self.insts[inst]
    }

    pub fn replace_inst(&mut self, inst: Inst, data: InstructionData) {
        self.insts[inst] = data;
    }

    /// Appends a new result value to `inst` and returns it.
    pub fn append_result(&mut self, inst: Inst, ty: Type) -> Value {
        let num = self.results[inst].len() as u32;
        let value = self.values.push(ValueData::Result { inst, ty, num });
        self.results[inst].push(value);
        value
    }

    pub fn inst_results(&self, inst: Inst) -> &[Value] {
        &self.results[inst]
    }

    pub fn first_result(&self, inst: Inst) -> Value {
        self.results[inst][0]
    }

    pub fn append_block_param(&mut self, block: Block, ty: Type) -> Value {
        let num = self.params[block].len() as u32;
        let value = self.values.push(ValueData::Param { block, ty, num });
        self.params[block].push(value);
        value
    }

    pub fn block_params(&self, block: Block) -> &[Value] {
        &self.params[block]
    }

    pub fn value_type(&self, value: Value) -> Type {
        match &self.values[value] {
            ValueData::Param { ty, .. } => *ty,
            ValueData::Result { ty, .. } => *ty,
        }
    }

    /// The instruction that defines `value`, or `None` if it is a block
    /// parameter (§3.1 def/use).
    pub fn value_def(&self, value: Value) -> Option<Inst> {
        match &self.values[value] {
            ValueData::Result { inst, .. } => Some(*inst),
            ValueData::Param { .. } => None,
        }
    }

    pub fn value_is_param(&self, value: Value) -> Option<(Block, u32)> {
        match &self.values[value] {
            ValueData::Param { block, num, .. } => Some((*block, *num)),
            ValueData::Result { .. } => None,
        }
    }

    /// Replaces every use of `from` with `to` across every instruction.
    /// Callers are responsible for invalidating any liveness/SSA caches
    /// that indexed `from` (mirrors the teacher's `FuncCursor`-driven
    /// RAUW pattern: this is a pure data operation, not a pass).
    pub fn replace_uses(&mut self, from: Value, to: Value) {
        for (_, data) in self.insts.iter_mut() {
            replace_value_in_inst(data, from, to);
        }
    }
}

fn replace_value_in_inst(data: &mut InstructionData, from: Value, to: Value) {
    let mut sub = |v: &mut Value| {
        if *v == from {
            *v = to;
        }
    };
    match data {
        InstructionData::Binary { args, .. } => args.iter_mut().for_each(&mut sub),
        InstructionData::Unary { arg, .. } => sub(arg),
        InstructionData::IconstU64 { .. } | InstructionData::IconstI64 { .. } => {}
        InstructionData::StackAddr { .. } => {}
        InstructionData::Load { ptr, .. } => sub(ptr),
        InstructionData::Store { ptr, value, .. } => {
            sub(ptr);
            sub(value);
        }
        InstructionData::NanotubeCall { args, .. } => args.iter_mut().for_each(&mut sub),
        InstructionData::Call { callee, args } => {
            sub(callee);
            args.iter_mut().for_each(&mut sub);
        }
        InstructionData::Jump { destination } => destination.args.iter_mut().for_each(&mut sub),
        InstructionData::Branch {
            condition,
            then_block,
            else_block,
        } => {
            sub(condition);
            then_block.args.iter_mut().for_each(&mut sub);
            else_block.args.iter_mut().for_each(&mut sub);
        }
        InstructionData::Switch {
            scrutinee,
            cases,
            default,
        } => {
            sub(scrutinee);
            for case in cases {
                case.block.args.iter_mut().for_each(&mut sub);
            }
            default.args.iter_mut().for_each(&mut sub);
        }
        InstructionData::Return { args } => args.iter_mut().for_each(&mut sub),
        InstructionData::Phi { incoming } => {
            for (_, v) in incoming.iter_mut() {
                sub(v);
            }
        }
        InstructionData::Select {
            condition,
            then_value,
            else_value,
        } => {
            sub(condition);
            sub(then_value);
            sub(else_value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_result_assigns_distinct_values() {
        let mut dfg = DataFlowGraph::new();
        let inst = dfg.make_inst(InstructionData::IconstI64 { value: 1 });
        let v0 = dfg.append_result(inst, Type::I64);
        assert_eq!(dfg.inst_results(inst), &[v0]);
        assert_eq!(dfg.value_type(v0), Type::I64);
        assert_eq!(dfg.value_def(v0), Some(inst));
    }

    #[test]
    fn replace_uses_rewrites_all_operands() {
        let mut dfg = DataFlowGraph::new();
        let c0 = dfg.make_inst(InstructionData::IconstI64 { value: 1 });
        let v0 = dfg.append_result(c0, Type::I64);
        let c1 = dfg.make_inst(InstructionData::IconstI64 { value: 2 });
        let v1 = dfg.append_result(c1, Type::I64);
        let add = dfg.make_inst(InstructionData::Binary {
            opcode: crate::ir::instructions::Opcode::Iadd,
            args: [v0, v0],
        });
        dfg.replace_uses(v0, v1);
        match dfg.inst_data(add) {
            InstructionData::Binary { args, .. } => assert_eq!(*args, [v1, v1]),
            _ => panic!("expected Binary"),
        }
    }
}
