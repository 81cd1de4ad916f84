//! The in-repo IR façade (§4.0): entities, types, instructions, the
//! data-flow graph, layout, and function container that every pass
//! operates on.

pub mod dfg;
pub mod entities;
pub mod function;
pub mod instructions;
pub mod layout;
pub mod types;
