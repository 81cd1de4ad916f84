//! The five lowering passes (§4.2–§4.6), run in order: converge,
//! mem-to-req, liveness, flatten-cfg, pipeline.

pub mod converge;
pub mod flatten_cfg;
pub mod liveness;
pub mod mem_to_req;
pub mod pipeline;
