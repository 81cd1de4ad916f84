//! The per-stage channel ABI and the wiring descriptors Pipeline emits
//! (§6.3 stage ABI, §4.6.6 stage wiring).
//!
//! Grounded on `original_source/back_end/Pipeline.cpp`'s bookkeeping for
//! per-stage channel ports and thread/context creation: each stage binds
//! a fixed set of ports to a `nanotube_context`, and Pipeline's wiring
//! step produces one `Setup` describing every stage, channel and map
//! needed to stand the split kernel up at runtime.

use crate::bus::BusFormat;
use crate::ir::function::Function;

/// Fixed channel port numbers every stage context binds (§6.3). A stage
/// only uses the ports its shape actually needs (e.g. a stage with no
/// live-in state skips `STATE_IN`).
pub const PACKETS_IN: u32 = 0;
pub const PACKETS_OUT: u32 = 1;
pub const STATE_IN: u32 = 2;
pub const STATE_OUT: u32 = 3;
pub const CWORD_IN: u32 = 4;
pub const CWORD_OUT: u32 = 5;
pub const MAP_REQ: u32 = 6;
pub const MAP_RESP: u32 = 7;

/// Depth (in bus words) given to a packet-word channel between two
/// adjacent stages. Chosen, as in the source, to be deep enough that a
/// downstream stage's occasional stall doesn't immediately back-pressure
/// the whole pipeline; not load-bearing for correctness.
pub const PACKET_CHANNEL_DEPTH: usize = 140;

/// One SPSC channel in the wired-up pipeline (§4.6.6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub kind: ChannelKind,
    /// Width of one element carried on this channel, in bytes.
    pub width: u32,
    pub depth: usize,
    pub producer: StageId,
    pub producer_port: u32,
    pub consumer: StageId,
    pub consumer_port: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Packet,
    State,
    Cword,
}

/// A tap map registration: one per user-declared map, keyed by the
/// client ids of the stages that request and receive through it (§4.6.6
/// "one tap map per user-declared map").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TapMapSpec {
    pub map_id: crate::ir::entities::MapId,
    pub name: String,
    pub clients: Vec<StageId>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u32);

/// A single pipeline stage's wiring-relevant shape: which ports it binds
/// and the byte layout of its live-in/live-out state (§4.6.5).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageSpec {
    pub id: StageId,
    pub name: String,
    /// The function produced by splitting (§4.6.3): one prologue, one
    /// clone of the original application code between split points, one
    /// epilogue.
    pub live_in_state_bytes: u32,
    pub live_out_state_bytes: u32,
    pub has_map_traffic: bool,
    pub emits_cword: bool,
    pub consumes_cword: bool,
}

/// The full wiring plan Pipeline hands off: one entry per stage, channel,
/// and tap map (§4.6.6). Carries the bus format the packet channels are
/// sized against, since a stage's packet-word width depends on it.
#[derive(Clone, Debug)]
pub struct Setup {
    pub bus: BusFormat,
    pub stages: Vec<StageSpec>,
    pub channels: Vec<ChannelSpec>,
    pub tap_maps: Vec<TapMapSpec>,
}

impl Setup {
    pub fn new(bus: BusFormat) -> Self {
        Self {
            bus,
            stages: Vec::new(),
            channels: Vec::new(),
            tap_maps: Vec::new(),
        }
    }

    /// Adds one packet-word channel between two adjacent stages, sized
    /// off the configured bus's word size (§4.6.6: "one SPSC channel per
    /// inter-stage packet link, width equal to the bus word size, depth
    /// approximately 140").
    pub fn add_packet_channel(&mut self, producer: StageId, consumer: StageId) {
        self.channels.push(ChannelSpec {
            name: format!("packets_{}_{}", producer.0, consumer.0),
            kind: ChannelKind::Packet,
            width: self.bus.layout().word_size,
            depth: PACKET_CHANNEL_DEPTH,
            producer,
            producer_port: PACKETS_OUT,
            consumer,
            consumer_port: PACKETS_IN,
        });
    }

    pub fn add_state_channel(&mut self, producer: StageId, consumer: StageId, width: u32) {
        self.channels.push(ChannelSpec {
            name: format!("state_{}_{}", producer.0, consumer.0),
            kind: ChannelKind::State,
            width,
            depth: 2,
            producer,
            producer_port: STATE_OUT,
            consumer,
            consumer_port: STATE_IN,
        });
    }

    pub fn add_cword_channel(&mut self, producer: StageId, consumer: StageId, width: u32) {
        self.channels.push(ChannelSpec {
            name: format!("cword_{}_{}", producer.0, consumer.0),
            kind: ChannelKind::Cword,
            width,
            depth: 2,
            producer,
            producer_port: CWORD_OUT,
            consumer,
            consumer_port: CWORD_IN,
        });
    }
}

/// Per-stage Rust `Function` plus its wiring-relevant metadata, as handed
/// back by `passes::pipeline::split` before the caller lowers each
/// function further.
pub struct SplitStage {
    pub spec: StageSpec,
    pub function: Function,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_channel_uses_bus_word_size() {
        let mut setup = Setup::new(BusFormat::X3rx);
        setup.add_packet_channel(StageId(0), StageId(1));
        assert_eq!(setup.channels[0].width, 4);
        assert_eq!(setup.channels[0].depth, PACKET_CHANNEL_DEPTH);
    }
}
