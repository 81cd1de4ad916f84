//! Bus format description (§6.4): word size, header/sideband sizes, and
//! the per-beat flag table Mem-to-Req and Pipeline need to produce
//! correct SOP/EOP/ULP-metadata manipulation for a given target bus.
//!
//! Grounded on `original_source/back_end/bus_type.hpp` for the
//! size-accessor shape (`get_bus_md_size`/`get_bus_sb_size`/
//! `get_bus_sb_signals_size`/`get_bus_word_size`) and bit-for-bit on
//! `original_source/include/x3rx_bus.hpp` for the `X3rx` layout.

/// A per-beat sideband flag: which byte it lives in and which bit mask
/// selects it (§6.4).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlagBit {
    pub byte_index: u32,
    pub bit_mask: u8,
}

impl FlagBit {
    pub const fn new(byte_index: u32, bit_mask: u8) -> Self {
        Self {
            byte_index,
            bit_mask,
        }
    }
}

/// Per-beat flag offsets and masks needed to manipulate SOP/EOP/ULP
/// metadata for one bus format (§6.4).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SidebandFlags {
    pub data_sop: FlagBit,
    pub data_eop: FlagBit,
    pub meta_sop: FlagBit,
    pub meta_eop: FlagBit,
    /// Byte index and bit width of the field carrying ULP metadata.
    pub ulp_metadata_byte: u32,
    pub ulp_metadata_mask: u8,
}

/// Everything a pass needs to know about one wire bus format (§6.4).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusLayout {
    /// Width of one bus word/beat in bytes.
    pub word_size: u32,
    /// Size of the bus-defined header (e.g. capsule header) prefixed to
    /// each packet, in bytes.
    pub header_size: u32,
    /// Size of the sideband channel (TUSER-equivalent), in bytes.
    pub sideband_size: u32,
    /// Size of the sideband signals (TKEEP/TSTRB/TLAST-equivalent), in
    /// bytes.
    pub sideband_signals_size: u32,
    pub flags: SidebandFlags,
}

/// The runtime-selected bus format (§6.4, §6.5 `bus` option).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BusFormat {
    /// The plain streaming bus: no header, minimal sideband.
    Sb,
    /// The streaming bus with header (capsule-prefixed).
    Shb,
    /// The AXI-Stream-derived x3rx bus, specified bit-for-bit in
    /// `x3rx_bus.hpp`.
    X3rx,
}

impl BusFormat {
    pub fn layout(self) -> BusLayout {
        match self {
            BusFormat::Sb => SB_LAYOUT,
            BusFormat::Shb => SHB_LAYOUT,
            BusFormat::X3rx => X3RX_LAYOUT,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            BusFormat::Sb => "sb",
            BusFormat::Shb => "shb",
            BusFormat::X3rx => "x3rx",
        }
    }
}

impl std::str::FromStr for BusFormat {
    type Err = UnknownBusFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sb" => Ok(BusFormat::Sb),
            "shb" => Ok(BusFormat::Shb),
            "x3rx" => Ok(BusFormat::X3rx),
            other => Err(UnknownBusFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown bus format `{0}`, expected one of sb, shb, x3rx")]
pub struct UnknownBusFormat(String);

/// ULP_NIC_RX_DATA AXI-S is 32 bits wide (4 bytes); TUSER carries 128
/// bits (16 bytes) of sideband; TKEEP/TSTRB/TLAST round up to 3 bytes
/// for a 4-byte data path (`x3rx_bus.hpp`).
const X3RX_LAYOUT: BusLayout = BusLayout {
    word_size: 4,
    header_size: 0,
    sideband_size: 16,
    sideband_signals_size: 3,
    flags: SidebandFlags {
        data_sop: FlagBit::new(0, 1 << 0),
        data_eop: FlagBit::new(0, 1 << 1),
        meta_sop: FlagBit::new(2, 1 << 2),
        meta_eop: FlagBit::new(2, 1 << 3),
        ulp_metadata_byte: 12,
        ulp_metadata_mask: 0xff,
    },
};

/// The plain streaming bus carries no bus-defined header and a
/// single-byte sideband wide enough for SOP/EOP alone.
const SB_LAYOUT: BusLayout = BusLayout {
    word_size: 8,
    header_size: 0,
    sideband_size: 1,
    sideband_signals_size: 1,
    flags: SidebandFlags {
        data_sop: FlagBit::new(0, 1 << 0),
        data_eop: FlagBit::new(0, 1 << 1),
        meta_sop: FlagBit::new(0, 1 << 0),
        meta_eop: FlagBit::new(0, 1 << 1),
        ulp_metadata_byte: 0,
        ulp_metadata_mask: 0,
    },
};

/// The streaming bus with header: same sideband shape as `Sb`, prefixed
/// by a fixed capsule header on every packet.
const SHB_LAYOUT: BusLayout = BusLayout {
    header_size: 8,
    ..SB_LAYOUT
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn x3rx_layout_matches_spec_bit_positions() {
        let layout = BusFormat::X3rx.layout();
        assert_eq!(layout.word_size, 4);
        assert_eq!(layout.sideband_size, 16);
        assert_eq!(layout.sideband_signals_size, 3);
        assert_eq!(layout.flags.data_sop, FlagBit::new(0, 0b0001));
        assert_eq!(layout.flags.data_eop, FlagBit::new(0, 0b0010));
        assert_eq!(layout.flags.meta_sop, FlagBit::new(2, 0b0100));
        assert_eq!(layout.flags.meta_eop, FlagBit::new(2, 0b1000));
    }

    #[test]
    fn parses_known_suffixes() {
        assert_eq!(BusFormat::from_str("x3rx").unwrap(), BusFormat::X3rx);
        assert_eq!(BusFormat::from_str("sb").unwrap(), BusFormat::Sb);
        assert!(BusFormat::from_str("bogus").is_err());
    }
}
