//! PCIe identifiers and chip-generation detection.
//!
//! The device-id lists follow the SOF kernel driver's platform tables. They
//! are data, not logic: a new part is supported by adding a row to
//! [`DEVICE_TABLE`], nothing in the sequencing code changes.

/// Intel vendor ID (PCI-SIG assigned).
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// PCI class codes (upper 16 bits of the 24-bit class register) that
/// identify an HD-Audio controller with an attached DSP.
pub mod class {
    /// Multimedia audio controller (`0x0401xx`).
    pub const MULTIMEDIA_AUDIO: u16 = 0x0401;
    /// HD-Audio compatible device (`0x0403xx`).
    pub const HDA: u16 = 0x0403;
}

/// All class codes accepted during discovery.
pub const DSP_CLASS_CODES: &[u16] = &[class::MULTIMEDIA_AUDIO, class::HDA];

/// cAVS hardware generation.
///
/// Only the width of the per-core fields in `ADSPCS` and the location of the
/// IPC registers differ between generations; the boot protocol is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipGeneration {
    /// cAVS 1.5 (Apollo Lake, Sky/Kaby Lake): two cores, no TDA/IDA registers.
    Cavs15,
    /// cAVS 1.8 (Cannon/Comet/Whiskey Lake): four cores.
    Cavs18,
    /// cAVS 2.5 (Tiger/Alder Lake): host powers core 0 only.
    Cavs25,
}

/// Device id → generation table.
pub const DEVICE_TABLE: &[(u16, ChipGeneration)] = &[
    (0x5a98, ChipGeneration::Cavs15),
    (0x1a98, ChipGeneration::Cavs15),
    (0x3198, ChipGeneration::Cavs15),
    (0x9dc8, ChipGeneration::Cavs18),
    (0xa348, ChipGeneration::Cavs18),
    (0x02c8, ChipGeneration::Cavs18),
    (0x06c8, ChipGeneration::Cavs18),
    (0xa3f0, ChipGeneration::Cavs18),
    (0xa0c8, ChipGeneration::Cavs25),
    (0x43c8, ChipGeneration::Cavs25),
    (0x4b55, ChipGeneration::Cavs25),
    (0x4b58, ChipGeneration::Cavs25),
    (0x7ad0, ChipGeneration::Cavs25),
    (0x51c8, ChipGeneration::Cavs25),
];

impl ChipGeneration {
    /// Look up a PCI device id in [`DEVICE_TABLE`].
    #[must_use]
    pub fn from_device_id(id: u16) -> Option<Self> {
        DEVICE_TABLE
            .iter()
            .find(|(did, _)| *did == id)
            .map(|(_, generation)| *generation)
    }

    /// Bits covering every host-controlled core in one `ADSPCS` field.
    #[must_use]
    pub const fn core_mask(self) -> u32 {
        match self {
            Self::Cavs15 => 0b11,
            Self::Cavs18 => 0b1111,
            Self::Cavs25 => 0b1,
        }
    }

    /// Core mask shifted into the `ADSPCS` field starting at `field_shift`.
    #[must_use]
    pub const fn power_mask(self, field_shift: u32) -> u32 {
        self.core_mask() << field_shift
    }

    /// True when the doorbell target has separate TDA/IDA "done" registers.
    #[must_use]
    pub const fn has_done_registers(self) -> bool {
        !matches!(self, Self::Cavs15)
    }

    /// Human-readable label, e.g. `"cAVS 1.8"`.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Cavs15 => "cAVS 1.5",
            Self::Cavs18 => "cAVS 1.8",
            Self::Cavs25 => "cAVS 2.5",
        }
    }
}

impl std::fmt::Display for ChipGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// True if a 24-bit PCI class register value belongs to an audio DSP.
#[must_use]
pub fn is_dsp_class(class_register: u32) -> bool {
    let Ok(code) = u16::try_from(class_register >> 8) else {
        return false;
    };
    DSP_CLASS_CODES.contains(&code)
}
