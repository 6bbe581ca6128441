//! IPC doorbell word and the host command language.
//!
//! A doorbell register carries a 32-bit word:
//!
//! ```text
//!  31   30..24   23..0
//! BUSY  opcode   payload
//! ```
//!
//! The host sets BUSY to post a message; the receiver acknowledges by writing
//! BUSY back (write-one-to-clear). Commands from the test firmware use
//! opcode 0 and carry the command number in the payload, with a full 32-bit
//! argument in the companion data register (`HIPCTDD`).

/// Pending / acknowledge bit.
pub const BUSY: u32 = 1 << 31;

const OPCODE_SHIFT: u32 = 24;
const OPCODE_MASK: u32 = 0x7f;
const PAYLOAD_MASK: u32 = 0x00ff_ffff;

/// Decoded doorbell register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Doorbell {
    /// BUSY bit.
    pub pending: bool,
    /// 7-bit message type.
    pub opcode: u8,
    /// 24-bit payload.
    pub payload: u32,
}

impl Doorbell {
    /// Build a pending doorbell.
    #[must_use]
    pub const fn new(opcode: u8, payload: u32) -> Self {
        Self {
            pending: true,
            opcode,
            payload,
        }
    }

    /// Split a register value into its fields.
    #[must_use]
    pub const fn decode(word: u32) -> Self {
        Self {
            pending: word & BUSY != 0,
            opcode: ((word >> OPCODE_SHIFT) & OPCODE_MASK) as u8,
            payload: word & PAYLOAD_MASK,
        }
    }

    /// Pack into a register value. Out-of-range bits are masked off.
    #[must_use]
    pub const fn encode(self) -> u32 {
        let busy = if self.pending { BUSY } else { 0 };
        busy | ((self.opcode as u32 & OPCODE_MASK) << OPCODE_SHIFT) | (self.payload & PAYLOAD_MASK)
    }
}

/// ROM message types.
pub mod rom {
    /// Load the firmware image from the given DMA stream.
    pub const PURGE_FW: u8 = 0x01;
    /// `purge_fw` flag inside the payload.
    pub const PURGE_FLAG: u32 = 1 << 14;
    /// Shift of the DMA index inside the payload.
    pub const DMA_ID_SHIFT: u32 = 9;
}

/// The `PURGE_FW` doorbell word that starts a firmware transfer from DMA
/// index `dma_index`.
#[must_use]
pub const fn purge_fw(dma_index: u8) -> u32 {
    Doorbell::new(
        rom::PURGE_FW,
        rom::PURGE_FLAG | ((dma_index as u32) << rom::DMA_ID_SHIFT),
    )
    .encode()
}

/// Commands the test firmware sends to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostCommand {
    /// Synchronous no-op.
    Nop,
    /// Acknowledge now, signal DONE after a delay (1.8+).
    DelayedDone,
    /// Echo the argument back as a new host → DSP message.
    Echo,
    /// Write the argument to `ADSPCS`.
    SetAdspcs,
    /// Reply with microseconds since the previous timestamp request.
    Timestamp,
    /// Copy `outbox[arg >> 16]` to `inbox[arg & 0xffff]` (word indices).
    CopyWord,
    /// Reset (creating on first use) HDA stream `arg & 0xff`.
    StreamReset,
    /// Configure stream `arg & 0xff` with buffer length `(arg >> 8) & 0xffff`.
    StreamConfig,
    /// Start stream `arg & 0xff`.
    StreamStart,
    /// Stop stream `arg & 0xff`.
    StreamStop,
    /// Check that stream `arg & 0xff` holds a 0..255 ramp; reply 1 or 0.
    StreamValidate,
    /// Write a 256-byte ramp into stream `arg & 0xff`.
    StreamSend,
    /// Print `(arg >> 8) & 0xffff` bytes from stream `arg & 0xff`.
    StreamPrint,
}

impl HostCommand {
    /// Map a command number to a command.
    #[must_use]
    pub const fn from_number(number: u32) -> Option<Self> {
        Some(match number {
            0 => Self::Nop,
            1 => Self::DelayedDone,
            2 => Self::Echo,
            3 => Self::SetAdspcs,
            4 => Self::Timestamp,
            5 => Self::CopyWord,
            6 => Self::StreamReset,
            7 => Self::StreamConfig,
            8 => Self::StreamStart,
            9 => Self::StreamStop,
            10 => Self::StreamValidate,
            11 => Self::StreamSend,
            12 => Self::StreamPrint,
            _ => return None,
        })
    }

    /// Decode a target doorbell word. Only opcode 0 carries host commands.
    #[must_use]
    pub const fn from_doorbell(word: u32) -> Option<Self> {
        let bell = Doorbell::decode(word);
        if bell.opcode != 0 {
            return None;
        }
        Self::from_number(bell.payload)
    }
}

/// Argument field extractors.
pub mod arg {
    /// Stream id (bits 0..7).
    #[must_use]
    pub const fn stream_id(arg: u32) -> u8 {
        (arg & 0xff) as u8
    }

    /// Buffer or print length (bits 8..23).
    #[must_use]
    pub const fn length(arg: u32) -> usize {
        ((arg >> 8) & 0xffff) as usize
    }

    /// Outbox word index of a copy (bits 16..31).
    #[must_use]
    pub const fn copy_src(arg: u32) -> usize {
        (arg >> 16) as usize
    }

    /// Inbox word index of a copy (bits 0..15).
    #[must_use]
    pub const fn copy_dst(arg: u32) -> usize {
        (arg & 0xffff) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_fw_word() {
        let word = purge_fw(3);
        assert_eq!(word, (1 << 31) | (1 << 24) | (1 << 14) | (3 << 9));
        let bell = Doorbell::decode(word);
        assert!(bell.pending);
        assert_eq!(bell.opcode, rom::PURGE_FW);
    }

    #[test]
    fn decode_host_commands() {
        assert_eq!(HostCommand::from_doorbell(BUSY | 2), Some(HostCommand::Echo));
        assert_eq!(HostCommand::from_doorbell(12), Some(HostCommand::StreamPrint));
        assert_eq!(HostCommand::from_doorbell(13), None);
        assert_eq!(HostCommand::from_doorbell(0x0100_0002), None);
    }

    #[test]
    fn argument_fields() {
        let a = 0x0001_2345;
        assert_eq!(arg::stream_id(a), 0x45);
        assert_eq!(arg::length(a), 0x0123);
        assert_eq!(arg::copy_src(0x0003_0007), 3);
        assert_eq!(arg::copy_dst(0x0003_0007), 7);
    }
}
