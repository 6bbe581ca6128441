//! HD-Audio DMA streams
//!
//! A configured stream owns one huge page laid out as a double buffer:
//!
//! ```text
//! 0        L        2L       2L+32
//! ┌────────┬────────┬────────┐
//! │ half 0 │ half 1 │  BDL   │      CBL = L, LVI = 1
//! └────────┴────────┴────────┘
//! ```
//!
//! Host writes are mirrored into both halves so the DSP can read a fixed
//! window without handling wraparound. Host reads (`print`) walk a software
//! cursor over `[0, 2L)` and split at the end into two parts, each a whole
//! number of 128-byte records.
//!
//! Reset ordering is strict: RUN must be cleared and allowed to settle
//! before SRST is touched, and SRST must be seen set before it is cleared.
//! Boards hang the DSP when these steps are collapsed.

use crate::config::HwTiming;
use crate::error::{CavsError, Result};
use crate::hda::HdaController;
use crate::hugepage::{DmaAllocator, PhysicalBuffer};
use crate::regs::{stream_debug_window, stream_window, RegisterWindow, StreamDebugReg, StreamReg};
use bytes::{Bytes, BytesMut};
use cavs_chip::bdl::{BufferDescriptorList, DOUBLE_BUFFER_MAX_LEN, FIRMWARE_MAX_LEN, MIN_BUFFER};
use cavs_chip::regs::{ctl, sts, MAX_STREAM_ID};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Length of the ramp pattern used by SEND and VALIDATE.
pub const RAMP_LEN: usize = 256;

/// Stream tag programmed for the firmware transfer; any non-zero tag works.
const FIRMWARE_STREAM_TAG: u8 = 1;

/// One HD-Audio stream and its DMA buffer.
#[derive(Debug)]
pub struct HdaStream {
    id: u8,
    hda: HdaController,
    regs: RegisterWindow<StreamReg>,
    debug: RegisterWindow<StreamDebugReg>,
    allocator: Arc<dyn DmaAllocator>,
    buffer: Option<PhysicalBuffer>,
    buf_len: usize,
    cursor: usize,
    timing: HwTiming,
    reset_on_drop: bool,
}

impl HdaStream {
    /// Map stream `id` and put it through a full reset.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a valid stream index.
    ///
    /// # Errors
    ///
    /// Fails if the registers cannot be mapped or the reset handshake times
    /// out.
    pub fn open(
        hda: &HdaController,
        allocator: Arc<dyn DmaAllocator>,
        id: u8,
        timing: HwTiming,
    ) -> Result<Self> {
        let mut stream = Self::attach(hda, allocator, id, timing)?;
        stream.reset_on_drop = true;
        stream.reset()?;
        Ok(stream)
    }

    /// Map stream `id` without touching it. The stream is not reset on drop.
    ///
    /// # Panics
    ///
    /// Panics if `id` exceeds [`MAX_STREAM_ID`]; its SPIB slot and enable
    /// bits would alias other registers.
    ///
    /// # Errors
    ///
    /// Fails if the registers cannot be mapped.
    pub fn attach(
        hda: &HdaController,
        allocator: Arc<dyn DmaAllocator>,
        id: u8,
        timing: HwTiming,
    ) -> Result<Self> {
        assert!(
            id <= MAX_STREAM_ID,
            "hda stream {id} out of range (max {MAX_STREAM_ID})"
        );
        info!("Mapping registers for hda stream {id}");
        Ok(Self {
            id,
            hda: hda.clone(),
            regs: stream_window(hda.bar0(), id)?,
            debug: stream_debug_window(hda.bar0(), id)?,
            allocator,
            buffer: None,
            buf_len: 0,
            cursor: 0,
            timing,
            reset_on_drop: false,
        })
    }

    /// Stream index.
    pub const fn id(&self) -> u8 {
        self.id
    }

    /// Length of one half of the double buffer.
    pub const fn buf_len(&self) -> usize {
        self.buf_len
    }

    /// Software read cursor into `[0, 2L]`.
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// True once [`configure`](Self::configure) has given the stream a buffer.
    pub const fn is_configured(&self) -> bool {
        self.buffer.is_some()
    }

    /// Raw descriptor registers.
    pub fn regs(&self) -> &RegisterWindow<StreamReg> {
        &self.regs
    }

    /// Physical address of the DMA buffer, if configured.
    pub fn buffer_phys(&self) -> Option<u64> {
        self.buffer.as_ref().map(PhysicalBuffer::phys)
    }

    /// Stop DMA, cycle SRST, clear SPIB, and re-enable PROCEN.
    ///
    /// # Errors
    ///
    /// Returns [`CavsError::Timeout`] if SRST does not follow the writes.
    pub fn reset(&mut self) -> Result<()> {
        info!("Resetting stream {}", self.id);
        self.dump();
        self.regs.clear_bits(StreamReg::Ctl, ctl::RUN);
        std::thread::sleep(self.timing.stream_settle);
        self.srst_handshake()?;

        info!("Disable SPIB and set position 0 of stream {}", self.id);
        self.hda.disable_spib(self.id);
        self.regs.write(StreamReg::Spib, 0);

        self.hda.enable_stream_processing(self.id);
        self.dump();
        Ok(())
    }

    fn srst_handshake(&self) -> Result<()> {
        let poll = self.timing.stream_reset;
        self.regs.write(StreamReg::Ctl, ctl::SRST);
        poll.spin("stream reset entry", || self.regs.read(StreamReg::Ctl) & ctl::SRST != 0)?;
        self.regs.write(StreamReg::Ctl, 0);
        poll.spin("stream reset exit", || self.regs.read(StreamReg::Ctl) & ctl::SRST == 0)?;
        Ok(())
    }

    /// Allocate a double buffer of `2 * buf_len` bytes and program the
    /// descriptor registers. Replaces any previous buffer and rewinds the
    /// cursor.
    ///
    /// # Panics
    ///
    /// Panics if both halves and the list cannot fit in one huge page.
    ///
    /// # Errors
    ///
    /// Fails if the buffer cannot be allocated.
    pub fn configure(&mut self, buf_len: usize) -> Result<()> {
        assert!(
            buf_len <= DOUBLE_BUFFER_MAX_LEN,
            "buffer length {buf_len} too large for one DMA page"
        );
        info!("Configuring stream {} with buffer length {buf_len}", self.id);
        self.buffer = None;

        let bdl_probe = BufferDescriptorList::double_buffer(0, buf_len);
        let mut buffer = self
            .allocator
            .allocate(bdl_probe.list_offset + bdl_probe.encoded_len())?;
        let bdl = BufferDescriptorList::double_buffer(buffer.phys(), buf_len);
        buffer.zero(0, 2 * buf_len);
        buffer.write_at(bdl.list_offset, &bdl.to_bytes());
        info!("Mapped DMA page at {:#x} for buf size {buf_len}", buffer.phys());

        self.program(&bdl, buffer.phys(), ctl::stream_tag(self.id) | ctl::TP, buf_len);
        self.buffer = Some(buffer);
        self.buf_len = buf_len;
        self.cursor = 0;
        self.dump();
        Ok(())
    }

    /// Set the stream up to feed `image` to the ROM: one page holding the
    /// image, the vestigial-buffer BDL, SPIB at the image length.
    ///
    /// # Errors
    ///
    /// Returns [`CavsError::FirmwareTooLarge`] if the image does not fit, or
    /// an allocation / reset-handshake error.
    pub fn configure_firmware(&mut self, image: &[u8]) -> Result<()> {
        if image.len() > FIRMWARE_MAX_LEN {
            return Err(CavsError::FirmwareTooLarge {
                len: image.len(),
                max: FIRMWARE_MAX_LEN,
            });
        }
        let mut buffer = self.allocator.allocate(FIRMWARE_MAX_LEN + 2 * MIN_BUFFER)?;
        buffer.write_at(0, image);
        let bdl = BufferDescriptorList::firmware(buffer.phys());
        buffer.write_at(bdl.list_offset, &bdl.to_bytes());
        info!(
            "Mapped DMA page at {:#x} to contain {} bytes of firmware",
            buffer.phys(),
            image.len()
        );

        self.srst_handshake()?;
        let len = image.len();
        self.program(&bdl, buffer.phys(), ctl::stream_tag(FIRMWARE_STREAM_TAG), len);
        self.hda.enable_stream_processing(self.id);

        // The ROM polls a "buffer full" bit that only works with SPIB on.
        self.hda.enable_spib(self.id);
        self.regs.write(StreamReg::Spib, dword(len));

        self.buffer = Some(buffer);
        self.buf_len = len;
        self.cursor = 0;
        Ok(())
    }

    fn program(&self, bdl: &BufferDescriptorList, page_phys: u64, ctl_value: u32, cbl: usize) {
        let list = bdl.list_address(page_phys);
        self.regs.write(StreamReg::Ctl, ctl_value);
        self.regs.write(StreamReg::Bdpu, (list >> 32) as u32);
        self.regs.write(StreamReg::Bdpl, (list & 0xffff_ffff) as u32);
        self.regs.write(StreamReg::Cbl, dword(cbl));
        self.regs.write(StreamReg::Lvi, bdl.last_valid_index());
    }

    fn buffer_mut(&mut self) -> &mut PhysicalBuffer {
        let id = self.id;
        self.buffer
            .as_mut()
            .unwrap_or_else(|| panic!("stream {id} used before configure"))
    }

    fn buffer(&self) -> &PhysicalBuffer {
        self.buffer
            .as_ref()
            .unwrap_or_else(|| panic!("stream {} used before configure", self.id))
    }

    /// Copy up to `L` bytes of `data` into both halves, then enable SPIB
    /// and advance it by the number of bytes written. Returns that count.
    ///
    /// # Panics
    ///
    /// Panics if the stream is not configured.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.buf_len);
        info!("Writing data to stream {}, len {n}", self.id);
        let buffer = self.buffer_mut();
        buffer.write_at(0, &data[..n]);
        buffer.write_at(n, &data[..n]);
        self.hda.enable_spib(self.id);
        self.regs.update(StreamReg::Spib, |spib| spib.wrapping_add(dword(n)));
        n
    }

    /// Write the 0..=255 ramp.
    ///
    /// # Panics
    ///
    /// Panics if the stream is not configured.
    pub fn send_ramp(&mut self) -> usize {
        let ramp: Vec<u8> = (0..=255u8).collect();
        self.write(&ramp)
    }

    /// Set RUN and rewind the cursor.
    pub fn start(&mut self) {
        info!("Starting stream {}, CTL {:#x}", self.id, self.regs.read(StreamReg::Ctl));
        self.regs.set_bits(StreamReg::Ctl, ctl::RUN);
        self.cursor = 0;
    }

    /// Clear RUN, let the engine settle, then put the stream into reset.
    pub fn stop(&mut self) {
        info!("Stopping stream {}, CTL {:#x}", self.id, self.regs.read(StreamReg::Ctl));
        self.regs.clear_bits(StreamReg::Ctl, ctl::RUN);
        std::thread::sleep(self.timing.stream_settle);
        self.regs.set_bits(StreamReg::Ctl, ctl::SRST);
    }

    /// True if the first 256 bytes hold the 0..=255 ramp. Leaves the cursor
    /// just past them.
    ///
    /// # Panics
    ///
    /// Panics if the stream is not configured.
    pub fn validate_ramp(&mut self) -> bool {
        self.dump();
        let mut head = [0u8; RAMP_LEN];
        self.buffer().read_at(0, &mut head);
        self.cursor = RAMP_LEN;
        let ok = head.iter().enumerate().all(|(i, &b)| usize::from(b) == i);
        info!("Stream {} holds ramp data: {ok}", self.id);
        ok
    }

    /// Split a `len`-byte read at the cursor into the part before the end of
    /// the double buffer and the part after wrapping.
    fn split(&self, len: usize) -> (usize, usize) {
        let ring = 2 * self.buf_len;
        let pos = self.cursor;
        assert!(pos <= ring, "stream {} cursor {pos} past ring of {ring}", self.id);
        let (first, second) = if pos + len >= ring {
            (ring - pos, len - (ring - pos))
        } else {
            (len, 0)
        };
        assert!(
            first % MIN_BUFFER == 0 && second % MIN_BUFFER == 0,
            "stream {} read of {len} at {pos} splits into {first}+{second}, not whole records",
            self.id
        );
        (first, second)
    }

    /// Read `len` bytes at the cursor, wrapping once at `2L`. Returns the
    /// parts separately; the second is empty when no wrap happened.
    ///
    /// # Panics
    ///
    /// Panics if the stream is not configured or either part is not a
    /// multiple of 128 bytes.
    pub fn read(&mut self, len: usize) -> (Bytes, Bytes) {
        let (first, second) = self.split(len);
        let pos = self.cursor;
        let buffer = self.buffer();

        let mut head = BytesMut::zeroed(first);
        buffer.read_at(pos, &mut head);
        let mut tail = BytesMut::zeroed(second);
        if second != 0 {
            buffer.read_at(0, &mut tail);
        }

        self.cursor = if second == 0 { pos + first } else { second };
        (head.freeze(), tail.freeze())
    }

    /// [`read`](Self::read) `len` bytes and write them to `out` as text,
    /// replacing invalid UTF-8.
    ///
    /// # Errors
    ///
    /// Propagates write errors from `out`.
    ///
    /// # Panics
    ///
    /// As for [`read`](Self::read).
    pub fn print(&mut self, len: usize, out: &mut dyn Write) -> Result<()> {
        let (head, tail) = self.read(len);
        out.write_all(String::from_utf8_lossy(&head).as_bytes())?;
        if !tail.is_empty() {
            out.write_all(String::from_utf8_lossy(&tail).as_bytes())?;
        }
        out.flush()?;
        Ok(())
    }

    /// Log the descriptor registers.
    pub fn dump(&self) {
        let ctl_value = self.regs.read(StreamReg::Ctl);
        let status = ctl::status(ctl_value);
        let lvi = self.regs.read(StreamReg::Lvi);
        let fifos = self.regs.read(StreamReg::Fifos);
        debug!(
            "HDA {}: PPROC {}, CTL {:#x}, LPIB {:#x}, BDPU {:#x}, BDPL {:#x}, CBL {:#x}, LVI {:#x}",
            self.id,
            u8::from(self.hda.stream_processing(self.id)),
            ctl_value & 0x00ff_ffff,
            self.regs.read(StreamReg::Lpib),
            self.regs.read(StreamReg::Bdpu),
            self.regs.read(StreamReg::Bdpl),
            self.regs.read(StreamReg::Cbl),
            lvi & 0xffff,
        );
        debug!(
            "    FIFOW {}, FIFOS {}, FMT {:#x}, FIFOL {}, DPIB {}, EFIFOS {}",
            (lvi >> 16) & 0x7,
            fifos & 0xffff,
            fifos >> 16,
            self.regs.read(StreamReg::Fifol),
            self.debug.read(StreamDebugReg::Dpib),
            self.debug.read(StreamDebugReg::Efifos),
        );
        debug!(
            "    status: FIFORDY {}, DESE {}, FIFOE {}, BCIS {}",
            u8::from(status & sts::FIFORDY != 0),
            u8::from(status & sts::DESE != 0),
            u8::from(status & sts::FIFOE != 0),
            u8::from(status & sts::BCIS != 0),
        );
    }
}

impl Drop for HdaStream {
    fn drop(&mut self) {
        if self.reset_on_drop {
            if let Err(e) = self.reset() {
                warn!("Stream {} reset on teardown failed: {e}", self.id);
            }
        }
    }
}

/// Lengths here are bounded by one huge page, so they always fit a register.
fn dword(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hugepage::HeapAllocator;
    use crate::mmio::MmioSpace;
    use crate::sim::MemorySpace;
    use cavs_chip::regs::{spib, stream_base};

    fn setup(id: u8) -> (Arc<MemorySpace>, Arc<HeapAllocator>, HdaStream) {
        let mem = Arc::new(MemorySpace::new(0x1000));
        let hda = HdaController::new(mem.clone()).unwrap();
        let alloc = Arc::new(HeapAllocator::new());
        let stream = HdaStream::open(&hda, alloc.clone(), id, HwTiming::immediate()).unwrap();
        (mem, alloc, stream)
    }

    #[test]
    fn highest_stream_opens_without_touching_ppsts() {
        let mem = Arc::new(MemorySpace::new(0x1000));
        mem.write32(cavs_chip::regs::PPSTS, 0x5a5a);
        let hda = HdaController::new(mem.clone()).unwrap();
        let alloc = Arc::new(HeapAllocator::new());
        let stream = HdaStream::open(&hda, alloc, MAX_STREAM_ID, HwTiming::immediate()).unwrap();
        assert!(stream.hda.stream_processing(MAX_STREAM_ID));
        assert_eq!(mem.read32(cavs_chip::regs::PPSTS), 0x5a5a);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn attach_rejects_ids_past_the_spib_block() {
        let mem = Arc::new(MemorySpace::new(0x1000));
        let hda = HdaController::new(mem).unwrap();
        let _ = HdaStream::attach(
            &hda,
            Arc::new(HeapAllocator::new()),
            MAX_STREAM_ID + 1,
            HwTiming::immediate(),
        );
    }

    #[test]
    fn open_resets_and_enables_procen() {
        let (mem, _, stream) = setup(2);
        assert_eq!(mem.read32(stream_base(2)) & ctl::SRST, 0);
        assert!(stream.hda.stream_processing(2));
        assert_eq!(mem.read32(spib(2)), 0);
    }

    #[test]
    fn configure_programs_descriptor() {
        let (mem, _, mut stream) = setup(3);
        stream.configure(512).unwrap();
        let base = stream_base(3);
        let phys = stream.buffer_phys().unwrap();
        let list = phys + 1024;
        assert_eq!(mem.read32(base + 0x08), 512);
        assert_eq!(mem.read32(base + 0x0c), 1);
        assert_eq!(mem.read32(base + 0x18), (list & 0xffff_ffff) as u32);
        assert_eq!(mem.read32(base + 0x1c), (list >> 32) as u32);
        assert_eq!(mem.read32(base), (3 << 20) | (1 << 18));
        assert_eq!(stream.cursor(), 0);
    }

    #[test]
    fn write_mirrors_and_advances_spib() {
        let (mem, _, mut stream) = setup(1);
        stream.configure(256).unwrap();
        assert_eq!(stream.send_ramp(), 256);
        assert_eq!(mem.read32(spib(1)), 256);
        assert_eq!(mem.read32(0x704) & (1 << 1), 1 << 1);
        assert!(stream.validate_ramp());

        stream.start();
        let (head, tail) = stream.read(512);
        assert_eq!(head.len(), 512);
        assert!(tail.is_empty());
        assert_eq!(&head[..256], &head[256..]);
        assert_eq!(stream.cursor(), 512);
    }

    #[test]
    fn write_truncates_to_buffer_length() {
        let (_, _, mut stream) = setup(1);
        stream.configure(128).unwrap();
        assert_eq!(stream.write(&[7u8; 300]), 128);
    }

    #[test]
    fn read_wraps_at_end_of_ring() {
        let (_, _, mut stream) = setup(0);
        stream.configure(256).unwrap();
        stream.send_ramp();
        stream.start();
        let _ = stream.read(384);
        let (head, tail) = stream.read(256);
        assert_eq!(head.len(), 128);
        assert_eq!(tail.len(), 128);
        assert_eq!(head[0], 128);
        assert_eq!(tail[0], 0);
        assert_eq!(stream.cursor(), 128);
    }

    #[test]
    #[should_panic(expected = "not whole records")]
    fn misaligned_split_panics() {
        let (_, _, mut stream) = setup(0);
        stream.configure(256).unwrap();
        let _ = stream.read(100);
        let _ = stream.read(500);
    }

    #[test]
    #[should_panic(expected = "before configure")]
    fn unconfigured_write_panics() {
        let (_, _, mut stream) = setup(0);
        stream.write(b"x");
    }

    #[test]
    fn stop_leaves_stream_in_reset() {
        let (mem, _, mut stream) = setup(4);
        stream.configure(128).unwrap();
        stream.start();
        assert_ne!(mem.read32(stream_base(4)) & ctl::RUN, 0);
        stream.stop();
        let ctl_value = mem.read32(stream_base(4));
        assert_eq!(ctl_value & ctl::RUN, 0);
        assert_ne!(ctl_value & ctl::SRST, 0);
    }

    #[test]
    fn buffer_released_with_stream() {
        let (_, alloc, mut stream) = setup(5);
        stream.configure(128).unwrap();
        stream.configure(256).unwrap();
        assert_eq!(alloc.live(), 1);
        drop(stream);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn firmware_layout() {
        let mem = Arc::new(MemorySpace::new(0x1000));
        let hda = HdaController::new(mem.clone()).unwrap();
        let alloc = Arc::new(HeapAllocator::new());
        let mut stream = HdaStream::attach(&hda, alloc, 7, HwTiming::immediate()).unwrap();
        stream.configure_firmware(&[0xa5; 1024]).unwrap();
        assert_eq!(mem.read32(stream_base(7)), 1 << 20);
        assert_eq!(mem.read32(stream_base(7) + 0x08), 1024);
        assert_eq!(mem.read32(spib(7)), 1024);
        assert_ne!(mem.read32(0x704) & (1 << 7), 0);

        let err = stream.configure_firmware(&vec![0; FIRMWARE_MAX_LEN + 1]).unwrap_err();
        assert!(matches!(err, CavsError::FirmwareTooLarge { .. }));
    }
}
