//! Firmware log readers
//!
//! The firmware writes its log into one of the BAR4 memory windows while
//! the host reads it with no locking between the two. [`WinstreamReader`]
//! handles the sequence-numbered ring, [`MtraceReader`] the older linear
//! layout. [`LogTail`] turns either into an iterator of non-empty chunks.

use crate::config::{HistoryMode, LogFormat, LogWindow};
use crate::error::{CavsError, Result};
use crate::mmio::MmioSpace;
use bytes::{Bytes, BytesMut};
use cavs_chip::windows::{mtrace, WINDOW_SIZE};
use cavs_chip::winstream::{ReadPlan, WinstreamHeader, HEADER_LEN};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A bounds-checked byte range of an MMIO space.
#[derive(Debug, Clone)]
pub struct MemoryWindow {
    space: Arc<dyn MmioSpace>,
    base: usize,
    len: usize,
}

impl MemoryWindow {
    /// `len` bytes at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`CavsError::WindowBounds`] if the range is not inside `space`.
    pub fn new(space: Arc<dyn MmioSpace>, base: usize, len: usize) -> Result<Self> {
        check(base, len, space.len())?;
        Ok(Self { space, base, len })
    }

    /// One of the SRAM log windows.
    ///
    /// # Errors
    ///
    /// Fails if BAR4 is too small to hold the window.
    pub fn log_window(bar4: Arc<dyn MmioSpace>, window: LogWindow) -> Result<Self> {
        Self::new(bar4, window.offset(), WINDOW_SIZE)
    }

    /// Window length.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length window.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill `buf` from `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`CavsError::WindowBounds`] if the range leaves the window.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        check(offset, buf.len(), self.len)?;
        self.space.read_bytes(self.base + offset, buf);
        Ok(())
    }

    /// `len` bytes from `offset`.
    ///
    /// # Errors
    ///
    /// As for [`read`](Self::read).
    pub fn bytes(&self, offset: usize, len: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(len);
        self.read(offset, &mut buf)?;
        Ok(buf.freeze())
    }
}

fn check(offset: usize, len: usize, limit: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(CavsError::WindowBounds { offset, len, limit }),
    }
}

/// Decode a log chunk as text, replacing invalid UTF-8.
pub fn decode_text(chunk: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(chunk)
}

/// A source of firmware log bytes.
pub trait TraceReader {
    /// Bytes written since the last call, or `None` if nothing new.
    ///
    /// # Errors
    ///
    /// Fails if the firmware's header points outside the window.
    fn read_chunk(&mut self) -> Result<Option<Bytes>>;

    /// Cursor to resume from later.
    fn last_seq(&self) -> u32;
}

/// Reader for the winstream ring.
///
/// A cursor of 0 means "not started": the first read picks a start point
/// according to the [`HistoryMode`].
#[derive(Debug)]
pub struct WinstreamReader {
    window: MemoryWindow,
    history: HistoryMode,
    last_seq: u32,
    retries: u64,
}

impl WinstreamReader {
    /// Fresh reader.
    pub fn new(window: MemoryWindow, history: HistoryMode) -> Self {
        Self::resume(window, history, 0)
    }

    /// Reader continuing from `last_seq`.
    pub fn resume(window: MemoryWindow, history: HistoryMode, last_seq: u32) -> Self {
        Self {
            window,
            history,
            last_seq,
            retries: 0,
        }
    }

    /// Reads discarded because the firmware moved underneath them.
    pub const fn retries(&self) -> u64 {
        self.retries
    }

    fn header(&self) -> Result<WinstreamHeader> {
        let mut raw = [0u8; HEADER_LEN];
        self.window.read(0, &mut raw)?;
        Ok(WinstreamHeader::from_le_bytes(&raw))
    }
}

impl TraceReader for WinstreamReader {
    fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            let header = self.header()?;
            if self.last_seq == 0 {
                self.last_seq = header.starting_seq(self.history == HistoryMode::Replay);
            }
            let (offset, first, second) = match header.plan(self.last_seq) {
                ReadPlan::Idle => return Ok(None),
                ReadPlan::Overrun => {
                    warn!(
                        "Log overrun: reader at {}, firmware at {}, skipping ahead",
                        self.last_seq, header.seq
                    );
                    self.last_seq = header.seq;
                    return Ok(None);
                }
                ReadPlan::Copy { offset, first, second } => (offset, first, second),
            };

            check(HEADER_LEN, header.capacity as usize, self.window.len())?;
            let mut data = BytesMut::zeroed(first + second);
            self.window.read(HEADER_LEN + offset, &mut data[..first])?;
            if second != 0 {
                self.window.read(HEADER_LEN, &mut data[first..])?;
            }

            let after = self.header()?;
            if after.start == header.start && after.seq == header.seq {
                trace!("Read {} log bytes up to seq {}", data.len(), header.seq);
                self.last_seq = header.seq;
                return Ok(Some(data.freeze()));
            }
            self.retries += 1;
            debug!("Log moved during read (seq {} -> {}), retrying", header.seq, after.seq);
        }
    }

    fn last_seq(&self) -> u32 {
        self.last_seq
    }
}

/// Reader for the linear mtrace layout: a header at 8 KiB into the window
/// whose third word is the write position in the data area that follows.
/// Always starts at the current write position.
#[derive(Debug)]
pub struct MtraceReader {
    window: MemoryWindow,
    last_pos: Option<u32>,
}

impl MtraceReader {
    /// Fresh reader.
    pub fn new(window: MemoryWindow) -> Self {
        Self {
            window,
            last_pos: None,
        }
    }

    fn header(&self) -> Result<(u32, u32)> {
        let mut raw = [0u8; mtrace::HEADER_LEN];
        self.window.read(mtrace::HEADER_OFFSET, &mut raw)?;
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Ok((word(0), word(8)))
    }
}

impl TraceReader for MtraceReader {
    fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let (data_len, pos) = self.header()?;
        let room = self.window.len().saturating_sub(mtrace::DATA_OFFSET);
        let limit = (data_len as usize).min(room);
        let pos_bytes = (pos as usize).min(limit);

        let Some(last) = self.last_pos else {
            self.last_pos = Some(pos);
            return Ok(None);
        };
        if last == pos {
            return Ok(None);
        }
        // A position behind the cursor means the firmware started over
        let from = if pos < last { 0 } else { (last as usize).min(limit) };
        self.last_pos = Some(pos);
        if from >= pos_bytes {
            return Ok(None);
        }
        let chunk = self
            .window
            .bytes(mtrace::DATA_OFFSET + from, pos_bytes - from)?;
        Ok(Some(chunk))
    }

    fn last_seq(&self) -> u32 {
        self.last_pos.unwrap_or(0)
    }
}

/// Reader for the chosen window and format.
///
/// # Errors
///
/// Fails if BAR4 does not contain the window.
pub fn open_reader(
    bar4: Arc<dyn MmioSpace>,
    window: LogWindow,
    format: LogFormat,
    history: HistoryMode,
) -> Result<Box<dyn TraceReader>> {
    let window = MemoryWindow::log_window(bar4, window)?;
    Ok(match format {
        LogFormat::Winstream => Box::new(WinstreamReader::new(window, history)),
        LogFormat::Mtrace => Box::new(MtraceReader::new(window)),
    })
}

type IdleHook<'a> = Box<dyn FnMut() -> Result<()> + 'a>;

/// Polls a [`TraceReader`] and yields each non-empty chunk. Ends when the
/// stop flag is raised.
pub struct LogTail<'a> {
    reader: Box<dyn TraceReader + 'a>,
    interval: Duration,
    stop: Option<&'a AtomicBool>,
    idle: Option<IdleHook<'a>>,
}

impl std::fmt::Debug for LogTail<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTail")
            .field("interval", &self.interval)
            .field("last_seq", &self.reader.last_seq())
            .finish_non_exhaustive()
    }
}

impl<'a> LogTail<'a> {
    /// Poll `reader` every `interval`.
    pub fn new(reader: Box<dyn TraceReader + 'a>, interval: Duration) -> Self {
        Self {
            reader,
            interval,
            stop: None,
            idle: None,
        }
    }

    /// End iteration once `stop` is raised.
    #[must_use]
    pub fn with_stop_flag(mut self, stop: &'a AtomicBool) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Run `hook` once per poll, before the reader. Used to interleave IPC
    /// servicing on the same thread.
    #[must_use]
    pub fn with_idle_hook(mut self, hook: impl FnMut() -> Result<()> + 'a) -> Self {
        self.idle = Some(Box::new(hook));
        self
    }

    /// Cursor of the underlying reader.
    pub fn last_seq(&self) -> u32 {
        self.reader.last_seq()
    }
}

impl Iterator for LogTail<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.stop.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return None;
            }
            if let Some(hook) = self.idle.as_mut() {
                if let Err(e) = hook() {
                    return Some(Err(e));
                }
            }
            match self.reader.read_chunk() {
                Ok(Some(chunk)) if !chunk.is_empty() => return Some(Ok(chunk)),
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }
            std::thread::sleep(self.interval);
        }
    }
}
