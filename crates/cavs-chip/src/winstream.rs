//! Winstream: the firmware's lock-free log ring.
//!
//! ```text
//! 0x00  u32 capacity   size of the data area in bytes
//! 0x04  u32 start      offset of the oldest valid byte
//! 0x08  u32 end        offset one past the newest byte
//! 0x0c  u32 seq        total bytes ever written (wraps at 2^32)
//! 0x10  data[capacity]
//! ```
//!
//! The writer never waits for the reader. A reader that falls more than
//! `(end - start) mod capacity` bytes behind has lost data and must skip to
//! the current `seq`.

/// Header length in bytes; the data area follows it.
pub const HEADER_LEN: usize = 16;

/// Snapshot of a winstream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WinstreamHeader {
    /// Size of the data area.
    pub capacity: u32,
    /// Oldest valid byte.
    pub start: u32,
    /// One past the newest byte.
    pub end: u32,
    /// Monotonic byte counter.
    pub seq: u32,
}

/// What to copy out of the ring for one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPlan {
    /// Nothing new.
    Idle,
    /// The reader fell behind the retained backlog; resync to `seq`.
    Overrun,
    /// Copy `first` bytes at data `offset`, then `second` bytes from data
    /// offset 0.
    Copy {
        /// Data-area offset of the first byte.
        offset: usize,
        /// Bytes up to the end of the ring.
        first: usize,
        /// Bytes after wrapping to the start.
        second: usize,
    },
}

impl WinstreamHeader {
    /// Decode from the first 16 bytes of the window.
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            capacity: word(0),
            start: word(4),
            end: word(8),
            seq: word(12),
        }
    }

    /// Encode, as the firmware lays it out.
    #[must_use]
    pub fn to_le_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.capacity.to_le_bytes());
        out[4..8].copy_from_slice(&self.start.to_le_bytes());
        out[8..12].copy_from_slice(&self.end.to_le_bytes());
        out[12..16].copy_from_slice(&self.seq.to_le_bytes());
        out
    }

    /// Valid unread bytes the ring still holds: `(end - start) mod capacity`.
    #[must_use]
    pub fn backlog(&self) -> u32 {
        if self.capacity == 0 {
            return 0;
        }
        let diff = i64::from(self.end) - i64::from(self.start);
        // rem_euclid of a non-negative modulus is in 0..capacity
        u32::try_from(diff.rem_euclid(i64::from(self.capacity))).unwrap_or(0)
    }

    /// Sequence number a fresh reader starts from.
    #[must_use]
    pub fn starting_seq(&self, replay_history: bool) -> u32 {
        if replay_history {
            self.seq.wrapping_sub(self.backlog())
        } else {
            self.seq
        }
    }

    /// Plan a read for a reader that has consumed everything up to `last_seq`.
    #[must_use]
    pub fn plan(&self, last_seq: u32) -> ReadPlan {
        if self.capacity == 0 || self.seq == last_seq || self.start == self.end {
            return ReadPlan::Idle;
        }
        let behind = self.seq.wrapping_sub(last_seq);
        if behind > self.backlog() {
            return ReadPlan::Overrun;
        }
        let cap = i64::from(self.capacity);
        let copy = (i64::from(self.end) - i64::from(behind)).rem_euclid(cap);
        // Both values are below capacity, which is a u32.
        let offset = usize::try_from(copy).unwrap_or(0);
        let behind = behind as usize;
        let first = behind.min(self.capacity as usize - offset);
        ReadPlan::Copy {
            offset,
            first,
            second: behind - first,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(capacity: u32, start: u32, end: u32, seq: u32) -> WinstreamHeader {
        WinstreamHeader { capacity, start, end, seq }
    }

    #[test]
    fn reads_ten_bytes_before_end() {
        let h = header(4096, 100, 4000, 50);
        assert_eq!(h.backlog(), 3900);
        assert_eq!(
            h.plan(40),
            ReadPlan::Copy { offset: 3990, first: 10, second: 0 }
        );
    }

    #[test]
    fn wraps_around_the_ring() {
        // 20 bytes: 16 at the tail of the ring, 4 from the start
        let h = header(256, 200, 4, 1000);
        assert_eq!(h.backlog(), 60);
        assert_eq!(
            h.plan(980),
            ReadPlan::Copy { offset: 240, first: 16, second: 4 }
        );
    }

    #[test]
    fn overrun_and_idle() {
        let h = header(4096, 100, 200, 5000);
        assert_eq!(h.plan(4000), ReadPlan::Overrun);
        assert_eq!(h.plan(5000), ReadPlan::Idle);
        assert_eq!(header(4096, 7, 7, 10).plan(3), ReadPlan::Idle);
        assert_eq!(header(0, 0, 1, 10).plan(3), ReadPlan::Idle);
    }

    #[test]
    fn starting_point_respects_history_mode() {
        let h = header(4096, 100, 4000, 50_000);
        assert_eq!(h.starting_seq(false), 50_000);
        assert_eq!(h.starting_seq(true), 50_000 - 3900);
    }

    #[test]
    fn header_round_trip_layout() {
        let h = header(1, 2, 3, 4);
        let bytes = h.to_le_bytes();
        assert_eq!(bytes[4], 2);
        assert_eq!(WinstreamHeader::from_le_bytes(&bytes), h);
    }
}
