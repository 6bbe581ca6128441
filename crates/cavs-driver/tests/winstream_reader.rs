//! Winstream reader against a model of the firmware writer

use cavs_chip::winstream::{WinstreamHeader, HEADER_LEN};
use cavs_driver::sim::MemorySpace;
use cavs_driver::{HistoryMode, MemoryWindow, MmioSpace, TraceReader, WinstreamReader};
use proptest::prelude::*;
use std::sync::Arc;

/// Byte-at-a-time writer with the firmware's ring rules: one slot stays
/// empty, and a full ring drops its oldest byte.
struct RingWriter {
    mem: Arc<MemorySpace>,
    header: WinstreamHeader,
}

impl RingWriter {
    fn new(capacity: u32, seq: u32) -> Self {
        let mem = Arc::new(MemorySpace::new(HEADER_LEN + capacity as usize));
        let writer = Self {
            mem,
            header: WinstreamHeader {
                capacity,
                start: 0,
                end: 0,
                seq,
            },
        };
        writer.publish();
        writer
    }

    fn window(&self) -> MemoryWindow {
        let space: Arc<dyn MmioSpace> = self.mem.clone();
        MemoryWindow::new(space, 0, self.mem.len()).unwrap()
    }

    fn publish(&self) {
        self.mem.write_bytes(0, &self.header.to_le_bytes());
    }

    fn write(&mut self, data: &[u8]) {
        let cap = self.header.capacity;
        for &b in data {
            self.mem
                .write_bytes(HEADER_LEN + self.header.end as usize, &[b]);
            self.header.end = (self.header.end + 1) % cap;
            if self.header.end == self.header.start {
                self.header.start = (self.header.start + 1) % cap;
            }
            self.header.seq = self.header.seq.wrapping_add(1);
        }
        self.publish();
    }
}

fn bytes(len: usize) -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), len)
}

proptest! {
    #[test]
    fn reader_sees_exactly_the_new_bytes(
        capacity in 16u32..512,
        seq0 in any::<u32>(),
        pre in 1usize..600,
        new_len in 0usize..511,
    ) {
        // Anything up to a full ring's worth of backlog
        let new_len = 1 + new_len % (capacity as usize - 1);
        let mut ring = RingWriter::new(capacity, seq0);
        ring.write(&vec![0xee; pre]);
        let resume_at = ring.header.seq;
        prop_assume!(resume_at != 0);

        let mut reader = WinstreamReader::resume(ring.window(), HistoryMode::Replay, resume_at);
        let fresh: Vec<u8> = (0..new_len).map(|i| (i % 251) as u8).collect();
        ring.write(&fresh);

        let chunk = reader.read_chunk().unwrap().unwrap();
        prop_assert_eq!(&chunk[..], &fresh[..]);
        prop_assert_eq!(reader.last_seq(), ring.header.seq);
        prop_assert!(reader.read_chunk().unwrap().is_none());
    }

    #[test]
    fn overrun_resyncs_then_reads_new_data(
        capacity in 16u32..256,
        extra in 0usize..300,
        data in bytes(15),
    ) {
        let mut ring = RingWriter::new(capacity, 1000);
        let mut reader = WinstreamReader::resume(ring.window(), HistoryMode::Replay, 1000);

        // More than the ring can hold
        ring.write(&vec![0x55; capacity as usize + extra]);
        prop_assert!(reader.read_chunk().unwrap().is_none());
        prop_assert_eq!(reader.last_seq(), ring.header.seq);

        ring.write(&data);
        let chunk = reader.read_chunk().unwrap().unwrap();
        prop_assert_eq!(&chunk[..], &data[..]);
    }

    #[test]
    fn fresh_reader_replays_retained_history(
        capacity in 16u32..256,
        data in proptest::collection::vec(any::<u8>(), 1..600),
    ) {
        let mut ring = RingWriter::new(capacity, 0);
        ring.write(&data);
        let retained = data.len().min(capacity as usize - 1);

        let mut replay = WinstreamReader::new(ring.window(), HistoryMode::Replay);
        let chunk = replay.read_chunk().unwrap().unwrap();
        prop_assert_eq!(&chunk[..], &data[data.len() - retained..]);

        let mut skip = WinstreamReader::new(ring.window(), HistoryMode::SkipHistory);
        prop_assert!(skip.read_chunk().unwrap().is_none());
        ring.write(b"tail");
        let chunk = skip.read_chunk().unwrap().unwrap();
        prop_assert_eq!(&chunk[..], b"tail");
    }
}
