//! Bounded packet buffer: a pre-sized slot array over a packed byte pool.
//!
//! Payload bytes live in one contiguous pool; each in-use slot owns a
//! non-overlapping range of it. Retrieval is ordered by RTP timestamp with
//! wrap-aware comparison, duplicates are rejected, and overflow evicts the
//! oldest packet. Nothing here allocates after construction.

use std::cmp::Ordering;

use crate::error::Error;
use crate::wire::rtp::timestamp_older;

/// Header fields kept for every buffered packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRecord {
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Host receive clock, in timestamp units.
    pub receive_timestamp: u32,
    /// 0 for a primary payload, >0 for RED redundancy blocks.
    pub redundancy_level: u8,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    record: PacketRecord,
    start: usize,
    len: usize,
    in_use: bool,
}

const EMPTY_SLOT: Slot = Slot {
    record: PacketRecord {
        payload_type: 0,
        sequence_number: 0,
        timestamp: 0,
        ssrc: 0,
        receive_timestamp: 0,
        redundancy_level: 0,
    },
    start: 0,
    len: 0,
    in_use: false,
};

/// What happened to an inserted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The sequence number was already present; the arrival was dropped.
    DuplicateDiscarded,
}

/// Pre-sized store of pending RTP payloads.
pub struct PacketBuffer {
    slots: Vec<Slot>,
    pool: Vec<u8>,
    discarded_packets: u32,
    discarded_duplicates: u32,
}

/// Ordering of two records on the timestamp torus, sequence number as the
/// tie-breaker.
fn older(a: &PacketRecord, b: &PacketRecord) -> Ordering {
    if a.timestamp == b.timestamp {
        (a.sequence_number.wrapping_sub(b.sequence_number) as i16).cmp(&0)
    } else if timestamp_older(a.timestamp, b.timestamp) {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

impl PacketBuffer {
    /// Allocate `max_packets` slots over a pool of `pool_bytes` payload
    /// bytes. Both are fixed for the lifetime of the buffer.
    pub fn new(max_packets: usize, pool_bytes: usize) -> Self {
        PacketBuffer {
            slots: vec![EMPTY_SLOT; max_packets],
            pool: vec![0u8; pool_bytes],
            discarded_packets: 0,
            discarded_duplicates: 0,
        }
    }

    pub fn max_packets(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| !s.in_use)
    }

    /// Payload bytes currently held.
    pub fn bytes_in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).map(|s| s.len).sum()
    }

    /// Packets evicted on overflow (duplicates counted separately).
    pub fn discarded_packets(&self) -> u32 {
        self.discarded_packets
    }

    pub fn discarded_duplicates(&self) -> u32 {
        self.discarded_duplicates
    }

    /// Statistics are reset independently of [`PacketBuffer::flush`].
    pub fn reset_discard_counters(&mut self) {
        self.discarded_packets = 0;
        self.discarded_duplicates = 0;
    }

    /// Insert a packet, copying its payload into the pool.
    ///
    /// A duplicate sequence number is dropped and counted. When no slot or
    /// no pool space is free, the oldest-timestamp packet is evicted and
    /// counted as discarded until the new packet fits.
    pub fn insert(&mut self, record: PacketRecord, payload: &[u8]) -> Result<InsertOutcome, Error> {
        if payload.len() > self.pool.len() {
            return Err(Error::PacketBufferInsert);
        }
        if self.slots.is_empty() {
            return Err(Error::PacketBufferNotInitialized);
        }

        if self
            .slots
            .iter()
            .any(|s| s.in_use && s.record.sequence_number == record.sequence_number)
        {
            self.discarded_duplicates += 1;
            return Ok(InsertOutcome::DuplicateDiscarded);
        }

        if self.slots.iter().all(|s| s.in_use) {
            self.evict_oldest();
        }
        let start = loop {
            match self.find_gap(payload.len()) {
                Some(start) => break start,
                None => {
                    if !self.evict_oldest() {
                        // Empty buffer always has room (checked above).
                        return Err(Error::PacketBufferInsert);
                    }
                }
            }
        };

        self.pool[start..start + payload.len()].copy_from_slice(payload);
        let slot = self
            .slots
            .iter_mut()
            .find(|s| !s.in_use)
            .ok_or(Error::PacketBufferInsert)?;
        *slot = Slot {
            record,
            start,
            len: payload.len(),
            in_use: true,
        };
        Ok(InsertOutcome::Inserted)
    }

    /// Record of the packet that plays next (smallest timestamp).
    pub fn peek_next(&self) -> Option<&PacketRecord> {
        self.oldest_index().map(|i| &self.slots[i].record)
    }

    /// Payload length of the next packet.
    pub fn peek_next_len(&self) -> Option<usize> {
        self.oldest_index().map(|i| self.slots[i].len)
    }

    /// Remove the next packet, copying its payload into `dst`.
    pub fn extract_next(&mut self, dst: &mut [u8]) -> Result<(PacketRecord, usize), Error> {
        let index = self.oldest_index().ok_or(Error::NonexistingPacket)?;
        self.extract(index, dst)
    }

    fn extract(&mut self, index: usize, dst: &mut [u8]) -> Result<(PacketRecord, usize), Error> {
        let slot = self.slots.get(index).ok_or(Error::NonexistingPacket)?;
        if !slot.in_use {
            return Err(Error::NonexistingPacket);
        }
        if dst.len() < slot.len {
            return Err(Error::PacketBufferInsert);
        }
        let (record, start, len) = (slot.record, slot.start, slot.len);
        dst[..len].copy_from_slice(&self.pool[start..start + len]);
        self.slots[index].in_use = false;
        Ok((record, len))
    }

    /// Drop every pending packet. Discard statistics survive.
    pub fn flush(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.in_use = false;
        }
    }

    fn oldest_index(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use)
            .min_by(|(_, a), (_, b)| older(&a.record, &b.record))
            .map(|(i, _)| i)
    }

    fn evict_oldest(&mut self) -> bool {
        match self.oldest_index() {
            Some(i) => {
                tracing::debug!(
                    seq = self.slots[i].record.sequence_number,
                    ts = self.slots[i].record.timestamp,
                    "packet buffer full, evicting oldest"
                );
                self.slots[i].in_use = false;
                self.discarded_packets += 1;
                true
            }
            None => false,
        }
    }

    /// First-fit scan for `len` contiguous free pool bytes.
    fn find_gap(&self, len: usize) -> Option<usize> {
        let mut start = 0usize;
        loop {
            if start + len > self.pool.len() {
                return None;
            }
            let blocker = self
                .slots
                .iter()
                .filter(|s| s.in_use && s.len > 0)
                .find(|s| s.start < start + len && start < s.start + s.len);
            match blocker {
                Some(s) => start = s.start + s.len,
                None => return Some(start),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u16, ts: u32) -> PacketRecord {
        PacketRecord {
            payload_type: 0,
            sequence_number: seq,
            timestamp: ts,
            ssrc: 0x1234,
            receive_timestamp: ts,
            redundancy_level: 0,
        }
    }

    #[test]
    fn test_retrieval_in_timestamp_order() {
        let mut buf = PacketBuffer::new(10, 1000);
        buf.insert(record(3, 480), b"ccc").unwrap();
        buf.insert(record(1, 160), b"aaa").unwrap();
        buf.insert(record(2, 320), b"bbb").unwrap();

        let mut dst = [0u8; 16];
        for (want_seq, want_payload) in [(1u16, b"aaa"), (2, b"bbb"), (3, b"ccc")] {
            assert_eq!(buf.peek_next().unwrap().sequence_number, want_seq);
            let (rec, len) = buf.extract_next(&mut dst).unwrap();
            assert_eq!(rec.sequence_number, want_seq);
            assert_eq!(&dst[..len], want_payload);
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ordering_across_timestamp_wrap() {
        let mut buf = PacketBuffer::new(4, 100);
        buf.insert(record(11, 0x0000_0050), b"new").unwrap();
        buf.insert(record(10, 0xFFFF_FF00), b"old").unwrap();
        // The pre-wrap timestamp is semantically older.
        assert_eq!(buf.peek_next().unwrap().sequence_number, 10);
    }

    #[test]
    fn test_duplicate_discarded() {
        let mut buf = PacketBuffer::new(4, 100);
        assert_eq!(
            buf.insert(record(30, 160), b"x").unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            buf.insert(record(30, 160), b"x").unwrap(),
            InsertOutcome::DuplicateDiscarded
        );
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.discarded_duplicates(), 1);
        assert_eq!(buf.discarded_packets(), 0);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut buf = PacketBuffer::new(10, 1000);
        for i in 0..11u16 {
            buf.insert(record(i, i as u32 * 160), b"pppp").unwrap();
        }
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.discarded_packets(), 1);
        // Seq 0 was evicted; playback resumes at 1.
        assert_eq!(buf.peek_next().unwrap().sequence_number, 1);
    }

    #[test]
    fn test_pool_exhaustion_evicts_until_fit() {
        let mut buf = PacketBuffer::new(8, 100);
        for i in 0..4u16 {
            buf.insert(record(i, i as u32 * 160), &[0u8; 25]).unwrap();
        }
        // 100 bytes in use; a 60-byte payload needs three evictions.
        buf.insert(record(4, 4 * 160), &[1u8; 60]).unwrap();
        assert_eq!(buf.discarded_packets(), 3);
        assert!(buf.bytes_in_use() <= 100);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_payload_larger_than_pool_rejected() {
        let mut buf = PacketBuffer::new(4, 16);
        assert_eq!(
            buf.insert(record(0, 0), &[0u8; 17]).unwrap_err(),
            Error::PacketBufferInsert
        );
    }

    #[test]
    fn test_flush_keeps_discard_counters() {
        let mut buf = PacketBuffer::new(2, 100);
        buf.insert(record(0, 0), b"a").unwrap();
        buf.insert(record(1, 160), b"b").unwrap();
        buf.insert(record(2, 320), b"c").unwrap();
        assert_eq!(buf.discarded_packets(), 1);

        buf.flush();
        assert!(buf.is_empty());
        assert_eq!(buf.discarded_packets(), 1);

        buf.reset_discard_counters();
        assert_eq!(buf.discarded_packets(), 0);
    }

    #[test]
    fn test_in_use_ranges_never_overlap() {
        let mut buf = PacketBuffer::new(6, 64);
        let mut dst = [0u8; 64];
        for i in 0..30u16 {
            buf.insert(record(i, i as u32 * 160), &[i as u8; 20]).unwrap();
            if i % 3 == 2 {
                buf.extract_next(&mut dst).unwrap();
            }
            // Invariant: byte ranges of in-use slots are disjoint.
            let mut ranges: Vec<(usize, usize)> = buf
                .slots
                .iter()
                .filter(|s| s.in_use)
                .map(|s| (s.start, s.start + s.len))
                .collect();
            ranges.sort();
            for pair in ranges.windows(2) {
                assert!(pair[0].1 <= pair[1].0, "overlap: {:?}", ranges);
            }
            assert!(buf.bytes_in_use() <= 64);
        }
    }
}
