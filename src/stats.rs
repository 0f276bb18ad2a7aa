//! RTCP receiver statistics: inter-arrival jitter, loss accounting and the
//! extended highest sequence number (RFC 3550 §6.4.1, appendices A.1/A.3/A.8).
//!
//! The jitter accumulator is kept in Q4 exactly as the RFC reference code
//! does (`jitter += |d| - ((jitter + 8) >> 4)`); reports shift it down to
//! whole timestamp units. All arithmetic is wrapping on the u32/u16 torus.

use serde::{Deserialize, Serialize};

/// Sequence jumps below this are treated as in-order delivery.
const MAX_DROPOUT: u16 = 3000;
/// Backward jumps below this are treated as reordering, not restarts.
const MAX_MISORDER: u16 = 100;

/// Snapshot produced by [`RtcpStatistics::report`]; field layout matches an
/// RTCP reception report block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RtcpReport {
    /// Fraction of packets lost since the previous report, in 1/256 units.
    pub fraction_lost: u8,
    /// Total packets lost since the start of reception, clamped to 24 bits.
    pub cumulative_lost: i32,
    /// Cycle count in the high 16 bits, last sequence number in the low 16.
    pub extended_highest_sequence: u32,
    /// Smoothed inter-arrival jitter in timestamp units.
    pub jitter: u32,
}

/// Per-stream receiver statistics, updated on every accepted packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcpStatistics {
    initialized: bool,
    base_seq: u16,
    cycles: u16,
    max_seq: u16,
    received: u32,
    received_prior: u32,
    expected_prior: u32,
    jitter_q4: u32,
    transit: i32,
}

impl RtcpStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Account for one received packet.
    ///
    /// `arrival_timestamp` is the host receive clock in the same units as
    /// the RTP timestamp.
    pub fn update(&mut self, sequence_number: u16, rtp_timestamp: u32, arrival_timestamp: u32) {
        let transit = arrival_timestamp.wrapping_sub(rtp_timestamp) as i32;

        if !self.initialized {
            self.initialized = true;
            self.base_seq = sequence_number;
            self.max_seq = sequence_number;
            self.received = 1;
            self.transit = transit;
            return;
        }

        self.received = self.received.wrapping_add(1);

        let udelta = sequence_number.wrapping_sub(self.max_seq);
        if udelta < MAX_DROPOUT {
            // In order, possibly with loss in between.
            if sequence_number < self.max_seq {
                // Sequence wrapped
                self.cycles = self.cycles.wrapping_add(1);
            }
            self.max_seq = sequence_number;
        } else if udelta <= u16::MAX - MAX_MISORDER {
            // Very large jump; leave the extended counter alone and let the
            // stream settle.
        } else {
            // Duplicate or reordered packet; not a new highest.
        }

        // RFC 3550 A.8: jitter estimate in Q4.
        let d = transit.wrapping_sub(self.transit).unsigned_abs();
        self.transit = transit;
        self.jitter_q4 = self
            .jitter_q4
            .wrapping_add(d.wrapping_sub((self.jitter_q4 + 8) >> 4));
    }

    pub fn extended_highest_sequence(&self) -> u32 {
        ((self.cycles as u32) << 16) | self.max_seq as u32
    }

    /// Raw Q4 jitter accumulator.
    pub fn jitter_q4(&self) -> u32 {
        self.jitter_q4
    }

    fn expected(&self) -> u32 {
        self.extended_highest_sequence()
            .wrapping_sub(self.base_seq as u32)
            .wrapping_add(1)
    }

    /// Build a report. With `reset`, the interval baseline for
    /// `fraction_lost` moves to now (the RFC report cadence); without it
    /// the query is a pure read.
    pub fn report(&mut self, reset: bool) -> RtcpReport {
        let expected = self.expected();
        let cumulative_lost =
            (expected.wrapping_sub(self.received) as i32).clamp(-0x0080_0000, 0x007F_FFFF);

        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.received.wrapping_sub(self.received_prior);
        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64) as u8
        };

        if reset {
            self.expected_prior = expected;
            self.received_prior = self.received;
        }

        RtcpReport {
            fraction_lost,
            cumulative_lost,
            extended_highest_sequence: self.extended_highest_sequence(),
            jitter: self.jitter_q4 >> 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_cadence_has_zero_jitter() {
        let mut stats = RtcpStatistics::new();
        for i in 0..50u32 {
            stats.update(i as u16, i * 160, i * 160);
        }
        let report = stats.report(false);
        assert_eq!(report.jitter, 0);
        assert_eq!(report.cumulative_lost, 0);
        assert_eq!(report.extended_highest_sequence, 49);
    }

    #[test]
    fn test_jitter_accumulator_reference_values() {
        // Hand-computed against the RFC A.8 reference: transits 0, 20, 0
        // give d = 20 twice; q4 accumulator 20 then 20 + 20 - 1 = 39.
        let mut stats = RtcpStatistics::new();
        stats.update(0, 0, 0);
        stats.update(1, 160, 180);
        assert_eq!(stats.jitter_q4(), 20);
        stats.update(2, 320, 320);
        assert_eq!(stats.jitter_q4(), 39);
        assert_eq!(stats.report(false).jitter, 39 >> 4);
    }

    #[test]
    fn test_sequence_wrap_bumps_cycles_once() {
        let mut stats = RtcpStatistics::new();
        for seq in [65533u16, 65534, 65535, 0, 1, 2] {
            stats.update(seq, 0, 0);
        }
        let report = stats.report(false);
        assert_eq!(report.extended_highest_sequence, (1 << 16) | 2);
        assert_eq!(report.cumulative_lost, 0);
    }

    #[test]
    fn test_reorder_does_not_bump_cycles() {
        let mut stats = RtcpStatistics::new();
        for seq in [49u16, 51, 50, 52] {
            stats.update(seq, seq as u32 * 160, seq as u32 * 160);
        }
        let report = stats.report(false);
        assert_eq!(report.extended_highest_sequence, 52);
        assert_eq!(report.cumulative_lost, 0);
    }

    #[test]
    fn test_loss_accounting_and_fraction() {
        let mut stats = RtcpStatistics::new();
        for seq in 0..40u16 {
            if seq == 17 {
                continue; // lost
            }
            stats.update(seq, seq as u32 * 160, seq as u32 * 160);
        }
        let report = stats.report(true);
        assert_eq!(report.cumulative_lost, 1);
        assert!(report.fraction_lost > 0, "fraction: {}", report.fraction_lost);

        // Next interval is clean again.
        for seq in 40..60u16 {
            stats.update(seq, seq as u32 * 160, seq as u32 * 160);
        }
        let report = stats.report(true);
        assert_eq!(report.cumulative_lost, 1);
        assert_eq!(report.fraction_lost, 0);
    }
}
