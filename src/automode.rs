//! Adaptive playout target ("automode") and the per-tick playout decision.
//!
//! The target buffer level is driven by a 32-bucket histogram of packet
//! inter-arrival times measured in packet-time units, aged with a Q15
//! forgetting factor. The optimal level is the histogram's 95th percentile
//! in Q8 packets; a peak detector raises it further when the network shows
//! recurring delay spikes. The decision half turns buffer occupancy, the
//! target and the last DSP mode into the next playout operation.

use serde::{Deserialize, Serialize};

/// Histogram resolution: inter-arrival times of 0..=31 packet-times.
pub const HIST_BUCKETS: usize = 32;

/// Aging per update: 1 - 2^-7 in Q15.
const FORGETTING_FACTOR_Q15: u64 = 32512;

/// Probability mass added to the observed bucket per update, in Q30.
/// Matches the (1 - factor) the aging removes, keeping the histogram
/// roughly normalized.
const PROB_INCREMENT_Q30: u32 = 1 << 23;

/// An IAT spike this many times the current target counts as a peak.
const PEAK_RATIO: u32 = 2;

/// Peaks further apart than this (in seconds) do not form a pattern.
const PEAK_PERIOD_LIMIT_SECS: u32 = 20;

/// Consecutive accelerate decisions allowed before a forced plain round.
const MAX_ACCELERATE_STREAK: u32 = 2;

#[derive(Debug, Clone, Copy, Default)]
struct PeakDetector {
    /// Samples elapsed since the last detected peak.
    since_last_samp: u32,
    height_pkt: u32,
    count: u32,
}

/// IAT statistics driving the optimal buffer level.
#[derive(Debug, Clone)]
pub struct Automode {
    iat_prob_q30: [u32; HIST_BUCKETS],
    opt_level_q8: u32,
    max_level_packets: u32,
    /// Samples played out since the last packet arrival.
    iat_count_samp: u32,
    peak: PeakDetector,
    last_seq: u16,
    started: bool,
    extra_delay_ms: u32,
}

impl Automode {
    pub fn new(max_level_packets: usize) -> Self {
        let mut automode = Automode {
            iat_prob_q30: [0; HIST_BUCKETS],
            opt_level_q8: 1 << 8,
            max_level_packets: max_level_packets.max(1) as u32,
            iat_count_samp: 0,
            peak: PeakDetector::default(),
            last_seq: 0,
            started: false,
            extra_delay_ms: 0,
        };
        automode.reset(max_level_packets);
        automode
    }

    pub fn reset(&mut self, max_level_packets: usize) {
        self.iat_prob_q30 = [0; HIST_BUCKETS];
        // Start from a distribution peaked at one packet-time.
        self.iat_prob_q30[1] = 1 << 30;
        self.opt_level_q8 = 1 << 8;
        self.max_level_packets = max_level_packets.max(1) as u32;
        self.iat_count_samp = 0;
        self.peak = PeakDetector::default();
        self.started = false;
    }

    pub fn set_extra_delay_ms(&mut self, ms: u32) {
        self.extra_delay_ms = ms;
    }

    pub fn extra_delay_ms(&self) -> u32 {
        self.extra_delay_ms
    }

    /// Advance the arrival clock; called once per output tick.
    pub fn on_recout(&mut self, samples: u32) {
        self.iat_count_samp = self.iat_count_samp.saturating_add(samples);
        self.peak.since_last_samp = self.peak.since_last_samp.saturating_add(samples);
    }

    /// Account for one arrived speech packet.
    pub fn on_packet(&mut self, sequence_number: u16, packet_len_samples: u32, fs_hz: u32) {
        if packet_len_samples == 0 || fs_hz == 0 {
            return;
        }
        if !self.started {
            self.started = true;
            self.last_seq = sequence_number;
            self.iat_count_samp = 0;
            return;
        }

        // Inter-arrival time in packet-times, rounded.
        let mut iat =
            (self.iat_count_samp + packet_len_samples / 2) / packet_len_samples;
        // A packet closing a sequence gap took several packet-times by
        // construction; charge only the network-induced share.
        let seq_delta = sequence_number.wrapping_sub(self.last_seq) as i16;
        if seq_delta > 1 {
            iat = iat.saturating_sub(seq_delta as u32 - 1);
        }
        self.last_seq = sequence_number;
        self.iat_count_samp = 0;

        let bucket = (iat as usize).min(HIST_BUCKETS - 1);
        for p in self.iat_prob_q30.iter_mut() {
            *p = ((*p as u64 * FORGETTING_FACTOR_Q15) >> 15) as u32;
        }
        self.iat_prob_q30[bucket] += PROB_INCREMENT_Q30;

        self.update_optimal_level();
        self.detect_peak(iat, fs_hz);
    }

    fn update_optimal_level(&mut self) {
        let total: u64 = self.iat_prob_q30.iter().map(|&p| p as u64).sum();
        if total == 0 {
            return;
        }
        let threshold = total * 95 / 100;
        let mut cumulative = 0u64;
        let mut level = HIST_BUCKETS - 1;
        for (i, &p) in self.iat_prob_q30.iter().enumerate() {
            cumulative += p as u64;
            if cumulative >= threshold {
                level = i;
                break;
            }
        }
        self.opt_level_q8 = ((level.max(1) as u32) << 8).min(self.max_level_packets << 8);
    }

    fn detect_peak(&mut self, iat: u32, fs_hz: u32) {
        let opt_packets = (self.opt_level_q8 >> 8).max(1);
        if iat <= opt_packets * PEAK_RATIO || iat <= 2 {
            return;
        }
        let limit_samp = fs_hz.saturating_mul(PEAK_PERIOD_LIMIT_SECS);
        if self.peak.count > 0 && self.peak.since_last_samp <= limit_samp {
            self.peak.count += 1;
            self.peak.height_pkt = self.peak.height_pkt.max(iat);
        } else {
            self.peak.count = 1;
            self.peak.height_pkt = iat;
        }
        self.peak.since_last_samp = 0;
        if self.peak_mode_active(fs_hz) {
            tracing::debug!(height = self.peak.height_pkt, "delay peaks detected");
        }
    }

    fn peak_mode_active(&self, fs_hz: u32) -> bool {
        self.peak.count >= 2
            && self.peak.since_last_samp
                <= 2 * fs_hz.saturating_mul(PEAK_PERIOD_LIMIT_SECS)
    }

    /// Target buffer level in Q8 packets, peak coverage and extra delay
    /// included.
    pub fn target_level_q8(&self, packet_len_samples: u32, fs_hz: u32) -> u32 {
        let mut level = self.opt_level_q8;
        if self.peak_mode_active(fs_hz) {
            level = level.max((self.peak.height_pkt.min(self.max_level_packets)) << 8);
        }
        if self.extra_delay_ms > 0 && packet_len_samples > 0 && fs_hz > 0 {
            let extra_samples = self.extra_delay_ms * (fs_hz / 1000);
            level += (extra_samples << 8) / packet_len_samples;
        }
        level.clamp(1 << 8, self.max_level_packets << 8)
    }
}

// ---------------------------------------------------------------------------
// Playout decision
// ---------------------------------------------------------------------------

/// Host-selectable playout behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlayoutMode {
    #[default]
    On,
    /// No time stretching; concealment fades fast.
    Off,
    /// Never accelerate; modem/fax tones must not be time-scaled.
    Fax,
    /// One-way streaming: deeper target, biased against expand.
    Streaming,
}

/// The operation the DSP executes for one output tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Normal,
    Merge,
    Expand,
    Accelerate,
    FastAccelerate,
    PreemptiveExpand,
    Rfc3389Cng,
    CodecInternalCng,
}

/// What the decision sees of the next pending packet.
#[derive(Debug, Clone, Copy)]
pub struct NextPacket {
    pub timestamp: u32,
    pub is_comfort_noise: bool,
}

/// Inputs sampled at the top of a RecOut tick.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput {
    /// Buffered audio: packets in the buffer plus undelivered sync samples.
    pub buffer_samples: u32,
    pub target_samples: u32,
    pub packet_len_samples: u32,
    pub next_packet: Option<NextPacket>,
    /// Timestamp the sync buffer ends at (expected continuation).
    pub playout_timestamp: u32,
    pub codec_internal_cng_active: bool,
    pub playout_mode: PlayoutMode,
}

/// Decision memory across ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionState {
    last_operation: Option<Operation>,
    accelerate_streak: u32,
    consecutive_expands: u32,
}

impl DecisionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn consecutive_expands(&self) -> u32 {
        self.consecutive_expands
    }

    pub fn last_operation(&self) -> Option<Operation> {
        self.last_operation
    }

    /// Pick the next operation. Priority order:
    /// empty buffer, comfort noise, accelerate, pre-emptive expand,
    /// in-sync normal, near-gap merge, expand.
    pub fn decide(&mut self, input: &DecisionInput) -> Operation {
        let op = self.decide_inner(input);
        self.record(op);
        op
    }

    fn decide_inner(&mut self, input: &DecisionInput) -> Operation {
        let plen = input.packet_len_samples.max(1);
        let mut target = input.target_samples;
        if input.playout_mode == PlayoutMode::Streaming {
            target += plen;
        }
        let high = 2 * plen;
        let low = plen / 2;

        let next = match input.next_packet {
            Some(next) => next,
            None => {
                // Nothing buffered; keep DTX noise alive when the codec is
                // in a comfort-noise run, otherwise conceal.
                if input.codec_internal_cng_active {
                    return Operation::CodecInternalCng;
                }
                return Operation::Expand;
            }
        };

        if next.is_comfort_noise {
            return Operation::Rfc3389Cng;
        }

        let ts_diff = next.timestamp.wrapping_sub(input.playout_timestamp) as i32;
        let stretching_allowed =
            !matches!(input.playout_mode, PlayoutMode::Off | PlayoutMode::Fax);

        if ts_diff <= 0 {
            // The next packet continues (or overlaps) the playout point.
            let occupancy = input.buffer_samples;
            if stretching_allowed {
                if occupancy > target + high && self.accelerate_streak == 0 {
                    return Operation::Accelerate;
                }
                if occupancy > target + low
                    && self.accelerate_streak > 0
                    && self.accelerate_streak < MAX_ACCELERATE_STREAK
                {
                    return Operation::FastAccelerate;
                }
                let preemptive_room = match input.playout_mode {
                    PlayoutMode::Streaming => occupancy + plen < target.saturating_sub(low),
                    _ => occupancy < target.saturating_sub(low),
                };
                if preemptive_room && self.last_operation != Some(Operation::PreemptiveExpand) {
                    return Operation::PreemptiveExpand;
                }
            }
            return Operation::Normal;
        }

        // Gap ahead of the playout point.
        let merge_window = match input.playout_mode {
            PlayoutMode::Fax => 8 * plen,
            _ => 4 * plen,
        };
        if (ts_diff as u32) < merge_window {
            Operation::Merge
        } else {
            Operation::Expand
        }
    }

    fn record(&mut self, op: Operation) {
        match op {
            Operation::Accelerate | Operation::FastAccelerate => self.accelerate_streak += 1,
            _ => self.accelerate_streak = 0,
        }
        match op {
            Operation::Expand => self.consecutive_expands += 1,
            _ => self.consecutive_expands = 0,
        }
        self.last_operation = Some(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_steady(automode: &mut Automode, packets: usize) {
        for i in 0..packets {
            automode.on_recout(80);
            automode.on_recout(80);
            automode.on_packet(i as u16, 160, 8000);
        }
    }

    #[test]
    fn test_steady_stream_targets_one_packet() {
        let mut automode = Automode::new(50);
        feed_steady(&mut automode, 200);
        assert_eq!(automode.target_level_q8(160, 8000), 1 << 8);
    }

    #[test]
    fn test_jitter_raises_target() {
        let mut automode = Automode::new(50);
        let mut seq = 0u16;
        for round in 0..120 {
            // Every fourth packet arrives three packet-times late.
            let ticks = if round % 4 == 3 { 6 } else { 2 };
            for _ in 0..ticks {
                automode.on_recout(80);
            }
            automode.on_packet(seq, 160, 8000);
            seq = seq.wrapping_add(1);
        }
        assert!(
            automode.target_level_q8(160, 8000) >= 3 << 8,
            "target: {}",
            automode.target_level_q8(160, 8000)
        );
    }

    #[test]
    fn test_extra_delay_adds_to_target() {
        let mut automode = Automode::new(50);
        feed_steady(&mut automode, 50);
        let base = automode.target_level_q8(160, 8000);
        automode.set_extra_delay_ms(60);
        // 60 ms at 8 kHz is 3 packet-times of 160 samples.
        assert_eq!(automode.target_level_q8(160, 8000), base + (3 << 8));
    }

    #[test]
    fn test_target_clamped_to_buffer_capacity() {
        let mut automode = Automode::new(4);
        automode.set_extra_delay_ms(1000);
        assert_eq!(automode.target_level_q8(160, 8000), 4 << 8);
    }

    fn base_input() -> DecisionInput {
        DecisionInput {
            buffer_samples: 320,
            target_samples: 320,
            packet_len_samples: 160,
            next_packet: Some(NextPacket {
                timestamp: 1600,
                is_comfort_noise: false,
            }),
            playout_timestamp: 1600,
            codec_internal_cng_active: false,
            playout_mode: PlayoutMode::On,
        }
    }

    #[test]
    fn test_decision_priorities() {
        let mut state = DecisionState::new();

        // Empty buffer: conceal.
        let mut input = base_input();
        input.next_packet = None;
        assert_eq!(state.decide(&input), Operation::Expand);

        // Comfort-noise packet next.
        let mut input = base_input();
        input.next_packet.as_mut().unwrap().is_comfort_noise = true;
        assert_eq!(state.decide(&input), Operation::Rfc3389Cng);

        // In sync at target: plain decode.
        assert_eq!(state.decide(&base_input()), Operation::Normal);

        // Far above target: compress.
        let mut input = base_input();
        input.buffer_samples = 1600;
        assert_eq!(state.decide(&input), Operation::Accelerate);
        // Streak continues as fast-accelerate, then is forced off.
        assert_eq!(state.decide(&input), Operation::FastAccelerate);
        assert_eq!(state.decide(&input), Operation::Normal);

        // Far below target with a packet in hand: stretch.
        let mut state = DecisionState::new();
        let mut input = base_input();
        input.buffer_samples = 80;
        input.target_samples = 640;
        assert_eq!(state.decide(&input), Operation::PreemptiveExpand);
        // Never twice in a row.
        assert_eq!(state.decide(&input), Operation::Normal);
    }

    #[test]
    fn test_gap_handling() {
        let mut state = DecisionState::new();

        // Small gap: merge.
        let mut input = base_input();
        input.next_packet.as_mut().unwrap().timestamp = 1600 + 320;
        assert_eq!(state.decide(&input), Operation::Merge);

        // Large gap: expand until the timestamp comes around.
        input.next_packet.as_mut().unwrap().timestamp = 1600 + 160 * 10;
        assert_eq!(state.decide(&input), Operation::Expand);
        assert_eq!(state.consecutive_expands(), 1);
    }

    #[test]
    fn test_playout_mode_overrides() {
        // Fax and Off suppress time scaling.
        for mode in [PlayoutMode::Fax, PlayoutMode::Off] {
            let mut state = DecisionState::new();
            let mut input = base_input();
            input.buffer_samples = 1600;
            input.playout_mode = mode;
            assert_eq!(state.decide(&input), Operation::Normal, "mode {:?}", mode);
        }

        // Streaming biases the effective target upward: 700 samples would
        // trigger accelerate in On mode but sits below the raised bar.
        let mut state = DecisionState::new();
        let mut input = base_input();
        input.buffer_samples = 700;
        assert_eq!(state.decide(&input), Operation::Accelerate);
        let mut state = DecisionState::new();
        input.playout_mode = PlayoutMode::Streaming;
        assert_eq!(state.decide(&input), Operation::Normal);
    }

    #[test]
    fn test_dtx_continues_without_packets() {
        let mut state = DecisionState::new();
        let mut input = base_input();
        input.next_packet = None;
        input.codec_internal_cng_active = true;
        assert_eq!(state.decide(&input), Operation::CodecInternalCng);
    }
}
