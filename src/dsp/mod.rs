//! DSP core: executes the playout decision and owns the signal-path state.
//!
//! The core never talks to the packet buffer or the registry; the facade
//! decodes packets and hands PCM down here. Each operation appends produced
//! audio to the sync buffer and advances its timestamp by the consumed
//! packet duration, so N output ticks always drain exactly N frames of
//! wall-clock time regardless of which operations ran.

pub mod expand;
pub mod sync_buffer;
pub mod timescale;

use expand::{BgnState, ExpandState, MUTE_UNITY_Q14};
use sync_buffer::SyncBuffer;
use timescale::{accelerate, best_pitch_lag, merge, preemptive_expand};

/// The operation the last output tick ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DspMode {
    Normal,
    Merge,
    Expand,
    Accelerate,
    PreemptiveExpand,
    Rfc3389Cng,
    CodecInternalCng,
    BgnOnly,
}

/// Classification of the most recent output, as exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    NormalSpeech,
    Plc,
    Cng,
    PlcToCng,
    VadPassive,
}

/// Samples produced or removed by concealment and time scaling since the
/// last statistics query.
#[derive(Debug, Clone, Copy, Default)]
pub struct DspStats {
    pub expand_samples: u32,
    pub accelerate_samples: u32,
    pub preemptive_samples: u32,
}

/// Signal-path state for one engine instance.
pub struct DspCore {
    fs_hz: u32,
    samples_per_call: usize,
    pub sync: SyncBuffer,
    pub expand: ExpandState,
    pub bgn: BgnState,
    mode: DspMode,
    vad_passive: bool,
    stats: DspStats,
    /// Operation output staging; sized for the largest frame plus one lag.
    scratch: Vec<i16>,
    /// Snapshot of the pitch period expand replays.
    period_buf: Vec<i16>,
    expand_phase: usize,
}

/// Sync window: 120 ms of history and pending audio.
fn sync_capacity(fs_hz: u32) -> usize {
    (fs_hz as usize) * 12 / 100
}

/// Largest supported decoded frame: 120 ms.
pub fn max_frame_samples(fs_hz: u32) -> usize {
    (fs_hz as usize) * 12 / 100
}

fn max_lag_samples(fs_hz: u32) -> usize {
    (fs_hz as usize) * 15 / 1000
}

impl DspCore {
    pub fn new(fs_hz: u32) -> Self {
        let mut core = DspCore {
            fs_hz: 0,
            samples_per_call: 0,
            sync: SyncBuffer::new(0),
            expand: ExpandState::new(),
            bgn: BgnState::new(),
            mode: DspMode::Normal,
            vad_passive: false,
            stats: DspStats::default(),
            scratch: Vec::new(),
            period_buf: Vec::new(),
            expand_phase: 0,
        };
        core.reset(fs_hz);
        core
    }

    /// Full reset at a (possibly new) sample rate. Buffers are re-sized
    /// here and nowhere else.
    pub fn reset(&mut self, fs_hz: u32) {
        self.fs_hz = fs_hz;
        self.samples_per_call = (fs_hz / 100) as usize;
        self.sync = SyncBuffer::new(sync_capacity(fs_hz));
        self.expand.reset();
        self.bgn.reset();
        self.mode = DspMode::Normal;
        self.vad_passive = false;
        self.stats = DspStats::default();
        self.scratch = vec![0i16; max_frame_samples(fs_hz) + max_lag_samples(fs_hz)];
        self.period_buf = vec![0i16; max_lag_samples(fs_hz).max(1)];
        self.expand_phase = 0;
    }

    pub fn fs_hz(&self) -> u32 {
        self.fs_hz
    }

    /// Samples the host drains per 10 ms tick.
    pub fn samples_per_call(&self) -> usize {
        self.samples_per_call
    }

    pub fn mode(&self) -> DspMode {
        self.mode
    }

    pub fn set_vad_passive(&mut self, passive: bool) {
        self.vad_passive = passive;
    }

    /// Classify the most recent output.
    pub fn output_type(&self) -> OutputType {
        match self.mode {
            DspMode::BgnOnly => OutputType::PlcToCng,
            DspMode::Rfc3389Cng | DspMode::CodecInternalCng => OutputType::Cng,
            DspMode::Expand if self.expand.is_muted() => OutputType::PlcToCng,
            DspMode::Expand => OutputType::Plc,
            _ if self.vad_passive => OutputType::VadPassive,
            _ => OutputType::NormalSpeech,
        }
    }

    /// Take and reset the concealment counters.
    pub fn take_stats(&mut self) -> DspStats {
        std::mem::take(&mut self.stats)
    }

    pub fn flush(&mut self) {
        self.sync.flush();
        self.expand.reset();
        self.expand_phase = 0;
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Append decoded audio, cross-fading out of a concealment run when one
    /// is active. `new_end_timestamp` re-syncs the clock to the packet
    /// (`packet timestamp + frame duration`); `mode` distinguishes plain
    /// decode, post-gap merge and codec-internal comfort noise.
    pub fn decode_append(&mut self, decoded: &[i16], new_end_timestamp: u32, mode: DspMode) {
        if self.expand.is_active() && !decoded.is_empty() {
            let fade = decoded
                .len()
                .min(self.expand.lag().max(self.fs_hz as usize / 200));
            let mut scratch = std::mem::take(&mut self.scratch);
            self.generate_expand(&mut scratch[..fade]);
            let (concealed, rest) = scratch.split_at_mut(fade);
            let out_len = merge(concealed, decoded, rest).unwrap_or_else(|| {
                rest[..decoded.len()].copy_from_slice(decoded);
                decoded.len()
            });
            self.sync.append(&rest[..out_len]);
            self.scratch = scratch;
            self.expand.finish();
        } else {
            self.sync.append(decoded);
        }
        self.sync.set_end_timestamp(new_end_timestamp);
        if mode == DspMode::Normal {
            self.bgn.update(decoded);
        }
        self.mode = mode;
    }

    /// Time-compress one decoded frame by a pitch period. Returns the
    /// samples removed (0 when the frame was too short to splice, in which
    /// case it was appended unmodified).
    pub fn accelerate_append(&mut self, decoded: &[i16], new_end_timestamp: u32) -> usize {
        self.expand.finish();
        let lag = best_pitch_lag(decoded, self.fs_hz);
        let mut scratch = std::mem::take(&mut self.scratch);
        let removed = match accelerate(decoded, lag, &mut scratch) {
            Some(out_len) => {
                self.sync.append(&scratch[..out_len]);
                decoded.len() - out_len
            }
            None => {
                self.sync.append(decoded);
                0
            }
        };
        self.scratch = scratch;
        self.sync.set_end_timestamp(new_end_timestamp);
        self.bgn.update(decoded);
        self.stats.accelerate_samples += removed as u32;
        self.mode = DspMode::Accelerate;
        removed
    }

    /// Time-stretch one decoded frame by a pitch period. Returns the
    /// samples added.
    pub fn preemptive_append(&mut self, decoded: &[i16], new_end_timestamp: u32) -> usize {
        self.expand.finish();
        let lag = best_pitch_lag(decoded, self.fs_hz);
        let mut scratch = std::mem::take(&mut self.scratch);
        let added = match preemptive_expand(decoded, lag, &mut scratch) {
            Some(out_len) => {
                self.sync.append(&scratch[..out_len]);
                out_len - decoded.len()
            }
            None => {
                self.sync.append(decoded);
                0
            }
        };
        self.scratch = scratch;
        self.sync.set_end_timestamp(new_end_timestamp);
        self.bgn.update(decoded);
        self.stats.preemptive_samples += added as u32;
        self.mode = DspMode::PreemptiveExpand;
        added
    }

    /// One call's worth of concealment audio.
    pub fn expand_call(&mut self) -> usize {
        let n = self.samples_per_call;
        self.expand_fill(n);
        self.mode = DspMode::Expand;
        n
    }

    /// Generate exactly `samples` of concealment audio (used both for
    /// expand proper and for bridging a timestamp gap before a merge).
    pub fn expand_fill(&mut self, samples: usize) {
        if samples == 0 {
            return;
        }
        self.begin_expand();
        let mut scratch = std::mem::take(&mut self.scratch);
        let mut remaining = samples;
        while remaining > 0 {
            let n = remaining.min(scratch.len());
            self.generate_expand(&mut scratch[..n]);
            self.sync.append(&scratch[..n]);
            self.expand.step(n, self.fs_hz);
            remaining -= n;
        }
        self.scratch = scratch;
        self.sync.advance_timestamp(samples as u32);
        self.stats.expand_samples += samples as u32;
    }

    /// Comfort noise: a codec-generated frame when one is supplied, the
    /// background-noise generator otherwise. `internal` distinguishes a
    /// codec-internal (DTX) run from an RFC 3389 one.
    pub fn cng_call(&mut self, codec_generated: Option<&[i16]>, internal: bool) {
        let n = self.samples_per_call;
        self.expand.finish();
        match codec_generated {
            Some(frame) => {
                self.sync.append(frame);
                self.sync.advance_timestamp(frame.len() as u32);
            }
            None => {
                let mut scratch = std::mem::take(&mut self.scratch);
                self.bgn.generate(&mut scratch[..n]);
                self.sync.append(&scratch[..n]);
                self.scratch = scratch;
                self.sync.advance_timestamp(n as u32);
            }
        }
        self.mode = if internal {
            DspMode::CodecInternalCng
        } else {
            DspMode::Rfc3389Cng
        };
    }

    /// Background noise only (no decode, no expand bookkeeping).
    pub fn bgn_only_call(&mut self) {
        let n = self.samples_per_call;
        let mut scratch = std::mem::take(&mut self.scratch);
        self.bgn.generate(&mut scratch[..n]);
        self.sync.append(&scratch[..n]);
        self.scratch = scratch;
        self.sync.advance_timestamp(n as u32);
        self.mode = DspMode::BgnOnly;
    }

    /// Deliver pending samples to the host buffer.
    pub fn read(&mut self, out: &mut [i16]) -> usize {
        self.sync.read(out)
    }

    // -----------------------------------------------------------------------
    // Expand internals
    // -----------------------------------------------------------------------

    fn begin_expand(&mut self) {
        if self.expand.is_active() {
            return;
        }
        let lag = best_pitch_lag(self.sync.history(), self.fs_hz).min(self.period_buf.len());
        self.expand.begin(lag.max(1));
        let lag = self.expand.lag();
        let history = self.sync.history();
        let take = lag.min(history.len());
        self.period_buf[..lag].fill(0);
        self.period_buf[lag - take..lag].copy_from_slice(&history[history.len() - take..]);
        self.expand_phase = 0;
    }

    /// Pitch-period replay mixed with background noise as the mute factor
    /// decays. Assumes `begin_expand` ran.
    fn generate_expand(&mut self, out: &mut [i16]) {
        let lag = self.expand.lag();
        // Noise bed first (zeros when the BGN model is off/unprimed).
        self.bgn.generate(out);
        let mute = self.expand.mute_factor_q14();
        if mute == 0 {
            return;
        }
        for sample in out.iter_mut() {
            let speech = self.period_buf[self.expand_phase] as i32;
            self.expand_phase = (self.expand_phase + 1) % lag;
            let mixed = (speech * mute + (*sample as i32) * (MUTE_UNITY_Q14 - mute)) >> 14;
            *sample = mixed.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
    }
}
