//! Engine facade: packet intake, paced output, statistics and
//! master/slave coordination.
//!
//! One `NetEq` instance is single-threaded: the host serializes `rec_in`,
//! `rec_out` and configuration calls. All buffers are sized at
//! construction (or at a codec-driven sample-rate switch); the real-time
//! paths reuse pre-sized scratch and never allocate.

use serde::{Deserialize, Serialize};

use crate::automode::{
    Automode, DecisionInput, DecisionState, NextPacket, Operation, PlayoutMode,
};
use crate::buffer::{PacketBuffer, PacketRecord};
use crate::codec::{AudioDecoder, CodecDb, CodecKind};
use crate::dsp::{max_frame_samples, DspCore, DspMode, OutputType};
use crate::error::Error;
use crate::stats::{RtcpReport, RtcpStatistics};
use crate::wire::rtp::{self, RtpPacket};

/// Static payload type for RFC 3389 comfort noise at 8 kHz.
const PT_CN_NB: u8 = 13;

/// Fill operations allowed per output tick before giving up.
const MAX_OPS_PER_CALL: u32 = 8;

/// Waiting-time ring length.
const WAITING_TIMES_LEN: usize = 100;

/// Transport the receive path runs over; scales the recommended buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    UdpNormal,
    UdpVideoSync,
    TcpNormal,
    TcpLargeJitter,
    TcpXLargeJitter,
}

impl NetworkType {
    fn multiplier(self) -> usize {
        match self {
            NetworkType::UdpNormal => 1,
            NetworkType::UdpVideoSync => 4,
            NetworkType::TcpNormal => 4,
            NetworkType::TcpLargeJitter => 8,
            NetworkType::TcpXLargeJitter => 20,
        }
    }
}

/// Instance configuration; all sizes are fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Initial sample rate; may change when a codec at another rate starts.
    pub fs_hz: u32,
    pub max_packets: usize,
    pub pool_bytes: usize,
    pub max_codecs: usize,
    pub playout_mode: PlayoutMode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fs_hz: 8000,
            max_packets: 50,
            pool_bytes: 50 * 480,
            max_codecs: 8,
            playout_mode: PlayoutMode::On,
        }
    }
}

/// Timing hand-off between a master instance and its slaves within one
/// tick; written by the master, read by every slave.
#[derive(Debug, Clone, Copy)]
pub struct MasterSlaveInfo {
    pub operation: Operation,
    pub playout_timestamp: u32,
}

impl Default for MasterSlaveInfo {
    fn default() -> Self {
        MasterSlaveInfo {
            operation: Operation::Normal,
            playout_timestamp: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Undecided,
    Master,
    Slave,
}

/// In-call statistics, reset on every query. Rates are Q14 fractions of
/// the timestamp span since the previous query.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NetworkStatistics {
    pub current_buffer_size_ms: u16,
    pub preferred_buffer_size_ms: u16,
    pub packet_loss_rate_q14: u16,
    pub packet_discard_rate_q14: u16,
    pub expand_rate_q14: u16,
    pub accelerate_rate_q14: u16,
    pub preemptive_rate_q14: u16,
}

/// Optional post-decode voice activity detector.
pub trait PostDecodeVad: Send {
    fn init(&mut self, fs_hz: u32);
    fn set_mode(&mut self, mode: i32);
    /// True when the frame contains active speech.
    fn is_active(&mut self, frame: &[i16], fs_hz: u32) -> bool;
}

/// The jitter buffer and concealment engine.
pub struct NetEq {
    config: Config,
    codec_db: CodecDb,
    packet_buffer: PacketBuffer,
    rtcp: RtcpStatistics,
    automode: Automode,
    decision: DecisionState,
    dsp: DspCore,
    vad: Option<Box<dyn PostDecodeVad>>,

    current_payload: Option<u8>,
    current_kind: Option<CodecKind>,
    first_packet: bool,
    /// Samples per packet of the active codec, measured at decode.
    packet_len_samples: u32,
    playout_mode: PlayoutMode,
    avt_playout: bool,
    cng_active: bool,
    role: Role,
    last_error: Option<Error>,

    /// Host receive clock in internal timestamp units.
    receive_clock: u32,
    /// Timestamp units elapsed since the last statistics query.
    report_span_ts: u32,
    discarded_late: u32,
    waiting_times_ms: [u16; WAITING_TIMES_LEN],
    waiting_times_idx: usize,
    waiting_times_len: usize,

    payload_scratch: Vec<u8>,
    decoded_scratch: Vec<i16>,
}

impl NetEq {
    /// Build an instance; every buffer is sized here.
    pub fn new(config: Config) -> Result<Self, Error> {
        if !matches!(config.fs_hz, 8000 | 16000 | 32000 | 48000) {
            return Err(Error::CodecDbUnsupportedFs);
        }
        if config.max_packets == 0 || config.pool_bytes == 0 {
            return Err(Error::PacketBufferInit);
        }
        let mut engine = NetEq {
            codec_db: CodecDb::new(config.max_codecs),
            packet_buffer: PacketBuffer::new(config.max_packets, config.pool_bytes),
            rtcp: RtcpStatistics::new(),
            automode: Automode::new(config.max_packets),
            decision: DecisionState::new(),
            dsp: DspCore::new(config.fs_hz),
            vad: None,
            current_payload: None,
            current_kind: None,
            first_packet: true,
            packet_len_samples: 0,
            playout_mode: config.playout_mode,
            avt_playout: false,
            cng_active: false,
            role: Role::Undecided,
            last_error: None,
            receive_clock: 0,
            report_span_ts: 0,
            discarded_late: 0,
            waiting_times_ms: [0; WAITING_TIMES_LEN],
            waiting_times_idx: 0,
            waiting_times_len: 0,
            payload_scratch: vec![0u8; config.pool_bytes],
            decoded_scratch: vec![0i16; max_frame_samples(config.fs_hz)],
            config,
        };
        engine.init(engine.config.fs_hz)?;
        Ok(engine)
    }

    /// Recommended packet-slot and byte-pool sizing for a codec set and
    /// transport, before applying a [`Config`].
    pub fn recommended_buffer_size(
        codecs: &[CodecKind],
        network: NetworkType,
    ) -> (usize, usize) {
        let per_packet_bytes = codecs
            .iter()
            .map(|&kind| match kind {
                CodecKind::PcmU | CodecKind::PcmA | CodecKind::G722 | CodecKind::Red => 480,
                CodecKind::Pcm16b => 960,
                CodecKind::Pcm16bWb => 1920,
                CodecKind::Pcm16bSwb32 => 3840,
                CodecKind::Ilbc => 100,
                CodecKind::Isac => 400,
                CodecKind::IsacSwb => 800,
                CodecKind::CnNb | CodecKind::CnWb | CodecKind::CnSwb => 16,
                CodecKind::TelephoneEvent => 16,
            })
            .max()
            .unwrap_or(480);
        let packets = 50 * network.multiplier();
        (packets, packets * per_packet_bytes)
    }

    /// Reset runtime state at a (possibly new) sample rate. Registered
    /// codecs survive; buffered packets do not.
    pub fn init(&mut self, fs_hz: u32) -> Result<(), Error> {
        if !matches!(fs_hz, 8000 | 16000 | 32000 | 48000) {
            return Err(self.latch(Error::CodecDbUnsupportedFs));
        }
        self.packet_buffer.flush();
        self.packet_buffer.reset_discard_counters();
        self.rtcp.reset();
        self.automode.reset(self.packet_buffer.max_packets());
        self.decision.reset();
        self.dsp.reset(fs_hz);
        self.decoded_scratch = vec![0i16; max_frame_samples(fs_hz)];
        self.current_payload = None;
        self.current_kind = None;
        self.first_packet = true;
        self.packet_len_samples = 0;
        self.cng_active = false;
        self.role = Role::Undecided;
        self.last_error = None;
        self.receive_clock = 0;
        self.report_span_ts = 0;
        self.discarded_late = 0;
        self.waiting_times_len = 0;
        self.waiting_times_idx = 0;
        tracing::debug!(fs_hz, "engine initialized");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Codec registry
    // -----------------------------------------------------------------------

    pub fn register_decoder(
        &mut self,
        kind: CodecKind,
        payload_type: u8,
        fs_hz: u32,
        decoder: Box<dyn AudioDecoder>,
    ) -> Result<(), Error> {
        self.codec_db
            .add(kind, payload_type, fs_hz, decoder)
            .map_err(|e| self.latch(e))
    }

    /// Unregister a codec. Removing the active codec is safe: decoding
    /// goes through the registry on every call, so the next `rec_out`
    /// simply falls back to concealment.
    pub fn remove_decoder(&mut self, kind: CodecKind) -> Result<(), Error> {
        if self.current_kind == Some(kind) {
            self.current_kind = None;
            self.current_payload = None;
        }
        self.codec_db.remove(kind).map_err(|e| self.latch(e))
    }

    /// (used, capacity) of the codec table.
    pub fn codec_db_size(&self) -> (usize, usize) {
        self.codec_db.size_info()
    }

    /// Kind of the `index`-th registered codec.
    pub fn codec_at(&mut self, index: usize) -> Result<CodecKind, Error> {
        self.codec_db.kind_at(index).map_err(|e| self.latch(e))
    }

    // -----------------------------------------------------------------------
    // RecIn
    // -----------------------------------------------------------------------

    /// Feed one RTP datagram. `receive_timestamp` is the host receive
    /// clock in wire timestamp units of the active codec.
    pub fn rec_in(&mut self, datagram: &[u8], receive_timestamp: u32) -> Result<(), Error> {
        let packet = rtp::parse(datagram).map_err(|e| self.latch(e))?;
        self.rec_in_packet(&packet, receive_timestamp)
    }

    /// Feed an already-parsed RTP packet.
    pub fn rec_in_packet(
        &mut self,
        packet: &RtpPacket<'_>,
        receive_timestamp: u32,
    ) -> Result<(), Error> {
        let kind = match self.resolve_kind(packet.payload_type) {
            Some(kind) => kind,
            None => return Err(self.latch(Error::UnknownPayload)),
        };

        if kind.is_red() {
            let blocks = rtp::split_red(packet.payload).map_err(|e| self.latch(e))?;
            for block in blocks {
                let sub = RtpPacket {
                    payload_type: block.payload_type,
                    sequence_number: packet
                        .sequence_number
                        .wrapping_sub(block.redundancy_level as u16),
                    timestamp: packet.timestamp.wrapping_sub(block.timestamp_offset as u32),
                    ssrc: packet.ssrc,
                    marker: packet.marker,
                    payload: block.payload,
                };
                match self.insert_one(&sub, receive_timestamp, block.redundancy_level) {
                    Ok(()) => {}
                    // Unknown redundancy payloads are dropped, not fatal.
                    Err(Error::UnknownPayload) if block.redundancy_level > 0 => continue,
                    Err(e) => return Err(self.latch(e)),
                }
            }
            return Ok(());
        }

        self.insert_one(packet, receive_timestamp, 0)
            .map_err(|e| self.latch(e))
    }

    fn resolve_kind(&self, payload_type: u8) -> Option<CodecKind> {
        match self.codec_db.lookup_payload(payload_type) {
            Some(desc) => Some(desc.kind),
            None if payload_type == PT_CN_NB => Some(CodecKind::CnNb),
            None => None,
        }
    }

    fn insert_one(
        &mut self,
        packet: &RtpPacket<'_>,
        receive_timestamp: u32,
        redundancy_level: u8,
    ) -> Result<(), Error> {
        let kind = self
            .resolve_kind(packet.payload_type)
            .ok_or(Error::UnknownPayload)?;

        // Receiver statistics run on wire-clock values.
        self.rtcp
            .update(packet.sequence_number, packet.timestamp, receive_timestamp);

        if kind.is_telephone_event() && !self.avt_playout {
            // Accepted for statistics, but event playout is disabled.
            return Ok(());
        }

        let is_speech = !kind.is_comfort_noise() && !kind.is_telephone_event();
        if is_speech {
            self.switch_codec_if_needed(kind, packet.payload_type)?;
        }

        // Internal timestamps for codecs whose RTP clock differs.
        let (num, _den) = kind.timestamp_scale();
        let timestamp = packet.timestamp.wrapping_mul(num);
        let receive_ts = receive_timestamp.wrapping_mul(num);
        self.receive_clock = receive_ts;

        if self.first_packet {
            self.first_packet = false;
            self.dsp.sync.set_end_timestamp(timestamp);
        }

        if is_speech && self.packet_len_samples > 0 {
            self.automode.on_packet(
                packet.sequence_number,
                self.packet_len_samples,
                self.dsp.fs_hz(),
            );
        }

        // Late-arrival policy: a packet entirely behind the playout point
        // goes to the decoder's late-injection hook or is dropped.
        if self.packet_len_samples > 0 {
            let horizon = timestamp.wrapping_add(self.packet_len_samples);
            let behind =
                (horizon.wrapping_sub(self.dsp.sync.playout_timestamp()) as i32) <= 0;
            if behind {
                if let Some(desc) = self.codec_db.lookup_payload_mut(packet.payload_type) {
                    if desc.decoder.add_late_packet(packet.payload).is_some() {
                        return Ok(());
                    }
                }
                self.discarded_late += 1;
                tracing::debug!(
                    seq = packet.sequence_number,
                    "late packet without injection support discarded"
                );
                return Ok(());
            }
        }

        let record = PacketRecord {
            payload_type: packet.payload_type,
            sequence_number: packet.sequence_number,
            timestamp,
            ssrc: packet.ssrc,
            receive_timestamp: receive_ts,
            redundancy_level,
        };
        match self.packet_buffer.insert(record, packet.payload) {
            Ok(_) => Ok(()),
            Err(Error::PacketBufferInsert) => Err(Error::BufferInsert),
            Err(e) => Err(e),
        }
    }

    fn switch_codec_if_needed(&mut self, kind: CodecKind, payload_type: u8) -> Result<(), Error> {
        if self.current_kind == Some(kind) && self.current_payload == Some(payload_type) {
            return Ok(());
        }
        let fs_hz = self
            .codec_db
            .lookup_payload(payload_type)
            .map(|d| d.fs_hz)
            .unwrap_or_else(|| kind.sample_rate_hz());
        if fs_hz != self.dsp.fs_hz() {
            tracing::debug!(from = self.dsp.fs_hz(), to = fs_hz, "sample-rate switch");
            self.dsp.reset(fs_hz);
            self.decoded_scratch = vec![0i16; max_frame_samples(fs_hz)];
            self.packet_buffer.flush();
            self.automode.reset(self.packet_buffer.max_packets());
            self.decision.reset();
            self.first_packet = true;
        }
        tracing::debug!(?kind, payload_type, "active codec set");
        self.current_kind = Some(kind);
        self.current_payload = Some(payload_type);
        self.packet_len_samples = 0;
        if let Some(desc) = self.codec_db.lookup_payload_mut(payload_type) {
            desc.decoder.init();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // RecOut
    // -----------------------------------------------------------------------

    /// Produce exactly `fs/100` samples (10 ms) into `out`.
    pub fn rec_out(&mut self, out: &mut [i16]) -> Result<usize, Error> {
        self.rec_out_core(out, None).map(|(n, _)| n)
    }

    /// Master-side output: records the tick's timing decision for slaves.
    pub fn rec_out_master(
        &mut self,
        out: &mut [i16],
        info: &mut MasterSlaveInfo,
    ) -> Result<usize, Error> {
        if self.role == Role::Slave {
            return Err(self.latch(Error::IllegalMasterSlaveSwitch));
        }
        let (n, op) = self.rec_out_core(out, None)?;
        self.role = Role::Master;
        info.operation = op.unwrap_or(Operation::Normal);
        info.playout_timestamp = self.dsp.sync.playout_timestamp();
        Ok(n)
    }

    /// Slave-side output: reuses the master's decision for this tick.
    pub fn rec_out_slave(
        &mut self,
        out: &mut [i16],
        info: &MasterSlaveInfo,
    ) -> Result<usize, Error> {
        if self.role == Role::Master {
            return Err(self.latch(Error::IllegalMasterSlaveSwitch));
        }
        self.role = Role::Slave;
        let (n, _) = self.rec_out_core(out, Some(info.operation))?;
        Ok(n)
    }

    /// Background noise only; used by hosts to prime the device without
    /// consuming packets.
    pub fn rec_out_background_noise(&mut self, out: &mut [i16]) -> Result<usize, Error> {
        let spc = self.dsp.samples_per_call();
        if out.len() < spc {
            return Err(self.latch(Error::FaultyInstruction));
        }
        while self.dsp.sync.pending() < spc {
            self.dsp.bgn_only_call();
        }
        let n = self.dsp.read(&mut out[..spc]);
        Ok(n)
    }

    fn rec_out_core(
        &mut self,
        out: &mut [i16],
        op_override: Option<Operation>,
    ) -> Result<(usize, Option<Operation>), Error> {
        let spc = self.dsp.samples_per_call();
        if out.len() < spc {
            return Err(self.latch(Error::FaultyInstruction));
        }
        self.automode.on_recout(spc as u32);
        self.receive_clock = self.receive_clock.wrapping_add(spc as u32);
        self.report_span_ts = self.report_span_ts.wrapping_add(spc as u32);

        let mut last_op = None;
        let mut guard = 0;
        while self.dsp.sync.pending() < spc {
            guard += 1;
            if guard > MAX_OPS_PER_CALL {
                out[..spc].fill(0);
                return Err(self.latch(Error::SampleUnderrun));
            }
            let op = match op_override {
                Some(master_op) => self.adapt_master_op(master_op),
                None => self.decide(),
            };
            last_op = Some(op);
            self.execute(op).map_err(|e| self.latch(e))?;
        }

        let n = self.dsp.read(&mut out[..spc]);
        debug_assert_eq!(n, spc);
        Ok((n, last_op))
    }

    fn decide(&mut self) -> Operation {
        let plen = self.packet_len_samples;
        let next = self.packet_buffer.peek_next().map(|rec| NextPacket {
            timestamp: rec.timestamp,
            is_comfort_noise: self
                .resolve_kind(rec.payload_type)
                .map(|k| k.is_comfort_noise())
                .unwrap_or(false),
        });
        let target_samples = if plen > 0 {
            (self.automode.target_level_q8(plen, self.dsp.fs_hz()) * plen) >> 8
        } else {
            0
        };
        let input = DecisionInput {
            buffer_samples: self.packet_buffer.len() as u32 * plen
                + self.dsp.sync.pending() as u32,
            target_samples,
            packet_len_samples: plen,
            next_packet: next,
            playout_timestamp: self.dsp.sync.end_timestamp(),
            codec_internal_cng_active: self.cng_active,
            playout_mode: self.playout_mode,
        };
        self.decision.decide(&input)
    }

    /// A slave cannot always follow the master literally: it may lack the
    /// packet the master decoded.
    fn adapt_master_op(&self, master_op: Operation) -> Operation {
        match master_op {
            Operation::Normal
            | Operation::Merge
            | Operation::Accelerate
            | Operation::FastAccelerate
            | Operation::PreemptiveExpand
            | Operation::Rfc3389Cng => {
                if self.packet_buffer.is_empty() {
                    Operation::Expand
                } else {
                    master_op
                }
            }
            other => other,
        }
    }

    fn execute(&mut self, op: Operation) -> Result<(), Error> {
        match op {
            Operation::Expand => {
                self.dsp.expand_call();
                Ok(())
            }
            Operation::CodecInternalCng => {
                self.dsp.cng_call(None, true);
                Ok(())
            }
            Operation::Rfc3389Cng => self.execute_cng(),
            Operation::Normal
            | Operation::Merge
            | Operation::Accelerate
            | Operation::FastAccelerate
            | Operation::PreemptiveExpand => self.execute_packet_op(op),
        }
    }

    fn execute_cng(&mut self) -> Result<(), Error> {
        let mut payload = std::mem::take(&mut self.payload_scratch);
        let extracted = self.packet_buffer.extract_next(&mut payload);
        if let Ok((record, len)) = extracted {
            // RFC 3389 SID: first byte is the noise level in -dBov.
            if len > 0 {
                self.dsp.bgn.set_level_dbov(payload[0] & 0x7F);
            }
            if let Some(desc) = self.codec_db.lookup_payload_mut(record.payload_type) {
                // Let a registered CNG decoder track the SID too.
                let mut sink = [0i16; 0];
                let _ = desc.decoder.decode(&payload[..len], &mut sink);
            }
            let end = self.dsp.sync.end_timestamp();
            if (record.timestamp.wrapping_sub(end) as i32) > 0 {
                self.dsp.sync.set_end_timestamp(record.timestamp);
            }
        }
        self.payload_scratch = payload;
        self.cng_active = true;
        self.dsp.cng_call(None, false);
        Ok(())
    }

    fn execute_packet_op(&mut self, op: Operation) -> Result<(), Error> {
        let mut payload = std::mem::take(&mut self.payload_scratch);
        let extracted = self.packet_buffer.extract_next(&mut payload);
        let (record, payload_len) = match extracted {
            Ok(v) => v,
            Err(_) => {
                self.payload_scratch = payload;
                tracing::warn!("decision wanted a packet but the buffer is empty");
                self.dsp.expand_call();
                return Ok(());
            }
        };
        self.record_waiting_time(&record);

        let mut decoded = std::mem::take(&mut self.decoded_scratch);
        let decode_result = self.decode_packet(&record, &payload[..payload_len], &mut decoded);
        self.payload_scratch = payload;

        let samples = match decode_result {
            Ok(n) => n,
            Err(Error::DecodedTooMuch) => {
                self.decoded_scratch = decoded;
                return Err(Error::DecodedTooMuch);
            }
            Err(err) => {
                // Never propagate a decoder failure to the device.
                self.decoded_scratch = decoded;
                self.last_error = Some(err);
                tracing::warn!(error = %err, seq = record.sequence_number, "decode failed, concealing");
                self.dsp.expand_call();
                return Ok(());
            }
        };

        self.cng_active = false;
        if samples > 0 {
            self.packet_len_samples = samples as u32;
        }

        if let Some(vad) = self.vad.as_mut() {
            let active = vad.is_active(&decoded[..samples], self.dsp.fs_hz());
            self.dsp.set_vad_passive(!active);
        }

        let end = self.dsp.sync.end_timestamp();
        let ts_diff = record.timestamp.wrapping_sub(end) as i32;
        let new_end = record.timestamp.wrapping_add(samples as u32);

        match op {
            Operation::Normal | Operation::Merge => {
                let was_concealing = self.dsp.expand.is_active();
                if ts_diff > 0 {
                    // Bridge the gap with concealment, then splice.
                    self.dsp.expand_fill(ts_diff as usize);
                }
                let skip = if ts_diff < 0 {
                    ((-ts_diff) as usize).min(samples)
                } else {
                    0
                };
                if skip >= samples {
                    // Entirely played out already; just move the clock if
                    // the packet reaches past it.
                    if rtp::timestamp_older(end, new_end) {
                        self.dsp.sync.set_end_timestamp(new_end);
                    }
                } else {
                    let mode = if op == Operation::Merge || was_concealing {
                        DspMode::Merge
                    } else {
                        DspMode::Normal
                    };
                    self.dsp.decode_append(&decoded[skip..samples], new_end, mode);
                }
            }
            Operation::Accelerate | Operation::FastAccelerate => {
                if ts_diff > 0 {
                    self.dsp.expand_fill(ts_diff as usize);
                }
                self.dsp.accelerate_append(&decoded[..samples], new_end);
            }
            Operation::PreemptiveExpand => {
                if ts_diff > 0 {
                    self.dsp.expand_fill(ts_diff as usize);
                }
                self.dsp.preemptive_append(&decoded[..samples], new_end);
            }
            _ => {
                // Bug trap: a non-packet operation reached the packet path.
                self.decoded_scratch = decoded;
                return Err(Error::UnknownBufstatDecision);
            }
        }

        self.decoded_scratch = decoded;
        Ok(())
    }

    fn decode_packet(
        &mut self,
        record: &PacketRecord,
        payload: &[u8],
        decoded: &mut [i16],
    ) -> Result<usize, Error> {
        let desc = self
            .codec_db
            .lookup_payload_mut(record.payload_type)
            .ok_or(Error::Decoding)?;
        let result = if record.redundancy_level > 0 {
            match desc.decoder.decode_rcu(payload, decoded) {
                Some(r) => r,
                None => desc.decoder.decode(payload, decoded),
            }
        } else {
            desc.decoder.decode(payload, decoded)
        };
        match result {
            Ok(n) if n <= decoded.len() => Ok(n),
            Ok(_) => Err(Error::DecodedTooMuch),
            Err(code) => {
                let codec_code = desc.decoder.error_code().unwrap_or(code);
                tracing::warn!(codec_code, "decoder reported an error");
                Err(Error::Decoding)
            }
        }
    }

    fn record_waiting_time(&mut self, record: &PacketRecord) {
        let fs = self.dsp.fs_hz().max(1);
        let waited = self.receive_clock.wrapping_sub(record.receive_timestamp);
        let ms = ((waited as u64) * 1000 / fs as u64).min(u16::MAX as u64) as u16;
        self.waiting_times_ms[self.waiting_times_idx] = ms;
        self.waiting_times_idx = (self.waiting_times_idx + 1) % WAITING_TIMES_LEN;
        self.waiting_times_len = (self.waiting_times_len + 1).min(WAITING_TIMES_LEN);
    }

    // -----------------------------------------------------------------------
    // Queries and knobs
    // -----------------------------------------------------------------------

    /// Classification of the audio from the latest `rec_out`.
    pub fn output_type(&self) -> OutputType {
        self.dsp.output_type()
    }

    /// Timestamp of the most recent output sample, in wire clock units.
    pub fn playout_timestamp(&self) -> u32 {
        let (num, _) = self
            .current_kind
            .map(|k| k.timestamp_scale())
            .unwrap_or((1, 1));
        let internal = self.dsp.sync.playout_timestamp();
        if num > 1 {
            internal / num
        } else {
            internal
        }
    }

    pub fn flush_buffers(&mut self) {
        self.packet_buffer.flush();
        self.dsp.flush();
        self.first_packet = true;
        tracing::debug!("buffers flushed");
    }

    pub fn set_playout_mode(&mut self, mode: PlayoutMode) {
        self.playout_mode = mode;
    }

    pub fn playout_mode(&self) -> PlayoutMode {
        self.playout_mode
    }

    /// Extra fixed delay on top of the adaptive target, 0..=1000 ms.
    pub fn set_extra_delay_ms(&mut self, delay_ms: u32) -> Result<(), Error> {
        if delay_ms > 1000 {
            return Err(self.latch(Error::FaultyDelayValue));
        }
        self.automode.set_extra_delay_ms(delay_ms);
        Ok(())
    }

    pub fn set_background_noise_mode(&mut self, mode: crate::dsp::expand::BgnMode) {
        self.dsp.bgn.mode = mode;
    }

    pub fn background_noise_mode(&self) -> crate::dsp::expand::BgnMode {
        self.dsp.bgn.mode
    }

    /// Enable or disable telephone-event (RFC 4733) playout.
    pub fn set_avt_playout(&mut self, on: bool) {
        self.avt_playout = on;
    }

    pub fn set_vad(&mut self, mut vad: Box<dyn PostDecodeVad>) {
        vad.init(self.dsp.fs_hz());
        self.vad = Some(vad);
    }

    pub fn set_vad_mode(&mut self, mode: i32) -> Result<(), Error> {
        match self.vad.as_mut() {
            Some(vad) => {
                vad.set_mode(mode);
                Ok(())
            }
            None => Err(self.latch(Error::FaultyInstruction)),
        }
    }

    /// In-call statistics; resets the measurement interval.
    pub fn network_statistics(&mut self) -> NetworkStatistics {
        let fs = self.dsp.fs_hz().max(1);
        let plen = self.packet_len_samples;
        let buffered =
            self.packet_buffer.len() as u32 * plen + self.dsp.sync.pending() as u32;
        let current_buffer_size_ms = ((buffered as u64) * 1000 / fs as u64) as u16;

        let preferred_buffer_size_ms = if plen > 0 {
            let target_q8 = self.automode.target_level_q8(plen, fs) as u64;
            (target_q8 * plen as u64 * 1000 / 256 / fs as u64) as u16
        } else {
            0
        };

        let span = self.report_span_ts as u64;
        let dsp_stats = self.dsp.take_stats();
        let discarded = (self.packet_buffer.discarded_packets()
            + self.packet_buffer.discarded_duplicates()
            + self.discarded_late) as u64
            * plen as u64;

        let stats = NetworkStatistics {
            current_buffer_size_ms,
            preferred_buffer_size_ms,
            packet_loss_rate_q14: ratio_q14(dsp_stats.expand_samples as u64, span),
            packet_discard_rate_q14: ratio_q14(discarded, span),
            expand_rate_q14: ratio_q14(dsp_stats.expand_samples as u64, span),
            accelerate_rate_q14: ratio_q14(dsp_stats.accelerate_samples as u64, span),
            preemptive_rate_q14: ratio_q14(dsp_stats.preemptive_samples as u64, span),
        };

        self.report_span_ts = 0;
        self.discarded_late = 0;
        self.packet_buffer.reset_discard_counters();
        stats
    }

    /// RTCP receiver report data; with `reset` the fraction-lost interval
    /// baseline moves to now.
    pub fn rtcp_statistics(&mut self, reset: bool) -> RtcpReport {
        self.rtcp.report(reset)
    }

    /// Per-packet buffer waiting times in ms since the last query,
    /// oldest first. Resets on read.
    pub fn raw_waiting_times(&mut self) -> Vec<u16> {
        let len = self.waiting_times_len;
        let mut out = Vec::with_capacity(len);
        let start = (self.waiting_times_idx + WAITING_TIMES_LEN - len) % WAITING_TIMES_LEN;
        for i in 0..len {
            out.push(self.waiting_times_ms[(start + i) % WAITING_TIMES_LEN]);
        }
        self.waiting_times_len = 0;
        self.waiting_times_idx = 0;
        out
    }

    /// Packets dropped by the buffer (eviction + duplicates) since the
    /// last statistics reset.
    pub fn discarded_packets(&self) -> u32 {
        self.packet_buffer.discarded_packets()
            + self.packet_buffer.discarded_duplicates()
            + self.discarded_late
    }

    /// The most recent error, if any. Idempotent.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    /// Negated numeric code of the most recent error, 0 when clean
    /// (legacy error-slot convention).
    pub fn last_error_code(&self) -> i32 {
        self.last_error.map(|e| -e.code()).unwrap_or(0)
    }

    fn latch(&mut self, err: Error) -> Error {
        self.last_error = Some(err);
        err
    }
}

fn ratio_q14(numerator: u64, denominator: u64) -> u16 {
    if numerator == 0 {
        0
    } else if denominator == 0 || numerator >= denominator {
        1 << 14
    } else {
        ((numerator << 14) / denominator) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::g711::{linear_to_ulaw, G711Decoder, Law};

    fn engine() -> NetEq {
        let mut engine = NetEq::new(Config::default()).unwrap();
        engine
            .register_decoder(
                CodecKind::PcmU,
                0,
                8000,
                Box::new(G711Decoder::new(Law::ULaw)),
            )
            .unwrap();
        engine
    }

    fn ulaw_packet(seq: u16, ts: u32) -> Vec<u8> {
        let samples: Vec<i16> = (0..160)
            .map(|i| ((i as i32 * 400) % 8000 - 4000) as i16)
            .collect();
        let payload: Vec<u8> = samples.iter().map(|&s| linear_to_ulaw(s)).collect();
        rtp::encode(0, seq, ts, 0xABCD, &payload)
    }

    #[test]
    fn test_recin_unknown_payload_latches_error() {
        let mut engine = engine();
        let pkt = rtp::encode(96, 0, 0, 1, &[0u8; 10]);
        assert_eq!(engine.rec_in(&pkt, 0).unwrap_err(), Error::UnknownPayload);
        assert_eq!(engine.last_error_code(), -3002);
    }

    #[test]
    fn test_steady_flow_is_normal_speech() {
        let mut engine = engine();
        let mut out = [0i16; 80];
        for i in 0..20u32 {
            engine.rec_in(&ulaw_packet(i as u16, i * 160), i * 160).unwrap();
            for _ in 0..2 {
                assert_eq!(engine.rec_out(&mut out).unwrap(), 80);
            }
            if i > 0 {
                assert_eq!(engine.output_type(), OutputType::NormalSpeech);
            }
        }
        assert_eq!(engine.discarded_packets(), 0);
        assert_eq!(engine.last_error_code(), 0);
    }

    #[test]
    fn test_empty_buffer_expands() {
        let mut engine = engine();
        let mut out = [0i16; 80];
        assert_eq!(engine.rec_out(&mut out).unwrap(), 80);
        assert_eq!(engine.output_type(), OutputType::Plc);
    }

    #[test]
    fn test_output_buffer_too_small() {
        let mut engine = engine();
        let mut out = [0i16; 10];
        assert_eq!(
            engine.rec_out(&mut out).unwrap_err(),
            Error::FaultyInstruction
        );
    }

    #[test]
    fn test_remove_active_codec_then_recout_conceals() {
        let mut engine = engine();
        let mut out = [0i16; 80];
        engine.rec_in(&ulaw_packet(0, 0), 0).unwrap();
        engine.rec_out(&mut out).unwrap();

        engine.rec_in(&ulaw_packet(1, 160), 160).unwrap();
        engine.remove_decoder(CodecKind::PcmU).unwrap();
        // Packet for the removed codec is still buffered; output falls
        // back to concealment instead of crashing.
        for _ in 0..4 {
            assert_eq!(engine.rec_out(&mut out).unwrap(), 80);
        }
        assert_eq!(engine.output_type(), OutputType::Plc);
    }

    #[test]
    fn test_master_slave_role_latch() {
        let mut master = engine();
        let mut slave = engine();
        let mut info = MasterSlaveInfo::default();
        let mut out = [0i16; 80];

        master.rec_out_master(&mut out, &mut info).unwrap();
        slave.rec_out_slave(&mut out, &info).unwrap();

        // Switching roles without init is illegal.
        assert_eq!(
            master.rec_out_slave(&mut out, &info).unwrap_err(),
            Error::IllegalMasterSlaveSwitch
        );
        assert_eq!(
            slave.rec_out_master(&mut out, &mut info).unwrap_err(),
            Error::IllegalMasterSlaveSwitch
        );

        // After init the roles may swap.
        master.init(8000).unwrap();
        master.rec_out_slave(&mut out, &info).unwrap();
    }

    #[test]
    fn test_extra_delay_validation() {
        let mut engine = engine();
        engine.set_extra_delay_ms(100).unwrap();
        assert_eq!(
            engine.set_extra_delay_ms(1500).unwrap_err(),
            Error::FaultyDelayValue
        );
        assert_eq!(engine.last_error().unwrap().name(), "FAULTY_DELAYVALUE");
    }

    #[test]
    fn test_recommended_buffer_size_multipliers() {
        let codecs = [CodecKind::PcmU];
        let (p1, b1) = NetEq::recommended_buffer_size(&codecs, NetworkType::UdpNormal);
        let (p20, b20) = NetEq::recommended_buffer_size(&codecs, NetworkType::TcpXLargeJitter);
        assert_eq!(p20, p1 * 20);
        assert_eq!(b20, b1 * 20);
    }

    #[test]
    fn test_waiting_times_reset_on_read() {
        let mut engine = engine();
        let mut out = [0i16; 80];
        engine.rec_in(&ulaw_packet(0, 0), 0).unwrap();
        engine.rec_out(&mut out).unwrap();
        let times = engine.raw_waiting_times();
        assert_eq!(times.len(), 1);
        assert!(engine.raw_waiting_times().is_empty());
    }

    #[test]
    fn test_flush_buffers_restarts_stream() {
        let mut engine = engine();
        let mut out = [0i16; 80];
        engine.rec_in(&ulaw_packet(0, 0), 0).unwrap();
        engine.rec_out(&mut out).unwrap();
        engine.flush_buffers();

        // A stream at a totally different timestamp base plays normally.
        engine.rec_in(&ulaw_packet(1000, 999_000), 999_000).unwrap();
        engine.rec_out(&mut out).unwrap();
        engine.rec_out(&mut out).unwrap();
        assert_eq!(engine.output_type(), OutputType::NormalSpeech);
    }
}
