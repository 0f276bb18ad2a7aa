//! Decoder capability trait, codec descriptors and the payload registry.
//!
//! Decoders are external plug-ins. Each one is registered against a payload
//! type through [`CodecDb::add`]; the engine resolves payload → decoder both
//! at packet insert and at decode time. Optional abilities (RCU decode,
//! native PLC, late-packet injection, ...) are expressed as trait methods
//! returning `Option`, so a missing capability is an explicit `None` rather
//! than a null pointer the decode path has to trust.

use crate::error::Error;

pub mod g711;

/// The codec set the engine knows how to schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    /// G.711 mu-law
    PcmU,
    /// G.711 A-law
    PcmA,
    /// Linear PCM16, 8 kHz
    Pcm16b,
    /// Linear PCM16, 16 kHz
    Pcm16bWb,
    /// Linear PCM16, 32 kHz
    Pcm16bSwb32,
    G722,
    Ilbc,
    Isac,
    IsacSwb,
    /// RFC 3389 comfort noise, narrowband
    CnNb,
    CnWb,
    CnSwb,
    /// RFC 2198 redundancy framing (no decoder of its own)
    Red,
    /// RFC 4733 telephone events
    TelephoneEvent,
}

impl CodecKind {
    /// Native sample rate of the decoded audio.
    pub fn sample_rate_hz(self) -> u32 {
        match self {
            CodecKind::PcmU
            | CodecKind::PcmA
            | CodecKind::Pcm16b
            | CodecKind::Ilbc
            | CodecKind::CnNb
            | CodecKind::Red
            | CodecKind::TelephoneEvent => 8000,
            CodecKind::Pcm16bWb | CodecKind::G722 | CodecKind::Isac | CodecKind::CnWb => 16000,
            CodecKind::Pcm16bSwb32 | CodecKind::IsacSwb | CodecKind::CnSwb => 32000,
        }
    }

    /// True for RFC 3389 comfort-noise payloads.
    pub fn is_comfort_noise(self) -> bool {
        matches!(self, CodecKind::CnNb | CodecKind::CnWb | CodecKind::CnSwb)
    }

    pub fn is_red(self) -> bool {
        self == CodecKind::Red
    }

    pub fn is_telephone_event(self) -> bool {
        self == CodecKind::TelephoneEvent
    }

    /// RTP clock rate differs from the audio rate for some codecs; G.722
    /// famously ticks at 8 kHz on the wire while decoding to 16 kHz.
    pub fn timestamp_scale(self) -> (u32, u32) {
        match self {
            CodecKind::G722 => (2, 1),
            _ => (1, 1),
        }
    }
}

/// Decoder plug-in interface.
///
/// `decode` follows the classic convention: samples written on success, a
/// codec-specific negative error code on failure (retrievable later via
/// [`AudioDecoder::error_code`]).
pub trait AudioDecoder: Send {
    /// Reset internal state at stream start or after a flush.
    fn init(&mut self);

    /// Decode `encoded` into `out`, returning the number of samples written.
    fn decode(&mut self, encoded: &[u8], out: &mut [i16]) -> Result<usize, i32>;

    /// Reduced-quality decode of a redundant (RCU) block.
    fn decode_rcu(&mut self, _encoded: &[u8], _out: &mut [i16]) -> Option<Result<usize, i32>> {
        None
    }

    /// Codec-internal loss concealment: synthesize `frames` lost frames.
    fn decode_plc(&mut self, _out: &mut [i16], _frames: usize) -> Option<usize> {
        None
    }

    /// Hand a packet that arrived behind the playout point to the decoder.
    fn add_late_packet(&mut self, _encoded: &[u8]) -> Option<()> {
        None
    }

    /// Multiple-description info word, for codecs that carry one.
    fn md_info(&mut self) -> Option<i16> {
        None
    }

    /// Most recent pitch estimate in samples, for codecs that track one.
    fn pitch(&mut self) -> Option<i16> {
        None
    }

    /// Feed a payload fragment to the codec's bandwidth estimator.
    fn update_bandwidth_estimate(&mut self, _fragment: &[u8]) -> Option<()> {
        None
    }

    /// Codec-specific error code for the most recent decode failure.
    fn error_code(&mut self) -> Option<i32> {
        None
    }
}

/// One registry entry: a codec kind, its payload mapping and its decoder.
pub struct CodecDescriptor {
    pub kind: CodecKind,
    pub payload_type: u8,
    pub fs_hz: u32,
    pub decoder: Box<dyn AudioDecoder>,
}

/// Bounded payload-type registry.
///
/// At most one descriptor per payload type and one per codec kind. The
/// table is pre-sized; registration beyond capacity fails `CodecDbFull`.
pub struct CodecDb {
    entries: Vec<Option<CodecDescriptor>>,
}

impl CodecDb {
    pub fn new(max_entries: usize) -> Self {
        let mut entries = Vec::new();
        entries.resize_with(max_entries, || None);
        CodecDb { entries }
    }

    /// Register a decoder for `payload_type`.
    pub fn add(
        &mut self,
        kind: CodecKind,
        payload_type: u8,
        fs_hz: u32,
        decoder: Box<dyn AudioDecoder>,
    ) -> Result<(), Error> {
        if payload_type > 127 {
            return Err(Error::CodecDbUnsupportedCodec);
        }
        if !matches!(fs_hz, 8000 | 16000 | 32000 | 48000) {
            return Err(Error::CodecDbUnsupportedFs);
        }
        let taken = self.entries.iter().flatten().any(|entry| {
            entry.payload_type == payload_type || entry.kind == kind
        });
        if taken {
            return Err(Error::CodecDbPayloadTaken);
        }
        let free = self
            .entries
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(Error::CodecDbFull)?;
        *free = Some(CodecDescriptor {
            kind,
            payload_type,
            fs_hz,
            decoder,
        });
        tracing::debug!(?kind, payload_type, fs_hz, "codec registered");
        Ok(())
    }

    /// Unregister a codec kind.
    pub fn remove(&mut self, kind: CodecKind) -> Result<(), Error> {
        for slot in self.entries.iter_mut() {
            if slot.as_ref().map(|e| e.kind) == Some(kind) {
                *slot = None;
                tracing::debug!(?kind, "codec removed");
                return Ok(());
            }
        }
        Err(Error::CodecDbNotExist)
    }

    /// Drop every registration.
    pub fn reset(&mut self) {
        for slot in self.entries.iter_mut() {
            *slot = None;
        }
    }

    pub fn lookup_payload(&self, payload_type: u8) -> Option<&CodecDescriptor> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.payload_type == payload_type)
    }

    pub fn lookup_payload_mut(&mut self, payload_type: u8) -> Option<&mut CodecDescriptor> {
        self.entries
            .iter_mut()
            .flatten()
            .find(|e| e.payload_type == payload_type)
    }

    pub fn lookup_kind(&self, kind: CodecKind) -> Option<&CodecDescriptor> {
        self.entries.iter().flatten().find(|e| e.kind == kind)
    }

    /// (used entries, capacity)
    pub fn size_info(&self) -> (usize, usize) {
        let used = self.entries.iter().flatten().count();
        (used, self.entries.len())
    }

    /// Kind of the `index`-th registered codec, for enumeration.
    pub fn kind_at(&self, index: usize) -> Result<CodecKind, Error> {
        self.entries
            .iter()
            .flatten()
            .nth(index)
            .map(|e| e.kind)
            .ok_or(Error::CodecDbNotExist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use g711::{G711Decoder, Law};

    fn ulaw() -> Box<dyn AudioDecoder> {
        Box::new(G711Decoder::new(Law::ULaw))
    }

    fn alaw() -> Box<dyn AudioDecoder> {
        Box::new(G711Decoder::new(Law::ALaw))
    }

    #[test]
    fn test_add_lookup_remove() {
        let mut db = CodecDb::new(4);
        db.add(CodecKind::PcmU, 0, 8000, ulaw()).unwrap();
        assert_eq!(db.size_info(), (1, 4));
        assert_eq!(db.lookup_payload(0).unwrap().kind, CodecKind::PcmU);
        assert!(db.lookup_payload(8).is_none());
        assert_eq!(db.kind_at(0).unwrap(), CodecKind::PcmU);

        db.remove(CodecKind::PcmU).unwrap();
        assert!(db.lookup_payload(0).is_none());
        assert_eq!(db.remove(CodecKind::PcmU).unwrap_err(), Error::CodecDbNotExist);
    }

    #[test]
    fn test_duplicate_payload_rejected() {
        let mut db = CodecDb::new(4);
        db.add(CodecKind::PcmU, 0, 8000, ulaw()).unwrap();
        assert_eq!(
            db.add(CodecKind::PcmA, 0, 8000, alaw()).unwrap_err(),
            Error::CodecDbPayloadTaken
        );
        // Same kind under a different payload type is also one-per-kind.
        assert_eq!(
            db.add(CodecKind::PcmU, 96, 8000, ulaw()).unwrap_err(),
            Error::CodecDbPayloadTaken
        );
    }

    #[test]
    fn test_capacity_and_fs_checks() {
        let mut db = CodecDb::new(1);
        db.add(CodecKind::PcmU, 0, 8000, ulaw()).unwrap();
        assert_eq!(
            db.add(CodecKind::PcmA, 8, 8000, alaw()).unwrap_err(),
            Error::CodecDbFull
        );

        let mut db = CodecDb::new(1);
        assert_eq!(
            db.add(CodecKind::PcmU, 0, 11025, ulaw()).unwrap_err(),
            Error::CodecDbUnsupportedFs
        );
    }

    #[test]
    fn test_g722_timestamp_scale() {
        assert_eq!(CodecKind::G722.timestamp_scale(), (2, 1));
        assert_eq!(CodecKind::PcmU.timestamp_scale(), (1, 1));
    }
}
