//! Engine error taxonomy.
//!
//! Every failure the engine can report has a stable numeric code, grouped by
//! thousands: 1xxx instance/config, 2xxx RecOut path, 3xxx RecIn path,
//! 4xxx packet buffer, 5xxx codec registry, 6xxx telephone events,
//! 7xxx RED/RTP parsing. The codes (and the legacy screaming-snake names
//! returned by [`Error::name`]) are wire-compatible with interoperating
//! diagnostics tooling, so they must not be renumbered.

use thiserror::Error;

/// Errors reported by the engine and its sub-components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    // --- 1xxx: instance / configuration ---
    #[error("faulty instruction")]
    FaultyInstruction,
    #[error("unknown network type")]
    FaultyNetworkType,
    #[error("extra delay out of range")]
    FaultyDelayValue,
    #[error("unknown playout mode")]
    FaultyPlayoutMode,
    #[error("instance corrupt")]
    CorruptInstance,
    #[error("master/slave role switch without re-init")]
    IllegalMasterSlaveSwitch,
    #[error("master/slave coordination error")]
    MasterSlave,

    // --- 2xxx: RecOut path ---
    #[error("playout decision not recognized")]
    UnknownBufstatDecision,
    #[error("decoder failed")]
    Decoding,
    #[error("could not produce requested samples")]
    SampleUnderrun,
    #[error("decoder produced more samples than the frame buffer holds")]
    DecodedTooMuch,

    // --- 3xxx: RecIn path ---
    #[error("comfort-noise packet could not be handled")]
    Cng,
    #[error("payload type not registered")]
    UnknownPayload,
    #[error("packet could not be inserted")]
    BufferInsert,

    // --- 4xxx: packet buffer ---
    #[error("packet buffer not usable")]
    PacketBufferInit,
    #[error("packet rejected by buffer")]
    PacketBufferInsert,
    #[error("unparsable G.723 header")]
    UnknownG723Header,
    #[error("no such packet in buffer")]
    NonexistingPacket,
    #[error("packet buffer not initialized")]
    PacketBufferNotInitialized,
    #[error("iLBC payload length matches no frame size")]
    AmbiguousIlbcFrameSize,

    // --- 5xxx: codec registry ---
    #[error("codec table full")]
    CodecDbFull,
    #[error("codec not found in table")]
    CodecDbNotExist,
    #[error("codec kind not recognized")]
    CodecDbUnknownCodec,
    #[error("payload type or codec kind already registered")]
    CodecDbPayloadTaken,
    #[error("codec kind not supported by this build")]
    CodecDbUnsupportedCodec,
    #[error("sample rate not supported")]
    CodecDbUnsupportedFs,

    // --- 6xxx: telephone events ---
    #[error("telephone-event parameter out of range")]
    DtmfParameter,
    #[error("telephone-event insert failed")]
    DtmfInsert,
    #[error("telephone-event generator lacks this sample rate")]
    DtmfUnknownSampleFreq,
    #[error("telephone events not supported")]
    DtmfNotSupported,

    // --- 7xxx: RED / RTP ---
    #[error("RED payload could not be split")]
    RedSplit,
    #[error("RTP packet too short")]
    RtpTooShort,
    #[error("RTP packet corrupt")]
    RtpCorrupt,
}

impl Error {
    /// Stable numeric code for this error.
    pub fn code(self) -> i32 {
        match self {
            Error::FaultyInstruction => 1001,
            Error::FaultyNetworkType => 1002,
            Error::FaultyDelayValue => 1003,
            Error::FaultyPlayoutMode => 1004,
            Error::CorruptInstance => 1005,
            Error::IllegalMasterSlaveSwitch => 1006,
            Error::MasterSlave => 1007,
            Error::UnknownBufstatDecision => 2001,
            Error::Decoding => 2002,
            Error::SampleUnderrun => 2003,
            Error::DecodedTooMuch => 2004,
            Error::Cng => 3001,
            Error::UnknownPayload => 3002,
            Error::BufferInsert => 3003,
            Error::PacketBufferInit => 4001,
            Error::PacketBufferInsert => 4002,
            Error::UnknownG723Header => 4007,
            Error::NonexistingPacket => 4008,
            Error::PacketBufferNotInitialized => 4009,
            Error::AmbiguousIlbcFrameSize => 4010,
            Error::CodecDbFull => 5001,
            Error::CodecDbNotExist => 5002,
            Error::CodecDbUnknownCodec => 5006,
            Error::CodecDbPayloadTaken => 5007,
            Error::CodecDbUnsupportedCodec => 5008,
            Error::CodecDbUnsupportedFs => 5009,
            Error::DtmfParameter => 6001,
            Error::DtmfInsert => 6002,
            Error::DtmfUnknownSampleFreq => 6003,
            Error::DtmfNotSupported => 6004,
            Error::RedSplit => 7001,
            Error::RtpTooShort => 7003,
            Error::RtpCorrupt => 7004,
        }
    }

    /// Legacy identifier for this error, as used in log files and
    /// cross-implementation bug reports.
    pub fn name(self) -> &'static str {
        match self {
            Error::FaultyInstruction => "FAULTY_INSTRUCTION",
            Error::FaultyNetworkType => "FAULTY_NETWORK_TYPE",
            Error::FaultyDelayValue => "FAULTY_DELAYVALUE",
            Error::FaultyPlayoutMode => "FAULTY_PLAYOUTMODE",
            Error::CorruptInstance => "CORRUPT_INSTANCE",
            Error::IllegalMasterSlaveSwitch => "ILLEGAL_MASTER_SLAVE_SWITCH",
            Error::MasterSlave => "MASTER_SLAVE_ERROR",
            Error::UnknownBufstatDecision => "UNKNOWN_BUFSTAT_DECISION",
            Error::Decoding => "RECOUT_ERROR_DECODING",
            Error::SampleUnderrun => "RECOUT_ERROR_SAMPLEUNDERRUN",
            Error::DecodedTooMuch => "RECOUT_ERROR_DECODED_TOO_MUCH",
            Error::Cng => "RECIN_CNG_ERROR",
            Error::UnknownPayload => "RECIN_UNKNOWNPAYLOAD",
            Error::BufferInsert => "RECIN_BUFFERINSERT_ERROR",
            Error::PacketBufferInit => "PBUFFER_INIT_ERROR",
            Error::PacketBufferInsert => "PBUFFER_INSERT_ERROR",
            Error::UnknownG723Header => "UNKNOWN_G723_HEADER",
            Error::NonexistingPacket => "PBUFFER_NONEXISTING_PACKET",
            Error::PacketBufferNotInitialized => "PBUFFER_NOT_INITIALIZED",
            Error::AmbiguousIlbcFrameSize => "AMBIGUOUS_ILBC_FRAME_SIZE",
            Error::CodecDbFull => "CODEC_DB_FULL",
            Error::CodecDbNotExist => "CODEC_DB_NOT_EXIST",
            Error::CodecDbUnknownCodec => "CODEC_DB_UNKNOWN_CODEC",
            Error::CodecDbPayloadTaken => "CODEC_DB_PAYLOAD_TAKEN",
            Error::CodecDbUnsupportedCodec => "CODEC_DB_UNSUPPORTED_CODEC",
            Error::CodecDbUnsupportedFs => "CODEC_DB_UNSUPPORTED_FS",
            Error::DtmfParameter => "DTMF_DEC_PARAMETER_ERROR",
            Error::DtmfInsert => "DTMF_INSERT_ERROR",
            Error::DtmfUnknownSampleFreq => "DTMF_GEN_UNKNOWN_SAMP_FREQ",
            Error::DtmfNotSupported => "DTMF_NOT_SUPPORTED",
            Error::RedSplit => "RED_SPLIT_ERROR",
            Error::RtpTooShort => "RTP_TOO_SHORT_PACKET",
            Error::RtpCorrupt => "RTP_CORRUPT_PACKET",
        }
    }
}
