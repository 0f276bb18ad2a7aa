//! Adaptive receive-side jitter buffer and audio concealment engine.
//!
//! The engine accepts RTP audio packets arriving at irregular times and
//! produces a continuous, fixed-cadence stream of 16-bit PCM for the audio
//! device, hiding loss and absorbing jitter while keeping mouth-to-ear
//! delay low. Decoders are external plug-ins registered per payload type;
//! the engine itself opens no sockets, spawns no threads and allocates
//! only at construction.
//!
//! ```no_run
//! use neteq::codec::g711::{G711Decoder, Law};
//! use neteq::{CodecKind, Config, NetEq};
//!
//! let mut engine = NetEq::new(Config::default()).unwrap();
//! engine
//!     .register_decoder(CodecKind::PcmU, 0, 8000, Box::new(G711Decoder::new(Law::ULaw)))
//!     .unwrap();
//!
//! // Network side: feed datagrams as they arrive.
//! // engine.rec_in(&datagram, receive_timestamp)?;
//!
//! // Device side: pull 10 ms of audio every 10 ms.
//! let mut frame = [0i16; 80];
//! engine.rec_out(&mut frame).unwrap();
//! ```

pub mod automode;
pub mod buffer;
pub mod codec;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod stats;
pub mod wire;

pub use automode::{Operation, PlayoutMode};
pub use codec::{AudioDecoder, CodecKind};
pub use dsp::expand::BgnMode;
pub use dsp::OutputType;
pub use engine::{
    Config, MasterSlaveInfo, NetEq, NetworkStatistics, NetworkType, PostDecodeVad,
};
pub use error::Error;
pub use stats::RtcpReport;
pub use wire::rtcp::{CompoundBuilder, RtcpEvent, RtcpParser};
pub use wire::rtp::RtpPacket;

/// Engine version string.
pub const VERSION: &str = "3.3.0";

/// Engine version, fixed-length ASCII.
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_version_string() {
        assert_eq!(super::version(), "3.3.0");
        assert!(super::VERSION.len() < 11);
    }
}
