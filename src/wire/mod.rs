//! Wire formats: RTP packets and compound RTCP datagrams.
//!
//! Parsing never allocates and never panics on hostile input; payload
//! slices borrow from the caller's datagram buffer.

pub mod rtcp;
pub mod rtp;
