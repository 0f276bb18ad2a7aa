//! RTCP compound packet parsing and building.
//!
//! Covers RFC 3550 (SR/RR/SDES/BYE/APP), RFC 5450 (IJ), RFC 4585 (RTPFB
//! NACK, PSFB PLI/SLI/RPSI), RFC 5104 (TMMBR/TMMBN/FIR), RFC 3611 §4.7
//! (XR VoIP metric) and the REMB application feedback message.
//!
//! The parser is a single owning iterator over a borrowed datagram. Each
//! call to `next()` yields one typed event; item states (report blocks,
//! SDES chunks, NACK entries, ...) yield one repetition per call and fall
//! back to the top level when their packet is exhausted. A malformed
//! compound makes the iterator terminal; it never panics.
//!
//! Common header (4 octets) for every sub-packet:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|    IC   |      PT       |             length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

/// RTCP packet types (RFC 3550 section 12.1 and extensions).
pub const PT_IJ: u8 = 195;
pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;
pub const PT_APP: u8 = 204;
pub const PT_RTPFB: u8 = 205;
pub const PT_PSFB: u8 = 206;
pub const PT_XR: u8 = 207;

/// SDES item types.
const SDES_CNAME: u8 = 1;

/// Per-item payload caps, matching the wire-format limits.
const RPSI_DATA_SIZE: usize = 30;
const APP_ITEM_DATA_SIZE: usize = 32;

/// Check whether a UDP payload looks like RTCP (demux from RTP on the same
/// port): byte 1 carries the packet type, 195 or 200..=207 for the types
/// we know.
pub fn is_rtcp_packet(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    let pt = data[1];
    pt == PT_IJ || (PT_SR..=PT_XR).contains(&pt)
}

/// Sender-report fixed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenderInfo {
    pub sender_ssrc: u32,
    pub ntp_most_significant: u32,
    pub ntp_least_significant: u32,
    pub rtp_timestamp: u32,
    pub sender_packet_count: u32,
    pub sender_octet_count: u32,
    pub report_block_count: u8,
}

/// One reception report block (RFC 3550 §6.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit cumulative loss as carried on the wire.
    pub cumulative_lost: u32,
    pub extended_highest_sequence: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

/// XR VoIP metrics block (RFC 3611 §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoipMetric {
    pub ssrc: u32,
    pub loss_rate: u8,
    pub discard_rate: u8,
    pub burst_density: u8,
    pub gap_density: u8,
    pub burst_duration: u16,
    pub gap_duration: u16,
    pub round_trip_delay: u16,
    pub end_system_delay: u16,
    pub signal_level: u8,
    pub noise_level: u8,
    pub rerl: u8,
    pub gmin: u8,
    pub r_factor: u8,
    pub ext_r_factor: u8,
    pub mos_lq: u8,
    pub mos_cq: u8,
    pub rx_config: u8,
    pub jb_nominal: u16,
    pub jb_max: u16,
    pub jb_abs_max: u16,
}

/// Typed events yielded by [`RtcpParser`]. Borrowed fields alias the
/// input datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpEvent<'a> {
    SenderReport(SenderInfo),
    ReceiverReport { sender_ssrc: u32, report_block_count: u8 },
    ReportBlock(ReportBlock),
    Sdes,
    SdesChunk { ssrc: u32, cname: &'a [u8] },
    Bye { ssrc: u32 },
    ExtendedJitter,
    ExtendedJitterItem { jitter: u32 },
    Nack { sender_ssrc: u32, media_ssrc: u32 },
    NackItem { packet_id: u16, bitmask: u16 },
    Tmmbr { sender_ssrc: u32, media_ssrc: u32 },
    TmmbrItem { ssrc: u32, max_bitrate_kbps: u32, measured_overhead: u16 },
    Tmmbn { sender_ssrc: u32, media_ssrc: u32 },
    TmmbnItem { ssrc: u32, max_bitrate_kbps: u32, measured_overhead: u16 },
    SrRequest,
    Pli { sender_ssrc: u32, media_ssrc: u32 },
    Sli { sender_ssrc: u32, media_ssrc: u32 },
    SliItem { first_mb: u16, number_of_mb: u16, picture_id: u8 },
    Rpsi { sender_ssrc: u32, media_ssrc: u32 },
    RpsiItem { payload_type: u8, bit_string: &'a [u8], valid_bits: u16 },
    Fir { sender_ssrc: u32, media_ssrc: u32 },
    FirItem { ssrc: u32, command_sequence_number: u8 },
    PsfbApp,
    Remb { bitrate_bps: u64 },
    App { subtype: u8, name: u32 },
    AppItem { data: &'a [u8] },
    VoipMetric(VoipMetric),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    TopLevel,
    ReportBlockItem,
    SdesChunk,
    ByeItem,
    ExtendedJitterItem,
    NackItem,
    TmmbrItem,
    TmmbnItem,
    SliItem,
    RpsiItem,
    FirItem,
    PsfbAppItem,
    RembItem,
    AppItem,
}

struct CommonHeader {
    count: u8,
    packet_type: u8,
    length_bytes: usize,
}

fn parse_common_header(data: &[u8]) -> Option<CommonHeader> {
    if data.len() < 4 {
        return None;
    }
    if data[0] >> 6 != 2 {
        return None;
    }
    let length_bytes = (u16::from_be_bytes([data[2], data[3]]) as usize + 1) * 4;
    Some(CommonHeader {
        count: data[0] & 0x1F,
        packet_type: data[1],
        length_bytes,
    })
}

/// Stateful iterator over a compound RTCP datagram.
pub struct RtcpParser<'a> {
    data: &'a [u8],
    pos: usize,
    block_end: usize,
    valid: bool,
    state: State,
    number_of_blocks: u8,
}

impl<'a> RtcpParser<'a> {
    /// Wrap a datagram. Unless `reduced_size` (RFC 5506) is enabled, the
    /// compound must open with an SR or RR or the parser is born terminal.
    pub fn new(data: &'a [u8], reduced_size: bool) -> Self {
        let valid = match parse_common_header(data) {
            Some(h) => reduced_size || h.packet_type == PT_SR || h.packet_type == PT_RR,
            None => false,
        };
        RtcpParser {
            data,
            pos: 0,
            block_end: 0,
            valid,
            state: State::TopLevel,
            number_of_blocks: 0,
        }
    }

    /// False once the compound has been rejected or exhausted.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn remaining_in_block(&self) -> usize {
        self.block_end.saturating_sub(self.pos)
    }

    fn end_current_block(&mut self) {
        self.pos = self.block_end;
    }

    fn back_to_top_level(&mut self) {
        self.state = State::TopLevel;
        self.end_current_block();
    }

    fn read_u8(&mut self) -> u8 {
        let v = self.data[self.pos];
        self.pos += 1;
        v
    }

    fn read_u16(&mut self) -> u16 {
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        v
    }

    fn read_u32(&mut self) -> u32 {
        let v = u32::from_be_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        v
    }

    fn iterate_top_level(&mut self) -> Option<RtcpEvent<'a>> {
        loop {
            let header = parse_common_header(&self.data[self.pos.min(self.data.len())..])?;
            let block_end = self.pos + header.length_bytes;
            if block_end > self.data.len() {
                // Bad block
                return None;
            }
            self.block_end = block_end;

            match header.packet_type {
                PT_SR => {
                    self.number_of_blocks = header.count;
                    return self.parse_sr();
                }
                PT_RR => {
                    self.number_of_blocks = header.count;
                    return self.parse_rr();
                }
                PT_SDES => {
                    self.number_of_blocks = header.count;
                    match self.parse_sdes() {
                        Some(ev) => return Some(ev),
                        None => continue,
                    }
                }
                PT_BYE => {
                    self.number_of_blocks = header.count;
                    match self.parse_bye() {
                        Some(ev) => return Some(ev),
                        None => continue,
                    }
                }
                PT_IJ => {
                    self.number_of_blocks = header.count;
                    return self.parse_ij();
                }
                PT_RTPFB | PT_PSFB => match self.parse_fb_common(&header) {
                    Some(ev) => return Some(ev),
                    None => continue,
                },
                PT_APP => match self.parse_app(&header) {
                    Some(ev) => return Some(ev),
                    None => continue,
                },
                PT_XR => match self.parse_xr() {
                    Some(ev) => return Some(ev),
                    None => continue,
                },
                _ => {
                    // Not supported; skip past the declared length.
                    self.end_current_block();
                }
            }
        }
    }

    fn parse_sr(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 28 {
            self.end_current_block();
            return None;
        }
        self.pos += 4; // skip header

        let info = SenderInfo {
            sender_ssrc: self.read_u32(),
            ntp_most_significant: self.read_u32(),
            ntp_least_significant: self.read_u32(),
            rtp_timestamp: self.read_u32(),
            sender_packet_count: self.read_u32(),
            sender_octet_count: self.read_u32(),
            report_block_count: self.number_of_blocks,
        };

        if self.number_of_blocks != 0 {
            self.state = State::ReportBlockItem;
        } else {
            self.state = State::TopLevel;
            self.end_current_block();
        }
        Some(RtcpEvent::SenderReport(info))
    }

    fn parse_rr(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 8 {
            return None;
        }
        self.pos += 4; // skip header
        let sender_ssrc = self.read_u32();
        let count = self.number_of_blocks;
        self.state = State::ReportBlockItem;
        Some(RtcpEvent::ReceiverReport {
            sender_ssrc,
            report_block_count: count,
        })
    }

    fn parse_report_block_item(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 24 || self.number_of_blocks == 0 {
            self.back_to_top_level();
            return None;
        }
        let ssrc = self.read_u32();
        let fraction_lost = self.read_u8();
        let cumulative_lost = ((self.read_u8() as u32) << 16)
            | ((self.read_u8() as u32) << 8)
            | self.read_u8() as u32;
        let block = ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost,
            extended_highest_sequence: self.read_u32(),
            jitter: self.read_u32(),
            last_sr: self.read_u32(),
            delay_since_last_sr: self.read_u32(),
        };
        self.number_of_blocks -= 1;
        Some(RtcpEvent::ReportBlock(block))
    }

    fn parse_ij(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 4 {
            return None;
        }
        self.pos += 4; // skip header
        self.state = State::ExtendedJitterItem;
        Some(RtcpEvent::ExtendedJitter)
    }

    fn parse_ij_item(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 4 || self.number_of_blocks == 0 {
            self.back_to_top_level();
            return None;
        }
        let jitter = self.read_u32();
        self.number_of_blocks -= 1;
        Some(RtcpEvent::ExtendedJitterItem { jitter })
    }

    fn parse_sdes(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 8 {
            self.back_to_top_level();
            return None;
        }
        self.pos += 4; // skip header
        self.state = State::SdesChunk;
        Some(RtcpEvent::Sdes)
    }

    fn parse_sdes_chunk(&mut self) -> Option<RtcpEvent<'a>> {
        if self.number_of_blocks == 0 {
            self.back_to_top_level();
            return None;
        }
        self.number_of_blocks -= 1;

        // Find the CNAME item in this chunk; CNAME is the only mandatory
        // item (RFC 3550 page 46) and the only one surfaced.
        while self.pos < self.block_end {
            if self.remaining_in_block() < 4 {
                self.back_to_top_level();
                return None;
            }
            let ssrc = self.read_u32();
            match self.parse_sdes_items() {
                SdesItems::Cname(cname) => return Some(RtcpEvent::SdesChunk { ssrc, cname }),
                SdesItems::NoCname => continue,
                SdesItems::Bad => return None,
            }
        }
        self.back_to_top_level();
        None
    }

    fn parse_sdes_items(&mut self) -> SdesItems<'a> {
        let data: &'a [u8] = self.data;
        let mut found: Option<&'a [u8]> = None;
        let mut item_octets_read = 0usize;

        while self.pos < self.block_end {
            let tag = self.read_u8();
            item_octets_read += 1;

            if tag == 0 {
                // End tag; items are 4-octet aligned.
                while item_octets_read % 4 != 0 && self.pos < self.block_end {
                    self.pos += 1;
                    item_octets_read += 1;
                }
                return match found {
                    Some(cname) => SdesItems::Cname(cname),
                    None => SdesItems::NoCname,
                };
            }

            if self.pos < self.block_end {
                let len = self.read_u8() as usize;
                item_octets_read += 1;

                if tag == SDES_CNAME {
                    if self.pos + len >= self.block_end {
                        self.back_to_top_level();
                        return SdesItems::Bad;
                    }
                    for &c in &data[self.pos..self.pos + len] {
                        if !(b' '..=b'{').contains(&c) || c == b'%' || c == b'\\' {
                            self.back_to_top_level();
                            return SdesItems::Bad;
                        }
                    }
                    found = Some(&data[self.pos..self.pos + len]);
                }

                self.pos += len;
                item_octets_read += len;
            }
        }

        // No end tag found
        self.back_to_top_level();
        SdesItems::Bad
    }

    fn parse_bye(&mut self) -> Option<RtcpEvent<'a>> {
        self.pos += 4; // skip header
        self.state = State::ByeItem;
        self.parse_bye_item()
    }

    fn parse_bye_item(&mut self) -> Option<RtcpEvent<'a>> {
        let length = self.remaining_in_block();
        if length < 4 || self.number_of_blocks == 0 {
            self.back_to_top_level();
            return None;
        }
        let ssrc = self.read_u32();
        // Several SSRCs may be attached; only the first is surfaced and the
        // rest are skipped wholesale.
        if length >= 4 * self.number_of_blocks as usize {
            self.pos += (self.number_of_blocks as usize - 1) * 4;
        }
        self.number_of_blocks = 0;
        Some(RtcpEvent::Bye { ssrc })
    }

    fn parse_xr(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 8 {
            self.end_current_block();
            return None;
        }
        self.pos += 4; // skip header
        let _originator_ssrc = self.read_u32();
        self.parse_xr_item()
    }

    fn parse_xr_item(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 4 {
            self.end_current_block();
            return None;
        }
        let block_type = self.read_u8();
        let type_specific = self.read_u8();
        let block_length = self.read_u16();

        if block_type == 7 && type_specific == 0 {
            if block_length != 8 {
                self.end_current_block();
                return None;
            }
            return self.parse_xr_voip_metric();
        }
        self.end_current_block();
        None
    }

    fn parse_xr_voip_metric(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 32 {
            self.end_current_block();
            return None;
        }
        let metric = VoipMetric {
            ssrc: self.read_u32(),
            loss_rate: self.read_u8(),
            discard_rate: self.read_u8(),
            burst_density: self.read_u8(),
            gap_density: self.read_u8(),
            burst_duration: self.read_u16(),
            gap_duration: self.read_u16(),
            round_trip_delay: self.read_u16(),
            end_system_delay: self.read_u16(),
            signal_level: self.read_u8(),
            noise_level: self.read_u8(),
            rerl: self.read_u8(),
            gmin: self.read_u8(),
            r_factor: self.read_u8(),
            ext_r_factor: self.read_u8(),
            mos_lq: self.read_u8(),
            mos_cq: self.read_u8(),
            rx_config: {
                let v = self.read_u8();
                self.pos += 1; // reserved
                v
            },
            jb_nominal: self.read_u16(),
            jb_max: self.read_u16(),
            jb_abs_max: self.read_u16(),
        };
        Some(RtcpEvent::VoipMetric(metric))
    }

    fn parse_fb_common(&mut self, header: &CommonHeader) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 12 {
            // 4 * 3, RFC 4585 section 6.1
            self.end_current_block();
            return None;
        }
        self.pos += 4; // skip header
        let sender_ssrc = self.read_u32();
        let media_ssrc = self.read_u32();

        if header.packet_type == PT_RTPFB {
            // Transport layer feedback; FMT selects the message.
            match header.count {
                1 => {
                    self.state = State::NackItem;
                    Some(RtcpEvent::Nack { sender_ssrc, media_ssrc })
                }
                3 => {
                    self.state = State::TmmbrItem;
                    Some(RtcpEvent::Tmmbr { sender_ssrc, media_ssrc })
                }
                4 => {
                    self.state = State::TmmbnItem;
                    Some(RtcpEvent::Tmmbn { sender_ssrc, media_ssrc })
                }
                5 => {
                    // Rapid synchronisation request; the FCI is empty, so
                    // no item state follows.
                    Some(RtcpEvent::SrRequest)
                }
                _ => {
                    self.end_current_block();
                    None
                }
            }
        } else {
            // Payload specific feedback
            match header.count {
                1 => Some(RtcpEvent::Pli { sender_ssrc, media_ssrc }),
                2 => {
                    self.state = State::SliItem;
                    Some(RtcpEvent::Sli { sender_ssrc, media_ssrc })
                }
                3 => {
                    self.state = State::RpsiItem;
                    Some(RtcpEvent::Rpsi { sender_ssrc, media_ssrc })
                }
                4 => {
                    self.state = State::FirItem;
                    Some(RtcpEvent::Fir { sender_ssrc, media_ssrc })
                }
                15 => {
                    self.state = State::PsfbAppItem;
                    Some(RtcpEvent::PsfbApp)
                }
                _ => {
                    self.end_current_block();
                    None
                }
            }
        }
    }

    fn parse_nack_item(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 4 {
            self.back_to_top_level();
            return None;
        }
        let packet_id = self.read_u16();
        let bitmask = self.read_u16();
        Some(RtcpEvent::NackItem { packet_id, bitmask })
    }

    /// TMMBR/TMMBN share the FCI layout (RFC 5104 4.2.1/4.2.2).
    fn parse_tmmb_item(&mut self) -> Option<(u32, u32, u16)> {
        if self.remaining_in_block() < 8 {
            self.back_to_top_level();
            return None;
        }
        let ssrc = self.read_u32();
        let b = [
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ];
        self.pos += 4;

        let exp = (b[0] >> 2) & 0x3F;
        let mantissa: u64 = (((b[0] as u64) & 0x03) << 15)
            | ((b[1] as u64) << 7)
            | (((b[2] as u64) >> 1) & 0x7F);
        let overhead = (((b[2] as u16) & 0x01) << 8) | b[3] as u16;

        let kbps = ((mantissa << exp) / 1000).min(u32::MAX as u64) as u32;
        Some((ssrc, kbps, overhead))
    }

    fn parse_sli_item(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 4 {
            self.back_to_top_level();
            return None;
        }
        let word = self.read_u32();
        Some(RtcpEvent::SliItem {
            first_mb: ((word >> 19) & 0x1FFF) as u16,
            number_of_mb: ((word >> 6) & 0x1FFF) as u16,
            picture_id: (word & 0x3F) as u8,
        })
    }

    fn parse_rpsi_item(&mut self) -> Option<RtcpEvent<'a>> {
        let length = self.remaining_in_block();
        if length < 4 || length > 2 + RPSI_DATA_SIZE {
            self.back_to_top_level();
            return None;
        }
        let data: &'a [u8] = self.data;
        let padding_bits = self.read_u8();
        let payload_type = self.read_u8();
        let bit_string = &data[self.pos..self.block_end];
        let valid_bits = ((length - 2) * 8) as u16 - padding_bits as u16;
        self.back_to_top_level();
        Some(RtcpEvent::RpsiItem {
            payload_type,
            bit_string,
            valid_bits,
        })
    }

    fn parse_fir_item(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 8 {
            self.back_to_top_level();
            return None;
        }
        let ssrc = self.read_u32();
        let command_sequence_number = self.read_u8();
        self.pos += 3; // reserved
        Some(RtcpEvent::FirItem {
            ssrc,
            command_sequence_number,
        })
    }

    fn parse_psfb_app_item(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 4 {
            self.back_to_top_level();
            return None;
        }
        for magic in *b"REMB" {
            if self.read_u8() != magic {
                self.back_to_top_level();
                return None;
            }
        }
        self.state = State::RembItem;
        self.parse_remb_item()
    }

    fn parse_remb_item(&mut self) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 4 {
            self.back_to_top_level();
            return None;
        }
        let num_ssrc = self.read_u8() as usize;
        let exp = (self.data[self.pos] >> 2) & 0x3F;
        let mantissa: u64 = (((self.data[self.pos] as u64) & 0x03) << 16)
            | ((self.data[self.pos + 1] as u64) << 8)
            | self.data[self.pos + 2] as u64;
        self.pos += 3;

        // The listed SSRCs are not needed for rate control.
        self.back_to_top_level();
        let _ = num_ssrc;
        Some(RtcpEvent::Remb {
            bitrate_bps: mantissa << exp,
        })
    }

    fn parse_app(&mut self, header: &CommonHeader) -> Option<RtcpEvent<'a>> {
        if self.remaining_in_block() < 12 {
            // 4 * 3, RFC 3550 6.7
            self.end_current_block();
            return None;
        }
        self.pos += 4; // skip header
        let _sender_ssrc = self.read_u32();
        let name = self.read_u32();
        self.state = State::AppItem;
        Some(RtcpEvent::App {
            subtype: header.count,
            name,
        })
    }

    fn parse_app_item(&mut self) -> Option<RtcpEvent<'a>> {
        let length = self.remaining_in_block();
        if length < 4 {
            self.back_to_top_level();
            return None;
        }
        let data: &'a [u8] = self.data;
        let take = length.min(APP_ITEM_DATA_SIZE);
        let chunk = &data[self.pos..self.pos + take];
        self.pos += take;
        Some(RtcpEvent::AppItem { data: chunk })
    }
}

enum SdesItems<'a> {
    Cname(&'a [u8]),
    NoCname,
    Bad,
}

impl<'a> Iterator for RtcpParser<'a> {
    type Item = RtcpEvent<'a>;

    fn next(&mut self) -> Option<RtcpEvent<'a>> {
        if !self.valid {
            return None;
        }
        let event = match self.state {
            State::TopLevel => self.iterate_top_level(),
            State::ReportBlockItem => self
                .parse_report_block_item()
                .or_else(|| self.iterate_top_level()),
            State::SdesChunk => self.parse_sdes_chunk().or_else(|| self.iterate_top_level()),
            State::ByeItem => self.parse_bye_item().or_else(|| self.iterate_top_level()),
            State::ExtendedJitterItem => {
                self.parse_ij_item().or_else(|| self.iterate_top_level())
            }
            State::NackItem => self.parse_nack_item().or_else(|| self.iterate_top_level()),
            State::TmmbrItem => match self.parse_tmmb_item() {
                Some((ssrc, kbps, oh)) => Some(RtcpEvent::TmmbrItem {
                    ssrc,
                    max_bitrate_kbps: kbps,
                    measured_overhead: oh,
                }),
                None => self.iterate_top_level(),
            },
            State::TmmbnItem => match self.parse_tmmb_item() {
                Some((ssrc, kbps, oh)) => Some(RtcpEvent::TmmbnItem {
                    ssrc,
                    max_bitrate_kbps: kbps,
                    measured_overhead: oh,
                }),
                None => self.iterate_top_level(),
            },
            State::SliItem => self.parse_sli_item().or_else(|| self.iterate_top_level()),
            State::RpsiItem => self.parse_rpsi_item().or_else(|| self.iterate_top_level()),
            State::FirItem => self.parse_fir_item().or_else(|| self.iterate_top_level()),
            State::PsfbAppItem => self
                .parse_psfb_app_item()
                .or_else(|| self.iterate_top_level()),
            State::RembItem => self.parse_remb_item().or_else(|| self.iterate_top_level()),
            State::AppItem => self.parse_app_item().or_else(|| self.iterate_top_level()),
        };
        if event.is_none() {
            // Terminal: exhausted or malformed.
            self.valid = false;
        }
        event
    }
}

// ---------------------------------------------------------------------------
// Compound builders
// ---------------------------------------------------------------------------

/// Incremental builder for a compound RTCP datagram.
///
/// Appends sub-packets in the order the methods are called; the caller is
/// responsible for compound rules (start with SR/RR unless reduced-size).
#[derive(Default)]
pub struct CompoundBuilder {
    buf: Vec<u8>,
}

impl CompoundBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header with a length placeholder; returns the patch position.
    fn push_header(&mut self, count: u8, packet_type: u8) -> usize {
        self.buf.push(0x80 | (count & 0x1F));
        self.buf.push(packet_type);
        let at = self.buf.len();
        self.buf.extend_from_slice(&[0, 0]);
        at
    }

    /// Patch a length field: words-minus-one from `start` (4 bytes before
    /// the patch position) to the current end.
    fn patch_length(&mut self, len_pos: usize) {
        let words = (self.buf.len() - (len_pos - 2)) / 4 - 1;
        self.buf[len_pos] = (words >> 8) as u8;
        self.buf[len_pos + 1] = words as u8;
    }

    fn push_report_block(&mut self, block: &ReportBlock) {
        self.buf.extend_from_slice(&block.ssrc.to_be_bytes());
        self.buf.push(block.fraction_lost);
        let cum = block.cumulative_lost & 0x00FF_FFFF;
        self.buf.push((cum >> 16) as u8);
        self.buf.push((cum >> 8) as u8);
        self.buf.push(cum as u8);
        self.buf
            .extend_from_slice(&block.extended_highest_sequence.to_be_bytes());
        self.buf.extend_from_slice(&block.jitter.to_be_bytes());
        self.buf.extend_from_slice(&block.last_sr.to_be_bytes());
        self.buf
            .extend_from_slice(&block.delay_since_last_sr.to_be_bytes());
    }

    pub fn sender_report(mut self, info: &SenderInfo, blocks: &[ReportBlock]) -> Self {
        let len_pos = self.push_header(blocks.len() as u8, PT_SR);
        self.buf.extend_from_slice(&info.sender_ssrc.to_be_bytes());
        self.buf
            .extend_from_slice(&info.ntp_most_significant.to_be_bytes());
        self.buf
            .extend_from_slice(&info.ntp_least_significant.to_be_bytes());
        self.buf.extend_from_slice(&info.rtp_timestamp.to_be_bytes());
        self.buf
            .extend_from_slice(&info.sender_packet_count.to_be_bytes());
        self.buf
            .extend_from_slice(&info.sender_octet_count.to_be_bytes());
        for block in blocks {
            self.push_report_block(block);
        }
        self.patch_length(len_pos);
        self
    }

    pub fn receiver_report(mut self, sender_ssrc: u32, blocks: &[ReportBlock]) -> Self {
        let len_pos = self.push_header(blocks.len() as u8, PT_RR);
        self.buf.extend_from_slice(&sender_ssrc.to_be_bytes());
        for block in blocks {
            self.push_report_block(block);
        }
        self.patch_length(len_pos);
        self
    }

    /// SDES with a single chunk carrying a CNAME item.
    pub fn sdes(mut self, ssrc: u32, cname: &str) -> Self {
        let start = self.buf.len();
        let len_pos = self.push_header(1, PT_SDES);
        self.buf.extend_from_slice(&ssrc.to_be_bytes());
        let cname = cname.as_bytes();
        self.buf.push(SDES_CNAME);
        self.buf.push(cname.len() as u8);
        self.buf.extend_from_slice(cname);
        self.buf.push(0); // end item
        while (self.buf.len() - start) % 4 != 0 {
            self.buf.push(0);
        }
        self.patch_length(len_pos);
        self
    }

    pub fn bye(mut self, ssrc: u32) -> Self {
        let len_pos = self.push_header(1, PT_BYE);
        self.buf.extend_from_slice(&ssrc.to_be_bytes());
        self.patch_length(len_pos);
        self
    }

    /// XR packet containing a single VoIP metrics block.
    pub fn xr_voip_metric(mut self, originator_ssrc: u32, metric: &VoipMetric) -> Self {
        let len_pos = self.push_header(0, PT_XR);
        self.buf.extend_from_slice(&originator_ssrc.to_be_bytes());
        self.buf.push(7); // BT = VoIP metrics
        self.buf.push(0); // reserved
        self.buf.extend_from_slice(&8u16.to_be_bytes()); // block length in words
        self.buf.extend_from_slice(&metric.ssrc.to_be_bytes());
        self.buf.push(metric.loss_rate);
        self.buf.push(metric.discard_rate);
        self.buf.push(metric.burst_density);
        self.buf.push(metric.gap_density);
        self.buf.extend_from_slice(&metric.burst_duration.to_be_bytes());
        self.buf.extend_from_slice(&metric.gap_duration.to_be_bytes());
        self.buf
            .extend_from_slice(&metric.round_trip_delay.to_be_bytes());
        self.buf
            .extend_from_slice(&metric.end_system_delay.to_be_bytes());
        self.buf.push(metric.signal_level);
        self.buf.push(metric.noise_level);
        self.buf.push(metric.rerl);
        self.buf.push(metric.gmin);
        self.buf.push(metric.r_factor);
        self.buf.push(metric.ext_r_factor);
        self.buf.push(metric.mos_lq);
        self.buf.push(metric.mos_cq);
        self.buf.push(metric.rx_config);
        self.buf.push(0); // reserved
        self.buf.extend_from_slice(&metric.jb_nominal.to_be_bytes());
        self.buf.extend_from_slice(&metric.jb_max.to_be_bytes());
        self.buf.extend_from_slice(&metric.jb_abs_max.to_be_bytes());
        self.patch_length(len_pos);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
