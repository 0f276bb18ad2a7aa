//! End-to-end scenarios over the public engine API: steady flow, loss,
//! reordering, duplicates, buffer overflow, RED recovery and the RTCP
//! compound iterator.

use anyhow::Result;

use neteq::codec::g711::{linear_to_ulaw, G711Decoder, Law};
use neteq::wire::{rtcp, rtp};
use neteq::{
    AudioDecoder, CodecKind, CompoundBuilder, Config, MasterSlaveInfo, NetEq, OutputType,
    RtcpEvent, RtcpParser,
};

const SAMPLES_PER_PACKET: usize = 160; // 20 ms at 8 kHz
const SAMPLES_PER_TICK: usize = 80; // 10 ms at 8 kHz

fn new_engine() -> Result<NetEq> {
    let mut engine = NetEq::new(Config::default())?;
    engine.register_decoder(CodecKind::PcmU, 0, 8000, Box::new(G711Decoder::new(Law::ULaw)))?;
    Ok(engine)
}

/// A mu-law packet carrying a deterministic voiced waveform.
fn ulaw_packet(seq: u16, ts: u32) -> Vec<u8> {
    let payload: Vec<u8> = (0..SAMPLES_PER_PACKET)
        .map(|i| {
            let phase = ((ts as usize + i) % 80) as i32;
            let sample = if phase < 40 { phase * 200 - 4000 } else { 12000 - phase * 200 };
            linear_to_ulaw(sample as i16)
        })
        .collect();
    rtp::encode(0, seq, ts, 0x1234_5678, &payload)
}

#[test]
fn scenario_steady_stream() -> Result<()> {
    let mut engine = new_engine()?;
    let mut out = [0i16; SAMPLES_PER_TICK];

    for i in 0..1000u32 {
        engine.rec_in(&ulaw_packet(i as u16, i * 160), i * 160)?;
        for _ in 0..2 {
            let n = engine.rec_out(&mut out)?;
            assert_eq!(n, SAMPLES_PER_TICK);
        }
        if i > 1 {
            assert_eq!(
                engine.output_type(),
                OutputType::NormalSpeech,
                "tick for packet {} not normal",
                i
            );
        }
    }

    assert_eq!(engine.last_error_code(), 0);
    assert_eq!(engine.discarded_packets(), 0);
    let report = engine.rtcp_statistics(false);
    assert_eq!(report.cumulative_lost, 0);
    assert_eq!(report.jitter, 0);
    Ok(())
}

#[test]
fn scenario_one_lost_packet() -> Result<()> {
    let mut engine = new_engine()?;
    let mut out = [0i16; SAMPLES_PER_TICK];
    let mut saw_plc = false;

    for i in 0..40u32 {
        if i != 17 {
            engine.rec_in(&ulaw_packet(i as u16, i * 160), i * 160)?;
        }
        for _ in 0..2 {
            assert_eq!(engine.rec_out(&mut out)?, SAMPLES_PER_TICK);
            if engine.output_type() == OutputType::Plc {
                saw_plc = true;
            }
        }
    }

    assert!(saw_plc, "the gap must be concealed with expand output");
    // The stream recovers after the gap.
    assert_eq!(engine.output_type(), OutputType::NormalSpeech);

    let report = engine.rtcp_statistics(true);
    assert_eq!(report.cumulative_lost, 1);
    assert!(report.fraction_lost > 0, "fraction: {}", report.fraction_lost);
    Ok(())
}

#[test]
fn scenario_reorder_within_window() -> Result<()> {
    let mut in_order = new_engine()?;
    let mut reordered = new_engine()?;
    let mut out_a = [0i16; SAMPLES_PER_TICK];
    let mut out_b = [0i16; SAMPLES_PER_TICK];

    for i in 0..100u32 {
        match i {
            50 => {
                // Both packets land in the same inter-tick window, once in
                // order and once swapped.
                in_order.rec_in(&ulaw_packet(50, 50 * 160), 50 * 160)?;
                in_order.rec_in(&ulaw_packet(51, 51 * 160), 50 * 160)?;
                reordered.rec_in(&ulaw_packet(51, 51 * 160), 50 * 160)?;
                reordered.rec_in(&ulaw_packet(50, 50 * 160), 50 * 160)?;
            }
            51 => {}
            _ => {
                in_order.rec_in(&ulaw_packet(i as u16, i * 160), i * 160)?;
                reordered.rec_in(&ulaw_packet(i as u16, i * 160), i * 160)?;
            }
        }
        for _ in 0..2 {
            in_order.rec_out(&mut out_a)?;
            reordered.rec_out(&mut out_b)?;
            assert_eq!(out_a, out_b, "outputs diverged at packet {}", i);
        }
    }

    assert_eq!(reordered.discarded_packets(), 0);
    // The early arrival of seq 51 shows up as inter-arrival jitter.
    assert!(reordered.rtcp_statistics(false).jitter > 0);
    Ok(())
}

#[test]
fn scenario_duplicate_packet() -> Result<()> {
    let mut clean = new_engine()?;
    let mut duped = new_engine()?;
    let mut out_a = [0i16; SAMPLES_PER_TICK];
    let mut out_b = [0i16; SAMPLES_PER_TICK];

    for i in 0..60u32 {
        clean.rec_in(&ulaw_packet(i as u16, i * 160), i * 160)?;
        duped.rec_in(&ulaw_packet(i as u16, i * 160), i * 160)?;
        if i == 30 {
            duped.rec_in(&ulaw_packet(30, 30 * 160), 30 * 160)?;
        }
        for _ in 0..2 {
            clean.rec_out(&mut out_a)?;
            duped.rec_out(&mut out_b)?;
            assert_eq!(out_a, out_b, "duplicate changed the output at {}", i);
        }
    }

    assert_eq!(duped.discarded_packets(), 1);
    assert_eq!(clean.discarded_packets(), 0);
    Ok(())
}

#[test]
fn scenario_buffer_overflow() -> Result<()> {
    let config = Config {
        max_packets: 10,
        pool_bytes: 10 * 480,
        ..Config::default()
    };
    let mut engine = NetEq::new(config)?;
    engine.register_decoder(CodecKind::PcmU, 0, 8000, Box::new(G711Decoder::new(Law::ULaw)))?;

    // Eleven packets before any output: the oldest is evicted.
    for i in 0..11u32 {
        engine.rec_in(&ulaw_packet(i as u16, i * 160), i * 160)?;
    }
    assert_eq!(engine.discarded_packets(), 1);

    let mut out = [0i16; SAMPLES_PER_TICK];
    for _ in 0..22 {
        assert_eq!(engine.rec_out(&mut out)?, SAMPLES_PER_TICK);
    }
    // The evicted leader was bridged with concealment audio.
    let stats = engine.network_statistics();
    assert!(stats.expand_rate_q14 > 0, "no concealment recorded");
    assert_eq!(engine.last_error_code(), 0);
    Ok(())
}

#[test]
fn scenario_rtcp_compound_iteration() {
    let compound = CompoundBuilder::new()
        .receiver_report(
            0xAABB_CCDD,
            &[rtcp::ReportBlock {
                ssrc: 0x1111_2222,
                fraction_lost: 3,
                cumulative_lost: 7,
                extended_highest_sequence: 1234,
                jitter: 2,
                last_sr: 0,
                delay_since_last_sr: 0,
            }],
        )
        .sdes(0xAABB_CCDD, "voice@host")
        .bye(0xAABB_CCDD)
        .finish();

    let events: Vec<_> = RtcpParser::new(&compound, false).collect();
    assert_eq!(events.len(), 5);
    assert!(matches!(events[0], RtcpEvent::ReceiverReport { .. }));
    assert!(matches!(events[1], RtcpEvent::ReportBlock(_)));
    assert!(matches!(events[2], RtcpEvent::Sdes));
    assert!(matches!(events[3], RtcpEvent::SdesChunk { .. }));
    assert!(matches!(events[4], RtcpEvent::Bye { ssrc: 0xAABB_CCDD }));

    // Exhausted: the iterator is terminal.
    let mut parser = RtcpParser::new(&compound, false);
    for _ in 0..5 {
        parser.next();
    }
    assert_eq!(parser.next(), None);
    assert!(!parser.is_valid());
}

#[test]
fn scenario_timestamp_and_seqno_wrap() -> Result<()> {
    let mut engine = new_engine()?;
    let mut out = [0i16; SAMPLES_PER_TICK];
    let base_ts = 0xFFFF_FE00u32;
    let base_seq = 65530u16;

    for i in 0..20u32 {
        let ts = base_ts.wrapping_add(i * 160);
        engine.rec_in(&ulaw_packet(base_seq.wrapping_add(i as u16), ts), ts)?;
        for _ in 0..2 {
            assert_eq!(engine.rec_out(&mut out)?, SAMPLES_PER_TICK);
        }
        if i > 1 {
            assert_eq!(engine.output_type(), OutputType::NormalSpeech, "packet {}", i);
        }
    }

    assert_eq!(engine.discarded_packets(), 0);
    let report = engine.rtcp_statistics(false);
    // The sequence counter wrapped exactly once.
    assert_eq!(report.extended_highest_sequence >> 16, 1);
    assert_eq!(report.cumulative_lost, 0);
    Ok(())
}

/// Stand-in registered for the RED payload type; RED frames are split
/// before any decode, so this never runs.
struct RedStub;

impl AudioDecoder for RedStub {
    fn init(&mut self) {}
    fn decode(&mut self, _encoded: &[u8], _out: &mut [i16]) -> std::result::Result<usize, i32> {
        Err(-1)
    }
}

#[test]
fn scenario_red_recovers_lost_primary() -> Result<()> {
    let mut engine = new_engine()?;
    engine.register_decoder(CodecKind::Red, 127, 8000, Box::new(RedStub))?;
    let mut out = [0i16; SAMPLES_PER_TICK];
    let mut saw_plc = false;

    for i in 0..10u32 {
        match i {
            3 => {
                // The primary for seq 3 is lost; the next packet arrives
                // slightly early as RED, carrying seq 3 as redundancy
                // plus its own seq 4 primary.
                let lost = ulaw_packet(3, 3 * 160);
                let next = ulaw_packet(4, 4 * 160);
                let lost_payload = &lost[12..];
                let next_payload = &next[12..];

                let mut red = Vec::new();
                red.push(0x80); // F=1, pt=0
                let ts_off = 160u16;
                let len = lost_payload.len() as u16;
                red.push((ts_off >> 6) as u8);
                red.push((((ts_off & 0x3F) << 2) as u8) | ((len >> 8) as u8));
                red.push((len & 0xFF) as u8);
                red.push(0x00); // F=0, pt=0 (primary)
                red.extend_from_slice(lost_payload);
                red.extend_from_slice(next_payload);

                let datagram = rtp::encode(127, 4, 4 * 160, 0x1234_5678, &red);
                engine.rec_in(&datagram, 3 * 160)?;
            }
            4 => {} // already delivered inside the RED frame
            _ => engine.rec_in(&ulaw_packet(i as u16, i * 160), i * 160)?,
        }
        for _ in 0..2 {
            assert_eq!(engine.rec_out(&mut out)?, SAMPLES_PER_TICK);
            if engine.output_type() == OutputType::Plc {
                saw_plc = true;
            }
        }
    }

    // The redundancy filled the hole before its playout deadline, so no
    // concealment was ever needed.
    assert!(!saw_plc, "redundancy should have prevented concealment");
    assert_eq!(engine.output_type(), OutputType::NormalSpeech);
    assert_eq!(engine.discarded_packets(), 0);
    Ok(())
}

#[test]
fn scenario_master_slave_stay_aligned() -> Result<()> {
    let mut master = new_engine()?;
    let mut slave = new_engine()?;
    let mut info = MasterSlaveInfo::default();
    let mut out_m = [0i16; SAMPLES_PER_TICK];
    let mut out_s = [0i16; SAMPLES_PER_TICK];

    for i in 0..50u32 {
        if i != 20 {
            // Same stream on both channels, one loss affecting both.
            master.rec_in(&ulaw_packet(i as u16, i * 160), i * 160)?;
            slave.rec_in(&ulaw_packet(i as u16, i * 160), i * 160)?;
        }
        for _ in 0..2 {
            assert_eq!(master.rec_out_master(&mut out_m, &mut info)?, SAMPLES_PER_TICK);
            assert_eq!(slave.rec_out_slave(&mut out_s, &info)?, SAMPLES_PER_TICK);
            assert_eq!(out_m, out_s, "channels diverged at packet {}", i);
        }
    }
    Ok(())
}

#[test]
fn scenario_exact_sample_pacing_under_chaos() -> Result<()> {
    // Irregular arrivals, losses and bursts: every tick still yields
    // exactly 10 ms of audio.
    let mut engine = new_engine()?;
    let mut out = [0i16; SAMPLES_PER_TICK];
    let mut produced = 0usize;
    let mut seq = 0u16;

    for round in 0..200u32 {
        match round % 7 {
            0 => {} // nothing arrives
            3 => {
                // Burst of three.
                for _ in 0..3 {
                    engine.rec_in(&ulaw_packet(seq, seq as u32 * 160), round * 160)?;
                    seq = seq.wrapping_add(1);
                }
            }
            5 => {
                seq = seq.wrapping_add(1); // loss
            }
            _ => {
                engine.rec_in(&ulaw_packet(seq, seq as u32 * 160), round * 160)?;
                seq = seq.wrapping_add(1);
            }
        }
        for _ in 0..2 {
            produced += engine.rec_out(&mut out)?;
        }
    }

    assert_eq!(produced, 200 * 2 * SAMPLES_PER_TICK);
    Ok(())
}
