use bytes::Bytes;
use quickcheck_macros::quickcheck;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tokio_test::{assert_err, assert_ok};
use tsmux_engine::av::{
    AccessUnit, InputProgram, InputStream, OutputStream, PassthroughTiming, StreamFormat, Timebase,
};
use tsmux_engine::config::{MuxConfig, OutputConfig, TsType};
use tsmux_engine::format::output::MemorySink;
use tsmux_engine::format::rtp::{RTPPacket, PAYLOAD_TYPE_MP2T};
use tsmux_engine::format::ts::types::{duration_to_ticks, TABLE_ID_PAT, TABLE_ID_PMT};
use tsmux_engine::format::ts::{
    Program, ScheduledPacket, TSMuxer, TSPacketParser, TsAnalyzer, PCR_HZ, PID_PAT, TS_PACKET_SIZE,
};
use tsmux_engine::session::{Session, SessionState};
use tsmux_engine::stats::MuxStats;
use tsmux_engine::MuxError;

fn av_input() -> InputProgram {
    InputProgram::new("Scenario", "Test Provider")
        .with_stream(InputStream::video(
            1,
            StreamFormat::VideoUncompressed,
            1280,
            720,
            Timebase::new(1, 25),
        ))
        .with_stream(InputStream::audio(2, StreamFormat::Pcm, 0x3, 48_000))
}

fn encoded_outputs() -> Vec<OutputStream> {
    vec![
        OutputStream::encode(1, StreamFormat::Avc).with_pid(256),
        OutputStream::encode(2, StreamFormat::Mp2).with_pid(257),
    ]
}

/// Feeds `units` (stream id, unit) in order and runs until everything left the muxer.
fn run_muxer(muxer: &mut TSMuxer, units: Vec<(u32, AccessUnit)>, extra_slots: usize) -> Vec<ScheduledPacket> {
    let mut units = units.into_iter().peekable();
    let mut packets = Vec::new();
    loop {
        while let Some((stream_id, _)) = units.peek() {
            if !muxer.wants_input(*stream_id) {
                break;
            }
            if let Some((stream_id, unit)) = units.next() {
                let _ = muxer.push(stream_id, unit);
            }
        }
        if units.peek().is_none() && muxer.is_drained() {
            break;
        }
        if let Some(packet) = muxer.next_packet().unwrap() {
            packets.push(packet);
        }
    }
    for _ in 0..extra_slots {
        if let Some(packet) = muxer.next_packet().unwrap() {
            packets.push(packet);
        }
    }
    packets
}

fn av_units(seconds: i64) -> Vec<(u32, AccessUnit)> {
    let mut units = Vec::new();
    let mut audio = 0i64;
    for frame in 0..25 * seconds {
        units.push((
            1,
            AccessUnit::new(vec![0x42; 8000])
                .with_pts(frame)
                .with_key_flag(frame % 25 == 0),
        ));
        // Keep audio interleaved at the same media time
        while audio * 1152 * 25 <= frame * 48_000 {
            units.push((2, AccessUnit::new(vec![0x24; 576]).with_pts(audio * 1152)));
            audio += 1;
        }
    }
    units
}

fn analyze(packets: &[ScheduledPacket], muxrate: u64) -> TsAnalyzer {
    let mut analyzer = TsAnalyzer::new(muxrate);
    for packet in packets {
        analyzer.feed_at(packet.at, &packet.data).unwrap();
    }
    analyzer
}

#[test]
fn scenario_a_cbr_program_conforms() {
    let mut config = MuxConfig::new(TsType::Generic, 5_000_000);
    config.pcr_period = Duration::from_millis(40);
    config.pat_period = Duration::from_millis(100);
    let program = Program::build(&av_input(), &encoded_outputs(), &config).unwrap();
    assert_eq!(program.pcr_pid, 256);
    let pmt_pid = program.pmt_pid;

    let mut muxer = TSMuxer::new(program, &config, MuxStats::new()).unwrap();
    let packets = run_muxer(&mut muxer, av_units(3), 0);
    let analyzer = analyze(&packets, config.ts_muxrate);

    let first = |pid: u16| packets.iter().find(|p| p.pid == pid).map(|p| p.at);
    assert!(first(PID_PAT).unwrap() <= duration_to_ticks(config.pat_period));
    assert!(first(pmt_pid).unwrap() <= duration_to_ticks(config.pat_period));

    let parser = TSPacketParser::new();
    for packet in &packets {
        let af = parser.parse_adaptation_field(&packet.data).unwrap();
        if af.and_then(|af| af.pcr).is_some() {
            assert_eq!(packet.pid, 256);
        }
    }
    assert!(analyzer.pcr_count > 0);
    assert!(analyzer.max_pcr_gap <= duration_to_ticks(config.pcr_period));
    assert_eq!(analyzer.cc_errors, 0);

    // CBR: every slot is filled, so any one-second window holds the nominal rate
    let per_second = config.ts_muxrate as f64 / (TS_PACKET_SIZE * 8) as f64;
    for start in (0..packets.len()).step_by(997) {
        let window_start = packets[start].at;
        if packets.last().unwrap().at < window_start + PCR_HZ {
            break;
        }
        let count = packets[start..]
            .iter()
            .take_while(|p| p.at < window_start + PCR_HZ)
            .count() as f64;
        assert!((count - per_second).abs() <= 1.0, "{} packets in a 1 s window", count);
    }
}

#[test]
fn scenario_b_burst_is_paced_by_smoothing_buffer() {
    let config = MuxConfig::new(TsType::Atsc, 10_000_000).vbr(1_000_000, 8192);
    let input = InputProgram::new("Burst", "Test").with_stream(InputStream::video(
        1,
        StreamFormat::Mpeg2Video,
        720,
        480,
        Timebase::MPEG,
    ));
    let program = Program::build(&input, &[OutputStream::passthrough(1)], &config).unwrap();
    let video_pid = program.streams[0].pid;
    let mut muxer = TSMuxer::new(program, &config, MuxStats::new()).unwrap();

    let slots_before = muxer.shaper().slot();
    let packets = run_muxer(&mut muxer, vec![(1, AccessUnit::new(vec![0u8; 50_000]).with_pts(0))], 0);
    let es: Vec<&ScheduledPacket> = packets.iter().filter(|p| p.pid == video_pid).collect();
    let elapsed = es.last().unwrap().at - es.first().unwrap().at;

    // 50 kB at 1 Mbit/s is 0.4 s, less what the 8 kB buffer absorbs up front
    assert!(elapsed > PCR_HZ / 4, "emitted in {} ticks", elapsed);
    assert!(elapsed < PCR_HZ / 2, "emitted in {} ticks", elapsed);
    assert!(muxer.shaper().slot() - slots_before > packets.len() as u64);
    assert!(packets.iter().all(|p| !p.is_null()));

    let bucket = muxer.shaper().bucket().unwrap();
    assert!(bucket.fill_bits() <= bucket.capacity_bits());
}

#[tokio::test(start_paused = true)]
async fn scenario_b_session_takes_real_time() {
    let sink = MemorySink::new();
    let mut session = Session::new();
    session
        .setup_program(InputProgram::new("Burst", "Test").with_stream(InputStream::video(
            1,
            StreamFormat::Avc,
            720,
            480,
            Timebase::MPEG,
        )))
        .unwrap();
    session.setup_streams(vec![OutputStream::passthrough(1)]).unwrap();
    session
        .setup_muxer(MuxConfig::new(TsType::Generic, 10_000_000).vbr(1_000_000, 8192))
        .unwrap();
    session.setup_output(OutputConfig::udp("127.0.0.1:5000")).unwrap();
    session.start_with_sink(Box::new(sink.clone())).unwrap();

    let started = Instant::now();
    let video = session.sender(1).unwrap();
    video.send(AccessUnit::new(vec![0u8; 50_000]).with_pts(0)).await.unwrap();
    let stats = session.stop().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(250), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(600), "{:?}", elapsed);
    assert_eq!(stats.null_packets, 0);
    assert_eq!(stats.transport_discontinuities, 0);

    let mut analyzer = TsAnalyzer::new(10_000_000);
    analyzer.feed(&sink.concat()).unwrap();
    assert_eq!(analyzer.cc_errors, 0);
    assert_eq!(analyzer.packets, stats.packets);
}

#[test]
fn scenario_c_duplicate_pid_fails_setup() {
    let outputs = vec![
        OutputStream::encode(1, StreamFormat::Avc).with_pid(256),
        OutputStream::encode(2, StreamFormat::Mp2).with_pid(256),
    ];
    let err = Program::build(&av_input(), &outputs, &MuxConfig::default()).unwrap_err();
    assert!(matches!(err, MuxError::PidConflict { pid: 256, .. }));

    let sink = MemorySink::new();
    let mut session = Session::new();
    assert_ok!(session.setup_program(av_input()));
    assert_ok!(session.setup_muxer(MuxConfig::default()));
    assert_ok!(session.setup_output(OutputConfig::udp("127.0.0.1:5000")));
    assert_err!(session.setup_streams(outputs));
    assert_err!(session.start_with_sink(Box::new(sink.clone())));
    assert_eq!(session.state(), SessionState::Unconfigured);
    assert!(sink.datagrams().is_empty());
}

#[test]
fn scenario_d_passthrough_source_reset_is_flagged() {
    let config = MuxConfig::new(TsType::Dvb, 4_000_000);
    let input = InputProgram::new("Contribution", "Test")
        .with_stream(InputStream::video(1, StreamFormat::Avc, 1920, 1080, Timebase::MPEG))
        .with_stream(InputStream::audio(2, StreamFormat::Mp2, 0x3, 48_000));
    let program = Program::build(
        &input,
        &[OutputStream::passthrough(1), OutputStream::passthrough(2)],
        &config,
    )
    .unwrap();
    let video_pid = program.stream(1).unwrap().pid;
    let stats = MuxStats::new();
    let mut muxer = TSMuxer::new(program, &config, stats.clone()).unwrap();

    let mut units = Vec::new();
    for i in 0..10u64 {
        let pts = 900_000 + i * 3600;
        let timing = PassthroughTiming::new(pts).with_dts(pts).with_pcr(pts * 300);
        units.push((1, AccessUnit::new(vec![0x10; 3000]).with_passthrough(timing)));
    }
    // Source restarted: PTS and PCR fall back near zero, no flag from upstream
    for i in 0..10u64 {
        let pts = 1800 + i * 3600;
        let timing = PassthroughTiming::new(pts).with_dts(pts).with_pcr(pts * 300);
        units.push((1, AccessUnit::new(vec![0x20; 3000]).with_passthrough(timing)));
    }

    let packets = run_muxer(&mut muxer, units, 0);
    let analyzer = analyze(&packets, config.ts_muxrate);

    assert_eq!(stats.snapshot().timestamp_discontinuities, 1);
    assert_eq!(analyzer.discontinuity_flags, 1);
    assert_eq!(analyzer.cc_errors, 0);
    assert_eq!(analyzer.dts_backwards, 0);

    let parser = TSPacketParser::new();
    let flagged: Vec<&ScheduledPacket> = packets
        .iter()
        .filter(|p| {
            parser
                .parse_adaptation_field(&p.data)
                .unwrap()
                .is_some_and(|af| af.discontinuity)
        })
        .collect();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].pid, video_pid);
    let header = parser.parse_header(&flagged[0].data).unwrap();
    assert!(header.payload_unit_start);
    assert_eq!(header.continuity_counter, 0);
}

#[test]
fn scenario_d_reset_on_one_stream_leaves_siblings_running() {
    let config = MuxConfig::new(TsType::Dvb, 4_000_000);
    let input = InputProgram::new("Contribution", "Test")
        .with_stream(InputStream::video(1, StreamFormat::Avc, 1920, 1080, Timebase::MPEG))
        .with_stream(InputStream::audio(2, StreamFormat::Mp2, 0x3, 48_000));
    let program = Program::build(
        &input,
        &[OutputStream::passthrough(1), OutputStream::passthrough(2)],
        &config,
    )
    .unwrap();
    let audio_pid = program.stream(2).unwrap().pid;
    let stats = MuxStats::new();
    let mut muxer = TSMuxer::new(program, &config, stats.clone()).unwrap();

    let mut units = Vec::new();
    for i in 0..20u64 {
        // Video restarts near zero halfway through, audio carries on
        let video_pts = if i < 10 { 900_000 + i * 3600 } else { 1800 + (i - 10) * 3600 };
        let audio_pts = 900_000 + i * 3600;
        units.push((
            1,
            AccessUnit::new(vec![0x10; 3000]).with_passthrough(PassthroughTiming::new(video_pts)),
        ));
        units.push((
            2,
            AccessUnit::new(vec![0x20; 400]).with_passthrough(PassthroughTiming::new(audio_pts)),
        ));
    }

    let packets = run_muxer(&mut muxer, units, 0);
    assert_eq!(stats.snapshot().timestamp_discontinuities, 1);

    let parser = TSPacketParser::new();
    let mut audio_dts = Vec::new();
    for packet in packets.iter().filter(|p| p.pid == audio_pid) {
        // 20 units spanning 0.8 s behind a 0.7 s mux delay
        assert!(packet.at < 2 * PCR_HZ, "audio packet held until STC {}", packet.at);
        let header = parser.parse_header(&packet.data).unwrap();
        if header.payload_unit_start {
            let timestamps = parser.parse_pes_timestamps(parser.payload(&packet.data).unwrap()).unwrap();
            audio_dts.push(timestamps.dts.or(timestamps.pts).unwrap());
        }
    }
    assert_eq!(audio_dts.len(), 20);
    assert!(audio_dts.windows(2).all(|w| w[1] - w[0] == 3600));

    let analyzer = analyze(&packets, config.ts_muxrate);
    assert_eq!(analyzer.cc_errors, 0);
    assert_eq!(analyzer.dts_backwards, 0);
}

#[test]
fn psi_versions_change_only_with_content() {
    let config = MuxConfig::new(TsType::Generic, 5_000_000);
    let program = Program::build(&av_input(), &encoded_outputs(), &config).unwrap();
    let pmt_pid = program.pmt_pid;
    let mut muxer = TSMuxer::new(program, &config, MuxStats::new()).unwrap();

    let mut packets = run_muxer(&mut muxer, av_units(1), 0);
    muxer.reassign_pid(2, 0x0300).unwrap();
    packets.extend(run_muxer(&mut muxer, Vec::new(), 20_000));

    let analyzer = analyze(&packets, config.ts_muxrate);
    let pat = analyzer.table(PID_PAT, TABLE_ID_PAT).unwrap();
    let pmt = analyzer.table(pmt_pid, TABLE_ID_PMT).unwrap();
    assert!(pat.count > 10);
    assert_eq!(pat.versions, vec![0]);
    assert_eq!(pmt.versions, vec![0, 1]);

    let streams = &analyzer.pmt.as_ref().unwrap().elementary_stream_infos;
    assert_eq!(streams[1].elementary_pid, 0x0300);
}

#[quickcheck]
fn prop_counters_and_pcr_hold_for_any_unit_sizes(sizes: Vec<u16>) -> bool {
    let config = MuxConfig::new(TsType::Generic, 3_000_000);
    let program = match Program::build(&av_input(), &encoded_outputs(), &config) {
        Ok(program) => program,
        Err(_) => return false,
    };
    let mut muxer = match TSMuxer::new(program, &config, MuxStats::new()) {
        Ok(muxer) => muxer,
        Err(_) => return false,
    };
    let units: Vec<(u32, AccessUnit)> = sizes
        .iter()
        .take(12)
        .enumerate()
        .map(|(i, size)| {
            let size = *size as usize % 20_000 + 1;
            (1, AccessUnit::new(Bytes::from(vec![0xaa; size])).with_pts(i as i64))
        })
        .collect();

    let packets = run_muxer(&mut muxer, units, 2000);
    let analyzer = analyze(&packets, config.ts_muxrate);
    let pcr_offset = muxer.shaper().bytes_to_ticks(11);

    analyzer.cc_errors == 0
        && analyzer.pcr_backwards == 0
        && analyzer.max_pcr_gap <= duration_to_ticks(config.pcr_period)
        && analyzer.max_pcr_error(pcr_offset) <= 1
}

#[tokio::test]
async fn rtp_over_udp_loopback() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = receiver.local_addr().unwrap().port();

    let mut session = Session::new();
    session
        .setup_program(InputProgram::new("Loopback", "Test").with_stream(InputStream::video(
            1,
            StreamFormat::Avc,
            640,
            360,
            Timebase::new(1, 25),
        )))
        .unwrap();
    session.setup_streams(vec![OutputStream::passthrough(1)]).unwrap();
    session.setup_muxer(MuxConfig::new(TsType::Generic, 2_000_000)).unwrap();
    session
        .setup_output(OutputConfig::rtp(&format!("rtp://127.0.0.1:{}?pkts=7", port)))
        .unwrap();
    session.start().await.unwrap();

    let video = session.sender(1).unwrap();
    video.send(AccessUnit::new(vec![0x33; 2000]).with_pts(0)).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let mut sequences = Vec::new();
    for _ in 0..3 {
        let len = timeout(Duration::from_secs(5), receiver.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let packet = RTPPacket::parse(&buf[..len]).unwrap();
        assert_eq!(packet.payload_type, PAYLOAD_TYPE_MP2T);
        assert_eq!(packet.payload.len(), 7 * TS_PACKET_SIZE);
        assert!(packet.payload.chunks(TS_PACKET_SIZE).all(|p| p[0] == 0x47));
        sequences.push(packet.sequence_number);
    }
    assert_eq!(sequences[1], sequences[0].wrapping_add(1));
    assert_eq!(sequences[2], sequences[1].wrapping_add(1));

    let stats = session.stop().await.unwrap();
    assert!(stats.datagrams >= 3);
    assert_eq!(stats.transport_discontinuities, 0);
}
