use super::*;

#[test]
fn test_rtp_packet_parse() {
    let data = vec![
        0x80, 0xa1, 0x03, 0xe8, // V=2, P=0, X=0, CC=0, M=1, PT=33, seq=1000
        0x00, 0x01, 0x5f, 0x90, // timestamp=90000
        0x12, 0x34, 0x56, 0x78, // SSRC=0x12345678
        0x47, 0x1f, 0xff, 0x10, // payload
    ];

    let packet = RTPPacket::parse(&data).unwrap();

    assert_eq!(packet.version, 2);
    assert!(!packet.padding);
    assert!(!packet.extension);
    assert_eq!(packet.csrc_count, 0);
    assert!(packet.marker);
    assert_eq!(packet.payload_type, PAYLOAD_TYPE_MP2T);
    assert_eq!(packet.sequence_number, 1000);
    assert_eq!(packet.timestamp, 90000);
    assert_eq!(packet.ssrc, 0x12345678);
    assert_eq!(&packet.payload[..], &[0x47, 0x1f, 0xff, 0x10]);
}

#[test]
fn test_rtp_packet_parse_with_extension() {
    let data = vec![
        0x90, 0x21, 0x03, 0xe8, // V=2, P=0, X=1, CC=0, M=0, PT=33, seq=1000
        0x00, 0x01, 0x5f, 0x90, // timestamp=90000
        0x12, 0x34, 0x56, 0x78, // SSRC=0x12345678
        0xbe, 0xde, 0x00, 0x01, // Extension header (0xbede, length=1)
        0x00, 0x00, 0x00, 0x00, // Extension data (4 bytes)
        0x01, 0x02, 0x03, 0x04, // payload
    ];

    let packet = RTPPacket::parse(&data).unwrap();

    assert!(packet.extension);
    let (ext_header, ext_data) = packet.extension_data.clone().unwrap();
    assert_eq!(ext_header, 0xbede);
    assert_eq!(ext_data.len(), 4);
    assert_eq!(&packet.to_bytes()[..], &data[..]);
}

#[test]
fn test_rtp_packet_rejects_bad_input() {
    assert_eq!(RTPPacket::parse(&[0x80; 8]), Err(RTPError::InvalidPacket));
    let mut data = vec![0u8; 12];
    data[0] = 0x40;
    assert_eq!(RTPPacket::parse(&data), Err(RTPError::UnsupportedVersion(1)));
}

#[test]
fn test_encapsulator_sequence_and_timestamp() {
    let mut rtp = RtpEncapsulator::new(0xdead_beef, u16::MAX);
    let payload = Bytes::from(vec![0x47; 188 * 7]);

    let first = rtp.wrap(300 * 1000, payload.clone());
    let second = rtp.wrap(300 * 2000, payload);
    assert_eq!(first.sequence_number, u16::MAX);
    assert_eq!(second.sequence_number, 0);
    assert_eq!(first.timestamp, 1000);
    assert_eq!(second.timestamp, 2000);
    assert_eq!(first.ssrc, 0xdead_beef);

    let wire = first.to_bytes();
    assert_eq!(wire.len(), RTP_HEADER_SIZE + 188 * 7);
    assert_eq!(wire[1], PAYLOAD_TYPE_MP2T);
}

#[test]
fn test_ssrc_from_seed_is_stable() {
    let a = RtpEncapsulator::from_seed(b"239.1.1.1:5000/1");
    let b = RtpEncapsulator::from_seed(b"239.1.1.1:5000/1");
    let c = RtpEncapsulator::from_seed(b"239.1.1.1:5000/2");
    assert_eq!(a.ssrc(), b.ssrc());
    assert_eq!(a.next_sequence(), b.next_sequence());
    assert_ne!(a.ssrc(), c.ssrc());
}
