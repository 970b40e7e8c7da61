use bytes::{BufMut, BytesMut};
use std::time::Duration;

// PIDs
pub const PID_PAT: u16 = 0x0000;
pub const PID_CAT: u16 = 0x0001;
pub const PID_NIT: u16 = 0x0010;
pub const PID_SDT: u16 = 0x0011;
pub const PID_ATSC_PSIP: u16 = 0x1FFB;
pub const PID_NULL: u16 = 0x1FFF;
pub const PID_MAX: u16 = 0x1FFF;
pub const DEFAULT_PMT_PID: u16 = 0x1000;
pub const FIRST_ES_PID: u16 = 0x0100;

// Table IDs
pub const TABLE_ID_PAT: u8 = 0x00;
pub const TABLE_ID_PMT: u8 = 0x02;
pub const TABLE_ID_SDT: u8 = 0x42;

// Elementary stream types
pub const STREAM_TYPE_MPEG2_VIDEO: u8 = 0x02;
pub const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
pub const STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
pub const STREAM_TYPE_PRIVATE_DATA: u8 = 0x06;
pub const STREAM_TYPE_AAC: u8 = 0x0f;
pub const STREAM_TYPE_AAC_LATM: u8 = 0x11;
pub const STREAM_TYPE_H264: u8 = 0x1b;
pub const STREAM_TYPE_AC3_ATSC: u8 = 0x81;
pub const STREAM_TYPE_EAC3_ATSC: u8 = 0x87;

// PES stream IDs
pub const STREAM_ID_PRIVATE_1: u8 = 0xbd;
pub const STREAM_ID_AUDIO: u8 = 0xc0;
pub const STREAM_ID_VIDEO: u8 = 0xe0;

// Sizes
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_HEADER_SIZE: usize = 4;
pub const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - TS_HEADER_SIZE;
pub const TS_PACKET_BITS: u64 = (TS_PACKET_SIZE * 8) as u64;
pub const SYNC_BYTE: u8 = 0x47;

// Clocks
pub const PTS_HZ: u64 = 90_000;
pub const PCR_HZ: u64 = 27_000_000;
/// PTS/DTS and PCR base are 33-bit counters
pub const PTS_MASK: u64 = (1 << 33) - 1;
/// A 27 MHz PCR wraps together with its 33-bit base
pub const PCR_WRAP: u64 = (1 << 33) * 300;

// Adaptation field flags
pub const AF_DISCONTINUITY: u8 = 0x80;
pub const AF_RANDOM_ACCESS: u8 = 0x40;
pub const AF_PCR: u8 = 0x10;

/// Adaptation field as seen on the wire
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdaptationField {
    pub length: usize,
    pub discontinuity: bool,
    pub random_access: bool,
    pub es_priority: bool,
    pub pcr: Option<u64>,
    pub opcr: Option<u64>,
    pub splice_countdown: Option<i8>,
    pub private_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TSHeader {
    pub sync_byte: u8, // Always 0x47
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub transport_priority: bool,
    pub pid: u16,
    pub scrambling_control: u8,
    pub adaptation_field_exists: bool,
    pub contains_payload: bool,
    pub continuity_counter: u8,
}

impl Default for TSHeader {
    fn default() -> Self {
        Self {
            sync_byte: SYNC_BYTE,
            transport_error: false,
            payload_unit_start: false,
            transport_priority: false,
            pid: 0,
            scrambling_control: 0,
            adaptation_field_exists: false,
            contains_payload: true,
            continuity_counter: 0,
        }
    }
}

impl TSHeader {
    pub fn new(pid: u16, continuity_counter: u8) -> Self {
        Self {
            pid,
            continuity_counter,
            ..Default::default()
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.sync_byte);

        let mut b1 = 0u8;
        if self.transport_error {
            b1 |= 0x80;
        }
        if self.payload_unit_start {
            b1 |= 0x40;
        }
        if self.transport_priority {
            b1 |= 0x20;
        }
        b1 |= ((self.pid >> 8) & 0x1f) as u8;
        buf.put_u8(b1);

        buf.put_u8((self.pid & 0xff) as u8);

        let mut b3 = (self.scrambling_control & 0x03) << 6;
        if self.adaptation_field_exists {
            b3 |= 0x20;
        }
        if self.contains_payload {
            b3 |= 0x10;
        }
        b3 |= self.continuity_counter & 0x0f;
        buf.put_u8(b3);
    }
}

/// Encodes a 27 MHz clock value as the 6-byte PCR field
/// (33-bit base at 90 kHz, 6 reserved bits, 9-bit extension).
pub fn encode_pcr(pcr: u64) -> [u8; 6] {
    let pcr = pcr % PCR_WRAP;
    let base = pcr / 300;
    let ext = pcr % 300;
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 1) << 7) as u8) | 0x7e | ((ext >> 8) as u8 & 0x01),
        ext as u8,
    ]
}

/// Decodes a 6-byte PCR field back to 27 MHz ticks
pub fn decode_pcr(data: &[u8]) -> u64 {
    let base = ((data[0] as u64) << 25)
        | ((data[1] as u64) << 17)
        | ((data[2] as u64) << 9)
        | ((data[3] as u64) << 1)
        | ((data[4] as u64) >> 7);
    let ext = (((data[4] & 0x01) as u64) << 8) | data[5] as u64;
    base * 300 + ext
}

/// 27 MHz ticks to wall-clock duration
pub fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_nanos((ticks as u128 * 1_000 / 27) as u64)
}

/// Wall-clock duration to 27 MHz ticks
pub fn duration_to_ticks(duration: Duration) -> u64 {
    (duration.as_nanos() * 27 / 1_000) as u64
}

/// 27 MHz ticks to a 33-bit 90 kHz timestamp
pub fn ticks_to_pts(ticks: u64) -> u64 {
    (ticks / 300) & PTS_MASK
}

/// Forward distance between two 33-bit timestamps, accounting for wrap
pub fn pts_diff(from: u64, to: u64) -> u64 {
    to.wrapping_sub(from) & PTS_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr_roundtrip_edges() {
        for pcr in [0u64, 299, 300, 27_000_000, PCR_WRAP - 1] {
            assert_eq!(decode_pcr(&encode_pcr(pcr)), pcr);
        }
        assert_eq!(decode_pcr(&encode_pcr(PCR_WRAP + 5)), 5);
    }

    #[test]
    fn test_pcr_reserved_bits() {
        let bytes = encode_pcr(0);
        assert_eq!(bytes, [0, 0, 0, 0, 0x7e, 0]);
    }

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        let header = TSHeader {
            payload_unit_start: true,
            adaptation_field_exists: true,
            ..TSHeader::new(0x1abc, 0x1f)
        };
        header.write_to(&mut buf);
        assert_eq!(&buf[..], &[0x47, 0x5a, 0xbc, 0x3f]);
    }

    #[test]
    fn test_tick_conversions() {
        assert_eq!(duration_to_ticks(Duration::from_millis(40)), 1_080_000);
        assert_eq!(ticks_to_duration(27_000_000), Duration::from_secs(1));
        assert_eq!(ticks_to_pts(27_000_000), 90_000);
        assert_eq!(pts_diff(PTS_MASK - 9, 10), 20);
    }
}
