use super::types::*;
use bytes::{BufMut, Bytes, BytesMut};

/// PES header_data_length required for teletext (EN 300 472)
pub const TELETEXT_HEADER_DATA_LENGTH: u8 = 0x24;

/// Packetized Elementary Stream (PES) header
///
/// Only the fields the muxer sets are modelled; ESCR, ES rate, trick mode,
/// copy info, CRC and extension flags are always written as zero.
#[derive(Debug, Clone, PartialEq)]
pub struct PESHeader {
    /// Stream identifier indicating content type (video/audio/private)
    pub stream_id: u8,
    /// Length of the PES packet after this field; 0 means unbounded (video only)
    pub packet_length: u16,
    /// Data alignment indicator: the payload starts with an access unit
    pub data_alignment: bool,
    /// Presentation Time Stamp (33 bits, 90 kHz)
    pub pts: Option<u64>,
    /// Decoding Time Stamp (33 bits, 90 kHz), only written when it differs from the PTS
    pub dts: Option<u64>,
    /// Forces the header_data_length field, padding with stuffing bytes
    pub min_header_data_length: Option<u8>,
}

impl PESHeader {
    /// Creates a new PES header with a specific stream ID.
    pub fn new(stream_id: u8) -> Self {
        Self {
            stream_id,
            packet_length: 0,
            data_alignment: true,
            pts: None,
            dts: None,
            min_header_data_length: None,
        }
    }

    /// Sets the Presentation Time Stamp in 90 kHz units.
    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts & PTS_MASK);
        self
    }

    /// Sets the Decoding Time Stamp in 90 kHz units.
    pub fn with_dts(mut self, dts: u64) -> Self {
        self.dts = Some(dts & PTS_MASK);
        self
    }

    fn writes_dts(&self) -> bool {
        matches!((self.pts, self.dts), (Some(pts), Some(dts)) if pts != dts)
    }

    fn timestamp_bytes(&self) -> usize {
        match (self.pts.is_some(), self.writes_dts()) {
            (true, true) => 10,
            (true, false) => 5,
            _ => 0,
        }
    }

    /// Value of the header_data_length field
    pub fn header_data_length(&self) -> u8 {
        let natural = self.timestamp_bytes() as u8;
        self.min_header_data_length.map_or(natural, |min| min.max(natural))
    }

    /// Bytes written by [`write_to`](Self::write_to)
    pub fn len(&self) -> usize {
        9 + self.header_data_length() as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Writes the PES header to a BytesMut buffer.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(&[0x00, 0x00, 0x01]);
        buf.put_u8(self.stream_id);
        buf.put_u16(self.packet_length);

        // '10', not scrambled, not priority
        let mut flags = 0x80u8;
        if self.data_alignment {
            flags |= 0x04;
        }
        buf.put_u8(flags);

        let pts_dts_flags = match (self.pts.is_some(), self.writes_dts()) {
            (true, true) => 0xc0,
            (true, false) => 0x80,
            _ => 0x00,
        };
        buf.put_u8(pts_dts_flags);
        buf.put_u8(self.header_data_length());

        if let Some(pts) = self.pts {
            let marker = if self.writes_dts() { 0x30 } else { 0x20 };
            write_timestamp(buf, marker, pts);
        }
        if self.writes_dts() {
            if let Some(dts) = self.dts {
                write_timestamp(buf, 0x10, dts);
            }
        }
        let stuffing = self.header_data_length() as usize - self.timestamp_bytes();
        buf.put_bytes(0xff, stuffing);
    }
}

/// A complete PES packet: header and one access unit.
#[derive(Debug, Clone)]
pub struct PESPacket {
    pub header: PESHeader,
    pub payload: Bytes,
}

impl PESPacket {
    /// Builds a packet, filling in PES_packet_length.
    ///
    /// Video streams use the unbounded form (length 0); so does any packet
    /// too large for the 16-bit field.
    pub fn new(mut header: PESHeader, payload: Bytes) -> Self {
        let body = 3 + header.header_data_length() as usize + payload.len();
        let is_video = (0xe0..=0xef).contains(&header.stream_id);
        header.packet_length = if is_video || body > u16::MAX as usize {
            0
        } else {
            body as u16
        };
        Self { header, payload }
    }

    /// Encodes header and payload into one buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        self.header.write_to(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn len(&self) -> usize {
        self.header.len() + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Writes a 33-bit PTS/DTS with its 4-bit prefix and marker bits.
pub fn write_timestamp(buf: &mut BytesMut, prefix: u8, ts: u64) {
    let ts = ts & PTS_MASK;
    buf.put_u8(prefix | (((ts >> 29) & 0x0e) as u8) | 0x01);
    buf.put_u16((((ts >> 14) & 0xfffe) | 0x01) as u16);
    buf.put_u16((((ts << 1) & 0xfffe) | 0x01) as u16);
}

/// Reads a 5-byte PTS/DTS field.
pub fn read_timestamp(data: &[u8]) -> u64 {
    (((data[0] as u64) >> 1) & 0x07) << 30
        | ((data[1] as u64) << 22)
        | (((data[2] as u64) >> 1) << 15)
        | ((data[3] as u64) << 7)
        | ((data[4] as u64) >> 1)
}
