//! # RTP encapsulation of transport streams
//!
//! RFC 3550 packets carrying whole 188-byte transport packets as payload
//! type 33 (RFC 2250). The RTP timestamp is the 90 kHz view of the muxer's
//! system clock at the first transport packet of the datagram.
//!
//! ## Example
//!
//! ```rust
//! use tsmux_engine::format::rtp::{RTPPacket, RtpEncapsulator, PAYLOAD_TYPE_MP2T};
//! use bytes::Bytes;
//!
//! let mut rtp = RtpEncapsulator::from_seed(b"239.1.1.1:5000");
//! let packet = rtp.wrap(27_000_000, Bytes::from(vec![0x47; 188]));
//! assert_eq!(packet.payload_type, PAYLOAD_TYPE_MP2T);
//! assert_eq!(packet.timestamp, 90_000);
//!
//! let parsed = RTPPacket::parse(&packet.to_bytes()).unwrap();
//! assert_eq!(parsed.sequence_number, packet.sequence_number);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use thiserror::Error;

#[cfg(test)]
mod tests;

/// MPEG-2 transport stream payload type
pub const PAYLOAD_TYPE_MP2T: u8 = 33;

/// Fixed header length without CSRCs
pub const RTP_HEADER_SIZE: usize = 12;

/// Errors that can occur during RTP operations
#[derive(Debug, Error, PartialEq)]
pub enum RTPError {
    /// The packet data is malformed or incomplete
    #[error("Invalid RTP packet")]
    InvalidPacket,

    #[error("Unsupported RTP version {0}")]
    UnsupportedVersion(u8),
}

impl From<RTPError> for crate::MuxError {
    fn from(e: RTPError) -> Self {
        crate::MuxError::InvalidData(e.to_string())
    }
}

/// Specialized Result type for RTP operations
pub type Result<T> = std::result::Result<T, RTPError>;

/// An RTP packet containing media data and metadata
#[derive(Debug, Clone, PartialEq)]
pub struct RTPPacket {
    /// RTP version (should be 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Header extension flag
    pub extension: bool,
    /// CSRC count
    pub csrc_count: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type identifier
    pub payload_type: u8,
    /// Packet sequence number
    pub sequence_number: u16,
    /// Media timestamp
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
    /// Contributing source identifiers
    pub csrc: Vec<u32>,
    /// Optional header extension (profile-specific ID, data)
    pub extension_data: Option<(u16, Bytes)>,
    /// Packet payload data
    pub payload: Bytes,
}

impl RTPPacket {
    /// Creates a new RTP packet with the specified parameters
    ///
    /// # Arguments
    ///
    /// * `payload_type` - RTP payload type number
    /// * `sequence_number` - 16-bit sequence number
    /// * `timestamp` - 32-bit timestamp
    /// * `ssrc` - 32-bit synchronization source identifier
    /// * `marker` - Marker bit
    /// * `payload` - Media payload data
    pub fn new(
        payload_type: u8,
        sequence_number: u16,
        timestamp: u32,
        ssrc: u32,
        marker: bool,
        payload: Bytes,
    ) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension_data: None,
            payload,
        }
    }

    /// Parses an RTP packet from raw bytes
    ///
    /// # Errors
    ///
    /// Returns `RTPError` if:
    /// - The packet is shorter than 12 bytes
    /// - The version is not 2
    /// - The packet is malformed
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(RTPError::InvalidPacket);
        }

        let first_byte = data[0];
        let second_byte = data[1];

        let version = (first_byte >> 6) & 0x03;
        if version != 2 {
            return Err(RTPError::UnsupportedVersion(version));
        }

        let padding = (first_byte & 0x20) != 0;
        let extension = (first_byte & 0x10) != 0;
        let csrc_count = first_byte & 0x0f;

        let marker = (second_byte & 0x80) != 0;
        let payload_type = second_byte & 0x7f;

        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_SIZE;

        let mut csrc = Vec::with_capacity(csrc_count as usize);
        for _ in 0..csrc_count {
            if offset + 4 > data.len() {
                return Err(RTPError::InvalidPacket);
            }
            csrc.push(u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]));
            offset += 4;
        }

        let extension_data = if extension {
            if offset + 4 > data.len() {
                return Err(RTPError::InvalidPacket);
            }
            let ext_header = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let ext_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize * 4;
            offset += 4;

            if offset + ext_length > data.len() {
                return Err(RTPError::InvalidPacket);
            }
            let ext_data = Bytes::copy_from_slice(&data[offset..offset + ext_length]);
            offset += ext_length;
            Some((ext_header, ext_data))
        } else {
            None
        };

        let payload = if padding {
            let padding_len = data[data.len() - 1] as usize;
            if padding_len == 0 || offset + padding_len > data.len() {
                return Err(RTPError::InvalidPacket);
            }
            Bytes::copy_from_slice(&data[offset..data.len() - padding_len])
        } else {
            Bytes::copy_from_slice(&data[offset..])
        };

        Ok(Self {
            version: 2,
            padding,
            extension,
            csrc_count,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_data,
            payload,
        })
    }

    /// Serializes header and payload. Padding is never written.
    pub fn write_to(&self, buf: &mut BytesMut) {
        let has_extension = self.extension_data.is_some();
        buf.put_u8((2 << 6) | ((has_extension as u8) << 4) | (self.csrc.len() as u8 & 0x0f));
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7f));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in self.csrc.iter().take(15) {
            buf.put_u32(*csrc);
        }
        if let Some((profile, data)) = &self.extension_data {
            buf.put_u16(*profile);
            buf.put_u16((data.len() / 4) as u16);
            buf.put_slice(&data[..data.len() / 4 * 4]);
        }
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        self.write_to(&mut buf);
        buf.freeze()
    }
}

/// Wraps datagrams of transport packets into RTP.
///
/// The sequence number advances once per wrapped datagram, whether or not
/// the datagram is delivered, so receivers can count what was lost.
#[derive(Debug, Clone)]
pub struct RtpEncapsulator {
    ssrc: u32,
    sequence: u16,
}

impl RtpEncapsulator {
    pub fn new(ssrc: u32, initial_sequence: u16) -> Self {
        Self {
            ssrc,
            sequence: initial_sequence,
        }
    }

    /// Derives SSRC and initial sequence number from an MD5 digest of `seed`.
    pub fn from_seed(seed: &[u8]) -> Self {
        let digest = Md5::digest(seed);
        Self::new(
            u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]),
            u16::from_be_bytes([digest[4], digest[5]]),
        )
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next packet will carry
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    /// Wraps a datagram whose first transport packet starts at STC `stc` (27 MHz).
    pub fn wrap(&mut self, stc: u64, payload: Bytes) -> RTPPacket {
        let packet = RTPPacket::new(
            PAYLOAD_TYPE_MP2T,
            self.sequence,
            (stc / 300) as u32,
            self.ssrc,
            false,
            payload,
        );
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }
}
