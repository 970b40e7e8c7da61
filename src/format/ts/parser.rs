use super::descriptors::Descriptor;
use super::pes::read_timestamp;
use super::types::*;
use crate::error::{MuxError, Result};
use crate::utils::{BitReader, Crc32Mpeg2};

/// A PSI section with a verified CRC
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub table_id: u8,
    pub table_id_extension: u16,
    pub version: u8,
    pub current_next: bool,
    /// Bytes between last_section_number and the CRC
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PATEntry {
    pub program_number: u16,
    pub network_pid: u16,
    pub program_map_pid: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementaryStreamInfo {
    pub stream_type: u8,
    pub elementary_pid: u16,
    pub descriptors: Vec<Descriptor>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PMTInfo {
    pub pcr_pid: u16,
    pub program_descriptors: Vec<Descriptor>,
    pub elementary_stream_infos: Vec<ElementaryStreamInfo>,
}

/// Timestamps found in a PES header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesTimestamps {
    pub stream_id: u8,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub header_data_length: u8,
}

/// Stateless reader for single transport packets and the structures they carry.
#[derive(Debug, Clone, Default)]
pub struct TSPacketParser {
    crc: Crc32Mpeg2,
}

impl TSPacketParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_header(&self, data: &[u8]) -> Result<TSHeader> {
        if data.len() < TS_HEADER_SIZE {
            return Err(MuxError::InvalidData("TS packet too short".into()));
        }

        if data[0] != SYNC_BYTE {
            return Err(MuxError::InvalidData("Invalid sync byte".into()));
        }

        Ok(TSHeader {
            sync_byte: data[0],
            transport_error: (data[1] & 0x80) != 0,
            payload_unit_start: (data[1] & 0x40) != 0,
            transport_priority: (data[1] & 0x20) != 0,
            pid: (((data[1] & 0x1F) as u16) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_exists: (data[3] & 0x20) != 0,
            contains_payload: (data[3] & 0x10) != 0,
            continuity_counter: data[3] & 0x0F,
        })
    }

    /// Parses the adaptation field of a full packet, if present.
    ///
    /// A zero-length field (a single stuffing byte) is reported with
    /// `length == 0` and no flags.
    pub fn parse_adaptation_field(&self, data: &[u8]) -> Result<Option<AdaptationField>> {
        if data.len() < TS_PACKET_SIZE {
            return Err(MuxError::InvalidData("TS packet too short".into()));
        }
        if (data[3] & 0x20) == 0 {
            return Ok(None);
        }

        let offset = TS_HEADER_SIZE;
        let adaptation_field_length = data[offset] as usize;
        if adaptation_field_length == 0 {
            return Ok(Some(AdaptationField::default()));
        }
        if adaptation_field_length > TS_PAYLOAD_SIZE - 1 {
            return Err(MuxError::InvalidData("Adaptation field too long".into()));
        }

        let flags = data[offset + 1];
        let mut field = AdaptationField {
            length: adaptation_field_length,
            discontinuity: (flags & AF_DISCONTINUITY) != 0,
            random_access: (flags & AF_RANDOM_ACCESS) != 0,
            es_priority: (flags & 0x20) != 0,
            ..Default::default()
        };

        let end = offset + 1 + adaptation_field_length;
        let mut pos = offset + 2;

        if flags & AF_PCR != 0 {
            if end < pos + 6 {
                return Err(MuxError::InvalidData("PCR data too short".into()));
            }
            field.pcr = Some(decode_pcr(&data[pos..pos + 6]));
            pos += 6;
        }

        if flags & 0x08 != 0 {
            if end < pos + 6 {
                return Err(MuxError::InvalidData("OPCR data too short".into()));
            }
            field.opcr = Some(decode_pcr(&data[pos..pos + 6]));
            pos += 6;
        }

        if flags & 0x04 != 0 {
            if end < pos + 1 {
                return Err(MuxError::InvalidData("Splice countdown too short".into()));
            }
            field.splice_countdown = Some(data[pos] as i8);
            pos += 1;
        }

        if flags & 0x02 != 0 {
            if end < pos + 1 {
                return Err(MuxError::InvalidData(
                    "Private data length byte missing".into(),
                ));
            }
            let private_data_length = data[pos] as usize;
            pos += 1;
            if end < pos + private_data_length {
                return Err(MuxError::InvalidData("Private data too short".into()));
            }
            field.private_data = Some(data[pos..pos + private_data_length].to_vec());
        }
        Ok(Some(field))
    }

    /// Payload bytes of a full packet (empty when it carries none).
    pub fn payload<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        let header = self.parse_header(data)?;
        if data.len() < TS_PACKET_SIZE {
            return Err(MuxError::InvalidData("TS packet too short".into()));
        }
        if !header.contains_payload {
            return Ok(&[]);
        }
        let start = if header.adaptation_field_exists {
            TS_HEADER_SIZE + 1 + data[TS_HEADER_SIZE] as usize
        } else {
            TS_HEADER_SIZE
        };
        if start > TS_PACKET_SIZE {
            return Err(MuxError::InvalidData("Adaptation field overruns packet".into()));
        }
        Ok(&data[start..TS_PACKET_SIZE])
    }

    /// Parses a long-form section starting at `table_id`, checking its CRC.
    pub fn parse_section(&self, data: &[u8]) -> Result<Section> {
        if data.len() < 3 {
            return Err(MuxError::InvalidData("Section header too short".into()));
        }
        let section_length = (((data[1] & 0x0f) as usize) << 8) | data[2] as usize;
        let total = 3 + section_length;
        if section_length < 9 || data.len() < total {
            return Err(MuxError::InvalidData("Section truncated".into()));
        }
        let section = &data[..total];
        if !self.crc.verify(section) {
            return Err(MuxError::InvalidData(format!(
                "CRC mismatch in table 0x{:02x}",
                data[0]
            )));
        }

        let mut reader = BitReader::new(section);
        let table_id = reader.read_bits(8)? as u8;
        // syntax indicator, '0', reserved, section_length
        reader.skip_bits(16)?;
        let table_id_extension = reader.read_bits(16)? as u16;
        reader.skip_bits(2)?;
        let version = reader.read_bits(5)? as u8;
        let current_next = reader.read_bit()?;

        Ok(Section {
            table_id,
            table_id_extension,
            version,
            current_next,
            body: section[8..total - 4].to_vec(),
        })
    }

    /// Section carried by a payload that starts with a pointer field.
    pub fn parse_section_payload(&self, payload: &[u8]) -> Result<Section> {
        let pointer = *payload
            .first()
            .ok_or_else(|| MuxError::InvalidData("Empty section payload".into()))?
            as usize;
        if payload.len() < 1 + pointer {
            return Err(MuxError::InvalidData("Pointer field past payload".into()));
        }
        self.parse_section(&payload[1 + pointer..])
    }

    pub fn parse_pat(&self, body: &[u8]) -> Result<Vec<PATEntry>> {
        let mut entries = Vec::new();
        let mut pos = 0;

        while pos + 4 <= body.len() {
            let program_number = ((body[pos] as u16) << 8) | body[pos + 1] as u16;
            let pid = ((body[pos + 2] as u16 & 0x1F) << 8) | body[pos + 3] as u16;
            entries.push(PATEntry {
                program_number,
                network_pid: if program_number == 0 { pid } else { 0 },
                program_map_pid: if program_number != 0 { pid } else { 0 },
            });
            pos += 4;
        }

        Ok(entries)
    }

    pub fn parse_pmt(&self, body: &[u8]) -> Result<PMTInfo> {
        let mut pmt = PMTInfo::default();
        let mut pos = 0;
        let end = body.len();

        if pos + 4 > end {
            return Err(MuxError::InvalidData("PMT too short for PCR PID".into()));
        }

        pmt.pcr_pid = ((body[pos] as u16 & 0x1F) << 8) | body[pos + 1] as u16;
        let program_info_length = ((body[pos + 2] as usize & 0x0F) << 8) | body[pos + 3] as usize;
        pos += 4;

        if pos + program_info_length > end {
            return Err(MuxError::InvalidData("Program info data too short".into()));
        }
        pmt.program_descriptors = self.parse_descriptors(&body[pos..pos + program_info_length])?;
        pos += program_info_length;

        while pos + 5 <= end {
            let stream_type = body[pos];
            let elementary_pid = ((body[pos + 1] as u16 & 0x1F) << 8) | body[pos + 2] as u16;
            let es_info_length = ((body[pos + 3] as usize & 0x0F) << 8) | body[pos + 4] as usize;
            pos += 5;

            if pos + es_info_length > end {
                return Err(MuxError::InvalidData("ES info data too short".into()));
            }

            let descriptors = self.parse_descriptors(&body[pos..pos + es_info_length])?;
            pos += es_info_length;

            pmt.elementary_stream_infos.push(ElementaryStreamInfo {
                stream_type,
                elementary_pid,
                descriptors,
            });
        }

        Ok(pmt)
    }

    pub fn parse_descriptors(&self, data: &[u8]) -> Result<Vec<Descriptor>> {
        let mut descriptors = Vec::new();
        let mut pos = 0;

        while pos + 2 <= data.len() {
            let tag = data[pos];
            let length = data[pos + 1] as usize;
            pos += 2;

            if pos + length > data.len() {
                return Err(MuxError::InvalidData("Descriptor data too short".into()));
            }

            descriptors.push(Descriptor::new(tag, data[pos..pos + length].to_vec()));
            pos += length;
        }

        Ok(descriptors)
    }

    /// Reads the stream id and timestamps at the start of a PES packet.
    pub fn parse_pes_timestamps(&self, data: &[u8]) -> Result<PesTimestamps> {
        if data.len() < 9 || data[..3] != [0x00, 0x00, 0x01] {
            return Err(MuxError::InvalidData("Missing PES start code".into()));
        }
        let flags = data[7] >> 6;
        let header_data_length = data[8];
        let mut result = PesTimestamps {
            stream_id: data[3],
            pts: None,
            dts: None,
            header_data_length,
        };
        let needed = match flags {
            0b10 => 5,
            0b11 => 10,
            _ => 0,
        };
        if data.len() < 9 + needed {
            return Err(MuxError::InvalidData("PES timestamps truncated".into()));
        }
        if flags & 0b10 != 0 {
            result.pts = Some(read_timestamp(&data[9..14]));
        }
        if flags == 0b11 {
            result.dts = Some(read_timestamp(&data[14..19]));
        }
        Ok(result)
    }
}
