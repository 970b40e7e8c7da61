//! Transport packet assembly.
//!
//! Every packet leaving the muxer is built here, so this is the only place
//! that touches continuity counters.

use super::types::*;
use crate::av::AccessUnit;
use crate::error::{MuxError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Per-PID continuity counters
#[derive(Debug, Clone, Default)]
pub struct ContinuityCounters {
    map: HashMap<u16, u8>,
}

impl ContinuityCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter the next payload-bearing packet on `pid` will carry
    pub fn peek(&self, pid: u16) -> u8 {
        self.map.get(&pid).copied().unwrap_or(0)
    }

    /// Counter of the last payload-bearing packet, repeated by packets without payload
    pub fn last(&self, pid: u16) -> u8 {
        self.peek(pid).wrapping_sub(1) & 0x0f
    }

    pub fn next(&mut self, pid: u16) -> u8 {
        let entry = self.map.entry(pid).or_insert(0);
        let current = *entry;
        *entry = (current + 1) & 0x0f;
        current
    }

    /// Restarts the sequence; only legal on a packet flagged discontinuous
    pub fn reset(&mut self, pid: u16) {
        self.map.insert(pid, 0);
    }
}

/// Adaptation field contents for one packet
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdaptationLayout {
    pub discontinuity: bool,
    pub random_access: bool,
    pub pcr: Option<u64>,
}

impl AdaptationLayout {
    fn is_required(&self) -> bool {
        self.discontinuity || self.random_access || self.pcr.is_some()
    }

    /// Length byte plus flags plus PCR, before stuffing
    fn min_len(&self) -> usize {
        if !self.is_required() {
            0
        } else if self.pcr.is_some() {
            8
        } else {
            2
        }
    }
}

/// Writes a whole 188-byte packet. `af_total` counts the adaptation field
/// including its length byte; the payload must fill the rest exactly.
fn write_packet(
    pid: u16,
    payload_unit_start: bool,
    cc: u8,
    af: &AdaptationLayout,
    af_total: usize,
    payload: &[u8],
) -> Bytes {
    debug_assert_eq!(TS_HEADER_SIZE + af_total + payload.len(), TS_PACKET_SIZE);
    let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
    let header = TSHeader {
        payload_unit_start,
        adaptation_field_exists: af_total > 0,
        contains_payload: !payload.is_empty(),
        ..TSHeader::new(pid, cc)
    };
    header.write_to(&mut buf);

    if af_total > 0 {
        buf.put_u8((af_total - 1) as u8);
        if af_total > 1 {
            let mut flags = 0u8;
            if af.discontinuity {
                flags |= AF_DISCONTINUITY;
            }
            if af.random_access {
                flags |= AF_RANDOM_ACCESS;
            }
            if af.pcr.is_some() {
                flags |= AF_PCR;
            }
            buf.put_u8(flags);
            if let Some(pcr) = af.pcr {
                buf.put_slice(&encode_pcr(pcr));
            }
            let used = 2 + if af.pcr.is_some() { 6 } else { 0 };
            buf.put_bytes(0xff, af_total - used);
        }
    }
    buf.put_slice(payload);
    buf.freeze()
}

/// Null packet (PID 0x1FFF) used for CBR stuffing
pub fn null_packet() -> Bytes {
    let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
    TSHeader::new(PID_NULL, 0).write_to(&mut buf);
    buf.put_bytes(0xff, TS_PAYLOAD_SIZE);
    buf.freeze()
}

/// Rejects an access unit whose declared size disagrees with its payload.
pub fn check_framing(pid: u16, unit: &AccessUnit) -> Result<()> {
    if unit.declared_size != unit.data.len() {
        return Err(MuxError::FramingError {
            pid,
            declared: unit.declared_size,
            actual: unit.data.len(),
        });
    }
    Ok(())
}

/// Builds packets and owns the continuity counters of the session.
#[derive(Debug, Clone, Default)]
pub struct Packetizer {
    cc: ContinuityCounters,
}

impl Packetizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &ContinuityCounters {
        &self.cc
    }

    pub fn reset_counter(&mut self, pid: u16) {
        self.cc.reset(pid);
    }

    /// One packet of a PSI section, payload already padded to 184 bytes.
    pub fn section_packet(&mut self, pid: u16, payload_unit_start: bool, payload: &[u8]) -> Bytes {
        let cc = self.cc.next(pid);
        write_packet(pid, payload_unit_start, cc, &AdaptationLayout::default(), 0, payload)
    }

    /// Adaptation-only packet carrying a PCR; does not advance the counter.
    pub fn pcr_packet(&mut self, pid: u16, pcr: u64, discontinuity: bool) -> Bytes {
        let af = AdaptationLayout {
            discontinuity,
            random_access: false,
            pcr: Some(pcr),
        };
        let cc = self.cc.last(pid);
        write_packet(pid, false, cc, &af, TS_PAYLOAD_SIZE, &[])
    }

    /// Next packet of a PES in progress.
    pub fn pes_packet(&mut self, cursor: &mut PesCursor, pcr: Option<u64>, discontinuity: bool) -> Bytes {
        let first = cursor.offset == 0;
        let af = AdaptationLayout {
            discontinuity,
            random_access: first && cursor.random_access,
            pcr,
        };
        let remaining = cursor.remaining();
        let room = TS_PAYLOAD_SIZE - af.min_len();
        let take = remaining.min(room);
        let af_total = TS_PAYLOAD_SIZE - take;

        let start = cursor.offset;
        cursor.offset += take;
        let cc = self.cc.next(cursor.pid);
        write_packet(cursor.pid, first, cc, &af, af_total, &cursor.data[start..start + take])
    }
}

/// A PES waiting to be cut into transport packets.
#[derive(Debug, Clone)]
pub struct PesCursor {
    pub pid: u16,
    data: Bytes,
    offset: usize,
    random_access: bool,
}

impl PesCursor {
    pub fn new(pid: u16, data: Bytes, random_access: bool) -> Self {
        Self {
            pid,
            data,
            offset: 0,
            random_access,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    pub fn is_started(&self) -> bool {
        self.offset > 0
    }

    /// Packets left assuming no PCR or flags are added
    pub fn packets_left(&self) -> usize {
        self.remaining().div_ceil(TS_PAYLOAD_SIZE)
    }
}
