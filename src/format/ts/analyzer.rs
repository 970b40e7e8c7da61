//! Conformance checks over an emitted transport stream.
//!
//! [`TsAnalyzer`] reads packets back the way a receiver would and records
//! what a monitoring receiver looks at: continuity counter errors, PCR spacing
//! and accuracy, table repetition and versions, PES timing against the
//! moment the packet left the mux.

use super::parser::{PMTInfo, TSPacketParser};
use super::types::*;
use crate::error::{MuxError, Result};
use std::collections::{BTreeMap, HashMap};

/// Repetition of one table (keyed by PID and table id)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableStats {
    pub count: u64,
    /// Versions in the order they were first seen
    pub versions: Vec<u8>,
    /// Largest gap between two insertions, in ticks
    pub max_gap: u64,
    last_at: Option<u64>,
}

#[derive(Debug, Default)]
struct PidState {
    last_cc: Option<u8>,
    last_pcr: Option<(u64, u64)>,
    last_dts: Option<u64>,
    section: Vec<u8>,
}

/// Stream-wide findings
#[derive(Debug, Default)]
pub struct TsAnalyzer {
    parser: TSPacketParser,
    muxrate: u64,
    pids: HashMap<u16, PidState>,
    pmt_pids: Vec<u16>,
    pub packets: u64,
    pub null_packets: u64,
    pub cc_errors: u64,
    pub pcr_count: u64,
    /// Largest spacing between PCRs on one PID, in ticks
    pub max_pcr_gap: u64,
    pub pcr_backwards: u64,
    /// `(emission instant, pcr value)` for every PCR seen
    pub pcr_samples: Vec<(u64, u64)>,
    pub tables: BTreeMap<(u16, u8), TableStats>,
    pub pmt: Option<PMTInfo>,
    pub dts_backwards: u64,
    /// PES packets whose first byte left after their decode time
    pub late_pes: u64,
    pub discontinuity_flags: u64,
}

impl TsAnalyzer {
    /// `muxrate` places packets fed without an explicit instant.
    pub fn new(muxrate: u64) -> Self {
        Self {
            muxrate,
            ..Default::default()
        }
    }

    /// Feeds back-to-back packets as they would arrive at `muxrate`.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        if data.len() % TS_PACKET_SIZE != 0 {
            return Err(MuxError::InvalidData(format!(
                "{} bytes is not a whole number of packets",
                data.len()
            )));
        }
        for packet in data.chunks(TS_PACKET_SIZE) {
            let at = (self.packets as u128 * TS_PACKET_BITS as u128 * PCR_HZ as u128
                / self.muxrate.max(1) as u128) as u64;
            self.feed_at(at, packet)?;
        }
        Ok(())
    }

    /// Feeds one packet that started leaving the mux at STC `at`.
    pub fn feed_at(&mut self, at: u64, packet: &[u8]) -> Result<()> {
        let header = self.parser.parse_header(packet)?;
        self.packets += 1;
        if header.pid == PID_NULL {
            self.null_packets += 1;
            return Ok(());
        }

        let af = self.parser.parse_adaptation_field(packet)?;
        let discontinuity = af.as_ref().is_some_and(|af| af.discontinuity);
        if discontinuity {
            self.discontinuity_flags += 1;
        }

        let state = self.pids.entry(header.pid).or_default();
        if let Some(last) = state.last_cc {
            let expected = if header.contains_payload {
                (last + 1) & 0x0f
            } else {
                last
            };
            if header.continuity_counter != expected && !discontinuity {
                log::debug!(
                    "pid 0x{:04x}: cc {} after {}",
                    header.pid,
                    header.continuity_counter,
                    last
                );
                self.cc_errors += 1;
            }
        }
        state.last_cc = Some(header.continuity_counter);

        if let Some(pcr) = af.and_then(|af| af.pcr) {
            self.pcr_count += 1;
            self.pcr_samples.push((at, pcr));
            if let Some((last_at, last_pcr)) = state.last_pcr {
                if pcr < last_pcr && !discontinuity {
                    self.pcr_backwards += 1;
                }
                self.max_pcr_gap = self.max_pcr_gap.max(at.saturating_sub(last_at));
            }
            state.last_pcr = Some((at, pcr));
        }

        if !header.contains_payload {
            return Ok(());
        }
        let payload = self.parser.payload(packet)?.to_vec();

        if header.pid == PID_PAT || header.pid == PID_SDT || self.pmt_pids.contains(&header.pid) {
            self.collect_section(at, header.pid, header.payload_unit_start, &payload)
        } else {
            if header.payload_unit_start {
                self.check_pes(at, header.pid, discontinuity, &payload)?;
            }
            Ok(())
        }
    }

    fn collect_section(&mut self, at: u64, pid: u16, start: bool, payload: &[u8]) -> Result<()> {
        let state = self.pids.entry(pid).or_default();
        if start {
            let pointer = payload.first().copied().unwrap_or(0) as usize;
            state.section = payload.get(1 + pointer..).unwrap_or_default().to_vec();
        } else if !state.section.is_empty() {
            state.section.extend_from_slice(payload);
        }

        if state.section.len() < 3 {
            return Ok(());
        }
        let length = 3 + ((((state.section[1] & 0x0f) as usize) << 8) | state.section[2] as usize);
        if state.section.len() < length {
            return Ok(());
        }
        let bytes = std::mem::take(&mut state.section);
        let section = self.parser.parse_section(&bytes[..length])?;

        let stats = self.tables.entry((pid, section.table_id)).or_default();
        stats.count += 1;
        if stats.versions.last() != Some(&section.version) {
            stats.versions.push(section.version);
        }
        if let Some(last) = stats.last_at {
            stats.max_gap = stats.max_gap.max(at - last);
        }
        stats.last_at = Some(at);

        match section.table_id {
            TABLE_ID_PAT => {
                self.pmt_pids = self
                    .parser
                    .parse_pat(&section.body)?
                    .into_iter()
                    .filter(|entry| entry.program_number != 0)
                    .map(|entry| entry.program_map_pid)
                    .collect();
            }
            TABLE_ID_PMT => self.pmt = Some(self.parser.parse_pmt(&section.body)?),
            _ => {}
        }
        Ok(())
    }

    fn check_pes(&mut self, at: u64, pid: u16, discontinuity: bool, payload: &[u8]) -> Result<()> {
        let timestamps = self.parser.parse_pes_timestamps(payload)?;
        let dts = match timestamps.dts.or(timestamps.pts) {
            Some(dts) => dts,
            None => return Ok(()),
        };
        let state = self.pids.entry(pid).or_default();
        if let Some(last) = state.last_dts {
            if dts < last && !discontinuity {
                self.dts_backwards += 1;
            }
        }
        state.last_dts = Some(dts);
        if at > dts * 300 {
            self.late_pes += 1;
        }
        Ok(())
    }

    /// Stats of the table with `table_id` on `pid`
    pub fn table(&self, pid: u16, table_id: u8) -> Option<&TableStats> {
        self.tables.get(&(pid, table_id))
    }

    /// Largest difference between a PCR value and its ideal `at + offset_ticks`.
    pub fn max_pcr_error(&self, offset_ticks: u64) -> u64 {
        self.pcr_samples
            .iter()
            .map(|&(at, pcr)| ((at + offset_ticks) % PCR_WRAP).abs_diff(pcr))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ts::packetizer::{null_packet, Packetizer};
    use bytes::Bytes;

    #[test]
    fn test_cc_rules() {
        let mut packetizer = Packetizer::new();
        let mut analyzer = TsAnalyzer::new(1_000_000);
        let payload = Bytes::from_static(&[0u8; 10]);

        analyzer.feed(&packetizer.section_packet(0x20, false, &payload)).unwrap();
        analyzer.feed(&packetizer.pcr_packet(0x20, 0, false)).unwrap();
        analyzer.feed(&packetizer.section_packet(0x20, false, &payload)).unwrap();
        analyzer.feed(&null_packet()).unwrap();
        assert_eq!(analyzer.cc_errors, 0);
        assert_eq!(analyzer.null_packets, 1);

        packetizer.section_packet(0x20, false, &payload);
        analyzer.feed(&packetizer.section_packet(0x20, false, &payload)).unwrap();
        assert_eq!(analyzer.cc_errors, 1);
    }

    #[test]
    fn test_rejects_partial_packets() {
        let mut analyzer = TsAnalyzer::new(1_000_000);
        assert!(analyzer.feed(&[0x47; 100]).is_err());
    }

    #[test]
    fn test_debug_output() {
        let analyzer = TsAnalyzer::new(1_000_000);
        let text = format!("{:?}", analyzer);
        assert!(text.starts_with("TsAnalyzer {"));
        assert!(text.contains("muxrate: 1000000"));
    }
}
