//! PAT/PMT/SDT sections and their insertion schedules.
//!
//! Sections are rebuilt from the [`Program`] whenever its composition
//! changes. A table keeps its version while its content is unchanged, so
//! periodic re-insertion only refreshes the wire bytes.

use super::descriptors::{self, Descriptor, SERVICE_TYPE_DIGITAL_RADIO, SERVICE_TYPE_DIGITAL_TV};
use super::program::Program;
use super::types::*;
use crate::config::{MuxConfig, TsType};
use crate::error::{MuxError, Result};
use crate::utils::Crc32Mpeg2;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// PSI sections may not exceed 1024 bytes
const MAX_SECTION_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Pat,
    Pmt,
    Sdt,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableKind::Pat => "PAT",
            TableKind::Pmt => "PMT",
            TableKind::Sdt => "SDT",
        })
    }
}

/// Writes a long-form section: header, body, CRC32.
pub fn build_section(
    crc: &Crc32Mpeg2,
    table_id: u8,
    table_id_extension: u16,
    version: u8,
    body: &[u8],
) -> Bytes {
    let section_length = 5 + body.len() + 4;
    let mut buf = BytesMut::with_capacity(3 + section_length);
    buf.put_u8(table_id);
    // SDT sets reserved_future_use, PAT/PMT carry the '0' bit
    let b1 = if table_id == TABLE_ID_SDT { 0xf0 } else { 0xb0 };
    buf.put_u8(b1 | ((section_length >> 8) as u8 & 0x0f));
    buf.put_u8(section_length as u8);
    buf.put_u16(table_id_extension);
    buf.put_u8(0xc0 | ((version & 0x1f) << 1) | 0x01);
    buf.put_u8(0); // section_number
    buf.put_u8(0); // last_section_number
    buf.put_slice(body);
    let value = crc.calculate(&buf);
    buf.put_u32(value);
    buf.freeze()
}

/// Splits a section into 184-byte packet payloads, pointer field first, padded with 0xff.
pub fn section_payloads(section: &[u8]) -> Vec<Bytes> {
    let mut payloads = Vec::new();
    let mut remaining = section;
    let mut first = true;
    while first || !remaining.is_empty() {
        let mut chunk = BytesMut::with_capacity(TS_PAYLOAD_SIZE);
        if first {
            chunk.put_u8(0); // pointer_field
            first = false;
        }
        let take = remaining.len().min(TS_PAYLOAD_SIZE - chunk.len());
        chunk.put_slice(&remaining[..take]);
        remaining = &remaining[take..];
        chunk.resize(TS_PAYLOAD_SIZE, 0xff);
        payloads.push(chunk.freeze());
    }
    payloads
}

pub fn pat_body(program: &Program) -> Vec<u8> {
    let mut body = Vec::with_capacity(4);
    body.extend_from_slice(&program.program_number.to_be_bytes());
    body.extend_from_slice(&(0xe000 | program.pmt_pid).to_be_bytes());
    body
}

pub fn pmt_body(program: &Program) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16(0xe000 | program.pcr_pid);
    // No program-level descriptors
    buf.put_u16(0xf000);
    for stream in &program.streams {
        let es: Vec<Descriptor> = descriptors::es_descriptors(program.ts_type, stream, &program.captions);
        buf.put_u8(stream.stream_type);
        buf.put_u16(0xe000 | stream.pid);
        buf.put_u16(0xf000 | descriptors::loop_len(&es) as u16);
        for d in &es {
            d.write_to(&mut buf);
        }
    }
    buf.to_vec()
}

pub fn sdt_body(program: &Program) -> Vec<u8> {
    let service_type = if program.has_video() {
        SERVICE_TYPE_DIGITAL_TV
    } else {
        SERVICE_TYPE_DIGITAL_RADIO
    };
    let service = descriptors::service(service_type, &program.provider_name, &program.name);

    let mut buf = BytesMut::new();
    buf.put_u16(program.original_network_id);
    buf.put_u8(0xff); // reserved_future_use
    buf.put_u16(program.program_number);
    buf.put_u8(0xfc); // no EIT
    // running_status 4 (running), free_CA_mode 0
    buf.put_u16((4 << 13) | service.len() as u16);
    service.write_to(&mut buf);
    buf.to_vec()
}

/// One versioned table
#[derive(Debug, Clone)]
pub struct PsiTable {
    pub kind: TableKind,
    pub pid: u16,
    table_id: u8,
    extension: u16,
    body: Vec<u8>,
    version: u8,
    section: Bytes,
    payloads: Vec<Bytes>,
}

impl PsiTable {
    fn new(crc: &Crc32Mpeg2, kind: TableKind, pid: u16, table_id: u8, extension: u16, body: Vec<u8>) -> Self {
        let mut table = Self {
            kind,
            pid,
            table_id,
            extension,
            body,
            version: 0,
            section: Bytes::new(),
            payloads: Vec::new(),
        };
        table.encode(crc);
        table
    }

    fn encode(&mut self, crc: &Crc32Mpeg2) {
        self.section = build_section(crc, self.table_id, self.extension, self.version, &self.body);
        self.payloads = section_payloads(&self.section);
    }

    /// Replaces the content; bumps the version only when something changed.
    pub fn update(&mut self, crc: &Crc32Mpeg2, pid: u16, extension: u16, body: Vec<u8>) -> bool {
        if body == self.body && pid == self.pid && extension == self.extension {
            return false;
        }
        self.pid = pid;
        self.extension = extension;
        self.body = body;
        self.version = (self.version + 1) & 0x1f;
        self.encode(crc);
        true
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn section(&self) -> &Bytes {
        &self.section
    }

    pub fn payloads(&self) -> &[Bytes] {
        &self.payloads
    }
}

/// Insertion cadence of one table, in 27 MHz ticks.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub period: u64,
    last_sent: Option<u64>,
    in_flight: bool,
    pub insertions: u64,
}

impl Schedule {
    pub fn new(period: u64) -> Self {
        Self {
            period,
            last_sent: None,
            in_flight: false,
            insertions: 0,
        }
    }

    /// Latest instant the next insertion may start
    pub fn deadline(&self) -> u64 {
        self.last_sent.map_or(0, |t| t + self.period)
    }

    /// Whether insertion must begin now for its first packet to land within `lead` ticks of the deadline
    pub fn is_due(&self, now: u64, lead: u64) -> bool {
        !self.in_flight && now + lead >= self.deadline()
    }

    pub fn last_sent(&self) -> Option<u64> {
        self.last_sent
    }
}

/// Owns the tables of one session and decides when each is inserted.
#[derive(Clone)]
pub struct PsiManager {
    crc: Crc32Mpeg2,
    pat: PsiTable,
    pmt: PsiTable,
    sdt: Option<PsiTable>,
    pat_schedule: Schedule,
    pmt_schedule: Schedule,
    sdt_schedule: Schedule,
}

impl PsiManager {
    /// Fails when the PMT does not fit one section.
    pub fn new(program: &Program, config: &MuxConfig) -> Result<Self> {
        let crc = Crc32Mpeg2::new();
        let pat = PsiTable::new(&crc, TableKind::Pat, PID_PAT, TABLE_ID_PAT, program.ts_id, pat_body(program));
        let pmt = PsiTable::new(
            &crc,
            TableKind::Pmt,
            program.pmt_pid,
            TABLE_ID_PMT,
            program.program_number,
            pmt_body(program),
        );
        let sdt = (program.ts_type == TsType::Dvb).then(|| {
            PsiTable::new(&crc, TableKind::Sdt, PID_SDT, TABLE_ID_SDT, program.ts_id, sdt_body(program))
        });
        if pmt.section.len() > MAX_SECTION_SIZE {
            return Err(MuxError::InvalidConfig(format!(
                "PMT section would be {} bytes, more than {} allowed",
                pmt.section.len(),
                MAX_SECTION_SIZE
            )));
        }

        Ok(Self {
            crc,
            pat,
            pmt,
            sdt,
            pat_schedule: Schedule::new(duration_to_ticks(config.pat_period)),
            pmt_schedule: Schedule::new(duration_to_ticks(config.effective_pmt_period())),
            sdt_schedule: Schedule::new(duration_to_ticks(config.sdt_period)),
        })
    }

    pub fn table(&self, kind: TableKind) -> Option<&PsiTable> {
        match kind {
            TableKind::Pat => Some(&self.pat),
            TableKind::Pmt => Some(&self.pmt),
            TableKind::Sdt => self.sdt.as_ref(),
        }
    }

    pub fn schedule(&self, kind: TableKind) -> &Schedule {
        match kind {
            TableKind::Pat => &self.pat_schedule,
            TableKind::Pmt => &self.pmt_schedule,
            TableKind::Sdt => &self.sdt_schedule,
        }
    }

    fn schedule_mut(&mut self, kind: TableKind) -> &mut Schedule {
        match kind {
            TableKind::Pat => &mut self.pat_schedule,
            TableKind::Pmt => &mut self.pmt_schedule,
            TableKind::Sdt => &mut self.sdt_schedule,
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = TableKind> + '_ {
        [TableKind::Pat, TableKind::Pmt, TableKind::Sdt]
            .into_iter()
            .filter(move |kind| self.table(*kind).is_some())
    }

    /// Packets needed to carry every table once
    pub fn total_packets(&self) -> usize {
        self.kinds()
            .filter_map(|kind| self.table(kind))
            .map(|t| t.payloads.len())
            .sum()
    }

    /// Bits per second the tables take at their repetition periods, rounded up
    pub fn bitrate(&self) -> u64 {
        self.kinds()
            .filter_map(|kind| {
                let packets = self.table(kind)?.payloads.len() as u128;
                let period = self.schedule(kind).period.max(1) as u128;
                Some((packets * TS_PACKET_BITS as u128 * PCR_HZ as u128).div_ceil(period) as u64)
            })
            .sum()
    }

    /// The table has been handed to the packet queue.
    pub fn mark_queued(&mut self, kind: TableKind) {
        self.schedule_mut(kind).in_flight = true;
    }

    /// The first packet of the table went out at `at`.
    pub fn mark_sent(&mut self, kind: TableKind, at: u64) {
        let schedule = self.schedule_mut(kind);
        if let Some(last) = schedule.last_sent {
            if at > last + schedule.period {
                log::warn!(
                    "{} inserted {} ticks past its deadline",
                    kind,
                    at - last - schedule.period
                );
            }
        }
        schedule.last_sent = Some(at);
        schedule.in_flight = false;
        schedule.insertions += 1;
    }

    /// Makes a table due at the next opportunity.
    pub fn force(&mut self, kind: TableKind) {
        let schedule = self.schedule_mut(kind);
        schedule.last_sent = None;
        schedule.in_flight = false;
    }

    /// Rebuilds every table from the program; returns the tables whose version changed.
    pub fn rebuild(&mut self, program: &Program) -> Vec<TableKind> {
        let crc = &self.crc;
        let mut changed = Vec::new();
        if self.pat.update(crc, PID_PAT, program.ts_id, pat_body(program)) {
            changed.push(TableKind::Pat);
        }
        if self.pmt.update(crc, program.pmt_pid, program.program_number, pmt_body(program)) {
            changed.push(TableKind::Pmt);
        }
        if let Some(sdt) = self.sdt.as_mut() {
            if sdt.update(crc, PID_SDT, program.ts_id, sdt_body(program)) {
                changed.push(TableKind::Sdt);
            }
        }
        for kind in &changed {
            if let Some(table) = self.table(*kind) {
                log::info!("{} now at version {}", kind, table.version());
            }
            self.force(*kind);
        }
        changed
    }
}
