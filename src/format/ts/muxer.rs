//! The muxing stage.
//!
//! [`TSMuxer`] is the single owner of every piece of mutable transport
//! state in a session: PSI versions, continuity counters, the PCR clock and
//! the smoothing buffer. Producers hand it access units through
//! [`push`](TSMuxer::push); the caller then pulls one slot at a time with
//! [`next_packet`](TSMuxer::next_packet).
//!
//! Per slot the order is: PCR when due, then PSI when due, then the
//! elementary stream unit with the earliest decode time (ties go to the
//! fixed stream priority), then stuffing.

use super::clock::{ClockDiscipline, MappedTimes, TimelineAnchor, TimelineMapper};
use super::packetizer::{check_framing, null_packet, Packetizer, PesCursor};
use super::pes::{PESHeader, PESPacket, TELETEXT_HEADER_DATA_LENGTH};
use super::program::{Program, StreamEntry, StreamPriority};
use super::psi::{PsiManager, TableKind};
use super::shaper::{RateShaper, SlotClass};
use super::types::*;
use crate::av::{AccessUnit, StreamFormat};
use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::stats::MuxStats;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;

/// Units buffered per stream before the muxer stops asking for input
pub const LOOKAHEAD_UNITS: usize = 4;

/// Byte offset after which the PCR base has fully left the muxer
const PCR_BYTE_OFFSET: usize = 11;

/// One transport packet and the STC instant its slot starts
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledPacket {
    pub at: u64,
    pub pid: u16,
    pub data: Bytes,
}

impl ScheduledPacket {
    pub fn is_null(&self) -> bool {
        self.pid == PID_NULL
    }
}

#[derive(Debug)]
struct PendingUnit {
    times: MappedTimes,
    /// Earliest slot the unit may start in
    eligible: u64,
    pes: Bytes,
    random_access: bool,
    discontinuity: bool,
}

#[derive(Debug)]
struct ActiveUnit {
    cursor: PesCursor,
    dts: u64,
    eligible: u64,
    discontinuity: bool,
    near_miss: bool,
}

#[derive(Debug)]
struct StreamState {
    stream_id: u32,
    pid: u16,
    priority: StreamPriority,
    pes_stream_id: u8,
    teletext: bool,
    mapper: TimelineMapper,
    queue: VecDeque<PendingUnit>,
    active: Option<ActiveUnit>,
    /// A unit was dropped; flag the next one
    flag_next: bool,
    near_miss_front: bool,
}

impl StreamState {
    fn new(entry: &StreamEntry) -> Self {
        let mapper = match &entry.passthrough {
            Some(opts) => TimelineMapper::passthrough(entry.pid, entry.timebase(), opts.discontinuity_threshold),
            None => TimelineMapper::encoded(entry.pid, entry.timebase()),
        };
        Self {
            stream_id: entry.stream_id,
            pid: entry.pid,
            priority: entry.priority,
            pes_stream_id: entry.pes_stream_id,
            teletext: entry.format == StreamFormat::Teletext,
            mapper,
            queue: VecDeque::new(),
            active: None,
            flag_next: false,
            near_miss_front: false,
        }
    }

    /// Decode time of the unit that would go next, if it may go at `now`
    fn ready_dts(&self, now: u64) -> Option<u64> {
        match &self.active {
            Some(active) => Some(active.dts),
            None => self
                .queue
                .front()
                .filter(|unit| unit.eligible <= now)
                .map(|unit| unit.times.dts),
        }
    }

    fn activate(&mut self) {
        if self.active.is_some() {
            return;
        }
        if let Some(unit) = self.queue.pop_front() {
            self.active = Some(ActiveUnit {
                cursor: PesCursor::new(self.pid, unit.pes, unit.random_access),
                dts: unit.times.dts,
                eligible: unit.eligible,
                discontinuity: unit.discontinuity || std::mem::take(&mut self.flag_next),
                near_miss: std::mem::take(&mut self.near_miss_front),
            });
        }
    }

    fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// PID the next packet of this stream goes out on.
    ///
    /// A unit in flight finishes on the PID it started on.
    fn output_pid(&self) -> u16 {
        self.active.as_ref().map_or(self.pid, |active| active.cursor.pid)
    }
}

#[derive(Debug, Clone)]
struct QueuedSection {
    kind: TableKind,
    pid: u16,
    payload: Bytes,
    first: bool,
}

pub struct TSMuxer {
    program: Program,
    psi: PsiManager,
    clock: ClockDiscipline,
    shaper: RateShaper,
    packetizer: Packetizer,
    anchor: TimelineAnchor,
    streams: Vec<StreamState>,
    psi_queue: VecDeque<QueuedSection>,
    max_deferral: u64,
    stats: Arc<MuxStats>,
}

impl TSMuxer {
    pub fn new(program: Program, config: &MuxConfig, stats: Arc<MuxStats>) -> Result<Self> {
        config.validate()?;
        let psi = PsiManager::new(&program, config)?;
        if !config.cbr {
            let pcr_bitrate = (TS_PACKET_BITS as u128 * PCR_HZ as u128)
                .div_ceil(duration_to_ticks(config.pcr_period).max(1) as u128) as u64;
            let control = psi.bitrate() + pcr_bitrate;
            if control >= config.sb_leak_rate {
                return Err(MuxError::InvalidConfig(format!(
                    "sb_leak_rate {} bit/s cannot carry tables and PCR ({} bit/s)",
                    config.sb_leak_rate, control
                )));
            }
        }
        // Room for one full round of tables plus a PCR
        let shaper = RateShaper::new(config, psi.total_packets() + 1)?;
        let streams = program.streams.iter().map(StreamState::new).collect();

        log::info!(
            "muxer ready: {} at {} bit/s, {} streams, {} PSI packets per round",
            if config.cbr { "CBR" } else { "VBR" },
            config.ts_muxrate,
            program.streams.len(),
            psi.total_packets()
        );

        Ok(Self {
            clock: ClockDiscipline::new(config.pcr_period),
            anchor: TimelineAnchor::new(config.mux_delay),
            max_deferral: duration_to_ticks(config.max_deferral),
            program,
            psi,
            shaper,
            packetizer: Packetizer::new(),
            streams,
            psi_queue: VecDeque::new(),
            stats,
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn psi(&self) -> &PsiManager {
        &self.psi
    }

    pub fn clock(&self) -> &ClockDiscipline {
        &self.clock
    }

    pub fn shaper(&self) -> &RateShaper {
        &self.shaper
    }

    /// STC instant of the slot the next call to `next_packet` fills
    pub fn now(&self) -> u64 {
        self.shaper.slot_start()
    }

    fn stream_index(&self, stream_id: u32) -> Result<usize> {
        self.streams
            .iter()
            .position(|s| s.stream_id == stream_id)
            .ok_or(MuxError::UnknownStream(stream_id))
    }

    /// Whether the stream has room in its lookahead window.
    pub fn wants_input(&self, stream_id: u32) -> bool {
        self.stream_index(stream_id)
            .map(|i| self.streams[i].queue.len() < LOOKAHEAD_UNITS)
            .unwrap_or(false)
    }

    /// Every accepted unit has been fully emitted.
    pub fn is_drained(&self) -> bool {
        self.streams.iter().all(StreamState::is_idle)
    }

    /// Flags the next unit of a stream as discontinuous.
    pub fn mark_discontinuity(&mut self, stream_id: u32) -> Result<()> {
        let index = self.stream_index(stream_id)?;
        self.streams[index].flag_next = true;
        Ok(())
    }

    /// Accepts one access unit.
    ///
    /// Framing and ordering errors drop the unit, flag a discontinuity on the
    /// stream and are returned so the caller can log them; they are
    /// recoverable (see [`MuxError::is_recoverable`]).
    pub fn push(&mut self, stream_id: u32, unit: AccessUnit) -> Result<()> {
        let index = self.stream_index(stream_id)?;
        let now = self.shaper.slot_start();
        let mux_delay = self.anchor.mux_delay();
        let stream = &mut self.streams[index];

        if let Err(e) = check_framing(stream.pid, &unit) {
            self.stats.record_framing_error();
            stream.flag_next = true;
            return Err(e);
        }

        let times = match stream.mapper.map(&mut self.anchor, now, &unit) {
            Ok(times) => times,
            Err(e) => {
                if matches!(e, MuxError::OrderingError { .. }) {
                    self.stats.record_ordering_error();
                }
                stream.flag_next = true;
                return Err(e);
            }
        };
        if times.discontinuity {
            self.stats.record_timestamp_discontinuity();
        }

        let mut header = PESHeader::new(stream.pes_stream_id)
            .with_pts(times.pts_90k())
            .with_dts(times.dts_90k());
        if stream.teletext {
            header.min_header_data_length = Some(TELETEXT_HEADER_DATA_LENGTH);
        }
        let pes = PESPacket::new(header, unit.data).to_bytes();
        let is_video = stream.priority == StreamPriority::Video;

        stream.queue.push_back(PendingUnit {
            times,
            eligible: times.dts.saturating_sub(mux_delay).max(now),
            pes,
            random_access: unit.is_key || !is_video,
            discontinuity: times.discontinuity,
        });
        Ok(())
    }

    /// Moves a stream to another PID while running; the PMT is re-versioned
    /// and goes out at the next opportunity.
    pub fn reassign_pid(&mut self, stream_id: u32, new_pid: u16) -> Result<()> {
        let index = self.stream_index(stream_id)?;
        self.program.reassign_pid(stream_id, new_pid)?;
        let stream = &mut self.streams[index];
        stream.pid = new_pid;
        stream.mapper.set_pid(new_pid);

        let changed = self.psi.rebuild(&self.program);
        self.psi_queue.retain(|s| !changed.contains(&s.kind));
        Ok(())
    }

    fn enqueue_due_tables(&mut self, now: u64, slot_ticks: u64) {
        let kinds: Vec<TableKind> = self.psi.kinds().collect();
        for kind in kinds {
            // Everything already queued goes first, and a PCR may take one slot
            let lead = (self.psi_queue.len() as u64 + 2) * slot_ticks;
            if !self.psi.schedule(kind).is_due(now, lead) {
                continue;
            }
            let Some(table) = self.psi.table(kind) else {
                continue;
            };
            let pid = table.pid;
            log::debug!(
                "{} v{} queued at STC {} ({} packets)",
                kind,
                table.version(),
                now,
                table.payloads().len()
            );
            for (i, payload) in table.payloads().iter().enumerate() {
                self.psi_queue.push_back(QueuedSection {
                    kind,
                    pid,
                    payload: payload.clone(),
                    first: i == 0,
                });
            }
            self.psi.mark_queued(kind);
        }
    }

    /// Stream with the earliest ready decode time, ties going to priority.
    fn select_stream(&self, now: u64) -> Option<usize> {
        self.streams
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.ready_dts(now).map(|dts| (dts, s.priority, i)))
            .min()
            .map(|(_, _, i)| i)
    }

    fn pcr_stream(&self, now: u64) -> Option<usize> {
        let pcr_pid = self.program.pcr_pid;
        self.streams
            .iter()
            .position(|s| s.output_pid() == pcr_pid && s.ready_dts(now).is_some())
    }

    /// Next packet of a stream, with the PID it was written on
    fn stream_packet(&mut self, index: usize, pcr: Option<u64>) -> (u16, Bytes) {
        let stream = &mut self.streams[index];
        stream.activate();
        let Some(active) = stream.active.as_mut() else {
            return (PID_NULL, null_packet());
        };
        let pid = active.cursor.pid;
        let discontinuity = std::mem::take(&mut active.discontinuity);
        if discontinuity {
            self.packetizer.reset_counter(active.cursor.pid);
        }
        let packet = self.packetizer.pes_packet(&mut active.cursor, pcr, discontinuity);
        if active.cursor.is_done() {
            stream.active = None;
        }
        (pid, packet)
    }

    fn check_deferrals(&mut self, now: u64) -> Result<()> {
        let limit = self.max_deferral;
        for stream in &mut self.streams {
            let (eligible, near_miss) = match stream.active.as_mut() {
                Some(active) => (active.eligible, &mut active.near_miss),
                None => match stream.queue.front() {
                    Some(unit) if unit.eligible <= now => (unit.eligible, &mut stream.near_miss_front),
                    _ => continue,
                },
            };
            let waited = now - eligible.min(now);
            if waited > limit {
                let error = MuxError::RateBudgetExceeded(format!(
                    "pid 0x{:04x} waited {:?} for emission, limit {:?}",
                    stream.pid,
                    ticks_to_duration(waited),
                    ticks_to_duration(limit)
                ));
                log::error!("{}", error);
                self.stats.set_last_error(&error);
                return Err(error);
            }
            if waited > limit / 2 && !*near_miss {
                *near_miss = true;
                self.stats.record_near_miss();
                log::warn!(
                    "pid 0x{:04x} deferred {:?}, close to the rate budget",
                    stream.pid,
                    ticks_to_duration(waited)
                );
            }
        }
        Ok(())
    }

    /// Fills the current slot and advances to the next one.
    ///
    /// Returns `None` for a VBR slot the smoothing buffer leaves empty.
    pub fn next_packet(&mut self) -> Result<Option<ScheduledPacket>> {
        let now = self.shaper.slot_start();
        let slot_ticks = self.shaper.slot_ticks();

        self.enqueue_due_tables(now, slot_ticks);

        let mut emitted: Option<(u16, Bytes)> = None;

        let pcr_at = now + self.shaper.bytes_to_ticks(PCR_BYTE_OFFSET);
        if self.clock.is_due(pcr_at, slot_ticks) && self.shaper.can_send(SlotClass::Control) {
            let pcr = self.clock.stamp(pcr_at);
            self.stats.record_pcr();
            let carrier = if self.psi_queue.is_empty() && self.shaper.can_send(SlotClass::Payload) {
                self.pcr_stream(now)
            } else {
                None
            };
            emitted = Some(match carrier {
                Some(index) => self.stream_packet(index, Some(pcr)),
                None => {
                    let pid = self.program.pcr_pid;
                    log::trace!("adaptation-only PCR on 0x{:04x} at STC {}", pid, pcr_at);
                    (pid, self.packetizer.pcr_packet(pid, pcr, false))
                }
            });
        }

        if emitted.is_none() && !self.psi_queue.is_empty() && self.shaper.can_send(SlotClass::Control) {
            if let Some(section) = self.psi_queue.pop_front() {
                if section.first {
                    self.psi.mark_sent(section.kind, now);
                    self.stats.record_table(section.kind);
                }
                let packet = self.packetizer.section_packet(section.pid, section.first, &section.payload);
                emitted = Some((section.pid, packet));
            }
        }

        if emitted.is_none() && self.shaper.can_send(SlotClass::Payload) {
            if let Some(index) = self.select_stream(now) {
                emitted = Some(self.stream_packet(index, None));
            }
        }

        if emitted.is_none() && self.shaper.is_cbr() {
            emitted = Some((PID_NULL, null_packet()));
        }

        if emitted.is_some() {
            self.shaper.commit()?;
        }
        self.check_deferrals(now)?;
        self.shaper.advance();

        Ok(emitted.map(|(pid, data)| {
            self.stats.record_packet(pid == PID_NULL);
            ScheduledPacket { at: now, pid, data }
        }))
    }
}
