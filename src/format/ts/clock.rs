//! The system time clock of a session and the mapping of stream timestamps onto it.
//!
//! The STC is a plain 27 MHz tick count starting at zero when the muxer
//! starts. It is driven by the slot clock of the rate shaper, never by the
//! wall clock, so PCR values are exact by construction. Each stream maps
//! its own timeline onto the STC through a [`TimelineMapper`]. Mappers take
//! their first offset from one shared [`TimelineAnchor`] so that audio and
//! video stay in sync, then keep it until their own source timeline breaks.

use super::types::*;
use crate::av::{AccessUnit, Timebase};
use crate::error::{MuxError, Result};
use std::time::Duration;

/// PCR cadence on the PCR PID.
#[derive(Debug, Clone)]
pub struct ClockDiscipline {
    period: u64,
    last_pcr: Option<u64>,
    max_gap: u64,
    insertions: u64,
}

impl ClockDiscipline {
    pub fn new(pcr_period: Duration) -> Self {
        Self {
            period: duration_to_ticks(pcr_period),
            last_pcr: None,
            max_gap: 0,
            insertions: 0,
        }
    }

    /// Whether a PCR stamped at `at` must go into the current slot.
    ///
    /// The next opportunity is one slot later; if that would stretch the gap
    /// past the period, the PCR goes out now.
    pub fn is_due(&self, at: u64, slot_ticks: u64) -> bool {
        match self.last_pcr {
            None => true,
            Some(last) => at + slot_ticks > last + self.period,
        }
    }

    /// Records a PCR insertion and returns the value to write.
    ///
    /// `at` is the STC instant the PCR base's last byte crosses the output.
    pub fn stamp(&mut self, at: u64) -> u64 {
        if let Some(last) = self.last_pcr {
            self.max_gap = self.max_gap.max(at - last);
        }
        self.last_pcr = Some(at);
        self.insertions += 1;
        at % PCR_WRAP
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    /// Largest spacing observed between two PCRs
    pub fn max_gap(&self) -> u64 {
        self.max_gap
    }

    pub fn insertions(&self) -> u64 {
        self.insertions
    }
}

/// Offset handed to every stream of the session.
///
/// A stream holds on to the offset it was given. Only a discontinuity on
/// that stream's own source timeline makes it ask for a new one.
#[derive(Debug, Clone)]
pub struct TimelineAnchor {
    mux_delay: u64,
    offset: Option<i128>,
    reanchored_at: Option<u64>,
    /// Sibling streams re-anchoring within this window reuse the new offset
    window: u64,
}

impl TimelineAnchor {
    pub fn new(mux_delay: Duration) -> Self {
        Self {
            mux_delay: duration_to_ticks(mux_delay),
            offset: None,
            reanchored_at: None,
            window: PCR_HZ,
        }
    }

    pub fn mux_delay(&self) -> u64 {
        self.mux_delay
    }

    fn offset_for(&mut self, now: u64, source_dts: i128) -> i128 {
        *self
            .offset
            .get_or_insert((now + self.mux_delay) as i128 - source_dts)
    }

    fn reanchor(&mut self, now: u64, source_dts: i128, floor: u64) -> i128 {
        if let (Some(at), Some(offset)) = (self.reanchored_at, self.offset) {
            if now.saturating_sub(at) <= self.window {
                return offset;
            }
        }
        let target = (now + self.mux_delay).max(floor);
        let offset = target as i128 - source_dts;
        log::info!(
            "timeline re-anchored at STC {} (offset {} -> {})",
            now,
            self.offset.unwrap_or(0),
            offset
        );
        self.offset = Some(offset);
        self.reanchored_at = Some(now);
        offset
    }
}

/// Output timestamps of one access unit, in STC ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedTimes {
    pub pts: u64,
    pub dts: u64,
    /// The unit starts a new timeline on its PID
    pub discontinuity: bool,
}

impl MappedTimes {
    pub fn pts_90k(&self) -> u64 {
        ticks_to_pts(self.pts)
    }

    pub fn dts_90k(&self) -> u64 {
        ticks_to_pts(self.dts)
    }
}

/// Maps one stream's timestamps onto the STC.
#[derive(Debug, Clone)]
pub struct TimelineMapper {
    pid: u16,
    timebase: Timebase,
    passthrough: bool,
    threshold: u64,
    last_source_dts: Option<i128>,
    last_source_pcr: Option<u64>,
    last_out_dts: Option<u64>,
    /// Offset of the source timeline this stream is currently on
    offset: Option<i128>,
}

impl TimelineMapper {
    pub fn encoded(pid: u16, timebase: Timebase) -> Self {
        Self {
            pid,
            timebase,
            passthrough: false,
            threshold: 0,
            last_source_dts: None,
            last_source_pcr: None,
            last_out_dts: None,
            offset: None,
        }
    }

    /// Passthrough streams prefer the source's 90 kHz clock when the unit
    /// carries it, and detect discontinuities on it.
    pub fn passthrough(pid: u16, timebase: Timebase, discontinuity_threshold: Duration) -> Self {
        Self {
            passthrough: true,
            threshold: duration_to_ticks(discontinuity_threshold),
            ..Self::encoded(pid, timebase)
        }
    }

    pub fn set_pid(&mut self, pid: u16) {
        self.pid = pid;
    }

    pub fn last_out_dts(&self) -> Option<u64> {
        self.last_out_dts
    }

    fn source_times(&self, unit: &AccessUnit) -> (i128, i128) {
        match (self.passthrough, unit.passthrough) {
            (true, Some(timing)) => {
                let pts = (timing.pts & PTS_MASK) as i128 * 300;
                let dts = timing.dts.map_or(pts, |d| (d & PTS_MASK) as i128 * 300);
                (pts, dts)
            }
            _ => (
                self.timebase.to_27mhz(unit.pts),
                self.timebase.to_27mhz(unit.decode_ts()),
            ),
        }
    }

    fn is_source_discontinuity(&self, unit: &AccessUnit, source_dts: i128) -> bool {
        let timing = match unit.passthrough {
            Some(timing) if self.passthrough => timing,
            _ => return false,
        };
        if timing.discontinuity {
            return true;
        }
        if let Some(last) = self.last_source_dts {
            // Backwards covers a 33-bit wrap of the source clock as well
            if source_dts < last || (source_dts - last) as u64 > self.threshold {
                return true;
            }
        }
        if let (Some(pcr), Some(last)) = (timing.pcr, self.last_source_pcr) {
            if pcr < last || pcr - last > self.threshold {
                return true;
            }
        }
        false
    }

    /// Maps a unit arriving at STC `now`.
    ///
    /// Encoded streams must present non-decreasing decode times; a unit going
    /// backwards is an `OrderingError` and the caller drops it.
    pub fn map(&mut self, anchor: &mut TimelineAnchor, now: u64, unit: &AccessUnit) -> Result<MappedTimes> {
        let (source_pts, source_dts) = self.source_times(unit);

        let discontinuity = self.is_source_discontinuity(unit, source_dts);
        if !self.passthrough {
            if let Some(last) = self.last_source_dts {
                if source_dts < last {
                    return Err(MuxError::OrderingError {
                        pid: self.pid,
                        dts: unit.decode_ts(),
                        previous: self.timebase_value(last),
                    });
                }
            }
        }

        let offset = if discontinuity {
            let floor = self.last_out_dts.map_or(0, |d| d + 1);
            log::warn!("pid 0x{:04x}: source timeline discontinuity", self.pid);
            let offset = anchor.reanchor(now, source_dts, floor);
            self.offset = Some(offset);
            offset
        } else {
            *self
                .offset
                .get_or_insert_with(|| anchor.offset_for(now, source_dts))
        };

        let dts = (source_dts + offset).max(0) as u64;
        let pts = ((source_pts + offset).max(0) as u64).max(dts);

        self.last_source_dts = Some(source_dts);
        if let Some(pcr) = unit.passthrough.and_then(|t| t.pcr) {
            self.last_source_pcr = Some(pcr);
        }
        self.last_out_dts = Some(dts);

        Ok(MappedTimes {
            pts,
            dts,
            discontinuity,
        })
    }

    fn timebase_value(&self, ticks: i128) -> i64 {
        if !self.timebase.is_valid() {
            return 0;
        }
        (ticks * self.timebase.den as i128 / (self.timebase.num as i128 * PCR_HZ as i128)) as i64
    }
}
