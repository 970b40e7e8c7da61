//! Session counters.
//!
//! The muxing stage and the output transport update these from their own
//! tasks; the embedding process reads them through [`MuxStats::snapshot`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::format::ts::psi::TableKind;

/// Live counters of one session.
#[derive(Debug)]
pub struct MuxStats {
    started_at: Mutex<Option<DateTime<Utc>>>,
    packets: AtomicU64,
    null_packets: AtomicU64,
    datagrams: AtomicU64,
    bytes_sent: AtomicU64,
    pcr_insertions: AtomicU64,
    pat_insertions: AtomicU64,
    pmt_insertions: AtomicU64,
    sdt_insertions: AtomicU64,
    transport_discontinuities: AtomicU64,
    framing_errors: AtomicU64,
    ordering_errors: AtomicU64,
    dropped_units: AtomicU64,
    rate_budget_near_misses: AtomicU64,
    timestamp_discontinuities: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time copy of [`MuxStats`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub started_at: Option<DateTime<Utc>>,
    pub packets: u64,
    pub null_packets: u64,
    pub datagrams: u64,
    pub bytes_sent: u64,
    pub pcr_insertions: u64,
    pub pat_insertions: u64,
    pub pmt_insertions: u64,
    pub sdt_insertions: u64,
    pub transport_discontinuities: u64,
    pub framing_errors: u64,
    pub ordering_errors: u64,
    pub dropped_units: u64,
    pub rate_budget_near_misses: u64,
    pub timestamp_discontinuities: u64,
    pub last_error: Option<String>,
}

impl Default for MuxStats {
    fn default() -> Self {
        Self {
            started_at: Mutex::new(None),
            packets: AtomicU64::new(0),
            null_packets: AtomicU64::new(0),
            datagrams: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            pcr_insertions: AtomicU64::new(0),
            pat_insertions: AtomicU64::new(0),
            pmt_insertions: AtomicU64::new(0),
            sdt_insertions: AtomicU64::new(0),
            transport_discontinuities: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            ordering_errors: AtomicU64::new(0),
            dropped_units: AtomicU64::new(0),
            rate_budget_near_misses: AtomicU64::new(0),
            timestamp_discontinuities: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }
}

impl MuxStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_started(&self) {
        *self.started_at.lock() = Some(Utc::now());
    }

    pub fn record_packet(&self, is_null: bool) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        if is_null {
            self.null_packets.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_datagram(&self, bytes: usize) {
        self.datagrams.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_pcr(&self) {
        self.pcr_insertions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_table(&self, kind: TableKind) {
        let counter = match kind {
            TableKind::Pat => &self.pat_insertions,
            TableKind::Pmt => &self.pmt_insertions,
            TableKind::Sdt => &self.sdt_insertions,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A datagram could not be sent; receivers will see a gap.
    pub fn record_transport_discontinuity(&self) {
        self.transport_discontinuities.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
        self.dropped_units.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ordering_error(&self) {
        self.ordering_errors.fetch_add(1, Ordering::Relaxed);
        self.dropped_units.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_near_miss(&self) {
        self.rate_budget_near_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timestamp_discontinuity(&self) {
        self.timestamp_discontinuities.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, error: &crate::MuxError) {
        *self.last_error.lock() = Some(error.to_string());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started_at: *self.started_at.lock(),
            packets: self.packets.load(Ordering::Relaxed),
            null_packets: self.null_packets.load(Ordering::Relaxed),
            datagrams: self.datagrams.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            pcr_insertions: self.pcr_insertions.load(Ordering::Relaxed),
            pat_insertions: self.pat_insertions.load(Ordering::Relaxed),
            pmt_insertions: self.pmt_insertions.load(Ordering::Relaxed),
            sdt_insertions: self.sdt_insertions.load(Ordering::Relaxed),
            transport_discontinuities: self.transport_discontinuities.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            ordering_errors: self.ordering_errors.load(Ordering::Relaxed),
            dropped_units: self.dropped_units.load(Ordering::Relaxed),
            rate_budget_near_misses: self.rate_budget_near_misses.load(Ordering::Relaxed),
            timestamp_discontinuities: self.timestamp_discontinuities.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

impl StatsSnapshot {
    /// Seconds since the session started, if it has
    pub fn uptime_secs(&self) -> Option<i64> {
        self.started_at.map(|t| (Utc::now() - t).num_seconds())
    }
}
