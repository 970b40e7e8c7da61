//! Output rate shaping.
//!
//! Time is divided into packet slots of 1504 bits at `ts_muxrate`. Slot `n`
//! starts at `n * 1504 * 27e6 / ts_muxrate` STC ticks, computed exactly in
//! integers so the slot clock never drifts. In CBR mode every slot carries a
//! packet (nulls when nothing else is ready). In VBR mode a leaky bucket
//! decides whether a slot may carry a packet at all; slots it refuses stay
//! empty on the wire.

use super::types::*;
use crate::config::MuxConfig;
use crate::error::{MuxError, Result};

/// Smoothing buffer model.
///
/// Fill is kept in bit-ticks (bits × 27 MHz) so that draining `rate` bits per
/// second over `dt` ticks is the exact integer `rate * dt`.
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    capacity: u128,
    fill: u128,
    leak_rate: u64,
    last_drain: u64,
}

impl LeakyBucket {
    /// `size` in bytes, `leak_rate` in bits per second
    pub fn new(size: usize, leak_rate: u64) -> Self {
        Self {
            capacity: size as u128 * 8 * PCR_HZ as u128,
            fill: 0,
            leak_rate,
            last_drain: 0,
        }
    }

    /// Drains the bucket up to STC instant `now`.
    pub fn drain_to(&mut self, now: u64) {
        if now <= self.last_drain {
            return;
        }
        let drained = self.leak_rate as u128 * (now - self.last_drain) as u128;
        self.fill = self.fill.saturating_sub(drained);
        self.last_drain = now;
    }

    /// Whether `bits` fit while keeping `reserve_bits` free.
    pub fn can_admit(&self, bits: u64, reserve_bits: u64) -> bool {
        self.fill + (bits + reserve_bits) as u128 * PCR_HZ as u128 <= self.capacity
    }

    pub fn admit(&mut self, bits: u64) -> Result<()> {
        let fill = self.fill + bits as u128 * PCR_HZ as u128;
        if fill > self.capacity {
            return Err(MuxError::RateBudgetExceeded(format!(
                "{} bits do not fit the smoothing buffer ({} of {} bits used)",
                bits,
                self.fill_bits(),
                self.capacity_bits()
            )));
        }
        self.fill = fill;
        Ok(())
    }

    /// Current fill in bits, rounded up
    pub fn fill_bits(&self) -> u64 {
        self.fill.div_ceil(PCR_HZ as u128) as u64
    }

    pub fn capacity_bits(&self) -> u64 {
        (self.capacity / PCR_HZ as u128) as u64
    }

    pub fn leak_rate(&self) -> u64 {
        self.leak_rate
    }
}

/// Which class of packet is asking for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClass {
    /// PCR and PSI: may use the reserve
    Control,
    /// Elementary stream payload: must leave the reserve free
    Payload,
}

/// Slot clock plus optional smoothing buffer.
#[derive(Debug, Clone)]
pub struct RateShaper {
    muxrate: u64,
    slot: u64,
    bucket: Option<LeakyBucket>,
    reserve_bits: u64,
    packets: u64,
}

impl RateShaper {
    /// `reserve_packets` is the room kept free in the bucket for control packets.
    pub fn new(config: &MuxConfig, reserve_packets: usize) -> Result<Self> {
        let reserve_bits = reserve_packets as u64 * TS_PACKET_BITS;
        let bucket = if config.cbr {
            None
        } else {
            let bucket = LeakyBucket::new(config.sb_size, config.sb_leak_rate);
            if bucket.capacity_bits() < reserve_bits + TS_PACKET_BITS {
                return Err(MuxError::InvalidConfig(format!(
                    "sb_size {} bytes cannot hold the {} bytes of tables and PCR plus one packet",
                    config.sb_size,
                    reserve_bits / 8
                )));
            }
            Some(bucket)
        };
        Ok(Self {
            muxrate: config.ts_muxrate,
            slot: 0,
            bucket,
            reserve_bits,
            packets: 0,
        })
    }

    pub fn is_cbr(&self) -> bool {
        self.bucket.is_none()
    }

    pub fn bucket(&self) -> Option<&LeakyBucket> {
        self.bucket.as_ref()
    }

    /// Index of the current slot
    pub fn slot(&self) -> u64 {
        self.slot
    }

    pub fn slot_start_of(&self, slot: u64) -> u64 {
        (slot as u128 * TS_PACKET_BITS as u128 * PCR_HZ as u128 / self.muxrate as u128) as u64
    }

    /// STC instant at which the current slot starts
    pub fn slot_start(&self) -> u64 {
        self.slot_start_of(self.slot)
    }

    /// Length of the current slot in ticks
    pub fn slot_ticks(&self) -> u64 {
        self.slot_start_of(self.slot + 1) - self.slot_start()
    }

    /// Ticks taken to transmit `bytes` at the mux rate
    pub fn bytes_to_ticks(&self, bytes: usize) -> u64 {
        (bytes as u128 * 8 * PCR_HZ as u128 / self.muxrate as u128) as u64
    }

    /// Whether the current slot may carry a packet of `class`.
    pub fn can_send(&self, class: SlotClass) -> bool {
        match &self.bucket {
            None => true,
            Some(bucket) => match class {
                SlotClass::Control => bucket.can_admit(TS_PACKET_BITS, 0),
                SlotClass::Payload => bucket.can_admit(TS_PACKET_BITS, self.reserve_bits),
            },
        }
    }

    /// Accounts a packet sent in the current slot.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(bucket) = self.bucket.as_mut() {
            bucket.admit(TS_PACKET_BITS)?;
        }
        self.packets += 1;
        Ok(())
    }

    /// Moves on to the next slot.
    pub fn advance(&mut self) {
        self.slot += 1;
        let now = self.slot_start();
        if let Some(bucket) = self.bucket.as_mut() {
            bucket.drain_to(now);
        }
    }

    /// Packets committed so far
    pub fn packets(&self) -> u64 {
        self.packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_slot_clock_is_exact() {
        let shaper = RateShaper::new(&MuxConfig::new(Default::default(), 5_000_000), 0).unwrap();
        // 5 Mbit/s: one second holds 5e6 / 1504 slots
        let slots_per_second = 5_000_000 / TS_PACKET_BITS;
        assert!(shaper.slot_start_of(slots_per_second) <= PCR_HZ);
        assert!(shaper.slot_start_of(slots_per_second + 1) > PCR_HZ);
        assert_eq!(shaper.slot_start_of(5_000_000), 1504 * PCR_HZ);
    }

    #[test]
    fn test_bucket_drains_at_leak_rate() {
        let mut bucket = LeakyBucket::new(1000, 8000);
        bucket.admit(8000).unwrap();
        assert_eq!(bucket.fill_bits(), 8000);
        assert!(bucket.admit(1).is_err());
        bucket.drain_to(PCR_HZ / 2);
        assert_eq!(bucket.fill_bits(), 4000);
        bucket.drain_to(PCR_HZ * 3);
        assert_eq!(bucket.fill_bits(), 0);
    }

    #[test]
    fn test_payload_leaves_reserve() {
        let config = MuxConfig::default().vbr(1_000_000, 4 * 188);
        let mut shaper = RateShaper::new(&config, 2).unwrap();
        assert!(shaper.can_send(SlotClass::Payload));
        shaper.commit().unwrap();
        shaper.commit().unwrap();
        assert!(!shaper.can_send(SlotClass::Payload));
        assert!(shaper.can_send(SlotClass::Control));
    }

    #[test]
    fn test_bucket_too_small_for_tables() {
        let config = MuxConfig::default().vbr(1_000_000, 2 * 188);
        assert!(matches!(
            RateShaper::new(&config, 2),
            Err(MuxError::InvalidConfig(_))
        ));
    }

    #[quickcheck]
    fn prop_bucket_stays_within_bounds(steps: Vec<(bool, u8)>) -> bool {
        let config = MuxConfig::default().vbr(2_000_000, 8192);
        let mut shaper = match RateShaper::new(&config, 3) {
            Ok(shaper) => shaper,
            Err(_) => return false,
        };
        for (payload, advance) in steps {
            let class = if payload { SlotClass::Payload } else { SlotClass::Control };
            if shaper.can_send(class) && shaper.commit().is_err() {
                return false;
            }
            for _ in 0..advance % 4 {
                shaper.advance();
            }
            let bucket = shaper.bucket().map(|b| (b.fill_bits(), b.capacity_bits()));
            match bucket {
                Some((fill, capacity)) if fill <= capacity => {}
                _ => return false,
            }
        }
        true
    }
}
