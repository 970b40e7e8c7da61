use super::types::*;
use crate::config::TsType;
use crate::error::{MuxError, Result};
use std::collections::BTreeMap;

/// What a PID is used for within the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidUse {
    Pat,
    Pmt,
    Sdt,
    Elementary(u32),
    /// PCR carried on a PID of its own
    Pcr,
}

/// PID assignments for one session, aware of the profile's reserved ranges.
#[derive(Debug, Clone)]
pub struct PidMap {
    ts_type: TsType,
    assigned: BTreeMap<u16, PidUse>,
}

impl PidMap {
    pub fn new(ts_type: TsType) -> Self {
        let mut assigned = BTreeMap::new();
        assigned.insert(PID_PAT, PidUse::Pat);
        if ts_type == TsType::Dvb {
            assigned.insert(PID_SDT, PidUse::Sdt);
        }
        Self { ts_type, assigned }
    }

    /// Reserved by ISO/IEC 13818-1 or by the table standard of the profile
    pub fn is_reserved(ts_type: TsType, pid: u16) -> bool {
        if pid <= 0x000f || pid >= PID_NULL {
            return true;
        }
        match ts_type {
            TsType::Generic => false,
            TsType::Dvb => pid <= 0x001f,
            TsType::Isdb => pid <= 0x002f,
            TsType::Atsc | TsType::CableLabs => (0x1ff0..=0x1ffe).contains(&pid),
        }
    }

    pub fn default_pmt_pid(ts_type: TsType) -> u16 {
        match ts_type {
            TsType::Isdb => 0x01f0,
            _ => DEFAULT_PMT_PID,
        }
    }

    pub fn ts_type(&self) -> TsType {
        self.ts_type
    }

    pub fn usage(&self, pid: u16) -> Option<PidUse> {
        self.assigned.get(&pid).copied()
    }

    /// Claims an explicitly requested PID.
    pub fn claim(&mut self, pid: u16, usage: PidUse) -> Result<()> {
        if pid > PID_MAX {
            return Err(MuxError::PidConflict {
                pid,
                reason: "outside the 13-bit PID range".into(),
            });
        }
        if Self::is_reserved(self.ts_type, pid) {
            return Err(MuxError::PidConflict {
                pid,
                reason: format!("reserved in the {} profile", self.ts_type),
            });
        }
        if let Some(existing) = self.assigned.get(&pid) {
            return Err(MuxError::PidConflict {
                pid,
                reason: format!("already assigned to {:?}", existing),
            });
        }
        self.assigned.insert(pid, usage);
        Ok(())
    }

    /// Picks the lowest free PID at or above 0x0100.
    pub fn allocate(&mut self, usage: PidUse) -> Result<u16> {
        let pid = (FIRST_ES_PID..PID_NULL)
            .find(|pid| !self.assigned.contains_key(pid) && !Self::is_reserved(self.ts_type, *pid))
            .ok_or_else(|| MuxError::PidConflict {
                pid: PID_NULL,
                reason: "no free PID left".into(),
            })?;
        self.assigned.insert(pid, usage);
        Ok(pid)
    }

    pub fn release(&mut self, pid: u16) {
        if !matches!(self.assigned.get(&pid), Some(PidUse::Pat)) {
            self.assigned.remove(&pid);
        }
    }

    pub fn assigned(&self) -> impl Iterator<Item = (u16, PidUse)> + '_ {
        self.assigned.iter().map(|(pid, usage)| (*pid, *usage))
    }
}
