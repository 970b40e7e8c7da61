//! Mux and output configuration.
//!
//! Values are owned by the [`Session`](crate::session::Session) that receives
//! them; nothing here is process-wide.

use crate::error::{MuxError, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Transport stream profile, selecting mandatory descriptors and reserved PIDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TsType {
    #[default]
    Generic,
    Dvb,
    CableLabs,
    Atsc,
    Isdb,
}

impl TsType {
    /// Longest PCR repetition interval the profile allows
    pub fn max_pcr_period(&self) -> Duration {
        match self {
            TsType::Dvb => Duration::from_millis(40),
            _ => Duration::from_millis(100),
        }
    }

    pub fn is_atsc_family(&self) -> bool {
        matches!(self, TsType::Atsc | TsType::CableLabs)
    }
}

impl FromStr for TsType {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "generic" => Ok(TsType::Generic),
            "dvb" => Ok(TsType::Dvb),
            "cablelabs" => Ok(TsType::CableLabs),
            "atsc" => Ok(TsType::Atsc),
            "isdb" => Ok(TsType::Isdb),
            other => Err(MuxError::Unsupported(format!("ts_type '{}'", other))),
        }
    }
}

impl fmt::Display for TsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TsType::Generic => "generic",
            TsType::Dvb => "dvb",
            TsType::CableLabs => "cablelabs",
            TsType::Atsc => "atsc",
            TsType::Isdb => "isdb",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MuxConfig {
    pub ts_type: TsType,
    /// Constant bitrate with null stuffing; otherwise smoothing-buffer VBR
    pub cbr: bool,
    /// Transport rate in bits per second (the peak slot rate in VBR mode)
    pub ts_muxrate: u64,
    pub ts_id: u16,
    pub program_num: u16,
    pub pmt_pid: Option<u16>,
    /// `None` selects the first video stream, or the first stream
    pub pcr_pid: Option<u16>,
    pub pcr_period: Duration,
    pub pat_period: Duration,
    /// Defaults to `pat_period`
    pub pmt_period: Option<Duration>,
    /// DVB only
    pub sdt_period: Duration,
    pub original_network_id: u16,
    pub is_3dtv: bool,
    /// Smoothing buffer drain rate, bits per second
    pub sb_leak_rate: u64,
    /// Smoothing buffer size, bytes
    pub sb_size: usize,
    /// How far ahead of its decode time a unit may be sent
    pub mux_delay: Duration,
    /// Longest an access unit may wait for emission before the session fails
    pub max_deferral: Duration,
    /// Bound of each producer queue, in access units
    pub queue_depth: usize,
    /// How long a producer may wait on a full queue
    pub queue_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            ts_type: TsType::Generic,
            cbr: true,
            ts_muxrate: 10_000_000,
            ts_id: 1,
            program_num: 1,
            pmt_pid: None,
            pcr_pid: None,
            pcr_period: Duration::from_millis(40),
            pat_period: Duration::from_millis(100),
            pmt_period: None,
            sdt_period: Duration::from_secs(2),
            original_network_id: 1,
            is_3dtv: false,
            sb_leak_rate: 0,
            sb_size: 0,
            mux_delay: Duration::from_millis(700),
            max_deferral: Duration::from_secs(1),
            queue_depth: 64,
            queue_timeout: Duration::from_millis(500),
        }
    }
}

impl MuxConfig {
    pub fn new(ts_type: TsType, ts_muxrate: u64) -> Self {
        Self {
            ts_type,
            ts_muxrate,
            ..Default::default()
        }
    }

    /// Switches to smoothing-buffer governed VBR output
    pub fn vbr(mut self, sb_leak_rate: u64, sb_size: usize) -> Self {
        self.cbr = false;
        self.sb_leak_rate = sb_leak_rate;
        self.sb_size = sb_size;
        self
    }

    pub fn effective_pmt_period(&self) -> Duration {
        self.pmt_period.unwrap_or(self.pat_period)
    }

    /// Checks values that do not depend on the program composition.
    pub fn validate(&self) -> Result<()> {
        if self.ts_muxrate == 0 {
            return Err(MuxError::InvalidConfig("ts_muxrate must be positive".into()));
        }
        if self.program_num == 0 {
            return Err(MuxError::InvalidConfig(
                "program number 0 is reserved for the network PID".into(),
            ));
        }
        if self.pcr_period.is_zero() || self.pcr_period > self.ts_type.max_pcr_period() {
            return Err(MuxError::InvalidConfig(format!(
                "pcr_period {:?} outside (0, {:?}] for {}",
                self.pcr_period,
                self.ts_type.max_pcr_period(),
                self.ts_type
            )));
        }
        if self.pat_period.is_zero() || self.effective_pmt_period().is_zero() {
            return Err(MuxError::InvalidConfig("table periods must be positive".into()));
        }
        if self.ts_type == TsType::Dvb && self.sdt_period.is_zero() {
            return Err(MuxError::InvalidConfig("sdt_period must be positive".into()));
        }
        if !self.cbr {
            if self.sb_leak_rate == 0 || self.sb_size == 0 {
                return Err(MuxError::InvalidConfig(
                    "VBR output needs sb_leak_rate and sb_size".into(),
                ));
            }
            if self.sb_leak_rate > self.ts_muxrate {
                return Err(MuxError::InvalidConfig(format!(
                    "sb_leak_rate {} exceeds ts_muxrate {}",
                    self.sb_leak_rate, self.ts_muxrate
                )));
            }
        }
        if self.queue_depth == 0 {
            return Err(MuxError::InvalidConfig("queue_depth must be positive".into()));
        }
        if self.max_deferral.is_zero() {
            return Err(MuxError::InvalidConfig("max_deferral must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// MPEG-TS in UDP
    #[default]
    Udp,
    /// MPEG-TS in RTP in UDP
    Rtp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    pub transport: TransportKind,
    /// `host:port[?ttl=N&localport=N&pkts=N]`, optionally with a `udp://` or `rtp://` scheme
    pub location: String,
    /// Consecutive send failures tolerated before the transport is declared unavailable
    pub max_send_errors: u32,
}

impl OutputConfig {
    pub fn udp(location: &str) -> Self {
        Self {
            transport: TransportKind::Udp,
            location: location.to_string(),
            max_send_errors: 100,
        }
    }

    pub fn rtp(location: &str) -> Self {
        Self {
            transport: TransportKind::Rtp,
            ..Self::udp(location)
        }
    }

    pub fn target(&self) -> Result<OutputTarget> {
        OutputTarget::parse(&self.location)
    }
}

/// Parsed destination of the output transport
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTarget {
    pub host: String,
    pub port: u16,
    pub ttl: Option<u32>,
    pub local_port: u16,
    /// Transport packets per datagram (7 fills a 1500-byte Ethernet MTU)
    pub packets_per_datagram: usize,
}

impl OutputTarget {
    pub const DEFAULT_PACKETS_PER_DATAGRAM: usize = 7;

    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(MuxError::InvalidConfig("empty output location".into()));
        }
        let with_scheme = if location.contains("://") {
            location.to_string()
        } else {
            format!("udp://{}", location)
        };
        let url = Url::parse(&with_scheme)
            .map_err(|e| MuxError::InvalidConfig(format!("bad location '{}': {}", location, e)))?;

        match url.scheme() {
            "udp" | "rtp" => {}
            other => {
                return Err(MuxError::InvalidConfig(format!(
                    "unsupported location scheme '{}'",
                    other
                )))
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| MuxError::InvalidConfig(format!("no host in '{}'", location)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| MuxError::InvalidConfig(format!("no port in '{}'", location)))?;

        let mut target = OutputTarget {
            host,
            port,
            ttl: None,
            local_port: 0,
            packets_per_datagram: Self::DEFAULT_PACKETS_PER_DATAGRAM,
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "ttl" => target.ttl = Some(value.parse()?),
                "localport" => target.local_port = value.parse()?,
                "pkts" => {
                    let pkts: usize = value.parse()?;
                    if !(1..=7).contains(&pkts) {
                        return Err(MuxError::InvalidConfig(format!(
                            "pkts must be within 1..=7, got {}",
                            pkts
                        )));
                    }
                    target.packets_per_datagram = pkts;
                }
                other => log::warn!("ignoring unknown output parameter '{}'", other),
            }
        }

        Ok(target)
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_type_from_str() {
        assert_eq!("DVB".parse::<TsType>().unwrap(), TsType::Dvb);
        assert_eq!("cablelabs".parse::<TsType>().unwrap(), TsType::CableLabs);
        assert!(matches!(
            "dmb".parse::<TsType>(),
            Err(MuxError::Unsupported(_))
        ));
    }

    #[test]
    fn test_default_config_is_valid() {
        MuxConfig::default().validate().unwrap();
    }

    #[test]
    fn test_dvb_rejects_slow_pcr() {
        let mut config = MuxConfig::new(TsType::Dvb, 5_000_000);
        config.pcr_period = Duration::from_millis(80);
        assert!(matches!(config.validate(), Err(MuxError::InvalidConfig(_))));

        config.ts_type = TsType::Atsc;
        config.validate().unwrap();
    }

    #[test]
    fn test_vbr_needs_bucket() {
        let mut config = MuxConfig::default();
        config.cbr = false;
        assert!(config.validate().is_err());

        let config = MuxConfig::default().vbr(1_000_000, 8192);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_location() {
        let target = OutputTarget::parse("239.1.1.1:5000?ttl=8&pkts=4&localport=4000").unwrap();
        assert_eq!(target.host, "239.1.1.1");
        assert_eq!(target.port, 5000);
        assert_eq!(target.ttl, Some(8));
        assert_eq!(target.local_port, 4000);
        assert_eq!(target.packets_per_datagram, 4);

        let target = OutputTarget::parse("rtp://127.0.0.1:1234").unwrap();
        assert_eq!(target.address(), "127.0.0.1:1234");
        assert_eq!(target.packets_per_datagram, 7);
    }

    #[test]
    fn test_parse_location_errors() {
        assert!(OutputTarget::parse("").is_err());
        assert!(OutputTarget::parse("127.0.0.1").is_err());
        assert!(OutputTarget::parse("http://127.0.0.1:80").is_err());
        assert!(OutputTarget::parse("127.0.0.1:5000?pkts=9").is_err());
    }
}
