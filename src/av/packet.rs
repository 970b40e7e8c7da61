use bytes::Bytes;

/// Timing carried over from the source container for a passed-through unit.
///
/// Timestamps are in the source's 90 kHz clock (33-bit), PCR in 27 MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassthroughTiming {
    pub pts: u64,
    pub dts: Option<u64>,
    pub pcr: Option<u64>,
    /// The source signalled a discontinuity before this unit
    pub discontinuity: bool,
}

impl PassthroughTiming {
    pub fn new(pts: u64) -> Self {
        Self {
            pts,
            ..Default::default()
        }
    }

    pub fn with_dts(mut self, dts: u64) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_pcr(mut self, pcr: u64) -> Self {
        self.pcr = Some(pcr);
        self
    }

    pub fn with_discontinuity(mut self) -> Self {
        self.discontinuity = true;
        self
    }
}

/// One coded frame, audio frame or subtitle segment.
///
/// `pts`/`dts` are in the stream's timebase and used for encoded streams;
/// passthrough streams take their timing from `passthrough` instead.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub pts: i64,
    pub dts: Option<i64>,
    /// Size announced by the producer; must equal `data.len()`
    pub declared_size: usize,
    pub is_key: bool,
    pub passthrough: Option<PassthroughTiming>,
}

impl AccessUnit {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            declared_size: data.len(),
            data,
            pts: 0,
            dts: None,
            is_key: false,
            passthrough: None,
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_declared_size(mut self, size: usize) -> Self {
        self.declared_size = size;
        self
    }

    pub fn with_key_flag(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }

    pub fn with_passthrough(mut self, timing: PassthroughTiming) -> Self {
        self.passthrough = Some(timing);
        self
    }

    /// Decode timestamp, falling back to the presentation timestamp
    pub fn decode_ts(&self) -> i64 {
        self.dts.unwrap_or(self.pts)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
