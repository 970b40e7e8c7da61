use crate::session::SessionState;
use std::num::ParseIntError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pid conflict on 0x{pid:04x}: {reason}")]
    PidConflict { pid: u16, reason: String },

    #[error("pcr pid cannot be assigned: {0}")]
    PcrPidUnassignable(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{operation} is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("framing error on pid 0x{pid:04x}: declared {declared} bytes, payload has {actual}")]
    FramingError {
        pid: u16,
        declared: usize,
        actual: usize,
    },

    #[error("ordering error on pid 0x{pid:04x}: dts {dts} precedes previous {previous}")]
    OrderingError { pid: u16, dts: i64, previous: i64 },

    #[error("rate budget exceeded: {0}")]
    RateBudgetExceeded(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("unknown stream id {0}")]
    UnknownStream(u32),

    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),
}

impl MuxError {
    /// Whether the error only affects a single access unit and streaming can go on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MuxError::FramingError { .. } | MuxError::OrderingError { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
