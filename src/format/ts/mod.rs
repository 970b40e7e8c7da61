//! # MPEG Transport Stream (TS) Multiplexing
//!
//! Everything that turns access units into 188-byte transport packets:
//!
//! - PID allocation and program composition
//! - PAT, PMT and SDT sections with their insertion schedules
//! - PES framing and packetization with continuity counters
//! - The 27 MHz system clock, PCR insertion and timeline mapping
//! - CBR slot pacing and the VBR smoothing buffer
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tsmux_engine::av::{AccessUnit, InputProgram, InputStream, OutputStream, StreamFormat, Timebase};
//! use tsmux_engine::config::MuxConfig;
//! use tsmux_engine::format::ts::{Program, TSMuxer, TS_PACKET_SIZE};
//! use tsmux_engine::stats::MuxStats;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let input = InputProgram::new("News", "Example").with_stream(InputStream::video(
//!     1,
//!     StreamFormat::Avc,
//!     1280,
//!     720,
//!     Timebase::new(1, 90_000),
//! ));
//! let config = MuxConfig::default();
//! let program = Program::build(&input, &[OutputStream::passthrough(1)], &config)?;
//! let mut muxer = TSMuxer::new(program, &config, MuxStats::new())?;
//!
//! muxer.push(1, AccessUnit::new(vec![0u8; 1000]).with_pts(0))?;
//! while let Some(packet) = muxer.next_packet()? {
//!     assert_eq!(packet.data.len(), TS_PACKET_SIZE);
//!     if muxer.is_drained() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Stream read-back checks
pub mod analyzer;

/// System clock, PCR cadence and timeline mapping
pub mod clock;

/// PSI descriptors and stream types
pub mod descriptors;

/// The muxing stage
pub mod muxer;

/// Transport packet writing
pub mod packetizer;

/// Low-level TS packet parsing utilities
pub mod parser;

/// PES packet handling
pub mod pes;

/// PID allocation
pub mod pid;

/// Program composition
pub mod program;

/// PAT/PMT/SDT tables
pub mod psi;

/// CBR pacing and the VBR smoothing buffer
pub mod shaper;

/// Core TS types and constants
pub mod types;


// Re-export commonly used types and constants
pub use analyzer::TsAnalyzer;
pub use clock::{ClockDiscipline, TimelineAnchor, TimelineMapper};
pub use muxer::{ScheduledPacket, TSMuxer};
pub use parser::TSPacketParser;
pub use pes::{PESHeader, PESPacket};
pub use pid::{PidMap, PidUse};
pub use program::{Program, StreamEntry, StreamPriority};
pub use psi::{PsiManager, TableKind};
pub use shaper::{LeakyBucket, RateShaper};
pub use types::{
    TSHeader, PCR_HZ, PID_NULL, PID_PAT, PID_SDT, TS_PACKET_SIZE,
};
