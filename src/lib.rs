#![doc(html_root_url = "https://docs.rs/tsmux-engine/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! # tsmux-engine - Transport Stream Multiplexing & Rate Control
//!
//! `tsmux-engine` turns elementary-stream access units (encoded upstream or
//! passed through from a contribution feed) into a constant or bounded-variable
//! bitrate MPEG transport stream and sends it over UDP, optionally wrapped in RTP.
//!
//! ## Features
//!
//! ### Program Specific Information
//! - PID allocation with per-profile reserved ranges (generic, DVB, CableLabs, ATSC, ISDB)
//! - PAT, PMT and DVB SDT sections with version tracking
//! - Insertion at or before the configured repetition deadlines
//!
//! ### Timing and rate control
//! - 27 MHz system clock with PCR insertion at `pcr_period`
//! - Source-to-output timeline mapping with discontinuity detection
//! - CBR slot clock with null packet stuffing
//! - Leaky-bucket smoothing buffer for bounded VBR output
//!
//! ### Output
//! - 188-byte packetization with per-PID continuity counters
//! - Paced UDP delivery, raw or RTP (payload type 33)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tsmux_engine::av::{AccessUnit, InputProgram, InputStream, OutputStream, StreamFormat, Timebase};
//! use tsmux_engine::config::{MuxConfig, OutputConfig};
//! use tsmux_engine::session::Session;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut session = Session::new();
//!
//!     session.setup_program(InputProgram::new("News", "Example Broadcasting").with_stream(
//!         InputStream::video(1, StreamFormat::Avc, 1920, 1080, Timebase::new(1, 90_000)),
//!     ))?;
//!     session.setup_streams(vec![OutputStream::passthrough(1).with_pid(256)])?;
//!     session.setup_muxer(MuxConfig::default())?;
//!     session.setup_output(OutputConfig::udp("239.1.1.1:5000?ttl=4"))?;
//!     session.start().await?;
//!
//!     let video = session.sender(1)?;
//!     video.send(AccessUnit::new(vec![0u8; 1200]).with_pts(0)).await?;
//!
//!     let stats = session.stop().await?;
//!     println!("sent {} packets", stats.packets);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `av`: program and stream descriptions, access units
//! - `config`: mux and output configuration
//! - `format`: transport stream, RTP and UDP output
//! - `session`: lifecycle state machine and the real-time muxing task
//! - `stats`: observability counters
//! - `utils`: CRC and bit-level helpers

/// Program, stream and access unit types
pub mod av;

/// Mux and output configuration
pub mod config;

/// Error types and utilities
pub mod error;

/// Transport stream, RTP and output transport implementations
pub mod format;

/// Session lifecycle and the muxing task
pub mod session;

/// Observability counters
pub mod stats;

/// Common utilities and helper functions
pub mod utils;

pub use error::{MuxError, Result};
