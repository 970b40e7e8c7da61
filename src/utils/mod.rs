//! # Utility Functions and Types
//!
//! Helpers shared by the table and packet writers:
//!
//! - Bit-level packing and unpacking of header fields
//! - MPEG-2 CRC32 for PSI/SI sections
//!
//! ## CRC Calculation
//!
//! ```rust
//! use tsmux_engine::utils::Crc32Mpeg2;
//!
//! # fn main() {
//! let crc = Crc32Mpeg2::new();
//! let value = crc.calculate(b"Hello, world!");
//! println!("CRC32: {:08x}", value);
//! # }
//! ```

/// Bit manipulation helpers
pub mod bits;

/// CRC calculation implementations
pub mod crc;

pub use bits::{BitReader, BitWriter};
pub use crc::Crc32Mpeg2;
