//! Wire formats and output transport.

/// Datagram assembly, UDP and in-memory sinks
pub mod output;

/// RTP encapsulation
pub mod rtp;

/// MPEG transport stream multiplexing
pub mod ts;

pub use self::output::{MemorySink, OutputTransport, PacketSink, UdpSink};
pub use self::rtp::{RTPPacket, RtpEncapsulator};
pub use self::ts::{Program, ScheduledPacket, TSMuxer};
