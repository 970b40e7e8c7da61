//! Datagram output.
//!
//! [`OutputTransport`] groups transport packets into datagrams of up to
//! seven packets, optionally wraps them in RTP and hands them to a
//! [`PacketSink`]. A failed send is a transport discontinuity: it is
//! counted and streaming goes on until too many sends in a row fail.

use super::rtp::RtpEncapsulator;
use super::ts::ScheduledPacket;
use crate::config::{OutputConfig, OutputTarget, TransportKind};
use crate::error::{MuxError, Result};
use crate::stats::MuxStats;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Destination of finished datagrams
#[async_trait]
pub trait PacketSink: Send {
    async fn send(&mut self, datagram: &[u8]) -> Result<()>;
}

/// Unicast or multicast UDP destination
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl UdpSink {
    pub async fn connect(target: &OutputTarget) -> Result<Self> {
        let destination = tokio::net::lookup_host(target.address())
            .await?
            .next()
            .ok_or_else(|| {
                MuxError::InvalidConfig(format!("'{}' does not resolve", target.address()))
            })?;

        let bind: SocketAddr = match destination.ip() {
            IpAddr::V4(_) => ([0, 0, 0, 0], target.local_port).into(),
            IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, target.local_port).into(),
        };
        let socket = UdpSocket::bind(bind).await?;

        if let Some(ttl) = target.ttl {
            match destination.ip() {
                IpAddr::V4(ip) if ip.is_multicast() => socket.set_multicast_ttl_v4(ttl)?,
                _ => socket.set_ttl(ttl)?,
            }
        }

        log::info!(
            "udp output to {} from {}",
            destination,
            socket.local_addr()?
        );
        Ok(Self {
            socket,
            destination,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl PacketSink for UdpSink {
    async fn send(&mut self, datagram: &[u8]) -> Result<()> {
        let sent = self.socket.send_to(datagram, self.destination).await?;
        if sent != datagram.len() {
            return Err(MuxError::TransportError(format!(
                "short send: {} of {} bytes",
                sent,
                datagram.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    datagrams: Vec<Bytes>,
    failures: usize,
}

/// In-process sink; clones share the captured datagrams.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` sends fail.
    pub fn fail_next(&self, count: usize) {
        self.inner.lock().failures = count;
    }

    pub fn datagrams(&self) -> Vec<Bytes> {
        self.inner.lock().datagrams.clone()
    }

    /// Every captured byte, in order
    pub fn concat(&self) -> Vec<u8> {
        self.inner.lock().datagrams.iter().flat_map(|d| d.iter().copied()).collect()
    }
}

#[async_trait]
impl PacketSink for MemorySink {
    async fn send(&mut self, datagram: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(MuxError::TransportError("injected send failure".into()));
        }
        inner.datagrams.push(Bytes::copy_from_slice(datagram));
        Ok(())
    }
}

/// Datagram assembly and delivery.
pub struct OutputTransport {
    sink: Box<dyn PacketSink>,
    rtp: Option<RtpEncapsulator>,
    packets_per_datagram: usize,
    pending: BytesMut,
    pending_packets: usize,
    first_at: u64,
    failures_in_row: u32,
    max_send_errors: u32,
    stats: Arc<MuxStats>,
}

impl OutputTransport {
    pub fn new(
        sink: Box<dyn PacketSink>,
        config: &OutputConfig,
        packets_per_datagram: usize,
        stats: Arc<MuxStats>,
    ) -> Self {
        let rtp = (config.transport == TransportKind::Rtp).then(|| {
            let seed = format!(
                "{}/{}/{}",
                config.location,
                std::process::id(),
                chrono::Utc::now().timestamp_micros()
            );
            RtpEncapsulator::from_seed(seed.as_bytes())
        });
        Self {
            sink,
            rtp,
            packets_per_datagram: packets_per_datagram.clamp(1, 7),
            pending: BytesMut::new(),
            pending_packets: 0,
            first_at: 0,
            failures_in_row: 0,
            max_send_errors: config.max_send_errors.max(1),
            stats,
        }
    }

    /// Resolves the configured location and opens a UDP sink for it.
    pub async fn connect(config: &OutputConfig, stats: Arc<MuxStats>) -> Result<Self> {
        let target = config.target()?;
        let sink = UdpSink::connect(&target).await?;
        Ok(Self::new(Box::new(sink), config, target.packets_per_datagram, stats))
    }

    pub fn is_rtp(&self) -> bool {
        self.rtp.is_some()
    }

    /// Whether the next packet fills the datagram and sends it
    pub fn completes_datagram(&self) -> bool {
        self.pending_packets + 1 >= self.packets_per_datagram
    }

    pub fn pending_packets(&self) -> usize {
        self.pending_packets
    }

    /// Adds a packet; sends the datagram once it is full.
    pub async fn push(&mut self, packet: &ScheduledPacket) -> Result<()> {
        if self.pending_packets == 0 {
            self.first_at = packet.at;
        }
        self.pending.extend_from_slice(&packet.data);
        self.pending_packets += 1;
        if self.pending_packets >= self.packets_per_datagram {
            self.flush().await?;
        }
        Ok(())
    }

    /// Sends whatever is pending as a short datagram.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending_packets == 0 {
            return Ok(());
        }
        let payload = self.pending.split().freeze();
        self.pending_packets = 0;
        let datagram = match self.rtp.as_mut() {
            Some(rtp) => rtp.wrap(self.first_at, payload).to_bytes(),
            None => payload,
        };

        match self.sink.send(&datagram).await {
            Ok(()) => {
                self.failures_in_row = 0;
                self.stats.record_datagram(datagram.len());
                Ok(())
            }
            Err(e) => {
                self.failures_in_row += 1;
                self.stats.record_transport_discontinuity();
                log::warn!(
                    "datagram of {} bytes lost ({} in a row): {}",
                    datagram.len(),
                    self.failures_in_row,
                    e
                );
                if self.failures_in_row >= self.max_send_errors {
                    let error = MuxError::TransportError(format!(
                        "{} consecutive send failures, last: {}",
                        self.failures_in_row, e
                    ));
                    self.stats.set_last_error(&error);
                    return Err(error);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::rtp::{RTPPacket, PAYLOAD_TYPE_MP2T};
    use crate::format::ts::packetizer::null_packet;
    use crate::format::ts::PID_NULL;

    fn packet(at: u64) -> ScheduledPacket {
        ScheduledPacket {
            at,
            pid: PID_NULL,
            data: null_packet(),
        }
    }

    #[tokio::test]
    async fn test_groups_seven_packets() {
        let sink = MemorySink::new();
        let stats = MuxStats::new();
        let config = OutputConfig::udp("127.0.0.1:5000");
        let mut transport = OutputTransport::new(Box::new(sink.clone()), &config, 7, stats.clone());

        for i in 0..10 {
            transport.push(&packet(i)).await.unwrap();
        }
        assert_eq!(sink.datagrams().len(), 1);
        assert_eq!(transport.pending_packets(), 3);
        transport.flush().await.unwrap();

        let sizes: Vec<usize> = sink.datagrams().iter().map(|d| d.len()).collect();
        assert_eq!(sizes, vec![7 * 188, 3 * 188]);
        assert_eq!(stats.snapshot().datagrams, 2);
    }

    #[tokio::test]
    async fn test_rtp_sequence_advances_over_lost_datagrams() {
        let sink = MemorySink::new();
        let stats = MuxStats::new();
        let config = OutputConfig::rtp("127.0.0.1:5000");
        let mut transport = OutputTransport::new(Box::new(sink.clone()), &config, 1, stats.clone());

        transport.push(&packet(300)).await.unwrap();
        sink.fail_next(1);
        transport.push(&packet(600)).await.unwrap();
        transport.push(&packet(900)).await.unwrap();

        let received: Vec<RTPPacket> = sink
            .datagrams()
            .iter()
            .map(|d| RTPPacket::parse(d).unwrap())
            .collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].payload_type, PAYLOAD_TYPE_MP2T);
        assert_eq!(
            received[1].sequence_number,
            received[0].sequence_number.wrapping_add(2)
        );
        assert_eq!(received[1].timestamp, 3);
        assert_eq!(stats.snapshot().transport_discontinuities, 1);
    }

    #[tokio::test]
    async fn test_too_many_failures_is_fatal() {
        let sink = MemorySink::new();
        let mut config = OutputConfig::udp("127.0.0.1:5000");
        config.max_send_errors = 3;
        let mut transport = OutputTransport::new(Box::new(sink.clone()), &config, 1, MuxStats::new());

        sink.fail_next(3);
        transport.push(&packet(0)).await.unwrap();
        transport.push(&packet(1)).await.unwrap();
        assert!(matches!(
            transport.push(&packet(2)).await,
            Err(MuxError::TransportError(_))
        ));
    }
}
