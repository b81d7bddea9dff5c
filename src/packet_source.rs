// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Packet transport boundary.
//!
//! A [`PacketSource`] yields [`RawPacket`]s already stamped with their
//! arrival time, so the decoder never depends on how packets were carried:
//!
//! - [`UdpSource`]: live sensor data on the Velodyne data port, stamped
//!   from the monotonic clock on arrival
//! - [`ReplaySource`]: recorded captures or synthesized packets, stamped at
//!   the sensor's packet rate
//!
//! # Example
//!
//! ```ignore
//! use edgefirst_terrain::packet_source::{PacketSource, UdpSource};
//!
//! let mut source = UdpSource::bind("0.0.0.0:2368").await?;
//! while source.has_more() {
//!     let packet = source.recv().await?;
//!     let decoded = decoder.decode(&packet)?;
//! }
//! ```

use crate::{
    lidar::{Error, RawPacket, timestamp},
    velodyne::{DataPacket, PACKET_SIZE},
};
use std::{future::Future, net::SocketAddr, path::Path, pin::Pin};
use tracing::debug;

/// Default Velodyne data packet UDP port
pub const DEFAULT_DATA_PORT: u16 = 2368;

/// Largest datagram read from the socket; longer ones are truncated and
/// later rejected by the decoder.
const MAX_DATAGRAM: usize = 2048;

/// One VLP-16 packet period: 12 blocks of 110.592 µs.
pub const VLP16_PACKET_INTERVAL_NS: u64 = 1_327_104;

/// Boxed future returned by [`PacketSource::recv`].
pub type RecvFuture<'a> = Pin<Box<dyn Future<Output = Result<RawPacket, Error>> + Send + 'a>>;

/// Trait for packet sources.
pub trait PacketSource: Send {
    /// Receive the next packet together with its arrival timestamp.
    ///
    /// Fails with [`Error::Io`] on socket errors or once a finite source is
    /// exhausted.
    fn recv(&mut self) -> RecvFuture<'_>;

    /// Check if more packets are available.
    ///
    /// Live sources always return `true`, finite sources return `false`
    /// once exhausted.
    fn has_more(&self) -> bool;
}

/// UDP socket packet source for live sensor operation.
pub struct UdpSource {
    socket: tokio::net::UdpSocket,
    buf: Vec<u8>,
}

impl UdpSource {
    pub fn new(socket: tokio::net::UdpSocket) -> Self {
        Self {
            socket,
            buf: vec![0u8; MAX_DATAGRAM],
        }
    }

    /// Bind to an address such as `0.0.0.0:2368`.
    pub async fn bind(addr: &str) -> Result<Self, Error> {
        let socket = tokio::net::UdpSocket::bind(addr).await?;
        debug!(addr = %socket.local_addr()?, "listening for data packets");
        Ok(Self::new(socket))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }
}

impl PacketSource for UdpSource {
    fn recv(&mut self) -> RecvFuture<'_> {
        Box::pin(async move {
            let len = self.socket.recv(&mut self.buf).await?;
            let arrival = timestamp()?;
            Ok(RawPacket::new(self.buf[..len].to_vec(), arrival))
        })
    }

    fn has_more(&self) -> bool {
        true
    }
}

/// Finite source replaying recorded packets at a fixed rate.
///
/// Packet `i` is stamped `start_ns + i * interval_ns`, which reproduces the
/// point timing of a live sensor without waiting in real time.
#[derive(Clone, Debug)]
pub struct ReplaySource {
    packets: Vec<Vec<u8>>,
    cursor: usize,
    start_ns: u64,
    interval_ns: u64,
}

impl ReplaySource {
    pub fn new(packets: Vec<Vec<u8>>) -> Self {
        Self {
            packets,
            cursor: 0,
            start_ns: 0,
            interval_ns: VLP16_PACKET_INTERVAL_NS,
        }
    }

    /// Encode structured data packets to their wire form.
    pub fn from_data_packets<'a>(packets: impl IntoIterator<Item = &'a DataPacket>) -> Self {
        Self::new(packets.into_iter().map(|p| p.encode().to_vec()).collect())
    }

    /// Split a capture of back-to-back data packets, as written by a raw
    /// UDP payload dump.
    pub fn from_capture(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() % PACKET_SIZE != 0 {
            return Err(Error::MalformedPacket(format!(
                "capture of {} bytes is not a whole number of {}-byte packets",
                bytes.len(),
                PACKET_SIZE
            )));
        }
        Ok(Self::new(
            bytes.chunks_exact(PACKET_SIZE).map(<[u8]>::to_vec).collect(),
        ))
    }

    /// Read a capture file. See [`Self::from_capture`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let source = Self::from_capture(&std::fs::read(path)?)?;
        debug!(path = %path.display(), packets = source.len(), "capture loaded");
        Ok(source)
    }

    /// Stamp packets from `start_ns`, `interval_ns` apart.
    #[must_use]
    pub fn with_timing(mut self, start_ns: u64, interval_ns: u64) -> Self {
        self.start_ns = start_ns;
        self.interval_ns = interval_ns;
        self
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Number of packets already delivered.
    pub fn delivered(&self) -> usize {
        self.cursor
    }
}

impl Iterator for ReplaySource {
    type Item = RawPacket;

    fn next(&mut self) -> Option<RawPacket> {
        let data = self.packets.get(self.cursor)?.clone();
        let stamp = self.start_ns + self.cursor as u64 * self.interval_ns;
        self.cursor += 1;
        Some(RawPacket::new(data, stamp))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.packets.len() - self.cursor;
        (left, Some(left))
    }
}

impl PacketSource for ReplaySource {
    fn recv(&mut self) -> RecvFuture<'_> {
        Box::pin(async move {
            self.next().ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "replay exhausted",
                ))
            })
        })
    }

    fn has_more(&self) -> bool {
        self.cursor < self.packets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lidar::SensorModel;

    #[tokio::test]
    async fn test_replay_timing() {
        let packets = vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8, 9, 10], vec![11, 12]];
        let mut source = ReplaySource::new(packets).with_timing(1_000, 500);

        assert!(source.has_more());
        assert_eq!(source.len(), 3);

        let first = source.recv().await.unwrap();
        assert_eq!(first.data, vec![1, 2, 3, 4]);
        assert_eq!(first.timestamp_ns, 1_000);

        let second = source.recv().await.unwrap();
        assert_eq!(second.data, vec![5, 6, 7, 8, 9, 10]);
        assert_eq!(second.timestamp_ns, 1_500);

        let third = source.recv().await.unwrap();
        assert_eq!(third.timestamp_ns, 2_000);
        assert_eq!(source.delivered(), 3);

        assert!(!source.has_more());
        assert!(matches!(source.recv().await, Err(Error::Io(_))));
    }

    #[test]
    fn test_default_interval_is_packet_rate() {
        let block_ns = SensorModel::Vlp16.block_duration_us() * 1000.0;
        assert_eq!((block_ns * 12.0).round() as u64, VLP16_PACKET_INTERVAL_NS);

        let stamps: Vec<u64> = ReplaySource::new(vec![Vec::new(); 3])
            .map(|p| p.timestamp_ns)
            .collect();
        assert_eq!(stamps, vec![0, VLP16_PACKET_INTERVAL_NS, 2 * VLP16_PACKET_INTERVAL_NS]);
    }

    #[test]
    fn test_from_capture() {
        let packets = [
            DataPacket::new(SensorModel::Vlp16, 10),
            DataPacket::new(SensorModel::Vlp16, 20),
        ];
        let capture: Vec<u8> = packets.iter().flat_map(|p| p.encode()).collect();

        let source = ReplaySource::from_capture(&capture).unwrap();
        assert_eq!(source.len(), 2);
        let parsed: Vec<DataPacket> = source
            .map(|raw| DataPacket::parse(&raw.data, SensorModel::Vlp16).unwrap())
            .collect();
        assert_eq!(parsed, packets);

        assert!(matches!(
            ReplaySource::from_capture(&capture[..PACKET_SIZE + 1]),
            Err(Error::MalformedPacket(_))
        ));
        assert!(ReplaySource::from_capture(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_load_capture_file() {
        let path = std::env::temp_dir().join(format!("terrain-capture-{}.bin", std::process::id()));
        let capture = DataPacket::new(SensorModel::Hdl32e, 7).encode();
        std::fs::write(&path, capture).unwrap();

        let mut source = ReplaySource::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(source.len(), 1);
        assert_eq!(source.next().map(|p| p.data), Some(capture.to_vec()));

        assert!(matches!(ReplaySource::load(&path), Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_empty_source() {
        let mut source = ReplaySource::new(Vec::new());
        assert!(!source.has_more());
        assert!(source.is_empty());
        assert!(source.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_udp_source_stamps_arrival() {
        let mut source = UdpSource::bind("127.0.0.1:0").await.unwrap();
        let addr = source.local_addr().unwrap();

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = DataPacket::new(SensorModel::Hdl32e, 42).encode();
        let before = timestamp().unwrap();
        sender.send_to(&packet, addr).await.unwrap();

        let raw = source.recv().await.unwrap();
        assert_eq!(raw.data, packet.to_vec());
        assert!(raw.timestamp_ns >= before);
        assert!(raw.timestamp_ns <= timestamp().unwrap());
        assert!(source.has_more());
    }
}
