//! Connectionless datagram channels to trackers and the simulator.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::codec::{Frame, Modality};
use crate::config::{ChannelConfig, ChannelsConfig};

/// Largest datagram accepted on any channel
pub const MAX_DATAGRAM: usize = 65_507;

/// Inbound logical stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Skeleton,
    ImuArray,
    ImuSingle,
    Remote,
    SimulatorFlag,
    SimulatorCalibration,
}

impl Channel {
    pub fn modality(&self) -> Modality {
        match self {
            Channel::Skeleton => Modality::Skeleton,
            Channel::ImuArray => Modality::ImuArray,
            Channel::ImuSingle => Modality::ImuSingle,
            Channel::Remote => Modality::Remote,
            Channel::SimulatorFlag => Modality::Flag,
            Channel::SimulatorCalibration => Modality::Calibration,
        }
    }

    pub fn endpoint<'a>(&self, channels: &'a ChannelsConfig) -> &'a ChannelConfig {
        match self {
            Channel::Skeleton => &channels.read_skeleton,
            Channel::ImuArray => &channels.read_imu_array,
            Channel::ImuSingle => &channels.read_imu_single,
            Channel::Remote => &channels.read_remote,
            Channel::SimulatorFlag => &channels.read_simulator_flag,
            Channel::SimulatorCalibration => &channels.read_simulator_calibration,
        }
    }

    /// Device streams only matter at their newest sample; handshake streams
    /// are consumed in order.
    pub fn drains_to_latest(&self) -> bool {
        matches!(
            self,
            Channel::Skeleton | Channel::ImuArray | Channel::ImuSingle | Channel::Remote
        )
    }
}

/// Datagram IO used by the session loop
#[async_trait]
pub trait Transport: Send {
    /// Next frame on `channel`, or `Frame::Timeout` when nothing arrived in time
    async fn recv(&mut self, channel: Channel) -> Result<Frame>;

    /// Send one payload to the simulator
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Release every socket
    async fn close(&mut self);
}

pub struct UdpTransport {
    sockets: BTreeMap<Channel, UdpSocket>,
    sender: Option<UdpSocket>,
    target: SocketAddr,
    read_timeout: Duration,
    buffer: Vec<u8>,
}

impl UdpTransport {
    /// Bind one socket per channel in `open`, plus an ephemeral sending socket
    pub async fn bind(
        channels: &ChannelsConfig,
        open: &[Channel],
        read_timeout: Duration,
    ) -> Result<Self> {
        let mut sockets = BTreeMap::new();
        for channel in open {
            let addr = channel.endpoint(channels).socket_addr()?;
            let socket = UdpSocket::bind(addr)
                .await
                .context(format!("Failed to bind {:?} channel on {}", channel, addr))?;
            info!("✓ {:?} channel listening on {}", channel, addr);
            sockets.insert(*channel, socket);
        }

        let target = channels.write_command.socket_addr()?;
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            "[::]:0".parse()?
        };
        let sender = UdpSocket::bind(local)
            .await
            .context("Failed to bind command socket")?;
        info!("✓ Commands go to {}", target);

        Ok(Self {
            sockets,
            sender: Some(sender),
            target,
            read_timeout,
            buffer: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self, channel: Channel) -> Option<SocketAddr> {
        self.sockets.get(&channel).and_then(|s| s.local_addr().ok())
    }

    /// Pull every queued datagram without waiting; keep the newest
    fn drain(&mut self, channel: Channel) -> Result<Option<Vec<u8>>> {
        let socket = self
            .sockets
            .get(&channel)
            .ok_or_else(|| anyhow!("{:?} channel is not open", channel))?;
        let mut latest = None;
        let mut dropped = 0usize;
        loop {
            match socket.try_recv_from(&mut self.buffer) {
                Ok((len, _)) => {
                    if latest.is_some() {
                        dropped += 1;
                    }
                    latest = Some(self.buffer[..len].to_vec());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context(format!("Failed to read {:?} channel", channel)),
            }
        }
        if dropped > 0 {
            debug!("{:?}: skipped {} stale datagrams", channel, dropped);
        }
        Ok(latest)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn recv(&mut self, channel: Channel) -> Result<Frame> {
        if channel.drains_to_latest() {
            if let Some(bytes) = self.drain(channel)? {
                return Ok(Frame::new(channel.modality(), bytes));
            }
        }

        let socket = self
            .sockets
            .get(&channel)
            .ok_or_else(|| anyhow!("{:?} channel is not open", channel))?;
        match tokio::time::timeout(self.read_timeout, socket.recv_from(&mut self.buffer)).await {
            Ok(Ok((len, _))) => Ok(Frame::new(channel.modality(), self.buffer[..len].to_vec())),
            Ok(Err(e)) => Err(e).context(format!("Failed to read {:?} channel", channel)),
            Err(_) => Ok(Frame::Timeout),
        }
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("transport is closed"))?;
        sender
            .send_to(payload, self.target)
            .await
            .context(format!("Failed to send to {}", self.target))?;
        Ok(())
    }

    async fn close(&mut self) {
        self.sockets.clear();
        self.sender = None;
        info!("✓ Sockets closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_channels(command_port: u16) -> ChannelsConfig {
        let local = |port| ChannelConfig {
            host: "127.0.0.1".to_string(),
            port,
        };
        ChannelsConfig {
            read_skeleton: local(0),
            read_imu_array: local(0),
            read_imu_single: local(0),
            read_remote: local(0),
            read_simulator_flag: local(0),
            read_simulator_calibration: local(0),
            write_command: local(command_port),
        }
    }

    async fn open(channels: &[Channel]) -> (UdpTransport, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();
        let transport = UdpTransport::bind(
            &loopback_channels(port),
            channels,
            Duration::from_millis(30),
        )
        .await
        .unwrap();
        (transport, peer)
    }

    #[tokio::test]
    async fn test_timeout_is_sentinel() {
        let (mut transport, _peer) = open(&[Channel::SimulatorFlag]).await;
        let frame = transport.recv(Channel::SimulatorFlag).await.unwrap();
        assert!(frame.is_timeout());
    }

    #[tokio::test]
    async fn test_input_channel_keeps_newest() {
        let (mut transport, peer) = open(&[Channel::Remote]).await;
        let addr = transport.local_addr(Channel::Remote).unwrap();
        for b in 1u8..=3 {
            peer.send_to(&[b], addr).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frame = transport.recv(Channel::Remote).await.unwrap();
        assert_eq!(frame.bytes(), Some(&[3u8][..]));
        assert!(transport.recv(Channel::Remote).await.unwrap().is_timeout());
    }

    #[tokio::test]
    async fn test_flag_channel_reads_in_order() {
        let (mut transport, peer) = open(&[Channel::SimulatorFlag]).await;
        let addr = transport.local_addr(Channel::SimulatorFlag).unwrap();
        peer.send_to(b"a", addr).await.unwrap();
        peer.send_to(b"q", addr).await.unwrap();

        let first = transport.recv(Channel::SimulatorFlag).await.unwrap();
        let second = transport.recv(Channel::SimulatorFlag).await.unwrap();
        assert_eq!(first.bytes(), Some(&b"a"[..]));
        assert_eq!(second.bytes(), Some(&b"q"[..]));
    }

    #[tokio::test]
    async fn test_send_reaches_peer_and_close_stops() {
        let (mut transport, peer) = open(&[]).await;
        transport.send(&[1, 2, 3, 4]).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3, 4]);

        transport.close().await;
        assert!(transport.send(&[0]).await.is_err());
        assert!(transport.recv(Channel::Remote).await.is_err());
    }
}
