//! Radio interface over a UDP socket, for bench setups where the real
//! driver is replaced by a monitor-mode injector or a simulator listening
//! on a port.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

use aerolink_transport::config::InterfaceConfig;
use aerolink_transport::radio::{Capabilities, Datarate, RadioInterface};
use anyhow::Context;
use bytes::Bytes;

const MAX_DATAGRAM: usize = 2048;

pub struct UdpRadio {
    name: String,
    socket: UdpSocket,
    target: SocketAddr,
    capabilities: Capabilities,
    frequency_khz: Option<u32>,
    air_packet_size: Option<usize>,
    recv_buf: Vec<u8>,
}

impl UdpRadio {
    pub fn open(config: &InterfaceConfig) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(config.bind)
            .with_context(|| format!("{}: bind {}", config.name, config.bind))?;
        socket
            .set_nonblocking(true)
            .with_context(|| format!("{}: set nonblocking", config.name))?;
        tracing::info!(
            interface = %config.name,
            bind = %socket.local_addr()?,
            target = %config.target,
            "udp radio opened"
        );
        Ok(UdpRadio {
            name: config.name.clone(),
            socket,
            target: config.target,
            capabilities: config.capabilities,
            frequency_khz: config.frequency_khz,
            air_packet_size: config.air_packet_size,
            recv_buf: vec![0u8; MAX_DATAGRAM],
        })
    }
}

impl RadioInterface for UdpRadio {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn is_open_for_write(&self) -> bool {
        self.capabilities.has(Capabilities::CAN_TX)
    }

    fn is_open_for_read(&self) -> bool {
        self.capabilities.has(Capabilities::CAN_RX)
    }

    fn supports_frequency(&self, frequency_khz: u32) -> bool {
        self.frequency_khz.map_or(true, |f| f == frequency_khz)
    }

    fn set_frequency(&mut self, frequency_khz: u32) -> anyhow::Result<()> {
        tracing::debug!(interface = %self.name, frequency_khz, "frequency set");
        self.frequency_khz = Some(frequency_khz);
        Ok(())
    }

    fn air_packet_size(&self) -> Option<usize> {
        self.air_packet_size
    }

    fn write(&mut self, frame: &[u8], _datarate: Datarate) -> anyhow::Result<usize> {
        let sent = self.socket.send_to(frame, self.target)?;
        Ok(sent)
    }

    fn read(&mut self) -> anyhow::Result<Option<Bytes>> {
        match self.socket.recv_from(&mut self.recv_buf) {
            Ok((n, _from)) => Ok(Some(Bytes::copy_from_slice(&self.recv_buf[..n]))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("udp radio receive"),
        }
    }
}
