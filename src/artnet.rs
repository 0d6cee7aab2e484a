//! ArtDMX over UDP.
//!
//! One datagram per frame: an 18-byte header followed by the 512 channel levels.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::universe::{DMX_CHANNELS, DmxFrame};

pub const ARTNET_PORT: u16 = 6454;
pub const ARTNET_ID: &[u8; 8] = b"Art-Net\0";
pub const OP_DMX: u16 = 0x5000;
pub const PROTOCOL_VERSION: u16 = 14;
pub const HEADER_LEN: usize = 18;
pub const PACKET_LEN: usize = HEADER_LEN + DMX_CHANNELS;

/// Builds an ArtDMX packet for `frame`. The start code is not transmitted.
pub fn art_dmx_packet(sequence: u8, universe: u16, frame: &DmxFrame) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0..8].copy_from_slice(ARTNET_ID);
    packet[8..10].copy_from_slice(&OP_DMX.to_le_bytes());
    packet[10..12].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    packet[12] = sequence;
    packet[13] = 0; // physical
    packet[14..16].copy_from_slice(&universe.to_le_bytes());
    packet[16..18].copy_from_slice(&(DMX_CHANNELS as u16).to_be_bytes());
    packet[HEADER_LEN..].copy_from_slice(frame.channels());
    packet
}

/// ArtDMX sender for one universe.
pub struct ArtNetSender {
    socket: UdpSocket,
    target: SocketAddr,
    universe: u16,
    sequence: u8,
}

impl std::fmt::Debug for ArtNetSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtNetSender")
            .field("target", &self.target)
            .field("universe", &self.universe)
            .finish()
    }
}

impl ArtNetSender {
    /// Resolves `host` (with or without a port, default 6454) and binds an ephemeral socket.
    pub fn connect(host: &str, universe: u16) -> Result<Self> {
        let target = resolve(host)?;
        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)?;
        // Allows subnet broadcast targets such as 2.255.255.255.
        if target.is_ipv4() {
            socket.set_broadcast(true)?;
        }
        debug!(%target, universe, "art-net sender ready");
        Ok(Self {
            socket,
            target,
            universe,
            sequence: 0,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn universe(&self) -> u16 {
        self.universe
    }

    /// Sends one frame and advances the sequence byte, wrapping after 255.
    pub fn send(&mut self, frame: &DmxFrame) -> Result<()> {
        let packet = art_dmx_packet(self.sequence, self.universe, frame);
        self.sequence = self.sequence.wrapping_add(1);
        let sent = self.socket.send_to(&packet, self.target)?;
        trace!(sent, sequence = packet[12], "art-net frame");
        Ok(())
    }
}

fn resolve(host: &str) -> Result<SocketAddr> {
    let host = host.trim();
    let mut addrs = match host.to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(_) => (host, ARTNET_PORT).to_socket_addrs()?,
    };
    addrs.next().ok_or_else(|| Error::UnknownItem {
        kind: "host",
        name: host.to_string(),
    })
}
