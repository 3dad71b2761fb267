use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::Bytes;

/// The maximum number of payload bytes a single packet can carry on the link.
pub const MAX_PAYLOAD_SIZE: usize = 31;

/// Well-known ports. A port is a 4-bit number selecting the subsystem a packet belongs to.
pub mod ports {
    pub const CONSOLE: u8 = 0x00;
    pub const PARAM: u8 = 0x02;
    pub const COMMANDER: u8 = 0x03;
    pub const LOGGING: u8 = 0x05;
    pub const DEBUG_DRIVER: u8 = 0x0E;
    pub const LINK_CONTROL: u8 = 0x0F;
}

/// A [Packet] is the unit of transfer on the link: a (port, channel) header plus up to
///  [MAX_PAYLOAD_SIZE] bytes of payload. The payload is opaque at this level and interpreted by
///  the subsystem owning the port.
///
/// Packets are immutable: they are created by senders or by the receive loop, and they are
///  cheap to clone since the payload is reference counted.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Packet {
    port: u8,
    channel: u8,
    data: Bytes,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet{{{}:{} {:02X?}}}", self.port, self.channel, self.data.as_ref())
    }
}

impl Packet {
    const PORT_MASK: u8 = 0x0F;
    const CHANNEL_MASK: u8 = 0x03;
    const RESERVED_HEADER_BITS: u8 = 0x0C;

    pub fn new(port: u8, channel: u8, data: impl Into<Bytes>) -> anyhow::Result<Packet> {
        if port > Self::PORT_MASK {
            bail!("port {} does not fit into four bits", port);
        }
        if channel > Self::CHANNEL_MASK {
            bail!("channel {} does not fit into two bits", channel);
        }

        let data = data.into();
        if data.len() > MAX_PAYLOAD_SIZE {
            bail!("payload of {} bytes exceeds the maximum of {} bytes", data.len(), MAX_PAYLOAD_SIZE);
        }

        Ok(Packet {
            port,
            channel,
            data,
        })
    }

    /// Parse a header byte as it is transmitted on the link, ignoring the reserved bits
    pub fn from_header(header: u8, data: impl Into<Bytes>) -> anyhow::Result<Packet> {
        Self::new(header >> 4, header & Self::CHANNEL_MASK, data)
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// The header byte as it goes on the wire. The reserved bits are always set.
    pub fn header(&self) -> u8 {
        (self.port << 4) | Self::RESERVED_HEADER_BITS | self.channel
    }
}
