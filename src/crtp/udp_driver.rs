use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, info, trace};

use crate::crtp::link::{uri_address, Link, LinkDriver, LinkEventSender};
use crate::crtp::packet::{Packet, MAX_PAYLOAD_SIZE};

/// Driver for `udp://<host>:<port>` URIs, typically used to talk to a simulated vehicle.
///
/// Each datagram carries exactly one packet:
/// ```ascii
/// 0: header byte (port / channel)
/// 1: payload (0 to 31 bytes)
/// *: checksum (u8) - sum of all preceding bytes, modulo 256
/// ```
pub struct UdpLinkDriver;

#[async_trait]
impl LinkDriver for UdpLinkDriver {
    fn scheme(&self) -> &str {
        "udp"
    }

    async fn open(&self, uri: &str, events: LinkEventSender) -> anyhow::Result<Arc<dyn Link>> {
        let address = uri_address(uri)
            .ok_or_else(|| anyhow!("not a UDP URI: {:?}", uri))?;

        let peer_addr = tokio::net::lookup_host(address).await?
            .next()
            .ok_or_else(|| anyhow!("could not resolve {:?}", address))?;

        let bind_addr: SocketAddr = if peer_addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        }
        else {
            "[::]:0".parse()?
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer_addr).await?;
        info!("UDP link from {:?} to {:?}", socket.local_addr()?, peer_addr);

        Ok(Arc::new(UdpLink {
            socket,
            peer_addr,
            events,
            is_closed: AtomicBool::new(false),
        }))
    }
}

pub struct UdpLink {
    socket: UdpSocket,
    peer_addr: SocketAddr,
    events: LinkEventSender,
    is_closed: AtomicBool,
}

impl UdpLink {
    const MAX_DATAGRAM_SIZE: usize = MAX_PAYLOAD_SIZE + 2;

    fn checksum(bytes: &[u8]) -> u8 {
        bytes.iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b))
    }

    pub fn encode_datagram(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::with_capacity(packet.data().len() + 2);
        buf.put_u8(packet.header());
        buf.put_slice(packet.data());
        buf.put_u8(Self::checksum(&buf));
        buf
    }

    pub fn decode_datagram(buf: &[u8]) -> anyhow::Result<Packet> {
        if buf.len() < 2 {
            bail!("datagram of {} bytes is too short", buf.len());
        }

        let (content, checksum) = buf.split_at(buf.len() - 1);
        if Self::checksum(content) != checksum[0] {
            bail!("checksum mismatch");
        }

        Packet::from_header(content[0], content[1..].to_vec())
    }
}

#[async_trait]
impl Link for UdpLink {
    async fn send(&self, packet: &Packet) -> anyhow::Result<()> {
        if self.is_closed.load(Ordering::Acquire) {
            bail!("sending on a closed link");
        }

        trace!("UDP link: sending {:?} to {:?}", packet, self.peer_addr);
        self.socket.send(&Self::encode_datagram(packet)).await?;
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> anyhow::Result<Option<Packet>> {
        if self.is_closed.load(Ordering::Acquire) {
            bail!("receiving on a closed link");
        }

        let mut buf = [0u8; UdpLink::MAX_DATAGRAM_SIZE + 1];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => {
                self.events.on_error(format!("UDP socket error for {:?}: {}", self.peer_addr, e));
                Err(e.into())
            }
            Ok(Ok(num_read)) => {
                if num_read > Self::MAX_DATAGRAM_SIZE {
                    debug!("oversized datagram from {:?} - dropping", self.peer_addr);
                    return Ok(None);
                }

                match Self::decode_datagram(&buf[..num_read]) {
                    Ok(packet) => Ok(Some(packet)),
                    Err(e) => {
                        debug!("invalid datagram from {:?} - dropping: {}", self.peer_addr, e);
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn close(&self) {
        debug!("closing UDP link to {:?}", self.peer_addr);
        self.is_closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::sync::mpsc;
    use super::*;

    #[rstest]
    #[case::empty(Packet::new(0, 0, vec![]).unwrap(), vec![0x0C, 0x0C])]
    #[case::payload(Packet::new(5, 1, vec![3, 7]).unwrap(), vec![0x5D, 3, 7, 0x67])]
    #[case::wrapping(Packet::new(15, 3, vec![0xFF, 0x02]).unwrap(), vec![0xFF, 0xFF, 0x02, 0x00])]
    fn test_encode_decode(#[case] packet: Packet, #[case] expected: Vec<u8>) {
        let encoded = UdpLink::encode_datagram(&packet);
        assert_eq!(encoded.as_ref(), expected.as_slice());
        assert_eq!(UdpLink::decode_datagram(&expected).unwrap(), packet);
    }

    #[rstest]
    #[case::too_short(vec![0x0C])]
    #[case::bad_checksum(vec![0x5D, 3, 7, 0x68])]
    fn test_decode_invalid(#[case] datagram: Vec<u8>) {
        assert!(UdpLink::decode_datagram(&datagram).is_err());
    }

    #[tokio::test]
    async fn test_round_trip_over_socket() {
        let vehicle = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("udp://{}", vehicle.local_addr().unwrap());

        let (send, _recv) = mpsc::unbounded_channel();
        let link = UdpLinkDriver.open(&uri, LinkEventSender::new(send)).await.unwrap();

        let packet = Packet::new(5, 0, vec![1]).unwrap();
        link.send(&packet).await.unwrap();

        let mut buf = [0u8; 64];
        let (num_read, from) = vehicle.recv_from(&mut buf).await.unwrap();
        assert_eq!(UdpLink::decode_datagram(&buf[..num_read]).unwrap(), packet);

        let reply = Packet::new(5, 0, vec![1, 2, 0, 0, 0, 0]).unwrap();
        vehicle.send_to(&UdpLink::encode_datagram(&reply), from).await.unwrap();
        assert_eq!(link.receive(Duration::from_secs(5)).await.unwrap(), Some(reply));

        link.close().await;
        assert!(link.send(&packet).await.is_err());
    }
}
