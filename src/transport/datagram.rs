//! One-datagram-per-syscall strategy.

use std::net::{SocketAddr, UdpSocket};

use crate::error::{NetclError, Result};
use crate::protocol::{decode_payload, encode_packet, packet_len, PacketHeader, HEADER_LEN};
use crate::transport::{maybe_pin, RecvSlot, Transport};

/// The baseline strategy: `send_to`/`recv_from`, one packet per call.
pub struct DatagramTransport {
    socket: UdpSocket,
    device: SocketAddr,
    thread_id: u16,
    pin: bool,
    tx_buf: Vec<u8>,
    rx_buf: Vec<u8>,
}

impl DatagramTransport {
    pub fn new(
        socket: UdpSocket,
        device: SocketAddr,
        values_per_packet: usize,
        thread_id: u16,
        pin: bool,
    ) -> Self {
        let len = packet_len(values_per_packet);
        Self {
            socket,
            device,
            thread_id,
            pin,
            tx_buf: Vec::with_capacity(len),
            rx_buf: vec![0; len],
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for DatagramTransport {
    fn prepare_thread(&mut self) {
        maybe_pin(self.pin, self.thread_id);
    }

    fn send(&mut self, header: &PacketHeader, payload: &[u32]) -> Result<usize> {
        encode_packet(header, payload, &mut self.tx_buf);
        self.socket
            .send_to(&self.tx_buf, self.device)
            .map_err(|source| NetclError::Send {
                thread_id: self.thread_id,
                source,
            })
    }

    fn recv_burst(&mut self, slots: &mut [RecvSlot]) -> Result<usize> {
        let Some(slot) = slots.first_mut() else {
            return Ok(0);
        };

        let (len, _from) =
            self.socket
                .recv_from(&mut self.rx_buf)
                .map_err(|source| NetclError::Recv {
                    thread_id: self.thread_id,
                    source,
                })?;

        slot.header = PacketHeader::decode(&self.rx_buf[..len])?;
        decode_payload(&self.rx_buf[HEADER_LEN..len], &mut slot.payload);
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AggHeader, NcpHeader};

    fn loopback_pair() -> (DatagramTransport, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let transport =
            DatagramTransport::new(socket, peer.local_addr().unwrap(), 4, 0, false);
        (transport, peer)
    }

    fn header(offset: u32) -> PacketHeader {
        PacketHeader {
            ncp: NcpHeader {
                host_src: 1,
                device_dst: 1,
                channel: 1,
                ..Default::default()
            },
            agg: AggHeader {
                version: 0,
                bitmap_index: 3,
                aggregation_index: 3,
                mask: 1,
                offset,
                exponent: 1,
            },
        }
    }

    #[test]
    fn test_send_frames_whole_packet() {
        let (mut transport, peer) = loopback_pair();
        let sent = transport.send(&header(16), &[1, 2, 3, 4]).unwrap();
        assert_eq!(sent, packet_len(4));

        let mut buf = [0u8; 128];
        let (len, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(len, packet_len(4));
        let decoded = PacketHeader::decode(&buf[..len]).unwrap();
        assert_eq!(decoded.agg.offset, 16);
    }

    #[test]
    fn test_recv_decodes_into_slot() {
        let (mut transport, peer) = loopback_pair();
        let local = transport.local_addr().unwrap();

        let mut wire = Vec::new();
        encode_packet(&header(48), &[9, 8, 7, 6], &mut wire);
        peer.send_to(&wire, local).unwrap();

        let mut slots = [RecvSlot::new(4)];
        let n = transport.recv_burst(&mut slots).unwrap();
        assert_eq!(n, 1);
        assert_eq!(slots[0].header.agg.offset, 48);
        assert_eq!(slots[0].payload, vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_recv_truncated_datagram_is_error() {
        let (mut transport, peer) = loopback_pair();
        let local = transport.local_addr().unwrap();
        peer.send_to(&[0u8; 5], local).unwrap();

        let mut slots = [RecvSlot::new(4)];
        let err = transport.recv_burst(&mut slots).unwrap_err();
        assert!(matches!(err, NetclError::TruncatedPacket { len: 5, .. }));
    }
}
