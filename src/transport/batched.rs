//! Vectored multi-message strategy (Linux `sendmmsg`/`recvmmsg`).
//!
//! One syscall moves a whole burst. Buffers, iovecs, and message headers
//! are allocated once at window size and reused for every call, keeping the
//! slot-to-buffer mapping stable as the protocol requires.

use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;

use crate::error::{NetclError, Result};
use crate::protocol::{decode_payload, encode_packet, packet_len, PacketHeader, HEADER_LEN};
use crate::transport::{maybe_pin, Frame, RecvSlot, Transport};

pub struct BatchedTransport {
    socket: UdpSocket,
    device: libc::sockaddr_storage,
    device_len: libc::socklen_t,
    thread_id: u16,
    pin: bool,
    capacity: usize,
    tx_bufs: Vec<Vec<u8>>,
    rx_bufs: Vec<Vec<u8>>,
    iovecs: Vec<libc::iovec>,
    msgs: Vec<libc::mmsghdr>,
}

// SAFETY: the raw pointers inside `iovecs` and `msgs` are rebuilt from the
// owned `tx_bufs`/`rx_bufs`/`device` fields at the start of every syscall
// and never alias memory outside this struct.
unsafe impl Send for BatchedTransport {}

impl BatchedTransport {
    pub fn new(
        socket: UdpSocket,
        device: SocketAddr,
        values_per_packet: usize,
        window: usize,
        thread_id: u16,
        pin: bool,
    ) -> Self {
        let capacity = window.max(1);
        let bytes = packet_len(values_per_packet);
        let (device, device_len) = sockaddr_from(device);

        Self {
            socket,
            device,
            device_len,
            thread_id,
            pin,
            capacity,
            tx_bufs: (0..capacity).map(|_| Vec::with_capacity(bytes)).collect(),
            rx_bufs: (0..capacity).map(|_| vec![0u8; bytes]).collect(),
            iovecs: vec![
                libc::iovec {
                    iov_base: std::ptr::null_mut(),
                    iov_len: 0,
                };
                capacity
            ],
            // SAFETY: mmsghdr is a C struct where all-zeros is a valid
            // initial state.
            msgs: vec![unsafe { std::mem::zeroed() }; capacity],
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn send_chunk(&mut self, frames: &[Frame<'_>]) -> Result<usize> {
        let count = frames.len();
        for (i, frame) in frames.iter().enumerate() {
            encode_packet(frame.header, frame.payload, &mut self.tx_bufs[i]);
            self.iovecs[i] = libc::iovec {
                iov_base: self.tx_bufs[i].as_mut_ptr() as *mut _,
                iov_len: self.tx_bufs[i].len(),
            };
            self.msgs[i].msg_hdr = libc::msghdr {
                msg_name: &mut self.device as *mut _ as *mut _,
                msg_namelen: self.device_len,
                msg_iov: &mut self.iovecs[i],
                msg_iovlen: 1,
                msg_control: std::ptr::null_mut(),
                msg_controllen: 0,
                msg_flags: 0,
            };
            self.msgs[i].msg_len = 0;
        }

        let fd = self.socket.as_raw_fd();
        // SAFETY: fd is a valid socket; msgs and iovecs point into the
        // owned tx_bufs and device address, initialized just above.
        let sent = unsafe { libc::sendmmsg(fd, self.msgs.as_mut_ptr(), count as u32, 0) };
        if sent < 0 {
            return Err(NetclError::Send {
                thread_id: self.thread_id,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(sent as usize)
    }
}

impl Transport for BatchedTransport {
    fn prepare_thread(&mut self) {
        maybe_pin(self.pin, self.thread_id);
    }

    fn send(&mut self, header: &PacketHeader, payload: &[u32]) -> Result<usize> {
        let sent = self.send_chunk(&[Frame { header, payload }])?;
        if sent == 0 {
            tracing::warn!(thread_id = self.thread_id, "sendmmsg accepted no packets");
        }
        Ok(packet_len(payload.len()))
    }

    fn send_burst(&mut self, frames: &[Frame<'_>]) -> Result<usize> {
        let mut sent = 0;
        for chunk in frames.chunks(self.capacity) {
            let n = self.send_chunk(chunk)?;
            sent += n;
            if n < chunk.len() {
                tracing::warn!(
                    thread_id = self.thread_id,
                    sent,
                    requested = frames.len(),
                    "short sendmmsg burst"
                );
                break;
            }
        }
        Ok(sent)
    }

    fn recv_burst(&mut self, slots: &mut [RecvSlot]) -> Result<usize> {
        let want = slots.len().min(self.capacity);
        if want == 0 {
            return Ok(0);
        }

        for i in 0..want {
            self.iovecs[i] = libc::iovec {
                iov_base: self.rx_bufs[i].as_mut_ptr() as *mut _,
                iov_len: self.rx_bufs[i].len(),
            };
            self.msgs[i].msg_hdr = libc::msghdr {
                msg_name: std::ptr::null_mut(),
                msg_namelen: 0,
                msg_iov: &mut self.iovecs[i],
                msg_iovlen: 1,
                msg_control: std::ptr::null_mut(),
                msg_controllen: 0,
                msg_flags: 0,
            };
            self.msgs[i].msg_len = 0;
        }

        let fd = self.socket.as_raw_fd();
        // SAFETY: fd is a valid socket; msgs and iovecs point into the
        // owned rx_bufs, initialized just above. MSG_WAITFORONE blocks for
        // the first message, then drains whatever else is queued.
        let received = unsafe {
            libc::recvmmsg(
                fd,
                self.msgs.as_mut_ptr(),
                want as u32,
                libc::MSG_WAITFORONE,
                std::ptr::null_mut(),
            )
        };
        if received < 0 {
            return Err(NetclError::Recv {
                thread_id: self.thread_id,
                source: std::io::Error::last_os_error(),
            });
        }

        let received = received as usize;
        for i in 0..received {
            let len = self.msgs[i].msg_len as usize;
            let buf = &self.rx_bufs[i][..len];
            slots[i].header = PacketHeader::decode(buf)?;
            decode_payload(&buf[HEADER_LEN..], &mut slots[i].payload);
        }
        Ok(received)
    }
}

/// Convert a device address into the raw form `sendmmsg` wants.
fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is a C struct where all-zeros is a valid
    // initial state.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            // SAFETY: sockaddr_in fits inside sockaddr_storage and storage
            // is properly aligned for it.
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            // SAFETY: sockaddr_in6 fits inside sockaddr_storage and storage
            // is properly aligned for it.
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AggHeader, NcpHeader};

    fn header(offset: u32, bitmap_index: u16) -> PacketHeader {
        PacketHeader {
            ncp: NcpHeader {
                host_src: 1,
                device_dst: 1,
                channel: 1,
                ..Default::default()
            },
            agg: AggHeader {
                version: 0,
                bitmap_index,
                aggregation_index: bitmap_index,
                mask: 1,
                offset,
                exponent: 1,
            },
        }
    }

    fn loopback_pair(window: usize) -> (BatchedTransport, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let transport =
            BatchedTransport::new(socket, peer.local_addr().unwrap(), 4, window, 0, false);
        (transport, peer)
    }

    #[test]
    fn test_burst_send_arrives_per_packet() {
        let (mut transport, peer) = loopback_pair(2);

        let payloads = [[1u32, 2, 3, 4], [5, 6, 7, 8]];
        let headers = [header(0, 0), header(16, 1)];
        let frames: Vec<Frame<'_>> = headers
            .iter()
            .zip(payloads.iter())
            .map(|(h, p)| Frame {
                header: h,
                payload: &p[..],
            })
            .collect();

        let sent = transport.send_burst(&frames).unwrap();
        assert_eq!(sent, 2);

        let mut buf = [0u8; 128];
        let mut offsets = Vec::new();
        for _ in 0..2 {
            let (len, _) = peer.recv_from(&mut buf).unwrap();
            assert_eq!(len, packet_len(4));
            offsets.push(PacketHeader::decode(&buf[..len]).unwrap().agg.offset);
        }
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 16]);
    }

    #[test]
    fn test_burst_recv_decodes_slots() {
        let (mut transport, peer) = loopback_pair(2);
        let local = transport.local_addr().unwrap();

        let mut wire = Vec::new();
        for (off, val) in [(0u32, 10u32), (16, 20)] {
            encode_packet(&header(off, (off / 16) as u16), &[val; 4], &mut wire);
            peer.send_to(&wire, local).unwrap();
        }

        let mut slots = [RecvSlot::new(4), RecvSlot::new(4)];
        let mut got = Vec::new();
        while got.len() < 2 {
            let n = transport.recv_burst(&mut slots).unwrap();
            assert!(n >= 1);
            for slot in &slots[..n] {
                got.push((slot.header.agg.offset, slot.payload[0]));
            }
        }
        got.sort_unstable();
        assert_eq!(got, vec![(0, 10), (16, 20)]);
    }

    #[test]
    fn test_oversized_burst_is_chunked() {
        let (mut transport, peer) = loopback_pair(1);

        let payloads = [[1u32; 4], [2; 4], [3; 4]];
        let headers = [header(0, 0), header(16, 0), header(32, 0)];
        let frames: Vec<Frame<'_>> = headers
            .iter()
            .zip(payloads.iter())
            .map(|(h, p)| Frame {
                header: h,
                payload: &p[..],
            })
            .collect();

        assert_eq!(transport.send_burst(&frames).unwrap(), 3);

        let mut buf = [0u8; 128];
        for _ in 0..3 {
            peer.recv_from(&mut buf).unwrap();
        }
    }
}
