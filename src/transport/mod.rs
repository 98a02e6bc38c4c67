//! I/O strategies for the NetCL wire path.
//!
//! The Window Engine is agnostic to syscall granularity: it talks to a
//! [`Transport`], and the strategy decides whether a burst is one datagram
//! per syscall ([`DatagramTransport`]) or a single vectored
//! `sendmmsg`/`recvmmsg` call ([`BatchedTransport`], Linux only). Strategy
//! choice affects performance, never protocol semantics.

use std::net::{SocketAddr, UdpSocket};

use crate::config::NetclConfig;
use crate::error::{NetclError, Result};
use crate::protocol::PacketHeader;

#[cfg(target_os = "linux")]
mod batched;
mod datagram;

#[cfg(target_os = "linux")]
pub use batched::BatchedTransport;
pub use datagram::DatagramTransport;

/// Socket send/receive buffer size requested for worker sockets.
#[cfg(target_os = "linux")]
const SOCKET_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Which syscall granularity the wire path uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// One datagram per syscall (`send_to`/`recv_from`).
    Datagram,
    /// Vectored multi-message bursts (`sendmmsg`/`recvmmsg`).
    Batched,
}

/// A packet scheduled for transmission: header plus the payload slice it
/// carries.
pub struct Frame<'a> {
    pub header: &'a PacketHeader,
    pub payload: &'a [u32],
}

/// One receive buffer: decoded header plus payload values.
///
/// The engine keeps one slot per window position and hands the same slots
/// to every receive call; strategies must preserve the slot-to-buffer
/// mapping across calls so re-tag-in-place works.
pub struct RecvSlot {
    pub header: PacketHeader,
    pub payload: Vec<u32>,
}

impl RecvSlot {
    pub fn new(values_per_packet: usize) -> Self {
        Self {
            header: PacketHeader::default(),
            payload: vec![0; values_per_packet],
        }
    }
}

/// A strategy for moving NetCL packets to and from the device.
pub trait Transport: Send {
    /// Called once on the engine thread before any traffic; strategies may
    /// pin the thread here. Affects performance only, never correctness.
    fn prepare_thread(&mut self) {}

    /// Send one packet. Returns bytes written.
    fn send(&mut self, header: &PacketHeader, payload: &[u32]) -> Result<usize>;

    /// Send a burst of packets. Returns how many were handed to the kernel;
    /// a short count is reported, not retried (a lost request behaves like
    /// any other loss: the slot stalls).
    fn send_burst(&mut self, frames: &[Frame<'_>]) -> Result<usize> {
        for frame in frames {
            self.send(frame.header, frame.payload)?;
        }
        Ok(frames.len())
    }

    /// Block until at least one response arrives, filling `slots` from the
    /// front. May return 0 only for strategies that poll; callers retry.
    fn recv_burst(&mut self, slots: &mut [RecvSlot]) -> Result<usize>;

    /// Block for exactly one response.
    fn recv(&mut self, slot: &mut RecvSlot) -> Result<()> {
        loop {
            if self.recv_burst(std::slice::from_mut(slot))? == 1 {
                return Ok(());
            }
        }
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn prepare_thread(&mut self) {
        (**self).prepare_thread();
    }

    fn send(&mut self, header: &PacketHeader, payload: &[u32]) -> Result<usize> {
        (**self).send(header, payload)
    }

    fn send_burst(&mut self, frames: &[Frame<'_>]) -> Result<usize> {
        (**self).send_burst(frames)
    }

    fn recv_burst(&mut self, slots: &mut [RecvSlot]) -> Result<usize> {
        (**self).recv_burst(slots)
    }

    fn recv(&mut self, slot: &mut RecvSlot) -> Result<()> {
        (**self).recv(slot)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn prepare_thread(&mut self) {
        (**self).prepare_thread();
    }

    fn send(&mut self, header: &PacketHeader, payload: &[u32]) -> Result<usize> {
        (**self).send(header, payload)
    }

    fn send_burst(&mut self, frames: &[Frame<'_>]) -> Result<usize> {
        (**self).send_burst(frames)
    }

    fn recv_burst(&mut self, slots: &mut [RecvSlot]) -> Result<usize> {
        (**self).recv_burst(slots)
    }

    fn recv(&mut self, slot: &mut RecvSlot) -> Result<()> {
        (**self).recv(slot)
    }
}

/// Bind and tune the worker socket for one thread, then wrap it in the
/// configured strategy.
pub fn open(cfg: &NetclConfig, thread_id: u16) -> Result<Box<dyn Transport>> {
    let addr = SocketAddr::new(cfg.bind_ip, cfg.port_for_thread(thread_id));
    let socket = bind_socket(addr)?;

    match cfg.strategy {
        StrategyKind::Datagram => Ok(Box::new(DatagramTransport::new(
            socket,
            cfg.device,
            cfg.values_per_packet as usize,
            thread_id,
            cfg.pin_threads,
        ))),
        #[cfg(target_os = "linux")]
        StrategyKind::Batched => Ok(Box::new(BatchedTransport::new(
            socket,
            cfg.device,
            cfg.values_per_packet as usize,
            cfg.window as usize,
            thread_id,
            cfg.pin_threads,
        ))),
        #[cfg(not(target_os = "linux"))]
        StrategyKind::Batched => {
            tracing::warn!("batched strategy unavailable on this platform, using datagram");
            Ok(Box::new(DatagramTransport::new(
                socket,
                cfg.device,
                cfg.values_per_packet as usize,
                thread_id,
                cfg.pin_threads,
            )))
        }
    }
}

/// Bind a blocking UDP socket with address reuse and enlarged buffers.
fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).map_err(|source| NetclError::Bind { addr, source })?;

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;

        let fd = socket.as_raw_fd();
        // SAFETY: fd is a valid socket from UdpSocket::bind; option values
        // are c_int with matching lengths.
        unsafe {
            let reuse: libc::c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &reuse as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );

            let buf = SOCKET_BUFFER_BYTES as libc::c_int;
            for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    opt,
                    &buf as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }
    }

    Ok(socket)
}

/// Pin the calling thread to a core chosen by thread id.
pub(crate) fn maybe_pin(pin: bool, thread_id: u16) {
    if !pin {
        return;
    }
    match core_affinity::get_core_ids() {
        Some(cores) if !cores.is_empty() => {
            let core = cores[thread_id as usize % cores.len()];
            if !core_affinity::set_for_current(core) {
                tracing::warn!(thread_id, "failed to pin thread to core {:?}", core.id);
            }
        }
        _ => tracing::warn!(thread_id, "no core ids available, thread not pinned"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral() {
        let socket = bind_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_bind_bad_address_is_fatal() {
        // No interface carries this address.
        let err = bind_socket("203.0.113.1:0".parse().unwrap()).unwrap_err();
        assert!(matches!(err, NetclError::Bind { .. }));
    }

    #[test]
    fn test_recv_slot_sized_to_packet() {
        let slot = RecvSlot::new(32);
        assert_eq!(slot.payload.len(), 32);
    }
}
