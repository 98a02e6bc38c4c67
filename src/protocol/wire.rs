//! Fixed-layout NetCL packet framing.
//!
//! Every datagram is `[ncp header][aggregation header][payload]`. Multi-byte
//! header fields travel in network byte order; payload values are passed
//! through in native order (fixed-point scalars, same-endian deployment).
//!
//! ```text
//! ncp (8 bytes):  host_src:u8 host_dst:u8 device_src:u8 device_dst:u8
//!                 channel:u8 action:u8 action_arg:u16
//! agg (17 bytes): version:u8 bitmap_index:u16 aggregation_index:u16
//!                 mask:u32 offset:u32 exponent:u32
//! payload:        values_per_packet * 4 bytes
//! ```

use bytes::{Buf, BufMut};

use crate::error::{NetclError, Result};

/// NCP transport header length in bytes.
pub const NCP_HEADER_LEN: usize = 8;

/// Aggregation header length in bytes.
pub const AGG_HEADER_LEN: usize = 17;

/// Total header length prepended to every payload.
pub const HEADER_LEN: usize = NCP_HEADER_LEN + AGG_HEADER_LEN;

/// Total datagram length for a given payload width.
pub const fn packet_len(values_per_packet: usize) -> usize {
    HEADER_LEN + values_per_packet * 4
}

/// NCP transport header: topological addressing and channel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NcpHeader {
    pub host_src: u8,
    pub host_dst: u8,
    pub device_src: u8,
    pub device_dst: u8,
    pub channel: u8,
    pub action: u8,
    /// Reserved; always zero in this protocol use.
    pub action_arg: u16,
}

/// Aggregation header: per-slot bookkeeping the device accumulates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggHeader {
    /// Double-buffer half this packet belongs to (0 or 1).
    pub version: u8,
    /// Physical slot in the device's per-thread bitmap, stable across both
    /// versions of a call.
    pub bitmap_index: u16,
    /// Logical accumulator slot: `bitmap_index + version * slots_per_version`.
    pub aggregation_index: u16,
    /// One-hot contributor bit for the sending rank.
    pub mask: u32,
    /// Element index into the global vector this payload represents.
    pub offset: u32,
    /// Shared fixed-point scale factor, constant for the whole call.
    pub exponent: u32,
}

/// Complete NetCL packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub ncp: NcpHeader,
    pub agg: AggHeader,
}

impl PacketHeader {
    /// Append the 25 header bytes to `out` in wire order.
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u8(self.ncp.host_src);
        out.put_u8(self.ncp.host_dst);
        out.put_u8(self.ncp.device_src);
        out.put_u8(self.ncp.device_dst);
        out.put_u8(self.ncp.channel);
        out.put_u8(self.ncp.action);
        out.put_u16(self.ncp.action_arg);
        out.put_u8(self.agg.version);
        out.put_u16(self.agg.bitmap_index);
        out.put_u16(self.agg.aggregation_index);
        out.put_u32(self.agg.mask);
        out.put_u32(self.agg.offset);
        out.put_u32(self.agg.exponent);
    }

    /// Decode a header from the front of `buf`.
    ///
    /// The only failure is a buffer shorter than [`HEADER_LEN`]; that is a
    /// framing invariant violation, not an expected runtime condition.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(NetclError::TruncatedPacket {
                len: buf.len(),
                expected: HEADER_LEN,
            });
        }
        let ncp = NcpHeader {
            host_src: buf.get_u8(),
            host_dst: buf.get_u8(),
            device_src: buf.get_u8(),
            device_dst: buf.get_u8(),
            channel: buf.get_u8(),
            action: buf.get_u8(),
            action_arg: buf.get_u16(),
        };
        let agg = AggHeader {
            version: buf.get_u8(),
            bitmap_index: buf.get_u16(),
            aggregation_index: buf.get_u16(),
            mask: buf.get_u32(),
            offset: buf.get_u32(),
            exponent: buf.get_u32(),
        };
        Ok(PacketHeader { ncp, agg })
    }
}

/// Encode a full datagram (header + payload) into `out`, replacing its
/// previous contents.
pub fn encode_packet(header: &PacketHeader, payload: &[u32], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(packet_len(payload.len()));
    header.encode(out);
    for v in payload {
        out.extend_from_slice(&v.to_ne_bytes());
    }
}

/// Copy payload values out of the byte region following the header.
///
/// Returns the number of values written; a short region yields fewer values,
/// trailing bytes that do not form a whole value are ignored.
pub fn decode_payload(bytes: &[u8], out: &mut [u32]) -> usize {
    let n = (bytes.len() / 4).min(out.len());
    for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)).take(n) {
        *dst = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    n
}
