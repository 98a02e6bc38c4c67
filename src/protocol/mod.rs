//! NetCL wire protocol: fixed-layout packet headers and their codec.

mod wire;

pub use wire::{
    decode_payload, encode_packet, packet_len, AggHeader, NcpHeader, PacketHeader,
    AGG_HEADER_LEN, HEADER_LEN, NCP_HEADER_LEN,
};
