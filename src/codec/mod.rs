//! DataStream binary codec.
//!
//! [`WireFormat`] describes the envelope, [`FrameCodec`] turns bytes into validated
//! [`Frame`](crate::types::Frame)s and encodes the client's control requests.

mod checksum;
mod frame_codec;
mod wire;

pub use checksum::ChecksumKind;
pub use frame_codec::{ControlRequest, DecodeOutcome, FrameCodec};
pub use wire::{
    ASYNC_FIXED_HEADER_SIZE, DEFAULT_PORT, PACKET_INFO_SIZE, PROTOCOL_VERSION,
    SUBPACKET_HEADER_SIZE, SYNC_FIXED_HEADER_SIZE, SubPacket, SubPackets, WELCOME_SIZE,
    WireFormat, subpacket,
};
