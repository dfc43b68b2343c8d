//! Decoded wire frames

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Stream status flag: first packet of a stream (answers a start request).
pub const STATUS_FIRST_PACKET: u32 = 0x0000_0001;
/// Stream status flag: last packet before the instrument stops streaming.
pub const STATUS_LAST_PACKET: u32 = 0x0000_0002;
/// Stream status flag: instrument-side error.
pub const STATUS_ERROR: u32 = 0x1000_0000;

/// Kind of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// Acknowledges a start-stream request
    ControlAck,
    /// Liveness frame without samples
    KeepAlive,
    /// Carries channel samples
    Data,
    /// Final frame of a stream
    EndOfStream,
}

/// Contents of the packet-info sub-packet that opens every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PacketInfo {
    pub protocol_version: u32,
    pub stream_id: u32,
    pub sequence: u32,
    pub status: u32,
    pub seed: u32,
    /// Number of sub-packets following the packet info
    pub subpacket_count: u32,
}

impl PacketInfo {
    /// Check a stream status flag.
    pub fn has_status(&self, flag: u32) -> bool {
        self.status & flag != 0
    }
}

/// One validated wire frame.
///
/// Frames only exist for the duration of one processing cycle; the payload is a
/// cheap [`Bytes`] slice of the read buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub info: PacketInfo,
    /// Sub-packets following the packet info, excluding the footer
    pub payload: Bytes,
}

impl Frame {
    /// Frame sequence number.
    pub fn sequence(&self) -> u32 {
        self.info.sequence
    }
}

/// Returns true if `candidate` comes after `last` in u32 sequence space.
///
/// Uses half-range wraparound so the instrument's counter may roll over.
pub fn sequence_after(candidate: u32, last: u32) -> bool {
    if candidate == last {
        return false;
    }
    candidate.wrapping_sub(last) < 0x8000_0000
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn status_flags() {
        let info = PacketInfo { status: STATUS_FIRST_PACKET | STATUS_ERROR, ..Default::default() };
        assert!(info.has_status(STATUS_FIRST_PACKET));
        assert!(info.has_status(STATUS_ERROR));
        assert!(!info.has_status(STATUS_LAST_PACKET));
    }

    #[test]
    fn sequence_ordering_handles_wraparound() {
        assert!(sequence_after(1, 0));
        assert!(sequence_after(0, u32::MAX));
        assert!(!sequence_after(5, 5));
        assert!(!sequence_after(4, 5));
    }

    proptest! {
        #[test]
        fn successor_is_always_after(last in any::<u32>()) {
            prop_assert!(sequence_after(last.wrapping_add(1), last));
            prop_assert!(!sequence_after(last, last.wrapping_add(1)));
        }
    }
}
