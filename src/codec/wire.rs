//! DataStream wire format description.
//!
//! ## Frame envelope
//!
//! ```text
//! ┌──────────────┬─────────────┬──────────────────────────────┬──────────┬──────────────┐
//! │ start token  │ frame size  │ sub-packets                  │ checksum │ end token    │
//! │ "OXYGEN<<"   │ u32         │ [size u32][type u32][body].. │ u32 opt. │ ">>OXYGEN"   │
//! └──────────────┴─────────────┴──────────────────────────────┴──────────┴──────────────┘
//! ```
//!
//! The frame size covers the whole envelope. The first sub-packet is always the
//! packet info (six u32 fields). Integer byte order, tokens, checksum algorithm and
//! the size limit vary between firmware versions and are therefore carried in a
//! [`WireFormat`] value rather than hard-coded.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::ChecksumKind;
use crate::error::{ConfigError, FrameError};
use crate::types::ByteOrder;

/// Protocol version written into encoded frames.
pub const PROTOCOL_VERSION: u32 = 0x0105_0000;

/// Default DataStream TCP port.
pub const DEFAULT_PORT: u16 = 10003;

/// Sub-packet header: size (4) + type (4).
pub const SUBPACKET_HEADER_SIZE: usize = 8;
/// Packet info body: six u32 fields.
pub const PACKET_INFO_SIZE: usize = 24;
/// Sync-fixed block header: data type, dimension, sample count (u32), timestamp (u64),
/// timebase frequency (f64).
pub const SYNC_FIXED_HEADER_SIZE: usize = 28;
/// Async-fixed block header: data type, dimension, sample count (u32), timebase
/// frequency (f64). Each record is a u64 tick followed by the value.
pub const ASYNC_FIXED_HEADER_SIZE: usize = 20;
/// Greeting the instrument writes once after accepting a connection.
pub const WELCOME_SIZE: usize = 64;

/// Sub-packet type codes.
pub mod subpacket {
    pub const PACKET_INFO: u32 = 0x0000_0001;
    pub const XML_CONFIG: u32 = 0x0000_0002;
    pub const SYNC_FIXED: u32 = 0x0000_0003;
    pub const SYNC_VARIABLE: u32 = 0x0000_0004;
    pub const ASYNC_FIXED: u32 = 0x0000_0005;
    pub const ASYNC_VARIABLE: u32 = 0x0000_0006;
    pub const PACKET_FOOTER: u32 = 0x0000_0007;
    /// Samples interleaved per the negotiated layout
    pub const INTERLEAVED: u32 = 0x0000_0100;
    /// Client control request
    pub const CONTROL: u32 = 0x0000_0200;

    /// Whether a sub-packet of this type carries channel samples.
    pub const fn carries_samples(kind: u32) -> bool {
        matches!(kind, SYNC_FIXED | SYNC_VARIABLE | ASYNC_FIXED | ASYNC_VARIABLE | INTERLEAVED)
    }
}

/// Versioned description of the binary envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireFormat {
    pub start_token: String,
    pub end_token: String,
    pub byte_order: ByteOrder,
    pub checksum: ChecksumKind,
    /// Frames declaring a larger size are rejected
    pub max_frame_size: usize,
}

impl Default for WireFormat {
    fn default() -> Self {
        Self {
            start_token: "OXYGEN<<".to_string(),
            end_token: ">>OXYGEN".to_string(),
            byte_order: ByteOrder::Little,
            checksum: ChecksumKind::Crc32,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl WireFormat {
    /// Envelope a real instrument writes: start and end tokens without a checksum.
    ///
    /// The default format adds a CRC-32 that simulated and relayed streams carry.
    pub fn oxygen() -> Self {
        Self { checksum: ChecksumKind::None, ..Self::default() }
    }

    /// Bytes before the first sub-packet.
    pub fn header_len(&self) -> usize {
        self.start_token.len() + 4
    }

    /// Bytes after the last sub-packet.
    pub fn trailer_len(&self) -> usize {
        self.checksum.size() + self.end_token.len()
    }

    /// Smallest valid frame: envelope plus an empty packet info sub-packet.
    pub fn min_frame_size(&self) -> usize {
        self.header_len() + SUBPACKET_HEADER_SIZE + PACKET_INFO_SIZE + self.trailer_len()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_token.is_empty() {
            return Err(ConfigError::invalid("wire.start_token", "must not be empty"));
        }
        if !self.end_token.is_empty() && self.end_token == self.start_token {
            return Err(ConfigError::invalid("wire.end_token", "must differ from the start token"));
        }
        if self.max_frame_size < self.min_frame_size() {
            return Err(ConfigError::invalid(
                "wire.max_frame_size",
                format!("must be at least {} bytes", self.min_frame_size()),
            ));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::invalid("wire.max_frame_size", "must fit in a u32"));
        }
        Ok(())
    }

    pub(crate) fn read_u32(&self, bytes: &[u8], offset: usize) -> Option<u32> {
        let raw = bytes.get(offset..offset + 4)?.try_into().ok()?;
        Some(match self.byte_order {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        })
    }

    pub(crate) fn read_u64(&self, bytes: &[u8], offset: usize) -> Option<u64> {
        let raw = bytes.get(offset..offset + 8)?.try_into().ok()?;
        Some(match self.byte_order {
            ByteOrder::Little => u64::from_le_bytes(raw),
            ByteOrder::Big => u64::from_be_bytes(raw),
        })
    }

    pub(crate) fn read_f64(&self, bytes: &[u8], offset: usize) -> Option<f64> {
        self.read_u64(bytes, offset).map(f64::from_bits)
    }

    pub(crate) fn put_u32(&self, dst: &mut BytesMut, value: u32) {
        match self.byte_order {
            ByteOrder::Little => dst.put_u32_le(value),
            ByteOrder::Big => dst.put_u32(value),
        }
    }

    pub(crate) fn put_u64(&self, dst: &mut BytesMut, value: u64) {
        match self.byte_order {
            ByteOrder::Little => dst.put_u64_le(value),
            ByteOrder::Big => dst.put_u64(value),
        }
    }

    /// Append one sub-packet (header and body) to `dst`.
    pub fn encode_subpacket(&self, kind: u32, body: &[u8], dst: &mut BytesMut) {
        dst.reserve(SUBPACKET_HEADER_SIZE + body.len());
        self.put_u32(dst, (SUBPACKET_HEADER_SIZE + body.len()) as u32);
        self.put_u32(dst, kind);
        dst.put_slice(body);
    }

    /// Append a sync-fixed sample block for one channel to `dst`.
    ///
    /// `samples` must already be encoded in this format's byte order.
    pub fn encode_sync_fixed(
        &self,
        data_type_code: u32,
        sample_count: u32,
        timestamp: u64,
        timebase: f64,
        samples: &[u8],
        dst: &mut BytesMut,
    ) {
        let mut body = BytesMut::with_capacity(SYNC_FIXED_HEADER_SIZE + samples.len());
        self.put_u32(&mut body, data_type_code);
        self.put_u32(&mut body, 1);
        self.put_u32(&mut body, sample_count);
        self.put_u64(&mut body, timestamp);
        self.put_u64(&mut body, timebase.to_bits());
        body.put_slice(samples);
        self.encode_subpacket(subpacket::SYNC_FIXED, &body, dst);
    }

    /// Append an async-fixed block of `(tick, value)` records for one channel to `dst`.
    ///
    /// Each value in `records` must already be encoded in this format's byte order.
    pub fn encode_async_fixed(
        &self,
        data_type_code: u32,
        timebase: f64,
        records: &[(u64, &[u8])],
        dst: &mut BytesMut,
    ) {
        let mut body = BytesMut::with_capacity(ASYNC_FIXED_HEADER_SIZE);
        self.put_u32(&mut body, data_type_code);
        self.put_u32(&mut body, 1);
        self.put_u32(&mut body, records.len() as u32);
        self.put_u64(&mut body, timebase.to_bits());
        for (tick, value) in records {
            self.put_u64(&mut body, *tick);
            body.put_slice(value);
        }
        self.encode_subpacket(subpacket::ASYNC_FIXED, &body, dst);
    }

    /// Iterate the sub-packets of a frame payload.
    pub fn subpackets<'a>(&'a self, payload: &'a Bytes) -> SubPackets<'a> {
        SubPackets { format: self, payload, pos: 0 }
    }
}

/// One sub-packet of a frame payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SubPacket {
    pub kind: u32,
    pub body: Bytes,
}

/// Iterator over the sub-packets of a payload.
///
/// Yields an error and stops when a sub-packet header is inconsistent.
pub struct SubPackets<'a> {
    format: &'a WireFormat,
    payload: &'a Bytes,
    pos: usize,
}

impl Iterator for SubPackets<'_> {
    type Item = Result<SubPacket, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.payload.len() {
            return None;
        }

        let parsed = parse_subpacket_header(self.format, self.payload, self.pos);
        match parsed {
            Ok((size, kind)) => {
                let body = self.payload.slice(self.pos + SUBPACKET_HEADER_SIZE..self.pos + size);
                self.pos += size;
                Some(Ok(SubPacket { kind, body }))
            }
            Err(e) => {
                self.pos = self.payload.len();
                Some(Err(e))
            }
        }
    }
}

/// Read and bounds-check the sub-packet header at `pos`; returns `(size, kind)`.
pub(crate) fn parse_subpacket_header(
    format: &WireFormat,
    bytes: &[u8],
    pos: usize,
) -> Result<(usize, u32), FrameError> {
    let (Some(size), Some(kind)) = (format.read_u32(bytes, pos), format.read_u32(bytes, pos + 4))
    else {
        return Err(FrameError::malformed(format!("truncated sub-packet header at {}", pos)));
    };

    let size = size as usize;
    if size < SUBPACKET_HEADER_SIZE || size > bytes.len() - pos {
        return Err(FrameError::malformed(format!(
            "sub-packet type {:#x} at {} declares {} bytes, {} available",
            kind,
            pos,
            size,
            bytes.len() - pos
        )));
    }

    Ok((size, kind))
}
