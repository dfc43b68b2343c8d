//! Frame decoding and control request encoding

use std::ops::Range;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::wire::{
    PACKET_INFO_SIZE, PROTOCOL_VERSION, SUBPACKET_HEADER_SIZE, WireFormat, parse_subpacket_header,
    subpacket,
};
use crate::error::FrameError;
use crate::types::{
    Frame, FrameKind, PacketInfo, STATUS_FIRST_PACKET, STATUS_LAST_PACKET,
};

/// Requests the client sends to the instrument on the data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlRequest {
    StartStream,
    StopStream,
    KeepAliveAck,
}

impl ControlRequest {
    pub const fn code(&self) -> u32 {
        match self {
            ControlRequest::StartStream => 1,
            ControlRequest::StopStream => 2,
            ControlRequest::KeepAliveAck => 3,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ControlRequest::StartStream),
            2 => Some(ControlRequest::StopStream),
            3 => Some(ControlRequest::KeepAliveAck),
            _ => None,
        }
    }
}

/// Result of one decode attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    /// A complete, validated frame
    Frame(Frame),
    /// The buffer holds only part of a frame; nothing was consumed
    NeedMoreBytes,
    /// The bytes at the front of the buffer do not form a valid frame
    Invalid(FrameError),
}

/// Location of a validated frame inside the input buffer.
struct Located {
    kind: FrameKind,
    info: PacketInfo,
    payload: Range<usize>,
}

enum Inspection {
    Frame(Located),
    NeedMoreBytes,
    Invalid(FrameError),
}

/// Stateless frame codec for one [`WireFormat`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    format: WireFormat,
    scan_window: usize,
}

impl FrameCodec {
    /// Create a codec. `scan_window` bounds how many bytes a single decode call may
    /// skip while searching for the next start token.
    pub fn new(format: WireFormat, scan_window: usize) -> Self {
        Self { format, scan_window: scan_window.max(1) }
    }

    pub fn format(&self) -> &WireFormat {
        &self.format
    }

    /// Decode the frame at the front of `buf`.
    ///
    /// Returns the outcome and the number of bytes the caller must discard from the
    /// front of its buffer. `NeedMoreBytes` never consumes input.
    pub fn decode(&self, buf: &[u8]) -> (DecodeOutcome, usize) {
        match self.inspect(buf) {
            (Inspection::Frame(located), consumed) => {
                let payload = Bytes::copy_from_slice(&buf[located.payload]);
                let frame = Frame { kind: located.kind, info: located.info, payload };
                (DecodeOutcome::Frame(frame), consumed)
            }
            (Inspection::NeedMoreBytes, consumed) => (DecodeOutcome::NeedMoreBytes, consumed),
            (Inspection::Invalid(e), consumed) => (DecodeOutcome::Invalid(e), consumed),
        }
    }

    /// Decode the frame at the front of `buf`, advancing it by the consumed bytes.
    ///
    /// The frame payload shares the buffer's allocation.
    pub fn decode_from(&self, buf: &mut BytesMut) -> DecodeOutcome {
        let (inspection, consumed) = self.inspect(buf);
        match inspection {
            Inspection::Frame(located) => {
                let frame_bytes = buf.split_to(consumed).freeze();
                let payload = frame_bytes.slice(located.payload);
                DecodeOutcome::Frame(Frame { kind: located.kind, info: located.info, payload })
            }
            Inspection::NeedMoreBytes => DecodeOutcome::NeedMoreBytes,
            Inspection::Invalid(e) => {
                buf.advance(consumed);
                DecodeOutcome::Invalid(e)
            }
        }
    }

    fn inspect(&self, buf: &[u8]) -> (Inspection, usize) {
        let format = &self.format;
        let token = format.start_token.as_bytes();

        if !buf.starts_with(token) {
            if buf.len() < token.len() && token.starts_with(buf) {
                return (Inspection::NeedMoreBytes, 0);
            }
            let skipped = self.next_token_candidate(buf);
            return (Inspection::Invalid(FrameError::BadStartToken { skipped }), skipped);
        }

        let Some(size) = format.read_u32(buf, token.len()) else {
            return (Inspection::NeedMoreBytes, 0);
        };
        let size = size as usize;

        let min = format.min_frame_size();
        let max = format.max_frame_size;
        if size < min || size > max {
            return (Inspection::Invalid(FrameError::BadLength { size, min, max }), 1);
        }

        if buf.len() < size {
            return (Inspection::NeedMoreBytes, 0);
        }

        let frame = &buf[..size];
        let end = format.end_token.as_bytes();
        if !frame.ends_with(end) {
            return (Inspection::Invalid(FrameError::BadTrailer { size }), 1);
        }

        let body_end = size - format.trailer_len();
        if format.checksum.size() > 0 {
            let expected = format.read_u32(frame, body_end).unwrap_or_default();
            let actual = format.checksum.compute(&frame[..body_end]);
            if expected != actual {
                return (Inspection::Invalid(FrameError::ChecksumMismatch { expected, actual }), size);
            }
        }

        match self.locate_payload(frame, format.header_len(), body_end) {
            Ok(located) => {
                trace!(
                    size,
                    sequence = located.info.sequence,
                    kind = ?located.kind,
                    "Decoded frame"
                );
                (Inspection::Frame(located), size)
            }
            Err(e) => (Inspection::Invalid(e), size),
        }
    }

    /// Offset of the next position that could begin a start token, bounded by the
    /// scan window. A trailing partial token counts as a candidate.
    fn next_token_candidate(&self, buf: &[u8]) -> usize {
        let token = self.format.start_token.as_bytes();
        let limit = buf.len().min(self.scan_window);
        (1..limit)
            .find(|&pos| {
                let rest = &buf[pos..];
                if rest.len() >= token.len() { rest.starts_with(token) } else { token.starts_with(rest) }
            })
            .unwrap_or(limit)
            .max(1)
    }

    /// Walk the sub-packet chain of a checksummed frame.
    fn locate_payload(
        &self,
        frame: &[u8],
        body_start: usize,
        body_end: usize,
    ) -> Result<Located, FrameError> {
        let format = &self.format;
        let body = &frame[..body_end];

        let (info_size, info_kind) = parse_subpacket_header(format, body, body_start)?;
        if info_kind != subpacket::PACKET_INFO || info_size < SUBPACKET_HEADER_SIZE + PACKET_INFO_SIZE
        {
            return Err(FrameError::malformed(format!(
                "first sub-packet is type {:#x} with {} bytes, expected packet info",
                info_kind, info_size
            )));
        }

        let field = |n: usize| {
            format.read_u32(body, body_start + SUBPACKET_HEADER_SIZE + n * 4).unwrap_or_default()
        };
        let info = PacketInfo {
            protocol_version: field(0),
            stream_id: field(1),
            sequence: field(2),
            status: field(3),
            seed: field(4),
            subpacket_count: field(5),
        };

        let payload_start = body_start + info_size;
        let mut pos = payload_start;
        let mut payload_end = body_end;
        let mut has_samples = false;
        while pos < body_end {
            let (size, kind) = parse_subpacket_header(format, body, pos)?;
            if kind == subpacket::PACKET_FOOTER {
                payload_end = pos;
                break;
            }
            has_samples |= subpacket::carries_samples(kind);
            pos += size;
        }

        let kind = if has_samples {
            FrameKind::Data
        } else if info.has_status(STATUS_FIRST_PACKET) {
            FrameKind::ControlAck
        } else if info.has_status(STATUS_LAST_PACKET) {
            FrameKind::EndOfStream
        } else {
            FrameKind::KeepAlive
        };

        Ok(Located { kind, info, payload: payload_start..payload_end })
    }

    /// Encode a complete frame around `payload` (already encoded sub-packets).
    pub fn encode_frame(
        &self,
        info: &PacketInfo,
        payload: &[u8],
        dst: &mut BytesMut,
    ) -> Result<(), FrameError> {
        let format = &self.format;
        let size = format.min_frame_size() + payload.len();
        if size > format.max_frame_size {
            return Err(FrameError::BadLength {
                size,
                min: format.min_frame_size(),
                max: format.max_frame_size,
            });
        }

        let start = dst.len();
        dst.reserve(size);
        dst.put_slice(format.start_token.as_bytes());
        format.put_u32(dst, size as u32);

        format.put_u32(dst, (SUBPACKET_HEADER_SIZE + PACKET_INFO_SIZE) as u32);
        format.put_u32(dst, subpacket::PACKET_INFO);
        for value in
            [info.protocol_version, info.stream_id, info.sequence, info.status, info.seed, info.subpacket_count]
        {
            format.put_u32(dst, value);
        }
        dst.put_slice(payload);

        if format.checksum.size() > 0 {
            let checksum = format.checksum.compute(&dst[start..]);
            format.put_u32(dst, checksum);
        }
        dst.put_slice(format.end_token.as_bytes());
        Ok(())
    }

    /// Encode a control request as a complete frame.
    pub fn encode(&self, request: ControlRequest) -> Bytes {
        let mut body = BytesMut::with_capacity(4);
        self.format.put_u32(&mut body, request.code());
        let mut payload = BytesMut::with_capacity(SUBPACKET_HEADER_SIZE + 4);
        self.format.encode_subpacket(subpacket::CONTROL, &body, &mut payload);

        let info = PacketInfo { protocol_version: PROTOCOL_VERSION, subpacket_count: 1, ..Default::default() };
        let mut dst = BytesMut::with_capacity(self.format.min_frame_size() + payload.len());
        // A control frame is far below any valid size limit.
        let _ = self.encode_frame(&info, &payload, &mut dst);
        dst.freeze()
    }

    /// Extract a control request carried by `frame`, if any.
    pub fn control_request(&self, frame: &Frame) -> Option<ControlRequest> {
        self.format
            .subpackets(&frame.payload)
            .filter_map(Result::ok)
            .find(|sub| sub.kind == subpacket::CONTROL)
            .and_then(|sub| self.format.read_u32(&sub.body, 0))
            .and_then(ControlRequest::from_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ChecksumKind;
    use crate::types::{ByteOrder, STATUS_ERROR};
    use proptest::prelude::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(WireFormat::default(), 64 * 1024)
    }

    fn data_frame(codec: &FrameCodec, sequence: u32, samples: &[u8]) -> BytesMut {
        let mut payload = BytesMut::new();
        codec.format().encode_subpacket(subpacket::INTERLEAVED, samples, &mut payload);
        let info = PacketInfo { sequence, subpacket_count: 1, ..Default::default() };
        let mut out = BytesMut::new();
        codec.encode_frame(&info, &payload, &mut out).unwrap();
        out
    }

    fn expect_frame(outcome: DecodeOutcome) -> Frame {
        match outcome {
            DecodeOutcome::Frame(frame) => frame,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn decodes_data_frame() {
        let codec = codec();
        let wire = data_frame(&codec, 42, &[1, 2, 3, 4]);

        let (outcome, consumed) = codec.decode(&wire);
        assert_eq!(consumed, wire.len());
        let frame = expect_frame(outcome);
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.sequence(), 42);

        let subs: Vec<_> = codec.format().subpackets(&frame.payload).map(Result::unwrap).collect();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].body.as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn partial_frames_need_more_bytes() {
        let codec = codec();
        let wire = data_frame(&codec, 1, &[9; 16]);
        for cut in 0..wire.len() {
            let (outcome, consumed) = codec.decode(&wire[..cut]);
            assert_eq!(outcome, DecodeOutcome::NeedMoreBytes, "cut at {}", cut);
            assert_eq!(consumed, 0);
        }
    }

    #[test]
    fn checksum_mismatch_consumes_one_frame() {
        let codec = codec();
        let mut wire = data_frame(&codec, 1, &[0; 8]);
        let second = data_frame(&codec, 2, &[0; 8]);
        let first_len = wire.len();
        // Corrupt a payload byte
        wire[first_len - 20] ^= 0xff;
        wire.extend_from_slice(&second);

        let (outcome, consumed) = codec.decode(&wire);
        assert!(matches!(outcome, DecodeOutcome::Invalid(FrameError::ChecksumMismatch { .. })));
        assert_eq!(consumed, first_len);

        let (outcome, _) = codec.decode(&wire[consumed..]);
        assert_eq!(expect_frame(outcome).sequence(), 2);
    }

    #[test]
    fn garbage_is_skipped_up_to_next_token() {
        let codec = codec();
        let mut wire = BytesMut::from(&b"noise!OXY"[..]);
        wire.extend_from_slice(&data_frame(&codec, 5, &[]));

        let (outcome, consumed) = codec.decode(&wire);
        assert_eq!(outcome, DecodeOutcome::Invalid(FrameError::BadStartToken { skipped: 9 }));
        assert_eq!(consumed, 9);

        let frame = expect_frame(codec.decode(&wire[consumed..]).0);
        assert_eq!(frame.sequence(), 5);
        assert_eq!(frame.kind, FrameKind::KeepAlive);
    }

    #[test]
    fn scan_window_bounds_skipped_bytes() {
        let codec = FrameCodec::new(WireFormat::default(), 4);
        let (outcome, consumed) = codec.decode(&[0u8; 100]);
        assert_eq!(outcome, DecodeOutcome::Invalid(FrameError::BadStartToken { skipped: 4 }));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn bad_length_and_trailer_consume_one_byte() {
        let codec = codec();
        let mut wire = BytesMut::new();
        wire.put_slice(b"OXYGEN<<");
        wire.put_u32_le(3);
        let (outcome, consumed) = codec.decode(&wire);
        assert!(matches!(outcome, DecodeOutcome::Invalid(FrameError::BadLength { size: 3, .. })));
        assert_eq!(consumed, 1);

        let mut wire = data_frame(&codec, 1, &[]);
        let last = wire.len() - 1;
        wire[last] = b'?';
        let (outcome, consumed) = codec.decode(&wire);
        assert!(matches!(outcome, DecodeOutcome::Invalid(FrameError::BadTrailer { .. })));
        assert_eq!(consumed, 1);
    }

    #[test]
    fn frame_kinds_follow_status_and_content() {
        let codec = codec();
        let mut out = BytesMut::new();
        let info = PacketInfo { status: STATUS_FIRST_PACKET, ..Default::default() };
        codec.encode_frame(&info, &[], &mut out).unwrap();
        let info = PacketInfo { sequence: 1, status: STATUS_LAST_PACKET, ..Default::default() };
        codec.encode_frame(&info, &[], &mut out).unwrap();
        out.extend_from_slice(&data_frame(&codec, 2, &[1]));

        let mut kinds = Vec::new();
        while !out.is_empty() {
            kinds.push(expect_frame(codec.decode_from(&mut out)).kind);
        }
        assert_eq!(kinds, vec![FrameKind::ControlAck, FrameKind::EndOfStream, FrameKind::Data]);
    }

    #[test]
    fn footer_terminates_payload() {
        let codec = codec();
        let mut payload = BytesMut::new();
        codec.format().encode_subpacket(subpacket::INTERLEAVED, &[7, 7], &mut payload);
        let data_len = payload.len();
        codec.format().encode_subpacket(subpacket::PACKET_FOOTER, &[], &mut payload);

        let mut wire = BytesMut::new();
        codec.encode_frame(&PacketInfo::default(), &payload, &mut wire).unwrap();
        let frame = expect_frame(codec.decode(&wire).0);
        assert_eq!(frame.payload.len(), data_len);
    }

    #[test]
    fn malformed_subpacket_chain_consumes_frame() {
        let codec = codec();
        let mut payload = BytesMut::new();
        payload.put_u32_le(4096);
        payload.put_u32_le(subpacket::INTERLEAVED);
        let mut wire = BytesMut::new();
        codec.encode_frame(&PacketInfo::default(), &payload, &mut wire).unwrap();

        let (outcome, consumed) = codec.decode(&wire);
        assert!(matches!(outcome, DecodeOutcome::Invalid(FrameError::Malformed { .. })));
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn control_requests_encode_as_frames() {
        let codec = codec();
        for request in
            [ControlRequest::StartStream, ControlRequest::StopStream, ControlRequest::KeepAliveAck]
        {
            let wire = codec.encode(request);
            let frame = expect_frame(codec.decode(&wire).0);
            assert_eq!(frame.kind, FrameKind::KeepAlive);
            assert_eq!(codec.control_request(&frame), Some(request));
        }
        assert_eq!(codec.encode(ControlRequest::StartStream), codec.encode(ControlRequest::StartStream));
    }

    #[test]
    fn alternate_formats() {
        for checksum in [ChecksumKind::None, ChecksumKind::Fnv1a] {
            let format = WireFormat {
                start_token: "DST[".to_string(),
                end_token: "]".to_string(),
                byte_order: ByteOrder::Big,
                checksum,
                ..Default::default()
            };
            let codec = FrameCodec::new(format, 1024);
            let wire = data_frame(&codec, 0x0102_0304, &[5, 6]);
            let frame = expect_frame(codec.decode(&wire).0);
            assert_eq!(frame.sequence(), 0x0102_0304);
        }
    }

    #[test]
    fn instrument_envelope_without_checksum_or_end_token() {
        let preset = FrameCodec::new(WireFormat::oxygen(), 1024);
        let wire = data_frame(&preset, 9, &[1, 2]);
        assert_eq!(wire.len(), 12 + 8 + 24 + 10 + 8);
        assert!(wire.ends_with(b">>OXYGEN"));
        assert_eq!(expect_frame(preset.decode(&wire).0).sequence(), 9);

        let bare = FrameCodec::new(
            WireFormat { end_token: String::new(), ..WireFormat::oxygen() },
            1024,
        );
        let mut wire = data_frame(&bare, 10, &[3, 4]);
        wire.extend_from_slice(&data_frame(&bare, 11, &[5, 6]));
        assert_eq!(expect_frame(bare.decode_from(&mut wire)).sequence(), 10);
        assert_eq!(expect_frame(bare.decode_from(&mut wire)).sequence(), 11);
        assert!(wire.is_empty());
    }

    #[test]
    fn oversize_frames_are_rejected_on_encode() {
        let format = WireFormat { max_frame_size: 64, ..Default::default() };
        let codec = FrameCodec::new(format, 1024);
        let mut out = BytesMut::new();
        let result = codec.encode_frame(&PacketInfo::default(), &[0u8; 64], &mut out);
        assert!(matches!(result, Err(FrameError::BadLength { .. })));
    }

    prop_compose! {
        fn arb_frame()(
            sequence in any::<u32>(),
            status in prop::sample::select(vec![0, STATUS_ERROR]),
            samples in prop::collection::vec(any::<u8>(), 0..64),
        ) -> (PacketInfo, Vec<u8>) {
            (PacketInfo { sequence, status, subpacket_count: 1, ..Default::default() }, samples)
        }
    }

    proptest! {
        #[test]
        fn payload_survives_decode(frames in prop::collection::vec(arb_frame(), 1..8)) {
            let codec = codec();
            let mut wire = BytesMut::new();
            let mut payloads = Vec::new();
            for (info, samples) in &frames {
                let mut payload = BytesMut::new();
                codec.format().encode_subpacket(subpacket::INTERLEAVED, samples, &mut payload);
                codec.encode_frame(info, &payload, &mut wire).unwrap();
                payloads.push(payload.freeze());
            }

            for ((info, _), payload) in frames.iter().zip(payloads) {
                let frame = match codec.decode_from(&mut wire) {
                    DecodeOutcome::Frame(frame) => frame,
                    other => return Err(TestCaseError::fail(format!("unexpected {:?}", other))),
                };
                prop_assert_eq!(&frame.info, info);
                prop_assert_eq!(&frame.payload, &payload);

                // Re-encoding the decoded parts reproduces identical bytes
                let mut again = BytesMut::new();
                codec.encode_frame(&frame.info, &frame.payload, &mut again).unwrap();
                let reparsed = match codec.decode(&again).0 {
                    DecodeOutcome::Frame(frame) => frame,
                    other => return Err(TestCaseError::fail(format!("unexpected {:?}", other))),
                };
                prop_assert_eq!(reparsed.info, frame.info);
            }
            prop_assert!(wire.is_empty());
        }

        #[test]
        fn byte_at_a_time_matches_contiguous(
            frames in prop::collection::vec(arb_frame(), 1..6),
            noise in prop::collection::vec(any::<u8>(), 0..16),
        ) {
            let codec = codec();
            let mut wire = BytesMut::new();
            wire.extend_from_slice(&noise);
            for (info, samples) in &frames {
                let mut payload = BytesMut::new();
                codec.format().encode_subpacket(subpacket::INTERLEAVED, samples, &mut payload);
                codec.encode_frame(info, &payload, &mut wire).unwrap();
            }

            let collect = |chunks: Vec<&[u8]>| {
                let mut buf = BytesMut::new();
                let mut out = Vec::new();
                for chunk in chunks {
                    buf.extend_from_slice(chunk);
                    loop {
                        match codec.decode_from(&mut buf) {
                            DecodeOutcome::Frame(frame) => out.push(frame),
                            DecodeOutcome::NeedMoreBytes => break,
                            DecodeOutcome::Invalid(_) => continue,
                        }
                    }
                }
                out
            };

            let contiguous = collect(vec![&wire[..]]);
            let fragmented = collect(wire.chunks(1).collect());
            prop_assert_eq!(contiguous.len(), frames.len());
            prop_assert_eq!(fragmented, contiguous);
        }
    }
}
