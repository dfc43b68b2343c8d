//! Stream demultiplexer: frame payloads to per-channel sample batches.
//!
//! Three payload encodings are understood:
//!
//! - **Interleaved** sub-packets follow the negotiated [`FrameLayout`]: the body is a
//!   sequence of sample frames of `stride` bytes, each holding every channel's slots at
//!   fixed offsets. Timestamps are derived from the channel's sample rate and a running
//!   per-channel counter.
//! - **Sync-fixed** sub-packets carry one channel each with the instrument's own tick
//!   timestamp and timebase.
//! - **Async-fixed** sub-packets carry one channel each as `(tick, value)` records.
//!
//! Sync and async blocks share one block counter, so the n-th block of either kind in a
//! frame belongs to the n-th negotiated channel.
//!
//! Derived timestamps are anchored to the frame sequence number. The first data frame of
//! a session starts at 0; after a break the counters are re-anchored from the sequence
//! distance, so the segment after a gap starts at an estimate of the elapsed time.
//!
//! XML `ChannelInfo` sub-packets may carry per-channel scaling. It replaces the
//! negotiated scaling for the rest of the layout generation.

use quick_xml::Reader as XmlReader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, trace, warn};

use crate::codec::{ASYNC_FIXED_HEADER_SIZE, SYNC_FIXED_HEADER_SIZE, WireFormat, subpacket};
use crate::error::FrameError;
use crate::registry::FrameLayout;
use crate::types::{
    ChannelDescriptor, Discontinuity, DiscontinuityReason, Frame, FrameKind, Sample,
    SampleBatch, SampleType, SampleValue, Scaling,
};

/// Output of one [`StreamDemultiplexer::process`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemuxOutput {
    /// Marker to deliver before `batches`
    pub discontinuity: Option<Discontinuity>,
    /// One batch per channel that had samples in the frame, in channel order
    pub batches: Vec<SampleBatch>,
}

impl DemuxOutput {
    pub fn is_empty(&self) -> bool {
        self.discontinuity.is_none() && self.batches.is_empty()
    }
}

/// Decoded value with an explicit timestamp, or `None` when it is derived from the rate.
type PendingSample = (Option<f64>, SampleValue);

/// Splits data frames into per-channel batches.
#[derive(Debug)]
pub struct StreamDemultiplexer {
    format: WireFormat,
    generation: u64,
    /// Samples emitted per channel since the last anchor
    counters: Vec<u64>,
    /// Anchor time per channel in seconds
    bases: Vec<f64>,
    session_first: Option<u32>,
    anchored: bool,
    pending: Option<DiscontinuityReason>,
    /// Scaling reported in-stream, with the layout generation it applies to
    reported: Option<(u64, Vec<Scaling>)>,
}

impl StreamDemultiplexer {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            generation: 0,
            counters: Vec::new(),
            bases: Vec::new(),
            session_first: None,
            anchored: false,
            pending: None,
            reported: None,
        }
    }

    /// Forget all timing state; the next data frame starts a new session at t = 0.
    pub fn reset(&mut self) {
        self.counters.clear();
        self.bases.clear();
        self.session_first = None;
        self.anchored = false;
        self.pending = None;
    }

    /// Record a break in the data.
    ///
    /// The next data frame emits exactly one [`Discontinuity`] and re-anchors the
    /// counters. Further calls before that frame keep the first reason.
    pub fn mark_discontinuity(&mut self, reason: DiscontinuityReason) {
        debug!(?reason, "Discontinuity marked");
        self.anchored = false;
        self.counters.iter_mut().for_each(|n| *n = 0);
        self.pending.get_or_insert(reason);
    }

    /// Returns true if a marker will precede the next batch.
    pub fn has_pending_discontinuity(&self) -> bool {
        self.pending.is_some()
    }

    /// Scaling in effect for `channel` under `layout`.
    pub fn scaling(&self, layout: &FrameLayout, channel: usize) -> Option<Scaling> {
        let reported = match &self.reported {
            Some((generation, scaling)) if *generation == layout.generation => {
                scaling.get(channel).copied()
            }
            _ => None,
        };
        reported.or_else(|| layout.channel(channel).map(|d| d.scaling))
    }

    /// Split one frame into batches using `layout`.
    ///
    /// Non-data frames produce an empty output. On error no timing state changes.
    pub fn process(
        &mut self,
        frame: &Frame,
        layout: &FrameLayout,
    ) -> Result<DemuxOutput, FrameError> {
        self.absorb_channel_info(frame, layout);
        if frame.kind != FrameKind::Data {
            return Ok(DemuxOutput::default());
        }

        let decoded = self.decode_channels(frame, layout)?;

        if layout.generation != self.generation || self.counters.len() != layout.channel_count()
        {
            self.generation = layout.generation;
            self.counters = vec![0; layout.channel_count()];
            self.bases = vec![0.0; layout.channel_count()];
            self.anchored = false;
        }

        let sequence = frame.sequence();
        let mut output = DemuxOutput::default();
        if !self.anchored {
            self.anchor(sequence, layout, &decoded);
            if let Some(reason) = self.pending.take() {
                output.discontinuity = Some(Discontinuity { reason, resumed_at: Some(sequence) });
            }
        }

        for (channel, values) in decoded.into_iter().enumerate() {
            if values.is_empty() {
                continue;
            }
            let Some(descriptor) = layout.channel(channel) else { continue };
            let scaling = self.scaling(layout, channel).unwrap_or(descriptor.scaling);

            let samples = values
                .into_iter()
                .map(|(explicit, value)| {
                    let timestamp = explicit.unwrap_or_else(|| {
                        let t = self.bases[channel]
                            + self.counters[channel] as f64 / descriptor.sample_rate;
                        self.counters[channel] += 1;
                        t
                    });
                    Sample { timestamp, value }
                })
                .collect();

            output.batches.push(SampleBatch {
                channel,
                name: descriptor.name.clone(),
                generation: layout.generation,
                sequence,
                scaling,
                samples,
            });
        }

        trace!(sequence, batches = output.batches.len(), "Demultiplexed frame");
        Ok(output)
    }

    /// Take scaling from XML `ChannelInfo` sub-packets in `frame`.
    fn absorb_channel_info(&mut self, frame: &Frame, layout: &FrameLayout) {
        let documents = self
            .format
            .subpackets(&frame.payload)
            .filter_map(Result::ok)
            .filter(|part| part.kind == subpacket::XML_CONFIG);
        for part in documents {
            let xml = String::from_utf8_lossy(&part.body);
            if let Some(scaling) = parse_channel_scaling(&xml) {
                debug!(
                    channels = scaling.len(),
                    generation = layout.generation,
                    "Channel scaling reported by instrument"
                );
                self.reported = Some((layout.generation, scaling));
            }
        }
    }

    fn anchor(&mut self, sequence: u32, layout: &FrameLayout, decoded: &[Vec<PendingSample>]) {
        let first = *self.session_first.get_or_insert(sequence);
        let elapsed_frames = sequence.wrapping_sub(first) as f64;
        for (channel, descriptor) in layout.channels.iter().enumerate() {
            let per_frame = decoded.get(channel).map_or(0, Vec::len) as f64;
            self.bases[channel] = elapsed_frames * per_frame / descriptor.sample_rate;
            self.counters[channel] = 0;
        }
        self.anchored = true;
        debug!(sequence, session_first = first, "Anchored sample timestamps");
    }

    fn decode_channels(
        &self,
        frame: &Frame,
        layout: &FrameLayout,
    ) -> Result<Vec<Vec<PendingSample>>, FrameError> {
        let mut channels: Vec<Vec<PendingSample>> = vec![Vec::new(); layout.channel_count()];
        let mut next_block_channel = 0;

        for part in self.format.subpackets(&frame.payload) {
            let part = part?;
            match part.kind {
                subpacket::INTERLEAVED => {
                    self.decode_interleaved(&part.body, layout, &mut channels)?
                }
                subpacket::SYNC_FIXED => {
                    self.decode_sync_fixed(&part.body, layout, next_block_channel, &mut channels)?;
                    next_block_channel += 1;
                }
                subpacket::ASYNC_FIXED => {
                    self.decode_async_fixed(&part.body, layout, next_block_channel, &mut channels)?;
                    next_block_channel += 1;
                }
                other => trace!(kind = other, "Skipping sub-packet"),
            }
        }
        Ok(channels)
    }

    fn decode_interleaved(
        &self,
        body: &[u8],
        layout: &FrameLayout,
        channels: &mut [Vec<PendingSample>],
    ) -> Result<(), FrameError> {
        if body.len() % layout.stride != 0 {
            return Err(FrameError::LayoutMismatch {
                generation: layout.generation,
                details: format!(
                    "interleaved block of {} bytes is not a multiple of stride {}",
                    body.len(),
                    layout.stride
                ),
            });
        }

        let byte_order = self.format.byte_order;
        for sample_frame in body.chunks_exact(layout.stride) {
            for (entry, descriptor) in layout.entries.iter().zip(&layout.channels) {
                for slot in 0..entry.slots {
                    let start = entry.offset + slot * entry.width;
                    let bytes = &sample_frame[start..start + entry.width];
                    let value = descriptor.data_type.decode(bytes, byte_order).ok_or_else(|| {
                        layout_mismatch(layout, format!("channel '{}' slot {}", descriptor.name, slot))
                    })?;
                    channels[entry.channel].push((None, value));
                }
            }
        }
        Ok(())
    }

    fn decode_sync_fixed(
        &self,
        body: &[u8],
        layout: &FrameLayout,
        channel: usize,
        channels: &mut [Vec<PendingSample>],
    ) -> Result<(), FrameError> {
        let format = &self.format;
        let descriptor = layout.channel(channel).ok_or_else(|| {
            layout_mismatch(layout, format!("sync block {} has no negotiated channel", channel))
        })?;

        let header = (
            format.read_u32(body, 0),
            format.read_u32(body, 4),
            format.read_u32(body, 8),
            format.read_u64(body, 12),
            format.read_f64(body, 20),
        );
        let (Some(code), Some(dimension), Some(count), Some(timestamp), Some(timebase)) = header
        else {
            return Err(FrameError::malformed(format!(
                "sync block for '{}' shorter than its header",
                descriptor.name
            )));
        };
        check_block(layout, descriptor, "sync", code, dimension, timebase)?;

        let width = descriptor.data_type.size();
        let samples = &body[SYNC_FIXED_HEADER_SIZE..];
        if samples.len() != count as usize * width {
            return Err(FrameError::malformed(format!(
                "sync block for '{}' declares {} samples but holds {} bytes",
                descriptor.name,
                count,
                samples.len()
            )));
        }

        for (i, bytes) in samples.chunks_exact(width).enumerate() {
            let value = descriptor
                .data_type
                .decode(bytes, format.byte_order)
                .ok_or_else(|| layout_mismatch(layout, format!("'{}' sample {}", descriptor.name, i)))?;
            let t = (timestamp as f64 + i as f64) / timebase;
            channels[channel].push((Some(t), value));
        }
        Ok(())
    }

    fn decode_async_fixed(
        &self,
        body: &[u8],
        layout: &FrameLayout,
        channel: usize,
        channels: &mut [Vec<PendingSample>],
    ) -> Result<(), FrameError> {
        let format = &self.format;
        let descriptor = layout.channel(channel).ok_or_else(|| {
            layout_mismatch(layout, format!("async block {} has no negotiated channel", channel))
        })?;

        let header = (
            format.read_u32(body, 0),
            format.read_u32(body, 4),
            format.read_u32(body, 8),
            format.read_f64(body, 12),
        );
        let (Some(code), Some(dimension), Some(count), Some(timebase)) = header else {
            return Err(FrameError::malformed(format!(
                "async block for '{}' shorter than its header",
                descriptor.name
            )));
        };
        check_block(layout, descriptor, "async", code, dimension, timebase)?;

        let width = descriptor.data_type.size();
        let record = 8 + width;
        let records = &body[ASYNC_FIXED_HEADER_SIZE..];
        if records.len() != count as usize * record {
            return Err(FrameError::malformed(format!(
                "async block for '{}' declares {} records but holds {} bytes",
                descriptor.name,
                count,
                records.len()
            )));
        }

        for (i, bytes) in records.chunks_exact(record).enumerate() {
            let (Some(tick), Some(value)) = (
                format.read_u64(bytes, 0),
                descriptor.data_type.decode(&bytes[8..], format.byte_order),
            ) else {
                return Err(layout_mismatch(layout, format!("'{}' record {}", descriptor.name, i)));
            };
            channels[channel].push((Some(tick as f64 / timebase), value));
        }
        Ok(())
    }
}

/// Type, dimension and timebase checks shared by sync and async blocks.
fn check_block(
    layout: &FrameLayout,
    descriptor: &ChannelDescriptor,
    kind: &str,
    code: u32,
    dimension: u32,
    timebase: f64,
) -> Result<(), FrameError> {
    if SampleType::from_code(code) != Some(descriptor.data_type) {
        return Err(layout_mismatch(
            layout,
            format!(
                "{} block type code {} does not match {:?} of '{}'",
                kind, code, descriptor.data_type, descriptor.name
            ),
        ));
    }
    if dimension != 1 {
        return Err(layout_mismatch(
            layout,
            format!("'{}' has unsupported dimension {}", descriptor.name, dimension),
        ));
    }
    if !timebase.is_finite() || timebase <= 0.0 {
        return Err(FrameError::malformed(format!(
            "'{}' has invalid timebase {}",
            descriptor.name, timebase
        )));
    }
    Ok(())
}

/// Per-channel scaling from a `ChannelInfo` document.
///
/// Each child of the root describes one channel in negotiated order; its first nested
/// element carries `factor` and `offset` attributes, each defaulting to identity.
/// Returns `None` for other documents.
fn parse_channel_scaling(xml: &str) -> Option<Vec<Scaling>> {
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut depth = 0usize;
    let mut scaling: Option<Vec<Scaling>> = None;
    let mut awaiting_first = false;

    loop {
        let (element, opens) = match reader.read_event() {
            Ok(Event::Start(e)) => (e, true),
            Ok(Event::Empty(e)) => (e, false),
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                continue;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!(error = %e, "Unreadable channel info XML");
                return None;
            }
            Ok(_) => continue,
        };

        match depth {
            0 if element.name().as_ref() == b"ChannelInfo" => scaling = Some(Vec::new()),
            0 => return None,
            1 => {
                if let Some(channels) = scaling.as_mut() {
                    channels.push(Scaling::default());
                }
                awaiting_first = opens;
            }
            2 if awaiting_first => {
                if let Some(last) = scaling.as_mut().and_then(|c| c.last_mut()) {
                    *last = scaling_attributes(&element);
                }
                awaiting_first = false;
            }
            _ => {}
        }
        if opens {
            depth += 1;
        }
    }
    scaling
}

fn scaling_attributes(element: &BytesStart<'_>) -> Scaling {
    let mut scaling = Scaling::default();
    for attr in element.attributes().flatten() {
        let value = String::from_utf8_lossy(attr.value.as_ref());
        match attr.key.as_ref() {
            b"factor" => scaling.factor = value.trim().parse().unwrap_or(scaling.factor),
            b"offset" => scaling.offset = value.trim().parse().unwrap_or(scaling.offset),
            _ => {}
        }
    }
    scaling
}

fn layout_mismatch(layout: &FrameLayout, details: String) -> FrameError {
    FrameError::LayoutMismatch { generation: layout.generation, details }
}
