//! Channel registry and negotiated frame layout.
//!
//! The registry holds the ordered channel list agreed with the instrument. Its order is
//! the wire layout of interleaved sample frames:
//!
//! ```text
//! sample frame (stride bytes)
//! ┌───────────────────┬──────────────────────────────┬────────────┐
//! │ ch 0: width*slots │ ch 1: width*slots            │ ...        │
//! └───────────────────┴──────────────────────────────┴────────────┘
//! ```
//!
//! Every successful [`ChannelRegistry::negotiate`] bumps the generation. A
//! [`FrameLayout`] is tied to the generation it was computed for, so a demultiplexer
//! holding an old layout fails loudly instead of misreading bytes.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::types::ChannelDescriptor;
use crate::{Result, StreamError};

/// Placement of one channel inside a sample frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutEntry {
    /// Channel position in the negotiated list
    pub channel: usize,
    /// Byte offset from the start of the sample frame
    pub offset: usize,
    /// Bytes per sample slot
    pub width: usize,
    /// Slots per sample frame
    pub slots: usize,
}

/// Immutable byte layout for one registry generation.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameLayout {
    pub generation: u64,
    pub entries: Vec<LayoutEntry>,
    /// Bytes per sample frame
    pub stride: usize,
    pub channels: Vec<ChannelDescriptor>,
}

impl FrameLayout {
    fn build(generation: u64, channels: Vec<ChannelDescriptor>) -> Self {
        let mut offset = 0;
        let entries = channels
            .iter()
            .map(|c| {
                let entry =
                    LayoutEntry { channel: c.index, offset, width: c.byte_width, slots: c.slots };
                offset += c.bytes_per_sample_frame();
                entry
            })
            .collect();
        Self { generation, entries, stride: offset, channels }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Descriptor for a channel index.
    pub fn channel(&self, index: usize) -> Option<&ChannelDescriptor> {
        self.channels.get(index)
    }
}

/// Ordered channel descriptors plus the generation counter.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    generation: u64,
    frozen: bool,
    layout: Option<Arc<FrameLayout>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and install a new channel list, returning the new generation.
    ///
    /// Indices are reassigned from list order. On failure the previous layout stays
    /// in place.
    pub fn negotiate(&mut self, descriptors: Vec<ChannelDescriptor>) -> Result<u64> {
        if self.frozen {
            return Err(StreamError::negotiation_failed(
                "registry is frozen while streaming",
            ));
        }
        if descriptors.is_empty() {
            return Err(StreamError::negotiation_failed("no channels selected"));
        }

        let mut names = HashSet::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            validate_descriptor(descriptor)?;
            if !names.insert(descriptor.name.as_str()) {
                return Err(StreamError::negotiation_failed(format!(
                    "duplicate channel '{}'",
                    descriptor.name
                )));
            }
        }

        let channels = descriptors
            .into_iter()
            .enumerate()
            .map(|(index, descriptor)| ChannelDescriptor { index, ..descriptor })
            .collect();

        self.generation += 1;
        let layout = FrameLayout::build(self.generation, channels);
        debug!(
            generation = self.generation,
            channels = layout.channel_count(),
            stride = layout.stride,
            "Negotiated channel layout"
        );
        self.layout = Some(Arc::new(layout));
        Ok(self.generation)
    }

    /// Layout for `generation`; only the current generation is available.
    pub fn layout_for(&self, generation: u64) -> Result<Arc<FrameLayout>> {
        match &self.layout {
            Some(layout) if layout.generation == generation => Ok(Arc::clone(layout)),
            Some(layout) => Err(StreamError::negotiation_failed(format!(
                "layout generation {} is stale (current is {})",
                generation, layout.generation
            ))),
            None => Err(StreamError::negotiation_failed(format!(
                "no layout negotiated for generation {}",
                generation
            ))),
        }
    }

    /// Current layout, if any negotiation has succeeded.
    pub fn current(&self) -> Option<Arc<FrameLayout>> {
        self.layout.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn descriptors(&self) -> &[ChannelDescriptor] {
        self.layout.as_deref().map(|l| l.channels.as_slice()).unwrap_or_default()
    }

    /// Look up a channel by name.
    pub fn find(&self, name: &str) -> Option<&ChannelDescriptor> {
        self.descriptors().iter().find(|d| d.name == name)
    }

    /// Lock the layout while streaming.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn thaw(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

fn validate_descriptor(descriptor: &ChannelDescriptor) -> Result<()> {
    let name = &descriptor.name;
    if !descriptor.sample_rate.is_finite() || descriptor.sample_rate <= 0.0 {
        return Err(StreamError::negotiation_failed(format!(
            "channel '{}' has invalid sample rate {}",
            name, descriptor.sample_rate
        )));
    }
    if descriptor.slots == 0 {
        return Err(StreamError::negotiation_failed(format!(
            "channel '{}' occupies zero slots",
            name
        )));
    }
    if descriptor.byte_width != descriptor.data_type.size() {
        return Err(StreamError::negotiation_failed(format!(
            "channel '{}' declares {} bytes per sample but {:?} is {} bytes",
            name,
            descriptor.byte_width,
            descriptor.data_type,
            descriptor.data_type.size()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SampleType;

    fn two_channels() -> Vec<ChannelDescriptor> {
        vec![
            ChannelDescriptor::new("AI 1", SampleType::Int16, 100.0),
            ChannelDescriptor::new("AI 2", SampleType::Float32, 100.0),
        ]
    }

    #[test]
    fn negotiate_assigns_offsets_in_order() {
        let mut registry = ChannelRegistry::new();
        let generation = registry.negotiate(two_channels()).unwrap();
        assert_eq!(generation, 1);

        let layout = registry.layout_for(generation).unwrap();
        assert_eq!(layout.stride, 6);
        assert_eq!(layout.entries[0], LayoutEntry { channel: 0, offset: 0, width: 2, slots: 1 });
        assert_eq!(layout.entries[1], LayoutEntry { channel: 1, offset: 2, width: 4, slots: 1 });
        assert_eq!(registry.find("AI 2").map(|d| d.index), Some(1));
    }

    #[test]
    fn multi_slot_channels_widen_the_stride() {
        let mut registry = ChannelRegistry::new();
        let channels = vec![
            ChannelDescriptor::new("fast", SampleType::Int24, 1000.0).with_slots(10),
            ChannelDescriptor::new("slow", SampleType::Float64, 100.0),
        ];
        let generation = registry.negotiate(channels).unwrap();
        let layout = registry.layout_for(generation).unwrap();
        assert_eq!(layout.entries[1].offset, 30);
        assert_eq!(layout.stride, 38);
    }

    #[test]
    fn rejects_invalid_channel_lists() {
        let mut registry = ChannelRegistry::new();
        assert!(registry.negotiate(vec![]).is_err());

        let mut duplicate = two_channels();
        duplicate[1].name = "AI 1".to_string();
        assert!(registry.negotiate(duplicate).is_err());

        for rate in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let channels = vec![ChannelDescriptor::new("AI 1", SampleType::Int8, rate)];
            assert!(registry.negotiate(channels).is_err(), "rate {} accepted", rate);
        }

        let channels = vec![ChannelDescriptor::new("AI 1", SampleType::Int8, 10.0).with_slots(0)];
        assert!(registry.negotiate(channels).is_err());

        let mut wrong_width = ChannelDescriptor::new("AI 1", SampleType::Int16, 10.0);
        wrong_width.byte_width = 4;
        assert!(matches!(
            registry.negotiate(vec![wrong_width]),
            Err(StreamError::Negotiation { .. })
        ));

        assert_eq!(registry.generation(), 0);
        assert!(registry.current().is_none());
    }

    #[test]
    fn stale_generation_is_rejected() {
        let mut registry = ChannelRegistry::new();
        let first = registry.negotiate(two_channels()).unwrap();
        let second = registry.negotiate(two_channels()).unwrap();
        assert!(second > first);
        assert!(registry.layout_for(first).is_err());
        assert!(registry.layout_for(second).is_ok());
    }

    #[test]
    fn frozen_registry_refuses_negotiation() {
        let mut registry = ChannelRegistry::new();
        let generation = registry.negotiate(two_channels()).unwrap();
        registry.freeze();
        assert!(registry.is_frozen());
        assert!(registry.negotiate(two_channels()).is_err());
        assert_eq!(registry.generation(), generation);

        registry.thaw();
        assert!(registry.negotiate(two_channels()).is_ok());
    }
}
