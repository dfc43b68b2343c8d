//! Channel descriptor types

use serde::{Deserialize, Serialize};

use super::SampleType;

/// Linear scaling applied to raw sample values: `raw * factor + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    pub factor: f64,
    pub offset: f64,
}

impl Default for Scaling {
    fn default() -> Self {
        Self { factor: 1.0, offset: 0.0 }
    }
}

impl Scaling {
    /// Apply the scaling to a raw value.
    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.factor + self.offset
    }
}

/// Description of one streamed channel as reported by the control channel.
///
/// Descriptors are plain data until the [`crate::ChannelRegistry`] accepts them; the
/// registry assigns `index` from the descriptor's position in the negotiated list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Channel name as known to the instrument (e.g. "AI 1/1 Sim")
    pub name: String,
    /// Position in the negotiated channel list
    #[serde(default)]
    pub index: usize,
    /// Physical unit (e.g. "V", "m/s^2")
    #[serde(default)]
    pub unit: String,
    /// Wire data type of each sample
    pub data_type: SampleType,
    /// Samples per second
    pub sample_rate: f64,
    /// Bytes per sample slot; must match `data_type`
    pub byte_width: usize,
    /// Sample slots this channel occupies in one sample frame (faster channels use more)
    #[serde(default = "default_slots")]
    pub slots: usize,
    /// Conversion from raw values to physical values
    #[serde(default)]
    pub scaling: Scaling,
}

fn default_slots() -> usize {
    1
}

impl ChannelDescriptor {
    /// Create a descriptor with one slot per sample frame and identity scaling.
    pub fn new(name: impl Into<String>, data_type: SampleType, sample_rate: f64) -> Self {
        Self {
            name: name.into(),
            index: 0,
            unit: String::new(),
            data_type,
            sample_rate,
            byte_width: data_type.size(),
            slots: 1,
            scaling: Scaling::default(),
        }
    }

    /// Set the physical unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Set the number of slots per sample frame.
    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    /// Set the raw-to-physical scaling.
    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.scaling = Scaling { factor, offset };
        self
    }

    /// Bytes this channel occupies in one sample frame.
    pub fn bytes_per_sample_frame(&self) -> usize {
        self.byte_width * self.slots
    }
}
