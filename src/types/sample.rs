//! Sample batches and delivery events

use serde::{Deserialize, Serialize};

use super::{SampleValue, Scaling};

/// One timestamped sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the start of the stream
    pub timestamp: f64,
    pub value: SampleValue,
}

/// Ordered samples of one channel decoded from one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    /// Channel position in the negotiated layout
    pub channel: usize,
    /// Channel name
    pub name: String,
    /// Registry generation the batch was decoded with
    pub generation: u64,
    /// Sequence number of the frame the samples came from
    pub sequence: u32,
    /// Scaling to convert raw values into physical values
    pub scaling: Scaling,
    pub samples: Vec<Sample>,
}

impl SampleBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Iterate raw values as `f64`.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.value.as_f64())
    }

    /// Iterate `(timestamp, physical value)` pairs with the channel scaling applied.
    pub fn scaled(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.samples.iter().map(|s| (s.timestamp, self.scaling.apply(s.value.as_f64())))
    }

    /// Timestamp of the first sample, if any.
    pub fn first_timestamp(&self) -> Option<f64> {
        self.samples.first().map(|s| s.timestamp)
    }

    /// Timestamp of the last sample, if any.
    pub fn last_timestamp(&self) -> Option<f64> {
        self.samples.last().map(|s| s.timestamp)
    }
}

/// Why contiguous data was interrupted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscontinuityReason {
    /// Stream was resynchronized after a framing, sequence or liveness failure
    Resync { cause: String },
    /// The consumer fell behind and the oldest events were dropped
    Dropped { count: u64 },
}

/// Marker preceding the first batch after a break in the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discontinuity {
    pub reason: DiscontinuityReason,
    /// Sequence of the first frame after the break, when known
    pub resumed_at: Option<u32>,
}

/// Item delivered to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    Batch(SampleBatch),
    Discontinuity(Discontinuity),
}

impl StreamEvent {
    pub fn as_batch(&self) -> Option<&SampleBatch> {
        match self {
            StreamEvent::Batch(batch) => Some(batch),
            StreamEvent::Discontinuity(_) => None,
        }
    }

    pub fn is_discontinuity(&self) -> bool {
        matches!(self, StreamEvent::Discontinuity(_))
    }
}
