//! Core types for DataStream data representation.
//!
//! - [`ChannelDescriptor`] describes one negotiated channel (type, rate, width, scaling)
//! - [`SampleType`] maps the instrument's data type codes to sizes and decoders
//! - [`Frame`] is one validated wire frame, [`PacketInfo`] its header sub-packet
//! - [`SampleBatch`] and [`Discontinuity`] are what consumers receive, wrapped in
//!   [`StreamEvent`]
//!
//! ```rust
//! use oxygen_stream::types::{ByteOrder, SampleType, SampleValue};
//!
//! let value = SampleType::Float32.decode(&4500.0f32.to_le_bytes(), ByteOrder::Little);
//! assert_eq!(value, Some(SampleValue::Float32(4500.0)));
//! ```

mod descriptor;
mod frame;
mod sample;
mod sample_type;

pub use descriptor::{ChannelDescriptor, Scaling};
pub use frame::{
    Frame, FrameKind, PacketInfo, STATUS_ERROR, STATUS_FIRST_PACKET, STATUS_LAST_PACKET,
    sequence_after,
};
pub use sample::{Discontinuity, DiscontinuityReason, Sample, SampleBatch, StreamEvent};
pub use sample_type::{ByteOrder, SampleType, SampleValue};
