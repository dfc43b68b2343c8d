//! Async client for the Oxygen DataStream (DST) protocol.
//!
//! A measurement instrument streams framed binary packets over TCP. This crate
//! connects, negotiates the channel list over the instrument's command channel,
//! validates and demultiplexes the frames into per-channel sample batches, and
//! recovers from corrupted or missing frames with explicit discontinuity markers.
//!
//! # Features
//!
//! - **Frame codec**: start/end tokens, length and checksum validation, bounded resync scan
//! - **Channel registry**: generation-stamped layouts, frozen while streaming
//! - **Demultiplexer**: interleaved, sync-fixed and async-fixed sample blocks, with
//!   channel scaling reported in-stream as XML
//! - **Session state machine**: Disconnected → Connecting → Negotiating → Streaming,
//!   with Resyncing and reconnects inside a bounded budget
//! - **Backpressure**: bounded delivery queue, blocking or drop-oldest
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use oxygen_stream::control::{ControlChannel, ControlCommand, ControlResponse};
//! use oxygen_stream::types::{ChannelDescriptor, SampleType};
//! use oxygen_stream::{Oxygen, StreamConfig, StreamEvent, WireFormat};
//!
//! struct Scpi;
//!
//! #[async_trait::async_trait]
//! impl ControlChannel for Scpi {
//!     async fn request(&mut self, command: ControlCommand) -> oxygen_stream::Result<ControlResponse> {
//!         Ok(match command {
//!             ControlCommand::QueryChannels => ControlResponse::Channels(vec![
//!                 ChannelDescriptor::new("AI 1", SampleType::Float32, 1000.0),
//!             ]),
//!             _ => ControlResponse::Ok,
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> oxygen_stream::Result<()> {
//!     // Real instruments send frames without a checksum
//!     let config = StreamConfig { wire: WireFormat::oxygen(), ..StreamConfig::default() };
//!     let session = Oxygen::connect_tcp("192.168.0.10:10003".parse().unwrap(), Scpi, config)?;
//!     let mut samples = session.samples().expect("first consumer");
//!     session.start()?;
//!
//!     while let Some(event) = samples.next().await {
//!         match event {
//!             StreamEvent::Batch(batch) => println!("{}: {} samples", batch.name, batch.len()),
//!             StreamEvent::Discontinuity(marker) => println!("gap: {:?}", marker.reason),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Protocol
pub mod codec;
pub mod demux;
pub mod registry;

// Session
pub mod config;
pub mod connection;
pub mod control;
mod driver;
pub mod stream;
pub mod transport;

// Core exports
pub use error::*;
pub use types::{Discontinuity, DiscontinuityReason, SampleBatch, StreamEvent};

pub use codec::{FrameCodec, WireFormat};
pub use config::{DropPolicy, StreamConfig};
pub use connection::StreamSession;
pub use control::{ChannelSelection, ControlChannel};
pub use driver::{SessionState, StateSnapshot};
pub use registry::ChannelRegistry;
pub use stream::{SampleSink, SampleStream};
pub use transport::{Connector, TcpConnector};

/// Entry point for DataStream sessions over TCP.
///
/// # Example
///
/// ```rust,no_run
/// use oxygen_stream::{Oxygen, StreamConfig};
/// # use oxygen_stream::control::{ControlChannel, ControlCommand, ControlResponse};
/// # struct Scpi;
/// # #[async_trait::async_trait]
/// # impl ControlChannel for Scpi {
/// #     async fn request(&mut self, _: ControlCommand) -> oxygen_stream::Result<ControlResponse> {
/// #         Ok(ControlResponse::Ok)
/// #     }
/// # }
///
/// # #[tokio::main]
/// # async fn main() -> oxygen_stream::Result<()> {
/// let config = StreamConfig::from_path("stream.yaml")?;
/// let session = Oxygen::connect_tcp("10.0.0.5:10003".parse().unwrap(), Scpi, config)?;
/// session.start()?;
/// # Ok(())
/// # }
/// ```
pub struct Oxygen;

impl Oxygen {
    /// Create a session for the instrument at `addr`, streaming every channel.
    ///
    /// The session starts in Disconnected; call [`StreamSession::start`] to connect.
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] if `config` fails validation.
    pub fn connect_tcp<K: ControlChannel>(
        addr: std::net::SocketAddr,
        control: K,
        config: StreamConfig,
    ) -> Result<StreamSession> {
        Ok(StreamSession::new(TcpConnector::new(addr), control, config)?)
    }

    /// Like [`Oxygen::connect_tcp`], streaming only the named channels in the given order.
    pub fn connect_tcp_with_selection<K: ControlChannel>(
        addr: std::net::SocketAddr,
        control: K,
        channels: Vec<String>,
        config: StreamConfig,
    ) -> Result<StreamSession> {
        Ok(StreamSession::with_selection(TcpConnector::new(addr), control, channels, config)?)
    }
}
