//! Command/control channel seam.
//!
//! The instrument's command channel (SCPI over its own connection) is outside this
//! crate. A session only needs four request/response exchanges from it, expressed by
//! the [`ControlChannel`] trait.

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::types::ChannelDescriptor;

/// Request sent over the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// List the channels available for streaming
    QueryChannels,
    /// Select the channels to stream, in wire order
    SelectChannels(Vec<String>),
    StartStream,
    StopStream,
}

/// Reply from the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlResponse {
    Channels(Vec<ChannelDescriptor>),
    Ok,
    Rejected(String),
}

/// Request/response access to the instrument's command channel
///
/// Implementations own their transport and command syntax. Errors returned here are
/// reported as negotiation failures.
#[async_trait::async_trait]
pub trait ControlChannel: Send + 'static {
    /// Send one command and wait for its reply
    async fn request(&mut self, command: ControlCommand) -> Result<ControlResponse>;
}

#[async_trait::async_trait]
impl<C: ControlChannel + ?Sized> ControlChannel for Box<C> {
    async fn request(&mut self, command: ControlCommand) -> Result<ControlResponse> {
        (**self).request(command).await
    }
}

/// Which channels a session streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelSelection {
    /// Every channel the instrument reports
    #[default]
    All,
    /// Only the named channels, in this order
    Named(Vec<String>),
}

impl ChannelSelection {
    /// Pick descriptors from the instrument's list.
    ///
    /// Returns the selected descriptors in selection order, or the first unknown name.
    pub fn apply(
        &self,
        available: Vec<ChannelDescriptor>,
    ) -> std::result::Result<Vec<ChannelDescriptor>, String> {
        match self {
            ChannelSelection::All => Ok(available),
            ChannelSelection::Named(names) => names
                .iter()
                .map(|name| {
                    available.iter().find(|d| &d.name == name).cloned().ok_or_else(|| name.clone())
                })
                .collect(),
        }
    }
}

impl From<Vec<String>> for ChannelSelection {
    fn from(names: Vec<String>) -> Self {
        ChannelSelection::Named(names)
    }
}
