//! Session handle for one instrument
//!
//! [`StreamSession`] owns the reader task's control surface: start and stop requests,
//! the state watch channel, and the consumer end of the delivery queue.

use std::sync::Mutex;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::StreamConfig;
use crate::control::{ChannelSelection, ControlChannel};
use crate::driver::{Driver, DriverCommand, SessionState, StateSnapshot};
use crate::error::ConfigError;
use crate::stream::{EventReceiver, SampleSink, SampleStream, deliver_to_sink};
use crate::transport::Connector;
use crate::{Result, StreamError};


/// Handle to a DataStream session
///
/// Created in `Disconnected`. Dropping the handle stops the session.
pub struct StreamSession {
    state: watch::Receiver<StateSnapshot>,
    commands: mpsc::Sender<DriverCommand>,
    events: Mutex<Option<EventReceiver>>,
    cancel: CancellationToken,
}

impl StreamSession {
    /// Create a session streaming every channel the instrument offers.
    ///
    /// The configuration is validated before any task is spawned. Must be called from
    /// within a Tokio runtime.
    pub fn new<C, K>(
        connector: C,
        control: K,
        config: StreamConfig,
    ) -> std::result::Result<Self, ConfigError>
    where
        C: Connector,
        K: ControlChannel,
    {
        Self::with_selection(connector, control, ChannelSelection::All, config)
    }

    /// Create a session streaming only the selected channels.
    pub fn with_selection<C, K>(
        connector: C,
        control: K,
        selection: impl Into<ChannelSelection>,
        config: StreamConfig,
    ) -> std::result::Result<Self, ConfigError>
    where
        C: Connector,
        K: ControlChannel,
    {
        config.validate()?;
        info!(peer = %connector.describe(), policy = ?config.drop_policy, "Creating stream session");

        let channels = Driver::spawn(connector, control, selection.into(), config);
        Ok(Self {
            state: channels.state,
            commands: channels.commands,
            events: Mutex::new(Some(channels.events)),
            cancel: channels.cancel,
        })
    }

    /// Request Disconnected → Connecting.
    ///
    /// Has no effect while the session is already running. Fails once closed.
    pub fn start(&self) -> Result<()> {
        let snapshot = self.snapshot();
        match snapshot.state {
            SessionState::Closed => Err(StreamError::Closed),
            SessionState::Disconnected => match self.commands.try_send(DriverCommand::Start) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(StreamError::Closed),
            },
            state => {
                debug!(?state, "Start ignored, session already running");
                Ok(())
            }
        }
    }

    /// Stop the session and wait until it is Closed.
    ///
    /// The transport is released before Closed is published. Queued events remain
    /// readable from an already taken [`SampleStream`] until it ends.
    pub async fn stop(&self) {
        debug!("Stopping stream session");
        self.cancel.cancel();
        self.wait_for(SessionState::Closed).await;
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().state
    }

    /// Current state with its error and generation.
    pub fn snapshot(&self) -> StateSnapshot {
        self.state.borrow().clone()
    }

    /// State changes, starting with the current state.
    ///
    /// Intermediate states may be skipped by a slow observer; the latest state is
    /// always delivered.
    pub fn state_changes(&self) -> impl Stream<Item = StateSnapshot> + Unpin + 'static {
        WatchStream::new(self.state.clone())
    }

    /// Wait until the session reaches `state` or closes.
    ///
    /// Returns the snapshot that matched, or the closed snapshot.
    pub async fn wait_for(&self, state: SessionState) -> StateSnapshot {
        let mut changes = self.state_changes();
        let mut last = self.snapshot();
        while let Some(snapshot) = changes.next().await {
            let done = snapshot.state == state || snapshot.state.is_terminal();
            last = snapshot;
            if done {
                break;
            }
        }
        last
    }

    /// Take the sample stream.
    ///
    /// There is one consumer per session; later calls return `None`.
    pub fn samples(&self) -> Option<SampleStream> {
        let mut events = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        events.take().map(SampleStream::new)
    }

    /// Drive `sink` until the session closes.
    ///
    /// Run it next to whatever eventually calls [`StreamSession::stop`]. Fails with
    /// [`StreamError::Closed`] if the sample stream was already taken.
    pub async fn run_sink<S: SampleSink + ?Sized>(&self, sink: &mut S) -> Result<()> {
        let samples = self.samples().ok_or(StreamError::Closed)?;
        deliver_to_sink(samples, self.state_changes(), sink).await;
        Ok(())
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        debug!("Dropping stream session");
        self.cancel.cancel();
    }
}
