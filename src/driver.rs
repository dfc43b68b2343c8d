//! Driver spawns and runs the session reader task
//!
//! One task owns the transport, the decode buffer, the channel registry and the
//! demultiplexer. It is the only writer of the session state, which it publishes
//! through a watch channel, and the only producer on the delivery queue.
//!
//! ```text
//!                 start                 connected              acked
//! Disconnected ─────────▶ Connecting ─────────────▶ Negotiating ───────▶ Streaming
//!      ▲                      │                         │                 │   ▲
//!      │     retries spent    │       rejected/timeout  │     gap/invalid │   │ confirmed
//!      ├──────────────────────┘─────────────────────────┘      /timeout   ▼   │
//!      │                                                                Resyncing
//!      └────────────────────────── budget spent (StreamLost) ──────────────┘
//!
//!                        stop from any state ──▶ Closed
//! ```

use std::future::Future;
use std::sync::Arc;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{ControlRequest, DecodeOutcome, FrameCodec};
use crate::config::{DropPolicy, StreamConfig};
use crate::control::{ChannelSelection, ControlChannel, ControlCommand, ControlResponse};
use crate::demux::{DemuxOutput, StreamDemultiplexer};
use crate::error::FrameError;
use crate::registry::{ChannelRegistry, FrameLayout};
use crate::stream::EventReceiver;
use crate::transport::{Connector, Transport};
use crate::types::{
    DiscontinuityReason, Frame, FrameKind, STATUS_ERROR, STATUS_FIRST_PACKET, StreamEvent,
    sequence_after,
};
use crate::{Result, StreamError};

const READ_CHUNK: usize = 8 * 1024;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Negotiating,
    Streaming,
    Resyncing,
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

/// Copy of the session state published to observers.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub state: SessionState,
    /// Failure that caused this transition, if any
    pub error: Option<Arc<StreamError>>,
    /// Registry generation in effect
    pub generation: u64,
    /// Resync episodes entered since the session was created
    pub resyncs: u64,
}

impl StateSnapshot {
    fn initial() -> Self {
        Self { state: SessionState::Disconnected, error: None, generation: 0, resyncs: 0 }
    }
}

/// Requests from the session handle to the reader task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverCommand {
    Start,
}

/// Result of spawning the reader task
pub(crate) struct DriverChannels {
    /// Receiver for state snapshots
    pub state: watch::Receiver<StateSnapshot>,
    /// Sender for start requests
    pub commands: mpsc::Sender<DriverCommand>,
    /// Delivery queue consumer side
    pub events: EventReceiver,
    /// Cancellation token for stop
    pub cancel: CancellationToken,
}

/// Driver spawns the session reader task
pub(crate) struct Driver;

impl Driver {
    /// Spawn the reader task for a session.
    ///
    /// `config` must already be validated. Must be called from within a Tokio runtime.
    pub fn spawn<C, K>(
        connector: C,
        control: K,
        selection: ChannelSelection,
        config: StreamConfig,
    ) -> DriverChannels
    where
        C: Connector,
        K: ControlChannel,
    {
        let (state_tx, state_rx) = watch::channel(StateSnapshot::initial());
        let (command_tx, command_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = match config.drop_policy {
            DropPolicy::Block => {
                let (tx, rx) = mpsc::channel(config.queue_capacity);
                (EventSender::Queue(tx), EventReceiver::Queue(rx))
            }
            DropPolicy::DropOldest => {
                let (tx, rx) = broadcast::channel(config.queue_capacity);
                (EventSender::Broadcast(tx), EventReceiver::Broadcast(rx))
            }
        };
        let cancel = CancellationToken::new();

        let codec = FrameCodec::new(config.wire.clone(), config.resync_scan_window);
        let demux = StreamDemultiplexer::new(config.wire.clone());
        let task = SessionTask {
            connector,
            control,
            selection,
            config,
            codec,
            registry: ChannelRegistry::new(),
            demux,
            layout: None,
            state_tx,
            events: events_tx,
            cancel: cancel.clone(),
            frames: 0,
            resyncs: 0,
            probation: None,
        };

        tokio::spawn(task.run(command_rx));

        DriverChannels { state: state_rx, commands: command_tx, events: events_rx, cancel }
    }
}

enum EventSender {
    Queue(mpsc::Sender<StreamEvent>),
    Broadcast(broadcast::Sender<StreamEvent>),
}

/// Why a session run ended.
#[derive(Debug)]
enum Exit {
    /// Back to Disconnected, with the failure if there was one
    Disconnected(Option<StreamError>),
    Cancelled,
    ConsumerGone,
}

fn failed(error: StreamError) -> Exit {
    Exit::Disconnected(Some(error))
}

/// Race `future` against the stop token.
async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    future: F,
) -> std::result::Result<F::Output, Exit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Exit::Cancelled),
        output = future => Ok(output),
    }
}

enum Incoming {
    Frame(Frame),
    Invalid { error: FrameError, discarded: usize },
    /// No bytes for a keep-alive period
    Silent,
    /// Transport closed or failed
    Dropped(String),
}

/// Transport plus its decode buffer.
struct Link<T> {
    transport: T,
    buf: BytesMut,
}

impl<T: Transport> Link<T> {
    fn new(transport: T) -> Self {
        Self { transport, buf: BytesMut::with_capacity(READ_CHUNK) }
    }

    /// Read until the codec yields a frame or an invalid region.
    ///
    /// Cancel safe: partial input stays in the buffer.
    async fn next_incoming(&mut self, codec: &FrameCodec) -> Incoming {
        loop {
            let before = self.buf.len();
            match codec.decode_from(&mut self.buf) {
                DecodeOutcome::Frame(frame) => return Incoming::Frame(frame),
                DecodeOutcome::Invalid(error) => {
                    return Incoming::Invalid { error, discarded: before - self.buf.len() };
                }
                DecodeOutcome::NeedMoreBytes => {}
            }

            self.buf.reserve(READ_CHUNK);
            match self.transport.read_buf(&mut self.buf).await {
                Ok(0) => return Incoming::Dropped("transport closed by peer".to_string()),
                Ok(n) => trace!(bytes = n, buffered = self.buf.len(), "Read from transport"),
                Err(e) => return Incoming::Dropped(format!("transport read failed: {}", e)),
            }
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.transport.write_all(bytes).await?;
        self.transport.flush().await
    }
}

/// Wait for the frame acknowledging a start request.
async fn await_ack<T: Transport>(link: &mut Link<T>, codec: &FrameCodec) -> Result<Frame> {
    loop {
        match link.next_incoming(codec).await {
            Incoming::Frame(frame)
                if frame.kind == FrameKind::ControlAck
                    || frame.info.has_status(STATUS_FIRST_PACKET) =>
            {
                if frame.info.has_status(STATUS_ERROR) {
                    return Err(StreamError::negotiation_failed(
                        "instrument flagged an error in its acknowledgement",
                    ));
                }
                debug!(sequence = frame.sequence(), "Start acknowledged");
                return Ok(frame);
            }
            Incoming::Frame(frame) => {
                trace!(sequence = frame.sequence(), kind = ?frame.kind, "Frame before acknowledgement");
            }
            Incoming::Invalid { error, .. } => {
                debug!(%error, "Invalid frame before acknowledgement");
            }
            Incoming::Silent => {}
            Incoming::Dropped(reason) => {
                return Err(StreamError::negotiation_failed(format!(
                    "{} before acknowledgement",
                    reason
                )));
            }
        }
    }
}

/// Consume the fixed-size greeting an instrument sends after accepting a connection.
async fn read_welcome<T: Transport>(transport: &mut T, size: usize) -> Result<()> {
    let mut welcome = vec![0u8; size];
    transport.read_exact(&mut welcome).await.map_err(|e| {
        StreamError::connect_failed_with_source("welcome message not received", Box::new(e))
    })?;
    let product = String::from_utf8_lossy(&welcome);
    info!(product = %product.trim_end_matches('\0').trim(), "Instrument welcome received");
    Ok(())
}

/// Condition that sends a streaming session into resync.
///
/// Only the cause text survives; it is logged and becomes the `StreamLost` reason if
/// the episode runs out of attempts.
struct Trouble {
    cause: String,
    reconnect: bool,
}

impl Trouble {
    fn new(cause: impl Into<String>) -> Self {
        Self { cause: cause.into(), reconnect: false }
    }

    fn frame(error: FrameError) -> Self {
        Self::new(error.to_string())
    }

    fn dropped(cause: String) -> Self {
        Self { cause, reconnect: true }
    }
}

/// Bookkeeping for one resync episode.
struct ResyncEpisode {
    attempts: u32,
    discarded: usize,
    held: Vec<Frame>,
    last: Option<u32>,
    cause: String,
    reconnect: bool,
}

impl ResyncEpisode {
    /// Count a failed attempt and drop the unconfirmed run.
    fn fail(&mut self, cause: impl Into<String>) {
        self.attempts += 1;
        self.held.clear();
        self.last = None;
        self.cause = cause.into();
    }
}

/// Attempts spent by the last episode, kept until enough frames go through cleanly.
///
/// Trouble before that continues the count instead of starting from zero.
#[derive(Debug)]
struct Probation {
    attempts: u32,
    clean: u32,
}

enum Phase {
    Streaming { last: u32 },
    Resyncing(ResyncEpisode),
}

enum Step {
    Continue,
    Resync(Trouble),
    Ended,
}

struct SessionTask<C, K> {
    connector: C,
    control: K,
    selection: ChannelSelection,
    config: StreamConfig,
    codec: FrameCodec,
    registry: ChannelRegistry,
    demux: StreamDemultiplexer,
    layout: Option<Arc<FrameLayout>>,
    state_tx: watch::Sender<StateSnapshot>,
    events: EventSender,
    cancel: CancellationToken,
    frames: u64,
    resyncs: u64,
    probation: Option<Probation>,
}

impl<C, K> SessionTask<C, K>
where
    C: Connector,
    K: ControlChannel,
{
    async fn run(mut self, mut commands: mpsc::Receiver<DriverCommand>) {
        info!(peer = %self.connector.describe(), "Session task started");

        loop {
            let command = tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => command,
            };
            let Some(DriverCommand::Start) = command else {
                debug!("Session handle dropped, shutting down");
                break;
            };

            match self.run_session().await {
                Exit::Disconnected(error) => self.publish(SessionState::Disconnected, error),
                Exit::Cancelled => {
                    info!("Session stopped");
                    break;
                }
                Exit::ConsumerGone => {
                    debug!("Sample receiver dropped, shutting down");
                    break;
                }
            }
        }

        self.registry.thaw();
        self.layout = None;
        self.publish(SessionState::Closed, None);
        info!(frames = self.frames, "Session task ended");
    }

    /// One pass from Connecting until the session falls back to Disconnected or stops.
    ///
    /// The transport lives in this scope and is dropped on every exit path.
    async fn run_session(&mut self) -> Exit {
        self.publish(SessionState::Connecting, None);
        let transport = match self.connect().await {
            Ok(transport) => transport,
            Err(exit) => return exit,
        };
        let mut link = Link::new(transport);

        self.publish(SessionState::Negotiating, None);
        let ack = match self.negotiate(&mut link).await {
            Ok(ack) => ack,
            Err(exit) => return exit,
        };

        self.registry.freeze();
        self.publish(SessionState::Streaming, None);
        let exit = match self.stream(&mut link, ack).await {
            Ok(()) => Exit::Disconnected(None),
            Err(exit) => exit,
        };
        self.registry.thaw();

        if matches!(exit, Exit::Cancelled) {
            self.stop_stream(&mut link).await;
        }
        exit
    }

    async fn connect(&mut self) -> std::result::Result<C::Transport, Exit> {
        let retries = self.config.connect_retries;
        let mut last_error = None;

        for attempt in 1..=retries {
            if attempt > 1 {
                let delay = self.config.backoff(attempt - 1);
                debug!(attempt, ?delay, "Backing off before connecting");
                until_cancelled(&self.cancel, sleep(delay)).await?;
            }

            match self.connect_once().await? {
                Ok(transport) => {
                    info!(peer = %self.connector.describe(), attempt, "Connected");
                    return Ok(transport);
                }
                Err(e) => {
                    warn!(attempt, retries, error = %e, "Connection attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let reason = format!("{} unreachable after {} attempts", self.connector.describe(), retries);
        Err(failed(match last_error {
            Some(e) => StreamError::connect_failed_with_source(reason, Box::new(e)),
            None => StreamError::connect_failed(reason),
        }))
    }

    /// One connection attempt, including the welcome message, bounded by the connect
    /// timeout.
    async fn connect_once(&mut self) -> std::result::Result<Result<C::Transport>, Exit> {
        let limit = self.config.connect_timeout();
        let welcome_size = self.config.welcome_size;
        let connector = &self.connector;
        let attempt = async move {
            let mut transport = connector.connect().await?;
            if welcome_size > 0 {
                read_welcome(&mut transport, welcome_size).await?;
            }
            Ok::<_, StreamError>(transport)
        };
        match until_cancelled(&self.cancel, timeout(limit, attempt)).await? {
            Ok(result) => Ok(result),
            Err(_) => Ok(Err(StreamError::Timeout { duration: limit })),
        }
    }

    async fn negotiate(
        &mut self,
        link: &mut Link<C::Transport>,
    ) -> std::result::Result<Frame, Exit> {
        let cancel = self.cancel.clone();
        let limit = self.config.negotiation_timeout();
        match until_cancelled(&cancel, timeout(limit, self.negotiate_inner(link))).await? {
            Ok(result) => result.map_err(failed),
            Err(_) => Err(failed(StreamError::negotiation_failed(format!(
                "not completed within {:?}",
                limit
            )))),
        }
    }

    async fn negotiate_inner(&mut self, link: &mut Link<C::Transport>) -> Result<Frame> {
        let available = match self.control_request(ControlCommand::QueryChannels).await? {
            ControlResponse::Channels(channels) => channels,
            other => {
                return Err(StreamError::negotiation_failed(format!(
                    "unexpected reply to channel query: {:?}",
                    other
                )));
            }
        };
        debug!(available = available.len(), "Instrument reported channels");

        let selected = self.selection.apply(available).map_err(|name| {
            StreamError::negotiation_failed(format!("channel '{}' is not offered", name))
        })?;
        let names = selected.iter().map(|d| d.name.clone()).collect();
        self.expect_ok(ControlCommand::SelectChannels(names)).await?;

        let generation = self.registry.negotiate(selected)?;
        self.layout = Some(self.registry.layout_for(generation)?);
        self.demux.reset();
        self.state_tx.send_modify(|snapshot| snapshot.generation = generation);

        link.send(&self.codec.encode(ControlRequest::StartStream)).await.map_err(|e| {
            StreamError::negotiation_failed(format!("start request not written: {}", e))
        })?;
        self.expect_ok(ControlCommand::StartStream).await?;

        await_ack(link, &self.codec).await
    }

    async fn control_request(&mut self, command: ControlCommand) -> Result<ControlResponse> {
        debug!(?command, "Control request");
        let label = format!("{:?}", command);
        match self.control.request(command).await {
            Ok(ControlResponse::Rejected(reason)) => Err(StreamError::negotiation_failed(format!(
                "{} rejected: {}",
                label, reason
            ))),
            Ok(response) => Ok(response),
            Err(e) => Err(StreamError::negotiation_failed(format!("{} failed: {}", label, e))),
        }
    }

    async fn expect_ok(&mut self, command: ControlCommand) -> Result<()> {
        match self.control_request(command).await? {
            ControlResponse::Ok => Ok(()),
            other => {
                Err(StreamError::negotiation_failed(format!("unexpected control reply {:?}", other)))
            }
        }
    }

    /// Streaming and Resyncing. Returns `Ok` when the instrument ends the stream.
    async fn stream(
        &mut self,
        link: &mut Link<C::Transport>,
        ack: Frame,
    ) -> std::result::Result<(), Exit> {
        self.probation = None;
        let mut phase = Phase::Streaming { last: ack.sequence() };
        if ack.kind == FrameKind::Data {
            match self.handle_frame(ack, link).await? {
                Step::Continue => {}
                Step::Resync(trouble) => phase = Phase::Resyncing(self.enter_resync(trouble)?),
                Step::Ended => return Ok(()),
            }
        }

        loop {
            if let Phase::Resyncing(episode) = &mut phase {
                if episode.reconnect {
                    *link = self.reconnect(episode).await?;
                    episode.reconnect = false;
                }
            }

            let incoming = self.next_incoming(link).await?;
            let next = match phase {
                Phase::Streaming { last } => self.on_streaming(last, incoming, link).await?,
                Phase::Resyncing(episode) => self.on_resyncing(episode, incoming, link).await?,
            };
            match next {
                Some(next) => phase = next,
                None => return Ok(()),
            }
        }
    }

    async fn next_incoming(
        &mut self,
        link: &mut Link<C::Transport>,
    ) -> std::result::Result<Incoming, Exit> {
        let limit = self.config.keep_alive_timeout();
        match until_cancelled(&self.cancel, timeout(limit, link.next_incoming(&self.codec))).await? {
            Ok(incoming) => Ok(incoming),
            Err(_) => Ok(Incoming::Silent),
        }
    }

    async fn on_streaming(
        &mut self,
        last: u32,
        incoming: Incoming,
        link: &mut Link<C::Transport>,
    ) -> std::result::Result<Option<Phase>, Exit> {
        let trouble = match incoming {
            Incoming::Frame(frame) => {
                let expected = last.wrapping_add(1);
                if frame.sequence() != expected {
                    let trouble = Trouble::new(format!(
                        "sequence gap: expected {}, received {}",
                        expected,
                        frame.sequence()
                    ));
                    let episode = self.enter_resync(trouble)?;
                    return self.on_resyncing(episode, Incoming::Frame(frame), link).await;
                }
                match self.handle_frame(frame, link).await? {
                    Step::Continue => return Ok(Some(Phase::Streaming { last: expected })),
                    Step::Resync(trouble) => trouble,
                    Step::Ended => return Ok(None),
                }
            }
            Incoming::Invalid { error, discarded } => {
                let mut episode = self.enter_resync(Trouble::frame(error))?;
                episode.discarded += discarded;
                self.check_budget(&episode)?;
                return Ok(Some(Phase::Resyncing(episode)));
            }
            Incoming::Silent => {
                Trouble::new(format!("no frame within {:?}", self.config.keep_alive_timeout()))
            }
            Incoming::Dropped(reason) => Trouble::dropped(reason),
        };
        Ok(Some(Phase::Resyncing(self.enter_resync(trouble)?)))
    }

    async fn on_resyncing(
        &mut self,
        mut episode: ResyncEpisode,
        incoming: Incoming,
        link: &mut Link<C::Transport>,
    ) -> std::result::Result<Option<Phase>, Exit> {
        match incoming {
            Incoming::Frame(frame) => {
                let sequence = frame.sequence();
                let increasing = episode.last.is_none_or(|last| sequence_after(sequence, last));
                if !increasing {
                    debug!(sequence, last = ?episode.last, "Sequence not increasing during resync");
                    episode.fail(format!("sequence {} out of order during resync", sequence));
                    self.check_budget(&episode)?;
                }
                episode.last = Some(sequence);
                episode.held.push(frame);

                if episode.held.len() >= self.config.resync_confirm_frames as usize {
                    return self.release(episode, sequence, link).await;
                }
            }
            Incoming::Invalid { error, discarded } => {
                debug!(%error, discarded, "Invalid frame during resync");
                episode.discarded += discarded;
                if !episode.held.is_empty() {
                    episode.fail(error.to_string());
                }
                self.check_budget(&episode)?;
            }
            Incoming::Silent => {
                episode.fail("no frame during resync");
                self.check_budget(&episode)?;
            }
            Incoming::Dropped(reason) => {
                episode.fail(reason);
                episode.reconnect = true;
                self.check_budget(&episode)?;
            }
        }
        Ok(Some(Phase::Resyncing(episode)))
    }

    /// Deliver the confirmed frames and resume streaming after `last`.
    async fn release(
        &mut self,
        episode: ResyncEpisode,
        last: u32,
        link: &mut Link<C::Transport>,
    ) -> std::result::Result<Option<Phase>, Exit> {
        info!(
            sequence = last,
            held = episode.held.len(),
            attempts = episode.attempts,
            discarded = episode.discarded,
            "Stream resynchronized"
        );
        self.publish(SessionState::Streaming, None);
        self.probation = Some(Probation { attempts: episode.attempts, clean: 0 });

        for frame in episode.held {
            match self.handle_frame(frame, link).await? {
                Step::Continue => {}
                Step::Resync(trouble) => {
                    return Ok(Some(Phase::Resyncing(self.enter_resync(trouble)?)));
                }
                Step::Ended => return Ok(None),
            }
        }
        Ok(Some(Phase::Streaming { last }))
    }

    /// Start an episode. Trouble during probation counts as a failed attempt of the
    /// previous episode and may exhaust its budget right away.
    fn enter_resync(&mut self, trouble: Trouble) -> std::result::Result<ResyncEpisode, Exit> {
        self.resyncs += 1;
        let attempts = match self.probation.take() {
            Some(probation) => {
                debug!(
                    attempts = probation.attempts + 1,
                    clean = probation.clean,
                    "Sync lost again before it was confirmed"
                );
                probation.attempts + 1
            }
            None => 0,
        };
        warn!(
            cause = %trouble.cause,
            attempts,
            resyncs = self.resyncs,
            "Stream lost sync, resynchronizing"
        );
        self.demux.mark_discontinuity(DiscontinuityReason::Resync { cause: trouble.cause.clone() });
        self.publish(SessionState::Resyncing, None);
        let episode = ResyncEpisode {
            attempts,
            discarded: 0,
            held: Vec::new(),
            last: None,
            cause: trouble.cause,
            reconnect: trouble.reconnect,
        };
        self.check_budget(&episode)?;
        Ok(episode)
    }

    fn check_budget(&self, episode: &ResyncEpisode) -> std::result::Result<(), Exit> {
        if episode.attempts >= self.config.resync_max_attempts {
            return Err(failed(StreamError::stream_lost(episode.attempts, episode.cause.clone())));
        }
        if episode.discarded > self.config.resync_scan_limit {
            return Err(failed(StreamError::stream_lost(
                episode.attempts,
                format!("{} bytes discarded without finding sync", episode.discarded),
            )));
        }
        Ok(())
    }

    /// Re-establish the transport inside Resyncing, keeping the registry.
    async fn reconnect(
        &mut self,
        episode: &mut ResyncEpisode,
    ) -> std::result::Result<Link<C::Transport>, Exit> {
        loop {
            let delay = self.config.backoff(episode.attempts.max(1));
            debug!(attempt = episode.attempts, ?delay, "Reconnecting during resync");
            until_cancelled(&self.cancel, sleep(delay)).await?;

            let error = match self.connect_once().await? {
                Ok(transport) => {
                    let mut link = Link::new(transport);
                    match self.restart_stream(&mut link).await? {
                        Ok(ack) => {
                            info!(sequence = ack.sequence(), "Transport re-established");
                            self.demux.reset();
                            self.demux.mark_discontinuity(DiscontinuityReason::Resync {
                                cause: episode.cause.clone(),
                            });
                            episode.last = Some(ack.sequence());
                            if ack.kind == FrameKind::Data {
                                episode.held.push(ack);
                            }
                            return Ok(link);
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            warn!(attempt = episode.attempts, error = %error, "Reconnect failed");
            episode.fail(error.to_string());
            self.check_budget(episode)?;
        }
    }

    async fn restart_stream(
        &mut self,
        link: &mut Link<C::Transport>,
    ) -> std::result::Result<Result<Frame>, Exit> {
        let limit = self.config.negotiation_timeout();
        let request = self.codec.encode(ControlRequest::StartStream);
        let codec = &self.codec;
        let restart = async move {
            link.send(&request).await?;
            await_ack(link, codec).await
        };
        match until_cancelled(&self.cancel, timeout(limit, restart)).await? {
            Ok(result) => Ok(result),
            Err(_) => Ok(Err(StreamError::Timeout { duration: limit })),
        }
    }

    /// Best-effort stop on both channels; bounded by the connect timeout.
    async fn stop_stream(&mut self, link: &mut Link<C::Transport>) {
        let limit = self.config.connect_timeout();
        let request = self.codec.encode(ControlRequest::StopStream);
        if timeout(limit, link.send(&request)).await.is_err() {
            debug!("Stop request not written before timeout");
        }
        match timeout(limit, self.control.request(ControlCommand::StopStream)).await {
            Ok(Ok(_)) => debug!("Instrument stopped streaming"),
            Ok(Err(e)) => debug!(error = %e, "Stop command failed"),
            Err(_) => debug!("Stop command timed out"),
        }
    }

    /// Process one in-sequence frame and track probation.
    async fn handle_frame(
        &mut self,
        frame: Frame,
        link: &mut Link<C::Transport>,
    ) -> std::result::Result<Step, Exit> {
        let step = self.process_frame(frame, link).await?;
        if let (Step::Continue, Some(probation)) = (&step, self.probation.as_mut()) {
            probation.clean += 1;
            if probation.clean >= self.config.resync_confirm_frames {
                debug!(clean = probation.clean, "Sync confirmed by delivered frames");
                self.probation = None;
            }
        }
        Ok(step)
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        link: &mut Link<C::Transport>,
    ) -> std::result::Result<Step, Exit> {
        self.frames += 1;
        let sequence = frame.sequence();

        match frame.kind {
            FrameKind::KeepAlive => {
                trace!(sequence, "Keep-alive");
                let ack = self.codec.encode(ControlRequest::KeepAliveAck);
                match until_cancelled(&self.cancel, link.send(&ack)).await? {
                    Ok(()) => Ok(Step::Continue),
                    Err(e) => Ok(Step::Resync(Trouble::dropped(format!(
                        "keep-alive reply failed: {}",
                        e
                    )))),
                }
            }
            FrameKind::ControlAck => {
                debug!(sequence, "Repeated acknowledgement");
                Ok(Step::Continue)
            }
            FrameKind::EndOfStream => {
                info!(sequence, "Instrument ended the stream");
                Ok(Step::Ended)
            }
            FrameKind::Data => {
                let Some(layout) = self.layout.clone() else {
                    error!(sequence, "Data frame without a negotiated layout");
                    return Err(failed(StreamError::negotiation_failed("no layout negotiated")));
                };
                match self.demux.process(&frame, &layout) {
                    Ok(output) => self.deliver(output).await,
                    Err(e) => Ok(Step::Resync(Trouble::frame(e))),
                }
            }
        }
    }

    async fn deliver(&mut self, output: DemuxOutput) -> std::result::Result<Step, Exit> {
        let events = output
            .discontinuity
            .map(StreamEvent::Discontinuity)
            .into_iter()
            .chain(output.batches.into_iter().map(StreamEvent::Batch));

        for event in events {
            match &self.events {
                EventSender::Queue(tx) => {
                    let limit = self.config.delivery_timeout();
                    match until_cancelled(&self.cancel, timeout(limit, tx.send(event))).await? {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => return Err(Exit::ConsumerGone),
                        Err(_) => {
                            return Ok(Step::Resync(Trouble::new(format!(
                                "consumer did not accept samples within {:?}",
                                limit
                            ))));
                        }
                    }
                }
                EventSender::Broadcast(tx) => {
                    if tx.send(event).is_err() {
                        return Err(Exit::ConsumerGone);
                    }
                }
            }
        }
        Ok(Step::Continue)
    }

    fn publish(&self, state: SessionState, error: Option<StreamError>) {
        let generation = self.registry.generation();
        match &error {
            Some(e) => warn!(?state, generation, error = %e, "Session state changed"),
            None => info!(?state, generation, "Session state changed"),
        }
        self.state_tx.send_replace(StateSnapshot {
            state,
            error: error.map(Arc::new),
            generation,
            resyncs: self.resyncs,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireFormat;
    use crate::test_utils::{FrameBuilder, welcome_message};

    #[tokio::test]
    async fn welcome_is_consumed_up_to_the_first_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let ack = FrameBuilder::new(WireFormat::default()).ack(0);
        server.write_all(&welcome_message("Dewesoft OXYGEN 6.3")).await.unwrap();
        server.write_all(&ack).await.unwrap();

        read_welcome(&mut client, 64).await.unwrap();
        let mut rest = vec![0u8; ack.len()];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, ack.as_ref());
    }

    #[tokio::test]
    async fn short_welcome_is_a_connect_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        server.write_all(b"OXYGEN").await.unwrap();
        drop(server);

        let error = read_welcome(&mut client, 64).await.unwrap_err();
        assert!(matches!(error, StreamError::Connect { .. }));
        assert!(error.is_retryable());
    }
}
