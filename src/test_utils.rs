//! Simulated instrument for tests and benchmarks
//!
//! - [`FrameBuilder`] produces wire frames the way an instrument would
//! - [`DuplexConnector`] hands out in-memory transports, greets the client with a
//!   welcome message and gives the test the instrument end of each one as an
//!   [`InstrumentPeer`]
//! - [`ScriptedControl`] answers control commands from a fixed channel list and
//!   records every command it receives

#![cfg(any(test, feature = "benchmark"))]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use crate::codec::{
    ControlRequest, DecodeOutcome, FrameCodec, PROTOCOL_VERSION, WELCOME_SIZE, WireFormat, subpacket,
};
use crate::control::{ControlChannel, ControlCommand, ControlResponse};
use crate::transport::Connector;
use crate::types::{
    ByteOrder, ChannelDescriptor, PacketInfo, STATUS_FIRST_PACKET, STATUS_LAST_PACKET,
    SampleType, SampleValue,
};
use crate::{Result, StreamError};

/// The two-channel setup used throughout the tests: int16 and float32 at 100 Hz.
pub fn two_channels() -> Vec<ChannelDescriptor> {
    vec![
        ChannelDescriptor::new("AI 1", SampleType::Int16, 100.0).with_unit("V"),
        ChannelDescriptor::new("AI 2", SampleType::Float32, 100.0).with_unit("m/s"),
    ]
}

/// Welcome message padded with NULs to the instrument's fixed size.
pub fn welcome_message(product: &str) -> Vec<u8> {
    let mut welcome = product.as_bytes().to_vec();
    welcome.resize(WELCOME_SIZE, 0);
    welcome
}

/// Append one sample in the given byte order.
pub fn put_sample(dst: &mut BytesMut, value: SampleValue, order: ByteOrder) {
    macro_rules! put {
        ($v:expr) => {
            match order {
                ByteOrder::Little => dst.put_slice(&$v.to_le_bytes()),
                ByteOrder::Big => dst.put_slice(&$v.to_be_bytes()),
            }
        };
    }
    let put_u24 = |dst: &mut BytesMut, v: u32| {
        let [b0, b1, b2, _] = v.to_le_bytes();
        match order {
            ByteOrder::Little => dst.put_slice(&[b0, b1, b2]),
            ByteOrder::Big => dst.put_slice(&[b2, b1, b0]),
        }
    };

    match value {
        SampleValue::Int8(v) => dst.put_i8(v),
        SampleValue::UInt8(v) => dst.put_u8(v),
        SampleValue::Int16(v) => put!(v),
        SampleValue::UInt16(v) => put!(v),
        SampleValue::Int24(v) => put_u24(dst, v as u32),
        SampleValue::UInt24(v) => put_u24(dst, v),
        SampleValue::Int32(v) => put!(v),
        SampleValue::UInt32(v) => put!(v),
        SampleValue::Int64(v) => put!(v),
        SampleValue::UInt64(v) => put!(v),
        SampleValue::Float32(v) => put!(v),
        SampleValue::Float64(v) => put!(v),
    }
}

/// Builds instrument-side frames.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    codec: FrameCodec,
    stream_id: u32,
}

impl FrameBuilder {
    pub fn new(format: WireFormat) -> Self {
        Self { codec: FrameCodec::new(format, 64 * 1024), stream_id: 1 }
    }

    pub fn format(&self) -> &WireFormat {
        self.codec.format()
    }

    /// A frame with explicit status and pre-encoded sub-packets.
    pub fn frame(&self, sequence: u32, status: u32, payload: &[u8]) -> Bytes {
        let info = PacketInfo {
            protocol_version: PROTOCOL_VERSION,
            stream_id: self.stream_id,
            sequence,
            status,
            seed: 0,
            subpacket_count: 1 + u32::from(!payload.is_empty()),
        };
        let mut out = BytesMut::new();
        self.codec.encode_frame(&info, payload, &mut out).expect("frame within size limit");
        out.freeze()
    }

    pub fn ack(&self, sequence: u32) -> Bytes {
        self.frame(sequence, STATUS_FIRST_PACKET, &[])
    }

    pub fn keep_alive(&self, sequence: u32) -> Bytes {
        self.frame(sequence, 0, &[])
    }

    pub fn end_of_stream(&self, sequence: u32) -> Bytes {
        self.frame(sequence, STATUS_LAST_PACKET, &[])
    }

    /// A data frame with one interleaved sub-packet; each row holds one value per slot
    /// in layout order.
    pub fn interleaved(&self, sequence: u32, rows: &[Vec<SampleValue>]) -> Bytes {
        let order = self.format().byte_order;
        let mut body = BytesMut::new();
        for value in rows.iter().flatten() {
            put_sample(&mut body, *value, order);
        }
        let mut payload = BytesMut::new();
        self.format().encode_subpacket(subpacket::INTERLEAVED, &body, &mut payload);
        self.frame(sequence, 0, &payload)
    }

    /// Data frame for [`two_channels`]: `rows` of `(int16, float32)` pairs.
    pub fn two_channel_data(&self, sequence: u32, rows: &[(i16, f32)]) -> Bytes {
        let rows: Vec<_> = rows
            .iter()
            .map(|(a, b)| vec![SampleValue::Int16(*a), SampleValue::Float32(*b)])
            .collect();
        self.interleaved(sequence, &rows)
    }

    /// Decode a control request written by the client.
    pub fn decode_request(&self, buf: &mut BytesMut) -> Option<ControlRequest> {
        loop {
            match self.codec.decode_from(buf) {
                DecodeOutcome::Frame(frame) => return self.codec.control_request(&frame),
                DecodeOutcome::Invalid(_) => continue,
                DecodeOutcome::NeedMoreBytes => return None,
            }
        }
    }
}

/// Instrument end of one in-memory connection.
pub struct InstrumentPeer {
    stream: DuplexStream,
    builder: FrameBuilder,
    buf: BytesMut,
}

impl InstrumentPeer {
    pub fn builder(&self) -> &FrameBuilder {
        &self.builder
    }

    /// Write raw bytes to the client. Errors once the client dropped the transport.
    pub async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await
    }

    /// Next control request from the client, or `None` once it disconnected.
    pub async fn next_request(&mut self) -> Option<ControlRequest> {
        loop {
            if let Some(request) = self.builder.decode_request(&mut self.buf) {
                return Some(request);
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Wait for a start request and acknowledge it with `ack_sequence`.
    pub async fn accept_start(&mut self, ack_sequence: u32) {
        loop {
            match self.next_request().await {
                Some(ControlRequest::StartStream) => break,
                Some(_) => continue,
                None => panic!("client disconnected before requesting start"),
            }
        }
        let ack = self.builder.ack(ack_sequence);
        self.send(&ack).await.expect("client reads acknowledgement");
    }

    /// Wait until the client drops its end, discarding anything it still writes.
    pub async fn wait_closed(&mut self) {
        loop {
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => self.buf.clear(),
            }
        }
    }
}

/// Connector producing in-memory transports.
///
/// The first `refusals` connection attempts fail. Accepted connections start with a
/// welcome message unless it was disabled.
pub struct DuplexConnector {
    peers: mpsc::UnboundedSender<InstrumentPeer>,
    format: WireFormat,
    refusals: AtomicU32,
    attempts: Arc<AtomicU32>,
    welcome: Vec<u8>,
}

impl DuplexConnector {
    /// Create a connector and the receiver of instrument peers.
    pub fn new(format: WireFormat) -> (Self, mpsc::UnboundedReceiver<InstrumentPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers,
            format,
            refusals: AtomicU32::new(0),
            attempts: Arc::new(AtomicU32::new(0)),
            welcome: welcome_message("OXYGEN DataStream simulator"),
        };
        (connector, rx)
    }

    /// Accept connections without writing a welcome message.
    pub fn without_welcome(mut self) -> Self {
        self.welcome.clear();
        self
    }

    pub fn refusing(self, refusals: u32) -> Self {
        self.refusals.store(refusals, Ordering::SeqCst);
        self
    }

    /// Counter of connection attempts, shared with the connector.
    pub fn attempts(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait::async_trait]
impl Connector for DuplexConnector {
    type Transport = DuplexStream;

    async fn connect(&self) -> Result<DuplexStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(StreamError::connect_failed("simulated refusal"));
        }

        let (client, mut server) = tokio::io::duplex(64 * 1024);
        server.write_all(&self.welcome).await.map_err(StreamError::Io)?;
        let peer = InstrumentPeer {
            stream: server,
            builder: FrameBuilder::new(self.format.clone()),
            buf: BytesMut::new(),
        };
        self.peers.send(peer).map_err(|_| StreamError::connect_failed("instrument gone"))?;
        Ok(client)
    }

    fn describe(&self) -> String {
        "duplex://instrument".to_string()
    }
}

/// Control channel answering from a fixed channel list.
#[derive(Clone)]
pub struct ScriptedControl {
    channels: Vec<ChannelDescriptor>,
    reject_start: Option<String>,
    log: Arc<Mutex<Vec<ControlCommand>>>,
}

impl ScriptedControl {
    pub fn new(channels: Vec<ChannelDescriptor>) -> Self {
        Self { channels, reject_start: None, log: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn rejecting_start(mut self, reason: impl Into<String>) -> Self {
        self.reject_start = Some(reason.into());
        self
    }

    /// Commands received so far.
    pub fn commands(&self) -> Vec<ControlCommand> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ControlChannel for ScriptedControl {
    async fn request(&mut self, command: ControlCommand) -> Result<ControlResponse> {
        if let Ok(mut log) = self.log.lock() {
            log.push(command.clone());
        }
        Ok(match command {
            ControlCommand::QueryChannels => ControlResponse::Channels(self.channels.clone()),
            ControlCommand::SelectChannels(names) => {
                match names.iter().find(|n| !self.channels.iter().any(|c| &c.name == *n)) {
                    Some(unknown) => ControlResponse::Rejected(format!("unknown channel {}", unknown)),
                    None => ControlResponse::Ok,
                }
            }
            ControlCommand::StartStream => match &self.reject_start {
                Some(reason) => ControlResponse::Rejected(reason.clone()),
                None => ControlResponse::Ok,
            },
            ControlCommand::StopStream => ControlResponse::Ok,
        })
    }
}
