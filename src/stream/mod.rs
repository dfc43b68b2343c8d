//! Delivery of sample events to consumers.
//!
//! [`SampleStream`] is the pull interface: a [`futures::Stream`] of [`StreamEvent`]s
//! that ends once the session is closed and every queued event has been yielded.
//! [`SampleSink`] and [`deliver_to_sink`] layer push callbacks on top of it.

mod sink;

pub use sink::{SampleSink, deliver_to_sink};

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tracing::debug;

use crate::types::{Discontinuity, DiscontinuityReason, StreamEvent};

/// Consumer side of the delivery queue, chosen by the drop policy.
pub(crate) enum EventReceiver {
    Queue(mpsc::Receiver<StreamEvent>),
    Broadcast(broadcast::Receiver<StreamEvent>),
}

pin_project! {
    #[project = SourceProj]
    enum Source {
        Queue { #[pin] inner: ReceiverStream<StreamEvent> },
        Broadcast { #[pin] inner: BroadcastStream<StreamEvent> },
    }
}

pin_project! {
    /// Pull-based stream of batches and discontinuity markers
    ///
    /// With the `drop_oldest` policy, events overwritten before they were read are
    /// reported as one [`DiscontinuityReason::Dropped`] marker per gap.
    pub struct SampleStream {
        #[pin]
        source: Source,
        dropped: u64,
    }
}

impl SampleStream {
    pub(crate) fn new(receiver: EventReceiver) -> Self {
        let source = match receiver {
            EventReceiver::Queue(rx) => Source::Queue { inner: ReceiverStream::new(rx) },
            EventReceiver::Broadcast(rx) => Source::Broadcast { inner: BroadcastStream::new(rx) },
        };
        Self { source, dropped: 0 }
    }

    /// Total events lost to queue overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Stream for SampleStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.source.project() {
            SourceProj::Queue { inner } => inner.poll_next(cx),
            SourceProj::Broadcast { inner } => match ready!(inner.poll_next(cx)) {
                Some(Ok(event)) => Poll::Ready(Some(event)),
                Some(Err(BroadcastStreamRecvError::Lagged(count))) => {
                    debug!(count, "Consumer lagged, events dropped");
                    *this.dropped += count;
                    Poll::Ready(Some(StreamEvent::Discontinuity(Discontinuity {
                        reason: DiscontinuityReason::Dropped { count },
                        resumed_at: None,
                    })))
                }
                None => Poll::Ready(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SampleBatch, Scaling};
    use futures::StreamExt;

    fn batch(sequence: u32) -> StreamEvent {
        StreamEvent::Batch(SampleBatch {
            channel: 0,
            name: "AI 1".to_string(),
            generation: 1,
            sequence,
            scaling: Scaling::default(),
            samples: Vec::new(),
        })
    }

    #[tokio::test]
    async fn queue_stream_drains_then_ends() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = SampleStream::new(EventReceiver::Queue(rx));
        tx.send(batch(1)).await.unwrap();
        tx.send(batch(2)).await.unwrap();
        drop(tx);

        let sequences: Vec<_> = stream
            .by_ref()
            .filter_map(|e| async move { e.as_batch().map(|b| b.sequence) })
            .collect()
            .await;
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(stream.dropped(), 0);
    }

    #[tokio::test]
    async fn broadcast_lag_becomes_dropped_marker() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = SampleStream::new(EventReceiver::Broadcast(rx));
        for sequence in 1..=5 {
            tx.send(batch(sequence)).unwrap();
        }
        drop(tx);

        let events: Vec<_> = stream.by_ref().collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            StreamEvent::Discontinuity(Discontinuity {
                reason: DiscontinuityReason::Dropped { count: 3 },
                resumed_at: None,
            })
        );
        assert_eq!(events[1].as_batch().map(|b| b.sequence), Some(4));
        assert_eq!(events[2].as_batch().map(|b| b.sequence), Some(5));
        assert_eq!(stream.dropped(), 3);
    }
}
