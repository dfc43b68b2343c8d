//! Push-style delivery

use futures::{Stream, StreamExt};
use tracing::debug;

use super::SampleStream;
use crate::StateSnapshot;
use crate::types::{Discontinuity, SampleBatch, StreamEvent};

/// Callbacks for push-style consumers.
///
/// Callbacks run on the task that drives [`deliver_to_sink`]; a slow callback
/// back-pressures the session exactly like a slow stream consumer.
pub trait SampleSink: Send {
    fn on_sample_batch(&mut self, batch: SampleBatch);

    fn on_discontinuity(&mut self, _marker: Discontinuity) {}

    fn on_state_change(&mut self, _snapshot: StateSnapshot) {}
}

/// Drive `sink` from a sample stream and a state stream until the session closes.
///
/// Returns once `samples` has ended and the final state has been reported.
pub async fn deliver_to_sink<S, St>(mut samples: SampleStream, mut states: St, sink: &mut S)
where
    S: SampleSink + ?Sized,
    St: Stream<Item = StateSnapshot> + Unpin,
{
    let mut states_open = true;
    loop {
        tokio::select! {
            event = samples.next() => match event {
                Some(StreamEvent::Batch(batch)) => sink.on_sample_batch(batch),
                Some(StreamEvent::Discontinuity(marker)) => sink.on_discontinuity(marker),
                None => break,
            },
            snapshot = states.next(), if states_open => match snapshot {
                Some(snapshot) => sink.on_state_change(snapshot),
                None => states_open = false,
            },
        }
    }

    while let Some(snapshot) = states.next().await {
        sink.on_state_change(snapshot);
    }
    debug!(dropped = samples.dropped(), "Sink delivery finished");
}
