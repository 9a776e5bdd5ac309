//! Token relay — decouples backend fragment production from client
//! delivery.
//!
//! Producers push text fragments into a bounded queue; a single drain
//! loop batches them into `text-delta` events, with an optional pause
//! between writes to smooth perceived typing speed. Batching never
//! changes the logical content or order of the output: every fragment
//! is flushed exactly once, in production order, unless the turn is
//! aborted — then the remaining buffer is discarded.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use verdant_domain::config::StreamTuning;
use verdant_domain::event::ChatEvent;

use super::cancel::CancelToken;

/// Queue depth between the orchestrator and the drain loop.
const RELAY_BUFFER: usize = 256;

/// Producer handle for a running drain loop.
pub struct RelayHandle {
    tx: Option<mpsc::Sender<String>>,
    task: JoinHandle<usize>,
}

impl RelayHandle {
    /// Enqueue one fragment. Returns false once the drain loop has
    /// stopped (client gone or turn aborted).
    pub async fn push(&self, fragment: String) -> bool {
        match &self.tx {
            Some(tx) => tx.send(fragment).await.is_ok(),
            None => false,
        }
    }

    /// Close the producer side and wait for the drain loop to flush
    /// everything still queued. Returns the number of fragments flushed.
    pub async fn finish(mut self) -> usize {
        self.tx.take();
        self.task.await.unwrap_or(0)
    }
}

/// Spawn a drain loop writing `text-delta` events for `part_id` into
/// `out`.
pub fn spawn(
    part_id: String,
    tuning: StreamTuning,
    out: mpsc::Sender<ChatEvent>,
    cancel: CancelToken,
) -> RelayHandle {
    let tuning = tuning.clamped();
    let (tx, mut rx) = mpsc::channel::<String>(RELAY_BUFFER);

    let task = tokio::spawn(async move {
        let mut flushed = 0usize;
        while let Some(first) = rx.recv().await {
            if cancel.is_cancelled() {
                // Aborted: discard without flushing.
                rx.close();
                while rx.try_recv().is_ok() {}
                break;
            }

            // Coalesce whatever is already queued, up to the batch size.
            let mut delta = first;
            let mut batched = 1usize;
            while batched < tuning.delta_batch_size {
                match rx.try_recv() {
                    Ok(fragment) => {
                        delta.push_str(&fragment);
                        batched += 1;
                    }
                    Err(_) => break,
                }
            }

            let event = ChatEvent::TextDelta {
                id: part_id.clone(),
                delta,
            };
            if out.send(event).await.is_err() {
                break;
            }
            flushed += batched;

            if tuning.delta_delay_ms > 0 {
                paced_wait(Duration::from_millis(tuning.delta_delay_ms), &cancel).await;
            }
        }
        flushed
    });

    RelayHandle {
        tx: Some(tx),
        task,
    }
}

/// Pause between writes, waking early when the turn is aborted.
async fn paced_wait(total: Duration, cancel: &CancelToken) {
    let slice = Duration::from_millis(25);
    let mut waited = Duration::ZERO;
    while waited < total {
        if cancel.is_cancelled() {
            return;
        }
        let step = slice.min(total - waited);
        tokio::time::sleep(step).await;
        waited += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning(batch: usize, delay_ms: u64) -> StreamTuning {
        StreamTuning {
            delta_batch_size: batch,
            delta_delay_ms: delay_ms,
        }
    }

    async fn collect_deltas(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<String> {
        let mut deltas = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ChatEvent::TextDelta { delta, .. } => deltas.push(delta),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        deltas
    }

    #[tokio::test]
    async fn flushes_every_fragment_in_order() {
        let (out, rx) = mpsc::channel(64);
        let relay = spawn("part_1".into(), tuning(2, 0), out, CancelToken::new());

        for fragment in ["Hi", " there", ", how", " are you?"] {
            assert!(relay.push(fragment.into()).await);
        }
        let flushed = relay.finish().await;

        assert_eq!(flushed, 4);
        let deltas = collect_deltas(rx).await;
        assert_eq!(deltas.concat(), "Hi there, how are you?");
    }

    #[tokio::test]
    async fn batching_concatenates_queued_fragments() {
        let (out, rx) = mpsc::channel(64);
        let relay = spawn("part_1".into(), tuning(8, 0), out, CancelToken::new());

        // Push everything before the drain loop gets a chance to run,
        // then close: the whole backlog fits one batch.
        for fragment in ["a", "b", "c"] {
            relay.push(fragment.into()).await;
        }
        let flushed = relay.finish().await;

        assert_eq!(flushed, 3);
        let deltas = collect_deltas(rx).await;
        assert_eq!(deltas.concat(), "abc");
    }

    #[tokio::test]
    async fn aborted_buffer_is_discarded() {
        let (out, rx) = mpsc::channel(64);
        let cancel = CancelToken::new();
        cancel.cancel();
        let relay = spawn("part_1".into(), tuning(4, 0), out, cancel);

        relay.push("never".into()).await;
        relay.push("delivered".into()).await;
        let flushed = relay.finish().await;

        assert_eq!(flushed, 0);
        assert!(collect_deltas(rx).await.is_empty());
    }

    #[tokio::test]
    async fn abort_cuts_the_pacing_wait_short() {
        let (out, mut rx) = mpsc::channel(64);
        let cancel = CancelToken::new();
        let relay = spawn("part_1".into(), tuning(1, 250), out, cancel.clone());

        relay.push("a".into()).await;
        // Once the first delta arrives the drain loop is in its pacing
        // wait for the full 250ms.
        assert!(rx.recv().await.is_some());

        let started = std::time::Instant::now();
        cancel.cancel();
        relay.push("b".into()).await;
        let flushed = relay.finish().await;

        assert_eq!(flushed, 1, "the fragment pushed after the abort is discarded");
        assert!(
            started.elapsed() < Duration::from_millis(150),
            "abort ends the pacing wait well before the configured delay"
        );
    }

    #[tokio::test]
    async fn stops_when_consumer_is_gone() {
        let (out, rx) = mpsc::channel(1);
        drop(rx);
        let relay = spawn("part_1".into(), tuning(1, 0), out, CancelToken::new());

        relay.push("a".into()).await;
        let flushed = relay.finish().await;
        assert_eq!(flushed, 0);
    }

    #[tokio::test]
    async fn finish_drains_before_returning() {
        let (out, mut rx) = mpsc::channel(64);
        let relay = spawn("part_1".into(), tuning(1, 0), out, CancelToken::new());

        for i in 0..20 {
            relay.push(format!("{i} ")).await;
        }
        let flushed = relay.finish().await;
        assert_eq!(flushed, 20);

        // Everything is already sitting in the channel.
        let mut total = String::new();
        while let Ok(event) = rx.try_recv() {
            if let ChatEvent::TextDelta { delta, .. } = event {
                total.push_str(&delta);
            }
        }
        assert_eq!(total, (0..20).map(|i| format!("{i} ")).collect::<String>());
    }
}
