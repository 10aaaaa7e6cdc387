//! Inbound message batching.
//!
//! Received messages are buffered and handed to subscribers as one batch
//! when the buffer reaches `batch_size`, or `interval` after the first
//! message of a batch arrived, whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peerlink_proto::message::Message;

struct BatchState {
    buffer: Vec<Message>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever a timer is started or cancelled. A timer only acts
    /// if the generation it was started with is still current.
    timer_generation: u64,
    subscribers: Vec<mpsc::UnboundedSender<Vec<Message>>>,
}

struct BatchInner {
    batch_size: usize,
    interval: Duration,
    state: Mutex<BatchState>,
}

impl BatchState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_generation += 1;
    }
}

impl BatchInner {
    /// Hand the buffered messages to every live subscriber.
    fn dispatch(state: &mut BatchState) {
        if state.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut state.buffer);
        tracing::trace!(size = batch.len(), "dispatching inbound batch");
        state
            .subscribers
            .retain(|tx| tx.send(batch.clone()).is_ok());
    }
}

/// Buffers inbound messages and dispatches them in batches.
#[derive(Clone)]
pub struct InboundBatcher {
    inner: Arc<BatchInner>,
}

impl InboundBatcher {
    /// Creates a batcher. A `batch_size` of zero is treated as one.
    #[must_use]
    pub fn new(batch_size: usize, interval: Duration) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                batch_size: batch_size.max(1),
                interval,
                state: Mutex::new(BatchState {
                    buffer: Vec::new(),
                    timer: None,
                    timer_generation: 0,
                    subscribers: Vec::new(),
                }),
            }),
        }
    }

    /// Register a consumer. Dropped receivers are pruned on the next
    /// dispatch.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<Message>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.state.lock().subscribers.push(tx);
        rx
    }

    /// Buffer one message. Must be called from within a tokio runtime.
    pub fn push(&self, message: Message) {
        let mut state = self.inner.state.lock();
        self.push_locked(&mut state, message);
    }

    fn push_locked(&self, state: &mut BatchState, message: Message) {
        state.buffer.push(message);

        if state.buffer.len() >= self.inner.batch_size {
            state.cancel_timer();
            BatchInner::dispatch(state);
            return;
        }

        if state.timer.is_none() {
            state.timer_generation += 1;
            let generation = state.timer_generation;
            let inner = Arc::clone(&self.inner);
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(inner.interval).await;
                let mut state = inner.state.lock();
                // Cancelled while waiting for the lock.
                if state.timer_generation != generation {
                    return;
                }
                state.timer = None;
                BatchInner::dispatch(&mut state);
            }));
        }
    }

    /// Dispatch whatever is buffered right now.
    pub fn flush(&self) {
        let mut state = self.inner.state.lock();
        state.cancel_timer();
        BatchInner::dispatch(&mut state);
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }
}
