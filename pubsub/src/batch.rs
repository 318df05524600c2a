use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::apiv1::PubsubMessage;
use crate::error::Error;
use crate::publisher::PublishResult;

pub(crate) type PublishCallback = Box<dyn FnOnce(PublishResult) + Send>;

/// Bytes added per message on top of its encoded size.
const MESSAGE_OVERHEAD: usize = 2;

pub(crate) struct BatchItem {
    pub message: PubsubMessage,
    pub size: usize,
    pub callback: Option<PublishCallback>,
}

impl BatchItem {
    pub fn new(message: PubsubMessage, callback: Option<PublishCallback>) -> Self {
        Self {
            size: message.encoded_len(),
            message,
            callback,
        }
    }
}

/// Outcome of [`Batch::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BatchAction {
    /// Added to the current batch.
    Added,
    /// The current batch is full; the item waits for the next one.
    Full,
    /// A publish is in flight; the item waits for the next one.
    Queued,
}

struct State {
    items: Vec<BatchItem>,
    total_bytes: usize,
    queue: VecDeque<BatchItem>,
    publishing: bool,
    stopping: bool,
    canceled: bool,
}

/// Pending messages of one ordering key.
///
/// At most one publish of a batch is in flight at a time. While it is, new
/// messages wait in the overflow queue and are moved into the next request by
/// [`Batch::rebalance`].
pub(crate) struct Batch {
    ordering_key: String,
    max_messages: usize,
    max_bytes: usize,
    base_bytes: usize,
    state: Mutex<State>,
}

impl Batch {
    pub fn new(topic: &str, ordering_key: String, max_messages: usize, max_bytes: usize) -> Self {
        let base_bytes = topic.len() + MESSAGE_OVERHEAD;
        Self {
            ordering_key,
            max_messages,
            max_bytes,
            base_bytes,
            state: Mutex::new(State {
                items: Vec::new(),
                total_bytes: base_bytes,
                queue: VecDeque::new(),
                publishing: false,
                stopping: false,
                canceled: false,
            }),
        }
    }

    pub fn ordering_key(&self) -> &str {
        &self.ordering_key
    }

    pub fn add(&self, item: BatchItem) -> Result<BatchAction, Error> {
        let mut state = self.state.lock();
        if state.stopping {
            return Err(Error::AsyncPublisherStopped);
        }
        if state.canceled {
            return Err(Error::OrderingKey(self.ordering_key.clone()));
        }
        if state.publishing {
            state.queue.push_back(item);
            return Ok(BatchAction::Queued);
        }
        match self.try_add(&mut state, item) {
            Ok(()) => Ok(BatchAction::Added),
            Err(item) => {
                state.queue.push_back(item);
                Ok(BatchAction::Full)
            }
        }
    }

    /// Marks the batch as in flight. Returns false if there is nothing to send
    /// or a publish is already running.
    pub fn publish(&self, stop: bool) -> bool {
        let mut state = self.state.lock();
        if stop {
            state.stopping = true;
        }
        if state.canceled || state.publishing || state.items.is_empty() {
            return false;
        }
        state.publishing = true;
        true
    }

    /// Tops the current batch up from the overflow queue and takes it for sending.
    pub fn rebalance(&self) -> Vec<BatchItem> {
        let mut state = self.state.lock();
        if state.canceled {
            return Vec::new();
        }
        self.refill(&mut state);
        state.total_bytes = self.base_bytes;
        std::mem::take(&mut state.items)
    }

    /// Called after a send completed. Returns true if another send should follow.
    pub fn reset(&self) -> bool {
        let mut state = self.state.lock();
        if state.canceled {
            state.items.clear();
            state.queue.clear();
            state.total_bytes = self.base_bytes;
            state.publishing = false;
            return false;
        }
        self.refill(&mut state);
        if !state.publishing {
            return false;
        }
        if state.items.is_empty() {
            state.publishing = false;
            return false;
        }
        // A stopping batch drains everything.
        if state.stopping {
            return true;
        }
        // A partial batch waits for the next flush.
        if state.queue.is_empty() {
            state.publishing = false;
            return false;
        }
        true
    }

    /// Rejects further messages and returns everything not yet sent.
    pub fn cancel(&self) -> Vec<BatchItem> {
        let mut state = self.state.lock();
        state.canceled = true;
        state.total_bytes = self.base_bytes;
        let mut unsent = std::mem::take(&mut state.items);
        unsent.extend(state.queue.drain(..));
        unsent
    }

    pub fn resume(&self) {
        self.state.lock().canceled = false;
    }

    pub fn is_canceled(&self) -> bool {
        self.state.lock().canceled
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.items.is_empty() && state.queue.is_empty()
    }

    fn refill(&self, state: &mut State) {
        while let Some(item) = state.queue.pop_front() {
            if let Err(item) = self.try_add(state, item) {
                state.queue.push_front(item);
                break;
            }
        }
    }

    fn try_add(&self, state: &mut State, item: BatchItem) -> Result<(), BatchItem> {
        let total_bytes = state.total_bytes + item.size + MESSAGE_OVERHEAD;
        // The first message is always accepted, even when oversized.
        if !state.items.is_empty() && (state.items.len() + 1 > self.max_messages || total_bytes > self.max_bytes) {
            return Err(item);
        }
        state.total_bytes = total_bytes;
        state.items.push(item);
        Ok(())
    }
}
