use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::error::Error;
use crate::subscriber::ReceivedMessage;

/// Serializes callbacks per ordering key.
///
/// The head of each queue is the message whose callback is running. Messages
/// without an ordering key bypass the sequencer.
#[derive(Default)]
pub(crate) struct Sequencer {
    queues: Mutex<HashMap<String, VecDeque<ReceivedMessage>>>,
}

impl Sequencer {
    /// Queues `message` and returns it if it can be dispatched now.
    pub fn add(&self, message: ReceivedMessage) -> Option<ReceivedMessage> {
        if message.ordering_key().is_empty() {
            return Some(message);
        }
        let mut queues = self.queues.lock();
        let queue = queues.entry(message.ordering_key().to_string()).or_default();
        queue.push_back(message.clone());
        if queue.len() == 1 {
            Some(message)
        } else {
            None
        }
    }

    /// Called when the callback for `ack_id` finished. Returns the next message
    /// of the key to dispatch.
    ///
    /// Fails when `ack_id` is not the head of its queue, which means the message
    /// was delivered out of order. The head stays in place since its callback
    /// is still running.
    pub fn next(&self, ordering_key: &str, ack_id: &str) -> Result<Option<ReceivedMessage>, Error> {
        if ordering_key.is_empty() {
            return Ok(None);
        }
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(ordering_key) else {
            return Err(out_of_order(ordering_key, ack_id));
        };
        match queue.front() {
            Some(head) if head.ack_id() == ack_id => {
                queue.pop_front();
            }
            _ => {
                queue.retain(|m| m.ack_id() != ack_id);
                return Err(out_of_order(ordering_key, ack_id));
            }
        }
        match queue.front() {
            Some(next) => Ok(Some(next.clone())),
            None => {
                queues.remove(ordering_key);
                Ok(None)
            }
        }
    }

    /// Removes every message that has not been dispatched yet. Heads stay
    /// until their callbacks finish.
    pub fn drain_pending(&self) -> Vec<ReceivedMessage> {
        let mut queues = self.queues.lock();
        let mut pending = Vec::new();
        for queue in queues.values_mut() {
            if queue.len() > 1 {
                pending.extend(queue.drain(1..));
            }
        }
        pending
    }
}

fn out_of_order(ordering_key: &str, ack_id: &str) -> Error {
    Error::OrderedMessageDelivery {
        ordering_key: ordering_key.to_string(),
        ack_id: ack_id.to_string(),
    }
}
