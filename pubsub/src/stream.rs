use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use pubsub_gax::grpc::{Code, Status};
use pubsub_gax::retry::ExponentialBackoff;
use tokio::select;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::apiv1::subscriber_client::{create_empty_streaming_pull_request, StreamingPullResponses};
use crate::apiv1::{StreamingPullRequest, StreamingPullResponse};
use crate::error::Error;
use crate::inventory::Inventory;
use crate::listener::ListenerContext;
use crate::sequencer::Sequencer;
use crate::subscriber::{AcknowledgeResult, ReceivedMessage};

/// An empty request is sent this often to keep the stream open while messages are leased.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

const EXACTLY_ONCE_MIN_LEASE_EXTENSION: Duration = Duration::from_secs(60);

/// Stream errors that are expected from time to time. Others are reported to the error handlers.
const RESTART_CODES: [Code; 5] = [
    Code::DeadlineExceeded,
    Code::Unavailable,
    Code::Cancelled,
    Code::ResourceExhausted,
    Code::Internal,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct State {
    state: StreamState,
    paused: bool,
    requests: Option<async_channel::Sender<StreamingPullRequest>>,
}

/// One streaming pull with its own share of the inventory.
///
/// The read loop reconnects whenever the server closes the stream. It pauses
/// while the inventory is full and resumes below 80% of the limits.
pub(crate) struct StreamInner {
    index: usize,
    ctx: Arc<ListenerContext>,
    inventory: Inventory,
    sequencer: Option<Sequencer>,
    state: Mutex<State>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    callbacks: TaskTracker,
    span: tracing::Span,
}

impl StreamInner {
    pub fn new(index: usize, ctx: Arc<ListenerContext>, span: &tracing::Span) -> Self {
        let min_extension = if ctx.buffer.exactly_once_delivery_enabled() {
            EXACTLY_ONCE_MIN_LEASE_EXTENSION
        } else {
            ctx.min_duration_per_lease_extension
        };
        Self {
            index,
            inventory: Inventory::new(ctx.limits.clone(), min_extension),
            sequencer: if ctx.message_ordering {
                Some(Sequencer::default())
            } else {
                None
            },
            state: Mutex::new(State {
                state: StreamState::Idle,
                paused: false,
                requests: None,
            }),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            callbacks: TaskTracker::new(),
            span: tracing::debug_span!(parent: span, "stream", index),
            ctx,
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.state != StreamState::Idle {
                return;
            }
            state.state = StreamState::Running;
        }
        let tasks = vec![
            tokio::spawn(self.clone().run().instrument(self.span.clone())),
            tokio::spawn(self.clone().run_lease().instrument(self.span.clone())),
            tokio::spawn(self.clone().run_keepalive().instrument(self.span.clone())),
        ];
        *self.tasks.lock() = tasks;
        tracing::trace!(parent: &self.span, "stream started");
    }

    /// Closes the stream. Messages waiting behind their ordering key are nacked.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.state != StreamState::Running {
                return;
            }
            state.state = StreamState::Stopping;
            state.requests = None;
        }
        self.cancel.cancel();
        if let Some(sequencer) = &self.sequencer {
            for message in sequencer.drain_pending() {
                self.modify_ack_deadline(message.ack_id(), 0, None);
            }
        }
        tracing::trace!(parent: &self.span, "stream stopping");
    }

    /// Waits for the background tasks and every dispatched callback.
    pub async fn wait(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.callbacks.close();
        self.callbacks.wait().await;
        self.state.lock().state = StreamState::Stopped;
        tracing::trace!(parent: &self.span, "stream stopped");
    }

    pub(crate) fn acknowledge(&self, ack_id: &str, result: Option<oneshot::Sender<AcknowledgeResult>>) {
        self.ctx.buffer.acknowledge(ack_id, result);
        self.inventory.remove(ack_id);
    }

    pub(crate) fn modify_ack_deadline(
        &self,
        ack_id: &str,
        seconds: i32,
        result: Option<oneshot::Sender<AcknowledgeResult>>,
    ) {
        self.ctx.buffer.modify_ack_deadline(seconds, ack_id, result);
        self.inventory.remove(ack_id);
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = reconnect_backoff();
        while !self.cancel.is_cancelled() {
            let (sender, receiver) = async_channel::unbounded();
            self.state.lock().requests = Some(sender);

            let mut received = false;
            let result = select! {
                _ = self.cancel.cancelled() => break,
                response = self.ctx.subc.streaming_pull(self.initial_request(), receiver) => match response {
                    Ok(mut stream) => self.read(&mut stream, &mut received).await,
                    Err(status) => Err(status),
                }
            };
            self.state.lock().requests = None;
            if self.cancel.is_cancelled() {
                break;
            }
            if received {
                backoff = reconnect_backoff();
            }
            match result {
                Ok(()) => tracing::debug!("stream closed by the server"),
                Err(status) if RESTART_CODES.contains(&status.code()) => {
                    tracing::debug!("stream interrupted: {}", status)
                }
                Err(status) => {
                    tracing::warn!("stream failed: {}", status);
                    self.ctx.errors.report(&Error::GRPC(status));
                }
            }

            let delay = backoff.next().unwrap_or(Duration::from_secs(10));
            tracing::trace!("reconnecting after {:?}", delay);
            select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::trace!("stop message receiver : {}", self.index);
    }

    async fn read(self: &Arc<Self>, stream: &mut StreamingPullResponses, received: &mut bool) -> Result<(), Status> {
        loop {
            if !self.wait_unpaused().await {
                return Ok(());
            }
            let response = select! {
                _ = self.cancel.cancelled() => return Ok(()),
                response = stream.next() => response,
            };
            match response {
                None => return Ok(()),
                Some(Err(status)) => return Err(status),
                Some(Ok(response)) => {
                    *received = true;
                    self.handle_response(response);
                }
            }
        }
    }

    /// Returns false when the stream was stopped while paused.
    async fn wait_unpaused(&self) -> bool {
        loop {
            {
                let mut state = self.state.lock();
                if !state.paused {
                    return true;
                }
                if self.inventory.below_resume_threshold() {
                    tracing::debug!("resume stream");
                    state.paused = false;
                    return true;
                }
            }
            select! {
                _ = self.cancel.cancelled() => return false,
                _ = self.inventory.changed() => {}
            }
        }
    }

    fn initial_request(&self) -> StreamingPullRequest {
        let ack_ids = self.inventory.ack_ids();
        let limits = self.inventory.limits();
        let (max_outstanding_messages, max_outstanding_bytes) = if limits.use_legacy_flow_control {
            (0, 0)
        } else {
            (limits.limit as i64, limits.bytesize as i64)
        };
        StreamingPullRequest {
            subscription: self.ctx.subscription.clone(),
            modify_deadline_seconds: vec![self.ctx.deadline; ack_ids.len()],
            modify_deadline_ack_ids: ack_ids,
            stream_ack_deadline_seconds: self.ctx.deadline,
            client_id: self.ctx.client_id.clone(),
            max_outstanding_messages,
            max_outstanding_bytes,
            ..create_empty_streaming_pull_request()
        }
    }

    fn handle_response(self: &Arc<Self>, response: StreamingPullResponse) {
        if let Some(properties) = &response.subscription_properties {
            self.update_exactly_once_delivery(properties.exactly_once_delivery_enabled);
        }
        if response.received_messages.is_empty() {
            return;
        }
        let messages: Vec<ReceivedMessage> = response
            .received_messages
            .into_iter()
            .map(|m| ReceivedMessage::new(m, Arc::downgrade(self)))
            .collect();
        tracing::trace!("received {} messages", messages.len());

        let deadline = self.ctx.deadline;
        if self.ctx.buffer.exactly_once_delivery_enabled() {
            // The callback runs only once the server confirmed the receipt.
            for message in messages {
                self.inventory.add(message.ack_id(), message.size());
                let (sender, receiver) = oneshot::channel();
                self.ctx.buffer.modify_ack_deadline(deadline, message.ack_id(), Some(sender));
                let stream = self.clone();
                self.callbacks.spawn(
                    async move {
                        let receipt = select! {
                            _ = stream.cancel.cancelled() => None,
                            result = receiver => result.ok(),
                        };
                        match receipt {
                            Some(result) if result.succeeded() => stream.register_callback(message),
                            Some(result) => {
                                tracing::debug!(ack_id = message.ack_id(), "receipt failed: {:?}", result.error());
                                stream.inventory.remove(message.ack_id());
                            }
                            None => stream.modify_ack_deadline(message.ack_id(), 0, None),
                        }
                    }
                    .instrument(self.span.clone()),
                );
            }
            self.ctx.buffer.flush_now();
        } else {
            let ack_ids: Vec<String> = messages.iter().map(|m| m.ack_id().to_string()).collect();
            self.ctx.buffer.renew_lease(deadline, &ack_ids);
            for message in messages {
                self.inventory.add(message.ack_id(), message.size());
                self.register_callback(message);
            }
        }

        if self.inventory.is_full() {
            let mut state = self.state.lock();
            if !state.paused {
                tracing::debug!(
                    count = self.inventory.count(),
                    bytes = self.inventory.total_bytes(),
                    "inventory full, pause stream"
                );
                state.paused = true;
            }
        }
    }

    fn update_exactly_once_delivery(&self, enabled: bool) {
        self.ctx.buffer.set_exactly_once_delivery(enabled);
        let min = if enabled {
            EXACTLY_ONCE_MIN_LEASE_EXTENSION
        } else {
            self.ctx.min_duration_per_lease_extension
        };
        self.inventory.set_min_duration_per_lease_extension(min);
    }

    fn register_callback(self: &Arc<Self>, message: ReceivedMessage) {
        let message = match &self.sequencer {
            Some(sequencer) => match sequencer.add(message) {
                Some(message) => message,
                None => return,
            },
            None => message,
        };
        self.dispatch(message);
    }

    fn dispatch(self: &Arc<Self>, message: ReceivedMessage) {
        let ack_id = message.ack_id().to_string();
        let stream = self.clone();
        let job = self.callbacks.track_future(stream.perform_callback(message));
        if !self.ctx.callback_pool.spawn(job) {
            tracing::warn!(ack_id, "callback pool stopped, nack message");
            self.modify_ack_deadline(&ack_id, 0, None);
        }
    }

    async fn perform_callback(self: Arc<Self>, message: ReceivedMessage) {
        let ack_id = message.ack_id().to_string();
        let ordering_key = message.ordering_key().to_string();
        let message_id = message.message.message_id.clone();
        let handler = self.ctx.handler.clone();
        let cancel = self.cancel.clone();
        let callback = async move { handler(message, cancel).await };
        if AssertUnwindSafe(callback).catch_unwind().await.is_err() {
            self.ctx.errors.report(&Error::HandlerPanicked(message_id));
            self.inventory.remove(&ack_id);
        }

        if let Some(sequencer) = &self.sequencer {
            match sequencer.next(&ordering_key, &ack_id) {
                Ok(Some(next)) => self.dispatch(next),
                Ok(None) => {}
                Err(e) => self.ctx.errors.report(&e),
            }
        }
    }

    /// Extends the deadline of every leased message until it exceeds the total lease duration.
    async fn run_lease(self: Arc<Self>) {
        loop {
            let delay = self.inventory.lease_delay(self.ctx.deadline);
            select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            let expired = self.inventory.remove_expired();
            if !expired.is_empty() {
                tracing::warn!(
                    "{} messages exceeded max_total_lease_duration and will be redelivered",
                    expired.len()
                );
            }
            let ack_ids = self.inventory.ack_ids();
            if ack_ids.is_empty() {
                continue;
            }
            let min = self.inventory.min_duration_per_lease_extension().as_secs() as i32;
            let deadline = self.ctx.deadline.max(min);
            tracing::trace!("extend lease of {} messages", ack_ids.len());
            self.ctx.buffer.renew_lease(deadline, &ack_ids);
            self.ctx.buffer.flush_now();
        }
    }

    async fn run_keepalive(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.tick().await;
        loop {
            select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.inventory.is_empty() {
                continue;
            }
            let requests = self.state.lock().requests.clone();
            if let Some(requests) = requests {
                let _ = requests.try_send(create_empty_streaming_pull_request());
            }
        }
    }
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff::from_millis(2)
        .factor(50)
        .max_delay(Duration::from_secs(10))
}
