use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use pubsub_gax::grpc::{Code, Status};
use pubsub_gax::retry::{ExponentialBackoff, RetrySetting};
use tokio::select;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::apiv1::publisher_client::PublisherClient;
use crate::apiv1::{PublishRequest, PubsubMessage};
use crate::batch::{Batch, BatchAction, BatchItem, PublishCallback};
use crate::error::Error;
use crate::executor::Executor;
use crate::flow_controller::{FlowControlConfig, FlowController, LimitExceededBehavior};

/// Codes retried for messages with an ordering key. Other errors cancel the key.
const ORDERED_RETRY_CODES: [Code; 6] = [
    Code::Cancelled,
    Code::DeadlineExceeded,
    Code::Internal,
    Code::ResourceExhausted,
    Code::Unauthenticated,
    Code::Unavailable,
];

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    /// Maximum encoded size of one publish request.
    pub max_bytes: usize,
    /// Maximum number of messages in one publish request.
    pub max_messages: usize,
    /// Maximum time a message waits before its batch is published.
    pub flush_interval: Duration,
    /// Number of tasks sending publish requests.
    pub publish_threads: usize,
    /// Number of tasks running publish callbacks.
    pub callback_threads: usize,
    /// Defaults to ten times `max_messages` and `max_bytes` with flow control disabled.
    pub flow_control: Option<FlowControlConfig>,
    pub enable_message_ordering: bool,
    /// Retry applied to each publish call by the transport client. Without it
    /// every publish request is sent once.
    pub retry_setting: Option<RetrySetting>,
    /// Parent span of the publisher's log records.
    pub span: Option<tracing::Span>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1_000_000,
            max_messages: 100,
            flush_interval: Duration::from_millis(10),
            publish_threads: 2,
            callback_threads: 4,
            flow_control: None,
            enable_message_ordering: false,
            retry_setting: None,
            span: None,
        }
    }
}

impl PublisherConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.max_messages < 1 || self.max_bytes < 1 {
            return Err(Error::InvalidConfig(format!(
                "max_messages and max_bytes must be at least 1: max_messages={}, max_bytes={}",
                self.max_messages, self.max_bytes
            )));
        }
        if self.publish_threads < 1 || self.callback_threads < 1 {
            return Err(Error::InvalidConfig("publish_threads and callback_threads must be at least 1".to_string()));
        }
        Ok(())
    }

    fn flow_control(&self) -> FlowControlConfig {
        self.flow_control.clone().unwrap_or_else(|| FlowControlConfig {
            message_limit: self.max_messages * 10,
            byte_limit: self.max_bytes * 10,
            limit_exceeded_behavior: LimitExceededBehavior::Ignore,
        })
    }
}

/// The outcome of publishing one message.
#[derive(Clone, Debug)]
pub struct PublishResult {
    message: PubsubMessage,
    error: Option<Error>,
}

impl PublishResult {
    pub(crate) fn success(message: PubsubMessage) -> Self {
        Self { message, error: None }
    }

    pub(crate) fn failure(message: PubsubMessage, error: Error) -> Self {
        Self {
            message,
            error: Some(error),
        }
    }

    pub fn message(&self) -> &PubsubMessage {
        &self.message
    }

    pub fn data(&self) -> &[u8] {
        &self.message.data
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.message.attributes
    }

    /// The server-assigned ID. Empty when publishing failed.
    pub fn message_id(&self) -> &str {
        &self.message.message_id
    }

    pub fn ordering_key(&self) -> &str {
        &self.message.ordering_key
    }

    pub fn publish_time(&self) -> Option<SystemTime> {
        self.message.publish_time
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn failed(&self) -> bool {
        !self.succeeded()
    }

    pub fn into_result(self) -> Result<String, Error> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.message.message_id),
        }
    }
}

pub struct Awaiter {
    consumer: oneshot::Receiver<PublishResult>,
}

impl Awaiter {
    pub(crate) fn new(consumer: oneshot::Receiver<PublishResult>) -> Self {
        Self { consumer }
    }

    /// Waits for the server-generated ID of the message or the error that prevented publishing it.
    pub async fn get(self, ctx: CancellationToken) -> Result<String, Error> {
        let onetime = self.consumer;
        select! {
            _ = ctx.cancelled() => Err(Status::cancelled("cancelled").into()),
            v = onetime => match v {
                Ok(result) => result.into_result(),
                Err(_e) => Err(Status::cancelled("closed").into())
            }
        }
    }
}

struct State {
    batches: HashMap<String, Arc<Batch>>,
    published_at: Option<Instant>,
    stopped: bool,
    message_ordering: bool,
}

struct Inner {
    topic: String,
    pubc: PublisherClient,
    config: PublisherConfig,
    state: Mutex<State>,
    wake: Arc<Notify>,
    flow_controller: FlowController,
    publish_pool: Executor,
    callback_pool: Executor,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    span: tracing::Span,
}

/// Publisher batches messages per ordering key and publishes them in the background.
///
/// A batch is published when it reaches `max_messages` or `max_bytes`, when
/// `flush_interval` has passed since its first message, on [`Publisher::flush`]
/// and on [`Publisher::stop`]. Messages with the same ordering key are published
/// in order, one request at a time. Messages without an ordering key share one batch.
///
/// Call [`Publisher::shutdown`] (or `stop` and `wait`) before dropping the
/// publisher, otherwise pending messages are lost.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

impl Publisher {
    pub(crate) fn new(topic: String, pubc: PublisherClient, config: Option<PublisherConfig>) -> Result<Self, Error> {
        let config = config.unwrap_or_default();
        config.validate()?;
        let flow_controller = FlowController::new(config.flow_control())?;
        let span = match &config.span {
            Some(parent) => tracing::info_span!(parent: parent, "publisher", topic = topic.as_str()),
            None => tracing::info_span!("publisher", topic = topic.as_str()),
        };

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                batches: HashMap::new(),
                published_at: None,
                stopped: false,
                message_ordering: config.enable_message_ordering,
            }),
            wake: Arc::new(Notify::new()),
            flow_controller,
            publish_pool: Executor::new("publish", config.publish_threads, span.clone()),
            callback_pool: Executor::new("publish-callback", config.callback_threads, span.clone()),
            scheduler: Mutex::new(None),
            topic,
            pubc,
            config,
            span,
        });

        let scheduler = tokio::spawn(
            run_scheduler(Arc::downgrade(&inner), inner.wake.clone()).instrument(inner.span.clone()),
        );
        *inner.scheduler.lock() = Some(scheduler);
        tracing::trace!(parent: &inner.span, "publisher started");
        Ok(Self { inner })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// publish queues the message and returns an awaiter for its result.
    ///
    /// Fails immediately when the publisher was stopped, when the message has an
    /// ordering key but ordering is disabled, when its ordering key was canceled by
    /// an earlier failure, or when flow control rejects it. With
    /// [`LimitExceededBehavior::Block`] this waits until flow control admits the message.
    pub async fn publish(&self, message: PubsubMessage) -> Result<Awaiter, Error> {
        let (producer, consumer) = oneshot::channel();
        self.publish_with_callback(message, move |result| {
            let _ = producer.send(result);
        })
        .await?;
        Ok(Awaiter::new(consumer))
    }

    /// Like [`Publisher::publish`], but `callback` receives the result on the callback pool.
    pub async fn publish_with_callback<F>(&self, message: PubsubMessage, callback: F) -> Result<(), Error>
    where
        F: FnOnce(PublishResult) + Send + 'static,
    {
        self.inner.enqueue(message, Box::new(callback)).await
    }

    /// Publishes every pending batch now.
    pub fn flush(&self) {
        let mut state = self.inner.state.lock();
        self.inner.publish_batches(&mut state, false);
        self.inner.wake.notify_one();
    }

    /// Stops accepting messages and publishes everything pending. Idempotent.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }
        tracing::debug!(parent: &self.inner.span, "stopping publisher");
        state.stopped = true;
        self.inner.publish_batches(&mut state, true);
        self.inner.wake.notify_one();
        self.inner.publish_pool.shutdown();
    }

    /// Waits for pending publishes and their callbacks after [`Publisher::stop`].
    /// Returns false if `timeout` elapsed first. Called before `stop`, this
    /// blocks until `stop` and the drain complete or the timeout elapses.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        // The publish pool only finishes after stop shut it down.
        if !self.inner.publish_pool.wait(deadline).await {
            return false;
        }
        self.inner.callback_pool.shutdown();
        if !self.inner.callback_pool.wait(deadline).await {
            return false;
        }
        let scheduler = self.inner.scheduler.lock().take();
        if let Some(mut scheduler) = scheduler {
            let joined = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, &mut scheduler).await.is_ok(),
                None => {
                    let _ = (&mut scheduler).await;
                    true
                }
            };
            if !joined {
                *self.inner.scheduler.lock() = Some(scheduler);
                return false;
            }
        }
        true
    }

    /// stop and wait.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> bool {
        self.stop();
        self.wait(timeout).await
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    pub fn enable_message_ordering(&self) {
        self.inner.state.lock().message_ordering = true;
    }

    pub fn message_ordering(&self) -> bool {
        self.inner.state.lock().message_ordering
    }

    /// Accepts messages for `ordering_key` again after a failure canceled it.
    pub fn resume_publish(&self, ordering_key: &str) {
        let state = self.inner.state.lock();
        if let Some(batch) = state.batches.get(ordering_key) {
            tracing::debug!(parent: &self.inner.span, ordering_key, "resume publish");
            batch.resume();
        }
    }

    pub fn flow_controller(&self) -> &FlowController {
        &self.inner.flow_controller
    }
}

/// Publishes batches whose first message has waited `flush_interval`.
async fn run_scheduler(inner: Weak<Inner>, wake: Arc<Notify>) {
    loop {
        let deadline = {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let mut state = inner.state.lock();
            if state.stopped {
                break;
            }
            match state.published_at {
                None => None,
                Some(published_at) if published_at.elapsed() >= inner.config.flush_interval => {
                    tracing::trace!("flush interval elapsed");
                    inner.publish_batches(&mut state, false);
                    None
                }
                Some(published_at) => Some(published_at + inner.config.flush_interval),
            }
        };
        match deadline {
            None => wake.notified().await,
            Some(deadline) => {
                let _ = tokio::time::timeout_at(deadline, wake.notified()).await;
            }
        }
    }
    tracing::trace!("publish scheduler stopped");
}

impl Inner {
    fn check_accepting(&self, state: &State, ordering_key: &str) -> Result<(), Error> {
        if state.stopped {
            return Err(Error::AsyncPublisherStopped);
        }
        if !ordering_key.is_empty() && !state.message_ordering {
            return Err(Error::OrderedMessagesDisabled);
        }
        Ok(())
    }

    async fn enqueue(self: &Arc<Self>, message: PubsubMessage, callback: PublishCallback) -> Result<(), Error> {
        self.check_accepting(&self.state.lock(), &message.ordering_key)?;

        let item = BatchItem::new(message, Some(callback));
        let size = item.size;
        if let Err(err) = self.flow_controller.acquire(size).await {
            if !item.message.ordering_key.is_empty() {
                self.stop_publish(&item.message.ordering_key, &err);
            }
            return Err(err);
        }

        let result = {
            let mut state = self.state.lock();
            self.add_locked(&mut state, item)
        };
        if result.is_err() {
            self.release(size);
        }
        result
    }

    fn add_locked(self: &Arc<Self>, state: &mut State, item: BatchItem) -> Result<(), Error> {
        self.check_accepting(state, &item.message.ordering_key)?;
        let ordering_key = item.message.ordering_key.clone();
        let batch = state
            .batches
            .entry(ordering_key.clone())
            .or_insert_with(|| {
                Arc::new(Batch::new(
                    &self.topic,
                    ordering_key.clone(),
                    self.config.max_messages,
                    self.config.max_bytes,
                ))
            })
            .clone();
        if batch.is_canceled() {
            return Err(Error::OrderingKey(ordering_key));
        }

        match batch.add(item)? {
            // A full batch publishes the pending batches of every key.
            BatchAction::Full => self.publish_batches(state, false),
            BatchAction::Added | BatchAction::Queued => {
                if state.published_at.is_none() {
                    state.published_at = Some(Instant::now());
                }
            }
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Cancels `ordering_key` and fails everything pending for it.
    fn stop_publish(&self, ordering_key: &str, err: &Error) {
        let batch = self.state.lock().batches.get(ordering_key).cloned();
        if let Some(batch) = batch {
            tracing::warn!(parent: &self.span, ordering_key, "canceling ordering key: {}", err);
            let unsent = batch.cancel();
            self.complete_error(unsent, err.clone());
        }
    }

    fn publish_batches(self: &Arc<Self>, state: &mut State, stop: bool) {
        state.batches.retain(|_, batch| !batch.is_empty() || batch.is_canceled());
        for batch in state.batches.values() {
            if batch.publish(stop) {
                self.publish_batch_async(batch.clone());
            }
        }
        state.published_at = None;
    }

    fn publish_batch_async(self: &Arc<Self>, batch: Arc<Batch>) {
        let this = self.clone();
        let job_batch = batch.clone();
        if !self.publish_pool.spawn(async move { this.publish_batch_sync(job_batch).await }) {
            // Only reachable after stop: nothing will send these anymore.
            let unsent = batch.cancel();
            batch.reset();
            self.complete_error(unsent, Error::AsyncPublisherStopped);
        }
    }

    async fn publish_batch_sync(self: Arc<Self>, batch: Arc<Batch>) {
        loop {
            let items = batch.rebalance();
            if !items.is_empty() {
                self.publish_items(&batch, items).await;
            }
            if !batch.reset() {
                break;
            }
        }
        // Messages queued during the last send wait for the next interval.
        if !batch.is_empty() && !batch.is_canceled() {
            let mut state = self.state.lock();
            if state.published_at.is_none() {
                state.published_at = Some(Instant::now());
            }
            self.wake.notify_one();
        }
    }

    async fn publish_items(&self, batch: &Batch, items: Vec<BatchItem>) {
        let ordering_key = batch.ordering_key();
        let mut backoff = ExponentialBackoff::from_millis(10).max_delay(Duration::from_secs(5));
        loop {
            let req = PublishRequest {
                topic: self.topic.clone(),
                messages: items.iter().map(|i| i.message.clone()).collect(),
            };
            let status = match self.pubc.publish(req, None, self.config.retry_setting.clone()).await {
                Ok(response) => {
                    self.complete_success(items, response.message_ids);
                    return;
                }
                Err(status) => status,
            };

            if ordering_key.is_empty() {
                tracing::debug!(parent: &self.span, "publish failed: {}", status);
                self.complete_error(items, status.into());
                return;
            }
            if ORDERED_RETRY_CODES.contains(&status.code()) {
                let delay = backoff.next().unwrap_or(Duration::from_secs(5));
                tracing::warn!(parent: &self.span, ordering_key, "retry publish after {:?}: {}", delay, status);
                tokio::time::sleep(delay).await;
                continue;
            }

            tracing::error!(parent: &self.span, ordering_key, "publish failed, canceling ordering key: {}", status);
            self.complete_error(items, status.into());
            let unsent = batch.cancel();
            self.complete_error(unsent, Error::OrderingKey(ordering_key.to_string()));
            return;
        }
    }

    fn complete_success(&self, items: Vec<BatchItem>, message_ids: Vec<String>) {
        let mut message_ids = message_ids.into_iter();
        for mut item in items {
            self.release(item.size);
            let result = match message_ids.next() {
                Some(message_id) => {
                    item.message.message_id = message_id;
                    PublishResult::success(item.message)
                }
                None => PublishResult::failure(
                    item.message,
                    Status::internal("publish response is missing a message id").into(),
                ),
            };
            self.deliver(item.callback, result);
        }
    }

    fn complete_error(&self, items: Vec<BatchItem>, err: Error) {
        for item in items {
            self.release(item.size);
            self.deliver(item.callback, PublishResult::failure(item.message, err.clone()));
        }
    }

    fn deliver(&self, callback: Option<PublishCallback>, result: PublishResult) {
        if let Some(callback) = callback {
            if !self.callback_pool.spawn(async move { callback(result) }) {
                tracing::warn!(parent: &self.span, "callback pool stopped: publish result dropped");
            }
        }
    }

    fn release(&self, size: usize) {
        if let Err(e) = self.flow_controller.release(size) {
            tracing::error!(parent: &self.span, "{}", e);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.state.get_mut().stopped {
            tracing::warn!(parent: &self.span, "publisher dropped without shutdown");
        }
        self.wake.notify_one();
    }
}
