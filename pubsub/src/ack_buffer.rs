use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use pubsub_gax::grpc::{Code, Status};
use pubsub_gax::retry::{invoke_fn, RetrySetting};
use tokio::select;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::apiv1::subscriber_client::{AckError, SubscriberClient};
use crate::apiv1::{AcknowledgeRequest, ModifyAckDeadlineRequest};
use crate::subscriber::AcknowledgeResult;

/// Bytes added per ack id on top of its length.
const ACK_ID_OVERHEAD: usize = 2;

/// Upper bound of one flush.
const PUSH_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound of the retries of one exactly-once request.
const EXACTLY_ONCE_RETRY_TIMEOUT: Duration = Duration::from_secs(600);

const EXACTLY_ONCE_RETRY_CODES: [Code; 6] = [
    Code::Cancelled,
    Code::DeadlineExceeded,
    Code::Internal,
    Code::ResourceExhausted,
    Code::InvalidArgument,
    Code::Unavailable,
];

fn exactly_once_retry_setting() -> RetrySetting {
    RetrySetting {
        from_millis: 2,
        max_delay: Some(Duration::from_secs(64)),
        factor: 500,
        take: 15,
        codes: EXACTLY_ONCE_RETRY_CODES.to_vec(),
    }
}

#[derive(Clone, Debug)]
pub struct AckBufferConfig {
    /// Pending ack ids are flushed once their size reaches this.
    pub max_bytes: usize,
    pub interval: Duration,
}

impl Default for AckBufferConfig {
    fn default() -> Self {
        Self {
            max_bytes: 500_000,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Ack,
    ModAck(i32),
}

type ResultSender = oneshot::Sender<AcknowledgeResult>;

#[derive(Default)]
struct State {
    register: HashMap<String, Action>,
    bytes: usize,
    results: HashMap<String, Vec<ResultSender>>,
}

/// Batches acknowledgements and deadline modifications of all streams.
///
/// Each ack id has at most one pending action: a later ack or modify_ack_deadline
/// replaces the earlier one, a lease renewal never does. Pending actions are sent
/// every `interval` and whenever they reach `max_bytes`.
pub(crate) struct AckBuffer {
    subscription: String,
    subc: SubscriberClient,
    config: AckBufferConfig,
    push_threads: usize,
    exactly_once_delivery: AtomicBool,
    state: Mutex<State>,
    timer: Mutex<Option<JoinHandle<()>>>,
    timer_cancel: CancellationToken,
    flushes: TaskTracker,
    retries: TaskTracker,
    retry_cancel: CancellationToken,
    span: tracing::Span,
}

impl AckBuffer {
    pub fn new(
        subscription: String,
        subc: SubscriberClient,
        config: AckBufferConfig,
        push_threads: usize,
        exactly_once_delivery: bool,
        span: tracing::Span,
    ) -> Self {
        Self {
            subscription,
            subc,
            config,
            push_threads,
            exactly_once_delivery: AtomicBool::new(exactly_once_delivery),
            state: Mutex::new(State::default()),
            timer: Mutex::new(None),
            timer_cancel: CancellationToken::new(),
            flushes: TaskTracker::new(),
            retries: TaskTracker::new(),
            retry_cancel: CancellationToken::new(),
            span,
        }
    }

    pub fn exactly_once_delivery_enabled(&self) -> bool {
        self.exactly_once_delivery.load(Ordering::SeqCst)
    }

    pub fn set_exactly_once_delivery(&self, enabled: bool) {
        let previous = self.exactly_once_delivery.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            tracing::debug!(parent: &self.span, enabled, "exactly once delivery changed");
        }
    }

    pub fn acknowledge(self: &Arc<Self>, ack_id: &str, result: Option<ResultSender>) {
        self.register(ack_id, Action::Ack, true, result);
    }

    pub fn modify_ack_deadline(self: &Arc<Self>, deadline: i32, ack_id: &str, result: Option<ResultSender>) {
        self.register(ack_id, Action::ModAck(deadline), true, result);
    }

    /// Extends the lease of `ack_ids` unless another action is pending for them.
    pub fn renew_lease(self: &Arc<Self>, deadline: i32, ack_ids: &[String]) {
        for ack_id in ack_ids {
            self.register(ack_id, Action::ModAck(deadline), false, None);
        }
    }

    fn register(self: &Arc<Self>, ack_id: &str, action: Action, overwrite: bool, result: Option<ResultSender>) {
        let full = {
            let mut state = self.state.lock();
            let inserted = match state.register.get_mut(ack_id) {
                Some(pending) => {
                    if overwrite {
                        *pending = action;
                    }
                    false
                }
                None => {
                    state.register.insert(ack_id.to_string(), action);
                    true
                }
            };
            if inserted {
                state.bytes += ack_id.len() + ACK_ID_OVERHEAD;
            }
            if let Some(result) = result {
                state.results.entry(ack_id.to_string()).or_default().push(result);
            }
            state.bytes >= self.config.max_bytes
        };
        if full {
            self.flush_now();
        }
    }

    /// Flushes every `interval` until [`AckBuffer::stop`].
    pub fn start(self: &Arc<Self>) {
        let buffer = Arc::downgrade(self);
        let cancel = self.timer_cancel.clone();
        let interval = self.config.interval;
        let task = tokio::spawn(run_timer(buffer, cancel, interval).instrument(self.span.clone()));
        *self.timer.lock() = Some(task);
    }

    /// Stops the timer and sends everything pending. Exactly-once retries still
    /// running afterwards are canceled.
    pub async fn stop(self: &Arc<Self>) {
        self.timer_cancel.cancel();
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            let _ = timer.await;
        }
        self.flush().await;
        self.flushes.close();
        self.flushes.wait().await;
        self.retry_cancel.cancel();
        self.retries.close();
        self.retries.wait().await;
        tracing::trace!(parent: &self.span, "ack buffer stopped");
    }

    /// Starts a flush in the background.
    pub fn flush_now(self: &Arc<Self>) {
        if self.state.lock().register.is_empty() {
            return;
        }
        let buffer = self.clone();
        self.flushes.spawn(async move { buffer.flush().await }.instrument(self.span.clone()));
    }

    pub async fn flush(self: &Arc<Self>) {
        let register = {
            let mut state = self.state.lock();
            state.bytes = 0;
            std::mem::take(&mut state.register)
        };
        if register.is_empty() {
            return;
        }

        let mut acks = Vec::new();
        let mut modacks: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        for (ack_id, action) in register {
            match action {
                Action::Ack => acks.push(ack_id),
                Action::ModAck(deadline) => modacks.entry(deadline).or_default().push(ack_id),
            }
        }
        let mut requests: Vec<(Action, Vec<String>)> = Vec::new();
        for chunk in self.split(acks) {
            requests.push((Action::Ack, chunk));
        }
        for (deadline, ack_ids) in modacks {
            for chunk in self.split(ack_ids) {
                requests.push((Action::ModAck(deadline), chunk));
            }
        }

        let flushed: Vec<String> = requests.iter().flat_map(|(_, ids)| ids.iter().cloned()).collect();
        let pushes = futures_util::stream::iter(requests)
            .for_each_concurrent(self.push_threads, |(action, ack_ids)| self.push(action, ack_ids));
        if tokio::time::timeout(PUSH_TIMEOUT, pushes).await.is_err() {
            tracing::error!(parent: &self.span, "timed out sending {} acknowledgements", flushed.len());
            self.complete(&flushed, AcknowledgeResult::from_error(Status::deadline_exceeded("push timed out")));
        }
    }

    /// Splits `ack_ids` into requests of at most `max_bytes`.
    fn split(&self, ack_ids: Vec<String>) -> Vec<Vec<String>> {
        let base_bytes = self.subscription.len() + ACK_ID_OVERHEAD;
        let mut chunks = Vec::new();
        let mut chunk: Vec<String> = Vec::new();
        let mut bytes = base_bytes;
        for ack_id in ack_ids {
            let size = ack_id.len() + ACK_ID_OVERHEAD;
            if !chunk.is_empty() && bytes + size > self.config.max_bytes {
                chunks.push(std::mem::take(&mut chunk));
                bytes = base_bytes;
            }
            bytes += size;
            chunk.push(ack_id);
        }
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
        chunks
    }

    async fn send(&self, action: Action, ack_ids: &[String]) -> Result<(), AckError> {
        match action {
            Action::Ack => {
                self.subc
                    .acknowledge(AcknowledgeRequest {
                        subscription: self.subscription.clone(),
                        ack_ids: ack_ids.to_vec(),
                    })
                    .await
            }
            Action::ModAck(deadline) => {
                self.subc
                    .modify_ack_deadline(ModifyAckDeadlineRequest {
                        subscription: self.subscription.clone(),
                        ack_ids: ack_ids.to_vec(),
                        ack_deadline_seconds: deadline,
                    })
                    .await
            }
        }
    }

    async fn push(self: &Arc<Self>, action: Action, ack_ids: Vec<String>) {
        let err = match self.send(action, &ack_ids).await {
            Ok(()) => {
                self.complete(&ack_ids, AcknowledgeResult::success());
                return;
            }
            Err(err) => err,
        };
        if self.exactly_once_delivery_enabled() && EXACTLY_ONCE_RETRY_CODES.contains(&err.status.code()) {
            let temporary = self.settle_partial(&ack_ids, &err);
            if !temporary.is_empty() {
                tracing::debug!(parent: &self.span, "retrying {} acknowledgements: {}", temporary.len(), err);
                self.retry(action, temporary);
            }
            return;
        }
        tracing::warn!(parent: &self.span, ?action, "failed to send {} acknowledgements: {}", ack_ids.len(), err);
        self.complete(&ack_ids, AcknowledgeResult::from_error(err.status));
    }

    /// Completes the ack ids the server reported as permanently failed or not
    /// failed at all. Returns the ones worth retrying.
    fn settle_partial(&self, ack_ids: &[String], err: &AckError) -> Vec<String> {
        if err.error_metadata.is_empty() {
            return ack_ids.to_vec();
        }
        let permanent: HashSet<&String> = err.permanent_failures().collect();
        let temporary: HashSet<&String> = err.temporary_failures().collect();
        let mut retry = Vec::new();
        for ack_id in ack_ids {
            if permanent.contains(ack_id) {
                let reason = err.error_metadata.get(ack_id).map(String::as_str).unwrap_or_default();
                let status = if reason.contains("INVALID_ACK_ID") {
                    Status::invalid_argument(reason)
                } else {
                    Status::failed_precondition(reason)
                };
                self.complete(std::slice::from_ref(ack_id), AcknowledgeResult::from_error(status));
            } else if temporary.contains(ack_id) {
                retry.push(ack_id.clone());
            } else {
                self.complete(std::slice::from_ref(ack_id), AcknowledgeResult::success());
            }
        }
        retry
    }

    fn retry(self: &Arc<Self>, action: Action, ack_ids: Vec<String>) {
        let buffer = self.clone();
        let cancel = self.retry_cancel.clone();
        self.retries.spawn(
            async move {
                let attempt = |ack_ids: Vec<String>| {
                    let buffer = buffer.clone();
                    async move {
                        match buffer.send(action, &ack_ids).await {
                            Ok(()) => {
                                buffer.complete(&ack_ids, AcknowledgeResult::success());
                                Ok(())
                            }
                            Err(err) => {
                                let temporary = buffer.settle_partial(&ack_ids, &err);
                                if temporary.is_empty() {
                                    Ok(())
                                } else {
                                    Err((err, temporary))
                                }
                            }
                        }
                    }
                };
                let retried = invoke_fn(Some(cancel), Some(exactly_once_retry_setting()), attempt, ack_ids.clone());
                let result = match tokio::time::timeout(EXACTLY_ONCE_RETRY_TIMEOUT, retried).await {
                    Ok(Ok(())) => return,
                    Ok(Err(err)) => AcknowledgeResult::from_error(err.status),
                    Err(_) => AcknowledgeResult::from_error(Status::deadline_exceeded("retry timed out")),
                };
                tracing::warn!(?action, "giving up {} acknowledgements: {:?}", ack_ids.len(), result.error());
                buffer.complete(&ack_ids, result);
            }
            .instrument(self.span.clone()),
        );
    }

    /// Sends `result` to everyone waiting on `ack_ids`.
    fn complete(&self, ack_ids: &[String], result: AcknowledgeResult) {
        let senders: Vec<ResultSender> = {
            let mut state = self.state.lock();
            ack_ids
                .iter()
                .filter_map(|ack_id| state.results.remove(ack_id))
                .flatten()
                .collect()
        };
        for sender in senders {
            let _ = sender.send(result.clone());
        }
    }
}

async fn run_timer(buffer: Weak<AckBuffer>, cancel: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match buffer.upgrade() {
                Some(buffer) => buffer.flush_now(),
                None => break,
            }
        }
    }
    tracing::trace!("ack buffer timer stopped");
}
