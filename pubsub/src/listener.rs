use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::ack_buffer::{AckBuffer, AckBufferConfig};
use crate::apiv1::subscriber_client::SubscriberClient;
use crate::error::Error;
use crate::executor::Executor;
use crate::inventory::InventoryLimits;
use crate::stream::StreamInner;
use crate::subscriber::ReceivedMessage;

pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

pub(crate) type MessageHandler = Arc<dyn Fn(ReceivedMessage, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Limits on the messages held by the listener at once, and how long they are leased.
#[derive(Clone, Debug)]
pub struct InventoryConfig {
    pub max_outstanding_messages: usize,
    pub max_outstanding_bytes: usize,
    /// Messages are no longer leased this long after they were received.
    pub max_total_lease_duration: Duration,
    /// Upper bound of one lease extension. Zero disables the bound.
    pub max_duration_per_lease_extension: Duration,
    /// Lower bound of one lease extension. Zero disables the bound. Forced to
    /// 60 seconds while exactly-once delivery is enabled.
    pub min_duration_per_lease_extension: Duration,
    /// Only enforce the limits on the client; the server is not told about them.
    pub use_legacy_flow_control: bool,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            max_outstanding_messages: 1000,
            max_outstanding_bytes: 100_000_000,
            max_total_lease_duration: Duration::from_secs(3600),
            max_duration_per_lease_extension: Duration::ZERO,
            min_duration_per_lease_extension: Duration::ZERO,
            use_legacy_flow_control: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ThreadsConfig {
    /// Number of tasks running the message handler.
    pub callback: usize,
    /// Number of concurrent acknowledge and modify_ack_deadline calls.
    pub push: usize,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self { callback: 8, push: 4 }
    }
}

#[derive(Clone)]
pub struct ListenerConfig {
    /// Ack deadline in seconds, between 10 and 600.
    pub deadline: i32,
    /// Number of concurrent streaming pulls.
    pub streams: usize,
    pub inventory: InventoryConfig,
    pub threads: ThreadsConfig,
    /// Deliver messages with the same ordering key one at a time.
    pub message_ordering: bool,
    /// Initial exactly-once state. Updated from the subscription properties the server sends.
    pub exactly_once_delivery: bool,
    pub ack_buffer: AckBufferConfig,
    /// Called for errors when no handler was registered with [`MessageListener::on_error`].
    pub default_error_handler: Option<ErrorHandler>,
    pub span: Option<tracing::Span>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            deadline: 60,
            streams: 2,
            inventory: InventoryConfig::default(),
            threads: ThreadsConfig::default(),
            message_ordering: false,
            exactly_once_delivery: false,
            ack_buffer: AckBufferConfig::default(),
            default_error_handler: None,
            span: None,
        }
    }
}

impl ListenerConfig {
    fn validate(&self) -> Result<(), Error> {
        if !(10..=600).contains(&self.deadline) {
            return Err(Error::InvalidConfig(format!(
                "deadline must be between 10 and 600 seconds: {}",
                self.deadline
            )));
        }
        if self.streams < 1 || self.threads.callback < 1 || self.threads.push < 1 {
            return Err(Error::InvalidConfig("streams and threads must be at least 1".to_string()));
        }
        let inventory = &self.inventory;
        if inventory.max_outstanding_messages < 1 || inventory.max_outstanding_bytes < 1 {
            return Err(Error::InvalidConfig(
                "max_outstanding_messages and max_outstanding_bytes must be at least 1".to_string(),
            ));
        }
        if self.ack_buffer.max_bytes < 1 || self.ack_buffer.interval.is_zero() {
            return Err(Error::InvalidConfig("ack buffer max_bytes and interval must be positive".to_string()));
        }
        Ok(())
    }

    /// The share of the inventory of one stream.
    fn stream_limits(&self) -> InventoryLimits {
        let inventory = &self.inventory;
        InventoryLimits {
            limit: inventory.max_outstanding_messages.div_ceil(self.streams),
            bytesize: inventory.max_outstanding_bytes.div_ceil(self.streams),
            extension: inventory.max_total_lease_duration,
            max_duration_per_lease_extension: inventory.max_duration_per_lease_extension,
            use_legacy_flow_control: inventory.use_legacy_flow_control,
        }
    }
}

/// Dispatches errors to the registered handlers and remembers the last one.
pub(crate) struct ErrorReporter {
    handlers: Mutex<Vec<ErrorHandler>>,
    default_handler: Option<ErrorHandler>,
    last_error: Mutex<Option<Error>>,
    span: tracing::Span,
}

impl ErrorReporter {
    pub fn new(default_handler: Option<ErrorHandler>, span: tracing::Span) -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            default_handler,
            last_error: Mutex::new(None),
            span,
        }
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error.lock().clone()
    }

    pub fn report(&self, error: &Error) {
        *self.last_error.lock() = Some(error.clone());
        let mut handlers = self.handlers.lock().clone();
        if handlers.is_empty() {
            match &self.default_handler {
                Some(handler) => handlers.push(handler.clone()),
                None => {
                    tracing::error!(parent: &self.span, "{}", error);
                    return;
                }
            }
        }
        for handler in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                tracing::error!(parent: &self.span, "error handler panicked while handling: {}", error);
            }
        }
    }
}

/// State shared by the streams of one listener.
pub(crate) struct ListenerContext {
    pub subscription: String,
    pub subc: SubscriberClient,
    pub handler: MessageHandler,
    pub deadline: i32,
    pub message_ordering: bool,
    pub limits: InventoryLimits,
    pub min_duration_per_lease_extension: Duration,
    pub buffer: Arc<AckBuffer>,
    pub callback_pool: Executor,
    pub errors: ErrorReporter,
    pub client_id: String,
}

#[derive(Default)]
struct State {
    started: bool,
    stopped: bool,
}

/// MessageListener receives messages of a subscription over `streams` streaming
/// pulls and calls the message handler for each of them.
///
/// Messages stay leased until they are acked, nacked, or exceed
/// `max_total_lease_duration`. Acknowledgements are buffered and sent in the
/// background. Errors of the streams and of the handler are passed to the
/// handlers registered with [`MessageListener::on_error`]; the streams restart
/// after an error.
pub struct MessageListener {
    ctx: Arc<ListenerContext>,
    config: ListenerConfig,
    streams: Vec<Arc<StreamInner>>,
    state: Mutex<State>,
    drained: CancellationToken,
    span: tracing::Span,
}

impl MessageListener {
    pub fn new<F>(
        subscription: String,
        subc: SubscriberClient,
        f: impl Fn(ReceivedMessage, CancellationToken) -> F + Send + Sync + 'static,
        config: Option<ListenerConfig>,
    ) -> Result<Self, Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let config = config.unwrap_or_default();
        config.validate()?;
        let span = match &config.span {
            Some(parent) => tracing::info_span!(parent: parent, "listener", subscription = subscription.as_str()),
            None => tracing::info_span!("listener", subscription = subscription.as_str()),
        };

        let handler: MessageHandler =
            Arc::new(move |message: ReceivedMessage, cancel: CancellationToken| -> BoxFuture<'static, ()> {
                Box::pin(f(message, cancel))
            });
        let buffer = Arc::new(AckBuffer::new(
            subscription.clone(),
            subc.clone(),
            config.ack_buffer.clone(),
            config.threads.push,
            config.exactly_once_delivery,
            span.clone(),
        ));
        let ctx = Arc::new(ListenerContext {
            subscription,
            subc,
            handler,
            deadline: config.deadline,
            message_ordering: config.message_ordering,
            limits: config.stream_limits(),
            min_duration_per_lease_extension: config.inventory.min_duration_per_lease_extension,
            buffer,
            callback_pool: Executor::new("message-callback", config.threads.callback, span.clone()),
            errors: ErrorReporter::new(config.default_error_handler.clone(), span.clone()),
            client_id: uuid::Uuid::new_v4().to_string(),
        });
        let streams = (0..config.streams)
            .map(|index| Arc::new(StreamInner::new(index, ctx.clone(), &span)))
            .collect();

        Ok(Self {
            ctx,
            config,
            streams,
            state: Mutex::new(State::default()),
            drained: CancellationToken::new(),
            span,
        })
    }

    /// Starts the ack buffer and the streams.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.started || state.stopped {
            return;
        }
        state.started = true;
        self.ctx.buffer.start();
        for stream in &self.streams {
            stream.start();
        }
        tracing::debug!(parent: &self.span, streams = self.streams.len(), "listener started");
    }

    /// Stops receiving messages. Handlers already running finish, then pending
    /// acknowledgements are sent. Use [`MessageListener::wait`] to wait for it.
    pub fn stop(&self) {
        let started = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.started
        };
        tracing::debug!(parent: &self.span, "stopping listener");
        for stream in &self.streams {
            stream.stop();
        }
        let runtime = tokio::runtime::Handle::try_current();
        let Some(runtime) = runtime.ok().filter(|_| started) else {
            self.drained.cancel();
            return;
        };
        let streams = self.streams.clone();
        let ctx = self.ctx.clone();
        let drained = self.drained.clone();
        runtime.spawn(
            async move {
                for stream in &streams {
                    stream.wait().await;
                }
                ctx.buffer.stop().await;
                ctx.callback_pool.shutdown();
                ctx.callback_pool.wait(None).await;
                tracing::trace!("listener stopped");
                drained.cancel();
            }
            .instrument(self.span.clone()),
        );
    }

    /// Waits until the listener stopped and every acknowledgement was sent.
    /// Returns false if `timeout` elapsed first.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.drained.cancelled()).await.is_ok(),
            None => {
                self.drained.cancelled().await;
                true
            }
        }
    }

    /// stop and wait.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> bool {
        self.stop();
        self.wait(timeout).await
    }

    /// Registers a handler for errors raised in the background. Replaces the
    /// default error handler.
    pub fn on_error(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        self.ctx.errors.handlers.lock().push(Arc::new(handler));
    }

    /// The most recent error raised in the background.
    pub fn last_error(&self) -> Option<Error> {
        self.ctx.errors.last_error()
    }

    pub fn is_started(&self) -> bool {
        let state = self.state.lock();
        state.started && !state.stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn subscription(&self) -> &str {
        &self.ctx.subscription
    }

    pub fn deadline(&self) -> i32 {
        self.config.deadline
    }

    pub fn streams(&self) -> usize {
        self.streams.len()
    }

    pub fn message_ordering(&self) -> bool {
        self.config.message_ordering
    }

    pub fn callback_threads(&self) -> usize {
        self.config.threads.callback
    }

    pub fn push_threads(&self) -> usize {
        self.config.threads.push
    }

    pub fn max_outstanding_messages(&self) -> usize {
        self.config.inventory.max_outstanding_messages
    }

    pub fn max_outstanding_bytes(&self) -> usize {
        self.config.inventory.max_outstanding_bytes
    }

    pub fn use_legacy_flow_control(&self) -> bool {
        self.config.inventory.use_legacy_flow_control
    }

    pub fn max_total_lease_duration(&self) -> Duration {
        self.config.inventory.max_total_lease_duration
    }

    pub fn max_duration_per_lease_extension(&self) -> Duration {
        self.config.inventory.max_duration_per_lease_extension
    }

    pub fn min_duration_per_lease_extension(&self) -> Duration {
        self.config.inventory.min_duration_per_lease_extension
    }

    /// The inventory limits of each stream.
    pub fn stream_inventory(&self) -> InventoryConfig {
        let limits = &self.ctx.limits;
        InventoryConfig {
            max_outstanding_messages: limits.limit,
            max_outstanding_bytes: limits.bytesize,
            ..self.config.inventory.clone()
        }
    }

    pub fn exactly_once_delivery_enabled(&self) -> bool {
        self.ctx.buffer.exactly_once_delivery_enabled()
    }

    /// Number of messages currently leased by all streams.
    pub fn outstanding_messages(&self) -> usize {
        self.streams.iter().map(|s| s.inventory().count()).sum()
    }
}

impl Drop for MessageListener {
    fn drop(&mut self) {
        if self.is_started() {
            tracing::warn!(parent: &self.span, "listener dropped without shutdown");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use pubsub_gax::grpc::Status;
    use serial_test::serial;
    use tokio_util::sync::CancellationToken;

    use crate::apiv1::mock::MockSubscriber;
    use crate::apiv1::subscriber_client::SubscriberClient;
    use crate::apiv1::{self, PubsubMessage, StreamingPullResponse, SubscriptionProperties};
    use crate::error::Error;
    use crate::listener::{ListenerConfig, MessageListener};
    use crate::subscriber::{AcknowledgeResult, ReceivedMessage};

    #[ctor::ctor]
    fn init() {
        let filter = tracing_subscriber::filter::EnvFilter::from_default_env()
            .add_directive("pubsub_async=trace".parse().unwrap());
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    fn response(messages: &[(&str, &str)]) -> StreamingPullResponse {
        StreamingPullResponse {
            received_messages: messages
                .iter()
                .map(|(ack_id, ordering_key)| apiv1::ReceivedMessage {
                    ack_id: ack_id.to_string(),
                    message: Some(PubsubMessage::new(format!("data-{ack_id}")).with_ordering_key(*ordering_key)),
                    delivery_attempt: 0,
                })
                .collect(),
            subscription_properties: None,
        }
    }

    fn config() -> ListenerConfig {
        ListenerConfig {
            streams: 1,
            ..Default::default()
        }
    }

    async fn eventually(f: impl Fn() -> bool) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met");
    }

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_receive_and_ack() {
        let mock = Arc::new(MockSubscriber::new().with_session(vec![Ok(response(&[("a", ""), ("b", ""), ("c", "")]))]));
        let received = Arc::new(AtomicUsize::new(0));
        let r = received.clone();
        let listener = MessageListener::new(
            "projects/p/subscriptions/s".to_string(),
            SubscriberClient::new(mock.clone()),
            move |message: ReceivedMessage, _ctx: CancellationToken| {
                let r = r.clone();
                async move {
                    assert_eq!(message.message.data, format!("data-{}", message.ack_id()).into_bytes());
                    message.ack();
                    r.fetch_add(1, Ordering::SeqCst);
                }
            },
            Some(config()),
        )
        .unwrap();
        assert!(!listener.is_started());
        listener.start();
        assert!(listener.is_started());
        eventually(|| received.load(Ordering::SeqCst) == 3).await;
        assert!(listener.shutdown(Some(Duration::from_secs(5))).await);
        assert!(listener.is_stopped());

        assert_eq!(
            sorted(mock.acked_ids()),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        let initial = mock.initial_requests.lock()[0].clone();
        assert_eq!(initial.subscription, "projects/p/subscriptions/s");
        assert_eq!(initial.stream_ack_deadline_seconds, 60);
        assert_eq!(initial.max_outstanding_messages, 1000);
        assert_eq!(initial.max_outstanding_bytes, 100_000_000);
        assert!(!initial.client_id.is_empty());
        assert_eq!(listener.outstanding_messages(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_ordered_delivery() {
        let mock = Arc::new(MockSubscriber::new().with_session(vec![
            Ok(response(&[("1", "k"), ("2", "k"), ("x", "other")])),
            Ok(response(&[("3", "k")])),
        ]));
        let order = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));
        let (o, r) = (order.clone(), running.clone());
        let listener = MessageListener::new(
            "s".to_string(),
            SubscriberClient::new(mock.clone()),
            move |message: ReceivedMessage, _ctx: CancellationToken| {
                let (o, r) = (o.clone(), r.clone());
                async move {
                    if message.ordering_key() == "k" {
                        assert_eq!(r.fetch_add(1, Ordering::SeqCst), 0, "concurrent callbacks for one key");
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        o.lock().push(message.ack_id().to_string());
                        r.fetch_sub(1, Ordering::SeqCst);
                    }
                    message.ack();
                }
            },
            Some(ListenerConfig {
                message_ordering: true,
                ..config()
            }),
        )
        .unwrap();
        listener.start();
        eventually(|| order.lock().len() == 3).await;
        assert!(listener.shutdown(None).await);
        assert_eq!(*order.lock(), vec!["1".to_string(), "2".to_string(), "3".to_string()]);
        assert_eq!(mock.acked_ids().len(), 4);
        assert!(listener.last_error().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_handler_panic_is_reported() {
        let mock = Arc::new(MockSubscriber::new().with_session(vec![Ok(StreamingPullResponse {
            received_messages: vec![apiv1::ReceivedMessage {
                ack_id: "a".to_string(),
                message: Some(PubsubMessage {
                    message_id: "m-1".to_string(),
                    ..PubsubMessage::new("boom")
                }),
                delivery_attempt: 1,
            }],
            subscription_properties: None,
        })]));
        let listener = MessageListener::new(
            "s".to_string(),
            SubscriberClient::new(mock.clone()),
            |_message: ReceivedMessage, _ctx: CancellationToken| async move {
                panic!("handler failed");
            },
            Some(config()),
        )
        .unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        listener.on_error(move |err| e.lock().push(err.to_string()));
        listener.start();
        eventually(|| !errors.lock().is_empty()).await;
        assert!(matches!(listener.last_error(), Some(Error::HandlerPanicked(id)) if id == "m-1"));
        // the panic released the message from the inventory
        eventually(|| listener.outstanding_messages() == 0).await;
        assert!(listener.shutdown(None).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_stream_error_restarts_stream() {
        let mock = Arc::new(
            MockSubscriber::new()
                .with_session(vec![Err(Status::unavailable("retry me"))])
                .with_session(vec![Err(Status::permission_denied("denied"))])
                .with_session(vec![Ok(response(&[("a", "")]))]),
        );
        let received = Arc::new(AtomicUsize::new(0));
        let r = received.clone();
        let default_errors = Arc::new(AtomicUsize::new(0));
        let d = default_errors.clone();
        let listener = MessageListener::new(
            "s".to_string(),
            SubscriberClient::new(mock.clone()),
            move |message: ReceivedMessage, _ctx: CancellationToken| {
                let r = r.clone();
                async move {
                    message.ack();
                    r.fetch_add(1, Ordering::SeqCst);
                }
            },
            Some(ListenerConfig {
                default_error_handler: Some(Arc::new(move |_err: &Error| {
                    d.fetch_add(1, Ordering::SeqCst);
                })),
                ..config()
            }),
        )
        .unwrap();
        listener.start();
        eventually(|| received.load(Ordering::SeqCst) == 1).await;
        assert!(listener.shutdown(None).await);
        assert_eq!(mock.pull_count(), 3);
        // only the permanent error is reported
        assert_eq!(default_errors.load(Ordering::SeqCst), 1);
        assert!(matches!(listener.last_error(), Some(Error::GRPC(status)) if status.code() == pubsub_gax::grpc::Code::PermissionDenied));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_exactly_once_delivery() {
        let mock = Arc::new(MockSubscriber::new().with_session(vec![Ok(StreamingPullResponse {
            subscription_properties: Some(SubscriptionProperties {
                exactly_once_delivery_enabled: true,
                message_ordering_enabled: false,
            }),
            ..response(&[("a", "")])
        })]));
        let results: Arc<Mutex<Vec<AcknowledgeResult>>> = Arc::new(Mutex::new(Vec::new()));
        let r = results.clone();
        let listener = MessageListener::new(
            "s".to_string(),
            SubscriberClient::new(mock.clone()),
            move |message: ReceivedMessage, _ctx: CancellationToken| {
                let r = r.clone();
                async move {
                    let result = message.ack_with_result().await;
                    r.lock().push(result);
                }
            },
            Some(ListenerConfig {
                ack_buffer: crate::ack_buffer::AckBufferConfig {
                    interval: Duration::from_millis(20),
                    ..Default::default()
                },
                ..config()
            }),
        )
        .unwrap();
        assert!(!listener.exactly_once_delivery_enabled());
        listener.start();
        eventually(|| !results.lock().is_empty()).await;
        assert!(listener.exactly_once_delivery_enabled());
        assert!(results.lock()[0].succeeded());
        assert_eq!(mock.modacked_ids(60), vec!["a".to_string()]);
        assert_eq!(mock.acked_ids(), vec!["a".to_string()]);
        assert!(listener.shutdown(None).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_exactly_once_failed_receipt_skips_callback() {
        let mock = Arc::new(
            MockSubscriber::new()
                .with_session(vec![Ok(response(&[("a", "")]))])
                .with_modack_behavior(|_, _| Err(Status::failed_precondition("expired").into())),
        );
        let received = Arc::new(AtomicUsize::new(0));
        let r = received.clone();
        let listener = MessageListener::new(
            "s".to_string(),
            SubscriberClient::new(mock.clone()),
            move |_message: ReceivedMessage, _ctx: CancellationToken| {
                let r = r.clone();
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                }
            },
            Some(ListenerConfig {
                exactly_once_delivery: true,
                ..config()
            }),
        )
        .unwrap();
        listener.start();
        eventually(|| !mock.modacks.lock().is_empty()).await;
        eventually(|| listener.outstanding_messages() == 0).await;
        assert!(listener.shutdown(None).await);
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_stop_nacks_pending_ordered_messages() {
        let mock = Arc::new(MockSubscriber::new().with_session(vec![Ok(response(&[("1", "k"), ("2", "k")]))]));
        let started = Arc::new(AtomicUsize::new(0));
        let s = started.clone();
        let listener = MessageListener::new(
            "s".to_string(),
            SubscriberClient::new(mock.clone()),
            move |_message: ReceivedMessage, ctx: CancellationToken| {
                let s = s.clone();
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                    ctx.cancelled().await;
                }
            },
            Some(ListenerConfig {
                message_ordering: true,
                ..config()
            }),
        )
        .unwrap();
        listener.start();
        eventually(|| started.load(Ordering::SeqCst) == 1).await;
        assert!(listener.shutdown(Some(Duration::from_secs(5))).await);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(mock.modacked_ids(0), vec!["2".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_times_out_before_stop() {
        let mock = Arc::new(MockSubscriber::new());
        let listener = MessageListener::new(
            "s".to_string(),
            SubscriberClient::new(mock.clone()),
            |_message: ReceivedMessage, _ctx: CancellationToken| async {},
            Some(config()),
        )
        .unwrap();
        listener.start();
        assert!(!listener.wait(Some(Duration::from_millis(50))).await);
        listener.stop();
        listener.stop();
        assert!(listener.wait(Some(Duration::from_secs(5))).await);
    }

    #[tokio::test]
    async fn test_config() {
        let handler = |_message: ReceivedMessage, _ctx: CancellationToken| async {};
        let client = SubscriberClient::new(Arc::new(MockSubscriber::new()));
        for deadline in [9, 601] {
            let result = MessageListener::new(
                "s".to_string(),
                client.clone(),
                handler,
                Some(ListenerConfig {
                    deadline,
                    ..Default::default()
                }),
            );
            assert!(matches!(result, Err(Error::InvalidConfig(_))));
        }

        let mut config = ListenerConfig::default();
        config.inventory.max_outstanding_messages = 1001;
        config.inventory.max_outstanding_bytes = 1000;
        let listener = MessageListener::new("s".to_string(), client, handler, Some(config)).unwrap();
        assert_eq!(listener.streams(), 2);
        assert_eq!(listener.deadline(), 60);
        let per_stream = listener.stream_inventory();
        assert_eq!(per_stream.max_outstanding_messages, 501);
        assert_eq!(per_stream.max_outstanding_bytes, 500);
        assert_eq!(per_stream.max_total_lease_duration, Duration::from_secs(3600));
        assert!(!listener.is_stopped());
        assert!(!listener.is_started());
    }
}
