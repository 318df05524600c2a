#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use pubsub_async::apiv1::publisher_client::PublisherTransport;
use pubsub_async::apiv1::subscriber_client::{AckError, StreamingPullResponses, SubscriberTransport};
use pubsub_async::apiv1::{
    AcknowledgeRequest, ModifyAckDeadlineRequest, PublishRequest, PublishResponse, PubsubMessage, ReceivedMessage,
    StreamingPullRequest, StreamingPullResponse,
};
use pubsub_async::client::{Client, ClientConfig};
use pubsub_gax::grpc::Status;
use tokio::sync::Notify;

#[derive(Clone)]
struct Delivery {
    message: PubsubMessage,
    attempt: i32,
}

#[derive(Default)]
struct State {
    next_id: AtomicUsize,
    available: Mutex<VecDeque<Delivery>>,
    leased: Mutex<HashMap<String, Delivery>>,
    published: Mutex<Vec<PubsubMessage>>,
    acked: Mutex<Vec<String>>,
    publish_error: Mutex<Option<Status>>,
    notify: Notify,
}

/// An in-memory topic with a single subscription.
///
/// Published messages are delivered to whichever stream pulls first. A nack
/// (modify_ack_deadline of 0) makes the message available again.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<State>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> Client {
        Client::new(
            ClientConfig {
                project_id: "local-project".to_string(),
                on_error: None,
            },
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    pub fn fail_publish(&self, status: Option<Status>) {
        *self.state.publish_error.lock() = status;
    }

    pub fn published(&self) -> Vec<PubsubMessage> {
        self.state.published.lock().clone()
    }

    pub fn acked(&self) -> Vec<String> {
        self.state.acked.lock().clone()
    }
}

impl State {
    fn take_available(&self, max: usize) -> Vec<ReceivedMessage> {
        let mut available = self.available.lock();
        let mut leased = self.leased.lock();
        let mut received = Vec::new();
        while received.len() < max {
            let Some(mut delivery) = available.pop_front() else {
                break;
            };
            delivery.attempt += 1;
            let ack_id = format!("{}-{}", delivery.message.message_id, delivery.attempt);
            received.push(ReceivedMessage {
                ack_id: ack_id.clone(),
                message: Some(delivery.message.clone()),
                delivery_attempt: delivery.attempt,
            });
            leased.insert(ack_id, delivery);
        }
        received
    }
}

#[async_trait]
impl PublisherTransport for FakeServer {
    async fn publish(&self, req: PublishRequest) -> Result<PublishResponse, Status> {
        let state = &self.state;
        if let Some(status) = state.publish_error.lock().clone() {
            return Err(status);
        }
        let mut message_ids = Vec::with_capacity(req.messages.len());
        for mut message in req.messages {
            message.message_id = format!("m{}", state.next_id.fetch_add(1, Ordering::SeqCst));
            message.publish_time = Some(SystemTime::now());
            message_ids.push(message.message_id.clone());
            state.published.lock().push(message.clone());
            state.available.lock().push_back(Delivery { message, attempt: 0 });
        }
        state.notify.notify_waiters();
        Ok(PublishResponse { message_ids })
    }
}

#[async_trait]
impl SubscriberTransport for FakeServer {
    async fn streaming_pull(
        &self,
        initial: StreamingPullRequest,
        requests: async_channel::Receiver<StreamingPullRequest>,
    ) -> Result<StreamingPullResponses, Status> {
        let max = if initial.max_outstanding_messages > 0 {
            initial.max_outstanding_messages as usize
        } else {
            100
        };
        let (sender, receiver) = async_channel::unbounded();
        let this = self.state.clone();
        tokio::spawn(async move {
            loop {
                let received = this.take_available(max);
                if !received.is_empty() {
                    let response = StreamingPullResponse {
                        received_messages: received,
                        subscription_properties: None,
                    };
                    if sender.send(Ok(response)).await.is_err() {
                        break;
                    }
                }
                tokio::select! {
                    request = requests.recv() => if request.is_err() { break },
                    _ = this.notify.notified() => {},
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {},
                }
            }
        });
        Ok(Box::pin(receiver))
    }

    async fn acknowledge(&self, req: AcknowledgeRequest) -> Result<(), AckError> {
        let mut leased = self.state.leased.lock();
        for ack_id in req.ack_ids {
            leased.remove(&ack_id);
            self.state.acked.lock().push(ack_id);
        }
        Ok(())
    }

    async fn modify_ack_deadline(&self, req: ModifyAckDeadlineRequest) -> Result<(), AckError> {
        if req.ack_deadline_seconds > 0 {
            return Ok(());
        }
        let nacked: Vec<Delivery> = {
            let mut leased = self.state.leased.lock();
            req.ack_ids.iter().filter_map(|ack_id| leased.remove(ack_id)).collect()
        };
        self.state.available.lock().extend(nacked);
        self.state.notify.notify_waiters();
        Ok(())
    }
}

pub async fn eventually(f: impl Fn() -> bool) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met");
}
