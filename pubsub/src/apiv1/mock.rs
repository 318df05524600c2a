use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pubsub_gax::grpc::Status;

use crate::apiv1::publisher_client::PublisherTransport;
use crate::apiv1::subscriber_client::{AckError, StreamingPullResponses, SubscriberTransport};
use crate::apiv1::{
    AcknowledgeRequest, ModifyAckDeadlineRequest, PublishRequest, PublishResponse, StreamingPullRequest,
    StreamingPullResponse,
};

type PublishBehavior = Box<dyn Fn(usize) -> Option<Status> + Send + Sync>;

/// Assigns sequential message ids; `behavior` may fail the n-th call.
pub(crate) struct MockPublisher {
    behavior: PublishBehavior,
    calls: AtomicUsize,
    next_id: AtomicUsize,
    requests: Mutex<Vec<PublishRequest>>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::failing(|_| None)
    }

    pub fn failing(behavior: impl Fn(usize) -> Option<Status> + Send + Sync + 'static) -> Self {
        Self {
            behavior: Box::new(behavior),
            calls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<PublishRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublisherTransport for MockPublisher {
    async fn publish(&self, req: PublishRequest) -> Result<PublishResponse, Status> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(req.clone());
        if let Some(status) = (self.behavior)(n) {
            return Err(status);
        }
        let message_ids = req
            .messages
            .iter()
            .map(|_| format!("id-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
            .collect();
        Ok(PublishResponse { message_ids })
    }
}

type AckBehavior = Box<dyn Fn(usize, &[String]) -> Result<(), AckError> + Send + Sync>;

/// Replays scripted streaming pull sessions and records every request.
///
/// Each `streaming_pull` call takes the next script. After the script is
/// exhausted the stream stays open until the client closes its request channel.
/// A script ending with an error closes the stream after it.
pub(crate) struct MockSubscriber {
    sessions: Mutex<VecDeque<Vec<Result<StreamingPullResponse, Status>>>>,
    pub initial_requests: Mutex<Vec<StreamingPullRequest>>,
    pub stream_requests: Arc<Mutex<Vec<StreamingPullRequest>>>,
    pub acks: Mutex<Vec<AcknowledgeRequest>>,
    pub modacks: Mutex<Vec<ModifyAckDeadlineRequest>>,
    ack_calls: AtomicUsize,
    modack_calls: AtomicUsize,
    ack_behavior: Option<AckBehavior>,
    modack_behavior: Option<AckBehavior>,
}

impl MockSubscriber {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(VecDeque::new()),
            initial_requests: Mutex::new(Vec::new()),
            stream_requests: Arc::new(Mutex::new(Vec::new())),
            acks: Mutex::new(Vec::new()),
            modacks: Mutex::new(Vec::new()),
            ack_calls: AtomicUsize::new(0),
            modack_calls: AtomicUsize::new(0),
            ack_behavior: None,
            modack_behavior: None,
        }
    }

    pub fn with_session(self, responses: Vec<Result<StreamingPullResponse, Status>>) -> Self {
        self.sessions.lock().push_back(responses);
        self
    }

    pub fn with_ack_behavior(
        mut self,
        behavior: impl Fn(usize, &[String]) -> Result<(), AckError> + Send + Sync + 'static,
    ) -> Self {
        self.ack_behavior = Some(Box::new(behavior));
        self
    }

    pub fn with_modack_behavior(
        mut self,
        behavior: impl Fn(usize, &[String]) -> Result<(), AckError> + Send + Sync + 'static,
    ) -> Self {
        self.modack_behavior = Some(Box::new(behavior));
        self
    }

    pub fn acked_ids(&self) -> Vec<String> {
        self.acks.lock().iter().flat_map(|r| r.ack_ids.clone()).collect()
    }

    /// Ack ids of modify_ack_deadline calls with the given deadline.
    pub fn modacked_ids(&self, deadline: i32) -> Vec<String> {
        self.modacks
            .lock()
            .iter()
            .filter(|r| r.ack_deadline_seconds == deadline)
            .flat_map(|r| r.ack_ids.clone())
            .collect()
    }

    pub fn pull_count(&self) -> usize {
        self.initial_requests.lock().len()
    }
}

#[async_trait]
impl SubscriberTransport for MockSubscriber {
    async fn streaming_pull(
        &self,
        initial: StreamingPullRequest,
        requests: async_channel::Receiver<StreamingPullRequest>,
    ) -> Result<StreamingPullResponses, Status> {
        self.initial_requests.lock().push(initial);
        let script = self.sessions.lock().pop_front().unwrap_or_default();
        let (sender, receiver) = async_channel::unbounded();
        let recorded = self.stream_requests.clone();
        tokio::spawn(async move {
            let mut failed = false;
            for response in script {
                failed = response.is_err();
                if sender.send(response).await.is_err() || failed {
                    break;
                }
            }
            if !failed {
                while let Ok(req) = requests.recv().await {
                    recorded.lock().push(req);
                }
            }
        });
        Ok(Box::pin(receiver))
    }

    async fn acknowledge(&self, req: AcknowledgeRequest) -> Result<(), AckError> {
        let n = self.ack_calls.fetch_add(1, Ordering::SeqCst);
        self.acks.lock().push(req.clone());
        match &self.ack_behavior {
            Some(behavior) => behavior(n, &req.ack_ids),
            None => Ok(()),
        }
    }

    async fn modify_ack_deadline(&self, req: ModifyAckDeadlineRequest) -> Result<(), AckError> {
        let n = self.modack_calls.fetch_add(1, Ordering::SeqCst);
        self.modacks.lock().push(req.clone());
        match &self.modack_behavior {
            Some(behavior) => behavior(n, &req.ack_ids),
            None => Ok(()),
        }
    }
}
