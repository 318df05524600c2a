use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use pubsub_gax::grpc::Status;
use pubsub_gax::retry::TryAs;

use crate::apiv1::{AcknowledgeRequest, ModifyAckDeadlineRequest, StreamingPullRequest, StreamingPullResponse};

pub(crate) fn create_empty_streaming_pull_request() -> StreamingPullRequest {
    StreamingPullRequest {
        subscription: "".to_string(),
        ack_ids: vec![],
        modify_deadline_seconds: vec![],
        modify_deadline_ack_ids: vec![],
        stream_ack_deadline_seconds: 0,
        client_id: "".to_string(),
        max_outstanding_messages: 0,
        max_outstanding_bytes: 0,
    }
}

/// Server responses of one streaming pull.
pub type StreamingPullResponses = Pin<Box<dyn Stream<Item = Result<StreamingPullResponse, Status>> + Send>>;

/// Error of an acknowledge or modify_ack_deadline call.
///
/// With exactly-once delivery the server reports per-ack-id failures in
/// `error_metadata`: values starting with `PERMANENT_FAILURE` will never
/// succeed, anything else may be retried.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{status}")]
pub struct AckError {
    pub status: Status,
    pub error_metadata: HashMap<String, String>,
}

impl AckError {
    pub fn permanent_failures(&self) -> impl Iterator<Item = &String> {
        self.error_metadata
            .iter()
            .filter(|(_, reason)| reason.starts_with("PERMANENT_FAILURE"))
            .map(|(ack_id, _)| ack_id)
    }

    pub fn temporary_failures(&self) -> impl Iterator<Item = &String> {
        self.error_metadata
            .iter()
            .filter(|(_, reason)| !reason.starts_with("PERMANENT_FAILURE"))
            .map(|(ack_id, _)| ack_id)
    }
}

impl From<Status> for AckError {
    fn from(status: Status) -> Self {
        Self {
            status,
            error_metadata: HashMap::new(),
        }
    }
}

impl TryAs<Status> for AckError {
    fn try_as(&self) -> Option<&Status> {
        Some(&self.status)
    }
}

/// Streaming pull and acknowledgement calls to the server.
#[async_trait]
pub trait SubscriberTransport: Send + Sync {
    /// Opens a bidirectional stream. `initial` is sent first, then every
    /// request received from `requests` until that channel closes.
    async fn streaming_pull(
        &self,
        initial: StreamingPullRequest,
        requests: async_channel::Receiver<StreamingPullRequest>,
    ) -> Result<StreamingPullResponses, Status>;

    async fn acknowledge(&self, req: AcknowledgeRequest) -> Result<(), AckError>;

    async fn modify_ack_deadline(&self, req: ModifyAckDeadlineRequest) -> Result<(), AckError>;
}

#[derive(Clone)]
pub struct SubscriberClient {
    transport: Arc<dyn SubscriberTransport>,
}

impl std::fmt::Debug for SubscriberClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberClient").finish_non_exhaustive()
    }
}

impl SubscriberClient {
    /// create new Subscriber client
    pub fn new(transport: Arc<dyn SubscriberTransport>) -> SubscriberClient {
        SubscriberClient { transport }
    }

    /// streaming_pull establishes a stream with the server, which sends messages down to the
    /// client. The client streams acknowledgements and ack deadline modifications
    /// back to the server.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn streaming_pull(
        &self,
        initial: StreamingPullRequest,
        requests: async_channel::Receiver<StreamingPullRequest>,
    ) -> Result<StreamingPullResponses, Status> {
        self.transport.streaming_pull(initial, requests).await
    }

    /// acknowledge acknowledges the messages associated with the ack_ids.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn acknowledge(&self, req: AcknowledgeRequest) -> Result<(), AckError> {
        self.transport.acknowledge(req).await
    }

    /// modify_ack_deadline modifies the ack deadline for a specific message. A deadline of 0
    /// makes the message immediately available for redelivery.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn modify_ack_deadline(&self, req: ModifyAckDeadlineRequest) -> Result<(), AckError> {
        self.transport.modify_ack_deadline(req).await
    }
}
