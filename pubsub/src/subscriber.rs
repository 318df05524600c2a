use std::sync::Weak;

use pubsub_gax::grpc::{Code, Status};
use tokio::sync::oneshot;

use crate::apiv1::{self, PubsubMessage};
use crate::stream::StreamInner;

/// Status of an acknowledgement under exactly-once delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcknowledgeStatus {
    Success,
    PermissionDenied,
    FailedPrecondition,
    InvalidAckId,
    Other,
}

/// The outcome of an ack, nack or modify_ack_deadline.
#[derive(Clone, Debug)]
pub struct AcknowledgeResult {
    status: AcknowledgeStatus,
    error: Option<Status>,
}

impl AcknowledgeResult {
    pub(crate) fn success() -> Self {
        Self {
            status: AcknowledgeStatus::Success,
            error: None,
        }
    }

    pub(crate) fn from_error(error: Status) -> Self {
        let status = match error.code() {
            Code::PermissionDenied => AcknowledgeStatus::PermissionDenied,
            Code::FailedPrecondition => AcknowledgeStatus::FailedPrecondition,
            Code::InvalidArgument => AcknowledgeStatus::InvalidAckId,
            _ => AcknowledgeStatus::Other,
        };
        Self {
            status,
            error: Some(error),
        }
    }

    pub fn status(&self) -> AcknowledgeStatus {
        self.status
    }

    pub fn error(&self) -> Option<&Status> {
        self.error.as_ref()
    }

    pub fn succeeded(&self) -> bool {
        self.status == AcknowledgeStatus::Success
    }

    pub fn failed(&self) -> bool {
        !self.succeeded()
    }
}

/// A message delivered to the message handler.
///
/// Acknowledgements are buffered and sent in the background. The `*_with_result`
/// variants wait for the server's answer, which is only meaningful when the
/// subscription has exactly-once delivery enabled.
#[derive(Clone)]
pub struct ReceivedMessage {
    pub message: PubsubMessage,
    ack_id: String,
    delivery_attempt: Option<usize>,
    size: usize,
    stream: Weak<StreamInner>,
}

impl std::fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("message", &self.message)
            .field("ack_id", &self.ack_id)
            .field("delivery_attempt", &self.delivery_attempt)
            .finish()
    }
}

impl ReceivedMessage {
    pub(crate) fn new(received: apiv1::ReceivedMessage, stream: Weak<StreamInner>) -> Self {
        let size = received.encoded_len();
        Self {
            message: received.message.unwrap_or_default(),
            ack_id: received.ack_id,
            delivery_attempt: if received.delivery_attempt > 0 {
                Some(received.delivery_attempt as usize)
            } else {
                None
            },
            size,
            stream,
        }
    }

    pub fn ack_id(&self) -> &str {
        self.ack_id.as_str()
    }

    /// The approximate number of times delivery was attempted. Only set when a
    /// dead letter policy is configured on the subscription.
    pub fn delivery_attempt(&self) -> Option<usize> {
        self.delivery_attempt
    }

    pub fn ordering_key(&self) -> &str {
        self.message.ordering_key.as_str()
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Acknowledges the message so it is not redelivered.
    pub fn ack(&self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.acknowledge(&self.ack_id, None);
        }
    }

    pub async fn ack_with_result(&self) -> AcknowledgeResult {
        let (sender, receiver) = oneshot::channel();
        match self.stream.upgrade() {
            Some(stream) => stream.acknowledge(&self.ack_id, Some(sender)),
            None => return stream_closed(),
        }
        receiver.await.unwrap_or_else(|_| stream_closed())
    }

    /// Makes the message available for redelivery immediately.
    pub fn nack(&self) {
        self.modify_ack_deadline(0)
    }

    pub async fn nack_with_result(&self) -> AcknowledgeResult {
        self.modify_ack_deadline_with_result(0).await
    }

    /// Sets the deadline of this message to `seconds` from now and stops leasing it.
    pub fn modify_ack_deadline(&self, seconds: i32) {
        if let Some(stream) = self.stream.upgrade() {
            stream.modify_ack_deadline(&self.ack_id, seconds, None);
        }
    }

    pub async fn modify_ack_deadline_with_result(&self, seconds: i32) -> AcknowledgeResult {
        let (sender, receiver) = oneshot::channel();
        match self.stream.upgrade() {
            Some(stream) => stream.modify_ack_deadline(&self.ack_id, seconds, Some(sender)),
            None => return stream_closed(),
        }
        receiver.await.unwrap_or_else(|_| stream_closed())
    }
}

fn stream_closed() -> AcknowledgeResult {
    AcknowledgeResult::from_error(Status::cancelled("stream closed"))
}
