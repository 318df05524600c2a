use pubsub_gax::grpc::Status;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("can't publish when publisher is stopping")]
    AsyncPublisherStopped,
    #[error("message ordering has not been enabled")]
    OrderedMessagesDisabled,
    #[error("can't publish message using ordering key {0}, call resume_publish first")]
    OrderingKey(String),
    #[error("flow control limit exceeded: {0}")]
    FlowControlLimit(String),
    #[error("flow control released more than was acquired: {0}")]
    FlowControlRelease(String),
    #[error("ordered message delivered out of order: ordering_key={ordering_key}, ack_id={ack_id}")]
    OrderedMessageDelivery { ordering_key: String, ack_id: String },
    #[error("message handler panicked: message_id={0}")]
    HandlerPanicked(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    GRPC(#[from] Status),
}
