//! Transport seam: request/response types and thin clients over an injected transport.
use std::collections::HashMap;
use std::time::SystemTime;

pub mod publisher_client;
pub mod subscriber_client;

#[cfg(test)]
pub(crate) mod mock;

/// A message as carried on the wire.
///
/// `message_id` and `publish_time` are assigned by the server and are only
/// populated on received messages or after a successful publish.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PubsubMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub message_id: String,
    pub publish_time: Option<SystemTime>,
    pub ordering_key: String,
}

impl PubsubMessage {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_ordering_key(mut self, ordering_key: impl Into<String>) -> Self {
        self.ordering_key = ordering_key.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Serialized size of the message in protobuf encoding.
    pub fn encoded_len(&self) -> usize {
        let attributes: usize = self
            .attributes
            .iter()
            .map(|(k, v)| nested_len(bytes_field_len(k.len()) + bytes_field_len(v.len())))
            .sum();
        let publish_time = match self.publish_time.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok()) {
            Some(d) => {
                let mut inner = 0;
                if d.as_secs() > 0 {
                    inner += 1 + varint_len(d.as_secs());
                }
                if d.subsec_nanos() > 0 {
                    inner += 1 + varint_len(d.subsec_nanos() as u64);
                }
                nested_len(inner)
            }
            None => 0,
        };
        bytes_field_len(self.data.len())
            + attributes
            + bytes_field_len(self.message_id.len())
            + publish_time
            + bytes_field_len(self.ordering_key.len())
    }
}

/// A message delivered by a streaming pull, before it is bound to a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: Option<PubsubMessage>,
    pub delivery_attempt: i32,
}

impl ReceivedMessage {
    pub fn encoded_len(&self) -> usize {
        let message = self.message.as_ref().map(|m| nested_len(m.encoded_len())).unwrap_or(0);
        let attempt = if self.delivery_attempt > 0 {
            1 + varint_len(self.delivery_attempt as u64)
        } else {
            0
        };
        bytes_field_len(self.ack_id.len()) + message + attempt
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub messages: Vec<PubsubMessage>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishResponse {
    pub message_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamingPullRequest {
    pub subscription: String,
    pub ack_ids: Vec<String>,
    pub modify_deadline_seconds: Vec<i32>,
    pub modify_deadline_ack_ids: Vec<String>,
    pub stream_ack_deadline_seconds: i32,
    pub client_id: String,
    pub max_outstanding_messages: i64,
    pub max_outstanding_bytes: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionProperties {
    pub exactly_once_delivery_enabled: bool,
    pub message_ordering_enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamingPullResponse {
    pub received_messages: Vec<ReceivedMessage>,
    pub subscription_properties: Option<SubscriptionProperties>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AcknowledgeRequest {
    pub subscription: String,
    pub ack_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModifyAckDeadlineRequest {
    pub subscription: String,
    pub ack_ids: Vec<String>,
    pub ack_deadline_seconds: i32,
}

fn varint_len(mut v: u64) -> usize {
    let mut len = 1;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

fn bytes_field_len(len: usize) -> usize {
    if len == 0 {
        0
    } else {
        nested_len(len)
    }
}

fn nested_len(len: usize) -> usize {
    1 + varint_len(len as u64) + len
}
