use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::apiv1::publisher_client::{PublisherClient, PublisherTransport};
use crate::apiv1::subscriber_client::{SubscriberClient, SubscriberTransport};
use crate::error::Error;
use crate::listener::{ErrorHandler, ListenerConfig, MessageListener};
use crate::publisher::{Publisher, PublisherConfig};
use crate::subscriber::ReceivedMessage;

pub struct ClientConfig {
    pub project_id: String,
    /// Error handler of every listener created by the client that has no
    /// handler of its own.
    pub on_error: Option<ErrorHandler>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            project_id: "local-project".to_string(),
            on_error: None,
        }
    }
}

/// Client is a Pub/Sub client scoped to a single project.
///
/// Clients should be reused rather than being created as needed.
/// A Client may be shared by multiple tasks.
#[derive(Clone)]
pub struct Client {
    project_id: String,
    pubc: PublisherClient,
    subc: SubscriberClient,
    on_error: Option<ErrorHandler>,
}

impl Client {
    /// new creates a client that talks to the server through the given transports.
    pub fn new(
        config: ClientConfig,
        publisher: Arc<dyn PublisherTransport>,
        subscriber: Arc<dyn SubscriberTransport>,
    ) -> Self {
        Self {
            project_id: config.project_id,
            pubc: PublisherClient::new(publisher),
            subc: SubscriberClient::new(subscriber),
            on_error: config.on_error,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// publisher creates a publisher for the topic. `topic_id` may also be a fully qualified name.
    pub fn publisher(&self, topic_id: &str, config: Option<PublisherConfig>) -> Result<Publisher, Error> {
        Publisher::new(self.fully_qualified_topic_name(topic_id), self.pubc.clone(), config)
    }

    /// listener creates a listener calling `f` for every message of the subscription.
    /// `subscription_id` may also be a fully qualified name.
    ///
    /// The listener does not receive anything until it is started.
    pub fn listener<F>(
        &self,
        subscription_id: &str,
        f: impl Fn(ReceivedMessage, CancellationToken) -> F + Send + Sync + 'static,
        config: Option<ListenerConfig>,
    ) -> Result<MessageListener, Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut config = config.unwrap_or_default();
        if config.default_error_handler.is_none() {
            config.default_error_handler = self.on_error.clone();
        }
        MessageListener::new(
            self.fully_qualified_subscription_name(subscription_id),
            self.subc.clone(),
            f,
            Some(config),
        )
    }

    pub fn fully_qualified_topic_name(&self, id: &str) -> String {
        if id.contains('/') {
            id.to_string()
        } else {
            format!("projects/{}/topics/{}", self.project_id, id)
        }
    }

    pub fn fully_qualified_subscription_name(&self, id: &str) -> String {
        if id.contains('/') {
            id.to_string()
        } else {
            format!("projects/{}/subscriptions/{}", self.project_id, id)
        }
    }
}
