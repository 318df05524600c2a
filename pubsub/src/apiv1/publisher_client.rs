use std::sync::Arc;

use async_trait::async_trait;
use pubsub_gax::grpc::Status;
use pubsub_gax::retry::{invoke, RetrySetting};
use tokio_util::sync::CancellationToken;

use crate::apiv1::{PublishRequest, PublishResponse};

/// Sends publish requests to the server.
#[async_trait]
pub trait PublisherTransport: Send + Sync {
    async fn publish(&self, req: PublishRequest) -> Result<PublishResponse, Status>;
}

#[derive(Clone)]
pub struct PublisherClient {
    transport: Arc<dyn PublisherTransport>,
}

impl std::fmt::Debug for PublisherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherClient").finish_non_exhaustive()
    }
}

impl PublisherClient {
    /// create new publisher client
    pub fn new(transport: Arc<dyn PublisherTransport>) -> PublisherClient {
        PublisherClient { transport }
    }

    /// publish adds one or more messages to the topic. Returns NOT_FOUND if the topic does not exist.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn publish(
        &self,
        req: PublishRequest,
        cancel: Option<CancellationToken>,
        retry: Option<RetrySetting>,
    ) -> Result<PublishResponse, Status> {
        let action = || async { self.transport.publish(req.clone()).await };
        invoke(cancel, retry, action).await
    }
}
