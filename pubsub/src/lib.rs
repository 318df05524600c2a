//! # pubsub-async
//!
//! Asynchronous publish/subscribe core of a Pub/Sub client.
//!
//! * [`publisher::Publisher`] batches messages per ordering key and publishes them in the background,
//!   with optional flow control.
//! * [`listener::MessageListener`] receives messages over streaming pulls, leases them while
//!   the handler runs, and buffers acknowledgements.
//!
//! The transport is injected through [`apiv1::publisher_client::PublisherTransport`] and
//! [`apiv1::subscriber_client::SubscriberTransport`].
//!
//! ## Quick Start
//!
//! ### Publish Message
//!
//! ```
//! use std::sync::Arc;
//!
//! use pubsub_async::apiv1::publisher_client::PublisherTransport;
//! use pubsub_async::apiv1::subscriber_client::SubscriberTransport;
//! use pubsub_async::apiv1::PubsubMessage;
//! use pubsub_async::client::{Client, ClientConfig};
//! use pubsub_async::error::Error;
//! use tokio::task::JoinHandle;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run(publisher: Arc<dyn PublisherTransport>, subscriber: Arc<dyn SubscriberTransport>) -> Result<(), Error> {
//!     // Create pubsub client.
//!     let client = Client::new(ClientConfig::default(), publisher, subscriber);
//!
//!     // Token for cancel.
//!     let ctx = CancellationToken::new();
//!
//!     // Start publisher.
//!     let publisher = client.publisher("test-topic", None)?;
//!
//!     // Publish message.
//!     let tasks: Vec<JoinHandle<Result<String, Error>>> = (0..10)
//!         .map(|_i| {
//!             let publisher = publisher.clone();
//!             let ctx = ctx.clone();
//!             tokio::spawn(async move {
//!                 let msg = PubsubMessage::new("abc");
//!                 // Set ordering_key if needed, after enabling message ordering.
//!                 // let msg = msg.with_ordering_key("order");
//!
//!                 let awaiter = publisher.publish(msg).await?;
//!                 // The get method blocks until a server-generated ID or an error is returned for the published message.
//!                 awaiter.get(ctx).await
//!             })
//!         })
//!         .collect();
//!
//!     // Wait for all publish task finish
//!     for task in tasks {
//!         let _message_id = task.await.unwrap()?;
//!     }
//!
//!     // Wait for the publisher to finish.
//!     publisher.shutdown(None).await;
//!     Ok(())
//! }
//! ```
//!
//! ### Subscribe Message
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use pubsub_async::apiv1::publisher_client::PublisherTransport;
//! use pubsub_async::apiv1::subscriber_client::SubscriberTransport;
//! use pubsub_async::client::{Client, ClientConfig};
//! use pubsub_async::error::Error;
//! use pubsub_async::listener::ListenerConfig;
//!
//! async fn run(publisher: Arc<dyn PublisherTransport>, subscriber: Arc<dyn SubscriberTransport>) -> Result<(), Error> {
//!     let client = Client::new(ClientConfig::default(), publisher, subscriber);
//!
//!     // Configure listener.
//!     let config = ListenerConfig {
//!         // Deliver messages with the same ordering key one at a time.
//!         message_ordering: true,
//!         ..Default::default()
//!     };
//!
//!     let listener = client.listener("test-subscription", |message, _ctx| async move {
//!         // Handle data.
//!         println!("{:?}", message.message.data);
//!
//!         // Ack or Nack message.
//!         message.ack();
//!     }, Some(config))?;
//!     listener.on_error(|err| println!("{err}"));
//!     listener.start();
//!
//!     tokio::time::sleep(Duration::from_secs(10)).await;
//!
//!     // Stop receiving and wait until the acknowledgements are sent.
//!     listener.shutdown(None).await;
//!     Ok(())
//! }
//! ```
pub mod apiv1;
pub mod client;
pub mod error;
pub mod flow_controller;
pub mod listener;
pub mod publisher;
pub mod subscriber;

pub(crate) mod ack_buffer;
pub(crate) mod batch;
pub(crate) mod executor;
pub(crate) mod inventory;
pub(crate) mod sequencer;
pub(crate) mod stream;

pub use ack_buffer::AckBufferConfig;
