//! Shared gRPC status types and the retry loop used by the pubsub-async crates.

pub mod retry;

/// Status and status code of a transport call.
pub mod grpc {
    pub use tonic::{Code, Status};
}
