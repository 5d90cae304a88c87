use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

/// A client able to deliver a payload to a destination.
///
/// The destination is a resource path for request/response protocols, or a
/// topic for publish/subscribe protocols. Responses are never inspected.
pub trait Messenger: Send + Sync {
    /// The error produced when a payload cannot be delivered.
    type Error: Display + Send;

    /// Sends `payload` to `destination`.
    fn send(
        &self,
        destination: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

impl<M: Messenger> Messenger for Arc<M> {
    type Error = M::Error;

    fn send(
        &self,
        destination: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.as_ref().send(destination, payload)
    }
}
