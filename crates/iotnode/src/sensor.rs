use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

/// A source of physical readings.
///
/// A read failure is reported through [`Sensor::Error`]: publishing jobs skip
/// the current cycle instead of sending a stale value.
pub trait Sensor: Send {
    /// The value produced by a successful read.
    type Reading: Display + Send;
    /// The error produced by a failed read.
    type Error: Display + Send;

    /// Reads the current value.
    fn read(&mut self) -> impl Future<Output = Result<Self::Reading, Self::Error>> + Send;
}

// A sensor shared between a publishing job and a resource handler.
impl<S: Sensor> Sensor for Arc<Mutex<S>> {
    type Reading = S::Reading;
    type Error = S::Error;

    fn read(&mut self) -> impl Future<Output = Result<Self::Reading, Self::Error>> + Send {
        async move { self.lock().await.read().await }
    }
}
