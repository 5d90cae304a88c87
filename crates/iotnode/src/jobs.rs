use std::borrow::Cow;
use std::fmt::{Display, Write};

use tracing::{debug, error, warn};

use crate::job::{JobCallback, JobFuture};
use crate::messenger::Messenger;
use crate::sensor::Sensor;

/// Maximum length, in bytes, of a formatted payload.
pub const PAYLOAD_SIZE: usize = 128;

/// A bounded payload buffer.
pub type Payload = heapless::String<PAYLOAD_SIZE>;

/// How a reading is turned into a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// `label:value`, as posted to a collecting server.
    Labelled,
    /// `{"value":"value"}`, as published on a per-resource topic.
    Json,
}

impl PayloadFormat {
    /// Formats `value` into a [`Payload`].
    ///
    /// Returns `None` when the result exceeds [`PAYLOAD_SIZE`] bytes.
    #[must_use]
    pub fn format(self, label: &str, value: &impl Display) -> Option<Payload> {
        let mut payload = Payload::new();
        let written = match self {
            Self::Labelled => write!(payload, "{label}:{value}"),
            Self::Json => write!(payload, r#"{{"value":"{value}"}}"#),
        };
        written.ok().map(|()| payload)
    }
}

/// A job reading a [`Sensor`] and sending its value through a [`Messenger`].
///
/// A failed read skips the cycle. A failed send is logged and never retried,
/// the next period being the retry.
pub struct PublishJob<S, M> {
    label: Cow<'static, str>,
    destination: Cow<'static, str>,
    format: PayloadFormat,
    sensor: S,
    messenger: M,
}

impl<S, M> PublishJob<S, M>
where
    S: Sensor,
    M: Messenger,
{
    /// Creates a [`PublishJob`].
    ///
    /// `label` names the reading inside the payload, `destination` is the
    /// path or topic handed to the messenger.
    pub fn new(
        label: impl Into<Cow<'static, str>>,
        destination: impl Into<Cow<'static, str>>,
        format: PayloadFormat,
        sensor: S,
        messenger: M,
    ) -> Self {
        Self {
            label: label.into(),
            destination: destination.into(),
            format,
            sensor,
            messenger,
        }
    }

    /// Returns the reading label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Reads the sensor and sends the formatted reading.
    ///
    /// Returns `true` when a payload has been handed to the messenger
    /// successfully.
    pub async fn publish(&mut self) -> bool {
        let reading = match self.sensor.read().await {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Skipping `{}`, sensor read failed: {e}", self.label);
                return false;
            }
        };

        let Some(payload) = self.format.format(&self.label, &reading) else {
            error!(
                "Skipping `{}`, payload longer than {PAYLOAD_SIZE} bytes",
                self.label
            );
            return false;
        };

        debug!("Sending `{payload}` to `{}`", self.destination);

        match self
            .messenger
            .send(&self.destination, payload.as_bytes())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!("Impossible to send `{}`: {e}", self.label);
                false
            }
        }
    }
}

impl<S, M> JobCallback for PublishJob<S, M>
where
    S: Sensor,
    M: Messenger,
{
    fn call(&mut self) -> JobFuture<'_> {
        Box::pin(async move {
            let _ = self.publish().await;
        })
    }
}

/// A job sending a fixed liveness payload.
pub struct Beacon<M> {
    destination: Cow<'static, str>,
    payload: Cow<'static, str>,
    messenger: M,
}

impl<M: Messenger> Beacon<M> {
    /// Creates a [`Beacon`] sending `payload` to `destination`.
    pub fn new(
        destination: impl Into<Cow<'static, str>>,
        payload: impl Into<Cow<'static, str>>,
        messenger: M,
    ) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
            messenger,
        }
    }

    /// Returns the beacon payload.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Sends the beacon once.
    ///
    /// Returns `true` on success.
    pub async fn emit(&self) -> bool {
        debug!("Sending beacon to `{}`", self.destination);
        match self
            .messenger
            .send(&self.destination, self.payload.as_bytes())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!("Impossible to send beacon: {e}");
                false
            }
        }
    }
}

impl<M: Messenger> JobCallback for Beacon<M> {
    fn call(&mut self) -> JobFuture<'_> {
        Box::pin(async move {
            let _ = self.emit().await;
        })
    }
}
