use std::time::Duration;

use serde::Serialize;

use sha2::{Digest, Sha256};

use tracing::{info, warn};

use iotnode::Messenger;

use crate::error::{Error, ErrorKind, Result};

/// Topic on which nodes announce themselves and send their beacons.
pub const CHECK_TOPIC: &str = "node/check";

/// `CoAP` resource receiving liveness beacons.
pub const ALIVE_PATH: &str = "/alive";

/// `CoAP` resource receiving sensor readings.
pub const SERVER_PATH: &str = "/server";

/// Gateway request asking the node to publish its resources again.
pub const DISCOVER: &str = "discover";

/// Gateway request switching the node LED.
pub const LED_SET: &str = "led/set";

/// Default period of the liveness beacon.
pub const BEACON_PERIOD: Duration = Duration::from_secs(30);

// Pause between two announcement steps, leaving the broker time to create
// the node topics.
const ANNOUNCE_PAUSE: Duration = Duration::from_secs(1);

// Resources published by every node during the announcement.
const COMMON_RESOURCES: [&str; 4] = ["board", "mcu", "os", "name"];

/// Geographic position of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lng: f64,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            lat: 48.714_784,
            lng: 2.205_502,
        }
    }
}

/// A request received from the gateway on a `gateway/<id>/...` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayRequest {
    /// Publish the resource list, or the resource values.
    Discover,
    /// Switch the LED.
    SetLed,
}

/// Identity and description of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    /// Application name.
    pub name: String,
    /// Node identifier, used in topic names.
    pub id: String,
    /// Unique identifier used by liveness beacons.
    pub uid: [u8; 8],
    /// Board name.
    pub board: String,
    /// Microcontroller or CPU architecture.
    pub mcu: String,
    /// Operating system.
    pub os: String,
    /// Node position.
    pub position: Position,
    /// Firmware version.
    pub version: String,
    /// Firmware application identifier.
    pub app_id: String,
}

impl NodeInfo {
    /// Creates a [`NodeInfo`] for the host running the node.
    ///
    /// The unique identifier is made of the first eight bytes of the
    /// `SHA-256` digest of `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();

        let digest = Sha256::digest(id.as_bytes());
        let mut uid = [0; 8];
        uid.copy_from_slice(&digest[..8]);

        Self {
            name: "Node".into(),
            uid,
            id,
            board: "native".into(),
            mcu: std::env::consts::ARCH.into(),
            os: std::env::consts::OS.into(),
            position: Position::default(),
            version: env!("CARGO_PKG_VERSION").into(),
            app_id: "0".into(),
        }
    }

    /// Sets the application name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the board name.
    #[must_use]
    pub fn board(mut self, board: impl Into<String>) -> Self {
        self.board = board.into();
        self
    }

    /// Sets the node position.
    #[must_use]
    pub const fn position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    /// Sets the firmware application identifier.
    #[must_use]
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Returns the unique identifier as uppercase hexadecimal digits.
    #[must_use]
    pub fn uid_hex(&self) -> String {
        self.uid.iter().map(|byte| format!("{byte:02X}")).collect()
    }

    /// Returns the `MQTT` topic of `resource` for this node.
    #[must_use]
    pub fn topic(&self, resource: &str) -> String {
        format!("node/{}/{resource}", self.id)
    }

    /// Returns the topic on which the gateway sends `request` to this node.
    #[must_use]
    pub fn gateway_topic(&self, request: &str) -> String {
        format!("gateway/{}/{request}", self.id)
    }

    /// Returns the gateway topics this node subscribes to.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        [DISCOVER, LED_SET]
            .map(|request| self.gateway_topic(request))
            .into()
    }

    /// Returns the gateway request carried by `topic`, if it is addressed
    /// to this node.
    #[must_use]
    pub fn gateway_request(&self, topic: &str) -> Option<GatewayRequest> {
        let request = topic
            .strip_prefix("gateway/")?
            .strip_prefix(self.id.as_str())?
            .strip_prefix('/')?;

        match request {
            DISCOVER => Some(GatewayRequest::Discover),
            LED_SET => Some(GatewayRequest::SetLed),
            _ => None,
        }
    }

    /// Returns the `CoAP` payload announcing a node reboot.
    #[must_use]
    pub fn reset_payload(&self) -> String {
        format!("reset:{}", self.uid_hex())
    }

    /// Returns the `CoAP` liveness beacon payload.
    #[must_use]
    pub fn alive_payload(&self) -> String {
        format!("alive:{}", self.uid_hex())
    }

    /// Returns the `MQTT` check payload, used both to announce the node and
    /// as its liveness beacon.
    ///
    /// # Errors
    ///
    /// Fails when the payload cannot be serialized.
    pub fn check_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(&serde_json::json!({ "id": self.id }))?)
    }

    fn common_resource(&self, resource: &str) -> &str {
        match resource {
            "board" => &self.board,
            "mcu" => &self.mcu,
            "os" => &self.os,
            _ => &self.name,
        }
    }
}

fn value_payload(value: &str) -> Result<String> {
    Ok(serde_json::to_string(&serde_json::json!({ "value": value }))?)
}

async fn deliver<M: Messenger>(messenger: &M, destination: &str, payload: &str) -> Result<()> {
    messenger
        .send(destination, payload.as_bytes())
        .await
        .map_err(|e| {
            Error::new(
                ErrorKind::Send,
                format!("Impossible to send on `{destination}`: {e}"),
            )
        })
}

/// Notifies the server that the node has just rebooted.
///
/// # Errors
///
/// Fails when the payload cannot be delivered.
pub async fn send_reset<M: Messenger>(messenger: &M, info: &NodeInfo) -> Result<()> {
    deliver(messenger, ALIVE_PATH, &info.reset_payload()).await
}

async fn publish_resources<M: Messenger>(
    messenger: &M,
    info: &NodeInfo,
    readings: &[(&str, String)],
) -> Result<usize> {
    let resources = COMMON_RESOURCES
        .iter()
        .copied()
        .chain(readings.iter().map(|(name, _)| *name))
        .collect::<Vec<_>>();
    deliver(
        messenger,
        &info.topic("resources"),
        &serde_json::to_string(&resources)?,
    )
    .await?;

    Ok(resources.len())
}

async fn publish_values<M: Messenger>(
    messenger: &M,
    info: &NodeInfo,
    readings: &[(&str, String)],
) -> Result<()> {
    let values = COMMON_RESOURCES
        .iter()
        .map(|resource| (*resource, info.common_resource(resource)))
        .chain(readings.iter().map(|(name, value)| (*name, value.as_str())));

    for (resource, value) in values {
        if let Err(e) = deliver(messenger, &info.topic(resource), &value_payload(value)?).await {
            warn!("Skipping resource `{resource}`: {e}");
        }
    }

    Ok(())
}

/// Announces a node to an `MQTT` broker.
///
/// The node identifier is published on [`CHECK_TOPIC`], then the list of
/// resources on `node/<id>/resources`, and finally the value of each
/// resource on its own topic. `readings` contains the names and current
/// values of the node-specific resources, which follow the common ones.
///
/// A resource value which cannot be delivered is skipped.
///
/// # Errors
///
/// Fails when either the identifier or the resource list cannot be
/// delivered.
pub async fn announce<M: Messenger>(
    messenger: &M,
    info: &NodeInfo,
    readings: &[(&str, String)],
) -> Result<()> {
    deliver(messenger, CHECK_TOPIC, &info.check_payload()?).await?;

    tokio::time::sleep(ANNOUNCE_PAUSE).await;

    let count = publish_resources(messenger, info, readings).await?;

    tokio::time::sleep(ANNOUNCE_PAUSE).await;

    publish_values(messenger, info, readings).await?;

    info!("Node `{}` announced with {count} resources", info.id);

    Ok(())
}

/// Answers a gateway discovery request.
///
/// A `resources` request publishes the resource list, any other request
/// publishes the value of every resource, as [`announce`] does.
///
/// # Errors
///
/// Fails when the resource list cannot be delivered.
pub async fn discover<M: Messenger>(
    messenger: &M,
    info: &NodeInfo,
    request: &[u8],
    readings: &[(&str, String)],
) -> Result<()> {
    if request.trim_ascii() == b"resources" {
        let _ = publish_resources(messenger, info, readings).await?;
    } else {
        publish_values(messenger, info, readings).await?;
    }

    Ok(())
}
