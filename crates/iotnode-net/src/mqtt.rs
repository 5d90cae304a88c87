use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use rumqttc::v5::{
    AsyncClient, Event, EventLoop, MqttOptions, mqttbytes::QoS, mqttbytes::v5::Packet,
};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info, warn};

use iotnode::Messenger;

use crate::error::{Error, Result};

// Keep alive time sent to the broker.
const KEEP_ALIVE_TIME: Duration = Duration::from_secs(5);

// Number of requests buffered while the broker is unreachable.
const ASYNC_CHANNEL_CAPACITY: usize = 32;

// Pause between two connection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A publication received on one of the subscribed topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Topic name.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl Publication {
    /// Returns the payload as text, when it is valid `UTF-8`.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[inline]
fn parse_packet(packet: &Packet) -> Option<Publication> {
    let Packet::Publish(packet) = packet else {
        debug!("MQTT packet ignored: {packet:?}");
        return None;
    };

    Some(Publication {
        topic: String::from_utf8_lossy(&packet.topic).into_owned(),
        payload: packet.payload.to_vec(),
    })
}

// Subscriptions do not survive a clean reconnection, so they are renewed on
// every acknowledged connection.
fn subscribe(client: &AsyncClient, subscriptions: &[String]) {
    for topic in subscriptions {
        match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
            Ok(()) => debug!("Subscribing to `{topic}`"),
            Err(e) => warn!("Impossible to subscribe to `{topic}`: {e}"),
        }
    }
}

async fn run_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    subscriptions: Vec<String>,
    cancellation_token: CancellationToken,
    sender: mpsc::Sender<Publication>,
) {
    loop {
        tokio::select! {
            // Use the cancellation token to stop the loop
            () = cancellation_token.cancelled() => { break; }
            // Drive the connection and route the incoming publications
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connection established");
                        subscribe(&client, &subscriptions);
                    }
                    Ok(Event::Incoming(packet)) => {
                        let Some(publication) = parse_packet(&packet) else {
                            continue;
                        };
                        if let Err(e) = sender.try_send(publication) {
                            warn!("Dropping an incoming publication: {e}");
                        }
                    }
                    Ok(Event::Outgoing(outgoing)) => debug!("MQTT outgoing: {outgoing:?}"),
                    Err(e) => {
                        warn!("MQTT connection error, retrying: {e}");
                        tokio::select! {
                            () = cancellation_token.cancelled() => { break; }
                            () = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                }
            }
        }
    }
    drop(sender);
    drop(eventloop);
    drop(client);
}

/// An `MQTT` client publishing payloads to a broker.
///
/// Publications are queued and delivered by a background task, which
/// also reconnects to the broker whenever the connection drops and routes
/// the publications received on the subscribed topics.
///
/// Queueing never waits: when the queue is full, as happens while the
/// broker is unreachable, the publication fails immediately.
pub struct MqttPublisher {
    client: AsyncClient,
    cancellation_token: CancellationToken,
    task: JoinHandle<()>,
}

impl MqttPublisher {
    /// Creates a [`MqttPublisher`] identified by `client_id` and connected
    /// to the broker at `broker`.
    ///
    /// Each topic in `subscriptions` is subscribed to once connected, and
    /// the publications received on them are returned through the
    /// receiver.
    ///
    /// Must be called within a `tokio` runtime.
    #[must_use]
    pub fn connect(
        client_id: &str,
        broker: SocketAddr,
        subscriptions: Vec<String>,
    ) -> (Self, mpsc::Receiver<Publication>) {
        let mut mqttoptions =
            MqttOptions::new(client_id, broker.ip().to_string(), broker.port());
        let _ = mqttoptions.set_keep_alive(KEEP_ALIVE_TIME);

        let (client, eventloop) = AsyncClient::new(mqttoptions, ASYNC_CHANNEL_CAPACITY);
        let (sender, receiver) = mpsc::channel(ASYNC_CHANNEL_CAPACITY);

        let cancellation_token = CancellationToken::new();
        let task = tokio::spawn(run_event_loop(
            client.clone(),
            eventloop,
            subscriptions,
            cancellation_token.clone(),
            sender,
        ));

        info!("MQTT client `{client_id}` publishing to {broker}");

        (
            Self {
                client,
                cancellation_token,
                task,
            },
            receiver,
        )
    }

    /// Queues `payload` for publication on `topic` with at-least-once
    /// delivery.
    ///
    /// # Errors
    ///
    /// Fails when the publication cannot be queued.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.client
            .try_publish(topic.to_owned(), QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(Error::from)
    }

    /// Disconnects from the broker and stops the background task.
    pub async fn disconnect(self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnection not queued: {e}");
        }

        self.cancellation_token.cancel();
        if let Err(e) = self.task.await {
            error!("MQTT event loop terminated abnormally: {e}");
        }
    }
}

impl Messenger for MqttPublisher {
    type Error = Error;

    fn send(
        &self,
        destination: &str,
        payload: &[u8],
    ) -> impl Future<Output = std::result::Result<(), Self::Error>> + Send {
        std::future::ready(self.publish(destination, payload))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use rumqttc::v5::mqttbytes::{QoS, v5::Packet, v5::Publish};

    use iotnode::Messenger;

    use crate::error::ErrorKind;

    use super::{ASYNC_CHANNEL_CAPACITY, MqttPublisher, Publication, parse_packet};

    // Nothing listens on this port.
    fn unreachable_broker() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 1))
    }

    #[tokio::test]
    async fn publish_without_broker() {
        let (publisher, _inbox) =
            MqttPublisher::connect("node_id_0", unreachable_broker(), Vec::new());

        publisher
            .publish("node/node_id_0/illuminance", b"{\"value\":\"12lx\"}")
            .unwrap();
        publisher
            .send("node/check", b"{\"id\":\"node_id_0\"}")
            .await
            .unwrap();

        publisher.disconnect().await;
    }

    #[tokio::test]
    async fn full_queue_fails_without_waiting() {
        let (publisher, _inbox) =
            MqttPublisher::connect("node_id_0", unreachable_broker(), Vec::new());

        // The queue is never drained while the broker is unreachable.
        for _ in 0..ASYNC_CHANNEL_CAPACITY {
            publisher.publish("node/check", b"{}").unwrap();
        }

        for _ in 0..5 {
            let error = publisher.publish("node/check", b"{}").unwrap_err();
            assert_eq!(error.kind(), ErrorKind::Mqtt);

            let result = tokio::time::timeout(
                Duration::from_secs(1),
                publisher.send("node/check", b"{}"),
            )
            .await
            .expect("sending must not wait for the broker");
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Mqtt);
        }

        publisher.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_stops_event_loop() {
        let (publisher, mut inbox) = MqttPublisher::connect(
            "node_id_1",
            unreachable_broker(),
            vec!["gateway/node_id_1/discover".into()],
        );
        let cancellation_token = publisher.cancellation_token.clone();

        publisher.disconnect().await;

        assert!(cancellation_token.is_cancelled());
        assert!(inbox.recv().await.is_none());
    }

    #[test]
    fn incoming_publications() {
        let packet = Packet::Publish(Publish::new(
            "gateway/node_id_0/led/set",
            QoS::AtLeastOnce,
            "1",
            None,
        ));
        let publication = parse_packet(&packet).unwrap();

        assert_eq!(
            publication,
            Publication {
                topic: "gateway/node_id_0/led/set".into(),
                payload: b"1".to_vec(),
            }
        );
        assert_eq!(publication.text(), Some("1"));

        assert!(parse_packet(&Packet::PingResp(rumqttc::v5::mqttbytes::v5::PingResp)).is_none());
    }
}
